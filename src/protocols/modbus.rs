//! Modbus TCP client and server drivers.
//!
//! Both sides use reference addressing in request info: `1..` coils,
//! `100001..` discrete inputs, `300001..` input registers, `400001..`
//! holding registers. The client drives a remote slave through
//! `tokio-modbus`; the server keeps register/coil banks per unit id that
//! scripts populate through write commands.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_modbus::client::Context as ModbusContext;
use tokio_modbus::prelude::*;
use tracing::{debug, error, info, trace};

use crate::codec::modbus as mbap;
use crate::core::data::now_millis;
use crate::core::device::{Command, Device};
use crate::core::error::{GatewayError, Result};
use crate::core::tasks::TaskSet;
use crate::driver::command::{CommandRuntime, ExecContext};
use crate::driver::options::{ConnectionUrl, ModbusOptions};
use crate::driver::protocol::{CommandOutcome, DeviceProtocol, DriverBuild, ProtocolDriver};
use crate::script::ScriptValue;

/// Register space resolved from a reference address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Space {
    Coil(u16),
    DiscreteInput(u16),
    InputRegister(u16),
    HoldingRegister(u16),
}

fn resolve_reference(address: i64) -> Result<Space> {
    match address {
        1..=65536 => Ok(Space::Coil((address - 1) as u16)),
        100_001..=165_536 => Ok(Space::DiscreteInput((address - 100_001) as u16)),
        300_001..=365_536 => Ok(Space::InputRegister((address - 300_001) as u16)),
        400_001..=465_536 => Ok(Space::HoldingRegister((address - 400_001) as u16)),
        other => Err(GatewayError::script(format!(
            "invalid modbus reference address: {other}"
        ))),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReadInfo {
    address: i64,
    #[serde(default = "default_length")]
    length: u16,
    unit_id: Option<u8>,
}

fn default_length() -> u16 {
    1
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WriteInfo {
    address: i64,
    values: Vec<serde_json::Value>,
    unit_id: Option<u8>,
}

fn parse_many<T: for<'a> Deserialize<'a>>(raw: &str) -> Result<Vec<T>> {
    let value: serde_json::Value =
        serde_json::from_str(raw).map_err(|e| GatewayError::script(format!("invalid modbus request-info: {e}")))?;
    let items = match value {
        serde_json::Value::Array(items) => items,
        single => vec![single],
    };
    items
        .into_iter()
        .map(|v| {
            serde_json::from_value(v)
                .map_err(|e| GatewayError::script(format!("invalid modbus request-info: {e}")))
        })
        .collect()
}

// ============================================================================
// Client
// ============================================================================

/// `modbus-client://host:port` driver.
pub struct ModbusClientDriver {
    addr: SocketAddr,
    options: ModbusOptions,
    conn: Mutex<Option<ModbusContext>>,
}

impl ModbusClientDriver {
    pub fn build(
        device: &mut Device,
        url: &ConnectionUrl,
        runtime: &CommandRuntime,
    ) -> Result<DriverBuild> {
        runtime.execute_protocol_script(device)?;
        let (host, port) = url.host_port()?;
        let addr: SocketAddr = format!("{host}:{port}")
            .parse()
            .map_err(|_| GatewayError::config(format!("invalid modbus address: {host}:{port}")))?;
        Ok(DriverBuild {
            driver: Box::new(Self {
                addr,
                options: ModbusOptions::from_url(url),
                conn: Mutex::new(None),
            }),
            connection_lost_on_exception: true,
        })
    }

    async fn read(&self, ctx: &mut ModbusContext, info: &ReadInfo) -> Result<Vec<i64>> {
        ctx.set_slave(Slave(info.unit_id.unwrap_or(self.options.unit_id)));
        let space = resolve_reference(info.address)?;
        let values = match space {
            Space::Coil(addr) => ctx
                .read_coils(addr, info.length)
                .await
                .map_err(|e| GatewayError::Connection(e.to_string()))?
                .map_err(|e| GatewayError::Protocol(format!("modbus exception: {e}")))?
                .into_iter()
                .map(i64::from)
                .collect(),
            Space::DiscreteInput(addr) => ctx
                .read_discrete_inputs(addr, info.length)
                .await
                .map_err(|e| GatewayError::Connection(e.to_string()))?
                .map_err(|e| GatewayError::Protocol(format!("modbus exception: {e}")))?
                .into_iter()
                .map(i64::from)
                .collect(),
            Space::InputRegister(addr) => ctx
                .read_input_registers(addr, info.length)
                .await
                .map_err(|e| GatewayError::Connection(e.to_string()))?
                .map_err(|e| GatewayError::Protocol(format!("modbus exception: {e}")))?
                .into_iter()
                .map(i64::from)
                .collect(),
            Space::HoldingRegister(addr) => ctx
                .read_holding_registers(addr, info.length)
                .await
                .map_err(|e| GatewayError::Connection(e.to_string()))?
                .map_err(|e| GatewayError::Protocol(format!("modbus exception: {e}")))?
                .into_iter()
                .map(i64::from)
                .collect(),
        };
        Ok(values)
    }

    async fn write(&self, ctx: &mut ModbusContext, info: &WriteInfo) -> Result<()> {
        ctx.set_slave(Slave(info.unit_id.unwrap_or(self.options.unit_id)));
        match resolve_reference(info.address)? {
            Space::Coil(addr) => {
                let bits: Vec<bool> = info
                    .values
                    .iter()
                    .map(|v| v.as_bool().unwrap_or(v.as_i64().unwrap_or(0) != 0))
                    .collect();
                ctx.write_multiple_coils(addr, &bits)
                    .await
                    .map_err(|e| GatewayError::Connection(e.to_string()))?
                    .map_err(|e| GatewayError::Protocol(format!("modbus exception: {e}")))?;
            }
            Space::HoldingRegister(addr) => {
                let regs: Vec<u16> = info
                    .values
                    .iter()
                    .map(|v| v.as_i64().unwrap_or(0) as u16)
                    .collect();
                ctx.write_multiple_registers(addr, &regs)
                    .await
                    .map_err(|e| GatewayError::Connection(e.to_string()))?
                    .map_err(|e| GatewayError::Protocol(format!("modbus exception: {e}")))?;
            }
            other => {
                return Err(GatewayError::script(format!(
                    "modbus write to read-only space: {other:?}"
                )))
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ProtocolDriver for ModbusClientDriver {
    async fn request_connect(&self, proto: &Arc<DeviceProtocol>) -> Result<()> {
        info!(
            "[{}] addr={}, socket-timeout={:?}",
            proto.device_id,
            self.addr,
            proto.socket_timeout()
        );
        let ctx = tokio::time::timeout(
            proto.socket_timeout(),
            tokio_modbus::client::tcp::connect_slave(self.addr, Slave(self.options.unit_id)),
        )
        .await
        .map_err(|_| GatewayError::Timeout("connect timeout".into()))?
        .map_err(|e| GatewayError::Connection(e.to_string()))?;
        *self.conn.lock().await = Some(ctx);
        Ok(())
    }

    async fn request_disconnect(&self, proto: &Arc<DeviceProtocol>) -> Result<()> {
        trace!("[{}] start disconnect", proto.device_id);
        if let Some(mut ctx) = self.conn.lock().await.take() {
            let _ = ctx.disconnect().await;
        }
        Ok(())
    }

    async fn request_command(
        &self,
        proto: &Arc<DeviceProtocol>,
        command: &Command,
        request_info: Option<String>,
        _ctx: &ExecContext,
    ) -> Result<CommandOutcome> {
        let raw = request_info.ok_or_else(|| {
            GatewayError::script(format!("cmdId={}, request-info is empty", command.id))
        })?;
        let mut guard = self.conn.lock().await;
        let ctx = guard.as_mut().ok_or(GatewayError::NotConnected)?;

        if command.command_type.is_read() {
            let reads: Vec<ReadInfo> = parse_many(&raw)?;
            let mut results = Vec::with_capacity(reads.len());
            for read in &reads {
                let values = tokio::time::timeout(
                    std::time::Duration::from_millis(command.command_timeout),
                    self.read(ctx, read),
                )
                .await
                .map_err(|_| {
                    GatewayError::Timeout(format!("cmdId={}, command timeout", command.id))
                })??;
                results.push(values);
            }
            let received = if self.options.combine_data {
                ScriptValue::List(
                    results
                        .into_iter()
                        .flatten()
                        .map(ScriptValue::Int)
                        .collect(),
                )
            } else {
                ScriptValue::List(
                    results
                        .into_iter()
                        .map(|r| ScriptValue::List(r.into_iter().map(ScriptValue::Int).collect()))
                        .collect(),
                )
            };
            debug!("[{}] cmdId={}, modbus read finished", proto.device_id, command.id);
            Ok(CommandOutcome::Received {
                values: vec![received],
                received_time: now_millis(),
            })
        } else {
            let writes: Vec<WriteInfo> = parse_many(&raw)?;
            for write in &writes {
                tokio::time::timeout(
                    std::time::Duration::from_millis(command.command_timeout),
                    self.write(ctx, write),
                )
                .await
                .map_err(|_| {
                    GatewayError::Timeout(format!("cmdId={}, command timeout", command.id))
                })??;
            }
            Ok(CommandOutcome::NoResponse)
        }
    }
}

// ============================================================================
// Server
// ============================================================================

/// Register/coil banks of the server, keyed by (unit, reference address).
#[derive(Default)]
struct Banks {
    registers: DashMap<(u8, i64), u16>,
    bits: DashMap<(u8, i64), bool>,
}

impl Banks {
    fn read_registers(&self, unit: u8, base: i64, address: u16, quantity: u16) -> Vec<u16> {
        (0..quantity)
            .map(|i| {
                self.registers
                    .get(&(unit, base + address as i64 + i as i64))
                    .map(|e| *e.value())
                    .unwrap_or(0)
            })
            .collect()
    }

    fn read_bits(&self, unit: u8, base: i64, address: u16, quantity: u16) -> Vec<bool> {
        (0..quantity)
            .map(|i| {
                self.bits
                    .get(&(unit, base + address as i64 + i as i64))
                    .map(|e| *e.value())
                    .unwrap_or(false)
            })
            .collect()
    }

    /// Store values at a reference address; integers land in the register
    /// bank, booleans in the bit bank.
    fn store(&self, unit: u8, reference: i64, values: &[serde_json::Value]) -> Result<()> {
        let space = resolve_reference(reference)?;
        for (i, value) in values.iter().enumerate() {
            let reference = reference + i as i64;
            match space {
                Space::Coil(_) | Space::DiscreteInput(_) => {
                    let bit = value.as_bool().unwrap_or(value.as_i64().unwrap_or(0) != 0);
                    self.bits.insert((unit, reference), bit);
                }
                Space::InputRegister(_) | Space::HoldingRegister(_) => {
                    let reg = value.as_i64().unwrap_or(0) as u16;
                    self.registers.insert((unit, reference), reg);
                }
            }
        }
        Ok(())
    }
}

/// `modbus-server://[host]:port` driver: serves masters from script-fed
/// banks and surfaces master writes to the non-periodic commands.
pub struct ModbusServerDriver {
    host: String,
    port: u16,
    options: ModbusOptions,
    banks: Arc<Banks>,
    server: StdMutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ModbusServerDriver {
    pub fn build(
        device: &mut Device,
        url: &ConnectionUrl,
        runtime: &CommandRuntime,
    ) -> Result<DriverBuild> {
        runtime.execute_protocol_script(device)?;
        device.connection_command = false;
        let (host, port) = url.host_port()?;
        Ok(DriverBuild {
            driver: Box::new(Self {
                host: if host.is_empty() { "0.0.0.0".into() } else { host },
                port,
                options: ModbusOptions::from_url(url),
                banks: Arc::new(Banks::default()),
                server: StdMutex::new(None),
            }),
            connection_lost_on_exception: false,
        })
    }
}

/// Serve one master connection.
async fn serve_connection(
    proto: Arc<DeviceProtocol>,
    banks: Arc<Banks>,
    mut stream: TcpStream,
    peer: SocketAddr,
) {
    let mut buf = Vec::new();
    let mut chunk = vec![0u8; 4096];
    loop {
        match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }
        loop {
            let (header, pdu, consumed) = match mbap::decode_request(&buf) {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    error!("[{}] modbus request from {} failed: {}", proto.device_id, peer, e);
                    return;
                }
            };
            buf.drain(..consumed);
            if proto.is_set_disconnected() {
                let resp =
                    mbap::encode_exception(&header, pdu.function_code(), mbap::SERVER_DEVICE_FAILURE);
                let _ = stream.write_all(&resp).await;
                continue;
            }
            let response = handle_pdu(&proto, &banks, &header, &pdu).await;
            if stream.write_all(&response).await.is_err() {
                return;
            }
        }
    }
    trace!("[{}] modbus master {} disconnected", proto.device_id, peer);
}

async fn handle_pdu(
    proto: &Arc<DeviceProtocol>,
    banks: &Banks,
    header: &mbap::MbapHeader,
    pdu: &mbap::Pdu,
) -> Vec<u8> {
    use mbap::Pdu;
    let unit = header.unit_id;
    let fc = pdu.function_code();

    // master reads run the non-periodic commands first so scripts can
    // refresh the banks on demand
    let notify_read = |reference: i64, quantity: u16| {
        let values = vec![
            ScriptValue::Int(reference),
            ScriptValue::Int(quantity as i64),
            ScriptValue::Int(unit as i64),
        ];
        async move {
            proto.push_received(None, values.clone(), now_millis());
            proto
                .runtime()
                .execute_non_periodic(proto, &values, now_millis(), &None)
                .await
        }
    };

    match pdu {
        Pdu::ReadCoils { address, quantity } => {
            let reference = 1 + *address as i64;
            if let Err(e) = notify_read(reference, *quantity).await {
                error!("[{}] onReadCoils failed: {}", proto.device_id, e);
                return mbap::encode_exception(header, fc, mbap::SERVER_DEVICE_FAILURE);
            }
            mbap::encode_bits_response(header, fc, &banks.read_bits(unit, 1, *address, *quantity))
        }
        Pdu::ReadDiscreteInputs { address, quantity } => {
            let reference = 100_001 + *address as i64;
            if let Err(e) = notify_read(reference, *quantity).await {
                error!("[{}] onReadDiscreteInputs failed: {}", proto.device_id, e);
                return mbap::encode_exception(header, fc, mbap::SERVER_DEVICE_FAILURE);
            }
            mbap::encode_bits_response(
                header,
                fc,
                &banks.read_bits(unit, 100_001, *address, *quantity),
            )
        }
        Pdu::ReadHoldingRegisters { address, quantity } => {
            let reference = 400_001 + *address as i64;
            if let Err(e) = notify_read(reference, *quantity).await {
                error!("[{}] onReadHoldingRegisters failed: {}", proto.device_id, e);
                return mbap::encode_exception(header, fc, mbap::SERVER_DEVICE_FAILURE);
            }
            mbap::encode_registers_response(
                header,
                fc,
                &banks.read_registers(unit, 400_001, *address, *quantity),
            )
        }
        Pdu::ReadInputRegisters { address, quantity } => {
            let reference = 300_001 + *address as i64;
            if let Err(e) = notify_read(reference, *quantity).await {
                error!("[{}] onReadInputRegisters failed: {}", proto.device_id, e);
                return mbap::encode_exception(header, fc, mbap::SERVER_DEVICE_FAILURE);
            }
            mbap::encode_registers_response(
                header,
                fc,
                &banks.read_registers(unit, 300_001, *address, *quantity),
            )
        }
        Pdu::WriteSingleCoil { address, value } => {
            let reference = 1 + *address as i64;
            banks.bits.insert((unit, reference), *value);
            notify_write(proto, reference, vec![ScriptValue::Bool(*value)], unit).await;
            mbap::encode_write_response(header, fc, *address, if *value { 0xFF00 } else { 0 })
        }
        Pdu::WriteSingleRegister { address, value } => {
            let reference = 400_001 + *address as i64;
            banks.registers.insert((unit, reference), *value);
            notify_write(proto, reference, vec![ScriptValue::Int(*value as i64)], unit).await;
            mbap::encode_write_response(header, fc, *address, *value)
        }
        Pdu::WriteMultipleCoils { address, values } => {
            let reference = 1 + *address as i64;
            for (i, bit) in values.iter().enumerate() {
                banks.bits.insert((unit, reference + i as i64), *bit);
            }
            notify_write(
                proto,
                reference,
                values.iter().map(|b| ScriptValue::Bool(*b)).collect(),
                unit,
            )
            .await;
            mbap::encode_write_response(header, fc, *address, values.len() as u16)
        }
        Pdu::WriteMultipleRegisters { address, values } => {
            let reference = 400_001 + *address as i64;
            for (i, reg) in values.iter().enumerate() {
                banks.registers.insert((unit, reference + i as i64), *reg);
            }
            notify_write(
                proto,
                reference,
                values.iter().map(|r| ScriptValue::Int(*r as i64)).collect(),
                unit,
            )
            .await;
            mbap::encode_write_response(header, fc, *address, values.len() as u16)
        }
    }
}

async fn notify_write(
    proto: &Arc<DeviceProtocol>,
    reference: i64,
    values: Vec<ScriptValue>,
    unit: u8,
) {
    let received = vec![
        ScriptValue::Int(reference),
        ScriptValue::List(values),
        ScriptValue::Int(unit as i64),
    ];
    proto.push_received(None, received.clone(), now_millis());
    if let Err(e) = proto
        .runtime()
        .execute_non_periodic(proto, &received, now_millis(), &None)
        .await
    {
        error!("[{}] modbus write dispatch failed: {}", proto.device_id, e);
    }
}

#[async_trait]
impl ProtocolDriver for ModbusServerDriver {
    async fn request_connect(&self, proto: &Arc<DeviceProtocol>) -> Result<()> {
        info!(
            "[{}] host={}, port={}, socket-timeout={:?}",
            proto.device_id,
            self.host,
            self.port,
            proto.socket_timeout()
        );
        let listener = TcpListener::bind((self.host.as_str(), self.port))
            .await
            .map_err(|e| GatewayError::Connection(e.to_string()))?;
        let proto = proto.clone();
        let banks = self.banks.clone();
        let tasks = TaskSet::new();
        let handle = tokio::spawn(async move {
            loop {
                let Ok((stream, peer)) = listener.accept().await else {
                    break;
                };
                trace!("[{}] modbus master {} connected", proto.device_id, peer);
                tasks.spawn(serve_connection(proto.clone(), banks.clone(), stream, peer));
            }
        });
        if let Some(old) = self.server.lock().unwrap().replace(handle) {
            old.abort();
        }
        Ok(())
    }

    async fn request_disconnect(&self, proto: &Arc<DeviceProtocol>) -> Result<()> {
        trace!("[{}] start disconnect", proto.device_id);
        if let Some(server) = self.server.lock().unwrap().take() {
            server.abort();
        }
        Ok(())
    }

    async fn request_command(
        &self,
        proto: &Arc<DeviceProtocol>,
        command: &Command,
        request_info: Option<String>,
        _ctx: &ExecContext,
    ) -> Result<CommandOutcome> {
        // server-side writes feed the banks
        if command.command_type.is_read() {
            return Err(GatewayError::script(
                "read-command is not supported for modbus-server",
            ));
        }
        let raw = request_info.ok_or_else(|| {
            GatewayError::script(format!("cmdId={}, request-info is empty", command.id))
        })?;
        let writes: Vec<WriteInfo> = parse_many(&raw)?;
        for write in &writes {
            self.banks.store(
                write.unit_id.unwrap_or(self.options.unit_id),
                write.address,
                &write.values,
            )?;
        }
        debug!("[{}] cmdId={}, modbus banks updated", proto.device_id, command.id);
        Ok(CommandOutcome::NoResponse)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_reference() {
        assert_eq!(resolve_reference(1).unwrap(), Space::Coil(0));
        assert_eq!(resolve_reference(100_001).unwrap(), Space::DiscreteInput(0));
        assert_eq!(resolve_reference(300_010).unwrap(), Space::InputRegister(9));
        assert_eq!(
            resolve_reference(400_101).unwrap(),
            Space::HoldingRegister(100)
        );
        assert!(resolve_reference(0).is_err());
        assert!(resolve_reference(200_000).is_err());
    }

    #[test]
    fn test_parse_many_single_and_list() {
        let single: Vec<ReadInfo> = parse_many(r#"{"address":400001,"length":2}"#).unwrap();
        assert_eq!(single.len(), 1);
        assert_eq!(single[0].length, 2);

        let list: Vec<ReadInfo> =
            parse_many(r#"[{"address":400001},{"address":300001,"unitId":7}]"#).unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[1].unit_id, Some(7));
        assert_eq!(list[0].length, 1);
    }

    #[test]
    fn test_banks_store_and_read() {
        let banks = Banks::default();
        banks
            .store(1, 400_001, &[serde_json::json!(17), serde_json::json!(34)])
            .unwrap();
        assert_eq!(banks.read_registers(1, 400_001, 0, 3), vec![17, 34, 0]);

        banks
            .store(1, 1, &[serde_json::json!(true), serde_json::json!(0)])
            .unwrap();
        assert_eq!(banks.read_bits(1, 1, 0, 2), vec![true, false]);
        // other units see their own bank
        assert_eq!(banks.read_registers(2, 400_001, 0, 1), vec![0]);
    }
}
