//! SECS/GEM drivers over HSMS transport.
//!
//! The transport handles select/linktest/separate control flow; SECS-II
//! bodies stay opaque and are interpreted by device scripts. Data messages
//! reach the runtime as `[stream, function, body]`; request info
//! `{"stream":..,"function":..,"body":..,"reply":..}` sends one message.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace};

use crate::codec::hsms::{
    self, HsmsMessage, STYPE_DATA, STYPE_DESELECT_REQ, STYPE_DESELECT_RSP, STYPE_LINKTEST_REQ,
    STYPE_LINKTEST_RSP, STYPE_SELECT_REQ, STYPE_SELECT_RSP, STYPE_SEPARATE,
};
use crate::core::data::now_millis;
use crate::core::device::{Command, Device};
use crate::core::error::{GatewayError, Result};
use crate::core::util::unescape_bytes;
use crate::driver::buffering::packet_processing;
use crate::driver::command::{CommandRuntime, ExecContext};
use crate::driver::options::ConnectionUrl;
use crate::driver::protocol::{CommandOutcome, DeviceProtocol, DriverBuild, ProtocolDriver};
use crate::script::ScriptValue;

const DEFAULT_SESSION_ID: u16 = 0;

#[derive(Debug, Deserialize)]
struct SecsRequestInfo {
    stream: u8,
    function: u8,
    #[serde(default)]
    body: Option<serde_json::Value>,
    /// W-bit: expect the peer to reply.
    #[serde(default)]
    reply: bool,
}

fn body_bytes(body: &Option<serde_json::Value>) -> Result<Vec<u8>> {
    match body {
        None => Ok(Vec::new()),
        Some(serde_json::Value::String(s)) => Ok(unescape_bytes(s).unwrap_or_default()),
        Some(serde_json::Value::Array(items)) => items
            .iter()
            .map(|v| {
                v.as_i64()
                    .map(|i| i as u8)
                    .ok_or_else(|| GatewayError::script("secs body must be string or byte list"))
            })
            .collect(),
        Some(other) => Err(GatewayError::script(format!(
            "secs body must be string or byte list, got {other}"
        ))),
    }
}

struct SecsLink {
    writer: Arc<Mutex<OwnedWriteHalf>>,
    task: JoinHandle<()>,
}

/// Shared connection machinery of the client and server drivers.
struct SecsShared {
    protocol_fn: Option<String>,
    link: StdMutex<Option<SecsLink>>,
    system_bytes: AtomicU32,
}

impl SecsShared {
    fn new(protocol_fn: Option<String>) -> Self {
        Self {
            protocol_fn,
            link: StdMutex::new(None),
            system_bytes: AtomicU32::new(1),
        }
    }

    fn next_system_bytes(&self) -> u32 {
        self.system_bytes.fetch_add(1, Ordering::SeqCst)
    }

    fn writer(&self) -> Result<Arc<Mutex<OwnedWriteHalf>>> {
        self.link
            .lock()
            .unwrap()
            .as_ref()
            .map(|l| l.writer.clone())
            .ok_or(GatewayError::NotConnected)
    }

    fn close(&self) {
        if let Some(link) = self.link.lock().unwrap().take() {
            link.task.abort();
        }
    }

    async fn send(&self, msg: &HsmsMessage) -> Result<()> {
        let writer = self.writer()?;
        let result = writer
            .lock()
            .await
            .write_all(&hsms::encode(msg))
            .await
            .map_err(|e| GatewayError::Connection(e.to_string()));
        result
    }

    /// Read loop: answer control messages, hand data messages to the
    /// scripts.
    fn spawn_reader(
        self: &Arc<Self>,
        proto: &Arc<DeviceProtocol>,
        mut read_half: tokio::net::tcp::OwnedReadHalf,
        writer: Arc<Mutex<OwnedWriteHalf>>,
        peer: SocketAddr,
        answer_select: bool,
    ) -> JoinHandle<()> {
        let proto = proto.clone();
        let shared = self.clone();
        tokio::spawn(async move {
            let mut buf = Vec::new();
            let mut chunk = vec![0u8; 8192];
            loop {
                match read_half.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => buf.extend_from_slice(&chunk[..n]),
                }
                loop {
                    let (msg, consumed) = match hsms::decode(&buf) {
                        Ok(Some(frame)) => frame,
                        Ok(None) => break,
                        Err(e) => {
                            error!("[{}] hsms decode failed: {}", proto.device_id, e);
                            return;
                        }
                    };
                    buf.drain(..consumed);
                    let reply = |s_type: u8| {
                        HsmsMessage::control(msg.session_id, s_type, msg.system_bytes)
                    };
                    match msg.s_type {
                        STYPE_SELECT_REQ if answer_select => {
                            let _ = send_on(&writer, &reply(STYPE_SELECT_RSP)).await;
                        }
                        STYPE_LINKTEST_REQ => {
                            let _ = send_on(&writer, &reply(STYPE_LINKTEST_RSP)).await;
                        }
                        STYPE_DESELECT_REQ => {
                            let _ = send_on(&writer, &reply(STYPE_DESELECT_RSP)).await;
                        }
                        STYPE_SEPARATE => {
                            trace!("[{}] separate received from {}", proto.device_id, peer);
                            break;
                        }
                        STYPE_DATA => {
                            if proto.is_set_disconnected() {
                                trace!(
                                    "[{}] set disconnected -> data message ignored",
                                    proto.device_id
                                );
                                continue;
                            }
                            let values = vec![
                                ScriptValue::Int(msg.stream as i64),
                                ScriptValue::Int(msg.function as i64),
                                ScriptValue::Bytes(msg.body.clone()),
                            ];
                            if let Err(e) = packet_processing(
                                &proto,
                                shared.protocol_fn.as_deref(),
                                values,
                                now_millis(),
                                &None,
                            )
                            .await
                            {
                                error!(
                                    "[{}] secs message processing failed: {}",
                                    proto.device_id, e
                                );
                            }
                        }
                        _ => {}
                    }
                }
            }
            trace!("[{}] hsms link {} closed", proto.device_id, peer);
            if !proto.device.connection_command {
                proto.set_connection_lost();
            }
        })
    }
}

async fn send_on(writer: &Mutex<OwnedWriteHalf>, msg: &HsmsMessage) -> Result<()> {
    writer
        .lock()
        .await
        .write_all(&hsms::encode(msg))
        .await
        .map_err(|e| GatewayError::Connection(e.to_string()))
}

async fn send_command(
    shared: &SecsShared,
    proto: &Arc<DeviceProtocol>,
    command: &Command,
    request_info: Option<String>,
) -> Result<CommandOutcome> {
    let raw = request_info.ok_or_else(|| {
        GatewayError::script(format!("cmdId={}, request-info is empty", command.id))
    })?;
    let info: SecsRequestInfo = serde_json::from_str(&raw)
        .map_err(|e| GatewayError::script(format!("invalid secs request-info: {e}")))?;
    let body = body_bytes(&info.body)?;
    proto.clear_received();
    debug!(
        "[{}] send S{}F{}, {} body bytes",
        proto.device_id,
        info.stream,
        info.function,
        body.len()
    );
    let msg = HsmsMessage::data(
        DEFAULT_SESSION_ID,
        info.stream,
        info.function,
        info.reply,
        shared.next_system_bytes(),
        body,
    );
    shared.send(&msg).await?;

    if !command.command_type.is_read() {
        return Ok(CommandOutcome::NoResponse);
    }
    proto
        .poll_received(
            &command.id,
            Duration::from_millis(command.command_timeout),
        )
        .await
}

// ============================================================================
// Client
// ============================================================================

/// `secsgem-client://host:port` driver (active / host side).
pub struct SecsGemClientDriver {
    host: String,
    port: u16,
    shared: Arc<SecsShared>,
}

impl SecsGemClientDriver {
    pub fn build(
        device: &mut Device,
        url: &ConnectionUrl,
        runtime: &CommandRuntime,
    ) -> Result<DriverBuild> {
        runtime.compile_protocol_script(device)?;
        let (host, port) = url.host_port()?;
        if host.is_empty() {
            return Err(GatewayError::config("secsgem-client requires a host"));
        }
        Ok(DriverBuild {
            driver: Box::new(Self {
                host,
                port,
                shared: Arc::new(SecsShared::new(runtime.protocol_fn())),
            }),
            connection_lost_on_exception: true,
        })
    }
}

#[async_trait]
impl ProtocolDriver for SecsGemClientDriver {
    async fn request_connect(&self, proto: &Arc<DeviceProtocol>) -> Result<()> {
        info!(
            "[{}] host={}, port={}, socket-timeout={:?}",
            proto.device_id,
            self.host,
            self.port,
            proto.socket_timeout()
        );
        self.shared.close();
        let stream = tokio::time::timeout(
            proto.socket_timeout(),
            TcpStream::connect((self.host.as_str(), self.port)),
        )
        .await
        .map_err(|_| GatewayError::Timeout("connect timeout".into()))?
        .map_err(|e| GatewayError::Connection(e.to_string()))?;
        let peer = stream
            .peer_addr()
            .map_err(|e| GatewayError::Connection(e.to_string()))?;
        let (read_half, write_half) = stream.into_split();
        let writer = Arc::new(Mutex::new(write_half));

        // select the session before anything else flows
        let select = HsmsMessage::control(
            DEFAULT_SESSION_ID,
            STYPE_SELECT_REQ,
            self.shared.next_system_bytes(),
        );
        send_on(&writer, &select).await?;

        let task = self
            .shared
            .spawn_reader(proto, read_half, writer.clone(), peer, false);
        *self.shared.link.lock().unwrap() = Some(SecsLink { writer, task });
        Ok(())
    }

    async fn request_disconnect(&self, proto: &Arc<DeviceProtocol>) -> Result<()> {
        trace!("[{}] start disconnect", proto.device_id);
        if let Ok(writer) = self.shared.writer() {
            let separate = HsmsMessage::control(
                DEFAULT_SESSION_ID,
                STYPE_SEPARATE,
                self.shared.next_system_bytes(),
            );
            let _ = send_on(&writer, &separate).await;
        }
        self.shared.close();
        Ok(())
    }

    async fn request_command(
        &self,
        proto: &Arc<DeviceProtocol>,
        command: &Command,
        request_info: Option<String>,
        _ctx: &ExecContext,
    ) -> Result<CommandOutcome> {
        send_command(&self.shared, proto, command, request_info).await
    }
}

// ============================================================================
// Server
// ============================================================================

/// `secsgem-server://[host]:port` driver (passive / equipment side).
pub struct SecsGemServerDriver {
    host: String,
    port: u16,
    shared: Arc<SecsShared>,
    listener_task: StdMutex<Option<JoinHandle<()>>>,
}

impl SecsGemServerDriver {
    pub fn build(
        device: &mut Device,
        url: &ConnectionUrl,
        runtime: &CommandRuntime,
    ) -> Result<DriverBuild> {
        runtime.compile_protocol_script(device)?;
        device.connection_command = false;
        let (host, port) = url.host_port()?;
        Ok(DriverBuild {
            driver: Box::new(Self {
                host: if host.is_empty() { "0.0.0.0".into() } else { host },
                port,
                shared: Arc::new(SecsShared::new(runtime.protocol_fn())),
                listener_task: StdMutex::new(None),
            }),
            connection_lost_on_exception: false,
        })
    }
}

#[async_trait]
impl ProtocolDriver for SecsGemServerDriver {
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
        let shared = self.shared.clone();
        let handle = tokio::spawn(async move {
            loop {
                let Ok((stream, peer)) = listener.accept().await else {
                    break;
                };
                trace!("[{}] hsms host {} connected", proto.device_id, peer);
                let (read_half, write_half) = stream.into_split();
                let writer = Arc::new(Mutex::new(write_half));
                let task = shared.spawn_reader(&proto, read_half, writer.clone(), peer, true);
                shared.close();
                *shared.link.lock().unwrap() = Some(SecsLink { writer, task });
            }
        });
        if let Some(old) = self.listener_task.lock().unwrap().replace(handle) {
            old.abort();
        }
        Ok(())
    }

    async fn request_disconnect(&self, proto: &Arc<DeviceProtocol>) -> Result<()> {
        trace!("[{}] start disconnect", proto.device_id);
        if let Some(task) = self.listener_task.lock().unwrap().take() {
            task.abort();
        }
        self.shared.close();
        Ok(())
    }

    async fn request_command(
        &self,
        proto: &Arc<DeviceProtocol>,
        command: &Command,
        request_info: Option<String>,
        _ctx: &ExecContext,
    ) -> Result<CommandOutcome> {
        send_command(&self.shared, proto, command, request_info).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_info_parsing() {
        let info: SecsRequestInfo =
            serde_json::from_str(r#"{"stream":1,"function":13,"reply":true}"#).unwrap();
        assert_eq!(info.stream, 1);
        assert_eq!(info.function, 13);
        assert!(info.reply);
        assert!(body_bytes(&info.body).unwrap().is_empty());
    }

    #[test]
    fn test_body_bytes_variants() {
        let body = Some(serde_json::json!("\\x01AB"));
        assert_eq!(body_bytes(&body).unwrap(), vec![0x01, b'A', b'B']);

        let body = Some(serde_json::json!([1, 2, 255]));
        assert_eq!(body_bytes(&body).unwrap(), vec![1, 2, 255]);

        let body = Some(serde_json::json!({"nested": true}));
        assert!(body_bytes(&body).is_err());
    }
}
