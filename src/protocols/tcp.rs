//! TCP client and server drivers.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

use crate::core::device::{Command, Device};
use crate::core::error::{GatewayError, Result};
use crate::core::tasks::TaskSet;
use crate::core::util::unescape_bytes;
use crate::driver::buffering::{ingest, SocketBuffers};
use crate::driver::command::{CommandRuntime, ExecContext};
use crate::driver::options::{ConnectionUrl, FramingOptions};
use crate::driver::protocol::{CommandOutcome, DeviceProtocol, DriverBuild, ProtocolDriver};

/// Reply handle for packets arriving on a server connection; non-periodic
/// commands write their request info back to the originating socket.
pub struct TcpReply {
    pub writer: Arc<Mutex<OwnedWriteHalf>>,
}

/// Parsed request info of the TCP/UDP drivers: either a plain message or
/// `{"message": ..., "host": ..., "port": ...}`.
pub(crate) struct SendRequest {
    pub message: String,
    pub target: Option<(String, u16)>,
}

pub(crate) fn parse_send_request(request_info: &str) -> Result<SendRequest> {
    match serde_json::from_str::<serde_json::Value>(request_info) {
        Ok(serde_json::Value::Object(map)) if map.contains_key("message") => {
            let message = match &map["message"] {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            let host = map.get("host").and_then(|v| v.as_str());
            let port = map.get("port").and_then(|v| v.as_i64());
            match (host, port) {
                (Some(host), Some(port)) => Ok(SendRequest {
                    message,
                    target: Some((host.to_string(), port as u16)),
                }),
                (None, None) => Ok(SendRequest {
                    message,
                    target: None,
                }),
                _ => Err(GatewayError::Protocol(format!(
                    "creating send request failed, request-info: {request_info}"
                ))),
            }
        }
        Ok(serde_json::Value::String(s)) => Ok(SendRequest {
            message: s,
            target: None,
        }),
        Ok(other) => Ok(SendRequest {
            message: other.to_string(),
            target: None,
        }),
        Err(_) => Ok(SendRequest {
            message: request_info.to_string(),
            target: None,
        }),
    }
}

// ============================================================================
// TCP client
// ============================================================================

struct ClientConn {
    writer: Arc<Mutex<OwnedWriteHalf>>,
    reader: JoinHandle<()>,
}

/// `tcp-client://host:port` driver.
pub struct TcpClientDriver {
    host: String,
    port: u16,
    framing: FramingOptions,
    protocol_fn: Option<String>,
    buffering_fn: Option<String>,
    conn: StdMutex<Option<ClientConn>>,
}

impl TcpClientDriver {
    pub fn build(
        _device: &mut Device,
        url: &ConnectionUrl,
        runtime: &CommandRuntime,
    ) -> Result<DriverBuild> {
        let (host, port) = url.host_port()?;
        if host.is_empty() {
            return Err(GatewayError::config("tcp-client requires a host"));
        }
        Ok(DriverBuild {
            driver: Box::new(Self {
                host,
                port,
                framing: FramingOptions::tcp(url, runtime.buffering_fn().is_some()),
                protocol_fn: runtime.protocol_fn(),
                buffering_fn: runtime.buffering_fn(),
                conn: StdMutex::new(None),
            }),
            connection_lost_on_exception: true,
        })
    }

    fn close_current(&self) {
        if let Some(conn) = self.conn.lock().unwrap().take() {
            conn.reader.abort();
        }
    }
}

#[async_trait]
impl ProtocolDriver for TcpClientDriver {
    async fn request_connect(&self, proto: &Arc<DeviceProtocol>) -> Result<()> {
        info!(
            "[{}] host={}, port={}, socket-timeout={:?}",
            proto.device_id,
            self.host,
            self.port,
            proto.socket_timeout()
        );
        self.close_current();
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
        let (mut read_half, write_half) = stream.into_split();
        let writer = Arc::new(Mutex::new(write_half));

        let proto = proto.clone();
        let framing = self.framing.clone();
        let protocol_fn = self.protocol_fn.clone();
        let buffering_fn = self.buffering_fn.clone();
        let reply: ExecContext = Some(Arc::new(TcpReply {
            writer: writer.clone(),
        }));
        let reader = tokio::spawn(async move {
            use tokio::io::AsyncReadExt;
            let buffers = SocketBuffers::new();
            let mut buf = vec![0u8; 4096];
            loop {
                match read_half.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        ingest(
                            &proto,
                            &framing,
                            protocol_fn.as_deref(),
                            buffering_fn.as_deref(),
                            &buffers,
                            &buf[..n],
                            peer,
                            &reply,
                        )
                        .await;
                    }
                }
            }
            trace!("[{}] channel disconnected", proto.device_id);
            if !proto.device.connection_command {
                proto.set_connection_lost();
            }
        });
        *self.conn.lock().unwrap() = Some(ClientConn { writer, reader });
        Ok(())
    }

    async fn request_disconnect(&self, proto: &Arc<DeviceProtocol>) -> Result<()> {
        trace!("[{}] start disconnect", proto.device_id);
        let writer = {
            let mut conn = self.conn.lock().unwrap();
            match conn.take() {
                Some(c) => {
                    c.reader.abort();
                    Some(c.writer)
                }
                None => None,
            }
        };
        if let Some(writer) = writer {
            let _ = writer.lock().await.shutdown().await;
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
        let info = request_info.ok_or_else(|| {
            GatewayError::script(format!("cmdId={}, request-info is empty", command.id))
        })?;
        let request = parse_send_request(&info)?;
        if request.target.is_some() {
            return Err(GatewayError::Unsupported(
                "send with host/port is not defined for tcp-client".into(),
            ));
        }
        proto.clear_received();
        debug!("[{}] send data: {}", proto.device_id, request.message);
        let bytes = unescape_bytes(&request.message).unwrap_or_default();
        let writer = self
            .conn
            .lock()
            .unwrap()
            .as_ref()
            .map(|c| c.writer.clone())
            .ok_or(GatewayError::NotConnected)?;
        writer
            .lock()
            .await
            .write_all(&bytes)
            .await
            .map_err(|e| GatewayError::Connection(e.to_string()))?;

        if !command.command_type.is_read() {
            return Ok(CommandOutcome::NoResponse);
        }
        proto
            .poll_received(
                &command.id,
                std::time::Duration::from_millis(command.command_timeout),
            )
            .await
    }
}

// ============================================================================
// TCP server
// ============================================================================

/// `tcp-server://[host]:port` driver: accepts field devices that dial in.
pub struct TcpServerDriver {
    host: String,
    port: u16,
    framing: FramingOptions,
    protocol_fn: Option<String>,
    buffering_fn: Option<String>,
    connections: Arc<DashMap<SocketAddr, Arc<Mutex<OwnedWriteHalf>>>>,
    tasks: TaskSet,
}

impl TcpServerDriver {
    pub fn build(
        device: &mut Device,
        url: &ConnectionUrl,
        runtime: &CommandRuntime,
    ) -> Result<DriverBuild> {
        let (host, port) = url.host_port()?;
        device.connection_command = false;
        Ok(DriverBuild {
            driver: Box::new(Self {
                host: if host.is_empty() { "0.0.0.0".into() } else { host },
                port,
                framing: FramingOptions::tcp(url, runtime.buffering_fn().is_some()),
                protocol_fn: runtime.protocol_fn(),
                buffering_fn: runtime.buffering_fn(),
                connections: Arc::new(DashMap::new()),
                tasks: TaskSet::new(),
            }),
            connection_lost_on_exception: false,
        })
    }

    async fn send_to(&self, writer: &Mutex<OwnedWriteHalf>, bytes: &[u8]) -> Result<()> {
        writer
            .lock()
            .await
            .write_all(bytes)
            .await
            .map_err(|e| GatewayError::Connection(e.to_string()))
    }
}

#[async_trait]
impl ProtocolDriver for TcpServerDriver {
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
        let framing = self.framing.clone();
        let protocol_fn = self.protocol_fn.clone();
        let buffering_fn = self.buffering_fn.clone();
        let connections = self.connections.clone();
        let tasks = TaskSet::new();
        self.tasks.spawn(async move {
            loop {
                let Ok((stream, peer)) = listener.accept().await else {
                    break;
                };
                trace!("[{}] channel({}) connected", proto.device_id, peer);
                let (mut read_half, write_half) = stream.into_split();
                let writer = Arc::new(Mutex::new(write_half));
                connections.insert(peer, writer.clone());

                let proto = proto.clone();
                let framing = framing.clone();
                let protocol_fn = protocol_fn.clone();
                let buffering_fn = buffering_fn.clone();
                let connections = connections.clone();
                let reply: ExecContext = Some(Arc::new(TcpReply { writer }));
                tasks.spawn(async move {
                    use tokio::io::AsyncReadExt;
                    let buffers = SocketBuffers::new();
                    let mut buf = vec![0u8; 4096];
                    loop {
                        match read_half.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                ingest(
                                    &proto,
                                    &framing,
                                    protocol_fn.as_deref(),
                                    buffering_fn.as_deref(),
                                    &buffers,
                                    &buf[..n],
                                    peer,
                                    &reply,
                                )
                                .await;
                            }
                        }
                    }
                    trace!("[{}] channel({}) disconnected", proto.device_id, peer);
                    connections.remove(&peer);
                });
            }
        });
        Ok(())
    }

    async fn request_disconnect(&self, proto: &Arc<DeviceProtocol>) -> Result<()> {
        trace!("[{}] start disconnect", proto.device_id);
        self.tasks.clear();
        let writers: Vec<_> = self
            .connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        self.connections.clear();
        for writer in writers {
            let _ = writer.lock().await.shutdown().await;
        }
        Ok(())
    }

    async fn request_command(
        &self,
        proto: &Arc<DeviceProtocol>,
        command: &Command,
        request_info: Option<String>,
        ctx: &ExecContext,
    ) -> Result<CommandOutcome> {
        let info = request_info.ok_or_else(|| {
            GatewayError::script(format!("cmdId={}, request-info is empty", command.id))
        })?;
        let request = parse_send_request(&info)?;
        proto.clear_received();
        let bytes = unescape_bytes(&request.message).unwrap_or_default();

        match (&request.target, ctx) {
            (Some((host, port)), _) => {
                let target: SocketAddr = format!("{host}:{port}")
                    .parse()
                    .map_err(|_| GatewayError::Protocol(format!("invalid target {host}:{port}")))?;
                let Some(writer) = self.connections.get(&target).map(|e| e.value().clone()) else {
                    return Err(GatewayError::Protocol(format!(
                        "send failed, {target} is not connected"
                    )));
                };
                debug!("[{}] send to {}, data: {}", proto.device_id, target, request.message);
                self.send_to(&writer, &bytes).await?;
            }
            (None, Some(any)) => match any.clone().downcast::<TcpReply>() {
                Ok(reply) => {
                    debug!("[{}] send response data: {}", proto.device_id, request.message);
                    self.send_to(&reply.writer, &bytes).await?;
                }
                Err(_) => {
                    return Err(GatewayError::Unsupported(
                        "send without target is not defined for tcp-server".into(),
                    ))
                }
            },
            (None, None) => {
                // broadcast to every connected client
                let writers: Vec<_> = self
                    .connections
                    .iter()
                    .map(|entry| (*entry.key(), entry.value().clone()))
                    .collect();
                for (peer, writer) in writers {
                    debug!(
                        "[{}] send to {}, data: {}",
                        proto.device_id, peer, request.message
                    );
                    self.send_to(&writer, &bytes).await?;
                }
            }
        }

        if !command.command_type.is_read() {
            return Ok(CommandOutcome::NoResponse);
        }
        proto
            .poll_received(
                &command.id,
                std::time::Duration::from_millis(command.command_timeout),
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_send_request_plain() {
        let req = parse_send_request("\\x02PING\\x03").unwrap();
        assert_eq!(req.message, "\\x02PING\\x03");
        assert!(req.target.is_none());
    }

    #[test]
    fn test_parse_send_request_with_target() {
        let req =
            parse_send_request(r#"{"message":"ACK","host":"10.0.0.5","port":7000}"#).unwrap();
        assert_eq!(req.message, "ACK");
        assert_eq!(req.target, Some(("10.0.0.5".into(), 7000)));
    }

    #[test]
    fn test_parse_send_request_partial_target_fails() {
        assert!(parse_send_request(r#"{"message":"A","host":"10.0.0.5"}"#).is_err());
    }

    #[test]
    fn test_parse_send_request_json_string() {
        let req = parse_send_request("\"hello\"").unwrap();
        assert_eq!(req.message, "hello");
    }
}
