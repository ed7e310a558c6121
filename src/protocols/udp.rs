//! UDP client and server drivers.
//!
//! Datagrams feed the same buffering layer as TCP; the remote address key
//! keeps concurrent senders apart.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

use crate::core::device::{Command, Device};
use crate::core::error::{GatewayError, Result};
use crate::core::util::unescape_bytes;
use crate::driver::buffering::{ingest, SocketBuffers};
use crate::driver::command::{CommandRuntime, ExecContext};
use crate::driver::options::{ConnectionUrl, FramingOptions, UdpOptions};
use crate::driver::protocol::{CommandOutcome, DeviceProtocol, DriverBuild, ProtocolDriver};
use crate::protocols::tcp::parse_send_request;

struct UdpConn {
    socket: Arc<UdpSocket>,
    reader: JoinHandle<()>,
}

fn spawn_reader(
    proto: &Arc<DeviceProtocol>,
    socket: Arc<UdpSocket>,
    framing: FramingOptions,
    protocol_fn: Option<String>,
    buffering_fn: Option<String>,
) -> JoinHandle<()> {
    let proto = proto.clone();
    tokio::spawn(async move {
        let buffers = SocketBuffers::new();
        let mut buf = vec![0u8; 65536];
        loop {
            match socket.recv_from(&mut buf).await {
                Ok((n, sender)) => {
                    ingest(
                        &proto,
                        &framing,
                        protocol_fn.as_deref(),
                        buffering_fn.as_deref(),
                        &buffers,
                        &buf[..n],
                        sender,
                        &None,
                    )
                    .await;
                }
                Err(e) => {
                    trace!("[{}] udp receive stopped: {}", proto.device_id, e);
                    break;
                }
            }
        }
    })
}

// ============================================================================
// UDP client
// ============================================================================

/// `udp-client://host:port` driver.
pub struct UdpClientDriver {
    host: String,
    port: u16,
    framing: FramingOptions,
    protocol_fn: Option<String>,
    buffering_fn: Option<String>,
    conn: StdMutex<Option<UdpConn>>,
}

impl UdpClientDriver {
    pub fn build(
        _device: &mut Device,
        url: &ConnectionUrl,
        runtime: &CommandRuntime,
    ) -> Result<DriverBuild> {
        let (host, port) = url.host_port()?;
        if host.is_empty() {
            return Err(GatewayError::config("udp-client requires a host"));
        }
        Ok(DriverBuild {
            driver: Box::new(Self {
                host,
                port,
                framing: FramingOptions::udp(url),
                protocol_fn: runtime.protocol_fn(),
                buffering_fn: runtime.buffering_fn(),
                conn: StdMutex::new(None),
            }),
            connection_lost_on_exception: true,
        })
    }
}

#[async_trait]
impl ProtocolDriver for UdpClientDriver {
    async fn request_connect(&self, proto: &Arc<DeviceProtocol>) -> Result<()> {
        info!(
            "[{}] host={}, port={}, socket-timeout={:?}",
            proto.device_id,
            self.host,
            self.port,
            proto.socket_timeout()
        );
        if let Some(conn) = self.conn.lock().unwrap().take() {
            conn.reader.abort();
        }
        let socket = UdpSocket::bind(("0.0.0.0", 0))
            .await
            .map_err(|e| GatewayError::Connection(e.to_string()))?;
        socket
            .connect((self.host.as_str(), self.port))
            .await
            .map_err(|e| GatewayError::Connection(e.to_string()))?;
        let socket = Arc::new(socket);
        let reader = spawn_reader(
            proto,
            socket.clone(),
            self.framing.clone(),
            self.protocol_fn.clone(),
            self.buffering_fn.clone(),
        );
        *self.conn.lock().unwrap() = Some(UdpConn { socket, reader });
        Ok(())
    }

    async fn request_disconnect(&self, proto: &Arc<DeviceProtocol>) -> Result<()> {
        trace!("[{}] start disconnect", proto.device_id);
        if let Some(conn) = self.conn.lock().unwrap().take() {
            conn.reader.abort();
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
                "send with host/port is not defined for udp-client".into(),
            ));
        }
        proto.clear_received();
        debug!("[{}] send data: {}", proto.device_id, request.message);
        let bytes = unescape_bytes(&request.message).unwrap_or_default();
        let socket = self
            .conn
            .lock()
            .unwrap()
            .as_ref()
            .map(|c| c.socket.clone())
            .ok_or(GatewayError::NotConnected)?;
        socket
            .send(&bytes)
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
// UDP server
// ============================================================================

/// `udp-server://[host]:port` driver; optionally joins multicast groups.
pub struct UdpServerDriver {
    host: String,
    port: u16,
    framing: FramingOptions,
    options: UdpOptions,
    protocol_fn: Option<String>,
    buffering_fn: Option<String>,
    conn: StdMutex<Option<UdpConn>>,
}

impl UdpServerDriver {
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
                framing: FramingOptions::udp(url),
                options: UdpOptions::from_url(url)?,
                protocol_fn: runtime.protocol_fn(),
                buffering_fn: runtime.buffering_fn(),
                conn: StdMutex::new(None),
            }),
            connection_lost_on_exception: false,
        })
    }
}

#[async_trait]
impl ProtocolDriver for UdpServerDriver {
    async fn request_connect(&self, proto: &Arc<DeviceProtocol>) -> Result<()> {
        info!(
            "[{}] host={}, port={}, socket-timeout={:?}",
            proto.device_id,
            self.host,
            self.port,
            proto.socket_timeout()
        );
        if let Some(conn) = self.conn.lock().unwrap().take() {
            conn.reader.abort();
        }
        let socket = UdpSocket::bind((self.host.as_str(), self.port))
            .await
            .map_err(|e| GatewayError::Connection(e.to_string()))?;
        for group in &self.options.multicast_groups {
            socket
                .join_multicast_v4(*group, Ipv4Addr::UNSPECIFIED)
                .map_err(|e| {
                    GatewayError::Connection(format!("join multicast {group} failed: {e}"))
                })?;
        }
        let socket = Arc::new(socket);
        let reader = spawn_reader(
            proto,
            socket.clone(),
            self.framing.clone(),
            self.protocol_fn.clone(),
            self.buffering_fn.clone(),
        );
        *self.conn.lock().unwrap() = Some(UdpConn { socket, reader });
        Ok(())
    }

    async fn request_disconnect(&self, proto: &Arc<DeviceProtocol>) -> Result<()> {
        trace!("[{}] start disconnect", proto.device_id);
        if let Some(conn) = self.conn.lock().unwrap().take() {
            conn.reader.abort();
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
        let Some((host, port)) = request.target else {
            return Err(GatewayError::Unsupported(
                "send without host/port is not defined for udp-server".into(),
            ));
        };
        proto.clear_received();
        let target: SocketAddr = format!("{host}:{port}")
            .parse()
            .map_err(|_| GatewayError::Protocol(format!("invalid target {host}:{port}")))?;
        debug!(
            "[{}] send to {}, data: {}",
            proto.device_id, target, request.message
        );
        let bytes = unescape_bytes(&request.message).unwrap_or_default();
        let socket = self
            .conn
            .lock()
            .unwrap()
            .as_ref()
            .map(|c| c.socket.clone())
            .ok_or(GatewayError::NotConnected)?;
        socket
            .send_to(&bytes, target)
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
