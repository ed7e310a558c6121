//! Per-scheme protocol drivers and the connection-URL factory.

pub mod dummy;
pub mod http;
pub mod secsgem;
pub mod tcp;
pub mod udp;

#[cfg(feature = "modbus")]
#[cfg_attr(docsrs, doc(cfg(feature = "modbus")))]
pub mod modbus;

use crate::core::device::Device;
use crate::core::error::{GatewayError, Result};
use crate::driver::command::CommandRuntime;
use crate::driver::options::ConnectionUrl;
use crate::driver::protocol::DriverBuild;

/// Schemes understood by [`build_driver`].
pub const SUPPORTED_SCHEMES: &[&str] = &[
    "tcp-client",
    "tcp-server",
    "udp-client",
    "udp-server",
    "http-client",
    "http-server",
    "modbus-client",
    "modbus-server",
    "secsgem-client",
    "secsgem-server",
    "dummy",
];

/// Build the driver for a device's connection URL. Drivers may force
/// device flags (servers never use connection-command mode).
pub(crate) fn build_driver(
    device: &mut Device,
    url: &ConnectionUrl,
    runtime: &CommandRuntime,
) -> Result<DriverBuild> {
    match url.scheme.as_str() {
        "tcp-client" => tcp::TcpClientDriver::build(device, url, runtime),
        "tcp-server" => tcp::TcpServerDriver::build(device, url, runtime),
        "udp-client" => udp::UdpClientDriver::build(device, url, runtime),
        "udp-server" => udp::UdpServerDriver::build(device, url, runtime),
        "http-client" => http::HttpClientDriver::build(device, url, runtime),
        "http-server" => http::HttpServerDriver::build(device, url, runtime),
        "secsgem-client" => secsgem::SecsGemClientDriver::build(device, url, runtime),
        "secsgem-server" => secsgem::SecsGemServerDriver::build(device, url, runtime),
        "dummy" => dummy::DummyDriver::build(device, url, runtime),
        #[cfg(feature = "modbus")]
        "modbus-client" => modbus::ModbusClientDriver::build(device, url, runtime),
        #[cfg(feature = "modbus")]
        "modbus-server" => modbus::ModbusServerDriver::build(device, url, runtime),
        #[cfg(not(feature = "modbus"))]
        "modbus-client" | "modbus-server" => Err(GatewayError::Validation(format!(
            "[{}] modbus support is not enabled",
            device.id
        ))),
        _ => Err(GatewayError::Validation(format!(
            "[{}] not found protocol: {}",
            device.id, device.connection_url
        ))),
    }
}
