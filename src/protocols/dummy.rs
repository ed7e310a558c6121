//! No-op driver for script-only devices.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::trace;

use crate::core::device::{Command, Device};
use crate::core::error::Result;
use crate::driver::command::{CommandRuntime, ExecContext};
use crate::driver::options::ConnectionUrl;
use crate::driver::protocol::{CommandOutcome, DeviceProtocol, DriverBuild, ProtocolDriver};

/// `dummy://` driver: every transport operation succeeds without touching
/// the wire, which makes REQUEST-type commands pure script executions.
pub struct DummyDriver;

impl DummyDriver {
    pub fn build(
        device: &mut Device,
        _url: &ConnectionUrl,
        runtime: &CommandRuntime,
    ) -> Result<DriverBuild> {
        runtime.execute_protocol_script(device)?;
        Ok(DriverBuild {
            driver: Box::new(Self),
            connection_lost_on_exception: true,
        })
    }
}

#[async_trait]
impl ProtocolDriver for DummyDriver {
    async fn request_connect(&self, proto: &Arc<DeviceProtocol>) -> Result<()> {
        trace!("[{}] dummy protocol request connect", proto.device_id);
        Ok(())
    }

    async fn request_disconnect(&self, proto: &Arc<DeviceProtocol>) -> Result<()> {
        trace!("[{}] dummy protocol request disconnect", proto.device_id);
        Ok(())
    }

    async fn request_command(
        &self,
        proto: &Arc<DeviceProtocol>,
        _command: &Command,
        _request_info: Option<String>,
        _ctx: &ExecContext,
    ) -> Result<CommandOutcome> {
        trace!("[{}] dummy protocol request command", proto.device_id);
        Ok(CommandOutcome::NoResponse)
    }
}
