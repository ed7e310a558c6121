//! Driver plane: device ownership, protocol engine, command runtime,
//! framing, sinks and the driver REST surface.

pub mod buffering;
pub mod command;
pub mod options;
pub mod protocol;
pub mod routes;
pub mod service;
pub mod sink;

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::info;

pub use command::{CommandRuntime, ExecContext};
pub use options::{ConnectionUrl, FramingOptions, HttpOptions, ModbusOptions, UdpOptions};
pub use protocol::{CommandOutcome, DeviceProtocol, DriverBuild, ProtocolDriver};
pub use service::DriverService;
pub use sink::{DriverOutput, FileOutput, LogOutput, RestOutput};

#[cfg(feature = "kafka")]
pub use sink::KafkaOutput;

use crate::cluster::{ClusterBuilder, ClusterConfig, ClusterService};
use crate::core::error::Result;
use crate::core::events::{ClusterEvents, DriverEvents};

/// A running gateway node: the cluster service, the driver service and the
/// HTTP server tying them together.
pub struct DriverNode {
    pub cluster: Arc<ClusterService>,
    pub service: Arc<DriverService>,
    server: Option<JoinHandle<()>>,
}

impl DriverNode {
    /// Block until the node would normally run forever; used by the binary.
    pub async fn join(mut self) {
        if let Some(server) = self.server.take() {
            let _ = server.await;
        }
    }

    /// Drain devices and stop timers.
    pub async fn dispose(&self) {
        info!("try to dispose driver node");
        self.service.dispose().await;
        self.cluster.dispose();
        if let Some(server) = &self.server {
            server.abort();
        }
        info!("driver node disposed");
    }
}

/// Builder wiring a driver service onto a cluster node.
pub struct DriverBuilder {
    driver_id: String,
    cluster_config: ClusterConfig,
    base_path: String,
    load_balancing: bool,
    reconnect_when_split_brain_resolved: bool,
    default_script: String,
    output: Arc<dyn DriverOutput>,
    driver_events: DriverEvents,
    cluster_events: ClusterEvents,
    with_http_server: bool,
}

impl DriverBuilder {
    pub fn new(driver_id: impl Into<String>, cluster_config: ClusterConfig) -> Self {
        Self {
            driver_id: driver_id.into(),
            cluster_config,
            base_path: "/driver".into(),
            load_balancing: true,
            reconnect_when_split_brain_resolved: false,
            default_script: String::new(),
            output: Arc::new(LogOutput),
            driver_events: DriverEvents::new(),
            cluster_events: ClusterEvents::new(),
            with_http_server: true,
        }
    }

    pub fn base_path(mut self, base_path: impl Into<String>) -> Self {
        self.base_path = base_path.into();
        self
    }

    pub fn load_balancing(mut self, enabled: bool) -> Self {
        self.load_balancing = enabled;
        self
    }

    pub fn reconnect_when_split_brain_resolved(mut self, enabled: bool) -> Self {
        self.reconnect_when_split_brain_resolved = enabled;
        self
    }

    /// Driver-wide script compiled into every device's evaluator.
    pub fn default_script(mut self, script: impl Into<String>) -> Self {
        self.default_script = script.into();
        self
    }

    pub fn output(mut self, output: Arc<dyn DriverOutput>) -> Self {
        self.output = output;
        self
    }

    pub fn driver_events(mut self, events: DriverEvents) -> Self {
        self.driver_events = self.driver_events.merge(events);
        self
    }

    pub fn cluster_events(mut self, events: ClusterEvents) -> Self {
        self.cluster_events = self.cluster_events.merge(events);
        self
    }

    /// Skip the HTTP server (embedded/test usage).
    pub fn without_http_server(mut self) -> Self {
        self.with_http_server = false;
        self
    }

    /// Resolve the node URL, start the HTTP server and enter the cluster.
    /// Returns once the node is prepared.
    pub async fn start(self) -> Result<DriverNode> {
        let service = DriverService::new(
            self.driver_id,
            self.base_path,
            self.load_balancing,
            self.reconnect_when_split_brain_resolved,
            self.default_script,
            self.output,
            self.driver_events,
        );

        let cluster = ClusterBuilder::new(self.cluster_config)
            .events(service.cluster_events().merge(self.cluster_events))
            .build()
            .await?;
        service.attach_cluster(cluster.clone());

        let server = if self.with_http_server {
            Some(
                crate::cluster::serve(
                    cluster.clone(),
                    Some(routes::driver_router(service.clone())),
                )
                .await?,
            )
        } else {
            None
        };

        cluster.start().await;
        Ok(DriverNode {
            cluster,
            service,
            server,
        })
    }
}
