//! # fieldgate
//!
//! A clustered industrial-protocol gateway. Peer nodes elect a leader,
//! replicate a per-node shared-state tree, and place field devices on
//! exactly one owning node, where a scripted protocol engine drives them
//! and emits tagged readings and status changes to pluggable sinks.
//!
//! ## Layers
//!
//! - **cluster**: membership, heartbeats, leader election, shared-state
//!   replication and the to-leader/to-index/to-all redirect primitives
//! - **driver**: device placement and lifecycle, the per-device protocol
//!   state machine, command runtime, buffering/framing and output sinks
//! - **protocols**: per-scheme drivers for `tcp-client`, `tcp-server`,
//!   `udp-client`, `udp-server`, `http-client`, `http-server`,
//!   `modbus-client`, `modbus-server`, `secsgem-client`, `secsgem-server`
//!   and `dummy`
//! - **script**: embedded command scripting behind the `Evaluator` seam
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use fieldgate::cluster::ClusterConfig;
//! use fieldgate::driver::DriverBuilder;
//!
//! let config = ClusterConfig::new(1, 8080, vec!["http://127.0.0.1:8080".into()]);
//! let node = DriverBuilder::new("driver1", config).start().await?;
//! node.join().await;
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod cluster;
pub mod codec;
pub mod core;
pub mod driver;
pub mod protocols;
pub mod script;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::cluster::{ClusterBuilder, ClusterConfig, ClusterService};
    pub use crate::core::{
        Command, CommandType, Device, GatewayError, NodeStatus, Response, Result, Role, Status,
        StatusCode,
    };
    pub use crate::driver::{DriverBuilder, DriverNode, DriverOutput, DriverService};
    pub use crate::script::{Evaluator, ScriptValue};
}

pub use crate::core::error::{GatewayError, Result};
pub use crate::core::{Command, CommandType, Device, Response, Role, Status, StatusCode};
