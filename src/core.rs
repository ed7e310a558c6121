//! Core abstractions shared by the cluster and driver planes.

pub mod data;
pub mod device;
pub mod error;
pub mod events;
pub mod tasks;
pub mod util;

pub use data::{now_millis, NodeStatus, Response, Role, Status, StatusCode};
pub use device::{Command, CommandType, Device, MINIMUM_PERIOD_GROUP};
pub use error::{GatewayError, Result};
pub use events::{ClusterEvents, DriverEvents};
pub use tasks::TaskSet;
