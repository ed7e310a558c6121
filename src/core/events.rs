//! Named event-handler registries for the cluster and driver planes.
//!
//! Handlers are registered under a name, fired on spawned tasks, and a
//! failing handler is logged with its name without affecting the others.

use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Map;
use tracing::error;

use crate::core::device::Device;
use crate::core::error::Result;

/// Async handler with no payload.
pub type ActionFn = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;
/// Async handler receiving a node index.
pub type NodeFn = Arc<dyn Fn(u32) -> BoxFuture<'static, Result<()>> + Send + Sync>;
/// Async handler receiving a node index and its removed shared subtree.
pub type NodeTreeFn =
    Arc<dyn Fn(u32, Map<String, serde_json::Value>) -> BoxFuture<'static, Result<()>> + Send + Sync>;
/// Async handler receiving a device.
pub type DeviceFn = Arc<dyn Fn(Device) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Cluster lifecycle events.
#[derive(Default, Clone)]
pub struct ClusterEvents {
    pub(crate) activated: Vec<(String, ActionFn)>,
    pub(crate) inactivated: Vec<(String, ActionFn)>,
    pub(crate) become_leader: Vec<(String, ActionFn)>,
    pub(crate) become_follower: Vec<(String, ActionFn)>,
    pub(crate) cluster_added: Vec<(String, NodeFn)>,
    pub(crate) cluster_deleted: Vec<(String, NodeTreeFn)>,
    pub(crate) overwritten: Vec<(String, NodeFn)>,
    pub(crate) split_brain_resolved: Vec<(String, ActionFn)>,
}

impl ClusterEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn activated(mut self, name: impl Into<String>, f: ActionFn) -> Self {
        self.activated.push((name.into(), f));
        self
    }

    pub fn inactivated(mut self, name: impl Into<String>, f: ActionFn) -> Self {
        self.inactivated.push((name.into(), f));
        self
    }

    pub fn become_leader(mut self, name: impl Into<String>, f: ActionFn) -> Self {
        self.become_leader.push((name.into(), f));
        self
    }

    pub fn become_follower(mut self, name: impl Into<String>, f: ActionFn) -> Self {
        self.become_follower.push((name.into(), f));
        self
    }

    pub fn cluster_added(mut self, name: impl Into<String>, f: NodeFn) -> Self {
        self.cluster_added.push((name.into(), f));
        self
    }

    pub fn cluster_deleted(mut self, name: impl Into<String>, f: NodeTreeFn) -> Self {
        self.cluster_deleted.push((name.into(), f));
        self
    }

    pub fn overwritten(mut self, name: impl Into<String>, f: NodeFn) -> Self {
        self.overwritten.push((name.into(), f));
        self
    }

    pub fn split_brain_resolved(mut self, name: impl Into<String>, f: ActionFn) -> Self {
        self.split_brain_resolved.push((name.into(), f));
        self
    }

    /// Append all handlers of `other`.
    pub fn merge(mut self, other: ClusterEvents) -> Self {
        self.activated.extend(other.activated);
        self.inactivated.extend(other.inactivated);
        self.become_leader.extend(other.become_leader);
        self.become_follower.extend(other.become_follower);
        self.cluster_added.extend(other.cluster_added);
        self.cluster_deleted.extend(other.cluster_deleted);
        self.overwritten.extend(other.overwritten);
        self.split_brain_resolved.extend(other.split_brain_resolved);
        self
    }
}

/// Driver lifecycle events.
#[derive(Default, Clone)]
pub struct DriverEvents {
    pub(crate) device_added: Vec<(String, DeviceFn)>,
    pub(crate) device_deleted: Vec<(String, DeviceFn)>,
}

impl DriverEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn device_added(mut self, name: impl Into<String>, f: DeviceFn) -> Self {
        self.device_added.push((name.into(), f));
        self
    }

    pub fn device_deleted(mut self, name: impl Into<String>, f: DeviceFn) -> Self {
        self.device_deleted.push((name.into(), f));
        self
    }

    pub fn merge(mut self, other: DriverEvents) -> Self {
        self.device_added.extend(other.device_added);
        self.device_deleted.extend(other.device_deleted);
        self
    }
}

/// Fire every handler in `events` on its own task.
pub(crate) fn fire_actions(events: &[(String, ActionFn)], event_name: &'static str) {
    for (name, f) in events {
        let name = name.clone();
        let fut = f();
        tokio::spawn(async move {
            if let Err(e) = fut.await {
                error!("{} event [{}] failed: {}", event_name, name, e);
            }
        });
    }
}

/// Fire every node-indexed handler in `events` on its own task.
pub(crate) fn fire_node_events(
    events: &[(String, NodeFn)],
    node_index: u32,
    event_name: &'static str,
) {
    for (name, f) in events {
        let name = name.clone();
        let fut = f(node_index);
        tokio::spawn(async move {
            if let Err(e) = fut.await {
                error!(
                    "{} (node-index: {}) event [{}] failed: {}",
                    event_name, node_index, name, e
                );
            }
        });
    }
}

/// Fire every node+tree handler in `events` on its own task.
pub(crate) fn fire_node_tree_events(
    events: &[(String, NodeTreeFn)],
    node_index: u32,
    tree: &Map<String, serde_json::Value>,
    event_name: &'static str,
) {
    for (name, f) in events {
        let name = name.clone();
        let fut = f(node_index, tree.clone());
        tokio::spawn(async move {
            if let Err(e) = fut.await {
                error!(
                    "{} (node-index: {}) event [{}] failed: {}",
                    event_name, node_index, name, e
                );
            }
        });
    }
}

/// Fire every device handler in `events` on its own task.
pub(crate) fn fire_device_events(
    events: &[(String, DeviceFn)],
    device: &Device,
    event_name: &'static str,
) {
    for (name, f) in events {
        let name = name.clone();
        let device_id = device.id.clone();
        let fut = f(device.clone());
        tokio::spawn(async move {
            if let Err(e) = fut.await {
                error!(
                    "{} event [{}] failed, device: {}: {}",
                    event_name, name, device_id, e
                );
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_fire_actions_runs_all_handlers() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut events = ClusterEvents::new();
        for i in 0..3 {
            let counter = counter.clone();
            let f: ActionFn = Arc::new(move || {
                let counter = counter.clone();
                Box::pin(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            });
            events = events.activated(format!("h{i}"), f);
        }
        fire_actions(&events.activated, "activated");
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_failing_handler_does_not_stop_others() {
        let counter = Arc::new(AtomicUsize::new(0));
        let fail: ActionFn = Arc::new(|| {
            Box::pin(async { Err(crate::core::error::GatewayError::Internal("boom".into())) })
        });
        let counter2 = counter.clone();
        let ok: ActionFn = Arc::new(move || {
            let counter = counter2.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        });
        let events = ClusterEvents::new()
            .inactivated("fails", fail)
            .inactivated("works", ok);
        fire_actions(&events.inactivated, "inactivated");
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
