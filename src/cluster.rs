//! Cluster coordination plane.
//!
//! Peer nodes exchange heartbeats over HTTP+JSON, elect a leader
//! (lowest reachable node index wins), and replicate a per-node shared-state
//! tree through the leader. The driver plane subscribes to cluster events to
//! place and recover devices.

pub mod client;
pub mod config;
pub mod redirect;
pub mod routes;
pub mod service;
pub mod shared;

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use tokio::net::{TcpListener, TcpSocket};
use tokio::task::JoinHandle;
use tracing::{error, info};

pub use client::{ClusterClient, LoadBalancer};
pub use config::ClusterConfig;
pub use redirect::parallel_execute;
pub use routes::cluster_router;
pub use service::ClusterService;
pub use shared::{DeleteInfo, MergeInfo, SharedSnapshot, SharedWrite, Tree};

use crate::core::error::{GatewayError, Result};
use crate::core::events::ClusterEvents;

/// Builder for the per-process cluster service.
pub struct ClusterBuilder {
    config: ClusterConfig,
    events: ClusterEvents,
}

impl ClusterBuilder {
    pub fn new(config: ClusterConfig) -> Self {
        Self {
            config,
            events: ClusterEvents::new(),
        }
    }

    /// Register event handlers (may be called repeatedly; handlers add up).
    pub fn events(mut self, events: ClusterEvents) -> Self {
        self.events = self.events.merge(events);
        self
    }

    /// Resolve this node's own URL among the target URLs and construct the
    /// service. The probe binds a temporary server answering only
    /// `GET /index`, exactly long enough to recognize itself.
    pub async fn build(self) -> Result<Arc<ClusterService>> {
        let (node_url, peer_urls) = resolve_node_url(&self.config).await?;
        let client = ClusterClient::new(
            &self.config.base_path,
            Duration::from_millis(self.config.connect_timeout_ms),
            Duration::from_millis(self.config.read_timeout_ms),
        )?;
        Ok(Arc::new(ClusterService::new(
            self.config,
            node_url,
            peer_urls,
            client,
            self.events,
        )))
    }
}

/// Bind a listener with SO_REUSEADDR so the probe server's port can be
/// re-bound immediately by the real server.
pub(crate) fn reuse_listener(port: u16) -> Result<TcpListener> {
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    let socket = TcpSocket::new_v4()?;
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    Ok(socket.listen(1024)?)
}

async fn resolve_node_url(config: &ClusterConfig) -> Result<(String, HashSet<String>)> {
    let listener = reuse_listener(config.server_port)?;
    let node_index = config.node_index;
    let app = Router::new().route(
        "/index",
        get(move || async move { node_index.to_string() }),
    );
    let probe_server = tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    let probe = reqwest::Client::builder()
        .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
        .timeout(Duration::from_secs(5))
        .build()?;
    let mut own_urls = HashSet::new();
    for url in &config.node_target_urls {
        let target = format!("{}/index", url.trim_end_matches('/'));
        if let Ok(resp) = probe.get(&target).send().await {
            if let Ok(text) = resp.text().await {
                if text.trim() == node_index.to_string() {
                    own_urls.insert(url.clone());
                }
            }
        }
    }
    probe_server.abort();
    let _ = probe_server.await;

    let Some(node_url) = own_urls.iter().next().cloned() else {
        return Err(GatewayError::config(format!(
            "can't define node url within node-target-urls: {:?}",
            config.node_target_urls
        )));
    };
    let peer_urls = config
        .node_target_urls
        .iter()
        .filter(|url| !own_urls.contains(*url))
        .cloned()
        .collect();
    Ok((node_url, peer_urls))
}

/// Start the node's HTTP server with the cluster routes, merged with any
/// additional routes (the driver surface), and guard against a duplicated
/// node index among the peers.
pub async fn serve(
    service: Arc<ClusterService>,
    extra_routes: Option<Router>,
) -> Result<JoinHandle<()>> {
    let mut app = cluster_router(service.clone());
    if let Some(extra) = extra_routes {
        app = app.merge(extra);
    }
    let listener = reuse_listener(service.config.server_port)?;
    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("http server terminated: {}", e);
        }
    });

    for url in service.peer_url_list() {
        if let Ok(index) = service.client.get_node_index(&url).await {
            if index == service.node_index() {
                error!(
                    "this node ({}) and ({}), node-index({}) duplicated",
                    service.node_url(),
                    url,
                    index
                );
            }
        }
    }
    info!(
        "(node-index: {}, url: {}) started",
        service.node_index(),
        service.node_url()
    );
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::data::Role;
    use std::time::Duration;

    fn test_config(node_index: u32, port: u16, targets: Vec<String>) -> ClusterConfig {
        let mut config = ClusterConfig::new(node_index, port, targets);
        config.leader_lost_timeout_secs = 1;
        config.heartbeat_interval_ms = 200;
        config.connect_timeout_ms = 300;
        config.read_timeout_ms = 2000;
        config
    }

    async fn wait_for<F: Fn() -> bool>(cond: F, millis: u64) -> bool {
        let deadline = tokio::time::Instant::now() + Duration::from_millis(millis);
        while tokio::time::Instant::now() < deadline {
            if cond() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        cond()
    }

    #[tokio::test]
    async fn test_single_node_cold_start_becomes_leader() {
        let config = test_config(1, 18181, vec!["http://127.0.0.1:18181".into()]);
        let cluster = ClusterBuilder::new(config).build().await.unwrap();
        assert_eq!(cluster.node_url(), "http://127.0.0.1:18181");
        let server = serve(cluster.clone(), None).await.unwrap();
        cluster.start().await;

        assert!(cluster.prepared());
        assert_eq!(cluster.role(), Some(Role::Leader));
        assert!(cluster.activated());
        assert_eq!(cluster.cluster(), std::collections::HashSet::from([1]));

        cluster.dispose();
        server.abort();
    }

    #[tokio::test]
    async fn test_lone_follower_elects_itself() {
        // node 2 alone: takes FOLLOWER after prepare, then wins its own
        // election once the leader-lost window expires
        let config = test_config(
            2,
            18182,
            vec![
                "http://127.0.0.1:18182".into(),
                "http://127.0.0.1:18183".into(),
            ],
        );
        let cluster = ClusterBuilder::new(config).build().await.unwrap();
        let server = serve(cluster.clone(), None).await.unwrap();
        cluster.start().await;
        assert_eq!(cluster.role(), Some(Role::Follower));

        let probe = cluster.clone();
        assert!(wait_for(move || probe.is_leader(), 5000).await);

        cluster.dispose();
        server.abort();
    }

    #[tokio::test]
    async fn test_two_nodes_share_state_through_leader() {
        let targets = vec![
            "http://127.0.0.1:18281".to_string(),
            "http://127.0.0.1:18282".to_string(),
        ];
        let c1 = ClusterBuilder::new(test_config(1, 18281, targets.clone()))
            .build()
            .await
            .unwrap();
        let c2 = ClusterBuilder::new(test_config(2, 18282, targets))
            .build()
            .await
            .unwrap();
        let s1 = serve(c1.clone(), None).await.unwrap();
        let s2 = serve(c2.clone(), None).await.unwrap();
        tokio::join!(c1.start(), c2.start());

        assert_eq!(c1.role(), Some(Role::Leader));
        assert_eq!(c2.role(), Some(Role::Follower));

        let (a, b) = (c1.clone(), c2.clone());
        assert!(wait_for(move || a.cluster().len() == 2 && b.cluster().len() == 2, 5000).await);
        assert!(c1.activated());
        assert!(c2.activated());

        // follower-side write propagates through the leader to every peer
        let mut delta = Tree::new();
        delta.insert("devices".into(), serde_json::json!({"d1": {"id": "d1"}}));
        c2.merge_shared_object(delta).await;

        let (a, b) = (c1.clone(), c2.clone());
        assert!(
            wait_for(
                move || {
                    a.shared_seq_map().get(&2) == Some(&1)
                        && b.shared_seq_map().get(&2) == Some(&1)
                },
                5000
            )
            .await
        );
        assert_eq!(
            c1.get_item(2, &["devices".into(), "d1".into(), "id".into()]),
            Some(serde_json::json!("d1"))
        );

        // a delete prunes the path on every reachable peer
        c2.delete_shared_object(vec![vec!["devices".into()]]).await;
        let a = c1.clone();
        assert!(wait_for(move || a.get_item(2, &["devices".into()]).is_none(), 5000).await);

        c1.dispose();
        c2.dispose();
        s1.abort();
        s2.abort();
    }
}
