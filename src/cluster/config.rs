//! Cluster configuration.

use serde::{Deserialize, Serialize};

fn default_leader_lost_timeout() -> u64 {
    20
}

fn default_heartbeat_interval() -> u64 {
    2000
}

fn default_base_path() -> String {
    "/cluster".to_string()
}

fn default_connect_timeout() -> u64 {
    1000
}

fn default_read_timeout() -> u64 {
    60_000
}

/// Static configuration of one cluster node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ClusterConfig {
    /// Unique positive index of this node.
    pub node_index: u32,

    /// Every node URL of the cluster, including this node's own; the own
    /// URL is discovered at startup by probing `/index`.
    pub node_target_urls: Vec<String>,

    /// HTTP listen port.
    pub server_port: u16,

    /// Fixed quorum; 0 derives `max_cluster_size / 2 + 1`.
    #[serde(default)]
    pub quorum: u32,

    /// Seconds without a leader heartbeat before an election starts. Also
    /// bounds per-node liveness and (x1.5) the startup prepare window.
    #[serde(default = "default_leader_lost_timeout")]
    pub leader_lost_timeout_secs: u64,

    /// Heartbeat cadence in milliseconds.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,

    /// Base path of the peer RPC surface.
    #[serde(default = "default_base_path")]
    pub base_path: String,

    /// Peer connect deadline in milliseconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Peer read deadline in milliseconds.
    #[serde(default = "default_read_timeout")]
    pub read_timeout_ms: u64,
}

impl ClusterConfig {
    pub fn new(node_index: u32, server_port: u16, node_target_urls: Vec<String>) -> Self {
        Self {
            node_index,
            node_target_urls,
            server_port,
            quorum: 0,
            leader_lost_timeout_secs: default_leader_lost_timeout(),
            heartbeat_interval_ms: default_heartbeat_interval(),
            base_path: default_base_path(),
            connect_timeout_ms: default_connect_timeout(),
            read_timeout_ms: default_read_timeout(),
        }
    }

    /// Startup prepare window: long enough for an existing leader to
    /// assert itself over one and a half liveness periods.
    pub fn prepare_delay(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.leader_lost_timeout_secs * 1500)
    }

    pub fn heartbeat_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn leader_lost_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.leader_lost_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg: ClusterConfig = serde_json::from_str(
            r#"{"node-index": 1, "server-port": 8080, "node-target-urls": ["http://n1:8080"]}"#,
        )
        .unwrap();
        assert_eq!(cfg.quorum, 0);
        assert_eq!(cfg.leader_lost_timeout_secs, 20);
        assert_eq!(cfg.heartbeat_interval_ms, 2000);
        assert_eq!(cfg.base_path, "/cluster");
        assert_eq!(cfg.prepare_delay(), std::time::Duration::from_secs(30));
    }
}
