//! Core data types shared by the cluster and driver planes.

use serde::{Deserialize, Serialize};

/// Cluster role of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    /// Coordinates shared-state propagation and device placement.
    Leader,
    /// Receives heartbeats and replicated state from the leader.
    Follower,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Leader => write!(f, "LEADER"),
            Self::Follower => write!(f, "FOLLOWER"),
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "LEADER" => Ok(Self::Leader),
            "FOLLOWER" => Ok(Self::Follower),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

/// Node status answered on `GET /node-status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatus {
    pub node_index: u32,
    pub role: Option<Role>,
    pub activated: bool,
}

/// Connection status of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatusCode {
    Disconnected,
    DisconnectionFail,
    Connecting,
    Connected,
    ConnectionFail,
    ConnectionLost,
}

impl std::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Disconnected => "DISCONNECTED",
            Self::DisconnectionFail => "DISCONNECTION_FAIL",
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
            Self::ConnectionFail => "CONNECTION_FAIL",
            Self::ConnectionLost => "CONNECTION_LOST",
        };
        write!(f, "{}", s)
    }
}

/// A single tagged reading emitted by a command script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub device_id: String,
    pub tag_id: String,
    pub value: String,
    /// Epoch milliseconds.
    pub received_time: i64,
}

impl Response {
    pub fn new(
        device_id: impl Into<String>,
        tag_id: impl Into<String>,
        value: impl Into<String>,
        received_time: i64,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            tag_id: tag_id.into(),
            value: value.into(),
            received_time,
        }
    }
}

/// A device status change emitted by the protocol engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    pub device_id: String,
    pub status: StatusCode,
    /// Epoch milliseconds.
    pub issued_time: i64,
}

impl Status {
    pub fn new(device_id: impl Into<String>, status: StatusCode, issued_time: i64) -> Self {
        Self {
            device_id: device_id.into(),
            status,
            issued_time,
        }
    }
}

/// Current epoch time in milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_round_trip() {
        assert_eq!("LEADER".parse::<Role>().unwrap(), Role::Leader);
        assert_eq!(Role::Follower.to_string(), "FOLLOWER");
        assert!("PRIMARY".parse::<Role>().is_err());
    }

    #[test]
    fn test_status_code_serde() {
        let json = serde_json::to_string(&StatusCode::ConnectionLost).unwrap();
        assert_eq!(json, "\"CONNECTION_LOST\"");
        let back: StatusCode = serde_json::from_str(&json).unwrap();
        assert_eq!(back, StatusCode::ConnectionLost);
    }

    #[test]
    fn test_response_field_names() {
        let r = Response::new("d1", "t1", "42", 1000);
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["deviceId"], "d1");
        assert_eq!(json["receivedTime"], 1000);
    }
}
