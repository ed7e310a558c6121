//! Device and command definitions.
//!
//! A `Device` is registered to exactly one owning node in the cluster and is
//! driven there by a per-scheme protocol driver. Its `commands` are compiled
//! once at connect time and executed by the command runtime.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

/// Minimum effective period for periodic command groups, in milliseconds.
pub const MINIMUM_PERIOD_GROUP: i64 = 500;

/// Command classification.
///
/// `Read` commands block for a matching inbound packet, `Write` commands only
/// transmit, `Request` commands run their `cmdFunc` without touching the
/// transport. The `Starting`/`Stopping` variants run once on CONNECTED /
/// before disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandType {
    ReadRequest,
    StartingReadRequest,
    StoppingReadRequest,
    WriteRequest,
    StartingWriteRequest,
    StoppingWriteRequest,
    Request,
    StartingRequest,
    StoppingRequest,
}

impl CommandType {
    /// Read family: the transport is asked for a response.
    pub fn is_read(self) -> bool {
        matches!(
            self,
            Self::ReadRequest | Self::StartingReadRequest | Self::StoppingReadRequest
        )
    }

    /// Write family: transmit only.
    pub fn is_write(self) -> bool {
        matches!(
            self,
            Self::WriteRequest | Self::StartingWriteRequest | Self::StoppingWriteRequest
        )
    }

    /// Pure request family: `cmdFunc` runs without a transport round-trip.
    pub fn is_request(self) -> bool {
        matches!(
            self,
            Self::Request | Self::StartingRequest | Self::StoppingRequest
        )
    }

    pub fn is_starting(self) -> bool {
        matches!(
            self,
            Self::StartingReadRequest | Self::StartingWriteRequest | Self::StartingRequest
        )
    }

    pub fn is_stopping(self) -> bool {
        matches!(
            self,
            Self::StoppingReadRequest | Self::StoppingWriteRequest | Self::StoppingRequest
        )
    }
}

fn default_command_type() -> CommandType {
    CommandType::ReadRequest
}

fn default_period_group() -> i64 {
    -1
}

fn default_command_timeout() -> u64 {
    5000
}

/// A single command of a device.
///
/// Commands compare by id only; a device's command set is keyed that way.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Command {
    /// Key; must match `[A-Za-z0-9_]+`.
    pub id: String,
    /// Execution priority inside one invocation (ascending).
    pub order: i32,
    #[serde(rename = "type")]
    pub command_type: CommandType,
    /// Period in ms for periodic commands; negative means non-periodic.
    pub period_group: i64,
    /// Static request info handed to the driver (scripts may override).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_info: Option<String>,
    /// Delay after the command, in ms (scripts may override via `delay`).
    pub after_delay: u64,
    /// Response deadline for read commands, in ms.
    pub command_timeout: u64,
    /// Optional script defining `cmdFunc` / `requestInfo` / `delay` /
    /// `control` for this command.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cmd_script: Option<String>,
}

impl Default for Command {
    fn default() -> Self {
        Self {
            id: String::new(),
            order: 0,
            command_type: default_command_type(),
            period_group: default_period_group(),
            request_info: None,
            after_delay: 0,
            command_timeout: default_command_timeout(),
            cmd_script: None,
        }
    }
}

impl Command {
    /// Effective scheduling period: periodic commands are floored to
    /// [`MINIMUM_PERIOD_GROUP`], non-periodic commands return `None`.
    pub fn effective_period(&self) -> Option<i64> {
        if self.period_group < 0 {
            None
        } else {
            Some(self.period_group.max(MINIMUM_PERIOD_GROUP))
        }
    }
}

impl PartialEq for Command {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Command {}

impl std::hash::Hash for Command {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

fn default_max_retry_connect() -> i32 {
    5
}

fn default_retry_connect_delay() -> u64 {
    5000
}

fn default_socket_timeout() -> u64 {
    5000
}

fn default_initial_command_delay() -> u64 {
    5000
}

fn default_connection_url() -> String {
    "tcp-client://127.0.0.1:5000".to_string()
}

/// A field device definition.
///
/// Devices compare by id only.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Device {
    /// Key; must match `[A-Za-z0-9_]+`.
    pub id: String,
    /// Devices sharing a non-empty group are placed on the same node.
    pub group: String,
    /// Seconds without any response before CONNECTION_LOST; <=0 disables.
    pub response_timeout: i64,
    /// Retry budget after a failed connect; negative retries forever.
    pub max_retry_connect: i32,
    /// Delay between connect retries, in ms.
    pub retry_connect_delay: u64,
    /// Socket/bind deadline, in ms.
    pub socket_timeout: u64,
    /// Delay after CONNECTED before starting commands run, in ms.
    pub initial_command_delay: u64,
    /// `scheme://host:port?opt=val(&opt=val)*`
    pub connection_url: String,
    /// Optional per-device script (`protocolFunc` / `bufferingFunc`).
    pub protocol_script: String,
    /// Command set, keyed by command id.
    pub commands: HashSet<Command>,
    /// Connect per command invocation instead of holding a connection.
    pub connection_command: bool,
    /// Seed data placed under the device's `data` subtree for scripts.
    pub data: HashMap<String, serde_json::Value>,
}

impl Default for Device {
    fn default() -> Self {
        Self {
            id: String::new(),
            group: String::new(),
            response_timeout: 0,
            max_retry_connect: default_max_retry_connect(),
            retry_connect_delay: default_retry_connect_delay(),
            socket_timeout: default_socket_timeout(),
            initial_command_delay: default_initial_command_delay(),
            connection_url: default_connection_url(),
            protocol_script: String::new(),
            commands: HashSet::new(),
            connection_command: false,
            data: HashMap::new(),
        }
    }
}

impl Device {
    /// True when the id is a valid device key.
    pub fn has_valid_id(&self) -> bool {
        is_valid_id(&self.id)
    }

    /// URL scheme of the connection URL, if present.
    pub fn scheme(&self) -> Option<&str> {
        self.connection_url.split("://").next().filter(|s| !s.is_empty())
    }
}

impl PartialEq for Device {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Device {}

impl std::hash::Hash for Device {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// Identifier rule shared by device ids and command ids.
pub fn is_valid_id(id: &str) -> bool {
    !id.is_empty() && id.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

/// Comma-joined ids, for log lines.
pub fn join_ids<'a>(ids: impl IntoIterator<Item = &'a str>) -> String {
    ids.into_iter().collect::<Vec<_>>().join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_validation() {
        assert!(is_valid_id("plc_01"));
        assert!(is_valid_id("A9"));
        assert!(!is_valid_id(""));
        assert!(!is_valid_id("plc-01"));
        assert!(!is_valid_id("plc 01"));
    }

    #[test]
    fn test_effective_period() {
        let mut cmd = Command {
            id: "c1".into(),
            ..Default::default()
        };
        assert_eq!(cmd.effective_period(), None);

        cmd.period_group = 0;
        assert_eq!(cmd.effective_period(), Some(MINIMUM_PERIOD_GROUP));
        cmd.period_group = 499;
        assert_eq!(cmd.effective_period(), Some(MINIMUM_PERIOD_GROUP));
        cmd.period_group = 500;
        assert_eq!(cmd.effective_period(), Some(500));
        cmd.period_group = 2000;
        assert_eq!(cmd.effective_period(), Some(2000));
    }

    #[test]
    fn test_command_identity() {
        let a = Command {
            id: "c".into(),
            order: 1,
            ..Default::default()
        };
        let b = Command {
            id: "c".into(),
            order: 2,
            ..Default::default()
        };
        assert_eq!(a, b);
        let mut set = HashSet::new();
        set.insert(a);
        assert!(!set.insert(b));
    }

    #[test]
    fn test_device_defaults() {
        let d: Device = serde_json::from_str(r#"{"id":"d1"}"#).unwrap();
        assert_eq!(d.max_retry_connect, 5);
        assert_eq!(d.retry_connect_delay, 5000);
        assert_eq!(d.connection_url, "tcp-client://127.0.0.1:5000");
        assert_eq!(d.scheme(), Some("tcp-client"));
        assert!(!d.connection_command);
    }

    #[test]
    fn test_command_type_families() {
        assert!(CommandType::StartingReadRequest.is_read());
        assert!(CommandType::StartingReadRequest.is_starting());
        assert!(CommandType::StoppingWriteRequest.is_write());
        assert!(CommandType::StoppingWriteRequest.is_stopping());
        assert!(CommandType::Request.is_request());
        assert!(!CommandType::Request.is_read());
    }
}
