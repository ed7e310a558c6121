//! Error types for the gateway.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Unified error type for all gateway operations.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Configuration error (bad URL, bad option, bad device definition).
    #[error("Configuration error: {0}")]
    Config(String),

    /// Connection establishment failed.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Operation requires an active connection.
    #[error("Not connected")]
    NotConnected,

    /// Protocol-level failure (framing, codec, remote fault).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Command-script compile or runtime failure. Script errors are isolated
    /// to the offending command and never escalate the connection by
    /// themselves.
    #[error("Script error: {0}")]
    Script(String),

    /// A deadline elapsed.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Cluster plane failure (peer RPC, election, shared-state propagation).
    #[error("Cluster error: {0}")]
    Cluster(String),

    /// Rejected input, reported synchronously to the caller.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Operation is not supported by this driver.
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// HTTP transport failure.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encode/decode failure.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Internal invariant violation.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Shorthand for a config error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Shorthand for a script error.
    pub fn script(msg: impl Into<String>) -> Self {
        Self::Script(msg.into())
    }

    /// True when the error came out of a command script rather than the
    /// transport. The engine uses this to decide whether an escaped command
    /// failure should drive the device into CONNECTION_LOST.
    pub fn is_script(&self) -> bool {
        matches!(self, Self::Script(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_script_classification() {
        assert!(GatewayError::script("boom").is_script());
        assert!(!GatewayError::NotConnected.is_script());
        assert!(!GatewayError::Protocol("x".into()).is_script());
    }

    #[test]
    fn test_display() {
        let e = GatewayError::Config("bad port".into());
        assert_eq!(e.to_string(), "Configuration error: bad port");
    }
}
