//! Error types for banrelay.

use thiserror::Error;

/// Error type for banrelay operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Record data is truncated or carries an unknown field tag
    #[error("malformed ban record: {0}")]
    MalformedRecord(String),

    /// Rule name could not be parsed back into (expiration, hash)
    #[error("invalid rule name encoding: {0}")]
    InvalidRuleName(String),

    /// Frame stream carries a bad magic or a truncated payload
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// Checkpoint file could not be read back
    #[error("corrupt checkpoint: {0}")]
    CorruptCheckpoint(String),

    /// Transport queue failure
    #[error("transport error: {0}")]
    Transport(#[from] crate::transport::TransportError),

    /// External packet-filter engine failure
    #[error("packet filter error: {0}")]
    Firewall(#[from] crate::firewall::FirewallError),

    /// Component is already running or was never started
    #[error("invalid lifecycle state: {0}")]
    Lifecycle(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parsing error
    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),
}

/// Result type alias for banrelay operations.
pub type Result<T> = std::result::Result<T, Error>;
