use thiserror::Error;

use crate::transport::TransportError;

/// Errors returned by the connection manager's public operations.
///
/// Transport failures never surface here; they are absorbed into the
/// record's status and reported through events.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ManagerError {
    #[error("Connection limit exceeded ({current}/{max})")]
    CapacityExceeded { current: usize, max: usize },

    #[error("Connection {0} already exists")]
    DuplicateId(String),

    #[error("Invalid URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Connection {0} is not connected")]
    NotConnected(String),

    #[error("Connection {0} closed before the message could be written")]
    SendOnClosed(String),

    #[error("Connection manager has shut down")]
    ShutDown,
}

/// Why a connection attempt did not produce a live socket
#[derive(Error, Debug, Clone)]
pub enum ConnectError {
    #[error("Connect timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Connect failed: {0}")]
    Transport(#[from] TransportError),

    #[error("Gave up after {attempts} reconnect attempts")]
    MaxReconnectExceeded { attempts: u32 },
}

/// Inbound payloads that could not be routed
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Message has no type or kind field")]
    MissingKind,
}

/// Configuration values outside their allowed range
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid configuration: {field} {reason}")]
pub struct ConfigValidationError {
    pub field: &'static str,
    pub reason: &'static str,
}

/// Errors that stop the link from starting
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Validation error: {0}")]
    Validation(#[from] ConfigValidationError),

    #[error("Telemetry error: {0}")]
    Telemetry(#[from] crate::telemetry::TelemetryError),
}

pub type Result<T> = std::result::Result<T, AppError>;
