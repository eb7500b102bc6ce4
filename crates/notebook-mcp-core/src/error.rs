//! Error types for the Notebook MCP Server.

use thiserror::Error;

use crate::CellId;

/// Main error type for Notebook MCP operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Server rejected the token
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Server could not be reached
    #[error("Server unreachable: {0}")]
    Unreachable(String),

    /// Document, kernel or cell does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Cell was deleted upstream; do not retry against the same id
    #[error("Stale cell reference: {0}")]
    StaleReference(CellId),

    /// Operation attempted while the client is not connected
    #[error("Not connected")]
    NotConnected,

    /// Kernel connection lost or kernel died mid-execution
    #[error("Execution interrupted: {0}")]
    ExecutionInterrupted(String),

    /// Another bridge call is in flight
    #[error("Busy: another execution is in progress")]
    Busy,

    /// Deadline expired
    #[error("Timed out after {0}ms")]
    Timeout(u64),

    /// Peer speaks an incompatible protocol version
    #[error("Protocol version mismatch: {0}")]
    ProtocolMismatch(String),

    /// Malformed or unexpected wire message
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid input or parameters (generic)
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl Error {
    /// Whether this error means the underlying connection is no longer usable.
    ///
    /// Clients move to `Degraded` when an operation fails with one of these.
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            Error::Unreachable(_) | Error::NotConnected | Error::ExecutionInterrupted(_) | Error::Io(_)
        )
    }

    /// Whether this error indicates misconfiguration rather than a transient fault.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Error::Auth(_) | Error::NotFound(_) | Error::ProtocolMismatch(_) | Error::Config(_)
        )
    }
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
