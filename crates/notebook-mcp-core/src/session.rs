//! Connection state and handles shared by the document and kernel clients.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for an established connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct HandleId(Uuid);

impl HandleId {
    /// Create a new random handle ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for HandleId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for HandleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of a client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No channel open
    Disconnected,
    /// Handshake in progress
    Connecting,
    /// Channel open and synchronized
    Connected,
    /// Channel failed; must reconnect before further mutation
    Degraded,
}

impl ConnectionState {
    /// Mutating operations are only attempted while connected.
    pub fn can_mutate(&self) -> bool {
        *self == ConnectionState::Connected
    }

    /// Whether the next use should try to (re)connect.
    pub fn needs_connect(&self) -> bool {
        matches!(
            self,
            ConnectionState::Disconnected | ConnectionState::Degraded
        )
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        ConnectionState::Disconnected
    }
}

/// Handle returned by a successful connect.
///
/// Re-entrant connects with the same target return an equal handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionHandle {
    /// Handle identifier
    pub id: HandleId,
    /// What the handle is connected to (document path or kernel id)
    pub target: String,
    /// When the channel was established
    pub connected_at: DateTime<Utc>,
}

impl ConnectionHandle {
    /// Create a handle for a freshly established connection.
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            id: HandleId::new(),
            target: target.into(),
            connected_at: Utc::now(),
        }
    }
}
