use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of the shared push connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    /// The transport could not be opened at all. A reconnect is still pending.
    Error,
}

impl ConnectionState {
    /// Connecting or connected: a further `connect()` is a no-op.
    pub fn is_live(&self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Connected)
    }
}

/// Snapshot published to observers on every change.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    /// Most recent terminal error, kept for diagnostics.
    pub last_error: Option<String>,
    pub reconnect_attempts: u32,
    /// Delay of the pending reconnect timer, if one is armed.
    pub next_reconnect_in: Option<Duration>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
}
