//! State store type definitions

use serde::{Deserialize, Serialize};

use crate::protocol::{Channel, MasterState, MeterSample, RoutingPoint};

/// Connection lifecycle of the transport session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// Connection state surfaced to the UI.
///
/// Transitions are driven only by the transport session; everyone else
/// reads snapshots through the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub status: ConnectionStatus,
    pub server_url: Option<String>,
    pub last_error: Option<String>,
    pub reconnect_attempts: u32,
}

impl Default for ConnectionInfo {
    fn default() -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            server_url: None,
            last_error: None,
            reconnect_attempts: 0,
        }
    }
}

/// Notification published to subscribers after each atomic store mutation.
///
/// Partial states are never published: the mutation completes under the
/// write lock before the update fans out.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreUpdate {
    /// The entire channel/routing/master set was replaced
    Snapshot,
    Channel(Channel),
    Master(MasterState),
    Routing(RoutingPoint),
    Meters(Vec<MeterSample>),
    Connection(ConnectionInfo),
    /// Non-fatal protocol error reported by the server
    ServerError(String),
}
