use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::protocol::NowPlaying;

/// Opaque identity of a peer for the lifetime of a discovery session.
///
/// Usually the device display name, with a suffix on simulation hosts.
/// Not guaranteed to survive a reinstall.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Session state as reported by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Connected,
    NotConnected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::NotConnected => write!(f, "not connected"),
        }
    }
}

/// Everything the registry knows about one discovered peer.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub id: PeerId,
    pub connection_state: ConnectionState,
    /// Last outbound message the transport accepted. Liveness is judged from this.
    pub last_successful_send_at: Instant,
    pub reconnection_attempts: u32,
    /// Kept while disconnected so consumers can show a "last seen" value
    pub last_known_state: Option<NowPlaying>,
    /// Wall clock of the last sign of life (discovery or received data), unix ms
    pub last_seen: u64,
}

impl PeerRecord {
    pub fn new(id: PeerId, connection_state: ConnectionState) -> Self {
        Self {
            id,
            connection_state,
            last_successful_send_at: Instant::now(),
            reconnection_attempts: 0,
            last_known_state: None,
            last_seen: unix_millis(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state == ConnectionState::Connected
    }

    pub fn touch(&mut self) {
        self.last_seen = unix_millis();
    }

    pub fn view(&self) -> PeerView {
        PeerView {
            connection_state: self.connection_state,
            is_connected: self.is_connected(),
            last_known_state: self.last_known_state.clone(),
            last_seen: self.last_seen,
            reconnection_attempts: self.reconnection_attempts,
        }
    }
}

/// Read-only projection of a [`PeerRecord`] handed to consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerView {
    pub connection_state: ConnectionState,
    pub is_connected: bool,
    pub last_known_state: Option<NowPlaying>,
    pub last_seen: u64,
    pub reconnection_attempts: u32,
}

pub(crate) fn unix_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
