//! Error types for the nearcast mesh.

use thiserror::Error;

/// Failures reported by a [`crate::transport::Transport`].
///
/// None of these are fatal: a failed send feeds the liveness failure
/// procedure, a failed invite is simply retried on the next discovery.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// No live session to the peer
    #[error("Not connected to peer {0}")]
    NotConnected(String),

    /// Peer is known but cannot be reached right now
    #[error("Peer {0} is unreachable")]
    Unreachable(String),

    /// Operation produced no outcome in time
    #[error("Timed out after {0} ms")]
    Timeout(u64),

    /// Failed to establish a session
    #[error("Connection failed: {0}")]
    Connect(String),

    /// Failed on an open session
    #[error("Stream error: {0}")]
    Stream(String),

    /// Advertising or browsing could not be (re)started
    #[error("Discovery error: {0}")]
    Discovery(String),

    /// Socket level failure
    #[error("IO error: {0}")]
    Io(String),
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        TransportError::Io(e.to_string())
    }
}

/// Main error type for mesh operations
#[derive(Error, Debug)]
pub enum MeshError {
    /// Transport capability failed
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// A value cannot be represented on the wire
    #[error("Encode error: {0}")]
    Encode(String),

    /// Incoming bytes matched neither wire shape
    #[error("Decode error: {0}")]
    Decode(String),

    /// Configuration is missing or invalid
    #[error("Config error: {0}")]
    Config(String),

    /// Serialization failure
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The mesh owner task has stopped
    #[error("Mesh node is not running")]
    Closed,
}

/// Result type alias using MeshError
pub type MeshResult<T> = Result<T, MeshError>;
