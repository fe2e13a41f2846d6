//! Transport capability consumed by the mesh.
//!
//! The mesh never builds a physical session itself. It drives advertising,
//! browsing, invitations and sends through [`Transport`] and reacts to the
//! [`TransportEvent`] stream. `lan` is the real implementation (mDNS + QUIC);
//! `memory` is an in-process network used by tests and local demos.

pub mod discovery;
pub mod lan;
pub mod memory;
pub mod quic;

use std::future::Future;

use bytes::Bytes;
use tokio::sync::broadcast;

use crate::error::TransportError;
use crate::peer::{ConnectionState, PeerId};

pub use lan::LanTransport;
pub use memory::{SimNetwork, SimStats, SimTransport};

/// Events delivered by the transport, in the order it observed them.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    PeerDiscovered(PeerId),
    /// Discovery lost sight of the peer (out of range or stopped advertising)
    PeerLost(PeerId),
    SessionStateChanged(PeerId, ConnectionState),
    DataReceived(PeerId, Bytes),
}

pub trait Transport: Send + Sync + 'static {
    /// Identity this transport advertises
    fn local_id(&self) -> &PeerId;

    fn start_advertising(&self) -> Result<(), TransportError>;

    fn stop_advertising(&self) -> Result<(), TransportError>;

    fn start_browsing(&self) -> Result<(), TransportError>;

    fn stop_browsing(&self) -> Result<(), TransportError>;

    /// Ask a discovered peer to open a session. Progress is reported through
    /// `SessionStateChanged` events.
    fn invite(&self, peer: &PeerId) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Reliable send on the peer's session. `Ok` means the transport accepted it.
    fn send(
        &self,
        peer: &PeerId,
        data: Vec<u8>,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Tear down the session to a peer, if any.
    fn disconnect(&self, peer: &PeerId);

    fn events(&self) -> broadcast::Receiver<TransportEvent>;
}
