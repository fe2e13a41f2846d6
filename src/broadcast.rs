//! State Broadcaster: fans the local payload out and files incoming ones.

use crate::error::{MeshError, MeshResult};
use crate::peer::PeerId;
use crate::protocol::{Heartbeat, NowPlaying, WireMessage};
use crate::registry::PeerRegistry;

/// What an incoming message turned out to be
#[derive(Debug)]
pub enum Received {
    Heartbeat(Heartbeat),
    /// A payload, now stored as the sender's last known state
    State,
    /// Sender is not registered; message dropped
    UnknownPeer,
    /// Neither wire shape; logged and dropped
    Malformed(MeshError),
}

/// Keeps the encoded local payload so fan-out and catch-up do not re-encode.
#[derive(Debug, Default)]
pub struct StateBroadcaster {
    encoded: Option<Vec<u8>>,
}

impl StateBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the local payload. Returns the bytes to fan out, if any.
    ///
    /// Clearing the payload sends nothing; peers keep the last value they saw.
    pub fn set_local(&mut self, payload: Option<&NowPlaying>) -> MeshResult<Option<Vec<u8>>> {
        self.encoded = match payload {
            Some(payload) => Some(WireMessage::NowPlaying(payload.clone()).encode()?),
            None => None,
        };
        Ok(self.encoded.clone())
    }

    /// Every connected peer gets the current payload
    pub fn fan_out(&self, registry: &PeerRegistry) -> Vec<(PeerId, Vec<u8>)> {
        let Some(encoded) = &self.encoded else {
            return Vec::new();
        };
        registry
            .connected_peers()
            .into_iter()
            .map(|peer| (peer, encoded.clone()))
            .collect()
    }

    /// Bytes for a peer that just connected
    pub fn catch_up(&self) -> Option<Vec<u8>> {
        self.encoded.clone()
    }

    /// Decode one message from `from` and apply it to the registry.
    ///
    /// The heartbeat discriminator is tested first; anything else must parse
    /// as a payload, which replaces the sender's previous one.
    pub fn receive(&self, registry: &mut PeerRegistry, from: &PeerId, data: &[u8]) -> Received {
        if !registry.contains(from) {
            return Received::UnknownPeer;
        }
        match WireMessage::decode(data) {
            Ok(WireMessage::Heartbeat(hb)) => {
                registry.touch(from);
                Received::Heartbeat(hb)
            }
            Ok(WireMessage::NowPlaying(payload)) => {
                registry.record_incoming_state(from, payload);
                Received::State
            }
            Err(e) => Received::Malformed(e),
        }
    }
}
