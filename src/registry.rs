//! Peer Registry: the authoritative map from peer identity to its record.
//!
//! Owned exclusively by the mesh coordinator, so nothing here locks. Readers
//! never see the registry itself, only [`MeshSnapshot`]s built after a whole
//! event has been applied and published through a `watch` channel.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::lifecycle::AppPhase;
use crate::peer::{ConnectionState, PeerId, PeerRecord, PeerView};
use crate::protocol::NowPlaying;

#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: HashMap<PeerId, PeerRecord>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &PeerId) -> Option<&PeerRecord> {
        self.peers.get(id)
    }

    pub fn contains(&self, id: &PeerId) -> bool {
        self.peers.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerRecord> {
        self.peers.values()
    }

    /// Insert the peer or update its connection state.
    ///
    /// Returns the previous state, `None` if the peer was new. A `Connected`
    /// transition resets the reconnection counter and restarts the liveness
    /// baseline.
    pub fn upsert(&mut self, id: &PeerId, state: ConnectionState) -> Option<ConnectionState> {
        let previous = self.peers.get(id).map(|record| record.connection_state);
        if previous.is_none() {
            tracing::debug!(peer = %id, state = %state, "Registered peer");
        }
        let record = self
            .peers
            .entry(id.clone())
            .or_insert_with(|| PeerRecord::new(id.clone(), state));

        record.connection_state = state;
        record.touch();
        if state == ConnectionState::Connected {
            record.reconnection_attempts = 0;
            record.last_successful_send_at = Instant::now();
        }
        previous
    }

    /// Discovery saw the peer. New peers start NotConnected; known peers keep
    /// their state and counter. Returns true if the peer was new.
    pub fn discovered(&mut self, id: &PeerId) -> bool {
        match self.peers.get_mut(id) {
            Some(record) => {
                record.touch();
                false
            }
            None => {
                self.upsert(id, ConnectionState::NotConnected);
                true
            }
        }
    }

    pub fn record_successful_send(&mut self, id: &PeerId) -> bool {
        match self.peers.get_mut(id) {
            Some(record) => {
                record.last_successful_send_at = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Store a payload received from the peer, replacing the previous one.
    ///
    /// Receiving data is evidence the session works, so the liveness baseline
    /// moves forward as well.
    pub fn record_incoming_state(&mut self, id: &PeerId, payload: NowPlaying) -> bool {
        match self.peers.get_mut(id) {
            Some(record) => {
                record.last_known_state = Some(payload);
                record.last_successful_send_at = Instant::now();
                record.touch();
                true
            }
            None => false,
        }
    }

    /// Note a sign of life that carries no state (a heartbeat).
    pub fn touch(&mut self, id: &PeerId) -> bool {
        match self.peers.get_mut(id) {
            Some(record) => {
                record.touch();
                true
            }
            None => false,
        }
    }

    /// Count one more reconnection attempt, returning the new total
    pub fn increment_attempts(&mut self, id: &PeerId) -> Option<u32> {
        self.peers.get_mut(id).map(|record| {
            record.reconnection_attempts += 1;
            record.reconnection_attempts
        })
    }

    pub fn reset_attempts(&mut self, id: &PeerId) {
        if let Some(record) = self.peers.get_mut(id) {
            record.reconnection_attempts = 0;
        }
    }

    pub fn remove(&mut self, id: &PeerId) -> Option<PeerRecord> {
        self.peers.remove(id)
    }

    /// Connected peers, sorted for a stable fan-out order
    pub fn connected_peers(&self) -> Vec<PeerId> {
        let mut ids: Vec<PeerId> = self
            .peers
            .values()
            .filter(|record| record.is_connected())
            .map(|record| record.id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn views(&self) -> BTreeMap<PeerId, PeerView> {
        self.peers
            .iter()
            .map(|(id, record)| (id.clone(), record.view()))
            .collect()
    }
}

/// Read-only view of the mesh handed to the presentation layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MeshSnapshot {
    pub local_id: PeerId,
    pub running: bool,
    pub phase: AppPhase,
    pub background_allowance: bool,
    pub local_state: Option<NowPlaying>,
    pub peers: BTreeMap<PeerId, PeerView>,
    /// Peer whose reconnection sequence is in flight
    pub reconnecting: Option<PeerId>,
    /// Peers waiting for the in-flight sequence to finish
    pub deferred: Vec<PeerId>,
    /// Connected peers that missed the timeout and are in their grace period
    pub suspects: Vec<PeerId>,
    /// Wall clock of the last heartbeat received from any peer, unix ms
    pub last_heartbeat_at: Option<u64>,
}

impl MeshSnapshot {
    pub fn peer(&self, id: &PeerId) -> Option<&PeerView> {
        self.peers.get(id)
    }

    pub fn connected_count(&self) -> usize {
        self.peers.values().filter(|p| p.is_connected).count()
    }

    /// Payload last received from the peer, if it is still registered
    pub fn state_of(&self, id: &PeerId) -> Option<&NowPlaying> {
        self.peers.get(id).and_then(|p| p.last_known_state.as_ref())
    }
}

/// Publishes snapshots to any number of readers.
#[derive(Debug)]
pub struct SnapshotPublisher {
    tx: watch::Sender<Arc<MeshSnapshot>>,
}

impl SnapshotPublisher {
    pub fn new(initial: MeshSnapshot) -> Self {
        let (tx, _) = watch::channel(Arc::new(initial));
        Self { tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<MeshSnapshot>> {
        self.tx.subscribe()
    }

    /// Replace the current snapshot; readers are only woken if it changed.
    pub fn publish(&self, snapshot: MeshSnapshot) -> bool {
        self.tx.send_if_modified(|current| {
            if **current == snapshot {
                false
            } else {
                *current = Arc::new(snapshot);
                true
            }
        })
    }
}
