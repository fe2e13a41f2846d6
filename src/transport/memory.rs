//! SimNetwork: in-memory proximity network.
//!
//! A shared broker routes discovery, sessions and messages between
//! [`SimTransport`] instances inside one process. Tests drive it with the fault
//! injection methods (`set_in_range`, `drop_session`, `set_unresponsive`,
//! `inject`) to reproduce what a lossy radio network does to a mesh.
//!
//! Restarting advertising is modelled as an instant re-registration, so it
//! never produces `PeerLost` on the other side. Only leaving range does.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use super::{Transport, TransportEvent};
use crate::error::TransportError;
use crate::peer::{ConnectionState, PeerId};

const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Per-node traffic counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimStats {
    pub advertise_starts: u32,
    pub browse_starts: u32,
    pub sent: u32,
    pub failed_sends: u32,
    pub received: u32,
}

#[derive(Debug)]
struct SimNode {
    advertising: bool,
    browsing: bool,
    in_range: bool,
    /// Silently dead: sends and invites fail, no events are produced
    unresponsive: bool,
    events_tx: broadcast::Sender<TransportEvent>,
    stats: SimStats,
}

impl SimNode {
    fn emit(&self, event: TransportEvent) {
        // No subscriber is fine, the node may not be running yet
        let _ = self.events_tx.send(event);
    }
}

#[derive(Debug, Default)]
struct SimState {
    nodes: HashMap<PeerId, SimNode>,
    sessions: HashSet<(PeerId, PeerId)>,
}

fn session_key(a: &PeerId, b: &PeerId) -> (PeerId, PeerId) {
    if a <= b {
        (a.clone(), b.clone())
    } else {
        (b.clone(), a.clone())
    }
}

impl SimState {
    fn node(&self, id: &PeerId) -> Result<&SimNode, TransportError> {
        self.nodes
            .get(id)
            .ok_or_else(|| TransportError::Unreachable(id.to_string()))
    }

    fn emit_to(&self, to: &PeerId, event: TransportEvent) {
        if let Some(node) = self.nodes.get(to) {
            node.emit(event);
        }
    }

    fn peers_of(&self, id: &PeerId) -> Vec<PeerId> {
        self.sessions
            .iter()
            .filter_map(|(a, b)| {
                if a == id {
                    Some(b.clone())
                } else if b == id {
                    Some(a.clone())
                } else {
                    None
                }
            })
            .collect()
    }

    fn close_session(&mut self, a: &PeerId, b: &PeerId) -> bool {
        if !self.sessions.remove(&session_key(a, b)) {
            return false;
        }
        self.emit_to(a, TransportEvent::SessionStateChanged(b.clone(), ConnectionState::NotConnected));
        self.emit_to(b, TransportEvent::SessionStateChanged(a.clone(), ConnectionState::NotConnected));
        true
    }

    fn others_in_range(&self, id: &PeerId) -> Vec<PeerId> {
        self.nodes
            .iter()
            .filter(|(other, node)| *other != id && node.in_range)
            .map(|(other, _)| other.clone())
            .collect()
    }
}

/// Shared broker. Cheap to clone; all clones see the same network.
#[derive(Clone, Debug, Default)]
pub struct SimNetwork {
    state: Arc<Mutex<SimState>>,
}

impl SimNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node to the network, in range and idle. Rejoining replaces the node.
    pub fn join(&self, id: impl Into<PeerId>) -> SimTransport {
        let id = id.into();
        let (events_tx, _) = broadcast::channel(DEFAULT_EVENT_CAPACITY);
        let node = SimNode {
            advertising: false,
            browsing: false,
            in_range: true,
            unresponsive: false,
            events_tx: events_tx.clone(),
            stats: SimStats::default(),
        };
        self.state.lock().nodes.insert(id.clone(), node);
        SimTransport {
            id,
            network: self.clone(),
            events_tx,
        }
    }

    /// Move a node into or out of radio range.
    ///
    /// Leaving range drops its sessions and makes it disappear from every
    /// browser; coming back makes it discoverable again.
    pub fn set_in_range(&self, id: &PeerId, in_range: bool) {
        let mut state = self.state.lock();
        match state.nodes.get_mut(id) {
            Some(node) if node.in_range != in_range => node.in_range = in_range,
            _ => return,
        }

        if !in_range {
            for other in state.peers_of(id) {
                state.close_session(id, &other);
            }
        }

        let (advertising, browsing) = match state.nodes.get(id) {
            Some(node) => (node.advertising && !node.unresponsive, node.browsing),
            None => return,
        };
        for other in state.others_in_range(id) {
            let Some(other_node) = state.nodes.get(&other) else {
                continue;
            };
            let (to_other, to_self) = if in_range {
                (
                    TransportEvent::PeerDiscovered(id.clone()),
                    TransportEvent::PeerDiscovered(other.clone()),
                )
            } else {
                (
                    TransportEvent::PeerLost(id.clone()),
                    TransportEvent::PeerLost(other.clone()),
                )
            };
            if other_node.browsing && advertising {
                other_node.emit(to_other);
            }
            if browsing && other_node.advertising && !other_node.unresponsive {
                state.emit_to(id, to_self);
            }
        }
    }

    /// Break the session between two nodes without affecting discovery.
    pub fn drop_session(&self, a: &PeerId, b: &PeerId) -> bool {
        self.state.lock().close_session(a, b)
    }

    /// Discovery on `observer` loses sight of `peer` (a missed mDNS
    /// refresh) while any session between them stays up.
    pub fn lose_sight(&self, observer: &PeerId, peer: &PeerId) {
        self.state
            .lock()
            .emit_to(observer, TransportEvent::PeerLost(peer.clone()));
    }

    /// Make a node silently dead (or alive again).
    ///
    /// A dead node keeps its sessions open but every send and invite touching
    /// it fails, and it no longer shows up in discovery.
    pub fn set_unresponsive(&self, id: &PeerId, unresponsive: bool) {
        if let Some(node) = self.state.lock().nodes.get_mut(id) {
            node.unresponsive = unresponsive;
        }
    }

    /// Deliver raw bytes to `to` as if `from` had sent them.
    pub fn inject(&self, from: &PeerId, to: &PeerId, data: impl Into<Bytes>) {
        self.state
            .lock()
            .emit_to(to, TransportEvent::DataReceived(from.clone(), data.into()));
    }

    pub fn has_session(&self, a: &PeerId, b: &PeerId) -> bool {
        self.state.lock().sessions.contains(&session_key(a, b))
    }

    pub fn stats(&self, id: &PeerId) -> SimStats {
        self.state
            .lock()
            .nodes
            .get(id)
            .map(|n| n.stats)
            .unwrap_or_default()
    }

    fn set_advertising(&self, id: &PeerId, on: bool) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        let node = state
            .nodes
            .get_mut(id)
            .ok_or_else(|| TransportError::Discovery(format!("{} is not on the network", id)))?;
        node.advertising = on;
        if !on {
            return Ok(());
        }
        node.stats.advertise_starts += 1;
        if !node.in_range || node.unresponsive {
            return Ok(());
        }
        for other in state.others_in_range(id) {
            if let Some(other_node) = state.nodes.get(&other) {
                if other_node.browsing {
                    other_node.emit(TransportEvent::PeerDiscovered(id.clone()));
                }
            }
        }
        Ok(())
    }

    fn set_browsing(&self, id: &PeerId, on: bool) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        let node = state
            .nodes
            .get_mut(id)
            .ok_or_else(|| TransportError::Discovery(format!("{} is not on the network", id)))?;
        node.browsing = on;
        if !on {
            return Ok(());
        }
        node.stats.browse_starts += 1;
        if !node.in_range {
            return Ok(());
        }
        for other in state.others_in_range(id) {
            let visible = state
                .nodes
                .get(&other)
                .map(|n| n.advertising && !n.unresponsive)
                .unwrap_or(false);
            if visible {
                state.emit_to(id, TransportEvent::PeerDiscovered(other));
            }
        }
        Ok(())
    }

    fn invite(&self, from: &PeerId, to: &PeerId) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        let reachable = {
            let a = state.node(from)?;
            let b = state.node(to)?;
            a.in_range && b.in_range && !a.unresponsive && !b.unresponsive && b.advertising
        };
        if !reachable {
            return Err(TransportError::Unreachable(to.to_string()));
        }
        if !state.sessions.insert(session_key(from, to)) {
            return Ok(());
        }
        for (side, other) in [(from, to), (to, from)] {
            state.emit_to(side, TransportEvent::SessionStateChanged(other.clone(), ConnectionState::Connecting));
            state.emit_to(side, TransportEvent::SessionStateChanged(other.clone(), ConnectionState::Connected));
        }
        Ok(())
    }

    fn send(&self, from: &PeerId, to: &PeerId, data: Vec<u8>) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        let outcome = {
            let a = state.node(from)?;
            let b = state.node(to)?;
            if a.unresponsive || b.unresponsive {
                Err(TransportError::Unreachable(to.to_string()))
            } else if !a.in_range || !b.in_range || !state.sessions.contains(&session_key(from, to)) {
                Err(TransportError::NotConnected(to.to_string()))
            } else {
                Ok(())
            }
        };

        match outcome {
            Ok(()) => {
                state.emit_to(to, TransportEvent::DataReceived(from.clone(), Bytes::from(data)));
                if let Some(node) = state.nodes.get_mut(from) {
                    node.stats.sent += 1;
                }
                if let Some(node) = state.nodes.get_mut(to) {
                    node.stats.received += 1;
                }
                Ok(())
            }
            Err(e) => {
                if let Some(node) = state.nodes.get_mut(from) {
                    node.stats.failed_sends += 1;
                }
                Err(e)
            }
        }
    }
}

/// One node's handle onto a [`SimNetwork`].
#[derive(Clone, Debug)]
pub struct SimTransport {
    id: PeerId,
    network: SimNetwork,
    events_tx: broadcast::Sender<TransportEvent>,
}

impl Transport for SimTransport {
    fn local_id(&self) -> &PeerId {
        &self.id
    }

    fn start_advertising(&self) -> Result<(), TransportError> {
        self.network.set_advertising(&self.id, true)
    }

    fn stop_advertising(&self) -> Result<(), TransportError> {
        self.network.set_advertising(&self.id, false)
    }

    fn start_browsing(&self) -> Result<(), TransportError> {
        self.network.set_browsing(&self.id, true)
    }

    fn stop_browsing(&self) -> Result<(), TransportError> {
        self.network.set_browsing(&self.id, false)
    }

    async fn invite(&self, peer: &PeerId) -> Result<(), TransportError> {
        self.network.invite(&self.id, peer)
    }

    async fn send(&self, peer: &PeerId, data: Vec<u8>) -> Result<(), TransportError> {
        self.network.send(&self.id, peer, data)
    }

    fn disconnect(&self, peer: &PeerId) {
        self.network.drop_session(&self.id, peer);
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events_tx.subscribe()
    }
}
