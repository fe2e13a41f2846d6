//! Reconnection Controller.
//!
//! Per peer: `Idle -> Reconnecting -> {Connected, Exhausted}`. Only one
//! sequence runs at a time across all peers. Losses reported while another
//! peer is reconnecting are queued and started, in order, once the running
//! sequence ends.
//!
//! An attempt is: stop discovery, settle, restart discovery, then observe a
//! window for the peer to come back. The controller hands out [`Attempt`]s and
//! validates the timer callbacks by generation, so a callback from a sequence
//! that was already abandoned does nothing.

use std::collections::VecDeque;
use std::time::Duration;

use crate::config::MeshConfig;
use crate::peer::{ConnectionState, PeerId};
use crate::registry::PeerRegistry;

/// One reconnection attempt to run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempt {
    pub peer: PeerId,
    pub generation: u64,
    /// 1-based attempt number within the episode
    pub attempt: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Settling,
    Observing,
}

#[derive(Debug, Clone)]
struct InFlight {
    peer: PeerId,
    generation: u64,
    stage: Stage,
}

/// Outcome of an observation window
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WindowOutcome {
    /// Timer belongs to a sequence that already ended
    Stale,
    /// The peer is connected again
    Recovered(PeerId),
    /// Still gone, run another attempt
    Retry(Attempt),
    /// Maximum reached; the peer must be removed
    Exhausted(PeerId),
    /// The peer left the registry while the window was open
    Abandoned(PeerId),
}

/// A sequence that stopped early
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cancelled {
    pub peer: PeerId,
    /// Discovery was stopped for the settle delay and must be restarted
    pub discovery_stopped: bool,
}

#[derive(Debug)]
pub struct ReconnectionController {
    settle: Duration,
    window: Duration,
    max_attempts: u32,
    in_flight: Option<InFlight>,
    deferred: VecDeque<PeerId>,
    next_generation: u64,
}

impl ReconnectionController {
    pub fn new(config: &MeshConfig) -> Self {
        Self {
            settle: config.reconnect_settle(),
            window: config.reconnect_window(),
            max_attempts: config.max_reconnection_attempts,
            in_flight: None,
            deferred: VecDeque::new(),
            next_generation: 0,
        }
    }

    pub fn settle_delay(&self) -> Duration {
        self.settle
    }

    pub fn observation_window(&self) -> Duration {
        self.window
    }

    pub fn in_flight(&self) -> Option<&PeerId> {
        self.in_flight.as_ref().map(|f| &f.peer)
    }

    pub fn deferred(&self) -> impl Iterator<Item = &PeerId> {
        self.deferred.iter()
    }

    /// The transport reported the peer gone (session dropped or out of range).
    ///
    /// Starts a sequence when none is running. Otherwise the loss is queued,
    /// unless it is for the peer already being reconnected. A peer whose
    /// session is still up enters the sequence too; its window then ends
    /// [`WindowOutcome::Recovered`].
    pub fn on_loss(&mut self, registry: &mut PeerRegistry, peer: &PeerId) -> Option<Attempt> {
        if !registry.contains(peer) {
            return None;
        }

        let reconnecting = self.in_flight.as_ref().map(|f| f.peer.clone());
        match reconnecting {
            Some(current) if current == *peer => None,
            Some(current) => {
                if !self.deferred.contains(peer) {
                    tracing::debug!(peer = %peer, reconnecting = %current, "Reconnection deferred");
                    self.deferred.push_back(peer.clone());
                }
                None
            }
            None => self.begin(registry, peer),
        }
    }

    /// Settle delay is over. Returns true if the caller should restart
    /// discovery and open the observation window.
    pub fn on_settled(&mut self, peer: &PeerId, generation: u64) -> bool {
        match &mut self.in_flight {
            Some(current)
                if current.peer == *peer
                    && current.generation == generation
                    && current.stage == Stage::Settling =>
            {
                current.stage = Stage::Observing;
                true
            }
            _ => false,
        }
    }

    pub fn on_window_elapsed(
        &mut self,
        registry: &mut PeerRegistry,
        peer: &PeerId,
        generation: u64,
    ) -> WindowOutcome {
        let current = self.in_flight.as_ref().map_or(false, |f| {
            f.peer == *peer && f.generation == generation && f.stage == Stage::Observing
        });
        if !current {
            return WindowOutcome::Stale;
        }
        self.in_flight = None;

        let Some(record) = registry.get(peer) else {
            return WindowOutcome::Abandoned(peer.clone());
        };
        if record.connection_state == ConnectionState::Connected {
            registry.reset_attempts(peer);
            return WindowOutcome::Recovered(peer.clone());
        }
        if record.reconnection_attempts >= self.max_attempts {
            return WindowOutcome::Exhausted(peer.clone());
        }
        match self.begin(registry, peer) {
            Some(attempt) => WindowOutcome::Retry(attempt),
            None => WindowOutcome::Abandoned(peer.clone()),
        }
    }

    /// The peer reported Connected through the transport. Abandons its
    /// sequence if it is the one in flight.
    pub fn on_connected(&mut self, peer: &PeerId) -> Option<Cancelled> {
        self.deferred.retain(|p| p != peer);
        self.cancel(peer)
    }

    /// The peer left the registry (evicted or exhausted).
    pub fn forget(&mut self, peer: &PeerId) -> Option<Cancelled> {
        self.deferred.retain(|p| p != peer);
        self.cancel(peer)
    }

    /// Start the next queued sequence, if nothing is in flight. Queued peers
    /// that left the registry meanwhile are skipped; peers that reconnected
    /// were already dropped from the queue by [`Self::on_connected`].
    pub fn next_deferred(&mut self, registry: &mut PeerRegistry) -> Option<Attempt> {
        if self.in_flight.is_some() {
            return None;
        }
        while let Some(peer) = self.deferred.pop_front() {
            if registry.contains(&peer) {
                if let Some(attempt) = self.begin(registry, &peer) {
                    return Some(attempt);
                }
            }
        }
        None
    }

    fn begin(&mut self, registry: &mut PeerRegistry, peer: &PeerId) -> Option<Attempt> {
        let attempt = registry.increment_attempts(peer)?;
        self.next_generation += 1;
        self.in_flight = Some(InFlight {
            peer: peer.clone(),
            generation: self.next_generation,
            stage: Stage::Settling,
        });
        Some(Attempt {
            peer: peer.clone(),
            generation: self.next_generation,
            attempt,
        })
    }

    fn cancel(&mut self, peer: &PeerId) -> Option<Cancelled> {
        if self.in_flight.as_ref().map_or(true, |f| f.peer != *peer) {
            return None;
        }
        let current = self.in_flight.take()?;
        Some(Cancelled {
            peer: current.peer,
            discovery_stopped: current.stage == Stage::Settling,
        })
    }
}
