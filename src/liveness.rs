//! Liveness Monitor.
//!
//! Heartbeats go to every connected peer once per interval. Liveness is
//! judged only from the local node's successful sends: a connected peer whose
//! last successful send is older than the connection timeout becomes a
//! suspect, gets one probe, and is evicted if the grace period passes without
//! a successful send.
//!
//! The monitor only decides. The mesh coordinator performs the sends, runs
//! the grace timers and applies evictions.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::config::MeshConfig;
use crate::peer::{unix_millis, PeerId};
use crate::registry::PeerRegistry;

/// Result of a finished grace period
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraceOutcome {
    /// No successful send since the peer became suspect
    Evict,
    /// A send succeeded (or the session was re-established) in time
    Recovered,
    /// The peer left the registry some other way, or the timer is stale
    Gone,
}

#[derive(Debug)]
pub struct LivenessMonitor {
    connection_timeout: Duration,
    /// Suspect peers and the instant their failure check started
    suspects: HashMap<PeerId, Instant>,
    /// Wall clock of the last heartbeat from anyone, unix ms
    last_heartbeat_seen: Option<u64>,
}

impl LivenessMonitor {
    pub fn new(config: &MeshConfig) -> Self {
        Self {
            connection_timeout: config.connection_timeout(),
            suspects: HashMap::new(),
            last_heartbeat_seen: None,
        }
    }

    /// Peers that get a heartbeat this tick
    pub fn heartbeat_targets(&self, registry: &PeerRegistry) -> Vec<PeerId> {
        registry.connected_peers()
    }

    pub fn heartbeat_seen(&mut self, from: &PeerId) {
        tracing::trace!(peer = %from, "Heartbeat received");
        self.last_heartbeat_seen = Some(unix_millis());
    }

    pub fn last_heartbeat_seen(&self) -> Option<u64> {
        self.last_heartbeat_seen
    }

    /// Peers currently in their grace period, sorted
    pub fn suspects(&self) -> Vec<PeerId> {
        let mut suspects: Vec<PeerId> = self.suspects.keys().cloned().collect();
        suspects.sort();
        suspects
    }

    pub fn is_suspect(&self, peer: &PeerId) -> bool {
        self.suspects.contains_key(peer)
    }

    /// Start the failure procedure.
    ///
    /// Returns the connected peers that have gone without a successful send for
    /// longer than the connection timeout and are not already in their grace
    /// period. Each gets a probe and a grace timer tagged with `now`.
    pub fn begin_failure_check(&mut self, registry: &PeerRegistry, now: Instant) -> Vec<PeerId> {
        let mut stale: Vec<PeerId> = registry
            .iter()
            .filter(|record| record.is_connected())
            .filter(|record| now.saturating_duration_since(record.last_successful_send_at) > self.connection_timeout)
            .filter(|record| !self.suspects.contains_key(&record.id))
            .map(|record| record.id.clone())
            .collect();
        stale.sort();

        for peer in &stale {
            tracing::debug!(peer = %peer, "No successful send within timeout, probing");
            self.suspects.insert(peer.clone(), now);
        }
        stale
    }

    /// Decide a suspect's fate once its grace period is over.
    pub fn grace_elapsed(&mut self, registry: &PeerRegistry, peer: &PeerId, detected_at: Instant) -> GraceOutcome {
        match self.suspects.get(peer) {
            Some(started) if *started == detected_at => {
                self.suspects.remove(peer);
            }
            _ => return GraceOutcome::Gone,
        }

        let Some(record) = registry.get(peer) else {
            return GraceOutcome::Gone;
        };

        // Still at or below the threshold that made it a suspect
        if record.last_successful_send_at + self.connection_timeout <= detected_at {
            GraceOutcome::Evict
        } else {
            GraceOutcome::Recovered
        }
    }

    pub fn forget(&mut self, peer: &PeerId) {
        self.suspects.remove(peer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::ConnectionState;

    fn setup() -> (LivenessMonitor, PeerRegistry, PeerId) {
        let monitor = LivenessMonitor::new(&MeshConfig::default());
        let mut registry = PeerRegistry::new();
        let peer = PeerId::from("x");
        registry.upsert(&peer, ConnectionState::Connected);
        (monitor, registry, peer)
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_peer_is_not_suspect() {
        let (mut monitor, registry, _) = setup();
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(monitor.begin_failure_check(&registry, Instant::now()).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_peer_probed_once_then_evicted() {
        let (mut monitor, registry, peer) = setup();
        tokio::time::advance(Duration::from_millis(10_001)).await;

        let detected_at = Instant::now();
        assert_eq!(monitor.begin_failure_check(&registry, detected_at), vec![peer.clone()]);
        assert!(monitor.is_suspect(&peer));
        assert_eq!(monitor.suspects(), vec![peer.clone()]);
        // A second failure during grace does not probe again
        assert!(monitor.begin_failure_check(&registry, Instant::now()).is_empty());

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(monitor.grace_elapsed(&registry, &peer, detected_at), GraceOutcome::Evict);
        assert!(!monitor.is_suspect(&peer));
        assert!(monitor.suspects().is_empty());
    }

    #[test]
    fn test_heartbeat_seen_recorded() {
        let mut monitor = LivenessMonitor::new(&MeshConfig::default());
        assert_eq!(monitor.last_heartbeat_seen(), None);
        monitor.heartbeat_seen(&PeerId::from("x"));
        assert!(monitor.last_heartbeat_seen().unwrap() > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_probe_recovers() {
        let (mut monitor, mut registry, peer) = setup();
        tokio::time::advance(Duration::from_secs(11)).await;
        let detected_at = Instant::now();
        monitor.begin_failure_check(&registry, detected_at);

        tokio::time::advance(Duration::from_secs(1)).await;
        registry.record_successful_send(&peer);

        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(monitor.grace_elapsed(&registry, &peer, detected_at), GraceOutcome::Recovered);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnected_peers_left_to_reconnection() {
        let (mut monitor, mut registry, peer) = setup();
        registry.upsert(&peer, ConnectionState::NotConnected);
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(monitor.begin_failure_check(&registry, Instant::now()).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_grace_timer_ignored() {
        let (mut monitor, registry, peer) = setup();
        tokio::time::advance(Duration::from_secs(11)).await;
        let detected_at = Instant::now();
        monitor.begin_failure_check(&registry, detected_at);
        monitor.forget(&peer);

        assert_eq!(monitor.grace_elapsed(&registry, &peer, detected_at), GraceOutcome::Gone);
    }
}
