//! The mesh coordinator and its public handle.
//!
//! One task owns every piece of mutable mesh state. Transport events, handle
//! commands, heartbeat ticks and the completions of spawned sends and timers
//! all arrive on channels and are applied one at a time, so no two mutations
//! of a peer record ever interleave. Sends and waits run as separate tasks and
//! report back, which keeps the owner free while they are in flight.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::broadcast::{Received, StateBroadcaster};
use crate::config::MeshConfig;
use crate::error::{MeshError, MeshResult, TransportError};
use crate::lifecycle::{AllowanceId, AppPhase, BackgroundHost, LifecycleCoordinator, PhaseChange};
use crate::liveness::{GraceOutcome, LivenessMonitor};
use crate::peer::{ConnectionState, PeerId};
use crate::protocol::{Heartbeat, NowPlaying, WireMessage};
use crate::reconnect::{Attempt, ReconnectionController, WindowOutcome};
use crate::registry::{MeshSnapshot, PeerRegistry, SnapshotPublisher};
use crate::state::LocalNodeState;
use crate::transport::{Transport, TransportEvent};

enum Command {
    SetNowPlaying(Option<NowPlaying>),
    SetPhase(AppPhase),
    Shutdown(oneshot::Sender<()>),
}

#[derive(Debug, Clone, Copy)]
enum SendKind {
    Heartbeat,
    Payload,
    Probe,
}

/// Completions of work the coordinator spawned
enum Internal {
    SendFinished {
        peer: PeerId,
        kind: SendKind,
        result: Result<(), TransportError>,
    },
    InviteFinished {
        peer: PeerId,
        result: Result<(), TransportError>,
    },
    GraceElapsed {
        peer: PeerId,
        detected_at: Instant,
    },
    ReconnectSettled {
        peer: PeerId,
        generation: u64,
    },
    ReconnectWindowElapsed {
        peer: PeerId,
        generation: u64,
    },
}

/// Handle to a running mesh node.
///
/// Dropping the handle stops the node; [`MeshNode::shutdown`] does the same
/// and waits for it to finish.
pub struct MeshNode {
    local_id: PeerId,
    commands: mpsc::UnboundedSender<Command>,
    snapshots: watch::Receiver<Arc<MeshSnapshot>>,
    task: JoinHandle<()>,
}

impl MeshNode {
    /// Start the coordinator on the current tokio runtime. Advertising and
    /// browsing start immediately.
    pub fn spawn<T: Transport>(
        transport: T,
        config: MeshConfig,
        background: Arc<dyn BackgroundHost>,
    ) -> MeshResult<Self> {
        config.validate()?;

        let transport = Arc::new(transport);
        let local_id = transport.local_id().clone();
        let events = transport.events();

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (lifecycle, expiry_rx) = LifecycleCoordinator::new(background);

        let publisher = SnapshotPublisher::new(MeshSnapshot {
            local_id: local_id.clone(),
            ..Default::default()
        });
        let snapshots = publisher.subscribe();

        let coordinator = Coordinator {
            state: LocalNodeState::new(local_id.clone()),
            registry: PeerRegistry::new(),
            liveness: LivenessMonitor::new(&config),
            reconnect: ReconnectionController::new(&config),
            broadcaster: StateBroadcaster::new(),
            lifecycle,
            publisher,
            internal_tx,
            transport,
            config,
        };

        let task = tokio::spawn(coordinator.run(events, command_rx, internal_rx, expiry_rx));
        tracing::info!(peer = %local_id, "Mesh started");

        Ok(Self {
            local_id,
            commands: command_tx,
            snapshots,
            task,
        })
    }

    pub fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    /// Replace the local payload. A new value is sent to every connected
    /// peer; `None` clears it locally without telling anyone. Payloads that
    /// cannot be encoded are rejected here and change nothing.
    pub fn set_now_playing(&self, payload: Option<NowPlaying>) -> MeshResult<()> {
        if let Some(payload) = &payload {
            payload.validate()?;
        }
        self.command(Command::SetNowPlaying(payload))
    }

    pub fn set_app_phase(&self, phase: AppPhase) -> MeshResult<()> {
        self.command(Command::SetPhase(phase))
    }

    /// Latest published view of the mesh
    pub fn snapshot(&self) -> Arc<MeshSnapshot> {
        self.snapshots.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<MeshSnapshot>> {
        self.snapshots.clone()
    }

    /// Stop discovery, release any background allowance and wait for the
    /// coordinator to exit.
    pub async fn shutdown(self) -> MeshResult<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.command(Command::Shutdown(ack_tx))?;
        ack_rx.await.map_err(|_| MeshError::Closed)?;
        self.task.await.map_err(|_| MeshError::Closed)
    }

    fn command(&self, command: Command) -> MeshResult<()> {
        self.commands.send(command).map_err(|_| MeshError::Closed)
    }
}

struct Coordinator<T: Transport> {
    transport: Arc<T>,
    config: MeshConfig,
    state: LocalNodeState,
    registry: PeerRegistry,
    liveness: LivenessMonitor,
    reconnect: ReconnectionController,
    broadcaster: StateBroadcaster,
    lifecycle: LifecycleCoordinator,
    publisher: SnapshotPublisher,
    internal_tx: mpsc::UnboundedSender<Internal>,
}

impl<T: Transport> Coordinator<T> {
    async fn run(
        mut self,
        mut events: broadcast::Receiver<TransportEvent>,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
        mut expiries: mpsc::UnboundedReceiver<AllowanceId>,
    ) {
        self.state.set_running(true);
        self.start_discovery();
        self.publish();

        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval());
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let shutdown_ack = loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(event) => self.handle_transport_event(event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Transport events lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        tracing::warn!("Transport event stream closed");
                        break None;
                    }
                },
                command = commands.recv() => match command {
                    Some(Command::Shutdown(ack)) => break Some(ack),
                    Some(command) => self.handle_command(command),
                    None => break None,
                },
                Some(message) = internal.recv() => self.handle_internal(message),
                Some(id) = expiries.recv() => {
                    self.lifecycle.allowance_expired(id);
                }
                _ = heartbeat.tick() => self.on_heartbeat_tick(),
            }
            self.publish();
        };

        self.stop_discovery();
        self.lifecycle.release();
        self.state.set_running(false);
        self.publish();
        tracing::info!(peer = %self.state.local_id, "Mesh stopped");

        if let Some(ack) = shutdown_ack {
            let _ = ack.send(());
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::SetNowPlaying(payload) => {
                if !self.state.set_now_playing(payload) {
                    return;
                }
                match self.broadcaster.set_local(self.state.now_playing()) {
                    Ok(Some(_)) => self.broadcast_local(),
                    Ok(None) => tracing::debug!("Local payload cleared"),
                    Err(e) => tracing::warn!(error = %e, "Failed to encode local payload"),
                }
            }
            Command::SetPhase(phase) => match self.lifecycle.transition(phase) {
                PhaseChange::Unchanged => {}
                PhaseChange::EnteredBackground => self.broadcast_local(),
                PhaseChange::EnteredForeground => self.restart_discovery(),
            },
            // Handled by the run loop
            Command::Shutdown(_) => {}
        }
    }

    fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::PeerDiscovered(peer) => self.on_peer_discovered(peer),
            TransportEvent::PeerLost(peer) => {
                if self.registry.contains(&peer) {
                    tracing::debug!(peer = %peer, "Peer lost from discovery");
                    self.on_loss(&peer);
                }
            }
            TransportEvent::SessionStateChanged(peer, state) => self.on_session_state(peer, state),
            TransportEvent::DataReceived(peer, data) => self.on_data(&peer, &data),
        }
    }

    fn handle_internal(&mut self, message: Internal) {
        match message {
            Internal::SendFinished { peer, kind, result } => match result {
                Ok(()) => {
                    tracing::trace!(peer = %peer, ?kind, "Sent");
                    self.registry.record_successful_send(&peer);
                }
                Err(e) => {
                    tracing::debug!(peer = %peer, ?kind, error = %e, "Send failed");
                    self.run_failure_check();
                }
            },
            Internal::InviteFinished { peer, result } => {
                if let Err(e) = result {
                    tracing::debug!(peer = %peer, error = %e, "Invite failed");
                }
            }
            Internal::GraceElapsed { peer, detected_at } => {
                match self.liveness.grace_elapsed(&self.registry, &peer, detected_at) {
                    GraceOutcome::Evict => self.evict(&peer),
                    GraceOutcome::Recovered => {
                        tracing::debug!(peer = %peer, "Peer answered within grace period");
                    }
                    GraceOutcome::Gone => {}
                }
            }
            Internal::ReconnectSettled { peer, generation } => {
                if self.reconnect.on_settled(&peer, generation) {
                    self.start_discovery();
                    let window = self.reconnect.observation_window();
                    self.schedule(window, Internal::ReconnectWindowElapsed { peer, generation });
                }
            }
            Internal::ReconnectWindowElapsed { peer, generation } => {
                match self.reconnect.on_window_elapsed(&mut self.registry, &peer, generation) {
                    WindowOutcome::Stale => {}
                    WindowOutcome::Retry(attempt) => self.begin_attempt(attempt),
                    WindowOutcome::Recovered(peer) => {
                        tracing::info!(peer = %peer, "Peer reconnected");
                        self.after_sequence(false);
                    }
                    WindowOutcome::Exhausted(peer) => {
                        tracing::info!(peer = %peer, "Reconnection attempts exhausted, dropping peer");
                        self.registry.remove(&peer);
                        self.liveness.forget(&peer);
                        self.after_sequence(false);
                    }
                    WindowOutcome::Abandoned(_) => self.after_sequence(false),
                }
            }
        }
    }

    fn on_peer_discovered(&mut self, peer: PeerId) {
        if peer == self.state.local_id {
            return;
        }
        if self.registry.discovered(&peer) {
            tracing::info!(peer = %peer, "Discovered peer");
        }
        let idle = self
            .registry
            .get(&peer)
            .map(|r| r.connection_state == ConnectionState::NotConnected)
            .unwrap_or(false);
        if idle {
            self.spawn_invite(peer);
        }
    }

    fn on_session_state(&mut self, peer: PeerId, state: ConnectionState) {
        if peer == self.state.local_id {
            return;
        }
        match state {
            ConnectionState::Connected => {
                self.state.session_opened(&peer);
                if self.registry.upsert(&peer, ConnectionState::Connected) != Some(ConnectionState::Connected) {
                    tracing::info!(peer = %peer, "Peer connected");
                }
                self.liveness.forget(&peer);
                if let Some(cancelled) = self.reconnect.on_connected(&peer) {
                    tracing::info!(peer = %peer, "Peer reconnected");
                    self.after_sequence(cancelled.discovery_stopped);
                }
                if let Some(bytes) = self.broadcaster.catch_up() {
                    self.spawn_send(peer, bytes, SendKind::Payload);
                }
            }
            ConnectionState::Connecting => {
                self.registry.upsert(&peer, ConnectionState::Connecting);
            }
            ConnectionState::NotConnected => {
                self.state.session_closed(&peer);
                if !self.registry.contains(&peer) {
                    return;
                }
                self.registry.upsert(&peer, ConnectionState::NotConnected);
                self.liveness.forget(&peer);
                tracing::info!(peer = %peer, "Session lost");
                self.on_loss(&peer);
            }
        }
    }

    fn on_data(&mut self, peer: &PeerId, data: &[u8]) {
        match self.broadcaster.receive(&mut self.registry, peer, data) {
            Received::Heartbeat(_) => self.liveness.heartbeat_seen(peer),
            Received::State => tracing::debug!(peer = %peer, "Received now-playing update"),
            Received::UnknownPeer => {
                tracing::debug!(peer = %peer, "Dropped message from unregistered peer");
            }
            Received::Malformed(e) => {
                tracing::warn!(peer = %peer, error = %e, "Discarding malformed message");
            }
        }
    }

    fn on_heartbeat_tick(&mut self) {
        let targets = self.liveness.heartbeat_targets(&self.registry);
        if targets.is_empty() {
            return;
        }
        let Some(bytes) = self.heartbeat_bytes() else {
            return;
        };
        for peer in targets {
            self.spawn_send(peer, bytes.clone(), SendKind::Heartbeat);
        }
    }

    fn on_loss(&mut self, peer: &PeerId) {
        if let Some(attempt) = self.reconnect.on_loss(&mut self.registry, peer) {
            self.begin_attempt(attempt);
        }
    }

    fn begin_attempt(&mut self, attempt: Attempt) {
        tracing::info!(
            peer = %attempt.peer,
            attempt = attempt.attempt,
            max = self.config.max_reconnection_attempts,
            "Attempting reconnection"
        );
        // Restarting discovery only; the session object is left alone
        self.stop_discovery();
        let settle = self.reconnect.settle_delay();
        self.schedule(
            settle,
            Internal::ReconnectSettled {
                peer: attempt.peer,
                generation: attempt.generation,
            },
        );
    }

    /// A sequence ended; bring discovery back if needed and start the next
    /// queued one.
    fn after_sequence(&mut self, discovery_stopped: bool) {
        if discovery_stopped {
            self.start_discovery();
        }
        if let Some(attempt) = self.reconnect.next_deferred(&mut self.registry) {
            self.begin_attempt(attempt);
        }
    }

    fn run_failure_check(&mut self) {
        let now = Instant::now();
        let suspects = self.liveness.begin_failure_check(&self.registry, now);
        if suspects.is_empty() {
            return;
        }
        let probe = self.heartbeat_bytes();
        let grace = self.config.grace_period();
        for peer in suspects {
            tracing::info!(peer = %peer, "Peer unresponsive, probing before eviction");
            if let Some(bytes) = &probe {
                self.spawn_send(peer.clone(), bytes.clone(), SendKind::Probe);
            }
            self.schedule(grace, Internal::GraceElapsed { peer, detected_at: now });
        }
    }

    fn evict(&mut self, peer: &PeerId) {
        tracing::info!(peer = %peer, "Evicting unresponsive peer");
        self.registry.remove(peer);
        self.state.session_closed(peer);
        if let Some(cancelled) = self.reconnect.forget(peer) {
            self.after_sequence(cancelled.discovery_stopped);
        }
        self.transport.disconnect(peer);
    }

    fn broadcast_local(&mut self) {
        for (peer, bytes) in self.broadcaster.fan_out(&self.registry) {
            self.spawn_send(peer, bytes, SendKind::Payload);
        }
    }

    fn heartbeat_bytes(&self) -> Option<Vec<u8>> {
        match WireMessage::Heartbeat(Heartbeat::now(self.state.local_id.clone())).encode() {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to encode heartbeat");
                None
            }
        }
    }

    fn spawn_send(&self, peer: PeerId, data: Vec<u8>, kind: SendKind) {
        let transport = self.transport.clone();
        let tx = self.internal_tx.clone();
        let limit = self.config.send_timeout();
        tokio::spawn(async move {
            let result = match tokio::time::timeout(limit, transport.send(&peer, data)).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::Timeout(limit.as_millis() as u64)),
            };
            let _ = tx.send(Internal::SendFinished { peer, kind, result });
        });
    }

    fn spawn_invite(&self, peer: PeerId) {
        let transport = self.transport.clone();
        let tx = self.internal_tx.clone();
        let limit = self.config.send_timeout();
        tokio::spawn(async move {
            let result = match tokio::time::timeout(limit, transport.invite(&peer)).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::Timeout(limit.as_millis() as u64)),
            };
            let _ = tx.send(Internal::InviteFinished { peer, result });
        });
    }

    fn schedule(&self, delay: Duration, message: Internal) {
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(message);
        });
    }

    fn start_discovery(&self) {
        if let Err(e) = self.transport.start_advertising() {
            tracing::warn!(error = %e, "Failed to start advertising");
        }
        if let Err(e) = self.transport.start_browsing() {
            tracing::warn!(error = %e, "Failed to start browsing");
        }
    }

    fn stop_discovery(&self) {
        if let Err(e) = self.transport.stop_advertising() {
            tracing::warn!(error = %e, "Failed to stop advertising");
        }
        if let Err(e) = self.transport.stop_browsing() {
            tracing::warn!(error = %e, "Failed to stop browsing");
        }
    }

    fn restart_discovery(&self) {
        tracing::debug!("Restarting discovery");
        self.stop_discovery();
        self.start_discovery();
    }

    fn publish(&self) {
        self.publisher.publish(MeshSnapshot {
            local_id: self.state.local_id.clone(),
            running: self.state.is_running(),
            phase: self.lifecycle.phase(),
            background_allowance: self.lifecycle.holds_allowance(),
            local_state: self.state.now_playing().cloned(),
            peers: self.registry.views(),
            reconnecting: self.reconnect.in_flight().cloned(),
            deferred: self.reconnect.deferred().cloned().collect(),
            suspects: self.liveness.suspects(),
            last_heartbeat_at: self.liveness.last_heartbeat_seen(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::UnlimitedBackground;
    use crate::transport::SimNetwork;

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_nodes_connect_and_share_state() {
        let net = SimNetwork::new();
        let a = MeshNode::spawn(net.join("a"), MeshConfig::default(), Arc::new(UnlimitedBackground)).unwrap();
        let b = MeshNode::spawn(net.join("b"), MeshConfig::default(), Arc::new(UnlimitedBackground)).unwrap();
        settle().await;

        let view = a.snapshot();
        assert!(view.running);
        assert!(view.peer(&PeerId::from("b")).unwrap().is_connected);

        let song = NowPlaying::new("s1", "Song A", "Artist A");
        a.set_now_playing(Some(song.clone())).unwrap();
        settle().await;
        assert_eq!(b.snapshot().state_of(&PeerId::from("a")), Some(&song));

        a.shutdown().await.unwrap();
        b.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_unencodable_payload_rejected() {
        let net = SimNetwork::new();
        let a = MeshNode::spawn(net.join("a"), MeshConfig::default(), Arc::new(UnlimitedBackground)).unwrap();
        let b = MeshNode::spawn(net.join("b"), MeshConfig::default(), Arc::new(UnlimitedBackground)).unwrap();
        settle().await;

        let good = NowPlaying::new("s1", "Song A", "Artist A").with_duration(200.0);
        a.set_now_playing(Some(good.clone())).unwrap();
        settle().await;

        let bad = NowPlaying::new("s2", "Song B", "Artist B").with_duration(f64::NAN);
        assert!(matches!(a.set_now_playing(Some(bad)), Err(MeshError::Encode(_))));
        settle().await;

        assert_eq!(a.snapshot().local_state.as_ref(), Some(&good));
        assert_eq!(b.snapshot().state_of(&PeerId::from("a")), Some(&good));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_config_rejected() {
        let net = SimNetwork::new();
        let config = MeshConfig {
            heartbeat_interval_ms: 0,
            ..Default::default()
        };
        assert!(matches!(
            MeshNode::spawn(net.join("a"), config, Arc::new(UnlimitedBackground)),
            Err(MeshError::Config(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_discovery() {
        let net = SimNetwork::new();
        let node = MeshNode::spawn(net.join("a"), MeshConfig::default(), Arc::new(UnlimitedBackground)).unwrap();
        let mut snapshots = node.subscribe();
        settle().await;
        assert!(snapshots.borrow_and_update().running);

        node.shutdown().await.unwrap();
        assert!(!snapshots.borrow().running);

        // b advertises but nobody browses any more
        let b = net.join("b");
        b.start_advertising().unwrap();
        assert_eq!(net.stats(&PeerId::from("a")).browse_starts, 1);
    }
}
