// Each integration test binary includes this module; not all of them use every helper.
#![allow(dead_code)]
//! Shared helpers for mesh integration tests.
//!
//! Everything runs on the in-memory network under paused tokio time, so the
//! design timings (1s heartbeat, 10s timeout, 5s grace, 1s + 5s reconnection
//! attempts) play out instantly and deterministically.

use std::sync::Arc;
use std::time::Duration;

use nearcast_lib::{
    AllowanceId, BackgroundHost, ExpiryNotifier, MeshConfig, MeshNode, NowPlaying, PeerId,
    SimNetwork, UnlimitedBackground,
};
use parking_lot::Mutex;

pub fn id(name: &str) -> PeerId {
    PeerId::from(name)
}

pub fn song(id: &str, title: &str, artist: &str) -> NowPlaying {
    NowPlaying::new(id, title, artist)
}

/// Let virtual time pass; every timer due in between fires in order.
pub async fn advance(seconds: f64) {
    tokio::time::sleep(Duration::from_secs_f64(seconds)).await;
}

pub fn spawn_node(net: &SimNetwork, name: &str) -> MeshNode {
    MeshNode::spawn(net.join(name), MeshConfig::default(), Arc::new(UnlimitedBackground))
        .expect("spawn mesh node")
}

pub fn spawn_node_with_host(net: &SimNetwork, name: &str, host: Arc<dyn BackgroundHost>) -> MeshNode {
    MeshNode::spawn(net.join(name), MeshConfig::default(), host).expect("spawn mesh node")
}

/// Spawn nodes on one network and wait until they have all connected.
pub async fn mesh(net: &SimNetwork, names: &[&str]) -> Vec<MeshNode> {
    let nodes: Vec<MeshNode> = names.iter().map(|name| spawn_node(net, name)).collect();
    advance(0.1).await;
    for node in &nodes {
        let snapshot = node.snapshot();
        assert_eq!(
            snapshot.connected_count(),
            names.len() - 1,
            "{} did not connect to everyone: {:?}",
            node.local_id(),
            snapshot.peers
        );
    }
    nodes
}

/// Background host that records every begin and end.
#[derive(Default)]
pub struct RecordingHost {
    begun: Mutex<Vec<ExpiryNotifier>>,
    ended: Mutex<Vec<AllowanceId>>,
}

impl RecordingHost {
    pub fn begun(&self) -> usize {
        self.begun.lock().len()
    }

    pub fn ended(&self) -> Vec<AllowanceId> {
        self.ended.lock().clone()
    }

    pub fn last_notifier(&self) -> Option<ExpiryNotifier> {
        self.begun.lock().last().cloned()
    }
}

impl BackgroundHost for RecordingHost {
    fn begin(&self, notifier: ExpiryNotifier) {
        self.begun.lock().push(notifier);
    }

    fn end(&self, id: AllowanceId) {
        self.ended.lock().push(id);
    }
}
