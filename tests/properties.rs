//! Mesh-wide guarantees that must hold at every point in time, sampled
//! every half second under paused time.

mod common;

use common::{advance, id, mesh};
use nearcast_lib::SimNetwork;

#[tokio::test(start_paused = true)]
async fn test_one_reconnection_in_flight_at_a_time() {
    let net = SimNetwork::new();
    let nodes = mesh(&net, &["a", "b", "c"]).await;
    let a = &nodes[0];

    net.set_in_range(&id("b"), false);
    net.set_in_range(&id("c"), false);

    let mut saw_b = false;
    let mut saw_c = false;
    for _ in 0..80 {
        advance(0.5).await;
        let view = a.snapshot();
        match view.reconnecting.as_ref().map(|p| p.as_str()) {
            Some("b") => {
                saw_b = true;
                assert_eq!(view.deferred, vec![id("c")]);
                assert_eq!(view.peer(&id("c")).unwrap().reconnection_attempts, 0);
            }
            Some("c") => {
                saw_c = true;
                assert!(view.deferred.is_empty());
                assert!(view.peer(&id("b")).is_none(), "b must be done before c starts");
            }
            Some(other) => panic!("unexpected reconnection for {}", other),
            None => {}
        }
        if let Some(peer) = &view.reconnecting {
            assert!(!view.deferred.contains(peer));
        }
    }

    assert!(saw_b && saw_c);
    let view = a.snapshot();
    assert!(view.peers.is_empty());
    assert_eq!(view.reconnecting, None);
}

#[tokio::test(start_paused = true)]
async fn test_attempts_never_exceed_maximum() {
    let net = SimNetwork::new();
    let nodes = mesh(&net, &["a", "b"]).await;
    let a = &nodes[0];

    net.set_in_range(&id("b"), false);

    let mut highest = 0;
    for _ in 0..60 {
        advance(0.5).await;
        if let Some(peer) = a.snapshot().peer(&id("b")) {
            assert!(peer.reconnection_attempts <= 3);
            highest = highest.max(peer.reconnection_attempts);
        }
    }
    assert_eq!(highest, 3);
    assert!(a.snapshot().peer(&id("b")).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_connection_resets_attempt_counter() {
    let net = SimNetwork::new();
    let nodes = mesh(&net, &["a", "b"]).await;
    let a = &nodes[0];

    net.set_in_range(&id("b"), false);
    advance(0.5).await;
    assert_eq!(a.snapshot().peer(&id("b")).unwrap().reconnection_attempts, 1);

    // Back during the first observation window
    advance(2.0).await;
    net.set_in_range(&id("b"), true);
    advance(0.5).await;

    let peer = a.snapshot().peer(&id("b")).cloned().unwrap();
    assert!(peer.is_connected);
    assert_eq!(peer.reconnection_attempts, 0);

    // A later loss starts a fresh episode at attempt 1
    net.set_in_range(&id("b"), false);
    advance(0.5).await;
    assert_eq!(a.snapshot().peer(&id("b")).unwrap().reconnection_attempts, 1);
}

#[tokio::test(start_paused = true)]
async fn test_dropped_session_recovers_without_losing_state() {
    let net = SimNetwork::new();
    let nodes = mesh(&net, &["a", "b"]).await;
    let (a, b) = (&nodes[0], &nodes[1]);
    let track = common::song("s1", "Song B", "Artist B");
    b.set_now_playing(Some(track.clone())).unwrap();
    advance(0.5).await;

    assert!(net.drop_session(&id("a"), &id("b")));
    advance(0.1).await;
    assert_eq!(a.snapshot().peer(&id("b")).unwrap().reconnection_attempts, 1);

    // Rediscovered once discovery restarts after the settle delay
    advance(1.5).await;
    let view = a.snapshot();
    let peer = view.peer(&id("b")).unwrap();
    assert!(peer.is_connected);
    assert_eq!(peer.reconnection_attempts, 0);
    assert_eq!(peer.last_known_state.as_ref(), Some(&track));
    assert!(net.has_session(&id("a"), &id("b")));
}

#[tokio::test(start_paused = true)]
async fn test_lost_from_discovery_while_connected_runs_one_attempt() {
    let net = SimNetwork::new();
    let nodes = mesh(&net, &["a", "b"]).await;
    let a = &nodes[0];

    net.lose_sight(&id("a"), &id("b"));
    advance(0.5).await;
    let view = a.snapshot();
    assert_eq!(view.reconnecting, Some(id("b")));
    let peer = view.peer(&id("b")).unwrap();
    assert!(peer.is_connected);
    assert_eq!(peer.reconnection_attempts, 1);

    // Window ends at 6s and finds the session still up
    advance(6.0).await;
    let view = a.snapshot();
    assert_eq!(view.reconnecting, None);
    let peer = view.peer(&id("b")).unwrap();
    assert!(peer.is_connected);
    assert_eq!(peer.reconnection_attempts, 0);
    assert!(net.has_session(&id("a"), &id("b")));
}
