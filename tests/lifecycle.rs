//! Foreground/background transitions of a running node.

mod common;

use std::sync::Arc;

use common::{advance, id, song, spawn_node, spawn_node_with_host, RecordingHost};
use nearcast_lib::{AppPhase, SimNetwork};

#[tokio::test(start_paused = true)]
async fn test_background_rebroadcasts_and_holds_allowance() {
    let net = SimNetwork::new();
    let host = Arc::new(RecordingHost::default());
    let a = spawn_node_with_host(&net, "a", host.clone());
    let b = spawn_node(&net, "b");
    advance(0.1).await;

    let track = song("s1", "Song A", "Artist A");
    a.set_now_playing(Some(track.clone())).unwrap();
    advance(0.2).await;
    let sent = net.stats(&id("a")).sent;

    a.set_app_phase(AppPhase::Background).unwrap();
    advance(0.2).await;
    assert_eq!(net.stats(&id("a")).sent, sent + 1);
    assert_eq!(host.begun(), 1);

    let view = a.snapshot();
    assert_eq!(view.phase, AppPhase::Background);
    assert!(view.background_allowance);
    assert_eq!(b.snapshot().state_of(&id("a")), Some(&track));

    // Entering the same phase again does nothing
    a.set_app_phase(AppPhase::Background).unwrap();
    advance(0.2).await;
    assert_eq!(host.begun(), 1);
    assert_eq!(net.stats(&id("a")).sent, sent + 1);
    assert!(host.ended().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_foreground_restarts_discovery_and_ends_allowance() {
    let net = SimNetwork::new();
    let host = Arc::new(RecordingHost::default());
    let a = spawn_node_with_host(&net, "a", host.clone());
    advance(0.1).await;

    // Foreground to foreground is a no-op
    let before = net.stats(&id("a"));
    a.set_app_phase(AppPhase::Foreground).unwrap();
    advance(0.1).await;
    assert_eq!(net.stats(&id("a")), before);

    a.set_app_phase(AppPhase::Background).unwrap();
    advance(0.1).await;
    a.set_app_phase(AppPhase::Foreground).unwrap();
    advance(0.1).await;

    let after = net.stats(&id("a"));
    assert_eq!(after.advertise_starts, before.advertise_starts + 1);
    assert_eq!(after.browse_starts, before.browse_starts + 1);
    assert_eq!(host.begun(), 1);
    assert_eq!(host.ended().len(), 1);

    let view = a.snapshot();
    assert_eq!(view.phase, AppPhase::Foreground);
    assert!(!view.background_allowance);
}

#[tokio::test(start_paused = true)]
async fn test_expired_allowance_is_released_once() {
    let net = SimNetwork::new();
    let host = Arc::new(RecordingHost::default());
    let a = spawn_node_with_host(&net, "a", host.clone());
    advance(0.1).await;

    a.set_app_phase(AppPhase::Background).unwrap();
    advance(0.1).await;
    let notifier = host.last_notifier().unwrap();

    notifier.expire();
    notifier.expire();
    advance(0.1).await;
    assert_eq!(host.ended(), vec![notifier.id()]);

    let view = a.snapshot();
    assert_eq!(view.phase, AppPhase::Background);
    assert!(!view.background_allowance);

    a.set_app_phase(AppPhase::Foreground).unwrap();
    advance(0.1).await;
    assert_eq!(host.ended().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_in_background_ends_allowance() {
    let net = SimNetwork::new();
    let host = Arc::new(RecordingHost::default());
    let a = spawn_node_with_host(&net, "a", host.clone());
    advance(0.1).await;

    a.set_app_phase(AppPhase::Background).unwrap();
    advance(0.1).await;
    assert!(host.ended().is_empty());

    a.shutdown().await.unwrap();
    assert_eq!(host.ended().len(), 1);
}
