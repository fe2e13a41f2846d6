//! Lifecycle Coordinator: foreground/background handling.
//!
//! Entering the background takes a background-execution allowance from the
//! host as a [`BackgroundGrant`]. The grant ends the allowance when dropped,
//! which happens on return to the foreground, when the host reports the
//! allowance expired, or when the mesh shuts down. Each allowance is ended
//! exactly once whichever path comes first.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppPhase {
    #[default]
    Foreground,
    Background,
}

impl fmt::Display for AppPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppPhase::Foreground => write!(f, "foreground"),
            AppPhase::Background => write!(f, "background"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AllowanceId(pub u64);

/// Handed to the host with each allowance; the host calls [`expire`] when
/// the platform deadline hits.
///
/// [`expire`]: ExpiryNotifier::expire
#[derive(Debug, Clone)]
pub struct ExpiryNotifier {
    id: AllowanceId,
    tx: mpsc::UnboundedSender<AllowanceId>,
}

impl ExpiryNotifier {
    pub fn id(&self) -> AllowanceId {
        self.id
    }

    pub fn expire(&self) {
        // The mesh may already be gone; then there is nothing left to release
        let _ = self.tx.send(self.id);
    }
}

/// Platform hook for background execution time.
pub trait BackgroundHost: Send + Sync + 'static {
    fn begin(&self, notifier: ExpiryNotifier);

    fn end(&self, id: AllowanceId);
}

/// Host without background limits (desktop, servers)
#[derive(Debug, Default, Clone, Copy)]
pub struct UnlimitedBackground;

impl BackgroundHost for UnlimitedBackground {
    fn begin(&self, notifier: ExpiryNotifier) {
        tracing::trace!(id = notifier.id().0, "Background allowance granted");
    }

    fn end(&self, id: AllowanceId) {
        tracing::trace!(id = id.0, "Background allowance released");
    }
}

/// Scoped background allowance, ended on drop
pub struct BackgroundGrant {
    id: AllowanceId,
    host: Arc<dyn BackgroundHost>,
}

impl BackgroundGrant {
    pub fn id(&self) -> AllowanceId {
        self.id
    }
}

impl Drop for BackgroundGrant {
    fn drop(&mut self) {
        self.host.end(self.id);
    }
}

impl fmt::Debug for BackgroundGrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackgroundGrant").field("id", &self.id).finish()
    }
}

/// What a phase change requires from the mesh
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseChange {
    Unchanged,
    /// Keep everything running and re-broadcast the local payload
    EnteredBackground,
    /// Restart advertising and browsing
    EnteredForeground,
}

pub struct LifecycleCoordinator {
    phase: AppPhase,
    host: Arc<dyn BackgroundHost>,
    grant: Option<BackgroundGrant>,
    next_id: u64,
    expiry_tx: mpsc::UnboundedSender<AllowanceId>,
}

impl LifecycleCoordinator {
    /// Returns the coordinator and the receiver for host expiry notices.
    pub fn new(host: Arc<dyn BackgroundHost>) -> (Self, mpsc::UnboundedReceiver<AllowanceId>) {
        let (expiry_tx, expiry_rx) = mpsc::unbounded_channel();
        let coordinator = Self {
            phase: AppPhase::Foreground,
            host,
            grant: None,
            next_id: 0,
            expiry_tx,
        };
        (coordinator, expiry_rx)
    }

    pub fn phase(&self) -> AppPhase {
        self.phase
    }

    pub fn holds_allowance(&self) -> bool {
        self.grant.is_some()
    }

    /// Move to `phase`. Re-entering the current phase is a no-op.
    pub fn transition(&mut self, phase: AppPhase) -> PhaseChange {
        if phase == self.phase {
            return PhaseChange::Unchanged;
        }
        self.phase = phase;
        tracing::info!(%phase, "App phase changed");

        match phase {
            AppPhase::Background => {
                self.next_id += 1;
                let id = AllowanceId(self.next_id);
                self.host.begin(ExpiryNotifier {
                    id,
                    tx: self.expiry_tx.clone(),
                });
                self.grant = Some(BackgroundGrant {
                    id,
                    host: self.host.clone(),
                });
                PhaseChange::EnteredBackground
            }
            AppPhase::Foreground => {
                self.grant = None;
                PhaseChange::EnteredForeground
            }
        }
    }

    /// The host says an allowance ran out. Returns true if it was the live one.
    pub fn allowance_expired(&mut self, id: AllowanceId) -> bool {
        if self.grant.as_ref().map(BackgroundGrant::id) != Some(id) {
            return false;
        }
        tracing::info!(id = id.0, "Background allowance expired");
        self.grant = None;
        true
    }

    /// Drop any allowance still held
    pub fn release(&mut self) {
        self.grant = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        begun: Mutex<Vec<ExpiryNotifier>>,
        ended: Mutex<Vec<AllowanceId>>,
    }

    impl BackgroundHost for Recorder {
        fn begin(&self, notifier: ExpiryNotifier) {
            self.begun.lock().push(notifier);
        }

        fn end(&self, id: AllowanceId) {
            self.ended.lock().push(id);
        }
    }

    #[test]
    fn test_transitions_are_idempotent() {
        let host = Arc::new(Recorder::default());
        let (mut lifecycle, _rx) = LifecycleCoordinator::new(host.clone());

        assert_eq!(lifecycle.transition(AppPhase::Foreground), PhaseChange::Unchanged);
        assert_eq!(lifecycle.transition(AppPhase::Background), PhaseChange::EnteredBackground);
        assert_eq!(lifecycle.transition(AppPhase::Background), PhaseChange::Unchanged);
        assert_eq!(host.begun.lock().len(), 1);
        assert!(lifecycle.holds_allowance());

        assert_eq!(lifecycle.transition(AppPhase::Foreground), PhaseChange::EnteredForeground);
        assert_eq!(*host.ended.lock(), vec![AllowanceId(1)]);
        assert!(!lifecycle.holds_allowance());
    }

    #[tokio::test]
    async fn test_expiry_releases_exactly_once() {
        let host = Arc::new(Recorder::default());
        let (mut lifecycle, mut rx) = LifecycleCoordinator::new(host.clone());
        lifecycle.transition(AppPhase::Background);

        let notifier = host.begun.lock()[0].clone();
        notifier.expire();
        notifier.expire();

        let id = rx.recv().await.unwrap();
        assert!(lifecycle.allowance_expired(id));
        let id = rx.recv().await.unwrap();
        assert!(!lifecycle.allowance_expired(id));

        lifecycle.transition(AppPhase::Foreground);
        assert_eq!(*host.ended.lock(), vec![AllowanceId(1)]);
    }

    #[test]
    fn test_release_on_drop() {
        let host = Arc::new(Recorder::default());
        {
            let (mut lifecycle, _rx) = LifecycleCoordinator::new(host.clone());
            lifecycle.transition(AppPhase::Background);
        }
        assert_eq!(host.ended.lock().len(), 1);
    }
}
