use std::collections::BTreeSet;

use crate::peer::PeerId;
use crate::protocol::NowPlaying;

/// State of the local node, owned by the mesh coordinator.
#[derive(Debug, Clone)]
pub struct LocalNodeState {
    pub local_id: PeerId,
    now_playing: Option<NowPlaying>,
    // Peers with an open transport session
    sessions: BTreeSet<PeerId>,
    running: bool,
}

impl LocalNodeState {
    pub fn new(local_id: PeerId) -> Self {
        Self {
            local_id,
            now_playing: None,
            sessions: BTreeSet::new(),
            running: false,
        }
    }

    pub fn now_playing(&self) -> Option<&NowPlaying> {
        self.now_playing.as_ref()
    }

    /// Replace the payload wholesale. Returns false if nothing changed.
    pub fn set_now_playing(&mut self, payload: Option<NowPlaying>) -> bool {
        if self.now_playing == payload {
            return false;
        }
        self.now_playing = payload;
        true
    }

    pub fn session_opened(&mut self, peer: &PeerId) {
        self.sessions.insert(peer.clone());
    }

    pub fn session_closed(&mut self, peer: &PeerId) {
        self.sessions.remove(peer);
    }

    pub fn sessions(&self) -> impl Iterator<Item = &PeerId> {
        self.sessions.iter()
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn set_running(&mut self, running: bool) {
        self.running = running;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_replaced_wholesale() {
        let mut state = LocalNodeState::new(PeerId::from("me"));
        let song = NowPlaying::new("s1", "Song A", "Artist A");

        assert!(state.set_now_playing(Some(song.clone())));
        assert!(!state.set_now_playing(Some(song.clone())));
        assert_eq!(state.now_playing(), Some(&song));

        assert!(state.set_now_playing(None));
        assert!(state.now_playing().is_none());
    }

    #[test]
    fn test_sessions_tracked() {
        let mut state = LocalNodeState::new(PeerId::from("me"));
        state.session_opened(&PeerId::from("b"));
        state.session_opened(&PeerId::from("a"));
        state.session_closed(&PeerId::from("b"));
        assert_eq!(state.sessions().cloned().collect::<Vec<_>>(), vec![PeerId::from("a")]);
    }
}
