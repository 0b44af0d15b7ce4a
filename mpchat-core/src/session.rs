//! Per-peer session table. At most one session per peer id.

use std::collections::HashMap;

use crate::identity::PeerId;
use crate::primitive::{SessionId, SessionState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Session {
    pub id: SessionId,
    pub state: SessionState,
}

#[derive(Debug, Default)]
pub struct SessionMap {
    by_peer: HashMap<PeerId, Session>,
}

impl SessionMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a new session to `peer`. Fails with the existing session id if one is already bound.
    pub fn bind(&mut self, peer: PeerId, id: SessionId) -> Result<(), SessionId> {
        if let Some(existing) = self.by_peer.get(&peer) {
            return Err(existing.id);
        }
        self.by_peer.insert(
            peer,
            Session {
                id,
                state: SessionState::Connecting,
            },
        );
        Ok(())
    }

    pub fn get(&self, peer: PeerId) -> Option<&Session> {
        self.by_peer.get(&peer)
    }

    pub fn session_id(&self, peer: PeerId) -> Option<SessionId> {
        self.by_peer.get(&peer).map(|s| s.id)
    }

    pub fn is_bound_to(&self, peer: PeerId, id: SessionId) -> bool {
        self.session_id(peer) == Some(id)
    }

    pub fn set_state(&mut self, peer: PeerId, state: SessionState) {
        if let Some(s) = self.by_peer.get_mut(&peer) {
            s.state = state;
        }
    }

    pub fn unbind(&mut self, peer: PeerId) -> Option<Session> {
        self.by_peer.remove(&peer)
    }

    pub fn peers(&self) -> Vec<PeerId> {
        self.by_peer.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.by_peer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_peer.is_empty()
    }
}
