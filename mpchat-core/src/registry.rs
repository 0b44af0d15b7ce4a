//! Discovered peers and their connection status.

use std::collections::BTreeMap;
use std::fmt;

use crate::identity::PeerId;

/// Connection status of a discovered peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerStatus {
    Available,
    Connecting,
    Connected,
}

impl PeerStatus {
    /// Allowed edges: available -> connecting -> connected -> available, connecting -> available.
    /// Removal is not a status; it is allowed from any state.
    pub fn can_transition_to(self, next: PeerStatus) -> bool {
        use PeerStatus::*;
        matches!(
            (self, next),
            (Available, Connecting)
                | (Connecting, Connected)
                | (Connecting, Available)
                | (Connected, Available)
        )
    }
}

impl fmt::Display for PeerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PeerStatus::Available => "available",
            PeerStatus::Connecting => "connecting",
            PeerStatus::Connected => "connected",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrowsedPeer {
    pub id: PeerId,
    pub display_name: String,
    pub status: PeerStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("peer {0} is not in the registry")]
    UnknownPeer(PeerId),
    #[error("illegal status change {from} -> {to} for peer {peer}")]
    Illegal {
        peer: PeerId,
        from: PeerStatus,
        to: PeerStatus,
    },
}

/// Peers seen by the browser, unique by id.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: BTreeMap<PeerId, BrowsedPeer>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a peer with `initial` status unless already present. Returns true if added.
    pub fn insert_if_absent(&mut self, id: PeerId, display_name: &str, initial: PeerStatus) -> bool {
        if self.peers.contains_key(&id) {
            return false;
        }
        self.peers.insert(
            id,
            BrowsedPeer {
                id,
                display_name: display_name.to_string(),
                status: initial,
            },
        );
        true
    }

    /// Move a peer to `next`. Setting the current status again is a no-op.
    pub fn set_status(&mut self, id: PeerId, next: PeerStatus) -> Result<(), TransitionError> {
        let peer = self
            .peers
            .get_mut(&id)
            .ok_or(TransitionError::UnknownPeer(id))?;
        if peer.status == next {
            return Ok(());
        }
        if !peer.status.can_transition_to(next) {
            return Err(TransitionError::Illegal {
                peer: id,
                from: peer.status,
                to: next,
            });
        }
        tracing::debug!(peer = %id, from = %peer.status, to = %next, "peer status changed");
        peer.status = next;
        Ok(())
    }

    pub fn rename(&mut self, id: PeerId, display_name: &str) {
        if let Some(peer) = self.peers.get_mut(&id) {
            peer.display_name = display_name.to_string();
        }
    }

    pub fn remove(&mut self, id: PeerId) -> Option<BrowsedPeer> {
        self.peers.remove(&id)
    }

    pub fn get(&self, id: PeerId) -> Option<&BrowsedPeer> {
        self.peers.get(&id)
    }

    pub fn status(&self, id: PeerId) -> Option<PeerStatus> {
        self.peers.get(&id).map(|p| p.status)
    }

    pub fn contains(&self, id: PeerId) -> bool {
        self.peers.contains_key(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &BrowsedPeer> {
        self.peers.values()
    }

    pub fn ids(&self) -> Vec<PeerId> {
        self.peers.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
