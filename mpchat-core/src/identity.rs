//! Peer and message identifiers, local/remote peer identity.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Peer ID: UUID chosen by each device at profile setup. Used in discovery, sessions and history.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(Uuid);

impl PeerId {
    /// Generate a fresh random peer ID.
    pub fn generate() -> Self {
        PeerId(Uuid::new_v4())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        PeerId(Uuid::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Message ID: assigned by the sender when an envelope is built, kept by every receiver.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(Uuid);

impl MessageId {
    pub fn generate() -> Self {
        MessageId(Uuid::new_v4())
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Who a peer is: ID, human-readable name and optional avatar image bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerIdentity {
    pub id: PeerId,
    pub display_name: String,
    pub avatar: Option<Vec<u8>>,
}

impl PeerIdentity {
    pub fn new(id: PeerId, display_name: impl Into<String>) -> Self {
        Self {
            id,
            display_name: display_name.into(),
            avatar: None,
        }
    }

    pub fn with_avatar(mut self, avatar: Vec<u8>) -> Self {
        self.avatar = Some(avatar);
        self
    }
}

/// Unordered pair of peers naming one conversation. `new(a, b) == new(b, a)`.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ConversationKey {
    low: PeerId,
    high: PeerId,
}

impl ConversationKey {
    pub fn new(a: PeerId, b: PeerId) -> Self {
        if a <= b {
            Self { low: a, high: b }
        } else {
            Self { low: b, high: a }
        }
    }

    pub fn contains(&self, peer: PeerId) -> bool {
        self.low == peer || self.high == peer
    }

    /// The member of the pair that is not `peer`. None if `peer` is not a member.
    pub fn other(&self, peer: PeerId) -> Option<PeerId> {
        if self.low == peer {
            Some(self.high)
        } else if self.high == peer {
            Some(self.low)
        } else {
            None
        }
    }
}
