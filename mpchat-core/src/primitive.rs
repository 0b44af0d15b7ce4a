//! Platform transport primitive consumed by the coordinator. Calls go out through [`Transport`];
//! callbacks come back in as [`crate::Event`]s through the host's inbox.

use std::fmt;
use std::time::Duration;

use crate::identity::PeerId;

/// Opaque session handle issued by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Session state as reported by the platform for one peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    NotConnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reliability {
    Reliable,
    Unreliable,
}

/// Which half of discovery an operation or failure concerns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiscoveryRole {
    Advertiser,
    Browser,
}

impl fmt::Display for DiscoveryRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiscoveryRole::Advertiser => f.write_str("advertiser"),
            DiscoveryRole::Browser => f.write_str("browser"),
        }
    }
}

/// Error reported synchronously by the platform.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("{role} failed to start: {reason}")]
    Start { role: DiscoveryRole, reason: String },
    #[error("invite failed: {0}")]
    Invite(String),
    #[error("send failed: {0}")]
    Send(String),
}

/// Advertise/browse, invite, per-session send. Implemented by the platform binding.
pub trait Transport {
    fn advertise(&mut self, service_id: &str) -> Result<(), TransportError>;
    fn stop_advertise(&mut self);
    fn browse(&mut self, service_id: &str) -> Result<(), TransportError>;
    fn stop_browse(&mut self);
    /// New, unconnected session object.
    fn create_session(&mut self) -> SessionId;
    fn invite(
        &mut self,
        peer: PeerId,
        session: SessionId,
        timeout: Duration,
    ) -> Result<(), TransportError>;
    /// Answer an inbound invitation: `Some(session)` accepts into it, `None` declines.
    fn respond_to_invitation(&mut self, peer: PeerId, session: Option<SessionId>);
    fn send(
        &mut self,
        session: SessionId,
        bytes: &[u8],
        recipients: &[PeerId],
        reliability: Reliability,
    ) -> Result<(), TransportError>;
    fn close_session(&mut self, session: SessionId);
}
