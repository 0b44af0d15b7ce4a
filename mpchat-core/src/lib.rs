//! Local-network chat core.
//! Host-driven: no I/O; the host feeds platform callbacks as events and performs the returned outputs.

pub mod codec;
pub mod coordinator;
pub mod delivery;
pub mod error;
pub mod identity;
pub mod primitive;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod storage;
pub mod store;
pub mod test_support;
pub mod transport;

pub use codec::{DecodeError, EncodeError, Inbound};
pub use coordinator::{
    ConnectError, ConnectFailure, Event, Invitation, Notification, Output, SessionCoordinator,
    Settings, Timer,
};
pub use delivery::{Delivery, DeliveryManager, DropReason};
pub use error::{Error, Result};
pub use identity::{ConversationKey, MessageId, PeerId, PeerIdentity};
pub use primitive::{DiscoveryRole, Reliability, SessionId, SessionState, Transport, TransportError};
pub use protocol::{CommuType, ContentType, Envelope, Introduction, DEFAULT_SERVICE_ID};
pub use registry::{BrowsedPeer, PeerRegistry, PeerStatus};
pub use storage::{MessageRecord, Storage, DEFAULT_PAGE_SIZE};
pub use store::{MemoryStore, Page, Query, Record, RecordStore, StoreError};
