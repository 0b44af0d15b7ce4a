//! Peer and message tables over the generic record store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::identity::{ConversationKey, MessageId, PeerId, PeerIdentity};
use crate::protocol::ContentType;
use crate::store::{Page, Query, Record, RecordStore, StoreError};

/// Default number of messages returned per history page.
pub const DEFAULT_PAGE_SIZE: usize = 20;

/// One persisted message. Append-only; unique by `id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: MessageId,
    pub payload: Vec<u8>,
    pub content_type: ContentType,
    pub timestamp: DateTime<Utc>,
    pub sender: PeerId,
    pub receivers: Vec<PeerId>,
}

impl MessageRecord {
    /// True when the record is part of the conversation between the two peers of `key`.
    pub fn belongs_to(&self, key: &ConversationKey) -> bool {
        match key.other(self.sender) {
            Some(other) => self.receivers.contains(&other),
            None => false,
        }
    }
}

impl Record for MessageRecord {
    const TABLE: &'static str = "messages";
    fn key(&self) -> Vec<u8> {
        self.id.as_bytes().to_vec()
    }
}

impl Record for PeerIdentity {
    const TABLE: &'static str = "peers";
    fn key(&self) -> Vec<u8> {
        self.id.as_bytes().to_vec()
    }
}

/// Thin core-facing interface over the record store.
pub struct Storage<S> {
    store: S,
    page_size: usize,
}

impl<S: RecordStore> Storage<S> {
    pub fn new(store: S) -> Self {
        Self::with_page_size(store, DEFAULT_PAGE_SIZE)
    }

    pub fn with_page_size(store: S, page_size: usize) -> Self {
        Self {
            store,
            page_size: page_size.max(1),
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn list_peers(&self) -> Result<Vec<PeerIdentity>, StoreError> {
        self.store.query(
            &Query::all().sorted_by(|a: &PeerIdentity, b: &PeerIdentity| {
                a.display_name.cmp(&b.display_name).then(a.id.cmp(&b.id))
            }),
        )
    }

    pub fn get_peer(&self, id: PeerId) -> Result<Option<PeerIdentity>, StoreError> {
        let found = self
            .store
            .query(&Query::filter(|p: &PeerIdentity| p.id == id))?;
        Ok(found.into_iter().next())
    }

    /// Create or update name/avatar of a peer.
    pub fn upsert_peer(&mut self, identity: &PeerIdentity) -> Result<(), StoreError> {
        self.store.put(identity)
    }

    pub fn remove_peer(&mut self, id: PeerId) -> Result<bool, StoreError> {
        Ok(self.store.delete(&|p: &PeerIdentity| p.id == id)? > 0)
    }

    pub fn remove_all_peers(&mut self) -> Result<usize, StoreError> {
        self.store.delete(&|_: &PeerIdentity| true)
    }

    /// Page `page` (0 = oldest) of the conversation between `a` and `b`, ascending by timestamp.
    pub fn query_messages(
        &self,
        a: PeerId,
        b: PeerId,
        page: usize,
    ) -> Result<Vec<MessageRecord>, StoreError> {
        let key = ConversationKey::new(a, b);
        let query = Query::filter(move |m: &MessageRecord| m.belongs_to(&key))
            .sorted_by(|x: &MessageRecord, y: &MessageRecord| {
                x.timestamp.cmp(&y.timestamp).then(x.id.cmp(&y.id))
            })
            .paged(Page {
                index: page,
                size: self.page_size,
            });
        self.store.query(&query)
    }

    /// Persist a message. Returns false (and stores nothing) if its id is already stored.
    pub fn append_message(&mut self, record: &MessageRecord) -> Result<bool, StoreError> {
        self.store.create(record)
    }

    pub fn remove_all_messages(&mut self) -> Result<usize, StoreError> {
        self.store.delete(&|_: &MessageRecord| true)
    }
}
