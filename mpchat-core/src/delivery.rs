//! Delivery manager: classify inbound bytes, persist messages once, publish to conversation subscribers.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::codec::{self, Inbound};
use crate::identity::{ConversationKey, MessageId, PeerId, PeerIdentity};
use crate::protocol::{CommuType, Envelope, Introduction};
use crate::storage::{MessageRecord, Storage};
use crate::store::{RecordStore, StoreError};

/// Outcome of handling one inbound payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// New user message, persisted and published.
    Stored(MessageRecord),
    /// Redelivery of an already stored message id.
    Duplicate(MessageId),
    /// Identity created or updated from an introduction.
    Introduced(PeerIdentity),
    Dropped(DropReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    /// Matched neither an envelope from a known peer nor an introduction.
    Unrecognized,
    /// Introduction claiming an id other than the sending peer's.
    IdentityMismatch { claimed: PeerId },
}

#[derive(Debug, Default)]
pub struct DeliveryManager {
    subscribers: HashMap<ConversationKey, Vec<mpsc::UnboundedSender<MessageRecord>>>,
}

impl DeliveryManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Receive every record stored from now on for the conversation `key`.
    pub fn subscribe(&mut self, key: ConversationKey) -> mpsc::UnboundedReceiver<MessageRecord> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.entry(key).or_default().push(tx);
        rx
    }

    pub fn subscriber_count(&self, key: &ConversationKey) -> usize {
        self.subscribers.get(key).map(|s| s.len()).unwrap_or(0)
    }

    /// Publish to subscribers of each conversation the record belongs to. Closed receivers are pruned.
    pub fn publish(&mut self, record: &MessageRecord) {
        for &receiver in &record.receivers {
            let key = ConversationKey::new(record.sender, receiver);
            if let Some(subs) = self.subscribers.get_mut(&key) {
                subs.retain(|tx| tx.send(record.clone()).is_ok());
                if subs.is_empty() {
                    self.subscribers.remove(&key);
                }
            }
        }
    }

    /// Persist `record` unless its id is already stored; publish it if it was new.
    pub fn record<S: RecordStore>(
        &mut self,
        storage: &mut Storage<S>,
        record: MessageRecord,
    ) -> Result<Delivery, StoreError> {
        if !storage.append_message(&record)? {
            tracing::debug!(message = %record.id, "duplicate message ignored");
            return Ok(Delivery::Duplicate(record.id));
        }
        self.publish(&record);
        Ok(Delivery::Stored(record))
    }

    /// Handle bytes received from `from` on a session. `local` is this device's peer id.
    pub fn on_data<S: RecordStore>(
        &mut self,
        storage: &mut Storage<S>,
        local: PeerId,
        from: PeerId,
        bytes: &[u8],
        now: DateTime<Utc>,
    ) -> Result<Delivery, StoreError> {
        let known = storage.get_peer(from)?.is_some();
        let inbound = match codec::classify(bytes, known) {
            Ok(i) => i,
            Err(e) => {
                tracing::warn!(peer = %from, len = bytes.len(), "dropping inbound payload: {}", e);
                return Ok(Delivery::Dropped(DropReason::Unrecognized));
            }
        };
        match inbound {
            Inbound::Envelope(env) => match env.commu_type {
                CommuType::User => self.record(storage, user_record(env, from, local, now)),
                CommuType::Introduction => match codec::decode_introduction(&env.data) {
                    Ok(intro) => self.introduce(storage, from, intro),
                    Err(e) => {
                        tracing::warn!(peer = %from, "bad introduction envelope: {}", e);
                        Ok(Delivery::Dropped(DropReason::Unrecognized))
                    }
                },
            },
            Inbound::Introduction(intro) => self.introduce(storage, from, intro),
        }
    }

    fn introduce<S: RecordStore>(
        &mut self,
        storage: &mut Storage<S>,
        from: PeerId,
        intro: Introduction,
    ) -> Result<Delivery, StoreError> {
        if intro.peer_id != from {
            tracing::warn!(peer = %from, claimed = %intro.peer_id, "introduction id does not match sender");
            return Ok(Delivery::Dropped(DropReason::IdentityMismatch {
                claimed: intro.peer_id,
            }));
        }
        let identity = PeerIdentity::from(intro);
        storage.upsert_peer(&identity)?;
        tracing::info!(peer = %from, name = %identity.display_name, "peer introduced");
        Ok(Delivery::Introduced(identity))
    }
}

fn user_record(env: Envelope, from: PeerId, local: PeerId, now: DateTime<Utc>) -> MessageRecord {
    MessageRecord {
        id: env.message_id,
        payload: env.data,
        content_type: env.content_type,
        timestamp: now,
        sender: from,
        receivers: vec![local],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ContentType;
    use crate::store::MemoryStore;

    struct Fixture {
        storage: Storage<MemoryStore>,
        dm: DeliveryManager,
        me: PeerId,
        bob: PeerId,
    }

    fn fixture() -> Fixture {
        let mut storage = Storage::new(MemoryStore::new());
        let bob = PeerId::generate();
        storage.upsert_peer(&PeerIdentity::new(bob, "Bob")).unwrap();
        Fixture {
            storage,
            dm: DeliveryManager::new(),
            me: PeerId::generate(),
            bob,
        }
    }

    #[test]
    fn message_from_known_peer_is_stored_and_published() {
        let mut f = fixture();
        let mut rx = f.dm.subscribe(ConversationKey::new(f.me, f.bob));
        let env = Envelope::text("hi");
        let bytes = codec::encode_envelope(&env).unwrap();
        let out = f
            .dm
            .on_data(&mut f.storage, f.me, f.bob, &bytes, Utc::now())
            .unwrap();
        let Delivery::Stored(rec) = out else {
            panic!("expected Stored, got {:?}", out);
        };
        assert_eq!(rec.id, env.message_id);
        assert_eq!(rec.sender, f.bob);
        assert_eq!(rec.receivers, vec![f.me]);
        assert_eq!(rec.content_type, ContentType::Text);
        assert_eq!(rx.try_recv().unwrap(), rec);
        assert_eq!(f.storage.query_messages(f.me, f.bob, 0).unwrap(), vec![rec]);
    }

    #[test]
    fn redelivery_is_deduplicated() {
        let mut f = fixture();
        let mut rx = f.dm.subscribe(ConversationKey::new(f.bob, f.me));
        let env = Envelope::text("once");
        let bytes = codec::encode_envelope(&env).unwrap();
        f.dm.on_data(&mut f.storage, f.me, f.bob, &bytes, Utc::now())
            .unwrap();
        let again = f
            .dm
            .on_data(&mut f.storage, f.me, f.bob, &bytes, Utc::now())
            .unwrap();
        assert_eq!(again, Delivery::Duplicate(env.message_id));
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
        assert_eq!(f.storage.query_messages(f.me, f.bob, 0).unwrap().len(), 1);
    }

    #[test]
    fn envelope_from_unknown_peer_is_dropped() {
        let mut f = fixture();
        let stranger = PeerId::generate();
        let bytes = codec::encode_envelope(&Envelope::text("who")).unwrap();
        let out = f
            .dm
            .on_data(&mut f.storage, f.me, stranger, &bytes, Utc::now())
            .unwrap();
        assert_eq!(out, Delivery::Dropped(DropReason::Unrecognized));
        assert!(f
            .storage
            .query_messages(f.me, stranger, 0)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn introduction_creates_then_updates_identity() {
        let mut f = fixture();
        let carl = PeerId::generate();
        let intro = Introduction {
            peer_id: carl,
            display_name: "Carl".into(),
            avatar: None,
        };
        let bytes = codec::encode_introduction(&intro).unwrap();
        let out = f
            .dm
            .on_data(&mut f.storage, f.me, carl, &bytes, Utc::now())
            .unwrap();
        assert!(matches!(out, Delivery::Introduced(ref p) if p.display_name == "Carl"));

        let renamed = Introduction {
            display_name: "Carlos".into(),
            avatar: Some(vec![1]),
            ..intro
        };
        let bytes = codec::encode_introduction(&renamed).unwrap();
        f.dm.on_data(&mut f.storage, f.me, carl, &bytes, Utc::now())
            .unwrap();
        let stored = f.storage.get_peer(carl).unwrap().unwrap();
        assert_eq!(stored.display_name, "Carlos");
        assert_eq!(stored.avatar, Some(vec![1]));
        assert_eq!(f.storage.list_peers().unwrap().len(), 2);
    }

    #[test]
    fn introduction_for_other_id_is_rejected() {
        let mut f = fixture();
        let claimed = PeerId::generate();
        let intro = Introduction {
            peer_id: claimed,
            display_name: "Mallory".into(),
            avatar: None,
        };
        let bytes = codec::encode_introduction(&intro).unwrap();
        let out = f
            .dm
            .on_data(&mut f.storage, f.me, f.bob, &bytes, Utc::now())
            .unwrap();
        assert_eq!(
            out,
            Delivery::Dropped(DropReason::IdentityMismatch { claimed })
        );
        assert!(f.storage.get_peer(claimed).unwrap().is_none());
    }

    #[test]
    fn wrapped_introduction_from_known_peer() {
        let mut f = fixture();
        let intro = Introduction {
            peer_id: f.bob,
            display_name: "Robert".into(),
            avatar: None,
        };
        let env = Envelope::new(
            codec::encode_introduction(&intro).unwrap(),
            ContentType::Text,
            CommuType::Introduction,
        );
        let bytes = codec::encode_envelope(&env).unwrap();
        let out = f
            .dm
            .on_data(&mut f.storage, f.me, f.bob, &bytes, Utc::now())
            .unwrap();
        assert!(matches!(out, Delivery::Introduced(_)));
        assert_eq!(
            f.storage.get_peer(f.bob).unwrap().unwrap().display_name,
            "Robert"
        );
    }

    #[test]
    fn garbage_is_dropped() {
        let mut f = fixture();
        let out = f
            .dm
            .on_data(&mut f.storage, f.me, f.bob, b"\xff\xfe", Utc::now())
            .unwrap();
        assert_eq!(out, Delivery::Dropped(DropReason::Unrecognized));
    }

    #[test]
    fn closed_subscribers_are_pruned() {
        let mut f = fixture();
        let key = ConversationKey::new(f.me, f.bob);
        let rx = f.dm.subscribe(key);
        drop(rx);
        let bytes = codec::encode_envelope(&Envelope::text("x")).unwrap();
        f.dm.on_data(&mut f.storage, f.me, f.bob, &bytes, Utc::now())
            .unwrap();
        assert_eq!(f.dm.subscriber_count(&key), 0);
    }
}
