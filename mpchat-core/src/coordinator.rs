//! Host-driven session coordinator: the host feeds platform callbacks and application calls in,
//! the coordinator drives the transport and returns timers and notifications for the host.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;

use crate::delivery::{Delivery, DeliveryManager};
use crate::identity::{ConversationKey, PeerId, PeerIdentity};
use crate::primitive::{DiscoveryRole, SessionId, SessionState, Transport, TransportError};
use crate::protocol::{Envelope, DEFAULT_SERVICE_ID};
use crate::registry::{BrowsedPeer, PeerRegistry, PeerStatus};
use crate::session::SessionMap;
use crate::storage::{MessageRecord, Storage, DEFAULT_PAGE_SIZE};
use crate::store::{RecordStore, StoreError};
use crate::transport;

/// Default bound on an outstanding invite.
pub const DEFAULT_INVITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default delay before discovery restarts after a session-affecting event.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub service_id: String,
    pub invite_timeout: Duration,
    pub settle_delay: Duration,
    pub page_size: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            service_id: DEFAULT_SERVICE_ID.to_string(),
            invite_timeout: DEFAULT_INVITE_TIMEOUT,
            settle_delay: DEFAULT_SETTLE_DELAY,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

/// Platform callbacks, marshaled by the host into one serialized inbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    PeerFound {
        peer: PeerId,
        display_name: String,
    },
    PeerLost {
        peer: PeerId,
    },
    InvitationReceived {
        peer: PeerId,
        display_name: String,
    },
    /// `connected` is the session's current set of connected peers.
    SessionStateChanged {
        peer: PeerId,
        session: SessionId,
        state: SessionState,
        connected: Vec<PeerId>,
    },
    DataReceived {
        peer: PeerId,
        bytes: Vec<u8>,
    },
    DiscoveryFailed {
        role: DiscoveryRole,
        reason: String,
    },
    Timer(Timer),
}

/// Timer the host must fire back as `Event::Timer` after the requested delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Timer {
    ResumeDiscovery,
    InviteTimeout { peer: PeerId, attempt: u64 },
}

/// Work for the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Output {
    Schedule { after: Duration, timer: Timer },
    Notify(Notification),
}

/// Observable changes for the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    DiscoveryStartFailed { role: DiscoveryRole, reason: String },
    PeerFound { peer: PeerId },
    PeerLost { peer: PeerId },
    InvitationReceived { peer: PeerId, display_name: String },
    PeerConnected { peer: PeerId },
    CouldNotConnect { peer: PeerId, failure: ConnectFailure },
    PeerRemoved { peer: PeerId },
    PeerIntroduced(PeerIdentity),
    MessageStored(MessageRecord),
    PersistenceFailed { reason: String },
}

/// Why a connection attempt or session ended. Transient; the caller may retry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectFailure {
    #[error("invite timed out")]
    Timeout,
    #[error("peer declined or disconnected")]
    NotConnected,
}

/// Error returned by an application call that could not be started.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectError {
    #[error("unknown peer {0}")]
    UnknownPeer(PeerId),
    #[error("a session or invite already exists for peer {0}")]
    InProgress(PeerId),
    #[error("peer {peer} is {status}, not available")]
    NotAvailable { peer: PeerId, status: PeerStatus },
    #[error("no pending invitation")]
    NoPendingInvitation,
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invitation {
    pub peer: PeerId,
    pub display_name: String,
}

/// Handshake in flight for a peer: an invite we sent, or an invitation we accepted.
#[derive(Debug, Clone, Copy)]
struct Handshake {
    attempt: u64,
    outbound: bool,
}

/// Main coordinator. Owns the session map, peer registry, delivery manager and storage.
pub struct SessionCoordinator<T, S> {
    local: PeerIdentity,
    settings: Settings,
    transport: T,
    storage: Storage<S>,
    registry: PeerRegistry,
    sessions: SessionMap,
    delivery: DeliveryManager,
    discovery_wanted: bool,
    advertising: bool,
    browsing: bool,
    handshakes: HashMap<PeerId, Handshake>,
    next_attempt: u64,
    invitations: VecDeque<Invitation>,
    /// Peers we invited at least once; candidates for re-invite after a disconnect.
    known: BTreeSet<PeerId>,
    /// Peers re-invited since they last connected. One opportunistic re-invite each.
    reinvited: HashSet<PeerId>,
    page_cursor: HashMap<PeerId, usize>,
}

impl<T: Transport, S: RecordStore> SessionCoordinator<T, S> {
    pub fn new(local: PeerIdentity, transport: T, store: S) -> Self {
        Self::with_settings(local, transport, store, Settings::default())
    }

    pub fn with_settings(local: PeerIdentity, transport: T, store: S, settings: Settings) -> Self {
        let storage = Storage::with_page_size(store, settings.page_size);
        Self {
            local,
            settings,
            transport,
            storage,
            registry: PeerRegistry::new(),
            sessions: SessionMap::new(),
            delivery: DeliveryManager::new(),
            discovery_wanted: false,
            advertising: false,
            browsing: false,
            handshakes: HashMap::new(),
            next_attempt: 0,
            invitations: VecDeque::new(),
            known: BTreeSet::new(),
            reinvited: HashSet::new(),
            page_cursor: HashMap::new(),
        }
    }

    pub fn local(&self) -> &PeerIdentity {
        &self.local
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn storage(&self) -> &Storage<S> {
        &self.storage
    }

    pub fn peers(&self) -> Vec<BrowsedPeer> {
        self.registry.iter().cloned().collect()
    }

    pub fn status(&self, peer: PeerId) -> Option<PeerStatus> {
        self.registry.status(peer)
    }

    pub fn has_session(&self, peer: PeerId) -> bool {
        self.sessions.get(peer).is_some()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn pending_invitation(&self) -> Option<&Invitation> {
        self.invitations.front()
    }

    pub fn is_advertising(&self) -> bool {
        self.advertising
    }

    pub fn is_browsing(&self) -> bool {
        self.browsing
    }

    pub fn known_peers(&self) -> Result<Vec<PeerIdentity>, StoreError> {
        self.storage.list_peers()
    }

    // ==================== Discovery ====================

    /// Start advertising and browsing. No-op while already started.
    pub fn start_discovery(&mut self) -> Vec<Output> {
        let mut out = Vec::new();
        if self.discovery_wanted {
            return out;
        }
        self.discovery_wanted = true;
        tracing::info!(service = %self.settings.service_id, "starting discovery");
        if !self.advertising {
            match self.transport.advertise(&self.settings.service_id) {
                Ok(()) => self.advertising = true,
                Err(e) => {
                    self.discovery_failed(DiscoveryRole::Advertiser, e.to_string(), &mut out);
                    return out;
                }
            }
        }
        self.start_browsing(&mut out);
        out
    }

    /// Stop advertising and browsing. No-op while already stopped.
    pub fn stop_discovery(&mut self) -> Vec<Output> {
        if !self.discovery_wanted && !self.advertising && !self.browsing {
            return Vec::new();
        }
        tracing::info!("stopping discovery");
        self.halt_discovery();
        Vec::new()
    }

    fn halt_discovery(&mut self) {
        self.discovery_wanted = false;
        if self.advertising {
            self.transport.stop_advertise();
            self.advertising = false;
        }
        self.pause_browsing();
    }

    fn browse_blocked(&self) -> bool {
        self.handshakes.values().any(|h| h.outbound) || !self.invitations.is_empty()
    }

    fn start_browsing(&mut self, out: &mut Vec<Output>) {
        if self.browsing || !self.discovery_wanted || self.browse_blocked() {
            return;
        }
        match self.transport.browse(&self.settings.service_id) {
            Ok(()) => {
                self.browsing = true;
                tracing::debug!("browsing started");
            }
            Err(e) => self.discovery_failed(DiscoveryRole::Browser, e.to_string(), out),
        }
    }

    fn pause_browsing(&mut self) {
        if self.browsing {
            self.transport.stop_browse();
            self.browsing = false;
            tracing::debug!("browsing paused");
        }
    }

    fn schedule_resume(&self, out: &mut Vec<Output>) {
        out.push(Output::Schedule {
            after: self.settings.settle_delay,
            timer: Timer::ResumeDiscovery,
        });
    }

    /// Terminal for this attempt: stop whatever did start and surface the failure once.
    fn discovery_failed(&mut self, role: DiscoveryRole, reason: String, out: &mut Vec<Output>) {
        if !self.discovery_wanted {
            tracing::debug!(%role, "ignoring discovery failure after stop: {}", reason);
            return;
        }
        tracing::error!(%role, "discovery failed to start: {}", reason);
        self.halt_discovery();
        out.push(Output::Notify(Notification::DiscoveryStartFailed { role, reason }));
    }

    // ==================== Handshake ====================

    /// Invite an available peer. A second call before the first resolves creates no session.
    pub fn connect(&mut self, peer: PeerId) -> Result<Vec<Output>, ConnectError> {
        let mut out = Vec::new();
        self.invite(peer, &mut out)?;
        self.reinvited.remove(&peer);
        Ok(out)
    }

    fn invite(&mut self, peer: PeerId, out: &mut Vec<Output>) -> Result<(), ConnectError> {
        let status = self
            .registry
            .status(peer)
            .ok_or(ConnectError::UnknownPeer(peer))?;
        if self.handshakes.contains_key(&peer) || self.sessions.get(peer).is_some() {
            return Err(ConnectError::InProgress(peer));
        }
        if status != PeerStatus::Available {
            return Err(ConnectError::NotAvailable { peer, status });
        }
        let session = self.transport.create_session();
        if let Err(e) = self
            .transport
            .invite(peer, session, self.settings.invite_timeout)
        {
            tracing::warn!(peer = %peer, "invite failed: {}", e);
            self.transport.close_session(session);
            return Err(ConnectError::Transport(e));
        }
        if let Err(existing) = self.sessions.bind(peer, session) {
            tracing::warn!(peer = %peer, %existing, "session appeared during invite");
            self.transport.close_session(session);
            return Err(ConnectError::InProgress(peer));
        }
        self.set_status(peer, PeerStatus::Connecting);
        self.known.insert(peer);
        self.withdraw_invitation(peer);
        let attempt = self.begin_handshake(peer, true);
        self.pause_browsing();
        tracing::info!(peer = %peer, %session, "invite sent");
        out.push(Output::Schedule {
            after: self.settings.invite_timeout,
            timer: Timer::InviteTimeout { peer, attempt },
        });
        Ok(())
    }

    /// Decline a queued invitation from `peer`; our own invite supersedes it.
    fn withdraw_invitation(&mut self, peer: PeerId) {
        let before = self.invitations.len();
        self.invitations.retain(|i| i.peer != peer);
        if self.invitations.len() != before {
            self.transport.respond_to_invitation(peer, None);
            tracing::debug!(peer = %peer, "pending invitation withdrawn");
        }
    }

    fn begin_handshake(&mut self, peer: PeerId, outbound: bool) -> u64 {
        self.next_attempt = self.next_attempt.wrapping_add(1);
        let attempt = self.next_attempt;
        self.handshakes.insert(peer, Handshake { attempt, outbound });
        attempt
    }

    /// Accept the oldest pending invitation. An invitation from a peer that already has a session
    /// is declined instead, and the outputs of resuming discovery are still returned.
    pub fn accept(&mut self) -> Result<Vec<Output>, ConnectError> {
        let invitation = self
            .invitations
            .pop_front()
            .ok_or(ConnectError::NoPendingInvitation)?;
        let peer = invitation.peer;
        let mut out = Vec::new();
        if self.sessions.get(peer).is_some() || self.handshakes.contains_key(&peer) {
            tracing::warn!(peer = %peer, "declining invitation: session already exists");
            self.transport.respond_to_invitation(peer, None);
            self.start_browsing(&mut out);
            return Ok(out);
        }
        let session = self.transport.create_session();
        self.transport.respond_to_invitation(peer, Some(session));
        if self.sessions.bind(peer, session).is_err() {
            self.transport.close_session(session);
            return Err(ConnectError::InProgress(peer));
        }
        if !self.registry.contains(peer) {
            self.registry
                .insert_if_absent(peer, &invitation.display_name, PeerStatus::Available);
        }
        self.set_status(peer, PeerStatus::Connecting);
        let attempt = self.begin_handshake(peer, false);
        tracing::info!(peer = %peer, %session, "invitation accepted");
        out.push(Output::Schedule {
            after: self.settings.invite_timeout,
            timer: Timer::InviteTimeout { peer, attempt },
        });
        self.schedule_resume(&mut out);
        Ok(out)
    }

    /// Decline the oldest pending invitation. The peer stays available.
    pub fn decline(&mut self) -> Result<Vec<Output>, ConnectError> {
        let invitation = self
            .invitations
            .pop_front()
            .ok_or(ConnectError::NoPendingInvitation)?;
        self.transport.respond_to_invitation(invitation.peer, None);
        tracing::info!(peer = %invitation.peer, "invitation declined");
        let mut out = Vec::new();
        self.start_browsing(&mut out);
        Ok(out)
    }

    /// Re-send the self-introduction over the peer's session.
    pub fn send_introduction(&mut self, peer: PeerId) -> bool {
        transport::send_introduction(&mut self.transport, &self.sessions, &self.local, peer)
    }

    // ==================== Removal ====================

    /// Forget a peer: session, discovery entry, pending state and persisted identity.
    pub fn remove_peer(&mut self, peer: PeerId) -> Result<Vec<Output>, StoreError> {
        self.storage.remove_peer(peer)?;
        let mut out = Vec::new();
        self.forget(peer);
        out.push(Output::Notify(Notification::PeerRemoved { peer }));
        self.pause_browsing();
        self.schedule_resume(&mut out);
        Ok(out)
    }

    pub fn remove_all_peers(&mut self) -> Result<Vec<Output>, StoreError> {
        let persisted: Vec<PeerId> = self.storage.list_peers()?.iter().map(|p| p.id).collect();
        self.storage.remove_all_peers()?;
        let mut ids: BTreeSet<PeerId> = persisted.into_iter().collect();
        ids.extend(self.registry.ids());
        ids.extend(self.sessions.peers());
        ids.extend(self.invitations.iter().map(|i| i.peer));
        let mut out = Vec::new();
        for peer in ids {
            self.forget(peer);
            out.push(Output::Notify(Notification::PeerRemoved { peer }));
        }
        self.pause_browsing();
        self.schedule_resume(&mut out);
        Ok(out)
    }

    fn forget(&mut self, peer: PeerId) {
        self.teardown(peer);
        self.withdraw_invitation(peer);
        self.known.remove(&peer);
        self.reinvited.remove(&peer);
        self.page_cursor.remove(&peer);
        self.registry.remove(peer);
        tracing::info!(peer = %peer, "peer removed");
    }

    /// Close the peer's session (if any) and drop its handshake.
    fn teardown(&mut self, peer: PeerId) {
        self.handshakes.remove(&peer);
        if let Some(session) = self.sessions.unbind(peer) {
            self.transport.close_session(session.id);
            tracing::debug!(peer = %peer, session = %session.id, "session closed");
        }
    }

    // ==================== Messaging ====================

    /// Send an envelope to every recipient's session. See [`transport::send_envelope`].
    pub fn send(&mut self, envelope: &Envelope, recipients: &BTreeSet<PeerId>) -> bool {
        transport::send_envelope(&mut self.transport, &self.sessions, envelope, recipients)
    }

    pub fn send_text(
        &mut self,
        text: &str,
        recipients: &BTreeSet<PeerId>,
    ) -> Result<Option<MessageRecord>, StoreError> {
        self.send_user(Envelope::text(text), recipients)
    }

    pub fn send_image(
        &mut self,
        image: Vec<u8>,
        recipients: &BTreeSet<PeerId>,
    ) -> Result<Option<MessageRecord>, StoreError> {
        self.send_user(Envelope::image(image), recipients)
    }

    /// Send, then persist and publish the sent message. None when the send failed.
    fn send_user(
        &mut self,
        envelope: Envelope,
        recipients: &BTreeSet<PeerId>,
    ) -> Result<Option<MessageRecord>, StoreError> {
        if !self.send(&envelope, recipients) {
            return Ok(None);
        }
        let record = MessageRecord {
            id: envelope.message_id,
            payload: envelope.data,
            content_type: envelope.content_type,
            timestamp: Utc::now(),
            sender: self.local.id,
            receivers: recipients.iter().copied().collect(),
        };
        self.delivery.record(&mut self.storage, record.clone())?;
        Ok(Some(record))
    }

    /// Next history page of the conversation with `peer`. The cursor advances once per non-empty page.
    pub fn load_more_messages(&mut self, peer: PeerId) -> Result<Vec<MessageRecord>, StoreError> {
        let page = self.page_cursor.get(&peer).copied().unwrap_or(0);
        let messages = self.storage.query_messages(self.local.id, peer, page)?;
        if !messages.is_empty() {
            self.page_cursor.insert(peer, page + 1);
        }
        Ok(messages)
    }

    /// Delete the whole message history. Paging starts over from the oldest page.
    pub fn remove_all_messages(&mut self) -> Result<usize, StoreError> {
        let removed = self.storage.remove_all_messages()?;
        self.page_cursor.clear();
        tracing::info!(removed, "message history cleared");
        Ok(removed)
    }

    /// Stream of records stored from now on for the conversation with `peer`.
    pub fn subscribe(&mut self, peer: PeerId) -> mpsc::UnboundedReceiver<MessageRecord> {
        self.delivery
            .subscribe(ConversationKey::new(self.local.id, peer))
    }

    // ==================== Events ====================

    /// Process one platform callback.
    pub fn handle(&mut self, event: Event) -> Vec<Output> {
        let mut out = Vec::new();
        match event {
            Event::PeerFound { peer, display_name } => self.on_found(peer, &display_name, &mut out),
            Event::PeerLost { peer } => self.on_lost(peer, &mut out),
            Event::InvitationReceived { peer, display_name } => {
                self.on_invitation(peer, display_name, &mut out)
            }
            Event::SessionStateChanged {
                peer,
                session,
                state,
                connected,
            } => match state {
                SessionState::Connecting => self.on_connecting(peer, session),
                SessionState::Connected => self.on_connected(peer, session, &mut out),
                SessionState::NotConnected => {
                    if self.sessions.is_bound_to(peer, session) {
                        self.connection_failed(peer, ConnectFailure::NotConnected, &connected, &mut out);
                    } else {
                        tracing::debug!(peer = %peer, %session, "stale not-connected report ignored");
                    }
                }
            },
            Event::DataReceived { peer, bytes } => self.on_data(peer, &bytes, &mut out),
            Event::DiscoveryFailed { role, reason } => self.discovery_failed(role, reason, &mut out),
            Event::Timer(Timer::ResumeDiscovery) => self.start_browsing(&mut out),
            Event::Timer(Timer::InviteTimeout { peer, attempt }) => {
                let current = self.handshakes.get(&peer).map(|h| h.attempt);
                if current == Some(attempt) {
                    tracing::warn!(peer = %peer, "invite timed out");
                    self.connection_failed(peer, ConnectFailure::Timeout, &[], &mut out);
                }
            }
        }
        out
    }

    fn set_status(&mut self, peer: PeerId, next: PeerStatus) {
        if let Err(e) = self.registry.set_status(peer, next) {
            tracing::warn!("{}", e);
        }
    }

    fn initial_status(&self, peer: PeerId) -> PeerStatus {
        match self.sessions.get(peer).map(|s| s.state) {
            Some(SessionState::Connected) => PeerStatus::Connected,
            Some(_) => PeerStatus::Connecting,
            None => PeerStatus::Available,
        }
    }

    fn on_found(&mut self, peer: PeerId, display_name: &str, out: &mut Vec<Output>) {
        if peer == self.local.id {
            return;
        }
        let initial = self.initial_status(peer);
        if self.registry.insert_if_absent(peer, display_name, initial) {
            tracing::info!(peer = %peer, name = %display_name, status = %initial, "peer found");
            out.push(Output::Notify(Notification::PeerFound { peer }));
        }
    }

    fn on_lost(&mut self, peer: PeerId, out: &mut Vec<Output>) {
        if let Some(invitation) = self.invitations.iter().find(|i| i.peer == peer) {
            tracing::info!(peer = %peer, "lost peer has a pending invitation; asking again");
            out.push(Output::Notify(Notification::InvitationReceived {
                peer,
                display_name: invitation.display_name.clone(),
            }));
            return;
        }
        let had_session = self.sessions.get(peer).is_some();
        let was_listed = self.registry.remove(peer).is_some();
        if !had_session && !was_listed {
            return;
        }
        tracing::info!(peer = %peer, "peer lost");
        self.teardown(peer);
        self.page_cursor.remove(&peer);
        out.push(Output::Notify(Notification::PeerLost { peer }));
        self.pause_browsing();
        self.schedule_resume(out);
    }

    fn on_invitation(&mut self, peer: PeerId, display_name: String, out: &mut Vec<Output>) {
        if self.sessions.get(peer).is_some() || self.handshakes.contains_key(&peer) {
            tracing::info!(peer = %peer, "declining invitation: session already exists");
            self.transport.respond_to_invitation(peer, None);
            return;
        }
        tracing::info!(peer = %peer, name = %display_name, "invitation received");
        self.pause_browsing();
        if !self.registry.contains(peer) {
            self.registry
                .insert_if_absent(peer, &display_name, PeerStatus::Available);
        }
        if !self.invitations.iter().any(|i| i.peer == peer) {
            self.invitations.push_back(Invitation {
                peer,
                display_name: display_name.clone(),
            });
        }
        out.push(Output::Notify(Notification::InvitationReceived { peer, display_name }));
    }

    fn on_connecting(&mut self, peer: PeerId, session: SessionId) {
        if !self.sessions.is_bound_to(peer, session) {
            tracing::debug!(peer = %peer, %session, "connecting report for unknown session ignored");
            return;
        }
        self.sessions.set_state(peer, SessionState::Connecting);
        match self.registry.status(peer) {
            Some(PeerStatus::Available) => self.set_status(peer, PeerStatus::Connecting),
            Some(PeerStatus::Connected) => {
                tracing::debug!(peer = %peer, "connecting report for connected peer ignored")
            }
            _ => {}
        }
    }

    fn on_connected(&mut self, peer: PeerId, session: SessionId, out: &mut Vec<Output>) {
        if !self.sessions.is_bound_to(peer, session) {
            if let Err(existing) = self.sessions.bind(peer, session) {
                tracing::warn!(peer = %peer, %session, %existing, "closing duplicate session");
                self.transport.close_session(session);
                return;
            }
        }
        self.sessions.set_state(peer, SessionState::Connected);
        self.handshakes.remove(&peer);
        self.reinvited.remove(&peer);
        match self.registry.status(peer) {
            None => {
                let name = self.display_name_for(peer);
                self.registry
                    .insert_if_absent(peer, &name, PeerStatus::Connected);
            }
            Some(PeerStatus::Available) => {
                self.set_status(peer, PeerStatus::Connecting);
                self.set_status(peer, PeerStatus::Connected);
            }
            Some(PeerStatus::Connecting) => self.set_status(peer, PeerStatus::Connected),
            Some(PeerStatus::Connected) => {}
        }
        tracing::info!(peer = %peer, %session, "peer connected");
        if !self.send_introduction(peer) {
            tracing::warn!(peer = %peer, "self introduction not sent; caller may retry");
        }
        out.push(Output::Notify(Notification::PeerConnected { peer }));
        self.schedule_resume(out);
    }

    /// Tear down the peer's session, revert it to available, notify, then re-invite known peers.
    fn connection_failed(
        &mut self,
        peer: PeerId,
        failure: ConnectFailure,
        connected: &[PeerId],
        out: &mut Vec<Output>,
    ) {
        self.teardown(peer);
        if matches!(
            self.registry.status(peer),
            Some(PeerStatus::Connecting | PeerStatus::Connected)
        ) {
            self.set_status(peer, PeerStatus::Available);
        }
        tracing::info!(peer = %peer, "could not connect: {}", failure);
        out.push(Output::Notify(Notification::CouldNotConnect { peer, failure }));
        self.reinvite_known(peer, connected, out);
        self.schedule_resume(out);
    }

    fn reinvite_known(&mut self, failed: PeerId, connected: &[PeerId], out: &mut Vec<Output>) {
        let candidates: Vec<PeerId> = self
            .known
            .iter()
            .copied()
            .filter(|p| {
                *p != failed
                    && !connected.contains(p)
                    && !self.reinvited.contains(p)
                    && self.registry.status(*p) == Some(PeerStatus::Available)
                    && self.sessions.get(*p).is_none()
                    && !self.handshakes.contains_key(p)
            })
            .collect();
        for peer in candidates {
            self.reinvited.insert(peer);
            match self.invite(peer, out) {
                Ok(()) => tracing::info!(peer = %peer, "re-invited known peer"),
                Err(e) => tracing::debug!(peer = %peer, "re-invite skipped: {}", e),
            }
        }
    }

    fn display_name_for(&self, peer: PeerId) -> String {
        match self.storage.get_peer(peer) {
            Ok(Some(identity)) => identity.display_name,
            _ => String::new(),
        }
    }

    fn on_data(&mut self, peer: PeerId, bytes: &[u8], out: &mut Vec<Output>) {
        let result = self
            .delivery
            .on_data(&mut self.storage, self.local.id, peer, bytes, Utc::now());
        match result {
            Ok(Delivery::Stored(record)) => {
                out.push(Output::Notify(Notification::MessageStored(record)))
            }
            Ok(Delivery::Introduced(identity)) => {
                self.registry.rename(peer, &identity.display_name);
                out.push(Output::Notify(Notification::PeerIntroduced(identity)));
            }
            Ok(Delivery::Duplicate(_)) | Ok(Delivery::Dropped(_)) => {}
            Err(e) => {
                tracing::error!(peer = %peer, "failed to persist inbound payload: {}", e);
                out.push(Output::Notify(Notification::PersistenceFailed {
                    reason: e.to_string(),
                }));
            }
        }
    }
}
