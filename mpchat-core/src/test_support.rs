//! Test support: an in-process [`Transport`] that records every call and can be told to fail.
//!
//! Clones share one log, so a test can keep a handle while the coordinator owns the other.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::identity::PeerId;
use crate::primitive::{DiscoveryRole, Reliability, SessionId, Transport, TransportError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Advertise(String),
    StopAdvertise,
    Browse(String),
    StopBrowse,
    CreateSession(SessionId),
    Invite {
        peer: PeerId,
        session: SessionId,
        timeout: Duration,
    },
    Respond {
        peer: PeerId,
        session: Option<SessionId>,
    },
    Send {
        session: SessionId,
        bytes: Vec<u8>,
        recipients: Vec<PeerId>,
    },
    CloseSession(SessionId),
}

#[derive(Debug, Default)]
struct Log {
    calls: Vec<Call>,
    next_session: u64,
    fail_advertise: Option<String>,
    fail_browse: Option<String>,
    fail_invite: Option<String>,
    fail_send_to: HashSet<PeerId>,
}

#[derive(Debug, Clone, Default)]
pub struct RecordingTransport {
    log: Arc<Mutex<Log>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn log(&self) -> MutexGuard<'_, Log> {
        self.log.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn calls(&self) -> Vec<Call> {
        self.log().calls.clone()
    }

    /// Return and forget the calls recorded so far.
    pub fn take_calls(&self) -> Vec<Call> {
        std::mem::take(&mut self.log().calls)
    }

    pub fn sends(&self) -> Vec<(SessionId, Vec<u8>, Vec<PeerId>)> {
        self.log()
            .calls
            .iter()
            .filter_map(|c| match c {
                Call::Send {
                    session,
                    bytes,
                    recipients,
                } => Some((*session, bytes.clone(), recipients.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn invites(&self) -> Vec<(PeerId, SessionId)> {
        self.log()
            .calls
            .iter()
            .filter_map(|c| match c {
                Call::Invite { peer, session, .. } => Some((*peer, *session)),
                _ => None,
            })
            .collect()
    }

    pub fn sessions_created(&self) -> usize {
        self.log()
            .calls
            .iter()
            .filter(|c| matches!(c, Call::CreateSession(_)))
            .count()
    }

    pub fn fail_advertise(&self, reason: &str) {
        self.log().fail_advertise = Some(reason.to_string());
    }

    pub fn fail_browse(&self, reason: &str) {
        self.log().fail_browse = Some(reason.to_string());
    }

    pub fn fail_invite(&self, reason: &str) {
        self.log().fail_invite = Some(reason.to_string());
    }

    pub fn fail_sends_to(&self, peer: PeerId) {
        self.log().fail_send_to.insert(peer);
    }

    pub fn clear_failures(&self) {
        let mut log = self.log();
        log.fail_advertise = None;
        log.fail_browse = None;
        log.fail_invite = None;
        log.fail_send_to.clear();
    }
}

impl Transport for RecordingTransport {
    fn advertise(&mut self, service_id: &str) -> Result<(), TransportError> {
        let mut log = self.log();
        if let Some(reason) = log.fail_advertise.clone() {
            return Err(TransportError::Start {
                role: DiscoveryRole::Advertiser,
                reason,
            });
        }
        log.calls.push(Call::Advertise(service_id.to_string()));
        Ok(())
    }

    fn stop_advertise(&mut self) {
        self.log().calls.push(Call::StopAdvertise);
    }

    fn browse(&mut self, service_id: &str) -> Result<(), TransportError> {
        let mut log = self.log();
        if let Some(reason) = log.fail_browse.clone() {
            return Err(TransportError::Start {
                role: DiscoveryRole::Browser,
                reason,
            });
        }
        log.calls.push(Call::Browse(service_id.to_string()));
        Ok(())
    }

    fn stop_browse(&mut self) {
        self.log().calls.push(Call::StopBrowse);
    }

    fn create_session(&mut self) -> SessionId {
        let mut log = self.log();
        log.next_session += 1;
        let id = SessionId(log.next_session);
        log.calls.push(Call::CreateSession(id));
        id
    }

    fn invite(
        &mut self,
        peer: PeerId,
        session: SessionId,
        timeout: Duration,
    ) -> Result<(), TransportError> {
        let mut log = self.log();
        if let Some(reason) = log.fail_invite.clone() {
            return Err(TransportError::Invite(reason));
        }
        log.calls.push(Call::Invite {
            peer,
            session,
            timeout,
        });
        Ok(())
    }

    fn respond_to_invitation(&mut self, peer: PeerId, session: Option<SessionId>) {
        self.log().calls.push(Call::Respond { peer, session });
    }

    fn send(
        &mut self,
        session: SessionId,
        bytes: &[u8],
        recipients: &[PeerId],
        _reliability: Reliability,
    ) -> Result<(), TransportError> {
        let mut log = self.log();
        if let Some(peer) = recipients.iter().find(|p| log.fail_send_to.contains(p)) {
            return Err(TransportError::Send(format!("peer {} unreachable", peer)));
        }
        log.calls.push(Call::Send {
            session,
            bytes: bytes.to_vec(),
            recipients: recipients.to_vec(),
        });
        Ok(())
    }

    fn close_session(&mut self, session: SessionId) {
        self.log().calls.push(Call::CloseSession(session));
    }
}
