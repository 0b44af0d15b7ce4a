//! Message transport: encode once, send over each recipient's session.
//!
//! Multicast is non-atomic: recipients already sent to are not rolled back when a later
//! sub-send fails (at-least-once delivery; the receiver dedups by message id).

use std::collections::BTreeSet;

use crate::codec;
use crate::identity::{PeerId, PeerIdentity};
use crate::primitive::{Reliability, SessionId, SessionState, Transport};
use crate::protocol::{Envelope, Introduction};
use crate::session::SessionMap;

/// Send `envelope` to every recipient. False if encoding fails, a recipient has no connected
/// session, or any underlying send fails. Nothing reaches the network in the first two cases.
pub fn send_envelope<T: Transport>(
    transport: &mut T,
    sessions: &SessionMap,
    envelope: &Envelope,
    recipients: &BTreeSet<PeerId>,
) -> bool {
    let bytes = match codec::encode_envelope(envelope) {
        Ok(b) => b,
        Err(e) => {
            tracing::error!(message = %envelope.message_id, "failed to encode envelope: {}", e);
            return false;
        }
    };
    send_encoded(transport, sessions, &bytes, recipients)
}

/// Send the local identity to `peer` over its session. Safe to repeat.
pub fn send_introduction<T: Transport>(
    transport: &mut T,
    sessions: &SessionMap,
    local: &PeerIdentity,
    peer: PeerId,
) -> bool {
    let bytes = match codec::encode_introduction(&Introduction::from(local)) {
        Ok(b) => b,
        Err(e) => {
            tracing::error!("failed to encode self introduction: {}", e);
            return false;
        }
    };
    let sent = send_encoded(transport, sessions, &bytes, &BTreeSet::from([peer]));
    if sent {
        tracing::debug!(peer = %peer, "self introduction sent");
    }
    sent
}

fn send_encoded<T: Transport>(
    transport: &mut T,
    sessions: &SessionMap,
    bytes: &[u8],
    recipients: &BTreeSet<PeerId>,
) -> bool {
    if recipients.is_empty() {
        tracing::warn!("send with no recipients");
        return false;
    }
    let mut routes: Vec<(PeerId, SessionId)> = Vec::with_capacity(recipients.len());
    for &peer in recipients {
        match sessions.get(peer) {
            Some(s) if s.state == SessionState::Connected => routes.push((peer, s.id)),
            _ => {
                tracing::warn!(peer = %peer, "no connected session for recipient");
                return false;
            }
        }
    }
    let mut all_sent = true;
    for (peer, session) in routes {
        if let Err(e) = transport.send(session, bytes, &[peer], Reliability::Reliable) {
            tracing::warn!(peer = %peer, %session, "send failed: {}", e);
            all_sent = false;
        }
    }
    all_sent
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{Call, RecordingTransport};

    fn connected(peers: &[PeerId]) -> SessionMap {
        let mut map = SessionMap::new();
        for (i, &p) in peers.iter().enumerate() {
            map.bind(p, SessionId(i as u64 + 1)).unwrap();
            map.set_state(p, SessionState::Connected);
        }
        map
    }

    #[test]
    fn sends_once_per_recipient() {
        let (b, c) = (PeerId::generate(), PeerId::generate());
        let sessions = connected(&[b, c]);
        let mut transport = RecordingTransport::new();
        let env = Envelope::text("hello");
        assert!(send_envelope(
            &mut transport,
            &sessions,
            &env,
            &BTreeSet::from([b, c])
        ));
        let sends = transport.sends();
        assert_eq!(sends.len(), 2);
        assert_eq!(sends[0].1, sends[1].1);
        let decoded = codec::decode_envelope(&sends[0].1).unwrap();
        assert_eq!(decoded, env);
    }

    #[test]
    fn missing_session_sends_nothing() {
        let (b, c) = (PeerId::generate(), PeerId::generate());
        let sessions = connected(&[b]);
        let mut transport = RecordingTransport::new();
        assert!(!send_envelope(
            &mut transport,
            &sessions,
            &Envelope::text("x"),
            &BTreeSet::from([b, c])
        ));
        assert!(transport.sends().is_empty());
    }

    #[test]
    fn connecting_session_is_not_usable() {
        let b = PeerId::generate();
        let mut sessions = SessionMap::new();
        sessions.bind(b, SessionId(9)).unwrap();
        let mut transport = RecordingTransport::new();
        assert!(!send_envelope(
            &mut transport,
            &sessions,
            &Envelope::text("x"),
            &BTreeSet::from([b])
        ));
    }

    #[test]
    fn encode_failure_never_reaches_send() {
        let b = PeerId::generate();
        let sessions = connected(&[b]);
        let mut transport = RecordingTransport::new();
        let huge = Envelope::image(vec![0u8; 16 * 1024 * 1024]);
        assert!(!send_envelope(
            &mut transport,
            &sessions,
            &huge,
            &BTreeSet::from([b])
        ));
        assert!(transport.calls().is_empty());
    }

    #[test]
    fn partial_failure_is_not_rolled_back() {
        let (b, c) = (PeerId::generate(), PeerId::generate());
        let sessions = connected(&[b, c]);
        let mut transport = RecordingTransport::new();
        transport.fail_sends_to(b);
        assert!(!send_envelope(
            &mut transport,
            &sessions,
            &Envelope::text("x"),
            &BTreeSet::from([b, c])
        ));
        let sends = transport.sends();
        assert_eq!(sends.len(), 1);
        assert_eq!(sends[0].2, vec![c]);
    }

    #[test]
    fn empty_recipients_fail() {
        let mut transport = RecordingTransport::new();
        assert!(!send_envelope(
            &mut transport,
            &SessionMap::new(),
            &Envelope::text("x"),
            &BTreeSet::new()
        ));
    }

    #[test]
    fn introduction_carries_local_identity() {
        let b = PeerId::generate();
        let sessions = connected(&[b]);
        let mut transport = RecordingTransport::new();
        let me = PeerIdentity::new(PeerId::generate(), "Me").with_avatar(vec![9, 9]);
        assert!(send_introduction(&mut transport, &sessions, &me, b));
        assert!(send_introduction(&mut transport, &sessions, &me, b));
        let calls = transport.calls();
        assert_eq!(calls.len(), 2);
        match &calls[0] {
            Call::Send { bytes, .. } => {
                let intro = codec::decode_introduction(bytes).unwrap();
                assert_eq!(PeerIdentity::from(intro), me);
            }
            other => panic!("expected Send, got {:?}", other),
        }
    }
}
