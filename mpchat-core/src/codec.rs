//! Payload codec: JSON encoding of envelopes and introductions, shape-based inbound classification.

use crate::protocol::{Envelope, Introduction};

const MAX_PAYLOAD_LEN: usize = 16 * 1024 * 1024; // 16 MiB

/// Encode an envelope into the bytes handed to the session.
pub fn encode_envelope(envelope: &Envelope) -> Result<Vec<u8>, EncodeError> {
    checked(serde_json::to_vec(envelope)?)
}

/// Encode a self-introduction. Sent bare, not wrapped in an envelope.
pub fn encode_introduction(intro: &Introduction) -> Result<Vec<u8>, EncodeError> {
    checked(serde_json::to_vec(intro)?)
}

fn checked(bytes: Vec<u8>) -> Result<Vec<u8>, EncodeError> {
    if bytes.len() > MAX_PAYLOAD_LEN {
        return Err(EncodeError::TooLarge(bytes.len()));
    }
    Ok(bytes)
}

/// Error encoding a payload (serialization or size limit).
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("encode error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("payload too large ({0} bytes)")]
    TooLarge(usize),
}

pub fn decode_envelope(bytes: &[u8]) -> Result<Envelope, DecodeError> {
    if bytes.len() > MAX_PAYLOAD_LEN {
        return Err(DecodeError::TooLarge(bytes.len()));
    }
    Ok(serde_json::from_slice(bytes)?)
}

pub fn decode_introduction(bytes: &[u8]) -> Result<Introduction, DecodeError> {
    if bytes.len() > MAX_PAYLOAD_LEN {
        return Err(DecodeError::TooLarge(bytes.len()));
    }
    Ok(serde_json::from_slice(bytes)?)
}

/// Error decoding inbound bytes (size limit, bad JSON, or no known shape matched).
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("payload too large ({0} bytes)")]
    TooLarge(usize),
    #[error("decode error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("payload matched no known shape")]
    Unrecognized,
}

/// Inbound payload after classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Envelope(Envelope),
    Introduction(Introduction),
}

/// Classify inbound bytes. Envelopes are only accepted from a sender with a known conversation;
/// otherwise (or when the envelope shape does not match) the bytes are tried as an introduction.
/// First match wins.
pub fn classify(bytes: &[u8], sender_known: bool) -> Result<Inbound, DecodeError> {
    if bytes.len() > MAX_PAYLOAD_LEN {
        return Err(DecodeError::TooLarge(bytes.len()));
    }
    if sender_known {
        if let Ok(envelope) = decode_envelope(bytes) {
            return Ok(Inbound::Envelope(envelope));
        }
    }
    match decode_introduction(bytes) {
        Ok(intro) => Ok(Inbound::Introduction(intro)),
        Err(_) => Err(DecodeError::Unrecognized),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::PeerId;
    use crate::protocol::{CommuType, ContentType};
    use rand::RngCore;

    fn sample_intro() -> Introduction {
        Introduction {
            peer_id: PeerId::generate(),
            display_name: "Bea".into(),
            avatar: Some(vec![0x89, b'P', b'N', b'G']),
        }
    }

    #[test]
    fn envelope_roundtrip_preserves_kind_and_payload() {
        let mut payload = vec![0u8; 4096];
        rand::thread_rng().fill_bytes(&mut payload);
        let env = Envelope::new(payload.clone(), ContentType::Image, CommuType::User);
        let bytes = encode_envelope(&env).unwrap();
        let decoded = decode_envelope(&bytes).unwrap();
        assert_eq!(decoded.content_type, ContentType::Image);
        assert_eq!(decoded.commu_type, CommuType::User);
        assert_eq!(decoded.data, payload);
        assert_eq!(decoded.message_id, env.message_id);
    }

    #[test]
    fn wire_shape_uses_camel_case_tags() {
        let env = Envelope::text("hi");
        let value: serde_json::Value = serde_json::from_slice(&encode_envelope(&env).unwrap()).unwrap();
        assert_eq!(value["contentType"], "text");
        assert_eq!(value["commuType"], "user");
        assert_eq!(value["data"], "aGk=");
    }

    #[test]
    fn introduction_without_avatar_decodes() {
        let id = PeerId::generate();
        let json = format!("{{\"peerId\":\"{}\",\"displayName\":\"Cy\"}}", id);
        let intro = decode_introduction(json.as_bytes()).unwrap();
        assert_eq!(intro.peer_id, id);
        assert_eq!(intro.avatar, None);
    }

    #[test]
    fn classify_known_sender_prefers_envelope() {
        let bytes = encode_envelope(&Envelope::text("hello")).unwrap();
        assert!(matches!(classify(&bytes, true), Ok(Inbound::Envelope(_))));
    }

    #[test]
    fn classify_unknown_sender_rejects_envelope() {
        let bytes = encode_envelope(&Envelope::text("hello")).unwrap();
        assert!(matches!(
            classify(&bytes, false),
            Err(DecodeError::Unrecognized)
        ));
    }

    #[test]
    fn classify_introduction_from_any_sender() {
        let intro = sample_intro();
        let bytes = encode_introduction(&intro).unwrap();
        for known in [true, false] {
            match classify(&bytes, known) {
                Ok(Inbound::Introduction(decoded)) => assert_eq!(decoded, intro),
                other => panic!("expected Introduction, got {:?}", other),
            }
        }
    }

    #[test]
    fn classify_garbage_is_unrecognized() {
        assert!(matches!(
            classify(b"\x00\x01not json", true),
            Err(DecodeError::Unrecognized)
        ));
        assert!(matches!(
            classify(b"{\"peerId\":3}", true),
            Err(DecodeError::Unrecognized)
        ));
    }

    #[test]
    fn oversized_payload_rejected() {
        let env = Envelope::image(vec![0u8; MAX_PAYLOAD_LEN]);
        assert!(matches!(encode_envelope(&env), Err(EncodeError::TooLarge(_))));
        let big = vec![b' '; MAX_PAYLOAD_LEN + 1];
        assert!(matches!(decode_envelope(&big), Err(DecodeError::TooLarge(_))));
    }
}
