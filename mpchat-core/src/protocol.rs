//! Application wire payloads: message envelope and self-introduction.

use serde::{Deserialize, Serialize};

use crate::identity::{MessageId, PeerId, PeerIdentity};

/// Service type advertised and browsed on the local network.
pub const DEFAULT_SERVICE_ID: &str = "mp-chat";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Text,
    Image,
}

/// What the envelope is for: peer introduction or a user-authored message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommuType {
    Introduction,
    User,
}

/// Wrapped application message. Encoding is JSON (see codec module); `data` travels as base64.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Envelope {
    pub message_id: MessageId,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
    pub content_type: ContentType,
    pub commu_type: CommuType,
}

impl Envelope {
    pub fn new(data: Vec<u8>, content_type: ContentType, commu_type: CommuType) -> Self {
        Self {
            message_id: MessageId::generate(),
            data,
            content_type,
            commu_type,
        }
    }

    pub fn text(text: &str) -> Self {
        Self::new(text.as_bytes().to_vec(), ContentType::Text, CommuType::User)
    }

    pub fn image(bytes: Vec<u8>) -> Self {
        Self::new(bytes, ContentType::Image, CommuType::User)
    }
}

/// Self-introduction sent right after a session connects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Introduction {
    pub peer_id: PeerId,
    pub display_name: String,
    #[serde(default, with = "base64_bytes_opt")]
    pub avatar: Option<Vec<u8>>,
}

impl From<&PeerIdentity> for Introduction {
    fn from(identity: &PeerIdentity) -> Self {
        Self {
            peer_id: identity.id,
            display_name: identity.display_name.clone(),
            avatar: identity.avatar.clone(),
        }
    }
}

impl From<Introduction> for PeerIdentity {
    fn from(intro: Introduction) -> Self {
        PeerIdentity {
            id: intro.peer_id,
            display_name: intro.display_name,
            avatar: intro.avatar,
        }
    }
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(v))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        BASE64.decode(s.as_bytes()).map_err(serde::de::Error::custom)
    }
}

mod base64_bytes_opt {
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error> {
        match v {
            Some(bytes) => serializer.serialize_some(&BASE64.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        let s: Option<String> = Option::deserialize(d)?;
        s.map(|s| BASE64.decode(s.as_bytes()).map_err(serde::de::Error::custom))
            .transpose()
    }
}
