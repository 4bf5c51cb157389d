//! The decrypted client-to-client message format.
//!
//! A `ClientMessage` travels as `tag (u32 LE) || length (u32 LE) || JSON
//! body`. Tags are stable wire constants (the peer may be a different
//! implementation), so serde string tagging is not used at the top level.

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::types::{AttachmentPointer, DeviceInfo};

/// Stable wire tags for [`ClientMessage`] variants.
pub mod tags {
    pub const TEXT: u32 = 0;
    pub const IMAGE: u32 = 1;
    pub const FRIEND_REQUEST: u32 = 2;
    pub const FRIEND_RESPONSE: u32 = 3;
    pub const SESSION_RESET: u32 = 4;
    pub const DEVICE_LINK_APPROVAL: u32 = 11;
    pub const DEVICE_ANNOUNCE: u32 = 12;
    pub const HISTORY_CHUNK: u32 = 20;
    pub const SETTINGS_SYNC: u32 = 21;
    pub const READ_SYNC: u32 = 22;
    pub const SYNC_BLOB: u32 = 23;
    pub const SENT_SYNC: u32 = 24;
    pub const MODEL_SYNC: u32 = 25;
    pub const CONTENT_REFERENCE: u32 = 26;
}

/// MODEL_SYNC op codes. UPDATE and DELETE are reserved; replication only
/// ever emits CREATE (LWW covers updates, tombstones cover deletes).
pub mod model_ops {
    pub const OP_CREATE: u32 = 0;
    pub const OP_UPDATE: u32 = 1;
    pub const OP_DELETE: u32 = 2;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextMessage {
    pub text: String,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageMessage {
    pub content: AttachmentPointer,
    pub mime_type: String,
    /// Seconds the image stays on screen, for view-once style display.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_duration: Option<u32>,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FriendRequestMessage {
    pub username: String,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FriendResponseMessage {
    pub username: String,
    pub accepted: bool,
    /// The responder's device list, so the requester can fan out.
    pub devices: Vec<DeviceInfo>,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionResetMessage {
    pub reset_reason: String,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceLinkApprovalMessage {
    pub p2p_public_key: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub p2p_private_key: Option<Vec<u8>>,
    pub recovery_public_key: Vec<u8>,
    /// Echo of the link-code challenge, proving which request is approved.
    pub challenge_response: Vec<u8>,
    pub own_devices: Vec<DeviceInfo>,
    /// JSON export of the approver's friend list.
    pub friends_export: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sessions_export: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trusted_ids_export: Option<Vec<u8>>,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceAnnounceMessage {
    pub devices: Vec<DeviceInfo>,
    pub timestamp: u64,
    pub is_revocation: bool,
    /// Ed25519 signature over the canonical announce form; revocations
    /// sign with the recovery key, plain announces with the identity key.
    pub signature: Vec<u8>,
    /// The account's recovery public key, TOFU-pinned by receivers so
    /// later revocations can be verified.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovery_public_key: Option<Vec<u8>>,
}

/// One historical message replayed during device link.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub conversation_id: String,
    pub message_id: String,
    pub outbound: bool,
    pub timestamp: u64,
    pub content: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryChunkMessage {
    pub messages: Vec<HistoryEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsSyncMessage {
    pub settings: serde_json::Map<String, serde_json::Value>,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadSyncMessage {
    pub conversation_id: String,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncBlobMessage {
    /// Gzip-compressed JSON of `{friends, messages, settings}`.
    pub compressed_data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SentSyncMessage {
    pub conversation_id: String,
    pub message_id: String,
    pub timestamp: u64,
    /// The sent payload, UTF-8 text or an encoded attachment pointer.
    pub content: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelSyncMessage {
    pub model: String,
    pub id: String,
    pub op: u32,
    pub timestamp: u64,
    /// JSON encoding of the entry data.
    pub data: Vec<u8>,
    pub signature: Vec<u8>,
    pub author_device_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentRefMessage {
    pub content: AttachmentPointer,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    pub timestamp: u64,
}

/// Everything a device can say to another device, after session decryption.
#[derive(Debug, Clone)]
pub enum ClientMessage {
    Text(TextMessage),
    Image(ImageMessage),
    FriendRequest(FriendRequestMessage),
    FriendResponse(FriendResponseMessage),
    SessionReset(SessionResetMessage),
    DeviceLinkApproval(DeviceLinkApprovalMessage),
    DeviceAnnounce(DeviceAnnounceMessage),
    HistoryChunk(HistoryChunkMessage),
    SettingsSync(SettingsSyncMessage),
    ReadSync(ReadSyncMessage),
    SyncBlob(SyncBlobMessage),
    SentSync(SentSyncMessage),
    ModelSync(ModelSyncMessage),
    ContentRef(ContentRefMessage),
}

impl ClientMessage {
    /// The stable wire tag for this variant.
    pub fn tag(&self) -> u32 {
        match self {
            ClientMessage::Text(_) => tags::TEXT,
            ClientMessage::Image(_) => tags::IMAGE,
            ClientMessage::FriendRequest(_) => tags::FRIEND_REQUEST,
            ClientMessage::FriendResponse(_) => tags::FRIEND_RESPONSE,
            ClientMessage::SessionReset(_) => tags::SESSION_RESET,
            ClientMessage::DeviceLinkApproval(_) => tags::DEVICE_LINK_APPROVAL,
            ClientMessage::DeviceAnnounce(_) => tags::DEVICE_ANNOUNCE,
            ClientMessage::HistoryChunk(_) => tags::HISTORY_CHUNK,
            ClientMessage::SettingsSync(_) => tags::SETTINGS_SYNC,
            ClientMessage::ReadSync(_) => tags::READ_SYNC,
            ClientMessage::SyncBlob(_) => tags::SYNC_BLOB,
            ClientMessage::SentSync(_) => tags::SENT_SYNC,
            ClientMessage::ModelSync(_) => tags::MODEL_SYNC,
            ClientMessage::ContentRef(_) => tags::CONTENT_REFERENCE,
        }
    }

    /// Encode as `tag || length || JSON body`.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let body = match self {
            ClientMessage::Text(m) => to_body(m),
            ClientMessage::Image(m) => to_body(m),
            ClientMessage::FriendRequest(m) => to_body(m),
            ClientMessage::FriendResponse(m) => to_body(m),
            ClientMessage::SessionReset(m) => to_body(m),
            ClientMessage::DeviceLinkApproval(m) => to_body(m),
            ClientMessage::DeviceAnnounce(m) => to_body(m),
            ClientMessage::HistoryChunk(m) => to_body(m),
            ClientMessage::SettingsSync(m) => to_body(m),
            ClientMessage::ReadSync(m) => to_body(m),
            ClientMessage::SyncBlob(m) => to_body(m),
            ClientMessage::SentSync(m) => to_body(m),
            ClientMessage::ModelSync(m) => to_body(m),
            ClientMessage::ContentRef(m) => to_body(m),
        }?;
        let len = u32::try_from(body.len())
            .map_err(|_| ProtocolError::Codec("message body too large".into()))?;

        let mut out = Vec::with_capacity(8 + body.len());
        out.extend_from_slice(&self.tag().to_le_bytes());
        out.extend_from_slice(&len.to_le_bytes());
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Decode from `tag || length || JSON body`.
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < 8 {
            return Err(ProtocolError::Codec("message too short".into()));
        }
        let tag = u32::from_le_bytes(
            data[..4]
                .try_into()
                .map_err(|_| ProtocolError::Codec("invalid tag".into()))?,
        );
        let len = u32::from_le_bytes(
            data[4..8]
                .try_into()
                .map_err(|_| ProtocolError::Codec("invalid length".into()))?,
        ) as usize;
        if data.len() < 8 + len {
            return Err(ProtocolError::Codec(format!(
                "truncated message: want {len} body bytes, have {}",
                data.len() - 8
            )));
        }
        let body = &data[8..8 + len];

        match tag {
            tags::TEXT => Ok(ClientMessage::Text(from_body(body)?)),
            tags::IMAGE => Ok(ClientMessage::Image(from_body(body)?)),
            tags::FRIEND_REQUEST => Ok(ClientMessage::FriendRequest(from_body(body)?)),
            tags::FRIEND_RESPONSE => Ok(ClientMessage::FriendResponse(from_body(body)?)),
            tags::SESSION_RESET => Ok(ClientMessage::SessionReset(from_body(body)?)),
            tags::DEVICE_LINK_APPROVAL => Ok(ClientMessage::DeviceLinkApproval(from_body(body)?)),
            tags::DEVICE_ANNOUNCE => Ok(ClientMessage::DeviceAnnounce(from_body(body)?)),
            tags::HISTORY_CHUNK => Ok(ClientMessage::HistoryChunk(from_body(body)?)),
            tags::SETTINGS_SYNC => Ok(ClientMessage::SettingsSync(from_body(body)?)),
            tags::READ_SYNC => Ok(ClientMessage::ReadSync(from_body(body)?)),
            tags::SYNC_BLOB => Ok(ClientMessage::SyncBlob(from_body(body)?)),
            tags::SENT_SYNC => Ok(ClientMessage::SentSync(from_body(body)?)),
            tags::MODEL_SYNC => Ok(ClientMessage::ModelSync(from_body(body)?)),
            tags::CONTENT_REFERENCE => Ok(ClientMessage::ContentRef(from_body(body)?)),
            other => {
                tracing::warn!(tag = other, "unknown client message tag");
                Err(ProtocolError::UnknownMessageType(other))
            }
        }
    }
}

fn to_body<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    serde_json::to_vec(value).map_err(|e| ProtocolError::Codec(format!("encode body: {e}")))
}

fn from_body<'a, T: Deserialize<'a>>(body: &'a [u8]) -> Result<T, ProtocolError> {
    serde_json::from_slice(body).map_err(|e| ProtocolError::Codec(format!("decode body: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_roundtrip() {
        let msg = ClientMessage::Text(TextMessage {
            text: "hello".into(),
            timestamp: 42,
        });
        let encoded = msg.encode().unwrap();
        assert_eq!(&encoded[..4], &tags::TEXT.to_le_bytes());

        match ClientMessage::decode(&encoded).unwrap() {
            ClientMessage::Text(t) => {
                assert_eq!(t.text, "hello");
                assert_eq!(t.timestamp, 42);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn sent_sync_roundtrip() {
        let msg = ClientMessage::SentSync(SentSyncMessage {
            conversation_id: "bob".into(),
            message_id: "m1".into(),
            timestamp: 7,
            content: b"payload".to_vec(),
        });
        let encoded = msg.encode().unwrap();
        match ClientMessage::decode(&encoded).unwrap() {
            ClientMessage::SentSync(s) => {
                assert_eq!(s.conversation_id, "bob");
                assert_eq!(s.content, b"payload");
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn unknown_tag_is_an_error() {
        let mut data = 999u32.to_le_bytes().to_vec();
        data.extend_from_slice(&2u32.to_le_bytes());
        data.extend_from_slice(b"{}");
        let err = ClientMessage::decode(&data).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownMessageType(999)));
    }

    #[test]
    fn truncated_body_is_an_error() {
        let msg = ClientMessage::ReadSync(ReadSyncMessage {
            conversation_id: "alice".into(),
            timestamp: 1,
        });
        let encoded = msg.encode().unwrap();
        let err = ClientMessage::decode(&encoded[..encoded.len() - 1]).unwrap_err();
        assert!(matches!(err, ProtocolError::Codec(_)));
    }

    #[test]
    fn tag_values_are_stable() {
        assert_eq!(tags::TEXT, 0);
        assert_eq!(tags::SESSION_RESET, 4);
        assert_eq!(tags::DEVICE_LINK_APPROVAL, 11);
        assert_eq!(tags::DEVICE_ANNOUNCE, 12);
        assert_eq!(tags::SYNC_BLOB, 23);
        assert_eq!(tags::SENT_SYNC, 24);
    }
}
