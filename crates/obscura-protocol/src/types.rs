use serde::{Deserialize, Serialize};

/// One device of a user, as exchanged in friend responses, link approvals,
/// and device announces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    /// Server-side user id the device posts and receives envelopes under.
    pub server_user_id: String,
    pub device_uuid: String,
    pub device_name: String,
    /// Ed25519 ratchet identity public key.
    pub identity_key: Vec<u8>,
}

/// Shareable descriptor of one encrypted attachment blob.
///
/// The ciphertext lives on the server under `attachment_id`; the key,
/// nonce, and plaintext hash travel only inside encrypted messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentReference {
    pub attachment_id: String,
    pub content_key: Vec<u8>,
    pub nonce: Vec<u8>,
    pub content_hash: Vec<u8>,
    pub content_type: String,
    pub size_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,
}

/// One chunk of a chunked attachment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkRef {
    pub index: u32,
    pub attachment_id: String,
    pub content_key: Vec<u8>,
    pub nonce: Vec<u8>,
    pub chunk_hash: Vec<u8>,
    pub size: u64,
}

/// Descriptor of an attachment too large for a single blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkedContentReference {
    pub file_id: String,
    pub chunks: Vec<ChunkRef>,
    /// SHA-256 over the whole reassembled plaintext.
    pub complete_hash: Vec<u8>,
    pub content_type: String,
    pub total_size_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
}

/// Either form of attachment descriptor carried in messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "camelCase")]
pub enum AttachmentPointer {
    Single(ContentReference),
    Chunked(ChunkedContentReference),
}
