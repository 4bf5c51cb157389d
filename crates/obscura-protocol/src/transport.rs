//! The server's request/response surface, as the core sees it.
//!
//! The real backend is an authenticated HTTP service; tests inject an
//! in-memory implementation. Field names are wire contracts; the peer
//! side of a bundle may be produced by another implementation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use obscura_crypto::ratchet::prekeys::PreKeyBundle;

use crate::error::ProtocolError;
use crate::wire::EncryptedMessage;

/// Largest blob accepted by the attachment endpoint. Anything bigger goes
/// through chunked mode.
pub const MAX_BLOB_BYTES: usize = 950 * 1024;

/// Upper bound for a chunked attachment's total plaintext.
pub const MAX_CHUNKED_BYTES: usize = 100 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedPreKeyDto {
    pub key_id: u32,
    pub public_key: Vec<u8>,
    pub signature: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreKeyDto {
    pub key_id: u32,
    pub public_key: Vec<u8>,
}

/// A peer's published bundle, as returned by the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreKeyBundleResponse {
    pub identity_key: Vec<u8>,
    pub registration_id: u32,
    pub signed_pre_key: SignedPreKeyDto,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_key: Option<PreKeyDto>,
}

impl PreKeyBundleResponse {
    /// Convert into the crypto crate's bundle form.
    pub fn into_bundle(self) -> PreKeyBundle {
        PreKeyBundle {
            identity_key: self.identity_key,
            registration_id: self.registration_id,
            signed_prekey_id: self.signed_pre_key.key_id,
            signed_prekey: self.signed_pre_key.public_key,
            signed_prekey_signature: self.signed_pre_key.signature,
            one_time_prekey_id: self.pre_key.as_ref().map(|p| p.key_id),
            one_time_prekey: self.pre_key.map(|p| p.public_key),
        }
    }
}

/// Key material a device publishes at registration and on replenishment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreKeyUpload {
    pub identity_key: Vec<u8>,
    pub registration_id: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signed_pre_key: Option<SignedPreKeyDto>,
    pub one_time_pre_keys: Vec<PreKeyDto>,
}

/// Response to an attachment PUT.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentReceipt {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,
}

/// Authenticated request/response calls against the server.
#[async_trait]
pub trait ServerApi: Send + Sync {
    /// Fetch a peer's prekey bundle; the server consumes the one-time
    /// prekey it hands out.
    async fn fetch_prekey_bundle(
        &self,
        user_id: &str,
    ) -> Result<PreKeyBundleResponse, ProtocolError>;

    async fn upload_prekeys(&self, upload: PreKeyUpload) -> Result<(), ProtocolError>;

    /// Post an encrypted envelope to a user's queue.
    async fn post_message(
        &self,
        user_id: &str,
        message: &EncryptedMessage,
    ) -> Result<(), ProtocolError>;

    /// Store an opaque blob, at most [`MAX_BLOB_BYTES`] bytes.
    async fn put_attachment(&self, data: Vec<u8>) -> Result<AttachmentReceipt, ProtocolError>;

    async fn get_attachment(&self, id: &str) -> Result<Vec<u8>, ProtocolError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bundle_response_converts() {
        let response = PreKeyBundleResponse {
            identity_key: vec![1; 32],
            registration_id: 77,
            signed_pre_key: SignedPreKeyDto {
                key_id: 5,
                public_key: vec![2; 32],
                signature: vec![3; 64],
            },
            pre_key: Some(PreKeyDto {
                key_id: 9,
                public_key: vec![4; 32],
            }),
        };
        let bundle = response.into_bundle();
        assert_eq!(bundle.registration_id, 77);
        assert_eq!(bundle.signed_prekey_id, 5);
        assert_eq!(bundle.one_time_prekey_id, Some(9));
        assert_eq!(bundle.one_time_prekey, Some(vec![4; 32]));
    }

    #[test]
    fn bundle_json_field_names_are_stable() {
        let response = PreKeyBundleResponse {
            identity_key: vec![],
            registration_id: 1,
            signed_pre_key: SignedPreKeyDto {
                key_id: 1,
                public_key: vec![],
                signature: vec![],
            },
            pre_key: None,
        };
        let json = serde_json::to_value(&response).unwrap();
        assert!(json.get("identityKey").is_some());
        assert!(json.get("registrationId").is_some());
        assert!(json.get("signedPreKey").is_some());
    }
}
