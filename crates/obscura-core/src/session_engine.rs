//! Session engine: the ratchet cipher wired to the transport.
//!
//! Addresses are `{peer_user_id}:1`: every device of a user posts under
//! its own server user id, so the device index is fixed. Missing sessions
//! are bootstrapped from a fetched prekey bundle; prekey replenishment
//! runs after successful decrypts and never fails the caller.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use obscura_crypto::ratchet::prekeys::{generate_prekey_batch, generate_signed_prekey};
use obscura_crypto::ratchet::store::{IdentityKeyStore as _, PreKeyStore as _};
use obscura_crypto::{CiphertextKind, CryptoError, RatchetCipher};
use obscura_protocol::transport::{PreKeyDto, PreKeyUpload, ServerApi, SignedPreKeyDto};
use obscura_protocol::wire::EncryptedMessage;
use obscura_protocol::ProtocolError;

use crate::error::CoreError;
use crate::keystore::KeyStore;

/// Replenish when fewer than this many one-time prekeys remain.
pub const PREKEY_LOW_WATER: u32 = 20;
/// Size of each replenishment batch.
pub const PREKEY_BATCH: u32 = 50;

pub struct SessionEngine {
    cipher: RatchetCipher,
    keystore: Arc<KeyStore>,
    server: Arc<dyn ServerApi>,
    /// Per-address locks so each session record is read-modified-written
    /// serially, including across the bundle fetch await.
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl SessionEngine {
    pub fn new(keystore: Arc<KeyStore>, server: Arc<dyn ServerApi>) -> Self {
        let cipher = RatchetCipher::new(keystore.clone(), keystore.clone(), keystore.clone());
        Self {
            cipher,
            keystore,
            server,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// The session address for a peer user id.
    pub fn address(peer_user_id: &str) -> String {
        format!("{peer_user_id}:1")
    }

    /// Encrypt a plaintext for a peer, establishing a session from their
    /// prekey bundle when none exists yet.
    pub async fn encrypt(
        &self,
        peer_user_id: &str,
        plaintext: &[u8],
    ) -> Result<EncryptedMessage, CoreError> {
        let address = Self::address(peer_user_id);
        let lock = self.address_lock(&address);
        let _guard = lock.lock().await;

        if !self.cipher.has_session(&address)? {
            let bundle = self
                .server
                .fetch_prekey_bundle(peer_user_id)
                .await?
                .into_bundle();
            self.cipher.establish_outbound(&address, &bundle)?;
            tracing::debug!(peer = %peer_user_id, "session established from prekey bundle");
        }

        let message = self.cipher.encrypt(&address, plaintext)?;
        Ok(EncryptedMessage {
            message_type: message.kind.wire_tag(),
            content: message.body,
        })
    }

    /// Decrypt an inbound envelope body.
    pub async fn decrypt(
        &self,
        peer_user_id: &str,
        message: &EncryptedMessage,
    ) -> Result<Vec<u8>, CoreError> {
        let kind = CiphertextKind::from_wire_tag(message.message_type).ok_or(
            CoreError::Protocol(ProtocolError::UnknownMessageType(message.message_type)),
        )?;
        let address = Self::address(peer_user_id);
        let lock = self.address_lock(&address);
        let _guard = lock.lock().await;

        Ok(self.cipher.decrypt(&address, kind, &message.content)?)
    }

    pub fn has_session(&self, peer_user_id: &str) -> Result<bool, CoreError> {
        Ok(self.cipher.has_session(&Self::address(peer_user_id))?)
    }

    /// Drop the session so the next send rebuilds from a fresh bundle.
    pub fn reset_session(&self, peer_user_id: &str) -> Result<(), CoreError> {
        Ok(self.cipher.delete_session(&Self::address(peer_user_id))?)
    }

    /// Top up one-time prekeys when the pool runs low. Transport failures
    /// are logged and swallowed; the next decrypt retries.
    pub async fn replenish_prekeys(&self) {
        match self.try_replenish().await {
            Ok(Some(uploaded)) => {
                tracing::debug!(count = uploaded, "replenished one-time prekeys");
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(error = %e, "prekey replenishment failed");
            }
        }
    }

    async fn try_replenish(&self) -> Result<Option<u32>, CoreError> {
        let remaining = self.keystore.count_prekeys()?;
        if remaining >= PREKEY_LOW_WATER {
            return Ok(None);
        }

        // Identity first: a logged-out store must not mint key material.
        let (_, identity_key) = self.keystore.get_identity_key_pair()?;
        let registration_id = self.keystore.get_local_registration_id()?;
        let start_id = self.keystore.max_prekey_id()?.unwrap_or(0) + 1;
        let batch = generate_prekey_batch(&*self.keystore, start_id, PREKEY_BATCH)?;

        let upload = PreKeyUpload {
            identity_key,
            registration_id,
            signed_pre_key: None,
            one_time_pre_keys: batch
                .into_iter()
                .map(|p| PreKeyDto {
                    key_id: p.key_id,
                    public_key: p.public_key,
                })
                .collect(),
        };
        self.server.upload_prekeys(upload).await?;
        Ok(Some(PREKEY_BATCH))
    }

    /// Rotate the signed prekey: generate a successor, upload it, keep
    /// the predecessor so in-flight prekey messages still decrypt.
    pub async fn rotate_signed_prekey(&self) -> Result<u32, CoreError> {
        let identity = self.keystore.identity()?;
        let next_id = self.keystore.latest_signed_prekey_id()?.unwrap_or(0) + 1;
        let signed = generate_signed_prekey(&identity, &*self.keystore, next_id)?;

        self.server
            .upload_prekeys(PreKeyUpload {
                identity_key: identity.public_key_bytes().to_vec(),
                registration_id: identity.registration_id(),
                signed_pre_key: Some(SignedPreKeyDto {
                    key_id: signed.key_id,
                    public_key: signed.public_key,
                    signature: signed.signature,
                }),
                one_time_pre_keys: Vec::new(),
            })
            .await?;
        tracing::info!(key_id = next_id, "signed prekey rotated");
        Ok(next_id)
    }

    /// Whether a decrypt error is the suppress-don't-ack kind.
    pub fn is_counter_error(error: &CoreError) -> bool {
        matches!(error, CoreError::Crypto(CryptoError::MessageCounter(_)))
    }

    fn address_lock(&self, address: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .entry(address.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}
