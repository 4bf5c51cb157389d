//! The durable key store.
//!
//! Owns every named key collection: the ratchet identity (optionally
//! encrypted at rest under the account password), prekeys, sessions,
//! TOFU-pinned peer identities, and the device identity record. All other
//! components borrow it through the crypto storage traits.

use std::sync::Arc;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use parking_lot::Mutex;
use rand::rngs::OsRng;
use rand::RngCore as _;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use obscura_crypto::ratchet::store::{IdentityKeyStore, PreKeyStore, SessionStore};
use obscura_crypto::{CryptoError, RatchetIdentity};

use crate::error::CoreError;
use crate::storage::{timestamp_now, Storage};

pub const COL_IDENTITY: &str = "identity";
pub const COL_PRE_KEYS: &str = "pre_keys";
pub const COL_PRE_KEY_META: &str = "pre_key_meta";
pub const COL_SIGNED_PRE_KEYS: &str = "signed_pre_keys";
pub const COL_SESSIONS: &str = "sessions";
pub const COL_TRUSTED_IDENTITIES: &str = "trusted_identities";
pub const COL_DEVICE_IDENTITY: &str = "device_identity";

const KEY_IDENTITY: &str = "ratchet";
const KEY_DEVICE: &str = "device";
const META_MAX_PREKEY_ID: &str = "max_prekey_id";
const META_LATEST_SIGNED_ID: &str = "latest_signed_prekey_id";

/// This install's device-level identity, one per account per install.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceIdentity {
    pub core_username: String,
    /// Server user id this device posts and receives envelopes under.
    pub server_user_id: String,
    pub device_uuid: String,
    /// `{core_username}_{uuid_prefix}`, the name other devices see.
    pub device_username: String,
    pub p2p_public_key: Vec<u8>,
    pub p2p_secret_key: Vec<u8>,
    pub recovery_public_key: Vec<u8>,
    pub is_first_device: bool,
}

/// The persisted ratchet identity, plain or sealed under the account
/// password.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum IdentityRecord {
    Plain {
        seed: Vec<u8>,
        registration_id: u32,
    },
    Encrypted {
        salt: Vec<u8>,
        nonce: Vec<u8>,
        ciphertext: Vec<u8>,
    },
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IdentityPlaintext {
    seed: Vec<u8>,
    registration_id: u32,
}

/// A TOFU-pinned peer identity with sighting times.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TrustedIdentityRecord {
    key: Vec<u8>,
    first_seen: u64,
    last_seen: u64,
}

/// Decrypted identity material held for the process lifetime.
#[derive(Clone)]
struct KeyCache {
    seed: [u8; 32],
    public: [u8; 32],
    registration_id: u32,
}

/// Durable, namespaced key store over the injected [`Storage`].
pub struct KeyStore {
    storage: Arc<dyn Storage>,
    cache: Mutex<Option<KeyCache>>,
}

impl KeyStore {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            cache: Mutex::new(None),
        }
    }

    /// Whether an identity record exists for this account.
    pub fn has_identity(&self) -> Result<bool, CoreError> {
        Ok(self.storage.get(COL_IDENTITY, KEY_IDENTITY)?.is_some())
    }

    /// Persist a freshly generated identity and populate the key cache.
    ///
    /// With a password the record is sealed at rest (argon2id-derived key,
    /// AES-256-GCM); without one it is stored plain.
    pub fn initialize(
        &self,
        identity: &RatchetIdentity,
        password: Option<&str>,
    ) -> Result<(), CoreError> {
        let record = encode_identity_record(identity, password);
        let data = serde_json::to_vec(&record)
            .map_err(|e| CoreError::StorageIO(format!("serialize identity record: {e}")))?;
        self.storage.put(COL_IDENTITY, KEY_IDENTITY, &data)?;

        *self.cache.lock() = Some(KeyCache {
            seed: *identity.secret_seed_bytes(),
            public: identity.public_key_bytes(),
            registration_id: identity.registration_id(),
        });
        Ok(())
    }

    /// Load the identity record into the key cache. Encrypted records need
    /// the account password; a wrong password fails AEAD and surfaces as
    /// an authentication error.
    pub fn open(&self, password: Option<&str>) -> Result<(), CoreError> {
        let data = self
            .storage
            .get(COL_IDENTITY, KEY_IDENTITY)?
            .ok_or(CoreError::NotInitialized)?;
        let record: IdentityRecord = serde_json::from_slice(&data)
            .map_err(|e| CoreError::StorageIO(format!("corrupt identity record: {e}")))?;

        let plaintext = match record {
            IdentityRecord::Plain {
                seed,
                registration_id,
            } => IdentityPlaintext {
                seed,
                registration_id,
            },
            IdentityRecord::Encrypted {
                salt,
                nonce,
                ciphertext,
            } => {
                let password =
                    password.ok_or_else(|| CoreError::Auth("password required".into()))?;
                let key = derive_password_key(password, &salt);
                let cipher = Aes256Gcm::new_from_slice(key.as_slice())
                    .map_err(|e| CoreError::Auth(e.to_string()))?;
                let decrypted = cipher
                    .decrypt(Nonce::from_slice(&nonce), ciphertext.as_slice())
                    .map_err(|_| CoreError::Auth("wrong password".into()))?;
                serde_json::from_slice(&decrypted)
                    .map_err(|e| CoreError::StorageIO(format!("corrupt identity record: {e}")))?
            }
        };

        let seed: [u8; 32] = plaintext
            .seed
            .as_slice()
            .try_into()
            .map_err(|_| CoreError::StorageIO("identity seed wrong length".into()))?;
        let identity = RatchetIdentity::from_parts(&seed, plaintext.registration_id);
        *self.cache.lock() = Some(KeyCache {
            seed,
            public: identity.public_key_bytes(),
            registration_id: plaintext.registration_id,
        });
        Ok(())
    }

    /// Clear the in-memory key cache. Storage is untouched.
    pub fn logout(&self) {
        *self.cache.lock() = None;
    }

    pub fn is_open(&self) -> bool {
        self.cache.lock().is_some()
    }

    /// The cached identity, rebuilt as a signing-capable value.
    pub fn identity(&self) -> Result<RatchetIdentity, CoreError> {
        let cache = self.cached()?;
        Ok(RatchetIdentity::from_parts(
            &cache.seed,
            cache.registration_id,
        ))
    }

    /// The raw persisted identity record, for backup export.
    pub fn identity_record(&self) -> Result<Option<IdentityRecord>, CoreError> {
        match self.storage.get(COL_IDENTITY, KEY_IDENTITY)? {
            Some(data) => Ok(Some(serde_json::from_slice(&data).map_err(|e| {
                CoreError::StorageIO(format!("corrupt identity record: {e}"))
            })?)),
            None => Ok(None),
        }
    }

    /// Restore an identity record from a backup, re-sealing raw keypairs
    /// under the new account password.
    pub fn restore_identity_record(
        &self,
        record: &IdentityRecord,
        password: Option<&str>,
    ) -> Result<(), CoreError> {
        let record = match (record, password) {
            (
                IdentityRecord::Plain {
                    seed,
                    registration_id,
                },
                Some(password),
            ) => {
                let seed: [u8; 32] = seed
                    .as_slice()
                    .try_into()
                    .map_err(|_| CoreError::StorageIO("identity seed wrong length".into()))?;
                let identity = RatchetIdentity::from_parts(&seed, *registration_id);
                encode_identity_record(&identity, Some(password))
            }
            (other, _) => other.clone(),
        };
        let data = serde_json::to_vec(&record)
            .map_err(|e| CoreError::StorageIO(format!("serialize identity record: {e}")))?;
        self.storage.put(COL_IDENTITY, KEY_IDENTITY, &data)?;
        Ok(())
    }

    pub fn device_identity(&self) -> Result<Option<DeviceIdentity>, CoreError> {
        match self.storage.get(COL_DEVICE_IDENTITY, KEY_DEVICE)? {
            Some(data) => Ok(Some(serde_json::from_slice(&data).map_err(|e| {
                CoreError::StorageIO(format!("corrupt device identity: {e}"))
            })?)),
            None => Ok(None),
        }
    }

    pub fn set_device_identity(&self, device: &DeviceIdentity) -> Result<(), CoreError> {
        let data = serde_json::to_vec(device)
            .map_err(|e| CoreError::StorageIO(format!("serialize device identity: {e}")))?;
        self.storage.put(COL_DEVICE_IDENTITY, KEY_DEVICE, &data)?;
        Ok(())
    }

    /// Destroy all key material for this account (device unlink / remote
    /// revocation).
    pub fn wipe(&self) -> Result<(), CoreError> {
        for collection in [
            COL_IDENTITY,
            COL_PRE_KEYS,
            COL_PRE_KEY_META,
            COL_SIGNED_PRE_KEYS,
            COL_SESSIONS,
            COL_TRUSTED_IDENTITIES,
            COL_DEVICE_IDENTITY,
        ] {
            self.storage.clear(collection)?;
        }
        self.logout();
        Ok(())
    }

    /// TOFU-pinned key for an address, if any.
    pub fn trusted_identity_key(&self, address: &str) -> Result<Option<Vec<u8>>, CoreError> {
        match self.storage.get(COL_TRUSTED_IDENTITIES, address)? {
            Some(data) => {
                let record: TrustedIdentityRecord = serde_json::from_slice(&data)
                    .map_err(|e| CoreError::StorageIO(format!("corrupt trusted identity: {e}")))?;
                Ok(Some(record.key))
            }
            None => Ok(None),
        }
    }

    fn cached(&self) -> Result<KeyCache, CoreError> {
        self.cache.lock().clone().ok_or(CoreError::NotInitialized)
    }

    fn meta_get_u32(&self, key: &str) -> Result<Option<u32>, CryptoError> {
        let data = self
            .storage
            .get(COL_PRE_KEY_META, key)
            .map_err(storage_err)?;
        match data {
            Some(bytes) => {
                let bytes: [u8; 4] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| CryptoError::Storage("corrupt prekey meta".into()))?;
                Ok(Some(u32::from_le_bytes(bytes)))
            }
            None => Ok(None),
        }
    }

    fn meta_put_u32(&self, key: &str, value: u32) -> Result<(), CryptoError> {
        self.storage
            .put(COL_PRE_KEY_META, key, &value.to_le_bytes())
            .map_err(storage_err)
    }
}

impl IdentityKeyStore for KeyStore {
    fn get_identity_key_pair(&self) -> Result<(Vec<u8>, Vec<u8>), CryptoError> {
        let cache = self
            .cache
            .lock()
            .clone()
            .ok_or_else(|| CryptoError::Storage("key store not opened".into()))?;
        Ok((cache.seed.to_vec(), cache.public.to_vec()))
    }

    fn get_local_registration_id(&self) -> Result<u32, CryptoError> {
        let cache = self
            .cache
            .lock()
            .clone()
            .ok_or_else(|| CryptoError::Storage("key store not opened".into()))?;
        Ok(cache.registration_id)
    }

    fn is_trusted_identity(&self, address: &str, identity_key: &[u8]) -> Result<bool, CryptoError> {
        let stored = self
            .storage
            .get(COL_TRUSTED_IDENTITIES, address)
            .map_err(storage_err)?;
        match stored {
            Some(data) => {
                let record: TrustedIdentityRecord = serde_json::from_slice(&data)
                    .map_err(|e| CryptoError::Storage(format!("corrupt trusted identity: {e}")))?;
                if record.key.len() != identity_key.len() {
                    return Ok(false);
                }
                Ok(record.key == identity_key)
            }
            None => Ok(true), // TOFU: trust on first use
        }
    }

    fn save_identity(&self, address: &str, identity_key: &[u8]) -> Result<bool, CryptoError> {
        let now = timestamp_now();
        let mut was_existing = false;
        self.storage
            .update(COL_TRUSTED_IDENTITIES, address, &mut |current| {
                let record = match current
                    .as_deref()
                    .and_then(|data| serde_json::from_slice::<TrustedIdentityRecord>(data).ok())
                {
                    Some(mut record) => {
                        was_existing = true;
                        record.key = identity_key.to_vec();
                        record.last_seen = now;
                        record
                    }
                    None => TrustedIdentityRecord {
                        key: identity_key.to_vec(),
                        first_seen: now,
                        last_seen: now,
                    },
                };
                serde_json::to_vec(&record).ok()
            })
            .map_err(storage_err)?;
        tracing::debug!(
            address,
            key = %hex::encode(identity_key),
            was_existing,
            "peer identity pinned"
        );
        Ok(was_existing)
    }
}

impl PreKeyStore for KeyStore {
    fn load_prekey(&self, prekey_id: u32) -> Result<Option<Vec<u8>>, CryptoError> {
        self.storage
            .get(COL_PRE_KEYS, &prekey_id.to_string())
            .map_err(storage_err)
    }

    fn store_prekey(&self, prekey_id: u32, key_data: &[u8]) -> Result<(), CryptoError> {
        self.storage
            .put(COL_PRE_KEYS, &prekey_id.to_string(), key_data)
            .map_err(storage_err)?;
        let max = self.meta_get_u32(META_MAX_PREKEY_ID)?.unwrap_or(0);
        if prekey_id > max {
            self.meta_put_u32(META_MAX_PREKEY_ID, prekey_id)?;
        }
        Ok(())
    }

    fn remove_prekey(&self, prekey_id: u32) -> Result<(), CryptoError> {
        self.storage
            .delete(COL_PRE_KEYS, &prekey_id.to_string())
            .map_err(storage_err)
    }

    fn count_prekeys(&self) -> Result<u32, CryptoError> {
        let count = self.storage.count(COL_PRE_KEYS).map_err(storage_err)?;
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }

    fn max_prekey_id(&self) -> Result<Option<u32>, CryptoError> {
        self.meta_get_u32(META_MAX_PREKEY_ID)
    }

    fn load_signed_prekey(&self, signed_prekey_id: u32) -> Result<Option<Vec<u8>>, CryptoError> {
        self.storage
            .get(COL_SIGNED_PRE_KEYS, &signed_prekey_id.to_string())
            .map_err(storage_err)
    }

    fn store_signed_prekey(
        &self,
        signed_prekey_id: u32,
        key_data: &[u8],
    ) -> Result<(), CryptoError> {
        self.storage
            .put(COL_SIGNED_PRE_KEYS, &signed_prekey_id.to_string(), key_data)
            .map_err(storage_err)?;
        self.meta_put_u32(META_LATEST_SIGNED_ID, signed_prekey_id)
    }

    fn latest_signed_prekey_id(&self) -> Result<Option<u32>, CryptoError> {
        self.meta_get_u32(META_LATEST_SIGNED_ID)
    }
}

impl SessionStore for KeyStore {
    fn load_session(&self, address: &str) -> Result<Option<Vec<u8>>, CryptoError> {
        self.storage.get(COL_SESSIONS, address).map_err(storage_err)
    }

    fn store_session(&self, address: &str, session_data: &[u8]) -> Result<(), CryptoError> {
        self.storage
            .put(COL_SESSIONS, address, session_data)
            .map_err(storage_err)
    }

    fn has_session(&self, address: &str) -> Result<bool, CryptoError> {
        Ok(self
            .storage
            .get(COL_SESSIONS, address)
            .map_err(storage_err)?
            .is_some())
    }

    fn delete_session(&self, address: &str) -> Result<(), CryptoError> {
        self.storage
            .delete(COL_SESSIONS, address)
            .map_err(storage_err)
    }
}

fn storage_err(e: CoreError) -> CryptoError {
    CryptoError::Storage(e.to_string())
}

fn encode_identity_record(identity: &RatchetIdentity, password: Option<&str>) -> IdentityRecord {
    match password {
        None => IdentityRecord::Plain {
            seed: identity.secret_seed_bytes().to_vec(),
            registration_id: identity.registration_id(),
        },
        Some(password) => {
            let mut salt = vec![0u8; 16];
            let mut nonce = vec![0u8; 12];
            OsRng.fill_bytes(&mut salt);
            OsRng.fill_bytes(&mut nonce);

            let plaintext = IdentityPlaintext {
                seed: identity.secret_seed_bytes().to_vec(),
                registration_id: identity.registration_id(),
            };
            let key = derive_password_key(password, &salt);
            let cipher = Aes256Gcm::new_from_slice(key.as_slice())
                .expect("32-byte key is always valid for AES-256-GCM");
            let ciphertext = cipher
                .encrypt(
                    Nonce::from_slice(&nonce),
                    serde_json::to_vec(&plaintext).unwrap_or_default().as_slice(),
                )
                .expect("AES-GCM encryption of in-memory buffer");

            IdentityRecord::Encrypted {
                salt,
                nonce,
                ciphertext,
            }
        }
    }
}

/// Derive a 32-byte at-rest key from the account password using argon2id.
///
/// Production: `m=65536, t=3, p=4`. Test builds: `m=256, t=1, p=1` for
/// fast iteration.
fn derive_password_key(password: &str, salt: &[u8]) -> Zeroizing<Vec<u8>> {
    use argon2::{Algorithm, Argon2, Params, Version};

    #[cfg(debug_assertions)]
    let params = Params::new(256, 1, 1, Some(32)).expect("invalid argon2 params");
    #[cfg(not(debug_assertions))]
    let params = Params::new(65536, 3, 4, Some(32)).expect("invalid argon2 params");

    let hasher = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
    let mut key = vec![0u8; 32];
    hasher
        .hash_password_into(password.as_bytes(), salt, &mut key)
        .expect("argon2 hash failed");
    Zeroizing::new(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    fn keystore() -> KeyStore {
        KeyStore::new(Arc::new(MemoryStorage::new()))
    }

    #[test]
    fn uninitialized_store_refuses_access() {
        let ks = keystore();
        assert!(matches!(ks.open(None), Err(CoreError::NotInitialized)));
        assert!(ks.identity().is_err());
        assert!(ks.get_identity_key_pair().is_err());
    }

    #[test]
    fn plain_identity_roundtrip() {
        let ks = keystore();
        let identity = RatchetIdentity::generate();
        ks.initialize(&identity, None).unwrap();

        ks.logout();
        assert!(!ks.is_open());
        ks.open(None).unwrap();
        assert_eq!(
            ks.identity().unwrap().public_key_bytes(),
            identity.public_key_bytes()
        );
    }

    #[test]
    fn encrypted_identity_requires_password() {
        let ks = keystore();
        let identity = RatchetIdentity::generate();
        ks.initialize(&identity, Some("hunter2")).unwrap();
        ks.logout();

        assert!(matches!(ks.open(None), Err(CoreError::Auth(_))));
        assert!(matches!(ks.open(Some("wrong")), Err(CoreError::Auth(_))));

        ks.open(Some("hunter2")).unwrap();
        assert_eq!(
            ks.identity().unwrap().public_key_bytes(),
            identity.public_key_bytes()
        );
    }

    #[test]
    fn tofu_pins_first_key() {
        let ks = keystore();
        let key_a = vec![1u8; 32];
        let key_b = vec![2u8; 32];

        assert!(ks.is_trusted_identity("peer:1", &key_a).unwrap());
        assert!(!ks.save_identity("peer:1", &key_a).unwrap());

        assert!(ks.is_trusted_identity("peer:1", &key_a).unwrap());
        assert!(!ks.is_trusted_identity("peer:1", &key_b).unwrap());
        // Length mismatch is never trusted.
        assert!(!ks.is_trusted_identity("peer:1", &[1u8; 16]).unwrap());

        assert!(ks.save_identity("peer:1", &key_a).unwrap());
    }

    #[test]
    fn prekey_meta_tracks_max_id() {
        let ks = keystore();
        ks.store_prekey(3, &[0u8; 32]).unwrap();
        ks.store_prekey(7, &[0u8; 32]).unwrap();
        ks.remove_prekey(7).unwrap();

        assert_eq!(ks.count_prekeys().unwrap(), 1);
        // Max id survives consumption so replenishment never reuses ids.
        assert_eq!(ks.max_prekey_id().unwrap(), Some(7));
    }

    #[test]
    fn wipe_destroys_everything() {
        let ks = keystore();
        let identity = RatchetIdentity::generate();
        ks.initialize(&identity, None).unwrap();
        ks.store_prekey(1, &[0u8; 32]).unwrap();
        ks.store_session("peer:1", b"state").unwrap();

        ks.wipe().unwrap();
        assert!(!ks.is_open());
        assert!(!ks.has_identity().unwrap());
        assert_eq!(ks.count_prekeys().unwrap(), 0);
        assert!(!ks.has_session("peer:1").unwrap());
    }
}
