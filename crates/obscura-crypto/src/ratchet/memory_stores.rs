//! In-memory implementations of the ratchet storage traits.
//!
//! Used by unit tests and as a scratch store before an account is opened.
//! Data is lost on process exit; the durable implementations live in the
//! core crate's keystore.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::ratchet::store::{IdentityKeyStore, PreKeyStore, SessionStore};
use crate::CryptoError;

/// In-memory identity key store with TOFU-pinned peer keys.
pub struct MemoryIdentityStore {
    identity_seed: Vec<u8>,
    identity_public: Vec<u8>,
    registration_id: u32,
    trusted: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryIdentityStore {
    pub fn new(identity_seed: Vec<u8>, identity_public: Vec<u8>, registration_id: u32) -> Self {
        Self {
            identity_seed,
            identity_public,
            registration_id,
            trusted: Mutex::new(HashMap::new()),
        }
    }
}

impl IdentityKeyStore for MemoryIdentityStore {
    fn get_identity_key_pair(&self) -> Result<(Vec<u8>, Vec<u8>), CryptoError> {
        Ok((self.identity_seed.clone(), self.identity_public.clone()))
    }

    fn get_local_registration_id(&self) -> Result<u32, CryptoError> {
        Ok(self.registration_id)
    }

    fn is_trusted_identity(&self, address: &str, identity_key: &[u8]) -> Result<bool, CryptoError> {
        let trusted = self.trusted.lock().unwrap();
        match trusted.get(address) {
            Some(stored) => Ok(stored == identity_key),
            None => Ok(true), // TOFU: trust on first use
        }
    }

    fn save_identity(&self, address: &str, identity_key: &[u8]) -> Result<bool, CryptoError> {
        let mut trusted = self.trusted.lock().unwrap();
        let existing = trusted
            .insert(address.to_string(), identity_key.to_vec())
            .is_some();
        Ok(existing)
    }
}

/// In-memory one-time and signed prekey store.
pub struct MemoryPreKeyStore {
    prekeys: Mutex<HashMap<u32, Vec<u8>>>,
    max_prekey_id: Mutex<Option<u32>>,
    signed_prekeys: Mutex<HashMap<u32, Vec<u8>>>,
    latest_signed_id: Mutex<Option<u32>>,
}

impl MemoryPreKeyStore {
    pub fn new() -> Self {
        Self {
            prekeys: Mutex::new(HashMap::new()),
            max_prekey_id: Mutex::new(None),
            signed_prekeys: Mutex::new(HashMap::new()),
            latest_signed_id: Mutex::new(None),
        }
    }
}

impl Default for MemoryPreKeyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PreKeyStore for MemoryPreKeyStore {
    fn load_prekey(&self, prekey_id: u32) -> Result<Option<Vec<u8>>, CryptoError> {
        Ok(self.prekeys.lock().unwrap().get(&prekey_id).cloned())
    }

    fn store_prekey(&self, prekey_id: u32, key_data: &[u8]) -> Result<(), CryptoError> {
        self.prekeys
            .lock()
            .unwrap()
            .insert(prekey_id, key_data.to_vec());
        let mut max = self.max_prekey_id.lock().unwrap();
        *max = Some(max.map_or(prekey_id, |m| m.max(prekey_id)));
        Ok(())
    }

    fn remove_prekey(&self, prekey_id: u32) -> Result<(), CryptoError> {
        self.prekeys.lock().unwrap().remove(&prekey_id);
        Ok(())
    }

    fn count_prekeys(&self) -> Result<u32, CryptoError> {
        Ok(u32::try_from(self.prekeys.lock().unwrap().len()).unwrap_or(u32::MAX))
    }

    fn max_prekey_id(&self) -> Result<Option<u32>, CryptoError> {
        Ok(*self.max_prekey_id.lock().unwrap())
    }

    fn load_signed_prekey(&self, signed_prekey_id: u32) -> Result<Option<Vec<u8>>, CryptoError> {
        Ok(self
            .signed_prekeys
            .lock()
            .unwrap()
            .get(&signed_prekey_id)
            .cloned())
    }

    fn store_signed_prekey(
        &self,
        signed_prekey_id: u32,
        key_data: &[u8],
    ) -> Result<(), CryptoError> {
        self.signed_prekeys
            .lock()
            .unwrap()
            .insert(signed_prekey_id, key_data.to_vec());
        *self.latest_signed_id.lock().unwrap() = Some(signed_prekey_id);
        Ok(())
    }

    fn latest_signed_prekey_id(&self) -> Result<Option<u32>, CryptoError> {
        Ok(*self.latest_signed_id.lock().unwrap())
    }
}

/// In-memory session store keyed by peer address.
pub struct MemorySessionStore {
    sessions: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore for MemorySessionStore {
    fn load_session(&self, address: &str) -> Result<Option<Vec<u8>>, CryptoError> {
        Ok(self.sessions.lock().unwrap().get(address).cloned())
    }

    fn store_session(&self, address: &str, session_data: &[u8]) -> Result<(), CryptoError> {
        self.sessions
            .lock()
            .unwrap()
            .insert(address.to_string(), session_data.to_vec());
        Ok(())
    }

    fn has_session(&self, address: &str) -> Result<bool, CryptoError> {
        Ok(self.sessions.lock().unwrap().contains_key(address))
    }

    fn delete_session(&self, address: &str) -> Result<(), CryptoError> {
        self.sessions.lock().unwrap().remove(address);
        Ok(())
    }
}
