use crate::CryptoError;

/// Storage trait for ratchet identity keys and peer trust.
///
/// Peer identities follow TOFU: the first key seen for an address is
/// pinned; later keys must match byte-for-byte.
pub trait IdentityKeyStore: Send + Sync {
    /// Our own identity key pair (Ed25519 seed + public).
    fn get_identity_key_pair(&self) -> Result<(Vec<u8>, Vec<u8>), CryptoError>;

    /// Our local registration id.
    fn get_local_registration_id(&self) -> Result<u32, CryptoError>;

    /// Whether `identity_key` is acceptable for `address`.
    ///
    /// True when no key is pinned yet, or when the pinned key is
    /// byte-equal. A length mismatch is never trusted.
    fn is_trusted_identity(&self, address: &str, identity_key: &[u8]) -> Result<bool, CryptoError>;

    /// Pin a peer identity key, recording first/last-seen times.
    ///
    /// Returns `true` when the address already had a pinned key.
    fn save_identity(&self, address: &str, identity_key: &[u8]) -> Result<bool, CryptoError>;
}

/// Storage trait for one-time and signed prekeys.
///
/// One-time prekeys are consumed on first use; the replenishment logic
/// needs the live count and the highest id handed out so far.
pub trait PreKeyStore: Send + Sync {
    fn load_prekey(&self, prekey_id: u32) -> Result<Option<Vec<u8>>, CryptoError>;

    fn store_prekey(&self, prekey_id: u32, key_data: &[u8]) -> Result<(), CryptoError>;

    /// Remove a consumed prekey.
    fn remove_prekey(&self, prekey_id: u32) -> Result<(), CryptoError>;

    /// Number of unconsumed one-time prekeys.
    fn count_prekeys(&self) -> Result<u32, CryptoError>;

    /// Highest one-time prekey id ever stored, if any.
    fn max_prekey_id(&self) -> Result<Option<u32>, CryptoError>;

    fn load_signed_prekey(&self, signed_prekey_id: u32) -> Result<Option<Vec<u8>>, CryptoError>;

    fn store_signed_prekey(
        &self,
        signed_prekey_id: u32,
        key_data: &[u8],
    ) -> Result<(), CryptoError>;

    /// Id of the most recently stored signed prekey, if any.
    fn latest_signed_prekey_id(&self) -> Result<Option<u32>, CryptoError>;
}

/// Storage trait for per-peer session records.
///
/// Sessions are keyed by the peer address string `{peer_user_id}:{device_index}`.
pub trait SessionStore: Send + Sync {
    fn load_session(&self, address: &str) -> Result<Option<Vec<u8>>, CryptoError>;

    fn store_session(&self, address: &str, session_data: &[u8]) -> Result<(), CryptoError>;

    fn has_session(&self, address: &str) -> Result<bool, CryptoError>;

    /// Delete a session (explicit session reset).
    fn delete_session(&self, address: &str) -> Result<(), CryptoError>;
}
