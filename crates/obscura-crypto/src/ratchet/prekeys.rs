//! Prekey generation and bundle assembly.
//!
//! A device uploads its signed prekey plus a batch of one-time prekeys at
//! registration; peers fetch a bundle to establish a session offline.

use rand::rngs::OsRng;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

use crate::error::CryptoError;
use crate::identity::RatchetIdentity;
use crate::ratchet::store::PreKeyStore;

/// A peer's published keys, fetched to bootstrap a session.
#[derive(Debug, Clone)]
pub struct PreKeyBundle {
    /// Ed25519 identity public key.
    pub identity_key: Vec<u8>,
    pub registration_id: u32,
    pub signed_prekey_id: u32,
    /// X25519 signed prekey (public).
    pub signed_prekey: Vec<u8>,
    /// Ed25519 signature over the signed prekey by the identity key.
    pub signed_prekey_signature: Vec<u8>,
    pub one_time_prekey_id: Option<u32>,
    /// One-time prekey (public), consumed server-side on handout.
    pub one_time_prekey: Option<Vec<u8>>,
}

/// A freshly generated one-time prekey, public half only.
///
/// The secret half is already in the [`PreKeyStore`] by the time this is
/// returned; only the public half travels to the server.
#[derive(Debug, Clone)]
pub struct PreKeyPublic {
    pub key_id: u32,
    pub public_key: Vec<u8>,
}

/// A signed prekey ready for upload.
#[derive(Debug, Clone)]
pub struct SignedPreKeyPublic {
    pub key_id: u32,
    pub public_key: Vec<u8>,
    pub signature: Vec<u8>,
}

/// Generate `count` one-time prekeys with ids starting at `start_id`.
///
/// Secrets are stored; the returned public halves go to the server.
pub fn generate_prekey_batch(
    store: &dyn PreKeyStore,
    start_id: u32,
    count: u32,
) -> Result<Vec<PreKeyPublic>, CryptoError> {
    let mut batch = Vec::with_capacity(count as usize);
    for offset in 0..count {
        let key_id = start_id
            .checked_add(offset)
            .ok_or_else(|| CryptoError::PreKey("prekey id space exhausted".into()))?;
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = X25519Public::from(&secret);
        store.store_prekey(key_id, secret.as_bytes())?;
        batch.push(PreKeyPublic {
            key_id,
            public_key: public.as_bytes().to_vec(),
        });
    }
    Ok(batch)
}

/// Generate and store a signed prekey, signing its public half with the
/// device identity key.
pub fn generate_signed_prekey(
    identity: &RatchetIdentity,
    store: &dyn PreKeyStore,
    key_id: u32,
) -> Result<SignedPreKeyPublic, CryptoError> {
    let secret = StaticSecret::random_from_rng(OsRng);
    let public = X25519Public::from(&secret);
    store.store_signed_prekey(key_id, secret.as_bytes())?;
    let signature = identity.sign(public.as_bytes());
    Ok(SignedPreKeyPublic {
        key_id,
        public_key: public.as_bytes().to_vec(),
        signature: signature.to_vec(),
    })
}

/// Verify a bundle's signed-prekey signature against its identity key.
pub fn verify_bundle(bundle: &PreKeyBundle) -> Result<(), CryptoError> {
    RatchetIdentity::verify(
        &bundle.identity_key,
        &bundle.signed_prekey,
        &bundle.signed_prekey_signature,
    )
    .map_err(|_| CryptoError::PreKey("signed prekey signature invalid".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratchet::memory_stores::MemoryPreKeyStore;

    #[test]
    fn batch_ids_are_contiguous() {
        let store = MemoryPreKeyStore::new();
        let batch = generate_prekey_batch(&store, 10, 5).unwrap();
        let ids: Vec<u32> = batch.iter().map(|p| p.key_id).collect();
        assert_eq!(ids, vec![10, 11, 12, 13, 14]);
        assert_eq!(store.count_prekeys().unwrap(), 5);
        assert_eq!(store.max_prekey_id().unwrap(), Some(14));
    }

    #[test]
    fn signed_prekey_signature_verifies() {
        let identity = RatchetIdentity::generate();
        let store = MemoryPreKeyStore::new();
        let spk = generate_signed_prekey(&identity, &store, 1).unwrap();

        let bundle = PreKeyBundle {
            identity_key: identity.public_key_bytes().to_vec(),
            registration_id: identity.registration_id(),
            signed_prekey_id: spk.key_id,
            signed_prekey: spk.public_key,
            signed_prekey_signature: spk.signature,
            one_time_prekey_id: None,
            one_time_prekey: None,
        };
        assert!(verify_bundle(&bundle).is_ok());
    }

    #[test]
    fn tampered_bundle_is_rejected() {
        let identity = RatchetIdentity::generate();
        let store = MemoryPreKeyStore::new();
        let spk = generate_signed_prekey(&identity, &store, 1).unwrap();

        let mut tampered = spk.public_key;
        tampered[0] ^= 0xff;
        let bundle = PreKeyBundle {
            identity_key: identity.public_key_bytes().to_vec(),
            registration_id: identity.registration_id(),
            signed_prekey_id: spk.key_id,
            signed_prekey: tampered,
            signed_prekey_signature: spk.signature,
            one_time_prekey_id: None,
            one_time_prekey: None,
        };
        assert!(verify_bundle(&bundle).is_err());
    }
}
