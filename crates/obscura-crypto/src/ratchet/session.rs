use std::sync::Arc;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

use crate::error::CryptoError;
use crate::identity::{x25519_from_identity, x25519_to_secret};
use crate::ratchet::prekeys::{verify_bundle, PreKeyBundle};
use crate::ratchet::store::{IdentityKeyStore, PreKeyStore, SessionStore};

/// Skipped message keys kept per session for out-of-order delivery.
const MAX_SKIPPED: usize = 512;
/// Largest forward jump in the receive counter we are willing to bridge.
const MAX_COUNTER_GAP: u64 = 512;

/// Wire tag of a ciphertext produced by [`RatchetCipher::encrypt`].
///
/// The first outbound message of a fresh session carries the prekey header
/// (and the PREKEY tag); everything after is plain ENCRYPTED.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CiphertextKind {
    Encrypted,
    PreKey,
}

impl CiphertextKind {
    pub const fn wire_tag(self) -> u32 {
        match self {
            CiphertextKind::Encrypted => 1,
            CiphertextKind::PreKey => 3,
        }
    }

    pub const fn from_wire_tag(tag: u32) -> Option<Self> {
        match tag {
            1 => Some(CiphertextKind::Encrypted),
            3 => Some(CiphertextKind::PreKey),
            _ => None,
        }
    }
}

/// A tagged ciphertext ready for the transport envelope.
#[derive(Debug, Clone)]
pub struct CipherMessage {
    pub kind: CiphertextKind,
    pub body: Vec<u8>,
}

/// One HKDF chain: evolving key plus the counter of the last message key
/// taken from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChainState {
    key: [u8; 32],
    counter: u64,
}

/// Prekey header the initiator attaches to its first message.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PendingPreKey {
    registration_id: u32,
    base_key: Vec<u8>,
    signed_prekey_id: u32,
    one_time_prekey_id: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SkippedKey {
    counter: u64,
    key: [u8; 32],
}

/// Persisted per-peer session record.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SessionState {
    root_key: [u8; 32],
    sending: ChainState,
    receiving: ChainState,
    /// Peer Ed25519 identity key pinned at establishment.
    their_identity: Vec<u8>,
    /// Responder side: base key of the PREKEY message that created this
    /// session, used to recognize duplicate prekey messages.
    their_base_key: Option<Vec<u8>>,
    /// Initiator side: header to attach to the first outbound message.
    pending_prekey: Option<PendingPreKey>,
    skipped: Vec<SkippedKey>,
}

/// Double-Ratchet-style session cipher over pluggable key stores.
///
/// X3DH establishes the shared root; per-message keys come off HKDF
/// symmetric chains with counters, and a bounded stash of skipped keys
/// covers out-of-order delivery.
pub struct RatchetCipher {
    identity_store: Arc<dyn IdentityKeyStore>,
    prekey_store: Arc<dyn PreKeyStore>,
    session_store: Arc<dyn SessionStore>,
}

impl RatchetCipher {
    pub fn new(
        identity_store: Arc<dyn IdentityKeyStore>,
        prekey_store: Arc<dyn PreKeyStore>,
        session_store: Arc<dyn SessionStore>,
    ) -> Self {
        Self {
            identity_store,
            prekey_store,
            session_store,
        }
    }

    pub fn has_session(&self, address: &str) -> Result<bool, CryptoError> {
        self.session_store.has_session(address)
    }

    /// Drop the session record so the next exchange rebuilds from a bundle.
    pub fn delete_session(&self, address: &str) -> Result<(), CryptoError> {
        self.session_store.delete_session(address)
    }

    /// Establish an initiator-side session from a fetched prekey bundle.
    ///
    /// The first subsequent [`Self::encrypt`] for this address yields a
    /// PREKEY-tagged message carrying the X3DH header.
    pub fn establish_outbound(
        &self,
        address: &str,
        bundle: &PreKeyBundle,
    ) -> Result<(), CryptoError> {
        verify_bundle(bundle)?;
        if !self
            .identity_store
            .is_trusted_identity(address, &bundle.identity_key)?
        {
            return Err(CryptoError::IdentityMismatch(address.to_string()));
        }

        let ephemeral = StaticSecret::random_from_rng(OsRng);
        let base_public = X25519Public::from(&ephemeral);

        let our_identity = self.our_x25519_secret()?;
        let their_identity = x25519_from_identity(&bundle.identity_key)?;
        let their_signed_prekey = X25519Public::from(
            <[u8; 32]>::try_from(bundle.signed_prekey.as_slice())
                .map_err(|_| CryptoError::InvalidKey("signed prekey wrong length".into()))?,
        );

        // X3DH: DH1 || DH2 || DH3 (|| DH4 with the one-time prekey)
        let mut ikm = Vec::with_capacity(128);
        ikm.extend_from_slice(our_identity.diffie_hellman(&their_signed_prekey).as_bytes());
        ikm.extend_from_slice(ephemeral.diffie_hellman(&their_identity).as_bytes());
        ikm.extend_from_slice(ephemeral.diffie_hellman(&their_signed_prekey).as_bytes());
        if let Some(ref otpk) = bundle.one_time_prekey {
            let their_otpk = X25519Public::from(
                <[u8; 32]>::try_from(otpk.as_slice())
                    .map_err(|_| CryptoError::InvalidKey("one-time prekey wrong length".into()))?,
            );
            ikm.extend_from_slice(ephemeral.diffie_hellman(&their_otpk).as_bytes());
        }

        let (root_key, sending, receiving) = derive_session_keys(&ikm, false)?;

        let state = SessionState {
            root_key,
            sending: ChainState {
                key: sending,
                counter: 0,
            },
            receiving: ChainState {
                key: receiving,
                counter: 0,
            },
            their_identity: bundle.identity_key.clone(),
            their_base_key: None,
            pending_prekey: Some(PendingPreKey {
                registration_id: self.identity_store.get_local_registration_id()?,
                base_key: base_public.as_bytes().to_vec(),
                signed_prekey_id: bundle.signed_prekey_id,
                one_time_prekey_id: bundle.one_time_prekey_id,
            }),
            skipped: Vec::new(),
        };

        self.identity_store
            .save_identity(address, &bundle.identity_key)?;
        self.store_state(address, &state)?;
        tracing::debug!(
            address,
            one_time = bundle.one_time_prekey_id.is_some(),
            "outbound session established"
        );
        Ok(())
    }

    /// Encrypt a plaintext for an established session.
    pub fn encrypt(&self, address: &str, plaintext: &[u8]) -> Result<CipherMessage, CryptoError> {
        let mut state = self
            .load_state(address)?
            .ok_or_else(|| CryptoError::SessionNotEstablished(address.to_string()))?;

        let (message_key, next_chain) = kdf_chain(&state.sending.key)?;
        state.sending.key = next_chain;
        state.sending.counter += 1;

        let mut nonce = [0u8; 12];
        nonce[4..].copy_from_slice(&state.sending.counter.to_le_bytes());
        let ciphertext = seal(&message_key, &nonce, plaintext)?;

        let mut inner = Vec::with_capacity(20 + ciphertext.len());
        inner.extend_from_slice(&state.sending.counter.to_le_bytes());
        inner.extend_from_slice(&nonce);
        inner.extend_from_slice(&ciphertext);

        let message = if let Some(pending) = state.pending_prekey.take() {
            let (_, our_public) = self.identity_store.get_identity_key_pair()?;
            CipherMessage {
                kind: CiphertextKind::PreKey,
                body: encode_prekey_body(&pending, &our_public, &inner)?,
            }
        } else {
            CipherMessage {
                kind: CiphertextKind::Encrypted,
                body: inner,
            }
        };

        self.store_state(address, &state)?;
        Ok(message)
    }

    /// Decrypt a tagged ciphertext from a peer.
    ///
    /// PREKEY messages establish the responder-side session on first sight
    /// and consume the referenced one-time prekey. Replayed or stale
    /// counters fail with [`CryptoError::MessageCounter`], which callers
    /// suppress without acknowledging.
    pub fn decrypt(
        &self,
        address: &str,
        kind: CiphertextKind,
        body: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        match kind {
            CiphertextKind::PreKey => self.decrypt_prekey(address, body),
            CiphertextKind::Encrypted => {
                let mut state = self
                    .load_state(address)?
                    .ok_or_else(|| CryptoError::SessionNotEstablished(address.to_string()))?;
                let plaintext = decrypt_with_chain(&mut state, body)?;
                self.store_state(address, &state)?;
                Ok(plaintext)
            }
        }
    }

    fn decrypt_prekey(&self, address: &str, body: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let (header, identity_key, inner) = decode_prekey_body(body)?;

        if !self
            .identity_store
            .is_trusted_identity(address, &identity_key)?
        {
            return Err(CryptoError::IdentityMismatch(address.to_string()));
        }

        let existing = self.load_state(address)?;
        let duplicate = existing
            .as_ref()
            .is_some_and(|s| s.their_base_key.as_deref() == Some(header.base_key.as_slice()));

        let mut state = if duplicate {
            // Redelivery of the prekey message that built this session.
            existing.ok_or_else(|| CryptoError::SessionNotEstablished(address.to_string()))?
        } else {
            self.establish_inbound(&header, &identity_key)?
        };

        let plaintext = decrypt_with_chain(&mut state, inner)?;

        if !duplicate {
            self.identity_store.save_identity(address, &identity_key)?;
            if let Some(otpk_id) = header.one_time_prekey_id {
                self.prekey_store.remove_prekey(otpk_id)?;
            }
        }
        self.store_state(address, &state)?;
        Ok(plaintext)
    }

    /// Responder-side X3DH from a prekey header.
    fn establish_inbound(
        &self,
        header: &PendingPreKey,
        identity_key: &[u8],
    ) -> Result<SessionState, CryptoError> {
        let our_identity = self.our_x25519_secret()?;

        let spk_data = self
            .prekey_store
            .load_signed_prekey(header.signed_prekey_id)?
            .ok_or_else(|| CryptoError::PreKey("signed prekey not found".into()))?;
        let signed_prekey_secret = StaticSecret::from(
            <[u8; 32]>::try_from(spk_data.as_slice())
                .map_err(|_| CryptoError::InvalidKey("signed prekey wrong length".into()))?,
        );

        let their_identity = x25519_from_identity(identity_key)?;
        let their_base = X25519Public::from(
            <[u8; 32]>::try_from(header.base_key.as_slice())
                .map_err(|_| CryptoError::InvalidKey("base key wrong length".into()))?,
        );

        // Mirror of the initiator: DH1/DH2 swap identity and prekey roles.
        let mut ikm = Vec::with_capacity(128);
        ikm.extend_from_slice(signed_prekey_secret.diffie_hellman(&their_identity).as_bytes());
        ikm.extend_from_slice(our_identity.diffie_hellman(&their_base).as_bytes());
        ikm.extend_from_slice(signed_prekey_secret.diffie_hellman(&their_base).as_bytes());
        if let Some(otpk_id) = header.one_time_prekey_id {
            let otpk_data = self
                .prekey_store
                .load_prekey(otpk_id)?
                .ok_or_else(|| CryptoError::PreKey("one-time prekey not found".into()))?;
            let otpk_secret = StaticSecret::from(
                <[u8; 32]>::try_from(otpk_data.as_slice())
                    .map_err(|_| CryptoError::InvalidKey("one-time prekey wrong length".into()))?,
            );
            ikm.extend_from_slice(otpk_secret.diffie_hellman(&their_base).as_bytes());
        }

        let (root_key, sending, receiving) = derive_session_keys(&ikm, true)?;

        Ok(SessionState {
            root_key,
            sending: ChainState {
                key: sending,
                counter: 0,
            },
            receiving: ChainState {
                key: receiving,
                counter: 0,
            },
            their_identity: identity_key.to_vec(),
            their_base_key: Some(header.base_key.clone()),
            pending_prekey: None,
            skipped: Vec::new(),
        })
    }

    fn our_x25519_secret(&self) -> Result<StaticSecret, CryptoError> {
        let (seed, _) = self.identity_store.get_identity_key_pair()?;
        let seed: [u8; 32] = seed
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("identity seed wrong length".into()))?;
        Ok(x25519_to_secret(&seed))
    }

    fn load_state(&self, address: &str) -> Result<Option<SessionState>, CryptoError> {
        match self.session_store.load_session(address)? {
            Some(data) => {
                let state = serde_json::from_slice(&data)
                    .map_err(|e| CryptoError::Storage(format!("corrupt session record: {e}")))?;
                Ok(Some(state))
            }
            None => Ok(None),
        }
    }

    fn store_state(&self, address: &str, state: &SessionState) -> Result<(), CryptoError> {
        let data = serde_json::to_vec(state)
            .map_err(|e| CryptoError::Storage(format!("serialize session record: {e}")))?;
        self.session_store.store_session(address, &data)
    }
}

/// Derive root + chain keys from X3DH output. The responder swaps the
/// sending and receiving chains relative to the initiator.
fn derive_session_keys(
    ikm: &[u8],
    responder: bool,
) -> Result<([u8; 32], [u8; 32], [u8; 32]), CryptoError> {
    let hk = Hkdf::<Sha256>::new(None, ikm);
    let mut okm = [0u8; 96];
    hk.expand(b"ObscuraX3DH", &mut okm)
        .map_err(|e| CryptoError::KeyGeneration(format!("HKDF expand failed: {e}")))?;

    let mut root_key = [0u8; 32];
    let mut chain_a = [0u8; 32];
    let mut chain_b = [0u8; 32];
    root_key.copy_from_slice(&okm[..32]);
    chain_a.copy_from_slice(&okm[32..64]);
    chain_b.copy_from_slice(&okm[64..96]);

    if responder {
        Ok((root_key, chain_b, chain_a))
    } else {
        Ok((root_key, chain_a, chain_b))
    }
}

/// Advance a chain key one step, yielding the message key for the next
/// counter value.
fn kdf_chain(chain_key: &[u8; 32]) -> Result<([u8; 32], [u8; 32]), CryptoError> {
    let hk = Hkdf::<Sha256>::new(None, chain_key);
    let mut message_key = [0u8; 32];
    let mut next_chain_key = [0u8; 32];
    hk.expand(b"ObscuraMsgKey", &mut message_key)
        .map_err(|e| CryptoError::KeyGeneration(format!("HKDF: {e}")))?;
    hk.expand(b"ObscuraChainKey", &mut next_chain_key)
        .map_err(|e| CryptoError::KeyGeneration(format!("HKDF: {e}")))?;
    Ok((message_key, next_chain_key))
}

fn seal(key: &[u8; 32], nonce: &[u8; 12], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;
    cipher
        .encrypt(Nonce::from_slice(nonce), plaintext)
        .map_err(|e| CryptoError::KeyGeneration(e.to_string()))
}

fn open(key: &[u8; 32], nonce: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::DecryptAuth("ratchet message".into()))
}

/// Decrypt `counter || nonce || ciphertext` against the receiving chain,
/// bridging forward gaps with skipped keys and consuming stashed keys for
/// late arrivals.
fn decrypt_with_chain(state: &mut SessionState, body: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if body.len() < 20 {
        return Err(CryptoError::Malformed("ciphertext too short".into()));
    }
    let counter = u64::from_le_bytes(
        body[..8]
            .try_into()
            .map_err(|_| CryptoError::Malformed("invalid counter".into()))?,
    );
    let nonce = &body[8..20];
    let ciphertext = &body[20..];

    if counter <= state.receiving.counter {
        // Late or replayed: a stashed skipped key decrypts it exactly once.
        if let Some(pos) = state.skipped.iter().position(|s| s.counter == counter) {
            let key = state.skipped.remove(pos).key;
            return open(&key, nonce, ciphertext);
        }
        return Err(CryptoError::MessageCounter(format!(
            "counter {counter} <= {}",
            state.receiving.counter
        )));
    }

    let gap = counter - state.receiving.counter;
    if gap > MAX_COUNTER_GAP {
        return Err(CryptoError::MessageCounter(format!(
            "counter gap {gap} exceeds {MAX_COUNTER_GAP}"
        )));
    }

    while state.receiving.counter + 1 < counter {
        let (message_key, next_chain) = kdf_chain(&state.receiving.key)?;
        state.receiving.key = next_chain;
        state.receiving.counter += 1;
        state.skipped.push(SkippedKey {
            counter: state.receiving.counter,
            key: message_key,
        });
    }
    if state.skipped.len() > MAX_SKIPPED {
        let excess = state.skipped.len() - MAX_SKIPPED;
        state.skipped.drain(..excess);
    }

    let (message_key, next_chain) = kdf_chain(&state.receiving.key)?;
    state.receiving.key = next_chain;
    state.receiving.counter += 1;
    open(&message_key, nonce, ciphertext)
}

// Prekey body: registration_id u32 | identity_key 32 | base_key 32 |
// signed_prekey_id u32 | otpk flag u8 [| otpk_id u32] | inner message.
fn encode_prekey_body(
    pending: &PendingPreKey,
    identity_key: &[u8],
    inner: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if identity_key.len() != 32 || pending.base_key.len() != 32 {
        return Err(CryptoError::InvalidKey("prekey header key length".into()));
    }
    let mut body = Vec::with_capacity(77 + inner.len());
    body.extend_from_slice(&pending.registration_id.to_le_bytes());
    body.extend_from_slice(identity_key);
    body.extend_from_slice(&pending.base_key);
    body.extend_from_slice(&pending.signed_prekey_id.to_le_bytes());
    match pending.one_time_prekey_id {
        Some(id) => {
            body.push(1);
            body.extend_from_slice(&id.to_le_bytes());
        }
        None => body.push(0),
    }
    body.extend_from_slice(inner);
    Ok(body)
}

fn decode_prekey_body(body: &[u8]) -> Result<(PendingPreKey, Vec<u8>, &[u8]), CryptoError> {
    if body.len() < 73 {
        return Err(CryptoError::Malformed("prekey body too short".into()));
    }
    let registration_id = u32::from_le_bytes(
        body[..4]
            .try_into()
            .map_err(|_| CryptoError::Malformed("invalid registration id".into()))?,
    );
    let identity_key = body[4..36].to_vec();
    let base_key = body[36..68].to_vec();
    let signed_prekey_id = u32::from_le_bytes(
        body[68..72]
            .try_into()
            .map_err(|_| CryptoError::Malformed("invalid signed prekey id".into()))?,
    );
    let (one_time_prekey_id, rest) = match body[72] {
        0 => (None, &body[73..]),
        1 => {
            if body.len() < 77 {
                return Err(CryptoError::Malformed("prekey body too short".into()));
            }
            let id = u32::from_le_bytes(
                body[73..77]
                    .try_into()
                    .map_err(|_| CryptoError::Malformed("invalid one-time prekey id".into()))?,
            );
            (Some(id), &body[77..])
        }
        other => {
            return Err(CryptoError::Malformed(format!(
                "invalid one-time prekey flag {other}"
            )))
        }
    };
    let header = PendingPreKey {
        registration_id,
        base_key,
        signed_prekey_id,
        one_time_prekey_id,
    };
    Ok((header, identity_key, rest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::RatchetIdentity;
    use crate::ratchet::memory_stores::{
        MemoryIdentityStore, MemoryPreKeyStore, MemorySessionStore,
    };
    use crate::ratchet::prekeys::{generate_prekey_batch, generate_signed_prekey};

    struct Party {
        cipher: RatchetCipher,
        identity: RatchetIdentity,
        prekeys: Arc<MemoryPreKeyStore>,
    }

    fn make_party() -> Party {
        let identity = RatchetIdentity::generate();
        let identity_store = Arc::new(MemoryIdentityStore::new(
            identity.secret_seed_bytes().to_vec(),
            identity.public_key_bytes().to_vec(),
            identity.registration_id(),
        ));
        let prekeys = Arc::new(MemoryPreKeyStore::new());
        let sessions = Arc::new(MemorySessionStore::new());
        let cipher = RatchetCipher::new(identity_store, prekeys.clone(), sessions);
        Party {
            cipher,
            identity,
            prekeys,
        }
    }

    fn bundle_for(party: &Party, with_otpk: bool) -> PreKeyBundle {
        let spk = generate_signed_prekey(&party.identity, party.prekeys.as_ref(), 1).unwrap();
        let otpk = if with_otpk {
            let batch = generate_prekey_batch(party.prekeys.as_ref(), 1, 1).unwrap();
            Some(batch.into_iter().next().unwrap())
        } else {
            None
        };
        PreKeyBundle {
            identity_key: party.identity.public_key_bytes().to_vec(),
            registration_id: party.identity.registration_id(),
            signed_prekey_id: spk.key_id,
            signed_prekey: spk.public_key,
            signed_prekey_signature: spk.signature,
            one_time_prekey_id: otpk.as_ref().map(|p| p.key_id),
            one_time_prekey: otpk.map(|p| p.public_key),
        }
    }

    #[test]
    fn first_message_is_prekey_then_encrypted() {
        let alice = make_party();
        let bob = make_party();
        let bundle = bundle_for(&bob, true);

        alice.cipher.establish_outbound("bob:1", &bundle).unwrap();

        let m1 = alice.cipher.encrypt("bob:1", b"one").unwrap();
        let m2 = alice.cipher.encrypt("bob:1", b"two").unwrap();
        assert_eq!(m1.kind, CiphertextKind::PreKey);
        assert_eq!(m2.kind, CiphertextKind::Encrypted);

        assert_eq!(bob.cipher.decrypt("alice:1", m1.kind, &m1.body).unwrap(), b"one");
        assert_eq!(bob.cipher.decrypt("alice:1", m2.kind, &m2.body).unwrap(), b"two");
    }

    #[test]
    fn bidirectional_after_establishment() {
        let alice = make_party();
        let bob = make_party();
        let bundle = bundle_for(&bob, false);

        alice.cipher.establish_outbound("bob:1", &bundle).unwrap();
        let m1 = alice.cipher.encrypt("bob:1", b"hello bob").unwrap();
        bob.cipher.decrypt("alice:1", m1.kind, &m1.body).unwrap();

        let reply = bob.cipher.encrypt("alice:1", b"hello alice").unwrap();
        assert_eq!(reply.kind, CiphertextKind::Encrypted);
        assert_eq!(
            alice.cipher.decrypt("bob:1", reply.kind, &reply.body).unwrap(),
            b"hello alice"
        );
    }

    #[test]
    fn out_of_order_decrypts_via_skipped_keys() {
        let alice = make_party();
        let bob = make_party();
        let bundle = bundle_for(&bob, false);
        alice.cipher.establish_outbound("bob:1", &bundle).unwrap();

        let m1 = alice.cipher.encrypt("bob:1", b"first").unwrap();
        let m2 = alice.cipher.encrypt("bob:1", b"second").unwrap();
        let m3 = alice.cipher.encrypt("bob:1", b"third").unwrap();

        assert_eq!(bob.cipher.decrypt("alice:1", m1.kind, &m1.body).unwrap(), b"first");
        assert_eq!(bob.cipher.decrypt("alice:1", m3.kind, &m3.body).unwrap(), b"third");
        assert_eq!(bob.cipher.decrypt("alice:1", m2.kind, &m2.body).unwrap(), b"second");
    }

    #[test]
    fn replay_is_rejected_with_message_counter() {
        let alice = make_party();
        let bob = make_party();
        let bundle = bundle_for(&bob, false);
        alice.cipher.establish_outbound("bob:1", &bundle).unwrap();

        let m1 = alice.cipher.encrypt("bob:1", b"once").unwrap();
        bob.cipher.decrypt("alice:1", m1.kind, &m1.body).unwrap();
        let m2 = alice.cipher.encrypt("bob:1", b"twice").unwrap();
        bob.cipher.decrypt("alice:1", m2.kind, &m2.body).unwrap();

        let err = bob.cipher.decrypt("alice:1", m2.kind, &m2.body).unwrap_err();
        assert!(matches!(err, CryptoError::MessageCounter(_)));
    }

    #[test]
    fn tampered_ciphertext_fails_auth() {
        let alice = make_party();
        let bob = make_party();
        let bundle = bundle_for(&bob, false);
        alice.cipher.establish_outbound("bob:1", &bundle).unwrap();

        let m1 = alice.cipher.encrypt("bob:1", b"seal me").unwrap();
        bob.cipher.decrypt("alice:1", m1.kind, &m1.body).unwrap();

        let mut m2 = alice.cipher.encrypt("bob:1", b"tamper me").unwrap();
        let last = m2.body.len() - 1;
        m2.body[last] ^= 0xff;
        let err = bob.cipher.decrypt("alice:1", m2.kind, &m2.body).unwrap_err();
        assert!(matches!(err, CryptoError::DecryptAuth(_)));
    }

    #[test]
    fn one_time_prekey_is_consumed() {
        let alice = make_party();
        let bob = make_party();
        let bundle = bundle_for(&bob, true);
        alice.cipher.establish_outbound("bob:1", &bundle).unwrap();

        assert_eq!(bob.prekeys.count_prekeys().unwrap(), 1);
        let m1 = alice.cipher.encrypt("bob:1", b"consume").unwrap();
        bob.cipher.decrypt("alice:1", m1.kind, &m1.body).unwrap();
        assert_eq!(bob.prekeys.count_prekeys().unwrap(), 0);
    }

    #[test]
    fn duplicate_prekey_message_does_not_rebuild_session() {
        let alice = make_party();
        let bob = make_party();
        let bundle = bundle_for(&bob, false);
        alice.cipher.establish_outbound("bob:1", &bundle).unwrap();

        let m1 = alice.cipher.encrypt("bob:1", b"dup").unwrap();
        bob.cipher.decrypt("alice:1", m1.kind, &m1.body).unwrap();
        // Redelivery: same prekey body, already-used counter.
        let err = bob.cipher.decrypt("alice:1", m1.kind, &m1.body).unwrap_err();
        assert!(matches!(err, CryptoError::MessageCounter(_)));

        // Session still works afterwards.
        let m2 = alice.cipher.encrypt("bob:1", b"still fine").unwrap();
        assert_eq!(
            bob.cipher.decrypt("alice:1", m2.kind, &m2.body).unwrap(),
            b"still fine"
        );
    }

    #[test]
    fn identity_change_is_rejected() {
        let alice = make_party();
        let bob = make_party();
        let mallory = make_party();

        let bundle = bundle_for(&bob, false);
        alice.cipher.establish_outbound("bob:1", &bundle).unwrap();

        // A bundle for the same address under a different identity key.
        let fake = bundle_for(&mallory, false);
        let err = alice.cipher.establish_outbound("bob:1", &fake).unwrap_err();
        assert!(matches!(err, CryptoError::IdentityMismatch(_)));
    }

    #[test]
    fn session_reset_requires_new_bundle() {
        let alice = make_party();
        let bob = make_party();
        let bundle = bundle_for(&bob, false);
        alice.cipher.establish_outbound("bob:1", &bundle).unwrap();
        alice.cipher.encrypt("bob:1", b"x").unwrap();

        alice.cipher.delete_session("bob:1").unwrap();
        let err = alice.cipher.encrypt("bob:1", b"y").unwrap_err();
        assert!(matches!(err, CryptoError::SessionNotEstablished(_)));
    }
}
