//! Recovery keypair: 12-word phrase derivation, backup ECIES, and
//! revocation signatures.
//!
//! The phrase deterministically derives an Ed25519 keypair. Its public key
//! is stored on every linked device and shared with friends; the private
//! key exists only for the moments a phrase is typed in (backup import,
//! device revocation) and is dropped immediately after.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use bip39::{Language, Mnemonic, MnemonicType, Seed};
use ed25519_dalek::{Signer, SigningKey};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore as _;
use sha2::Sha256;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::Zeroizing;

use crate::error::CryptoError;
use crate::identity::{x25519_from_identity, x25519_to_secret, RatchetIdentity};

const ECIES_INFO: &[u8] = b"ObscuraBackupV1";
const EPHEMERAL_LEN: usize = 32;
const NONCE_LEN: usize = 12;
/// AES-256-GCM appends a 16-byte tag to the ciphertext.
const TAG_LEN: usize = 16;

/// An Ed25519 keypair derived from a BIP39 recovery phrase.
pub struct RecoveryKeyPair {
    signing_key: SigningKey,
}

impl RecoveryKeyPair {
    /// Generate a fresh keypair, returning it together with its 12-word
    /// phrase for the user to write down.
    pub fn generate() -> (Self, String) {
        let mnemonic = Mnemonic::new(MnemonicType::Words12, Language::English);
        let phrase = mnemonic.phrase().to_string();
        let keypair = Self::from_mnemonic(&mnemonic);
        (keypair, phrase)
    }

    /// Re-derive the keypair from a phrase typed in by the user.
    pub fn from_phrase(phrase: &str) -> Result<Self, CryptoError> {
        let mnemonic = Mnemonic::from_phrase(phrase.trim(), Language::English)
            .map_err(|e| CryptoError::Mnemonic(e.to_string()))?;
        Ok(Self::from_mnemonic(&mnemonic))
    }

    fn from_mnemonic(mnemonic: &Mnemonic) -> Self {
        let seed = Seed::new(mnemonic, "");
        let mut key_seed = Zeroizing::new([0u8; 32]);
        key_seed.copy_from_slice(&seed.as_bytes()[..32]);
        Self {
            signing_key: SigningKey::from_bytes(&key_seed),
        }
    }

    /// The recovery public key stored on devices and shared with friends.
    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Sign a revocation payload.
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing_key.sign(message).to_bytes()
    }

    /// Decrypt an ECIES payload addressed to this recovery key.
    pub fn ecies_open(&self, blob: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if blob.len() < EPHEMERAL_LEN + NONCE_LEN + TAG_LEN {
            return Err(CryptoError::Malformed("ECIES payload too short".into()));
        }
        let ephemeral: [u8; 32] = blob[..EPHEMERAL_LEN]
            .try_into()
            .map_err(|_| CryptoError::Malformed("invalid ephemeral key".into()))?;
        let nonce = &blob[EPHEMERAL_LEN..EPHEMERAL_LEN + NONCE_LEN];
        let ciphertext = &blob[EPHEMERAL_LEN + NONCE_LEN..];

        let secret = x25519_to_secret(&self.signing_key.to_bytes());
        let shared = secret.diffie_hellman(&X25519Public::from(ephemeral));
        let key = derive_ecies_key(shared.as_bytes(), &ephemeral)?;

        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;
        cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::DecryptAuth("backup payload".into()))
    }
}

impl std::fmt::Debug for RecoveryKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryKeyPair")
            .field("public_key", &hex::encode(self.public_key_bytes()))
            .finish()
    }
}

/// Encrypt a payload to a recovery public key with a one-shot sender
/// keypair. Output layout: `ephemeral_pub(32) || nonce(12) || ciphertext+tag`.
pub fn ecies_seal(recovery_public_key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let recipient = x25519_from_identity(recovery_public_key)?;

    let ephemeral_secret = StaticSecret::random_from_rng(OsRng);
    let ephemeral_public = X25519Public::from(&ephemeral_secret);
    let shared = ephemeral_secret.diffie_hellman(&recipient);
    let key = derive_ecies_key(shared.as_bytes(), ephemeral_public.as_bytes())?;

    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let cipher = Aes256Gcm::new_from_slice(&key)
        .map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;

    let mut out = Vec::with_capacity(EPHEMERAL_LEN + NONCE_LEN + ciphertext.len());
    out.extend_from_slice(ephemeral_public.as_bytes());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Verify a revocation signature against a stored recovery public key.
pub fn verify_recovery_signature(
    recovery_public_key: &[u8],
    message: &[u8],
    signature: &[u8],
) -> Result<(), CryptoError> {
    RatchetIdentity::verify(recovery_public_key, message, signature)
}

fn derive_ecies_key(shared: &[u8], ephemeral_public: &[u8]) -> Result<[u8; 32], CryptoError> {
    let hk = Hkdf::<Sha256>::new(Some(ephemeral_public), shared);
    let mut key = [0u8; 32];
    hk.expand(ECIES_INFO, &mut key)
        .map_err(|e| CryptoError::KeyGeneration(format!("HKDF expand failed: {e}")))?;
    Ok(key)
}
