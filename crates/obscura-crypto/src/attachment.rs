//! Attachment sealing: AEAD over opaque blobs with content-hash binding.
//!
//! Every upload gets a fresh key and nonce; the SHA-256 of the plaintext
//! travels inside the (separately encrypted) content reference, so the
//! downloader can verify integrity end-to-end.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::rngs::OsRng;
use rand::RngCore as _;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq as _;

use crate::error::CryptoError;

pub const CONTENT_KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;

/// Output of sealing one blob: the ciphertext plus everything the content
/// reference needs to carry.
#[derive(Debug, Clone)]
pub struct SealedBlob {
    pub ciphertext: Vec<u8>,
    pub content_key: [u8; CONTENT_KEY_LEN],
    pub nonce: [u8; NONCE_LEN],
    pub content_hash: [u8; 32],
    pub size_bytes: u64,
}

/// Encrypt a plaintext blob under a fresh key and nonce.
pub fn seal_blob(plaintext: &[u8]) -> Result<SealedBlob, CryptoError> {
    let mut content_key = [0u8; CONTENT_KEY_LEN];
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut content_key);
    OsRng.fill_bytes(&mut nonce);

    let cipher = Aes256Gcm::new_from_slice(&content_key)
        .map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;

    Ok(SealedBlob {
        ciphertext,
        content_key,
        nonce,
        content_hash: sha256(plaintext),
        size_bytes: plaintext.len() as u64,
    })
}

/// Decrypt a downloaded blob and verify its content hash in constant time.
pub fn open_blob(
    ciphertext: &[u8],
    content_key: &[u8],
    nonce: &[u8],
    expected_hash: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(content_key)
        .map_err(|_| CryptoError::InvalidKey("content key must be 32 bytes".into()))?;
    if nonce.len() != NONCE_LEN {
        return Err(CryptoError::InvalidKey("nonce must be 12 bytes".into()));
    }
    let plaintext = cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::DecryptAuth("attachment blob".into()))?;

    let actual = sha256(&plaintext);
    if expected_hash.len() != 32 || actual.as_slice().ct_eq(expected_hash).unwrap_u8() != 1 {
        return Err(CryptoError::IntegrityFail("attachment content hash".into()));
    }
    Ok(plaintext)
}

/// SHA-256 digest of a byte slice.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}
