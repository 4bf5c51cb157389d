use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::Rng as _;
use sha2::{Digest, Sha256, Sha512};
use zeroize::ZeroizeOnDrop;

use crate::error::CryptoError;

/// A device's long-term ratchet identity.
///
/// The Ed25519 keypair signs prekeys, device announces, and CRDT entries;
/// its X25519 form feeds the X3DH key agreement. The registration id is a
/// random 14-bit tag the server hands out alongside prekey bundles so peers
/// can detect a reinstalled device.
#[derive(ZeroizeOnDrop)]
pub struct RatchetIdentity {
    #[zeroize(skip)]
    signing_key: SigningKey,
    #[zeroize(skip)]
    registration_id: u32,
}

impl RatchetIdentity {
    /// Generate a fresh identity with a random registration id.
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let registration_id = OsRng.gen_range(1..16384);
        Self {
            signing_key,
            registration_id,
        }
    }

    /// Restore an identity from its 32-byte secret seed and registration id.
    pub fn from_parts(seed: &[u8; 32], registration_id: u32) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(seed),
            registration_id,
        }
    }

    pub fn registration_id(&self) -> u32 {
        self.registration_id
    }

    /// Public identity key (32 bytes).
    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Secret seed bytes, for the encrypted-at-rest identity record.
    pub fn secret_seed_bytes(&self) -> &[u8; 32] {
        self.signing_key.as_bytes()
    }

    /// Sign a message with the identity private key.
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing_key.sign(message).to_bytes()
    }

    /// Verify a signature against a 32-byte identity public key.
    pub fn verify(
        public_key: &[u8],
        message: &[u8],
        signature: &[u8],
    ) -> Result<(), CryptoError> {
        let key: [u8; 32] = public_key
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("identity key must be 32 bytes".into()))?;
        let verifying_key = VerifyingKey::from_bytes(&key)
            .map_err(|e| CryptoError::InvalidKey(format!("invalid identity key: {e}")))?;
        let sig: [u8; 64] = signature
            .try_into()
            .map_err(|_| CryptoError::Verification("signature must be 64 bytes".into()))?;
        verifying_key
            .verify(message, &Signature::from_bytes(&sig))
            .map_err(|e| CryptoError::Verification(e.to_string()))
    }

    /// Derive the X25519 static secret for Diffie-Hellman (X3DH).
    ///
    /// Uses the Ed25519 birational map: the DH scalar is the first half of
    /// SHA-512(seed), so the secret matches the Montgomery form of the
    /// public key and peers only ever see the Ed25519 identity key.
    pub fn to_x25519_secret(&self) -> x25519_dalek::StaticSecret {
        x25519_to_secret(&self.signing_key.to_bytes())
    }

    /// The X25519 public key matching [`Self::to_x25519_secret`].
    pub fn to_x25519_public(&self) -> x25519_dalek::PublicKey {
        x25519_dalek::PublicKey::from(&self.to_x25519_secret())
    }

    /// Hex form of the public key, for logs and display.
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key_bytes())
    }
}

impl std::fmt::Debug for RatchetIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RatchetIdentity")
            .field("public_key", &self.public_key_hex())
            .field("registration_id", &self.registration_id)
            .finish()
    }
}

/// X25519 static secret for an Ed25519 seed (first half of SHA-512(seed),
/// clamped by `StaticSecret`).
pub fn x25519_to_secret(seed: &[u8; 32]) -> x25519_dalek::StaticSecret {
    let digest = Sha512::digest(seed);
    let mut scalar = [0u8; 32];
    scalar.copy_from_slice(&digest[..32]);
    x25519_dalek::StaticSecret::from(scalar)
}

/// X25519 public key for a peer's 32-byte Ed25519 identity key, via the
/// Edwards-to-Montgomery map. Counterpart of [`x25519_to_secret`].
pub fn x25519_from_identity(
    identity_key: &[u8],
) -> Result<x25519_dalek::PublicKey, CryptoError> {
    let key: [u8; 32] = identity_key
        .try_into()
        .map_err(|_| CryptoError::InvalidKey("identity key must be 32 bytes".into()))?;
    let verifying_key = VerifyingKey::from_bytes(&key)
        .map_err(|e| CryptoError::InvalidKey(format!("invalid identity key: {e}")))?;
    Ok(x25519_dalek::PublicKey::from(
        verifying_key.to_montgomery().to_bytes(),
    ))
}

/// Compute the 4-digit verify code for a peer identity key.
///
/// Both sides read each other's code aloud to confirm the TOFU-pinned key.
/// The code is the first two bytes of SHA-256(key), mod 10000, zero-padded.
pub fn verify_code(identity_key: &[u8]) -> String {
    let digest = Sha256::digest(identity_key);
    let word = u32::from(digest[0]) << 8 | u32::from(digest[1]);
    format!("{:04}", word % 10_000)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_and_sign() {
        let identity = RatchetIdentity::generate();
        let message = b"hello obscura";

        let signature = identity.sign(message);
        assert!(
            RatchetIdentity::verify(&identity.public_key_bytes(), message, &signature).is_ok()
        );
    }

    #[test]
    fn roundtrip_seed() {
        let identity = RatchetIdentity::generate();
        let seed = *identity.secret_seed_bytes();
        let restored = RatchetIdentity::from_parts(&seed, identity.registration_id());
        assert_eq!(identity.public_key_bytes(), restored.public_key_bytes());
        assert_eq!(identity.registration_id(), restored.registration_id());
    }

    #[test]
    fn x25519_agreement() {
        let alice = RatchetIdentity::generate();
        let bob = RatchetIdentity::generate();

        let shared_a = alice.to_x25519_secret().diffie_hellman(&bob.to_x25519_public());
        let shared_b = bob.to_x25519_secret().diffie_hellman(&alice.to_x25519_public());
        assert_eq!(shared_a.as_bytes(), shared_b.as_bytes());
    }

    #[test]
    fn montgomery_map_matches_derived_public() {
        // A peer who only knows our Ed25519 identity key must arrive at the
        // same X25519 public key we derive from our own seed.
        let identity = RatchetIdentity::generate();
        let converted = x25519_from_identity(&identity.public_key_bytes()).unwrap();
        assert_eq!(converted.to_bytes(), identity.to_x25519_public().to_bytes());
    }

    #[test]
    fn verify_code_is_four_digits() {
        let identity = RatchetIdentity::generate();
        let code = verify_code(&identity.public_key_bytes());
        assert_eq!(code.len(), 4);
        assert!(code.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn verify_code_is_stable() {
        let key = [7u8; 32];
        assert_eq!(verify_code(&key), verify_code(&key));
    }

    #[test]
    fn registration_id_in_range() {
        for _ in 0..32 {
            let id = RatchetIdentity::generate().registration_id();
            assert!(id >= 1 && id < 16384);
        }
    }
}
