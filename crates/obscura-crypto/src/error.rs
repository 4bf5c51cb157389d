use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    #[error("signing failed: {0}")]
    Signing(String),

    #[error("signature verification failed: {0}")]
    Verification(String),

    #[error("identity key changed for {0}")]
    IdentityMismatch(String),

    #[error("no session established with {0}")]
    SessionNotEstablished(String),

    #[error("stale or replayed message counter: {0}")]
    MessageCounter(String),

    #[error("message authentication failed: {0}")]
    DecryptAuth(String),

    #[error("content hash mismatch: {0}")]
    IntegrityFail(String),

    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("prekey error: {0}")]
    PreKey(String),

    #[error("recovery phrase error: {0}")]
    Mnemonic(String),

    #[error("key storage error: {0}")]
    Storage(String),

    #[error("malformed message: {0}")]
    Malformed(String),
}
