pub mod attachment;
pub mod error;
pub mod identity;
pub mod ratchet;
pub mod recovery;

pub use error::CryptoError;
pub use identity::RatchetIdentity;
pub use ratchet::{CipherMessage, CiphertextKind, PreKeyBundle, RatchetCipher};
pub use recovery::RecoveryKeyPair;
