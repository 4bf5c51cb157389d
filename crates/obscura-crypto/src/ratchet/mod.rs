//! Prekeyed Double-Ratchet-style sessions.
//!
//! Storage is abstracted behind traits so the durable keystore lives in
//! the core crate while tests run fully in memory.

pub mod memory_stores;
pub mod prekeys;
pub mod session;
pub mod store;

pub use prekeys::PreKeyBundle;
pub use session::{CipherMessage, CiphertextKind, RatchetCipher};
