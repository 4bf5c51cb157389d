use thiserror::Error;

use obscura_crypto::CryptoError;
use obscura_protocol::ProtocolError;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("core not initialized")]
    NotInitialized,

    #[error("storage failure: {0}")]
    StorageIO(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("unknown model: {0}")]
    UnknownModel(String),

    #[error("unknown friend: {0}")]
    UnknownFriend(String),

    #[error("unsupported backup version {0}")]
    UnsupportedBackupVersion(u8),

    #[error("backup decrypt failed: {0}")]
    BackupDecrypt(String),

    #[error("attachment too large: {0} bytes")]
    AttachmentTooLarge(usize),

    #[error("attachment transfer failed: {0}")]
    Transfer(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl From<rusqlite::Error> for CoreError {
    fn from(e: rusqlite::Error) -> Self {
        Self::StorageIO(e.to_string())
    }
}
