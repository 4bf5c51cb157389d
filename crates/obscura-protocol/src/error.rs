use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("codec error: {0}")]
    Codec(String),

    #[error("malformed frame: {0}")]
    Frame(String),

    #[error("unknown message type tag {0}")]
    UnknownMessageType(u32),

    #[error("transport I/O failure: {0}")]
    TransportIO(String),

    #[error("transport I/O failure (status {status}): {message}")]
    TransportStatus { status: u16, message: String },

    #[error("link code expired")]
    LinkExpired,

    #[error("link code already used")]
    LinkReplayed,

    #[error("link code signature invalid: {0}")]
    LinkBadSignature(String),

    #[error("malformed link code: {0}")]
    LinkMalformed(String),

    #[error("crypto error: {0}")]
    Crypto(#[from] obscura_crypto::CryptoError),
}
