pub mod error;
pub mod gateway;
pub mod link_code;
pub mod message;
pub mod transport;
pub mod types;
pub mod wire;

pub use error::ProtocolError;
pub use gateway::{Gateway, GatewayConnection, ReconnectPolicy};
pub use message::ClientMessage;
pub use transport::ServerApi;
pub use types::{AttachmentPointer, ChunkedContentReference, ContentReference, DeviceInfo};
pub use wire::{EncryptedMessage, Envelope, GatewayFrame};
