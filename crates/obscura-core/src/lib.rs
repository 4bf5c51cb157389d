pub mod attachments;
pub mod backup;
pub mod compress;
pub mod core;
pub mod device_graph;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod friends;
pub mod keystore;
pub mod messages;
pub mod models;
pub mod session_engine;
pub mod storage;
pub mod testing;

pub use crate::core::{Core, CoreConfig, RegistrationOutput};
pub use compress::{Compress, GzipCompress};
pub use dispatcher::FanOutReport;
pub use error::CoreError;
pub use events::{DeviceEvent, EventBus, FriendEvent, MessageEvent, ModelEvent};
pub use keystore::{DeviceIdentity, KeyStore};
pub use models::{ModelSchema, ModelStore, Query, SyncKind};
pub use storage::{MemoryStorage, SqliteStorage, Storage};
