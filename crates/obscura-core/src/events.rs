//! Typed output channels.
//!
//! One broadcast channel per event kind; callers subscribe to what they
//! care about. Lagging or absent subscribers never block the core.

use tokio::sync::broadcast;

use crate::messages::StoredMessage;

const CHANNEL_CAPACITY: usize = 128;

#[derive(Debug, Clone)]
pub enum MessageEvent {
    Received {
        conversation_id: String,
        message: StoredMessage,
    },
    SentSynced {
        conversation_id: String,
        message: StoredMessage,
    },
}

#[derive(Debug, Clone)]
pub enum FriendEvent {
    RequestReceived { username: String },
    ResponseReceived { username: String, accepted: bool },
    Updated { username: String },
}

#[derive(Debug, Clone)]
pub enum DeviceEvent {
    LinkApproved { device_username: String },
    OwnDevicesChanged,
    FriendDevicesChanged { username: String },
    /// This install has been revoked and its local state wiped.
    LocalDeviceRevoked,
}

#[derive(Debug, Clone)]
pub enum ModelEvent {
    Merged { model: String, id: String },
    Expired { model: String, id: String },
}

/// The core's event channels, cloneable and cheap to share.
#[derive(Clone)]
pub struct EventBus {
    message_tx: broadcast::Sender<MessageEvent>,
    friend_tx: broadcast::Sender<FriendEvent>,
    device_tx: broadcast::Sender<DeviceEvent>,
    model_tx: broadcast::Sender<ModelEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            message_tx: broadcast::channel(CHANNEL_CAPACITY).0,
            friend_tx: broadcast::channel(CHANNEL_CAPACITY).0,
            device_tx: broadcast::channel(CHANNEL_CAPACITY).0,
            model_tx: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    pub fn subscribe_messages(&self) -> broadcast::Receiver<MessageEvent> {
        self.message_tx.subscribe()
    }

    pub fn subscribe_friends(&self) -> broadcast::Receiver<FriendEvent> {
        self.friend_tx.subscribe()
    }

    pub fn subscribe_devices(&self) -> broadcast::Receiver<DeviceEvent> {
        self.device_tx.subscribe()
    }

    pub fn subscribe_models(&self) -> broadcast::Receiver<ModelEvent> {
        self.model_tx.subscribe()
    }

    pub fn emit_message(&self, event: MessageEvent) {
        let _ = self.message_tx.send(event);
    }

    pub fn emit_friend(&self, event: FriendEvent) {
        let _ = self.friend_tx.send(event);
    }

    pub fn emit_device(&self, event: DeviceEvent) {
        let _ = self.device_tx.send(event);
    }

    pub fn emit_model(&self, event: ModelEvent) {
        let _ = self.model_tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
