//! The dispatcher: owns the gateway, routes inbound envelopes, and fans
//! outbound messages out to every recipient device plus our own other
//! devices.
//!
//! An envelope is acknowledged only after decrypt, decode, route, and
//! persistence all succeed. Stale-counter decrypt failures are dropped
//! without an ACK; the server may redeliver or has already been ACKed.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use uuid::Uuid;

use obscura_protocol::gateway::{Gateway, GatewayConnection, ReconnectPolicy};
use obscura_protocol::message::{
    ClientMessage, ContentRefMessage, DeviceAnnounceMessage, DeviceLinkApprovalMessage,
    FriendRequestMessage, FriendResponseMessage, HistoryChunkMessage, ImageMessage,
    ModelSyncMessage, ReadSyncMessage, SentSyncMessage, SessionResetMessage, SettingsSyncMessage,
    SyncBlobMessage, TextMessage,
};
use obscura_protocol::transport::ServerApi;
use obscura_protocol::types::{AttachmentPointer, DeviceInfo};
use obscura_protocol::wire::{Envelope, GatewayFrame};

use crate::attachments::AttachmentManager;
use crate::compress::Compress;
use crate::device_graph::{
    announce_signing_bytes, build_revocation, AnnounceOutcome, DeviceGraph, OwnAnnounceOutcome,
};
use crate::error::CoreError;
use crate::events::{DeviceEvent, EventBus, FriendEvent, MessageEvent, ModelEvent};
use crate::friends::{Friend, FriendRepo, FriendStatus};
use crate::keystore::{DeviceIdentity, KeyStore};
use crate::messages::{body_from_bytes, Direction, MessageBody, MessageRepo, StoredMessage};
use crate::models::{BroadcastTargets, ModelOutbox, ModelStore};
use crate::session_engine::SessionEngine;
use crate::storage::{timestamp_now, Storage};

pub const COL_SETTINGS: &str = "settings";

/// Per-recipient results of one fan-out send.
#[derive(Debug, Clone)]
pub struct FanOutReport {
    pub message_id: String,
    pub successes: u32,
    pub failures: u32,
}

/// State imported and exported through SYNC_BLOB.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct SyncState {
    friends: Vec<Friend>,
    messages: Vec<StoredMessage>,
    settings: serde_json::Map<String, serde_json::Value>,
}

pub struct Dispatcher {
    engine: Arc<SessionEngine>,
    server: Arc<dyn ServerApi>,
    gateway: Arc<dyn Gateway>,
    keystore: Arc<KeyStore>,
    friends: Arc<FriendRepo>,
    messages: Arc<MessageRepo>,
    graph: Arc<DeviceGraph>,
    models: Arc<ModelStore>,
    attachments: Arc<AttachmentManager>,
    compress: Arc<dyn Compress>,
    storage: Arc<dyn Storage>,
    events: EventBus,
    should_reconnect: AtomicBool,
    /// Envelope ids already routed; re-ACK duplicates so the server can
    /// clear its queue.
    seen_envelopes: Mutex<HashSet<String>>,
    /// The link challenge this device is waiting to see approved.
    pending_link_challenge: Mutex<Option<Vec<u8>>>,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)] // construction-time wiring, called once from Core
    pub fn new(
        engine: Arc<SessionEngine>,
        server: Arc<dyn ServerApi>,
        gateway: Arc<dyn Gateway>,
        keystore: Arc<KeyStore>,
        friends: Arc<FriendRepo>,
        messages: Arc<MessageRepo>,
        graph: Arc<DeviceGraph>,
        models: Arc<ModelStore>,
        attachments: Arc<AttachmentManager>,
        compress: Arc<dyn Compress>,
        storage: Arc<dyn Storage>,
        events: EventBus,
    ) -> Self {
        Self {
            engine,
            server,
            gateway,
            keystore,
            friends,
            messages,
            graph,
            models,
            attachments,
            compress,
            storage,
            events,
            should_reconnect: AtomicBool::new(false),
            seen_envelopes: Mutex::new(HashSet::new()),
            pending_link_challenge: Mutex::new(None),
        }
    }

    // ── Gateway loop ────────────────────────────────────────────────

    /// Connect and process envelopes until [`Self::disconnect`].
    ///
    /// Reconnects with exponential backoff (1 s doubling to 30 s),
    /// forever, as long as the reconnect flag stays set.
    pub async fn run(self: Arc<Self>) {
        self.should_reconnect.store(true, Ordering::SeqCst);
        let mut policy = ReconnectPolicy::default();

        while self.should_reconnect.load(Ordering::SeqCst) {
            match self.gateway.connect().await {
                Ok(mut conn) => {
                    tracing::info!("gateway connected");
                    policy.reset();
                    self.read_frames(conn.as_mut()).await;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "gateway connect failed");
                }
            }
            if !self.should_reconnect.load(Ordering::SeqCst) {
                break;
            }
            tokio::time::sleep(policy.next_delay()).await;
        }
        tracing::info!("gateway loop stopped");
    }

    /// Stop the gateway loop; in-flight operations observe the cleared
    /// flag when they resume.
    pub fn disconnect(&self) {
        self.should_reconnect.store(false, Ordering::SeqCst);
    }

    async fn read_frames(&self, conn: &mut dyn GatewayConnection) {
        loop {
            if !self.should_reconnect.load(Ordering::SeqCst) {
                return;
            }
            match conn.next_frame().await {
                Ok(Some(GatewayFrame::Envelope(envelope))) => {
                    if let Err(e) = self.handle_envelope(conn, envelope).await {
                        tracing::warn!(error = %e, "envelope not acknowledged");
                    }
                }
                Ok(Some(GatewayFrame::Ack { message_id })) => {
                    tracing::trace!(id = %message_id, "server ack echo");
                }
                Ok(None) => {
                    tracing::debug!("gateway stream closed by server");
                    return;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "gateway receive failed");
                    return;
                }
            }
        }
    }

    /// One envelope through the full pipeline: decrypt → decode → route →
    /// persist → ACK → replenish prekeys.
    pub async fn handle_envelope(
        &self,
        conn: &mut dyn GatewayConnection,
        envelope: Envelope,
    ) -> Result<(), CoreError> {
        if envelope.message.content.is_empty() {
            tracing::debug!(id = %envelope.id, "empty envelope dropped");
            return Ok(());
        }
        if self.seen_envelopes.lock().contains(&envelope.id) {
            conn.send_ack(&envelope.id).await?;
            return Ok(());
        }

        let plaintext = match self
            .engine
            .decrypt(&envelope.source_user_id, &envelope.message)
            .await
        {
            Ok(plaintext) => plaintext,
            Err(e) if SessionEngine::is_counter_error(&e) => {
                tracing::debug!(
                    id = %envelope.id,
                    from = %envelope.source_user_id,
                    "stale or replayed envelope dropped"
                );
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let message = ClientMessage::decode(&plaintext)?;
        self.route(&envelope.source_user_id, message).await?;

        conn.send_ack(&envelope.id).await?;
        self.seen_envelopes.lock().insert(envelope.id);

        let engine = self.engine.clone();
        tokio::spawn(async move { engine.replenish_prekeys().await });
        Ok(())
    }

    // ── Inbound routing ─────────────────────────────────────────────

    async fn route(&self, source: &str, message: ClientMessage) -> Result<(), CoreError> {
        match message {
            ClientMessage::Text(m) => self.handle_text(source, &m),
            ClientMessage::Image(m) => self.handle_image(source, m),
            ClientMessage::ContentRef(m) => self.handle_content_ref(source, m),
            ClientMessage::FriendRequest(m) => self.handle_friend_request(source, &m),
            ClientMessage::FriendResponse(m) => self.handle_friend_response(&m),
            ClientMessage::SessionReset(m) => self.handle_session_reset(source, &m),
            ClientMessage::DeviceLinkApproval(m) => self.handle_link_approval(m).await,
            ClientMessage::DeviceAnnounce(m) => self.handle_device_announce(source, &m),
            ClientMessage::HistoryChunk(m) => self.handle_history_chunk(&m),
            ClientMessage::SettingsSync(m) => self.handle_settings_sync(&m),
            ClientMessage::ReadSync(m) => self.handle_read_sync(&m),
            ClientMessage::SyncBlob(m) => self.handle_sync_blob(&m),
            ClientMessage::SentSync(m) => self.handle_sent_sync(m),
            ClientMessage::ModelSync(m) => self.handle_model_sync(&m),
        }
    }

    fn handle_text(&self, source: &str, m: &TextMessage) -> Result<(), CoreError> {
        let conversation_id = self.conversation_for(source)?;
        let message = StoredMessage {
            id: Uuid::new_v4().to_string(),
            conversation_id: conversation_id.clone(),
            direction: Direction::Inbound,
            timestamp: m.timestamp,
            body: MessageBody::Text(m.text.clone()),
        };
        self.messages.append(&message)?;
        self.events.emit_message(MessageEvent::Received {
            conversation_id,
            message,
        });
        Ok(())
    }

    fn handle_image(&self, source: &str, m: ImageMessage) -> Result<(), CoreError> {
        let conversation_id = self.conversation_for(source)?;
        let message = StoredMessage {
            id: Uuid::new_v4().to_string(),
            conversation_id: conversation_id.clone(),
            direction: Direction::Inbound,
            timestamp: m.timestamp,
            body: MessageBody::Attachment(m.content),
        };
        self.messages.append(&message)?;
        self.events.emit_message(MessageEvent::Received {
            conversation_id,
            message,
        });
        Ok(())
    }

    fn handle_content_ref(&self, source: &str, m: ContentRefMessage) -> Result<(), CoreError> {
        let conversation_id = self.conversation_for(source)?;
        let message = StoredMessage {
            id: Uuid::new_v4().to_string(),
            conversation_id: conversation_id.clone(),
            direction: Direction::Inbound,
            timestamp: m.timestamp,
            body: MessageBody::Attachment(m.content),
        };
        self.messages.append(&message)?;
        self.events.emit_message(MessageEvent::Received {
            conversation_id,
            message,
        });
        Ok(())
    }

    fn handle_friend_request(&self, source: &str, m: &FriendRequestMessage) -> Result<(), CoreError> {
        if self.friends.get(&m.username)?.is_none() {
            // All we know about the requester is its posting id and the
            // identity key TOFU pinned it under; its announce fills in the
            // rest.
            let identity_key = self
                .keystore
                .trusted_identity_key(&SessionEngine::address(source))?
                .unwrap_or_default();
            self.friends.put(&Friend {
                username: m.username.clone(),
                server_user_id: source.to_string(),
                status: FriendStatus::PendingIncoming,
                devices: vec![DeviceInfo {
                    server_user_id: source.to_string(),
                    device_uuid: String::new(),
                    device_name: m.username.clone(),
                    identity_key,
                }],
                devices_updated_at: 0,
                recovery_public_key: None,
            })?;
        }
        self.events.emit_friend(FriendEvent::RequestReceived {
            username: m.username.clone(),
        });
        Ok(())
    }

    fn handle_friend_response(&self, m: &FriendResponseMessage) -> Result<(), CoreError> {
        if m.accepted {
            self.friends.set_status(&m.username, FriendStatus::Accepted)?;
            self.friends
                .ingest_devices(&m.username, m.devices.clone(), m.timestamp)?;
        } else {
            self.friends.delete(&m.username)?;
        }
        self.events.emit_friend(FriendEvent::ResponseReceived {
            username: m.username.clone(),
            accepted: m.accepted,
        });
        Ok(())
    }

    fn handle_session_reset(&self, source: &str, m: &SessionResetMessage) -> Result<(), CoreError> {
        tracing::info!(from = %source, reason = %m.reset_reason, "session reset requested");
        self.engine.reset_session(source)
    }

    async fn handle_link_approval(&self, m: DeviceLinkApprovalMessage) -> Result<(), CoreError> {
        let expected = self.pending_link_challenge.lock().clone();
        if expected.as_deref() != Some(m.challenge_response.as_slice()) {
            tracing::warn!("link approval with unexpected challenge dropped");
            return Ok(());
        }
        *self.pending_link_challenge.lock() = None;

        let mut device = self
            .keystore
            .device_identity()?
            .ok_or(CoreError::NotInitialized)?;
        device.p2p_public_key = m.p2p_public_key;
        if let Some(secret) = m.p2p_private_key {
            device.p2p_secret_key = secret;
        }
        device.recovery_public_key = m.recovery_public_key;
        device.is_first_device = false;
        self.keystore.set_device_identity(&device)?;

        let own: Vec<DeviceInfo> = m
            .own_devices
            .into_iter()
            .filter(|d| d.device_uuid != device.device_uuid)
            .collect();
        self.graph.set_own_devices(&own)?;

        let imported: Vec<Friend> = serde_json::from_slice(&m.friends_export)
            .map_err(|e| CoreError::Validation(format!("friends export: {e}")))?;
        self.friends.merge_import(imported)?;

        self.events.emit_device(DeviceEvent::LinkApproved {
            device_username: device.device_username.clone(),
        });

        // Tell the rest of the account (and every friend) about this
        // device, with exact details the link code could not carry.
        self.announce_self().await?;
        Ok(())
    }

    fn handle_device_announce(
        &self,
        source: &str,
        m: &DeviceAnnounceMessage,
    ) -> Result<(), CoreError> {
        let device = self
            .keystore
            .device_identity()?
            .ok_or(CoreError::NotInitialized)?;

        let own_ids = self.graph.own_device_user_ids()?;
        let from_own_account = own_ids.iter().any(|id| id == source)
            || m.devices.iter().any(|d| d.device_uuid == device.device_uuid);

        if from_own_account {
            match self
                .graph
                .apply_own_announce(m, &device.device_uuid, &device.recovery_public_key)?
            {
                OwnAnnounceOutcome::SelfRevoked => {
                    tracing::warn!("this device has been revoked, wiping local state");
                    self.wipe_local()?;
                    self.events.emit_device(DeviceEvent::LocalDeviceRevoked);
                    self.disconnect();
                }
                OwnAnnounceOutcome::Updated => {
                    self.events.emit_device(DeviceEvent::OwnDevicesChanged);
                }
                OwnAnnounceOutcome::Ignored => {}
            }
            return Ok(());
        }

        // A just-linked device announces before anyone lists it; fall back
        // to matching the account by the devices the announce claims.
        let friend = match self.friends.find_by_server_user_id(source)? {
            Some(friend) => Some(friend),
            None => self.friends.all()?.into_iter().find(|candidate| {
                m.devices.iter().any(|d| {
                    d.server_user_id == candidate.server_user_id
                        || candidate
                            .devices
                            .iter()
                            .any(|cd| cd.server_user_id == d.server_user_id)
                })
            }),
        };
        let Some(friend) = friend else {
            tracing::debug!(from = %source, "announce from unknown sender dropped");
            return Ok(());
        };
        if let Some(recovery_key) = &m.recovery_public_key {
            self.friends.set_recovery_key(&friend.username, recovery_key)?;
        }
        if let AnnounceOutcome::Applied { revocation } =
            self.graph.apply_announce(&friend.username, m)?
        {
            tracing::debug!(
                friend = %friend.username,
                revocation,
                devices = m.devices.len(),
                "friend device list updated"
            );
            self.events.emit_device(DeviceEvent::FriendDevicesChanged {
                username: friend.username,
            });
        }
        Ok(())
    }

    fn handle_history_chunk(&self, m: &HistoryChunkMessage) -> Result<(), CoreError> {
        for entry in &m.messages {
            let message = StoredMessage {
                id: entry.message_id.clone(),
                conversation_id: entry.conversation_id.clone(),
                direction: if entry.outbound {
                    Direction::Outbound
                } else {
                    Direction::Inbound
                },
                timestamp: entry.timestamp,
                body: body_from_bytes(&entry.content),
            };
            self.messages.append_if_new(&message)?;
        }
        Ok(())
    }

    fn handle_settings_sync(&self, m: &SettingsSyncMessage) -> Result<(), CoreError> {
        for (key, value) in &m.settings {
            let data = serde_json::to_vec(value)
                .map_err(|e| CoreError::StorageIO(format!("serialize setting: {e}")))?;
            self.storage.put(COL_SETTINGS, key, &data)?;
        }
        Ok(())
    }

    fn handle_read_sync(&self, m: &ReadSyncMessage) -> Result<(), CoreError> {
        self.messages.set_read_mark(&m.conversation_id, m.timestamp)
    }

    fn handle_sync_blob(&self, m: &SyncBlobMessage) -> Result<(), CoreError> {
        let json = self.compress.decompress(&m.compressed_data)?;
        let state: SyncState = serde_json::from_slice(&json)
            .map_err(|e| CoreError::Validation(format!("sync blob: {e}")))?;

        self.friends.merge_import(state.friends)?;
        for message in &state.messages {
            self.messages.append_if_new(message)?;
        }
        for (key, value) in &state.settings {
            let data = serde_json::to_vec(value)
                .map_err(|e| CoreError::StorageIO(format!("serialize setting: {e}")))?;
            self.storage.put(COL_SETTINGS, key, &data)?;
        }
        tracing::info!(messages = state.messages.len(), "sync blob merged");
        Ok(())
    }

    fn handle_sent_sync(&self, m: SentSyncMessage) -> Result<(), CoreError> {
        let body = match serde_json::from_slice::<AttachmentPointer>(&m.content) {
            Ok(pointer) => MessageBody::Attachment(pointer),
            Err(_) => body_from_bytes(&m.content),
        };
        let message = StoredMessage {
            id: m.message_id.clone(),
            conversation_id: m.conversation_id.clone(),
            direction: Direction::Outbound,
            timestamp: m.timestamp,
            body,
        };
        if self.messages.append_if_new(&message)? {
            self.events.emit_message(MessageEvent::SentSynced {
                conversation_id: m.conversation_id,
                message,
            });
        }
        Ok(())
    }

    fn handle_model_sync(&self, m: &ModelSyncMessage) -> Result<(), CoreError> {
        match self.models.handle_sync(m) {
            Ok(Some(entry)) => {
                self.events.emit_model(ModelEvent::Merged {
                    model: m.model.clone(),
                    id: entry.id,
                });
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(CoreError::UnknownModel(name)) => {
                tracing::warn!(model = %name, "model sync for undeclared model dropped");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    // ── Outbound ────────────────────────────────────────────────────

    /// Send a text message to a friend: fan out to every device, persist
    /// one local copy, then self-sync.
    pub async fn send_text(
        &self,
        conversation: &str,
        text: &str,
    ) -> Result<FanOutReport, CoreError> {
        let friend = self
            .friends
            .get(conversation)?
            .ok_or_else(|| CoreError::UnknownFriend(conversation.to_string()))?;

        let message_id = Uuid::new_v4().to_string();
        let timestamp = timestamp_now();
        let payload = ClientMessage::Text(TextMessage {
            text: text.to_string(),
            timestamp,
        })
        .encode()?;

        let (successes, failures) = self.fan_out(&friend, &payload).await;

        self.messages.append(&StoredMessage {
            id: message_id.clone(),
            conversation_id: conversation.to_string(),
            direction: Direction::Outbound,
            timestamp,
            body: MessageBody::Text(text.to_string()),
        })?;

        self.self_sync(conversation, &message_id, timestamp, text.as_bytes())
            .await?;

        Ok(FanOutReport {
            message_id,
            successes,
            failures,
        })
    }

    /// Upload an attachment once, then fan out its content reference.
    pub async fn send_attachment(
        &self,
        conversation: &str,
        data: &[u8],
        content_type: &str,
        file_name: Option<String>,
    ) -> Result<(FanOutReport, AttachmentPointer), CoreError> {
        let friend = self
            .friends
            .get(conversation)?
            .ok_or_else(|| CoreError::UnknownFriend(conversation.to_string()))?;

        let pointer = self
            .attachments
            .upload(data, content_type, file_name.clone())
            .await?;

        let message_id = Uuid::new_v4().to_string();
        let timestamp = timestamp_now();
        let payload = ClientMessage::ContentRef(ContentRefMessage {
            content: pointer.clone(),
            file_name,
            timestamp,
        })
        .encode()?;

        let (successes, failures) = self.fan_out(&friend, &payload).await;

        self.messages.append(&StoredMessage {
            id: message_id.clone(),
            conversation_id: conversation.to_string(),
            direction: Direction::Outbound,
            timestamp,
            body: MessageBody::Attachment(pointer.clone()),
        })?;

        let content = serde_json::to_vec(&pointer)
            .map_err(|e| CoreError::StorageIO(format!("serialize pointer: {e}")))?;
        self.self_sync(conversation, &message_id, timestamp, &content)
            .await?;

        Ok((
            FanOutReport {
                message_id,
                successes,
                failures,
            },
            pointer,
        ))
    }

    /// Start a friendship: record the pending friend and post the request.
    pub async fn send_friend_request(
        &self,
        username: &str,
        server_user_id: &str,
    ) -> Result<(), CoreError> {
        let device = self.device()?;
        if self.friends.get(username)?.is_none() {
            self.friends.put(&Friend {
                username: username.to_string(),
                server_user_id: server_user_id.to_string(),
                status: FriendStatus::PendingOutgoing,
                devices: vec![DeviceInfo {
                    server_user_id: server_user_id.to_string(),
                    device_uuid: String::new(),
                    device_name: username.to_string(),
                    identity_key: Vec::new(),
                }],
                devices_updated_at: 0,
                recovery_public_key: None,
            })?;
        }

        let payload = ClientMessage::FriendRequest(FriendRequestMessage {
            username: device.core_username,
            timestamp: timestamp_now(),
        })
        .encode()?;
        self.post_to(server_user_id, &payload).await
    }

    /// Answer a pending incoming request.
    pub async fn respond_friend_request(
        &self,
        username: &str,
        accept: bool,
    ) -> Result<(), CoreError> {
        let friend = self
            .friends
            .get(username)?
            .ok_or_else(|| CoreError::UnknownFriend(username.to_string()))?;
        let device = self.device()?;

        let mut devices = vec![self.self_device_info()?];
        devices.extend(self.graph.own_devices()?);

        let payload = ClientMessage::FriendResponse(FriendResponseMessage {
            username: device.core_username,
            accepted: accept,
            devices,
            timestamp: timestamp_now(),
        })
        .encode()?;
        self.fan_out(&friend, &payload).await;

        if accept {
            self.friends.set_status(username, FriendStatus::Accepted)?;
        } else {
            self.friends.delete(username)?;
        }
        Ok(())
    }

    /// Remove a friend: tell their devices to drop the session, then
    /// forget them locally.
    pub async fn remove_friend(&self, username: &str) -> Result<(), CoreError> {
        let friend = self
            .friends
            .get(username)?
            .ok_or_else(|| CoreError::UnknownFriend(username.to_string()))?;

        let payload = ClientMessage::SessionReset(SessionResetMessage {
            reset_reason: "unfriended".to_string(),
            timestamp: timestamp_now(),
        })
        .encode()?;
        self.fan_out(&friend, &payload).await;

        for target in friend.device_user_ids() {
            self.engine.reset_session(&target)?;
        }
        self.friends.delete(username)?;
        Ok(())
    }

    /// Propagate a read mark to our own other devices.
    pub async fn send_read_sync(&self, conversation: &str) -> Result<(), CoreError> {
        let timestamp = timestamp_now();
        self.messages.set_read_mark(conversation, timestamp)?;
        let payload = ClientMessage::ReadSync(ReadSyncMessage {
            conversation_id: conversation.to_string(),
            timestamp,
        })
        .encode()?;
        for target in self.graph.own_device_user_ids()? {
            if let Err(e) = self.post_to(&target, &payload).await {
                tracing::warn!(error = %e, target = %target, "read sync send failed");
            }
        }
        Ok(())
    }

    // ── Device linking ──────────────────────────────────────────────

    /// Remember the challenge this (new) device published in its link
    /// code, so the approval can be matched.
    pub fn expect_link_approval(&self, challenge: Vec<u8>) {
        *self.pending_link_challenge.lock() = Some(challenge);
    }

    /// Approve a link code: consume the challenge, ship the approval plus
    /// a full state blob to the new device, and record it as ours.
    pub async fn approve_link(&self, code: &str) -> Result<(), CoreError> {
        let parsed = self.graph.approve_link(code, timestamp_now())?;
        let device = self.device()?;

        let mut own_devices = vec![self.self_device_info()?];
        own_devices.extend(self.graph.own_devices()?);

        let approval = ClientMessage::DeviceLinkApproval(DeviceLinkApprovalMessage {
            p2p_public_key: device.p2p_public_key.clone(),
            p2p_private_key: Some(device.p2p_secret_key.clone()),
            recovery_public_key: device.recovery_public_key.clone(),
            challenge_response: parsed.challenge.clone(),
            own_devices,
            friends_export: serde_json::to_vec(&self.friends.all()?)
                .map_err(|e| CoreError::StorageIO(format!("friends export: {e}")))?,
            sessions_export: None,
            trusted_ids_export: None,
            timestamp: timestamp_now(),
        })
        .encode()?;
        self.post_to(&parsed.server_user_id, &approval).await?;

        let sync = SyncState {
            friends: self.friends.all()?,
            messages: self.messages.all()?,
            settings: self.settings()?,
        };
        let blob = ClientMessage::SyncBlob(SyncBlobMessage {
            compressed_data: self.compress.compress(
                &serde_json::to_vec(&sync)
                    .map_err(|e| CoreError::StorageIO(format!("sync state: {e}")))?,
            )?,
        })
        .encode()?;
        self.post_to(&parsed.server_user_id, &blob).await?;

        // The uuid behind the device username is confirmed by the new
        // device's announce; until then the username suffix stands in.
        let uuid_prefix = parsed
            .device_username
            .rsplit('_')
            .next()
            .unwrap_or_default()
            .to_string();
        self.graph.add_own_device(&DeviceInfo {
            server_user_id: parsed.server_user_id.clone(),
            device_uuid: uuid_prefix,
            device_name: parsed.device_username.clone(),
            identity_key: parsed.identity_key.clone(),
        })?;

        self.events.emit_device(DeviceEvent::LinkApproved {
            device_username: parsed.device_username,
        });
        Ok(())
    }

    /// Broadcast our account's device list to our devices and all
    /// accepted friends.
    pub async fn announce_self(&self) -> Result<(), CoreError> {
        let timestamp = timestamp_now();
        let mut devices = vec![self.self_device_info()?];
        devices.extend(self.graph.own_devices()?);
        devices.sort_by(|a, b| a.server_user_id.cmp(&b.server_user_id));

        let signature = self
            .keystore
            .identity()?
            .sign(&announce_signing_bytes(&devices, timestamp, false))
            .to_vec();
        let recovery_public_key = Some(self.device()?.recovery_public_key);
        let payload = ClientMessage::DeviceAnnounce(DeviceAnnounceMessage {
            devices,
            timestamp,
            is_revocation: false,
            signature,
            recovery_public_key,
        })
        .encode()?;

        for target in self.announce_targets()? {
            if let Err(e) = self.post_to(&target, &payload).await {
                tracing::warn!(error = %e, target = %target, "device announce send failed");
            }
        }
        Ok(())
    }

    /// Revoke one of this account's devices using the recovery phrase.
    ///
    /// The revoked device is still a delivery target so it learns about
    /// its own removal and wipes.
    pub async fn revoke_device(
        &self,
        phrase: &str,
        revoked_device_uuid: &str,
    ) -> Result<(), CoreError> {
        let device = self.device()?;

        let mut remaining = vec![self.self_device_info()?];
        remaining.extend(
            self.graph
                .own_devices()?
                .into_iter()
                .filter(|d| d.device_uuid != revoked_device_uuid),
        );
        remaining.sort_by(|a, b| a.server_user_id.cmp(&b.server_user_id));

        let announce = build_revocation(
            phrase,
            &device.recovery_public_key,
            remaining.clone(),
            timestamp_now(),
        )?;
        let payload = ClientMessage::DeviceAnnounce(announce).encode()?;

        for target in self.announce_targets()? {
            if let Err(e) = self.post_to(&target, &payload).await {
                tracing::warn!(error = %e, target = %target, "revocation send failed");
            }
        }

        let remaining_others: Vec<DeviceInfo> = remaining
            .into_iter()
            .filter(|d| d.device_uuid != device.device_uuid)
            .collect();
        self.graph.set_own_devices(&remaining_others)?;
        self.events.emit_device(DeviceEvent::OwnDevicesChanged);
        Ok(())
    }

    // ── Shared helpers ──────────────────────────────────────────────

    /// Encrypt for one device-user and post to its queue.
    async fn post_to(&self, user_id: &str, payload: &[u8]) -> Result<(), CoreError> {
        let message = self.engine.encrypt(user_id, payload).await?;
        self.server.post_message(user_id, &message).await?;
        Ok(())
    }

    /// Best-effort fan-out to every device of a friend, in deterministic
    /// order. Individual failures are logged and counted, never fatal.
    async fn fan_out(&self, friend: &Friend, payload: &[u8]) -> (u32, u32) {
        let mut successes = 0;
        let mut failures = 0;
        for target in friend.device_user_ids() {
            match self.post_to(&target, payload).await {
                Ok(()) => successes += 1,
                Err(e) => {
                    tracing::warn!(error = %e, target = %target, "fan-out send failed");
                    failures += 1;
                }
            }
        }
        (successes, failures)
    }

    /// SENT_SYNC to our own other devices, after the primary fan-out.
    async fn self_sync(
        &self,
        conversation: &str,
        message_id: &str,
        timestamp: u64,
        content: &[u8],
    ) -> Result<(), CoreError> {
        let payload = ClientMessage::SentSync(SentSyncMessage {
            conversation_id: conversation.to_string(),
            message_id: message_id.to_string(),
            timestamp,
            content: content.to_vec(),
        })
        .encode()?;
        for target in self.graph.own_device_user_ids()? {
            if let Err(e) = self.post_to(&target, &payload).await {
                tracing::warn!(error = %e, target = %target, "self-sync send failed");
            }
        }
        Ok(())
    }

    fn announce_targets(&self) -> Result<Vec<String>, CoreError> {
        let mut targets = self.graph.own_device_user_ids()?;
        for friend in self.friends.accepted()? {
            targets.extend(friend.device_user_ids());
        }
        targets.sort();
        targets.dedup();
        Ok(targets)
    }

    /// Conversation id for an inbound sender: the friend's username when
    /// we know them, the raw source user id otherwise.
    fn conversation_for(&self, source: &str) -> Result<String, CoreError> {
        Ok(self
            .friends
            .find_by_server_user_id(source)?
            .map_or_else(|| source.to_string(), |f| f.username))
    }

    fn device(&self) -> Result<DeviceIdentity, CoreError> {
        self.keystore
            .device_identity()?
            .ok_or(CoreError::NotInitialized)
    }

    fn self_device_info(&self) -> Result<DeviceInfo, CoreError> {
        let device = self.device()?;
        Ok(DeviceInfo {
            server_user_id: device.server_user_id,
            device_uuid: device.device_uuid,
            device_name: device.device_username,
            identity_key: self.keystore.identity()?.public_key_bytes().to_vec(),
        })
    }

    fn settings(&self) -> Result<serde_json::Map<String, serde_json::Value>, CoreError> {
        let mut settings = serde_json::Map::new();
        for (key, data) in self.storage.list(COL_SETTINGS, "")? {
            let value = serde_json::from_slice(&data)
                .map_err(|e| CoreError::StorageIO(format!("corrupt setting: {e}")))?;
            settings.insert(key, value);
        }
        Ok(settings)
    }

    /// Destroy all local account state after a remote revocation.
    fn wipe_local(&self) -> Result<(), CoreError> {
        self.keystore.wipe()?;
        self.graph.clear_own_devices()?;
        for collection in [
            crate::friends::COL_FRIENDS,
            crate::messages::COL_MESSAGES,
            crate::messages::COL_READ_MARKS,
            COL_SETTINGS,
            crate::attachments::COL_ATTACHMENT_CACHE,
        ] {
            self.storage.clear(collection)?;
        }
        Ok(())
    }
}

#[async_trait]
impl ModelOutbox for Dispatcher {
    /// Replicate a model entry: own devices always, then the target set
    /// the store resolved.
    async fn broadcast_model_sync(
        &self,
        message: ModelSyncMessage,
        targets: BroadcastTargets,
    ) -> Result<(), CoreError> {
        let device = self.device()?;
        let payload = ClientMessage::ModelSync(message).encode()?;

        let mut ids = self.graph.own_device_user_ids()?;
        match targets {
            BroadcastTargets::OwnDevicesOnly => {}
            BroadcastTargets::Members(usernames) => {
                for username in usernames {
                    if username == device.core_username {
                        continue;
                    }
                    if let Some(friend) = self.friends.get(&username)? {
                        ids.extend(friend.device_user_ids());
                    }
                }
            }
            BroadcastTargets::AllFriends => {
                for friend in self.friends.accepted()? {
                    ids.extend(friend.device_user_ids());
                }
            }
        }
        ids.sort();
        ids.dedup();

        for target in ids {
            if let Err(e) = self.post_to(&target, &payload).await {
                tracing::warn!(error = %e, target = %target, "model sync send failed");
            }
        }
        Ok(())
    }
}
