//! The `Core` handle: construction, account lifecycle, and the public
//! API surface. Process-wide state lives behind this handle and nowhere
//! else; logout is the documented clear point for the key cache.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use uuid::Uuid;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

use obscura_crypto::identity::verify_code;
use obscura_crypto::ratchet::prekeys::{generate_prekey_batch, generate_signed_prekey};
use obscura_crypto::recovery::RecoveryKeyPair;
use obscura_crypto::RatchetIdentity;
use obscura_protocol::gateway::Gateway;
use obscura_protocol::link_code::create_link_code;
use obscura_protocol::transport::{PreKeyDto, PreKeyUpload, ServerApi, SignedPreKeyDto};
use obscura_protocol::types::AttachmentPointer;

use crate::attachments::AttachmentManager;
use crate::backup::{self, BackupFile, BackupSnapshot};
use crate::compress::Compress;
use crate::device_graph::DeviceGraph;
use crate::dispatcher::{Dispatcher, FanOutReport, COL_SETTINGS};
use crate::error::CoreError;
use crate::events::EventBus;
use crate::friends::FriendRepo;
use crate::keystore::{DeviceIdentity, KeyStore};
use crate::messages::MessageRepo;
use crate::models::{ModelSchema, ModelStore};
use crate::session_engine::{SessionEngine, PREKEY_BATCH};
use crate::storage::{timestamp_now, Storage};

pub struct CoreConfig {
    /// Account-level username, shared by all the user's devices.
    pub core_username: String,
    /// Server user id assigned to this device.
    pub server_user_id: String,
    /// Chunked-attachment upload rate (the pacer floor is 1050/N ms).
    pub chunks_per_second: u32,
    pub ttl_sweep_interval: Duration,
    pub cache_attachments: bool,
}

impl CoreConfig {
    pub fn new(core_username: &str, server_user_id: &str) -> Self {
        Self {
            core_username: core_username.to_string(),
            server_user_id: server_user_id.to_string(),
            chunks_per_second: 4,
            ttl_sweep_interval: Duration::from_secs(1),
            cache_attachments: true,
        }
    }
}

/// What registration hands back to the user, exactly once.
pub struct RegistrationOutput {
    pub device_username: String,
    /// The 12-word phrase. Shown once, never stored.
    pub recovery_phrase: String,
}

pub struct Core {
    config: CoreConfig,
    storage: Arc<dyn Storage>,
    server: Arc<dyn ServerApi>,
    keystore: Arc<KeyStore>,
    engine: Arc<SessionEngine>,
    friends: Arc<FriendRepo>,
    messages: Arc<MessageRepo>,
    graph: Arc<DeviceGraph>,
    models: Arc<ModelStore>,
    attachments: Arc<AttachmentManager>,
    dispatcher: Arc<Dispatcher>,
    events: EventBus,
    gateway_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    sweeper_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Core {
    /// Wire the core together from its injected capabilities.
    pub fn open(
        config: CoreConfig,
        storage: Arc<dyn Storage>,
        compress: Arc<dyn Compress>,
        server: Arc<dyn ServerApi>,
        gateway: Arc<dyn Gateway>,
    ) -> Arc<Self> {
        let events = EventBus::new();
        let keystore = Arc::new(KeyStore::new(storage.clone()));
        let engine = Arc::new(SessionEngine::new(keystore.clone(), server.clone()));
        let friends = Arc::new(FriendRepo::new(storage.clone()));
        let messages = Arc::new(MessageRepo::new(storage.clone()));
        let graph = Arc::new(DeviceGraph::new(storage.clone(), friends.clone()));
        let models = Arc::new(ModelStore::new(
            keystore.clone(),
            storage.clone(),
            graph.clone(),
            friends.clone(),
            events.clone(),
        ));
        let attachments = Arc::new(AttachmentManager::new(
            server.clone(),
            config.cache_attachments.then(|| storage.clone()),
            config.chunks_per_second,
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            engine.clone(),
            server.clone(),
            gateway,
            keystore.clone(),
            friends.clone(),
            messages.clone(),
            graph.clone(),
            models.clone(),
            attachments.clone(),
            compress,
            storage.clone(),
            events.clone(),
        ));
        models.set_outbox(dispatcher.clone());

        Arc::new(Self {
            config,
            storage,
            server,
            keystore,
            engine,
            friends,
            messages,
            graph,
            models,
            attachments,
            dispatcher,
            events,
            gateway_task: Mutex::new(None),
            sweeper_task: Mutex::new(None),
        })
    }

    // ── Account lifecycle ───────────────────────────────────────────

    /// Create this account's first device: identity, recovery keypair,
    /// device identity, and the initial prekey upload.
    pub async fn register(&self, password: Option<&str>) -> Result<RegistrationOutput, CoreError> {
        if self.keystore.has_identity()? {
            return Err(CoreError::Validation("account already registered".into()));
        }
        let (recovery, recovery_phrase) = RecoveryKeyPair::generate();
        let device_username = self
            .create_identity(password, recovery.public_key_bytes().to_vec(), true)
            .await?;
        Ok(RegistrationOutput {
            device_username,
            recovery_phrase,
        })
    }

    /// Create an additional device and return its link code. The account
    /// state (recovery key, friends, history) arrives with the approval.
    pub async fn register_linked(&self, password: Option<&str>) -> Result<String, CoreError> {
        if self.keystore.has_identity()? {
            return Err(CoreError::Validation("account already registered".into()));
        }
        let device_username = self.create_identity(password, Vec::new(), false).await?;

        let identity = self.keystore.identity()?;
        let (code, challenge) = create_link_code(
            &identity,
            &self.config.server_user_id,
            &device_username,
            timestamp_now(),
        )?;
        self.dispatcher.expect_link_approval(challenge);
        Ok(code)
    }

    async fn create_identity(
        &self,
        password: Option<&str>,
        recovery_public_key: Vec<u8>,
        is_first_device: bool,
    ) -> Result<String, CoreError> {
        let identity = RatchetIdentity::generate();
        self.keystore.initialize(&identity, password)?;

        let device_uuid = Uuid::new_v4().to_string();
        let uuid_prefix = &device_uuid[..8];
        let device_username = format!("{}_{uuid_prefix}", self.config.core_username);

        let p2p_secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let p2p_public = X25519Public::from(&p2p_secret);

        self.keystore.set_device_identity(&DeviceIdentity {
            core_username: self.config.core_username.clone(),
            server_user_id: self.config.server_user_id.clone(),
            device_uuid,
            device_username: device_username.clone(),
            p2p_public_key: p2p_public.as_bytes().to_vec(),
            p2p_secret_key: p2p_secret.to_bytes().to_vec(),
            recovery_public_key,
            is_first_device,
        })?;

        self.upload_initial_keys(&identity).await?;
        Ok(device_username)
    }

    async fn upload_initial_keys(&self, identity: &RatchetIdentity) -> Result<(), CoreError> {
        let signed = generate_signed_prekey(identity, &*self.keystore, 1)?;
        let batch = generate_prekey_batch(&*self.keystore, 1, PREKEY_BATCH)?;
        self.server
            .upload_prekeys(PreKeyUpload {
                identity_key: identity.public_key_bytes().to_vec(),
                registration_id: identity.registration_id(),
                signed_pre_key: Some(SignedPreKeyDto {
                    key_id: signed.key_id,
                    public_key: signed.public_key,
                    signature: signed.signature,
                }),
                one_time_pre_keys: batch
                    .into_iter()
                    .map(|p| PreKeyDto {
                        key_id: p.key_id,
                        public_key: p.public_key,
                    })
                    .collect(),
            })
            .await?;
        Ok(())
    }

    /// Decrypt the stored identity into the key cache.
    pub fn login(&self, password: Option<&str>) -> Result<(), CoreError> {
        self.keystore.open(password)
    }

    /// Clear the key cache and stop the gateway.
    pub fn logout(&self) {
        self.disconnect();
        self.keystore.logout();
    }

    // ── Gateway lifecycle ───────────────────────────────────────────

    /// Start the gateway loop and the TTL sweeper.
    pub fn connect(self: &Arc<Self>) {
        let dispatcher = self.dispatcher.clone();
        *self.gateway_task.lock() = Some(tokio::spawn(dispatcher.run()));
        *self.sweeper_task.lock() = Some(
            self.models
                .spawn_ttl_sweeper(self.config.ttl_sweep_interval),
        );
    }

    pub fn disconnect(&self) {
        self.dispatcher.disconnect();
        if let Some(task) = self.gateway_task.lock().take() {
            task.abort();
        }
        if let Some(task) = self.sweeper_task.lock().take() {
            task.abort();
        }
    }

    // ── Messaging ───────────────────────────────────────────────────

    pub async fn send_text(
        &self,
        conversation: &str,
        text: &str,
    ) -> Result<FanOutReport, CoreError> {
        self.dispatcher.send_text(conversation, text).await
    }

    pub async fn send_attachment(
        &self,
        conversation: &str,
        data: &[u8],
        content_type: &str,
        file_name: Option<String>,
    ) -> Result<(FanOutReport, AttachmentPointer), CoreError> {
        self.dispatcher
            .send_attachment(conversation, data, content_type, file_name)
            .await
    }

    pub async fn download_attachment(
        &self,
        pointer: &AttachmentPointer,
    ) -> Result<Vec<u8>, CoreError> {
        self.attachments.download(pointer).await
    }

    pub async fn send_read_sync(&self, conversation: &str) -> Result<(), CoreError> {
        self.dispatcher.send_read_sync(conversation).await
    }

    // ── Friends ─────────────────────────────────────────────────────

    pub async fn send_friend_request(
        &self,
        username: &str,
        server_user_id: &str,
    ) -> Result<(), CoreError> {
        self.dispatcher
            .send_friend_request(username, server_user_id)
            .await
    }

    pub async fn respond_friend_request(
        &self,
        username: &str,
        accept: bool,
    ) -> Result<(), CoreError> {
        self.dispatcher.respond_friend_request(username, accept).await
    }

    pub async fn remove_friend(&self, username: &str) -> Result<(), CoreError> {
        self.dispatcher.remove_friend(username).await
    }

    /// The 4-digit code both sides read aloud to confirm a peer device's
    /// TOFU-pinned identity key.
    pub fn verify_code_for(&self, peer_user_id: &str) -> Result<Option<String>, CoreError> {
        Ok(self
            .keystore
            .trusted_identity_key(&SessionEngine::address(peer_user_id))?
            .map(|key| verify_code(&key)))
    }

    // ── Devices ─────────────────────────────────────────────────────

    pub async fn approve_link(&self, code: &str) -> Result<(), CoreError> {
        self.dispatcher.approve_link(code).await
    }

    pub async fn announce_self(&self) -> Result<(), CoreError> {
        self.dispatcher.announce_self().await
    }

    pub async fn revoke_device(
        &self,
        recovery_phrase: &str,
        device_uuid: &str,
    ) -> Result<(), CoreError> {
        self.dispatcher
            .revoke_device(recovery_phrase, device_uuid)
            .await
    }

    /// Opportunistic signed-prekey rotation; returns the new key id.
    pub async fn rotate_signed_prekey(&self) -> Result<u32, CoreError> {
        self.engine.rotate_signed_prekey().await
    }

    pub fn device_identity(&self) -> Result<Option<DeviceIdentity>, CoreError> {
        self.keystore.device_identity()
    }

    // ── Models ──────────────────────────────────────────────────────

    pub fn register_model(&self, schema: ModelSchema) -> Result<(), CoreError> {
        self.models.register(schema)
    }

    pub fn models(&self) -> &Arc<ModelStore> {
        &self.models
    }

    // ── Backup ──────────────────────────────────────────────────────

    pub fn export_backup(&self) -> Result<BackupFile, CoreError> {
        backup::export_backup(
            &self.keystore,
            &self.graph,
            &self.friends,
            &self.messages,
            self.settings()?,
        )
    }

    /// Restore an account from a backup file and the recovery phrase.
    ///
    /// Clears the key cache afterwards; the caller logs in with the new
    /// password to resume.
    pub fn import_backup(
        &self,
        bytes: &[u8],
        recovery_phrase: &str,
        new_password: Option<&str>,
    ) -> Result<BackupSnapshot, CoreError> {
        let snapshot = backup::decode_backup(bytes, recovery_phrase)?;
        backup::apply_backup(
            &snapshot,
            &self.keystore,
            &self.graph,
            &self.friends,
            &self.messages,
            new_password,
        )?;
        self.keystore.logout();
        Ok(snapshot)
    }

    // ── Accessors ───────────────────────────────────────────────────

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn friends(&self) -> &Arc<FriendRepo> {
        &self.friends
    }

    pub fn messages(&self) -> &Arc<MessageRepo> {
        &self.messages
    }

    pub fn device_graph(&self) -> &Arc<DeviceGraph> {
        &self.graph
    }

    pub fn keystore(&self) -> &Arc<KeyStore> {
        &self.keystore
    }

    pub fn session_engine(&self) -> &Arc<SessionEngine> {
        &self.engine
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
}
