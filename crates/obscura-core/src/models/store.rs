//! The model store: user-declared models replicated as signed CRDT
//! entries, with associations, queries, TTL expiry, and targeted
//! broadcast through the dispatcher.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use rand::rngs::OsRng;
use rand::Rng as _;
use serde_json::Value;

use obscura_crypto::RatchetIdentity;
use obscura_protocol::message::{model_ops, ModelSyncMessage};

use crate::device_graph::DeviceGraph;
use crate::error::CoreError;
use crate::events::{EventBus, ModelEvent};
use crate::friends::FriendRepo;
use crate::keystore::KeyStore;
use crate::models::assoc::AssociationIndex;
use crate::models::crdt::{Crdt, GSet, LwwMap};
use crate::models::entry::{signing_bytes, tombstone_data, ModelEntry};
use crate::models::query::Query;
use crate::models::schema::{ModelSchema, SyncKind};
use crate::models::ttl::TtlIndex;
use crate::storage::{timestamp_now, Storage};

/// Who an entry replicates to, beyond the sender's own devices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BroadcastTargets {
    /// Private model: own devices only.
    OwnDevicesOnly,
    /// Scoped by a targeting parent's member list.
    Members(Vec<String>),
    /// Every accepted friend.
    AllFriends,
}

/// The dispatcher-side capability the store uses to replicate entries.
#[async_trait]
pub trait ModelOutbox: Send + Sync {
    async fn broadcast_model_sync(
        &self,
        message: ModelSyncMessage,
        targets: BroadcastTargets,
    ) -> Result<(), CoreError>;
}

struct ModelState {
    schema: ModelSchema,
    crdt: RwLock<Crdt>,
}

pub struct ModelStore {
    keystore: Arc<KeyStore>,
    storage: Arc<dyn Storage>,
    graph: Arc<DeviceGraph>,
    friends: Arc<FriendRepo>,
    events: EventBus,
    models: RwLock<HashMap<String, Arc<ModelState>>>,
    assoc: AssociationIndex,
    ttl: TtlIndex,
    outbox: OnceLock<Arc<dyn ModelOutbox>>,
}

impl ModelStore {
    pub fn new(
        keystore: Arc<KeyStore>,
        storage: Arc<dyn Storage>,
        graph: Arc<DeviceGraph>,
        friends: Arc<FriendRepo>,
        events: EventBus,
    ) -> Self {
        Self {
            keystore,
            storage: storage.clone(),
            graph,
            friends,
            events,
            models: RwLock::new(HashMap::new()),
            assoc: AssociationIndex::new(storage.clone()),
            ttl: TtlIndex::new(storage),
            outbox: OnceLock::new(),
        }
    }

    /// Wire the dispatcher in after construction. Entries created before
    /// this stay local until the next write.
    pub fn set_outbox(&self, outbox: Arc<dyn ModelOutbox>) {
        let _ = self.outbox.set(outbox);
    }

    /// Declare a model and load its persisted rows.
    pub fn register(&self, schema: ModelSchema) -> Result<(), CoreError> {
        let mut crdt = match schema.sync {
            SyncKind::GSet => Crdt::GSet(GSet::default()),
            SyncKind::Lww => Crdt::Lww(LwwMap::default()),
        };
        for (_, data) in self.storage.list(&row_collection(&schema.name), "")? {
            let entry: ModelEntry = serde_json::from_slice(&data)
                .map_err(|e| CoreError::StorageIO(format!("corrupt model row: {e}")))?;
            crdt.merge(entry);
        }
        self.models.write().insert(
            schema.name.clone(),
            Arc::new(ModelState {
                schema,
                crdt: RwLock::new(crdt),
            }),
        );
        Ok(())
    }

    pub fn is_registered(&self, model: &str) -> bool {
        self.models.read().contains_key(model)
    }

    /// Create a new entry on an append-only model.
    ///
    /// Idempotent by id; last-writer-wins models use [`Self::upsert`].
    pub async fn create(
        &self,
        model: &str,
        data: serde_json::Map<String, Value>,
    ) -> Result<ModelEntry, CoreError> {
        let state = self.state(model)?;
        if state.schema.sync == SyncKind::Lww {
            return Err(CoreError::Validation(format!(
                "model {model:?} is last-writer-wins, use upsert"
            )));
        }
        if data.contains_key("_deleted") {
            return Err(CoreError::Validation("_deleted is reserved".into()));
        }
        state.schema.validate(&data)?;

        let timestamp = timestamp_now();
        let id = format!("{model}_{timestamp}_{:08x}", OsRng.gen::<u32>());
        let entry = self.build_signed_entry(model, &id, data, timestamp)?;

        let outcome = state.crdt.write().merge(entry.clone());
        if !outcome.merged() {
            // Same id already present; the set keeps the original.
            return Ok(state
                .crdt
                .read()
                .get(&id)
                .cloned()
                .unwrap_or(entry));
        }
        self.persist_merged(&state.schema, &entry)?;
        self.broadcast(&state.schema, &entry).await;
        Ok(entry)
    }

    /// Write (or overwrite) an entry on a last-writer-wins model.
    pub async fn upsert(
        &self,
        model: &str,
        id: &str,
        data: serde_json::Map<String, Value>,
    ) -> Result<ModelEntry, CoreError> {
        let state = self.state(model)?;
        if state.schema.sync != SyncKind::Lww {
            return Err(CoreError::Validation(format!(
                "model {model:?} is append-only, use create"
            )));
        }
        if data.contains_key("_deleted") {
            return Err(CoreError::Validation("_deleted is reserved".into()));
        }
        state.schema.validate(&data)?;
        self.write_lww(&state, model, id, data).await
    }

    /// Delete an entry on a last-writer-wins model by writing a tombstone.
    pub async fn delete(&self, model: &str, id: &str) -> Result<ModelEntry, CoreError> {
        let state = self.state(model)?;
        if state.schema.sync != SyncKind::Lww {
            return Err(CoreError::Validation(format!(
                "model {model:?} is append-only, entries cannot be deleted"
            )));
        }
        self.write_lww(&state, model, id, tombstone_data()).await
    }

    pub fn find(&self, model: &str, id: &str) -> Result<Option<ModelEntry>, CoreError> {
        let state = self.state(model)?;
        let entry = state.crdt.read().get(id).cloned();
        Ok(entry.filter(|e| !e.is_tombstone()))
    }

    /// Every live entry, tombstones excluded.
    pub fn all(&self, model: &str) -> Result<Vec<ModelEntry>, CoreError> {
        let state = self.state(model)?;
        let entries = state.crdt.read().all();
        Ok(entries.into_iter().filter(|e| !e.is_tombstone()).collect())
    }

    /// Run a query; `include`d children land on each hit's data under
    /// `{assoc}s`, tombstones excluded.
    pub fn query(&self, model: &str, query: &Query) -> Result<Vec<ModelEntry>, CoreError> {
        let mut hits = query.apply(self.all(model)?);
        for assoc_model in query.includes() {
            for hit in &mut hits {
                let mut children = Vec::new();
                for child_id in self.assoc.children(model, &hit.id, assoc_model)? {
                    if let Some(child) = self.find(assoc_model, &child_id)? {
                        children.push(serde_json::to_value(child).unwrap_or(Value::Null));
                    }
                }
                hit.data
                    .insert(format!("{assoc_model}s"), Value::Array(children));
            }
        }
        Ok(hits)
    }

    pub fn count(&self, model: &str, query: &Query) -> Result<usize, CoreError> {
        Ok(query.apply(self.all(model)?).len())
    }

    /// Merge a MODEL_SYNC from a peer device. Returns the merged entry,
    /// or `None` when the CRDT rejected it or its signature failed
    /// against a known author key.
    pub fn handle_sync(&self, message: &ModelSyncMessage) -> Result<Option<ModelEntry>, CoreError> {
        let state = self.state(&message.model)?;
        let data: serde_json::Map<String, Value> = serde_json::from_slice(&message.data)
            .map_err(|e| CoreError::Validation(format!("model sync data: {e}")))?;

        let entry = ModelEntry {
            id: message.id.clone(),
            data,
            timestamp: message.timestamp,
            author_device_id: message.author_device_id.clone(),
            signature: message.signature.clone(),
        };

        match self.author_identity_key(&message.author_device_id)? {
            Some(author_key) => {
                if RatchetIdentity::verify(
                    &author_key,
                    &entry.signing_bytes(&message.model),
                    &entry.signature,
                )
                .is_err()
                {
                    tracing::warn!(
                        model = %message.model,
                        id = %message.id,
                        author = %message.author_device_id,
                        "model sync signature invalid, rejecting"
                    );
                    return Ok(None);
                }
            }
            None => {
                tracing::debug!(
                    author = %message.author_device_id,
                    "author identity not yet known, merging unverified"
                );
            }
        }

        let outcome = state.crdt.write().merge(entry.clone());
        if !outcome.merged() {
            return Ok(None);
        }
        self.persist_merged(&state.schema, &entry)?;
        Ok(Some(entry))
    }

    /// Expire every due ephemeral entry. Idempotent; runs periodically.
    pub async fn sweep_expired(&self) {
        let now = timestamp_now();
        let due = match self.ttl.due(now) {
            Ok(due) => due,
            Err(e) => {
                tracing::warn!(error = %e, "ttl scan failed");
                return;
            }
        };
        for (model, id) in due {
            let Ok(state) = self.state(&model) else {
                let _ = self.ttl.remove(&model, &id);
                continue;
            };
            let expired = match state.schema.sync {
                SyncKind::Lww => match self.delete(&model, &id).await {
                    Ok(_) => true,
                    Err(e) => {
                        tracing::warn!(error = %e, model = %model, id = %id, "ttl delete failed");
                        false
                    }
                },
                SyncKind::GSet => {
                    state.crdt.write().evict(&id);
                    let _ = self.storage.delete(&row_collection(&model), &id);
                    let _ = self.assoc.remove_child(&model, &id);
                    true
                }
            };
            if expired {
                if let Err(e) = self.ttl.remove(&model, &id) {
                    tracing::warn!(error = %e, "ttl remove failed");
                }
                self.events.emit_model(ModelEvent::Expired { model, id });
            }
        }
    }

    /// Run the expiry sweep on an interval until aborted.
    pub fn spawn_ttl_sweeper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            loop {
                tick.tick().await;
                store.sweep_expired().await;
            }
        })
    }

    async fn write_lww(
        &self,
        state: &Arc<ModelState>,
        model: &str,
        id: &str,
        data: serde_json::Map<String, Value>,
    ) -> Result<ModelEntry, CoreError> {
        let timestamp = timestamp_now();
        let entry = self.build_signed_entry(model, id, data, timestamp)?;

        let outcome = state.crdt.write().merge(entry.clone());
        if outcome.merged() {
            self.persist_merged(&state.schema, &entry)?;
            // Broadcast only writes that won locally.
            self.broadcast(&state.schema, &entry).await;
            Ok(entry)
        } else {
            Ok(state.crdt.read().get(id).cloned().unwrap_or(entry))
        }
    }

    fn build_signed_entry(
        &self,
        model: &str,
        id: &str,
        data: serde_json::Map<String, Value>,
        timestamp: u64,
    ) -> Result<ModelEntry, CoreError> {
        let device = self
            .keystore
            .device_identity()?
            .ok_or(CoreError::NotInitialized)?;
        let identity = self.keystore.identity()?;
        let signature = identity
            .sign(&signing_bytes(model, id, &data, timestamp, &device.device_uuid))
            .to_vec();
        Ok(ModelEntry {
            id: id.to_string(),
            data,
            timestamp,
            author_device_id: device.device_uuid,
            signature,
        })
    }

    fn persist_merged(&self, schema: &ModelSchema, entry: &ModelEntry) -> Result<(), CoreError> {
        let data = serde_json::to_vec(entry)
            .map_err(|e| CoreError::StorageIO(format!("serialize model row: {e}")))?;
        self.storage
            .put(&row_collection(&schema.name), &entry.id, &data)?;
        self.assoc.record_edges(schema, entry)?;
        if let Some(ttl) = schema.ttl {
            if !entry.is_tombstone() {
                let expires_at = entry.timestamp + u64::try_from(ttl.as_millis()).unwrap_or(0);
                self.ttl.schedule(&schema.name, &entry.id, expires_at)?;
            }
        }
        Ok(())
    }

    async fn broadcast(&self, schema: &ModelSchema, entry: &ModelEntry) {
        let Some(outbox) = self.outbox.get() else {
            tracing::debug!(model = %schema.name, "no outbox wired, entry stays local");
            return;
        };
        let targets = match self.targeting(schema, entry) {
            Ok(targets) => targets,
            Err(e) => {
                tracing::warn!(error = %e, model = %schema.name, "target resolution failed");
                return;
            }
        };
        let message = ModelSyncMessage {
            model: schema.name.clone(),
            id: entry.id.clone(),
            op: model_ops::OP_CREATE,
            timestamp: entry.timestamp,
            data: serde_json::to_vec(&entry.data).unwrap_or_default(),
            signature: entry.signature.clone(),
            author_device_id: entry.author_device_id.clone(),
        };
        if let Err(e) = outbox.broadcast_model_sync(message, targets).await {
            tracing::warn!(error = %e, model = %schema.name, id = %entry.id, "model broadcast failed");
        }
    }

    /// Resolve who an entry goes to: own devices always; private stops
    /// there; a targeting parent's member list scopes it; otherwise every
    /// accepted friend.
    fn targeting(
        &self,
        schema: &ModelSchema,
        entry: &ModelEntry,
    ) -> Result<BroadcastTargets, CoreError> {
        if schema.private {
            return Ok(BroadcastTargets::OwnDevicesOnly);
        }
        for parent in &schema.belongs_to {
            let Some(Value::String(parent_id)) = entry.data.get(&format!("{parent}Id")) else {
                continue;
            };
            let Some(parent_state) = self.models.read().get(parent).cloned() else {
                continue;
            };
            if !parent_state.schema.fields.contains_key("members") {
                continue;
            }
            let Some(parent_entry) = self.find(parent, parent_id)? else {
                continue;
            };
            if let Some(Value::String(members_json)) = parent_entry.data.get("members") {
                if let Ok(usernames) = serde_json::from_str::<Vec<String>>(members_json) {
                    return Ok(BroadcastTargets::Members(usernames));
                }
            }
        }
        Ok(BroadcastTargets::AllFriends)
    }

    /// The ratchet identity key for an author device uuid, if we know it:
    /// ourselves, one of our own devices, or any friend device.
    fn author_identity_key(&self, device_uuid: &str) -> Result<Option<Vec<u8>>, CoreError> {
        if let Some(device) = self.keystore.device_identity()? {
            if device.device_uuid == device_uuid {
                return Ok(Some(self.keystore.identity()?.public_key_bytes().to_vec()));
            }
        }
        for device in self.graph.own_devices()? {
            if device.device_uuid == device_uuid && !device.identity_key.is_empty() {
                return Ok(Some(device.identity_key));
            }
        }
        for friend in self.friends.all()? {
            for device in friend.devices {
                if device.device_uuid == device_uuid && !device.identity_key.is_empty() {
                    return Ok(Some(device.identity_key));
                }
            }
        }
        Ok(None)
    }

    fn state(&self, model: &str) -> Result<Arc<ModelState>, CoreError> {
        self.models
            .read()
            .get(model)
            .cloned()
            .ok_or_else(|| CoreError::UnknownModel(model.to_string()))
    }
}

fn row_collection(model: &str) -> String {
    format!("model_rows:{model}")
}
