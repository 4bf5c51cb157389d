//! CRDT entries and their canonical signing form.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// One replicated record of a model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelEntry {
    /// `{model}_{timestamp}_{rand}`, unique across devices.
    pub id: String,
    pub data: serde_json::Map<String, Value>,
    pub timestamp: u64,
    pub author_device_id: String,
    /// Ed25519 signature over [`signing_bytes`] by the author's ratchet
    /// identity key.
    pub signature: Vec<u8>,
}

impl ModelEntry {
    /// LWW deletes are tombstones: entries whose data is `{_deleted: true}`.
    pub fn is_tombstone(&self) -> bool {
        self.data.get("_deleted") == Some(&Value::Bool(true))
    }

    pub fn signing_bytes(&self, model: &str) -> Vec<u8> {
        signing_bytes(
            model,
            &self.id,
            &self.data,
            self.timestamp,
            &self.author_device_id,
        )
    }
}

/// Reproducible byte encoding of `{model, id, data, timestamp,
/// author_device_id}`. serde_json objects are ordered maps with sorted
/// keys, so the output is stable across devices and implementations.
pub fn signing_bytes(
    model: &str,
    id: &str,
    data: &serde_json::Map<String, Value>,
    timestamp: u64,
    author_device_id: &str,
) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "authorDeviceId": author_device_id,
        "data": data,
        "id": id,
        "model": model,
        "timestamp": timestamp,
    }))
    .unwrap_or_default()
}

/// A tombstone payload.
pub fn tombstone_data() -> serde_json::Map<String, Value> {
    let mut data = serde_json::Map::new();
    data.insert("_deleted".to_string(), Value::Bool(true));
    data
}
