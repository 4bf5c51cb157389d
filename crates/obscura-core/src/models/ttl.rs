//! The TTL index for ephemeral models.

use std::sync::Arc;

use crate::error::CoreError;
use crate::storage::Storage;

pub const COL_MODEL_TTL: &str = "model_ttl";

pub struct TtlIndex {
    storage: Arc<dyn Storage>,
}

impl TtlIndex {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    pub fn schedule(&self, model: &str, id: &str, expires_at: u64) -> Result<(), CoreError> {
        self.storage.put(
            COL_MODEL_TTL,
            &format!("{model}/{id}"),
            &expires_at.to_le_bytes(),
        )?;
        Ok(())
    }

    pub fn remove(&self, model: &str, id: &str) -> Result<(), CoreError> {
        self.storage.delete(COL_MODEL_TTL, &format!("{model}/{id}"))?;
        Ok(())
    }

    /// All (model, id) pairs whose expiry is at or before `now`.
    pub fn due(&self, now: u64) -> Result<Vec<(String, String)>, CoreError> {
        let mut due = Vec::new();
        for (key, value) in self.storage.list(COL_MODEL_TTL, "")? {
            let bytes: [u8; 8] = value
                .as_slice()
                .try_into()
                .map_err(|_| CoreError::StorageIO("corrupt ttl record".into()))?;
            if u64::from_le_bytes(bytes) <= now {
                if let Some((model, id)) = key.split_once('/') {
                    due.push((model.to_string(), id.to_string()));
                }
            }
        }
        Ok(due)
    }
}
