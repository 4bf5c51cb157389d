//! The association index: belongs-to edges between model entries.
//!
//! An edge (parent_model, parent_id, child_model, child_id) is recorded
//! when a child entry carries `data["{parent_model}Id"]`.

use std::sync::Arc;

use serde_json::Value;

use crate::error::CoreError;
use crate::models::entry::ModelEntry;
use crate::models::schema::ModelSchema;
use crate::storage::Storage;

pub const COL_MODEL_ASSOC: &str = "model_assoc";

pub struct AssociationIndex {
    storage: Arc<dyn Storage>,
}

impl AssociationIndex {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    pub fn record(
        &self,
        parent_model: &str,
        parent_id: &str,
        child_model: &str,
        child_id: &str,
    ) -> Result<(), CoreError> {
        let key = edge_key(parent_model, parent_id, child_model, child_id);
        self.storage.put(COL_MODEL_ASSOC, &key, &[1])?;
        Ok(())
    }

    /// Record every belongs-to edge a new entry implies.
    pub fn record_edges(&self, schema: &ModelSchema, entry: &ModelEntry) -> Result<(), CoreError> {
        for parent in &schema.belongs_to {
            if let Some(Value::String(parent_id)) = entry.data.get(&format!("{parent}Id")) {
                self.record(parent, parent_id, &schema.name, &entry.id)?;
            }
        }
        Ok(())
    }

    /// Child ids of one parent entry for a given child model.
    pub fn children(
        &self,
        parent_model: &str,
        parent_id: &str,
        child_model: &str,
    ) -> Result<Vec<String>, CoreError> {
        let prefix = format!("{parent_model}/{parent_id}/{child_model}/");
        let mut ids = Vec::new();
        for (key, _) in self.storage.list(COL_MODEL_ASSOC, &prefix)? {
            if let Some(child_id) = key.strip_prefix(&prefix) {
                ids.push(child_id.to_string());
            }
        }
        Ok(ids)
    }

    /// Drop every edge pointing at a child entry (TTL eviction).
    pub fn remove_child(&self, child_model: &str, child_id: &str) -> Result<(), CoreError> {
        let suffix = format!("/{child_model}/{child_id}");
        for (key, _) in self.storage.list(COL_MODEL_ASSOC, "")? {
            if key.ends_with(&suffix) {
                self.storage.delete(COL_MODEL_ASSOC, &key)?;
            }
        }
        Ok(())
    }
}

fn edge_key(parent_model: &str, parent_id: &str, child_model: &str, child_id: &str) -> String {
    format!("{parent_model}/{parent_id}/{child_model}/{child_id}")
}
