//! The two CRDT flavors behind every model.

use std::collections::HashMap;

use crate::models::entry::ModelEntry;

/// What a merge did with an incoming entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Added,
    Replaced,
    /// Duplicate id (G-Set) or not strictly newer (LWW).
    Ignored,
}

impl MergeOutcome {
    pub fn merged(self) -> bool {
        !matches!(self, MergeOutcome::Ignored)
    }
}

/// Grow-only set keyed by entry id. Merge is union; entries never change.
#[derive(Debug, Default)]
pub struct GSet {
    entries: HashMap<String, ModelEntry>,
}

impl GSet {
    pub fn merge(&mut self, entry: ModelEntry) -> MergeOutcome {
        if self.entries.contains_key(&entry.id) {
            return MergeOutcome::Ignored;
        }
        self.entries.insert(entry.id.clone(), entry);
        MergeOutcome::Added
    }

    /// Local-only removal, used by TTL expiry. Not a replicated op.
    pub fn evict(&mut self, id: &str) -> bool {
        self.entries.remove(id).is_some()
    }
}

/// Last-writer-wins map keyed by entry id: a write lands iff its timestamp
/// is strictly newer than the local one.
#[derive(Debug, Default)]
pub struct LwwMap {
    entries: HashMap<String, ModelEntry>,
}

impl LwwMap {
    pub fn merge(&mut self, entry: ModelEntry) -> MergeOutcome {
        match self.entries.get(&entry.id) {
            Some(local) if entry.timestamp <= local.timestamp => MergeOutcome::Ignored,
            Some(_) => {
                self.entries.insert(entry.id.clone(), entry);
                MergeOutcome::Replaced
            }
            None => {
                self.entries.insert(entry.id.clone(), entry);
                MergeOutcome::Added
            }
        }
    }
}

/// A model's CRDT instance.
#[derive(Debug)]
pub enum Crdt {
    GSet(GSet),
    Lww(LwwMap),
}

impl Crdt {
    pub fn merge(&mut self, entry: ModelEntry) -> MergeOutcome {
        match self {
            Crdt::GSet(set) => set.merge(entry),
            Crdt::Lww(map) => map.merge(entry),
        }
    }

    pub fn get(&self, id: &str) -> Option<&ModelEntry> {
        match self {
            Crdt::GSet(set) => set.entries.get(id),
            Crdt::Lww(map) => map.entries.get(id),
        }
    }

    /// Every entry, tombstones included, in id order for determinism.
    pub fn all(&self) -> Vec<ModelEntry> {
        let entries = match self {
            Crdt::GSet(set) => &set.entries,
            Crdt::Lww(map) => &map.entries,
        };
        let mut out: Vec<ModelEntry> = entries.values().cloned().collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    pub fn len(&self) -> usize {
        match self {
            Crdt::GSet(set) => set.entries.len(),
            Crdt::Lww(map) => map.entries.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Local-only eviction (TTL). Only meaningful for G-Sets; LWW models
    /// expire through tombstones.
    pub fn evict(&mut self, id: &str) -> bool {
        match self {
            Crdt::GSet(set) => set.evict(id),
            Crdt::Lww(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, timestamp: u64, marker: &str) -> ModelEntry {
        let mut data = serde_json::Map::new();
        data.insert("marker".into(), serde_json::Value::String(marker.into()));
        ModelEntry {
            id: id.to_string(),
            data,
            timestamp,
            author_device_id: "dev".into(),
            signature: vec![],
        }
    }

    #[test]
    fn gset_union_is_order_independent() {
        let entries = vec![entry("a", 1, "a"), entry("b", 2, "b"), entry("c", 3, "c")];

        let mut forward = GSet::default();
        for e in entries.clone() {
            forward.merge(e);
        }
        let mut backward = GSet::default();
        for e in entries.into_iter().rev() {
            backward.merge(e);
        }

        let a = Crdt::GSet(forward).all();
        let b = Crdt::GSet(backward).all();
        assert_eq!(a, b);
    }

    #[test]
    fn gset_is_idempotent() {
        let mut set = GSet::default();
        assert_eq!(set.merge(entry("a", 1, "first")), MergeOutcome::Added);
        assert_eq!(set.merge(entry("a", 9, "second")), MergeOutcome::Ignored);

        let crdt = Crdt::GSet(set);
        assert_eq!(crdt.len(), 1);
        assert_eq!(
            crdt.get("a").unwrap().data["marker"],
            serde_json::Value::String("first".into())
        );
    }

    #[test]
    fn lww_takes_strictly_newer() {
        let mut map = LwwMap::default();
        assert_eq!(map.merge(entry("a", 10, "old")), MergeOutcome::Added);
        assert_eq!(map.merge(entry("a", 10, "tie")), MergeOutcome::Ignored);
        assert_eq!(map.merge(entry("a", 11, "new")), MergeOutcome::Replaced);
        assert_eq!(map.merge(entry("a", 5, "stale")), MergeOutcome::Ignored);

        let crdt = Crdt::Lww(map);
        assert_eq!(crdt.get("a").unwrap().timestamp, 11);
        assert_eq!(
            crdt.get("a").unwrap().data["marker"],
            serde_json::Value::String("new".into())
        );
    }

    #[test]
    fn lww_converges_regardless_of_delivery_order() {
        let e1 = entry("a", 10, "one");
        let e2 = entry("a", 20, "two");

        let mut first = LwwMap::default();
        first.merge(e1.clone());
        first.merge(e2.clone());

        let mut second = LwwMap::default();
        second.merge(e2);
        second.merge(e1);

        let a = Crdt::Lww(first);
        let b = Crdt::Lww(second);
        assert_eq!(a.get("a"), b.get("a"));
        assert_eq!(a.get("a").unwrap().timestamp, 20);
    }

    #[test]
    fn evict_only_touches_gsets() {
        let mut gset = Crdt::GSet(GSet::default());
        gset.merge(entry("a", 1, "x"));
        assert!(gset.evict("a"));
        assert!(gset.is_empty());

        let mut lww = Crdt::Lww(LwwMap::default());
        lww.merge(entry("a", 1, "x"));
        assert!(!lww.evict("a"));
        assert_eq!(lww.len(), 1);
    }
}
