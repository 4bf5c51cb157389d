//! The durable key/value capability.
//!
//! Everything the core persists goes through [`Storage`]: a transactional
//! keyed store partitioned into named collections, namespaced per
//! core-username. The SQLite implementation keeps one `kv` table; tests
//! and scratch accounts use the in-memory implementation.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use rusqlite::Connection;

use crate::error::CoreError;

/// Transactional keyed store, partitioned into named collections.
pub trait Storage: Send + Sync {
    fn get(&self, collection: &str, key: &str) -> Result<Option<Vec<u8>>, CoreError>;

    fn put(&self, collection: &str, key: &str, value: &[u8]) -> Result<(), CoreError>;

    fn delete(&self, collection: &str, key: &str) -> Result<(), CoreError>;

    /// All entries in a collection whose key starts with `prefix`, in key
    /// order. An empty prefix lists the whole collection.
    fn list(&self, collection: &str, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, CoreError>;

    fn count(&self, collection: &str) -> Result<u64, CoreError>;

    /// Atomic read-modify-write of one key. Returning `None` deletes it.
    fn update(
        &self,
        collection: &str,
        key: &str,
        apply: &mut dyn FnMut(Option<Vec<u8>>) -> Option<Vec<u8>>,
    ) -> Result<(), CoreError>;

    /// Drop every entry in a collection.
    fn clear(&self, collection: &str) -> Result<(), CoreError>;
}

/// SQLite-backed storage: one `kv` table keyed by
/// (namespace, collection, key), WAL mode, one writer behind a mutex.
pub struct SqliteStorage {
    conn: Mutex<Connection>,
    namespace: String,
}

impl SqliteStorage {
    /// Open (or create) the database at `path`, namespaced per account.
    pub fn open(path: &str, namespace: &str) -> Result<Self, CoreError> {
        let conn = Connection::open(path)?;
        Self::configure(conn, namespace)
    }

    /// In-memory database, for tests and throwaway accounts.
    pub fn open_in_memory(namespace: &str) -> Result<Self, CoreError> {
        let conn = Connection::open_in_memory()?;
        Self::configure(conn, namespace)
    }

    fn configure(conn: Connection, namespace: &str) -> Result<Self, CoreError> {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             CREATE TABLE IF NOT EXISTS kv (
                 namespace  TEXT NOT NULL,
                 collection TEXT NOT NULL,
                 key        TEXT NOT NULL,
                 value      BLOB NOT NULL,
                 PRIMARY KEY (namespace, collection, key)
             );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
            namespace: namespace.to_string(),
        })
    }
}

impl Storage for SqliteStorage {
    fn get(&self, collection: &str, key: &str) -> Result<Option<Vec<u8>>, CoreError> {
        use rusqlite::OptionalExtension as _;
        let conn = self.conn.lock();
        let value = conn
            .query_row(
                "SELECT value FROM kv WHERE namespace=?1 AND collection=?2 AND key=?3",
                rusqlite::params![self.namespace, collection, key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn put(&self, collection: &str, key: &str, value: &[u8]) -> Result<(), CoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO kv (namespace, collection, key, value) VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![self.namespace, collection, key, value],
        )?;
        Ok(())
    }

    fn delete(&self, collection: &str, key: &str) -> Result<(), CoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM kv WHERE namespace=?1 AND collection=?2 AND key=?3",
            rusqlite::params![self.namespace, collection, key],
        )?;
        Ok(())
    }

    fn list(&self, collection: &str, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, CoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT key, value FROM kv WHERE namespace=?1 AND collection=?2 ORDER BY key",
        )?;
        let rows = stmt.query_map(rusqlite::params![self.namespace, collection], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (key, value) = row?;
            if key.starts_with(prefix) {
                out.push((key, value));
            }
        }
        Ok(out)
    }

    fn count(&self, collection: &str) -> Result<u64, CoreError> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM kv WHERE namespace=?1 AND collection=?2",
            rusqlite::params![self.namespace, collection],
            |row| row.get(0),
        )?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    fn update(
        &self,
        collection: &str,
        key: &str,
        apply: &mut dyn FnMut(Option<Vec<u8>>) -> Option<Vec<u8>>,
    ) -> Result<(), CoreError> {
        use rusqlite::OptionalExtension as _;
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let current: Option<Vec<u8>> = tx
            .query_row(
                "SELECT value FROM kv WHERE namespace=?1 AND collection=?2 AND key=?3",
                rusqlite::params![self.namespace, collection, key],
                |row| row.get(0),
            )
            .optional()?;
        match apply(current) {
            Some(next) => {
                tx.execute(
                    "INSERT OR REPLACE INTO kv (namespace, collection, key, value) \
                     VALUES (?1, ?2, ?3, ?4)",
                    rusqlite::params![self.namespace, collection, key, next],
                )?;
            }
            None => {
                tx.execute(
                    "DELETE FROM kv WHERE namespace=?1 AND collection=?2 AND key=?3",
                    rusqlite::params![self.namespace, collection, key],
                )?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn clear(&self, collection: &str) -> Result<(), CoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM kv WHERE namespace=?1 AND collection=?2",
            rusqlite::params![self.namespace, collection],
        )?;
        Ok(())
    }
}

/// In-memory storage with the same semantics as the SQLite backend.
#[derive(Default)]
pub struct MemoryStorage {
    collections: Mutex<BTreeMap<String, BTreeMap<String, Vec<u8>>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryStorage {
    fn get(&self, collection: &str, key: &str) -> Result<Option<Vec<u8>>, CoreError> {
        Ok(self
            .collections
            .lock()
            .get(collection)
            .and_then(|c| c.get(key))
            .cloned())
    }

    fn put(&self, collection: &str, key: &str, value: &[u8]) -> Result<(), CoreError> {
        self.collections
            .lock()
            .entry(collection.to_string())
            .or_default()
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, collection: &str, key: &str) -> Result<(), CoreError> {
        if let Some(c) = self.collections.lock().get_mut(collection) {
            c.remove(key);
        }
        Ok(())
    }

    fn list(&self, collection: &str, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, CoreError> {
        Ok(self
            .collections
            .lock()
            .get(collection)
            .map(|c| {
                c.iter()
                    .filter(|(k, _)| k.starts_with(prefix))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    fn count(&self, collection: &str) -> Result<u64, CoreError> {
        Ok(self
            .collections
            .lock()
            .get(collection)
            .map(|c| c.len() as u64)
            .unwrap_or_default())
    }

    fn update(
        &self,
        collection: &str,
        key: &str,
        apply: &mut dyn FnMut(Option<Vec<u8>>) -> Option<Vec<u8>>,
    ) -> Result<(), CoreError> {
        let mut collections = self.collections.lock();
        let entries = collections.entry(collection.to_string()).or_default();
        match apply(entries.get(key).cloned()) {
            Some(next) => {
                entries.insert(key.to_string(), next);
            }
            None => {
                entries.remove(key);
            }
        }
        Ok(())
    }

    fn clear(&self, collection: &str) -> Result<(), CoreError> {
        self.collections.lock().remove(collection);
        Ok(())
    }
}

/// Current UNIX timestamp in milliseconds.
pub fn timestamp_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise(storage: &dyn Storage) {
        assert!(storage.get("c", "k").unwrap().is_none());
        storage.put("c", "k", b"v1").unwrap();
        assert_eq!(storage.get("c", "k").unwrap(), Some(b"v1".to_vec()));

        storage.put("c", "k2", b"v2").unwrap();
        storage.put("other", "k", b"x").unwrap();
        assert_eq!(storage.count("c").unwrap(), 2);

        let all = storage.list("c", "").unwrap();
        assert_eq!(all.len(), 2);
        let filtered = storage.list("c", "k2").unwrap();
        assert_eq!(filtered, vec![("k2".to_string(), b"v2".to_vec())]);

        storage
            .update("c", "k", &mut |current| {
                assert_eq!(current, Some(b"v1".to_vec()));
                Some(b"v1+".to_vec())
            })
            .unwrap();
        assert_eq!(storage.get("c", "k").unwrap(), Some(b"v1+".to_vec()));

        storage.update("c", "k", &mut |_| None).unwrap();
        assert!(storage.get("c", "k").unwrap().is_none());

        storage.clear("c").unwrap();
        assert_eq!(storage.count("c").unwrap(), 0);
        assert_eq!(storage.get("other", "k").unwrap(), Some(b"x".to_vec()));
    }

    #[test]
    fn memory_storage_contract() {
        exercise(&MemoryStorage::new());
    }

    #[test]
    fn sqlite_storage_contract() {
        exercise(&SqliteStorage::open_in_memory("tester").unwrap());
    }

    #[test]
    fn sqlite_persists_across_reopen() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("core.db");
        let path = path.to_str().unwrap();

        {
            let storage = SqliteStorage::open(path, "alice").unwrap();
            storage.put("identity", "device", b"payload").unwrap();
        }
        {
            let storage = SqliteStorage::open(path, "alice").unwrap();
            assert_eq!(
                storage.get("identity", "device").unwrap(),
                Some(b"payload".to_vec())
            );
        }
    }

    #[test]
    fn namespaces_are_isolated() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("core.db");
        let path = path.to_str().unwrap();

        let alice = SqliteStorage::open(path, "alice").unwrap();
        alice.put("c", "k", b"a").unwrap();
        drop(alice);

        let bob = SqliteStorage::open(path, "bob").unwrap();
        assert!(bob.get("c", "k").unwrap().is_none());
    }
}
