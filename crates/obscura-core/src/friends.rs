//! Friend records and their repository.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use obscura_protocol::types::DeviceInfo;

use crate::error::CoreError;
use crate::storage::Storage;

pub const COL_FRIENDS: &str = "friends";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FriendStatus {
    PendingOutgoing,
    PendingIncoming,
    Accepted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Friend {
    pub username: String,
    /// Server user id of the device the friendship was negotiated with.
    pub server_user_id: String,
    pub status: FriendStatus,
    pub devices: Vec<DeviceInfo>,
    /// LWW guard for the device list.
    pub devices_updated_at: u64,
    /// TOFU: the first non-null value wins and is kept for revocation
    /// verification.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovery_public_key: Option<Vec<u8>>,
}

impl Friend {
    /// Server user ids of every known device, in deterministic order.
    pub fn device_user_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .devices
            .iter()
            .map(|d| d.server_user_id.clone())
            .collect();
        if ids.is_empty() {
            ids.push(self.server_user_id.clone());
        }
        ids.sort();
        ids.dedup();
        ids
    }
}

/// Friend persistence over the storage capability, keyed by username.
pub struct FriendRepo {
    storage: Arc<dyn Storage>,
}

impl FriendRepo {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    pub fn get(&self, username: &str) -> Result<Option<Friend>, CoreError> {
        match self.storage.get(COL_FRIENDS, username)? {
            Some(data) => Ok(Some(serde_json::from_slice(&data).map_err(|e| {
                CoreError::StorageIO(format!("corrupt friend record: {e}"))
            })?)),
            None => Ok(None),
        }
    }

    pub fn put(&self, friend: &Friend) -> Result<(), CoreError> {
        let data = serde_json::to_vec(friend)
            .map_err(|e| CoreError::StorageIO(format!("serialize friend record: {e}")))?;
        self.storage.put(COL_FRIENDS, &friend.username, &data)?;
        Ok(())
    }

    pub fn delete(&self, username: &str) -> Result<(), CoreError> {
        self.storage.delete(COL_FRIENDS, username)?;
        Ok(())
    }

    pub fn all(&self) -> Result<Vec<Friend>, CoreError> {
        let mut friends = Vec::new();
        for (_, data) in self.storage.list(COL_FRIENDS, "")? {
            friends.push(
                serde_json::from_slice(&data)
                    .map_err(|e| CoreError::StorageIO(format!("corrupt friend record: {e}")))?,
            );
        }
        Ok(friends)
    }

    pub fn accepted(&self) -> Result<Vec<Friend>, CoreError> {
        Ok(self
            .all()?
            .into_iter()
            .filter(|f| f.status == FriendStatus::Accepted)
            .collect())
    }

    /// Find the friend owning `server_user_id`: either the negotiated id
    /// or any known device id.
    pub fn find_by_server_user_id(
        &self,
        server_user_id: &str,
    ) -> Result<Option<Friend>, CoreError> {
        for friend in self.all()? {
            if friend.server_user_id == server_user_id
                || friend
                    .devices
                    .iter()
                    .any(|d| d.server_user_id == server_user_id)
            {
                return Ok(Some(friend));
            }
        }
        Ok(None)
    }

    pub fn set_status(&self, username: &str, status: FriendStatus) -> Result<(), CoreError> {
        if let Some(mut friend) = self.get(username)? {
            friend.status = status;
            self.put(&friend)?;
        }
        Ok(())
    }

    /// LWW-ingest a device list: applied only when strictly newer.
    pub fn ingest_devices(
        &self,
        username: &str,
        devices: Vec<DeviceInfo>,
        updated_at: u64,
    ) -> Result<bool, CoreError> {
        let Some(mut friend) = self.get(username)? else {
            return Ok(false);
        };
        if updated_at <= friend.devices_updated_at {
            return Ok(false);
        }
        friend.devices = devices;
        friend.devices_updated_at = updated_at;
        self.put(&friend)?;
        Ok(true)
    }

    /// TOFU the recovery key: the first non-null value is retained.
    pub fn set_recovery_key(&self, username: &str, key: &[u8]) -> Result<(), CoreError> {
        if let Some(mut friend) = self.get(username)? {
            if friend.recovery_public_key.is_none() {
                friend.recovery_public_key = Some(key.to_vec());
                self.put(&friend)?;
            }
        }
        Ok(())
    }

    /// Merge a friend list imported from another device: unknown friends
    /// are added, known friends take the newer device list.
    pub fn merge_import(&self, imported: Vec<Friend>) -> Result<(), CoreError> {
        for friend in imported {
            match self.get(&friend.username)? {
                None => self.put(&friend)?,
                Some(existing) => {
                    if friend.devices_updated_at > existing.devices_updated_at {
                        self.put(&friend)?;
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    fn repo() -> FriendRepo {
        FriendRepo::new(Arc::new(MemoryStorage::new()))
    }

    fn device(id: &str) -> DeviceInfo {
        DeviceInfo {
            server_user_id: id.to_string(),
            device_uuid: format!("uuid-{id}"),
            device_name: format!("dev-{id}"),
            identity_key: vec![0; 32],
        }
    }

    fn friend(username: &str, server_user_id: &str) -> Friend {
        Friend {
            username: username.to_string(),
            server_user_id: server_user_id.to_string(),
            status: FriendStatus::Accepted,
            devices: vec![device(server_user_id)],
            devices_updated_at: 100,
            recovery_public_key: None,
        }
    }

    #[test]
    fn crud_roundtrip() {
        let repo = repo();
        repo.put(&friend("bob", "srv-bob")).unwrap();

        let loaded = repo.get("bob").unwrap().unwrap();
        assert_eq!(loaded.server_user_id, "srv-bob");
        assert_eq!(repo.all().unwrap().len(), 1);

        repo.delete("bob").unwrap();
        assert!(repo.get("bob").unwrap().is_none());
    }

    #[test]
    fn device_list_is_lww() {
        let repo = repo();
        repo.put(&friend("bob", "srv-bob")).unwrap();

        // Older update is ignored.
        assert!(!repo.ingest_devices("bob", vec![device("old")], 50).unwrap());
        // Newer update applies.
        assert!(repo
            .ingest_devices("bob", vec![device("a"), device("b")], 200)
            .unwrap());

        let loaded = repo.get("bob").unwrap().unwrap();
        assert_eq!(loaded.devices.len(), 2);
        assert_eq!(loaded.devices_updated_at, 200);
    }

    #[test]
    fn recovery_key_is_tofu() {
        let repo = repo();
        repo.put(&friend("bob", "srv-bob")).unwrap();

        repo.set_recovery_key("bob", &[1u8; 32]).unwrap();
        repo.set_recovery_key("bob", &[2u8; 32]).unwrap();
        assert_eq!(
            repo.get("bob").unwrap().unwrap().recovery_public_key,
            Some(vec![1u8; 32])
        );
    }

    #[test]
    fn lookup_by_device_user_id() {
        let repo = repo();
        let mut f = friend("bob", "srv-bob");
        f.devices.push(device("srv-bob2"));
        repo.put(&f).unwrap();

        assert_eq!(
            repo.find_by_server_user_id("srv-bob2")
                .unwrap()
                .unwrap()
                .username,
            "bob"
        );
        assert!(repo.find_by_server_user_id("nobody").unwrap().is_none());
    }

    #[test]
    fn device_user_ids_are_sorted_and_deduped() {
        let mut f = friend("bob", "srv-b");
        f.devices = vec![device("srv-c"), device("srv-a"), device("srv-c")];
        assert_eq!(f.device_user_ids(), vec!["srv-a", "srv-c"]);
    }
}
