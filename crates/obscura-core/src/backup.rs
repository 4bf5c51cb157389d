//! The encrypted account backup format.
//!
//! Layout: `"OBSCURA_BACKUP"` (14 bytes ASCII) || version (u8) || ECIES
//! payload (`ephemeral_pub(32) || nonce(12) || ciphertext+tag`). The
//! payload decrypts, under the recovery phrase, to a versioned JSON
//! snapshot of the account. Export never needs the phrase: it encrypts
//! to the stored recovery public key.

use chrono::{TimeZone as _, Utc};
use serde::{Deserialize, Serialize};

use obscura_crypto::recovery::{ecies_seal, RecoveryKeyPair};
use obscura_crypto::CryptoError;
use obscura_protocol::types::DeviceInfo;

use crate::device_graph::DeviceGraph;
use crate::error::CoreError;
use crate::friends::{Friend, FriendRepo};
use crate::keystore::{DeviceIdentity, IdentityRecord, KeyStore};
use crate::messages::{MessageRepo, StoredMessage};
use crate::storage::timestamp_now;

pub const BACKUP_MAGIC: &[u8; 14] = b"OBSCURA_BACKUP";
pub const BACKUP_VERSION: u8 = 0x01;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedPreKeyBackup {
    pub key_id: u32,
    pub secret: Vec<u8>,
}

/// Everything a replacement device needs, as carried inside the backup.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupSnapshot {
    pub version: u32,
    pub exported_at: u64,
    pub username: String,
    pub device_identity: DeviceIdentity,
    /// The at-rest record as stored: sealed under the old password, or
    /// the raw keypair when the account had none.
    pub ratchet_identity: IdentityRecord,
    pub signed_prekey: Option<SignedPreKeyBackup>,
    pub own_devices: Vec<DeviceInfo>,
    pub friends: Vec<Friend>,
    pub messages: Vec<StoredMessage>,
    pub settings: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug)]
pub struct BackupFile {
    pub bytes: Vec<u8>,
    pub file_name: String,
}

/// Export the account to an encrypted backup file.
pub fn export_backup(
    keystore: &KeyStore,
    graph: &DeviceGraph,
    friends: &FriendRepo,
    messages: &MessageRepo,
    settings: serde_json::Map<String, serde_json::Value>,
) -> Result<BackupFile, CoreError> {
    use obscura_crypto::ratchet::store::PreKeyStore as _;

    let device = keystore.device_identity()?.ok_or(CoreError::NotInitialized)?;
    let ratchet_identity = keystore.identity_record()?.ok_or(CoreError::NotInitialized)?;

    let signed_prekey = match keystore.latest_signed_prekey_id()? {
        Some(key_id) => keystore
            .load_signed_prekey(key_id)?
            .map(|secret| SignedPreKeyBackup { key_id, secret }),
        None => None,
    };

    let exported_at = timestamp_now();
    let snapshot = BackupSnapshot {
        version: 1,
        exported_at,
        username: device.core_username.clone(),
        device_identity: device.clone(),
        ratchet_identity,
        signed_prekey,
        own_devices: graph.own_devices()?,
        friends: friends.all()?,
        messages: messages.all()?,
        settings,
    };

    let json = serde_json::to_vec(&snapshot)
        .map_err(|e| CoreError::StorageIO(format!("serialize snapshot: {e}")))?;
    let sealed = ecies_seal(&device.recovery_public_key, &json)?;

    let mut bytes = Vec::with_capacity(BACKUP_MAGIC.len() + 1 + sealed.len());
    bytes.extend_from_slice(BACKUP_MAGIC);
    bytes.push(BACKUP_VERSION);
    bytes.extend_from_slice(&sealed);

    let date = Utc
        .timestamp_millis_opt(i64::try_from(exported_at).unwrap_or_default())
        .single()
        .map_or_else(
            || "1970-01-01".to_string(),
            |d| d.format("%Y-%m-%d").to_string(),
        );
    Ok(BackupFile {
        bytes,
        file_name: format!("obscura-backup-{}-{date}.obscura", device.core_username),
    })
}

/// Verify framing and decrypt a backup with the 12-word phrase.
///
/// The derived recovery private key is dropped before this returns.
pub fn decode_backup(bytes: &[u8], phrase: &str) -> Result<BackupSnapshot, CoreError> {
    if bytes.len() < BACKUP_MAGIC.len() + 1 || &bytes[..BACKUP_MAGIC.len()] != BACKUP_MAGIC {
        return Err(CoreError::BackupDecrypt("not a backup file".into()));
    }
    let version = bytes[BACKUP_MAGIC.len()];
    if version != BACKUP_VERSION {
        return Err(CoreError::UnsupportedBackupVersion(version));
    }

    let keypair = RecoveryKeyPair::from_phrase(phrase)?;
    let payload = keypair
        .ecies_open(&bytes[BACKUP_MAGIC.len() + 1..])
        .map_err(|e| match e {
            CryptoError::DecryptAuth(_) => {
                CoreError::BackupDecrypt("wrong recovery phrase or corrupt file".into())
            }
            other => CoreError::Crypto(other),
        })?;

    serde_json::from_slice(&payload)
        .map_err(|e| CoreError::BackupDecrypt(format!("snapshot parse: {e}")))
}

/// Apply a decoded snapshot to local state.
///
/// When the snapshot carries a raw keypair and the new account has a
/// password, the identity is re-sealed under it.
pub fn apply_backup(
    snapshot: &BackupSnapshot,
    keystore: &KeyStore,
    graph: &DeviceGraph,
    friends: &FriendRepo,
    messages: &MessageRepo,
    new_password: Option<&str>,
) -> Result<(), CoreError> {
    use obscura_crypto::ratchet::store::PreKeyStore as _;

    keystore.restore_identity_record(&snapshot.ratchet_identity, new_password)?;
    keystore.set_device_identity(&snapshot.device_identity)?;
    if let Some(spk) = &snapshot.signed_prekey {
        keystore.store_signed_prekey(spk.key_id, &spk.secret)?;
    }
    graph.set_own_devices(&snapshot.own_devices)?;
    friends.merge_import(snapshot.friends.clone())?;
    for message in &snapshot.messages {
        messages.append_if_new(message)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::messages::{Direction, MessageBody};
    use crate::storage::{MemoryStorage, Storage};
    use obscura_crypto::RatchetIdentity;

    struct Fixture {
        keystore: Arc<KeyStore>,
        graph: Arc<DeviceGraph>,
        friends: Arc<FriendRepo>,
        messages: Arc<MessageRepo>,
        phrase: String,
    }

    fn fixture(username: &str, password: Option<&str>) -> Fixture {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let keystore = Arc::new(KeyStore::new(storage.clone()));
        let identity = RatchetIdentity::generate();
        keystore.initialize(&identity, password).unwrap();

        let (recovery, phrase) = RecoveryKeyPair::generate();
        keystore
            .set_device_identity(&DeviceIdentity {
                core_username: username.to_string(),
                server_user_id: format!("srv-{username}"),
                device_uuid: format!("uuid-{username}"),
                device_username: format!("{username}_abcd1234"),
                p2p_public_key: vec![1; 32],
                p2p_secret_key: vec![2; 32],
                recovery_public_key: recovery.public_key_bytes().to_vec(),
                is_first_device: true,
            })
            .unwrap();

        let friends = Arc::new(FriendRepo::new(storage.clone()));
        let graph = Arc::new(DeviceGraph::new(storage, friends.clone()));
        let messages = Arc::new(MessageRepo::new(Arc::new(MemoryStorage::new())));
        Fixture {
            keystore,
            graph,
            friends,
            messages,
            phrase,
        }
    }

    #[test]
    fn roundtrip_preserves_username_and_state() {
        let fx = fixture("dana", None);
        fx.messages
            .append(&StoredMessage {
                id: "m1".into(),
                conversation_id: "erin".into(),
                direction: Direction::Outbound,
                timestamp: 42,
                body: MessageBody::Text("hi erin".into()),
            })
            .unwrap();

        let backup = export_backup(
            &fx.keystore,
            &fx.graph,
            &fx.friends,
            &fx.messages,
            serde_json::Map::new(),
        )
        .unwrap();
        assert!(backup.file_name.starts_with("obscura-backup-dana-"));
        assert!(backup.file_name.ends_with(".obscura"));
        assert_eq!(&backup.bytes[..14], BACKUP_MAGIC);
        assert_eq!(backup.bytes[14], BACKUP_VERSION);

        let snapshot = decode_backup(&backup.bytes, &fx.phrase).unwrap();
        assert_eq!(snapshot.username, "dana");
        assert_eq!(snapshot.messages.len(), 1);

        // Restore into a fresh account.
        let restored = fixture("dana", None);
        apply_backup(
            &snapshot,
            &restored.keystore,
            &restored.graph,
            &restored.friends,
            &restored.messages,
            None,
        )
        .unwrap();
        restored.keystore.logout();
        restored.keystore.open(None).unwrap();
        assert_eq!(
            restored.keystore.identity().unwrap().public_key_bytes(),
            fx.keystore.identity().unwrap().public_key_bytes()
        );
        assert_eq!(restored.messages.conversation("erin").unwrap().len(), 1);
    }

    #[test]
    fn wrong_phrase_fails_decrypt() {
        let fx = fixture("dana", None);
        let backup = export_backup(
            &fx.keystore,
            &fx.graph,
            &fx.friends,
            &fx.messages,
            serde_json::Map::new(),
        )
        .unwrap();

        let (_, other_phrase) = RecoveryKeyPair::generate();
        let err = decode_backup(&backup.bytes, &other_phrase).unwrap_err();
        assert!(matches!(err, CoreError::BackupDecrypt(_)));
    }

    #[test]
    fn unknown_version_is_rejected() {
        let fx = fixture("dana", None);
        let mut backup = export_backup(
            &fx.keystore,
            &fx.graph,
            &fx.friends,
            &fx.messages,
            serde_json::Map::new(),
        )
        .unwrap();
        backup.bytes[14] = 0x7f;

        let err = decode_backup(&backup.bytes, &fx.phrase).unwrap_err();
        assert!(matches!(err, CoreError::UnsupportedBackupVersion(0x7f)));
    }

    #[test]
    fn bad_magic_is_rejected() {
        let err = decode_backup(b"NOT_A_BACKUP_AT_ALL", "whatever").unwrap_err();
        assert!(matches!(err, CoreError::BackupDecrypt(_)));
    }

    #[test]
    fn raw_identity_is_resealed_under_new_password() {
        let fx = fixture("dana", None);
        let backup = export_backup(
            &fx.keystore,
            &fx.graph,
            &fx.friends,
            &fx.messages,
            serde_json::Map::new(),
        )
        .unwrap();
        let snapshot = decode_backup(&backup.bytes, &fx.phrase).unwrap();

        let restored = fixture("dana", None);
        apply_backup(
            &snapshot,
            &restored.keystore,
            &restored.graph,
            &restored.friends,
            &restored.messages,
            Some("new-password"),
        )
        .unwrap();

        restored.keystore.logout();
        assert!(matches!(
            restored.keystore.open(None),
            Err(CoreError::Auth(_))
        ));
        restored.keystore.open(Some("new-password")).unwrap();
    }
}
