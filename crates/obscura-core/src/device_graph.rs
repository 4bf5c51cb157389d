//! The device graph: our other devices, friends' device lists, link
//! approval, and announce/revocation handling.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::json;

use obscura_crypto::recovery::{verify_recovery_signature, RecoveryKeyPair};
use obscura_protocol::link_code::{parse_link_code, LinkCode};
use obscura_protocol::message::DeviceAnnounceMessage;
use obscura_protocol::types::DeviceInfo;
use obscura_protocol::ProtocolError;

use crate::error::CoreError;
use crate::friends::FriendRepo;
use crate::storage::Storage;

pub const COL_OWN_DEVICES: &str = "own_devices";
pub const COL_OWN_DEVICES_META: &str = "own_devices_meta";

const META_UPDATED_AT: &str = "updated_at";

/// Result of applying a friend's device announce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceOutcome {
    Applied { revocation: bool },
    Ignored,
}

/// Result of applying an announce from our own account.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnAnnounceOutcome {
    Updated,
    /// This device is no longer in the account device list; the caller
    /// must wipe local state.
    SelfRevoked,
    Ignored,
}

pub struct DeviceGraph {
    storage: Arc<dyn Storage>,
    friends: Arc<FriendRepo>,
    /// One-shot link challenges already consumed by this process.
    used_challenges: Mutex<HashSet<Vec<u8>>>,
}

impl DeviceGraph {
    pub fn new(storage: Arc<dyn Storage>, friends: Arc<FriendRepo>) -> Self {
        Self {
            storage,
            friends,
            used_challenges: Mutex::new(HashSet::new()),
        }
    }

    // ── Own devices ─────────────────────────────────────────────────

    /// Our other devices, sorted by server user id.
    pub fn own_devices(&self) -> Result<Vec<DeviceInfo>, CoreError> {
        let mut devices = Vec::new();
        for (_, data) in self.storage.list(COL_OWN_DEVICES, "")? {
            devices.push(
                serde_json::from_slice(&data)
                    .map_err(|e| CoreError::StorageIO(format!("corrupt own device: {e}")))?,
            );
        }
        Ok(devices)
    }

    pub fn own_device_user_ids(&self) -> Result<Vec<String>, CoreError> {
        Ok(self
            .own_devices()?
            .into_iter()
            .map(|d| d.server_user_id)
            .collect())
    }

    pub fn add_own_device(&self, device: &DeviceInfo) -> Result<(), CoreError> {
        let data = serde_json::to_vec(device)
            .map_err(|e| CoreError::StorageIO(format!("serialize own device: {e}")))?;
        self.storage
            .put(COL_OWN_DEVICES, &device.server_user_id, &data)?;
        Ok(())
    }

    pub fn set_own_devices(&self, devices: &[DeviceInfo]) -> Result<(), CoreError> {
        self.storage.clear(COL_OWN_DEVICES)?;
        for device in devices {
            self.add_own_device(device)?;
        }
        Ok(())
    }

    pub fn clear_own_devices(&self) -> Result<(), CoreError> {
        self.storage.clear(COL_OWN_DEVICES)
    }

    // ── Link approval ───────────────────────────────────────────────

    /// Parse and verify a link code, consuming its challenge.
    ///
    /// Expired codes, bad signatures, and replayed challenges are all
    /// rejected; a rejected code does not consume the challenge.
    pub fn approve_link(&self, code: &str, now_ms: u64) -> Result<LinkCode, CoreError> {
        let parsed = parse_link_code(code)?;
        parsed.verify(now_ms)?;

        let mut used = self.used_challenges.lock();
        if !used.insert(parsed.challenge.clone()) {
            return Err(CoreError::Protocol(ProtocolError::LinkReplayed));
        }
        Ok(parsed)
    }

    // ── Friend announces ────────────────────────────────────────────

    /// Apply a DEVICE_ANNOUNCE from a friend.
    ///
    /// Non-revocations are LWW on the announce timestamp. Revocations must
    /// additionally verify against the friend's stored recovery key; with
    /// no stored key the announce is accepted for backwards compatibility.
    pub fn apply_announce(
        &self,
        username: &str,
        announce: &DeviceAnnounceMessage,
    ) -> Result<AnnounceOutcome, CoreError> {
        let Some(friend) = self.friends.get(username)? else {
            return Err(CoreError::UnknownFriend(username.to_string()));
        };

        if announce.is_revocation {
            match friend.recovery_public_key.as_deref() {
                Some(recovery_key) => {
                    let payload = revocation_signing_bytes(&announce.devices, announce.timestamp);
                    if verify_recovery_signature(recovery_key, &payload, &announce.signature)
                        .is_err()
                    {
                        tracing::warn!(
                            friend = %username,
                            "revocation announce signature invalid, not applied"
                        );
                        return Ok(AnnounceOutcome::Ignored);
                    }
                }
                None => {
                    tracing::warn!(
                        friend = %username,
                        "revocation announce accepted without a stored recovery key"
                    );
                }
            }
        }

        if self
            .friends
            .ingest_devices(username, announce.devices.clone(), announce.timestamp)?
        {
            Ok(AnnounceOutcome::Applied {
                revocation: announce.is_revocation,
            })
        } else {
            Ok(AnnounceOutcome::Ignored)
        }
    }

    // ── Own-account announces ───────────────────────────────────────

    /// Apply an announce sent by another of our own devices.
    ///
    /// A revocation listing every device but us means this install has
    /// been revoked; the caller wipes local state on `SelfRevoked`.
    pub fn apply_own_announce(
        &self,
        announce: &DeviceAnnounceMessage,
        self_device_uuid: &str,
        recovery_public_key: &[u8],
    ) -> Result<OwnAnnounceOutcome, CoreError> {
        if announce.is_revocation {
            let payload = revocation_signing_bytes(&announce.devices, announce.timestamp);
            if verify_recovery_signature(recovery_public_key, &payload, &announce.signature)
                .is_err()
            {
                tracing::warn!("own-account revocation signature invalid, not applied");
                return Ok(OwnAnnounceOutcome::Ignored);
            }
            if !announce
                .devices
                .iter()
                .any(|d| d.device_uuid == self_device_uuid)
            {
                return Ok(OwnAnnounceOutcome::SelfRevoked);
            }
        } else if self.own_updated_at()? >= announce.timestamp {
            return Ok(OwnAnnounceOutcome::Ignored);
        }

        let others: Vec<DeviceInfo> = announce
            .devices
            .iter()
            .filter(|d| d.device_uuid != self_device_uuid)
            .cloned()
            .collect();
        self.set_own_devices(&others)?;
        self.storage.put(
            COL_OWN_DEVICES_META,
            META_UPDATED_AT,
            &announce.timestamp.to_le_bytes(),
        )?;
        Ok(OwnAnnounceOutcome::Updated)
    }

    fn own_updated_at(&self) -> Result<u64, CoreError> {
        match self.storage.get(COL_OWN_DEVICES_META, META_UPDATED_AT)? {
            Some(data) => {
                let bytes: [u8; 8] = data
                    .as_slice()
                    .try_into()
                    .map_err(|_| CoreError::StorageIO("corrupt own-devices meta".into()))?;
                Ok(u64::from_le_bytes(bytes))
            }
            None => Ok(0),
        }
    }
}

/// Build a signed revocation announce from the recovery phrase.
///
/// The derived private key lives only for the duration of this call.
pub fn build_revocation(
    phrase: &str,
    expected_recovery_key: &[u8],
    devices: Vec<DeviceInfo>,
    timestamp: u64,
) -> Result<DeviceAnnounceMessage, CoreError> {
    let keypair = RecoveryKeyPair::from_phrase(phrase)?;
    if keypair.public_key_bytes() != expected_recovery_key {
        return Err(CoreError::Auth(
            "recovery phrase does not match the stored recovery key".into(),
        ));
    }
    let signature = keypair.sign(&revocation_signing_bytes(&devices, timestamp));
    Ok(DeviceAnnounceMessage {
        devices,
        timestamp,
        is_revocation: true,
        signature: signature.to_vec(),
        recovery_public_key: None,
    })
}

/// Canonical signing input for a device announce. serde_json maps are
/// sorted, so the key order is stable across implementations.
pub fn announce_signing_bytes(
    devices: &[DeviceInfo],
    timestamp: u64,
    is_revocation: bool,
) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "devices": devices,
        "isRevocation": is_revocation,
        "timestamp": timestamp,
    }))
    .unwrap_or_default()
}

/// Revocations always sign the `is_revocation: true` form.
pub fn revocation_signing_bytes(devices: &[DeviceInfo], timestamp: u64) -> Vec<u8> {
    announce_signing_bytes(devices, timestamp, true)
}
