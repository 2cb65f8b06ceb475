/// Backup store: point-in-time snapshots of a custody key.
///
/// A backup holds the sealed key exactly as it sat in the key store (no
/// re-encryption) and a copy of the key record taken at backup time. It
/// references the live key by id only, so it survives later changes to
/// the live record.
///
/// Restore checks structure first (ids, address, ciphertext present and
/// consistent), then a BLAKE3 checksum over sealed key + snapshot.
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crypto::hash;
use crate::crypto::keys::SealedKey;
use crate::error::{CustodyError, Result};
use crate::model::{KeyId, KeyRecord};
use crate::storage::{KeyValueStore, BACKUP_PREFIX};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupRecord {
    pub backup_id: Uuid,
    pub key_id: KeyId,
    pub encrypted_key_material: SealedKey,
    pub metadata_snapshot: KeyRecord,
    pub backup_timestamp: DateTime<Utc>,
    /// BLAKE3 over sealed key and snapshot (hex-encoded).
    pub checksum: String,
}

impl BackupRecord {
    pub fn new(
        sealed: SealedKey,
        snapshot: KeyRecord,
        backup_timestamp: DateTime<Utc>,
    ) -> Result<Self> {
        let checksum = hex::encode(compute_checksum(&sealed, &snapshot)?);
        Ok(Self {
            backup_id: Uuid::now_v7(),
            key_id: snapshot.id.clone(),
            encrypted_key_material: sealed,
            metadata_snapshot: snapshot,
            backup_timestamp,
            checksum,
        })
    }

    pub fn verify_integrity(&self) -> Result<()> {
        let fail = |msg: String| Err(CustodyError::IntegrityCheckFailed(msg));

        if self.key_id.as_str().is_empty() {
            return fail(format!("backup {} has no key id", self.backup_id));
        }
        if self.metadata_snapshot.address.is_empty() {
            return fail(format!("backup {} has no address", self.backup_id));
        }
        if self.metadata_snapshot.id != self.key_id {
            return fail(format!(
                "backup {} snapshot id {} does not match key id {}",
                self.backup_id, self.metadata_snapshot.id, self.key_id
            ));
        }
        let sealed = &self.encrypted_key_material;
        if sealed.nonce.is_empty() || sealed.ciphertext.is_empty() {
            return fail(format!("backup {} has no ciphertext", self.backup_id));
        }

        let expected = hex::encode(compute_checksum(sealed, &self.metadata_snapshot)?);
        if expected != self.checksum {
            return fail(format!("backup {} checksum mismatch", self.backup_id));
        }
        Ok(())
    }
}

fn compute_checksum(sealed: &SealedKey, snapshot: &KeyRecord) -> Result<[u8; 32]> {
    let metadata = serde_json::to_vec(snapshot)?;
    Ok(hash::backup_checksum(&sealed.to_bytes()?, &metadata))
}

#[derive(Clone)]
pub struct BackupStore {
    store: Arc<dyn KeyValueStore>,
}

impl BackupStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    pub async fn save(&self, record: &BackupRecord) -> Result<()> {
        let bytes = serde_json::to_vec(record)?;
        self.store.put(&storage_key(record.backup_id), &bytes).await
    }

    /// Load a backup. A record that no longer parses fails the integrity
    /// check rather than surfacing as a serialization error.
    pub async fn load(&self, backup_id: Uuid) -> Result<BackupRecord> {
        let bytes = self
            .store
            .get(&storage_key(backup_id))
            .await?
            .ok_or(CustodyError::BackupNotFound(backup_id))?;
        serde_json::from_slice(&bytes).map_err(|e| {
            CustodyError::IntegrityCheckFailed(format!("backup {backup_id} is malformed: {e}"))
        })
    }

    pub async fn remove(&self, backup_id: Uuid) -> Result<()> {
        self.store.delete(&storage_key(backup_id)).await
    }

    /// Ids of every stored backup, oldest first (v7 ids sort by time).
    pub async fn list_ids(&self) -> Result<Vec<Uuid>> {
        let keys = self.store.list(BACKUP_PREFIX).await?;
        Ok(keys
            .iter()
            .filter_map(|k| k.strip_prefix(BACKUP_PREFIX))
            .filter_map(|id| Uuid::parse_str(id).ok())
            .collect())
    }

    /// All backups taken from `key_id`, oldest first. Unreadable backups
    /// are skipped.
    pub async fn list_for(&self, key_id: &KeyId) -> Result<Vec<BackupRecord>> {
        let mut out = Vec::new();
        for id in self.list_ids().await? {
            match self.load(id).await {
                Ok(record) if record.key_id == *key_id => out.push(record),
                Ok(_) => {}
                Err(CustodyError::IntegrityCheckFailed(msg)) => {
                    tracing::warn!(backup_id = %id, error = %msg, "Skipping unreadable backup");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }
}

fn storage_key(backup_id: Uuid) -> String {
    format!("{BACKUP_PREFIX}{backup_id}")
}
