/// Encrypted key store.
///
/// The only component that touches plaintext private keys, and only for
/// the duration of a call. What it persists is a `SealedKey` under
/// `key/<id>`; the master key is passed in by the registry on every call
/// and never stored here.
use std::sync::Arc;

use tracing::error;

use crate::crypto::keys::{self, Keypair, SealedKey};
use crate::crypto::sensitive::{PrivateKey, SensitiveBytes32};
use crate::error::{CustodyError, Result};
use crate::model::KeyId;
use crate::storage::{KeyValueStore, KEY_PREFIX};

#[derive(Clone)]
pub struct EncryptedKeyStore {
    store: Arc<dyn KeyValueStore>,
}

impl EncryptedKeyStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Fresh keypair from the OS CSPRNG.
    pub fn generate_keypair(&self) -> Keypair {
        keys::generate_keypair()
    }

    /// Seal `private_key` under `master_key` and persist it.
    pub async fn encrypt_and_store(
        &self,
        id: &KeyId,
        private_key: &PrivateKey,
        master_key: &SensitiveBytes32,
    ) -> Result<()> {
        let sealed = SealedKey::seal(master_key, id, private_key)?;
        self.store_sealed(id, &sealed).await
    }

    /// Load and open the sealed key for `id`.
    pub async fn decrypt(&self, id: &KeyId, master_key: &SensitiveBytes32) -> Result<PrivateKey> {
        let sealed = self.load_sealed(id).await?;
        sealed.open(master_key, id).map_err(|e| {
            error!(key_id = %id, error = %e, "Sealed key failed to open");
            e
        })
    }

    /// Raw sealed form, for backups. No decryption happens.
    pub async fn load_sealed(&self, id: &KeyId) -> Result<SealedKey> {
        let bytes = self
            .store
            .get(&storage_key(id))
            .await?
            .ok_or_else(|| CustodyError::KeyNotFound(id.clone()))?;
        SealedKey::from_bytes(&bytes).map_err(|e| CustodyError::Decryption {
            key_id: id.clone(),
            reason: format!("unreadable sealed key: {e}"),
        })
    }

    /// Persist an already sealed key, as on restore.
    pub async fn store_sealed(&self, id: &KeyId, sealed: &SealedKey) -> Result<()> {
        self.store.put(&storage_key(id), &sealed.to_bytes()?).await
    }

    /// Remove a sealed key. Used to roll back a creation that failed
    /// before its record was registered.
    pub async fn remove(&self, id: &KeyId) -> Result<()> {
        self.store.delete(&storage_key(id)).await
    }
}

fn storage_key(id: &KeyId) -> String {
    format!("{KEY_PREFIX}{id}")
}
