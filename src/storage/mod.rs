/// Pluggable key-value persistence for custody state.
///
/// Everything the vault persists goes through one `KeyValueStore`,
/// namespaced by key prefix:
/// - `key/<id>`: sealed private keys (ciphertext only)
/// - `record/<id>`: key record metadata and audit trail
/// - `backup/<uuid>`: backup records
///
/// Two backends ship with the crate: `MemoryStore` for tests and
/// embedding, and `state::PostgresStore` for durable deployments.
pub mod memory;

use async_trait::async_trait;

use crate::error::Result;

pub use memory::MemoryStore;

pub const KEY_PREFIX: &str = "key/";
pub const RECORD_PREFIX: &str = "record/";
pub const BACKUP_PREFIX: &str = "backup/";

/// Trait for pluggable storage backends.
///
/// Values handed to a backend are already encrypted or contain metadata
/// only. Backends never see plaintext key material.
///
/// Implementations must report transient unavailability as
/// `CustodyError::StorageUnavailable` so callers can tell it apart from
/// deterministic failures.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Human-readable name of this backend (e.g., "memory", "postgres").
    fn name(&self) -> &str;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Insert or replace.
    async fn put(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Delete an entry. Returns Ok even if it doesn't exist.
    async fn delete(&self, key: &str) -> Result<()>;

    /// List keys with a given prefix, in ascending order.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
}
