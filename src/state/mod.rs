/// Durable PostgreSQL state for custody-vault.
///
/// Provides `PostgresStore`, the production `KeyValueStore`. Sealed keys,
/// key records and backup records all live in the single `custody_kv`
/// table, namespaced by key prefix.
pub mod repository;

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use crate::error::{CustodyError, Result};
use crate::storage::KeyValueStore;

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect to PostgreSQL.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(repository::db_err)?;

        Ok(Self { pool })
    }

    /// Run pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| CustodyError::Storage(format!("Migration failed: {e}")))
    }
}

#[async_trait]
impl KeyValueStore for PostgresStore {
    fn name(&self) -> &str {
        "postgres"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        repository::get_value(&self.pool, key).await
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        repository::upsert_value(&self.pool, key, value).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        repository::delete_value(&self.pool, key).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        repository::list_keys(&self.pool, prefix).await
    }
}
