/// Typed queries against the `custody_kv` table.
///
/// All queries use sqlx runtime-checked queries (not compile-time checked)
/// to avoid requiring a live database during development builds.
use chrono::Utc;
use sqlx::PgPool;

use crate::error::{CustodyError, Result};

/// Pool exhaustion and connection loss are transient; everything else
/// (constraint violations, bad SQL, decode errors) is not.
pub(crate) fn db_err(e: sqlx::Error) -> CustodyError {
    match e {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            CustodyError::StorageUnavailable(e.to_string())
        }
        other => CustodyError::Storage(other.to_string()),
    }
}

pub async fn get_value(pool: &PgPool, key: &str) -> Result<Option<Vec<u8>>> {
    sqlx::query_scalar::<_, Vec<u8>>("SELECT value FROM custody_kv WHERE key = $1")
        .bind(key)
        .fetch_optional(pool)
        .await
        .map_err(db_err)
}

pub async fn upsert_value(pool: &PgPool, key: &str, value: &[u8]) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO custody_kv (key, value, updated_at)
        VALUES ($1, $2, $3)
        ON CONFLICT (key)
        DO UPDATE SET value = $2, updated_at = $3
        "#,
    )
    .bind(key)
    .bind(value)
    .bind(Utc::now())
    .execute(pool)
    .await
    .map_err(db_err)?;

    Ok(())
}

pub async fn delete_value(pool: &PgPool, key: &str) -> Result<()> {
    sqlx::query("DELETE FROM custody_kv WHERE key = $1")
        .bind(key)
        .execute(pool)
        .await
        .map_err(db_err)?;

    Ok(())
}

pub async fn list_keys(pool: &PgPool, prefix: &str) -> Result<Vec<String>> {
    sqlx::query_scalar::<_, String>(
        "SELECT key FROM custody_kv WHERE starts_with(key, $1) ORDER BY key",
    )
    .bind(prefix)
    .fetch_all(pool)
    .await
    .map_err(db_err)
}
