use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::PgPool;
use tokio::sync::RwLock;

use crate::err::Error;

/// Narrow persistence port. Records are JSON strings in flat namespaces
/// (`user:<email>`, `otp:<mobile>`, `session:<token>`, `request:<id>`),
/// so the workflow logic stays storage-agnostic.
///
/// `put_if_absent` and `compare_and_swap` are the per-key atomicity
/// primitives: unique-id allocation and terminal state transitions go
/// through them instead of plain `set`.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, Error>;

    async fn set(&self, key: &str, value: String) -> Result<(), Error>;

    /// Inserts only when the key is vacant. Returns whether the insert won.
    async fn put_if_absent(&self, key: &str, value: String) -> Result<bool, Error>;

    /// Replaces the value only if the current value equals `expected`.
    /// Returns false when the key is missing or the value has moved on.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: &str,
        value: String,
    ) -> Result<bool, Error>;

    async fn delete(&self, key: &str) -> Result<(), Error>;

    async fn get_by_prefix(&self, prefix: &str) -> Result<Vec<String>, Error>;
}

/// In-memory store for development and tests.
pub struct MemoryStore {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, Error> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: String) -> Result<(), Error> {
        self.entries.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn put_if_absent(&self, key: &str, value: String) -> Result<bool, Error> {
        let mut entries = self.entries.write().await;
        if entries.contains_key(key) {
            return Ok(false);
        }
        entries.insert(key.to_string(), value);
        Ok(true)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: &str,
        value: String,
    ) -> Result<bool, Error> {
        let mut entries = self.entries.write().await;
        match entries.get(key) {
            Some(current) if current == expected => {
                entries.insert(key.to_string(), value);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), Error> {
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn get_by_prefix(&self, prefix: &str) -> Result<Vec<String>, Error> {
        let entries = self.entries.read().await;
        Ok(entries
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(_, value)| value.clone())
            .collect())
    }
}

/// Postgres-backed store: a single `kv_store` table, conflict clauses for
/// the atomic primitives.
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), Error> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS kv_store (key TEXT PRIMARY KEY, value TEXT NOT NULL)",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl KvStore for PgStore {
    async fn get(&self, key: &str) -> Result<Option<String>, Error> {
        let value = sqlx::query_scalar::<_, String>("SELECT value FROM kv_store WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: String) -> Result<(), Error> {
        sqlx::query(
            "INSERT INTO kv_store (key, value) VALUES ($1, $2) \
             ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value",
        )
        .bind(key)
        .bind(&value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn put_if_absent(&self, key: &str, value: String) -> Result<bool, Error> {
        let res = sqlx::query(
            "INSERT INTO kv_store (key, value) VALUES ($1, $2) ON CONFLICT (key) DO NOTHING",
        )
        .bind(key)
        .bind(&value)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() == 1)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: &str,
        value: String,
    ) -> Result<bool, Error> {
        let res = sqlx::query("UPDATE kv_store SET value = $3 WHERE key = $1 AND value = $2")
            .bind(key)
            .bind(expected)
            .bind(&value)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() == 1)
    }

    async fn delete(&self, key: &str) -> Result<(), Error> {
        sqlx::query("DELETE FROM kv_store WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_by_prefix(&self, prefix: &str) -> Result<Vec<String>, Error> {
        let values =
            sqlx::query_scalar::<_, String>("SELECT value FROM kv_store WHERE key LIKE $1")
                .bind(format!("{}%", prefix))
                .fetch_all(&self.pool)
                .await?;
        Ok(values)
    }
}
