//! Durable per-actor key-value storage.
//!
//! Each actor instance owns a namespace keyed by its instance name. A write
//! acknowledged by the backend survives restart; `put_all` is atomic for the
//! whole batch.

use async_trait::async_trait;
use dashmap::DashMap;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage backend error: {0}")]
    Backend(String),
    #[error("state serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        StorageError::Backend(err.to_string())
    }
}

#[async_trait]
pub trait Storage: Send + Sync {
    async fn get(&self, actor: &str, key: &str) -> Result<Option<Vec<u8>>, StorageError>;
    async fn put(&self, actor: &str, key: &str, value: Vec<u8>) -> Result<(), StorageError>;
    /// Atomic batch write: either every entry lands or none do.
    async fn put_all(
        &self,
        actor: &str,
        entries: Vec<(String, Vec<u8>)>,
    ) -> Result<(), StorageError>;
    async fn delete(&self, actor: &str, key: &str) -> Result<bool, StorageError>;
    async fn list_prefix(
        &self,
        actor: &str,
        prefix: &str,
    ) -> Result<Vec<(String, Vec<u8>)>, StorageError>;
}

/// In-process storage for tests and single-node development.
#[derive(Default)]
pub struct MemoryStorage {
    namespaces: DashMap<String, BTreeMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get(&self, actor: &str, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self
            .namespaces
            .get(actor)
            .and_then(|ns| ns.get(key).cloned()))
    }

    async fn put(&self, actor: &str, key: &str, value: Vec<u8>) -> Result<(), StorageError> {
        self.namespaces
            .entry(actor.to_string())
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn put_all(
        &self,
        actor: &str,
        entries: Vec<(String, Vec<u8>)>,
    ) -> Result<(), StorageError> {
        let mut ns = self.namespaces.entry(actor.to_string()).or_default();
        for (key, value) in entries {
            ns.insert(key, value);
        }
        Ok(())
    }

    async fn delete(&self, actor: &str, key: &str) -> Result<bool, StorageError> {
        Ok(self
            .namespaces
            .get_mut(actor)
            .map(|mut ns| ns.remove(key).is_some())
            .unwrap_or(false))
    }

    async fn list_prefix(
        &self,
        actor: &str,
        prefix: &str,
    ) -> Result<Vec<(String, Vec<u8>)>, StorageError> {
        Ok(self
            .namespaces
            .get(actor)
            .map(|ns| {
                ns.range(prefix.to_string()..)
                    .take_while(|(k, _)| k.starts_with(prefix))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }
}

/// SQLite-backed storage. One table holds every actor namespace; `put_all`
/// runs in a transaction so batches are atomic, and WAL mode keeps writers
/// from stalling readers.
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    pub async fn connect(path: &str) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS actor_state (
                actor TEXT NOT NULL,
                key TEXT NOT NULL,
                value BLOB NOT NULL,
                PRIMARY KEY (actor, key)
            )",
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn get(&self, actor: &str, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let row = sqlx::query("SELECT value FROM actor_state WHERE actor = ?1 AND key = ?2")
            .bind(actor)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<Vec<u8>, _>(0)))
    }

    async fn put(&self, actor: &str, key: &str, value: Vec<u8>) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO actor_state (actor, key, value) VALUES (?1, ?2, ?3)
             ON CONFLICT (actor, key) DO UPDATE SET value = excluded.value",
        )
        .bind(actor)
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn put_all(
        &self,
        actor: &str,
        entries: Vec<(String, Vec<u8>)>,
    ) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await?;
        for (key, value) in entries {
            sqlx::query(
                "INSERT INTO actor_state (actor, key, value) VALUES (?1, ?2, ?3)
                 ON CONFLICT (actor, key) DO UPDATE SET value = excluded.value",
            )
            .bind(actor)
            .bind(&key)
            .bind(value)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn delete(&self, actor: &str, key: &str) -> Result<bool, StorageError> {
        let result = sqlx::query("DELETE FROM actor_state WHERE actor = ?1 AND key = ?2")
            .bind(actor)
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_prefix(
        &self,
        actor: &str,
        prefix: &str,
    ) -> Result<Vec<(String, Vec<u8>)>, StorageError> {
        let rows = sqlx::query(
            "SELECT key, value FROM actor_state
             WHERE actor = ?1 AND substr(key, 1, length(?2)) = ?2
             ORDER BY key",
        )
        .bind(actor)
        .bind(prefix)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| (r.get::<String, _>(0), r.get::<Vec<u8>, _>(1)))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_round_trip() {
        let storage = MemoryStorage::new();
        storage
            .put("tenant:a:code", "state", b"blob".to_vec())
            .await
            .unwrap();
        assert_eq!(
            storage.get("tenant:a:code", "state").await.unwrap(),
            Some(b"blob".to_vec())
        );
        // Namespaces are isolated per instance name.
        assert_eq!(storage.get("tenant:b:code", "state").await.unwrap(), None);
        assert!(storage.delete("tenant:a:code", "state").await.unwrap());
        assert!(!storage.delete("tenant:a:code", "state").await.unwrap());
    }

    #[tokio::test]
    async fn memory_list_prefix() {
        let storage = MemoryStorage::new();
        storage.put("a", "state", b"1".to_vec()).await.unwrap();
        storage.put("a", "alarm", b"2".to_vec()).await.unwrap();
        storage.put("a", "state_v2", b"3".to_vec()).await.unwrap();

        let keys: Vec<String> = storage
            .list_prefix("a", "state")
            .await
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec!["state".to_string(), "state_v2".to_string()]);
    }

    #[tokio::test]
    async fn memory_put_all_is_visible_as_a_batch() {
        let storage = MemoryStorage::new();
        storage
            .put_all(
                "a",
                vec![
                    ("k1".to_string(), b"1".to_vec()),
                    ("k2".to_string(), b"2".to_vec()),
                ],
            )
            .await
            .unwrap();
        assert!(storage.get("a", "k1").await.unwrap().is_some());
        assert!(storage.get("a", "k2").await.unwrap().is_some());
    }
}
