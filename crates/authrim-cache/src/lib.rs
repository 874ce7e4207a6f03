//! Best-effort KV cache for client metadata and shard-config snapshots.
//!
//! Two levels: an in-process map and an optional Redis tier. Cache misses
//! and Redis outages are both just misses; callers always fall back to
//! the source of truth. Writes invalidate before they update so a racing
//! reader cannot resurrect a stale value from L1.

use async_trait::async_trait;
use dashmap::DashMap;
use redis::AsyncCommands;
use serde::{de::DeserializeOwned, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, error};

#[async_trait]
pub trait Cache: Send + Sync {
    async fn get_raw(&self, key: &str) -> Option<String>;
    async fn set_raw(&self, key: &str, value: String, ttl: Duration) -> anyhow::Result<()>;
    async fn delete(&self, key: &str) -> anyhow::Result<()>;
}

/// Typed convenience over the string-valued contract.
pub async fn get_json<T: DeserializeOwned>(cache: &dyn Cache, key: &str) -> Option<T> {
    let raw = cache.get_raw(key).await?;
    serde_json::from_str(&raw).ok()
}

pub async fn set_json<T: Serialize>(
    cache: &dyn Cache,
    key: &str,
    value: &T,
    ttl: Duration,
) -> anyhow::Result<()> {
    cache.set_raw(key, serde_json::to_string(value)?, ttl).await
}

pub struct MultiLevelCache {
    l1: DashMap<String, (String, Instant)>,
    l2: Option<redis::Client>,
}

impl MultiLevelCache {
    pub fn new(redis_url: Option<&str>) -> anyhow::Result<Self> {
        let l2 = match redis_url {
            Some(url) => Some(redis::Client::open(url)?),
            None => None,
        };
        Ok(Self {
            l1: DashMap::new(),
            l2,
        })
    }
}

#[async_trait]
impl Cache for MultiLevelCache {
    async fn get_raw(&self, key: &str) -> Option<String> {
        if let Some(entry) = self.l1.get(key) {
            if entry.1 > Instant::now() {
                debug!(key, "l1 cache hit");
                return Some(entry.0.clone());
            }
            drop(entry);
            self.l1.remove(key);
        }

        let client = self.l2.as_ref()?;
        let mut conn = match client.get_multiplexed_async_connection().await {
            Ok(conn) => conn,
            Err(err) => {
                error!(error = %err, "redis connection failed, treating as miss");
                return None;
            }
        };
        match conn.get::<_, Option<String>>(key).await {
            Ok(Some(value)) => {
                debug!(key, "l2 cache hit");
                Some(value)
            }
            Ok(None) => None,
            Err(err) => {
                error!(error = %err, "redis get failed, treating as miss");
                None
            }
        }
    }

    async fn set_raw(&self, key: &str, value: String, ttl: Duration) -> anyhow::Result<()> {
        // Invalidate-before-write.
        self.l1.remove(key);
        if let Some(client) = &self.l2 {
            let mut conn = client.get_multiplexed_async_connection().await?;
            let _: () = redis::cmd("SETEX")
                .arg(key)
                .arg(ttl.as_secs())
                .arg(&value)
                .query_async(&mut conn)
                .await?;
        }
        self.l1
            .insert(key.to_string(), (value, Instant::now() + ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        self.l1.remove(key);
        if let Some(client) = &self.l2 {
            let mut conn = client.get_multiplexed_async_connection().await?;
            let _: () = conn.del(key).await?;
        }
        Ok(())
    }
}
