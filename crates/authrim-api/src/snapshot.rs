//! TTL-bounded, immutable shard-config snapshot.
//!
//! Handlers read shard configuration through this cache; the actor is only
//! consulted when the snapshot is stale. Readers may observe the previous
//! snapshot for up to the TTL, which is safe because routing for issued
//! tokens uses the identifier's embedded generation, never current config.

use authrim_core::models::ShardConfig;
use authrim_core::stores::ShardConfigStore;
use authrim_core::StoreError;
use authrim_store::ActorHost;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

pub struct ShardConfigCache {
    ttl: Duration,
    snapshot: Mutex<Option<(Arc<ShardConfig>, Instant)>>,
}

impl ShardConfigCache {
    pub fn new(ttl_ms: u64) -> Self {
        Self {
            ttl: Duration::from_millis(ttl_ms),
            snapshot: Mutex::new(None),
        }
    }

    pub async fn current(
        &self,
        host: &ActorHost<ShardConfigStore>,
        instance: &str,
        default_count: u32,
    ) -> Result<Arc<ShardConfig>, StoreError> {
        {
            let snapshot = self.snapshot.lock().await;
            if let Some((config, fetched_at)) = snapshot.as_ref() {
                if fetched_at.elapsed() < self.ttl {
                    return Ok(config.clone());
                }
            }
        }
        let fresh = {
            let mut store = host.lease(instance).await;
            Arc::new(store.get(default_count).await?)
        };
        let mut snapshot = self.snapshot.lock().await;
        *snapshot = Some((fresh.clone(), Instant::now()));
        Ok(fresh)
    }

    /// Drop the snapshot (after an admin shard-count change).
    pub async fn invalidate(&self) {
        *self.snapshot.lock().await = None;
    }
}
