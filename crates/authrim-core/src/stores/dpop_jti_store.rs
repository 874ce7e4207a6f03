//! DPoP proof-jti replay window.

use crate::error::StoreError;
use authrim_store::{Actor, ActorContext, Sweep};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

const STATE_KEY: &str = "state";
const STATE_VERSION: u32 = 1;

#[derive(Default, Serialize, Deserialize)]
struct DpopJtiState {
    version: u32,
    seen: HashMap<String, DateTime<Utc>>,
}

pub struct DpopJtiStore {
    ctx: ActorContext,
    state: Option<DpopJtiState>,
}

impl Actor for DpopJtiStore {
    fn attach(ctx: ActorContext) -> Self {
        Self { ctx, state: None }
    }
}

impl DpopJtiStore {
    async fn state(&mut self) -> Result<&mut DpopJtiState, StoreError> {
        if self.state.is_none() {
            let state = match self.ctx.read(STATE_KEY).await? {
                Some(blob) => serde_json::from_slice(&blob)
                    .map_err(|e| StoreError::StateDecode(e.to_string()))?,
                None => DpopJtiState {
                    version: STATE_VERSION,
                    seen: HashMap::new(),
                },
            };
            self.state = Some(state);
        }
        Ok(self.state.as_mut().expect("just initialized"))
    }

    async fn persist(&mut self) -> Result<(), StoreError> {
        let blob = serde_json::to_vec(self.state.as_ref().expect("state loaded"))
            .map_err(|e| StoreError::StateDecode(e.to_string()))?;
        if let Err(err) = self.ctx.write(STATE_KEY, blob).await {
            self.state = None;
            return Err(err.into());
        }
        Ok(())
    }

    /// Returns `true` the first time a jti is seen within its TTL and
    /// `false` (replay) for every later sighting.
    pub async fn check_and_store(&mut self, jti: &str, ttl_sec: u64) -> Result<bool, StoreError> {
        let now = Utc::now();
        let state = self.state().await?;
        if let Some(expires_at) = state.seen.get(jti) {
            if *expires_at > now {
                return Ok(false);
            }
        }
        state
            .seen
            .insert(jti.to_string(), now + Duration::seconds(ttl_sec as i64));
        self.persist().await?;
        Ok(true)
    }
}

#[async_trait::async_trait]
impl Sweep for DpopJtiStore {
    async fn sweep(&mut self, now: DateTime<Utc>) -> usize {
        let Ok(state) = self.state().await else {
            return 0;
        };
        let before = state.seen.len();
        state.seen.retain(|_, expires_at| *expires_at > now);
        let removed = before - state.seen.len();
        if removed > 0 {
            if let Err(err) = self.persist().await {
                tracing::error!(error = %err, "dpop jti sweep persist failed");
            }
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use authrim_store::{ActorHost, MemoryStorage};
    use std::sync::Arc;

    #[tokio::test]
    async fn first_sighting_wins_second_is_replay() {
        let host = ActorHost::<DpopJtiStore>::new(Arc::new(MemoryStorage::new()));
        let mut store = host.lease("tenant:t:dpop-jti").await;
        assert!(store.check_and_store("j1", 3600).await.unwrap());
        assert!(!store.check_and_store("j1", 3600).await.unwrap());
        assert!(store.check_and_store("j2", 3600).await.unwrap());
    }

    #[tokio::test]
    async fn expired_jti_can_recur() {
        let host = ActorHost::<DpopJtiStore>::new(Arc::new(MemoryStorage::new()));
        let mut store = host.lease("tenant:t:dpop-jti").await;
        assert!(store.check_and_store("j1", 0).await.unwrap());
        // TTL of zero: the record is already past its window.
        assert!(store.check_and_store("j1", 3600).await.unwrap());
    }
}
