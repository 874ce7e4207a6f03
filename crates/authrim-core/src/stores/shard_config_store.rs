//! Source of truth for the refresh-token shard configuration.
//!
//! Admin updates bump the generation and retain the previous one; routing
//! for already-issued tokens never changes because their identifiers embed
//! the generation they were minted under. Readers normally go through the
//! TTL-bounded snapshot cache in the handler layer, not this actor.

use crate::error::StoreError;
use crate::models::{ShardConfig, ShardGeneration};
use authrim_store::{Actor, ActorContext};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

const STATE_KEY: &str = "state";
const STATE_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct ShardConfigState {
    version: u32,
    config: ShardConfig,
}

pub struct ShardConfigStore {
    ctx: ActorContext,
    state: Option<ShardConfigState>,
}

impl Actor for ShardConfigStore {
    fn attach(ctx: ActorContext) -> Self {
        Self { ctx, state: None }
    }
}

impl ShardConfigStore {
    async fn state(&mut self, default_count: u32) -> Result<&mut ShardConfigState, StoreError> {
        if self.state.is_none() {
            let state = match self.ctx.read(STATE_KEY).await? {
                Some(blob) => serde_json::from_slice(&blob)
                    .map_err(|e| StoreError::StateDecode(e.to_string()))?,
                None => ShardConfigState {
                    version: STATE_VERSION,
                    config: ShardConfig::initial(default_count),
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

    pub async fn get(&mut self, default_count: u32) -> Result<ShardConfig, StoreError> {
        Ok(self.state(default_count).await?.config.clone())
    }

    /// Admin operation: new shard count ⇒ new generation. The outgoing
    /// generation is retained until all its tokens expire.
    pub async fn set_shard_count(
        &mut self,
        new_count: u32,
        now: DateTime<Utc>,
    ) -> Result<ShardConfig, StoreError> {
        if new_count == 0 {
            return Err(StoreError::Invariant {
                message: "shard count must be positive".to_string(),
            });
        }
        let state = self.state(new_count).await?;
        if state.config.current_shard_count == new_count {
            return Ok(state.config.clone());
        }
        let outgoing = ShardGeneration {
            generation: state.config.current_generation,
            shard_count: state.config.current_shard_count,
            deprecated_at: Some(now),
        };
        state.config.previous_generations.push(outgoing);
        state.config.current_generation += 1;
        state.config.current_shard_count = new_count;
        let updated = state.config.clone();
        self.persist().await?;
        tracing::info!(
            generation = updated.current_generation,
            shard_count = new_count,
            "shard configuration updated"
        );
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use authrim_store::{ActorHost, MemoryStorage};
    use std::sync::Arc;

    #[tokio::test]
    async fn generation_is_monotone_and_history_is_kept() {
        let host = ActorHost::<ShardConfigStore>::new(Arc::new(MemoryStorage::new()));
        let mut store = host.lease("tenant:t:shard-config").await;

        let initial = store.get(8).await.unwrap();
        assert_eq!(initial.current_generation, 1);
        assert_eq!(initial.current_shard_count, 8);

        let updated = store.set_shard_count(16, Utc::now()).await.unwrap();
        assert_eq!(updated.current_generation, 2);
        assert_eq!(updated.current_shard_count, 16);
        assert_eq!(updated.previous_generations.len(), 1);
        assert_eq!(updated.previous_generations[0].shard_count, 8);

        // Setting the same count is a no-op, not a new generation.
        let same = store.set_shard_count(16, Utc::now()).await.unwrap();
        assert_eq!(same.current_generation, 2);
    }
}
