//! Generic single-use challenge store.
//!
//! Backs PAR requests, magic links, passkey challenges, opaque session
//! tokens, consent tickets, and logout tickets. Consume is atomic within
//! the actor: same-id concurrent consumes produce exactly one winner.

use crate::error::StoreError;
use crate::models::{Challenge, ChallengeKind};
use authrim_store::{Actor, ActorContext, Sweep};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

const STATE_KEY: &str = "state";
const STATE_VERSION: u32 = 1;

#[derive(Default, Serialize, Deserialize)]
struct ChallengeState {
    version: u32,
    challenges: HashMap<String, Challenge>,
}

pub struct ChallengeStore {
    ctx: ActorContext,
    state: Option<ChallengeState>,
}

impl Actor for ChallengeStore {
    fn attach(ctx: ActorContext) -> Self {
        Self { ctx, state: None }
    }
}

impl ChallengeStore {
    async fn state(&mut self) -> Result<&mut ChallengeState, StoreError> {
        if self.state.is_none() {
            let state = match self.ctx.read(STATE_KEY).await? {
                Some(blob) => serde_json::from_slice(&blob)
                    .map_err(|e| StoreError::StateDecode(e.to_string()))?,
                None => ChallengeState {
                    version: STATE_VERSION,
                    challenges: HashMap::new(),
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

    pub async fn create(
        &mut self,
        id: &str,
        kind: ChallengeKind,
        payload: serde_json::Value,
        ttl_sec: u64,
    ) -> Result<(), StoreError> {
        let now = Utc::now();
        let state = self.state().await?;
        if state.challenges.contains_key(id) {
            return Err(StoreError::Conflict {
                message: "challenge id already exists".to_string(),
            });
        }
        state.challenges.insert(
            id.to_string(),
            Challenge {
                id: id.to_string(),
                kind,
                payload,
                created_at: now,
                expires_at: now + Duration::seconds(ttl_sec as i64),
                consumed: false,
            },
        );
        self.persist().await?;
        Ok(())
    }

    /// Single-winner consume: returns the payload for the first caller and
    /// `None` for everyone after (or for the wrong kind, or past TTL).
    pub async fn consume(
        &mut self,
        id: &str,
        kind: ChallengeKind,
    ) -> Result<Option<serde_json::Value>, StoreError> {
        let now = Utc::now();
        let state = self.state().await?;
        let decision = match state.challenges.get(id) {
            Some(ch) if ch.kind != kind => return Ok(None),
            Some(ch) if ch.consumed => return Ok(None),
            Some(ch) if ch.is_expired(now) => ConsumeDecision::Purge,
            Some(_) => ConsumeDecision::Take,
            None => return Ok(None),
        };
        let state = self.state.as_mut().expect("state loaded");
        match decision {
            ConsumeDecision::Purge => {
                state.challenges.remove(id);
                self.persist().await?;
                Ok(None)
            }
            ConsumeDecision::Take => {
                let challenge = state.challenges.get_mut(id).expect("checked present");
                challenge.consumed = true;
                let payload = challenge.payload.clone();
                self.persist().await?;
                Ok(Some(payload))
            }
        }
    }
}

enum ConsumeDecision {
    Purge,
    Take,
}

#[async_trait::async_trait]
impl Sweep for ChallengeStore {
    async fn sweep(&mut self, now: DateTime<Utc>) -> usize {
        let Ok(state) = self.state().await else {
            return 0;
        };
        let before = state.challenges.len();
        state.challenges.retain(|_, ch| !ch.is_expired(now));
        let removed = before - state.challenges.len();
        if removed > 0 {
            if let Err(err) = self.persist().await {
                tracing::error!(error = %err, "challenge sweep persist failed");
            }
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use authrim_store::{ActorHost, MemoryStorage};
    use serde_json::json;
    use std::sync::Arc;

    async fn store() -> tokio::sync::OwnedMutexGuard<ChallengeStore> {
        let host = ActorHost::<ChallengeStore>::new(Arc::new(MemoryStorage::new()));
        host.lease("tenant:t:challenge").await
    }

    #[tokio::test]
    async fn consume_has_exactly_one_winner() {
        let mut store = store().await;
        store
            .create("ch1", ChallengeKind::MagicLink, json!({"user": "u1"}), 300)
            .await
            .unwrap();

        let first = store.consume("ch1", ChallengeKind::MagicLink).await.unwrap();
        assert_eq!(first.unwrap()["user"], "u1");

        let second = store.consume("ch1", ChallengeKind::MagicLink).await.unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn kind_must_match() {
        let mut store = store().await;
        store
            .create("ch1", ChallengeKind::Par, json!({}), 300)
            .await
            .unwrap();
        assert!(store
            .consume("ch1", ChallengeKind::MagicLink)
            .await
            .unwrap()
            .is_none());
        // The mismatched attempt did not burn the challenge.
        assert!(store.consume("ch1", ChallengeKind::Par).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn expired_challenge_is_gone() {
        let mut store = store().await;
        store
            .create("ch1", ChallengeKind::Passkey, json!({}), 0)
            .await
            .unwrap();
        assert!(store
            .consume("ch1", ChallengeKind::Passkey)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn duplicate_create_conflicts() {
        let mut store = store().await;
        store
            .create("ch1", ChallengeKind::Consent, json!({}), 300)
            .await
            .unwrap();
        assert!(matches!(
            store.create("ch1", ChallengeKind::Consent, json!({}), 300).await,
            Err(StoreError::Conflict { .. })
        ));
    }
}
