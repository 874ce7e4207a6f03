//! Session store shard.
//!
//! Sessions are sharded by `FNV-1a(userId) % SESSION_SHARD_COUNT`; the
//! chosen shard index is baked into the session id, and lookups route by
//! that prefix alone. A session created before a re-shard keeps being
//! served from its original instance.

use crate::error::StoreError;
use crate::models::{Session, SessionData};
use authrim_store::{router, Actor, ActorContext, Sweep};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

const STATE_KEY: &str = "state";
const STATE_VERSION: u32 = 1;

#[derive(Default, Serialize, Deserialize)]
struct SessionShardState {
    version: u32,
    sessions: HashMap<String, Session>,
}

pub struct SessionShard {
    ctx: ActorContext,
    state: Option<SessionShardState>,
}

impl Actor for SessionShard {
    fn attach(ctx: ActorContext) -> Self {
        Self { ctx, state: None }
    }
}

impl SessionShard {
    async fn state(&mut self) -> Result<&mut SessionShardState, StoreError> {
        if self.state.is_none() {
            let state = match self.ctx.read(STATE_KEY).await? {
                Some(blob) => serde_json::from_slice(&blob)
                    .map_err(|e| StoreError::StateDecode(e.to_string()))?,
                None => SessionShardState {
                    version: STATE_VERSION,
                    sessions: HashMap::new(),
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
        user_id: &str,
        shard: u32,
        ttl_sec: u64,
        data: SessionData,
    ) -> Result<Session, StoreError> {
        let now = Utc::now();
        let session = Session {
            id: router::new_session_id(shard),
            user_id: user_id.to_string(),
            created_at: now,
            expires_at: now + Duration::seconds(ttl_sec as i64),
            data,
        };
        let state = self.state().await?;
        if state.sessions.contains_key(&session.id) {
            return Err(StoreError::Invariant {
                message: format!("duplicate session id {}", session.id),
            });
        }
        state.sessions.insert(session.id.clone(), session.clone());
        self.persist().await?;
        Ok(session)
    }

    /// Returns the session only while unexpired; an expired record is
    /// purged on access rather than waiting for the sweep.
    pub async fn get(&mut self, id: &str) -> Result<Option<Session>, StoreError> {
        let now = Utc::now();
        let state = self.state().await?;
        match state.sessions.get(id) {
            Some(session) if !session.is_expired(now) => return Ok(Some(session.clone())),
            Some(_) => {}
            None => return Ok(None),
        }
        // Expired but not yet swept: purge on access.
        let state = self.state.as_mut().expect("state loaded");
        state.sessions.remove(id);
        self.persist().await?;
        Ok(None)
    }

    pub async fn extend(&mut self, id: &str, add_sec: u64) -> Result<Option<Session>, StoreError> {
        let now = Utc::now();
        let state = self.state().await?;
        let Some(session) = state.sessions.get_mut(id) else {
            return Ok(None);
        };
        if session.is_expired(now) {
            state.sessions.remove(id);
            self.persist().await?;
            return Ok(None);
        }
        session.expires_at = now + Duration::seconds(add_sec as i64);
        let updated = session.clone();
        self.persist().await?;
        Ok(Some(updated))
    }

    /// Record a consent grant on the session.
    pub async fn grant_consent(
        &mut self,
        id: &str,
        client_id: &str,
        scope: &str,
    ) -> Result<Option<Session>, StoreError> {
        let now = Utc::now();
        let state = self.state().await?;
        let Some(session) = state.sessions.get_mut(id) else {
            return Ok(None);
        };
        if session.is_expired(now) {
            return Ok(None);
        }
        let entry = session
            .data
            .consented
            .entry(client_id.to_string())
            .or_default();
        let mut granted: Vec<&str> = entry.split(' ').filter(|s| !s.is_empty()).collect();
        for s in scope.split(' ').filter(|s| !s.is_empty()) {
            if !granted.contains(&s) {
                granted.push(s);
            }
        }
        *entry = granted.join(" ");
        let updated = session.clone();
        self.persist().await?;
        Ok(Some(updated))
    }

    pub async fn invalidate(&mut self, id: &str) -> Result<bool, StoreError> {
        let state = self.state().await?;
        let removed = state.sessions.remove(id).is_some();
        if removed {
            self.persist().await?;
        }
        Ok(removed)
    }

    /// Shard-local scan; the caller fans out across shards if it needs a
    /// global view.
    pub async fn list_user(&mut self, user_id: &str) -> Result<Vec<Session>, StoreError> {
        let now = Utc::now();
        let state = self.state().await?;
        Ok(state
            .sessions
            .values()
            .filter(|s| s.user_id == user_id && !s.is_expired(now))
            .cloned()
            .collect())
    }

    /// Remove a batch under a single save.
    pub async fn delete_batch(&mut self, ids: &[String]) -> Result<usize, StoreError> {
        let state = self.state().await?;
        let mut removed = 0;
        for id in ids {
            if state.sessions.remove(id).is_some() {
                removed += 1;
            }
        }
        if removed > 0 {
            self.persist().await?;
        }
        Ok(removed)
    }
}

#[async_trait::async_trait]
impl Sweep for SessionShard {
    async fn sweep(&mut self, now: DateTime<Utc>) -> usize {
        let Ok(state) = self.state().await else {
            return 0;
        };
        let before = state.sessions.len();
        state.sessions.retain(|_, s| !s.is_expired(now));
        let removed = before - state.sessions.len();
        if removed > 0 {
            if let Err(err) = self.persist().await {
                tracing::error!(error = %err, "session sweep persist failed");
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

    async fn shard() -> tokio::sync::OwnedMutexGuard<SessionShard> {
        let host = ActorHost::<SessionShard>::new(Arc::new(MemoryStorage::new()));
        host.lease("tenant:t:session:shard-7").await
    }

    #[tokio::test]
    async fn create_get_invalidate() {
        let mut shard = shard().await;
        let session = shard
            .create("u1", 7, 3600, SessionData::default())
            .await
            .unwrap();
        assert!(session.id.starts_with("7_session_"));

        let found = shard.get(&session.id).await.unwrap().unwrap();
        assert_eq!(found.user_id, "u1");

        assert!(shard.invalidate(&session.id).await.unwrap());
        assert!(shard.get(&session.id).await.unwrap().is_none());
        // Second invalidate is a no-op.
        assert!(!shard.invalidate(&session.id).await.unwrap());
    }

    #[tokio::test]
    async fn expired_session_reads_as_absent() {
        let mut shard = shard().await;
        let session = shard
            .create("u1", 7, 0, SessionData::default())
            .await
            .unwrap();
        assert!(shard.get(&session.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn extend_pushes_expiry_forward() {
        let mut shard = shard().await;
        let session = shard
            .create("u1", 7, 60, SessionData::default())
            .await
            .unwrap();
        let extended = shard.extend(&session.id, 7200).await.unwrap().unwrap();
        assert!(extended.expires_at > session.expires_at);
    }

    #[tokio::test]
    async fn list_user_is_shard_local() {
        let mut shard = shard().await;
        shard.create("u1", 7, 3600, SessionData::default()).await.unwrap();
        shard.create("u1", 7, 3600, SessionData::default()).await.unwrap();
        shard.create("u2", 7, 3600, SessionData::default()).await.unwrap();
        assert_eq!(shard.list_user("u1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn delete_batch_counts_hits_only() {
        let mut shard = shard().await;
        let a = shard.create("u1", 7, 3600, SessionData::default()).await.unwrap();
        let b = shard.create("u1", 7, 3600, SessionData::default()).await.unwrap();
        let removed = shard
            .delete_batch(&[a.id.clone(), b.id.clone(), "7_session_missing".to_string()])
            .await
            .unwrap();
        assert_eq!(removed, 2);
    }

    #[tokio::test]
    async fn sweep_removes_expired() {
        let mut shard = shard().await;
        shard.create("u1", 7, 0, SessionData::default()).await.unwrap();
        shard.create("u2", 7, 3600, SessionData::default()).await.unwrap();
        let removed = shard.sweep(Utc::now()).await;
        assert_eq!(removed, 1);
    }
}
