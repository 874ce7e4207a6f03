//! Token-revocation list.
//!
//! Entries live until the original token would have expired, which makes
//! `is_revoked` false-negative-free for the token's whole lifetime.

use crate::error::StoreError;
use crate::models::RevokedToken;
use authrim_store::{Actor, ActorContext, Sweep};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

const STATE_KEY: &str = "state";
const STATE_VERSION: u32 = 1;

#[derive(Default, Serialize, Deserialize)]
struct RevocationState {
    version: u32,
    revoked: HashMap<String, RevokedToken>,
}

pub struct RevocationStore {
    ctx: ActorContext,
    state: Option<RevocationState>,
}

impl Actor for RevocationStore {
    fn attach(ctx: ActorContext) -> Self {
        Self { ctx, state: None }
    }
}

impl RevocationStore {
    async fn state(&mut self) -> Result<&mut RevocationState, StoreError> {
        if self.state.is_none() {
            let state = match self.ctx.read(STATE_KEY).await? {
                Some(blob) => serde_json::from_slice(&blob)
                    .map_err(|e| StoreError::StateDecode(e.to_string()))?,
                None => RevocationState {
                    version: STATE_VERSION,
                    revoked: HashMap::new(),
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

    pub async fn revoke(
        &mut self,
        jti: &str,
        expires_at: DateTime<Utc>,
        reason: &str,
    ) -> Result<(), StoreError> {
        let state = self.state().await?;
        state.revoked.insert(
            jti.to_string(),
            RevokedToken {
                jti: jti.to_string(),
                reason: reason.to_string(),
                revoked_at: Utc::now(),
                expires_at,
            },
        );
        self.persist().await?;
        Ok(())
    }

    /// Blacklist a batch under one save (cascade revocations).
    pub async fn revoke_batch(
        &mut self,
        jtis: &[String],
        expires_at: DateTime<Utc>,
        reason: &str,
    ) -> Result<usize, StoreError> {
        if jtis.is_empty() {
            return Ok(0);
        }
        let now = Utc::now();
        let state = self.state().await?;
        for jti in jtis {
            state.revoked.insert(
                jti.clone(),
                RevokedToken {
                    jti: jti.clone(),
                    reason: reason.to_string(),
                    revoked_at: now,
                    expires_at,
                },
            );
        }
        self.persist().await?;
        Ok(jtis.len())
    }

    pub async fn is_revoked(&mut self, jti: &str) -> Result<bool, StoreError> {
        let now = Utc::now();
        let state = self.state().await?;
        Ok(state
            .revoked
            .get(jti)
            .map(|r| r.expires_at > now)
            .unwrap_or(false))
    }

    pub async fn lookup(&mut self, jti: &str) -> Result<Option<RevokedToken>, StoreError> {
        let state = self.state().await?;
        Ok(state.revoked.get(jti).cloned())
    }
}

#[async_trait::async_trait]
impl Sweep for RevocationStore {
    async fn sweep(&mut self, now: DateTime<Utc>) -> usize {
        let Ok(state) = self.state().await else {
            return 0;
        };
        let before = state.revoked.len();
        state.revoked.retain(|_, r| r.expires_at > now);
        let removed = before - state.revoked.len();
        if removed > 0 {
            if let Err(err) = self.persist().await {
                tracing::error!(error = %err, "revocation sweep persist failed");
            }
        }
        removed
    }
}
