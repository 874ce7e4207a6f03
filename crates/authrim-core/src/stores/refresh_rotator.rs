//! Refresh-token rotation with theft detection.
//!
//! One rotator instance owns every family routed to it by
//! `(client, generation, shard)`. A family's `version` is strictly
//! increasing and `current_jti` is exclusively held; presenting a
//! superseded jti, or a stale `rtv` on the current jti, revokes the whole
//! family in the same round-trip.

use crate::error::StoreError;
use crate::models::TokenFamily;
use authrim_store::{router, Actor, ActorContext, Sweep};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

const STATE_KEY: &str = "state";
const STATE_VERSION: u32 = 1;
/// Superseded jtis remembered per family.
const PREVIOUS_JTI_LIMIT: usize = 5;

#[derive(Default, Serialize, Deserialize)]
struct RotatorState {
    version: u32,
    families: HashMap<String, TokenFamily>,
    /// jti → family id; covers the current jti and remembered previous ones.
    token_index: HashMap<String, String>,
}

pub struct RefreshRotator {
    ctx: ActorContext,
    state: Option<RotatorState>,
}

impl Actor for RefreshRotator {
    fn attach(ctx: ActorContext) -> Self {
        Self { ctx, state: None }
    }
}

#[derive(Debug, Clone)]
pub struct NewFamily {
    pub user_id: String,
    pub client_id: String,
    pub allowed_scope: String,
    pub initial_jti: String,
    pub session_id: String,
    pub auth_time: DateTime<Utc>,
    pub generation: u32,
    pub shard: u32,
    pub ttl_sec: u64,
}

#[derive(Debug, Clone)]
pub struct RotateRequest {
    pub current_jti: String,
    /// The `rtv` claim of the presented token, if it was a JWT.
    pub presented_version: Option<u64>,
    pub requested_scope: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RotationOutcome {
    pub family_id: String,
    pub new_jti: String,
    pub version: u64,
    pub scope: String,
    pub user_id: String,
    pub client_id: String,
    pub session_id: String,
    pub auth_time: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl RefreshRotator {
    async fn state(&mut self) -> Result<&mut RotatorState, StoreError> {
        if self.state.is_none() {
            let state = match self.ctx.read(STATE_KEY).await? {
                Some(blob) => serde_json::from_slice(&blob)
                    .map_err(|e| StoreError::StateDecode(e.to_string()))?,
                None => RotatorState {
                    version: STATE_VERSION,
                    families: HashMap::new(),
                    token_index: HashMap::new(),
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

    pub async fn create_family(&mut self, new: NewFamily) -> Result<TokenFamily, StoreError> {
        let now = Utc::now();
        let state = self.state().await?;
        if state.token_index.contains_key(&new.initial_jti) {
            return Err(StoreError::Invariant {
                message: format!("jti already indexed: {}", new.initial_jti),
            });
        }
        let family = TokenFamily {
            id: Uuid::new_v4().to_string(),
            current_jti: new.initial_jti.clone(),
            previous_jtis: Vec::new(),
            version: 0,
            user_id: new.user_id,
            client_id: new.client_id,
            allowed_scope: new.allowed_scope,
            session_id: new.session_id,
            auth_time: new.auth_time,
            generation: new.generation,
            shard: new.shard,
            created_at: now,
            last_rotation: now,
            expires_at: now + Duration::seconds(new.ttl_sec as i64),
        };
        state
            .token_index
            .insert(new.initial_jti, family.id.clone());
        state.families.insert(family.id.clone(), family.clone());
        self.persist().await?;
        Ok(family)
    }

    /// Rotate the family owning `current_jti`.
    ///
    /// Theft paths revoke the whole family before returning, so the caller
    /// sees `TokenTheft` only after the local revocation is durable.
    pub async fn rotate(&mut self, request: RotateRequest) -> Result<RotationOutcome, StoreError> {
        let now = Utc::now();
        let state = self.state().await?;

        let Some(family_id) = state.token_index.get(&request.current_jti).cloned() else {
            return Err(StoreError::invalid_grant("unknown refresh token"));
        };
        let Some(family) = state.families.get(&family_id) else {
            // Index entry without a family: the family was revoked.
            return Err(StoreError::invalid_grant("refresh token family revoked"));
        };

        if family.is_expired(now) {
            self.remove_family(&family_id);
            self.persist().await?;
            return Err(StoreError::invalid_grant("refresh token expired"));
        }

        // A superseded jti is proof the token leaked: someone else rotated
        // after this copy was issued.
        let superseded = family.current_jti != request.current_jti
            && family.previous_jtis.iter().any(|j| j == &request.current_jti);
        // Same jti but an older rtv means a stale re-issue of the current
        // token: the same symptom.
        let stale_version = family.current_jti == request.current_jti
            && request
                .presented_version
                .map(|v| v < family.version)
                .unwrap_or(false);

        if superseded || stale_version {
            let user_id = family.user_id.clone();
            let session_id = family.session_id.clone();
            let revoked_jtis = self.remove_family(&family_id);
            self.persist().await?;
            tracing::warn!(
                family_id = %family_id,
                user_id = %user_id,
                "refresh token reuse detected, family revoked"
            );
            return Err(StoreError::TokenTheft {
                family_id,
                user_id,
                session_id,
                revoked_jtis,
            });
        }

        if family.current_jti != request.current_jti {
            // Indexed but neither current nor remembered: treat as unknown.
            return Err(StoreError::invalid_grant("unknown refresh token"));
        }

        let scope = match &request.requested_scope {
            Some(requested) => {
                if !family.scope_permits(requested) {
                    return Err(StoreError::ScopeWidening {
                        requested: requested.clone(),
                    });
                }
                requested.clone()
            }
            None => family.allowed_scope.clone(),
        };

        // Legitimate rotation: mint the successor under the family's pinned
        // generation and shard.
        let state = self.state.as_mut().expect("state loaded");
        let family = state.families.get_mut(&family_id).expect("checked above");
        let new_jti = router::new_refresh_jti(family.generation, family.shard);
        let old_jti = std::mem::replace(&mut family.current_jti, new_jti.clone());
        family.previous_jtis.insert(0, old_jti);
        while family.previous_jtis.len() > PREVIOUS_JTI_LIMIT {
            if let Some(evicted) = family.previous_jtis.pop() {
                state.token_index.remove(&evicted);
            }
        }
        family.version += 1;
        family.last_rotation = now;
        let outcome = RotationOutcome {
            family_id: family.id.clone(),
            new_jti: new_jti.clone(),
            version: family.version,
            scope,
            user_id: family.user_id.clone(),
            client_id: family.client_id.clone(),
            session_id: family.session_id.clone(),
            auth_time: family.auth_time,
            expires_at: family.expires_at,
        };
        state.token_index.insert(new_jti, family_id);
        self.persist().await?;
        Ok(outcome)
    }

    /// Remove the family and every index entry pointing at it. Returns the
    /// jtis that were live so the caller can blacklist them.
    pub async fn revoke_family(
        &mut self,
        family_id: &str,
        reason: &str,
    ) -> Result<Vec<String>, StoreError> {
        let state = self.state().await?;
        if !state.families.contains_key(family_id) {
            return Ok(Vec::new());
        }
        let jtis = self.remove_family(family_id);
        self.persist().await?;
        tracing::info!(family_id, reason, "token family revoked");
        Ok(jtis)
    }

    /// Revoke every family belonging to `user_id` (optionally narrowed to
    /// one session). Used by logout and cascade revocation.
    pub async fn revoke_families_for(
        &mut self,
        user_id: &str,
        session_id: Option<&str>,
        reason: &str,
    ) -> Result<Vec<String>, StoreError> {
        let state = self.state().await?;
        let matching: Vec<String> = state
            .families
            .values()
            .filter(|f| {
                f.user_id == user_id
                    && session_id.map(|s| f.session_id == s).unwrap_or(true)
            })
            .map(|f| f.id.clone())
            .collect();
        if matching.is_empty() {
            return Ok(Vec::new());
        }
        for family_id in &matching {
            self.remove_family(family_id);
        }
        self.persist().await?;
        tracing::info!(user_id, reason, count = matching.len(), "families revoked");
        Ok(matching)
    }

    /// Read-only diagnostic.
    pub async fn family_info(&mut self, family_id: &str) -> Result<Option<TokenFamily>, StoreError> {
        let state = self.state().await?;
        Ok(state.families.get(family_id).cloned())
    }

    /// Resolve the family currently owning a jti, if any.
    pub async fn family_for_jti(&mut self, jti: &str) -> Result<Option<TokenFamily>, StoreError> {
        let state = self.state().await?;
        let Some(family_id) = state.token_index.get(jti) else {
            return Ok(None);
        };
        Ok(state.families.get(family_id).cloned())
    }

    fn remove_family(&mut self, family_id: &str) -> Vec<String> {
        let state = self.state.as_mut().expect("state loaded");
        let mut jtis = Vec::new();
        if let Some(family) = state.families.remove(family_id) {
            jtis.push(family.current_jti.clone());
            jtis.extend(family.previous_jtis.iter().cloned());
            state.token_index.remove(&family.current_jti);
            for jti in &family.previous_jtis {
                state.token_index.remove(jti);
            }
        }
        jtis
    }
}

#[async_trait::async_trait]
impl Sweep for RefreshRotator {
    async fn sweep(&mut self, now: DateTime<Utc>) -> usize {
        let Ok(state) = self.state().await else {
            return 0;
        };
        let expired: Vec<String> = state
            .families
            .values()
            .filter(|f| f.is_expired(now))
            .map(|f| f.id.clone())
            .collect();
        for family_id in &expired {
            self.remove_family(family_id);
        }
        if !expired.is_empty() {
            if let Err(err) = self.persist().await {
                tracing::error!(error = %err, "rotator sweep persist failed");
            }
        }
        expired.len()
    }
}
