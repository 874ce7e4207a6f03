//! Backchannel authentication request store (OIDC CIBA, poll mode).

use crate::error::StoreError;
use crate::models::{CibaDecision, CibaRequest};
use authrim_store::{router, Actor, ActorContext, Sweep};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

const STATE_KEY: &str = "state";
const STATE_VERSION: u32 = 1;

#[derive(Default, Serialize, Deserialize)]
struct CibaState {
    version: u32,
    requests: HashMap<String, CibaRequest>,
}

pub struct CibaStore {
    ctx: ActorContext,
    state: Option<CibaState>,
}

impl Actor for CibaStore {
    fn attach(ctx: ActorContext) -> Self {
        Self { ctx, state: None }
    }
}

#[derive(Debug, Clone)]
pub enum CibaPoll {
    Approved(CibaRequest),
    Pending,
    SlowDown,
    Denied,
    Expired,
}

impl CibaStore {
    async fn state(&mut self) -> Result<&mut CibaState, StoreError> {
        if self.state.is_none() {
            let state = match self.ctx.read(STATE_KEY).await? {
                Some(blob) => serde_json::from_slice(&blob)
                    .map_err(|e| StoreError::StateDecode(e.to_string()))?,
                None => CibaState {
                    version: STATE_VERSION,
                    requests: HashMap::new(),
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
        client_id: &str,
        scope: &str,
        login_hint: &str,
        binding_message: Option<String>,
        ttl_sec: u64,
        interval_sec: u64,
    ) -> Result<CibaRequest, StoreError> {
        let now = Utc::now();
        let request = CibaRequest {
            auth_req_id: router::random_token(40),
            client_id: client_id.to_string(),
            scope: scope.to_string(),
            login_hint: login_hint.to_string(),
            binding_message,
            decision: CibaDecision::Pending,
            created_at: now,
            expires_at: now + Duration::seconds(ttl_sec as i64),
            interval_sec,
            last_polled_at: None,
        };
        let state = self.state().await?;
        state
            .requests
            .insert(request.auth_req_id.clone(), request.clone());
        self.persist().await?;
        Ok(request)
    }

    /// The authentication-device side resolves the user and decides.
    pub async fn approve(&mut self, auth_req_id: &str, user_id: &str) -> Result<bool, StoreError> {
        self.decide(auth_req_id, CibaDecision::Approved {
            user_id: user_id.to_string(),
        })
        .await
    }

    pub async fn deny(&mut self, auth_req_id: &str) -> Result<bool, StoreError> {
        self.decide(auth_req_id, CibaDecision::Denied).await
    }

    async fn decide(&mut self, auth_req_id: &str, decision: CibaDecision) -> Result<bool, StoreError> {
        let now = Utc::now();
        let state = self.state().await?;
        let Some(request) = state.requests.get_mut(auth_req_id) else {
            return Ok(false);
        };
        if request.is_expired(now) || request.decision != CibaDecision::Pending {
            return Ok(false);
        }
        request.decision = decision;
        self.persist().await?;
        Ok(true)
    }

    pub async fn poll(&mut self, auth_req_id: &str, client_id: &str) -> Result<CibaPoll, StoreError> {
        let now = Utc::now();
        let state = self.state().await?;
        let Some(request) = state.requests.get_mut(auth_req_id) else {
            return Ok(CibaPoll::Expired);
        };
        if request.client_id != client_id {
            return Ok(CibaPoll::Expired);
        }
        if request.is_expired(now) {
            state.requests.remove(auth_req_id);
            self.persist().await?;
            return Ok(CibaPoll::Expired);
        }
        let interval = Duration::seconds(request.interval_sec as i64);
        if let Some(last) = request.last_polled_at {
            if now - last < interval {
                request.last_polled_at = Some(now);
                self.persist().await?;
                return Ok(CibaPoll::SlowDown);
            }
        }
        request.last_polled_at = Some(now);
        match request.decision.clone() {
            CibaDecision::Pending => {
                self.persist().await?;
                Ok(CibaPoll::Pending)
            }
            CibaDecision::Denied => {
                let state = self.state.as_mut().expect("state loaded");
                state.requests.remove(auth_req_id);
                self.persist().await?;
                Ok(CibaPoll::Denied)
            }
            CibaDecision::Approved { .. } => {
                let consumed = request.clone();
                let state = self.state.as_mut().expect("state loaded");
                state.requests.remove(auth_req_id);
                self.persist().await?;
                Ok(CibaPoll::Approved(consumed))
            }
        }
    }
}

#[async_trait::async_trait]
impl Sweep for CibaStore {
    async fn sweep(&mut self, now: DateTime<Utc>) -> usize {
        let Ok(state) = self.state().await else {
            return 0;
        };
        let before = state.requests.len();
        state.requests.retain(|_, r| !r.is_expired(now));
        let removed = before - state.requests.len();
        if removed > 0 {
            if let Err(err) = self.persist().await {
                tracing::error!(error = %err, "ciba sweep persist failed");
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
    async fn approval_flow() {
        let host = ActorHost::<CibaStore>::new(Arc::new(MemoryStorage::new()));
        let mut store = host.lease("tenant:t:ciba").await;

        let request = store
            .create("c1", "openid", "user@example.com", None, 300, 0)
            .await
            .unwrap();
        assert!(matches!(
            store.poll(&request.auth_req_id, "c1").await.unwrap(),
            CibaPoll::Pending
        ));
        assert!(store.approve(&request.auth_req_id, "u1").await.unwrap());
        assert!(matches!(
            store.poll(&request.auth_req_id, "c1").await.unwrap(),
            CibaPoll::Approved(_)
        ));
        // Consumed.
        assert!(matches!(
            store.poll(&request.auth_req_id, "c1").await.unwrap(),
            CibaPoll::Expired
        ));
    }

    #[tokio::test]
    async fn wrong_client_sees_nothing() {
        let host = ActorHost::<CibaStore>::new(Arc::new(MemoryStorage::new()));
        let mut store = host.lease("tenant:t:ciba").await;
        let request = store
            .create("c1", "openid", "user@example.com", None, 300, 0)
            .await
            .unwrap();
        assert!(matches!(
            store.poll(&request.auth_req_id, "other").await.unwrap(),
            CibaPoll::Expired
        ));
    }
}
