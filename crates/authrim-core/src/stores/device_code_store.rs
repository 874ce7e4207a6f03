//! Device-authorization grant store (RFC 8628).

use crate::error::StoreError;
use crate::models::{DeviceAuthorization, DeviceDecision};
use authrim_store::{router, Actor, ActorContext, Sweep};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

const STATE_KEY: &str = "state";
const STATE_VERSION: u32 = 1;
/// Unambiguous alphabet for human-entered codes (no vowels, no 0/O/1/I).
const USER_CODE_ALPHABET: &[u8] = b"BCDFGHJKLMNPQRSTVWXZ23456789";

#[derive(Default, Serialize, Deserialize)]
struct DeviceCodeState {
    version: u32,
    /// Keyed by device_code.
    pending: HashMap<String, DeviceAuthorization>,
    /// user_code → device_code.
    user_codes: HashMap<String, String>,
}

pub struct DeviceCodeStore {
    ctx: ActorContext,
    state: Option<DeviceCodeState>,
}

impl Actor for DeviceCodeStore {
    fn attach(ctx: ActorContext) -> Self {
        Self { ctx, state: None }
    }
}

/// Poll outcome for the token endpoint, mapped onto RFC 8628 errors there.
#[derive(Debug, Clone)]
pub enum DevicePoll {
    Approved(DeviceAuthorization),
    Pending,
    SlowDown,
    Denied,
    Expired,
}

impl DeviceCodeStore {
    async fn state(&mut self) -> Result<&mut DeviceCodeState, StoreError> {
        if self.state.is_none() {
            let state = match self.ctx.read(STATE_KEY).await? {
                Some(blob) => serde_json::from_slice(&blob)
                    .map_err(|e| StoreError::StateDecode(e.to_string()))?,
                None => DeviceCodeState {
                    version: STATE_VERSION,
                    pending: HashMap::new(),
                    user_codes: HashMap::new(),
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
        ttl_sec: u64,
        interval_sec: u64,
    ) -> Result<DeviceAuthorization, StoreError> {
        let now = Utc::now();
        let authorization = DeviceAuthorization {
            device_code: router::random_token(40),
            user_code: generate_user_code(),
            client_id: client_id.to_string(),
            scope: scope.to_string(),
            decision: DeviceDecision::Pending,
            created_at: now,
            expires_at: now + Duration::seconds(ttl_sec as i64),
            interval_sec,
            last_polled_at: None,
        };
        let state = self.state().await?;
        state
            .user_codes
            .insert(authorization.user_code.clone(), authorization.device_code.clone());
        state
            .pending
            .insert(authorization.device_code.clone(), authorization.clone());
        self.persist().await?;
        Ok(authorization)
    }

    /// Look up by user code for the verification page.
    pub async fn find_by_user_code(
        &mut self,
        user_code: &str,
    ) -> Result<Option<DeviceAuthorization>, StoreError> {
        let now = Utc::now();
        let state = self.state().await?;
        let Some(device_code) = state.user_codes.get(&normalize_user_code(user_code)) else {
            return Ok(None);
        };
        Ok(state
            .pending
            .get(device_code)
            .filter(|a| !a.is_expired(now))
            .cloned())
    }

    pub async fn approve(&mut self, user_code: &str, user_id: &str) -> Result<bool, StoreError> {
        self.decide(user_code, DeviceDecision::Approved {
            user_id: user_id.to_string(),
        })
        .await
    }

    pub async fn deny(&mut self, user_code: &str) -> Result<bool, StoreError> {
        self.decide(user_code, DeviceDecision::Denied).await
    }

    async fn decide(&mut self, user_code: &str, decision: DeviceDecision) -> Result<bool, StoreError> {
        let now = Utc::now();
        let state = self.state().await?;
        let Some(device_code) = state.user_codes.get(&normalize_user_code(user_code)).cloned()
        else {
            return Ok(false);
        };
        let Some(authorization) = state.pending.get_mut(&device_code) else {
            return Ok(false);
        };
        if authorization.is_expired(now) || authorization.decision != DeviceDecision::Pending {
            return Ok(false);
        }
        authorization.decision = decision;
        self.persist().await?;
        Ok(true)
    }

    /// Token-endpoint poll. An approved grant is consumed by the first
    /// successful poll.
    pub async fn poll(
        &mut self,
        device_code: &str,
        client_id: &str,
    ) -> Result<DevicePoll, StoreError> {
        let now = Utc::now();
        let state = self.state().await?;
        let Some(authorization) = state.pending.get_mut(device_code) else {
            return Ok(DevicePoll::Expired);
        };
        if authorization.client_id != client_id {
            return Ok(DevicePoll::Expired);
        }
        if authorization.is_expired(now) {
            let user_code = authorization.user_code.clone();
            state.pending.remove(device_code);
            state.user_codes.remove(&user_code);
            self.persist().await?;
            return Ok(DevicePoll::Expired);
        }
        let interval = Duration::seconds(authorization.interval_sec as i64);
        if let Some(last) = authorization.last_polled_at {
            if now - last < interval {
                authorization.last_polled_at = Some(now);
                self.persist().await?;
                return Ok(DevicePoll::SlowDown);
            }
        }
        authorization.last_polled_at = Some(now);
        match authorization.decision.clone() {
            DeviceDecision::Pending => {
                self.persist().await?;
                Ok(DevicePoll::Pending)
            }
            DeviceDecision::Denied => {
                let user_code = authorization.user_code.clone();
                let state = self.state.as_mut().expect("state loaded");
                state.pending.remove(device_code);
                state.user_codes.remove(&user_code);
                self.persist().await?;
                Ok(DevicePoll::Denied)
            }
            DeviceDecision::Approved { .. } => {
                let consumed = authorization.clone();
                let user_code = authorization.user_code.clone();
                let state = self.state.as_mut().expect("state loaded");
                state.pending.remove(device_code);
                state.user_codes.remove(&user_code);
                self.persist().await?;
                Ok(DevicePoll::Approved(consumed))
            }
        }
    }
}

fn normalize_user_code(input: &str) -> String {
    input
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

fn generate_user_code() -> String {
    let raw = router::random_token(8);
    let mapped: String = raw
        .bytes()
        .map(|b| USER_CODE_ALPHABET[(b as usize) % USER_CODE_ALPHABET.len()] as char)
        .collect();
    mapped
}

#[async_trait::async_trait]
impl Sweep for DeviceCodeStore {
    async fn sweep(&mut self, now: DateTime<Utc>) -> usize {
        let Ok(state) = self.state().await else {
            return 0;
        };
        let expired: Vec<(String, String)> = state
            .pending
            .values()
            .filter(|a| a.is_expired(now))
            .map(|a| (a.device_code.clone(), a.user_code.clone()))
            .collect();
        for (device_code, user_code) in &expired {
            state.pending.remove(device_code);
            state.user_codes.remove(user_code);
        }
        if !expired.is_empty() {
            if let Err(err) = self.persist().await {
                tracing::error!(error = %err, "device code sweep persist failed");
            }
        }
        expired.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use authrim_store::{ActorHost, MemoryStorage};
    use std::sync::Arc;

    async fn store() -> tokio::sync::OwnedMutexGuard<DeviceCodeStore> {
        let host = ActorHost::<DeviceCodeStore>::new(Arc::new(MemoryStorage::new()));
        host.lease("tenant:t:device").await
    }

    #[tokio::test]
    async fn approve_then_poll_consumes_the_grant() {
        let mut store = store().await;
        let auth = store.create("c1", "openid", 600, 0).await.unwrap();

        assert!(matches!(
            store.poll(&auth.device_code, "c1").await.unwrap(),
            DevicePoll::Pending
        ));
        assert!(store.approve(&auth.user_code, "u1").await.unwrap());

        match store.poll(&auth.device_code, "c1").await.unwrap() {
            DevicePoll::Approved(approved) => {
                assert_eq!(approved.decision, DeviceDecision::Approved {
                    user_id: "u1".to_string()
                });
            }
            other => panic!("expected approval, got {other:?}"),
        }
        // Consumed: polling again behaves as unknown/expired.
        assert!(matches!(
            store.poll(&auth.device_code, "c1").await.unwrap(),
            DevicePoll::Expired
        ));
    }

    #[tokio::test]
    async fn fast_polling_is_throttled() {
        let mut store = store().await;
        let auth = store.create("c1", "openid", 600, 5).await.unwrap();
        assert!(matches!(
            store.poll(&auth.device_code, "c1").await.unwrap(),
            DevicePoll::Pending
        ));
        assert!(matches!(
            store.poll(&auth.device_code, "c1").await.unwrap(),
            DevicePoll::SlowDown
        ));
    }

    #[tokio::test]
    async fn denial_is_terminal() {
        let mut store = store().await;
        let auth = store.create("c1", "openid", 600, 0).await.unwrap();
        assert!(store.deny(&auth.user_code).await.unwrap());
        assert!(matches!(
            store.poll(&auth.device_code, "c1").await.unwrap(),
            DevicePoll::Denied
        ));
        // A decision cannot be changed afterwards.
        assert!(!store.approve(&auth.user_code, "u1").await.unwrap());
    }

    #[tokio::test]
    async fn user_code_entry_is_normalized() {
        let mut store = store().await;
        let auth = store.create("c1", "openid", 600, 0).await.unwrap();
        let sloppy = format!(
            " {}-{} ",
            &auth.user_code[..4].to_lowercase(),
            &auth.user_code[4..]
        );
        assert!(store.find_by_user_code(&sloppy).await.unwrap().is_some());
    }
}
