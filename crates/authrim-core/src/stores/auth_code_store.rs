//! One-time authorization codes with PKCE verification.
//!
//! A code is consumable exactly once. Consumed records are retained until
//! their sweep window so a second consume is recognizable as replay, and
//! they remember which refresh families were minted from them; that list
//! is what the replay cascade revokes.

use crate::error::StoreError;
use crate::models::{AuthCodeRecord, DerivedFamilyRef};
use authrim_crypto::pkce;
use authrim_store::{Actor, ActorContext, Sweep};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

const STATE_KEY: &str = "state";
const STATE_VERSION: u32 = 1;
/// Consumed records stay around this long past expiry for replay detection.
const CONSUMED_RETENTION_SEC: i64 = 600;
const MAX_CODE_LEN: usize = 4096;

#[derive(Default, Serialize, Deserialize)]
struct AuthCodeState {
    version: u32,
    codes: HashMap<String, AuthCodeRecord>,
}

pub struct AuthCodeStore {
    ctx: ActorContext,
    state: Option<AuthCodeState>,
}

impl Actor for AuthCodeStore {
    fn attach(ctx: ActorContext) -> Self {
        Self { ctx, state: None }
    }
}

impl AuthCodeStore {
    async fn state(&mut self) -> Result<&mut AuthCodeState, StoreError> {
        if self.state.is_none() {
            let state = match self.ctx.read(STATE_KEY).await? {
                Some(blob) => serde_json::from_slice(&blob)
                    .map_err(|e| StoreError::StateDecode(e.to_string()))?,
                None => AuthCodeState {
                    version: STATE_VERSION,
                    codes: HashMap::new(),
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

    /// Fails if the code already exists, in any state.
    pub async fn store(&mut self, record: AuthCodeRecord) -> Result<(), StoreError> {
        if record.code.is_empty() || record.code.len() >= MAX_CODE_LEN {
            return Err(StoreError::invalid_grant("malformed authorization code"));
        }
        let state = self.state().await?;
        if state.codes.contains_key(&record.code) {
            return Err(StoreError::Conflict {
                message: "authorization code already exists".to_string(),
            });
        }
        state.codes.insert(record.code.clone(), record);
        self.persist().await?;
        Ok(())
    }

    /// Atomic single-use consume with PKCE verification.
    ///
    /// Exactly one consume of a given code can succeed; every later one
    /// returns `CodeReplay` carrying the families derived from the code.
    pub async fn consume(
        &mut self,
        code: &str,
        client_id: &str,
        code_verifier: Option<&str>,
    ) -> Result<AuthCodeRecord, StoreError> {
        if code.is_empty() || code.len() >= MAX_CODE_LEN {
            return Err(StoreError::invalid_grant("malformed authorization code"));
        }
        let now = Utc::now();
        let state = self.state().await?;

        let status = match state.codes.get(code) {
            None => CodeStatus::Missing,
            Some(record) if record.used => CodeStatus::Replayed {
                families: record.derived_families.clone(),
            },
            Some(record) if record.is_expired(now) => CodeStatus::Expired,
            Some(_) => CodeStatus::Live,
        };

        match status {
            CodeStatus::Missing => Err(StoreError::invalid_grant("unknown authorization code")),
            CodeStatus::Expired => {
                // Purge on access.
                let state = self.state.as_mut().expect("state loaded");
                state.codes.remove(code);
                self.persist().await?;
                Err(StoreError::invalid_grant("authorization code expired"))
            }
            CodeStatus::Replayed { families } => {
                tracing::warn!(client_id, "authorization code replay detected");
                Err(StoreError::CodeReplay {
                    derived_families: families,
                })
            }
            CodeStatus::Live => {
                let state = self.state.as_mut().expect("state loaded");
                let record = state.codes.get_mut(code).expect("checked live");
                if record.client_id != client_id {
                    return Err(StoreError::invalid_grant("client mismatch"));
                }
                if let (Some(challenge), Some(method)) =
                    (record.code_challenge.clone(), record.code_challenge_method)
                {
                    let Some(verifier) = code_verifier else {
                        return Err(StoreError::invalid_grant("code_verifier required"));
                    };
                    if !pkce::verifier_is_wellformed(verifier)
                        || !pkce::verify(&challenge, method, verifier)
                    {
                        return Err(StoreError::invalid_grant("PKCE verification failed"));
                    }
                }
                record.used = true;
                record.used_at = Some(now);
                let consumed = record.clone();
                self.persist().await?;
                Ok(consumed)
            }
        }
    }

    /// Record that a refresh family was minted from this code. Consulted on
    /// replay so the cascade can revoke every derived family.
    pub async fn link_family(
        &mut self,
        code: &str,
        family: DerivedFamilyRef,
    ) -> Result<(), StoreError> {
        let state = self.state().await?;
        if let Some(record) = state.codes.get_mut(code) {
            record.derived_families.push(family);
            self.persist().await?;
        }
        Ok(())
    }
}

enum CodeStatus {
    Missing,
    Expired,
    Replayed { families: Vec<DerivedFamilyRef> },
    Live,
}

#[async_trait::async_trait]
impl Sweep for AuthCodeStore {
    async fn sweep(&mut self, now: DateTime<Utc>) -> usize {
        let Ok(state) = self.state().await else {
            return 0;
        };
        let retention = Duration::seconds(CONSUMED_RETENTION_SEC);
        let before = state.codes.len();
        state.codes.retain(|_, record| {
            if record.used {
                // Replay evidence is kept a bit longer than the code TTL.
                record.expires_at + retention > now
            } else {
                !record.is_expired(now)
            }
        });
        let removed = before - state.codes.len();
        if removed > 0 {
            if let Err(err) = self.persist().await {
                tracing::error!(error = %err, "auth code sweep persist failed");
            }
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use authrim_crypto::pkce::CodeChallengeMethod;
    use authrim_store::{ActorHost, MemoryStorage};
    use std::sync::Arc;

    const VERIFIER: &str = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";

    fn record(code: &str, challenge: Option<&str>) -> AuthCodeRecord {
        let now = Utc::now();
        AuthCodeRecord {
            code: code.to_string(),
            client_id: "c1".to_string(),
            redirect_uri: "https://rp/cb".to_string(),
            user_id: "u1".to_string(),
            scope: "openid profile".to_string(),
            code_challenge: challenge.map(str::to_string),
            code_challenge_method: challenge.map(|_| CodeChallengeMethod::S256),
            nonce: None,
            state: Some("xyz".to_string()),
            session_id: "7_session_s".to_string(),
            auth_time: now,
            acr: None,
            amr: vec!["pwd".to_string()],
            used: false,
            used_at: None,
            created_at: now,
            expires_at: now + Duration::seconds(60),
            derived_families: vec![],
        }
    }

    async fn store() -> tokio::sync::OwnedMutexGuard<AuthCodeStore> {
        let host = ActorHost::<AuthCodeStore>::new(Arc::new(MemoryStorage::new()));
        host.lease("tenant:t:code").await
    }

    #[tokio::test]
    async fn consume_succeeds_once_then_replays() {
        let mut store = store().await;
        store.store(record("abc", None)).await.unwrap();

        let consumed = store.consume("abc", "c1", None).await.unwrap();
        assert!(consumed.used);

        let err = store.consume("abc", "c1", None).await.unwrap_err();
        assert!(matches!(err, StoreError::CodeReplay { .. }));
    }

    #[tokio::test]
    async fn replay_reports_linked_families() {
        let mut store = store().await;
        store.store(record("abc", None)).await.unwrap();
        store.consume("abc", "c1", None).await.unwrap();
        let family = DerivedFamilyRef {
            family_id: "fam-1".to_string(),
            client_id: "c1".to_string(),
            generation: 1,
            shard: 3,
        };
        store.link_family("abc", family.clone()).await.unwrap();

        match store.consume("abc", "c1", None).await.unwrap_err() {
            StoreError::CodeReplay { derived_families } => {
                assert_eq!(derived_families, vec![family]);
            }
            other => panic!("expected replay, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn pkce_is_enforced() {
        let mut store = store().await;
        let challenge = pkce::s256_challenge(VERIFIER);
        store.store(record("abc", Some(&challenge))).await.unwrap();

        // Missing verifier.
        let err = store.consume("abc", "c1", None).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidGrant { .. }));

        // Wrong verifier. The failed attempts above must not consume.
        let wrong = "a".repeat(43);
        let err = store.consume("abc", "c1", Some(&wrong)).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidGrant { .. }));

        // Correct verifier still works: failures did not mark the code used.
        store.consume("abc", "c1", Some(VERIFIER)).await.unwrap();
    }

    #[tokio::test]
    async fn client_mismatch_is_rejected_without_consuming() {
        let mut store = store().await;
        store.store(record("abc", None)).await.unwrap();
        let err = store.consume("abc", "evil", None).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidGrant { .. }));
        store.consume("abc", "c1", None).await.unwrap();
    }

    #[tokio::test]
    async fn duplicate_store_conflicts() {
        let mut store = store().await;
        store.store(record("abc", None)).await.unwrap();
        let err = store.store(record("abc", None)).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));
    }

    #[tokio::test]
    async fn expired_code_is_purged_on_access() {
        let mut store = store().await;
        let mut expired = record("abc", None);
        expired.expires_at = Utc::now() - Duration::seconds(1);
        store.store(expired).await.unwrap();

        let err = store.consume("abc", "c1", None).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidGrant { .. }));
        // Purged: a second attempt is "unknown", not "expired".
        let err = store.consume("abc", "c1", None).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidGrant { reason } if reason.contains("unknown")));
    }

    #[tokio::test]
    async fn boundary_code_lengths_are_rejected() {
        let mut store = store().await;
        assert!(store.consume("", "c1", None).await.is_err());
        let giant = "x".repeat(4096);
        assert!(store.consume(&giant, "c1", None).await.is_err());
        let mut bad = record("", None);
        bad.code = String::new();
        assert!(store.store(bad).await.is_err());
    }

    #[tokio::test]
    async fn sweep_keeps_consumed_codes_within_retention() {
        let mut store = store().await;
        store.store(record("used", None)).await.unwrap();
        store.consume("used", "c1", None).await.unwrap();
        store.store(record("fresh", None)).await.unwrap();

        // At expiry + a few seconds the consumed record must survive for
        // replay evidence; the unused one only lives to its own expiry.
        let removed = store.sweep(Utc::now() + Duration::seconds(90)).await;
        assert_eq!(removed, 1);

        let err = store.consume("used", "c1", None).await.unwrap_err();
        assert!(matches!(err, StoreError::CodeReplay { .. }));
    }
}
