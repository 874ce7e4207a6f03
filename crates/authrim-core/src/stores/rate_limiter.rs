//! Per-IP rate-limit counters, sharded by `FNV-1a(ip) % RATE_SHARD_COUNT`.
//!
//! Fixed-window counting: the first request in a window sets its start,
//! every request increments, and the decision carries enough for a proper
//! `429` (`Retry-After`, reset time). A cap on tracked keys bounds the
//! per-actor map; exceeding it triggers an expired-entry cleanup.

use crate::error::StoreError;
use authrim_store::{Actor, ActorContext, Sweep};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

const STATE_KEY: &str = "state";
const STATE_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy)]
pub struct RateLimitPolicy {
    pub window_sec: u64,
    pub max_requests: u32,
    pub max_tracked_keys: usize,
}

#[derive(Debug, Clone)]
pub struct RateDecision {
    pub allowed: bool,
    pub current: u32,
    pub limit: u32,
    pub reset_at: DateTime<Utc>,
    /// Present only when the request was denied.
    pub retry_after_sec: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WindowCounter {
    window_start: DateTime<Utc>,
    count: u32,
}

#[derive(Default, Serialize, Deserialize)]
struct RateCounterState {
    version: u32,
    windows: HashMap<String, WindowCounter>,
}

pub struct RateCounterShard {
    ctx: ActorContext,
    state: Option<RateCounterState>,
}

impl Actor for RateCounterShard {
    fn attach(ctx: ActorContext) -> Self {
        Self { ctx, state: None }
    }
}

impl RateCounterShard {
    async fn state(&mut self) -> Result<&mut RateCounterState, StoreError> {
        if self.state.is_none() {
            let state = match self.ctx.read(STATE_KEY).await? {
                Some(blob) => serde_json::from_slice(&blob)
                    .map_err(|e| StoreError::StateDecode(e.to_string()))?,
                None => RateCounterState {
                    version: STATE_VERSION,
                    windows: HashMap::new(),
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

    pub async fn increment(
        &mut self,
        client_ip: &str,
        policy: RateLimitPolicy,
    ) -> Result<RateDecision, StoreError> {
        let now = Utc::now();
        let window = Duration::seconds(policy.window_sec as i64);
        let state = self.state().await?;

        if state.windows.len() >= policy.max_tracked_keys
            && !state.windows.contains_key(client_ip)
        {
            state
                .windows
                .retain(|_, counter| counter.window_start + window > now);
        }

        let counter = state
            .windows
            .entry(client_ip.to_string())
            .or_insert(WindowCounter {
                window_start: now,
                count: 0,
            });
        if counter.window_start + window <= now {
            counter.window_start = now;
            counter.count = 0;
        }
        counter.count += 1;

        let reset_at = counter.window_start + window;
        let decision = if counter.count > policy.max_requests {
            RateDecision {
                allowed: false,
                current: counter.count,
                limit: policy.max_requests,
                reset_at,
                retry_after_sec: Some((reset_at - now).num_seconds().max(1) as u64),
            }
        } else {
            RateDecision {
                allowed: true,
                current: counter.count,
                limit: policy.max_requests,
                reset_at,
                retry_after_sec: None,
            }
        };
        self.persist().await?;
        Ok(decision)
    }
}

#[async_trait::async_trait]
impl Sweep for RateCounterShard {
    async fn sweep(&mut self, now: DateTime<Utc>) -> usize {
        let Ok(state) = self.state().await else {
            return 0;
        };
        // Windows are short; anything older than an hour is stale no
        // matter the policy in force when it was created.
        let cutoff = now - Duration::hours(1);
        let before = state.windows.len();
        state.windows.retain(|_, c| c.window_start > cutoff);
        let removed = before - state.windows.len();
        if removed > 0 {
            if let Err(err) = self.persist().await {
                tracing::error!(error = %err, "rate counter sweep persist failed");
            }
        }
        removed
    }
}
