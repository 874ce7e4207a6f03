//! Device-authorization grant state (RFC 8628).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DeviceDecision {
    Pending,
    Approved { user_id: String },
    Denied,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceAuthorization {
    pub device_code: String,
    /// Short human-enterable code, e.g. `BCDF-GHJK`.
    pub user_code: String,
    pub client_id: String,
    pub scope: String,
    pub decision: DeviceDecision,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub interval_sec: u64,
    pub last_polled_at: Option<DateTime<Utc>>,
}

impl DeviceAuthorization {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}
