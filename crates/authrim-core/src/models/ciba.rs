//! Client-initiated backchannel authentication request state (OIDC CIBA).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum CibaDecision {
    Pending,
    Approved { user_id: String },
    Denied,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CibaRequest {
    pub auth_req_id: String,
    pub client_id: String,
    pub scope: String,
    pub login_hint: String,
    pub binding_message: Option<String>,
    pub decision: CibaDecision,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub interval_sec: u64,
    pub last_polled_at: Option<DateTime<Utc>>,
}

impl CibaRequest {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}
