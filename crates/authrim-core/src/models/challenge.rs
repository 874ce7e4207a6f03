//! One-time challenges.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Every short-lived single-use artifact that is not a code or a token:
/// staged PAR requests, magic links, passkey challenges, opaque session
/// tokens, consent tickets, logout tickets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChallengeKind {
    Par,
    MagicLink,
    Passkey,
    SessionToken,
    Consent,
    Logout,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Challenge {
    pub id: String,
    pub kind: ChallengeKind,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub consumed: bool,
}

impl Challenge {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}
