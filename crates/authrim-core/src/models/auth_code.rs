//! Authorization-code record.

use authrim_crypto::CodeChallengeMethod;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Routing handle for a refresh family minted from a code. Enough to reach
/// the owning rotator instance again when a replay forces the cascade.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivedFamilyRef {
    pub family_id: String,
    pub client_id: String,
    pub generation: u32,
    pub shard: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthCodeRecord {
    pub code: String,
    pub client_id: String,
    pub redirect_uri: String,
    pub user_id: String,
    pub scope: String,
    pub code_challenge: Option<String>,
    pub code_challenge_method: Option<CodeChallengeMethod>,
    pub nonce: Option<String>,
    pub state: Option<String>,
    pub session_id: String,
    pub auth_time: DateTime<Utc>,
    pub acr: Option<String>,
    pub amr: Vec<String>,
    pub used: bool,
    pub used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    /// At most 60 s after creation.
    pub expires_at: DateTime<Utc>,
    /// Refresh families minted from this code; consulted on replay so the
    /// cascade can revoke everything derived from it.
    #[serde(default)]
    pub derived_families: Vec<DerivedFamilyRef>,
}

impl AuthCodeRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}
