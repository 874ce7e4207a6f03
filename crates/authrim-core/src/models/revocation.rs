//! Token-revocation list entry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kept until the original token would have expired anyway, so lookups are
/// false-negative-free for the token's whole lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevokedToken {
    pub jti: String,
    pub reason: String,
    pub revoked_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}
