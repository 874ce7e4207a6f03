//! Refresh-token family.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The unit of theft invalidation. All rotations of one refresh token
/// belong to one family; observing any superseded jti revokes the whole
/// family.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenFamily {
    pub id: String,
    pub current_jti: String,
    /// Most recent first, trimmed to a fixed depth.
    pub previous_jtis: Vec<String>,
    /// Strictly increasing across legitimate rotations, starts at 0.
    pub version: u64,
    pub user_id: String,
    pub client_id: String,
    /// Frozen at creation; rotation may narrow but never widen.
    pub allowed_scope: String,
    pub session_id: String,
    /// When the user authenticated for the grant this family came from;
    /// carried into ID tokens issued on refresh.
    pub auth_time: DateTime<Utc>,
    /// Shard-config generation pinned at creation; every jti this family
    /// issues embeds it.
    pub generation: u32,
    pub shard: u32,
    pub created_at: DateTime<Utc>,
    pub last_rotation: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl TokenFamily {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Set-containment check on space-separated scope strings.
    pub fn scope_permits(&self, requested: &str) -> bool {
        let allowed: std::collections::HashSet<&str> =
            self.allowed_scope.split(' ').filter(|s| !s.is_empty()).collect();
        requested
            .split(' ')
            .filter(|s| !s.is_empty())
            .all(|s| allowed.contains(s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(scope: &str) -> TokenFamily {
        TokenFamily {
            id: "f1".to_string(),
            current_jti: "v1_0_a".to_string(),
            previous_jtis: vec![],
            version: 0,
            user_id: "u1".to_string(),
            client_id: "c1".to_string(),
            allowed_scope: scope.to_string(),
            session_id: "1_session_x".to_string(),
            auth_time: Utc::now(),
            generation: 1,
            shard: 0,
            created_at: Utc::now(),
            last_rotation: Utc::now(),
            expires_at: Utc::now(),
        }
    }

    #[test]
    fn scope_narrowing_is_permitted_widening_is_not() {
        let family = family("openid profile email");
        assert!(family.scope_permits("openid"));
        assert!(family.scope_permits("openid profile email"));
        assert!(family.scope_permits(""));
        assert!(!family.scope_permits("openid admin"));
    }
}
