//! Session model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Authentication context captured at login and carried into tokens.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionData {
    /// When the user actually authenticated (not when the session record
    /// was created or extended).
    pub auth_time: Option<DateTime<Utc>>,
    pub amr: Vec<String>,
    pub acr: Option<String>,
    pub device_name: Option<String>,
    pub ip: Option<String>,
    pub ua: Option<String>,
    /// Scope granted per client through the consent flow.
    #[serde(default)]
    pub consented: HashMap<String, String>,
}

/// A user session, bound to exactly one shard by its id prefix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// `{shard}_session_{uuid}`.
    pub id: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub data: SessionData,
}

impl Session {
    /// `expiresAt == now` counts as expired.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Whether every requested scope token was previously consented for
    /// this client.
    pub fn has_consent(&self, client_id: &str, scope: &str) -> bool {
        match self.data.consented.get(client_id) {
            Some(granted) => {
                let granted: std::collections::HashSet<&str> = granted.split(' ').collect();
                scope.split(' ').all(|s| s.is_empty() || granted.contains(s))
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn expiry_boundary_is_exclusive() {
        let now = Utc::now();
        let session = Session {
            id: "1_session_x".to_string(),
            user_id: "u1".to_string(),
            created_at: now - Duration::hours(1),
            expires_at: now,
            data: SessionData::default(),
        };
        assert!(session.is_expired(now));
        assert!(!session.is_expired(now - Duration::seconds(1)));
    }

    #[test]
    fn consent_requires_every_scope() {
        let mut session = Session {
            id: "1_session_x".to_string(),
            user_id: "u1".to_string(),
            created_at: Utc::now(),
            expires_at: Utc::now(),
            data: SessionData::default(),
        };
        session
            .data
            .consented
            .insert("c1".to_string(), "openid profile".to_string());
        assert!(session.has_consent("c1", "openid"));
        assert!(session.has_consent("c1", "openid profile"));
        assert!(!session.has_consent("c1", "openid email"));
        assert!(!session.has_consent("c2", "openid"));
    }
}
