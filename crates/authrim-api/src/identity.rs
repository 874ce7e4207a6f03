//! External identity collaborators: the RBAC resolver and the PII profile
//! store. Both sit behind traits; production deployments plug in their
//! relational backends, tests and development use the in-memory forms.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default)]
pub struct UserAuthorization {
    pub roles: Vec<String>,
    pub permissions: Vec<String>,
}

#[async_trait]
pub trait PermissionProvider: Send + Sync {
    async fn authorization_for(&self, user_id: &str) -> Result<UserAuthorization, String>;
}

/// In-memory RBAC assignments.
#[derive(Default)]
pub struct StaticPermissionProvider {
    entries: DashMap<String, UserAuthorization>,
}

impl StaticPermissionProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn assign(&self, user_id: &str, roles: Vec<String>, permissions: Vec<String>) {
        self.entries
            .insert(user_id.to_string(), UserAuthorization { roles, permissions });
    }
}

#[async_trait]
impl PermissionProvider for StaticPermissionProvider {
    async fn authorization_for(&self, user_id: &str) -> Result<UserAuthorization, String> {
        Ok(self
            .entries
            .get(user_id)
            .map(|e| e.clone())
            .unwrap_or_default())
    }
}

/// Claims the userinfo endpoint can release, gated by scope.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserProfile {
    pub name: Option<String>,
    pub given_name: Option<String>,
    pub family_name: Option<String>,
    pub email: Option<String>,
    pub email_verified: Option<bool>,
    pub phone_number: Option<String>,
    pub picture: Option<String>,
    pub locale: Option<String>,
}

#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn profile(&self, user_id: &str) -> Result<Option<UserProfile>, String>;
}

#[derive(Default)]
pub struct InMemoryProfileStore {
    profiles: DashMap<String, UserProfile>,
}

impl InMemoryProfileStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, user_id: &str, profile: UserProfile) {
        self.profiles.insert(user_id.to_string(), profile);
    }
}

#[async_trait]
impl ProfileStore for InMemoryProfileStore {
    async fn profile(&self, user_id: &str) -> Result<Option<UserProfile>, String> {
        Ok(self.profiles.get(user_id).map(|p| p.clone()))
    }
}
