//! Client registry with a best-effort metadata cache.
//!
//! The registry is the in-process source of truth for OAuth client
//! metadata; the cache tier exists for the hot authorize/token paths and
//! never holds secrets. Secret verification always goes to the registry
//! and compares in constant time.

use authrim_cache::Cache;
use authrim_store::router;
use constant_time_eq::constant_time_eq;
use dashmap::DashMap;
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubjectType {
    Public,
    Pairwise,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientAuthMethod {
    ClientSecretBasic,
    ClientSecretPost,
    None,
}

impl ClientAuthMethod {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "client_secret_basic" => Some(Self::ClientSecretBasic),
            "client_secret_post" => Some(Self::ClientSecretPost),
            "none" => Some(Self::None),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClientSecretBasic => "client_secret_basic",
            Self::ClientSecretPost => "client_secret_post",
            Self::None => "none",
        }
    }
}

/// Public metadata, safe to cache and to return from DCR.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientMetadata {
    pub client_id: String,
    pub client_name: Option<String>,
    pub redirect_uris: Vec<String>,
    pub grant_types: Vec<String>,
    pub allowed_scopes: Vec<String>,
    pub token_endpoint_auth_method: ClientAuthMethod,
    pub subject_type: SubjectType,
    pub require_consent: bool,
    pub require_pkce: bool,
    pub allow_plain_pkce: bool,
    pub allow_empty_scope: bool,
    pub backchannel_logout_uri: Option<String>,
}

impl ClientMetadata {
    pub fn redirect_uri_is_registered(&self, uri: &str) -> bool {
        self.redirect_uris.iter().any(|r| r == uri)
    }

    pub fn scope_is_allowed(&self, scope: &str) -> bool {
        let tokens: Vec<&str> = scope.split(' ').filter(|s| !s.is_empty()).collect();
        if tokens.is_empty() {
            return self.allow_empty_scope;
        }
        tokens.iter().all(|s| self.allowed_scopes.iter().any(|a| a == s))
    }

    pub fn grants(&self, grant_type: &str) -> bool {
        self.grant_types.iter().any(|g| g == grant_type)
    }
}

pub struct RegisteredClient {
    pub metadata: ClientMetadata,
    secret: Option<Secret<String>>,
}

impl RegisteredClient {
    /// Constant-time secret check; a client without a secret never matches.
    pub fn secret_matches(&self, presented: &str) -> bool {
        match &self.secret {
            Some(secret) => {
                constant_time_eq(secret.expose_secret().as_bytes(), presented.as_bytes())
            }
            None => false,
        }
    }

    pub fn is_public(&self) -> bool {
        self.metadata.token_endpoint_auth_method == ClientAuthMethod::None
    }
}

pub struct ClientRegistry {
    clients: DashMap<String, Arc<RegisteredClient>>,
    cache: Arc<dyn Cache>,
    cache_ttl: Duration,
}

impl ClientRegistry {
    pub fn new(cache: Arc<dyn Cache>, cache_ttl: Duration) -> Self {
        Self {
            clients: DashMap::new(),
            cache,
            cache_ttl,
        }
    }

    pub fn insert(&self, metadata: ClientMetadata, secret: Option<String>) {
        let client_id = metadata.client_id.clone();
        self.clients.insert(
            client_id,
            Arc::new(RegisteredClient {
                metadata,
                secret: secret.map(Secret::new),
            }),
        );
    }

    pub fn get(&self, client_id: &str) -> Option<Arc<RegisteredClient>> {
        self.clients.get(client_id).map(|c| c.clone())
    }

    /// Metadata lookup through the cache tier. Misses fall back to the
    /// registry and repopulate the cache.
    pub async fn metadata(&self, client_id: &str) -> Option<ClientMetadata> {
        let cache_key = format!("client-meta:{client_id}");
        if let Some(cached) =
            authrim_cache::get_json::<ClientMetadata>(self.cache.as_ref(), &cache_key).await
        {
            return Some(cached);
        }
        let metadata = self.get(client_id)?.metadata.clone();
        if let Err(err) =
            authrim_cache::set_json(self.cache.as_ref(), &cache_key, &metadata, self.cache_ttl)
                .await
        {
            tracing::debug!(error = %err, "client metadata cache write failed");
        }
        Some(metadata)
    }

    pub fn iter_metadata(&self) -> Vec<ClientMetadata> {
        self.clients.iter().map(|c| c.metadata.clone()).collect()
    }

    /// RFC 7591 registration: mint credentials and store the client.
    pub async fn register(&self, request: RegistrationRequest) -> (ClientMetadata, Option<String>) {
        let client_id = format!("client_{}", router::random_token(16));
        let auth_method = request
            .token_endpoint_auth_method
            .as_deref()
            .and_then(ClientAuthMethod::parse)
            .unwrap_or(ClientAuthMethod::ClientSecretBasic);
        let secret = match auth_method {
            ClientAuthMethod::None => None,
            _ => Some(router::random_token(48)),
        };
        let subject_type = match request.subject_type.as_deref() {
            Some("pairwise") => SubjectType::Pairwise,
            _ => SubjectType::Public,
        };
        let metadata = ClientMetadata {
            client_id,
            client_name: request.client_name,
            redirect_uris: request.redirect_uris,
            grant_types: request
                .grant_types
                .unwrap_or_else(|| vec!["authorization_code".to_string(), "refresh_token".to_string()]),
            allowed_scopes: request
                .scope
                .map(|s| s.split(' ').map(str::to_string).collect())
                .unwrap_or_else(|| vec!["openid".to_string(), "profile".to_string(), "email".to_string(), "offline_access".to_string()]),
            token_endpoint_auth_method: auth_method,
            subject_type,
            require_consent: true,
            // Public clients must use PKCE.
            require_pkce: auth_method == ClientAuthMethod::None,
            allow_plain_pkce: false,
            allow_empty_scope: false,
            backchannel_logout_uri: request.backchannel_logout_uri,
        };
        self.insert(metadata.clone(), secret.clone());
        // Invalidate any stale cached metadata under this id.
        let _ = self
            .cache
            .delete(&format!("client-meta:{}", metadata.client_id))
            .await;
        (metadata, secret)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegistrationRequest {
    pub redirect_uris: Vec<String>,
    pub client_name: Option<String>,
    pub grant_types: Option<Vec<String>>,
    pub scope: Option<String>,
    pub token_endpoint_auth_method: Option<String>,
    pub subject_type: Option<String>,
    pub backchannel_logout_uri: Option<String>,
}
