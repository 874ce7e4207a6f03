//! Core configuration structures

use secrecy::Secret;
use serde::{Deserialize, Serialize};
use validator::Validate;

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CoreConfig {
    pub server: ServerConfig,
    pub issuer: IssuerConfig,
    pub storage: StorageConfig,
    #[validate(nested)]
    pub sharding: ShardingConfig,
    pub tokens: TokenTtlConfig,
    #[validate(nested)]
    pub keys: KeyLifecycleConfig,
    pub rate_limit: RateLimitConfig,
    pub cache: CacheConfig,
    pub deadlines: DeadlineConfig,
    pub rbac: RbacConfig,
    pub ui: UiConfig,
    pub admin: AdminConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ServerConfig {
    #[validate(range(min = 1, max = 65535))]
    pub port: u16,
    pub host: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssuerConfig {
    /// Included verbatim in all tokens and in the discovery document.
    pub issuer_url: String,
    /// Default tenant for single-tenant deployments.
    pub default_tenant: String,
    /// Salt for pairwise subject derivation.
    #[serde(skip_serializing, default = "default_pairwise_salt")]
    pub pairwise_salt: Secret<String>,
}

fn default_pairwise_salt() -> Secret<String> {
    Secret::new("dev-pairwise-salt".to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Path for the sqlite backend; ignored for memory.
    pub sqlite_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ShardingConfig {
    /// Default shard count for sessions.
    #[validate(range(min = 1, max = 4096))]
    pub session_shard_count: u32,
    /// Default per-client refresh-token shard count.
    #[validate(range(min = 1, max = 4096))]
    pub refresh_token_default_shard_count: u32,
    /// Shard count for per-IP rate-limit counters.
    #[validate(range(min = 1, max = 4096))]
    pub rate_limit_shard_count: u32,
    /// Cache TTL for shard-config snapshot lookups, in milliseconds.
    pub refresh_token_shard_cache_ttl_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenTtlConfig {
    /// Authorization-code lifetime. Codes are never issued for longer than 60 s.
    pub auth_code_ttl_sec: u64,
    pub access_token_ttl_sec: u64,
    pub refresh_token_ttl_sec: u64,
    pub id_token_ttl_sec: u64,
    pub session_ttl_sec: u64,
    pub dpop_jti_ttl_sec: u64,
    /// TTL for staged PAR requests.
    pub par_request_ttl_sec: u64,
    pub device_code_ttl_sec: u64,
    /// Minimum poll interval for the device grant, in seconds.
    pub device_poll_interval_sec: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct KeyLifecycleConfig {
    #[validate(range(min = 1, max = 365))]
    pub key_rotation_interval_days: u32,
    /// How long retired keys stay in the JWKS for verification.
    #[validate(range(min = 1, max = 365))]
    pub key_retention_days: u32,
    /// "RS256" or "ES256".
    pub signing_algorithm: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub rate_limit_window_sec: u64,
    pub rate_limit_max_requests: u32,
    /// Per-shard entry cap; exceeding it triggers an expired-entry cleanup.
    pub max_tracked_keys: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub redis_url: Option<String>,
    pub client_cache_ttl_sec: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadlineConfig {
    /// Deadline for user-facing actor calls, in seconds.
    pub user_facing_sec: u64,
    /// Deadline for admin-path actor calls, in seconds.
    pub admin_sec: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RbacConfig {
    /// Whitelist of RBAC claims allowed into ID tokens.
    pub rbac_id_token_claims: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UiConfig {
    /// Where the authorize endpoint sends unauthenticated users.
    pub login_url: String,
    /// Where the authorize endpoint sends users for interactive consent.
    pub consent_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminConfig {
    /// Bearer key for the admin endpoints (shard-config updates, key
    /// rotation). The endpoints answer 401 until a key is configured.
    #[serde(skip_serializing, default)]
    pub api_key: Option<Secret<String>>,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                port: 8787,
                host: "0.0.0.0".to_string(),
            },
            issuer: IssuerConfig {
                issuer_url: "http://localhost:8787".to_string(),
                default_tenant: "default".to_string(),
                pairwise_salt: Secret::new("dev-pairwise-salt".to_string()),
            },
            storage: StorageConfig {
                backend: StorageBackend::Memory,
                sqlite_path: None,
            },
            sharding: ShardingConfig {
                session_shard_count: 32,
                refresh_token_default_shard_count: 8,
                rate_limit_shard_count: 8,
                refresh_token_shard_cache_ttl_ms: 10_000,
            },
            tokens: TokenTtlConfig {
                auth_code_ttl_sec: 60,
                access_token_ttl_sec: 3600,
                refresh_token_ttl_sec: 30 * 24 * 3600,
                id_token_ttl_sec: 3600,
                session_ttl_sec: 8 * 3600,
                dpop_jti_ttl_sec: 3600,
                par_request_ttl_sec: 90,
                device_code_ttl_sec: 600,
                device_poll_interval_sec: 5,
            },
            keys: KeyLifecycleConfig {
                key_rotation_interval_days: 30,
                key_retention_days: 7,
                signing_algorithm: "RS256".to_string(),
            },
            rate_limit: RateLimitConfig {
                rate_limit_window_sec: 60,
                rate_limit_max_requests: 120,
                max_tracked_keys: 10_000,
            },
            cache: CacheConfig {
                redis_url: None,
                client_cache_ttl_sec: 60,
            },
            deadlines: DeadlineConfig {
                user_facing_sec: 5,
                admin_sec: 30,
            },
            rbac: RbacConfig {
                rbac_id_token_claims: vec!["roles".to_string(), "authrim_permissions".to_string()],
            },
            ui: UiConfig {
                login_url: "/login".to_string(),
                consent_url: "/consent".to_string(),
            },
            admin: AdminConfig { api_key: None },
        }
    }
}

impl TokenTtlConfig {
    /// Authorization codes are capped at 60 seconds regardless of configuration.
    pub fn effective_auth_code_ttl_sec(&self) -> u64 {
        self.auth_code_ttl_sec.min(60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = CoreConfig::default();
        assert_eq!(config.sharding.session_shard_count, 32);
        assert_eq!(config.sharding.refresh_token_default_shard_count, 8);
        assert_eq!(config.sharding.refresh_token_shard_cache_ttl_ms, 10_000);
        assert_eq!(config.tokens.auth_code_ttl_sec, 60);
        assert_eq!(config.tokens.dpop_jti_ttl_sec, 3600);
    }

    #[test]
    fn auth_code_ttl_is_capped() {
        let mut config = CoreConfig::default();
        config.tokens.auth_code_ttl_sec = 300;
        assert_eq!(config.tokens.effective_auth_code_ttl_sec(), 60);
    }

    #[test]
    fn validation_rejects_zero_shards() {
        use validator::Validate;
        let mut config = CoreConfig::default();
        config.sharding.session_shard_count = 0;
        assert!(config.validate().is_err());
    }
}
