//! Configuration loading from files and the environment.
//!
//! Layering: defaults, then `{config_dir}/{environment}` file, then
//! `AUTHRIM__`-prefixed environment variables, then the bare operational
//! names (`SESSION_SHARD_COUNT`, `ISSUER_URL`, ...) used by deployment
//! tooling.

use crate::config::CoreConfig;
use config::{Config, Environment, File};
use thiserror::Error;
use validator::Validate;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration load failed: {0}")]
    Load(#[from] config::ConfigError),
    #[error("configuration invalid: {0}")]
    Invalid(String),
}

/// Bare environment names mapped onto their config paths. These are the
/// operational knobs; everything else goes through the `AUTHRIM__` prefix.
const ENV_ALIASES: &[(&str, &str)] = &[
    ("SESSION_SHARD_COUNT", "sharding.session_shard_count"),
    (
        "REFRESH_TOKEN_DEFAULT_SHARD_COUNT",
        "sharding.refresh_token_default_shard_count",
    ),
    (
        "REFRESH_TOKEN_SHARD_CACHE_TTL_MS",
        "sharding.refresh_token_shard_cache_ttl_ms",
    ),
    ("AUTH_CODE_TTL_SEC", "tokens.auth_code_ttl_sec"),
    ("ACCESS_TOKEN_TTL_SEC", "tokens.access_token_ttl_sec"),
    ("REFRESH_TOKEN_TTL_SEC", "tokens.refresh_token_ttl_sec"),
    ("ID_TOKEN_TTL_SEC", "tokens.id_token_ttl_sec"),
    ("DPOP_JTI_TTL_SEC", "tokens.dpop_jti_ttl_sec"),
    ("KEY_ROTATION_INTERVAL_DAYS", "keys.key_rotation_interval_days"),
    ("KEY_RETENTION_DAYS", "keys.key_retention_days"),
    ("RATE_LIMIT_WINDOW_SEC", "rate_limit.rate_limit_window_sec"),
    ("RATE_LIMIT_MAX_REQUESTS", "rate_limit.rate_limit_max_requests"),
    ("ISSUER_URL", "issuer.issuer_url"),
];

pub struct ConfigLoader {
    config_dir: String,
    environment: String,
}

impl ConfigLoader {
    pub fn new(config_dir: impl Into<String>, environment: impl Into<String>) -> Self {
        Self {
            config_dir: config_dir.into(),
            environment: environment.into(),
        }
    }

    pub fn load(&self) -> Result<CoreConfig, ConfigError> {
        let defaults = Config::try_from(&CoreConfig::default())?;

        let mut builder = Config::builder()
            .add_source(defaults)
            .add_source(
                File::with_name(&format!("{}/default", self.config_dir)).required(false),
            )
            .add_source(
                File::with_name(&format!("{}/{}", self.config_dir, self.environment))
                    .required(false),
            )
            .add_source(
                Environment::with_prefix("AUTHRIM")
                    .separator("__")
                    .try_parsing(true),
            );

        for (name, path) in ENV_ALIASES {
            if let Ok(value) = std::env::var(name) {
                builder = builder.set_override((*path).to_string(), value)?;
            }
        }
        // Comma-separated list form.
        if let Ok(value) = std::env::var("RBAC_ID_TOKEN_CLAIMS") {
            let claims: Vec<String> = value
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            builder = builder.set_override("rbac.rbac_id_token_claims", claims)?;
        }

        let config: CoreConfig = builder.build()?.try_deserialize()?;
        config
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        Ok(config)
    }

    pub fn load_from_env() -> Result<CoreConfig, ConfigError> {
        ConfigLoader::new("config", "default").load()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Tests in one binary share the process environment, so each test
    // touches a distinct variable.

    #[test]
    fn load_without_files_yields_defaults() {
        let config = ConfigLoader::new("/nonexistent", "test").load().unwrap();
        assert_eq!(config.server.port, 8787);
        assert_eq!(config.sharding.session_shard_count, 32);
    }

    #[test]
    fn bare_env_name_overrides_default() {
        std::env::set_var("AUTH_CODE_TTL_SEC", "30");
        let config = ConfigLoader::new("/nonexistent", "test").load().unwrap();
        std::env::remove_var("AUTH_CODE_TTL_SEC");
        assert_eq!(config.tokens.auth_code_ttl_sec, 30);
    }

    #[test]
    fn rbac_claims_parse_as_comma_list() {
        std::env::set_var("RBAC_ID_TOKEN_CLAIMS", "roles, authrim_permissions");
        let config = ConfigLoader::new("/nonexistent", "test").load().unwrap();
        std::env::remove_var("RBAC_ID_TOKEN_CLAIMS");
        assert_eq!(
            config.rbac.rbac_id_token_claims,
            vec!["roles".to_string(), "authrim_permissions".to_string()]
        );
    }
}
