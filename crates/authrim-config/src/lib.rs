//! Configuration for the authorization core.

pub mod config;
pub mod loader;

pub use config::{
    AdminConfig, CacheConfig, CoreConfig, DeadlineConfig, IssuerConfig, KeyLifecycleConfig,
    RateLimitConfig, RbacConfig, ServerConfig, ShardingConfig, StorageBackend, StorageConfig,
    TokenTtlConfig, UiConfig,
};
pub use loader::{ConfigError, ConfigLoader};
