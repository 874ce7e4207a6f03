//! Protocol endpoint layer: stateless axum handlers over the state-store
//! actors.

use authrim_audit::AuditLogger;
use authrim_cache::Cache;
use authrim_config::CoreConfig;
use authrim_core::stores::{
    AuthCodeStore, ChallengeStore, CibaStore, DeviceCodeStore, DpopJtiStore, RateCounterShard,
    RefreshRotator, RevocationStore, SessionShard, ShardConfigStore,
};
use authrim_crypto::{KeyManager, KeyPolicy, SigningAlgorithm};
use authrim_store::ActorHost;
use std::sync::Arc;

pub mod client_auth;
pub mod clients;
pub mod error;
pub mod handlers;
pub mod identity;
pub mod middleware;
pub mod router;
pub mod snapshot;
pub mod tokens;

pub use error::OAuthError;
pub use router::app;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<CoreConfig>,

    // Actor hosts; every request resolves its instance by name.
    pub sessions: Arc<ActorHost<SessionShard>>,
    pub auth_codes: Arc<ActorHost<AuthCodeStore>>,
    pub rotators: Arc<ActorHost<RefreshRotator>>,
    pub challenges: Arc<ActorHost<ChallengeStore>>,
    pub dpop_jtis: Arc<ActorHost<DpopJtiStore>>,
    pub revocations: Arc<ActorHost<RevocationStore>>,
    pub rate_counters: Arc<ActorHost<RateCounterShard>>,
    pub device_codes: Arc<ActorHost<DeviceCodeStore>>,
    pub ciba_requests: Arc<ActorHost<CibaStore>>,
    pub shard_configs: Arc<ActorHost<ShardConfigStore>>,
    pub key_managers: Arc<ActorHost<KeyManager>>,

    pub clients: Arc<clients::ClientRegistry>,
    pub shard_cache: Arc<snapshot::ShardConfigCache>,
    pub permissions: Arc<dyn identity::PermissionProvider>,
    pub profiles: Arc<dyn identity::ProfileStore>,
    pub audit: AuditLogger,
    pub cache: Arc<dyn Cache>,
    pub http: reqwest::Client,
}

impl AppState {
    /// Wire the full state graph over a storage backend. Spawns the audit
    /// worker; expiry sweepers are the binary's concern.
    pub fn build(config: CoreConfig, storage: Arc<dyn authrim_store::Storage>) -> Self {
        let config = Arc::new(config);
        let cache: Arc<dyn Cache> = Arc::new(
            authrim_cache::MultiLevelCache::new(config.cache.redis_url.as_deref())
                .unwrap_or_else(|err| {
                    tracing::error!(error = %err, "redis unavailable, in-process cache only");
                    authrim_cache::MultiLevelCache::new(None).expect("in-process cache")
                }),
        );
        let clients = Arc::new(clients::ClientRegistry::new(
            cache.clone(),
            std::time::Duration::from_secs(config.cache.client_cache_ttl_sec),
        ));
        let (audit, worker, _dead_letter) = authrim_audit::AuditWorker::channel(
            1024,
            Arc::new(authrim_audit::TracingSink),
        );
        tokio::spawn(worker.run());

        Self {
            sessions: ActorHost::new(storage.clone()),
            auth_codes: ActorHost::new(storage.clone()),
            rotators: ActorHost::new(storage.clone()),
            challenges: ActorHost::new(storage.clone()),
            dpop_jtis: ActorHost::new(storage.clone()),
            revocations: ActorHost::new(storage.clone()),
            rate_counters: ActorHost::new(storage.clone()),
            device_codes: ActorHost::new(storage.clone()),
            ciba_requests: ActorHost::new(storage.clone()),
            shard_configs: ActorHost::new(storage.clone()),
            key_managers: ActorHost::new(storage),
            clients,
            shard_cache: Arc::new(snapshot::ShardConfigCache::new(
                config.sharding.refresh_token_shard_cache_ttl_ms,
            )),
            permissions: Arc::new(identity::StaticPermissionProvider::new()),
            profiles: Arc::new(identity::InMemoryProfileStore::new()),
            audit,
            cache,
            http: reqwest::Client::new(),
            config,
        }
    }

    /// The tenant for this deployment. Instance names are tenant-scoped
    /// throughout, so multi-tenant hosting is a routing concern above this
    /// layer.
    pub fn tenant(&self) -> &str {
        &self.config.issuer.default_tenant
    }

    pub fn issuer(&self) -> &str {
        &self.config.issuer.issuer_url
    }

    pub fn key_policy(&self) -> KeyPolicy {
        KeyPolicy {
            algorithm: SigningAlgorithm::parse(&self.config.keys.signing_algorithm)
                .unwrap_or(SigningAlgorithm::RS256),
            rotation_interval_days: self.config.keys.key_rotation_interval_days,
            retention_days: self.config.keys.key_retention_days,
        }
    }
}

/// Actor calls on user-facing paths run under a deadline; a timeout is an
/// unknown outcome, surfaced as `temporarily_unavailable` so clients retry
/// with their idempotency key (the code or jti itself).
pub async fn with_deadline<T, F>(seconds: u64, future: F) -> Result<T, OAuthError>
where
    F: std::future::Future<Output = Result<T, OAuthError>>,
{
    match tokio::time::timeout(std::time::Duration::from_secs(seconds), future).await {
        Ok(result) => result,
        Err(_) => Err(OAuthError::TemporarilyUnavailable),
    }
}
