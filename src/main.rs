//! Entry point for the authorization core.

use anyhow::Result;
use authrim_api::clients::{ClientAuthMethod, ClientMetadata, SubjectType};
use authrim_api::AppState;
use authrim_config::{ConfigLoader, StorageBackend};
use authrim_store::{ActorHost, MemoryStorage, SqliteStorage, Storage};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Expiry-sweep period for every store actor.
const SWEEP_PERIOD: Duration = Duration::from_secs(3600);

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "authrim=debug,authrim_api=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("starting authrim core");

    let environment =
        std::env::var("AUTHRIM__ENVIRONMENT").unwrap_or_else(|_| "development".to_string());
    let config = ConfigLoader::new("config", &environment).load()?;
    info!(environment, issuer = %config.issuer.issuer_url, "configuration loaded");

    let storage: Arc<dyn Storage> = match config.storage.backend {
        StorageBackend::Memory => {
            info!("using in-memory storage (state does not survive restart)");
            Arc::new(MemoryStorage::new())
        }
        StorageBackend::Sqlite => {
            let path = config
                .storage
                .sqlite_path
                .clone()
                .unwrap_or_else(|| "authrim.db".to_string());
            info!(path, "using sqlite storage");
            Arc::new(SqliteStorage::connect(&path).await?)
        }
    };

    let host = config.server.host.clone();
    let port = config.server.port;
    let state = AppState::build(config, storage);

    // Development convenience: a known client to drive the flows with.
    if environment != "production" {
        state.clients.insert(
            ClientMetadata {
                client_id: "dev-client".to_string(),
                client_name: Some("Development client".to_string()),
                redirect_uris: vec!["http://localhost:3000/callback".to_string()],
                grant_types: vec![
                    "authorization_code".to_string(),
                    "refresh_token".to_string(),
                    "urn:ietf:params:oauth:grant-type:device_code".to_string(),
                ],
                allowed_scopes: vec![
                    "openid".to_string(),
                    "profile".to_string(),
                    "email".to_string(),
                    "offline_access".to_string(),
                ],
                token_endpoint_auth_method: ClientAuthMethod::ClientSecretBasic,
                subject_type: SubjectType::Public,
                require_consent: false,
                require_pkce: false,
                allow_plain_pkce: false,
                allow_empty_scope: false,
                backchannel_logout_uri: None,
            },
            Some("dev-secret".to_string()),
        );
        info!("seeded dev-client (development only)");
    }

    // Expiry alarms for every store family.
    ActorHost::spawn_sweeper(&state.sessions, SWEEP_PERIOD);
    ActorHost::spawn_sweeper(&state.auth_codes, SWEEP_PERIOD);
    ActorHost::spawn_sweeper(&state.rotators, SWEEP_PERIOD);
    ActorHost::spawn_sweeper(&state.challenges, SWEEP_PERIOD);
    ActorHost::spawn_sweeper(&state.dpop_jtis, SWEEP_PERIOD);
    ActorHost::spawn_sweeper(&state.revocations, SWEEP_PERIOD);
    ActorHost::spawn_sweeper(&state.rate_counters, SWEEP_PERIOD);
    ActorHost::spawn_sweeper(&state.device_codes, SWEEP_PERIOD);
    ActorHost::spawn_sweeper(&state.ciba_requests, SWEEP_PERIOD);
    // Key rotation is alarm-driven through the same sweep.
    ActorHost::spawn_sweeper(&state.key_managers, SWEEP_PERIOD);

    let app = authrim_api::app(state);
    let listener = tokio::net::TcpListener::bind((host.as_str(), port)).await?;
    info!("listening on http://{host}:{port}");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };
    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install sigterm handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
