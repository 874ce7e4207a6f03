//! Operator endpoints: shard-configuration changes and signing-key
//! rotation. Guarded by the configured admin bearer key (compared in
//! constant time) and run under the longer admin deadline.

use crate::error::OAuthError;
use crate::handlers::bearer_token;
use crate::{with_deadline, AppState};
use authrim_audit::{SecurityEvent, SecurityEventKind};
use authrim_core::models::ShardConfig;
use authrim_store::router;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use chrono::Utc;
use constant_time_eq::constant_time_eq;
use secrecy::ExposeSecret;
use serde::Deserialize;
use serde_json::{json, Value};

fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<(), OAuthError> {
    let Some(expected) = state.config.admin.api_key.as_ref() else {
        // No key configured: the admin surface is closed.
        return Err(OAuthError::InvalidClient);
    };
    let Some(presented) = bearer_token(headers) else {
        return Err(OAuthError::InvalidClient);
    };
    if constant_time_eq(presented.as_bytes(), expected.expose_secret().as_bytes()) {
        Ok(())
    } else {
        Err(OAuthError::InvalidClient)
    }
}

#[derive(Debug, Deserialize)]
pub struct ShardConfigUpdate {
    pub shard_count: u32,
}

/// Bump the refresh-token shard count. The outgoing generation is retained
/// so already-issued tokens keep routing by their embedded generation.
pub async fn update_shard_config(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(update): Json<ShardConfigUpdate>,
) -> Result<Json<ShardConfig>, OAuthError> {
    require_admin(&state, &headers)?;

    let instance = router::shard_config_instance(state.tenant());
    let updated = with_deadline(state.config.deadlines.admin_sec, async {
        let mut store = state.shard_configs.lease(&instance).await;
        store
            .set_shard_count(update.shard_count, Utc::now())
            .await
            .map_err(OAuthError::from)
    })
    .await?;
    // Readers go through the snapshot cache; drop it so new issuance picks
    // up the new generation without waiting out the TTL.
    state.shard_cache.invalidate().await;

    state.audit.emit(
        SecurityEvent::new(SecurityEventKind::ShardConfigChanged, state.tenant()).with_detail(
            json!({
                "generation": updated.current_generation,
                "shard_count": updated.current_shard_count,
            }),
        ),
    );
    Ok(Json(updated))
}

#[derive(Debug, Deserialize)]
pub struct KeyRotationRequest {
    #[serde(default)]
    pub emergency: bool,
    pub reason: Option<String>,
}

/// Rotate the tenant's signing key. Emergency rotation additionally marks
/// every other key compromised so in-flight tokens fail verification.
pub async fn rotate_signing_key(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<KeyRotationRequest>,
) -> Result<Json<Value>, OAuthError> {
    require_admin(&state, &headers)?;

    let policy = state.key_policy();
    let instance = router::key_manager_instance(state.tenant());
    let kid = with_deadline(state.config.deadlines.admin_sec, async {
        let mut keys = state.key_managers.lease(&instance).await;
        if request.emergency {
            keys.rotate_emergency(
                &policy,
                Utc::now(),
                request.reason.as_deref().unwrap_or("unspecified"),
            )
            .await
            .map_err(OAuthError::from)
        } else {
            keys.rotate(&policy, Utc::now()).await.map_err(OAuthError::from)
        }
    })
    .await?;

    let kind = if request.emergency {
        SecurityEventKind::EmergencyKeyRotation
    } else {
        SecurityEventKind::KeyRotated
    };
    state
        .audit
        .emit(SecurityEvent::new(kind, state.tenant()).with_resource(&kid));
    Ok(Json(json!({ "kid": kid })))
}
