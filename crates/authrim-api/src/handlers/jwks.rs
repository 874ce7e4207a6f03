//! Published signing keys (`/.well-known/jwks.json`).

use crate::error::OAuthError;
use crate::AppState;
use authrim_crypto::JwkSet;
use authrim_store::router;
use axum::extract::State;
use axum::Json;

pub async fn jwks(State(state): State<AppState>) -> Result<Json<JwkSet>, OAuthError> {
    let policy = state.key_policy();
    let instance = router::key_manager_instance(state.tenant());
    let mut keys = state.key_managers.lease(&instance).await;
    Ok(Json(keys.jwks(&policy).await?))
}
