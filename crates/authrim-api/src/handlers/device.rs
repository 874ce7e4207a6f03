//! Device-authorization grant surfaces (RFC 8628): the client-facing
//! authorization request and the user-facing verification endpoint.

use crate::error::OAuthError;
use crate::handlers::session_cookie;
use crate::{client_auth, AppState};
use authrim_store::router;
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::{Form, Json};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Debug, Deserialize)]
pub struct DeviceAuthorizationForm {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub scope: Option<String>,
}

#[derive(Serialize)]
pub struct DeviceAuthorizationResponse {
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    pub verification_uri_complete: String,
    pub expires_in: u64,
    pub interval: u64,
}

pub async fn device_authorization(
    State(state): State<AppState>,
    headers: HeaderMap,
    Form(form): Form<DeviceAuthorizationForm>,
) -> Result<Json<DeviceAuthorizationResponse>, OAuthError> {
    let client = client_auth::authenticate_from(
        &state,
        &headers,
        form.client_id.as_deref(),
        form.client_secret.as_deref(),
    )?;

    let scope = form.scope.clone().unwrap_or_default();
    if !client.scope_is_allowed(&scope) {
        return Err(OAuthError::InvalidScope(scope));
    }

    let ttl = state.config.tokens.device_code_ttl_sec;
    let interval = state.config.tokens.device_poll_interval_sec;
    let authorization = {
        let instance = router::device_code_instance(state.tenant());
        let mut store = state.device_codes.lease(&instance).await;
        store
            .create(&client.client_id, &scope, ttl, interval)
            .await
            .map_err(OAuthError::from)?
    };

    let verification_uri = format!("{}/device", state.issuer());
    Ok(Json(DeviceAuthorizationResponse {
        verification_uri_complete: format!(
            "{}?user_code={}",
            verification_uri, authorization.user_code
        ),
        verification_uri,
        device_code: authorization.device_code,
        user_code: authorization.user_code,
        expires_in: ttl,
        interval,
    }))
}

#[derive(Debug, Deserialize)]
pub struct VerificationQuery {
    pub user_code: Option<String>,
}

/// The verification page's data: which client is asking, for what scope.
pub async fn device_verification_info(
    State(state): State<AppState>,
    Query(query): Query<VerificationQuery>,
) -> Result<Json<Value>, OAuthError> {
    let Some(user_code) = query.user_code.as_deref() else {
        return Err(OAuthError::InvalidRequest("user_code is required".to_string()));
    };
    let pending = {
        let instance = router::device_code_instance(state.tenant());
        let mut store = state.device_codes.lease(&instance).await;
        store
            .find_by_user_code(user_code)
            .await
            .map_err(OAuthError::from)?
    };
    let Some(pending) = pending else {
        return Err(OAuthError::InvalidRequest(
            "unknown or expired user_code".to_string(),
        ));
    };
    let client_name = state
        .clients
        .metadata(&pending.client_id)
        .await
        .and_then(|c| c.client_name);
    Ok(Json(json!({
        "client_id": pending.client_id,
        "client_name": client_name,
        "scope": pending.scope,
    })))
}

#[derive(Debug, Deserialize)]
pub struct VerificationForm {
    pub user_code: String,
    pub approve: bool,
}

/// The signed-in user approves or denies the device.
pub async fn device_verification_submit(
    State(state): State<AppState>,
    headers: HeaderMap,
    Form(form): Form<VerificationForm>,
) -> Result<Json<Value>, OAuthError> {
    let Some(session_id) = session_cookie(&headers) else {
        return Err(OAuthError::LoginRequired);
    };
    let Some(instance) = router::session_instance_for_id(state.tenant(), &session_id) else {
        return Err(OAuthError::LoginRequired);
    };
    let session = {
        let mut sessions = state.sessions.lease(&instance).await;
        sessions.get(&session_id).await.map_err(OAuthError::from)?
    };
    let Some(session) = session else {
        return Err(OAuthError::LoginRequired);
    };

    let instance = router::device_code_instance(state.tenant());
    let mut store = state.device_codes.lease(&instance).await;
    let applied = if form.approve {
        store
            .approve(&form.user_code, &session.user_id)
            .await
            .map_err(OAuthError::from)?
    } else {
        store.deny(&form.user_code).await.map_err(OAuthError::from)?
    };
    if !applied {
        return Err(OAuthError::InvalidRequest(
            "unknown, expired, or already-decided user_code".to_string(),
        ));
    }
    Ok(Json(json!({ "decided": true })))
}
