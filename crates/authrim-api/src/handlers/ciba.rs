//! Client-initiated backchannel authentication (OIDC CIBA, poll mode).

use crate::error::OAuthError;
use crate::handlers::session_cookie;
use crate::{client_auth, AppState};
use authrim_store::router;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::{Form, Json};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Debug, Deserialize)]
pub struct BcAuthorizeForm {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub scope: Option<String>,
    pub login_hint: Option<String>,
    pub binding_message: Option<String>,
}

#[derive(Serialize)]
pub struct BcAuthorizeResponse {
    pub auth_req_id: String,
    pub expires_in: u64,
    pub interval: u64,
}

pub async fn bc_authorize(
    State(state): State<AppState>,
    headers: HeaderMap,
    Form(form): Form<BcAuthorizeForm>,
) -> Result<Json<BcAuthorizeResponse>, OAuthError> {
    let client = client_auth::authenticate_from(
        &state,
        &headers,
        form.client_id.as_deref(),
        form.client_secret.as_deref(),
    )?;

    let Some(login_hint) = form.login_hint.as_deref().filter(|h| !h.is_empty()) else {
        return Err(OAuthError::InvalidRequest("login_hint is required".to_string()));
    };
    let scope = form.scope.clone().unwrap_or_default();
    if !client.scope_is_allowed(&scope) {
        return Err(OAuthError::InvalidScope(scope));
    }

    let ttl = state.config.tokens.device_code_ttl_sec;
    let interval = state.config.tokens.device_poll_interval_sec;
    let request = {
        let instance = router::ciba_instance(state.tenant());
        let mut store = state.ciba_requests.lease(&instance).await;
        store
            .create(
                &client.client_id,
                &scope,
                login_hint,
                form.binding_message.clone(),
                ttl,
                interval,
            )
            .await
            .map_err(OAuthError::from)?
    };

    Ok(Json(BcAuthorizeResponse {
        auth_req_id: request.auth_req_id,
        expires_in: ttl,
        interval,
    }))
}

#[derive(Debug, Deserialize)]
pub struct CibaDecisionForm {
    pub auth_req_id: String,
    pub approve: bool,
}

/// The authentication device resolves the request for its signed-in user.
pub async fn bc_authorize_complete(
    State(state): State<AppState>,
    headers: HeaderMap,
    Form(form): Form<CibaDecisionForm>,
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

    let instance = router::ciba_instance(state.tenant());
    let mut store = state.ciba_requests.lease(&instance).await;
    let applied = if form.approve {
        store
            .approve(&form.auth_req_id, &session.user_id)
            .await
            .map_err(OAuthError::from)?
    } else {
        store.deny(&form.auth_req_id).await.map_err(OAuthError::from)?
    };
    if !applied {
        return Err(OAuthError::InvalidRequest(
            "unknown, expired, or already-decided auth_req_id".to_string(),
        ));
    }
    Ok(Json(json!({ "decided": true })))
}
