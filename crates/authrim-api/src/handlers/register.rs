//! Dynamic client registration (RFC 7591).

use crate::clients::RegistrationRequest;
use crate::error::OAuthError;
use crate::AppState;
use authrim_audit::{SecurityEvent, SecurityEventKind};
use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde_json::{json, Value};

pub async fn register(
    State(state): State<AppState>,
    Json(request): Json<RegistrationRequest>,
) -> Result<(StatusCode, Json<Value>), OAuthError> {
    if request.redirect_uris.is_empty() {
        return Err(OAuthError::InvalidRequest(
            "redirect_uris must not be empty".to_string(),
        ));
    }
    for uri in &request.redirect_uris {
        let parsed = url::Url::parse(uri)
            .map_err(|_| OAuthError::InvalidRequest(format!("invalid redirect_uri: {uri}")))?;
        if parsed.scheme() != "https" && parsed.scheme() != "http" {
            return Err(OAuthError::InvalidRequest(format!(
                "unsupported redirect_uri scheme: {uri}"
            )));
        }
        if parsed.fragment().is_some() {
            return Err(OAuthError::InvalidRequest(
                "redirect_uri must not carry a fragment".to_string(),
            ));
        }
    }

    let (metadata, secret) = state.clients.register(request).await;

    state.audit.emit(
        SecurityEvent::new(SecurityEventKind::ClientRegistered, state.tenant())
            .with_client(&metadata.client_id),
    );

    let mut body = json!({
        "client_id": metadata.client_id,
        "client_name": metadata.client_name,
        "redirect_uris": metadata.redirect_uris,
        "grant_types": metadata.grant_types,
        "scope": metadata.allowed_scopes.join(" "),
        "token_endpoint_auth_method": metadata.token_endpoint_auth_method.as_str(),
        "subject_type": match metadata.subject_type {
            crate::clients::SubjectType::Public => "public",
            crate::clients::SubjectType::Pairwise => "pairwise",
        },
    });
    if let Some(secret) = secret {
        body["client_secret"] = json!(secret);
        // Secrets issued here do not expire on their own.
        body["client_secret_expires_at"] = json!(0);
    }
    Ok((StatusCode::CREATED, Json(body)))
}
