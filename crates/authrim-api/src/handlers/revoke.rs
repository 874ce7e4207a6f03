//! Token revocation (RFC 7009). Revoking a refresh token takes its whole
//! family with it; the endpoint returns 200 regardless of whether the
//! token was found, per the RFC.

use crate::error::OAuthError;
use crate::handlers::token::peek_refresh_claims;
use crate::{client_auth, AppState};
use authrim_audit::{SecurityEvent, SecurityEventKind};
use authrim_crypto::{peek_claims, AccessClaims};
use authrim_store::router;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::Form;
use chrono::{Duration, Utc};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct RevokeForm {
    pub token: Option<String>,
    pub token_type_hint: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
}

pub async fn revoke(
    State(state): State<AppState>,
    headers: HeaderMap,
    Form(form): Form<RevokeForm>,
) -> Result<StatusCode, OAuthError> {
    let client = client_auth::authenticate_from(
        &state,
        &headers,
        form.client_id.as_deref(),
        form.client_secret.as_deref(),
    )?;

    let Some(token) = form.token.as_deref().filter(|t| !t.is_empty()) else {
        return Ok(StatusCode::OK);
    };

    if let Some(refresh) = peek_refresh_claims(token) {
        // A refresh token revokes its entire family.
        if refresh.client_id != client.client_id {
            // RFC 7009: do not leak whether the token exists.
            return Ok(StatusCode::OK);
        }
        let instance =
            router::refresh_instance_for_jti(state.tenant(), &client.client_id, &refresh.jti);
        let jtis = {
            let mut rotator = state.rotators.lease(&instance).await;
            let Some(family) = rotator
                .family_for_jti(&refresh.jti)
                .await
                .map_err(OAuthError::from)?
            else {
                return Ok(StatusCode::OK);
            };
            rotator
                .revoke_family(&family.id, "client revocation")
                .await
                .map_err(OAuthError::from)?
        };
        if !jtis.is_empty() {
            let expires_at =
                Utc::now() + Duration::seconds(state.config.tokens.refresh_token_ttl_sec as i64);
            let instance = router::revocation_instance(state.tenant());
            let mut revocations = state.revocations.lease(&instance).await;
            revocations
                .revoke_batch(&jtis, expires_at, "client revocation")
                .await
                .map_err(OAuthError::from)?;
        }
        state.audit.emit(
            SecurityEvent::new(SecurityEventKind::FamilyRevoked, state.tenant())
                .with_client(&client.client_id),
        );
        return Ok(StatusCode::OK);
    }

    // Access token (or opaque jti): blacklist until the token's own expiry.
    let (jti, expires_at) = match peek_claims::<AccessClaims>(token) {
        Ok(claims) => {
            let expires_at = chrono::DateTime::from_timestamp(claims.exp, 0)
                .unwrap_or_else(|| Utc::now() + Duration::hours(1));
            (claims.jti, expires_at)
        }
        Err(_) => (
            token.to_string(),
            Utc::now() + Duration::seconds(state.config.tokens.access_token_ttl_sec as i64),
        ),
    };
    let instance = router::revocation_instance(state.tenant());
    let mut revocations = state.revocations.lease(&instance).await;
    revocations
        .revoke(&jti, expires_at, "client revocation")
        .await
        .map_err(OAuthError::from)?;
    Ok(StatusCode::OK)
}
