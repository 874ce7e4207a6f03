//! Token introspection (RFC 7662).

use crate::error::OAuthError;
use crate::handlers::token::{looks_like_jwt, peek_refresh_claims};
use crate::{client_auth, AppState};
use authrim_crypto::{peek_claims, verify_with_jwks, AccessClaims};
use authrim_store::router;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::{Form, Json};
use chrono::Utc;
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
pub struct IntrospectForm {
    pub token: Option<String>,
    pub token_type_hint: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
}

#[derive(Debug, Default, Serialize)]
pub struct IntrospectionResponse {
    pub active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aud: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jti: Option<String>,
}

const INACTIVE: IntrospectionResponse = IntrospectionResponse {
    active: false,
    sub: None,
    aud: None,
    exp: None,
    iat: None,
    scope: None,
    client_id: None,
    token_type: None,
    jti: None,
};

pub async fn introspect(
    State(state): State<AppState>,
    headers: HeaderMap,
    Form(form): Form<IntrospectForm>,
) -> Result<Json<IntrospectionResponse>, OAuthError> {
    let client = client_auth::authenticate_from(
        &state,
        &headers,
        form.client_id.as_deref(),
        form.client_secret.as_deref(),
    )?;

    let Some(token) = form.token.as_deref().filter(|t| !t.is_empty()) else {
        return Ok(Json(INACTIVE));
    };

    // Refresh tokens are answered from the family state; access tokens
    // from signature + revocation list.
    if let Some(refresh) = peek_refresh_claims(token) {
        let instance =
            router::refresh_instance_for_jti(state.tenant(), &client.client_id, &refresh.jti);
        let family = {
            let mut rotator = state.rotators.lease(&instance).await;
            rotator
                .family_for_jti(&refresh.jti)
                .await
                .map_err(OAuthError::from)?
        };
        let active = family
            .as_ref()
            .map(|f| f.current_jti == refresh.jti && !f.is_expired(Utc::now()))
            .unwrap_or(false);
        if !active {
            return Ok(Json(INACTIVE));
        }
        return Ok(Json(IntrospectionResponse {
            active: true,
            sub: Some(refresh.sub),
            aud: Some(refresh.aud),
            exp: Some(refresh.exp),
            iat: Some(refresh.iat),
            scope: Some(refresh.scope),
            client_id: Some(refresh.client_id),
            token_type: Some("refresh_token".to_string()),
            jti: Some(refresh.jti),
        }));
    }

    if !looks_like_jwt(token) {
        return Ok(Json(INACTIVE));
    }

    let policy = state.key_policy();
    let jwks = {
        let instance = router::key_manager_instance(state.tenant());
        let mut keys = state.key_managers.lease(&instance).await;
        keys.verification_jwks(&policy).await?
    };
    let claims: AccessClaims = match verify_with_jwks(token, &jwks, state.issuer()) {
        Ok(claims) => claims,
        // An unverifiable token is simply inactive, never an error.
        Err(_) => match peek_claims::<AccessClaims>(token) {
            Ok(_) | Err(_) => return Ok(Json(INACTIVE)),
        },
    };

    let revoked = {
        let instance = router::revocation_instance(state.tenant());
        let mut revocations = state.revocations.lease(&instance).await;
        revocations
            .is_revoked(&claims.jti)
            .await
            .map_err(OAuthError::from)?
    };
    if revoked {
        return Ok(Json(INACTIVE));
    }

    Ok(Json(IntrospectionResponse {
        active: true,
        sub: Some(claims.sub),
        aud: Some(claims.aud),
        exp: Some(claims.exp),
        iat: Some(claims.iat),
        scope: Some(claims.scope),
        client_id: Some(claims.client_id),
        token_type: Some("access_token".to_string()),
        jti: Some(claims.jti),
    }))
}
