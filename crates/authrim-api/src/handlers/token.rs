//! The token endpoint: grant multiplexer over authorization_code,
//! refresh_token, device_code, and CIBA.
//!
//! Consistency violations observed here (code replay, refresh reuse) fire
//! cascade revocation. The failing call answers `invalid_grant`
//! immediately; the cascade runs in the background and is best-effort
//! beyond the local revocation the store already made durable.

use crate::error::OAuthError;
use crate::tokens::{issue_for_rotation, issue_tokens, GrantContext, IssuedTokens};
use crate::{client_auth, with_deadline, AppState};
use authrim_audit::{SecurityEvent, SecurityEventKind};
use authrim_core::models::DerivedFamilyRef;
use authrim_core::stores::{CibaPoll, DevicePoll, RotateRequest};
use authrim_core::StoreError;
use authrim_crypto::{dpop, peek_claims, verify_with_jwks, RefreshClaims};
use authrim_store::router;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::{Form, Json};
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const GRANT_AUTHORIZATION_CODE: &str = "authorization_code";
pub const GRANT_REFRESH_TOKEN: &str = "refresh_token";
pub const GRANT_DEVICE_CODE: &str = "urn:ietf:params:oauth:grant-type:device_code";
pub const GRANT_CIBA: &str = "urn:openid:params:grant-type:ciba";

#[derive(Debug, Deserialize)]
pub struct TokenForm {
    pub grant_type: Option<String>,
    pub code: Option<String>,
    pub redirect_uri: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub code_verifier: Option<String>,
    pub refresh_token: Option<String>,
    pub scope: Option<String>,
    pub device_code: Option<String>,
    pub auth_req_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: &'static str,
    pub expires_in: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    pub scope: String,
}

impl From<IssuedTokens> for TokenResponse {
    fn from(issued: IssuedTokens) -> Self {
        Self {
            access_token: issued.access_token,
            token_type: issued.token_type,
            expires_in: issued.expires_in,
            id_token: issued.id_token,
            refresh_token: issued.refresh_token,
            scope: issued.scope,
        }
    }
}

pub async fn token(
    State(state): State<AppState>,
    headers: HeaderMap,
    Form(form): Form<TokenForm>,
) -> Result<Json<TokenResponse>, OAuthError> {
    let client = client_auth::authenticate_from(
        &state,
        &headers,
        form.client_id.as_deref(),
        form.client_secret.as_deref(),
    )?;

    // DPoP: verify the proof and burn its jti before any grant work.
    let dpop_jkt = match headers.get("dpop").and_then(|v| v.to_str().ok()) {
        Some(proof) => Some(verify_dpop(&state, proof, "POST", "/token").await?),
        None => None,
    };

    let grant_type = form.grant_type.as_deref().unwrap_or_default();
    match grant_type {
        GRANT_AUTHORIZATION_CODE => {
            authorization_code_grant(&state, &client, &form, dpop_jkt).await
        }
        GRANT_REFRESH_TOKEN => refresh_token_grant(&state, &client, &form, dpop_jkt).await,
        GRANT_DEVICE_CODE => device_code_grant(&state, &client, &form, dpop_jkt).await,
        GRANT_CIBA => ciba_grant(&state, &client, &form, dpop_jkt).await,
        _ => Err(OAuthError::UnsupportedGrantType),
    }
}

async fn verify_dpop(
    state: &AppState,
    proof: &str,
    method: &str,
    path: &str,
) -> Result<String, OAuthError> {
    let htu = format!("{}{}", state.issuer(), path);
    let verified = dpop::verify_proof(proof, method, &htu, Utc::now().timestamp(), None)
        .map_err(|e| OAuthError::InvalidDpopProof(e.to_string()))?;

    let instance = router::dpop_jti_instance(state.tenant());
    let fresh = with_deadline(state.config.deadlines.user_facing_sec, async {
        let mut jtis = state.dpop_jtis.lease(&instance).await;
        jtis.check_and_store(&verified.jti, state.config.tokens.dpop_jti_ttl_sec)
            .await
            .map_err(OAuthError::from)
    })
    .await?;
    if !fresh {
        state.audit.emit(SecurityEvent::new(
            SecurityEventKind::DpopReplayDetected,
            state.tenant(),
        ));
        return Err(OAuthError::InvalidDpopProof("proof jti replayed".to_string()));
    }
    Ok(verified.jkt)
}

// ---------------------------------------------------------------------------
// authorization_code
// ---------------------------------------------------------------------------

async fn authorization_code_grant(
    state: &AppState,
    client: &crate::clients::ClientMetadata,
    form: &TokenForm,
    dpop_jkt: Option<String>,
) -> Result<Json<TokenResponse>, OAuthError> {
    if !client.grants(GRANT_AUTHORIZATION_CODE) {
        return Err(OAuthError::UnauthorizedClient);
    }
    let Some(code) = form.code.as_deref().filter(|c| !c.is_empty()) else {
        return Err(OAuthError::InvalidRequest("code is required".to_string()));
    };
    let Some(redirect_uri) = form.redirect_uri.as_deref() else {
        return Err(OAuthError::InvalidRequest(
            "redirect_uri is required".to_string(),
        ));
    };

    let instance = router::auth_code_instance(state.tenant());
    let consumed = with_deadline(state.config.deadlines.user_facing_sec, async {
        let mut codes = state.auth_codes.lease(&instance).await;
        codes
            .consume(code, &client.client_id, form.code_verifier.as_deref())
            .await
            .map_err(|err| match err {
                StoreError::CodeReplay { derived_families } => {
                    // Post-success replay: a security event with a cascade.
                    state.audit.emit(
                        SecurityEvent::new(SecurityEventKind::CodeReplayDetected, state.tenant())
                            .with_client(&client.client_id)
                            .with_resource(code),
                    );
                    spawn_code_replay_cascade(state.clone(), derived_families);
                    OAuthError::InvalidGrant("authorization code replay detected".to_string())
                }
                other => OAuthError::from(other),
            })
    })
    .await?;

    if consumed.redirect_uri != redirect_uri {
        return Err(OAuthError::InvalidGrant("redirect_uri mismatch".to_string()));
    }

    let (issued, family_ref) = issue_tokens(
        state,
        GrantContext {
            client,
            user_id: &consumed.user_id,
            session_id: &consumed.session_id,
            scope: &consumed.scope,
            nonce: consumed.nonce.as_deref(),
            auth_time: consumed.auth_time,
            acr: consumed.acr.clone(),
            amr: consumed.amr.clone(),
            code: Some(code),
            dpop_jkt,
            with_refresh: client.grants(GRANT_REFRESH_TOKEN),
        },
    )
    .await?;

    // Remember which family came from this code so a later replay can
    // revoke it.
    if let Some(family_ref) = family_ref {
        let instance = router::auth_code_instance(state.tenant());
        let mut codes = state.auth_codes.lease(&instance).await;
        if let Err(err) = codes.link_family(code, family_ref).await {
            tracing::error!(error = %err, "failed to link family to its code");
        }
    }

    state.audit.emit(
        SecurityEvent::new(SecurityEventKind::CodeConsumed, state.tenant())
            .with_user(&consumed.user_id)
            .with_client(&client.client_id),
    );

    Ok(Json(TokenResponse::from(issued)))
}

/// Revoke every refresh family minted from a replayed code. Runs off the
/// reply path; each family's rotator already serializes the revocation.
fn spawn_code_replay_cascade(state: AppState, families: Vec<DerivedFamilyRef>) {
    if families.is_empty() {
        return;
    }
    tokio::spawn(async move {
        let tenant = state.tenant().to_string();
        let mut all_jtis = Vec::new();
        for family in &families {
            let instance = router::refresh_instance(
                &tenant,
                &family.client_id,
                family.generation,
                family.shard,
            );
            let mut rotator = state.rotators.lease(&instance).await;
            match rotator.revoke_family(&family.family_id, "code replay").await {
                Ok(jtis) => all_jtis.extend(jtis),
                Err(err) => {
                    tracing::error!(
                        family_id = %family.family_id,
                        error = %err,
                        "cascade revocation failed for family"
                    );
                }
            }
        }
        if !all_jtis.is_empty() {
            let expires_at =
                Utc::now() + Duration::seconds(state.config.tokens.refresh_token_ttl_sec as i64);
            let instance = router::revocation_instance(&tenant);
            let mut revocations = state.revocations.lease(&instance).await;
            if let Err(err) = revocations
                .revoke_batch(&all_jtis, expires_at, "code replay cascade")
                .await
            {
                tracing::error!(error = %err, "cascade blacklist failed");
            }
        }
        state.audit.emit(
            SecurityEvent::new(SecurityEventKind::FamilyRevoked, &tenant)
                .with_detail(serde_json::json!({
                    "reason": "code replay cascade",
                    "families": families.len(),
                })),
        );
    });
}

// ---------------------------------------------------------------------------
// refresh_token
// ---------------------------------------------------------------------------

async fn refresh_token_grant(
    state: &AppState,
    client: &crate::clients::ClientMetadata,
    form: &TokenForm,
    dpop_jkt: Option<String>,
) -> Result<Json<TokenResponse>, OAuthError> {
    if !client.grants(GRANT_REFRESH_TOKEN) {
        return Err(OAuthError::UnauthorizedClient);
    }
    let Some(presented) = form.refresh_token.as_deref().filter(|t| !t.is_empty()) else {
        return Err(OAuthError::InvalidRequest(
            "refresh_token is required".to_string(),
        ));
    };

    // JWT-form tokens carry jti + rtv and get their signature checked;
    // legacy opaque tokens are the jti itself, treated as generation 0.
    let (jti, presented_version) = if presented.matches('.').count() == 2 {
        let policy = state.key_policy();
        let jwks = {
            let instance = router::key_manager_instance(state.tenant());
            let mut keys = state.key_managers.lease(&instance).await;
            keys.verification_jwks(&policy).await?
        };
        let claims: RefreshClaims = verify_with_jwks(presented, &jwks, state.issuer())?;
        if claims.client_id != client.client_id {
            return Err(OAuthError::InvalidGrant(
                "refresh token was issued to another client".to_string(),
            ));
        }
        (claims.jti, Some(claims.rtv))
    } else {
        (presented.to_string(), None)
    };

    // Families revoked through /revoke or a cascade leave their jtis on
    // the blacklist.
    {
        let instance = router::revocation_instance(state.tenant());
        let mut revocations = state.revocations.lease(&instance).await;
        if revocations.is_revoked(&jti).await.map_err(OAuthError::from)? {
            return Err(OAuthError::InvalidGrant("refresh token revoked".to_string()));
        }
    }

    // The jti's embedded (generation, shard) pins the owning instance.
    let instance = router::refresh_instance_for_jti(state.tenant(), &client.client_id, &jti);
    let outcome = with_deadline(state.config.deadlines.user_facing_sec, async {
        let mut rotator = state.rotators.lease(&instance).await;
        rotator
            .rotate(RotateRequest {
                current_jti: jti.clone(),
                presented_version,
                requested_scope: form.scope.clone(),
            })
            .await
            .map_err(|err| match err {
                StoreError::TokenTheft {
                    family_id,
                    user_id,
                    session_id,
                    revoked_jtis,
                } => {
                    state.audit.emit(
                        SecurityEvent::new(SecurityEventKind::TokenTheftDetected, state.tenant())
                            .with_user(&user_id)
                            .with_client(&client.client_id)
                            .with_resource(&family_id),
                    );
                    spawn_theft_cascade(state.clone(), session_id, revoked_jtis);
                    OAuthError::InvalidGrant("refresh token reuse detected".to_string())
                }
                StoreError::ScopeWidening { requested } => OAuthError::InvalidScope(requested),
                other => OAuthError::from(other),
            })
    })
    .await?;

    let issued = issue_for_rotation(state, client, &outcome, dpop_jkt).await?;

    state.audit.emit(
        SecurityEvent::new(SecurityEventKind::TokenRotated, state.tenant())
            .with_user(&outcome.user_id)
            .with_client(&client.client_id)
            .with_resource(&outcome.family_id),
    );

    Ok(Json(TokenResponse::from(issued)))
}

/// After theft: blacklist every jti the family ever answered for and tear
/// down the session it was bound to.
fn spawn_theft_cascade(state: AppState, session_id: String, jtis: Vec<String>) {
    tokio::spawn(async move {
        let tenant = state.tenant().to_string();
        if !jtis.is_empty() {
            let expires_at =
                Utc::now() + Duration::seconds(state.config.tokens.refresh_token_ttl_sec as i64);
            let instance = router::revocation_instance(&tenant);
            let mut revocations = state.revocations.lease(&instance).await;
            if let Err(err) = revocations
                .revoke_batch(&jtis, expires_at, "refresh token theft")
                .await
            {
                tracing::error!(error = %err, "theft blacklist failed");
            }
        }
        if let Some(instance) = router::session_instance_for_id(&tenant, &session_id) {
            let mut sessions = state.sessions.lease(&instance).await;
            match sessions.invalidate(&session_id).await {
                Ok(true) => {
                    state.audit.emit(
                        SecurityEvent::new(SecurityEventKind::SessionRevoked, &tenant)
                            .with_resource(&session_id)
                            .with_detail(serde_json::json!({ "reason": "refresh token theft" })),
                    );
                }
                Ok(false) => {}
                Err(err) => tracing::error!(error = %err, "theft session teardown failed"),
            }
        }
    });
}

// ---------------------------------------------------------------------------
// device_code / CIBA
// ---------------------------------------------------------------------------

async fn device_code_grant(
    state: &AppState,
    client: &crate::clients::ClientMetadata,
    form: &TokenForm,
    dpop_jkt: Option<String>,
) -> Result<Json<TokenResponse>, OAuthError> {
    if !client.grants(GRANT_DEVICE_CODE) {
        return Err(OAuthError::UnauthorizedClient);
    }
    let Some(device_code) = form.device_code.as_deref().filter(|c| !c.is_empty()) else {
        return Err(OAuthError::InvalidRequest(
            "device_code is required".to_string(),
        ));
    };

    let poll = {
        let instance = router::device_code_instance(state.tenant());
        let mut store = state.device_codes.lease(&instance).await;
        store
            .poll(device_code, &client.client_id)
            .await
            .map_err(OAuthError::from)?
    };

    let authorization = match poll {
        DevicePoll::Pending => return Err(OAuthError::AuthorizationPending),
        DevicePoll::SlowDown => return Err(OAuthError::SlowDown),
        DevicePoll::Denied => {
            return Err(OAuthError::AccessDenied("user denied the request".to_string()))
        }
        DevicePoll::Expired => return Err(OAuthError::ExpiredToken),
        DevicePoll::Approved(authorization) => authorization,
    };
    let user_id = match &authorization.decision {
        authrim_core::models::DeviceDecision::Approved { user_id } => user_id.clone(),
        _ => return Err(OAuthError::ServerError("approved poll without user".to_string())),
    };

    // Device grants have no browser session; tokens carry a synthetic sid.
    let sid = format!("device_{}", Uuid::new_v4());
    let (issued, _) = issue_tokens(
        state,
        GrantContext {
            client,
            user_id: &user_id,
            session_id: &sid,
            scope: &authorization.scope,
            nonce: None,
            auth_time: Utc::now(),
            acr: None,
            amr: vec!["device".to_string()],
            code: None,
            dpop_jkt,
            with_refresh: client.grants(GRANT_REFRESH_TOKEN),
        },
    )
    .await?;

    Ok(Json(TokenResponse::from(issued)))
}

async fn ciba_grant(
    state: &AppState,
    client: &crate::clients::ClientMetadata,
    form: &TokenForm,
    dpop_jkt: Option<String>,
) -> Result<Json<TokenResponse>, OAuthError> {
    if !client.grants(GRANT_CIBA) {
        return Err(OAuthError::UnauthorizedClient);
    }
    let Some(auth_req_id) = form.auth_req_id.as_deref().filter(|c| !c.is_empty()) else {
        return Err(OAuthError::InvalidRequest(
            "auth_req_id is required".to_string(),
        ));
    };

    let poll = {
        let instance = router::ciba_instance(state.tenant());
        let mut store = state.ciba_requests.lease(&instance).await;
        store
            .poll(auth_req_id, &client.client_id)
            .await
            .map_err(OAuthError::from)?
    };

    let request = match poll {
        CibaPoll::Pending => return Err(OAuthError::AuthorizationPending),
        CibaPoll::SlowDown => return Err(OAuthError::SlowDown),
        CibaPoll::Denied => {
            return Err(OAuthError::AccessDenied("user denied the request".to_string()))
        }
        CibaPoll::Expired => return Err(OAuthError::ExpiredToken),
        CibaPoll::Approved(request) => request,
    };
    let user_id = match &request.decision {
        authrim_core::models::CibaDecision::Approved { user_id } => user_id.clone(),
        _ => return Err(OAuthError::ServerError("approved poll without user".to_string())),
    };

    let sid = format!("ciba_{}", Uuid::new_v4());
    let (issued, _) = issue_tokens(
        state,
        GrantContext {
            client,
            user_id: &user_id,
            session_id: &sid,
            scope: &request.scope,
            nonce: None,
            auth_time: Utc::now(),
            acr: None,
            amr: vec!["ciba".to_string()],
            code: None,
            dpop_jkt,
            with_refresh: client.grants(GRANT_REFRESH_TOKEN),
        },
    )
    .await?;

    Ok(Json(TokenResponse::from(issued)))
}

// Introspection needs to peek refresh claims without a full verify; keep
// the helper here so both endpoints agree on the shape.
pub(crate) fn looks_like_jwt(token: &str) -> bool {
    token.matches('.').count() == 2
}

pub(crate) fn peek_refresh_claims(token: &str) -> Option<RefreshClaims> {
    if looks_like_jwt(token) {
        peek_claims::<RefreshClaims>(token).ok()
    } else {
        None
    }
}
