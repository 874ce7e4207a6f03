//! RP-initiated logout and back-channel logout.
//!
//! A signature-verified `id_token_hint` authorizes immediate logout. A
//! bare session cookie only stages a single-use logout ticket in the
//! challenge store; the confirmation step consumes it, so a replayed or
//! forged logout link cannot tear a session down. Either way the session
//! and every refresh family bound to it are revoked and registered clients
//! are notified over their back-channel URIs with a signed logout token,
//! best-effort and off the reply path.

use crate::error::OAuthError;
use crate::handlers::session_cookie;
use crate::AppState;
use authrim_audit::{SecurityEvent, SecurityEventKind};
use authrim_core::models::ChallengeKind;
use authrim_crypto::verify_with_jwks_expired_ok;
use authrim_store::router;
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::{Form, Json};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

/// How long a staged logout ticket stays consumable.
const LOGOUT_TICKET_TTL_SEC: u64 = 300;

#[derive(Debug, Deserialize)]
pub struct LogoutParams {
    pub id_token_hint: Option<String>,
    pub post_logout_redirect_uri: Option<String>,
    pub state: Option<String>,
}

/// Claims we care about from an id_token_hint or a logout token.
#[derive(Debug, Deserialize)]
struct HintClaims {
    sub: Option<String>,
    sid: Option<String>,
    aud: Option<String>,
    events: Option<serde_json::Value>,
}

/// Payload of a staged logout ticket.
#[derive(Debug, Serialize, Deserialize)]
struct LogoutTicket {
    session_id: String,
    post_logout_redirect_uri: Option<String>,
    state: Option<String>,
}

pub async fn logout(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<LogoutParams>,
) -> Response {
    // A hint that verifies against our keys (expired is fine, signature is
    // not negotiable) proves the caller held the ID token: log out now.
    if let Some(token) = params.id_token_hint.as_deref() {
        let claims = match verified_hint(&state, token).await {
            Ok(claims) => claims,
            Err(err) => return err.into_response(),
        };
        if let Some(sid) = claims.sid.clone() {
            if let Err(err) = end_session(&state, &sid).await {
                return err.into_response();
            }
        }
        return finish_logout(&state, &params, Some(&claims));
    }

    // Cookie only: stage a single-use ticket for the confirmation step.
    let Some(session_id) = session_cookie(&headers) else {
        return finish_logout(&state, &params, None);
    };
    let ticket_id = router::random_token(32);
    let payload = json!(LogoutTicket {
        session_id,
        post_logout_redirect_uri: params.post_logout_redirect_uri.clone(),
        state: params.state.clone(),
    });
    let created = {
        let instance = router::challenge_instance(state.tenant());
        let mut challenges = state.challenges.lease(&instance).await;
        challenges
            .create(&ticket_id, ChallengeKind::Logout, payload, LOGOUT_TICKET_TTL_SEC)
            .await
    };
    if let Err(err) = created {
        return OAuthError::from(err).into_response();
    }
    Json(json!({
        "confirmation_required": true,
        "logout_ticket": ticket_id,
        "expires_in": LOGOUT_TICKET_TTL_SEC,
    }))
    .into_response()
}

#[derive(Debug, Deserialize)]
pub struct LogoutConfirmForm {
    pub logout_ticket: Option<String>,
}

/// Consume the staged ticket and complete the logout. Exactly one confirm
/// can win; replays see an unknown ticket.
pub async fn logout_confirm(
    State(state): State<AppState>,
    Form(form): Form<LogoutConfirmForm>,
) -> Result<Json<serde_json::Value>, OAuthError> {
    let Some(ticket_id) = form.logout_ticket.as_deref().filter(|t| !t.is_empty()) else {
        return Err(OAuthError::InvalidRequest(
            "logout_ticket is required".to_string(),
        ));
    };
    let payload = {
        let instance = router::challenge_instance(state.tenant());
        let mut challenges = state.challenges.lease(&instance).await;
        challenges
            .consume(ticket_id, ChallengeKind::Logout)
            .await
            .map_err(OAuthError::from)?
    };
    let Some(payload) = payload else {
        return Err(OAuthError::InvalidRequest(
            "unknown, used, or expired logout ticket".to_string(),
        ));
    };
    let ticket: LogoutTicket = serde_json::from_value(payload)
        .map_err(|_| OAuthError::ServerError("corrupt logout ticket".to_string()))?;

    end_session(&state, &ticket.session_id).await?;
    Ok(Json(json!({ "logged_out": true })))
}

/// Verify an id_token_hint against our own key set. Expiry is tolerated;
/// signature and issuer are enforced.
async fn verified_hint(state: &AppState, token: &str) -> Result<HintClaims, OAuthError> {
    let policy = state.key_policy();
    let jwks = {
        let instance = router::key_manager_instance(state.tenant());
        let mut keys = state.key_managers.lease(&instance).await;
        keys.verification_jwks(&policy).await?
    };
    verify_with_jwks_expired_ok(token, &jwks, state.issuer())
        .map_err(|_| OAuthError::InvalidRequest("id_token_hint did not verify".to_string()))
}

async fn end_session(state: &AppState, session_id: &str) -> Result<(), OAuthError> {
    let tenant = state.tenant().to_string();

    // 1. Invalidate the session on its owning shard.
    let Some(instance) = router::session_instance_for_id(&tenant, session_id) else {
        return Ok(());
    };
    let session = {
        let mut sessions = state.sessions.lease(&instance).await;
        let session = sessions.get(session_id).await.map_err(OAuthError::from)?;
        sessions
            .invalidate(session_id)
            .await
            .map_err(OAuthError::from)?;
        session
    };
    let Some(session) = session else {
        return Ok(());
    };

    // 2. Revoke every refresh family of this user+session, across every
    // client and every shard generation still holding live tokens.
    let shard_config = state
        .shard_cache
        .current(
            &state.shard_configs,
            &router::shard_config_instance(&tenant),
            state.config.sharding.refresh_token_default_shard_count,
        )
        .await
        .map_err(OAuthError::from)?;

    // Removing a family is what kills its refresh tokens; no blacklist
    // entry is needed because rotation consults the family state first.
    for client in state.clients.iter_metadata() {
        let mut instances: Vec<String> = shard_config
            .known_generations()
            .into_iter()
            .map(|(generation, shard_count)| {
                let shard =
                    router::refresh_shard_for(&session.user_id, &client.client_id, shard_count);
                router::refresh_instance(&tenant, &client.client_id, generation, shard)
            })
            .collect();
        // Legacy, pre-generation families.
        instances.push(router::legacy_refresh_instance(&tenant, &client.client_id));
        instances.dedup();

        for instance in instances {
            let mut rotator = state.rotators.lease(&instance).await;
            if let Err(err) = rotator
                .revoke_families_for(&session.user_id, Some(session_id), "logout")
                .await
            {
                tracing::error!(error = %err, "logout family revocation failed");
            }
        }
    }

    // 3. Back-channel notifications.
    notify_back_channels(state, &session.user_id, session_id).await;

    state.audit.emit(
        SecurityEvent::new(SecurityEventKind::LogoutCompleted, &tenant)
            .with_user(&session.user_id)
            .with_resource(session_id),
    );
    Ok(())
}

/// Sign and POST logout tokens to every client with a registered
/// back-channel URI. Fire-and-forget.
async fn notify_back_channels(state: &AppState, user_id: &str, session_id: &str) {
    let policy = state.key_policy();
    let now = Utc::now();
    for client in state.clients.iter_metadata() {
        let Some(uri) = client.backchannel_logout_uri.clone() else {
            continue;
        };
        let claims = json!({
            "iss": state.issuer(),
            "sub": user_id,
            "aud": client.client_id,
            "iat": now.timestamp(),
            "exp": now.timestamp() + 120,
            "jti": Uuid::new_v4().to_string(),
            "sid": session_id,
            "events": { "http://schemas.openid.net/event/backchannel-logout": {} },
        });
        let signed = {
            let instance = router::key_manager_instance(state.tenant());
            let mut keys = state.key_managers.lease(&instance).await;
            keys.sign(&policy, &claims).await
        };
        let Ok((logout_token, _)) = signed else {
            continue;
        };
        let http = state.http.clone();
        tokio::spawn(async move {
            let result = http
                .post(&uri)
                .form(&[("logout_token", logout_token)])
                .send()
                .await;
            if let Err(err) = result {
                tracing::warn!(uri = %uri, error = %err, "back-channel logout delivery failed");
            }
        });
    }
}

fn finish_logout(
    state: &AppState,
    params: &LogoutParams,
    hint: Option<&HintClaims>,
) -> Response {
    // Only redirect to a URI we can tie to the client from the hint.
    if let (Some(redirect), Some(hint)) = (&params.post_logout_redirect_uri, hint) {
        if let Some(aud) = &hint.aud {
            if let Some(client) = state.clients.get(aud) {
                if client.metadata.redirect_uri_is_registered(redirect)
                    || client
                        .metadata
                        .backchannel_logout_uri
                        .as_deref()
                        .map(|u| u == redirect)
                        .unwrap_or(false)
                {
                    let mut url = match url::Url::parse(redirect) {
                        Ok(url) => url,
                        Err(_) => return Json(json!({ "logged_out": true })).into_response(),
                    };
                    if let Some(oauth_state) = &params.state {
                        url.query_pairs_mut().append_pair("state", oauth_state);
                    }
                    return crate::handlers::found_redirect(url.as_str());
                }
            }
        }
    }
    Json(json!({ "logged_out": true })).into_response()
}

// ---------------------------------------------------------------------------
// Back-channel logout receiver
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct BackchannelLogoutForm {
    pub logout_token: Option<String>,
}

/// Accepts a logout token referencing a session by `sid` and tears that
/// session down. The token must verify against our own key set.
pub async fn backchannel_logout(
    State(state): State<AppState>,
    Form(form): Form<BackchannelLogoutForm>,
) -> Result<axum::http::StatusCode, OAuthError> {
    let Some(token) = form.logout_token.as_deref() else {
        return Err(OAuthError::InvalidRequest("logout_token is required".to_string()));
    };

    let policy = state.key_policy();
    let jwks = {
        let instance = router::key_manager_instance(state.tenant());
        let mut keys = state.key_managers.lease(&instance).await;
        keys.verification_jwks(&policy).await?
    };
    let claims: HintClaims = authrim_crypto::verify_with_jwks(token, &jwks, state.issuer())?;

    let has_logout_event = claims
        .events
        .as_ref()
        .and_then(|e| e.get("http://schemas.openid.net/event/backchannel-logout"))
        .is_some();
    if !has_logout_event {
        return Err(OAuthError::InvalidRequest(
            "logout_token carries no logout event".to_string(),
        ));
    }
    let Some(sid) = claims.sid else {
        return Err(OAuthError::InvalidRequest("logout_token has no sid".to_string()));
    };

    end_session(&state, &sid).await?;
    Ok(axum::http::StatusCode::OK)
}
