//! The authorization endpoint and PAR (RFC 9126).
//!
//! Error surfaces follow RFC 6749: once the client and `redirect_uri` have
//! been validated, errors travel back on the redirect; before that point
//! they are direct responses so an attacker-supplied `redirect_uri` never
//! sees anything.

use crate::clients::ClientMetadata;
use crate::error::OAuthError;
use crate::handlers::session_cookie;
use crate::{client_auth, with_deadline, AppState};
use authrim_audit::{SecurityEvent, SecurityEventKind};
use authrim_core::models::{AuthCodeRecord, ChallengeKind, Session};
use authrim_crypto::CodeChallengeMethod;
use authrim_store::router;
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::{Form, Json};
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AuthorizeParams {
    pub response_type: Option<String>,
    pub client_id: Option<String>,
    pub redirect_uri: Option<String>,
    pub scope: Option<String>,
    pub state: Option<String>,
    pub nonce: Option<String>,
    pub code_challenge: Option<String>,
    pub code_challenge_method: Option<String>,
    pub prompt: Option<String>,
    pub max_age: Option<u64>,
    pub request_uri: Option<String>,
}

pub async fn authorize_get(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<AuthorizeParams>,
) -> Response {
    authorize(state, headers, params).await
}

pub async fn authorize_post(
    State(state): State<AppState>,
    headers: HeaderMap,
    Form(params): Form<AuthorizeParams>,
) -> Response {
    authorize(state, headers, params).await
}

async fn authorize(state: AppState, headers: HeaderMap, mut params: AuthorizeParams) -> Response {
    // Stage 1: resolve a staged PAR request, if any.
    if let Some(request_uri) = params.request_uri.clone() {
        match resolve_par(&state, &request_uri, params.client_id.as_deref()).await {
            Ok(staged) => params = staged,
            Err(err) => return err.into_response(),
        }
    }

    // Stage 2: validate client and redirect_uri. Failures here must never
    // redirect.
    let Some(client_id) = params.client_id.clone().filter(|c| !c.is_empty()) else {
        return OAuthError::InvalidRequest("client_id is required".to_string()).into_response();
    };
    let Some(client) = state.clients.metadata(&client_id).await else {
        return OAuthError::InvalidRequest("unknown client".to_string()).into_response();
    };
    let Some(redirect_uri) = params.redirect_uri.clone() else {
        return OAuthError::InvalidRequest("redirect_uri is required".to_string()).into_response();
    };
    if !client.redirect_uri_is_registered(&redirect_uri) {
        return OAuthError::InvalidRequest("redirect_uri is not registered".to_string())
            .into_response();
    }

    // From here on, errors go back on the redirect.
    let oauth_state = params.state.clone();
    match authorize_validated(&state, &headers, &client, &redirect_uri, params).await {
        Ok(response) => response,
        Err(err) => err.into_redirect(&redirect_uri, oauth_state.as_deref()),
    }
}

async fn authorize_validated(
    state: &AppState,
    headers: &HeaderMap,
    client: &ClientMetadata,
    redirect_uri: &str,
    params: AuthorizeParams,
) -> Result<Response, OAuthError> {
    if params.response_type.as_deref() != Some("code") {
        return Err(OAuthError::UnsupportedResponseType);
    }

    let scope = params.scope.clone().unwrap_or_default();
    if !client.scope_is_allowed(&scope) {
        return Err(OAuthError::InvalidScope(scope));
    }

    // PKCE policy.
    let challenge_method = match (&params.code_challenge, &params.code_challenge_method) {
        (None, _) => {
            if client.require_pkce {
                return Err(OAuthError::InvalidRequest(
                    "code_challenge is required for this client".to_string(),
                ));
            }
            None
        }
        (Some(_), method) => {
            // RFC 7636: missing method means plain.
            let method = method.as_deref().unwrap_or("plain");
            let Some(parsed) = CodeChallengeMethod::parse(method) else {
                return Err(OAuthError::InvalidRequest(
                    "unsupported code_challenge_method".to_string(),
                ));
            };
            if parsed == CodeChallengeMethod::Plain && !client.allow_plain_pkce {
                return Err(OAuthError::InvalidRequest(
                    "plain code_challenge_method is not permitted".to_string(),
                ));
            }
            Some(parsed)
        }
    };

    let prompt = params.prompt.as_deref();

    // Stage 3: session resolution.
    let session = resolve_session(state, headers, params.max_age, prompt).await?;
    let Some(session) = session else {
        if prompt == Some("none") {
            // No interaction allowed: error redirect, no code.
            return Err(OAuthError::LoginRequired);
        }
        return Ok(login_redirect(state, &params));
    };

    // Stage 4: consent.
    if client.require_consent && !session.has_consent(&client.client_id, &scope) {
        if prompt == Some("none") {
            return Err(OAuthError::ConsentRequired);
        }
        return Ok(consent_redirect(state, &params));
    }

    // Stage 5: issue the code.
    let now = Utc::now();
    let shard = router::session_shard_for_user(
        &session.user_id,
        state.config.sharding.session_shard_count,
    );
    let code = router::new_auth_code(shard);
    let record = AuthCodeRecord {
        code: code.clone(),
        client_id: client.client_id.clone(),
        redirect_uri: redirect_uri.to_string(),
        user_id: session.user_id.clone(),
        scope: scope.clone(),
        code_challenge: params.code_challenge.clone(),
        code_challenge_method: challenge_method,
        nonce: params.nonce.clone(),
        state: params.state.clone(),
        session_id: session.id.clone(),
        auth_time: session.data.auth_time.unwrap_or(session.created_at),
        acr: session.data.acr.clone(),
        amr: session.data.amr.clone(),
        used: false,
        used_at: None,
        created_at: now,
        expires_at: now
            + Duration::seconds(state.config.tokens.effective_auth_code_ttl_sec() as i64),
        derived_families: vec![],
    };

    let instance = router::auth_code_instance(state.tenant());
    with_deadline(state.config.deadlines.user_facing_sec, async {
        let mut codes = state.auth_codes.lease(&instance).await;
        codes.store(record).await.map_err(OAuthError::from)
    })
    .await?;

    state.audit.emit(
        SecurityEvent::new(SecurityEventKind::CodeIssued, state.tenant())
            .with_user(&session.user_id)
            .with_client(&client.client_id),
    );

    let mut url = url::Url::parse(redirect_uri)
        .map_err(|_| OAuthError::InvalidRequest("redirect_uri is not a URL".to_string()))?;
    {
        let mut pairs = url.query_pairs_mut();
        pairs.append_pair("code", &code);
        if let Some(oauth_state) = &params.state {
            pairs.append_pair("state", oauth_state);
        }
    }
    Ok(crate::handlers::found_redirect(url.as_str()))
}

/// Resolve the session cookie against its owning shard. `max_age` and
/// `prompt=login` both force re-authentication by pretending there is no
/// session.
async fn resolve_session(
    state: &AppState,
    headers: &HeaderMap,
    max_age: Option<u64>,
    prompt: Option<&str>,
) -> Result<Option<Session>, OAuthError> {
    if prompt == Some("login") {
        return Ok(None);
    }
    let Some(session_id) = session_cookie(headers) else {
        return Ok(None);
    };
    // The id's shard prefix routes the lookup; ids from before a re-shard
    // keep hitting their original instance.
    let Some(instance) = router::session_instance_for_id(state.tenant(), &session_id) else {
        return Ok(None);
    };
    let session = with_deadline(state.config.deadlines.user_facing_sec, async {
        let mut sessions = state.sessions.lease(&instance).await;
        sessions.get(&session_id).await.map_err(OAuthError::from)
    })
    .await?;

    let Some(session) = session else {
        return Ok(None);
    };
    if let Some(max_age) = max_age {
        let auth_time = session.data.auth_time.unwrap_or(session.created_at);
        if Utc::now() - auth_time > Duration::seconds(max_age as i64) {
            return Ok(None);
        }
    }
    Ok(Some(session))
}

fn login_redirect(state: &AppState, params: &AuthorizeParams) -> Response {
    interaction_redirect(&state.config.ui.login_url, state, params)
}

fn consent_redirect(state: &AppState, params: &AuthorizeParams) -> Response {
    interaction_redirect(&state.config.ui.consent_url, state, params)
}

/// Send the browser to the interaction UI with enough context to resume
/// the authorization afterwards.
fn interaction_redirect(target: &str, state: &AppState, params: &AuthorizeParams) -> Response {
    let base = if target.starts_with("http") {
        target.to_string()
    } else {
        format!("{}{}", state.issuer(), target)
    };
    let mut url = match url::Url::parse(&base) {
        Ok(url) => url,
        Err(_) => {
            return OAuthError::ServerError("interaction URL misconfigured".to_string())
                .into_response()
        }
    };
    {
        let mut pairs = url.query_pairs_mut();
        if let Some(client_id) = &params.client_id {
            pairs.append_pair("client_id", client_id);
        }
        if let Some(redirect_uri) = &params.redirect_uri {
            pairs.append_pair("redirect_uri", redirect_uri);
        }
        if let Some(scope) = &params.scope {
            pairs.append_pair("scope", scope);
        }
        if let Some(oauth_state) = &params.state {
            pairs.append_pair("state", oauth_state);
        }
    }
    crate::handlers::found_redirect(url.as_str())
}

async fn resolve_par(
    state: &AppState,
    request_uri: &str,
    presented_client_id: Option<&str>,
) -> Result<AuthorizeParams, OAuthError> {
    let instance = router::challenge_instance(state.tenant());
    let payload = with_deadline(state.config.deadlines.user_facing_sec, async {
        let mut challenges = state.challenges.lease(&instance).await;
        challenges
            .consume(request_uri, ChallengeKind::Par)
            .await
            .map_err(OAuthError::from)
    })
    .await?;

    let Some(payload) = payload else {
        return Err(OAuthError::InvalidRequest(
            "unknown or expired request_uri".to_string(),
        ));
    };
    let staged: AuthorizeParams = serde_json::from_value(payload)
        .map_err(|_| OAuthError::ServerError("corrupt PAR payload".to_string()))?;
    // The pushing client and the authorizing client must be the same.
    if let Some(presented) = presented_client_id {
        if staged.client_id.as_deref() != Some(presented) {
            return Err(OAuthError::InvalidRequest(
                "request_uri does not belong to this client".to_string(),
            ));
        }
    }
    Ok(staged)
}

// ---------------------------------------------------------------------------
// PAR endpoint
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ParForm {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub response_type: Option<String>,
    pub redirect_uri: Option<String>,
    pub scope: Option<String>,
    pub state: Option<String>,
    pub nonce: Option<String>,
    pub code_challenge: Option<String>,
    pub code_challenge_method: Option<String>,
    pub prompt: Option<String>,
    pub max_age: Option<u64>,
}

impl ParForm {
    fn into_params(self) -> AuthorizeParams {
        AuthorizeParams {
            response_type: self.response_type,
            client_id: self.client_id,
            redirect_uri: self.redirect_uri,
            scope: self.scope,
            state: self.state,
            nonce: self.nonce,
            code_challenge: self.code_challenge,
            code_challenge_method: self.code_challenge_method,
            prompt: self.prompt,
            max_age: self.max_age,
            request_uri: None,
        }
    }
}

#[derive(Serialize)]
pub struct ParResponse {
    pub request_uri: String,
    pub expires_in: u64,
}

pub async fn pushed_authorization_request(
    State(state): State<AppState>,
    headers: HeaderMap,
    Form(form): Form<ParForm>,
) -> Result<impl IntoResponse, OAuthError> {
    let client = client_auth::authenticate_from(
        &state,
        &headers,
        form.client_id.as_deref(),
        form.client_secret.as_deref(),
    )?;

    let mut params = form.into_params();
    params.client_id = Some(client.client_id.clone());

    // Validate what can be validated at push time.
    if let Some(redirect_uri) = &params.redirect_uri {
        if !client.redirect_uri_is_registered(redirect_uri) {
            return Err(OAuthError::InvalidRequest(
                "redirect_uri is not registered".to_string(),
            ));
        }
    } else {
        return Err(OAuthError::InvalidRequest(
            "redirect_uri is required".to_string(),
        ));
    }
    if params.response_type.as_deref() != Some("code") {
        return Err(OAuthError::UnsupportedResponseType);
    }

    let request_uri = router::new_par_request_uri();
    let ttl = state.config.tokens.par_request_ttl_sec;
    let instance = router::challenge_instance(state.tenant());
    with_deadline(state.config.deadlines.user_facing_sec, async {
        let mut challenges = state.challenges.lease(&instance).await;
        challenges
            .create(&request_uri, ChallengeKind::Par, json!(params), ttl)
            .await
            .map_err(OAuthError::from)
    })
    .await?;

    Ok((
        axum::http::StatusCode::CREATED,
        Json(ParResponse {
            request_uri,
            expires_in: ttl,
        }),
    ))
}

// ---------------------------------------------------------------------------
// Consent submission
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ConsentForm {
    pub client_id: String,
    pub scope: String,
    pub approve: bool,
}

/// Consent UI posts the user's decision here; the grant is recorded on the
/// session so later authorizations skip the prompt.
pub async fn submit_consent(
    State(state): State<AppState>,
    headers: HeaderMap,
    Form(form): Form<ConsentForm>,
) -> Result<impl IntoResponse, OAuthError> {
    let Some(session_id) = session_cookie(&headers) else {
        return Err(OAuthError::LoginRequired);
    };
    if !form.approve {
        return Err(OAuthError::AccessDenied("consent denied".to_string()));
    }
    let Some(instance) = router::session_instance_for_id(state.tenant(), &session_id) else {
        return Err(OAuthError::LoginRequired);
    };
    let session = with_deadline(state.config.deadlines.user_facing_sec, async {
        let mut sessions = state.sessions.lease(&instance).await;
        sessions
            .grant_consent(&session_id, &form.client_id, &form.scope)
            .await
            .map_err(OAuthError::from)
    })
    .await?;
    if session.is_none() {
        return Err(OAuthError::LoginRequired);
    }
    Ok(Json(json!({ "granted": true })))
}
