//! OIDC discovery document.

use crate::AppState;
use axum::extract::State;
use axum::Json;
use serde::Serialize;

#[derive(Serialize)]
pub struct DiscoveryDocument {
    pub issuer: String,
    pub authorization_endpoint: String,
    pub pushed_authorization_request_endpoint: String,
    pub token_endpoint: String,
    pub introspection_endpoint: String,
    pub revocation_endpoint: String,
    pub userinfo_endpoint: String,
    pub jwks_uri: String,
    pub registration_endpoint: String,
    pub end_session_endpoint: String,
    pub device_authorization_endpoint: String,
    pub backchannel_authentication_endpoint: String,
    pub response_types_supported: Vec<&'static str>,
    pub grant_types_supported: Vec<&'static str>,
    pub subject_types_supported: Vec<&'static str>,
    pub id_token_signing_alg_values_supported: Vec<&'static str>,
    pub scopes_supported: Vec<&'static str>,
    pub token_endpoint_auth_methods_supported: Vec<&'static str>,
    pub code_challenge_methods_supported: Vec<&'static str>,
    pub dpop_signing_alg_values_supported: Vec<&'static str>,
    pub claims_supported: Vec<&'static str>,
    pub backchannel_logout_supported: bool,
}

pub async fn openid_configuration(State(state): State<AppState>) -> Json<DiscoveryDocument> {
    let issuer = state.issuer().to_string();
    let at = |path: &str| format!("{issuer}{path}");
    Json(DiscoveryDocument {
        authorization_endpoint: at("/authorize"),
        pushed_authorization_request_endpoint: at("/as/par"),
        token_endpoint: at("/token"),
        introspection_endpoint: at("/introspect"),
        revocation_endpoint: at("/revoke"),
        userinfo_endpoint: at("/userinfo"),
        jwks_uri: at("/.well-known/jwks.json"),
        registration_endpoint: at("/register"),
        end_session_endpoint: at("/logout"),
        device_authorization_endpoint: at("/device_authorization"),
        backchannel_authentication_endpoint: at("/bc-authorize"),
        issuer,
        response_types_supported: vec!["code"],
        grant_types_supported: vec![
            "authorization_code",
            "refresh_token",
            "urn:ietf:params:oauth:grant-type:device_code",
            "urn:openid:params:grant-type:ciba",
        ],
        subject_types_supported: vec!["public", "pairwise"],
        id_token_signing_alg_values_supported: vec!["RS256", "ES256"],
        scopes_supported: vec!["openid", "profile", "email", "offline_access"],
        token_endpoint_auth_methods_supported: vec![
            "client_secret_basic",
            "client_secret_post",
            "none",
        ],
        code_challenge_methods_supported: vec!["S256", "plain"],
        dpop_signing_alg_values_supported: vec!["ES256", "RS256"],
        claims_supported: vec![
            "sub", "iss", "aud", "exp", "iat", "auth_time", "nonce", "acr", "amr", "sid",
            "name", "email", "email_verified", "roles", "authrim_permissions",
        ],
        backchannel_logout_supported: true,
    })
}
