//! RFC 6749-shaped protocol errors.
//!
//! Two surfaces: a direct JSON body for token-style endpoints, and an
//! error redirect for the authorize endpoint once the `redirect_uri` has
//! been validated. RBAC denials extend the envelope with
//! `required_roles` / `missing_roles`.

use authrim_core::StoreError;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

#[derive(Debug)]
pub enum OAuthError {
    InvalidRequest(String),
    InvalidClient,
    InvalidGrant(String),
    UnauthorizedClient,
    UnsupportedGrantType,
    UnsupportedResponseType,
    InvalidScope(String),
    AccessDenied(String),
    LoginRequired,
    ConsentRequired,
    InvalidDpopProof(String),
    /// RFC 8628 / CIBA polling states.
    AuthorizationPending,
    SlowDown,
    ExpiredToken,
    InsufficientRoles {
        required: Vec<String>,
        missing: Vec<String>,
    },
    RateLimited {
        retry_after_sec: u64,
    },
    TemporarilyUnavailable,
    ServerError(String),
}

#[derive(Serialize)]
pub struct ErrorBody {
    pub error: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub required_roles: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub missing_roles: Option<Vec<String>>,
}

impl OAuthError {
    pub fn code(&self) -> &'static str {
        match self {
            OAuthError::InvalidRequest(_) => "invalid_request",
            OAuthError::InvalidClient => "invalid_client",
            OAuthError::InvalidGrant(_) => "invalid_grant",
            OAuthError::UnauthorizedClient => "unauthorized_client",
            OAuthError::UnsupportedGrantType => "unsupported_grant_type",
            OAuthError::UnsupportedResponseType => "unsupported_response_type",
            OAuthError::InvalidScope(_) => "invalid_scope",
            OAuthError::AccessDenied(_) => "access_denied",
            OAuthError::LoginRequired => "login_required",
            OAuthError::ConsentRequired => "consent_required",
            OAuthError::InvalidDpopProof(_) => "invalid_dpop_proof",
            OAuthError::AuthorizationPending => "authorization_pending",
            OAuthError::SlowDown => "slow_down",
            OAuthError::ExpiredToken => "expired_token",
            OAuthError::InsufficientRoles { .. } => "access_denied",
            OAuthError::RateLimited { .. } => "rate_limit_exceeded",
            OAuthError::TemporarilyUnavailable => "temporarily_unavailable",
            OAuthError::ServerError(_) => "server_error",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            OAuthError::InvalidClient => StatusCode::UNAUTHORIZED,
            OAuthError::InsufficientRoles { .. } => StatusCode::FORBIDDEN,
            OAuthError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            OAuthError::TemporarilyUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            OAuthError::ServerError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        }
    }

    fn description(&self) -> Option<String> {
        match self {
            OAuthError::InvalidRequest(d)
            | OAuthError::InvalidGrant(d)
            | OAuthError::InvalidScope(d)
            | OAuthError::AccessDenied(d)
            | OAuthError::InvalidDpopProof(d) => Some(d.clone()),
            OAuthError::ServerError(d) => {
                // Internal detail stays in the log, not the response.
                tracing::error!(detail = %d, "server error");
                None
            }
            _ => None,
        }
    }

    /// Error redirect for the authorize endpoint. Only call with a
    /// validated `redirect_uri`.
    pub fn into_redirect(self, redirect_uri: &str, state: Option<&str>) -> Response {
        let mut url = match url::Url::parse(redirect_uri) {
            Ok(url) => url,
            Err(_) => return self.into_response(),
        };
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("error", self.code());
            if let Some(description) = self.description() {
                pairs.append_pair("error_description", &description);
            }
            if let Some(state) = state {
                pairs.append_pair("state", state);
            }
        }
        crate::handlers::found_redirect(url.as_str())
    }
}

impl IntoResponse for OAuthError {
    fn into_response(self) -> Response {
        let status = self.status();
        let (required_roles, missing_roles) = match &self {
            OAuthError::InsufficientRoles { required, missing } => {
                (Some(required.clone()), Some(missing.clone()))
            }
            _ => (None, None),
        };
        let retry_after = match &self {
            OAuthError::RateLimited { retry_after_sec } => Some(*retry_after_sec),
            _ => None,
        };
        let body = ErrorBody {
            error: self.code(),
            error_description: self.description(),
            required_roles,
            missing_roles,
        };
        let mut response = (status, Json(body)).into_response();
        if let Some(seconds) = retry_after {
            if let Ok(value) = seconds.to_string().parse() {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        if matches!(self, OAuthError::InvalidClient) {
            if let Ok(value) = "Basic realm=\"token\"".parse() {
                response
                    .headers_mut()
                    .insert(header::WWW_AUTHENTICATE, value);
            }
        }
        response
    }
}

impl From<StoreError> for OAuthError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::InvalidGrant { reason } => OAuthError::InvalidGrant(reason),
            // Security events should be handled explicitly so the cascade
            // fires; reaching this conversion means the handler already did.
            StoreError::CodeReplay { .. } => {
                OAuthError::InvalidGrant("authorization code replay".to_string())
            }
            StoreError::TokenTheft { .. } => {
                OAuthError::InvalidGrant("refresh token reuse".to_string())
            }
            StoreError::ScopeWidening { requested } => OAuthError::InvalidScope(requested),
            StoreError::Conflict { message } => OAuthError::InvalidRequest(message),
            StoreError::Storage(_) => OAuthError::TemporarilyUnavailable,
            StoreError::StateDecode(detail) | StoreError::Invariant { message: detail } => {
                OAuthError::ServerError(detail)
            }
        }
    }
}

impl From<authrim_crypto::KeyError> for OAuthError {
    fn from(err: authrim_crypto::KeyError) -> Self {
        match err {
            authrim_crypto::KeyError::Storage(_) => OAuthError::TemporarilyUnavailable,
            other => OAuthError::ServerError(other.to_string()),
        }
    }
}

impl From<authrim_crypto::JwtError> for OAuthError {
    fn from(err: authrim_crypto::JwtError) -> Self {
        match err {
            authrim_crypto::JwtError::Expired => {
                OAuthError::InvalidGrant("token expired".to_string())
            }
            _ => OAuthError::InvalidGrant("token validation failed".to_string()),
        }
    }
}
