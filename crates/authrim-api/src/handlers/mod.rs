//! Protocol endpoint handlers.

pub mod admin;
pub mod authorize;
pub mod ciba;
pub mod device;
pub mod discovery;
pub mod health;
pub mod introspect;
pub mod jwks;
pub mod logout;
pub mod register;
pub mod revoke;
pub mod token;
pub mod userinfo;

use axum::http::header::{COOKIE, LOCATION};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};

pub const SESSION_COOKIE: &str = "sid";

/// 302 Found, the redirect status OAuth front-channel responses use.
pub fn found_redirect(location: &str) -> Response {
    (StatusCode::FOUND, [(LOCATION, location.to_string())]).into_response()
}

/// Extract the session id from the `sid` cookie.
pub fn session_cookie(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(COOKIE)?.to_str().ok()?;
    raw.split(';').find_map(|pair| {
        let (name, value) = pair.trim().split_once('=')?;
        if name == SESSION_COOKIE && !value.is_empty() {
            Some(value.to_string())
        } else {
            None
        }
    })
}

/// Bearer token from the Authorization header; `DPoP` scheme is accepted
/// for sender-constrained tokens.
pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let raw = headers
        .get(axum::http::header::AUTHORIZATION)?
        .to_str()
        .ok()?;
    raw.strip_prefix("Bearer ")
        .or_else(|| raw.strip_prefix("DPoP "))
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}
