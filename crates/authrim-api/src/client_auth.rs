//! Client authentication for the token-style endpoints.
//!
//! Supports `client_secret_basic`, `client_secret_post`, and `none`
//! (public clients, which must carry PKCE instead). Secret comparison is
//! constant-time; every failure collapses to a generic `invalid_client`.

use crate::clients::{ClientAuthMethod, ClientMetadata};
use crate::error::OAuthError;
use crate::AppState;
use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;

/// Credentials as presented, before verification.
pub struct PresentedCredentials {
    pub client_id: String,
    pub client_secret: Option<String>,
}

pub fn extract_credentials(
    headers: &HeaderMap,
    body_client_id: Option<&str>,
    body_client_secret: Option<&str>,
) -> Result<PresentedCredentials, OAuthError> {
    if let Some(value) = headers.get(AUTHORIZATION) {
        let value = value.to_str().map_err(|_| OAuthError::InvalidClient)?;
        if let Some(encoded) = value.strip_prefix("Basic ") {
            let decoded = STANDARD
                .decode(encoded.trim())
                .map_err(|_| OAuthError::InvalidClient)?;
            let decoded = String::from_utf8(decoded).map_err(|_| OAuthError::InvalidClient)?;
            let (id, secret) = decoded
                .split_once(':')
                .ok_or(OAuthError::InvalidClient)?;
            return Ok(PresentedCredentials {
                client_id: id.to_string(),
                client_secret: Some(secret.to_string()),
            });
        }
    }
    let client_id = body_client_id
        .filter(|id| !id.is_empty())
        .ok_or(OAuthError::InvalidClient)?;
    Ok(PresentedCredentials {
        client_id: client_id.to_string(),
        client_secret: body_client_secret.map(str::to_string),
    })
}

pub fn authenticate(
    state: &AppState,
    presented: PresentedCredentials,
) -> Result<ClientMetadata, OAuthError> {
    let Some(client) = state.clients.get(&presented.client_id) else {
        return Err(OAuthError::InvalidClient);
    };
    match client.metadata.token_endpoint_auth_method {
        ClientAuthMethod::None => {
            // Public client: no secret expected; presenting one anyway is
            // rejected rather than silently ignored.
            if presented.client_secret.as_deref().unwrap_or("").is_empty() {
                Ok(client.metadata.clone())
            } else {
                Err(OAuthError::InvalidClient)
            }
        }
        ClientAuthMethod::ClientSecretBasic | ClientAuthMethod::ClientSecretPost => {
            let Some(secret) = presented.client_secret else {
                return Err(OAuthError::InvalidClient);
            };
            if client.secret_matches(&secret) {
                Ok(client.metadata.clone())
            } else {
                Err(OAuthError::InvalidClient)
            }
        }
    }
}

/// Convenience wrapper used by every token-style handler.
pub fn authenticate_from(
    state: &AppState,
    headers: &HeaderMap,
    body_client_id: Option<&str>,
    body_client_secret: Option<&str>,
) -> Result<ClientMetadata, OAuthError> {
    let presented = extract_credentials(headers, body_client_id, body_client_secret)?;
    authenticate(state, presented)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_header_is_parsed() {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            format!("Basic {}", STANDARD.encode("c1:secret")).parse().unwrap(),
        );
        let creds = extract_credentials(&headers, None, None).unwrap();
        assert_eq!(creds.client_id, "c1");
        assert_eq!(creds.client_secret.as_deref(), Some("secret"));
    }

    #[test]
    fn body_credentials_are_a_fallback() {
        let headers = HeaderMap::new();
        let creds = extract_credentials(&headers, Some("c1"), Some("s")).unwrap();
        assert_eq!(creds.client_id, "c1");
        assert!(extract_credentials(&headers, None, None).is_err());
    }
}
