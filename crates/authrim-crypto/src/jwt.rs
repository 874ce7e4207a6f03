//! JWT claim sets and verification against a published key set.

use crate::keys::{decoding_key_for, JwkSet, KeyError};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use jsonwebtoken::{decode, decode_header, Validation};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum JwtError {
    #[error("token expired")]
    Expired,
    #[error("token validation failed: {reason}")]
    Validation { reason: String },
    #[error("invalid token format")]
    InvalidFormat,
    #[error("unknown signing key: {0}")]
    UnknownKid(String),
    #[error("key error: {0}")]
    Key(#[from] KeyError),
}

/// Access-token claims. `cnf.jkt` binds the token to a DPoP key;
/// `authrim_permissions` carries the RBAC layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessClaims {
    pub iss: String,
    pub sub: String,
    pub aud: String,
    pub exp: i64,
    pub iat: i64,
    pub jti: String,
    pub scope: String,
    pub client_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cnf: Option<Confirmation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authrim_permissions: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Confirmation {
    /// JWK SHA-256 thumbprint of the bound proof key.
    pub jkt: String,
}

/// ID-token claims.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdClaims {
    pub iss: String,
    pub sub: String,
    pub aud: String,
    pub exp: i64,
    pub iat: i64,
    pub auth_time: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amr: Option<Vec<String>>,
    pub azp: String,
    pub sid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub at_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub c_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub roles: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authrim_permissions: Option<Vec<String>>,
}

/// Refresh-token claims. `rtv` is the family version at issuance; the
/// rotator compares it against the persisted version to detect stale
/// tokens that still carry the current jti.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshClaims {
    pub iss: String,
    pub sub: String,
    pub aud: String,
    pub exp: i64,
    pub iat: i64,
    pub jti: String,
    pub rtv: u64,
    pub scope: String,
    pub client_id: String,
    pub sid: String,
}

/// OIDC `at_hash` / `c_hash`: base64url of the left half of SHA-256.
pub fn token_hash(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    URL_SAFE_NO_PAD.encode(&digest[..16])
}

/// Verify a JWS against the key set, resolving the key by `kid`.
///
/// Audience is intentionally not validated here; callers check it against
/// their own expectations (access tokens and refresh tokens carry
/// different audiences).
pub fn verify_with_jwks<T: DeserializeOwned>(
    token: &str,
    jwks: &JwkSet,
    expected_issuer: &str,
) -> Result<T, JwtError> {
    verify_inner(token, jwks, expected_issuer, true)
}

/// Signature and issuer are enforced but expiry is not. For
/// `id_token_hint` at logout, where the presented token may legitimately
/// have expired already.
pub fn verify_with_jwks_expired_ok<T: DeserializeOwned>(
    token: &str,
    jwks: &JwkSet,
    expected_issuer: &str,
) -> Result<T, JwtError> {
    verify_inner(token, jwks, expected_issuer, false)
}

fn verify_inner<T: DeserializeOwned>(
    token: &str,
    jwks: &JwkSet,
    expected_issuer: &str,
    validate_exp: bool,
) -> Result<T, JwtError> {
    let header = decode_header(token).map_err(|_| JwtError::InvalidFormat)?;
    let kid = header.kid.ok_or(JwtError::InvalidFormat)?;
    let jwk = jwks.find(&kid).ok_or_else(|| JwtError::UnknownKid(kid.clone()))?;
    let algorithm = match jwk.alg.as_str() {
        "RS256" => jsonwebtoken::Algorithm::RS256,
        "ES256" => jsonwebtoken::Algorithm::ES256,
        _ => return Err(JwtError::InvalidFormat),
    };
    let mut validation = Validation::new(algorithm);
    validation.set_issuer(&[expected_issuer]);
    validation.validate_aud = false;
    // ±5 s instance skew tolerance.
    validation.leeway = 5;
    if !validate_exp {
        validation.validate_exp = false;
        validation.required_spec_claims.remove("exp");
    }

    let key = decoding_key_for(jwk)?;
    let data = decode::<T>(token, &key, &validation).map_err(|e| match e.kind() {
        jsonwebtoken::errors::ErrorKind::ExpiredSignature => JwtError::Expired,
        _ => JwtError::Validation {
            reason: e.to_string(),
        },
    })?;
    Ok(data.claims)
}

/// Decode claims without verifying the signature, for introspection of
/// tokens that may be signed by keys we no longer accept.
pub fn peek_claims<T: DeserializeOwned>(token: &str) -> Result<T, JwtError> {
    let mut parts = token.split('.');
    let (_header, payload) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(h), Some(p), Some(_sig), None) => (h, p),
        _ => return Err(JwtError::InvalidFormat),
    };
    let bytes = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|_| JwtError::InvalidFormat)?;
    serde_json::from_slice(&bytes).map_err(|_| JwtError::InvalidFormat)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{KeyManager, KeyPolicy, SigningAlgorithm};
    use authrim_store::{ActorHost, MemoryStorage};
    use chrono::Utc;
    use std::sync::Arc;

    fn policy() -> KeyPolicy {
        KeyPolicy {
            algorithm: SigningAlgorithm::ES256,
            rotation_interval_days: 30,
            retention_days: 7,
        }
    }

    fn claims(now: i64) -> AccessClaims {
        AccessClaims {
            iss: "https://op.example".to_string(),
            sub: "user-1".to_string(),
            aud: "https://rp.example".to_string(),
            exp: now + 3600,
            iat: now,
            jti: "jti-1".to_string(),
            scope: "openid profile".to_string(),
            client_id: "c1".to_string(),
            sid: None,
            cnf: None,
            authrim_permissions: None,
        }
    }

    #[tokio::test]
    async fn sign_verify_round_trip() {
        let host = ActorHost::<KeyManager>::new(Arc::new(MemoryStorage::new()));
        let mut manager = host.lease("tenant:t:keys").await;
        let policy = policy();

        let claims = claims(Utc::now().timestamp());
        let (jws, kid) = manager.sign(&policy, &claims).await.unwrap();
        let jwks = manager.jwks(&policy).await.unwrap();
        assert!(jwks.find(&kid).is_some());

        let decoded: AccessClaims =
            verify_with_jwks(&jws, &jwks, "https://op.example").unwrap();
        assert_eq!(decoded.sub, claims.sub);
        assert_eq!(decoded.scope, claims.scope);
    }

    #[tokio::test]
    async fn tokens_survive_rotation_via_retained_key() {
        let host = ActorHost::<KeyManager>::new(Arc::new(MemoryStorage::new()));
        let mut manager = host.lease("tenant:t:keys").await;
        let policy = policy();

        let claims = claims(Utc::now().timestamp());
        let (jws, _) = manager.sign(&policy, &claims).await.unwrap();
        manager.rotate(&policy, Utc::now()).await.unwrap();

        let jwks = manager.verification_jwks(&policy).await.unwrap();
        let decoded: AccessClaims =
            verify_with_jwks(&jws, &jwks, "https://op.example").unwrap();
        assert_eq!(decoded.jti, "jti-1");
    }

    #[tokio::test]
    async fn emergency_rotation_invalidates_in_flight_tokens() {
        let host = ActorHost::<KeyManager>::new(Arc::new(MemoryStorage::new()));
        let mut manager = host.lease("tenant:t:keys").await;
        let policy = policy();

        let claims = claims(Utc::now().timestamp());
        let (jws, _) = manager.sign(&policy, &claims).await.unwrap();
        manager
            .rotate_emergency(&policy, Utc::now(), "test")
            .await
            .unwrap();

        let jwks = manager.verification_jwks(&policy).await.unwrap();
        let result: Result<AccessClaims, _> = verify_with_jwks(&jws, &jwks, "https://op.example");
        assert!(matches!(result, Err(JwtError::UnknownKid(_))));
    }

    #[tokio::test]
    async fn expired_token_is_rejected() {
        let host = ActorHost::<KeyManager>::new(Arc::new(MemoryStorage::new()));
        let mut manager = host.lease("tenant:t:keys").await;
        let policy = policy();

        let mut expired = claims(Utc::now().timestamp() - 7200);
        expired.exp = Utc::now().timestamp() - 3600;
        let (jws, _) = manager.sign(&policy, &expired).await.unwrap();
        let jwks = manager.jwks(&policy).await.unwrap();

        let result: Result<AccessClaims, _> = verify_with_jwks(&jws, &jwks, "https://op.example");
        assert!(matches!(result, Err(JwtError::Expired)));
    }

    #[test]
    fn token_hash_is_left_half_sha256() {
        // 16 bytes of SHA-256 -> 22 base64url chars, stable across calls.
        let hash = token_hash("dummy-token");
        assert_eq!(hash.len(), 22);
        assert_eq!(hash, token_hash("dummy-token"));
        assert_ne!(hash, token_hash("other-token"));
    }
}
