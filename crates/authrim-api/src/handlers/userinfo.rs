//! UserInfo endpoint. Claims released are gated by the access token's
//! scope; a PII-store outage degrades the response instead of failing it.

use crate::error::OAuthError;
use crate::handlers::bearer_token;
use crate::tokens::scope_contains;
use crate::AppState;
use authrim_core::resilience::retry::{retry, RetryConfig};
use authrim_crypto::{dpop, verify_with_jwks, AccessClaims};
use authrim_store::router;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use chrono::Utc;
use serde_json::{json, Value};

pub async fn userinfo(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, OAuthError> {
    let Some(token) = bearer_token(&headers) else {
        return Err(OAuthError::InvalidRequest("missing access token".to_string()));
    };

    let policy = state.key_policy();
    let jwks = {
        let instance = router::key_manager_instance(state.tenant());
        let mut keys = state.key_managers.lease(&instance).await;
        keys.verification_jwks(&policy).await?
    };
    let claims: AccessClaims = verify_with_jwks(&token, &jwks, state.issuer())?;

    // Sender-constrained tokens require a proof bound to this request and
    // to the token itself.
    if let Some(cnf) = &claims.cnf {
        let Some(proof) = headers.get("dpop").and_then(|v| v.to_str().ok()) else {
            return Err(OAuthError::InvalidDpopProof(
                "token is DPoP-bound, proof required".to_string(),
            ));
        };
        let htu = format!("{}/userinfo", state.issuer());
        let verified =
            dpop::verify_proof(proof, "GET", &htu, Utc::now().timestamp(), Some(&token))
                .map_err(|e| OAuthError::InvalidDpopProof(e.to_string()))?;
        if verified.jkt != cnf.jkt {
            return Err(OAuthError::InvalidDpopProof(
                "proof key does not match token binding".to_string(),
            ));
        }
    }

    let revoked = {
        let instance = router::revocation_instance(state.tenant());
        let mut revocations = state.revocations.lease(&instance).await;
        revocations
            .is_revoked(&claims.jti)
            .await
            .map_err(OAuthError::from)?
    };
    if revoked {
        return Err(OAuthError::InvalidGrant("token revoked".to_string()));
    }

    let mut body = json!({ "sub": claims.sub });

    // Profile lookup is an external dependency: retried, then degraded.
    let wants_profile =
        scope_contains(&claims.scope, "profile") || scope_contains(&claims.scope, "email");
    if wants_profile {
        // Profile records are keyed by token subject, pairwise or not.
        let profiles = state.profiles.clone();
        let sub = claims.sub.clone();
        let lookup = retry(RetryConfig::default(), || {
            let profiles = profiles.clone();
            let sub = sub.clone();
            async move { profiles.profile(&sub).await }
        })
        .await;

        match lookup {
            Ok(Some(profile)) => {
                if scope_contains(&claims.scope, "profile") {
                    merge_if_some(&mut body, "name", profile.name);
                    merge_if_some(&mut body, "given_name", profile.given_name);
                    merge_if_some(&mut body, "family_name", profile.family_name);
                    merge_if_some(&mut body, "picture", profile.picture);
                    merge_if_some(&mut body, "locale", profile.locale);
                }
                if scope_contains(&claims.scope, "email") {
                    merge_if_some(&mut body, "email", profile.email);
                    if let Some(verified) = profile.email_verified {
                        body["email_verified"] = json!(verified);
                    }
                }
            }
            Ok(None) => {}
            Err(err) => {
                tracing::error!(error = %err, "profile store unavailable, degrading userinfo");
                body["_degraded"] = json!(true);
            }
        }
    }

    if let Some(permissions) = claims.authrim_permissions {
        body["authrim_permissions"] = json!(permissions);
    }

    Ok(Json(body))
}

fn merge_if_some(body: &mut Value, key: &str, value: Option<String>) {
    if let Some(value) = value {
        body[key] = json!(value);
    }
}
