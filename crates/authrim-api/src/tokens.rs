//! Token minting shared by every grant.

use crate::clients::{ClientMetadata, SubjectType};
use crate::error::OAuthError;
use crate::AppState;
use authrim_core::models::DerivedFamilyRef;
use authrim_core::stores::{NewFamily, RotationOutcome};
use authrim_crypto::{token_hash, AccessClaims, Confirmation, IdClaims, RefreshClaims};
use authrim_store::router;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use secrecy::ExposeSecret;
use sha2::{Digest, Sha256};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct IssuedTokens {
    pub access_token: String,
    pub token_type: &'static str,
    pub expires_in: u64,
    pub id_token: Option<String>,
    pub refresh_token: Option<String>,
    pub scope: String,
}

/// Everything the minting path needs to know about the authorization.
pub struct GrantContext<'a> {
    pub client: &'a ClientMetadata,
    pub user_id: &'a str,
    pub session_id: &'a str,
    pub scope: &'a str,
    pub nonce: Option<&'a str>,
    pub auth_time: DateTime<Utc>,
    pub acr: Option<String>,
    pub amr: Vec<String>,
    /// Present on the authorization-code grant, feeds `c_hash`.
    pub code: Option<&'a str>,
    pub dpop_jkt: Option<String>,
    /// Whether to mint a refresh-token family for this grant.
    pub with_refresh: bool,
}

/// Subject per the client's registered subject type. Pairwise subjects are
/// `SHA-256(userId || clientId || salt)`, base64url-encoded.
pub fn subject_for(state: &AppState, client: &ClientMetadata, user_id: &str) -> String {
    match client.subject_type {
        SubjectType::Public => user_id.to_string(),
        SubjectType::Pairwise => {
            let mut hasher = Sha256::new();
            hasher.update(user_id.as_bytes());
            hasher.update(client.client_id.as_bytes());
            hasher.update(state.config.issuer.pairwise_salt.expose_secret().as_bytes());
            URL_SAFE_NO_PAD.encode(hasher.finalize())
        }
    }
}

/// Mint the access/ID/refresh token set for a fresh authorization. Returns
/// the routing ref of the created refresh family (if any) so the
/// authorization-code path can link it to its code.
pub async fn issue_tokens(
    state: &AppState,
    grant: GrantContext<'_>,
) -> Result<(IssuedTokens, Option<DerivedFamilyRef>), OAuthError> {
    let now = Utc::now();
    let tenant = state.tenant().to_string();
    let policy = state.key_policy();
    let subject = subject_for(state, grant.client, grant.user_id);

    // RBAC layer: failures degrade to empty claims, never block issuance.
    let authorization = state
        .permissions
        .authorization_for(grant.user_id)
        .await
        .unwrap_or_else(|err| {
            tracing::warn!(error = %err, "permission lookup failed, issuing without RBAC claims");
            Default::default()
        });

    let access_ttl = state.config.tokens.access_token_ttl_sec;
    let access_claims = AccessClaims {
        iss: state.issuer().to_string(),
        sub: subject.clone(),
        aud: grant.client.client_id.clone(),
        exp: now.timestamp() + access_ttl as i64,
        iat: now.timestamp(),
        jti: Uuid::new_v4().to_string(),
        scope: grant.scope.to_string(),
        client_id: grant.client.client_id.clone(),
        sid: Some(grant.session_id.to_string()),
        cnf: grant.dpop_jkt.clone().map(|jkt| Confirmation { jkt }),
        authrim_permissions: if authorization.permissions.is_empty() {
            None
        } else {
            Some(authorization.permissions.clone())
        },
    };

    let key_instance = router::key_manager_instance(&tenant);
    let (access_token, id_token, refresh_token, family_ref) = {
        let mut keys = state.key_managers.lease(&key_instance).await;
        let (access_token, _) = keys.sign(&policy, &access_claims).await?;

        let id_token = if scope_contains(grant.scope, "openid") {
            let rbac_whitelist = &state.config.rbac.rbac_id_token_claims;
            let id_claims = IdClaims {
                iss: state.issuer().to_string(),
                sub: subject.clone(),
                aud: grant.client.client_id.clone(),
                exp: now.timestamp() + state.config.tokens.id_token_ttl_sec as i64,
                iat: now.timestamp(),
                auth_time: grant.auth_time.timestamp(),
                nonce: grant.nonce.map(str::to_string),
                acr: grant.acr.clone(),
                amr: if grant.amr.is_empty() {
                    None
                } else {
                    Some(grant.amr.clone())
                },
                azp: grant.client.client_id.clone(),
                sid: grant.session_id.to_string(),
                at_hash: Some(token_hash(&access_token)),
                c_hash: grant.code.map(token_hash),
                roles: whitelist_claim(rbac_whitelist, "roles", &authorization.roles),
                authrim_permissions: whitelist_claim(
                    rbac_whitelist,
                    "authrim_permissions",
                    &authorization.permissions,
                ),
            };
            let (id_token, _) = keys.sign(&policy, &id_claims).await?;
            Some(id_token)
        } else {
            None
        };

        let (refresh_token, family_ref) = if grant.with_refresh {
            // Route by the shard config current *now*; the family pins this
            // generation for its whole life.
            let shard_config = state
                .shard_cache
                .current(
                    &state.shard_configs,
                    &router::shard_config_instance(&tenant),
                    state.config.sharding.refresh_token_default_shard_count,
                )
                .await
                .map_err(OAuthError::from)?;
            let generation = shard_config.current_generation;
            let shard = router::refresh_shard_for(
                grant.user_id,
                &grant.client.client_id,
                shard_config.current_shard_count,
            );
            let jti = router::new_refresh_jti(generation, shard);

            let family = {
                let instance =
                    router::refresh_instance(&tenant, &grant.client.client_id, generation, shard);
                let mut rotator = state.rotators.lease(&instance).await;
                rotator
                    .create_family(NewFamily {
                        user_id: grant.user_id.to_string(),
                        client_id: grant.client.client_id.clone(),
                        allowed_scope: grant.scope.to_string(),
                        initial_jti: jti.clone(),
                        session_id: grant.session_id.to_string(),
                        auth_time: grant.auth_time,
                        generation,
                        shard,
                        ttl_sec: state.config.tokens.refresh_token_ttl_sec,
                    })
                    .await
                    .map_err(OAuthError::from)?
            };

            let refresh_claims = RefreshClaims {
                iss: state.issuer().to_string(),
                sub: subject.clone(),
                aud: grant.client.client_id.clone(),
                exp: family.expires_at.timestamp(),
                iat: now.timestamp(),
                jti,
                rtv: 0,
                scope: grant.scope.to_string(),
                client_id: grant.client.client_id.clone(),
                sid: grant.session_id.to_string(),
            };
            let (refresh_token, _) = keys.sign(&policy, &refresh_claims).await?;
            (
                Some(refresh_token),
                Some(DerivedFamilyRef {
                    family_id: family.id,
                    client_id: grant.client.client_id.clone(),
                    generation,
                    shard,
                }),
            )
        } else {
            (None, None)
        };

        (access_token, id_token, refresh_token, family_ref)
    };

    Ok((
        IssuedTokens {
            access_token,
            token_type: if grant.dpop_jkt.is_some() { "DPoP" } else { "Bearer" },
            expires_in: access_ttl,
            id_token,
            refresh_token,
            scope: grant.scope.to_string(),
        },
        family_ref,
    ))
}

/// Mint the successor token set after a legitimate rotation.
pub async fn issue_for_rotation(
    state: &AppState,
    client: &ClientMetadata,
    outcome: &RotationOutcome,
    dpop_jkt: Option<String>,
) -> Result<IssuedTokens, OAuthError> {
    let now = Utc::now();
    let tenant = state.tenant().to_string();
    let policy = state.key_policy();
    let subject = subject_for(state, client, &outcome.user_id);

    let authorization = state
        .permissions
        .authorization_for(&outcome.user_id)
        .await
        .unwrap_or_default();

    let access_ttl = state.config.tokens.access_token_ttl_sec;
    let access_claims = AccessClaims {
        iss: state.issuer().to_string(),
        sub: subject.clone(),
        aud: client.client_id.clone(),
        exp: now.timestamp() + access_ttl as i64,
        iat: now.timestamp(),
        jti: Uuid::new_v4().to_string(),
        scope: outcome.scope.clone(),
        client_id: client.client_id.clone(),
        sid: Some(outcome.session_id.clone()),
        cnf: dpop_jkt.clone().map(|jkt| Confirmation { jkt }),
        authrim_permissions: if authorization.permissions.is_empty() {
            None
        } else {
            Some(authorization.permissions.clone())
        },
    };

    let key_instance = router::key_manager_instance(&tenant);
    let mut keys = state.key_managers.lease(&key_instance).await;
    let (access_token, _) = keys.sign(&policy, &access_claims).await?;

    let id_token = if scope_contains(&outcome.scope, "openid") {
        let id_claims = IdClaims {
            iss: state.issuer().to_string(),
            sub: subject.clone(),
            aud: client.client_id.clone(),
            exp: now.timestamp() + state.config.tokens.id_token_ttl_sec as i64,
            iat: now.timestamp(),
            auth_time: outcome.auth_time.timestamp(),
            nonce: None,
            acr: None,
            amr: None,
            azp: client.client_id.clone(),
            sid: outcome.session_id.clone(),
            at_hash: Some(token_hash(&access_token)),
            c_hash: None,
            roles: whitelist_claim(
                &state.config.rbac.rbac_id_token_claims,
                "roles",
                &authorization.roles,
            ),
            authrim_permissions: whitelist_claim(
                &state.config.rbac.rbac_id_token_claims,
                "authrim_permissions",
                &authorization.permissions,
            ),
        };
        let (id_token, _) = keys.sign(&policy, &id_claims).await?;
        Some(id_token)
    } else {
        None
    };

    let refresh_claims = RefreshClaims {
        iss: state.issuer().to_string(),
        sub: subject,
        aud: client.client_id.clone(),
        exp: outcome.expires_at.timestamp(),
        iat: now.timestamp(),
        jti: outcome.new_jti.clone(),
        rtv: outcome.version,
        scope: outcome.scope.clone(),
        client_id: client.client_id.clone(),
        sid: outcome.session_id.clone(),
    };
    let (refresh_token, _) = keys.sign(&policy, &refresh_claims).await?;

    Ok(IssuedTokens {
        access_token,
        token_type: if dpop_jkt.is_some() { "DPoP" } else { "Bearer" },
        expires_in: access_ttl,
        id_token,
        refresh_token: Some(refresh_token),
        scope: outcome.scope.clone(),
    })
}

pub fn scope_contains(scope: &str, token: &str) -> bool {
    scope.split(' ').any(|s| s == token)
}

fn whitelist_claim(
    whitelist: &[String],
    claim: &str,
    values: &[String],
) -> Option<Vec<String>> {
    if values.is_empty() || !whitelist.iter().any(|w| w == claim) {
        return None;
    }
    Some(values.to_vec())
}
