//! Routing stability across shard-count changes: tokens issued before a
//! re-shard keep reaching their original instance through the generation
//! embedded in their identifiers.

use authrim_api::clients::{ClientAuthMethod, ClientMetadata, SubjectType};
use authrim_api::AppState;
use authrim_config::CoreConfig;
use authrim_core::models::SessionData;
use authrim_store::{router, MemoryStorage};
use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use http_body_util::BodyExt;
use std::sync::Arc;
use tower::ServiceExt;

const VERIFIER: &str = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
const CHALLENGE: &str = "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM";

const ADMIN_KEY: &str = "test-admin-key";

async fn build() -> (Router, AppState) {
    let mut config = CoreConfig::default();
    config.keys.signing_algorithm = "ES256".to_string();
    config.admin.api_key = Some(secrecy::Secret::new(ADMIN_KEY.to_string()));
    let state = AppState::build(config, Arc::new(MemoryStorage::new()));
    state.clients.insert(
        ClientMetadata {
            client_id: "c1".to_string(),
            client_name: None,
            redirect_uris: vec!["https://rp/cb".to_string()],
            grant_types: vec![
                "authorization_code".to_string(),
                "refresh_token".to_string(),
            ],
            allowed_scopes: vec!["openid".to_string(), "offline_access".to_string()],
            token_endpoint_auth_method: ClientAuthMethod::ClientSecretBasic,
            subject_type: SubjectType::Public,
            require_consent: false,
            require_pkce: false,
            allow_plain_pkce: false,
            allow_empty_scope: false,
            backchannel_logout_uri: None,
        },
        Some("S".to_string()),
    );
    (authrim_api::app(state.clone()), state)
}

async fn issue_refresh_token(app: &Router, state: &AppState, user: &str) -> String {
    let shard = router::session_shard_for_user(user, state.config.sharding.session_shard_count);
    let instance = router::session_instance(state.tenant(), shard);
    let session = {
        let mut sessions = state.sessions.lease(&instance).await;
        sessions
            .create(
                user,
                shard,
                3600,
                SessionData {
                    auth_time: Some(chrono::Utc::now()),
                    ..Default::default()
                },
            )
            .await
            .unwrap()
    };

    let uri = format!(
        "/authorize?response_type=code&client_id=c1&redirect_uri=https%3A%2F%2Frp%2Fcb\
         &scope=openid&code_challenge={CHALLENGE}&code_challenge_method=S256"
    );
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(uri)
                .header(header::COOKIE, format!("sid={}", session.id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FOUND);
    let location = response.headers()[header::LOCATION].to_str().unwrap();
    let code = location
        .split('?')
        .nth(1)
        .unwrap()
        .split('&')
        .find_map(|p| p.strip_prefix("code="))
        .unwrap()
        .to_string();

    let body = format!(
        "grant_type=authorization_code&code={code}&redirect_uri=https%3A%2F%2Frp%2Fcb&code_verifier={VERIFIER}"
    );
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/token")
                .header(
                    header::AUTHORIZATION,
                    format!("Basic {}", STANDARD.encode("c1:S")),
                )
                .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    json["refresh_token"].as_str().unwrap().to_string()
}

async fn rotate(app: &Router, refresh: &str) -> (StatusCode, serde_json::Value) {
    let body = format!("grant_type=refresh_token&refresh_token={refresh}");
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/token")
                .header(
                    header::AUTHORIZATION,
                    format!("Basic {}", STANDARD.encode("c1:S")),
                )
                .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (
        status,
        serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null),
    )
}

fn jti_of(refresh: &str) -> String {
    let payload = refresh.split('.').nth(1).unwrap();
    let claims: serde_json::Value =
        serde_json::from_slice(&URL_SAFE_NO_PAD.decode(payload).unwrap()).unwrap();
    claims["jti"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn tokens_issued_before_a_reshard_still_route_and_rotate() {
    let (app, state) = build().await;

    // Issue under generation 1 (8 shards).
    let refresh_a = issue_refresh_token(&app, &state, "u1").await;
    let (generation_a, _) = router::parse_refresh_jti(&jti_of(&refresh_a)).unwrap();
    assert_eq!(generation_a, 1);

    // Admin doubles the shard count; generation bumps to 2.
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/admin/shard-config")
                .header(header::AUTHORIZATION, format!("Bearer {ADMIN_KEY}"))
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(r#"{"shard_count": 16}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let updated: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(updated["current_generation"], 2);
    assert_eq!(updated["current_shard_count"], 16);

    // The old token still rotates: its embedded (generation, shard) pins
    // the owning instance regardless of the new config.
    let (status, json) = rotate(&app, &refresh_a).await;
    assert_eq!(status, StatusCode::OK);
    let refresh_b = json["refresh_token"].as_str().unwrap().to_string();
    // Successors stay pinned to the family's original generation.
    let (generation_b, _) = router::parse_refresh_jti(&jti_of(&refresh_b)).unwrap();
    assert_eq!(generation_b, 1);

    // And theft detection still works across the re-shard.
    let (status, json) = rotate(&app, &refresh_a).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["error"], "invalid_grant");

    // New authorizations route under generation 2.
    let refresh_new = issue_refresh_token(&app, &state, "u2").await;
    let (generation_new, shard_new) = router::parse_refresh_jti(&jti_of(&refresh_new)).unwrap();
    assert_eq!(generation_new, 2);
    assert!(shard_new < 16);
}
