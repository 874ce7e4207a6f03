//! Route table. Endpoint paths are fixed by the protocol specifications.

use crate::handlers::{
    admin, authorize, ciba, device, discovery, health, introspect, jwks, logout, register, revoke,
    token, userinfo,
};
use crate::middleware::{
    rate_limit_middleware, request_id_middleware, security_headers_middleware,
};
use crate::AppState;
use axum::routing::{get, post};
use axum::{middleware, Router};
use tower_http::trace::TraceLayer;

pub fn api_router(state: AppState) -> Router<AppState> {
    Router::new()
        .route(
            "/.well-known/openid-configuration",
            get(discovery::openid_configuration),
        )
        .route("/.well-known/jwks.json", get(jwks::jwks))
        .route(
            "/authorize",
            get(authorize::authorize_get).post(authorize::authorize_post),
        )
        .route("/as/par", post(authorize::pushed_authorization_request))
        .route("/consent", post(authorize::submit_consent))
        .route("/token", post(token::token))
        .route("/introspect", post(introspect::introspect))
        .route("/revoke", post(revoke::revoke))
        .route("/userinfo", get(userinfo::userinfo).post(userinfo::userinfo))
        .route("/logout", get(logout::logout))
        .route("/logout/confirm", post(logout::logout_confirm))
        .route("/logout/backchannel", post(logout::backchannel_logout))
        .route("/register", post(register::register))
        .route("/device_authorization", post(device::device_authorization))
        .route(
            "/device",
            get(device::device_verification_info).post(device::device_verification_submit),
        )
        .route("/bc-authorize", post(ciba::bc_authorize))
        .route("/bc-authorize/complete", post(ciba::bc_authorize_complete))
        .route("/admin/shard-config", post(admin::update_shard_config))
        .route("/admin/keys/rotate", post(admin::rotate_signing_key))
        .route("/health", get(health::health_check))
        // Layers run bottom-to-top.
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(security_headers_middleware))
        .layer(middleware::from_fn(request_id_middleware))
        .layer(middleware::from_fn_with_state(state, rate_limit_middleware))
}

pub fn app(state: AppState) -> Router {
    api_router(state.clone()).with_state(state)
}
