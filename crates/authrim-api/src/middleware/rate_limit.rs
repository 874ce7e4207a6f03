//! Per-IP rate limiting backed by the sharded counter actors.

use crate::error::OAuthError;
use crate::AppState;
use authrim_audit::{SecurityEvent, SecurityEventKind};
use authrim_core::stores::RateLimitPolicy;
use authrim_store::router;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use std::net::SocketAddr;

/// Client IP: first `X-Forwarded-For` hop when present (we are expected to
/// sit behind a trusted proxy), else the socket peer.
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .or_else(|| peer.map(|addr| addr.ip().to_string()))
        .unwrap_or_else(|| "unknown".to_string())
}

pub async fn rate_limit_middleware(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Response {
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let ip = client_ip(req.headers(), peer);

    let policy = RateLimitPolicy {
        window_sec: state.config.rate_limit.rate_limit_window_sec,
        max_requests: state.config.rate_limit.rate_limit_max_requests,
        max_tracked_keys: state.config.rate_limit.max_tracked_keys,
    };
    let shard = router::rate_shard_for_ip(&ip, state.config.sharding.rate_limit_shard_count);
    let instance = router::rate_counter_instance(state.tenant(), shard);

    let decision = {
        let mut counter = state.rate_counters.lease(&instance).await;
        counter.increment(&ip, policy).await
    };

    match decision {
        Ok(decision) if !decision.allowed => {
            state.audit.emit(
                SecurityEvent::new(SecurityEventKind::RateLimitExceeded, state.tenant())
                    .with_ip(Some(ip)),
            );
            OAuthError::RateLimited {
                retry_after_sec: decision.retry_after_sec.unwrap_or(1),
            }
            .into_response()
        }
        Ok(_) => next.run(req).await,
        Err(err) => {
            // Counter trouble must not take the service down.
            tracing::error!(error = %err, "rate counter unavailable, letting request through");
            next.run(req).await
        }
    }
}
