//! Request gating for the versioned API, key-owner routes and optional
//! key identification.

use axum::{
    extract::{ConnectInfo, MatchedPath, Request, State},
    http::{header, HeaderMap},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::net::SocketAddr;
use std::time::Instant;

use super::AppState;
use crate::auth::RequestMeta;

/// Prefix of the gated API. Endpoint identifiers are relative to it.
pub const API_V1: &str = "/api/v1";

/// Extract an API key from `Authorization: Bearer` or `X-API-Key`.
pub fn extract_api_key(headers: &HeaderMap) -> Option<String> {
    if let Some(token) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
    {
        return Some(token.trim().to_string());
    }
    headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
}

fn request_meta(request: &Request) -> RequestMeta {
    let headers = request.headers();
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string());
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string());

    RequestMeta {
        user_agent: headers
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        ip_address: forwarded.or(peer),
    }
}

/// Authenticate, authorize, rate-limit, run the handler, then record the
/// outcome and attach rate-limit headers.
pub async fn api_gate(State(state): State<AppState>, request: Request, next: Next) -> Response {
    gated(&state, request, next, Scope::Tier).await
}

/// As [`api_gate`] for routes where a key manages itself: the tier allowlist
/// is skipped, quotas and usage logging are not.
pub async fn owner_gate(State(state): State<AppState>, request: Request, next: Next) -> Response {
    gated(&state, request, next, Scope::Owner).await
}

#[derive(Clone, Copy)]
enum Scope {
    Tier,
    Owner,
}

async fn gated(state: &AppState, mut request: Request, next: Next, scope: Scope) -> Response {
    let started = Instant::now();
    let path = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());
    let endpoint = path.strip_prefix(API_V1).unwrap_or(&path).to_string();

    let secret = extract_api_key(request.headers());
    let meta = request_meta(&request);
    let method = request.method().to_string();

    let authorized = match scope {
        Scope::Tier => state.gate.authorize(secret.as_deref(), &endpoint, &method, &meta),
        Scope::Owner => state.gate.authorize_owner(secret.as_deref(), &endpoint, &method, &meta),
    };
    let grant = match authorized {
        Ok(grant) => grant,
        Err(e) => return e.into_response(),
    };

    request.extensions_mut().insert(grant.key.clone());
    let mut response = next.run(request).await;

    let elapsed_ms = (started.elapsed().as_secs_f64() * 10_000.0).round() / 10.0;
    if let Err(e) = state
        .gate
        .complete(grant.usage_id, response.status().as_u16(), elapsed_ms)
    {
        tracing::warn!(key_id = %grant.key.key_id, "Failed to complete usage record: {}", e);
    }
    grant.rate_limit.apply_headers(response.headers_mut());
    response
}

/// Attach the caller's key, if a valid one is presented, without enforcing
/// anything. Requests without a key pass through unchanged.
pub async fn identify_key(State(state): State<AppState>, mut request: Request, next: Next) -> Response {
    let secret = extract_api_key(request.headers());
    if let Some(key) = state.gate.identify(secret.as_deref()) {
        request.extensions_mut().insert(key);
    }
    next.run(request).await
}
