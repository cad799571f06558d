use std::net::SocketAddr;

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde_json::json;

use crate::{client::ClientContext, error::ProxyError, security, AppState};

/// Reject requests whose `Origin` is not on the allow-list.
/// Requests without an `Origin` header (curl, server-to-server) pass through.
pub async fn require_allowed_origin(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let Some(origin) = request
        .headers()
        .get(header::ORIGIN)
        .and_then(|v| v.to_str().ok())
    else {
        return next.run(request).await;
    };

    if state.allowed_origins.iter().any(|o| o == origin) {
        return next.run(request).await;
    }

    let origin = origin.to_owned();
    let ctx = ClientContext::from_parts(request.headers(), peer_of(&request));
    security::alert("cors_rejected", json!({ "origin": origin }), &ctx);
    ProxyError::OriginDenied(origin).into_response()
}

fn peer_of(request: &Request) -> Option<SocketAddr> {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr)
}

/// Rewrite the rate limiter's plain-text 429 into the JSON error envelope,
/// keeping its `retry-after` and `x-ratelimit-*` headers.
pub async fn rate_limit_envelope(request: Request, next: Next) -> Response {
    let ctx = ClientContext::from_parts(request.headers(), peer_of(&request));
    let response = next.run(request).await;
    rewrite_rate_limited(response, &ctx)
}

fn rewrite_rate_limited(response: Response, ctx: &ClientContext) -> Response {
    if response.status() != StatusCode::TOO_MANY_REQUESTS {
        return response;
    }
    let is_json = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("application/json"));
    if is_json {
        // Demo and lifetime limits already speak the envelope.
        return response;
    }

    let retry_after = response
        .headers()
        .get(header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);
    security::alert(
        "rate_limit_exceeded",
        json!({ "retryAfter": retry_after }),
        ctx,
    );

    let (parts, _) = response.into_parts();
    let mut rewritten = ProxyError::RateLimited.into_response();
    for (name, value) in parts.headers.iter() {
        if name != header::CONTENT_TYPE && name != header::CONTENT_LENGTH {
            rewritten.headers_mut().insert(name.clone(), value.clone());
        }
    }
    rewritten
}
