use axum::{
    body::Bytes,
    extract::{rejection::BytesRejection, Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use axum_extra::extract::cookie::CookieJar;
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::json;

use crate::{
    admission::{self, ProxyCall},
    client::ClientContext,
    csrf::CSRF_COOKIE,
    error::ProxyError,
    security, AppState,
};

// ── Health ────────────────────────────────────────────────────────────────────

pub async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        "version": format!("{}-secure", env!("CARGO_PKG_VERSION")),
    }))
}

// ── CSRF ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CsrfResponse {
    pub csrf_token: String,
}

pub async fn issue_csrf(
    State(state): State<AppState>,
    jar: CookieJar,
) -> Result<(CookieJar, Json<CsrfResponse>), ProxyError> {
    let token = state
        .csrf
        .issue(Utc::now())
        .await
        .map_err(ProxyError::Internal)?;
    let jar = jar.add(state.csrf.cookie(&token));
    Ok((
        jar,
        Json(CsrfResponse {
            csrf_token: token.value,
        }),
    ))
}

// ── Nonce ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct NonceResponse {
    pub nonce: String,
}

pub async fn issue_nonce(State(state): State<AppState>) -> Result<Json<NonceResponse>, ProxyError> {
    let nonce = state
        .nonces
        .issue(Utc::now())
        .await
        .map_err(ProxyError::Internal)?;
    Ok(Json(NonceResponse { nonce }))
}

// ── Proxy ─────────────────────────────────────────────────────────────────────

pub async fn proxy_function(
    State(state): State<AppState>,
    Path(function_name): Path<String>,
    client: ClientContext,
    jar: CookieJar,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> Response {
    let body = match body {
        Ok(body) => body,
        Err(rejection) if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE => {
            security::alert(
                "payload_too_large",
                json!({ "function": function_name }),
                &client,
            );
            return ProxyError::PayloadTooLarge.into_response();
        }
        Err(rejection) => {
            tracing::debug!(error = %rejection, "unreadable request body");
            return ProxyError::InvalidBody.into_response();
        }
    };

    let call = ProxyCall {
        function_name: &function_name,
        client: &client,
        headers: &headers,
        csrf_cookie: jar.get(CSRF_COOKIE).map(|c| c.value()),
        body: &body,
        now: Utc::now(),
    };

    let admitted = match admission::admit(&state, call).await {
        Ok(a) => a,
        Err(e) => return e.into_response(),
    };

    match state
        .forwarder
        .forward(admitted.function, &client.ip, &headers, &admitted.body)
        .await
    {
        Ok(reply) => {
            security::record(
                "proxy_request",
                json!({
                    "function": admitted.function.as_str(),
                    "status": reply.status.as_u16(),
                    "isAdmin": admitted.access.is_admin_ip(),
                    "hasData": reply.has_data(),
                }),
                &client,
            );
            (reply.status, Json(reply.body)).into_response()
        }
        Err(e) => {
            security::alert(
                "proxy_error",
                json!({
                    "function": admitted.function.as_str(),
                    "error": format!("{e:#}"),
                }),
                &client,
            );
            ProxyError::Proxy(e).into_response()
        }
    }
}
