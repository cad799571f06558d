//! The admission pipeline for `POST /api/{function}`.
//!
//! Order matters and is fixed:
//!
//! 1. function allow-list (404 before anything else runs)
//! 2. admin IP bypass
//! 3. usage: demo counters for anonymous callers, upstream lookups for
//!    bearer tokens; lookup failures follow the fail-open switch
//! 4. CSRF, unless admin or demo
//! 5. local signature check, only when enabled
//!
//! The caller forwards whatever body [`admit`] hands back.

use axum::http::{header, HeaderMap};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use crate::client::ClientContext;
use crate::csrf::CSRF_HEADER;
use crate::error::ProxyError;
use crate::policy::EdgeFunction;
use crate::security::{self, redact};
use crate::signature::{SignatureCheck, NONCE_HEADER, SIGNATURE_HEADER};
use crate::upstream::{UpstreamError, UserStanding};
use crate::AppState;

/// One inbound proxied request.
#[derive(Debug, Clone, Copy)]
pub struct ProxyCall<'a> {
    pub function_name: &'a str,
    pub client: &'a ClientContext,
    pub headers: &'a HeaderMap,
    /// Value of the `csrf_hash` cookie, if sent.
    pub csrf_cookie: Option<&'a str>,
    pub body: &'a [u8],
    pub now: DateTime<Utc>,
}

/// Under which rules a request was let through.
#[derive(Debug, Clone, PartialEq)]
pub enum Access {
    AdminIp,
    Demo { count: u32, limit: u32 },
    /// Admin role or unlimited plan.
    Privileged {
        user_id: String,
        standing: UserStanding,
    },
    Metered { user_id: String, total_searches: u64 },
    /// A usage lookup failed and the policy is fail-open.
    Unchecked { demo: bool },
}

impl Access {
    pub fn is_admin_ip(&self) -> bool {
        matches!(self, Self::AdminIp)
    }

    /// Admin IPs and anonymous callers carry no CSRF or signature material.
    pub fn skips_request_checks(&self) -> bool {
        matches!(
            self,
            Self::AdminIp | Self::Demo { .. } | Self::Unchecked { demo: true }
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Admission {
    pub function: EdgeFunction,
    pub access: Access,
    /// Request body to forward, with any clamped fields applied.
    pub body: Value,
}

/// Run the pipeline. `Ok` means the request may be forwarded as returned.
pub async fn admit(state: &AppState, call: ProxyCall<'_>) -> Result<Admission, ProxyError> {
    let function: EdgeFunction = call.function_name.parse()?;
    let mut body = parse_body(call.body)?;
    let ctx = call.client;

    if state.policy.is_admin_ip(&ctx.ip) {
        security::record(
            "admin_bypass",
            json!({ "function": function.as_str() }),
            ctx,
        );
        return Ok(Admission {
            function,
            access: Access::AdminIp,
            body,
        });
    }

    let bearer = call
        .headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    let checked = match bearer {
        None => demo_access(state, ctx, &mut body, call.now).await,
        Some(token) => authenticated_access(state, ctx, token, &body).await,
    };

    let access = match checked {
        Ok(access) => access,
        Err(ProxyError::LimitCheck(e)) => {
            security::alert(
                "limit_check_error",
                json!({
                    "error": e.to_string(),
                    "failOpen": state.policy.fail_open_on_limit_check_error,
                }),
                ctx,
            );
            if !state.policy.fail_open_on_limit_check_error {
                return Err(ProxyError::LimitCheck(e));
            }
            Access::Unchecked {
                demo: bearer.is_none(),
            }
        }
        Err(other) => return Err(other),
    };

    if !access.skips_request_checks() {
        check_csrf(state, &call).await?;
        if state.policy.verify_signatures {
            check_signature(state, &call).await?;
        }
    }

    Ok(Admission {
        function,
        access,
        body,
    })
}

fn parse_body(raw: &[u8]) -> Result<Value, ProxyError> {
    if raw.iter().all(u8::is_ascii_whitespace) {
        return Ok(json!({}));
    }
    serde_json::from_slice(raw).map_err(|_| ProxyError::InvalidBody)
}

/// `resultsLimit` as a number; numeric strings count, anything else is 0.
pub fn requested_results(body: &Value) -> f64 {
    match body.get("resultsLimit") {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0.0),
        _ => 0.0,
    }
}

async fn demo_access(
    state: &AppState,
    ctx: &ClientContext,
    body: &mut Value,
    now: DateTime<Utc>,
) -> Result<Access, ProxyError> {
    let decision = state
        .usage
        .check_and_increment_demo(&ctx.ip, now)
        .await
        .map_err(ProxyError::LimitCheck)?;

    if !decision.allowed {
        security::alert(
            "demo_limit_exceeded",
            json!({ "ip": ctx.ip, "count": decision.count, "limit": decision.limit }),
            ctx,
        );
        return Err(ProxyError::DemoLimitExceeded {
            usage: decision.count,
            limit: decision.limit,
        });
    }

    let max = state.usage.limits().demo_max_results;
    let requested = requested_results(body);
    if requested > max as f64 {
        if let Some(obj) = body.as_object_mut() {
            obj.insert("resultsLimit".into(), json!(max));
        }
        tracing::debug!(ip = %ctx.ip, requested, max, "demo results capped");
    }

    security::record(
        "demo_request",
        json!({ "count": decision.count, "limit": decision.limit }),
        ctx,
    );
    Ok(Access::Demo {
        count: decision.count,
        limit: decision.limit,
    })
}

fn lookup_failed(e: UpstreamError) -> ProxyError {
    ProxyError::LimitCheck(e.into())
}

async fn authenticated_access(
    state: &AppState,
    ctx: &ClientContext,
    token: &str,
    body: &Value,
) -> Result<Access, ProxyError> {
    let user = match state.upstream.verify_user(token).await {
        Ok(user) => user,
        Err(UpstreamError::Unauthorized(status)) => {
            security::alert(
                "invalid_token",
                json!({ "upstreamStatus": status.as_u16() }),
                ctx,
            );
            return Err(ProxyError::InvalidToken);
        }
        Err(e) => return Err(lookup_failed(e)),
    };

    let standing = state
        .upstream
        .fetch_standing(&user.id, token)
        .await
        .map_err(lookup_failed)?;

    if standing.is_admin() || standing.is_unlimited() {
        security::record(
            "limit_bypass",
            json!({ "userId": user.id, "role": standing.role, "plan": standing.plan }),
            ctx,
        );
        return Ok(Access::Privileged {
            user_id: user.id,
            standing,
        });
    }

    let decision = state
        .usage
        .check_authenticated_limit(&user.id, token)
        .await
        .map_err(lookup_failed)?;

    if !decision.allowed {
        security::alert(
            "total_limit_exceeded",
            json!({
                "userId": user.id,
                "totalSearches": decision.total_searches,
                "limit": decision.limit,
            }),
            ctx,
        );
        return Err(ProxyError::TotalLimitExceeded {
            total: decision.total_searches,
            limit: decision.limit,
        });
    }

    let max = state.usage.limits().max_results;
    let requested = requested_results(body);
    if requested > max as f64 {
        security::alert(
            "results_limit_exceeded",
            json!({ "userId": user.id, "requestedLimit": requested, "maxLimit": max }),
            ctx,
        );
        return Err(ProxyError::ResultsLimitExceeded { requested, max });
    }

    tracing::debug!(
        user_id = %user.id,
        total = decision.total_searches,
        limit = decision.limit,
        "lifetime usage"
    );
    Ok(Access::Metered {
        user_id: user.id,
        total_searches: decision.total_searches,
    })
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

async fn check_csrf(state: &AppState, call: &ProxyCall<'_>) -> Result<(), ProxyError> {
    let token = header_str(call.headers, CSRF_HEADER);
    let verdict = state
        .csrf
        .verify(token, call.csrf_cookie, call.now)
        .await
        .map_err(ProxyError::Internal)?;

    if !verdict.matches {
        security::alert(
            "csrf_validation_failed",
            json!({
                "hasToken": verdict.has_token,
                "hasCookie": verdict.has_cookie,
                "tokenMismatch": token != call.csrf_cookie,
                "enforced": state.policy.enforce_csrf,
            }),
            call.client,
        );
    }
    if !verdict.fresh {
        security::alert(
            "csrf_token_expired",
            json!({
                "csrfToken": token.map(redact),
                "enforced": state.policy.enforce_csrf,
            }),
            call.client,
        );
    }

    match verdict.rejection() {
        Some(rejection) if state.policy.enforce_csrf => Err(rejection),
        _ => Ok(()),
    }
}

async fn check_signature(state: &AppState, call: &ProxyCall<'_>) -> Result<(), ProxyError> {
    let check = state
        .nonces
        .verify(
            header_str(call.headers, NONCE_HEADER),
            header_str(call.headers, SIGNATURE_HEADER),
            call.body,
            call.now,
        )
        .await
        .map_err(ProxyError::Internal)?;

    if check == SignatureCheck::Valid {
        return Ok(());
    }
    security::alert(
        "signature_validation_failed",
        json!({ "reason": format!("{check:?}") }),
        call.client,
    );
    Err(ProxyError::SignatureInvalid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use anyhow::Result;
    use async_trait::async_trait;
    use axum::http::HeaderValue;
    use chrono::Duration;
    use tracing_test::traced_test;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use crate::client::parse_admin_networks;
    use crate::store::ExpiringStore;
    use crate::usage::DemoUsageRecord;
    use crate::{ServerConfig, Stores};

    fn config(upstream: &str) -> ServerConfig {
        ServerConfig {
            upstream_url: upstream.to_owned(),
            admin_networks: parse_admin_networks("139.28.40.138"),
            ..ServerConfig::default()
        }
    }

    fn state_with(cfg: ServerConfig) -> AppState {
        AppState::new(&cfg, Stores::in_memory()).unwrap()
    }

    fn ctx(ip: &str) -> ClientContext {
        ClientContext {
            ip: ip.to_owned(),
            user_agent: Some("test".into()),
            origin: None,
        }
    }

    fn call<'a>(
        name: &'a str,
        client: &'a ClientContext,
        headers: &'a HeaderMap,
        body: &'a [u8],
    ) -> ProxyCall<'a> {
        ProxyCall {
            function_name: name,
            client,
            headers,
            csrf_cookie: None,
            body,
            now: Utc::now(),
        }
    }

    fn bearer(token: &'static str) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {token}")).unwrap(),
        );
        h
    }

    async fn mount_user(mock: &MockServer, role: &str, plan: Option<&str>, runs: u64) {
        Mock::given(method("GET"))
            .and(path("/auth/v1/user"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "u-1"})))
            .mount(mock)
            .await;
        Mock::given(method("GET"))
            .and(path("/rest/v1/app_users"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"role": role}])))
            .mount(mock)
            .await;
        let subs = match plan {
            Some(p) => json!([{ "plan": p }]),
            None => json!([]),
        };
        Mock::given(method("GET"))
            .and(path("/rest/v1/subscriptions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(subs))
            .mount(mock)
            .await;
        Mock::given(method("GET"))
            .and(path("/rest/v1/runs"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-range", format!("*/{runs}").as_str())
                    .set_body_json(json!([])),
            )
            .mount(mock)
            .await;
    }

    struct BrokenStore;

    #[async_trait]
    impl ExpiringStore<DemoUsageRecord> for BrokenStore {
        async fn get(&self, _key: &str) -> Result<Option<DemoUsageRecord>> {
            anyhow::bail!("cache unreachable")
        }
        async fn set(&self, _: &str, _: DemoUsageRecord, _: DateTime<Utc>) -> Result<()> {
            anyhow::bail!("cache unreachable")
        }
        async fn delete(&self, _key: &str) -> Result<bool> {
            anyhow::bail!("cache unreachable")
        }
        async fn sweep(&self, _now: DateTime<Utc>) -> Result<usize> {
            anyhow::bail!("cache unreachable")
        }
    }

    #[tokio::test]
    async fn unknown_function_rejected_before_anything_else() {
        let state = state_with(config("http://127.0.0.1:1"));
        let c = ctx("1.2.3.4");
        let h = HeaderMap::new();
        // Not even valid JSON: the allow-list check must come first.
        let err = admit(&state, call("not-a-real-function", &c, &h, b"{oops"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "FUNCTION_NOT_FOUND");

        // No demo usage was consumed.
        let ok = admit(&state, call("tiktok-scraper", &c, &h, b"{}")).await.unwrap();
        assert_eq!(ok.access, Access::Demo { count: 1, limit: 2 });
    }

    #[tokio::test]
    async fn malformed_body_is_invalid() {
        let state = state_with(config("http://127.0.0.1:1"));
        let c = ctx("1.2.3.4");
        let h = HeaderMap::new();
        let err = admit(&state, call("tiktok-scraper", &c, &h, b"{oops"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_BODY");

        let admin = ctx("139.28.40.138");
        let err = admit(&state, call("tiktok-scraper", &admin, &h, b"{oops"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_BODY");
    }

    #[tokio::test]
    async fn demo_clamps_results_and_caps_daily_usage() {
        let state = state_with(config("http://127.0.0.1:1"));
        let c = ctx("1.2.3.4");
        let h = HeaderMap::new();
        let body = br#"{"hashtag":"food","resultsLimit":8}"#;

        let first = admit(&state, call("tiktok-scraper", &c, &h, body)).await.unwrap();
        assert_eq!(first.body["resultsLimit"], json!(5));
        assert_eq!(first.body["hashtag"], json!("food"));
        assert_eq!(first.access, Access::Demo { count: 1, limit: 2 });

        let second = admit(&state, call("tiktok-scraper", &c, &h, body)).await.unwrap();
        assert_eq!(second.access, Access::Demo { count: 2, limit: 2 });

        let third = admit(&state, call("tiktok-scraper", &c, &h, body))
            .await
            .unwrap_err();
        assert!(matches!(
            third,
            ProxyError::DemoLimitExceeded { usage: 2, limit: 2 }
        ));
    }

    #[tokio::test]
    async fn demo_leaves_small_limits_alone() {
        let state = state_with(config("http://127.0.0.1:1"));
        let c = ctx("1.2.3.4");
        let h = HeaderMap::new();
        let a = admit(&state, call("video-analyzer", &c, &h, br#"{"resultsLimit":3}"#))
            .await
            .unwrap();
        assert_eq!(a.body["resultsLimit"], json!(3));
    }

    #[tokio::test]
    async fn demo_clamps_numeric_strings() {
        let state = state_with(config("http://127.0.0.1:1"));
        let c = ctx("1.2.3.4");
        let h = HeaderMap::new();
        let a = admit(&state, call("tiktok-scraper", &c, &h, br#"{"resultsLimit":"20"}"#))
            .await
            .unwrap();
        assert_eq!(a.body["resultsLimit"], json!(5));
    }

    #[tokio::test]
    async fn non_bearer_authorization_is_demo_mode() {
        let state = state_with(config("http://127.0.0.1:1"));
        let c = ctx("1.2.3.4");
        let mut h = HeaderMap::new();
        h.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic Zm9vOmJhcg=="));
        let a = admit(&state, call("tiktok-scraper", &c, &h, b"")).await.unwrap();
        assert!(matches!(a.access, Access::Demo { .. }));
    }

    #[tokio::test]
    async fn admin_ip_bypasses_everything() {
        let state = state_with(config("http://127.0.0.1:1"));
        let c = ctx("139.28.40.138");
        // Bearer token that would fail verification, no CSRF material.
        let h = bearer("garbage");
        for _ in 0..5 {
            let a = admit(&state, call("tiktok-scraper", &c, &h, br#"{"resultsLimit":50}"#))
                .await
                .unwrap();
            assert_eq!(a.access, Access::AdminIp);
            assert_eq!(a.body["resultsLimit"], json!(50));
        }
    }

    #[tokio::test]
    async fn rejected_token_is_invalid_token() {
        let mock = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/auth/v1/user"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&mock)
            .await;
        let state = state_with(config(&mock.uri()));
        let c = ctx("1.2.3.4");
        let h = bearer("expired");
        let err = admit(&state, call("tiktok-scraper", &c, &h, b"{}"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_TOKEN");
    }

    #[tokio::test]
    async fn fourth_lifetime_search_is_refused() {
        let mock = MockServer::start().await;
        mount_user(&mock, "user", None, 3).await;
        let state = state_with(config(&mock.uri()));
        let c = ctx("1.2.3.4");
        let h = bearer("jwt");
        let err = admit(&state, call("tiktok-scraper", &c, &h, b"{}"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ProxyError::TotalLimitExceeded { total: 3, limit: 3 }
        ));
    }

    #[tokio::test]
    async fn signed_in_results_limit_above_ten_is_rejected() {
        let mock = MockServer::start().await;
        mount_user(&mock, "user", Some("free"), 1).await;
        let state = state_with(config(&mock.uri()));
        let c = ctx("1.2.3.4");
        let h = bearer("jwt");
        let err = admit(&state, call("tiktok-scraper", &c, &h, br#"{"resultsLimit":11}"#))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "RESULTS_LIMIT_EXCEEDED");
    }

    #[tokio::test]
    async fn unlimited_plan_skips_usage_but_not_csrf() {
        let mock = MockServer::start().await;
        mount_user(&mock, "user", Some("unlimited"), 99).await;
        let state = state_with(config(&mock.uri()));
        let c = ctx("1.2.3.4");
        let h = bearer("jwt");

        let err = admit(&state, call("tiktok-scraper", &c, &h, br#"{"resultsLimit":50}"#))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "CSRF_INVALID");

        let token = state.csrf.issue(Utc::now()).await.unwrap();
        let mut h = bearer("jwt");
        h.insert(CSRF_HEADER, HeaderValue::from_str(&token.value).unwrap());
        let mut ok = call("tiktok-scraper", &c, &h, br#"{"resultsLimit":50}"#);
        ok.csrf_cookie = Some(&token.value);
        let a = admit(&state, ok).await.unwrap();
        assert!(matches!(a.access, Access::Privileged { .. }));
        assert_eq!(a.body["resultsLimit"], json!(50));
    }

    #[tokio::test]
    async fn expired_csrf_token_blocked_when_enforced() {
        let mock = MockServer::start().await;
        mount_user(&mock, "admin", None, 0).await;
        let state = state_with(config(&mock.uri()));
        let c = ctx("1.2.3.4");

        let issued_at = Utc::now() - Duration::minutes(16);
        let token = state.csrf.issue(issued_at).await.unwrap();
        let mut h = bearer("jwt");
        h.insert(CSRF_HEADER, HeaderValue::from_str(&token.value).unwrap());
        let mut late = call("tiktok-scraper", &c, &h, b"{}");
        late.csrf_cookie = Some(&token.value);

        let err = admit(&state, late).await.unwrap_err();
        assert_eq!(err.code(), "CSRF_EXPIRED");
    }

    #[traced_test]
    #[tokio::test]
    async fn permissive_csrf_logs_and_admits() {
        let mock = MockServer::start().await;
        mount_user(&mock, "user", None, 0).await;
        let state = state_with(ServerConfig {
            enforce_csrf: false,
            ..config(&mock.uri())
        });
        let c = ctx("1.2.3.4");
        let h = bearer("jwt");

        let a = admit(&state, call("tiktok-scraper", &c, &h, b"{}")).await.unwrap();
        assert!(matches!(a.access, Access::Metered { total_searches: 0, .. }));
        assert!(logs_contain("csrf_validation_failed"));
        assert!(logs_contain("csrf_token_expired"));
    }

    #[tokio::test]
    async fn lookup_failure_fails_open_by_default() {
        let state = state_with(config("http://127.0.0.1:1"));
        let c = ctx("1.2.3.4");
        let h = bearer("jwt");
        // Upstream is unreachable: usage is unknown, CSRF still applies.
        let err = admit(&state, call("tiktok-scraper", &c, &h, b"{}"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "CSRF_INVALID");

        let permissive = state_with(ServerConfig {
            enforce_csrf: false,
            ..config("http://127.0.0.1:1")
        });
        let a = admit(&permissive, call("tiktok-scraper", &c, &h, b"{}"))
            .await
            .unwrap();
        assert_eq!(a.access, Access::Unchecked { demo: false });
    }

    #[tokio::test]
    async fn lookup_failure_fails_closed_when_configured() {
        let state = state_with(ServerConfig {
            fail_open_on_limit_check_error: false,
            ..config("http://127.0.0.1:1")
        });
        let c = ctx("1.2.3.4");
        let h = bearer("jwt");
        let err = admit(&state, call("tiktok-scraper", &c, &h, b"{}"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::LimitCheck(_)));
        assert_eq!(err.code(), "SERVER_ERROR");
    }

    #[tokio::test]
    async fn broken_demo_store_keeps_demo_mode_when_failing_open() {
        let cfg = config("http://127.0.0.1:1");
        let stores = Stores {
            demo_usage: Arc::new(BrokenStore),
            ..Stores::in_memory()
        };
        let state = AppState::new(&cfg, stores).unwrap();
        let c = ctx("1.2.3.4");
        let h = HeaderMap::new();
        let a = admit(&state, call("tiktok-scraper", &c, &h, br#"{"resultsLimit":9}"#))
            .await
            .unwrap();
        assert_eq!(a.access, Access::Unchecked { demo: true });
    }

    #[tokio::test]
    async fn signatures_verified_when_enabled() {
        let mock = MockServer::start().await;
        mount_user(&mock, "user", None, 0).await;
        let state = state_with(ServerConfig {
            verify_signatures: true,
            enforce_csrf: false,
            server_secret: "s3cret".into(),
            ..config(&mock.uri())
        });
        let c = ctx("1.2.3.4");
        let body = br#"{"resultsLimit":4}"#;

        let unsigned = bearer("jwt");
        let err = admit(&state, call("tiktok-scraper", &c, &unsigned, body))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "SIGNATURE_INVALID");

        let nonce = state.nonces.issue(Utc::now()).await.unwrap();
        let sig = crate::signature::compute_signature("s3cret", &nonce, body);
        let mut signed = bearer("jwt");
        signed.insert(NONCE_HEADER, HeaderValue::from_str(&nonce).unwrap());
        signed.insert(SIGNATURE_HEADER, HeaderValue::from_str(&sig).unwrap());
        let a = admit(&state, call("tiktok-scraper", &c, &signed, body)).await.unwrap();
        assert!(matches!(a.access, Access::Metered { .. }));
    }

    #[test]
    fn requested_results_reads_numbers_and_strings() {
        assert_eq!(requested_results(&json!({"resultsLimit": 7})), 7.0);
        assert_eq!(requested_results(&json!({"resultsLimit": "12"})), 12.0);
        assert_eq!(requested_results(&json!({"resultsLimit": true})), 0.0);
        assert_eq!(requested_results(&json!({})), 0.0);
        assert_eq!(requested_results(&json!([1, 2])), 0.0);
    }
}
