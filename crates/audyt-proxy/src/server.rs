use std::any::Any;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    extract::DefaultBodyLimit,
    http::{header, HeaderName, HeaderValue, Method},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use ipnet::IpNet;
use tower_governor::{governor::GovernorConfigBuilder, GovernorLayer};
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::CorsLayer;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::{
    client::{parse_admin_networks, ClientIpKeyExtractor},
    csrf::CSRF_HEADER,
    error::ProxyError,
    handlers::{health, issue_csrf, issue_nonce, proxy_function},
    middleware::{rate_limit_envelope, require_allowed_origin},
    policy::{AdmissionPolicy, UsageLimits},
    security::SECURITY_TARGET,
    signature::{NONCE_HEADER, SIGNATURE_HEADER},
    AppState, Stores,
};

/// HMAC key used when `SERVER_SECRET` is unset. Never deploy with it.
pub const DEV_SERVER_SECRET: &str = "dev-secret-change-in-production";

pub const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

const DEFAULT_ALLOWED_ORIGINS: [&str; 4] = [
    "https://tiktok.marketingkrokpokroku.pl",
    "https://marketingkrokpokroku.pl",
    "http://localhost:5173",
    "http://localhost:5176",
];

/// Per-IP request budgets, both counted over `window`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitSettings {
    pub window: Duration,
    /// Every route.
    pub general_max: u32,
    /// `POST /api/{function}` only.
    pub run_max: u32,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(15 * 60),
            general_max: 100,
            run_max: 30,
        }
    }
}

pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub upstream_url: String,
    pub anon_key: String,
    pub server_secret: String,
    pub admin_networks: Vec<IpNet>,
    pub allowed_origins: Vec<String>,
    pub fail_open_on_limit_check_error: bool,
    pub enforce_csrf: bool,
    pub verify_signatures: bool,
    pub secure_cookies: bool,
    /// Auth and REST lookups.
    pub upstream_timeout: Duration,
    /// Edge function calls; scraping runs take minutes.
    pub function_timeout: Duration,
    pub sweep_interval: Duration,
    pub limits: UsageLimits,
    pub rate_limit: RateLimitSettings,
}

fn env_flag(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(v) => matches!(
            v.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => default,
    }
}

fn env_secs(name: &str, default: u64) -> Duration {
    let secs = std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default);
    Duration::from_secs(secs)
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            port: std::env::var("PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(3001),
            upstream_url: std::env::var("SUPABASE_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:54321".into()),
            anon_key: std::env::var("SUPABASE_ANON_KEY").unwrap_or_default(),
            server_secret: std::env::var("SERVER_SECRET")
                .unwrap_or_else(|_| DEV_SERVER_SECRET.into()),
            admin_networks: std::env::var("ADMIN_IPS")
                .map(|v| parse_admin_networks(&v))
                .unwrap_or_default(),
            allowed_origins: match std::env::var("ALLOWED_ORIGINS") {
                Ok(v) => v
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_owned)
                    .collect(),
                Err(_) => DEFAULT_ALLOWED_ORIGINS.map(String::from).to_vec(),
            },
            fail_open_on_limit_check_error: env_flag("PROXY_FAIL_OPEN", true),
            enforce_csrf: env_flag("PROXY_ENFORCE_CSRF", true),
            verify_signatures: env_flag("PROXY_VERIFY_SIGNATURES", false),
            secure_cookies: env_flag("PROXY_SECURE_COOKIES", false),
            upstream_timeout: env_secs("PROXY_UPSTREAM_TIMEOUT_SECS", 30),
            function_timeout: env_secs("PROXY_FUNCTION_TIMEOUT_SECS", 300),
            sweep_interval: Duration::from_secs(300),
            limits: UsageLimits::default(),
            rate_limit: RateLimitSettings::default(),
        }
    }
}

impl ServerConfig {
    pub fn policy(&self) -> AdmissionPolicy {
        AdmissionPolicy {
            admin_networks: self.admin_networks.clone(),
            fail_open_on_limit_check_error: self.fail_open_on_limit_check_error,
            enforce_csrf: self.enforce_csrf,
            verify_signatures: self.verify_signatures,
            limits: self.limits.clone(),
        }
    }
}

pub async fn run(cfg: ServerConfig) -> Result<()> {
    if cfg.server_secret == DEV_SERVER_SECRET {
        warn!("SERVER_SECRET not set, using the development placeholder");
    }
    if cfg.anon_key.is_empty() {
        warn!("SUPABASE_ANON_KEY not set, upstream lookups will likely be rejected");
    }

    let state = AppState::new(&cfg, Stores::in_memory()).context("build app state")?;
    state.spawn_sweeps(cfg.sweep_interval);

    info!(
        upstream = %cfg.upstream_url,
        admin_networks = cfg.admin_networks.len(),
        enforce_csrf = cfg.enforce_csrf,
        fail_open = cfg.fail_open_on_limit_check_error,
        verify_signatures = cfg.verify_signatures,
        "admission policy"
    );

    let app = build_router(state, &cfg)?;

    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .context("invalid host/port")?;

    info!(%addr, "audyt proxy listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("bind listener")?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("server error")
}

/// Assemble the full router with rate limits, origin guard, CORS, security
/// headers, panic catcher and request tracing.
pub fn build_router(state: AppState, cfg: &ServerConfig) -> Result<Router> {
    let limits = &cfg.rate_limit;
    let run_max = limits.run_max.max(1);
    let general_max = limits.general_max.max(1);

    let run_conf = Arc::new(
        GovernorConfigBuilder::default()
            .key_extractor(ClientIpKeyExtractor)
            .period(limits.window / run_max)
            .burst_size(run_max)
            .use_headers()
            .finish()
            .context("invalid run rate limit")?,
    );
    let general_conf = Arc::new(
        GovernorConfigBuilder::default()
            .key_extractor(ClientIpKeyExtractor)
            .period(limits.window / general_max)
            .burst_size(general_max)
            .use_headers()
            .finish()
            .context("invalid general rate limit")?,
    );

    for limiter in [
        Arc::clone(run_conf.limiter()),
        Arc::clone(general_conf.limiter()),
    ] {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            loop {
                ticker.tick().await;
                limiter.retain_recent();
            }
        });
    }

    let api = Router::new()
        .route("/api/health", get(health))
        .route("/api/csrf", get(issue_csrf))
        .route("/api/nonce", get(issue_nonce))
        .route(
            "/api/{function}",
            post(proxy_function).layer(GovernorLayer::new(run_conf)),
        )
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(GovernorLayer::new(general_conf))
        .layer(middleware::from_fn(rate_limit_envelope))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_allowed_origin,
        ))
        .with_state(state.clone());

    let mut app = api.layer(build_cors(&state.allowed_origins)?);
    for (name, value) in security_headers(&cfg.upstream_url)? {
        app = app.layer(SetResponseHeaderLayer::if_not_present(name, value));
    }

    Ok(app
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(TraceLayer::new_for_http()))
}

fn build_cors(origins: &[String]) -> Result<CorsLayer> {
    let origins = origins
        .iter()
        .map(|o| HeaderValue::from_str(o).with_context(|| format!("invalid origin {o:?}")))
        .collect::<Result<Vec<_>>>()?;

    Ok(CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST])
        .allow_credentials(true)
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            HeaderName::from_static(CSRF_HEADER),
            HeaderName::from_static(NONCE_HEADER),
            HeaderName::from_static(SIGNATURE_HEADER),
        ]))
}

fn security_headers(upstream_url: &str) -> Result<Vec<(HeaderName, HeaderValue)>> {
    let csp = format!(
        "default-src 'self'; script-src 'self'; connect-src 'self' {upstream_url}; \
         img-src 'self' data:; style-src 'self' 'unsafe-inline'; \
         frame-ancestors 'none'; base-uri 'none'"
    );
    Ok(vec![
        (
            header::CONTENT_SECURITY_POLICY,
            HeaderValue::from_str(&csp).context("invalid CSP (check SUPABASE_URL)")?,
        ),
        (
            header::STRICT_TRANSPORT_SECURITY,
            HeaderValue::from_static("max-age=31536000; includeSubDomains; preload"),
        ),
        (
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ),
        (header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY")),
        (header::REFERRER_POLICY, HeaderValue::from_static("no-referrer")),
    ])
}

fn panic_response(panic: Box<dyn Any + Send + 'static>) -> Response {
    let detail = panic
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    tracing::error!(
        target: SECURITY_TARGET,
        event = "server_error",
        detail,
        "[SECURITY] server_error"
    );
    ProxyError::Internal(anyhow::anyhow!("handler panicked: {detail}")).into_response()
}
