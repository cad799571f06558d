use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Map, Value};

/// Every way a proxied request can be turned away.
///
/// Rendered as `{"error": {"code", "message", ...context}}` with messages
/// aimed at end users of the Polish-language dashboard.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("unknown function: {0}")]
    FunctionNotFound(String),

    #[error("request body is not valid JSON")]
    InvalidBody,

    #[error("request body exceeds the size limit")]
    PayloadTooLarge,

    #[error("origin not allowed: {0}")]
    OriginDenied(String),

    #[error("bearer token rejected by upstream auth")]
    InvalidToken,

    #[error("demo limit reached ({usage}/{limit})")]
    DemoLimitExceeded { usage: u32, limit: u32 },

    #[error("lifetime limit reached ({total}/{limit})")]
    TotalLimitExceeded { total: u64, limit: u64 },

    #[error("resultsLimit {requested} above maximum {max}")]
    ResultsLimitExceeded { requested: f64, max: u64 },

    #[error("CSRF token missing or does not match cookie")]
    CsrfInvalid,

    #[error("CSRF token unknown or expired")]
    CsrfExpired,

    #[error("request signature invalid")]
    SignatureInvalid,

    #[error("too many requests")]
    RateLimited,

    /// A usage lookup failed and the policy is fail-closed.
    #[error("usage limit check failed: {0}")]
    LimitCheck(anyhow::Error),

    #[error("upstream call failed: {0}")]
    Proxy(anyhow::Error),

    #[error("internal error: {0}")]
    Internal(anyhow::Error),
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::FunctionNotFound(_) => StatusCode::NOT_FOUND,
            Self::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Self::InvalidBody | Self::ResultsLimitExceeded { .. } => StatusCode::BAD_REQUEST,
            Self::InvalidToken => StatusCode::UNAUTHORIZED,
            Self::OriginDenied(_)
            | Self::CsrfInvalid
            | Self::CsrfExpired
            | Self::SignatureInvalid => StatusCode::FORBIDDEN,
            Self::DemoLimitExceeded { .. }
            | Self::TotalLimitExceeded { .. }
            | Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::LimitCheck(_) | Self::Proxy(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::FunctionNotFound(_) => "FUNCTION_NOT_FOUND",
            Self::InvalidBody => "INVALID_BODY",
            Self::PayloadTooLarge => "PAYLOAD_TOO_LARGE",
            Self::OriginDenied(_) => "CORS_ORIGIN_DENIED",
            Self::InvalidToken => "INVALID_TOKEN",
            Self::DemoLimitExceeded { .. } => "DEMO_LIMIT_EXCEEDED",
            Self::TotalLimitExceeded { .. } => "TOTAL_LIMIT_EXCEEDED",
            Self::ResultsLimitExceeded { .. } => "RESULTS_LIMIT_EXCEEDED",
            Self::CsrfInvalid => "CSRF_INVALID",
            Self::CsrfExpired => "CSRF_EXPIRED",
            Self::SignatureInvalid => "SIGNATURE_INVALID",
            Self::RateLimited => "RATE_LIMIT_EXCEEDED",
            Self::Proxy(_) => "PROXY_ERROR",
            Self::LimitCheck(_) | Self::Internal(_) => "SERVER_ERROR",
        }
    }

    fn message(&self) -> String {
        match self {
            Self::FunctionNotFound(_) => "Nieznana funkcja API.".into(),
            Self::InvalidBody => "Nieprawidłowe dane żądania.".into(),
            Self::PayloadTooLarge => "Żądanie jest zbyt duże.".into(),
            Self::OriginDenied(_) => "Żądanie z niedozwolonej domeny.".into(),
            Self::InvalidToken => "Nieprawidłowy token. Zaloguj się ponownie.".into(),
            Self::DemoLimitExceeded { limit, .. } => format!(
                "Wykorzystano dzienny limit {limit} bezpłatnych wyszukiwań. \
                 Zaloguj się, aby uzyskać więcej wyszukiwań lub spróbuj jutro."
            ),
            Self::TotalLimitExceeded { limit, .. } => format!(
                "Wykorzystano limit {limit} bezpłatnych wyszukiwań. \
                 Skontaktuj się z administratorem w celu uzyskania nielimitowanego dostępu."
            ),
            Self::ResultsLimitExceeded { max, .. } => format!(
                "Maksymalna liczba wyników to {max}. \
                 Zmniejsz liczbę wyników lub skontaktuj się z administratorem."
            ),
            Self::CsrfInvalid => {
                "Nieprawidłowy token CSRF. Odśwież stronę i spróbuj ponownie.".into()
            }
            Self::CsrfExpired => "Token CSRF wygasł. Odśwież stronę i spróbuj ponownie.".into(),
            Self::SignatureInvalid => {
                "Nieprawidłowy podpis żądania. Odśwież stronę i spróbuj ponownie.".into()
            }
            Self::RateLimited => "Przekroczono limit żądań. Spróbuj ponownie za chwilę.".into(),
            Self::Proxy(_) => "Wystąpił błąd podczas przetwarzania żądania.".into(),
            Self::LimitCheck(_) | Self::Internal(_) => "Wystąpił błąd serwera.".into(),
        }
    }

    /// Extra fields merged into the error object next to `code` and `message`.
    fn context(&self) -> Map<String, Value> {
        let mut ctx = Map::new();
        match self {
            Self::DemoLimitExceeded { usage, limit } => {
                ctx.insert("dailyUsage".into(), json!(usage));
                ctx.insert("dailyLimit".into(), json!(limit));
            }
            Self::TotalLimitExceeded { total, limit } => {
                ctx.insert("totalSearches".into(), json!(total));
                ctx.insert("totalLimit".into(), json!(limit));
            }
            Self::ResultsLimitExceeded { requested, max } => {
                ctx.insert("requestedLimit".into(), json_number(*requested));
                ctx.insert("maxLimit".into(), json!(max));
            }
            _ => {}
        }
        ctx
    }

    /// The `{"error": {...}}` body for this error.
    pub fn body(&self) -> Value {
        let mut error = Map::new();
        error.insert("code".into(), json!(self.code()));
        error.insert("message".into(), json!(self.message()));
        error.extend(self.context());
        json!({ "error": error })
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        match &self {
            Self::LimitCheck(e) | Self::Proxy(e) | Self::Internal(e) => {
                tracing::error!(code = self.code(), error = %e, "internal error");
            }
            _ => {}
        }
        (self.status(), Json(self.body())).into_response()
    }
}

/// Integral values render without a fractional part.
fn json_number(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        json!(n as i64)
    } else {
        json!(n)
    }
}
