//! CSRF token lifecycle: issue, cookie, verify.
//!
//! A token is handed out by `GET /api/csrf` both in the JSON body and as the
//! `csrf_hash` cookie. Signed-in requests must echo it in `X-CSRF-Token`; the
//! header has to match the cookie and name a token this proxy issued less than
//! fifteen minutes ago.

use anyhow::Result;
use axum_extra::extract::cookie::{Cookie, SameSite};
use chrono::{DateTime, Duration, Utc};
use constant_time_eq::constant_time_eq;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::ProxyError;
use crate::store::SharedStore;

pub const CSRF_COOKIE: &str = "csrf_hash";
pub const CSRF_HEADER: &str = "x-csrf-token";
pub const CSRF_TTL_SECS: i64 = 15 * 60;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CsrfToken {
    pub value: String,
    pub expires_at: DateTime<Utc>,
}

impl CsrfToken {
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        now <= self.expires_at
    }
}

/// Outcome of checking one request's CSRF material.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CsrfVerdict {
    pub has_token: bool,
    pub has_cookie: bool,
    /// Header and cookie are both present and equal.
    pub matches: bool,
    /// The header token is known and unexpired.
    pub fresh: bool,
}

impl CsrfVerdict {
    pub fn is_ok(&self) -> bool {
        self.matches && self.fresh
    }

    /// The error an enforcing proxy answers with, mismatch taking precedence.
    pub fn rejection(&self) -> Option<ProxyError> {
        if !self.matches {
            Some(ProxyError::CsrfInvalid)
        } else if !self.fresh {
            Some(ProxyError::CsrfExpired)
        } else {
            None
        }
    }
}

#[derive(Clone)]
pub struct CsrfGuard {
    store: SharedStore<CsrfToken>,
    ttl: Duration,
    secure_cookie: bool,
}

impl CsrfGuard {
    pub fn new(store: SharedStore<CsrfToken>, secure_cookie: bool) -> Self {
        Self {
            store,
            ttl: Duration::seconds(CSRF_TTL_SECS),
            secure_cookie,
        }
    }

    pub fn store(&self) -> SharedStore<CsrfToken> {
        std::sync::Arc::clone(&self.store)
    }

    /// Mint a token valid until `now + 15min` and remember it.
    pub async fn issue(&self, now: DateTime<Utc>) -> Result<CsrfToken> {
        let token = CsrfToken {
            value: generate_token(),
            expires_at: now + self.ttl,
        };
        self.store
            .set(&token.value, token.clone(), token.expires_at)
            .await?;
        Ok(token)
    }

    /// The `csrf_hash` cookie carrying `token`.
    pub fn cookie(&self, token: &CsrfToken) -> Cookie<'static> {
        Cookie::build((CSRF_COOKIE, token.value.clone()))
            .path("/")
            .http_only(true)
            .secure(self.secure_cookie)
            .same_site(SameSite::Lax)
            .max_age(time::Duration::seconds(self.ttl.num_seconds()))
            .build()
    }

    pub async fn verify(
        &self,
        header: Option<&str>,
        cookie: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<CsrfVerdict> {
        let matches = match (header, cookie) {
            (Some(h), Some(c)) => constant_time_eq(h.as_bytes(), c.as_bytes()),
            _ => false,
        };

        let fresh = match header {
            Some(h) => self
                .store
                .get(h)
                .await?
                .is_some_and(|t| t.is_valid(now)),
            None => false,
        };

        Ok(CsrfVerdict {
            has_token: header.is_some(),
            has_cookie: cookie.is_some(),
            matches,
            fresh,
        })
    }
}

/// 32 random bytes, hex-encoded.
pub fn generate_token() -> String {
    let bytes: [u8; 32] = rand::thread_rng().gen();
    hex::encode(bytes)
}
