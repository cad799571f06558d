//! Lookups against the upstream auth service and REST tables.

use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value;

/// Why an upstream lookup produced no answer.
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    /// The auth service refused the bearer token.
    #[error("token rejected by upstream auth ({0})")]
    Unauthorized(StatusCode),
    #[error("upstream request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("unexpected upstream response: {0}")]
    Decode(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamUser {
    pub id: String,
}

/// Role and plan resolved for a signed-in caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserStanding {
    pub role: Option<String>,
    pub plan: String,
}

impl UserStanding {
    pub fn is_admin(&self) -> bool {
        self.role.as_deref() == Some("admin")
    }

    pub fn is_unlimited(&self) -> bool {
        self.plan == "unlimited"
    }
}

/// HTTP client for the upstream project (`/auth/v1`, `/rest/v1`).
#[derive(Clone)]
pub struct UpstreamClient {
    client: reqwest::Client,
    base_url: String,
    anon_key: String,
}

impl UpstreamClient {
    pub fn new(base_url: &str, anon_key: String, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("build upstream reqwest client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_owned(),
            anon_key,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn get(&self, path: &str, token: &str) -> reqwest::RequestBuilder {
        self.client
            .get(format!("{}{path}", self.base_url))
            .bearer_auth(token)
            .header("apikey", &self.anon_key)
    }

    /// Resolve the user behind `token`.
    pub async fn verify_user(&self, token: &str) -> Result<UpstreamUser, UpstreamError> {
        let resp = self.get("/auth/v1/user", token).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            tracing::debug!(%status, body = %body, "token verification failed");
            return Err(UpstreamError::Unauthorized(status));
        }
        Ok(resp.json().await?)
    }

    /// Role from `app_users`; `None` when the user has no row.
    pub async fn fetch_role(
        &self,
        user_id: &str,
        token: &str,
    ) -> Result<Option<String>, UpstreamError> {
        let rows: Value = self
            .get(&format!("/rest/v1/app_users?user_id=eq.{user_id}&select=role"), token)
            .send()
            .await?
            .json()
            .await?;
        Ok(first_string_field(&rows, "role"))
    }

    /// Plan of the newest active subscription, `free` when there is none.
    pub async fn fetch_plan(&self, user_id: &str, token: &str) -> Result<String, UpstreamError> {
        let rows: Value = self
            .get(
                &format!(
                    "/rest/v1/subscriptions?user_id=eq.{user_id}&status=eq.active\
                     &order=starts_at.desc&limit=1"
                ),
                token,
            )
            .send()
            .await?
            .json()
            .await?;
        Ok(first_string_field(&rows, "plan").unwrap_or_else(|| "free".to_owned()))
    }

    pub async fn fetch_standing(
        &self,
        user_id: &str,
        token: &str,
    ) -> Result<UserStanding, UpstreamError> {
        let role = self.fetch_role(user_id, token).await?;
        let plan = self.fetch_plan(user_id, token).await?;
        Ok(UserStanding { role, plan })
    }

    /// Lifetime number of scraper runs, read from the `Content-Range` total.
    pub async fn count_runs(&self, user_id: &str, token: &str) -> Result<u64, UpstreamError> {
        let resp = self
            .get(&format!("/rest/v1/runs?user_id=eq.{user_id}&select=id"), token)
            .header("Prefer", "count=exact")
            .send()
            .await?;
        match resp.headers().get("content-range") {
            Some(range) => {
                let range = range
                    .to_str()
                    .map_err(|_| UpstreamError::Decode("content-range is not ASCII".into()))?;
                parse_content_range_total(range)
                    .ok_or_else(|| UpstreamError::Decode(format!("content-range {range:?}")))
            }
            None => Ok(0),
        }
    }
}

/// `rows[0][field]` as a string, tolerating non-array bodies.
fn first_string_field(rows: &Value, field: &str) -> Option<String> {
    rows.as_array()?
        .first()?
        .get(field)?
        .as_str()
        .map(str::to_owned)
}

/// Total from a PostgREST `Content-Range` such as `0-2/3` or `*/0`.
pub fn parse_content_range_total(range: &str) -> Option<u64> {
    range.rsplit_once('/')?.1.trim().parse().ok()
}
