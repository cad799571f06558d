use std::time::Duration;

use anyhow::{Context, Result};
use axum::http::{HeaderMap, StatusCode};
use serde_json::Value;

use crate::policy::EdgeFunction;

/// Caller headers relayed to the edge function when present.
const PASSTHROUGH_HEADERS: [&str; 4] = ["authorization", "x-nonce", "x-signature", "x-csrf-token"];

/// Status and JSON body as returned by the edge function.
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamReply {
    pub status: StatusCode,
    pub body: Value,
}

impl UpstreamReply {
    /// True if the reply is an object carrying a `data` member.
    pub fn has_data(&self) -> bool {
        self.body.get("data").is_some()
    }
}

/// Relays admitted requests to `<base>/functions/v1/<name>`.
#[derive(Clone)]
pub struct Forwarder {
    client: reqwest::Client,
    base_url: String,
}

impl Forwarder {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("build forwarder reqwest client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_owned(),
        })
    }

    pub fn function_url(&self, function: EdgeFunction) -> String {
        format!("{}/functions/v1/{function}", self.base_url)
    }

    /// POST `body` to `function` on behalf of `client_ip`.
    pub async fn forward(
        &self,
        function: EdgeFunction,
        client_ip: &str,
        incoming: &HeaderMap,
        body: &Value,
    ) -> Result<UpstreamReply> {
        let mut req = self
            .client
            .post(self.function_url(function))
            .header("X-Real-IP", client_ip)
            .header("X-Forwarded-For", client_ip)
            .json(body);

        for name in PASSTHROUGH_HEADERS {
            if let Some(value) = incoming.get(name) {
                req = req.header(name, value.clone());
            }
        }

        let resp = req
            .send()
            .await
            .with_context(|| format!("POST {function}"))?;
        let status = resp.status();
        let body = resp
            .json::<Value>()
            .await
            .with_context(|| format!("decode {function} response ({status})"))?;

        Ok(UpstreamReply { status, body })
    }
}
