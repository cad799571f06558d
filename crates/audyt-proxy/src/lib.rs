pub mod admission;
pub mod client;
pub mod csrf;
pub mod error;
pub mod forward;
pub mod handlers;
pub mod middleware;
pub mod policy;
pub mod security;
pub mod server;
pub mod signature;
pub mod store;
pub mod upstream;
pub mod usage;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};

use crate::store::{MemoryStore, SharedStore};

/// Shared application state threaded through axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub policy: Arc<policy::AdmissionPolicy>,
    pub usage: usage::UsageTracker,
    pub csrf: csrf::CsrfGuard,
    pub nonces: signature::NonceLedger,
    pub upstream: upstream::UpstreamClient,
    pub forwarder: forward::Forwarder,
    /// Browser origins allowed to call the proxy.
    pub allowed_origins: Arc<Vec<String>>,
}

/// Backing stores for the proxy's short-lived state.
#[derive(Clone)]
pub struct Stores {
    pub demo_usage: SharedStore<usage::DemoUsageRecord>,
    pub csrf_tokens: SharedStore<csrf::CsrfToken>,
    pub nonces: SharedStore<DateTime<Utc>>,
}

impl Stores {
    /// Process-local stores; nothing is shared between instances.
    pub fn in_memory() -> Self {
        Self {
            demo_usage: Arc::new(MemoryStore::new()),
            csrf_tokens: Arc::new(MemoryStore::new()),
            nonces: Arc::new(MemoryStore::new()),
        }
    }
}

impl AppState {
    pub fn new(cfg: &ServerConfig, stores: Stores) -> Result<Self> {
        let upstream = upstream::UpstreamClient::new(
            &cfg.upstream_url,
            cfg.anon_key.clone(),
            cfg.upstream_timeout,
        )?;
        let forwarder = forward::Forwarder::new(&cfg.upstream_url, cfg.function_timeout)?;
        let policy = cfg.policy();

        Ok(Self {
            usage: usage::UsageTracker::new(
                stores.demo_usage,
                upstream.clone(),
                policy.limits.clone(),
            ),
            csrf: csrf::CsrfGuard::new(stores.csrf_tokens, cfg.secure_cookies),
            nonces: signature::NonceLedger::new(
                stores.nonces,
                &cfg.server_secret,
                policy.verify_signatures,
            ),
            policy: Arc::new(policy),
            upstream,
            forwarder,
            allowed_origins: Arc::new(cfg.allowed_origins.clone()),
        })
    }

    /// Periodically drop expired CSRF tokens, stale demo counters and nonces.
    pub fn spawn_sweeps(&self, interval: Duration) {
        store::spawn_sweep(self.csrf.store(), interval, "csrf_tokens");
        store::spawn_sweep(self.usage.demo_store(), interval, "demo_usage");
        store::spawn_sweep(self.nonces.store(), interval, "nonces");
    }
}

pub use server::{build_router, run, RateLimitSettings, ServerConfig};
