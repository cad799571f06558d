//! Expiring key-value storage for the proxy's short-lived state.
//!
//! CSRF tokens, demo usage counters and issued nonces all live behind
//! [`ExpiringStore`] so a deployment running several proxy instances can back
//! them with a shared cache instead of process memory.

pub mod memory;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::time;
use tracing::{debug, warn};

pub use memory::MemoryStore;

/// Key-value store whose entries carry an expiry instant.
///
/// `get` does not filter on expiry: callers decide what an expired entry
/// means for them, and `sweep` reclaims whatever has lapsed.
#[async_trait]
pub trait ExpiringStore<V>: Send + Sync
where
    V: Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &str) -> Result<Option<V>>;

    /// Insert or overwrite `key`.
    async fn set(&self, key: &str, value: V, expires_at: DateTime<Utc>) -> Result<()>;

    /// Remove `key`. Returns true if it existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Remove every entry whose expiry is strictly before `now`.
    /// Returns the number of entries removed.
    async fn sweep(&self, now: DateTime<Utc>) -> Result<usize>;
}

/// Shared handle to a store of `V`.
pub type SharedStore<V> = Arc<dyn ExpiringStore<V>>;

/// Spawn a background task that sweeps `store` every `interval`.
pub fn spawn_sweep<V>(store: SharedStore<V>, interval: Duration, name: &'static str)
where
    V: Clone + Send + Sync + 'static,
{
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        ticker.tick().await; // skip first immediate tick
        loop {
            ticker.tick().await;
            match store.sweep(Utc::now()).await {
                Ok(removed) => debug!(store = name, removed, "sweep complete"),
                Err(e) => warn!(store = name, error = %e, "background sweep error"),
            }
        }
    });
}
