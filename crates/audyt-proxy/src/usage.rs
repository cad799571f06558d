//! Usage accounting: daily per-IP counters for anonymous callers and the
//! lifetime cap for signed-in ones.

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::policy::UsageLimits;
use crate::store::SharedStore;
use crate::upstream::{UpstreamClient, UpstreamError};

/// Anonymous usage for one IP on one UTC day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DemoUsageRecord {
    pub ip: String,
    pub count: u32,
    pub date: NaiveDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DemoDecision {
    pub allowed: bool,
    pub count: u32,
    pub limit: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifetimeDecision {
    pub allowed: bool,
    pub total_searches: u64,
    pub limit: u64,
}

#[derive(Clone)]
pub struct UsageTracker {
    demo: SharedStore<DemoUsageRecord>,
    upstream: UpstreamClient,
    limits: UsageLimits,
    /// Serializes read-modify-write of demo records.
    demo_gate: Arc<Mutex<()>>,
}

impl UsageTracker {
    pub fn new(
        demo: SharedStore<DemoUsageRecord>,
        upstream: UpstreamClient,
        limits: UsageLimits,
    ) -> Self {
        Self {
            demo,
            upstream,
            limits,
            demo_gate: Arc::new(Mutex::new(())),
        }
    }

    pub fn limits(&self) -> &UsageLimits {
        &self.limits
    }

    pub fn demo_store(&self) -> SharedStore<DemoUsageRecord> {
        Arc::clone(&self.demo)
    }

    /// Admit one anonymous request from `ip` if today's cap allows it, and
    /// count it. A record from an earlier day counts as zero.
    pub async fn check_and_increment_demo(
        &self,
        ip: &str,
        now: DateTime<Utc>,
    ) -> Result<DemoDecision> {
        let limit = self.limits.demo_daily_limit;
        let today = now.date_naive();

        let _gate = self.demo_gate.lock().await;
        let mut record = match self.demo.get(ip).await? {
            Some(r) if r.date == today => r,
            _ => DemoUsageRecord {
                ip: ip.to_owned(),
                count: 0,
                date: today,
            },
        };

        if record.count >= limit {
            return Ok(DemoDecision {
                allowed: false,
                count: record.count,
                limit,
            });
        }

        record.count += 1;
        let count = record.count;
        self.demo.set(ip, record, end_of_day(today)).await?;

        Ok(DemoDecision {
            allowed: true,
            count,
            limit,
        })
    }

    /// Compare the user's lifetime run count upstream against the cap.
    pub async fn check_authenticated_limit(
        &self,
        user_id: &str,
        token: &str,
    ) -> Result<LifetimeDecision, UpstreamError> {
        let total_searches = self.upstream.count_runs(user_id, token).await?;
        Ok(LifetimeDecision {
            allowed: total_searches < self.limits.total_limit,
            total_searches,
            limit: self.limits.total_limit,
        })
    }
}

/// Midnight UTC at the start of the day after `date`.
fn end_of_day(date: NaiveDate) -> DateTime<Utc> {
    date.succ_opt()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
