//! Knobs that decide how strict admission is.

use std::fmt;
use std::str::FromStr;

use ipnet::IpNet;

use crate::error::ProxyError;

/// Edge functions the proxy is willing to forward to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeFunction {
    TiktokScraper,
    VideoAnalyzer,
}

impl EdgeFunction {
    pub const ALL: [EdgeFunction; 2] = [Self::TiktokScraper, Self::VideoAnalyzer];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TiktokScraper => "tiktok-scraper",
            Self::VideoAnalyzer => "video-analyzer",
        }
    }
}

impl FromStr for EdgeFunction {
    type Err = ProxyError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|f| f.as_str() == name)
            .ok_or_else(|| ProxyError::FunctionNotFound(name.to_owned()))
    }
}

impl fmt::Display for EdgeFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Usage caps for anonymous and signed-in callers.
#[derive(Debug, Clone, PartialEq)]
pub struct UsageLimits {
    /// Anonymous searches per IP per UTC day.
    pub demo_daily_limit: u32,
    /// Anonymous `resultsLimit` values above this are clamped down to it.
    pub demo_max_results: u64,
    /// Lifetime searches for signed-in users without an unlimited plan.
    pub total_limit: u64,
    /// Signed-in `resultsLimit` values above this are rejected.
    pub max_results: u64,
}

impl Default for UsageLimits {
    fn default() -> Self {
        Self {
            demo_daily_limit: 2,
            demo_max_results: 5,
            total_limit: 3,
            max_results: 10,
        }
    }
}

/// Admission policy switches.
#[derive(Debug, Clone)]
pub struct AdmissionPolicy {
    /// Callers from these networks skip usage, CSRF and signature checks.
    pub admin_networks: Vec<IpNet>,
    /// Let requests through when a usage lookup itself fails.
    pub fail_open_on_limit_check_error: bool,
    /// Reject CSRF failures instead of only logging them.
    pub enforce_csrf: bool,
    /// Verify `X-Signature` locally instead of leaving it to the edge function.
    pub verify_signatures: bool,
    pub limits: UsageLimits,
}

impl Default for AdmissionPolicy {
    fn default() -> Self {
        Self {
            admin_networks: Vec::new(),
            fail_open_on_limit_check_error: true,
            enforce_csrf: true,
            verify_signatures: false,
            limits: UsageLimits::default(),
        }
    }
}

impl AdmissionPolicy {
    pub fn is_admin_ip(&self, ip: &str) -> bool {
        crate::client::is_listed(ip, &self.admin_networks)
    }
}
