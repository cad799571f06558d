//! Structured security event log.
//!
//! Every admission decision is recorded on the `audyt::security` target with
//! the caller's IP, user agent and origin, so the events can be routed to
//! their own sink with an `EnvFilter` directive.

use chrono::{SecondsFormat, Utc};
use serde_json::Value;
use tracing::{info, warn};

use crate::client::ClientContext;

pub const SECURITY_TARGET: &str = "audyt::security";

/// How loudly an event is logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Routine decisions: forwarded requests, demo admissions.
    Notice,
    /// Violations and failed checks.
    Alert,
}

pub fn record(event: &str, details: Value, ctx: &ClientContext) {
    emit(Severity::Notice, event, details, ctx);
}

pub fn alert(event: &str, details: Value, ctx: &ClientContext) {
    emit(Severity::Alert, event, details, ctx);
}

pub fn emit(severity: Severity, event: &str, details: Value, ctx: &ClientContext) {
    let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
    let user_agent = ctx.user_agent.as_deref().unwrap_or("-");
    let origin = ctx.origin.as_deref().unwrap_or("-");
    match severity {
        Severity::Notice => info!(
            target: SECURITY_TARGET,
            %timestamp,
            event,
            %details,
            ip = %ctx.ip,
            user_agent,
            origin,
            "[SECURITY] {event}"
        ),
        Severity::Alert => warn!(
            target: SECURITY_TARGET,
            %timestamp,
            event,
            %details,
            ip = %ctx.ip,
            user_agent,
            origin,
            "[SECURITY] {event}"
        ),
    }
}

/// First ten characters of a secret, for logs.
pub fn redact(secret: &str) -> String {
    let head: String = secret.chars().take(10).collect();
    if head.len() < secret.len() {
        format!("{head}...")
    } else {
        head
    }
}
