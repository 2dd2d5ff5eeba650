//! Audit trail hook.
//!
//! Recording is fire-and-forget: an audit sink that fails must never fail
//! the request that produced the entry.

use std::net::IpAddr;

use serde_json::Value;
use tracing::{info, warn};

use crate::auth::RequestContext;

#[derive(Clone, Debug, PartialEq)]
pub struct AuditEntry {
    pub action: String,
    pub resource: String,
    pub actor_id: Option<u64>,
    pub ip: Option<IpAddr>,
    pub user_agent: Option<String>,
    pub details: Value,
}

impl AuditEntry {
    pub(crate) fn new(context: &RequestContext, action: &str, resource: String, details: Value) -> Self {
        Self {
            action: action.to_string(),
            resource,
            actor_id: context.actor_id(),
            ip: context.peer.map(|peer| peer.ip()),
            user_agent: context.user_agent.clone(),
            details,
        }
    }
}

pub trait AuditLogger: Send + Sync {
    fn record(&self, entry: AuditEntry);

    fn record_error(&self, entry: AuditEntry, error: &str);
}

/// Writes audit entries as structured events on the `audit` target.
pub struct TracingAuditLogger;

impl AuditLogger for TracingAuditLogger {
    fn record(&self, entry: AuditEntry) {
        info!(
            target: "audit",
            action = %entry.action,
            resource = %entry.resource,
            actor_id = entry.actor_id,
            ip = ?entry.ip,
            user_agent = entry.user_agent.as_deref(),
            details = %entry.details,
            "audit"
        );
    }

    fn record_error(&self, entry: AuditEntry, error: &str) {
        warn!(
            target: "audit",
            action = %entry.action,
            resource = %entry.resource,
            actor_id = entry.actor_id,
            ip = ?entry.ip,
            user_agent = entry.user_agent.as_deref(),
            details = %entry.details,
            error,
            "audit"
        );
    }
}
