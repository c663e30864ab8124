//! Security audit sink.
//!
//! Components report security-relevant events (failed decryptions, database
//! provisioning, kicked collaborators) through [`AuditSink`]. Events are
//! fire-and-forget; the sink must never block or fail the calling operation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Event severity, mapped onto log levels by the tracing-backed sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// A single security event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityEvent {
    /// Event type tag, e.g. `secret_decrypt_failed`
    pub event_type: String,
    pub severity: Severity,
    /// Acting principal (user id or service name)
    pub actor: String,
    /// Source address when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    pub timestamp: DateTime<Utc>,
    /// Free-form structured context
    #[serde(default)]
    pub details: HashMap<String, serde_json::Value>,
    /// Risk score in [0, 100]
    pub risk: u8,
}

impl SecurityEvent {
    pub fn new(event_type: impl Into<String>, severity: Severity, actor: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            severity,
            actor: actor.into(),
            ip: None,
            timestamp: Utc::now(),
            details: HashMap::new(),
            risk: 0,
        }
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    pub fn with_risk(mut self, risk: u8) -> Self {
        self.risk = risk.min(100);
        self
    }
}

/// Fire-and-forget audit event consumer.
pub trait AuditSink: Send + Sync {
    fn record(&self, event: SecurityEvent);
}

/// Sink that drops every event.
#[derive(Debug, Default, Clone)]
pub struct NoopAuditSink;

impl AuditSink for NoopAuditSink {
    fn record(&self, _event: SecurityEvent) {}
}

/// Sink that forwards events to the tracing subscriber.
#[derive(Debug, Default, Clone)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: SecurityEvent) {
        let details = serde_json::to_string(&event.details).unwrap_or_default();
        match event.severity {
            Severity::Info => tracing::info!(
                event = %event.event_type,
                actor = %event.actor,
                risk = event.risk,
                %details,
                "audit"
            ),
            Severity::Warning => tracing::warn!(
                event = %event.event_type,
                actor = %event.actor,
                risk = event.risk,
                %details,
                "audit"
            ),
            Severity::Critical => tracing::error!(
                event = %event.event_type,
                actor = %event.actor,
                risk = event.risk,
                %details,
                "audit"
            ),
        }
    }
}

/// Shared handle used by component constructors.
pub type SharedAudit = std::sync::Arc<dyn AuditSink>;

/// Default sink when the caller wires none in.
pub fn noop() -> SharedAudit {
    std::sync::Arc::new(NoopAuditSink)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_builder() {
        let event = SecurityEvent::new("secret_decrypt_failed", Severity::Warning, "user:7")
            .with_detail("secret", "deploy-token")
            .with_risk(140);

        assert_eq!(event.event_type, "secret_decrypt_failed");
        assert_eq!(event.risk, 100);
        assert_eq!(
            event.details.get("secret"),
            Some(&serde_json::Value::from("deploy-token"))
        );
    }
}
