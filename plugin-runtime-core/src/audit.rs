//! Audit trail for plugin data access

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

/// One audited PluginAPI call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// e.g. `plugin.data_access`
    pub event_type: String,
    /// Calling plugin id
    pub subject: String,
    /// `service.operation`
    pub action: String,
    pub allowed: bool,
    pub data: serde_json::Value,
}

impl AuditEntry {
    pub fn new(
        event_type: impl Into<String>,
        subject: impl Into<String>,
        action: impl Into<String>,
        allowed: bool,
        data: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            event_type: event_type.into(),
            subject: subject.into(),
            action: action.into(),
            allowed,
            data,
        }
    }
}

/// Destination for audit entries. Recording must not fail the audited call.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, entry: AuditEntry);
}

/// Writes audit entries as `tracing` events on the `audit` target
#[derive(Debug, Default)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, entry: AuditEntry) {
        tracing::info!(
            target: "audit",
            audit_id = %entry.id,
            event_type = %entry.event_type,
            plugin_id = %entry.subject,
            action = %entry.action,
            allowed = entry.allowed,
            "Plugin audit event"
        );
    }
}

/// Keeps entries in memory, mostly for tests and diagnostics
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    entries: RwLock<Vec<AuditEntry>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn entries(&self) -> Vec<AuditEntry> {
        self.entries.read().await.clone()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn record(&self, entry: AuditEntry) {
        self.entries.write().await.push(entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_sink_keeps_order() {
        let sink = MemoryAuditSink::new();
        sink.record(AuditEntry::new("plugin.data_access", "a", "entities.get", true, serde_json::Value::Null))
            .await;
        sink.record(AuditEntry::new("plugin.data_access", "a", "entities.delete", false, serde_json::Value::Null))
            .await;

        let entries = sink.entries().await;
        assert_eq!(entries.len(), 2);
        assert!(entries[0].allowed);
        assert_eq!(entries[1].action, "entities.delete");
    }
}
