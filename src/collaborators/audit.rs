//! Audit sink collaborator (§6.5). Best-effort: failures are logged, never
//! propagated to callers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::warn;

/// A single audit event as created by `createAuditEvent`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub user_id: Option<String>,
    pub action: String,
    pub resource: String,
    pub resource_id: String,
    pub details: serde_json::Value,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Record `event`. Errors are swallowed by the caller per §6.5 and §7.
    async fn create_audit_event(&self, event: AuditEvent) -> anyhow::Result<()>;
}

/// In-process fake that simply accumulates events.
#[derive(Default)]
pub struct InMemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl InMemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything recorded so far, for assertions in tests.
    pub async fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().await.clone()
    }
}

#[async_trait]
impl AuditSink for InMemoryAuditSink {
    async fn create_audit_event(&self, event: AuditEvent) -> anyhow::Result<()> {
        self.events.lock().await.push(event);
        Ok(())
    }
}

/// Call `sink.create_audit_event`, logging rather than propagating failure.
pub async fn record_best_effort(sink: &dyn AuditSink, event: AuditEvent) {
    if let Err(e) = sink.create_audit_event(event).await {
        warn!(error = %e, "audit sink write failed, continuing");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_events_in_order() {
        let sink = InMemoryAuditSink::new();
        for action in ["purge", "escalate"] {
            record_best_effort(
                &sink,
                AuditEvent {
                    user_id: None,
                    action: action.to_string(),
                    resource: "incident".to_string(),
                    resource_id: "I1".to_string(),
                    details: serde_json::json!({}),
                    ip_address: None,
                    user_agent: None,
                    recorded_at: Utc::now(),
                },
            )
            .await;
        }
        let events = sink.events().await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].action, "purge");
        assert_eq!(events[1].action, "escalate");
    }
}
