//! Audit trail: one structured event per routing decision.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::store::Database;

/// A routing decision, with enough detail to reconstruct why it was taken.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: Uuid,
    /// Branch name, e.g. "new_job", "complaint", "regulatory_mention".
    pub branch: String,
    pub message_id: Option<String>,
    pub sender: Option<String>,
    pub claim_reference: Option<String>,
    pub confidence: Option<f32>,
    /// Classification method ("ai", "fallback", "cached").
    pub method: Option<String>,
    pub detail: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(branch: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            branch: branch.into(),
            message_id: None,
            sender: None,
            claim_reference: None,
            confidence: None,
            method: None,
            detail: serde_json::json!({}),
            created_at: Utc::now(),
        }
    }

    pub fn with_message(mut self, message_id: &str, sender: &str) -> Self {
        self.message_id = Some(message_id.to_string());
        self.sender = Some(sender.to_string());
        self
    }

    pub fn with_claim_reference(mut self, claim_reference: Option<&str>) -> Self {
        self.claim_reference = claim_reference.map(String::from);
        self
    }

    pub fn with_classification(mut self, confidence: f32, method: &str) -> Self {
        self.confidence = Some(confidence);
        self.method = Some(method.to_string());
        self
    }

    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = detail;
        self
    }
}

/// Destination for audit events.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn append(&self, event: AuditEvent) -> Result<(), DatabaseError>;
}

/// Writes events to the `audit_events` table and mirrors them to tracing.
pub struct DbAuditSink {
    db: Arc<dyn Database>,
}

impl DbAuditSink {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl AuditSink for DbAuditSink {
    async fn append(&self, event: AuditEvent) -> Result<(), DatabaseError> {
        info!(
            target: "audit",
            branch = %event.branch,
            message_id = event.message_id.as_deref().unwrap_or(""),
            sender = event.sender.as_deref().unwrap_or(""),
            claim_reference = event.claim_reference.as_deref().unwrap_or(""),
            confidence = event.confidence.unwrap_or(0.0),
            method = event.method.as_deref().unwrap_or(""),
            "Routing decision"
        );
        self.db.append_audit_event(&event).await
    }
}
