//! Unified `Database` trait: single async interface for all persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::audit::AuditEvent;
use crate::error::DatabaseError;
use crate::model::{
    ComplaintRecord, FollowUpDraft, InsertOutcome, ProcessedMessageRecord, SlaStatus,
    SlaTrackingRecord,
};

/// A classification result stored for reuse.
#[derive(Debug, Clone)]
pub struct CachedClassification {
    pub content_hash: String,
    pub classifier_version: String,
    pub kind: String,
    /// Serialized result (JSON).
    pub result: String,
    pub confidence: f32,
    pub hit_count: i64,
    pub created_at: DateTime<Utc>,
}

/// Backend-agnostic database trait covering the ledger, domain records,
/// the classification cache, settings, templates and the audit trail.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn init_schema(&self) -> Result<(), DatabaseError>;

    // ── Ledger ──────────────────────────────────────────────────────

    /// Append a ledger row. A unique-constraint hit returns `Duplicate`.
    async fn insert_processed_message(
        &self,
        record: &ProcessedMessageRecord,
    ) -> Result<InsertOutcome, DatabaseError>;

    async fn processed_message_exists(&self, message_id: &str) -> Result<bool, DatabaseError>;

    async fn message_id_hash_exists(&self, hash: &str) -> Result<bool, DatabaseError>;

    async fn thread_exists(&self, thread_id: &str) -> Result<bool, DatabaseError>;

    async fn claim_reference_exists(&self, claim_reference: &str) -> Result<bool, DatabaseError>;

    /// Count ledger rows for a provider message id (0 or 1).
    async fn count_processed_messages(&self, message_id: &str) -> Result<i64, DatabaseError>;

    // ── Complaints ──────────────────────────────────────────────────

    async fn insert_complaint(&self, complaint: &ComplaintRecord) -> Result<(), DatabaseError>;

    async fn list_complaints(&self, limit: usize) -> Result<Vec<ComplaintRecord>, DatabaseError>;

    // ── SLA tracking ────────────────────────────────────────────────

    /// Insert an SLA clock. A second in-progress clock for the same
    /// claim reference returns `Duplicate`.
    async fn insert_sla(&self, record: &SlaTrackingRecord) -> Result<InsertOutcome, DatabaseError>;

    async fn sla_in_progress_exists(&self, claim_reference: &str) -> Result<bool, DatabaseError>;

    async fn get_active_sla(
        &self,
        claim_reference: &str,
    ) -> Result<Option<SlaTrackingRecord>, DatabaseError>;

    /// In-progress clocks whose deadline is before `now`.
    async fn list_overdue_sla(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<SlaTrackingRecord>, DatabaseError>;

    /// Close an in-progress clock with a new status. Returns false if the
    /// id is unknown or the clock was already closed.
    async fn update_sla_status(&self, id: Uuid, status: SlaStatus) -> Result<bool, DatabaseError>;

    // ── Follow-up drafts ────────────────────────────────────────────

    async fn insert_follow_up_draft(&self, draft: &FollowUpDraft) -> Result<(), DatabaseError>;

    async fn list_unused_drafts(&self, limit: usize) -> Result<Vec<FollowUpDraft>, DatabaseError>;

    /// Reviewer hook. The core never calls this.
    async fn mark_draft_used(&self, id: Uuid) -> Result<bool, DatabaseError>;

    // ── Classification cache ────────────────────────────────────────

    async fn get_cached_classification(
        &self,
        content_hash: &str,
        classifier_version: &str,
        kind: &str,
    ) -> Result<Option<CachedClassification>, DatabaseError>;

    /// Store a result. An existing entry for the same key is kept.
    async fn put_cached_classification(
        &self,
        entry: &CachedClassification,
    ) -> Result<(), DatabaseError>;

    async fn record_cache_hit(
        &self,
        content_hash: &str,
        classifier_version: &str,
        kind: &str,
    ) -> Result<(), DatabaseError>;

    // ── Settings ────────────────────────────────────────────────────

    async fn get_setting(&self, key: &str) -> Result<Option<serde_json::Value>, DatabaseError>;

    async fn set_setting(&self, key: &str, value: &serde_json::Value)
    -> Result<(), DatabaseError>;

    async fn delete_setting(&self, key: &str) -> Result<bool, DatabaseError>;

    // ── Templates ───────────────────────────────────────────────────

    /// Returns `(subject, body)` for a stored template.
    async fn get_template(&self, name: &str) -> Result<Option<(String, String)>, DatabaseError>;

    async fn set_template(&self, name: &str, subject: &str, body: &str)
    -> Result<(), DatabaseError>;

    // ── Audit ───────────────────────────────────────────────────────

    async fn append_audit_event(&self, event: &AuditEvent) -> Result<(), DatabaseError>;

    /// Most recent first.
    async fn list_audit_events(&self, limit: usize) -> Result<Vec<AuditEvent>, DatabaseError>;
}
