//! libSQL backend: async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. Uniqueness invariants of the
//! ledger and SLA tables are enforced by indexes (see `migrations`), and
//! constraint hits are reported as `InsertOutcome::Duplicate`.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::audit::AuditEvent;
use crate::error::DatabaseError;
use crate::model::{
    ComplaintRecord, ComplaintType, FollowUpDraft, FollowUpIntent, InsertOutcome,
    ProcessedMessageRecord, Severity, SlaStatus, SlaTrackingRecord, Urgency,
};
use crate::store::migrations;
use crate::store::traits::{CachedClassification, Database};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.init_schema().await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Run a `SELECT EXISTS(...)`-style query returning one integer.
    async fn exists(
        &self,
        context: &str,
        sql: &str,
        value: &str,
    ) -> Result<bool, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params![value])
            .await
            .map_err(|e| DatabaseError::from_libsql(context, e))?;
        match rows.next().await {
            Ok(Some(row)) => Ok(row.get::<i64>(0).unwrap_or(0) > 0),
            Ok(None) => Ok(false),
            Err(e) => Err(DatabaseError::from_libsql(context, e)),
        }
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn opt_real(v: Option<f32>) -> libsql::Value {
    match v {
        Some(v) => libsql::Value::Real(f64::from(v)),
        None => libsql::Value::Null,
    }
}

fn parse_uuid(s: &str) -> Uuid {
    Uuid::parse_str(s).unwrap_or_else(|_| Uuid::nil())
}

fn parse_json(s: &str) -> serde_json::Value {
    serde_json::from_str(s).unwrap_or(serde_json::Value::Null)
}

const SLA_COLUMNS: &str = "id, claim_reference, sender, insurer_domain, urgency, started_at, deadline, required_hours, business_hours_only, commitment, status";

/// Map a libsql Row to an SlaTrackingRecord (column order = SLA_COLUMNS).
fn row_to_sla(row: &libsql::Row) -> Result<SlaTrackingRecord, libsql::Error> {
    let id: String = row.get(0)?;
    let urgency: String = row.get(4)?;
    let started: String = row.get(5)?;
    let deadline: String = row.get(6)?;
    let status: String = row.get(10)?;

    Ok(SlaTrackingRecord {
        id: parse_uuid(&id),
        claim_reference: row.get(1)?,
        sender: row.get(2)?,
        insurer_domain: row.get(3)?,
        urgency: if urgency == "urgent" { Urgency::Urgent } else { Urgency::Normal },
        started_at: parse_datetime(&started),
        deadline: parse_datetime(&deadline),
        required_hours: u32::try_from(row.get::<i64>(7)?).unwrap_or(0),
        business_hours_only: row.get::<i64>(8)? != 0,
        commitment: row.get(9)?,
        status: status.parse().unwrap_or(SlaStatus::InProgress),
    })
}

const DRAFT_COLUMNS: &str = "id, claim_reference, intent, subject, body, used, created_at";

fn row_to_draft(row: &libsql::Row) -> Result<FollowUpDraft, libsql::Error> {
    let id: String = row.get(0)?;
    let intent: String = row.get(2)?;
    let created: String = row.get(6)?;
    Ok(FollowUpDraft {
        id: parse_uuid(&id),
        claim_reference: row.get(1)?,
        intent: intent.parse().unwrap_or(FollowUpIntent::Generic),
        subject: row.get(3)?,
        body: row.get(4)?,
        used: row.get::<i64>(5)? != 0,
        created_at: parse_datetime(&created),
    })
}

const COMPLAINT_COLUMNS: &str = "id, claim_reference, vehicle_id, sender, subject, complaint_type, severity, detection, created_at";

fn row_to_complaint(row: &libsql::Row) -> Result<ComplaintRecord, libsql::Error> {
    let id: String = row.get(0)?;
    let complaint_type: String = row.get(5)?;
    let severity: String = row.get(6)?;
    let detection: String = row.get(7)?;
    let created: String = row.get(8)?;
    Ok(ComplaintRecord {
        id: parse_uuid(&id),
        claim_reference: row.get(1).ok(),
        vehicle_id: row.get(2).ok(),
        sender: row.get(3)?,
        subject: row.get(4)?,
        complaint_type: complaint_type.parse().unwrap_or(ComplaintType::General),
        severity: severity.parse().unwrap_or(Severity::Low),
        detection: parse_json(&detection),
        created_at: parse_datetime(&created),
    })
}

const AUDIT_COLUMNS: &str = "id, branch, message_id, sender, claim_reference, confidence, method, detail, created_at";

fn row_to_audit(row: &libsql::Row) -> Result<AuditEvent, libsql::Error> {
    let id: String = row.get(0)?;
    let detail: String = row.get(7)?;
    let created: String = row.get(8)?;
    Ok(AuditEvent {
        id: parse_uuid(&id),
        branch: row.get(1)?,
        message_id: row.get(2).ok(),
        sender: row.get(3).ok(),
        claim_reference: row.get(4).ok(),
        confidence: row.get::<f64>(5).ok().map(|c| c as f32),
        method: row.get(6).ok(),
        detail: parse_json(&detail),
        created_at: parse_datetime(&created),
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn init_schema(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Ledger ──────────────────────────────────────────────────────

    async fn insert_processed_message(
        &self,
        record: &ProcessedMessageRecord,
    ) -> Result<InsertOutcome, DatabaseError> {
        let result = self
            .conn()
            .execute(
                "INSERT INTO processed_messages (message_id, message_id_hash, thread_id, sender,
                    subject, claim_reference, is_complaint, is_follow_up, processed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    record.message_id.as_str(),
                    opt_text(record.message_id_hash.as_deref()),
                    opt_text(record.thread_id.as_deref()),
                    record.sender.as_str(),
                    record.subject.as_str(),
                    opt_text(record.claim_reference.as_deref()),
                    i64::from(record.is_complaint),
                    i64::from(record.is_follow_up),
                    record.processed_at.to_rfc3339(),
                ],
            )
            .await;

        match result {
            Ok(_) => {
                debug!(message_id = %record.message_id, "Ledger row inserted");
                Ok(InsertOutcome::Inserted)
            }
            Err(e) => {
                let err = DatabaseError::from_libsql("insert_processed_message", e);
                if err.is_unique_violation() {
                    debug!(message_id = %record.message_id, "Ledger row already present");
                    Ok(InsertOutcome::Duplicate)
                } else {
                    Err(err)
                }
            }
        }
    }

    async fn processed_message_exists(&self, message_id: &str) -> Result<bool, DatabaseError> {
        self.exists(
            "processed_message_exists",
            "SELECT EXISTS(SELECT 1 FROM processed_messages WHERE message_id = ?1)",
            message_id,
        )
        .await
    }

    async fn message_id_hash_exists(&self, hash: &str) -> Result<bool, DatabaseError> {
        self.exists(
            "message_id_hash_exists",
            "SELECT EXISTS(SELECT 1 FROM processed_messages WHERE message_id_hash = ?1)",
            hash,
        )
        .await
    }

    async fn thread_exists(&self, thread_id: &str) -> Result<bool, DatabaseError> {
        self.exists(
            "thread_exists",
            "SELECT EXISTS(SELECT 1 FROM processed_messages WHERE thread_id = ?1)",
            thread_id,
        )
        .await
    }

    async fn claim_reference_exists(&self, claim_reference: &str) -> Result<bool, DatabaseError> {
        self.exists(
            "claim_reference_exists",
            "SELECT EXISTS(SELECT 1 FROM processed_messages WHERE claim_reference = ?1)",
            claim_reference,
        )
        .await
    }

    async fn count_processed_messages(&self, message_id: &str) -> Result<i64, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*) FROM processed_messages WHERE message_id = ?1",
                params![message_id],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("count_processed_messages", e))?;
        match rows.next().await {
            Ok(Some(row)) => Ok(row.get::<i64>(0).unwrap_or(0)),
            _ => Ok(0),
        }
    }

    // ── Complaints ──────────────────────────────────────────────────

    async fn insert_complaint(&self, complaint: &ComplaintRecord) -> Result<(), DatabaseError> {
        let detection = serde_json::to_string(&complaint.detection)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        self.conn()
            .execute(
                &format!("INSERT INTO complaints ({COMPLAINT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"),
                params![
                    complaint.id.to_string(),
                    opt_text(complaint.claim_reference.as_deref()),
                    opt_text(complaint.vehicle_id.as_deref()),
                    complaint.sender.as_str(),
                    complaint.subject.as_str(),
                    complaint.complaint_type.as_str(),
                    complaint.severity.as_str(),
                    detection,
                    complaint.created_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("insert_complaint", e))?;
        Ok(())
    }

    async fn list_complaints(&self, limit: usize) -> Result<Vec<ComplaintRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {COMPLAINT_COLUMNS} FROM complaints ORDER BY created_at DESC LIMIT ?1"),
                params![limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("list_complaints", e))?;

        let mut complaints = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::from_libsql("list_complaints", e))?
        {
            complaints.push(
                row_to_complaint(&row)
                    .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?,
            );
        }
        Ok(complaints)
    }

    // ── SLA tracking ────────────────────────────────────────────────

    async fn insert_sla(&self, record: &SlaTrackingRecord) -> Result<InsertOutcome, DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let result = self
            .conn()
            .execute(
                &format!(
                    "INSERT INTO sla_tracking ({SLA_COLUMNS}, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
                ),
                params![
                    record.id.to_string(),
                    record.claim_reference.as_str(),
                    record.sender.as_str(),
                    record.insurer_domain.as_str(),
                    record.urgency.as_str(),
                    record.started_at.to_rfc3339(),
                    record.deadline.to_rfc3339(),
                    i64::from(record.required_hours),
                    i64::from(record.business_hours_only),
                    record.commitment.as_str(),
                    record.status.as_str(),
                    now,
                ],
            )
            .await;

        match result {
            Ok(_) => Ok(InsertOutcome::Inserted),
            Err(e) => {
                let err = DatabaseError::from_libsql("insert_sla", e);
                if err.is_unique_violation() {
                    Ok(InsertOutcome::Duplicate)
                } else {
                    Err(err)
                }
            }
        }
    }

    async fn sla_in_progress_exists(&self, claim_reference: &str) -> Result<bool, DatabaseError> {
        self.exists(
            "sla_in_progress_exists",
            "SELECT EXISTS(SELECT 1 FROM sla_tracking WHERE claim_reference = ?1 AND status = 'in_progress')",
            claim_reference,
        )
        .await
    }

    async fn get_active_sla(
        &self,
        claim_reference: &str,
    ) -> Result<Option<SlaTrackingRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {SLA_COLUMNS} FROM sla_tracking
                     WHERE claim_reference = ?1 AND status = 'in_progress'"
                ),
                params![claim_reference],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("get_active_sla", e))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(
                row_to_sla(&row).map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?,
            )),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::from_libsql("get_active_sla", e)),
        }
    }

    async fn list_overdue_sla(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<SlaTrackingRecord>, DatabaseError> {
        // RFC 3339 strings in UTC sort chronologically.
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {SLA_COLUMNS} FROM sla_tracking
                     WHERE status = 'in_progress' AND deadline < ?1
                     ORDER BY deadline"
                ),
                params![now.to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("list_overdue_sla", e))?;

        let mut records = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::from_libsql("list_overdue_sla", e))?
        {
            records.push(
                row_to_sla(&row).map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?,
            );
        }
        Ok(records)
    }

    async fn update_sla_status(&self, id: Uuid, status: SlaStatus) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "UPDATE sla_tracking SET status = ?1, updated_at = ?2
                 WHERE id = ?3 AND status = 'in_progress'",
                params![status.as_str(), Utc::now().to_rfc3339(), id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("update_sla_status", e))?;
        Ok(count > 0)
    }

    // ── Follow-up drafts ────────────────────────────────────────────

    async fn insert_follow_up_draft(&self, draft: &FollowUpDraft) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                &format!("INSERT INTO follow_up_drafts ({DRAFT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"),
                params![
                    draft.id.to_string(),
                    draft.claim_reference.as_str(),
                    draft.intent.as_str(),
                    draft.subject.as_str(),
                    draft.body.as_str(),
                    i64::from(draft.used),
                    draft.created_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("insert_follow_up_draft", e))?;
        Ok(())
    }

    async fn list_unused_drafts(&self, limit: usize) -> Result<Vec<FollowUpDraft>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {DRAFT_COLUMNS} FROM follow_up_drafts
                     WHERE used = 0 ORDER BY created_at DESC LIMIT ?1"
                ),
                params![limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("list_unused_drafts", e))?;

        let mut drafts = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::from_libsql("list_unused_drafts", e))?
        {
            drafts.push(
                row_to_draft(&row).map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?,
            );
        }
        Ok(drafts)
    }

    async fn mark_draft_used(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "UPDATE follow_up_drafts SET used = 1 WHERE id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("mark_draft_used", e))?;
        Ok(count > 0)
    }

    // ── Classification cache ────────────────────────────────────────

    async fn get_cached_classification(
        &self,
        content_hash: &str,
        classifier_version: &str,
        kind: &str,
    ) -> Result<Option<CachedClassification>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT result, confidence, hit_count, created_at FROM classification_cache
                 WHERE content_hash = ?1 AND classifier_version = ?2 AND kind = ?3",
                params![content_hash, classifier_version, kind],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("get_cached_classification", e))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let created: String = row
                    .get(3)
                    .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?;
                Ok(Some(CachedClassification {
                    content_hash: content_hash.to_string(),
                    classifier_version: classifier_version.to_string(),
                    kind: kind.to_string(),
                    result: row
                        .get(0)
                        .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?,
                    confidence: row.get::<f64>(1).unwrap_or(0.0) as f32,
                    hit_count: row.get::<i64>(2).unwrap_or(0),
                    created_at: parse_datetime(&created),
                }))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::from_libsql("get_cached_classification", e)),
        }
    }

    async fn put_cached_classification(
        &self,
        entry: &CachedClassification,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT OR IGNORE INTO classification_cache
                    (content_hash, classifier_version, kind, result, confidence, hit_count, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    entry.content_hash.as_str(),
                    entry.classifier_version.as_str(),
                    entry.kind.as_str(),
                    entry.result.as_str(),
                    f64::from(entry.confidence),
                    entry.hit_count,
                    entry.created_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("put_cached_classification", e))?;
        Ok(())
    }

    async fn record_cache_hit(
        &self,
        content_hash: &str,
        classifier_version: &str,
        kind: &str,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE classification_cache SET hit_count = hit_count + 1, last_hit_at = ?4
                 WHERE content_hash = ?1 AND classifier_version = ?2 AND kind = ?3",
                params![content_hash, classifier_version, kind, Utc::now().to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("record_cache_hit", e))?;
        Ok(())
    }

    // ── Settings ────────────────────────────────────────────────────

    async fn get_setting(&self, key: &str) -> Result<Option<serde_json::Value>, DatabaseError> {
        let mut rows = self
            .conn()
            .query("SELECT value FROM settings WHERE key = ?1", params![key])
            .await
            .map_err(|e| DatabaseError::from_libsql("get_setting", e))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let value_str: String = row.get(0).unwrap_or_else(|_| "null".to_string());
                let value: serde_json::Value =
                    serde_json::from_str(&value_str).unwrap_or(serde_json::Value::Null);
                Ok(Some(value))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::from_libsql("get_setting", e)),
        }
    }

    async fn set_setting(
        &self,
        key: &str,
        value: &serde_json::Value,
    ) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let value_str = serde_json::to_string(value)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

        self.conn()
            .execute(
                "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT (key) DO UPDATE SET value = ?2, updated_at = ?3",
                params![key, value_str, now],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("set_setting", e))?;

        Ok(())
    }

    async fn delete_setting(&self, key: &str) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute("DELETE FROM settings WHERE key = ?1", params![key])
            .await
            .map_err(|e| DatabaseError::from_libsql("delete_setting", e))?;
        Ok(count > 0)
    }

    // ── Templates ───────────────────────────────────────────────────

    async fn get_template(&self, name: &str) -> Result<Option<(String, String)>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT subject, body FROM email_templates WHERE name = ?1",
                params![name],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("get_template", e))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let subject: String = row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?;
                let body: String = row
                    .get(1)
                    .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?;
                Ok(Some((subject, body)))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::from_libsql("get_template", e)),
        }
    }

    async fn set_template(
        &self,
        name: &str,
        subject: &str,
        body: &str,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO email_templates (name, subject, body, updated_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (name) DO UPDATE SET subject = ?2, body = ?3, updated_at = ?4",
                params![name, subject, body, Utc::now().to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("set_template", e))?;
        Ok(())
    }

    // ── Audit ───────────────────────────────────────────────────────

    async fn append_audit_event(&self, event: &AuditEvent) -> Result<(), DatabaseError> {
        let detail = serde_json::to_string(&event.detail)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        self.conn()
            .execute(
                &format!("INSERT INTO audit_events ({AUDIT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"),
                params![
                    event.id.to_string(),
                    event.branch.as_str(),
                    opt_text(event.message_id.as_deref()),
                    opt_text(event.sender.as_deref()),
                    opt_text(event.claim_reference.as_deref()),
                    opt_real(event.confidence),
                    opt_text(event.method.as_deref()),
                    detail,
                    event.created_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("append_audit_event", e))?;
        Ok(())
    }

    async fn list_audit_events(&self, limit: usize) -> Result<Vec<AuditEvent>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {AUDIT_COLUMNS} FROM audit_events ORDER BY created_at DESC, rowid DESC LIMIT ?1"),
                params![limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("list_audit_events", e))?;

        let mut events = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::from_libsql("list_audit_events", e))?
        {
            events.push(
                row_to_audit(&row).map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?,
            );
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    async fn test_db() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    fn ledger_row(message_id: &str) -> ProcessedMessageRecord {
        ProcessedMessageRecord {
            message_id: message_id.to_string(),
            message_id_hash: Some(format!("hash-{message_id}")),
            thread_id: Some(format!("thread-{message_id}")),
            sender: "jobs@insurer.example".into(),
            subject: "New instruction".into(),
            claim_reference: Some("CLM-100200".into()),
            is_complaint: false,
            is_follow_up: false,
            processed_at: Utc::now(),
        }
    }

    fn sla_row(claim_reference: &str, deadline: DateTime<Utc>) -> SlaTrackingRecord {
        SlaTrackingRecord {
            id: Uuid::new_v4(),
            claim_reference: claim_reference.to_string(),
            sender: "jobs@insurer.example".into(),
            insurer_domain: "insurer.example".into(),
            urgency: Urgency::Normal,
            started_at: Utc::now(),
            deadline,
            required_hours: 24,
            business_hours_only: true,
            commitment: "Contact within 24 business hours".into(),
            status: SlaStatus::InProgress,
        }
    }

    // ── Ledger tests ────────────────────────────────────────────────

    #[tokio::test]
    async fn ledger_insert_and_lookup() {
        let db = test_db().await;
        let outcome = db.insert_processed_message(&ledger_row("m-1")).await.unwrap();
        assert_eq!(outcome, InsertOutcome::Inserted);

        assert!(db.processed_message_exists("m-1").await.unwrap());
        assert!(db.message_id_hash_exists("hash-m-1").await.unwrap());
        assert!(db.thread_exists("thread-m-1").await.unwrap());
        assert!(db.claim_reference_exists("CLM-100200").await.unwrap());
        assert!(!db.processed_message_exists("m-2").await.unwrap());
    }

    #[tokio::test]
    async fn ledger_duplicate_message_id_is_not_an_error() {
        let db = test_db().await;
        db.insert_processed_message(&ledger_row("m-1")).await.unwrap();
        let again = db.insert_processed_message(&ledger_row("m-1")).await.unwrap();
        assert_eq!(again, InsertOutcome::Duplicate);
        assert_eq!(db.count_processed_messages("m-1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn ledger_duplicate_hash_under_new_provider_id() {
        let db = test_db().await;
        db.insert_processed_message(&ledger_row("m-1")).await.unwrap();

        let mut moved = ledger_row("m-9");
        moved.message_id_hash = Some("hash-m-1".into());
        moved.thread_id = None;
        let outcome = db.insert_processed_message(&moved).await.unwrap();
        assert_eq!(outcome, InsertOutcome::Duplicate);
    }

    #[tokio::test]
    async fn ledger_allows_many_null_hashes() {
        let db = test_db().await;
        for id in ["a", "b", "c"] {
            let mut row = ledger_row(id);
            row.message_id_hash = None;
            row.thread_id = None;
            assert_eq!(
                db.insert_processed_message(&row).await.unwrap(),
                InsertOutcome::Inserted
            );
        }
    }

    // ── SLA tests ───────────────────────────────────────────────────

    #[tokio::test]
    async fn sla_single_active_clock_per_claim() {
        let db = test_db().await;
        let deadline = Utc::now() + Duration::hours(24);
        let first = sla_row("CLM-1", deadline);
        assert_eq!(db.insert_sla(&first).await.unwrap(), InsertOutcome::Inserted);
        assert_eq!(
            db.insert_sla(&sla_row("CLM-1", deadline)).await.unwrap(),
            InsertOutcome::Duplicate
        );

        // Once the first clock is closed a new one may start.
        assert!(db.update_sla_status(first.id, SlaStatus::Met).await.unwrap());
        assert!(!db.sla_in_progress_exists("CLM-1").await.unwrap());
        assert_eq!(
            db.insert_sla(&sla_row("CLM-1", deadline)).await.unwrap(),
            InsertOutcome::Inserted
        );
    }

    #[tokio::test]
    async fn closed_clock_is_not_reopened_or_breached() {
        let db = test_db().await;
        let record = sla_row("CLM-2", Utc::now() - Duration::hours(1));
        db.insert_sla(&record).await.unwrap();

        assert!(db.update_sla_status(record.id, SlaStatus::Met).await.unwrap());
        assert!(!db.update_sla_status(record.id, SlaStatus::Breached).await.unwrap());
        assert!(db.list_overdue_sla(Utc::now()).await.unwrap().is_empty());
        assert!(db.get_active_sla("CLM-2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn sla_round_trip_and_overdue() {
        let db = test_db().await;
        let past = Utc::now() - Duration::hours(1);
        let future = Utc::now() + Duration::hours(5);
        db.insert_sla(&sla_row("CLM-OLD", past)).await.unwrap();
        db.insert_sla(&sla_row("CLM-NEW", future)).await.unwrap();

        let active = db.get_active_sla("CLM-NEW").await.unwrap().unwrap();
        assert_eq!(active.required_hours, 24);
        assert!(active.business_hours_only);
        assert_eq!(active.status, SlaStatus::InProgress);

        let overdue = db.list_overdue_sla(Utc::now()).await.unwrap();
        assert_eq!(overdue.len(), 1);
        assert_eq!(overdue[0].claim_reference, "CLM-OLD");
    }

    // ── Draft tests ─────────────────────────────────────────────────

    #[tokio::test]
    async fn drafts_start_unused_until_reviewed() {
        let db = test_db().await;
        let draft = FollowUpDraft {
            id: Uuid::new_v4(),
            claim_reference: "CLM-1".into(),
            intent: FollowUpIntent::StatusInquiry,
            subject: "[DRAFT - REVIEW REQUIRED] Re: update".into(),
            body: "Thanks".into(),
            used: false,
            created_at: Utc::now(),
        };
        db.insert_follow_up_draft(&draft).await.unwrap();

        let unused = db.list_unused_drafts(10).await.unwrap();
        assert_eq!(unused.len(), 1);
        assert_eq!(unused[0].intent, FollowUpIntent::StatusInquiry);

        assert!(db.mark_draft_used(draft.id).await.unwrap());
        assert!(db.list_unused_drafts(10).await.unwrap().is_empty());
    }

    // ── Complaint tests ─────────────────────────────────────────────

    #[tokio::test]
    async fn complaint_round_trip() {
        let db = test_db().await;
        let complaint = ComplaintRecord {
            id: Uuid::new_v4(),
            claim_reference: None,
            vehicle_id: Some("AB12CDE".into()),
            sender: "customer@example.com".into(),
            subject: "Formal complaint".into(),
            complaint_type: ComplaintType::Escalation,
            severity: Severity::High,
            detection: serde_json::json!({"keywords": ["ombudsman"]}),
            created_at: Utc::now(),
        };
        db.insert_complaint(&complaint).await.unwrap();

        let stored = db.list_complaints(5).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].severity, Severity::High);
        assert_eq!(stored[0].claim_reference, None);
        assert_eq!(stored[0].detection["keywords"][0], "ombudsman");
    }

    // ── Cache tests ─────────────────────────────────────────────────

    #[tokio::test]
    async fn cache_put_get_and_hits() {
        let db = test_db().await;
        let entry = CachedClassification {
            content_hash: "abc".into(),
            classifier_version: "v1".into(),
            kind: "analysis".into(),
            result: r#"{"claim_reference":"CLM-1"}"#.into(),
            confidence: 0.9,
            hit_count: 0,
            created_at: Utc::now(),
        };
        db.put_cached_classification(&entry).await.unwrap();
        db.record_cache_hit("abc", "v1", "analysis").await.unwrap();
        db.record_cache_hit("abc", "v1", "analysis").await.unwrap();

        let cached = db
            .get_cached_classification("abc", "v1", "analysis")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cached.hit_count, 2);
        assert!((cached.confidence - 0.9).abs() < 0.001);

        // Different version is a different key.
        assert!(
            db.get_cached_classification("abc", "v2", "analysis")
                .await
                .unwrap()
                .is_none()
        );
    }

    // ── Settings tests ──────────────────────────────────────────────

    #[tokio::test]
    async fn settings_crud() {
        let db = test_db().await;
        let value = serde_json::json!(["@insurer.example", "broker@agency.example"]);

        db.set_setting("authorized_senders", &value).await.unwrap();
        let fetched = db.get_setting("authorized_senders").await.unwrap().unwrap();
        assert_eq!(fetched[0], "@insurer.example");

        db.set_setting("authorized_senders", &serde_json::json!([]))
            .await
            .unwrap();
        let updated = db.get_setting("authorized_senders").await.unwrap().unwrap();
        assert!(updated.as_array().unwrap().is_empty());

        assert!(db.delete_setting("authorized_senders").await.unwrap());
        assert!(db.get_setting("authorized_senders").await.unwrap().is_none());
        assert!(!db.delete_setting("authorized_senders").await.unwrap());
    }

    #[tokio::test]
    async fn templates_upsert() {
        let db = test_db().await;
        db.set_template("complaint_alert", "Alert", "Body {{sender}}")
            .await
            .unwrap();
        db.set_template("complaint_alert", "Alert v2", "Body {{sender}}")
            .await
            .unwrap();
        let (subject, _) = db.get_template("complaint_alert").await.unwrap().unwrap();
        assert_eq!(subject, "Alert v2");
        assert!(db.get_template("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn opens_on_disk() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested").join("claims.db");
        let db = LibSqlBackend::new_local(&path).await.unwrap();
        db.insert_processed_message(&ledger_row("disk-1")).await.unwrap();
        assert!(path.exists());
    }
}
