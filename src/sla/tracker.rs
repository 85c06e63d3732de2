//! SLA clock lifecycle: start on a new job, breach when overdue.

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audit::{AuditEvent, AuditSink};
use crate::error::{ConfigError, DatabaseError};
use crate::model::{InsertOutcome, SlaStatus, SlaTrackingRecord, Urgency};
use crate::settings::ConfigSnapshot;
use crate::sla::calculator;
use crate::store::Database;

/// Urgent clocks never go below this many hours.
pub const URGENT_FLOOR_HOURS: u32 = 2;

const URGENT_SUFFIX: &str = " (URGENT)";

/// Hours, mode and commitment text for one clock, after override
/// resolution and urgency adjustment.
#[derive(Debug, Clone, PartialEq)]
pub struct SlaTerms {
    pub matched_key: Option<String>,
    pub hours: u32,
    pub business_hours_only: bool,
    pub commitment: String,
}

/// Halve for urgent work, flooring at [`URGENT_FLOOR_HOURS`]. Clocks already
/// at or below the floor are left alone.
pub fn urgent_hours(hours: u32) -> u32 {
    if hours > URGENT_FLOOR_HOURS {
        (hours / 2).max(URGENT_FLOOR_HOURS)
    } else {
        hours
    }
}

/// Resolve the SLA terms for an insurer domain and urgency.
pub fn plan(
    snapshot: &ConfigSnapshot,
    insurer_domain: &str,
    urgency: Urgency,
) -> Result<SlaTerms, ConfigError> {
    let resolved = snapshot.resolve_sla(insurer_domain)?;

    let halve = urgency == Urgency::Urgent && resolved.hours > URGENT_FLOOR_HOURS;
    let hours = if halve {
        urgent_hours(resolved.hours)
    } else {
        resolved.hours
    };

    let mut commitment = resolved.commitment.replace("{hours}", &hours.to_string());
    if halve {
        commitment.push_str(URGENT_SUFFIX);
    }

    Ok(SlaTerms {
        matched_key: resolved.matched_key,
        hours,
        business_hours_only: resolved.business_hours_only,
        commitment,
    })
}

/// Everything needed to open a clock for one message.
#[derive(Debug, Clone)]
pub struct SlaRequest<'a> {
    pub claim_reference: &'a str,
    pub sender: &'a str,
    pub insurer_domain: &'a str,
    pub urgency: Urgency,
    pub started_at: DateTime<Utc>,
}

/// Result of trying to open a clock.
#[derive(Debug, Clone)]
pub enum SlaStart {
    Started(SlaTrackingRecord),
    /// A clock for this claim reference is already running.
    AlreadyTracked,
}

/// Build the tracking record for a request. Pure apart from the id.
pub fn build_record(
    snapshot: &ConfigSnapshot,
    request: &SlaRequest<'_>,
) -> Result<SlaTrackingRecord, ConfigError> {
    let terms = plan(snapshot, request.insurer_domain, request.urgency)?;
    let deadline = calculator::deadline(
        request.started_at,
        terms.hours,
        terms.business_hours_only,
        &snapshot.calendar,
    );
    Ok(SlaTrackingRecord {
        id: Uuid::new_v4(),
        claim_reference: request.claim_reference.to_string(),
        sender: request.sender.to_string(),
        insurer_domain: request.insurer_domain.to_string(),
        urgency: request.urgency,
        started_at: request.started_at,
        deadline,
        required_hours: terms.hours,
        business_hours_only: terms.business_hours_only,
        commitment: terms.commitment,
        status: SlaStatus::InProgress,
    })
}

/// Persist a clock. The storage layer's partial unique index is the guard
/// against a second in-progress clock for the same claim.
pub async fn start(
    db: &dyn Database,
    record: SlaTrackingRecord,
) -> Result<SlaStart, DatabaseError> {
    match db.insert_sla(&record).await? {
        InsertOutcome::Inserted => {
            info!(
                claim_reference = %record.claim_reference,
                deadline = %record.deadline,
                hours = record.required_hours,
                urgency = record.urgency.as_str(),
                "SLA clock started"
            );
            Ok(SlaStart::Started(record))
        }
        InsertOutcome::Duplicate => {
            debug!(claim_reference = %record.claim_reference, "SLA clock already running");
            Ok(SlaStart::AlreadyTracked)
        }
    }
}

/// Move every overdue in-progress clock to `breached`. Returns the number
/// of clocks moved.
pub async fn sweep_breaches(
    db: &dyn Database,
    audit: &dyn AuditSink,
    now: DateTime<Utc>,
) -> Result<usize, DatabaseError> {
    let overdue = db.list_overdue_sla(now).await?;
    let mut breached = 0;
    for record in overdue {
        if !db.update_sla_status(record.id, SlaStatus::Breached).await? {
            continue;
        }
        breached += 1;
        warn!(
            claim_reference = %record.claim_reference,
            deadline = %record.deadline,
            "SLA breached"
        );
        let event = AuditEvent::new("sla_breached")
            .with_claim_reference(Some(&record.claim_reference))
            .with_detail(serde_json::json!({
                "sla_id": record.id,
                "sender": record.sender,
                "insurer_domain": record.insurer_domain,
                "deadline": record.deadline,
                "required_hours": record.required_hours,
            }));
        if let Err(e) = audit.append(event).await {
            warn!(error = %e, "Failed to audit SLA breach");
        }
    }
    Ok(breached)
}
