//! Persisted domain records produced by the router.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Prefix for claim references synthesized from a vehicle identifier.
pub const SYNTHETIC_CLAIM_PREFIX: &str = "AUTO-";

/// Build the synthetic claim reference used when only a vehicle id is known.
pub fn synthesize_claim_reference(vehicle_id: &str) -> String {
    format!("{SYNTHETIC_CLAIM_PREFIX}{}", vehicle_id.to_uppercase())
}

/// True if the reference was generated by us rather than quoted by a sender.
pub fn is_synthetic_claim_reference(reference: &str) -> bool {
    reference.starts_with(SYNTHETIC_CLAIM_PREFIX)
}

// ── Ledger ──────────────────────────────────────────────────────────

/// One row of the append-only dedup ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedMessageRecord {
    pub message_id: String,
    pub message_id_hash: Option<String>,
    pub thread_id: Option<String>,
    pub sender: String,
    pub subject: String,
    pub claim_reference: Option<String>,
    pub is_complaint: bool,
    pub is_follow_up: bool,
    pub processed_at: DateTime<Utc>,
}

/// Outcome of an insert guarded by a unique constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// Another writer got there first. Treated as already handled.
    Duplicate,
}

// ── Complaints ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplaintType {
    Delay,
    Communication,
    ServiceQuality,
    Valuation,
    Escalation,
    General,
}

impl ComplaintType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Delay => "delay",
            Self::Communication => "communication",
            Self::ServiceQuality => "service_quality",
            Self::Valuation => "valuation",
            Self::Escalation => "escalation",
            Self::General => "general",
        }
    }
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

impl FromStr for ComplaintType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "delay" => Ok(Self::Delay),
            "communication" => Ok(Self::Communication),
            "service_quality" | "service" | "quality" => Ok(Self::ServiceQuality),
            "valuation" => Ok(Self::Valuation),
            "escalation" => Ok(Self::Escalation),
            "general" => Ok(Self::General),
            other => Err(format!("unknown complaint type: '{other}'")),
        }
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            other => Err(format!("unknown severity: '{other}'")),
        }
    }
}

/// A detected complaint. Immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComplaintRecord {
    pub id: Uuid,
    pub claim_reference: Option<String>,
    pub vehicle_id: Option<String>,
    pub sender: String,
    pub subject: String,
    pub complaint_type: ComplaintType,
    pub severity: Severity,
    pub detection: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

// ── SLA tracking ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlaStatus {
    InProgress,
    Met,
    Breached,
    Cancelled,
}

impl SlaStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Met => "met",
            Self::Breached => "breached",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for SlaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SlaStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in_progress" => Ok(Self::InProgress),
            "met" => Ok(Self::Met),
            "breached" => Ok(Self::Breached),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown SLA status: '{other}'")),
        }
    }
}

/// Urgency tier assigned by classification.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    Urgent,
    #[default]
    Normal,
}

impl Urgency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Urgent => "urgent",
            Self::Normal => "normal",
        }
    }
}

/// An SLA clock for one claim reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlaTrackingRecord {
    pub id: Uuid,
    pub claim_reference: String,
    pub sender: String,
    pub insurer_domain: String,
    pub urgency: Urgency,
    pub started_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub required_hours: u32,
    pub business_hours_only: bool,
    pub commitment: String,
    pub status: SlaStatus,
}

// ── Follow-up drafts ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FollowUpIntent {
    StatusInquiry,
    AdditionalInformation,
    ComplaintToned,
    Generic,
}

impl FollowUpIntent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StatusInquiry => "status_inquiry",
            Self::AdditionalInformation => "additional_information",
            Self::ComplaintToned => "complaint_toned",
            Self::Generic => "generic",
        }
    }
}

impl FromStr for FollowUpIntent {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "status_inquiry" => Ok(Self::StatusInquiry),
            "additional_information" => Ok(Self::AdditionalInformation),
            "complaint_toned" => Ok(Self::ComplaintToned),
            "generic" => Ok(Self::Generic),
            other => Err(format!("unknown follow-up intent: '{other}'")),
        }
    }
}

/// A reply drafted for human review. Never sent by the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FollowUpDraft {
    pub id: Uuid,
    pub claim_reference: String,
    pub intent: FollowUpIntent,
    pub subject: String,
    pub body: String,
    pub used: bool,
    pub created_at: DateTime<Utc>,
}
