//! Follow-up reply drafts for human review. Nothing here sends mail.

use std::sync::LazyLock;

use chrono::Utc;
use regex::Regex;
use uuid::Uuid;

use crate::classify::rules::assess_complaint_keywords;
use crate::model::{FollowUpDraft, FollowUpIntent};

/// Prefix on every drafted subject.
pub const DRAFT_MARKER: &str = "[DRAFT - REVIEW REQUIRED]";

static STATUS_INQUIRY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(status|progress|any news|any update|update on|when will|how long|chasing|eta)\b",
    )
    .expect("status pattern is valid")
});

static ADDITIONAL_INFORMATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(attached|please find|enclosed|additional|supplementary|further (information|details)|photos?|images?|invoice|estimate)\b",
    )
    .expect("additional information pattern is valid")
});

static REPLY_PREFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*((re|fw|fwd|aw)\s*:\s*)+").expect("reply prefix pattern is valid")
});

/// Intent of a follow-up message. Complaint tone wins over everything else,
/// then a status question, then supplied information.
pub fn classify_intent(subject: &str, content: &str) -> FollowUpIntent {
    if assess_complaint_keywords(subject, content).is_some() {
        return FollowUpIntent::ComplaintToned;
    }
    let text = format!("{subject}\n{content}");
    if STATUS_INQUIRY.is_match(&text) {
        FollowUpIntent::StatusInquiry
    } else if ADDITIONAL_INFORMATION.is_match(&text) {
        FollowUpIntent::AdditionalInformation
    } else {
        FollowUpIntent::Generic
    }
}

/// Build an unsent draft reply.
pub fn generate_draft(
    claim_reference: &str,
    intent: FollowUpIntent,
    original_subject: &str,
) -> FollowUpDraft {
    let base = REPLY_PREFIX.replace(original_subject, "");
    let base = base.trim();
    let subject = if base.is_empty() {
        format!("{DRAFT_MARKER} Re: {claim_reference}")
    } else {
        format!("{DRAFT_MARKER} Re: {base}")
    };

    let middle = match intent {
        FollowUpIntent::StatusInquiry => format!(
            "Thank you for your enquiry about claim {claim_reference}. \
             The file is with our team and we will update you as soon as the next step is complete."
        ),
        FollowUpIntent::AdditionalInformation => format!(
            "Thank you for the additional information for claim {claim_reference}. \
             It has been added to the file and will be reviewed by the assessor."
        ),
        FollowUpIntent::ComplaintToned => format!(
            "We are sorry for the experience you have described regarding claim {claim_reference}. \
             A senior member of the team is reviewing the file and will contact you directly."
        ),
        FollowUpIntent::Generic => format!(
            "Thank you for your message regarding claim {claim_reference}. \
             We will respond shortly."
        ),
    };

    FollowUpDraft {
        id: Uuid::new_v4(),
        claim_reference: claim_reference.to_string(),
        intent,
        subject,
        body: format!("Dear Sir or Madam,\n\n{middle}\n\nKind regards,\nClaims Team"),
        used: false,
        created_at: Utc::now(),
    }
}
