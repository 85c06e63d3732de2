//! Deterministic extraction and detection rules.
//!
//! Everything here is pure: no AI backend, no cache, no I/O. The
//! [`RuleClassifier`] is the last stage of the classification pipeline and
//! never fails; the standalone detectors feed the router directly.

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;

use crate::classify::{
    Analysis, ClassifyInput, Classifier, ComplaintAssessment, ComplaintSignal, Method,
};
use crate::error::ClassifierError;
use crate::model::{ComplaintType, Severity, Urgency};
use crate::pipeline::types::sender_domain;

// ── Keyword tables ──────────────────────────────────────────────────

// Bare "fca" and "manager" are left out: both turn up in ordinary
// signatures ("Claims Manager", "regulated by the FCA").
const HIGH_COMPLAINT: &[&str] = &[
    "ombudsman",
    "fos",
    "financial ombudsman",
    "solicitor",
    "legal action",
    "formal complaint",
    "complain to the fca",
    "report you to the fca",
    "trading standards",
];

const MEDIUM_COMPLAINT: &[&str] = &[
    "complaint",
    "complain",
    "unacceptable",
    "disgusted",
    "appalling",
    "disappointed",
    "escalate",
    "speak to a manager",
    "your manager",
    "furious",
];

const LOW_COMPLAINT: &[&str] = &[
    "unhappy",
    "frustrated",
    "delay",
    "chasing",
    "still waiting",
    "no response",
    "not happy",
    "poor service",
];

const REGULATORY: &[&str] = &[
    "fca",
    "financial conduct authority",
    "consumer duty",
    "ombudsman",
    "fos",
    "gdpr",
    "subject access request",
    "data protection",
    "vulnerable customer",
    "vulnerability",
];

const URGENCY: &[&str] = &[
    "urgent",
    "asap",
    "immediately",
    "priority",
    "emergency",
    "time sensitive",
];

const REPAIRER_PHRASES: &[&str] = &[
    "repair estimate",
    "estimate attached",
    "supplementary estimate",
    "damage photos",
    "invoice attached",
    "bodyshop",
    "body shop",
    "accident repair centre",
    "authority to repair",
    "parts prices",
    "labour hours",
];

const REPAIRER_DOMAIN_TOKENS: &[&str] = &[
    "repair",
    "bodyshop",
    "bodywork",
    "coachworks",
    "garage",
    "panel",
];

const ATTACHMENT_LANGUAGE: &[&str] = &["attached", "attachment", "please find", "enclosed", "photos"];

const CUSTOMER_FOLLOW_UP_SUBJECTS: &[&str] = &[
    "any update",
    "update on my",
    "my claim",
    "my car",
    "my vehicle",
    "chasing",
    "when will",
    "status of",
];

const AUTO_REPLY_PHRASES: &[&str] = &[
    "out of office",
    "automatic reply",
    "autoreply",
    "auto-reply",
    "delivery status notification",
    "undeliverable",
    "mail delivery failed",
    "returned mail",
    "annual leave",
    "this is an automated response",
];

/// Lines that open a signature or a legal footer. Matching stops there.
const SIGN_OFF_LINES: &[&str] = &[
    "kind regards",
    "best regards",
    "warm regards",
    "regards",
    "many thanks",
    "thanks",
    "thank you",
    "yours sincerely",
    "yours faithfully",
    "sent from my",
];

/// Footer phrases that may sit on any line, e.g. regulator disclosures.
const FOOTER_MARKERS: &[&str] = &[
    "authorised and regulated by",
    "authorized and regulated by",
    "registered in england",
    "registered office",
    "this email and any attachments",
    "this e-mail and any attachments",
    "disclaimer:",
];

const PLACEHOLDER_REFERENCES: &[&str] = &["UNKNOWN", "N/A", "NA", "TBC", "TBA", "NONE", "PENDING"];

/// Labels dropped from the right of a domain before guessing the insurer.
const PUBLIC_SUFFIX_LABELS: &[&str] = &[
    "com", "co", "uk", "org", "net", "ie", "io", "gov", "ac", "ltd", "plc", "eu", "biz", "info",
];

/// Leading labels that name a mail host rather than the company.
const HOST_LABELS: &[&str] = &["mail", "email", "smtp", "claims", "notifications", "www"];

// ── Compiled patterns ───────────────────────────────────────────────

struct Keywords(Vec<(&'static str, Regex)>);

impl Keywords {
    fn new(words: &[&'static str]) -> Self {
        Self(
            words
                .iter()
                .map(|w| {
                    let pattern = format!(r"(?i)\b{}\b", regex::escape(w).replace(' ', r"\s+"));
                    (*w, Regex::new(&pattern).expect("keyword pattern is valid"))
                })
                .collect(),
        )
    }

    /// Keywords present in `text`, in table order.
    fn found(&self, text: &str) -> Vec<&'static str> {
        self.0
            .iter()
            .filter(|(_, re)| re.is_match(text))
            .map(|(w, _)| *w)
            .collect()
    }

    fn any(&self, text: &str) -> bool {
        self.0.iter().any(|(_, re)| re.is_match(text))
    }
}

struct Patterns {
    claim_refs: Vec<Regex>,
    uk_plate: Regex,
    vin: Regex,
    follow_up_prefix: Regex,
    follow_up_words: Keywords,
    auto_reply_sender: Regex,
    high: Keywords,
    medium: Keywords,
    low: Keywords,
    regulatory: Keywords,
    urgency: Keywords,
    repairer: Keywords,
    attachment: Keywords,
    customer_subject: Keywords,
    auto_reply: Keywords,
}

static PATTERNS: LazyLock<Patterns> = LazyLock::new(|| Patterns {
    claim_refs: vec![
        Regex::new(
            r"(?i)\bclaim(?:\s*(?:ref(?:erence)?|number|num|no)\b\.?|\s*#)*\s*[:#\-]?\s*([A-Z0-9][A-Z0-9/\-]{3,}[A-Z0-9])\b",
        )
        .expect("claim pattern is valid"),
        Regex::new(
            r"(?i)\b(?:our|your|insurer)\s+ref(?:erence)?\b\.?\s*[:#\-]?\s*([A-Z0-9][A-Z0-9/\-]{3,}[A-Z0-9])\b",
        )
        .expect("reference pattern is valid"),
    ],
    uk_plate: Regex::new(r"(?i)\b([A-Z]{2}[0-9]{2}\s?[A-Z]{3})\b").expect("plate pattern is valid"),
    vin: Regex::new(r"\b([A-HJ-NPR-Z0-9]{17})\b").expect("vin pattern is valid"),
    follow_up_prefix: Regex::new(r"(?i)^\s*(re|fw|fwd)\s*:").expect("prefix pattern is valid"),
    follow_up_words: Keywords::new(&[
        "supplementary",
        "update",
        "status",
        "chasing",
        "further information",
        "additional information",
        "follow up",
        "follow-up",
    ]),
    auto_reply_sender: Regex::new(r"(?i)^(mailer[\-_]?daemon|postmaster)@")
        .expect("auto-reply sender pattern is valid"),
    high: Keywords::new(HIGH_COMPLAINT),
    medium: Keywords::new(MEDIUM_COMPLAINT),
    low: Keywords::new(LOW_COMPLAINT),
    regulatory: Keywords::new(REGULATORY),
    urgency: Keywords::new(URGENCY),
    repairer: Keywords::new(REPAIRER_PHRASES),
    attachment: Keywords::new(ATTACHMENT_LANGUAGE),
    customer_subject: Keywords::new(CUSTOMER_FOLLOW_UP_SUBJECTS),
    auto_reply: Keywords::new(AUTO_REPLY_PHRASES),
});

// ── Extraction ──────────────────────────────────────────────────────

/// Accept a candidate claim reference, or reject placeholders and tokens
/// without a digit.
pub fn normalize_claim_reference(candidate: &str) -> Option<String> {
    let cleaned = candidate
        .trim()
        .trim_matches(|c: char| c == '-' || c == '/' || c == '.' || c == ':')
        .to_uppercase();
    if cleaned.len() < 4 || PLACEHOLDER_REFERENCES.contains(&cleaned.as_str()) {
        return None;
    }
    if !cleaned.chars().any(|c| c.is_ascii_digit()) {
        return None;
    }
    if !cleaned
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '/')
    {
        return None;
    }
    Some(cleaned)
}

/// Accept a candidate vehicle id if it is a UK plate or a VIN.
/// Returned uppercase without spaces.
pub fn normalize_vehicle_id(candidate: &str) -> Option<String> {
    let compact: String = candidate
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_uppercase();
    let p = &*PATTERNS;
    let plate_ok = compact.len() == 7 && p.uk_plate.is_match(&compact);
    let vin_ok = compact.len() == 17
        && p.vin.is_match(&compact)
        && compact.chars().any(|c| c.is_ascii_digit())
        && compact.chars().any(|c| c.is_ascii_alphabetic());
    (plate_ok || vin_ok).then_some(compact)
}

/// First valid claim reference in the subject, then the body.
pub fn extract_claim_reference(subject: &str, content: &str) -> Option<String> {
    for text in [subject, content] {
        for re in &PATTERNS.claim_refs {
            for caps in re.captures_iter(text) {
                if let Some(r) = caps.get(1).and_then(|m| normalize_claim_reference(m.as_str())) {
                    return Some(r);
                }
            }
        }
    }
    None
}

/// First UK registration or VIN in the subject, then the body.
pub fn extract_vehicle_id(subject: &str, content: &str) -> Option<String> {
    let p = &*PATTERNS;
    for text in [subject, content] {
        for caps in p.uk_plate.captures_iter(text) {
            if let Some(v) = caps.get(1).and_then(|m| normalize_vehicle_id(m.as_str())) {
                return Some(v);
            }
        }
        for caps in p.vin.captures_iter(text) {
            if let Some(v) = caps.get(1).and_then(|m| normalize_vehicle_id(m.as_str())) {
                return Some(v);
            }
        }
    }
    None
}

pub fn detect_urgency(subject: &str, content: &str) -> Urgency {
    if PATTERNS.urgency.any(subject) || PATTERNS.urgency.any(content) {
        Urgency::Urgent
    } else {
        Urgency::Normal
    }
}

/// Company name guessed from the sender's domain, e.g. `claims.aviva.co.uk` → `Aviva`.
pub fn guess_insurer_name(sender: &str) -> Option<String> {
    let domain = sender_domain(sender)?;
    let mut labels: Vec<&str> = domain.split('.').filter(|l| !l.is_empty()).collect();
    while labels.len() > 1
        && labels
            .last()
            .is_some_and(|l| PUBLIC_SUFFIX_LABELS.contains(l))
    {
        labels.pop();
    }
    let label = labels
        .iter()
        .rev()
        .find(|l| !HOST_LABELS.contains(l) && !PUBLIC_SUFFIX_LABELS.contains(l))?;
    let mut chars = label.chars();
    let first = chars.next()?;
    Some(first.to_uppercase().chain(chars).collect())
}

/// Body text above the signature and legal footer.
///
/// Cuts at the first `--` delimiter, a bare sign-off line ("Kind regards,")
/// or a footer phrase. Quoted lines (`>`) are dropped as well.
pub fn strip_signature(content: &str) -> String {
    let mut kept = Vec::new();
    for line in content.lines() {
        let trimmed = line.trim();
        let lower = trimmed.to_lowercase();
        if trimmed == "--" || trimmed.starts_with("__") {
            break;
        }
        let bare = lower.trim_end_matches([',', '.', '!']);
        if SIGN_OFF_LINES
            .iter()
            .any(|s| bare == *s || (s.starts_with("sent from") && bare.starts_with(s)))
        {
            break;
        }
        if FOOTER_MARKERS.iter().any(|m| lower.contains(m)) {
            break;
        }
        if trimmed.starts_with('>') {
            continue;
        }
        kept.push(line);
    }
    kept.join("\n")
}

// ── Detectors ───────────────────────────────────────────────────────

/// A regulatory keyword hit. Annotates the audit trail; never routes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegulatoryMention {
    pub keywords: Vec<&'static str>,
}

pub fn detect_regulatory_mention(subject: &str, content: &str) -> Option<RegulatoryMention> {
    let text = format!("{subject}\n{content}");
    let keywords = PATTERNS.regulatory.found(&text);
    (!keywords.is_empty()).then_some(RegulatoryMention { keywords })
}

/// A repairer sending estimates or photos, as opposed to a customer chasing.
pub fn detect_repairer_submission(
    sender: &str,
    subject: &str,
    content: &str,
    has_attachments: bool,
) -> bool {
    let p = &*PATTERNS;
    if p.customer_subject.any(subject) {
        return false;
    }
    let text = format!("{subject}\n{content}");
    let domain_signal = sender_domain(sender).is_some_and(|d| {
        REPAIRER_DOMAIN_TOKENS
            .iter()
            .any(|token| d.contains(token))
    });
    let signal = domain_signal || p.repairer.any(&text);
    signal && (has_attachments || p.attachment.any(&text))
}

/// Out-of-office replies and delivery failures. `noreply` senders are not
/// auto-replies by themselves; insurers send real instructions from them.
pub fn is_auto_reply(sender: &str, subject: &str, content: &str) -> bool {
    let p = &*PATTERNS;
    if p.auto_reply_sender.is_match(sender.trim()) {
        return true;
    }
    if p.auto_reply.any(subject) {
        return true;
    }
    // Only the opening of the body; a quoted bounce further down a human
    // reply does not make the reply automatic.
    let opening: String = content.chars().take(300).collect();
    p.auto_reply.any(&opening)
}

pub fn has_follow_up_marker(subject: &str) -> bool {
    let p = &*PATTERNS;
    p.follow_up_prefix.is_match(subject) || p.follow_up_words.any(subject)
}

/// Complaint assessment from weighted keyword tiers. Only the body above
/// the signature counts.
pub fn assess_complaint_keywords(subject: &str, content: &str) -> Option<ComplaintSignal> {
    let p = &*PATTERNS;
    let text = format!("{subject}\n{}", strip_signature(content));
    let high = p.high.found(&text);
    let medium = p.medium.found(&text);
    let low = p.low.found(&text);

    let severity = if !high.is_empty() {
        Severity::High
    } else if medium.len() >= 2 {
        Severity::Medium
    } else if low.len() >= 2 || medium.len() == 1 {
        Severity::Low
    } else {
        return None;
    };

    let keywords: Vec<String> = high
        .iter()
        .chain(medium.iter())
        .chain(low.iter())
        .map(|k| k.to_string())
        .collect();

    Some(ComplaintSignal {
        complaint_type: infer_complaint_type(&text, !high.is_empty()),
        severity,
        keywords,
    })
}

fn infer_complaint_type(text: &str, escalated: bool) -> ComplaintType {
    if escalated {
        return ComplaintType::Escalation;
    }
    let lower = text.to_lowercase();
    let has = |words: &[&str]| words.iter().any(|w| lower.contains(w));
    if has(&["valuation", "undervalued", "offer is too low", "market value", "write-off value"]) {
        ComplaintType::Valuation
    } else if has(&["no response", "not returned", "ignored", "nobody has called", "no reply"]) {
        ComplaintType::Communication
    } else if has(&["delay", "still waiting", "chasing", "weeks", "taking so long"]) {
        ComplaintType::Delay
    } else if has(&["poor service", "unacceptable", "appalling", "rude", "unprofessional"]) {
        ComplaintType::ServiceQuality
    } else {
        ComplaintType::General
    }
}

// ── Classifier stage ────────────────────────────────────────────────

/// Confidence reported for rule results. Fixed so rule output is never
/// mistaken for an AI result above the caching threshold.
const RULE_CONFIDENCE_WITH_REFERENCE: f32 = 0.6;
const RULE_CONFIDENCE: f32 = 0.4;

/// Last-resort classifier. Never returns an error.
#[derive(Debug, Default, Clone, Copy)]
pub struct RuleClassifier;

impl RuleClassifier {
    pub fn analyze_sync(&self, input: &ClassifyInput<'_>) -> Analysis {
        let claim_reference = extract_claim_reference(input.subject, input.content);
        let vehicle_id = extract_vehicle_id(input.subject, input.content);
        let urgency = detect_urgency(input.subject, input.content);
        let confidence = if claim_reference.is_some() {
            RULE_CONFIDENCE_WITH_REFERENCE
        } else {
            RULE_CONFIDENCE
        };
        Analysis {
            requires_attention: urgency == Urgency::Urgent,
            claim_reference,
            vehicle_id,
            insurer_name_guess: guess_insurer_name(input.sender),
            urgency,
            confidence,
            method: Method::Fallback,
        }
    }

    pub fn assess_complaint_sync(&self, input: &ClassifyInput<'_>) -> ComplaintAssessment {
        ComplaintAssessment {
            signal: assess_complaint_keywords(input.subject, input.content),
            confidence: RULE_CONFIDENCE,
            method: Method::Fallback,
        }
    }
}

#[async_trait]
impl Classifier for RuleClassifier {
    fn name(&self) -> &'static str {
        "rules"
    }

    async fn analyze(&self, input: &ClassifyInput<'_>) -> Result<Analysis, ClassifierError> {
        Ok(self.analyze_sync(input))
    }

    async fn assess_complaint(
        &self,
        input: &ClassifyInput<'_>,
    ) -> Result<ComplaintAssessment, ClassifierError> {
        Ok(self.assess_complaint_sync(input))
    }
}
