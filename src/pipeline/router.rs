//! Priority router: an ordered table of pure decision rules.
//!
//! Every message walks [`RULES`] top to bottom. The first rule that returns a
//! terminal verdict decides the message; only the regulatory rule may
//! annotate and let evaluation continue. Rules read from [`Facts`], which the
//! processor fills in stages so that cheap checks (self-loop, ledger) run
//! before anything reaches the classifier. When a rule needs a stage that has
//! not been gathered yet, [`route`] reports which one and the processor calls
//! it again after gathering.

use serde_json::json;

use crate::classify::rules::RegulatoryMention;
use crate::classify::{Analysis, ComplaintAssessment, ComplaintSignal};
use crate::model::{FollowUpIntent, synthesize_claim_reference};
use crate::pipeline::ledger::DuplicateKey;
use crate::templates;

// ── Facts ───────────────────────────────────────────────────────────

/// Facts available without any lookup: the envelope and the snapshot.
#[derive(Debug, Clone)]
pub struct EnvelopeFacts {
    pub from_monitored_mailbox: bool,
    pub sender_authorized: bool,
    pub insurer_enabled: bool,
    pub auto_reply_enabled: bool,
}

#[derive(Debug, Clone)]
pub struct LedgerFacts {
    pub duplicate: Option<DuplicateKey>,
}

/// Pure keyword detectors over the message text. No AI.
#[derive(Debug, Clone)]
pub struct SignalFacts {
    pub auto_reply: bool,
    pub regulatory: Option<RegulatoryMention>,
    pub repairer_submission: bool,
    pub follow_up_marker: bool,
}

/// Classifier output plus the lookups that depend on it.
#[derive(Debug, Clone)]
pub struct ClassificationFacts {
    pub analysis: Analysis,
    pub complaint: ComplaintAssessment,
    /// The quoted reference is already in the ledger.
    pub claim_known: bool,
    /// An SLA clock is running for the resolved reference.
    pub claim_tracked: bool,
    pub follow_up_intent: FollowUpIntent,
}

impl ClassificationFacts {
    /// Quoted reference, else one synthesized from the vehicle id.
    pub fn resolved_claim_reference(&self) -> Option<String> {
        resolve_claim_reference(&self.analysis)
    }
}

pub fn resolve_claim_reference(analysis: &Analysis) -> Option<String> {
    analysis
        .claim_reference
        .clone()
        .or_else(|| analysis.vehicle_id.as_deref().map(synthesize_claim_reference))
}

#[derive(Debug, Clone)]
pub struct Facts {
    pub envelope: EnvelopeFacts,
    pub ledger: Option<LedgerFacts>,
    pub signals: Option<SignalFacts>,
    pub classification: Option<ClassificationFacts>,
}

impl Facts {
    pub fn new(envelope: EnvelopeFacts) -> Self {
        Self {
            envelope,
            ledger: None,
            signals: None,
            classification: None,
        }
    }
}

/// A group of facts the processor gathers on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Ledger,
    Signals,
    Classification,
}

// ── Verdicts ────────────────────────────────────────────────────────

/// Where an outbound message goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recipient {
    Sender,
    Escalation,
}

/// Work performed after the ledger row is claimed.
#[derive(Debug, Clone, PartialEq)]
pub enum SideEffect {
    RecordComplaint(ComplaintSignal),
    Send {
        template: &'static str,
        to: Recipient,
    },
    /// Open an SLA clock and, if it opened, send the new-job acknowledgment.
    StartSlaAndAcknowledge { claim_reference: String },
    StoreDraft {
        claim_reference: String,
        intent: FollowUpIntent,
    },
}

/// Why a message was recorded without further action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    SelfLoop,
    AutoReply,
    MissingReference,
    Unauthorized,
    InsurerDisabled,
    AlreadyTracked,
    AutoReplyDisabled,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SelfLoop => "self_loop",
            Self::AutoReply => "auto_reply",
            Self::MissingReference => "missing_reference",
            Self::Unauthorized => "unauthorized_sender",
            Self::InsurerDisabled => "insurer_disabled",
            Self::AlreadyTracked => "already_tracked",
            Self::AutoReplyDisabled => "auto_reply_disabled",
        }
    }
}

/// Non-terminal note attached to the decision.
#[derive(Debug, Clone, PartialEq)]
pub enum Annotation {
    Regulatory { keywords: Vec<String> },
}

impl Annotation {
    pub fn branch(&self) -> &'static str {
        match self {
            Self::Regulatory { .. } => "regulatory_mention",
        }
    }

    pub fn detail(&self) -> serde_json::Value {
        match self {
            Self::Regulatory { keywords } => json!({ "keywords": keywords }),
        }
    }
}

/// What a single rule says about a message.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Continue,
    Annotate(Annotation),
    /// Terminal, and no ledger row is written.
    Stop,
    StopWithLedger(StopReason),
    Act(Vec<SideEffect>),
}

/// A terminal verdict.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Stop,
    StopWithLedger(StopReason),
    Act(Vec<SideEffect>),
}

/// The router's answer for one message.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    /// Name of the deciding rule; also the audit branch.
    pub branch: &'static str,
    pub outcome: Outcome,
    pub annotations: Vec<Annotation>,
}

impl Decision {
    pub fn is_complaint(&self) -> bool {
        self.branch == "complaint"
    }

    pub fn is_follow_up(&self) -> bool {
        self.branch == "follow_up"
    }

    pub fn writes_ledger(&self) -> bool {
        !matches!(self.outcome, Outcome::Stop)
    }
}

// ── Rule table ──────────────────────────────────────────────────────

pub struct Rule {
    pub name: &'static str,
    /// Facts the rule reads beyond the envelope.
    pub needs: Option<Stage>,
    pub decide: fn(&Facts) -> Verdict,
}

/// Evaluation order. Exactly one terminal rule fires per message; `new_job`
/// is the catch-all and never continues.
pub static RULES: &[Rule] = &[
    Rule {
        name: "self_loop",
        needs: None,
        decide: self_loop,
    },
    Rule {
        name: "already_processed",
        needs: Some(Stage::Ledger),
        decide: already_processed,
    },
    Rule {
        name: "auto_reply",
        needs: Some(Stage::Signals),
        decide: auto_reply,
    },
    Rule {
        name: "complaint",
        needs: Some(Stage::Classification),
        decide: complaint,
    },
    Rule {
        name: "regulatory_mention",
        needs: Some(Stage::Signals),
        decide: regulatory_mention,
    },
    Rule {
        name: "repairer_submission",
        needs: Some(Stage::Classification),
        decide: repairer_submission,
    },
    Rule {
        name: "follow_up",
        needs: Some(Stage::Classification),
        decide: follow_up,
    },
    Rule {
        name: "new_job",
        needs: Some(Stage::Classification),
        decide: new_job,
    },
];

fn has_stage(facts: &Facts, stage: Stage) -> bool {
    match stage {
        Stage::Ledger => facts.ledger.is_some(),
        Stage::Signals => facts.signals.is_some(),
        Stage::Classification => facts.classification.is_some(),
    }
}

/// Walk the rule table. Returns `Err(stage)` when the next rule needs facts
/// that have not been gathered yet.
pub fn route(facts: &Facts) -> Result<Decision, Stage> {
    let mut annotations = Vec::new();
    for rule in RULES {
        if let Some(stage) = rule.needs
            && !has_stage(facts, stage)
        {
            return Err(stage);
        }
        let outcome = match (rule.decide)(facts) {
            Verdict::Continue => continue,
            Verdict::Annotate(annotation) => {
                annotations.push(annotation);
                continue;
            }
            Verdict::Stop => Outcome::Stop,
            Verdict::StopWithLedger(reason) => Outcome::StopWithLedger(reason),
            Verdict::Act(effects) => Outcome::Act(effects),
        };
        return Ok(Decision {
            branch: rule.name,
            outcome,
            annotations,
        });
    }
    // `new_job` always decides; reaching here means the table lost its catch-all.
    Ok(Decision {
        branch: "unrouted",
        outcome: Outcome::StopWithLedger(StopReason::MissingReference),
        annotations,
    })
}

// ── Rules ───────────────────────────────────────────────────────────

fn self_loop(facts: &Facts) -> Verdict {
    if facts.envelope.from_monitored_mailbox {
        Verdict::StopWithLedger(StopReason::SelfLoop)
    } else {
        Verdict::Continue
    }
}

fn already_processed(facts: &Facts) -> Verdict {
    match &facts.ledger {
        Some(LedgerFacts {
            duplicate: Some(_),
        }) => Verdict::Stop,
        _ => Verdict::Continue,
    }
}

fn auto_reply(facts: &Facts) -> Verdict {
    match &facts.signals {
        Some(signals) if signals.auto_reply => Verdict::StopWithLedger(StopReason::AutoReply),
        _ => Verdict::Continue,
    }
}

fn complaint(facts: &Facts) -> Verdict {
    let Some(c) = &facts.classification else {
        return Verdict::Continue;
    };
    let Some(signal) = &c.complaint.signal else {
        return Verdict::Continue;
    };

    let mut effects = vec![SideEffect::RecordComplaint(signal.clone())];
    if c.resolved_claim_reference().is_some() {
        effects.push(SideEffect::Send {
            template: templates::COMPLAINT_ACKNOWLEDGMENT,
            to: Recipient::Sender,
        });
    }
    effects.push(SideEffect::Send {
        template: templates::COMPLAINT_ALERT,
        to: Recipient::Escalation,
    });
    Verdict::Act(effects)
}

fn regulatory_mention(facts: &Facts) -> Verdict {
    match facts.signals.as_ref().and_then(|s| s.regulatory.as_ref()) {
        Some(mention) => Verdict::Annotate(Annotation::Regulatory {
            keywords: mention.keywords.iter().map(|k| k.to_string()).collect(),
        }),
        None => Verdict::Continue,
    }
}

fn repairer_submission(facts: &Facts) -> Verdict {
    let (Some(signals), Some(c)) = (&facts.signals, &facts.classification) else {
        return Verdict::Continue;
    };
    if !signals.repairer_submission {
        return Verdict::Continue;
    }
    if c.resolved_claim_reference().is_none() {
        return Verdict::StopWithLedger(StopReason::MissingReference);
    }
    Verdict::Act(vec![SideEffect::Send {
        template: templates::REPAIRER_ACKNOWLEDGMENT,
        to: Recipient::Sender,
    }])
}

fn follow_up(facts: &Facts) -> Verdict {
    let (Some(signals), Some(c)) = (&facts.signals, &facts.classification) else {
        return Verdict::Continue;
    };
    if !signals.follow_up_marker && !c.claim_known {
        return Verdict::Continue;
    }
    match c.resolved_claim_reference() {
        Some(claim_reference) => Verdict::Act(vec![SideEffect::StoreDraft {
            claim_reference,
            intent: c.follow_up_intent,
        }]),
        None => Verdict::StopWithLedger(StopReason::MissingReference),
    }
}

fn new_job(facts: &Facts) -> Verdict {
    let Some(c) = &facts.classification else {
        return Verdict::Continue;
    };
    let envelope = &facts.envelope;
    if !envelope.sender_authorized {
        return Verdict::StopWithLedger(StopReason::Unauthorized);
    }
    if !envelope.insurer_enabled {
        return Verdict::StopWithLedger(StopReason::InsurerDisabled);
    }
    let Some(claim_reference) = c.resolved_claim_reference() else {
        return Verdict::StopWithLedger(StopReason::MissingReference);
    };
    if c.claim_tracked {
        return Verdict::StopWithLedger(StopReason::AlreadyTracked);
    }
    if !envelope.auto_reply_enabled {
        return Verdict::StopWithLedger(StopReason::AutoReplyDisabled);
    }
    Verdict::Act(vec![SideEffect::StartSlaAndAcknowledge { claim_reference }])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::Method;
    use crate::model::{ComplaintType, Severity, Urgency};

    fn envelope() -> EnvelopeFacts {
        EnvelopeFacts {
            from_monitored_mailbox: false,
            sender_authorized: true,
            insurer_enabled: true,
            auto_reply_enabled: true,
        }
    }

    fn signals() -> SignalFacts {
        SignalFacts {
            auto_reply: false,
            regulatory: None,
            repairer_submission: false,
            follow_up_marker: false,
        }
    }

    fn analysis(claim: Option<&str>, vehicle: Option<&str>) -> Analysis {
        Analysis {
            claim_reference: claim.map(String::from),
            vehicle_id: vehicle.map(String::from),
            insurer_name_guess: None,
            urgency: Urgency::Normal,
            requires_attention: false,
            confidence: 0.9,
            method: Method::Ai,
        }
    }

    fn classification(claim: Option<&str>, vehicle: Option<&str>) -> ClassificationFacts {
        ClassificationFacts {
            analysis: analysis(claim, vehicle),
            complaint: ComplaintAssessment {
                signal: None,
                confidence: 0.9,
                method: Method::Ai,
            },
            claim_known: false,
            claim_tracked: false,
            follow_up_intent: FollowUpIntent::Generic,
        }
    }

    fn complaint_signal() -> ComplaintSignal {
        ComplaintSignal {
            complaint_type: ComplaintType::Escalation,
            severity: Severity::High,
            keywords: vec!["ombudsman".into()],
        }
    }

    /// Facts with every stage gathered and nothing notable in them.
    fn full(claim: Option<&str>, vehicle: Option<&str>) -> Facts {
        Facts {
            envelope: envelope(),
            ledger: Some(LedgerFacts { duplicate: None }),
            signals: Some(signals()),
            classification: Some(classification(claim, vehicle)),
        }
    }

    fn decide(facts: &Facts) -> Decision {
        route(facts).expect("all stages gathered")
    }

    // ── Staging ─────────────────────────────────────────────────────

    #[test]
    fn self_loop_needs_no_lookups() {
        let facts = Facts::new(EnvelopeFacts {
            from_monitored_mailbox: true,
            ..envelope()
        });
        let d = route(&facts).unwrap();
        assert_eq!(d.branch, "self_loop");
        assert_eq!(d.outcome, Outcome::StopWithLedger(StopReason::SelfLoop));
    }

    #[test]
    fn stages_requested_in_order() {
        let mut facts = Facts::new(envelope());
        assert_eq!(route(&facts), Err(Stage::Ledger));
        facts.ledger = Some(LedgerFacts { duplicate: None });
        assert_eq!(route(&facts), Err(Stage::Signals));
        facts.signals = Some(signals());
        assert_eq!(route(&facts), Err(Stage::Classification));
    }

    #[test]
    fn duplicate_stops_before_classification() {
        let mut facts = Facts::new(envelope());
        facts.ledger = Some(LedgerFacts {
            duplicate: Some(DuplicateKey::Thread),
        });
        let d = route(&facts).unwrap();
        assert_eq!(d.branch, "already_processed");
        assert_eq!(d.outcome, Outcome::Stop);
        assert!(!d.writes_ledger());
    }

    #[test]
    fn auto_reply_stops_before_classification() {
        let mut facts = Facts::new(envelope());
        facts.ledger = Some(LedgerFacts { duplicate: None });
        facts.signals = Some(SignalFacts {
            auto_reply: true,
            ..signals()
        });
        let d = route(&facts).unwrap();
        assert_eq!(d.outcome, Outcome::StopWithLedger(StopReason::AutoReply));
    }

    // ── Priority ────────────────────────────────────────────────────

    #[test]
    fn complaint_beats_new_job_and_follow_up() {
        let mut facts = full(Some("CLM-10001"), None);
        facts.signals.as_mut().unwrap().follow_up_marker = true;
        facts.classification.as_mut().unwrap().complaint.signal = Some(complaint_signal());

        let d = decide(&facts);
        assert_eq!(d.branch, "complaint");
        assert!(d.is_complaint());
        let Outcome::Act(effects) = d.outcome else {
            panic!("complaint must act");
        };
        assert!(!effects
            .iter()
            .any(|e| matches!(e, SideEffect::StartSlaAndAcknowledge { .. })));
        assert_eq!(effects.len(), 3);
    }

    #[test]
    fn complaint_without_reference_only_alerts() {
        let mut facts = full(None, None);
        facts.classification.as_mut().unwrap().complaint.signal = Some(complaint_signal());

        let Outcome::Act(effects) = decide(&facts).outcome else {
            panic!("complaint must act");
        };
        assert_eq!(
            effects,
            vec![
                SideEffect::RecordComplaint(complaint_signal()),
                SideEffect::Send {
                    template: templates::COMPLAINT_ALERT,
                    to: Recipient::Escalation,
                },
            ]
        );
    }

    #[test]
    fn regulatory_annotates_and_continues() {
        let mut facts = full(Some("CLM-10001"), None);
        facts.signals.as_mut().unwrap().regulatory = Some(RegulatoryMention {
            keywords: vec!["consumer duty"],
        });
        let d = decide(&facts);
        assert_eq!(d.branch, "new_job");
        assert_eq!(
            d.annotations,
            vec![Annotation::Regulatory {
                keywords: vec!["consumer duty".into()]
            }]
        );
    }

    // ── Repairer ────────────────────────────────────────────────────

    #[test]
    fn repairer_without_reference_stops_silently() {
        let mut facts = full(None, None);
        facts.signals.as_mut().unwrap().repairer_submission = true;
        let d = decide(&facts);
        assert_eq!(d.branch, "repairer_submission");
        assert_eq!(d.outcome, Outcome::StopWithLedger(StopReason::MissingReference));
    }

    #[test]
    fn repairer_with_vehicle_is_acknowledged() {
        let mut facts = full(None, Some("AB12CDE"));
        facts.signals.as_mut().unwrap().repairer_submission = true;
        let d = decide(&facts);
        assert_eq!(
            d.outcome,
            Outcome::Act(vec![SideEffect::Send {
                template: templates::REPAIRER_ACKNOWLEDGMENT,
                to: Recipient::Sender,
            }])
        );
    }

    // ── Follow-up ───────────────────────────────────────────────────

    #[test]
    fn known_reference_is_follow_up() {
        let mut facts = full(Some("CLM-10001"), None);
        let c = facts.classification.as_mut().unwrap();
        c.claim_known = true;
        c.follow_up_intent = FollowUpIntent::StatusInquiry;

        let d = decide(&facts);
        assert!(d.is_follow_up());
        assert_eq!(
            d.outcome,
            Outcome::Act(vec![SideEffect::StoreDraft {
                claim_reference: "CLM-10001".into(),
                intent: FollowUpIntent::StatusInquiry,
            }])
        );
    }

    #[test]
    fn follow_up_marker_without_reference_records_only() {
        let mut facts = full(None, None);
        facts.signals.as_mut().unwrap().follow_up_marker = true;
        let d = decide(&facts);
        assert_eq!(d.branch, "follow_up");
        assert_eq!(d.outcome, Outcome::StopWithLedger(StopReason::MissingReference));
    }

    // ── New job gates ───────────────────────────────────────────────

    #[test]
    fn new_job_starts_sla() {
        let d = decide(&full(None, Some("AB12CDE")));
        assert_eq!(
            d.outcome,
            Outcome::Act(vec![SideEffect::StartSlaAndAcknowledge {
                claim_reference: "AUTO-AB12CDE".into(),
            }])
        );
    }

    #[test]
    fn unauthorized_sender_never_starts_sla() {
        let mut facts = full(Some("CLM-10001"), Some("AB12CDE"));
        facts.envelope.sender_authorized = false;
        assert_eq!(
            decide(&facts).outcome,
            Outcome::StopWithLedger(StopReason::Unauthorized)
        );
    }

    #[test]
    fn gates_apply_in_order() {
        let mut facts = full(None, None);
        facts.envelope.insurer_enabled = false;
        facts.envelope.auto_reply_enabled = false;
        assert_eq!(
            decide(&facts).outcome,
            Outcome::StopWithLedger(StopReason::InsurerDisabled)
        );

        facts.envelope.insurer_enabled = true;
        assert_eq!(
            decide(&facts).outcome,
            Outcome::StopWithLedger(StopReason::MissingReference)
        );

        let mut tracked = full(Some("CLM-10001"), None);
        tracked.classification.as_mut().unwrap().claim_tracked = true;
        tracked.envelope.auto_reply_enabled = false;
        assert_eq!(
            decide(&tracked).outcome,
            Outcome::StopWithLedger(StopReason::AlreadyTracked)
        );

        tracked.classification.as_mut().unwrap().claim_tracked = false;
        assert_eq!(
            decide(&tracked).outcome,
            Outcome::StopWithLedger(StopReason::AutoReplyDisabled)
        );
    }

    #[test]
    fn rule_table_ends_with_catch_all() {
        let names: Vec<_> = RULES.iter().map(|r| r.name).collect();
        assert_eq!(
            names,
            vec![
                "self_loop",
                "already_processed",
                "auto_reply",
                "complaint",
                "regulatory_mention",
                "repairer_submission",
                "follow_up",
                "new_job",
            ]
        );
    }
}
