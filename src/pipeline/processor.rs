//! Message processor: gathers facts, asks the router, claims the ledger row,
//! then performs the side effects.
//!
//! **Core invariant: the ledger row is claimed before anything leaves the
//! building.** If the claim comes back `Duplicate`, another poller owns the
//! message and nothing is sent. A failed send after a successful claim is
//! logged and not retried.
//!
//! Flow:
//! 1. Envelope facts from the configuration snapshot (no I/O)
//! 2. Ledger, keyword signals, then classification, each only if a rule
//!    asks for it
//! 3. Router decision → ledger claim → side effects → audit

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::audit::{AuditEvent, AuditSink};
use crate::classify::ClassificationProvider;
use crate::classify::rules::{
    detect_regulatory_mention, detect_repairer_submission, has_follow_up_marker, is_auto_reply,
};
use crate::error::{PipelineError, TransportError};
use crate::model::{ComplaintRecord, InsertOutcome, ProcessedMessageRecord};
use crate::pipeline::drafts::{classify_intent, generate_draft};
use crate::pipeline::ledger::DedupLedger;
use crate::pipeline::router::{
    self, ClassificationFacts, EnvelopeFacts, Facts, LedgerFacts, Outcome, Recipient,
    SideEffect, SignalFacts, Stage,
};
use crate::pipeline::types::{BatchSummary, InboundMessage};
use crate::settings::{ConfigSnapshot, SettingsProvider};
use crate::sla::tracker::{self, SlaRequest, SlaStart};
use crate::store::Database;
use crate::templates::{self, TemplateStore};
use crate::transport::MailTransport;

/// Default upper bound on one outbound send.
const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(30);

/// Body characters quoted in a complaint alert.
const ALERT_EXCERPT_CHARS: usize = 500;

/// Greeting used when the sender gave no display name.
const FALLBACK_SENDER_NAME: &str = "Sir or Madam";

/// What happened to one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// A ledger row was written by this call.
    Handled { branch: &'static str },
    /// Nothing written: already processed, or another writer won the claim.
    Skipped { branch: &'static str },
}

pub struct MessageProcessor {
    db: Arc<dyn Database>,
    ledger: DedupLedger,
    settings: Arc<SettingsProvider>,
    classifier: Arc<ClassificationProvider>,
    templates: Arc<dyn TemplateStore>,
    transport: Arc<dyn MailTransport>,
    audit: Arc<dyn AuditSink>,
    send_timeout: Duration,
}

impl MessageProcessor {
    pub fn new(
        db: Arc<dyn Database>,
        settings: Arc<SettingsProvider>,
        classifier: Arc<ClassificationProvider>,
        templates: Arc<dyn TemplateStore>,
        transport: Arc<dyn MailTransport>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            ledger: DedupLedger::new(Arc::clone(&db)),
            db,
            settings,
            classifier,
            templates,
            transport,
            audit,
            send_timeout: DEFAULT_SEND_TIMEOUT,
        }
    }

    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    /// Route one message and perform its side effects.
    pub async fn process(&self, message: &InboundMessage) -> Result<ProcessOutcome, PipelineError> {
        info!(
            message_id = %message.message_id,
            sender = %message.sender,
            "Processing inbound message"
        );

        let snapshot = self.settings.snapshot().await?;
        let mut facts = Facts::new(envelope_facts(&snapshot, message));
        let decision = loop {
            match router::route(&facts) {
                Ok(decision) => break decision,
                Err(stage) => self.gather(stage, message, &mut facts).await?,
            }
        };

        debug!(
            message_id = %message.message_id,
            branch = decision.branch,
            "Router decision"
        );

        if !decision.writes_ledger() {
            return Ok(ProcessOutcome::Skipped {
                branch: decision.branch,
            });
        }

        // Claim first. Everything below runs only for the writer that won.
        let claim_reference = facts
            .classification
            .as_ref()
            .and_then(ClassificationFacts::resolved_claim_reference);
        let entry = ProcessedMessageRecord {
            message_id: message.message_id.clone(),
            message_id_hash: message.message_id_hash.clone(),
            thread_id: message.thread_id.clone(),
            sender: message.sender.clone(),
            subject: message.subject.clone(),
            claim_reference: claim_reference.clone(),
            is_complaint: decision.is_complaint(),
            is_follow_up: decision.is_follow_up(),
            processed_at: Utc::now(),
        };
        match self.ledger.record(&entry).await.map_err(PipelineError::Ledger)? {
            InsertOutcome::Inserted => {}
            InsertOutcome::Duplicate => {
                info!(
                    message_id = %message.message_id,
                    "Ledger claim lost to another writer, skipping side effects"
                );
                return Ok(ProcessOutcome::Skipped {
                    branch: decision.branch,
                });
            }
        }

        for annotation in &decision.annotations {
            self.emit(
                self.event(annotation.branch(), message, &facts, claim_reference.as_deref())
                    .with_detail(annotation.detail()),
            )
            .await;
        }

        let detail = match &decision.outcome {
            Outcome::StopWithLedger(reason) => json!({ "reason": reason.as_str() }),
            Outcome::Act(effects) => {
                let mut reports = Vec::with_capacity(effects.len());
                for effect in effects {
                    reports.push(self.execute(effect, message, &snapshot, &facts).await);
                }
                json!({ "effects": reports })
            }
            Outcome::Stop => json!({}),
        };

        self.emit(
            self.event(decision.branch, message, &facts, claim_reference.as_deref())
                .with_detail(detail),
        )
        .await;

        Ok(ProcessOutcome::Handled {
            branch: decision.branch,
        })
    }

    /// Process messages sequentially in received order. Failures on
    /// individual messages are logged and don't stop the batch.
    ///
    /// `stop` is checked between messages, never inside one, so a message
    /// whose ledger row is claimed always gets its side effects.
    pub async fn process_batch(
        &self,
        mut messages: Vec<InboundMessage>,
        stop: &AtomicBool,
    ) -> BatchSummary {
        messages.sort_by_key(|m| m.received_at);
        let mut summary = BatchSummary {
            fetched: messages.len(),
            ..BatchSummary::default()
        };
        info!(count = summary.fetched, "Processing message batch");

        for (done, message) in messages.iter().enumerate() {
            if stop.load(Ordering::Relaxed) {
                summary.interrupted = messages.len() - done;
                warn!(
                    remaining = summary.interrupted,
                    "Shutdown requested, leaving the rest of the batch"
                );
                break;
            }
            match self.process(message).await {
                Ok(ProcessOutcome::Handled { .. }) => summary.handled += 1,
                Ok(ProcessOutcome::Skipped { .. }) => summary.skipped += 1,
                Err(e) => {
                    summary.failed += 1;
                    error!(
                        message_id = %message.message_id,
                        error = %e,
                        "Failed to process message in batch"
                    );
                }
            }
        }

        info!(
            handled = summary.handled,
            skipped = summary.skipped,
            failed = summary.failed,
            "Batch processing complete"
        );
        summary
    }

    // ── Fact gathering ──────────────────────────────────────────────

    async fn gather(
        &self,
        stage: Stage,
        message: &InboundMessage,
        facts: &mut Facts,
    ) -> Result<(), PipelineError> {
        match stage {
            Stage::Ledger => {
                facts.ledger = Some(LedgerFacts {
                    duplicate: self.ledger.find_duplicate(message).await?,
                });
            }
            Stage::Signals => {
                facts.signals = Some(SignalFacts {
                    auto_reply: is_auto_reply(&message.sender, &message.subject, &message.content),
                    regulatory: detect_regulatory_mention(&message.subject, &message.content),
                    repairer_submission: detect_repairer_submission(
                        &message.sender,
                        &message.subject,
                        &message.content,
                        message.has_attachments,
                    ),
                    follow_up_marker: has_follow_up_marker(&message.subject),
                });
            }
            Stage::Classification => {
                let (analysis, complaint) = tokio::join!(
                    self.classifier
                        .analyze(&message.subject, &message.sender, &message.content),
                    self.classifier
                        .assess_complaint(&message.subject, &message.content),
                );

                let claim_known = match &analysis.claim_reference {
                    Some(reference) => self.ledger.has_claim_reference(reference).await?,
                    None => false,
                };
                let claim_tracked = match router::resolve_claim_reference(&analysis) {
                    Some(reference) => self.db.sla_in_progress_exists(&reference).await?,
                    None => false,
                };

                facts.classification = Some(ClassificationFacts {
                    analysis,
                    complaint,
                    claim_known,
                    claim_tracked,
                    follow_up_intent: classify_intent(&message.subject, &message.content),
                });
            }
        }
        Ok(())
    }

    // ── Side effects ────────────────────────────────────────────────

    /// Run one side effect and report what happened. Failures are logged
    /// and reported, never propagated: the ledger row is already written.
    async fn execute(
        &self,
        effect: &SideEffect,
        message: &InboundMessage,
        snapshot: &ConfigSnapshot,
        facts: &Facts,
    ) -> serde_json::Value {
        let Some(classification) = facts.classification.as_ref() else {
            return json!({ "effect": "none", "status": "skipped", "reason": "no classification" });
        };
        let claim_reference = classification.resolved_claim_reference();

        match effect {
            SideEffect::RecordComplaint(signal) => {
                let record = ComplaintRecord {
                    id: Uuid::new_v4(),
                    claim_reference: classification.analysis.claim_reference.clone(),
                    vehicle_id: classification.analysis.vehicle_id.clone(),
                    sender: message.sender.clone(),
                    subject: message.subject.clone(),
                    complaint_type: signal.complaint_type,
                    severity: signal.severity,
                    detection: json!({
                        "keywords": signal.keywords,
                        "method": classification.complaint.method.as_str(),
                        "confidence": classification.complaint.confidence,
                    }),
                    created_at: Utc::now(),
                };
                match self.db.insert_complaint(&record).await {
                    Ok(()) => {
                        warn!(
                            message_id = %message.message_id,
                            severity = signal.severity.as_str(),
                            complaint_type = signal.complaint_type.as_str(),
                            "Complaint recorded"
                        );
                        json!({ "effect": "record_complaint", "status": "done", "id": record.id })
                    }
                    Err(e) => {
                        error!(message_id = %message.message_id, error = %e, "Failed to record complaint");
                        json!({ "effect": "record_complaint", "status": "failed", "reason": e.to_string() })
                    }
                }
            }

            SideEffect::Send { template, to } => {
                let mut vars = base_vars(message, claim_reference.as_deref());
                if let Some(signal) = &classification.complaint.signal {
                    vars.insert("severity".into(), signal.severity.as_str().to_uppercase());
                    vars.insert("complaint_type".into(), signal.complaint_type.as_str().into());
                }
                let recipient = match to {
                    Recipient::Sender => message.sender.as_str(),
                    Recipient::Escalation => snapshot.escalation_address.as_str(),
                };
                self.send_template(template, recipient, &vars, snapshot).await
            }

            SideEffect::StartSlaAndAcknowledge { claim_reference } => {
                self.start_sla_and_acknowledge(claim_reference, message, snapshot, classification)
                    .await
            }

            SideEffect::StoreDraft {
                claim_reference,
                intent,
            } => {
                let draft = generate_draft(claim_reference, *intent, &message.subject);
                match self.db.insert_follow_up_draft(&draft).await {
                    Ok(()) => {
                        info!(
                            claim_reference = %claim_reference,
                            intent = intent.as_str(),
                            "Follow-up draft stored for review"
                        );
                        json!({ "effect": "store_draft", "status": "done", "id": draft.id, "intent": intent.as_str() })
                    }
                    Err(e) => {
                        error!(claim_reference = %claim_reference, error = %e, "Failed to store draft");
                        json!({ "effect": "store_draft", "status": "failed", "reason": e.to_string() })
                    }
                }
            }
        }
    }

    async fn start_sla_and_acknowledge(
        &self,
        claim_reference: &str,
        message: &InboundMessage,
        snapshot: &ConfigSnapshot,
        classification: &ClassificationFacts,
    ) -> serde_json::Value {
        let insurer_domain = message.sender_domain().unwrap_or_default();
        let request = SlaRequest {
            claim_reference,
            sender: &message.sender,
            insurer_domain: &insurer_domain,
            urgency: classification.analysis.urgency,
            started_at: message.received_at,
        };

        // A malformed override fails closed: no clock, no acknowledgment.
        let record = match tracker::build_record(snapshot, &request) {
            Ok(record) => record,
            Err(e) => {
                error!(
                    claim_reference,
                    insurer_domain = %insurer_domain,
                    error = %e,
                    "SLA configuration error, acknowledgment not sent"
                );
                return json!({ "effect": "start_sla", "status": "skipped", "reason": e.to_string() });
            }
        };

        let record = match tracker::start(self.db.as_ref(), record).await {
            Ok(SlaStart::Started(record)) => record,
            Ok(SlaStart::AlreadyTracked) => {
                return json!({ "effect": "start_sla", "status": "skipped", "reason": "already_tracked" });
            }
            Err(e) => {
                error!(claim_reference, error = %e, "Failed to start SLA clock");
                return json!({ "effect": "start_sla", "status": "failed", "reason": e.to_string() });
            }
        };

        let mut vars = base_vars(message, Some(claim_reference));
        vars.insert("commitment".into(), record.commitment.clone());
        vars.insert(
            "deadline".into(),
            record
                .deadline
                .with_timezone(&snapshot.calendar.timezone)
                .format("%A %-d %B %Y, %H:%M %Z")
                .to_string(),
        );
        let ack = self
            .send_template(templates::NEW_JOB_ACKNOWLEDGMENT, &message.sender, &vars, snapshot)
            .await;

        json!({
            "effect": "start_sla",
            "status": "done",
            "deadline": record.deadline,
            "required_hours": record.required_hours,
            "urgency": record.urgency.as_str(),
            "acknowledgment": ack,
        })
    }

    /// Render and send. An unresolved template skips the send.
    async fn send_template(
        &self,
        template: &str,
        to: &str,
        vars: &HashMap<String, String>,
        snapshot: &ConfigSnapshot,
    ) -> serde_json::Value {
        if to.trim().is_empty() {
            warn!(template, "No recipient address, send skipped");
            return json!({ "effect": "send", "template": template, "status": "skipped", "reason": "no recipient" });
        }

        let rendered = match self.templates.render(template, vars).await {
            Ok(rendered) => rendered,
            Err(e) => {
                error!(template, error = %e, "Template not renderable, send skipped");
                return json!({ "effect": "send", "template": template, "status": "skipped", "reason": e.to_string() });
            }
        };

        let sent = tokio::time::timeout(
            self.send_timeout,
            self.transport.send(
                &snapshot.monitored_mailbox,
                to,
                &rendered.subject,
                &rendered.body,
            ),
        )
        .await
        .unwrap_or(Err(TransportError::Timeout(self.send_timeout)));

        match sent {
            Ok(()) => json!({ "effect": "send", "template": template, "to": to, "status": "sent" }),
            Err(e) => {
                error!(template, to, error = %e, "Send failed, not retried");
                json!({ "effect": "send", "template": template, "to": to, "status": "failed", "reason": e.to_string() })
            }
        }
    }

    // ── Audit ───────────────────────────────────────────────────────

    fn event(
        &self,
        branch: &str,
        message: &InboundMessage,
        facts: &Facts,
        claim_reference: Option<&str>,
    ) -> AuditEvent {
        let event = AuditEvent::new(branch)
            .with_message(&message.message_id, &message.sender)
            .with_claim_reference(claim_reference);
        match &facts.classification {
            Some(c) => event.with_classification(c.analysis.confidence, c.analysis.method.as_str()),
            None => event,
        }
    }

    async fn emit(&self, event: AuditEvent) {
        if let Err(e) = self.audit.append(event).await {
            warn!(error = %e, "Failed to append audit event");
        }
    }
}

fn envelope_facts(snapshot: &ConfigSnapshot, message: &InboundMessage) -> EnvelopeFacts {
    let domain = message.sender_domain().unwrap_or_default();
    EnvelopeFacts {
        from_monitored_mailbox: snapshot.is_self(&message.sender),
        sender_authorized: snapshot.is_sender_authorized(&message.sender),
        insurer_enabled: snapshot.is_insurer_enabled(&domain),
        auto_reply_enabled: snapshot.auto_reply_enabled,
    }
}

fn base_vars(message: &InboundMessage, claim_reference: Option<&str>) -> HashMap<String, String> {
    let mut vars = HashMap::new();
    vars.insert(
        "sender_name".into(),
        message
            .sender_name
            .clone()
            .unwrap_or_else(|| FALLBACK_SENDER_NAME.to_string()),
    );
    vars.insert("sender".into(), message.sender.clone());
    vars.insert("subject".into(), message.subject.clone());
    vars.insert(
        "excerpt".into(),
        message.content.chars().take(ALERT_EXCERPT_CHARS).collect(),
    );
    vars.insert(
        "claim_reference".into(),
        claim_reference.unwrap_or("not provided").to_string(),
    );
    vars
}
