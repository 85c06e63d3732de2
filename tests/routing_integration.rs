//! End-to-end routing tests.
//!
//! Each test runs the real processor over an in-memory libSQL database with
//! a recording mail transport and, where it matters, a stub LLM.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::json;

use claim_intake::audit::{AuditSink, DbAuditSink};
use claim_intake::classify::{ClassificationProvider, LlmClassifier};
use claim_intake::config::RuntimeConfig;
use claim_intake::error::{LlmError, TransportError};
use claim_intake::llm::provider::{CompletionRequest, CompletionResponse, FinishReason, LlmProvider};
use claim_intake::model::Severity;
use claim_intake::pipeline::poller::Poller;
use claim_intake::pipeline::processor::{MessageProcessor, ProcessOutcome};
use claim_intake::pipeline::types::InboundMessage;
use claim_intake::settings::SettingsProvider;
use claim_intake::store::{Database, LibSqlBackend};
use claim_intake::templates::DbTemplateStore;
use claim_intake::transport::MailTransport;

const MAILBOX: &str = "claims@assessors.example";
const ESCALATION: &str = "complaints@assessors.example";

// ── Stubs ───────────────────────────────────────────────────────────

#[derive(Default)]
struct RecordingTransport {
    inbox: Vec<InboundMessage>,
    sent: Mutex<Vec<(String, String)>>,
}

impl RecordingTransport {
    fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl MailTransport for RecordingTransport {
    async fn fetch_since(&self, _since: DateTime<Utc>) -> Result<Vec<InboundMessage>, TransportError> {
        Ok(self.inbox.clone())
    }

    async fn send(
        &self,
        _from: &str,
        to: &str,
        subject: &str,
        _body: &str,
    ) -> Result<(), TransportError> {
        self.sent
            .lock()
            .unwrap()
            .push((to.to_string(), subject.to_string()));
        Ok(())
    }
}

/// Counts calls and answers with a fixed body, or fails when `fail` is set.
struct StubLlm {
    calls: AtomicUsize,
    fail: bool,
    reply: &'static str,
}

impl StubLlm {
    fn failing() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            fail: true,
            reply: "",
        }
    }

    fn replying(reply: &'static str) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            fail: false,
            reply,
        }
    }
}

#[async_trait]
impl LlmProvider for StubLlm {
    fn model_name(&self) -> &str {
        "stub"
    }

    async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(LlmError::RequestFailed {
                provider: "stub".into(),
                reason: "backend down".into(),
            });
        }
        Ok(CompletionResponse {
            content: self.reply.to_string(),
            input_tokens: 0,
            output_tokens: 0,
            finish_reason: FinishReason::Stop,
        })
    }
}

// ── Fixtures ────────────────────────────────────────────────────────

struct Setup {
    db: Arc<dyn Database>,
    settings: Arc<SettingsProvider>,
    transport: Arc<RecordingTransport>,
    processor: Arc<MessageProcessor>,
    audit: Arc<dyn AuditSink>,
}

async fn setup_with(llm: Option<Arc<StubLlm>>, inbox: Vec<InboundMessage>) -> Setup {
    let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let config = RuntimeConfig {
        monitored_mailbox: MAILBOX.into(),
        escalation_address: ESCALATION.into(),
        default_business_hours_only: false,
        ..RuntimeConfig::default()
    };
    let settings = Arc::new(SettingsProvider::new(Arc::clone(&db), config));
    let classifier = match llm {
        Some(llm) => ClassificationProvider::new(
            None,
            Some(LlmClassifier::new(llm, Duration::from_secs(1))),
            0.7,
        ),
        None => ClassificationProvider::rules_only(),
    };
    let transport = Arc::new(RecordingTransport {
        inbox,
        ..RecordingTransport::default()
    });
    let audit: Arc<dyn AuditSink> = Arc::new(DbAuditSink::new(Arc::clone(&db)));
    let processor = Arc::new(MessageProcessor::new(
        Arc::clone(&db),
        Arc::clone(&settings),
        Arc::new(classifier),
        Arc::new(DbTemplateStore::new(Arc::clone(&db))),
        transport.clone(),
        Arc::clone(&audit),
    ));
    Setup {
        db,
        settings,
        transport,
        processor,
        audit,
    }
}

async fn setup() -> Setup {
    setup_with(None, Vec::new()).await
}

fn email(id: &str, sender: &str, subject: &str, content: &str) -> InboundMessage {
    InboundMessage {
        message_id: id.into(),
        message_id_hash: Some(format!("<{id}@mail.example>")),
        thread_id: Some(format!("thread-{id}")),
        sender: sender.into(),
        sender_name: None,
        subject: subject.into(),
        content: content.into(),
        received_at: Utc.with_ymd_and_hms(2026, 3, 3, 10, 0, 0).unwrap(),
        has_attachments: false,
    }
}

async fn branches(db: &Arc<dyn Database>) -> Vec<String> {
    db.list_audit_events(50)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.branch)
        .collect()
}

// ── Tests ───────────────────────────────────────────────────────────

#[tokio::test]
async fn redelivered_message_is_handled_once() {
    let s = setup().await;
    let msg = email(
        "imap:1:100",
        "jobs@insurer.example",
        "New instruction",
        "Claim reference: CLM-40100",
    );

    for _ in 0..3 {
        s.processor.process(&msg).await.unwrap();
    }

    assert_eq!(s.db.count_processed_messages("imap:1:100").await.unwrap(), 1);
    assert_eq!(s.transport.sent().len(), 1);
}

#[tokio::test]
async fn same_message_under_new_provider_id_is_not_reprocessed() {
    let s = setup().await;
    let first = email(
        "imap:1:101",
        "jobs@insurer.example",
        "New instruction",
        "Claim reference: CLM-40101",
    );
    let moved = InboundMessage {
        message_id: "imap:2:7".into(),
        thread_id: None,
        ..first.clone()
    };

    s.processor.process(&first).await.unwrap();
    let outcome = s.processor.process(&moved).await.unwrap();

    assert_eq!(
        outcome,
        ProcessOutcome::Skipped {
            branch: "already_processed"
        }
    );
    assert_eq!(s.transport.sent().len(), 1);
}

#[tokio::test]
async fn complaint_wins_over_new_job() {
    let s = setup().await;
    let msg = email(
        "imap:1:102",
        "jobs@insurer.example",
        "New instruction",
        "Claim reference: CLM-40102. The customer has raised a formal complaint about the delay.",
    );

    let outcome = s.processor.process(&msg).await.unwrap();

    assert_eq!(outcome, ProcessOutcome::Handled { branch: "complaint" });
    assert!(!s.db.sla_in_progress_exists("CLM-40102").await.unwrap());
    let recipients: Vec<String> = s.transport.sent().into_iter().map(|(to, _)| to).collect();
    assert!(recipients.contains(&ESCALATION.to_string()));
}

#[tokio::test]
async fn complaint_without_reference_alerts_only() {
    let s = setup().await;
    let msg = email(
        "imap:1:103",
        "customer@home.example",
        "Terrible",
        "This is unacceptable and I want to escalate it to your manager.",
    );

    s.processor.process(&msg).await.unwrap();

    let sent = s.transport.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, ESCALATION);
    let complaints = s.db.list_complaints(10).await.unwrap();
    assert_eq!(complaints.len(), 1);
    assert_eq!(complaints[0].severity, Severity::Medium);
}

#[tokio::test]
async fn repairer_without_reference_is_recorded_silently() {
    let s = setup().await;
    let mut msg = email(
        "imap:1:104",
        "estimates@smithsbodyshop.example",
        "Estimate",
        "Please find our repair estimate attached.",
    );
    msg.has_attachments = true;

    let outcome = s.processor.process(&msg).await.unwrap();

    assert_eq!(
        outcome,
        ProcessOutcome::Handled {
            branch: "repairer_submission"
        }
    );
    assert!(s.transport.sent().is_empty());
}

#[tokio::test]
async fn repairer_with_reference_is_acknowledged_without_sla() {
    let s = setup().await;
    let mut msg = email(
        "imap:1:105",
        "estimates@smithsbodyshop.example",
        "Estimate for claim CLM-40105",
        "Please find our repair estimate attached.",
    );
    msg.has_attachments = true;

    s.processor.process(&msg).await.unwrap();

    let sent = s.transport.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, "estimates@smithsbodyshop.example");
    assert!(!s.db.sla_in_progress_exists("CLM-40105").await.unwrap());
}

#[tokio::test]
async fn unauthorized_sender_gets_no_acknowledgment() {
    let s = setup().await;
    s.settings
        .update("authorized_senders", json!(["@insurer.example"]))
        .await
        .unwrap();
    let msg = email(
        "imap:1:106",
        "someone@elsewhere.example",
        "New instruction",
        "Claim reference: CLM-40106",
    );

    let outcome = s.processor.process(&msg).await.unwrap();

    assert_eq!(outcome, ProcessOutcome::Handled { branch: "new_job" });
    assert!(s.transport.sent().is_empty());
    assert!(!s.db.sla_in_progress_exists("CLM-40106").await.unwrap());
    let events = s.db.list_audit_events(10).await.unwrap();
    assert_eq!(events[0].detail["reason"], "unauthorized_sender");
}

#[tokio::test]
async fn disabled_insurer_subdomain_gets_no_acknowledgment() {
    let s = setup().await;
    s.settings
        .update("insurer_enabled", json!({"insurer.example": false}))
        .await
        .unwrap();
    let msg = email(
        "imap:1:107",
        "jobs@claims.insurer.example",
        "New instruction",
        "Claim reference: CLM-40107",
    );

    s.processor.process(&msg).await.unwrap();

    assert!(s.transport.sent().is_empty());
}

#[tokio::test]
async fn auto_reply_toggle_stops_acknowledgment_only() {
    let s = setup().await;
    s.settings
        .update("auto_reply_enabled", json!(false))
        .await
        .unwrap();
    let msg = email(
        "imap:1:108",
        "jobs@insurer.example",
        "New instruction",
        "Claim reference: CLM-40108",
    );

    s.processor.process(&msg).await.unwrap();

    assert!(s.transport.sent().is_empty());
    assert_eq!(s.db.count_processed_messages("imap:1:108").await.unwrap(), 1);
}

#[tokio::test]
async fn ai_outage_falls_back_to_rules() {
    let llm = Arc::new(StubLlm::failing());
    let s = setup_with(Some(Arc::clone(&llm)), Vec::new()).await;
    let msg = email(
        "imap:1:109",
        "customer@home.example",
        "Claim CLM-40109",
        "If this is not sorted I am going to the ombudsman.",
    );

    let outcome = s.processor.process(&msg).await.unwrap();

    assert_eq!(outcome, ProcessOutcome::Handled { branch: "complaint" });
    assert!(llm.calls.load(Ordering::SeqCst) > 0);
    let complaints = s.db.list_complaints(10).await.unwrap();
    assert_eq!(complaints[0].severity, Severity::High);
    assert_eq!(complaints[0].claim_reference.as_deref(), Some("CLM-40109"));
}

#[tokio::test]
async fn urgent_job_halves_the_clock() {
    let s = setup().await;
    s.settings
        .update("default_sla_hours", json!(48))
        .await
        .unwrap();
    let msg = email(
        "imap:1:110",
        "jobs@insurer.example",
        "URGENT new instruction",
        "Claim reference: CLM-40110",
    );

    s.processor.process(&msg).await.unwrap();

    let sla = s.db.get_active_sla("CLM-40110").await.unwrap().unwrap();
    assert_eq!(sla.required_hours, 24);
    assert!(sla.commitment.contains("24"));
    assert!(sla.commitment.ends_with("(URGENT)"));
    assert_eq!(sla.deadline, msg.received_at + chrono::Duration::hours(24));
}

#[tokio::test]
async fn own_mail_never_reaches_the_classifier() {
    let llm = Arc::new(StubLlm::replying("{}"));
    let s = setup_with(Some(Arc::clone(&llm)), Vec::new()).await;
    let msg = email(
        "imap:1:111",
        MAILBOX,
        "Instruction received: CLM-40111",
        "Thank you for your instruction.",
    );

    let outcome = s.processor.process(&msg).await.unwrap();

    assert_eq!(outcome, ProcessOutcome::Handled { branch: "self_loop" });
    assert_eq!(llm.calls.load(Ordering::SeqCst), 0);
    assert!(s.transport.sent().is_empty());
}

#[tokio::test]
async fn out_of_office_never_reaches_the_classifier() {
    let llm = Arc::new(StubLlm::replying("{}"));
    let s = setup_with(Some(Arc::clone(&llm)), Vec::new()).await;
    let msg = email(
        "imap:1:112",
        "adjuster@insurer.example",
        "Automatic reply: CLM-40112",
        "I am out of office until Monday.",
    );

    s.processor.process(&msg).await.unwrap();

    assert_eq!(llm.calls.load(Ordering::SeqCst), 0);
    assert!(s.transport.sent().is_empty());
    assert!(branches(&s.db).await.contains(&"auto_reply".to_string()));
}

#[tokio::test]
async fn vehicle_only_job_uses_synthetic_reference() {
    let s = setup().await;
    let msg = email(
        "imap:1:113",
        "jobs@insurer.example",
        "New instruction",
        "Please inspect vehicle AB12 CDE at the customer's address.",
    );

    s.processor.process(&msg).await.unwrap();

    assert!(s.db.sla_in_progress_exists("AUTO-AB12CDE").await.unwrap());
    assert_eq!(s.transport.sent().len(), 1);
}

#[tokio::test]
async fn poll_cycle_routes_the_inbox() {
    let inbox = vec![
        email(
            "imap:9:1",
            "jobs@insurer.example",
            "New instruction",
            "Claim reference: CLM-40201",
        ),
        email(
            "imap:9:2",
            "customer@home.example",
            "Claim CLM-40202",
            "I have made a formal complaint to the ombudsman.",
        ),
        email("imap:9:3", MAILBOX, "Instruction received: CLM-40201", "Thanks"),
    ];
    let s = setup_with(None, inbox).await;
    let poller = Poller::new(
        s.transport.clone(),
        Arc::clone(&s.processor),
        Arc::clone(&s.db),
        Arc::clone(&s.audit),
        Duration::from_secs(600),
    );

    let first = poller.poll_once().await.unwrap();
    assert_eq!(first.fetched, 3);
    assert_eq!(first.handled, 3);
    assert_eq!(first.failed, 0);

    let second = poller.poll_once().await.unwrap();
    assert_eq!(second.skipped, 3);

    // One acknowledgment, one complaint acknowledgment, one alert.
    assert_eq!(s.transport.sent().len(), 3);
    let seen = branches(&s.db).await;
    for branch in ["new_job", "complaint", "self_loop"] {
        assert!(seen.contains(&branch.to_string()), "missing {branch}");
    }
}

#[tokio::test]
async fn signed_instruction_is_a_new_job_not_a_complaint() {
    let s = setup().await;
    let msg = email(
        "imap:1:114",
        "jobs@insurer.example",
        "New instruction",
        "Claim reference: CLM-40001\nPlease inspect.\n--\nJane Doe, Claims Manager\n\
         Authorised and regulated by the FCA",
    );

    let outcome = s.processor.process(&msg).await.unwrap();

    assert_eq!(outcome, ProcessOutcome::Handled { branch: "new_job" });
    assert!(s.db.sla_in_progress_exists("CLM-40001").await.unwrap());
    assert!(s.db.list_complaints(10).await.unwrap().is_empty());
    let sent = s.transport.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, "jobs@insurer.example");
}

#[tokio::test]
async fn unreadable_allow_list_denies_new_jobs() {
    let s = setup().await;
    s.db.set_setting("authorized_senders", &json!("jobs@trusted.example"))
        .await
        .unwrap();
    let msg = email(
        "imap:1:115",
        "stranger@elsewhere.example",
        "New instruction",
        "Claim reference: CLM-40115",
    );

    let outcome = s.processor.process(&msg).await.unwrap();

    assert_eq!(outcome, ProcessOutcome::Handled { branch: "new_job" });
    assert!(s.transport.sent().is_empty());
    assert!(!s.db.sla_in_progress_exists("CLM-40115").await.unwrap());
    let events = s.db.list_audit_events(10).await.unwrap();
    assert_eq!(events[0].detail["reason"], "unauthorized_sender");
}

#[tokio::test]
async fn unreadable_insurer_toggles_deny_new_jobs() {
    let s = setup().await;
    s.db.set_setting("insurer_enabled", &json!(["insurer.example"]))
        .await
        .unwrap();
    let msg = email(
        "imap:1:116",
        "jobs@insurer.example",
        "New instruction",
        "Claim reference: CLM-40116",
    );

    s.processor.process(&msg).await.unwrap();

    assert!(s.transport.sent().is_empty());
    assert!(!s.db.sla_in_progress_exists("CLM-40116").await.unwrap());
}

#[tokio::test]
async fn complaint_on_known_claim_in_new_thread_is_a_complaint() {
    let s = setup().await;
    let instruction = email(
        "imap:1:117",
        "jobs@insurer.example",
        "New instruction",
        "Claim reference: CLM-40117",
    );
    s.processor.process(&instruction).await.unwrap();

    let chaser = email(
        "imap:1:118",
        "customer@home.example",
        "Claim CLM-40117",
        "I am still waiting for the inspection. This is unacceptable and I am making a formal complaint.",
    );
    let outcome = s.processor.process(&chaser).await.unwrap();

    assert_eq!(outcome, ProcessOutcome::Handled { branch: "complaint" });
    let complaints = s.db.list_complaints(10).await.unwrap();
    assert_eq!(complaints.len(), 1);
    assert_eq!(complaints[0].claim_reference.as_deref(), Some("CLM-40117"));
    assert_eq!(complaints[0].severity, Severity::High);
    assert!(s.db.list_unused_drafts(10).await.unwrap().is_empty());
    // The original clock keeps running.
    assert!(s.db.sla_in_progress_exists("CLM-40117").await.unwrap());

    // Instruction ack, then complaint ack and alert.
    let recipients: Vec<String> = s.transport.sent().into_iter().map(|(to, _)| to).collect();
    assert_eq!(
        recipients,
        vec![
            "jobs@insurer.example".to_string(),
            "customer@home.example".to_string(),
            ESCALATION.to_string(),
        ]
    );
}
