//! Shared types for the message routing pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Inbound message ─────────────────────────────────────────────────

/// An email as handed over by the mail transport.
///
/// Ephemeral: the core never persists it verbatim, only the facts
/// derived from it (see `ProcessedMessageRecord`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Provider-native id. Unique per mailbox.
    pub message_id: String,
    /// Hash of the internet Message-ID header, stable across provider ids.
    pub message_id_hash: Option<String>,
    /// Conversation/thread id.
    pub thread_id: Option<String>,
    /// Sender address.
    pub sender: String,
    /// Sender display name (if available).
    pub sender_name: Option<String>,
    /// Subject line.
    pub subject: String,
    /// Plain-text body.
    pub content: String,
    /// When the mail server received it.
    pub received_at: DateTime<Utc>,
    /// The message carries at least one attachment.
    pub has_attachments: bool,
}

impl InboundMessage {
    /// Lowercased domain part of the sender address.
    pub fn sender_domain(&self) -> Option<String> {
        sender_domain(&self.sender)
    }
}

/// Lowercased domain part of an email address.
pub fn sender_domain(address: &str) -> Option<String> {
    let (_, domain) = address.trim().rsplit_once('@')?;
    let domain = domain.trim_end_matches('>').trim().to_lowercase();
    if domain.is_empty() { None } else { Some(domain) }
}

// ── Poll result ─────────────────────────────────────────────────────

/// Summary of one poll cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub fetched: usize,
    pub handled: usize,
    pub skipped: usize,
    pub failed: usize,
    /// Left untouched because shutdown was requested mid-batch.
    pub interrupted: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sender_domain_lowercases() {
        assert_eq!(sender_domain("Claims@Aviva.CO.UK").as_deref(), Some("aviva.co.uk"));
    }

    #[test]
    fn sender_domain_rejects_bare_names() {
        assert_eq!(sender_domain("postmaster"), None);
        assert_eq!(sender_domain("someone@"), None);
    }

    #[test]
    fn inbound_message_domain() {
        let msg = InboundMessage {
            message_id: "imap:1:42".into(),
            message_id_hash: None,
            thread_id: None,
            sender: "jobs@insurer.example".into(),
            sender_name: Some("Insurer Jobs".into()),
            subject: "New instruction".into(),
            content: "Please inspect".into(),
            received_at: Utc::now(),
            has_attachments: false,
        };
        assert_eq!(msg.sender_domain().as_deref(), Some("insurer.example"));
    }
}
