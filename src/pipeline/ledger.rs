//! Deduplication ledger: "have I handled this message already?"
//!
//! Lookups here are a fast path. The guarantee is the set of unique indexes
//! on `processed_messages`: a second writer for the same message gets
//! [`InsertOutcome::Duplicate`] from [`DedupLedger::record`], never a second row.

use std::sync::Arc;

use crate::error::DatabaseError;
use crate::model::{InsertOutcome, ProcessedMessageRecord, is_synthetic_claim_reference};
use crate::pipeline::types::InboundMessage;
use crate::store::Database;

/// Which identity facet matched an existing ledger row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicateKey {
    MessageId,
    MessageIdHash,
    Thread,
}

impl DuplicateKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MessageId => "message_id",
            Self::MessageIdHash => "message_id_hash",
            Self::Thread => "thread_id",
        }
    }
}

#[derive(Clone)]
pub struct DedupLedger {
    db: Arc<dyn Database>,
}

impl DedupLedger {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }

    pub async fn has_been_processed(&self, message_id: &str) -> Result<bool, DatabaseError> {
        self.db.processed_message_exists(message_id).await
    }

    pub async fn has_message_id_hash(&self, hash: &str) -> Result<bool, DatabaseError> {
        self.db.message_id_hash_exists(hash).await
    }

    pub async fn has_thread(&self, thread_id: &str) -> Result<bool, DatabaseError> {
        self.db.thread_exists(thread_id).await
    }

    /// Synthetic `AUTO-` references never count as known.
    pub async fn has_claim_reference(&self, reference: &str) -> Result<bool, DatabaseError> {
        if is_synthetic_claim_reference(reference) {
            return Ok(false);
        }
        self.db.claim_reference_exists(reference).await
    }

    /// First identity facet of `message` already present in the ledger.
    pub async fn find_duplicate(
        &self,
        message: &InboundMessage,
    ) -> Result<Option<DuplicateKey>, DatabaseError> {
        if self.has_been_processed(&message.message_id).await? {
            return Ok(Some(DuplicateKey::MessageId));
        }
        if let Some(hash) = &message.message_id_hash
            && self.has_message_id_hash(hash).await?
        {
            return Ok(Some(DuplicateKey::MessageIdHash));
        }
        if let Some(thread) = &message.thread_id
            && self.has_thread(thread).await?
        {
            return Ok(Some(DuplicateKey::Thread));
        }
        Ok(None)
    }

    /// Append a row. Losing a race to another writer is `Duplicate`, not an error.
    pub async fn record(
        &self,
        entry: &ProcessedMessageRecord,
    ) -> Result<InsertOutcome, DatabaseError> {
        self.db.insert_processed_message(entry).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    use crate::store::LibSqlBackend;

    async fn ledger() -> DedupLedger {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        DedupLedger::new(db)
    }

    fn message(id: &str) -> InboundMessage {
        InboundMessage {
            message_id: id.into(),
            message_id_hash: Some(format!("hash-{id}")),
            thread_id: Some(format!("thread-{id}")),
            sender: "jobs@insurer.example".into(),
            sender_name: None,
            subject: "New instruction".into(),
            content: String::new(),
            received_at: Utc::now(),
            has_attachments: false,
        }
    }

    fn entry(message: &InboundMessage, claim: Option<&str>) -> ProcessedMessageRecord {
        ProcessedMessageRecord {
            message_id: message.message_id.clone(),
            message_id_hash: message.message_id_hash.clone(),
            thread_id: message.thread_id.clone(),
            sender: message.sender.clone(),
            subject: message.subject.clone(),
            claim_reference: claim.map(String::from),
            is_complaint: false,
            is_follow_up: false,
            processed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn finds_each_identity_facet() {
        let ledger = ledger().await;
        let first = message("imap:1:1");
        assert_eq!(ledger.find_duplicate(&first).await.unwrap(), None);
        ledger.record(&entry(&first, None)).await.unwrap();

        assert_eq!(
            ledger.find_duplicate(&first).await.unwrap(),
            Some(DuplicateKey::MessageId)
        );

        // Same internet Message-ID under a new provider id.
        let mut moved = message("imap:2:9");
        moved.message_id_hash = first.message_id_hash.clone();
        assert_eq!(
            ledger.find_duplicate(&moved).await.unwrap(),
            Some(DuplicateKey::MessageIdHash)
        );

        let mut reply = message("imap:1:2");
        reply.thread_id = first.thread_id.clone();
        assert_eq!(
            ledger.find_duplicate(&reply).await.unwrap(),
            Some(DuplicateKey::Thread)
        );
    }

    #[tokio::test]
    async fn second_record_is_duplicate() {
        let ledger = ledger().await;
        let msg = message("imap:1:5");
        assert_eq!(
            ledger.record(&entry(&msg, None)).await.unwrap(),
            InsertOutcome::Inserted
        );
        assert_eq!(
            ledger.record(&entry(&msg, None)).await.unwrap(),
            InsertOutcome::Duplicate
        );
    }

    #[tokio::test]
    async fn synthetic_references_are_ignored() {
        let ledger = ledger().await;
        ledger
            .record(&entry(&message("imap:1:7"), Some("AUTO-AB12CDE")))
            .await
            .unwrap();
        ledger
            .record(&entry(&message("imap:1:8"), Some("CLM-10001")))
            .await
            .unwrap();

        assert!(!ledger.has_claim_reference("AUTO-AB12CDE").await.unwrap());
        assert!(ledger.has_claim_reference("CLM-10001").await.unwrap());
        assert!(!ledger.has_claim_reference("CLM-10002").await.unwrap());
    }
}
