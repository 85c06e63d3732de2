//! Mail transport abstraction.
//!
//! The router only ever needs two things from a mail system: the messages
//! that arrived since some instant, and a way to send one plain-text reply.

pub mod email;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::TransportError;
use crate::pipeline::types::InboundMessage;

pub use email::{EmailConfig, ImapSmtpTransport};

#[async_trait]
pub trait MailTransport: Send + Sync {
    /// Messages received at or after `since`. May return messages that were
    /// already seen; the ledger absorbs redeliveries.
    async fn fetch_since(&self, since: DateTime<Utc>) -> Result<Vec<InboundMessage>, TransportError>;

    /// One best-effort send. Not retried.
    async fn send(&self, from: &str, to: &str, subject: &str, body: &str)
    -> Result<(), TransportError>;
}
