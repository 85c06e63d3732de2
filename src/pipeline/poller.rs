//! Fetch loop: pull mail since the last watermark, route it, sweep SLA
//! breaches.
//!
//! The fetch window overlaps the previous one by `lookback`, so a message
//! the server indexed late is still picked up. Redeliveries are absorbed by
//! the ledger.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::audit::AuditSink;
use crate::error::{DatabaseError, PipelineError};
use crate::pipeline::processor::MessageProcessor;
use crate::pipeline::types::BatchSummary;
use crate::sla::sweep_breaches;
use crate::store::Database;
use crate::transport::MailTransport;

/// Settings-table key holding the start time of the last good fetch.
pub const WATERMARK_KEY: &str = "poller.last_fetch_at";

pub struct Poller {
    transport: Arc<dyn MailTransport>,
    processor: Arc<MessageProcessor>,
    db: Arc<dyn Database>,
    audit: Arc<dyn AuditSink>,
    lookback: Duration,
    shutdown: AtomicBool,
    wake: Notify,
}

impl Poller {
    pub fn new(
        transport: Arc<dyn MailTransport>,
        processor: Arc<MessageProcessor>,
        db: Arc<dyn Database>,
        audit: Arc<dyn AuditSink>,
        lookback: Duration,
    ) -> Self {
        Self {
            transport,
            processor,
            db,
            audit,
            lookback,
            shutdown: AtomicBool::new(false),
            wake: Notify::new(),
        }
    }

    /// Stop after the message in flight. The loop in [`spawn_poller`]
    /// exits without waiting for its next tick.
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.wake.notify_one();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    /// Run a single cycle: fetch → route → advance watermark → sweep.
    ///
    /// A failed fetch leaves the watermark where it was, and so does a batch
    /// cut short by shutdown.
    pub async fn poll_once(&self) -> Result<BatchSummary, PipelineError> {
        let fetch_started = Utc::now();
        let lookback = chrono::Duration::from_std(self.lookback).unwrap_or(chrono::Duration::zero());
        let since = match self.watermark().await? {
            Some(mark) => mark - lookback,
            None => fetch_started - lookback,
        };

        debug!(since = %since, "Fetching mail");
        let messages = self.transport.fetch_since(since).await?;

        let summary = if messages.is_empty() {
            BatchSummary::default()
        } else {
            self.processor.process_batch(messages, &self.shutdown).await
        };

        if summary.interrupted > 0 {
            return Ok(summary);
        }

        self.set_watermark(fetch_started).await?;

        match sweep_breaches(self.db.as_ref(), self.audit.as_ref(), Utc::now()).await {
            Ok(0) => {}
            Ok(n) => warn!(breached = n, "SLA clocks breached"),
            Err(e) => error!(error = %e, "SLA breach sweep failed"),
        }

        Ok(summary)
    }

    async fn watermark(&self) -> Result<Option<DateTime<Utc>>, DatabaseError> {
        let Some(value) = self.db.get_setting(WATERMARK_KEY).await? else {
            return Ok(None);
        };
        let parsed = value
            .as_str()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc));
        if parsed.is_none() {
            warn!(value = %value, "Unreadable fetch watermark, starting fresh");
        }
        Ok(parsed)
    }

    async fn set_watermark(&self, at: DateTime<Utc>) -> Result<(), DatabaseError> {
        self.db
            .set_setting(WATERMARK_KEY, &serde_json::Value::String(at.to_rfc3339()))
            .await
    }
}

/// Spawn a background task that polls on a fixed interval until
/// [`Poller::request_shutdown`] is called.
pub fn spawn_poller(poller: Arc<Poller>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(interval_secs = interval.as_secs(), "Mail poller started");

        let mut tick = tokio::time::interval(interval);

        loop {
            tokio::select! {
                _ = tick.tick() => {}
                _ = poller.wake.notified() => {}
            }

            if poller.is_shutting_down() {
                info!("Mail poller shutting down");
                return;
            }

            match poller.poll_once().await {
                Ok(summary) if summary.fetched > 0 => info!(
                    fetched = summary.fetched,
                    handled = summary.handled,
                    skipped = summary.skipped,
                    failed = summary.failed,
                    interrupted = summary.interrupted,
                    "Poll cycle complete"
                ),
                Ok(_) => debug!("Poll cycle complete, no mail"),
                Err(e) => error!(error = %e, "Poll cycle failed"),
            }
        }
    })
}
