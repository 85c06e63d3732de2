use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use claim_intake::audit::{AuditSink, DbAuditSink};
use claim_intake::classify::ClassificationProvider;
use claim_intake::classify::cache::CacheClassifier;
use claim_intake::classify::llm::LlmClassifier;
use claim_intake::config::RuntimeConfig;
use claim_intake::llm::{LlmConfig, create_provider};
use claim_intake::pipeline::poller::{Poller, spawn_poller};
use claim_intake::pipeline::processor::MessageProcessor;
use claim_intake::settings::SettingsProvider;
use claim_intake::store::{Database, LibSqlBackend};
use claim_intake::templates::DbTemplateStore;
use claim_intake::transport::{EmailConfig, ImapSmtpTransport, MailTransport};

/// How long a message in flight may take to finish after ctrl-c.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(120);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    let mut config = RuntimeConfig::from_env();

    // Initialize tracing: stderr always, plus a daily file when CLAIMS_LOG_DIR is set
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let (file_layer, _file_guard) = match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "claim-intake.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_ansi(false).with_writer(writer)),
                Some(guard),
            )
        }
        None => (None, None),
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .with(file_layer)
        .init();

    eprintln!("📨 Claim Intake v{}", env!("CARGO_PKG_VERSION"));

    let Some(email_config) = EmailConfig::from_env() else {
        eprintln!("Error: EMAIL_IMAP_HOST not set");
        eprintln!("  export EMAIL_IMAP_HOST=imap.example.com EMAIL_USERNAME=... EMAIL_PASSWORD=...");
        std::process::exit(1);
    };

    // The self-loop guard and the From address both need the real mailbox.
    if config.monitored_mailbox.is_empty() {
        if email_config.username.contains('@') {
            tracing::warn!(
                mailbox = %email_config.username,
                "CLAIMS_MONITORED_MAILBOX not set, using EMAIL_USERNAME"
            );
            config.monitored_mailbox = email_config.username.trim().to_lowercase();
        } else {
            eprintln!("Error: CLAIMS_MONITORED_MAILBOX not set");
            eprintln!("  export CLAIMS_MONITORED_MAILBOX=claims@yourfirm.example");
            std::process::exit(1);
        }
    }
    eprintln!("   Mailbox: {}", config.monitored_mailbox);
    eprintln!("   Database: {}", config.db_path.display());
    eprintln!(
        "   IMAP: {}:{}, SMTP: {}:{}",
        email_config.imap_host,
        email_config.imap_port,
        email_config.smtp_host,
        email_config.smtp_port
    );

    // ── Database ─────────────────────────────────────────────────────────
    if let Some(parent) = config.db_path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("opening database at {}", config.db_path.display()))?,
    );
    db.init_schema().await.context("running migrations")?;

    // ── Classification ───────────────────────────────────────────────────
    let cache = CacheClassifier::new(Arc::clone(&db), config.classifier_version.clone());
    let ai = match LlmConfig::from_env() {
        Some(llm_config) => {
            let llm = create_provider(&llm_config)?;
            eprintln!("   Classifier: {} (cache → AI → rules)", llm_config.model);
            Some(LlmClassifier::new(llm, config.classifier_timeout))
        }
        None => {
            eprintln!("   Classifier: no API key, cache → rules only");
            None
        }
    };
    let classifier = Arc::new(ClassificationProvider::new(
        Some(cache),
        ai,
        config.classifier_confidence_threshold,
    ));

    // ── Pipeline ─────────────────────────────────────────────────────────
    let settings = Arc::new(SettingsProvider::new(Arc::clone(&db), config.clone()));
    let audit: Arc<dyn AuditSink> = Arc::new(DbAuditSink::new(Arc::clone(&db)));
    let transport: Arc<dyn MailTransport> = Arc::new(ImapSmtpTransport::new(email_config));

    let processor = MessageProcessor::new(
        Arc::clone(&db),
        settings,
        classifier,
        Arc::new(DbTemplateStore::new(Arc::clone(&db))),
        Arc::clone(&transport),
        Arc::clone(&audit),
    )
    .with_send_timeout(config.send_timeout);

    let poller = Arc::new(Poller::new(
        transport,
        Arc::new(processor),
        Arc::clone(&db),
        audit,
        config.fetch_lookback,
    ));
    let mut handle = spawn_poller(Arc::clone(&poller), config.poll_interval);
    eprintln!("   Polling every {}s. Ctrl-C to stop.\n", config.poll_interval.as_secs());

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    tracing::info!("Shutdown requested, finishing the message in flight");
    poller.request_shutdown();
    match tokio::time::timeout(SHUTDOWN_GRACE, &mut handle).await {
        Ok(Ok(())) => tracing::info!("Poller stopped"),
        Ok(Err(e)) => tracing::error!(error = %e, "Poller task failed"),
        Err(_) => {
            tracing::warn!("Poller did not stop in time, aborting");
            handle.abort();
        }
    }

    Ok(())
}
