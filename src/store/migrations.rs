//! Version-tracked database migrations for the libSQL backend.
//!
//! Steps are applied in version order; `_migrations` records what has run.

use libsql::Connection;

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// Append only. Never edit a shipped step.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "ledger_and_records",
        sql: r#"
            CREATE TABLE IF NOT EXISTS processed_messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                message_id TEXT NOT NULL,
                message_id_hash TEXT,
                thread_id TEXT,
                sender TEXT NOT NULL,
                subject TEXT NOT NULL,
                claim_reference TEXT,
                is_complaint INTEGER NOT NULL DEFAULT 0,
                is_follow_up INTEGER NOT NULL DEFAULT 0,
                processed_at TEXT NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_processed_message_id
                ON processed_messages(message_id);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_processed_message_id_hash
                ON processed_messages(message_id_hash) WHERE message_id_hash IS NOT NULL;
            CREATE UNIQUE INDEX IF NOT EXISTS idx_processed_thread_id
                ON processed_messages(thread_id) WHERE thread_id IS NOT NULL;
            CREATE INDEX IF NOT EXISTS idx_processed_claim_reference
                ON processed_messages(claim_reference);

            CREATE TABLE IF NOT EXISTS complaints (
                id TEXT PRIMARY KEY,
                claim_reference TEXT,
                vehicle_id TEXT,
                sender TEXT NOT NULL,
                subject TEXT NOT NULL,
                complaint_type TEXT NOT NULL,
                severity TEXT NOT NULL,
                detection TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_complaints_claim ON complaints(claim_reference);

            CREATE TABLE IF NOT EXISTS sla_tracking (
                id TEXT PRIMARY KEY,
                claim_reference TEXT NOT NULL,
                sender TEXT NOT NULL,
                insurer_domain TEXT NOT NULL,
                urgency TEXT NOT NULL,
                started_at TEXT NOT NULL,
                deadline TEXT NOT NULL,
                required_hours INTEGER NOT NULL,
                business_hours_only INTEGER NOT NULL,
                commitment TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'in_progress',
                updated_at TEXT NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_sla_active_claim
                ON sla_tracking(claim_reference) WHERE status = 'in_progress';
            CREATE INDEX IF NOT EXISTS idx_sla_deadline ON sla_tracking(status, deadline);

            CREATE TABLE IF NOT EXISTS follow_up_drafts (
                id TEXT PRIMARY KEY,
                claim_reference TEXT NOT NULL,
                intent TEXT NOT NULL,
                subject TEXT NOT NULL,
                body TEXT NOT NULL,
                used INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_drafts_used ON follow_up_drafts(used);
        "#,
    },
    Migration {
        version: 2,
        name: "cache_settings_audit",
        sql: r#"
            CREATE TABLE IF NOT EXISTS classification_cache (
                content_hash TEXT NOT NULL,
                classifier_version TEXT NOT NULL,
                kind TEXT NOT NULL,
                result TEXT NOT NULL,
                confidence REAL NOT NULL,
                hit_count INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                last_hit_at TEXT,
                PRIMARY KEY (content_hash, classifier_version, kind)
            );

            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS email_templates (
                name TEXT PRIMARY KEY,
                subject TEXT NOT NULL,
                body TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS audit_events (
                id TEXT PRIMARY KEY,
                branch TEXT NOT NULL,
                message_id TEXT,
                sender TEXT,
                claim_reference TEXT,
                confidence REAL,
                method TEXT,
                detail TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_audit_branch ON audit_events(branch);
            CREATE INDEX IF NOT EXISTS idx_audit_created ON audit_events(created_at);
        "#,
    },
];

/// Bring the schema up to date. Each pending step runs in its own
/// transaction together with its `_migrations` row, so a failed step leaves
/// nothing half-applied.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    let fail = |what: &str, e: libsql::Error| DatabaseError::Migration(format!("{what}: {e}"));

    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )
    .await
    .map_err(|e| fail("creating _migrations", e))?;

    let applied = applied_version(conn).await?;
    let pending: Vec<&Migration> = MIGRATIONS.iter().filter(|m| m.version > applied).collect();
    if pending.is_empty() {
        tracing::debug!(version = applied, "Schema up to date");
        return Ok(());
    }

    for step in pending {
        tracing::info!(version = step.version, name = step.name, "Applying migration");
        let batch = format!(
            "BEGIN;\n{}\nINSERT INTO _migrations (version, name) VALUES ({}, '{}');\nCOMMIT;",
            step.sql, step.version, step.name
        );
        if let Err(e) = conn.execute_batch(&batch).await {
            // The batch may have stopped between BEGIN and COMMIT.
            let _ = conn.execute("ROLLBACK", ()).await;
            return Err(fail(&format!("V{} {}", step.version, step.name), e));
        }
    }

    if tracing::enabled!(tracing::Level::INFO) {
        let version = applied_version(conn).await?;
        tracing::info!(version, "Schema migrated");
    }
    Ok(())
}

/// Highest recorded version, 0 on a fresh database.
async fn applied_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let read = |e: libsql::Error| DatabaseError::Migration(format!("reading schema version: {e}"));
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(read)?;
    match rows.next().await.map_err(read)? {
        Some(row) => row.get::<i64>(0).map_err(read),
        None => Ok(0),
    }
}
