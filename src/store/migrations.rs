//! Version-tracked schema migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones sequentially.

use libsql::Connection;

use crate::error::StoreError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    name: "initial_schema",
    sql: r#"
        CREATE TABLE IF NOT EXISTS ledger (
            mailbox TEXT NOT NULL,
            message_id TEXT NOT NULL,
            folder TEXT NOT NULL DEFAULT 'INBOX',
            uid INTEGER NOT NULL DEFAULT 0,
            state TEXT NOT NULL DEFAULT 'fetched',
            outcome TEXT,
            failure_reason TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (mailbox, message_id)
        );
        CREATE INDEX IF NOT EXISTS idx_ledger_state ON ledger(state);

        CREATE TABLE IF NOT EXISTS messages (
            mailbox TEXT NOT NULL,
            message_id TEXT NOT NULL,
            folder TEXT NOT NULL,
            uid INTEGER NOT NULL,
            sender TEXT NOT NULL,
            subject TEXT NOT NULL,
            body TEXT NOT NULL,
            fetched_at TEXT NOT NULL,
            PRIMARY KEY (mailbox, message_id)
        );

        CREATE TABLE IF NOT EXISTS cursors (
            mailbox TEXT NOT NULL,
            folder TEXT NOT NULL,
            uid INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (mailbox, folder)
        );

        CREATE TABLE IF NOT EXISTS mailbox_state (
            mailbox TEXT PRIMARY KEY,
            disabled INTEGER NOT NULL DEFAULT 0,
            reason TEXT,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS leases (
            mailbox TEXT NOT NULL,
            message_id TEXT NOT NULL,
            holder TEXT NOT NULL,
            expires_at TEXT NOT NULL,
            PRIMARY KEY (mailbox, message_id)
        );

        CREATE TABLE IF NOT EXISTS classifications (
            mailbox TEXT NOT NULL,
            message_id TEXT NOT NULL,
            label TEXT NOT NULL,
            confidence REAL NOT NULL,
            model_version TEXT NOT NULL,
            created_at TEXT NOT NULL,
            PRIMARY KEY (mailbox, message_id)
        );

        CREATE TABLE IF NOT EXISTS entity_sets (
            mailbox TEXT NOT NULL,
            message_id TEXT NOT NULL,
            entities TEXT NOT NULL,
            created_at TEXT NOT NULL,
            PRIMARY KEY (mailbox, message_id)
        );

        CREATE TABLE IF NOT EXISTS match_sets (
            mailbox TEXT NOT NULL,
            message_id TEXT NOT NULL,
            matches TEXT NOT NULL,
            snapshot_version TEXT NOT NULL,
            created_at TEXT NOT NULL,
            PRIMARY KEY (mailbox, message_id)
        );

        CREATE TABLE IF NOT EXISTS opportunities (
            id TEXT PRIMARY KEY,
            mailbox TEXT NOT NULL,
            message_id TEXT NOT NULL,
            sender TEXT NOT NULL,
            subject TEXT NOT NULL,
            summary TEXT NOT NULL,
            label TEXT NOT NULL,
            classification_confidence REAL NOT NULL,
            composite_score REAL NOT NULL,
            headline TEXT NOT NULL,
            matches TEXT NOT NULL,
            decision TEXT NOT NULL,
            dedup_key TEXT NOT NULL UNIQUE,
            notified INTEGER NOT NULL DEFAULT 0,
            review_status TEXT NOT NULL DEFAULT 'pending_review',
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_opportunities_message
            ON opportunities(mailbox, message_id);
        CREATE INDEX IF NOT EXISTS idx_opportunities_review
            ON opportunities(review_status);
        CREATE INDEX IF NOT EXISTS idx_opportunities_notified
            ON opportunities(decision, notified);

        CREATE TABLE IF NOT EXISTS dead_letters (
            id TEXT PRIMARY KEY,
            mailbox TEXT NOT NULL,
            message_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            reason TEXT NOT NULL,
            attempts INTEGER NOT NULL,
            created_at TEXT NOT NULL
        );
    "#,
}];

/// Apply all migrations newer than the recorded version.
pub async fn run_migrations(conn: &Connection) -> Result<(), StoreError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| StoreError::Migration(format!("create _migrations: {e}")))?;

    let current = current_version(conn).await?;

    for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
        conn.execute_batch(migration.sql)
            .await
            .map_err(|e| StoreError::Migration(format!("{}: {e}", migration.name)))?;
        conn.execute(
            "INSERT INTO _migrations (version, name) VALUES (?1, ?2)",
            libsql::params![migration.version, migration.name],
        )
        .await
        .map_err(|e| StoreError::Migration(format!("record {}: {e}", migration.name)))?;
        tracing::info!(
            version = migration.version,
            name = migration.name,
            "Applied migration"
        );
    }

    Ok(())
}

async fn current_version(conn: &Connection) -> Result<i64, StoreError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| StoreError::Migration(e.to_string()))?;
    let row = rows
        .next()
        .await
        .map_err(|e| StoreError::Migration(e.to_string()))?;
    match row {
        Some(row) => row
            .get::<i64>(0)
            .map_err(|e| StoreError::Migration(e.to_string())),
        None => Ok(0),
    }
}
