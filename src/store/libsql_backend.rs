//! libSQL backend — async `Store` implementation.
//!
//! Supports local file and in-memory databases. All datetimes are stored as
//! RFC 3339 text; lease expiries use a fixed-width UTC format so string
//! comparison orders chronologically.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::StoreError;
use crate::pipeline::types::{
    ClassificationResult, Entity, EntitySet, IntentLabel, LedgerEntry, LedgerState, MatchResult,
    MessageKey, Opportunity, RawMessage, RecordOutcome, ReviewStatus,
};
use crate::store::migrations;
use crate::store::traits::{DeadLetter, DisabledMailbox, LedgerStateCount, Store};

/// libSQL store.
///
/// Holds a single connection reused for all operations; `libsql::Connection`
/// is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Open(format!("create database directory: {e}")))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| StoreError::Open(e.to_string()))?;
        let conn = db
            .connect()
            .map_err(|e| StoreError::Open(e.to_string()))?;

        let store = Self {
            db: Arc::new(db),
            conn,
        };
        store.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, StoreError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| StoreError::Open(e.to_string()))?;
        let conn = db
            .connect()
            .map_err(|e| StoreError::Open(e.to_string()))?;

        let store = Self {
            db: Arc::new(db),
            conn,
        };
        store.run_migrations().await?;
        Ok(store)
    }
}

// ── Helper functions ────────────────────────────────────────────────

fn qerr(ctx: &str) -> impl Fn(libsql::Error) -> StoreError + '_ {
    move |e| StoreError::Query(format!("{ctx}: {e}"))
}

fn opt_text(value: Option<&str>) -> libsql::Value {
    match value {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

/// Fixed-width UTC timestamp; lexicographic order == chronological order.
fn lease_timestamp(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn row_to_raw_message(row: &libsql::Row) -> Result<RawMessage, StoreError> {
    let ser = |e: libsql::Error| StoreError::Serialization(e.to_string());
    Ok(RawMessage {
        mailbox: row.get::<String>(0).map_err(ser)?,
        message_id: row.get::<String>(1).map_err(ser)?,
        folder: row.get::<String>(2).map_err(ser)?,
        uid: row.get::<i64>(3).map_err(ser)? as u32,
        sender: row.get::<String>(4).map_err(ser)?,
        subject: row.get::<String>(5).map_err(ser)?,
        body: row.get::<String>(6).map_err(ser)?,
        fetched_at: parse_datetime(&row.get::<String>(7).map_err(ser)?),
    })
}

fn row_to_ledger_entry(row: &libsql::Row) -> Result<LedgerEntry, StoreError> {
    let ser = |e: libsql::Error| StoreError::Serialization(e.to_string());
    let state_str = row.get::<String>(4).map_err(ser)?;
    Ok(LedgerEntry {
        key: MessageKey::new(
            row.get::<String>(0).map_err(ser)?,
            row.get::<String>(1).map_err(ser)?,
        ),
        folder: row.get::<String>(2).map_err(ser)?,
        uid: row.get::<i64>(3).map_err(ser)? as u32,
        state: LedgerState::parse(&state_str).unwrap_or(LedgerState::Fetched),
        outcome: row.get::<String>(5).ok(),
        failure_reason: row.get::<String>(6).ok(),
        updated_at: parse_datetime(&row.get::<String>(7).map_err(ser)?),
    })
}

const OPP_COLUMNS: &str = "id, mailbox, message_id, sender, subject, summary, label, \
     classification_confidence, composite_score, headline, matches, decision, dedup_key, \
     notified, review_status, created_at";

fn row_to_opportunity(row: &libsql::Row) -> Result<Opportunity, StoreError> {
    let ser = |e: libsql::Error| StoreError::Serialization(e.to_string());

    let id_str = row.get::<String>(0).map_err(ser)?;
    let label_str = row.get::<String>(6).map_err(ser)?;
    let headline_json = row.get::<String>(9).map_err(ser)?;
    let matches_json = row.get::<String>(10).map_err(ser)?;
    let decision_str = row.get::<String>(11).map_err(ser)?;
    let review_str = row.get::<String>(14).map_err(ser)?;

    let headline: Vec<Entity> = serde_json::from_str(&headline_json).unwrap_or_default();
    let matches: Vec<MatchResult> = serde_json::from_str(&matches_json).unwrap_or_default();

    Ok(Opportunity {
        id: Uuid::parse_str(&id_str).unwrap_or_else(|_| Uuid::nil()),
        mailbox: row.get::<String>(1).map_err(ser)?,
        message_id: row.get::<String>(2).map_err(ser)?,
        sender: row.get::<String>(3).map_err(ser)?,
        subject: row.get::<String>(4).map_err(ser)?,
        summary: row.get::<String>(5).map_err(ser)?,
        label: IntentLabel::parse(&label_str).unwrap_or(IntentLabel::Other),
        classification_confidence: row.get::<f64>(7).map_err(ser)?,
        composite_score: row.get::<f64>(8).map_err(ser)?,
        headline_entities: headline,
        matches,
        decision: crate::pipeline::types::AlertDecision::parse(&decision_str)
            .unwrap_or(crate::pipeline::types::AlertDecision::Suppressed),
        dedup_key: row.get::<String>(12).map_err(ser)?,
        notified: row.get::<i64>(13).map_err(ser)? != 0,
        review_status: ReviewStatus::parse(&review_str).unwrap_or(ReviewStatus::PendingReview),
        created_at: parse_datetime(&row.get::<String>(15).map_err(ser)?),
    })
}

/// Bump a folder cursor forward (never backward).
async fn bump_cursor(
    conn: &Connection,
    mailbox: &str,
    folder: &str,
    uid: u32,
    now: &str,
) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO cursors (mailbox, folder, uid, updated_at) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(mailbox, folder) DO UPDATE
             SET uid = MAX(cursors.uid, excluded.uid), updated_at = excluded.updated_at",
        params![mailbox, folder, uid as i64, now],
    )
    .await
    .map_err(qerr("bump_cursor"))?;
    Ok(())
}

#[async_trait]
impl Store for LibSqlStore {
    async fn run_migrations(&self) -> Result<(), StoreError> {
        migrations::run_migrations(&self.conn).await
    }

    // ── Cursors & mailbox state ─────────────────────────────────────

    async fn cursor(&self, mailbox: &str, folder: &str) -> Result<u32, StoreError> {
        let mut rows = self
            .conn
            .query(
                "SELECT uid FROM cursors WHERE mailbox = ?1 AND folder = ?2",
                params![mailbox, folder],
            )
            .await
            .map_err(qerr("cursor"))?;
        match rows.next().await.map_err(qerr("cursor"))? {
            Some(row) => Ok(row
                .get::<i64>(0)
                .map_err(|e| StoreError::Serialization(e.to_string()))? as u32),
            None => Ok(0),
        }
    }

    async fn set_cursor(&self, mailbox: &str, folder: &str, uid: u32) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO cursors (mailbox, folder, uid, updated_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(mailbox, folder) DO UPDATE
                     SET uid = excluded.uid, updated_at = excluded.updated_at",
                params![mailbox, folder, uid as i64, now],
            )
            .await
            .map_err(qerr("set_cursor"))?;
        Ok(())
    }

    async fn set_mailbox_disabled(&self, mailbox: &str, reason: &str) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO mailbox_state (mailbox, disabled, reason, updated_at)
                 VALUES (?1, 1, ?2, ?3)
                 ON CONFLICT(mailbox) DO UPDATE
                     SET disabled = 1, reason = excluded.reason, updated_at = excluded.updated_at",
                params![mailbox, reason, now],
            )
            .await
            .map_err(qerr("set_mailbox_disabled"))?;
        Ok(())
    }

    async fn is_mailbox_disabled(&self, mailbox: &str) -> Result<bool, StoreError> {
        let mut rows = self
            .conn
            .query(
                "SELECT disabled FROM mailbox_state WHERE mailbox = ?1",
                params![mailbox],
            )
            .await
            .map_err(qerr("is_mailbox_disabled"))?;
        match rows.next().await.map_err(qerr("is_mailbox_disabled"))? {
            Some(row) => Ok(row.get::<i64>(0).unwrap_or(0) != 0),
            None => Ok(false),
        }
    }

    async fn disabled_mailboxes(&self) -> Result<Vec<DisabledMailbox>, StoreError> {
        let mut rows = self
            .conn
            .query(
                "SELECT mailbox, reason, updated_at FROM mailbox_state WHERE disabled = 1",
                (),
            )
            .await
            .map_err(qerr("disabled_mailboxes"))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await.map_err(qerr("disabled_mailboxes"))? {
            out.push(DisabledMailbox {
                mailbox: row
                    .get::<String>(0)
                    .map_err(|e| StoreError::Serialization(e.to_string()))?,
                reason: row.get::<String>(1).unwrap_or_default(),
                disabled_at: parse_datetime(
                    &row.get::<String>(2)
                        .map_err(|e| StoreError::Serialization(e.to_string()))?,
                ),
            });
        }
        Ok(out)
    }

    // ── Ingestion ledger ────────────────────────────────────────────

    async fn record_fetched(&self, message: &RawMessage) -> Result<RecordOutcome, StoreError> {
        let tx = self
            .conn
            .transaction()
            .await
            .map_err(qerr("record_fetched: begin"))?;
        let now = Utc::now().to_rfc3339();

        let inserted = tx
            .execute(
                "INSERT INTO ledger (mailbox, message_id, folder, uid, state, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, 'fetched', ?5, ?5)
                 ON CONFLICT(mailbox, message_id) DO NOTHING",
                params![
                    message.mailbox.as_str(),
                    message.message_id.as_str(),
                    message.folder.as_str(),
                    message.uid as i64,
                    now.as_str(),
                ],
            )
            .await
            .map_err(qerr("record_fetched: ledger"))?;

        if inserted > 0 {
            tx.execute(
                "INSERT INTO messages (mailbox, message_id, folder, uid, sender, subject, body, fetched_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(mailbox, message_id) DO NOTHING",
                params![
                    message.mailbox.as_str(),
                    message.message_id.as_str(),
                    message.folder.as_str(),
                    message.uid as i64,
                    message.sender.as_str(),
                    message.subject.as_str(),
                    message.body.as_str(),
                    message.fetched_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(qerr("record_fetched: message"))?;
        }

        // Cursor advance rides the same transaction as the ledger write, so
        // a crash between fetch and record re-fetches instead of losing mail.
        bump_cursor(&tx, &message.mailbox, &message.folder, message.uid, &now).await?;

        tx.commit()
            .await
            .map_err(qerr("record_fetched: commit"))?;

        let outcome = if inserted > 0 {
            RecordOutcome::New
        } else {
            RecordOutcome::Duplicate
        };
        debug!(key = %message.key(), ?outcome, "Ledger record");
        Ok(outcome)
    }

    async fn record_malformed(
        &self,
        mailbox: &str,
        folder: &str,
        uid: u32,
        message_id: &str,
        reason: &str,
    ) -> Result<(), StoreError> {
        let tx = self
            .conn
            .transaction()
            .await
            .map_err(qerr("record_malformed: begin"))?;
        let now = Utc::now().to_rfc3339();

        tx.execute(
            "INSERT INTO ledger (mailbox, message_id, folder, uid, state, failure_reason, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, 'failed', ?5, ?6, ?6)
             ON CONFLICT(mailbox, message_id) DO NOTHING",
            params![mailbox, message_id, folder, uid as i64, reason, now.as_str()],
        )
        .await
        .map_err(qerr("record_malformed: ledger"))?;

        bump_cursor(&tx, mailbox, folder, uid, &now).await?;

        tx.commit()
            .await
            .map_err(qerr("record_malformed: commit"))?;
        Ok(())
    }

    async fn ledger_entry(&self, key: &MessageKey) -> Result<Option<LedgerEntry>, StoreError> {
        let mut rows = self
            .conn
            .query(
                "SELECT mailbox, message_id, folder, uid, state, outcome, failure_reason, updated_at
                 FROM ledger WHERE mailbox = ?1 AND message_id = ?2",
                params![key.mailbox.as_str(), key.message_id.as_str()],
            )
            .await
            .map_err(qerr("ledger_entry"))?;
        match rows.next().await.map_err(qerr("ledger_entry"))? {
            Some(row) => Ok(Some(row_to_ledger_entry(&row)?)),
            None => Ok(None),
        }
    }

    async fn advance(
        &self,
        key: &MessageKey,
        to: LedgerState,
        outcome: Option<&str>,
    ) -> Result<bool, StoreError> {
        let allowed = to.advanceable_from();
        if allowed.is_empty() {
            return Err(StoreError::Constraint(format!(
                "cannot advance to {to}"
            )));
        }
        let in_list = allowed
            .iter()
            .map(|s| format!("'{}'", s.as_str()))
            .collect::<Vec<_>>()
            .join(", ");

        let now = Utc::now().to_rfc3339();
        let changed = self
            .conn
            .execute(
                &format!(
                    "UPDATE ledger SET state = ?1, outcome = COALESCE(?2, outcome), updated_at = ?3
                     WHERE mailbox = ?4 AND message_id = ?5 AND state IN ({in_list})"
                ),
                params![
                    to.as_str(),
                    opt_text(outcome),
                    now,
                    key.mailbox.as_str(),
                    key.message_id.as_str(),
                ],
            )
            .await
            .map_err(qerr("advance"))?;

        Ok(changed > 0)
    }

    async fn mark_failed(&self, key: &MessageKey, reason: &str) -> Result<bool, StoreError> {
        let now = Utc::now().to_rfc3339();
        let changed = self
            .conn
            .execute(
                "UPDATE ledger SET state = 'failed', failure_reason = ?1, updated_at = ?2
                 WHERE mailbox = ?3 AND message_id = ?4
                   AND state NOT IN ('completed', 'failed')",
                params![reason, now, key.mailbox.as_str(), key.message_id.as_str()],
            )
            .await
            .map_err(qerr("mark_failed"))?;
        Ok(changed > 0)
    }

    async fn is_terminal(&self, key: &MessageKey) -> Result<bool, StoreError> {
        Ok(self
            .ledger_entry(key)
            .await?
            .is_some_and(|e| e.state.is_terminal()))
    }

    async fn non_terminal_keys(&self) -> Result<Vec<MessageKey>, StoreError> {
        let mut rows = self
            .conn
            .query(
                "SELECT mailbox, message_id FROM ledger
                 WHERE state NOT IN ('completed', 'failed')
                 ORDER BY created_at ASC",
                (),
            )
            .await
            .map_err(qerr("non_terminal_keys"))?;
        let mut keys = Vec::new();
        while let Some(row) = rows.next().await.map_err(qerr("non_terminal_keys"))? {
            let ser = |e: libsql::Error| StoreError::Serialization(e.to_string());
            keys.push(MessageKey::new(
                row.get::<String>(0).map_err(ser)?,
                row.get::<String>(1).map_err(ser)?,
            ));
        }
        Ok(keys)
    }

    async fn ledger_summary(&self) -> Result<Vec<LedgerStateCount>, StoreError> {
        let mut rows = self
            .conn
            .query(
                "SELECT state, COUNT(*) FROM ledger GROUP BY state ORDER BY state",
                (),
            )
            .await
            .map_err(qerr("ledger_summary"))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await.map_err(qerr("ledger_summary"))? {
            let ser = |e: libsql::Error| StoreError::Serialization(e.to_string());
            out.push(LedgerStateCount {
                state: row.get::<String>(0).map_err(ser)?,
                count: row.get::<i64>(1).map_err(ser)? as u64,
            });
        }
        Ok(out)
    }

    // ── Message payloads ────────────────────────────────────────────

    async fn message(&self, key: &MessageKey) -> Result<Option<RawMessage>, StoreError> {
        let mut rows = self
            .conn
            .query(
                "SELECT mailbox, message_id, folder, uid, sender, subject, body, fetched_at
                 FROM messages WHERE mailbox = ?1 AND message_id = ?2",
                params![key.mailbox.as_str(), key.message_id.as_str()],
            )
            .await
            .map_err(qerr("message"))?;
        match rows.next().await.map_err(qerr("message"))? {
            Some(row) => Ok(Some(row_to_raw_message(&row)?)),
            None => Ok(None),
        }
    }

    // ── Per-message leases ──────────────────────────────────────────

    async fn acquire_lease(
        &self,
        key: &MessageKey,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let now = Utc::now();
        let expires = lease_timestamp(now + chrono::Duration::from_std(ttl).unwrap_or_default());
        let now = lease_timestamp(now);

        let changed = self
            .conn
            .execute(
                "INSERT INTO leases (mailbox, message_id, holder, expires_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(mailbox, message_id) DO UPDATE
                     SET holder = excluded.holder, expires_at = excluded.expires_at
                     WHERE leases.expires_at <= ?5 OR leases.holder = excluded.holder",
                params![
                    key.mailbox.as_str(),
                    key.message_id.as_str(),
                    holder,
                    expires,
                    now,
                ],
            )
            .await
            .map_err(qerr("acquire_lease"))?;

        Ok(changed > 0)
    }

    async fn release_lease(&self, key: &MessageKey, holder: &str) -> Result<(), StoreError> {
        self.conn
            .execute(
                "DELETE FROM leases WHERE mailbox = ?1 AND message_id = ?2 AND holder = ?3",
                params![key.mailbox.as_str(), key.message_id.as_str(), holder],
            )
            .await
            .map_err(qerr("release_lease"))?;
        Ok(())
    }

    // ── Stage artifacts ─────────────────────────────────────────────

    async fn save_classification(
        &self,
        key: &MessageKey,
        result: &ClassificationResult,
    ) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT OR REPLACE INTO classifications
                     (mailbox, message_id, label, confidence, model_version, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    key.mailbox.as_str(),
                    key.message_id.as_str(),
                    result.label.as_str(),
                    result.confidence,
                    result.model_version.as_str(),
                    now,
                ],
            )
            .await
            .map_err(qerr("save_classification"))?;
        Ok(())
    }

    async fn classification(
        &self,
        key: &MessageKey,
    ) -> Result<Option<ClassificationResult>, StoreError> {
        let mut rows = self
            .conn
            .query(
                "SELECT label, confidence, model_version FROM classifications
                 WHERE mailbox = ?1 AND message_id = ?2",
                params![key.mailbox.as_str(), key.message_id.as_str()],
            )
            .await
            .map_err(qerr("classification"))?;
        match rows.next().await.map_err(qerr("classification"))? {
            Some(row) => {
                let ser = |e: libsql::Error| StoreError::Serialization(e.to_string());
                let label_str = row.get::<String>(0).map_err(ser)?;
                Ok(Some(ClassificationResult {
                    label: IntentLabel::parse(&label_str).unwrap_or(IntentLabel::Other),
                    confidence: row.get::<f64>(1).map_err(ser)?,
                    model_version: row.get::<String>(2).map_err(ser)?,
                }))
            }
            None => Ok(None),
        }
    }

    async fn save_entities(
        &self,
        key: &MessageKey,
        entities: &EntitySet,
    ) -> Result<(), StoreError> {
        let json = serde_json::to_string(entities)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT OR REPLACE INTO entity_sets (mailbox, message_id, entities, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![key.mailbox.as_str(), key.message_id.as_str(), json, now],
            )
            .await
            .map_err(qerr("save_entities"))?;
        Ok(())
    }

    async fn entities(&self, key: &MessageKey) -> Result<Option<EntitySet>, StoreError> {
        let mut rows = self
            .conn
            .query(
                "SELECT entities FROM entity_sets WHERE mailbox = ?1 AND message_id = ?2",
                params![key.mailbox.as_str(), key.message_id.as_str()],
            )
            .await
            .map_err(qerr("entities"))?;
        match rows.next().await.map_err(qerr("entities"))? {
            Some(row) => {
                let json = row
                    .get::<String>(0)
                    .map_err(|e| StoreError::Serialization(e.to_string()))?;
                serde_json::from_str(&json)
                    .map(Some)
                    .map_err(|e| StoreError::Serialization(e.to_string()))
            }
            None => Ok(None),
        }
    }

    async fn save_matches(
        &self,
        key: &MessageKey,
        matches: &[MatchResult],
        snapshot_version: &str,
    ) -> Result<(), StoreError> {
        let json = serde_json::to_string(matches)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT OR REPLACE INTO match_sets
                     (mailbox, message_id, matches, snapshot_version, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    key.mailbox.as_str(),
                    key.message_id.as_str(),
                    json,
                    snapshot_version,
                    now,
                ],
            )
            .await
            .map_err(qerr("save_matches"))?;
        Ok(())
    }

    async fn matches(&self, key: &MessageKey) -> Result<Option<Vec<MatchResult>>, StoreError> {
        let mut rows = self
            .conn
            .query(
                "SELECT matches FROM match_sets WHERE mailbox = ?1 AND message_id = ?2",
                params![key.mailbox.as_str(), key.message_id.as_str()],
            )
            .await
            .map_err(qerr("matches"))?;
        match rows.next().await.map_err(qerr("matches"))? {
            Some(row) => {
                let json = row
                    .get::<String>(0)
                    .map_err(|e| StoreError::Serialization(e.to_string()))?;
                serde_json::from_str(&json)
                    .map(Some)
                    .map_err(|e| StoreError::Serialization(e.to_string()))
            }
            None => Ok(None),
        }
    }

    // ── Opportunities ───────────────────────────────────────────────

    async fn insert_opportunity(
        &self,
        opportunity: &Opportunity,
    ) -> Result<RecordOutcome, StoreError> {
        let headline = serde_json::to_string(&opportunity.headline_entities)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let matches = serde_json::to_string(&opportunity.matches)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let changed = self
            .conn
            .execute(
                "INSERT INTO opportunities (id, mailbox, message_id, sender, subject, summary, \
                     label, classification_confidence, composite_score, headline, matches, \
                     decision, dedup_key, notified, review_status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
                 ON CONFLICT(dedup_key) DO NOTHING",
                params![
                    opportunity.id.to_string(),
                    opportunity.mailbox.as_str(),
                    opportunity.message_id.as_str(),
                    opportunity.sender.as_str(),
                    opportunity.subject.as_str(),
                    opportunity.summary.as_str(),
                    opportunity.label.as_str(),
                    opportunity.classification_confidence,
                    opportunity.composite_score,
                    headline,
                    matches,
                    opportunity.decision.as_str(),
                    opportunity.dedup_key.as_str(),
                    opportunity.notified as i64,
                    opportunity.review_status.as_str(),
                    opportunity.created_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(qerr("insert_opportunity"))?;

        Ok(if changed > 0 {
            RecordOutcome::New
        } else {
            RecordOutcome::Duplicate
        })
    }

    async fn opportunity_for_message(
        &self,
        key: &MessageKey,
    ) -> Result<Option<Opportunity>, StoreError> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {OPP_COLUMNS} FROM opportunities
                     WHERE mailbox = ?1 AND message_id = ?2"
                ),
                params![key.mailbox.as_str(), key.message_id.as_str()],
            )
            .await
            .map_err(qerr("opportunity_for_message"))?;
        match rows.next().await.map_err(qerr("opportunity_for_message"))? {
            Some(row) => Ok(Some(row_to_opportunity(&row)?)),
            None => Ok(None),
        }
    }

    async fn mark_notified(&self, id: Uuid) -> Result<(), StoreError> {
        self.conn
            .execute(
                "UPDATE opportunities SET notified = 1 WHERE id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(qerr("mark_notified"))?;
        Ok(())
    }

    async fn unnotified_alerts(&self) -> Result<Vec<Opportunity>, StoreError> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {OPP_COLUMNS} FROM opportunities
                     WHERE decision = 'alerted' AND notified = 0
                     ORDER BY created_at ASC"
                ),
                (),
            )
            .await
            .map_err(qerr("unnotified_alerts"))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await.map_err(qerr("unnotified_alerts"))? {
            out.push(row_to_opportunity(&row)?);
        }
        Ok(out)
    }

    async fn list_opportunities(
        &self,
        status: Option<ReviewStatus>,
        limit: usize,
    ) -> Result<Vec<Opportunity>, StoreError> {
        let mut out = Vec::new();
        match status {
            Some(status) => {
                let mut rows = self
                    .conn
                    .query(
                        &format!(
                            "SELECT {OPP_COLUMNS} FROM opportunities
                             WHERE review_status = ?1
                             ORDER BY created_at DESC LIMIT ?2"
                        ),
                        params![status.as_str(), limit as i64],
                    )
                    .await
                    .map_err(qerr("list_opportunities"))?;
                while let Some(row) = rows.next().await.map_err(qerr("list_opportunities"))? {
                    out.push(row_to_opportunity(&row)?);
                }
            }
            None => {
                let mut rows = self
                    .conn
                    .query(
                        &format!(
                            "SELECT {OPP_COLUMNS} FROM opportunities
                             ORDER BY created_at DESC LIMIT ?1"
                        ),
                        params![limit as i64],
                    )
                    .await
                    .map_err(qerr("list_opportunities"))?;
                while let Some(row) = rows.next().await.map_err(qerr("list_opportunities"))? {
                    out.push(row_to_opportunity(&row)?);
                }
            }
        }
        Ok(out)
    }

    async fn set_review_status(&self, id: Uuid, status: ReviewStatus) -> Result<(), StoreError> {
        let changed = self
            .conn
            .execute(
                "UPDATE opportunities SET review_status = ?1 WHERE id = ?2",
                params![status.as_str(), id.to_string()],
            )
            .await
            .map_err(qerr("set_review_status"))?;
        if changed == 0 {
            return Err(StoreError::NotFound {
                entity: "opportunity".into(),
                key: id.to_string(),
            });
        }
        Ok(())
    }

    // ── Dead letters ────────────────────────────────────────────────

    async fn record_dead_letter(
        &self,
        key: &MessageKey,
        kind: &str,
        reason: &str,
        attempts: u32,
    ) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO dead_letters (id, mailbox, message_id, kind, reason, attempts, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    Uuid::new_v4().to_string(),
                    key.mailbox.as_str(),
                    key.message_id.as_str(),
                    kind,
                    reason,
                    attempts as i64,
                    now,
                ],
            )
            .await
            .map_err(qerr("record_dead_letter"))?;
        Ok(())
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>, StoreError> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, mailbox, message_id, kind, reason, attempts, created_at
                 FROM dead_letters ORDER BY created_at DESC LIMIT ?1",
                params![limit as i64],
            )
            .await
            .map_err(qerr("dead_letters"))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await.map_err(qerr("dead_letters"))? {
            let ser = |e: libsql::Error| StoreError::Serialization(e.to_string());
            out.push(DeadLetter {
                id: row.get::<String>(0).map_err(ser)?,
                mailbox: row.get::<String>(1).map_err(ser)?,
                message_id: row.get::<String>(2).map_err(ser)?,
                kind: row.get::<String>(3).map_err(ser)?,
                reason: row.get::<String>(4).map_err(ser)?,
                attempts: row.get::<i64>(5).map_err(ser)? as u32,
                created_at: parse_datetime(&row.get::<String>(6).map_err(ser)?),
            });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn raw_message(message_id: &str, uid: u32) -> RawMessage {
        RawMessage {
            mailbox: "sales".into(),
            folder: "INBOX".into(),
            uid,
            message_id: message_id.into(),
            sender: "buyer@example.com".into(),
            subject: "Quotation request".into(),
            body: "need 500 units of WidgetPro".into(),
            fetched_at: Utc::now(),
        }
    }

    fn opportunity(dedup_key: &str) -> Opportunity {
        Opportunity {
            id: Uuid::new_v4(),
            mailbox: "sales".into(),
            message_id: "m-1".into(),
            sender: "buyer@example.com".into(),
            subject: "Quotation request".into(),
            summary: "Opportunity from buyer@example.com".into(),
            label: IntentLabel::Opportunity,
            classification_confidence: 0.95,
            headline_entities: Vec::new(),
            matches: Vec::new(),
            composite_score: 0.92,
            decision: crate::pipeline::types::AlertDecision::Alerted,
            dedup_key: dedup_key.into(),
            notified: false,
            review_status: ReviewStatus::PendingReview,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn record_fetched_is_insert_if_absent() {
        let store = LibSqlStore::new_memory().await.unwrap();
        let msg = raw_message("m-1", 10);

        assert_eq!(store.record_fetched(&msg).await.unwrap(), RecordOutcome::New);
        assert_eq!(
            store.record_fetched(&msg).await.unwrap(),
            RecordOutcome::Duplicate
        );

        // Payload stored once, cursor advanced.
        assert!(store.message(&msg.key()).await.unwrap().is_some());
        assert_eq!(store.cursor("sales", "INBOX").await.unwrap(), 10);
    }

    #[tokio::test]
    async fn cursor_never_moves_backward_on_record() {
        let store = LibSqlStore::new_memory().await.unwrap();
        store.record_fetched(&raw_message("m-2", 20)).await.unwrap();
        store.record_fetched(&raw_message("m-1", 10)).await.unwrap();
        assert_eq!(store.cursor("sales", "INBOX").await.unwrap(), 20);

        // Forced set (historical rescan) can move it back.
        store.set_cursor("sales", "INBOX", 5).await.unwrap();
        assert_eq!(store.cursor("sales", "INBOX").await.unwrap(), 5);
    }

    #[tokio::test]
    async fn ledger_advances_monotonically() {
        let store = LibSqlStore::new_memory().await.unwrap();
        let msg = raw_message("m-1", 1);
        let key = msg.key();
        store.record_fetched(&msg).await.unwrap();

        assert!(store.advance(&key, LedgerState::Classified, None).await.unwrap());
        assert!(store.advance(&key, LedgerState::Extracted, None).await.unwrap());
        // Regression attempt is a no-op.
        assert!(!store.advance(&key, LedgerState::Classified, None).await.unwrap());

        assert!(
            store
                .advance(&key, LedgerState::Completed, Some("alerted"))
                .await
                .unwrap()
        );
        assert!(store.is_terminal(&key).await.unwrap());
        // Completed entries never move again.
        assert!(!store.advance(&key, LedgerState::Completed, None).await.unwrap());
        assert!(!store.mark_failed(&key, "late failure").await.unwrap());

        let entry = store.ledger_entry(&key).await.unwrap().unwrap();
        assert_eq!(entry.state, LedgerState::Completed);
        assert_eq!(entry.outcome.as_deref(), Some("alerted"));
    }

    #[tokio::test]
    async fn mark_failed_records_reason() {
        let store = LibSqlStore::new_memory().await.unwrap();
        let msg = raw_message("m-1", 1);
        let key = msg.key();
        store.record_fetched(&msg).await.unwrap();

        assert!(store.mark_failed(&key, "classification-unavailable").await.unwrap());
        let entry = store.ledger_entry(&key).await.unwrap().unwrap();
        assert_eq!(entry.state, LedgerState::Failed);
        assert_eq!(
            entry.failure_reason.as_deref(),
            Some("classification-unavailable")
        );
        assert!(store.is_terminal(&key).await.unwrap());
    }

    #[tokio::test]
    async fn record_malformed_creates_failed_entry_and_advances_cursor() {
        let store = LibSqlStore::new_memory().await.unwrap();
        store
            .record_malformed("sales", "INBOX", 7, "malformed-INBOX-7", "unparseable")
            .await
            .unwrap();

        let key = MessageKey::new("sales", "malformed-INBOX-7");
        let entry = store.ledger_entry(&key).await.unwrap().unwrap();
        assert_eq!(entry.state, LedgerState::Failed);
        assert_eq!(store.cursor("sales", "INBOX").await.unwrap(), 7);
    }

    #[tokio::test]
    async fn lease_is_exclusive_until_expiry() {
        let store = LibSqlStore::new_memory().await.unwrap();
        let key = MessageKey::new("sales", "m-1");
        let ttl = Duration::from_secs(60);

        assert!(store.acquire_lease(&key, "worker-1", ttl).await.unwrap());
        // Another worker cannot steal a live lease.
        assert!(!store.acquire_lease(&key, "worker-2", ttl).await.unwrap());
        // The holder can re-acquire (extend) its own lease.
        assert!(store.acquire_lease(&key, "worker-1", ttl).await.unwrap());

        store.release_lease(&key, "worker-1").await.unwrap();
        assert!(store.acquire_lease(&key, "worker-2", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn expired_lease_can_be_stolen() {
        let store = LibSqlStore::new_memory().await.unwrap();
        let key = MessageKey::new("sales", "m-1");

        assert!(
            store
                .acquire_lease(&key, "worker-1", Duration::ZERO)
                .await
                .unwrap()
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(
            store
                .acquire_lease(&key, "worker-2", Duration::from_secs(60))
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn foreign_release_is_a_noop() {
        let store = LibSqlStore::new_memory().await.unwrap();
        let key = MessageKey::new("sales", "m-1");
        let ttl = Duration::from_secs(60);

        assert!(store.acquire_lease(&key, "worker-1", ttl).await.unwrap());
        store.release_lease(&key, "worker-2").await.unwrap();
        // Still held by worker-1.
        assert!(!store.acquire_lease(&key, "worker-3", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn stage_artifacts_roundtrip() {
        let store = LibSqlStore::new_memory().await.unwrap();
        let key = MessageKey::new("sales", "m-1");

        let clf = ClassificationResult {
            label: IntentLabel::Opportunity,
            confidence: 0.91,
            model_version: "lexical-v1".into(),
        };
        store.save_classification(&key, &clf).await.unwrap();
        let loaded = store.classification(&key).await.unwrap().unwrap();
        assert_eq!(loaded.label, IntentLabel::Opportunity);
        assert_eq!(loaded.confidence, 0.91);

        let entities = EntitySet::new(vec![Entity {
            kind: crate::pipeline::types::EntityKind::Product,
            start: 0,
            end: 9,
            text: "WidgetPro".into(),
            normalized: "widgetpro".into(),
            confidence: 0.85,
            low_confidence: false,
        }]);
        store.save_entities(&key, &entities).await.unwrap();
        let loaded = store.entities(&key).await.unwrap().unwrap();
        assert_eq!(loaded.entities.len(), 1);

        let matches = vec![MatchResult {
            entity_index: 0,
            entry_id: "sku-100".into(),
            entry_name: "WidgetPro X1".into(),
            score: 1.0,
            kind: crate::pipeline::types::MatchKind::Alias,
            ambiguous: false,
            snapshot_version: "vabc".into(),
        }];
        store.save_matches(&key, &matches, "vabc").await.unwrap();
        let loaded = store.matches(&key).await.unwrap().unwrap();
        assert_eq!(loaded[0].entry_id, "sku-100");
    }

    #[tokio::test]
    async fn opportunity_dedup_key_is_unique() {
        let store = LibSqlStore::new_memory().await.unwrap();

        let first = opportunity("buyer|sku-100|123");
        assert_eq!(
            store.insert_opportunity(&first).await.unwrap(),
            RecordOutcome::New
        );

        let second = opportunity("buyer|sku-100|123");
        assert_eq!(
            store.insert_opportunity(&second).await.unwrap(),
            RecordOutcome::Duplicate
        );

        let listed = store.list_opportunities(None, 10).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, first.id);
    }

    #[tokio::test]
    async fn unnotified_alerts_detects_crash_window() {
        let store = LibSqlStore::new_memory().await.unwrap();
        let opp = opportunity("k-1");
        store.insert_opportunity(&opp).await.unwrap();

        let pending = store.unnotified_alerts().await.unwrap();
        assert_eq!(pending.len(), 1);

        store.mark_notified(opp.id).await.unwrap();
        assert!(store.unnotified_alerts().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn review_status_updates() {
        let store = LibSqlStore::new_memory().await.unwrap();
        let opp = opportunity("k-1");
        store.insert_opportunity(&opp).await.unwrap();

        store
            .set_review_status(opp.id, ReviewStatus::Approved)
            .await
            .unwrap();
        let listed = store
            .list_opportunities(Some(ReviewStatus::Approved), 10)
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);

        let missing = store
            .set_review_status(Uuid::new_v4(), ReviewStatus::Discarded)
            .await;
        assert!(matches!(missing, Err(StoreError::NotFound { .. })));
    }

    #[tokio::test]
    async fn non_terminal_keys_skips_completed_and_failed() {
        let store = LibSqlStore::new_memory().await.unwrap();
        for (id, uid) in [("m-1", 1), ("m-2", 2), ("m-3", 3)] {
            store.record_fetched(&raw_message(id, uid)).await.unwrap();
        }
        store
            .advance(&MessageKey::new("sales", "m-1"), LedgerState::Completed, Some("noise"))
            .await
            .unwrap();
        store
            .mark_failed(&MessageKey::new("sales", "m-2"), "boom")
            .await
            .unwrap();

        let keys = store.non_terminal_keys().await.unwrap();
        assert_eq!(keys, vec![MessageKey::new("sales", "m-3")]);
    }

    #[tokio::test]
    async fn dead_letters_and_summary() {
        let store = LibSqlStore::new_memory().await.unwrap();
        let key = MessageKey::new("sales", "m-1");
        store.record_fetched(&raw_message("m-1", 1)).await.unwrap();
        store
            .record_dead_letter(&key, "process", "classification-unavailable", 4)
            .await
            .unwrap();

        let letters = store.dead_letters(10).await.unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].attempts, 4);

        let summary = store.ledger_summary().await.unwrap();
        assert_eq!(summary.len(), 1);
        assert_eq!(summary[0].state, "fetched");
        assert_eq!(summary[0].count, 1);
    }

    #[tokio::test]
    async fn mailbox_disable_surfaces_to_operator() {
        let store = LibSqlStore::new_memory().await.unwrap();
        assert!(!store.is_mailbox_disabled("sales").await.unwrap());

        store
            .set_mailbox_disabled("sales", "authentication failed")
            .await
            .unwrap();
        assert!(store.is_mailbox_disabled("sales").await.unwrap());

        let disabled = store.disabled_mailboxes().await.unwrap();
        assert_eq!(disabled.len(), 1);
        assert_eq!(disabled[0].reason, "authentication failed");
    }
}
