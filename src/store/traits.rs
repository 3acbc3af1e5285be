//! Unified `Store` trait — single async interface for all persistence.
//!
//! The ledger's insert-if-absent primitive lives here; it is the single
//! source of truth preventing duplicate opportunity creation when the queue
//! redelivers a job.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StoreError;
use crate::pipeline::types::{
    ClassificationResult, EntitySet, LedgerEntry, LedgerState, MatchResult, MessageKey,
    Opportunity, RawMessage, RecordOutcome, ReviewStatus,
};

/// A mailbox taken out of rotation, for operator inspection.
#[derive(Debug, Clone)]
pub struct DisabledMailbox {
    pub mailbox: String,
    pub reason: String,
    pub disabled_at: DateTime<Utc>,
}

/// Ledger population per state.
#[derive(Debug, Clone)]
pub struct LedgerStateCount {
    pub state: String,
    pub count: u64,
}

/// A job removed from the retry path, for operator inspection.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub id: String,
    pub mailbox: String,
    pub message_id: String,
    pub kind: String,
    pub reason: String,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
}

/// Backend-agnostic persistence trait covering the ledger, message
/// payloads, stage artifacts, leases, opportunities, and dead letters.
#[async_trait]
pub trait Store: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), StoreError>;

    // ── Cursors & mailbox state ─────────────────────────────────────

    /// Highest UID recorded for (mailbox, folder); 0 when never polled.
    async fn cursor(&self, mailbox: &str, folder: &str) -> Result<u32, StoreError>;

    /// Force the cursor to a specific UID (historical rescans).
    async fn set_cursor(&self, mailbox: &str, folder: &str, uid: u32) -> Result<(), StoreError>;

    async fn set_mailbox_disabled(&self, mailbox: &str, reason: &str) -> Result<(), StoreError>;

    async fn is_mailbox_disabled(&self, mailbox: &str) -> Result<bool, StoreError>;

    async fn disabled_mailboxes(&self) -> Result<Vec<DisabledMailbox>, StoreError>;

    // ── Ingestion ledger ────────────────────────────────────────────

    /// Insert-if-absent ledger write for a fetched message.
    ///
    /// Atomically (in one transaction): creates the ledger entry in state
    /// Fetched, stores the message payload, and advances the folder cursor
    /// to the message UID. Returns `Duplicate` — with the cursor still
    /// advanced — when the entry already exists; no other write happens.
    async fn record_fetched(&self, message: &RawMessage) -> Result<RecordOutcome, StoreError>;

    /// Ledger entry for a message that could not be parsed: created
    /// directly in state Failed, cursor advanced past it.
    async fn record_malformed(
        &self,
        mailbox: &str,
        folder: &str,
        uid: u32,
        message_id: &str,
        reason: &str,
    ) -> Result<(), StoreError>;

    async fn ledger_entry(&self, key: &MessageKey) -> Result<Option<LedgerEntry>, StoreError>;

    /// Monotonic state advance. Returns false (and writes nothing) when the
    /// entry is already at or past `to`, or terminal.
    async fn advance(
        &self,
        key: &MessageKey,
        to: LedgerState,
        outcome: Option<&str>,
    ) -> Result<bool, StoreError>;

    /// Transition to Failed with a reason, from any non-terminal state.
    async fn mark_failed(&self, key: &MessageKey, reason: &str) -> Result<bool, StoreError>;

    async fn is_terminal(&self, key: &MessageKey) -> Result<bool, StoreError>;

    /// Keys still in flight — used to re-enqueue work after a restart.
    async fn non_terminal_keys(&self) -> Result<Vec<MessageKey>, StoreError>;

    async fn ledger_summary(&self) -> Result<Vec<LedgerStateCount>, StoreError>;

    // ── Message payloads ────────────────────────────────────────────

    async fn message(&self, key: &MessageKey) -> Result<Option<RawMessage>, StoreError>;

    // ── Per-message leases ──────────────────────────────────────────

    /// Try to take the processing lease for a message. Succeeds when no
    /// lease exists, the existing lease expired, or the holder re-acquires
    /// its own lease. Exactly one holder can succeed at a time.
    async fn acquire_lease(
        &self,
        key: &MessageKey,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// Release a held lease. A foreign holder's release is a no-op.
    async fn release_lease(&self, key: &MessageKey, holder: &str) -> Result<(), StoreError>;

    // ── Stage artifacts ─────────────────────────────────────────────

    async fn save_classification(
        &self,
        key: &MessageKey,
        result: &ClassificationResult,
    ) -> Result<(), StoreError>;

    async fn classification(
        &self,
        key: &MessageKey,
    ) -> Result<Option<ClassificationResult>, StoreError>;

    async fn save_entities(&self, key: &MessageKey, entities: &EntitySet)
    -> Result<(), StoreError>;

    async fn entities(&self, key: &MessageKey) -> Result<Option<EntitySet>, StoreError>;

    async fn save_matches(
        &self,
        key: &MessageKey,
        matches: &[MatchResult],
        snapshot_version: &str,
    ) -> Result<(), StoreError>;

    async fn matches(&self, key: &MessageKey) -> Result<Option<Vec<MatchResult>>, StoreError>;

    // ── Opportunities ───────────────────────────────────────────────

    /// Insert-if-absent on the dedup key. `Duplicate` means an opportunity
    /// already exists inside the active dedup window; nothing is written.
    async fn insert_opportunity(
        &self,
        opportunity: &Opportunity,
    ) -> Result<RecordOutcome, StoreError>;

    async fn opportunity_for_message(
        &self,
        key: &MessageKey,
    ) -> Result<Option<Opportunity>, StoreError>;

    /// Flip the notification-sent flag after successful delivery.
    async fn mark_notified(&self, id: Uuid) -> Result<(), StoreError>;

    /// Alerted opportunities whose notification never went out — the
    /// crash-between-persist-and-notify detection query.
    async fn unnotified_alerts(&self) -> Result<Vec<Opportunity>, StoreError>;

    async fn list_opportunities(
        &self,
        status: Option<ReviewStatus>,
        limit: usize,
    ) -> Result<Vec<Opportunity>, StoreError>;

    async fn set_review_status(&self, id: Uuid, status: ReviewStatus) -> Result<(), StoreError>;

    // ── Dead letters ────────────────────────────────────────────────

    async fn record_dead_letter(
        &self,
        key: &MessageKey,
        kind: &str,
        reason: &str,
        attempts: u32,
    ) -> Result<(), StoreError>;

    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>, StoreError>;
}
