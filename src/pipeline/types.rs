//! Shared types for the message processing pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── Message identity ────────────────────────────────────────────────

/// The ledger key: one physical email in one mailbox.
///
/// The Message-ID header is globally unique in practice; pairing it with the
/// mailbox id makes the key unambiguous even for messages delivered to
/// several monitored mailboxes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageKey {
    pub mailbox: String,
    pub message_id: String,
}

impl MessageKey {
    pub fn new(mailbox: impl Into<String>, message_id: impl Into<String>) -> Self {
        Self {
            mailbox: mailbox.into(),
            message_id: message_id.into(),
        }
    }
}

impl std::fmt::Display for MessageKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.mailbox, self.message_id)
    }
}

// ── Raw message ─────────────────────────────────────────────────────

/// A fetched email, immutable after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawMessage {
    pub mailbox: String,
    pub folder: String,
    /// Mailbox-assigned UID; the polling cursor advances over these.
    pub uid: u32,
    /// Message-ID header, or a generated `gen-<uuid>` when absent.
    pub message_id: String,
    pub sender: String,
    pub subject: String,
    /// Plain text body; HTML-stripped when no text part exists.
    pub body: String,
    pub fetched_at: DateTime<Utc>,
}

impl RawMessage {
    pub fn key(&self) -> MessageKey {
        MessageKey::new(self.mailbox.clone(), self.message_id.clone())
    }
}

// ── Ledger ──────────────────────────────────────────────────────────

/// Processing state of a ledger entry. Advances monotonically forward or
/// jumps to Failed; Completed and Failed are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerState {
    Fetched,
    Classified,
    Extracted,
    Matched,
    Completed,
    Failed,
}

impl LedgerState {
    /// Ordering rank; a transition is only legal to a strictly higher rank.
    pub fn rank(self) -> u8 {
        match self {
            Self::Fetched => 0,
            Self::Classified => 1,
            Self::Extracted => 2,
            Self::Matched => 3,
            Self::Completed => 4,
            Self::Failed => 5,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fetched => "fetched",
            Self::Classified => "classified",
            Self::Extracted => "extracted",
            Self::Matched => "matched",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "fetched" => Some(Self::Fetched),
            "classified" => Some(Self::Classified),
            "extracted" => Some(Self::Extracted),
            "matched" => Some(Self::Matched),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// States a non-Failed transition may leave from to reach `self`.
    pub fn advanceable_from(self) -> Vec<LedgerState> {
        [
            Self::Fetched,
            Self::Classified,
            Self::Extracted,
            Self::Matched,
        ]
        .into_iter()
        .filter(|s| s.rank() < self.rank())
        .collect()
    }
}

impl std::fmt::Display for LedgerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of the ingestion ledger.
#[derive(Debug, Clone)]
pub struct LedgerEntry {
    pub key: MessageKey,
    pub folder: String,
    pub uid: u32,
    pub state: LedgerState,
    /// Terminal label ("alerted", "suppressed", "noise", "other").
    pub outcome: Option<String>,
    pub failure_reason: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Result of an insert-if-absent write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    New,
    Duplicate,
}

// ── Classification ──────────────────────────────────────────────────

/// Message intent category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentLabel {
    Opportunity,
    Noise,
    Other,
}

impl IntentLabel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Opportunity => "opportunity",
            Self::Noise => "noise",
            Self::Other => "other",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "opportunity" => Some(Self::Opportunity),
            "noise" => Some(Self::Noise),
            "other" => Some(Self::Other),
            _ => None,
        }
    }
}

/// Output of the classification stage; attached to exactly one message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub label: IntentLabel,
    /// Confidence in [0, 1].
    pub confidence: f64,
    pub model_version: String,
}

impl ClassificationResult {
    /// Whether the message proceeds to extraction.
    ///
    /// The threshold is inclusive on the opportunity side: confidence
    /// exactly at the noise threshold still counts as opportunity-like.
    pub fn is_opportunity_like(&self, noise_threshold: f64) -> bool {
        self.label == IntentLabel::Opportunity && self.confidence >= noise_threshold
    }

    /// Terminal outcome label for short-circuited messages.
    pub fn short_circuit_outcome(&self) -> &'static str {
        match self.label {
            IntentLabel::Noise | IntentLabel::Opportunity => "noise",
            IntentLabel::Other => "other",
        }
    }
}

// ── Entities ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Organization,
    Product,
    Quantity,
    Price,
    Contact,
}

/// A typed entity extracted from message text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub kind: EntityKind,
    /// Byte offsets of the source span in the message body.
    pub start: usize,
    pub end: usize,
    pub text: String,
    pub normalized: String,
    pub confidence: f64,
    /// Below the configured floor: still matched, excluded from headlines.
    pub low_confidence: bool,
}

/// Ordered entities for one message; may be empty.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntitySet {
    pub entities: Vec<Entity>,
}

impl EntitySet {
    pub fn new(entities: Vec<Entity>) -> Self {
        Self { entities }
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Product mentions, including low-confidence ones (the matcher sees
    /// everything).
    pub fn products(&self) -> impl Iterator<Item = (usize, &Entity)> {
        self.entities
            .iter()
            .enumerate()
            .filter(|(_, e)| e.kind == EntityKind::Product)
    }

    /// Entities eligible for the opportunity headline.
    pub fn headline(&self) -> impl Iterator<Item = &Entity> {
        self.entities.iter().filter(|e| !e.low_confidence)
    }
}

// ── Catalog matches ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchKind {
    Exact,
    Alias,
    Fuzzy,
}

/// One entity resolved against one catalog entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchResult {
    /// Index of the matched entity within its `EntitySet`.
    pub entity_index: usize,
    pub entry_id: String,
    pub entry_name: String,
    pub score: f64,
    pub kind: MatchKind,
    /// True when several entries tied within the ambiguity margin.
    pub ambiguous: bool,
    /// Catalog snapshot the match was computed against.
    pub snapshot_version: String,
}

// ── Opportunities ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertDecision {
    Alerted,
    Suppressed,
}

impl AlertDecision {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Alerted => "alerted",
            Self::Suppressed => "suppressed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "alerted" => Some(Self::Alerted),
            "suppressed" => Some(Self::Suppressed),
            _ => None,
        }
    }
}

/// Operator disposition of a recorded opportunity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    PendingReview,
    Approved,
    Discarded,
}

impl ReviewStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PendingReview => "pending_review",
            Self::Approved => "approved",
            Self::Discarded => "discarded",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending_review" => Some(Self::PendingReview),
            "approved" => Some(Self::Approved),
            "discarded" => Some(Self::Discarded),
            _ => None,
        }
    }
}

/// The terminal business-relevant record for an alert-worthy message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Opportunity {
    pub id: Uuid,
    pub mailbox: String,
    pub message_id: String,
    pub sender: String,
    pub subject: String,
    /// Human-readable one-liner for notifications and review lists.
    pub summary: String,
    pub label: IntentLabel,
    pub classification_confidence: f64,
    /// Headline entities (low-confidence ones excluded).
    pub headline_entities: Vec<Entity>,
    pub matches: Vec<MatchResult>,
    pub composite_score: f64,
    pub decision: AlertDecision,
    pub dedup_key: String,
    pub notified: bool,
    pub review_status: ReviewStatus,
    pub created_at: DateTime<Utc>,
}

impl Opportunity {
    pub fn key(&self) -> MessageKey {
        MessageKey::new(self.mailbox.clone(), self.message_id.clone())
    }
}

/// Derive the opportunity dedup key: normalized sender + top matched
/// catalog entry + time bucket.
///
/// The bucket index floors the message timestamp over the window so
/// repeated sends inside one window collapse to the same key.
pub fn dedup_key(
    sender: &str,
    top_entry_id: Option<&str>,
    received_at: DateTime<Utc>,
    window_secs: u64,
) -> String {
    let sender = normalize_sender(sender);
    let entry = top_entry_id.unwrap_or("-");
    let bucket = received_at.timestamp().div_euclid(window_secs as i64);
    format!("{sender}|{entry}|{bucket}")
}

/// Lowercase the address part, dropping any display name.
fn normalize_sender(sender: &str) -> String {
    let addr = sender
        .rsplit_once('<')
        .map(|(_, rest)| rest.trim_end_matches('>'))
        .unwrap_or(sender);
    addr.trim().to_lowercase()
}
