//! Error types for leadwatch.

use std::time::Duration;

/// Top-level error type for the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Mailbox error: {0}")]
    Mailbox(#[from] MailboxError),

    #[error("Inference error: {0}")]
    Inference(#[from] InferenceError),

    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("Notification error: {0}")]
    Notify(#[from] NotifyError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
}

/// How a failure should be handled by the job queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Retry with backoff up to the configured ceiling.
    Transient,
    /// No retry — dead-letter the job and mark the ledger entry Failed.
    Permanent,
    /// No retry and the owning mailbox is taken out of rotation.
    Fatal,
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read configuration file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration: {0}")]
    Parse(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },
}

/// Persistence-layer errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Failed to open database: {0}")]
    Open(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with key {key}")]
    NotFound { entity: String, key: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Mailbox connector errors.
#[derive(Debug, thiserror::Error)]
pub enum MailboxError {
    #[error("Transient mailbox failure: {0}")]
    Transient(String),

    #[error("Authentication failed for mailbox {mailbox}")]
    Auth { mailbox: String },

    #[error("Protocol error talking to {host}: {reason}")]
    Protocol { host: String, reason: String },

    #[error("Fetch retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },
}

impl MailboxError {
    /// Whether another attempt may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Protocol { .. })
    }
}

/// Inference backend errors.
#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    #[error("Inference backend {backend} unavailable: {reason}")]
    Unavailable { backend: String, reason: String },

    #[error("Inference backend {backend} timed out after {timeout:?}")]
    Timeout { backend: String, timeout: Duration },

    #[error("Invalid response from {backend}: {reason}")]
    InvalidResponse { backend: String, reason: String },
}

impl InferenceError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable { .. } | Self::Timeout { .. })
    }
}

/// Catalog source errors.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("Failed to read catalog {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse catalog: {0}")]
    Parse(String),
}

/// Notification delivery errors.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("Failed to build notification: {0}")]
    Build(String),

    #[error("Failed to send notification via {channel}: {reason}")]
    Send { channel: String, reason: String },
}

/// Errors surfaced by the per-message pipeline, tagged by stage so the
/// worker can record the right ledger reason.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Mailbox sync failed: {0}")]
    Sync(#[from] MailboxError),

    #[error("Store failure: {0}")]
    Store(#[from] StoreError),

    #[error("Classification failed: {0}")]
    Classification(InferenceError),

    #[error("Entity extraction failed: {0}")]
    Extraction(InferenceError),

    #[error("Message payload missing for {key}")]
    MissingPayload { key: String },

    #[error("Ledger entry missing for {key}")]
    MissingLedgerEntry { key: String },
}

impl PipelineError {
    /// Classify the failure for the queue's retry decision.
    pub fn severity(&self) -> Severity {
        match self {
            Self::Sync(MailboxError::Auth { .. }) => Severity::Fatal,
            Self::Sync(_) => Severity::Transient,
            // Store failures are retried; a persistently failing store hits
            // the retry ceiling and dead-letters like any other transient.
            Self::Store(_) => Severity::Transient,
            Self::Classification(e) | Self::Extraction(e) => {
                if e.is_transient() {
                    Severity::Transient
                } else {
                    Severity::Permanent
                }
            }
            Self::MissingPayload { .. } | Self::MissingLedgerEntry { .. } => Severity::Permanent,
        }
    }

    /// Short reason string recorded on the Failed ledger entry.
    pub fn ledger_reason(&self) -> &'static str {
        match self {
            Self::Sync(MailboxError::Auth { .. }) => "mailbox-auth-failed",
            Self::Sync(_) => "mailbox-unreachable",
            Self::Store(_) => "storage-failure",
            Self::Classification(_) => "classification-unavailable",
            Self::Extraction(_) => "extraction-unavailable",
            Self::MissingPayload { .. } => "missing-payload",
            Self::MissingLedgerEntry { .. } => "missing-ledger-entry",
        }
    }
}

/// Result type alias for the pipeline.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_failure_is_fatal() {
        let err = PipelineError::Sync(MailboxError::Auth {
            mailbox: "sales".into(),
        });
        assert_eq!(err.severity(), Severity::Fatal);
        assert_eq!(err.ledger_reason(), "mailbox-auth-failed");
    }

    #[test]
    fn model_unavailability_is_transient_with_stage_reason() {
        let err = PipelineError::Classification(InferenceError::Unavailable {
            backend: "remote".into(),
            reason: "connection refused".into(),
        });
        assert_eq!(err.severity(), Severity::Transient);
        assert_eq!(err.ledger_reason(), "classification-unavailable");
    }

    #[test]
    fn invalid_model_response_is_permanent() {
        let err = PipelineError::Extraction(InferenceError::InvalidResponse {
            backend: "remote".into(),
            reason: "unknown label".into(),
        });
        assert_eq!(err.severity(), Severity::Permanent);
        assert_eq!(err.ledger_reason(), "extraction-unavailable");
    }

    #[test]
    fn store_failures_are_retried() {
        let err = PipelineError::Store(StoreError::Query("disk I/O error".into()));
        assert_eq!(err.severity(), Severity::Transient);
        assert_eq!(err.ledger_reason(), "storage-failure");
    }
}
