//! Mailbox connector — IMAP polling with cursor-based restart.
//!
//! The connector yields finite batches of messages with UIDs above the
//! persisted cursor. Transient failures retry with bounded exponential
//! backoff; authentication failures are fatal for the mailbox.

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tracing::warn;

use crate::config::MailboxConfig;
use crate::error::MailboxError;
use crate::pipeline::types::RawMessage;

mod imap;
pub mod sync;

pub use imap::strip_html;
pub use sync::{SyncReport, sync_mailbox};

/// One fetched item: either a parsed message or a malformed payload that
/// gets a Failed ledger entry and is skipped.
#[derive(Debug, Clone)]
pub enum FetchItem {
    Message(RawMessage),
    Malformed {
        uid: u32,
        message_id: String,
        reason: String,
    },
}

/// Result of a (possibly retried) fetch.
#[derive(Debug)]
pub struct FetchOutcome {
    pub items: Vec<FetchItem>,
    /// Transient failures absorbed before the successful attempt.
    pub retries: u32,
}

/// Mail retrieval seam. The IMAP implementation is the production path;
/// tests substitute stubs.
#[async_trait]
pub trait MailConnector: Send + Sync {
    /// Fetch messages with UID strictly greater than `since_uid`, in
    /// ascending UID order. Finite per call.
    async fn fetch_new(
        &self,
        config: &MailboxConfig,
        folder: &str,
        since_uid: u32,
    ) -> Result<Vec<FetchItem>, MailboxError>;

    /// Mark messages seen after they have been recorded in the ledger.
    async fn mark_seen(
        &self,
        config: &MailboxConfig,
        folder: &str,
        uids: &[u32],
    ) -> Result<(), MailboxError>;
}

/// Production IMAP connector. Blocking protocol work runs on the blocking
/// pool.
pub struct ImapConnector;

#[async_trait]
impl MailConnector for ImapConnector {
    async fn fetch_new(
        &self,
        config: &MailboxConfig,
        folder: &str,
        since_uid: u32,
    ) -> Result<Vec<FetchItem>, MailboxError> {
        let config = config.clone();
        let folder = folder.to_string();
        tokio::task::spawn_blocking(move || imap::fetch_since(&config, &folder, since_uid))
            .await
            .map_err(|e| MailboxError::Transient(format!("fetch task panicked: {e}")))?
    }

    async fn mark_seen(
        &self,
        config: &MailboxConfig,
        folder: &str,
        uids: &[u32],
    ) -> Result<(), MailboxError> {
        let config = config.clone();
        let folder = folder.to_string();
        let uids = uids.to_vec();
        tokio::task::spawn_blocking(move || imap::mark_seen(&config, &folder, &uids))
            .await
            .map_err(|e| MailboxError::Transient(format!("store task panicked: {e}")))?
    }
}

/// Bounded exponential backoff policy for connector-level retries.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base: Duration,
    pub cap: Duration,
    /// Total attempts, including the first.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(2),
            cap: Duration::from_secs(60),
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying after the given (1-based) failed attempt,
    /// with a little jitter to spread reconnect storms.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self.base.saturating_mul(1u32 << (attempt - 1).min(16));
        let capped = exp.min(self.cap);
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..250));
        capped + jitter
    }
}

/// Fetch with the connector, absorbing transient failures up to the policy
/// ceiling. Auth failures propagate immediately.
pub async fn fetch_with_retry(
    connector: &dyn MailConnector,
    config: &MailboxConfig,
    folder: &str,
    since_uid: u32,
    policy: &RetryPolicy,
) -> Result<FetchOutcome, MailboxError> {
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match connector.fetch_new(config, folder, since_uid).await {
            Ok(items) => {
                return Ok(FetchOutcome {
                    items,
                    retries: attempt - 1,
                });
            }
            Err(e) if e.is_transient() && attempt < policy.max_attempts => {
                let delay = policy.delay(attempt);
                warn!(
                    mailbox = %config.id,
                    folder = folder,
                    attempt = attempt,
                    "Transient fetch failure, retrying in {delay:?}: {e}"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) if e.is_transient() => {
                return Err(MailboxError::RetriesExhausted {
                    attempts: attempt,
                    last: e.to_string(),
                });
            }
            Err(e) => return Err(e),
        }
    }
}
