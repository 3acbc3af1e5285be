//! Operator surface — capability contracts over the running pipeline.
//!
//! No CLI syntax lives here; these are the operations an operator-facing
//! surface (CLI, API, dashboard) composes: storage init, historical
//! rescans, ledger/dead-letter inspection, opportunity review, and
//! notification retry.

use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;

use crate::alert::Notifier;
use crate::error::StoreError;
use crate::pipeline::types::{Opportunity, ReviewStatus};
use crate::scheduler::{Job, JobQueue};
use crate::store::{DeadLetter, DisabledMailbox, LedgerStateCount, Store};

/// Operator-facing handle over the store and queue.
pub struct OpsSurface {
    store: Arc<dyn Store>,
    queue: Arc<JobQueue>,
}

impl OpsSurface {
    pub fn new(store: Arc<dyn Store>, queue: Arc<JobQueue>) -> Self {
        Self { store, queue }
    }

    /// Initialize storage (idempotent).
    pub async fn init_storage(&self) -> Result<(), StoreError> {
        self.store.run_migrations().await
    }

    /// Re-run the pipeline over a historical range: move the folder cursor
    /// back to just before `from_uid` and trigger a poll. The ledger still
    /// dedups, so already-Completed messages are not reprocessed.
    pub async fn rescan_from(
        &self,
        mailbox: &str,
        folder: &str,
        from_uid: u32,
    ) -> Result<(), StoreError> {
        self.store
            .set_cursor(mailbox, folder, from_uid.saturating_sub(1))
            .await?;
        self.queue.enqueue(Job::Poll {
            mailbox: mailbox.to_string(),
        });
        info!(mailbox = %mailbox, folder = folder, from_uid, "Historical rescan triggered");
        Ok(())
    }

    /// Ledger population per state.
    pub async fn ledger_summary(&self) -> Result<Vec<LedgerStateCount>, StoreError> {
        self.store.ledger_summary().await
    }

    /// Jobs removed from the retry path.
    pub async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>, StoreError> {
        self.store.dead_letters(limit).await
    }

    /// Mailboxes taken out of rotation (auth failures).
    pub async fn disabled_mailboxes(&self) -> Result<Vec<DisabledMailbox>, StoreError> {
        self.store.disabled_mailboxes().await
    }

    /// Recorded opportunities, optionally filtered by review status.
    pub async fn opportunities(
        &self,
        status: Option<ReviewStatus>,
        limit: usize,
    ) -> Result<Vec<Opportunity>, StoreError> {
        self.store.list_opportunities(status, limit).await
    }

    /// Disposition an opportunity after review.
    pub async fn set_review_status(
        &self,
        id: Uuid,
        status: ReviewStatus,
    ) -> Result<(), StoreError> {
        self.store.set_review_status(id, status).await
    }

    /// Resend alerts whose notification never went out (crash between
    /// persist and notify). Returns how many were delivered.
    pub async fn retry_unnotified(
        &self,
        notifier: Arc<dyn Notifier>,
    ) -> Result<usize, StoreError> {
        let pending = self.store.unnotified_alerts().await?;
        let mut delivered = 0;
        for opportunity in pending {
            match notifier.notify(&opportunity).await {
                Ok(()) => {
                    self.store.mark_notified(opportunity.id).await?;
                    delivered += 1;
                }
                Err(e) => {
                    warn!(id = %opportunity.id, "Notification retry failed: {e}");
                }
            }
        }
        if delivered > 0 {
            info!(delivered, "Resent pending alert notifications");
        }
        Ok(delivered)
    }
}
