//! Poll-job handler: fetch from the cursor, record in the ledger, enqueue
//! per-message jobs.
//!
//! Ordering matters: a message is marked `\Seen` only after its ledger
//! entry exists, and the cursor advance rides the ledger write, so a crash
//! anywhere in this sequence re-fetches instead of losing mail.

use tracing::{error, info, warn};

use crate::config::MailboxConfig;
use crate::error::{MailboxError, PipelineError};
use crate::mailbox::{FetchItem, MailConnector, RetryPolicy, fetch_with_retry};
use crate::pipeline::types::RecordOutcome;
use crate::scheduler::queue::{Job, JobQueue};
use crate::store::Store;

/// What one poll pass saw, for logging and tests.
#[derive(Debug, Default)]
pub struct SyncReport {
    pub fetched: usize,
    pub new: usize,
    pub duplicates: usize,
    pub malformed: usize,
    pub retries: u32,
}

/// Poll every folder of one mailbox and enqueue processing jobs for new
/// messages.
pub async fn sync_mailbox(
    connector: &dyn MailConnector,
    store: &dyn Store,
    queue: &JobQueue,
    config: &MailboxConfig,
    policy: &RetryPolicy,
) -> Result<SyncReport, PipelineError> {
    let mut report = SyncReport::default();

    for folder in &config.folders {
        let since = store.cursor(&config.id, folder).await.map_err(PipelineError::Store)?;

        let outcome = match fetch_with_retry(connector, config, folder, since, policy).await {
            Ok(outcome) => outcome,
            Err(MailboxError::Auth { mailbox }) => {
                // Fatal for the mailbox: disable it and surface to the
                // operator instead of retrying with bad credentials.
                error!(mailbox = %mailbox, "Authentication failed, disabling mailbox");
                store
                    .set_mailbox_disabled(&mailbox, "authentication failed")
                    .await
                    .map_err(PipelineError::Store)?;
                return Err(PipelineError::Sync(MailboxError::Auth { mailbox }));
            }
            Err(e) => return Err(PipelineError::Sync(e)),
        };

        report.retries += outcome.retries;

        let mut recorded_uids: Vec<u32> = Vec::new();
        for item in outcome.items {
            report.fetched += 1;
            match item {
                FetchItem::Message(raw) => {
                    let uid = raw.uid;
                    let key = raw.key();
                    match store
                        .record_fetched(&raw)
                        .await
                        .map_err(PipelineError::Store)?
                    {
                        RecordOutcome::New => {
                            report.new += 1;
                            queue.enqueue(Job::Process { key });
                        }
                        RecordOutcome::Duplicate => {
                            report.duplicates += 1;
                        }
                    }
                    recorded_uids.push(uid);
                }
                FetchItem::Malformed {
                    uid,
                    message_id,
                    reason,
                } => {
                    warn!(
                        mailbox = %config.id,
                        folder = folder,
                        uid = uid,
                        "Skipping malformed message: {reason}"
                    );
                    report.malformed += 1;
                    store
                        .record_malformed(&config.id, folder, uid, &message_id, &reason)
                        .await
                        .map_err(PipelineError::Store)?;
                    recorded_uids.push(uid);
                }
            }
        }

        if config.mark_seen && !recorded_uids.is_empty() {
            // Best-effort: dedup is owned by the ledger, so a failed \Seen
            // write only costs a duplicate fetch next poll.
            if let Err(e) = connector.mark_seen(config, folder, &recorded_uids).await {
                warn!(mailbox = %config.id, folder = folder, "Failed to mark seen: {e}");
            }
        }
    }

    if report.fetched > 0 {
        info!(
            mailbox = %config.id,
            fetched = report.fetched,
            new = report.new,
            duplicates = report.duplicates,
            malformed = report.malformed,
            "Mailbox sync complete"
        );
    }

    Ok(report)
}
