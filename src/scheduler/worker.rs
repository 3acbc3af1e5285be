//! Worker pool — consumes jobs and applies the retry/dead-letter policy.
//!
//! Workers run jobs to completion one at a time; idempotency lives in the
//! ledger and the dedup key, never here.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{MailboxConfig, QueueConfig};
use crate::error::{PipelineError, Severity};
use crate::mailbox::{MailConnector, RetryPolicy, sync_mailbox};
use crate::pipeline::MessageProcessor;
use crate::pipeline::types::MessageKey;
use crate::scheduler::queue::{Job, JobQueue, QueuedJob, backoff_delay};
use crate::store::Store;

/// Everything a worker needs, shared across the pool.
pub struct WorkerDeps {
    pub store: Arc<dyn Store>,
    pub connector: Arc<dyn MailConnector>,
    pub processor: Arc<MessageProcessor>,
    pub queue: Arc<JobQueue>,
    pub mailboxes: HashMap<String, MailboxConfig>,
    pub fetch_retry: RetryPolicy,
    pub queue_config: QueueConfig,
}

/// Handle over the spawned worker tasks.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl WorkerPool {
    /// Spawn the configured number of workers.
    pub fn spawn(deps: Arc<WorkerDeps>) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut handles = Vec::with_capacity(deps.queue_config.workers);

        for id in 0..deps.queue_config.workers {
            let deps = Arc::clone(&deps);
            let shutdown = Arc::clone(&shutdown);
            handles.push(tokio::spawn(run_worker(id, deps, shutdown)));
        }
        info!(workers = handles.len(), "Worker pool started");

        Self { handles, shutdown }
    }

    /// Signal shutdown and wait for in-flight jobs to finish.
    pub async fn shutdown(self) {
        self.shutdown.store(true, Ordering::Relaxed);
        futures::future::join_all(self.handles).await;
        info!("Worker pool stopped");
    }
}

async fn run_worker(id: usize, deps: Arc<WorkerDeps>, shutdown: Arc<AtomicBool>) {
    // Unique per worker instance so lease ownership is unambiguous.
    let holder = format!("worker-{id}-{}", Uuid::new_v4());
    debug!(worker = %holder, "Worker started");

    loop {
        if shutdown.load(Ordering::Relaxed) {
            debug!(worker = %holder, "Worker shutting down");
            return;
        }

        // Bounded wait so the shutdown flag is observed even when idle.
        match tokio::time::timeout(Duration::from_secs(1), deps.queue.next()).await {
            Ok(Some(queued)) => handle_job(&holder, &deps, queued).await,
            Ok(None) => return,
            Err(_) => continue,
        }
    }
}

async fn handle_job(holder: &str, deps: &Arc<WorkerDeps>, queued: QueuedJob) {
    match &queued.job {
        Job::Poll { mailbox } => {
            let Some(config) = deps.mailboxes.get(mailbox) else {
                warn!(mailbox = %mailbox, "Poll job for unknown mailbox dropped");
                return;
            };
            match deps.store.is_mailbox_disabled(mailbox).await {
                Ok(true) => {
                    debug!(mailbox = %mailbox, "Mailbox disabled, skipping poll");
                    return;
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(mailbox = %mailbox, "Disabled check failed, skipping poll: {e}");
                    return;
                }
            }

            match sync_mailbox(
                deps.connector.as_ref(),
                deps.store.as_ref(),
                &deps.queue,
                config,
                &deps.fetch_retry,
            )
            .await
            {
                Ok(_report) => {}
                Err(e) => {
                    let key = MessageKey::new(mailbox.clone(), "-");
                    dispose_failure(deps, queued, &key, e).await;
                }
            }
        }
        Job::Process { key } => match deps.processor.process(key, holder).await {
            Ok(outcome) => {
                debug!(key = %key, ?outcome, "Process job done");
            }
            Err(e) => {
                let key = key.clone();
                dispose_failure(deps, queued, &key, e).await;
            }
        },
    }
}

/// Apply the error taxonomy: transient → backoff retry up to the ceiling,
/// then dead-letter; permanent → dead-letter immediately; fatal → the
/// mailbox is already out of rotation, just surface it.
async fn dispose_failure(
    deps: &Arc<WorkerDeps>,
    queued: QueuedJob,
    key: &MessageKey,
    e: PipelineError,
) {
    let kind = queued.job.kind();
    match e.severity() {
        Severity::Transient if queued.attempt < deps.queue_config.max_attempts => {
            let delay = backoff_delay(
                deps.queue_config.backoff_base(),
                deps.queue_config.backoff_cap(),
                queued.attempt,
            );
            warn!(
                key = %key,
                kind = kind,
                attempt = queued.attempt,
                "Job failed, retrying in {delay:?}: {e}"
            );
            deps.queue.requeue_after(queued, delay);
        }
        Severity::Transient | Severity::Permanent => {
            let reason = e.ledger_reason();
            error!(
                key = %key,
                kind = kind,
                attempts = queued.attempt,
                "Job dead-lettered ({reason}): {e}"
            );
            if key.message_id != "-" {
                if let Err(err) = deps.store.mark_failed(key, reason).await {
                    error!(key = %key, "Failed to mark ledger entry failed: {err}");
                }
            }
            if let Err(err) = deps
                .store
                .record_dead_letter(key, kind, reason, queued.attempt)
                .await
            {
                error!(key = %key, "Failed to record dead letter: {err}");
            }
        }
        Severity::Fatal => {
            error!(key = %key, kind = kind, "Fatal job failure: {e}");
        }
    }
}
