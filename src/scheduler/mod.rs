//! Task scheduling — timer loop, job queue, worker pool.
//!
//! The scheduler is a single timer task that only enqueues; a slow mailbox
//! can never block another mailbox's polling because all real work happens
//! on the worker pool.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::MailboxConfig;
use crate::error::StoreError;
use crate::store::Store;

pub mod queue;
pub mod worker;

pub use queue::{Job, JobQueue, QueuedJob, backoff_delay};
pub use worker::{WorkerDeps, WorkerPool};

/// Spawn the poll scheduler: fires a poll job per mailbox at its interval.
///
/// The first poll for every mailbox fires immediately.
pub fn spawn_poll_scheduler(
    mailboxes: Vec<MailboxConfig>,
    queue: Arc<JobQueue>,
    store: Arc<dyn Store>,
) -> (JoinHandle<()>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);

    let handle = tokio::spawn(async move {
        let mut next_due: HashMap<String, Instant> = mailboxes
            .iter()
            .map(|mb| (mb.id.clone(), Instant::now()))
            .collect();
        let intervals: HashMap<String, Duration> = mailboxes
            .iter()
            .map(|mb| (mb.id.clone(), mb.poll_interval()))
            .collect();

        info!(mailboxes = mailboxes.len(), "Poll scheduler started");
        let mut tick = tokio::time::interval(Duration::from_secs(1));

        loop {
            tick.tick().await;

            if shutdown.load(Ordering::Relaxed) {
                info!("Poll scheduler shutting down");
                return;
            }

            let now = Instant::now();
            for (mailbox, due) in next_due.iter_mut() {
                if *due > now {
                    continue;
                }
                *due = now + intervals[mailbox];

                match store.is_mailbox_disabled(mailbox).await {
                    Ok(true) => {
                        debug!(mailbox = %mailbox, "Mailbox disabled, not scheduling poll");
                        continue;
                    }
                    Ok(false) => {}
                    Err(e) => {
                        warn!(mailbox = %mailbox, "Disabled check failed: {e}");
                        continue;
                    }
                }

                debug!(mailbox = %mailbox, "Scheduling poll");
                queue.enqueue(Job::Poll {
                    mailbox: mailbox.clone(),
                });
            }
        }
    });

    (handle, shutdown_flag)
}

/// Re-enqueue every non-terminal ledger entry after a restart.
///
/// The queue is in-memory, so jobs in flight at crash time are gone, but
/// their ledger entries are not. This restores at-least-once delivery
/// without a durable broker.
pub async fn recover_inflight(store: &dyn Store, queue: &JobQueue) -> Result<usize, StoreError> {
    let keys = store.non_terminal_keys().await?;
    let count = keys.len();
    for key in keys {
        queue.enqueue(Job::Process { key });
    }
    if count > 0 {
        info!(count, "Recovered in-flight messages from ledger");
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    use crate::pipeline::types::{LedgerState, MessageKey, RawMessage};
    use crate::store::LibSqlStore;

    fn raw(uid: u32, message_id: &str) -> RawMessage {
        RawMessage {
            mailbox: "sales".into(),
            folder: "INBOX".into(),
            uid,
            message_id: message_id.into(),
            sender: "a@b.com".into(),
            subject: "s".into(),
            body: "b".into(),
            fetched_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn recover_inflight_requeues_only_open_entries() {
        let store = LibSqlStore::new_memory().await.unwrap();
        let queue = JobQueue::new();

        store.record_fetched(&raw(1, "m-1")).await.unwrap();
        store.record_fetched(&raw(2, "m-2")).await.unwrap();
        store
            .advance(
                &MessageKey::new("sales", "m-1"),
                LedgerState::Completed,
                Some("noise"),
            )
            .await
            .unwrap();

        let recovered = recover_inflight(&store, &queue).await.unwrap();
        assert_eq!(recovered, 1);
        let job = queue.next().await.unwrap();
        match job.job {
            Job::Process { key } => assert_eq!(key.message_id, "m-2"),
            other => panic!("unexpected job {other:?}"),
        }
    }

    #[tokio::test]
    async fn scheduler_enqueues_initial_polls() {
        let store: Arc<dyn Store> = Arc::new(LibSqlStore::new_memory().await.unwrap());
        let queue = JobQueue::new();
        let mailboxes: Vec<MailboxConfig> = vec![
            serde_yaml::from_str(
                r#"
id: sales
host: imap.example.com
username: u
password: p
poll_interval_secs: 3600
"#,
            )
            .unwrap(),
        ];

        let (handle, shutdown) =
            spawn_poll_scheduler(mailboxes, Arc::clone(&queue), Arc::clone(&store));

        // First tick fires immediately.
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if queue.depth() > 0 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("initial poll enqueued");

        let job = queue.next().await.unwrap();
        assert_eq!(job.job.kind(), "poll");

        shutdown.store(true, Ordering::Relaxed);
        let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;
    }

    #[tokio::test]
    async fn disabled_mailboxes_are_not_scheduled() {
        let store = Arc::new(LibSqlStore::new_memory().await.unwrap());
        store
            .set_mailbox_disabled("sales", "authentication failed")
            .await
            .unwrap();
        let queue = JobQueue::new();
        let mailboxes: Vec<MailboxConfig> = vec![
            serde_yaml::from_str(
                r#"
id: sales
host: imap.example.com
username: u
password: p
"#,
            )
            .unwrap(),
        ];

        let (handle, shutdown) = spawn_poll_scheduler(
            mailboxes,
            Arc::clone(&queue),
            Arc::clone(&store) as Arc<dyn Store>,
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(queue.depth(), 0);

        shutdown.store(true, Ordering::Relaxed);
        let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;
    }
}
