//! In-memory job queue with delayed re-enqueue.
//!
//! Delivery is at-least-once: the queue makes no idempotency promises,
//! that is the ledger's job. Jobs carry references, never payloads, to
//! stay small.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use rand::Rng;
use tokio::sync::{Mutex, mpsc};
use tracing::debug;

use crate::pipeline::types::MessageKey;

/// A unit of work.
#[derive(Debug, Clone)]
pub enum Job {
    /// Poll one mailbox for new messages.
    Poll { mailbox: String },
    /// Run the pipeline for one recorded message.
    Process { key: MessageKey },
}

impl Job {
    /// Short label for logs and dead letters.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Poll { .. } => "poll",
            Self::Process { .. } => "process",
        }
    }
}

/// A job plus its delivery attempt count (1-based).
#[derive(Debug, Clone)]
pub struct QueuedJob {
    pub job: Job,
    pub attempt: u32,
}

/// Unbounded mpsc queue shared by the worker pool.
pub struct JobQueue {
    tx: mpsc::UnboundedSender<QueuedJob>,
    rx: Mutex<mpsc::UnboundedReceiver<QueuedJob>>,
    depth: AtomicUsize,
}

impl JobQueue {
    pub fn new() -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            tx,
            rx: Mutex::new(rx),
            depth: AtomicUsize::new(0),
        })
    }

    /// Enqueue a fresh job (attempt 1).
    pub fn enqueue(&self, job: Job) {
        self.push(QueuedJob { job, attempt: 1 });
    }

    fn push(&self, queued: QueuedJob) {
        self.depth.fetch_add(1, Ordering::Relaxed);
        // Send only fails when all receivers are gone, i.e. at shutdown.
        if self.tx.send(queued).is_err() {
            self.depth.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Re-enqueue a failed job after a delay, with the attempt bumped.
    pub fn requeue_after(self: &Arc<Self>, mut queued: QueuedJob, delay: Duration) {
        queued.attempt += 1;
        debug!(
            kind = queued.job.kind(),
            attempt = queued.attempt,
            "Requeueing job in {delay:?}"
        );
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.push(queued);
        });
    }

    /// Receive the next job. Workers wrap this in a timeout so they can
    /// observe the shutdown flag.
    pub async fn next(&self) -> Option<QueuedJob> {
        let queued = self.rx.lock().await.recv().await;
        if queued.is_some() {
            self.depth.fetch_sub(1, Ordering::Relaxed);
        }
        queued
    }

    /// Jobs currently queued (excluding delayed requeues still sleeping).
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }
}

/// Exponential backoff with jitter for queue-level retries.
pub fn backoff_delay(base: Duration, cap: Duration, attempt: u32) -> Duration {
    let exp = base.saturating_mul(1u32 << attempt.saturating_sub(1).min(16));
    let capped = exp.min(cap);
    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..250));
    capped + jitter
}
