//! End-to-end pipeline tests over the in-memory store.
//!
//! These exercise the delivery guarantees as a whole: poll → ledger →
//! classify → extract → match → alert, under redelivery and concurrent
//! workers, with a stub connector and counting notifier standing in for
//! the external collaborators.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use leadwatch::alert::{Notifier, OpportunityGenerator};
use leadwatch::catalog::{CatalogEntry, CatalogHandle, CatalogSnapshot, MatcherConfig};
use leadwatch::config::{MailboxConfig, PipelineConfig};
use leadwatch::error::{MailboxError, NotifyError};
use leadwatch::inference::LexicalInference;
use leadwatch::mailbox::{FetchItem, MailConnector, RetryPolicy, sync_mailbox};
use leadwatch::pipeline::types::{AlertDecision, LedgerState, Opportunity, RawMessage};
use leadwatch::pipeline::{Classifier, Extractor, MessageProcessor, ProcessOutcome};
use leadwatch::scheduler::{Job, JobQueue};
use leadwatch::store::{LibSqlStore, Store};

/// Notifier that records every delivery.
#[derive(Default)]
struct CountingNotifier {
    sent: Mutex<Vec<String>>,
}

#[async_trait]
impl Notifier for CountingNotifier {
    fn channel(&self) -> &str {
        "counting"
    }

    async fn notify(&self, opportunity: &Opportunity) -> Result<(), NotifyError> {
        self.sent.lock().unwrap().push(opportunity.summary.clone());
        Ok(())
    }
}

/// Connector that serves a fixed set of messages above the cursor.
struct FixedConnector {
    items: Vec<FetchItem>,
}

#[async_trait]
impl MailConnector for FixedConnector {
    async fn fetch_new(
        &self,
        _config: &MailboxConfig,
        _folder: &str,
        since_uid: u32,
    ) -> Result<Vec<FetchItem>, MailboxError> {
        Ok(self
            .items
            .iter()
            .filter(|item| match item {
                FetchItem::Message(m) => m.uid > since_uid,
                FetchItem::Malformed { uid, .. } => *uid > since_uid,
            })
            .cloned()
            .collect())
    }

    async fn mark_seen(
        &self,
        _config: &MailboxConfig,
        _folder: &str,
        _uids: &[u32],
    ) -> Result<(), MailboxError> {
        Ok(())
    }
}

fn mailbox_config() -> MailboxConfig {
    serde_yaml::from_str(
        r#"
id: sales
host: imap.example.com
username: sales@example.com
password: secret
"#,
    )
    .unwrap()
}

fn widget_catalog() -> CatalogSnapshot {
    CatalogSnapshot::build(vec![CatalogEntry {
        id: "sku-100".into(),
        name: "WidgetPro X1".into(),
        aliases: vec!["WidgetPro".into()],
        unit_price: Some(149.0),
        category: Some("widgets".into()),
    }])
}

fn quotation_message(uid: u32, message_id: &str) -> RawMessage {
    RawMessage {
        mailbox: "sales".into(),
        folder: "INBOX".into(),
        uid,
        message_id: message_id.into(),
        sender: "juan@constructoraxyz.com".into(),
        subject: "Quotation request".into(),
        body: "Hello,\n\nwe need 500 units of WidgetPro.\n\nSaludos,\nConstructora XYZ\n".into(),
        fetched_at: Utc::now(),
    }
}

struct Harness {
    store: Arc<LibSqlStore>,
    processor: Arc<MessageProcessor>,
    notifier: Arc<CountingNotifier>,
    queue: Arc<JobQueue>,
}

async fn harness() -> Harness {
    let store = Arc::new(LibSqlStore::new_memory().await.unwrap());
    let notifier = Arc::new(CountingNotifier::default());
    let backend = Arc::new(LexicalInference::new());
    let config = PipelineConfig::default();

    let processor = Arc::new(MessageProcessor::new(
        Arc::clone(&store) as Arc<dyn Store>,
        Classifier::new(backend.clone(), config.noise_threshold),
        Extractor::new(backend, config.entity_confidence_floor),
        Arc::new(CatalogHandle::new(widget_catalog())),
        OpportunityGenerator::new(
            Arc::clone(&store) as Arc<dyn Store>,
            Arc::clone(&notifier) as Arc<dyn Notifier>,
            config,
        ),
        MatcherConfig::default(),
        Duration::from_secs(60),
    ));

    Harness {
        store,
        processor,
        notifier,
        queue: JobQueue::new(),
    }
}

#[tokio::test]
async fn full_pipeline_redelivery_yields_one_opportunity() {
    let h = harness().await;
    let connector = FixedConnector {
        items: vec![FetchItem::Message(quotation_message(1, "m-1"))],
    };
    let config = mailbox_config();
    let policy = RetryPolicy::default();

    // First delivery: poll discovers the message and enqueues a job.
    sync_mailbox(&connector, h.store.as_ref(), &h.queue, &config, &policy)
        .await
        .unwrap();
    let job = h.queue.next().await.unwrap();
    let key = match job.job {
        Job::Process { key } => key,
        other => panic!("expected process job, got {other:?}"),
    };

    let first = h.processor.process(&key, "worker-1").await.unwrap();
    assert!(matches!(first, ProcessOutcome::Completed { .. }));

    // Redelivery of the identical job (queue at-least-once semantics).
    let second = h.processor.process(&key, "worker-2").await.unwrap();
    assert_eq!(second, ProcessOutcome::AlreadyTerminal);

    // And a re-poll after a cursor rollback re-fetches without recording.
    h.store.set_cursor("sales", "INBOX", 0).await.unwrap();
    let report = sync_mailbox(&connector, h.store.as_ref(), &h.queue, &config, &policy)
        .await
        .unwrap();
    assert_eq!(report.duplicates, 1);
    assert_eq!(report.new, 0);

    // Exactly one opportunity, one Completed entry, one notification.
    assert_eq!(h.store.list_opportunities(None, 10).await.unwrap().len(), 1);
    let entry = h.store.ledger_entry(&key).await.unwrap().unwrap();
    assert_eq!(entry.state, LedgerState::Completed);
    assert_eq!(h.notifier.sent.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn quotation_scenario_alerts_with_exact_alias_match() {
    let h = harness().await;
    let msg = quotation_message(1, "m-1");
    let key = msg.key();
    h.store.record_fetched(&msg).await.unwrap();

    let outcome = h.processor.process(&key, "worker-1").await.unwrap();
    assert_eq!(
        outcome,
        ProcessOutcome::Completed {
            outcome: "alerted".into()
        }
    );

    let opportunity = h
        .store
        .opportunity_for_message(&key)
        .await
        .unwrap()
        .expect("opportunity persisted");
    assert_eq!(opportunity.decision, AlertDecision::Alerted);
    assert!(opportunity.classification_confidence >= 0.85);
    assert_eq!(opportunity.matches.len(), 1);
    assert_eq!(opportunity.matches[0].entry_name, "WidgetPro X1");
    assert!(!opportunity.matches[0].ambiguous);
    assert!(opportunity.notified);

    let sent = h.notifier.sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].contains("WidgetPro X1"));
}

#[tokio::test]
async fn concurrent_workers_race_one_wins() {
    let h = harness().await;
    let msg = quotation_message(1, "m-1");
    let key = msg.key();
    h.store.record_fetched(&msg).await.unwrap();

    // Two workers pick up the redelivered job at the same time.
    let (a, b) = tokio::join!(
        h.processor.process(&key, "worker-a"),
        h.processor.process(&key, "worker-b"),
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    let completed = [&a, &b]
        .iter()
        .filter(|o| matches!(o, ProcessOutcome::Completed { .. }))
        .count();
    let stood_down = [&a, &b]
        .iter()
        .filter(|o| {
            matches!(
                o,
                ProcessOutcome::LeaseHeld | ProcessOutcome::AlreadyTerminal
            )
        })
        .count();
    assert_eq!(completed, 1, "exactly one worker ran the pipeline: {a:?} / {b:?}");
    assert_eq!(stood_down, 1, "the other exited without side effects");

    // The loser produced no duplicate records or notifications.
    assert_eq!(h.store.list_opportunities(None, 10).await.unwrap().len(), 1);
    assert_eq!(h.notifier.sent.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn same_sender_and_product_within_window_is_suppressed() {
    let h = harness().await;

    // Two distinct emails, same sender, same product, same time bucket.
    let first = quotation_message(1, "m-1");
    let mut second = quotation_message(2, "m-2");
    second.fetched_at = first.fetched_at;
    h.store.record_fetched(&first).await.unwrap();
    h.store.record_fetched(&second).await.unwrap();

    let a = h.processor.process(&first.key(), "worker-1").await.unwrap();
    assert_eq!(
        a,
        ProcessOutcome::Completed {
            outcome: "alerted".into()
        }
    );

    let b = h.processor.process(&second.key(), "worker-1").await.unwrap();
    assert_eq!(
        b,
        ProcessOutcome::Completed {
            outcome: "suppressed".into()
        }
    );

    // One alert went out; both ledger entries are terminal.
    assert_eq!(h.notifier.sent.lock().unwrap().len(), 1);
    assert!(h.store.is_terminal(&first.key()).await.unwrap());
    assert!(h.store.is_terminal(&second.key()).await.unwrap());
}

#[tokio::test]
async fn noise_message_completes_without_alerting() {
    let h = harness().await;
    let msg = RawMessage {
        mailbox: "sales".into(),
        folder: "INBOX".into(),
        uid: 3,
        message_id: "m-3".into(),
        sender: "news@letters.example.com".into(),
        subject: "Monthly newsletter".into(),
        body: "Great deals inside! Click here to unsubscribe.".into(),
        fetched_at: Utc::now(),
    };
    let key = msg.key();
    h.store.record_fetched(&msg).await.unwrap();

    let outcome = h.processor.process(&key, "worker-1").await.unwrap();
    assert_eq!(
        outcome,
        ProcessOutcome::Completed {
            outcome: "noise".into()
        }
    );
    assert!(h.store.opportunity_for_message(&key).await.unwrap().is_none());
    assert!(h.notifier.sent.lock().unwrap().is_empty());
}

#[tokio::test]
async fn recorded_snapshot_version_reproduces_candidates() {
    let h = harness().await;
    let msg = quotation_message(1, "m-1");
    let key = msg.key();
    h.store.record_fetched(&msg).await.unwrap();
    h.processor.process(&key, "worker-1").await.unwrap();

    let matches = h.store.matches(&key).await.unwrap().unwrap();
    let recorded_version = matches[0].snapshot_version.clone();

    // Rebuilding the snapshot from identical catalog content reproduces
    // the version and, with it, the candidate set.
    let rebuilt = widget_catalog();
    assert_eq!(rebuilt.version(), recorded_version);

    let entities = h.store.entities(&key).await.unwrap().unwrap();
    let replayed = leadwatch::catalog::match_entities(&entities, &rebuilt, MatcherConfig::default());
    assert_eq!(replayed.len(), matches.len());
    assert_eq!(replayed[0].entry_id, matches[0].entry_id);
    assert_eq!(replayed[0].score, matches[0].score);
    assert_eq!(replayed[0].kind, matches[0].kind);
}

#[tokio::test]
async fn crashed_notification_is_detectable_and_retryable() {
    // A notifier that fails once, then recovers.
    struct FlakyNotifier {
        failures: Mutex<u32>,
        sent: Mutex<u32>,
    }

    #[async_trait]
    impl Notifier for FlakyNotifier {
        fn channel(&self) -> &str {
            "flaky"
        }

        async fn notify(&self, _opportunity: &Opportunity) -> Result<(), NotifyError> {
            let mut failures = self.failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(NotifyError::Send {
                    channel: "flaky".into(),
                    reason: "relay down".into(),
                });
            }
            *self.sent.lock().unwrap() += 1;
            Ok(())
        }
    }

    let store = Arc::new(LibSqlStore::new_memory().await.unwrap());
    let notifier = Arc::new(FlakyNotifier {
        failures: Mutex::new(1),
        sent: Mutex::new(0),
    });
    let backend = Arc::new(LexicalInference::new());
    let config = PipelineConfig::default();

    let processor = MessageProcessor::new(
        Arc::clone(&store) as Arc<dyn Store>,
        Classifier::new(backend.clone(), config.noise_threshold),
        Extractor::new(backend, config.entity_confidence_floor),
        Arc::new(CatalogHandle::new(widget_catalog())),
        OpportunityGenerator::new(
            Arc::clone(&store) as Arc<dyn Store>,
            Arc::clone(&notifier) as Arc<dyn Notifier>,
            config,
        ),
        MatcherConfig::default(),
        Duration::from_secs(60),
    );

    let msg = quotation_message(1, "m-1");
    let key = msg.key();
    store.record_fetched(&msg).await.unwrap();

    // The pipeline completes even though the notification failed.
    let outcome = processor.process(&key, "worker-1").await.unwrap();
    assert_eq!(
        outcome,
        ProcessOutcome::Completed {
            outcome: "alerted".into()
        }
    );
    assert_eq!(*notifier.sent.lock().unwrap(), 0);

    // The gap is visible and the retry path closes it.
    let ops = leadwatch::ops::OpsSurface::new(
        Arc::clone(&store) as Arc<dyn Store>,
        JobQueue::new(),
    );
    let delivered = ops
        .retry_unnotified(Arc::clone(&notifier) as Arc<dyn Notifier>)
        .await
        .unwrap();
    assert_eq!(delivered, 1);
    assert_eq!(*notifier.sent.lock().unwrap(), 1);
    assert!(store.unnotified_alerts().await.unwrap().is_empty());

    // Re-running the ledger-completed message never re-alerts.
    let rerun = processor.process(&key, "worker-2").await.unwrap();
    assert_eq!(rerun, ProcessOutcome::AlreadyTerminal);
}
