use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use leadwatch::alert::{OpportunityGenerator, create_notifier};
use leadwatch::catalog::{
    CatalogHandle, CatalogSnapshot, CatalogSource, MatcherConfig, YamlCatalogSource,
    spawn_catalog_refresh,
};
use leadwatch::config::AppConfig;
use leadwatch::inference::create_backend;
use leadwatch::mailbox::{ImapConnector, RetryPolicy};
use leadwatch::ops::OpsSurface;
use leadwatch::pipeline::{Classifier, Extractor, MessageProcessor};
use leadwatch::scheduler::{JobQueue, WorkerDeps, WorkerPool, recover_inflight, spawn_poll_scheduler};
use leadwatch::store::{LibSqlStore, Store};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config_path =
        std::env::var("LEADWATCH_CONFIG").unwrap_or_else(|_| "config.yml".to_string());
    let config = AppConfig::load(&config_path).unwrap_or_else(|e| {
        eprintln!("Error: could not load configuration from '{config_path}': {e}");
        std::process::exit(1);
    });

    eprintln!("leadwatch v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Config: {config_path}");
    eprintln!("   Mailboxes: {}", config.mailboxes.len());
    eprintln!("   Workers: {}", config.queue.workers);

    // ── Store ───────────────────────────────────────────────────────
    let store: Arc<dyn Store> = Arc::new(
        LibSqlStore::new_local(Path::new(&config.database.path))
            .await
            .unwrap_or_else(|e| {
                eprintln!("Error: failed to open database at {}: {e}", config.database.path);
                std::process::exit(1);
            }),
    );
    eprintln!("   Database: {}", config.database.path);

    // ── Catalog ─────────────────────────────────────────────────────
    let catalog_source: Arc<dyn CatalogSource> =
        Arc::new(YamlCatalogSource::new(&config.catalog.path));
    let initial_snapshot = match catalog_source.load().await {
        Ok(snapshot) => {
            eprintln!(
                "   Catalog: {} entries (version {})",
                snapshot.entries().len(),
                snapshot.version()
            );
            snapshot
        }
        Err(e) => {
            eprintln!("   Catalog: unavailable ({e}), matching disabled until refresh");
            CatalogSnapshot::empty()
        }
    };
    let catalog = Arc::new(CatalogHandle::new(initial_snapshot));
    let (_catalog_task, catalog_shutdown) = spawn_catalog_refresh(
        Arc::clone(&catalog),
        catalog_source,
        std::time::Duration::from_secs(config.catalog.refresh_interval_secs),
    );

    // ── Inference & notification ────────────────────────────────────
    let backend = create_backend(&config.inference);
    let notifier = create_notifier(&config.alerts)?;
    eprintln!("   Inference: {}", backend.name());
    eprintln!("   Alerts: {}", notifier.channel());

    // ── Pipeline ────────────────────────────────────────────────────
    let processor = Arc::new(MessageProcessor::new(
        Arc::clone(&store),
        Classifier::new(Arc::clone(&backend), config.pipeline.noise_threshold),
        Extractor::new(Arc::clone(&backend), config.pipeline.entity_confidence_floor),
        Arc::clone(&catalog),
        OpportunityGenerator::new(
            Arc::clone(&store),
            Arc::clone(&notifier),
            config.pipeline.clone(),
        ),
        MatcherConfig {
            fuzzy_threshold: config.pipeline.fuzzy_threshold,
            ambiguity_margin: config.pipeline.ambiguity_margin,
        },
        config.queue.lease_ttl(),
    ));

    // ── Queue, recovery, scheduler, workers ─────────────────────────
    let queue = JobQueue::new();

    let recovered = recover_inflight(store.as_ref(), &queue).await?;
    if recovered > 0 {
        eprintln!("   Recovered {recovered} in-flight messages from the ledger");
    }

    // Alerts persisted before a crash but never delivered go out now.
    let ops = OpsSurface::new(Arc::clone(&store), Arc::clone(&queue));
    let resent = ops.retry_unnotified(Arc::clone(&notifier)).await?;
    if resent > 0 {
        eprintln!("   Resent {resent} pending alert notifications");
    }

    let mailbox_map: HashMap<_, _> = config
        .mailboxes
        .iter()
        .map(|mb| (mb.id.clone(), mb.clone()))
        .collect();

    let deps = Arc::new(WorkerDeps {
        store: Arc::clone(&store),
        connector: Arc::new(ImapConnector),
        processor,
        queue: Arc::clone(&queue),
        mailboxes: mailbox_map,
        fetch_retry: RetryPolicy::default(),
        queue_config: config.queue.clone(),
    });
    let pool = WorkerPool::spawn(deps);

    let (_scheduler_task, scheduler_shutdown) = spawn_poll_scheduler(
        config.mailboxes.clone(),
        Arc::clone(&queue),
        Arc::clone(&store),
    );

    eprintln!("   Running. Ctrl-C to stop.\n");

    // ── Shutdown ────────────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    eprintln!("Shutting down...");
    scheduler_shutdown.store(true, Ordering::Relaxed);
    catalog_shutdown.store(true, Ordering::Relaxed);
    pool.shutdown().await;

    Ok(())
}
