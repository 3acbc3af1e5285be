//! Product catalog — versioned immutable snapshots.
//!
//! The catalog is owned by an external source; this module only reads it.
//! A refresh builds a whole new snapshot and swaps it in copy-on-write, so
//! a job that grabbed a snapshot keeps a consistent view for its lifetime.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::error::CatalogError;

pub mod matcher;

pub use matcher::{MatcherConfig, match_entities};

// ── Entries & snapshots ─────────────────────────────────────────────

/// A single catalog product.
#[derive(Debug, Clone, Deserialize)]
pub struct CatalogEntry {
    pub id: String,
    /// Canonical display name.
    pub name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub unit_price: Option<f64>,
    #[serde(default)]
    pub category: Option<String>,
}

/// An immutable, versioned view of the catalog.
///
/// The version token is a content hash: reloading identical entries yields
/// the identical version, so a recorded version always reproduces its
/// candidate set.
#[derive(Debug)]
pub struct CatalogSnapshot {
    version: String,
    entries: Vec<CatalogEntry>,
    /// normalized canonical name → entry index
    name_index: HashMap<String, usize>,
    /// normalized alias → entry index
    alias_index: HashMap<String, usize>,
}

impl CatalogSnapshot {
    pub fn build(mut entries: Vec<CatalogEntry>) -> Self {
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        let version = content_version(&entries);

        let mut name_index = HashMap::new();
        let mut alias_index = HashMap::new();
        for (idx, entry) in entries.iter().enumerate() {
            name_index.insert(normalize(&entry.name), idx);
            for alias in &entry.aliases {
                alias_index.insert(normalize(alias), idx);
            }
        }

        Self {
            version,
            entries,
            name_index,
            alias_index,
        }
    }

    pub fn empty() -> Self {
        Self::build(Vec::new())
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn entries(&self) -> &[CatalogEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry(&self, idx: usize) -> &CatalogEntry {
        &self.entries[idx]
    }

    /// Exact canonical-name lookup over the normalized form.
    pub fn by_name(&self, normalized: &str) -> Option<usize> {
        self.name_index.get(normalized).copied()
    }

    /// Alias-table lookup over the normalized form.
    pub fn by_alias(&self, normalized: &str) -> Option<usize> {
        self.alias_index.get(normalized).copied()
    }
}

/// Normalize a product name for lookup: lowercase, collapsed whitespace.
pub fn normalize(s: &str) -> String {
    s.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// FNV-1a over the sorted entry set.
fn content_version(entries: &[CatalogEntry]) -> String {
    const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

    let mut hash = FNV_OFFSET;
    let mut feed = |s: &str| {
        for byte in s.as_bytes() {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(FNV_PRIME);
        }
        hash ^= 0x1f;
        hash = hash.wrapping_mul(FNV_PRIME);
    };
    for entry in entries {
        feed(&entry.id);
        feed(&entry.name);
        for alias in &entry.aliases {
            feed(alias);
        }
    }
    format!("v{hash:016x}")
}

// ── Shared handle ───────────────────────────────────────────────────

/// Shared read handle over the current snapshot.
///
/// Refresh is a copy-on-write swap — readers holding an `Arc` to the old
/// snapshot are never disturbed. Swapped-out snapshots are retained by
/// version so a recorded version can be re-fetched for reproduction.
pub struct CatalogHandle {
    current: RwLock<Arc<CatalogSnapshot>>,
    retained: RwLock<HashMap<String, Arc<CatalogSnapshot>>>,
}

impl CatalogHandle {
    pub fn new(initial: CatalogSnapshot) -> Self {
        let initial = Arc::new(initial);
        let mut retained = HashMap::new();
        retained.insert(initial.version().to_string(), Arc::clone(&initial));
        Self {
            current: RwLock::new(initial),
            retained: RwLock::new(retained),
        }
    }

    /// The snapshot to use for a new job.
    pub async fn current(&self) -> Arc<CatalogSnapshot> {
        Arc::clone(&*self.current.read().await)
    }

    /// Swap in a freshly built snapshot. No-op if the version is unchanged.
    pub async fn swap(&self, snapshot: CatalogSnapshot) -> bool {
        let snapshot = Arc::new(snapshot);
        {
            let current = self.current.read().await;
            if current.version() == snapshot.version() {
                return false;
            }
        }
        self.retained
            .write()
            .await
            .insert(snapshot.version().to_string(), Arc::clone(&snapshot));
        *self.current.write().await = snapshot;
        true
    }

    /// Re-fetch a snapshot by its recorded version, if still retained.
    pub async fn by_version(&self, version: &str) -> Option<Arc<CatalogSnapshot>> {
        self.retained.read().await.get(version).cloned()
    }
}

// ── Sources ─────────────────────────────────────────────────────────

/// A versioned read API over the external catalog.
#[async_trait]
pub trait CatalogSource: Send + Sync {
    async fn load(&self) -> Result<CatalogSnapshot, CatalogError>;
}

/// YAML file catalog source.
///
/// Expected shape:
/// ```yaml
/// products:
///   - id: sku-100
///     name: WidgetPro X1
///     aliases: [WidgetPro]
///     unit_price: 149.0
/// ```
pub struct YamlCatalogSource {
    path: PathBuf,
}

impl YamlCatalogSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    products: Vec<CatalogEntry>,
}

#[async_trait]
impl CatalogSource for YamlCatalogSource {
    async fn load(&self) -> Result<CatalogSnapshot, CatalogError> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| CatalogError::Io {
                path: self.path.display().to_string(),
                source: e,
            })?;
        let file: CatalogFile =
            serde_yaml::from_str(&raw).map_err(|e| CatalogError::Parse(e.to_string()))?;
        Ok(CatalogSnapshot::build(file.products))
    }
}

/// Spawn a background task that periodically reloads the catalog and swaps
/// the handle. Load failures keep the previous snapshot.
pub fn spawn_catalog_refresh(
    handle: Arc<CatalogHandle>,
    source: Arc<dyn CatalogSource>,
    interval: Duration,
) -> (JoinHandle<()>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);

    let task = tokio::spawn(async move {
        let mut tick = tokio::time::interval(interval);
        // The initial snapshot is loaded at startup; skip the immediate tick.
        tick.tick().await;

        loop {
            tick.tick().await;

            if shutdown.load(Ordering::Relaxed) {
                info!("Catalog refresh task shutting down");
                return;
            }

            match source.load().await {
                Ok(snapshot) => {
                    let version = snapshot.version().to_string();
                    let count = snapshot.entries().len();
                    if handle.swap(snapshot).await {
                        info!(version = %version, entries = count, "Catalog snapshot swapped");
                    }
                }
                Err(e) => {
                    warn!("Catalog reload failed, keeping previous snapshot: {e}");
                }
            }
        }
    });

    // Surface panics in the refresh task instead of silently losing it.
    let monitored = tokio::spawn(async move {
        if let Err(e) = task.await {
            if e.is_panic() {
                error!("Catalog refresh task panicked: {e}");
            }
        }
    });

    (monitored, shutdown_flag)
}
