//! Configuration types.
//!
//! The whole tree is serde-deserialized from a YAML file; every policy knob
//! (thresholds, windows, retry ceilings) lives here rather than in code.
//! Credentials are wrapped in `SecretString` so they never end up in logs.

use std::path::Path;
use std::time::Duration;

use secrecy::SecretString;
use serde::Deserialize;

use crate::error::ConfigError;

/// Root application configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Mailboxes to poll. May be empty (pipeline idles).
    #[serde(default)]
    pub mailboxes: Vec<MailboxConfig>,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub catalog: CatalogConfig,
    #[serde(default)]
    pub inference: InferenceConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub alerts: AlertConfig,
}

impl AppConfig {
    /// Load and validate configuration from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        let config: Self =
            serde_yaml::from_str(&raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field invariants serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = std::collections::HashSet::new();
        for mb in &self.mailboxes {
            if !seen.insert(mb.id.as_str()) {
                return Err(ConfigError::InvalidValue {
                    key: "mailboxes".into(),
                    message: format!("duplicate mailbox id '{}'", mb.id),
                });
            }
            if mb.folders.is_empty() {
                return Err(ConfigError::InvalidValue {
                    key: format!("mailboxes.{}.folders", mb.id),
                    message: "at least one folder is required".into(),
                });
            }
        }
        self.pipeline.validate()?;
        if self.queue.workers == 0 {
            return Err(ConfigError::InvalidValue {
                key: "queue.workers".into(),
                message: "must be at least 1".into(),
            });
        }
        self.alerts.validate()?;
        Ok(())
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            mailboxes: Vec::new(),
            database: DatabaseConfig::default(),
            catalog: CatalogConfig::default(),
            inference: InferenceConfig::default(),
            pipeline: PipelineConfig::default(),
            queue: QueueConfig::default(),
            alerts: AlertConfig::default(),
        }
    }
}

/// A single IMAP mailbox to poll. Immutable once loaded; owned by the
/// scheduler.
#[derive(Debug, Clone, Deserialize)]
pub struct MailboxConfig {
    /// Stable identifier used as the ledger's mailbox key.
    pub id: String,
    pub host: String,
    #[serde(default = "default_imap_port")]
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    #[serde(default = "default_folders")]
    pub folders: Vec<String>,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Mark messages \Seen after they are recorded in the ledger.
    #[serde(default = "default_true")]
    pub mark_seen: bool,
}

impl MailboxConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CatalogConfig {
    #[serde(default = "default_catalog_path")]
    pub path: String,
    /// How often the catalog file is re-read and swapped in.
    #[serde(default = "default_catalog_refresh")]
    pub refresh_interval_secs: u64,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            path: default_catalog_path(),
            refresh_interval_secs: default_catalog_refresh(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct InferenceConfig {
    /// Base URL of the remote scoring service. When absent the built-in
    /// lexical scorer is used.
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_inference_timeout")]
    pub timeout_secs: u64,
}

impl InferenceConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            timeout_secs: default_inference_timeout(),
        }
    }
}

/// Stage thresholds and alert policy. All values are deployment policy,
/// not core semantics.
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Classification confidence at or above this is opportunity-like
    /// (inclusive boundary); below routes to Completed as noise.
    #[serde(default = "default_noise_threshold")]
    pub noise_threshold: f64,
    /// Entities under this confidence are kept but flagged low-confidence.
    #[serde(default = "default_entity_floor")]
    pub entity_confidence_floor: f64,
    /// Minimum normalized edit-distance similarity for a fuzzy match.
    #[serde(default = "default_fuzzy_threshold")]
    pub fuzzy_threshold: f64,
    /// Entries within this margin of the best fuzzy score tie as ambiguous.
    #[serde(default = "default_ambiguity_margin")]
    pub ambiguity_margin: f64,
    /// Ambiguous best matches are dampened by this factor before scoring.
    #[serde(default = "default_ambiguity_damping")]
    pub ambiguity_damping: f64,
    #[serde(default = "default_classification_weight")]
    pub classification_weight: f64,
    #[serde(default = "default_match_weight")]
    pub match_weight: f64,
    /// Composite score at or above this raises an alert.
    #[serde(default = "default_alert_threshold")]
    pub alert_threshold: f64,
    /// Sliding dedup window for opportunity keys.
    #[serde(default = "default_dedup_window")]
    pub dedup_window_secs: u64,
}

impl PipelineConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        for (key, value) in [
            ("pipeline.noise_threshold", self.noise_threshold),
            ("pipeline.entity_confidence_floor", self.entity_confidence_floor),
            ("pipeline.fuzzy_threshold", self.fuzzy_threshold),
            ("pipeline.alert_threshold", self.alert_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::InvalidValue {
                    key: key.into(),
                    message: format!("{value} is outside [0, 1]"),
                });
            }
        }
        if self.dedup_window_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "pipeline.dedup_window_secs".into(),
                message: "must be positive".into(),
            });
        }
        Ok(())
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            noise_threshold: default_noise_threshold(),
            entity_confidence_floor: default_entity_floor(),
            fuzzy_threshold: default_fuzzy_threshold(),
            ambiguity_margin: default_ambiguity_margin(),
            ambiguity_damping: default_ambiguity_damping(),
            classification_weight: default_classification_weight(),
            match_weight: default_match_weight(),
            alert_threshold: default_alert_threshold(),
            dedup_window_secs: default_dedup_window(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Total delivery attempts for a job before it dead-letters.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base")]
    pub backoff_base_secs: u64,
    #[serde(default = "default_backoff_cap")]
    pub backoff_cap_secs: u64,
    /// Per-message lease duration; expired leases can be stolen.
    #[serde(default = "default_lease_ttl")]
    pub lease_ttl_secs: u64,
}

impl QueueConfig {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_secs(self.backoff_base_secs)
    }

    pub fn backoff_cap(&self) -> Duration {
        Duration::from_secs(self.backoff_cap_secs)
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            max_attempts: default_max_attempts(),
            backoff_base_secs: default_backoff_base(),
            backoff_cap_secs: default_backoff_cap(),
            lease_ttl_secs: default_lease_ttl(),
        }
    }
}

/// Where alert notifications go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertChannel {
    /// Log-only; useful for dry runs and tests.
    Log,
    Email,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AlertConfig {
    #[serde(default = "default_alert_channel")]
    pub channel: AlertChannel,
    /// Required when channel is `email`.
    #[serde(default)]
    pub recipient: Option<String>,
    #[serde(default)]
    pub smtp: Option<SmtpConfig>,
}

impl AlertConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.channel == AlertChannel::Email {
            if self.recipient.is_none() {
                return Err(ConfigError::MissingRequired {
                    key: "alerts.recipient".into(),
                    hint: "email alerts need a recipient address".into(),
                });
            }
            if self.smtp.is_none() {
                return Err(ConfigError::MissingRequired {
                    key: "alerts.smtp".into(),
                    hint: "email alerts need an SMTP relay configuration".into(),
                });
            }
        }
        Ok(())
    }
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            channel: default_alert_channel(),
            recipient: None,
            smtp: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SmtpConfig {
    pub host: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    pub from_address: String,
}

// ── Serde defaults ──────────────────────────────────────────────────

fn default_imap_port() -> u16 {
    993
}

fn default_folders() -> Vec<String> {
    vec!["INBOX".to_string()]
}

fn default_poll_interval() -> u64 {
    600
}

fn default_true() -> bool {
    true
}

fn default_db_path() -> String {
    "./data/leadwatch.db".to_string()
}

fn default_catalog_path() -> String {
    "catalog.yml".to_string()
}

fn default_catalog_refresh() -> u64 {
    300
}

fn default_inference_timeout() -> u64 {
    20
}

fn default_noise_threshold() -> f64 {
    0.6
}

fn default_entity_floor() -> f64 {
    0.65
}

fn default_fuzzy_threshold() -> f64 {
    0.82
}

fn default_ambiguity_margin() -> f64 {
    0.02
}

fn default_ambiguity_damping() -> f64 {
    0.85
}

fn default_classification_weight() -> f64 {
    0.6
}

fn default_match_weight() -> f64 {
    0.4
}

fn default_alert_threshold() -> f64 {
    0.75
}

fn default_dedup_window() -> u64 {
    86_400
}

fn default_workers() -> usize {
    4
}

fn default_max_attempts() -> u32 {
    4
}

fn default_backoff_base() -> u64 {
    2
}

fn default_backoff_cap() -> u64 {
    60
}

fn default_lease_ttl() -> u64 {
    120
}

fn default_alert_channel() -> AlertChannel {
    AlertChannel::Log
}

fn default_smtp_port() -> u16 {
    587
}
