//! Inference backend — the black-box scoring capability.
//!
//! Classification and entity extraction are consumed through a trait so the
//! pipeline never depends on a specific model. Two implementations ship:
//! an HTTP client for a remote scoring service, and a deterministic lexical
//! scorer used as fallback and in tests.

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::InferenceConfig;
use crate::error::InferenceError;
use crate::pipeline::types::{ClassificationResult, EntityKind};

pub mod http;
pub mod lexical;

pub use http::HttpInference;
pub use lexical::LexicalInference;

/// An entity as produced by a backend, before the pipeline applies its
/// confidence-floor policy.
#[derive(Debug, Clone)]
pub struct RawEntity {
    pub kind: EntityKind,
    pub start: usize,
    pub end: usize,
    pub text: String,
    pub normalized: String,
    pub confidence: f64,
}

/// Scoring interface for classification and entity extraction.
///
/// Implementations must be deterministic for a fixed model version and
/// return within a bounded time or signal unavailability.
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    /// Backend name for logging.
    fn name(&self) -> &str;

    /// Score the message intent.
    async fn classify(&self, subject: &str, body: &str)
    -> Result<ClassificationResult, InferenceError>;

    /// Extract typed entities from the message text.
    async fn extract(&self, subject: &str, body: &str) -> Result<Vec<RawEntity>, InferenceError>;
}

/// Build the configured backend: remote HTTP when an endpoint is set,
/// otherwise the lexical scorer.
pub fn create_backend(config: &InferenceConfig) -> Arc<dyn InferenceBackend> {
    match &config.endpoint {
        Some(endpoint) => {
            tracing::info!(endpoint = %endpoint, "Using remote inference backend");
            Arc::new(HttpInference::new(endpoint.clone(), config.timeout()))
        }
        None => {
            tracing::info!("Using built-in lexical inference backend");
            Arc::new(LexicalInference::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_selection_follows_endpoint() {
        let lexical = create_backend(&InferenceConfig::default());
        assert_eq!(lexical.name(), "lexical");

        let remote = create_backend(&InferenceConfig {
            endpoint: Some("http://localhost:9090".into()),
            timeout_secs: 5,
        });
        assert_eq!(remote.name(), "remote");
    }
}
