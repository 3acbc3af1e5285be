//! Classification stage — intent scoring with noise short-circuit.

use std::sync::Arc;

use tracing::debug;

use crate::error::PipelineError;
use crate::inference::InferenceBackend;
use crate::pipeline::types::{ClassificationResult, RawMessage};

/// Wraps the inference seam with the pipeline's gating policy.
pub struct Classifier {
    backend: Arc<dyn InferenceBackend>,
    noise_threshold: f64,
}

impl Classifier {
    pub fn new(backend: Arc<dyn InferenceBackend>, noise_threshold: f64) -> Self {
        Self {
            backend,
            noise_threshold,
        }
    }

    /// Score the message. Backend unavailability surfaces as a transient
    /// pipeline error; the queue owns the retry ceiling.
    pub async fn classify(&self, message: &RawMessage) -> Result<ClassificationResult, PipelineError> {
        let result = self
            .backend
            .classify(&message.subject, &message.body)
            .await
            .map_err(PipelineError::Classification)?;

        debug!(
            key = %message.key(),
            label = result.label.as_str(),
            confidence = result.confidence,
            model = %result.model_version,
            "Classified message"
        );
        Ok(result)
    }

    /// Gate for the extraction stage; inclusive at the threshold.
    pub fn is_opportunity_like(&self, result: &ClassificationResult) -> bool {
        result.is_opportunity_like(self.noise_threshold)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;

    use crate::error::InferenceError;
    use crate::inference::RawEntity;
    use crate::pipeline::types::IntentLabel;

    fn message() -> RawMessage {
        RawMessage {
            mailbox: "sales".into(),
            folder: "INBOX".into(),
            uid: 1,
            message_id: "m-1".into(),
            sender: "buyer@example.com".into(),
            subject: "s".into(),
            body: "b".into(),
            fetched_at: Utc::now(),
        }
    }

    /// Backend returning a fixed classification.
    struct FixedBackend {
        confidence: f64,
        label: IntentLabel,
    }

    #[async_trait]
    impl InferenceBackend for FixedBackend {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn classify(
            &self,
            _subject: &str,
            _body: &str,
        ) -> Result<ClassificationResult, InferenceError> {
            Ok(ClassificationResult {
                label: self.label,
                confidence: self.confidence,
                model_version: "fixed-v1".into(),
            })
        }

        async fn extract(
            &self,
            _subject: &str,
            _body: &str,
        ) -> Result<Vec<RawEntity>, InferenceError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn confidence_at_threshold_is_opportunity_like() {
        let classifier = Classifier::new(
            Arc::new(FixedBackend {
                confidence: 0.6,
                label: IntentLabel::Opportunity,
            }),
            0.6,
        );
        let result = classifier.classify(&message()).await.unwrap();
        assert!(classifier.is_opportunity_like(&result));
    }

    #[tokio::test]
    async fn confidence_below_threshold_short_circuits() {
        let classifier = Classifier::new(
            Arc::new(FixedBackend {
                confidence: 0.59,
                label: IntentLabel::Opportunity,
            }),
            0.6,
        );
        let result = classifier.classify(&message()).await.unwrap();
        assert!(!classifier.is_opportunity_like(&result));
        assert_eq!(result.short_circuit_outcome(), "noise");
    }

    #[tokio::test]
    async fn unavailability_maps_to_classification_error() {
        struct DownBackend;

        #[async_trait]
        impl InferenceBackend for DownBackend {
            fn name(&self) -> &str {
                "down"
            }

            async fn classify(
                &self,
                _subject: &str,
                _body: &str,
            ) -> Result<ClassificationResult, InferenceError> {
                Err(InferenceError::Unavailable {
                    backend: "down".into(),
                    reason: "connection refused".into(),
                })
            }

            async fn extract(
                &self,
                _subject: &str,
                _body: &str,
            ) -> Result<Vec<RawEntity>, InferenceError> {
                Ok(Vec::new())
            }
        }

        let classifier = Classifier::new(Arc::new(DownBackend), 0.6);
        let err = classifier.classify(&message()).await.unwrap_err();
        assert_eq!(err.ledger_reason(), "classification-unavailable");
        assert_eq!(err.severity(), crate::error::Severity::Transient);
    }
}
