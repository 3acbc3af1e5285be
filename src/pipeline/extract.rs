//! Entity extraction stage — typed entities with low-confidence flagging.

use std::sync::Arc;

use tracing::debug;

use crate::error::PipelineError;
use crate::inference::InferenceBackend;
use crate::pipeline::types::{Entity, EntitySet, RawMessage};

/// Wraps the inference seam with the per-entity confidence floor.
pub struct Extractor {
    backend: Arc<dyn InferenceBackend>,
    confidence_floor: f64,
}

impl Extractor {
    pub fn new(backend: Arc<dyn InferenceBackend>, confidence_floor: f64) -> Self {
        Self {
            backend,
            confidence_floor,
        }
    }

    /// Extract entities. Entities under the floor are retained but flagged:
    /// they still feed the matcher, never the opportunity headline. An
    /// empty set is a valid result.
    pub async fn extract(&self, message: &RawMessage) -> Result<EntitySet, PipelineError> {
        let raw = self
            .backend
            .extract(&message.subject, &message.body)
            .await
            .map_err(PipelineError::Extraction)?;

        let entities: Vec<Entity> = raw
            .into_iter()
            .map(|e| {
                let low_confidence = e.confidence < self.confidence_floor;
                Entity {
                    kind: e.kind,
                    start: e.start,
                    end: e.end,
                    text: e.text,
                    normalized: e.normalized,
                    confidence: e.confidence,
                    low_confidence,
                }
            })
            .collect();

        debug!(
            key = %message.key(),
            count = entities.len(),
            low_confidence = entities.iter().filter(|e| e.low_confidence).count(),
            "Extracted entities"
        );
        Ok(EntitySet::new(entities))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;

    use crate::error::InferenceError;
    use crate::inference::RawEntity;
    use crate::pipeline::types::{ClassificationResult, EntityKind, IntentLabel};

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

    struct FixedEntities(Vec<RawEntity>);

    #[async_trait]
    impl InferenceBackend for FixedEntities {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn classify(
            &self,
            _subject: &str,
            _body: &str,
        ) -> Result<ClassificationResult, InferenceError> {
            Ok(ClassificationResult {
                label: IntentLabel::Opportunity,
                confidence: 0.9,
                model_version: "fixed-v1".into(),
            })
        }

        async fn extract(
            &self,
            _subject: &str,
            _body: &str,
        ) -> Result<Vec<RawEntity>, InferenceError> {
            Ok(self.0.clone())
        }
    }

    fn raw_entity(kind: EntityKind, confidence: f64) -> RawEntity {
        RawEntity {
            kind,
            start: 0,
            end: 4,
            text: "text".into(),
            normalized: "text".into(),
            confidence,
        }
    }

    #[tokio::test]
    async fn entities_below_floor_are_flagged_not_dropped() {
        let extractor = Extractor::new(
            Arc::new(FixedEntities(vec![
                raw_entity(EntityKind::Product, 0.9),
                raw_entity(EntityKind::Organization, 0.5),
            ])),
            0.65,
        );
        let set = extractor.extract(&message()).await.unwrap();

        assert_eq!(set.entities.len(), 2, "low-confidence entity retained");
        assert!(!set.entities[0].low_confidence);
        assert!(set.entities[1].low_confidence);
        assert_eq!(set.headline().count(), 1);
    }

    #[tokio::test]
    async fn floor_is_exclusive_at_the_boundary() {
        let extractor = Extractor::new(
            Arc::new(FixedEntities(vec![raw_entity(EntityKind::Product, 0.65)])),
            0.65,
        );
        let set = extractor.extract(&message()).await.unwrap();
        assert!(!set.entities[0].low_confidence);
    }

    #[tokio::test]
    async fn empty_extraction_is_valid() {
        let extractor = Extractor::new(Arc::new(FixedEntities(Vec::new())), 0.65);
        let set = extractor.extract(&message()).await.unwrap();
        assert!(set.is_empty());
    }
}
