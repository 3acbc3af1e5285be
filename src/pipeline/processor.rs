//! Per-message pipeline runner.
//!
//! Stages run sequentially: classify → extract → match → evaluate. Every
//! stage records its artifact and advances the ledger before the next one
//! runs, so a redelivered or cancelled job resumes from the last durable
//! state instead of redoing (or double-doing) work.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::alert::OpportunityGenerator;
use crate::catalog::{CatalogHandle, MatcherConfig, match_entities};
use crate::error::PipelineError;
use crate::pipeline::classify::Classifier;
use crate::pipeline::extract::Extractor;
use crate::pipeline::types::{
    ClassificationResult, EntitySet, LedgerState, MatchResult, MessageKey, RawMessage,
};
use crate::store::Store;

/// How a process job ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Pipeline ran to a terminal ledger state with this outcome label.
    Completed { outcome: String },
    /// The ledger entry was already terminal — duplicate work, no-op.
    AlreadyTerminal,
    /// Another worker holds the per-message lease — exit without side
    /// effects; the holder (or lease expiry) finishes the job.
    LeaseHeld,
}

/// Runs the staged pipeline for one message at a time.
pub struct MessageProcessor {
    store: Arc<dyn Store>,
    classifier: Classifier,
    extractor: Extractor,
    catalog: Arc<CatalogHandle>,
    generator: OpportunityGenerator,
    matcher_config: MatcherConfig,
    lease_ttl: Duration,
}

impl MessageProcessor {
    pub fn new(
        store: Arc<dyn Store>,
        classifier: Classifier,
        extractor: Extractor,
        catalog: Arc<CatalogHandle>,
        generator: OpportunityGenerator,
        matcher_config: MatcherConfig,
        lease_ttl: Duration,
    ) -> Self {
        Self {
            store,
            classifier,
            extractor,
            catalog,
            generator,
            matcher_config,
            lease_ttl,
        }
    }

    /// Process one message under its lease.
    ///
    /// Safe under at-least-once delivery: terminal entries short-circuit,
    /// concurrent attempts lose the lease race, and completed stages are
    /// reloaded rather than recomputed.
    pub async fn process(
        &self,
        key: &MessageKey,
        holder: &str,
    ) -> Result<ProcessOutcome, PipelineError> {
        if self
            .store
            .is_terminal(key)
            .await
            .map_err(PipelineError::Store)?
        {
            debug!(key = %key, "Ledger entry already terminal, skipping");
            return Ok(ProcessOutcome::AlreadyTerminal);
        }

        if !self
            .store
            .acquire_lease(key, holder, self.lease_ttl)
            .await
            .map_err(PipelineError::Store)?
        {
            debug!(key = %key, holder = holder, "Lease held elsewhere, backing off");
            return Ok(ProcessOutcome::LeaseHeld);
        }

        // Re-check under the lease: the previous holder may have finished
        // between our first check and the acquire.
        let result = match self.store.is_terminal(key).await {
            Ok(true) => {
                debug!(key = %key, "Completed while waiting for lease, skipping");
                Ok(ProcessOutcome::AlreadyTerminal)
            }
            Ok(false) => self.run_stages(key).await,
            Err(e) => Err(PipelineError::Store(e)),
        };

        if let Err(e) = self.store.release_lease(key, holder).await {
            tracing::warn!(key = %key, "Failed to release lease: {e}");
        }

        result
    }

    async fn run_stages(&self, key: &MessageKey) -> Result<ProcessOutcome, PipelineError> {
        let message = self
            .store
            .message(key)
            .await
            .map_err(PipelineError::Store)?
            .ok_or_else(|| PipelineError::MissingPayload {
                key: key.to_string(),
            })?;
        let entry = self
            .store
            .ledger_entry(key)
            .await
            .map_err(PipelineError::Store)?
            .ok_or_else(|| PipelineError::MissingLedgerEntry {
                key: key.to_string(),
            })?;
        let state = entry.state;

        // ── Classification ──────────────────────────────────────────
        let classification = self.classification_stage(key, &message, state).await?;

        if !self.classifier.is_opportunity_like(&classification) {
            let outcome = classification.short_circuit_outcome();
            self.store
                .advance(key, LedgerState::Completed, Some(outcome))
                .await
                .map_err(PipelineError::Store)?;
            info!(key = %key, outcome = outcome, "Short-circuited below noise threshold");
            return Ok(ProcessOutcome::Completed {
                outcome: outcome.to_string(),
            });
        }

        // ── Extraction ──────────────────────────────────────────────
        let entities = self.extraction_stage(key, &message, state).await?;

        // ── Catalog matching ────────────────────────────────────────
        let matches = self.matching_stage(key, &entities, state).await?;

        // ── Evaluate & alert ────────────────────────────────────────
        let outcome = self
            .generator
            .evaluate(&message, &classification, &entities, &matches)
            .await?;

        let label = outcome.decision.as_str();
        self.store
            .advance(key, LedgerState::Completed, Some(label))
            .await
            .map_err(PipelineError::Store)?;

        info!(key = %key, outcome = label, "Pipeline complete");
        Ok(ProcessOutcome::Completed {
            outcome: label.to_string(),
        })
    }

    /// Run or resume the classification stage.
    async fn classification_stage(
        &self,
        key: &MessageKey,
        message: &RawMessage,
        state: LedgerState,
    ) -> Result<ClassificationResult, PipelineError> {
        if state.rank() >= LedgerState::Classified.rank() {
            if let Some(stored) = self
                .store
                .classification(key)
                .await
                .map_err(PipelineError::Store)?
            {
                debug!(key = %key, "Reusing stored classification");
                return Ok(stored);
            }
        }

        let result = self.classifier.classify(message).await?;
        self.store
            .save_classification(key, &result)
            .await
            .map_err(PipelineError::Store)?;
        self.store
            .advance(key, LedgerState::Classified, None)
            .await
            .map_err(PipelineError::Store)?;
        Ok(result)
    }

    /// Run or resume the extraction stage.
    async fn extraction_stage(
        &self,
        key: &MessageKey,
        message: &RawMessage,
        state: LedgerState,
    ) -> Result<EntitySet, PipelineError> {
        if state.rank() >= LedgerState::Extracted.rank() {
            if let Some(stored) = self
                .store
                .entities(key)
                .await
                .map_err(PipelineError::Store)?
            {
                debug!(key = %key, "Reusing stored entity set");
                return Ok(stored);
            }
        }

        let entities = self.extractor.extract(message).await?;
        self.store
            .save_entities(key, &entities)
            .await
            .map_err(PipelineError::Store)?;
        self.store
            .advance(key, LedgerState::Extracted, None)
            .await
            .map_err(PipelineError::Store)?;
        Ok(entities)
    }

    /// Run or resume the matching stage against the current snapshot.
    async fn matching_stage(
        &self,
        key: &MessageKey,
        entities: &EntitySet,
        state: LedgerState,
    ) -> Result<Vec<MatchResult>, PipelineError> {
        if state.rank() >= LedgerState::Matched.rank() {
            if let Some(stored) = self
                .store
                .matches(key)
                .await
                .map_err(PipelineError::Store)?
            {
                debug!(key = %key, "Reusing stored matches");
                return Ok(stored);
            }
        }

        let snapshot = self.catalog.current().await;
        let matches = match_entities(entities, &snapshot, self.matcher_config);
        self.store
            .save_matches(key, &matches, snapshot.version())
            .await
            .map_err(PipelineError::Store)?;
        self.store
            .advance(key, LedgerState::Matched, None)
            .await
            .map_err(PipelineError::Store)?;
        Ok(matches)
    }
}
