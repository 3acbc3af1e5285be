//! Alert/opportunity generator.
//!
//! Folds classification and catalog matches into an `Opportunity`, applies
//! the alert threshold and dedup window, and drives the persist-then-notify
//! sequence whose crash window stays detectable through the notified flag.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::pipeline::types::{
    AlertDecision, ClassificationResult, EntitySet, MatchResult, Opportunity, RawMessage,
    RecordOutcome, ReviewStatus, dedup_key,
};
use crate::store::Store;

pub mod notifier;

pub use notifier::{LogNotifier, Notifier, SmtpNotifier, create_notifier};

/// Outcome of evaluating one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlertOutcome {
    pub decision: AlertDecision,
    /// False when the dedup window suppressed a would-be duplicate and no
    /// new row was written.
    pub recorded: bool,
    pub notified: bool,
}

/// Evaluates composite scores and emits alerts.
pub struct OpportunityGenerator {
    store: Arc<dyn Store>,
    notifier: Arc<dyn Notifier>,
    config: PipelineConfig,
}

impl OpportunityGenerator {
    pub fn new(store: Arc<dyn Store>, notifier: Arc<dyn Notifier>, config: PipelineConfig) -> Self {
        Self {
            store,
            notifier,
            config,
        }
    }

    /// Composite score: weighted classification confidence plus weighted
    /// best match score, ambiguous best matches dampened.
    pub fn composite_score(
        &self,
        classification: &ClassificationResult,
        matches: &[MatchResult],
    ) -> f64 {
        let best = matches
            .iter()
            .max_by(|a, b| a.score.total_cmp(&b.score));
        let match_component = best
            .map(|m| {
                if m.ambiguous {
                    m.score * self.config.ambiguity_damping
                } else {
                    m.score
                }
            })
            .unwrap_or(0.0);

        (self.config.classification_weight * classification.confidence
            + self.config.match_weight * match_component)
            .clamp(0.0, 1.0)
    }

    /// Evaluate a message and persist/notify accordingly.
    ///
    /// Alerted requires the composite score to clear the threshold AND the
    /// dedup key to be absent within the active window; the UNIQUE insert
    /// is what enforces the second half, so concurrent evaluations cannot
    /// both alert.
    pub async fn evaluate(
        &self,
        message: &RawMessage,
        classification: &ClassificationResult,
        entities: &EntitySet,
        matches: &[MatchResult],
    ) -> Result<AlertOutcome, PipelineError> {
        let composite = self.composite_score(classification, matches);
        let best = matches
            .iter()
            .max_by(|a, b| a.score.total_cmp(&b.score));

        let key = dedup_key(
            &message.sender,
            best.map(|m| m.entry_id.as_str()),
            message.fetched_at,
            self.config.dedup_window_secs,
        );

        let decision = if composite >= self.config.alert_threshold {
            AlertDecision::Alerted
        } else {
            AlertDecision::Suppressed
        };

        let opportunity = Opportunity {
            id: Uuid::new_v4(),
            mailbox: message.mailbox.clone(),
            message_id: message.message_id.clone(),
            sender: message.sender.clone(),
            subject: message.subject.clone(),
            summary: render_summary(message, entities, matches),
            label: classification.label,
            classification_confidence: classification.confidence,
            headline_entities: entities.headline().cloned().collect(),
            matches: matches.to_vec(),
            composite_score: composite,
            decision,
            dedup_key: key,
            notified: false,
            review_status: ReviewStatus::PendingReview,
            created_at: Utc::now(),
        };

        match self
            .store
            .insert_opportunity(&opportunity)
            .await
            .map_err(PipelineError::Store)?
        {
            RecordOutcome::Duplicate => {
                // An opportunity already holds this dedup key within the
                // window: suppressed, nothing written, nothing sent.
                debug!(
                    key = %opportunity.dedup_key,
                    "Dedup window hit, suppressing"
                );
                Ok(AlertOutcome {
                    decision: AlertDecision::Suppressed,
                    recorded: false,
                    notified: false,
                })
            }
            RecordOutcome::New if decision == AlertDecision::Alerted => {
                // Persisted first, notified second: a crash in between is
                // detectable as (alerted AND NOT notified) and retryable.
                let notified = match self.notifier.notify(&opportunity).await {
                    Ok(()) => {
                        self.store
                            .mark_notified(opportunity.id)
                            .await
                            .map_err(PipelineError::Store)?;
                        true
                    }
                    Err(e) => {
                        warn!(
                            id = %opportunity.id,
                            "Notification failed, flagged for retry: {e}"
                        );
                        false
                    }
                };
                info!(
                    id = %opportunity.id,
                    score = composite,
                    notified = notified,
                    "Opportunity alerted"
                );
                Ok(AlertOutcome {
                    decision: AlertDecision::Alerted,
                    recorded: true,
                    notified,
                })
            }
            RecordOutcome::New => {
                debug!(
                    id = %opportunity.id,
                    score = composite,
                    threshold = self.config.alert_threshold,
                    "Opportunity suppressed below threshold"
                );
                Ok(AlertOutcome {
                    decision: AlertDecision::Suppressed,
                    recorded: true,
                    notified: false,
                })
            }
        }
    }
}

/// Human-readable one-liner for notifications and review lists.
fn render_summary(message: &RawMessage, entities: &EntitySet, matches: &[MatchResult]) -> String {
    let products: Vec<&str> = if matches.is_empty() {
        entities
            .headline()
            .filter(|e| e.kind == crate::pipeline::types::EntityKind::Product)
            .map(|e| e.text.as_str())
            .collect()
    } else {
        let mut names: Vec<&str> = matches.iter().map(|m| m.entry_name.as_str()).collect();
        names.dedup();
        names
    };

    if products.is_empty() {
        format!("Opportunity from {}", message.sender)
    } else {
        format!(
            "Opportunity from {} for supply of {}",
            message.sender,
            products.join(", ")
        )
    }
}
