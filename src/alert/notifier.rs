//! Notification delivery — the external notification collaborator seam.

use async_trait::async_trait;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use secrecy::ExposeSecret;
use tracing::info;

use crate::config::{AlertChannel, AlertConfig, SmtpConfig};
use crate::error::{ConfigError, NotifyError};
use crate::pipeline::types::Opportunity;

/// Accepts an opportunity summary for delivery on one channel.
#[async_trait]
pub trait Notifier: Send + Sync {
    fn channel(&self) -> &str;

    async fn notify(&self, opportunity: &Opportunity) -> Result<(), NotifyError>;
}

/// Log-only notifier for dry runs and tests.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    fn channel(&self) -> &str {
        "log"
    }

    async fn notify(&self, opportunity: &Opportunity) -> Result<(), NotifyError> {
        info!(
            id = %opportunity.id,
            sender = %opportunity.sender,
            score = opportunity.composite_score,
            "ALERT: {}",
            opportunity.summary
        );
        Ok(())
    }
}

/// SMTP notifier.
pub struct SmtpNotifier {
    config: SmtpConfig,
    recipient: String,
}

impl SmtpNotifier {
    pub fn new(config: SmtpConfig, recipient: String) -> Self {
        Self { config, recipient }
    }
}

#[async_trait]
impl Notifier for SmtpNotifier {
    fn channel(&self) -> &str {
        "email"
    }

    async fn notify(&self, opportunity: &Opportunity) -> Result<(), NotifyError> {
        let creds = Credentials::new(
            self.config.username.clone(),
            self.config.password.expose_secret().to_string(),
        );

        let transport = SmtpTransport::relay(&self.config.host)
            .map_err(|e| NotifyError::Send {
                channel: "email".into(),
                reason: format!("SMTP relay error: {e}"),
            })?
            .port(self.config.port)
            .credentials(creds)
            .build();

        let email = Message::builder()
            .from(
                self.config
                    .from_address
                    .parse()
                    .map_err(|e| NotifyError::Build(format!("invalid from address: {e}")))?,
            )
            .to(self
                .recipient
                .parse()
                .map_err(|e| NotifyError::Build(format!("invalid recipient: {e}")))?)
            .subject(format!("Opportunity alert: {}", opportunity.subject))
            .body(render_body(opportunity))
            .map_err(|e| NotifyError::Build(e.to_string()))?;

        transport.send(&email).map_err(|e| NotifyError::Send {
            channel: "email".into(),
            reason: e.to_string(),
        })?;

        info!(id = %opportunity.id, to = %self.recipient, "Alert email sent");
        Ok(())
    }
}

/// Plain-text notification body.
fn render_body(opportunity: &Opportunity) -> String {
    let mut body = String::new();
    body.push_str(&opportunity.summary);
    body.push_str("\n\n");
    body.push_str(&format!("From: {}\n", opportunity.sender));
    body.push_str(&format!("Subject: {}\n", opportunity.subject));
    body.push_str(&format!(
        "Classification: {} ({:.2})\n",
        opportunity.label.as_str(),
        opportunity.classification_confidence
    ));
    body.push_str(&format!("Composite score: {:.2}\n", opportunity.composite_score));

    if !opportunity.matches.is_empty() {
        body.push_str("\nMatched catalog entries:\n");
        for m in &opportunity.matches {
            body.push_str(&format!(
                "  - {} (score {:.2}{})\n",
                m.entry_name,
                m.score,
                if m.ambiguous { ", ambiguous" } else { "" }
            ));
        }
    }
    body
}

/// Build the configured notifier.
pub fn create_notifier(
    config: &AlertConfig,
) -> Result<std::sync::Arc<dyn Notifier>, ConfigError> {
    match config.channel {
        AlertChannel::Log => Ok(std::sync::Arc::new(LogNotifier)),
        AlertChannel::Email => {
            let smtp = config.smtp.clone().ok_or_else(|| ConfigError::MissingRequired {
                key: "alerts.smtp".into(),
                hint: "email alerts need an SMTP relay configuration".into(),
            })?;
            let recipient = config
                .recipient
                .clone()
                .ok_or_else(|| ConfigError::MissingRequired {
                    key: "alerts.recipient".into(),
                    hint: "email alerts need a recipient address".into(),
                })?;
            Ok(std::sync::Arc::new(SmtpNotifier::new(smtp, recipient)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    use crate::pipeline::types::{
        AlertDecision, IntentLabel, MatchKind, MatchResult, ReviewStatus,
    };

    fn opportunity() -> Opportunity {
        Opportunity {
            id: Uuid::new_v4(),
            mailbox: "sales".into(),
            message_id: "m-1".into(),
            sender: "buyer@example.com".into(),
            subject: "Quotation request".into(),
            summary: "Opportunity from buyer@example.com for supply of WidgetPro X1".into(),
            label: IntentLabel::Opportunity,
            classification_confidence: 0.95,
            headline_entities: Vec::new(),
            matches: vec![MatchResult {
                entity_index: 0,
                entry_id: "sku-100".into(),
                entry_name: "WidgetPro X1".into(),
                score: 1.0,
                kind: MatchKind::Alias,
                ambiguous: false,
                snapshot_version: "vabc".into(),
            }],
            composite_score: 0.97,
            decision: AlertDecision::Alerted,
            dedup_key: "k".into(),
            notified: false,
            review_status: ReviewStatus::PendingReview,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn body_includes_summary_and_matches() {
        let body = render_body(&opportunity());
        assert!(body.contains("WidgetPro X1"));
        assert!(body.contains("Composite score: 0.97"));
        assert!(!body.contains("ambiguous"));
    }

    #[test]
    fn ambiguous_matches_are_marked_in_body() {
        let mut opp = opportunity();
        opp.matches[0].ambiguous = true;
        assert!(render_body(&opp).contains("ambiguous"));
    }

    #[tokio::test]
    async fn log_notifier_always_succeeds() {
        assert!(LogNotifier.notify(&opportunity()).await.is_ok());
        assert_eq!(LogNotifier.channel(), "log");
    }

    #[test]
    fn create_notifier_respects_channel() {
        let log = create_notifier(&AlertConfig::default()).unwrap();
        assert_eq!(log.channel(), "log");
    }
}
