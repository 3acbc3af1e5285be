//! HTTP inference client — JSON over HTTP to a remote scoring service.
//!
//! The service is expected to answer within the configured timeout or the
//! call is treated as transient unavailability and retried by the queue.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::InferenceError;
use crate::inference::{InferenceBackend, RawEntity};
use crate::pipeline::types::{ClassificationResult, EntityKind, IntentLabel};

const BACKEND_NAME: &str = "remote";

/// Remote scoring client.
pub struct HttpInference {
    client: reqwest::Client,
    endpoint: String,
    timeout: Duration,
}

#[derive(Debug, Serialize)]
struct ScoreRequest<'a> {
    subject: &'a str,
    body: &'a str,
}

#[derive(Debug, Deserialize)]
struct ClassifyResponse {
    label: String,
    confidence: f64,
    model_version: String,
}

#[derive(Debug, Deserialize)]
struct ExtractResponse {
    entities: Vec<WireEntity>,
}

#[derive(Debug, Deserialize)]
struct WireEntity {
    kind: String,
    start: usize,
    end: usize,
    text: String,
    normalized: String,
    confidence: f64,
}

impl HttpInference {
    pub fn new(endpoint: String, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            timeout,
        }
    }

    async fn post<T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        request: &ScoreRequest<'_>,
    ) -> Result<T, InferenceError> {
        let url = format!("{}/{path}", self.endpoint);
        let response = self
            .client
            .post(&url)
            .timeout(self.timeout)
            .json(request)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        if status.is_server_error() || status.as_u16() == 429 {
            return Err(InferenceError::Unavailable {
                backend: BACKEND_NAME.to_string(),
                reason: format!("HTTP {status}"),
            });
        }
        if !status.is_success() {
            return Err(InferenceError::InvalidResponse {
                backend: BACKEND_NAME.to_string(),
                reason: format!("HTTP {status}"),
            });
        }

        response
            .json::<T>()
            .await
            .map_err(|e| InferenceError::InvalidResponse {
                backend: BACKEND_NAME.to_string(),
                reason: e.to_string(),
            })
    }

    fn transport_error(&self, e: reqwest::Error) -> InferenceError {
        if e.is_timeout() {
            InferenceError::Timeout {
                backend: BACKEND_NAME.to_string(),
                timeout: self.timeout,
            }
        } else {
            InferenceError::Unavailable {
                backend: BACKEND_NAME.to_string(),
                reason: e.to_string(),
            }
        }
    }
}

fn parse_label(label: &str) -> Result<IntentLabel, InferenceError> {
    IntentLabel::parse(label).ok_or_else(|| InferenceError::InvalidResponse {
        backend: BACKEND_NAME.to_string(),
        reason: format!("unknown intent label '{label}'"),
    })
}

fn parse_kind(kind: &str) -> Result<EntityKind, InferenceError> {
    match kind {
        "organization" => Ok(EntityKind::Organization),
        "product" => Ok(EntityKind::Product),
        "quantity" => Ok(EntityKind::Quantity),
        "price" => Ok(EntityKind::Price),
        "contact" => Ok(EntityKind::Contact),
        other => Err(InferenceError::InvalidResponse {
            backend: BACKEND_NAME.to_string(),
            reason: format!("unknown entity kind '{other}'"),
        }),
    }
}

#[async_trait]
impl InferenceBackend for HttpInference {
    fn name(&self) -> &str {
        BACKEND_NAME
    }

    async fn classify(
        &self,
        subject: &str,
        body: &str,
    ) -> Result<ClassificationResult, InferenceError> {
        let response: ClassifyResponse = self
            .post("classify", &ScoreRequest { subject, body })
            .await?;

        if !(0.0..=1.0).contains(&response.confidence) {
            return Err(InferenceError::InvalidResponse {
                backend: BACKEND_NAME.to_string(),
                reason: format!("confidence {} outside [0, 1]", response.confidence),
            });
        }

        Ok(ClassificationResult {
            label: parse_label(&response.label)?,
            confidence: response.confidence,
            model_version: response.model_version,
        })
    }

    async fn extract(&self, subject: &str, body: &str) -> Result<Vec<RawEntity>, InferenceError> {
        let response: ExtractResponse = self
            .post("extract", &ScoreRequest { subject, body })
            .await?;

        response
            .entities
            .into_iter()
            .map(|e| {
                Ok(RawEntity {
                    kind: parse_kind(&e.kind)?,
                    start: e.start,
                    end: e.end,
                    text: e.text,
                    normalized: e.normalized,
                    confidence: e.confidence,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_trailing_slash_is_trimmed() {
        let backend = HttpInference::new("http://scorer:9090/".into(), Duration::from_secs(5));
        assert_eq!(backend.endpoint, "http://scorer:9090");
    }

    #[test]
    fn unknown_label_is_invalid_response() {
        let err = parse_label("spam").unwrap_err();
        assert!(!err.is_transient());
    }

    #[test]
    fn known_kinds_parse() {
        assert_eq!(parse_kind("product").unwrap(), EntityKind::Product);
        assert_eq!(parse_kind("contact").unwrap(), EntityKind::Contact);
        assert!(parse_kind("emotion").is_err());
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_transient() {
        // Port 1 is never listening; connection errors map to Unavailable.
        let backend = HttpInference::new("http://127.0.0.1:1".into(), Duration::from_secs(1));
        let err = backend.classify("s", "b").await.unwrap_err();
        assert!(err.is_transient());
    }
}
