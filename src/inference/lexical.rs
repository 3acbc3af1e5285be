//! Deterministic lexical scorer — keyword and regex based.
//!
//! Stands in when no remote scoring service is configured, and anchors the
//! test suite. Deliberately conservative: a handful of intent keyword
//! families and span-accurate entity regexes.

use async_trait::async_trait;
use regex::Regex;

use crate::error::InferenceError;
use crate::inference::{InferenceBackend, RawEntity};
use crate::pipeline::types::{ClassificationResult, EntityKind, IntentLabel};

const MODEL_VERSION: &str = "lexical-v1";

/// Keyword family for intent scoring. Confidence grows with the number of
/// distinct keywords hit, capped so it stays inside [0, 1].
struct IntentFamily {
    label: IntentLabel,
    keywords: &'static [&'static str],
    base: f64,
    boost: f64,
    cap: f64,
}

const FAMILIES: &[IntentFamily] = &[
    IntentFamily {
        label: IntentLabel::Opportunity,
        keywords: &[
            "quote",
            "quotation",
            "cotizaci",
            "rfq",
            "tender",
            "licitaci",
            "pricing for",
            "price for",
            "units of",
            "purchase order",
            "requerimiento",
            "need",
            "supply of",
            "suministro",
        ],
        base: 0.85,
        boost: 0.04,
        cap: 0.97,
    },
    IntentFamily {
        label: IntentLabel::Noise,
        keywords: &[
            "unsubscribe",
            "newsletter",
            "out of office",
            "automatic reply",
            "auto-reply",
            "no-reply",
            "feriado",
        ],
        base: 0.9,
        boost: 0.02,
        cap: 0.98,
    },
];

/// Lexical inference backend. Compiles its regexes once at construction.
pub struct LexicalInference {
    product_re: Regex,
    quantity_re: Regex,
    price_re: Regex,
    contact_re: Regex,
    organization_re: Regex,
}

impl LexicalInference {
    pub fn new() -> Self {
        Self {
            // Product phrase following a request verb, up to punctuation.
            product_re: Regex::new(
                r"(?i)(?:units? of|quot(?:e|ation) for|pricing for|price for|supply of|suministro de|cotizaci[oó]n (?:de|para))\s+([A-Za-z0-9][A-Za-z0-9 \-]{1,60}?)(?:\s*(?:[.,;\r\n]|$))",
            )
            .expect("product regex"),
            quantity_re: Regex::new(r"(?i)\b(\d{1,7})\s*(?:units?|unidades|pcs|pieces)\b")
                .expect("quantity regex"),
            price_re: Regex::new(r"(?i)(?:\$|usd\s|eur\s|€)\s*([0-9][0-9,]*(?:\.[0-9]+)?)")
                .expect("price regex"),
            contact_re: Regex::new(r"[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}")
                .expect("contact regex"),
            // Organization names with a legal-form or sector marker.
            organization_re: Regex::new(
                r"\b(?:(?:Constructora|Minera|Grupo)\s+[A-Z][A-Za-z0-9]+\b|[A-Z][A-Za-z0-9]+(?:\s+[A-Z][A-Za-z0-9]+)*\s+(?:Corp\b|Inc\b|Ltd\b|LLC\b|GmbH\b|S\.A\.))",
            )
            .expect("organization regex"),
        }
    }

    fn entity(
        &self,
        kind: EntityKind,
        m: &regex::Match<'_>,
        normalized: String,
        confidence: f64,
    ) -> RawEntity {
        RawEntity {
            kind,
            start: m.start(),
            end: m.end(),
            text: m.as_str().trim().to_string(),
            normalized,
            confidence,
        }
    }
}

impl Default for LexicalInference {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InferenceBackend for LexicalInference {
    fn name(&self) -> &str {
        "lexical"
    }

    async fn classify(
        &self,
        subject: &str,
        body: &str,
    ) -> Result<ClassificationResult, InferenceError> {
        let text = format!("{subject}\n{body}").to_lowercase();

        for family in FAMILIES {
            let hits = family
                .keywords
                .iter()
                .filter(|kw| text.contains(*kw))
                .count();
            if hits > 0 {
                let confidence =
                    (family.base + family.boost * (hits as f64 - 1.0)).min(family.cap);
                return Ok(ClassificationResult {
                    label: family.label,
                    confidence,
                    model_version: MODEL_VERSION.to_string(),
                });
            }
        }

        Ok(ClassificationResult {
            label: IntentLabel::Other,
            confidence: 0.6,
            model_version: MODEL_VERSION.to_string(),
        })
    }

    async fn extract(
        &self,
        _subject: &str,
        body: &str,
    ) -> Result<Vec<RawEntity>, InferenceError> {
        let mut entities = Vec::new();

        for caps in self.product_re.captures_iter(body) {
            if let Some(m) = caps.get(1) {
                let text = m.as_str().trim();
                entities.push(RawEntity {
                    kind: EntityKind::Product,
                    start: m.start(),
                    end: m.start() + text.len(),
                    text: text.to_string(),
                    normalized: text.to_lowercase(),
                    confidence: 0.85,
                });
            }
        }

        for caps in self.quantity_re.captures_iter(body) {
            if let Some(m) = caps.get(1) {
                entities.push(self.entity(
                    EntityKind::Quantity,
                    &m,
                    m.as_str().to_string(),
                    0.95,
                ));
            }
        }

        for caps in self.price_re.captures_iter(body) {
            if let Some(m) = caps.get(1) {
                entities.push(self.entity(
                    EntityKind::Price,
                    &m,
                    m.as_str().replace(',', ""),
                    0.9,
                ));
            }
        }

        for m in self.contact_re.find_iter(body) {
            entities.push(self.entity(
                EntityKind::Contact,
                &m,
                m.as_str().to_lowercase(),
                0.98,
            ));
        }

        for m in self.organization_re.find_iter(body) {
            entities.push(self.entity(
                EntityKind::Organization,
                &m,
                m.as_str().to_string(),
                0.6,
            ));
        }

        // Stable order: by source position, then kind discriminant.
        entities.sort_by_key(|e| (e.start, e.kind as u8));
        Ok(entities)
    }
}
