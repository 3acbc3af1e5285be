//! Catalog matcher — resolves product mentions against a snapshot.
//!
//! Matching order per entity: exact canonical name, then alias table, then
//! fuzzy similarity over names and aliases. Fuzzy candidates tying within a
//! small margin of the best score are all returned, flagged ambiguous,
//! instead of picking one arbitrarily.

use strsim::normalized_levenshtein;

use crate::catalog::{CatalogSnapshot, normalize};
use crate::pipeline::types::{EntitySet, MatchKind, MatchResult};

#[derive(Debug, Clone, Copy)]
pub struct MatcherConfig {
    /// Minimum normalized edit-distance similarity for a fuzzy candidate.
    pub fuzzy_threshold: f64,
    /// Candidates within this margin of the best fuzzy score tie.
    pub ambiguity_margin: f64,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            fuzzy_threshold: 0.82,
            ambiguity_margin: 0.02,
        }
    }
}

/// Match every product entity in the set against the snapshot.
///
/// The snapshot is read-only; its version is stamped on every result.
pub fn match_entities(
    entities: &EntitySet,
    snapshot: &CatalogSnapshot,
    config: MatcherConfig,
) -> Vec<MatchResult> {
    let mut results = Vec::new();
    if snapshot.is_empty() {
        return results;
    }

    for (index, entity) in entities.products() {
        let query = normalize(if entity.normalized.is_empty() {
            &entity.text
        } else {
            &entity.normalized
        });
        if query.is_empty() {
            continue;
        }

        if let Some(idx) = snapshot.by_name(&query) {
            results.push(make_result(index, snapshot, idx, 1.0, MatchKind::Exact, false));
            continue;
        }

        if let Some(idx) = snapshot.by_alias(&query) {
            results.push(make_result(index, snapshot, idx, 1.0, MatchKind::Alias, false));
            continue;
        }

        results.extend(fuzzy_candidates(index, &query, snapshot, config));
    }

    results
}

/// Fuzzy pass: best similarity per entry over canonical name and aliases,
/// thresholded, with margin-based ties returned as an ambiguous set.
fn fuzzy_candidates(
    entity_index: usize,
    query: &str,
    snapshot: &CatalogSnapshot,
    config: MatcherConfig,
) -> Vec<MatchResult> {
    let mut scored: Vec<(usize, f64)> = Vec::new();

    for (idx, entry) in snapshot.entries().iter().enumerate() {
        let mut best = normalized_levenshtein(query, &normalize(&entry.name));
        for alias in &entry.aliases {
            let sim = normalized_levenshtein(query, &normalize(alias));
            if sim > best {
                best = sim;
            }
        }
        if best >= config.fuzzy_threshold {
            scored.push((idx, best));
        }
    }

    let Some(top) = scored
        .iter()
        .map(|(_, s)| *s)
        .max_by(|a, b| a.total_cmp(b))
    else {
        return Vec::new();
    };

    let tied: Vec<(usize, f64)> = scored
        .into_iter()
        .filter(|(_, s)| top - *s <= config.ambiguity_margin)
        .collect();
    let ambiguous = tied.len() > 1;

    tied.into_iter()
        .map(|(idx, score)| make_result(entity_index, snapshot, idx, score, MatchKind::Fuzzy, ambiguous))
        .collect()
}

fn make_result(
    entity_index: usize,
    snapshot: &CatalogSnapshot,
    entry_idx: usize,
    score: f64,
    kind: MatchKind,
    ambiguous: bool,
) -> MatchResult {
    let entry = snapshot.entry(entry_idx);
    MatchResult {
        entity_index,
        entry_id: entry.id.clone(),
        entry_name: entry.name.clone(),
        score,
        kind,
        ambiguous,
        snapshot_version: snapshot.version().to_string(),
    }
}
