//! Backend-independent result fusion.
//!
//! Two strategies: reciprocal-rank fusion (default, score-scale agnostic)
//! and weighted min-max-normalized scoring. Both end with overlap-aware
//! deduplication and a stable 1..N ranking.

use std::collections::HashMap;

use serde::Serialize;

use crate::search::backend::{BackendKind, SearchHit};

/// RRF constant; contribution of rank r is 1/(k + r).
const RRF_K: f64 = 60.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStrategy {
    ReciprocalRankFusion,
    Weighted,
}

/// A fused result spanning one or more backends.
#[derive(Debug, Clone, Serialize)]
pub struct MergedResult {
    pub rank: usize,
    pub file_path: String,
    pub start_line: Option<u32>,
    pub end_line: Option<u32>,
    pub content: String,
    pub score: f64,
    pub backends_found: Vec<BackendKind>,
    /// Highest backend-native score seen per backend.
    pub backend_scores: HashMap<String, f64>,
    pub symbol: Option<String>,
}

impl MergedResult {
    fn lines_overlap(&self, other: &Self) -> bool {
        match (self.start_line, self.end_line, other.start_line, other.end_line) {
            (Some(s1), Some(e1), Some(s2), Some(e2)) => s1 <= e2 && e1 >= s2,
            // Missing line info on either side collides with any same-path result.
            _ => true,
        }
    }

    fn absorb(&mut self, other: MergedResult) {
        // Keep the higher-scored payload.
        if other.score > self.score {
            self.content = other.content;
            self.symbol = other.symbol;
            self.score = other.score;
        }
        for kind in other.backends_found {
            if !self.backends_found.contains(&kind) {
                self.backends_found.push(kind);
            }
        }
        for (backend, score) in other.backend_scores {
            let entry = self.backend_scores.entry(backend).or_insert(score);
            if score > *entry {
                *entry = score;
            }
        }
        // Widen to the union of the two ranges.
        self.start_line = match (self.start_line, other.start_line) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        self.end_line = match (self.end_line, other.end_line) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
    }
}

pub struct ResultMerger {
    strategy: MergeStrategy,
    weights: HashMap<BackendKind, f64>,
}

impl ResultMerger {
    pub fn new(strategy: MergeStrategy) -> Self {
        Self {
            strategy,
            weights: HashMap::new(),
        }
    }

    pub fn rrf() -> Self {
        Self::new(MergeStrategy::ReciprocalRankFusion)
    }

    pub fn weighted() -> Self {
        Self::new(MergeStrategy::Weighted)
    }

    /// Override a backend's weight for the weighted strategy.
    pub fn with_weight(mut self, kind: BackendKind, weight: f64) -> Self {
        self.weights.insert(kind, weight);
        self
    }

    fn weight(&self, kind: BackendKind) -> f64 {
        self.weights
            .get(&kind)
            .copied()
            .unwrap_or_else(|| kind.default_weight())
    }

    /// Fuse per-backend ranked lists into one deduplicated ranking.
    pub fn merge(
        &self,
        backend_results: Vec<(BackendKind, Vec<SearchHit>)>,
        max_results: usize,
    ) -> Vec<MergedResult> {
        let total_backends = backend_results.iter().filter(|(_, r)| !r.is_empty()).count();
        let candidates = match self.strategy {
            MergeStrategy::ReciprocalRankFusion => self.fuse_rrf(&backend_results),
            MergeStrategy::Weighted => self.fuse_weighted(&backend_results, total_backends),
        };

        let mut merged = dedup_overlapping(candidates);
        merged.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.file_path.cmp(&b.file_path))
        });
        merged.truncate(max_results);
        for (i, r) in merged.iter_mut().enumerate() {
            r.rank = i + 1;
            r.score = clamp01(r.score);
        }
        merged
    }

    fn fuse_rrf(&self, backend_results: &[(BackendKind, Vec<SearchHit>)]) -> Vec<MergedResult> {
        // Keyed by (path, exact range); overlap handling comes later.
        let mut by_identity: HashMap<(String, Option<u32>, Option<u32>), MergedResult> =
            HashMap::new();
        for (kind, hits) in backend_results {
            for (rank, hit) in hits.iter().enumerate() {
                let rrf = 1.0 / (RRF_K + rank as f64 + 1.0);
                let key = (hit.file_path.clone(), hit.start_line, hit.end_line);
                by_identity
                    .entry(key)
                    .and_modify(|m| {
                        m.score += rrf;
                        if !m.backends_found.contains(kind) {
                            m.backends_found.push(*kind);
                        }
                        let entry = m
                            .backend_scores
                            .entry(kind.as_str().to_string())
                            .or_insert(hit.score);
                        if hit.score > *entry {
                            *entry = hit.score;
                        }
                    })
                    .or_insert_with(|| candidate(*kind, hit, rrf));
            }
        }
        by_identity.into_values().collect()
    }

    fn fuse_weighted(
        &self,
        backend_results: &[(BackendKind, Vec<SearchHit>)],
        total_backends: usize,
    ) -> Vec<MergedResult> {
        let mut by_identity: HashMap<(String, Option<u32>, Option<u32>), MergedResult> =
            HashMap::new();
        for (kind, hits) in backend_results {
            let scores: Vec<f64> = hits.iter().map(|h| h.score).collect();
            let normalized = min_max_normalize(&scores);
            for (hit, norm) in hits.iter().zip(normalized) {
                let contribution = self.weight(*kind) * norm;
                let key = (hit.file_path.clone(), hit.start_line, hit.end_line);
                by_identity
                    .entry(key)
                    .and_modify(|m| {
                        m.score += contribution;
                        if !m.backends_found.contains(kind) {
                            m.backends_found.push(*kind);
                        }
                        m.backend_scores
                            .insert(kind.as_str().to_string(), hit.score);
                    })
                    .or_insert_with(|| candidate(*kind, hit, contribution));
            }
        }
        // Penalize results missing from some backends.
        let mut out: Vec<MergedResult> = by_identity.into_values().collect();
        if total_backends > 0 {
            for r in &mut out {
                r.score *= r.backends_found.len() as f64 / total_backends as f64;
            }
        }
        out
    }
}

impl Default for ResultMerger {
    fn default() -> Self {
        Self::rrf()
    }
}

fn candidate(kind: BackendKind, hit: &SearchHit, score: f64) -> MergedResult {
    let mut backend_scores = HashMap::new();
    backend_scores.insert(kind.as_str().to_string(), hit.score);
    MergedResult {
        rank: 0,
        file_path: hit.file_path.clone(),
        start_line: hit.start_line,
        end_line: hit.end_line,
        content: hit.content.clone(),
        score,
        backends_found: vec![kind],
        backend_scores,
        symbol: hit.symbol.clone(),
    }
}

/// Collapse results that share a path and overlap in line range.
fn dedup_overlapping(candidates: Vec<MergedResult>) -> Vec<MergedResult> {
    let mut by_path: HashMap<String, Vec<MergedResult>> = HashMap::new();
    for c in candidates {
        by_path.entry(c.file_path.clone()).or_default().push(c);
    }

    let mut out = Vec::new();
    for (_, mut group) in by_path {
        group.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        let mut kept: Vec<MergedResult> = Vec::new();
        for item in group {
            if let Some(existing) = kept.iter_mut().find(|k| k.lines_overlap(&item)) {
                existing.absorb(item);
            } else {
                kept.push(item);
            }
        }
        out.extend(kept);
    }
    out
}

// --- normalization utilities ---------------------------------------------

pub fn clamp01(v: f64) -> f64 {
    v.clamp(0.0, 1.0)
}

/// Scale to [0, 1] within the list. A constant list maps to all-ones.
pub fn min_max_normalize(scores: &[f64]) -> Vec<f64> {
    let Some(min) = scores.iter().copied().reduce(f64::min) else {
        return vec![];
    };
    let max = scores.iter().copied().reduce(f64::max).unwrap();
    if (max - min).abs() < f64::EPSILON {
        return vec![1.0; scores.len()];
    }
    scores.iter().map(|s| (s - min) / (max - min)).collect()
}

/// Standard scores; a zero-variance list maps to all-zeros.
pub fn z_score_normalize(scores: &[f64]) -> Vec<f64> {
    if scores.is_empty() {
        return vec![];
    }
    let mean = scores.iter().sum::<f64>() / scores.len() as f64;
    let var = scores.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / scores.len() as f64;
    let std = var.sqrt();
    if std < f64::EPSILON {
        return vec![0.0; scores.len()];
    }
    scores.iter().map(|s| (s - mean) / std).collect()
}

/// Fraction of values each score is >= to, in [0, 1].
pub fn percentile_normalize(scores: &[f64]) -> Vec<f64> {
    let n = scores.len();
    if n == 0 {
        return vec![];
    }
    if n == 1 {
        return vec![1.0];
    }
    scores
        .iter()
        .map(|s| {
            let below = scores.iter().filter(|o| *o <= s).count();
            below as f64 / n as f64
        })
        .collect()
}
