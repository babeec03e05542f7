//! Priority-scored eviction of loaded projects.
//!
//! Score = (now − last_access_secs) × priority_weight; higher score is
//! evicted sooner. Pinned and currently-building projects are exempt.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::Serialize;

use crate::config::ProjectPriority;

/// A currently-loaded project considered for eviction.
#[derive(Debug, Clone)]
pub struct EvictionCandidate {
    pub project_id: String,
    /// Seconds since the project was last accessed.
    pub idle_secs: f64,
    pub priority: ProjectPriority,
    pub estimated_mb: f64,
    pub pinned: bool,
    pub building: bool,
}

impl EvictionCandidate {
    pub fn score(&self) -> f64 {
        self.idle_secs * self.priority.eviction_weight()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EvictionResult {
    pub success: bool,
    pub projects_evicted: usize,
    pub freed_mb: f64,
    pub duration_ms: u64,
    pub message: String,
    pub evicted_ids: Vec<String>,
}

/// Unloads projects until the target is met. The actual unload is delegated
/// to the owner through the callback; a `false` return means the owner
/// refused (project skipped, not counted as freed).
pub struct EvictionEngine {
    evictions_performed: AtomicU64,
    projects_evicted: AtomicU64,
    mb_freed_total: AtomicU64,
}

impl EvictionEngine {
    pub fn new() -> Self {
        Self {
            evictions_performed: AtomicU64::new(0),
            projects_evicted: AtomicU64::new(0),
            mb_freed_total: AtomicU64::new(0),
        }
    }

    /// Evict by descending score until `freed >= target_mb` or candidates
    /// are exhausted. Never raises; worst case reports zero MB freed.
    pub fn emergency_eviction<F>(
        &self,
        mut candidates: Vec<EvictionCandidate>,
        target_mb: f64,
        mut unload: F,
    ) -> EvictionResult
    where
        F: FnMut(&str) -> bool,
    {
        let start = Instant::now();
        self.evictions_performed.fetch_add(1, Ordering::Relaxed);

        candidates.retain(|c| !c.pinned && !c.building);
        candidates.sort_by(|a, b| {
            b.score()
                .partial_cmp(&a.score())
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let mut freed = 0.0;
        let mut evicted_ids = Vec::new();
        for candidate in &candidates {
            if freed >= target_mb {
                break;
            }
            if unload(&candidate.project_id) {
                freed += candidate.estimated_mb;
                evicted_ids.push(candidate.project_id.clone());
                tracing::info!(
                    project_id = %candidate.project_id,
                    score = candidate.score(),
                    mb = candidate.estimated_mb,
                    "evicted project"
                );
            } else {
                tracing::debug!(project_id = %candidate.project_id, "owner refused unload");
            }
        }

        self.projects_evicted
            .fetch_add(evicted_ids.len() as u64, Ordering::Relaxed);
        self.mb_freed_total.fetch_add(freed as u64, Ordering::Relaxed);

        let success = freed >= target_mb;
        EvictionResult {
            success,
            projects_evicted: evicted_ids.len(),
            freed_mb: freed,
            duration_ms: start.elapsed().as_millis() as u64,
            message: if success {
                format!("freed {freed:.1}MB (target {target_mb:.1}MB)")
            } else {
                format!("freed {freed:.1}MB of {target_mb:.1}MB target; no more candidates")
            },
            evicted_ids,
        }
    }

    pub fn counters(&self) -> (u64, u64, u64) {
        (
            self.evictions_performed.load(Ordering::Relaxed),
            self.projects_evicted.load(Ordering::Relaxed),
            self.mb_freed_total.load(Ordering::Relaxed),
        )
    }
}

impl Default for EvictionEngine {
    fn default() -> Self {
        Self::new()
    }
}
