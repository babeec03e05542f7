//! Tier 2 — stale-allowed LRU query cache with async rebuild.
//!
//! A stale entry is served immediately; at most one background rebuild per
//! key is in flight at any time. Invalidation only flips the stale flag,
//! never deletes; eviction is purely size-driven through the LRU tracker.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::cache::keys::derive_cache_key;
use crate::cache::lru::LruTracker;
use crate::error::Result;

/// Rebuild worker pool size. Independent of the scanner pool configuration.
const REBUILD_WORKERS: usize = 2;
const REBUILD_QUEUE_DEPTH: usize = 64;
/// Flat per-entry overhead added to the measured payload size.
const ENTRY_OVERHEAD_BYTES: usize = 256;

/// Sentinel project id meaning "invalidated by any project change".
pub const ALL_PROJECTS: &str = "all";

pub type ComputeFn =
    Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync + 'static>;

/// A cached query result. Immutable after creation except for the stale
/// flag; rebuilds replace the whole entry.
pub struct CachedQuery {
    pub key: String,
    pub data: Value,
    pub computed_at: i64,
    pub involved_projects: Vec<String>,
    pub size_bytes: usize,
    stale: AtomicBool,
}

impl CachedQuery {
    fn new(key: String, data: Value, involved_projects: Vec<String>) -> Self {
        let size_bytes = serde_json::to_string(&data)
            .map(|s| s.len())
            .unwrap_or(0)
            + ENTRY_OVERHEAD_BYTES;
        Self {
            key,
            data,
            computed_at: Utc::now().timestamp(),
            involved_projects,
            size_bytes,
            stale: AtomicBool::new(false),
        }
    }

    pub fn is_stale(&self) -> bool {
        self.stale.load(Ordering::Acquire)
    }

    fn mark_stale(&self) {
        self.stale.store(true, Ordering::Release);
    }

    fn involves(&self, project_id: &str) -> bool {
        self.involved_projects
            .iter()
            .any(|p| p == project_id || p == ALL_PROJECTS)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheSource {
    Miss,
    Fresh,
    Stale,
}

impl CacheSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Miss => "miss",
            Self::Fresh => "fresh",
            Self::Stale => "stale",
        }
    }
}

/// Tier 2 metadata attached to every cached answer.
#[derive(Debug, Clone, Serialize)]
pub struct CacheMetadata {
    pub source: CacheSource,
    pub is_stale: bool,
    pub staleness_age_seconds: Option<i64>,
    pub rebuild_in_progress: bool,
    pub last_updated: i64,
}

#[derive(Debug, Clone)]
pub struct QueryOutcome {
    pub data: Value,
    pub metadata: CacheMetadata,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct Tier2Stats {
    pub queries: u64,
    pub fresh_hits: u64,
    pub misses: u64,
    pub stale_serves: u64,
    pub rebuilds_triggered: u64,
    pub rebuilds_completed: u64,
    pub rebuilds_failed: u64,
    pub currently_rebuilding: usize,
    pub entries: usize,
    pub total_bytes: usize,
}

struct RebuildJob {
    key: String,
    involved_projects: Vec<String>,
    compute_fn: ComputeFn,
}

/// The stale-allowed query cache.
pub struct Tier2QueryCache {
    lru: LruTracker<Arc<CachedQuery>>,
    rebuilding: Mutex<HashSet<String>>,
    job_tx: mpsc::Sender<RebuildJob>,
    /// Entries older than this are served as stale even if never
    /// invalidated. `None` disables age-based staleness.
    ttl_seconds: Mutex<Option<i64>>,
    queries: AtomicU64,
    fresh_hits: AtomicU64,
    misses: AtomicU64,
    stale_serves: AtomicU64,
    rebuilds_triggered: AtomicU64,
    rebuilds_completed: AtomicU64,
    rebuilds_failed: AtomicU64,
}

impl Tier2QueryCache {
    /// Create the cache and spawn its rebuild worker pool. Workers exit when
    /// the cache is dropped (the channel closes).
    pub fn new(max_size_mb: usize) -> Arc<Self> {
        let (job_tx, job_rx) = mpsc::channel::<RebuildJob>(REBUILD_QUEUE_DEPTH);
        let cache = Arc::new(Self {
            lru: LruTracker::new(max_size_mb),
            rebuilding: Mutex::new(HashSet::new()),
            job_tx,
            ttl_seconds: Mutex::new(None),
            queries: AtomicU64::new(0),
            fresh_hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            stale_serves: AtomicU64::new(0),
            rebuilds_triggered: AtomicU64::new(0),
            rebuilds_completed: AtomicU64::new(0),
            rebuilds_failed: AtomicU64::new(0),
        });

        let job_rx = Arc::new(tokio::sync::Mutex::new(job_rx));
        for worker_id in 0..REBUILD_WORKERS {
            let cache = Arc::downgrade(&cache);
            let job_rx = job_rx.clone();
            tokio::spawn(async move {
                loop {
                    let job = {
                        let mut rx = job_rx.lock().await;
                        rx.recv().await
                    };
                    let Some(job) = job else {
                        tracing::debug!(worker_id, "tier2 rebuild worker stopping");
                        return;
                    };
                    let Some(cache) = cache.upgrade() else {
                        return;
                    };
                    cache.run_rebuild(job).await;
                }
            });
        }
        cache
    }

    /// Age limit after which an entry counts as stale.
    pub fn set_ttl_seconds(&self, ttl: Option<i64>) {
        *self.ttl_seconds.lock().unwrap() = ttl;
    }

    /// Derive a key and serve from cache, computing on miss.
    pub async fn query(
        &self,
        query_type: &str,
        params: &Value,
        involved_projects: Vec<String>,
        compute_fn: ComputeFn,
    ) -> Result<QueryOutcome> {
        let key = derive_cache_key(query_type, params)?;
        self.query_with_key(&key, involved_projects, compute_fn).await
    }

    /// Same as [`query`] with a pre-derived key.
    pub async fn query_with_key(
        &self,
        key: &str,
        involved_projects: Vec<String>,
        compute_fn: ComputeFn,
    ) -> Result<QueryOutcome> {
        self.queries.fetch_add(1, Ordering::Relaxed);

        if let Some(entry) = self.lru.get(key) {
            let expired = self
                .ttl_seconds
                .lock()
                .unwrap()
                .map(|ttl| Utc::now().timestamp() - entry.computed_at > ttl)
                .unwrap_or(false);
            if expired {
                entry.mark_stale();
            }
            if !entry.is_stale() {
                self.fresh_hits.fetch_add(1, Ordering::Relaxed);
                return Ok(QueryOutcome {
                    data: entry.data.clone(),
                    metadata: CacheMetadata {
                        source: CacheSource::Fresh,
                        is_stale: false,
                        staleness_age_seconds: None,
                        rebuild_in_progress: false,
                        last_updated: entry.computed_at,
                    },
                });
            }

            // Stale: serve immediately, trigger at most one rebuild.
            self.stale_serves.fetch_add(1, Ordering::Relaxed);
            let rebuild_in_progress = self.trigger_rebuild(key, &entry, compute_fn);
            let age = Utc::now().timestamp() - entry.computed_at;
            return Ok(QueryOutcome {
                data: entry.data.clone(),
                metadata: CacheMetadata {
                    source: CacheSource::Stale,
                    is_stale: true,
                    staleness_age_seconds: Some(age.max(0)),
                    rebuild_in_progress,
                    last_updated: entry.computed_at,
                },
            });
        }

        // Miss: compute synchronously on the caller's task.
        self.misses.fetch_add(1, Ordering::Relaxed);
        let data = (compute_fn)()
            .await
            .map_err(crate::error::GlobalIndexError::Internal)?;
        let entry = Arc::new(CachedQuery::new(key.to_string(), data.clone(), involved_projects));
        let computed_at = entry.computed_at;
        let size = entry.size_bytes;
        self.lru.insert(key, entry, size);
        Ok(QueryOutcome {
            data,
            metadata: CacheMetadata {
                source: CacheSource::Miss,
                is_stale: false,
                staleness_age_seconds: None,
                rebuild_in_progress: false,
                last_updated: computed_at,
            },
        })
    }

    /// Add the key to `rebuilding_keys` and submit a job unless a rebuild is
    /// already in flight. Returns true while a rebuild is pending.
    fn trigger_rebuild(&self, key: &str, entry: &Arc<CachedQuery>, compute_fn: ComputeFn) -> bool {
        {
            let mut rebuilding = self.rebuilding.lock().unwrap();
            if rebuilding.contains(key) {
                return true;
            }
            rebuilding.insert(key.to_string());
        }
        let job = RebuildJob {
            key: key.to_string(),
            involved_projects: entry.involved_projects.clone(),
            compute_fn,
        };
        match self.job_tx.try_send(job) {
            Ok(()) => {
                self.rebuilds_triggered.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(e) => {
                // Queue full or workers gone; retract so a later query retries.
                self.rebuilding.lock().unwrap().remove(key);
                tracing::warn!(key, error = %e, "could not enqueue tier2 rebuild");
                false
            }
        }
    }

    async fn run_rebuild(&self, job: RebuildJob) {
        let result = (job.compute_fn)().await;
        match result {
            Ok(data) => {
                let entry = Arc::new(CachedQuery::new(
                    job.key.clone(),
                    data,
                    job.involved_projects,
                ));
                let size = entry.size_bytes;
                // Evicted in the interim → discard the recomputed data.
                if self.lru.replace_if_present(&job.key, entry, size) {
                    self.rebuilds_completed.fetch_add(1, Ordering::Relaxed);
                } else {
                    tracing::debug!(key = %job.key, "entry evicted during rebuild, discarding");
                }
            }
            Err(e) => {
                // The previous stale entry stays in place.
                self.rebuilds_failed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(key = %job.key, error = %e, "tier2 rebuild failed");
            }
        }
        self.rebuilding.lock().unwrap().remove(&job.key);
    }

    /// Flip the stale flag on every entry whose involved set contains the
    /// project (or the `"all"` sentinel). Returns how many were marked.
    pub fn mark_project_stale(&self, project_id: &str) -> usize {
        let mut marked = 0;
        self.lru.for_each_value(|entry| {
            if entry.involves(project_id) && !entry.is_stale() {
                entry.mark_stale();
                marked += 1;
            }
        });
        if marked > 0 {
            tracing::debug!(project_id, marked, "tier2 entries marked stale");
        }
        marked
    }

    /// Drop every entry. Used by the `clear_query_cache` memory action.
    pub fn clear(&self) -> usize {
        self.lru.clear()
    }

    pub fn len(&self) -> usize {
        self.lru.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lru.is_empty()
    }

    pub fn total_bytes(&self) -> usize {
        self.lru.total_bytes()
    }

    pub fn stats(&self) -> Tier2Stats {
        let lru = self.lru.stats();
        Tier2Stats {
            queries: self.queries.load(Ordering::Relaxed),
            fresh_hits: self.fresh_hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            stale_serves: self.stale_serves.load(Ordering::Relaxed),
            rebuilds_triggered: self.rebuilds_triggered.load(Ordering::Relaxed),
            rebuilds_completed: self.rebuilds_completed.load(Ordering::Relaxed),
            rebuilds_failed: self.rebuilds_failed.load(Ordering::Relaxed),
            currently_rebuilding: self.rebuilding.lock().unwrap().len(),
            entries: lru.entries,
            total_bytes: lru.total_bytes,
        }
    }
}
