//! Process memory tracker — samples RSS on a cadence and keeps a bounded
//! ring of snapshots.
//!
//! Attribution is honest: only bytes the components themselves account for
//! are broken down; the remainder of RSS lands in `other`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use sysinfo::{get_current_pid, ProcessesToUpdate, System};

use crate::config::ConfigManager;

const RING_CAPACITY: usize = 100;
const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_secs(30);

/// Point-in-time memory record.
#[derive(Debug, Clone, Serialize)]
pub struct MemorySnapshot {
    pub timestamp: i64,
    pub rss_mb: f64,
    /// Sum of component-accounted bytes, in MB.
    pub accounted_mb: f64,
    pub thread_count: usize,
    pub loaded_projects: usize,
    pub cached_query_count: usize,
    /// RSS as a percentage of the configured total budget.
    pub usage_percent: f64,
    /// Accounted global-index bytes against the global index budget.
    pub global_index_percent: f64,
}

/// RSS broken down by accounted component.
#[derive(Debug, Clone, Serialize, Default)]
pub struct MemoryBreakdown {
    pub global_index_mb: f64,
    pub project_indexes_mb: f64,
    pub overhead_mb: f64,
    /// Unattributed remainder of RSS; never negative.
    pub other_mb: f64,
}

type ByteProbe = Box<dyn Fn() -> u64 + Send + Sync>;
type CountProbe = Box<dyn Fn() -> usize + Send + Sync>;

/// Samples process RSS and derives component attribution from registered
/// byte probes. Thread-safe; the ring buffer is the only shared view.
pub struct MemoryTracker {
    system: Mutex<System>,
    config: Arc<ConfigManager>,
    ring: Mutex<Vec<MemorySnapshot>>,
    probes: Mutex<HashMap<&'static str, ByteProbe>>,
    loaded_projects_probe: Mutex<Option<CountProbe>>,
    cached_queries_probe: Mutex<Option<CountProbe>>,
    peak_mb: Mutex<f64>,
    degraded: AtomicBool,
}

impl MemoryTracker {
    pub fn new(config: Arc<ConfigManager>) -> Self {
        Self {
            system: Mutex::new(System::new()),
            config,
            ring: Mutex::new(Vec::with_capacity(RING_CAPACITY)),
            probes: Mutex::new(HashMap::new()),
            loaded_projects_probe: Mutex::new(None),
            cached_queries_probe: Mutex::new(None),
            peak_mb: Mutex::new(0.0),
            degraded: AtomicBool::new(false),
        }
    }

    /// Register a byte-accounting probe under a component name. Known names:
    /// `global_index`, `project_indexes`, `overhead`.
    pub fn register_probe<F>(&self, component: &'static str, probe: F)
    where
        F: Fn() -> u64 + Send + Sync + 'static,
    {
        self.probes.lock().unwrap().insert(component, Box::new(probe));
    }

    pub fn set_loaded_projects_probe<F>(&self, probe: F)
    where
        F: Fn() -> usize + Send + Sync + 'static,
    {
        *self.loaded_projects_probe.lock().unwrap() = Some(Box::new(probe));
    }

    pub fn set_cached_queries_probe<F>(&self, probe: F)
    where
        F: Fn() -> usize + Send + Sync + 'static,
    {
        *self.cached_queries_probe.lock().unwrap() = Some(Box::new(probe));
    }

    fn probe_rss_bytes(&self) -> Option<u64> {
        let pid = get_current_pid().ok()?;
        let mut sys = self.system.lock().unwrap();
        sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        sys.process(pid).map(|p| p.memory())
    }

    fn thread_count(&self) -> usize {
        #[cfg(target_os = "linux")]
        {
            let pid = get_current_pid().ok();
            if let Some(pid) = pid {
                let sys = self.system.lock().unwrap();
                if let Some(p) = sys.process(pid) {
                    return p.tasks().map(|t| t.len()).unwrap_or(0);
                }
            }
        }
        0
    }

    /// Take one sample. Returns `None` when the OS probe fails (the sample
    /// is skipped and the tracker reports degraded until the next success).
    pub fn sample(&self) -> Option<MemorySnapshot> {
        let Some(rss_bytes) = self.probe_rss_bytes() else {
            self.degraded.store(true, Ordering::Relaxed);
            tracing::warn!("RSS probe failed, skipping memory sample");
            return None;
        };
        self.degraded.store(false, Ordering::Relaxed);

        let rss_mb = rss_bytes as f64 / (1024.0 * 1024.0);
        let breakdown = self.breakdown_at(rss_mb);
        let accounted_mb =
            breakdown.global_index_mb + breakdown.project_indexes_mb + breakdown.overhead_mb;

        let cfg = self.config.current();
        let loaded_projects = self
            .loaded_projects_probe
            .lock()
            .unwrap()
            .as_ref()
            .map(|p| p())
            .unwrap_or(0);
        let cached_query_count = self
            .cached_queries_probe
            .lock()
            .unwrap()
            .as_ref()
            .map(|p| p())
            .unwrap_or(0);

        let snapshot = MemorySnapshot {
            timestamp: Utc::now().timestamp(),
            rss_mb,
            accounted_mb,
            thread_count: self.thread_count(),
            loaded_projects,
            cached_query_count,
            usage_percent: 100.0 * rss_mb / cfg.memory.total_budget_mb as f64,
            global_index_percent: 100.0 * breakdown.global_index_mb
                / cfg.memory.global_index_mb.max(1) as f64,
        };

        {
            let mut peak = self.peak_mb.lock().unwrap();
            if rss_mb > *peak {
                *peak = rss_mb;
            }
        }
        let mut ring = self.ring.lock().unwrap();
        if ring.len() == RING_CAPACITY {
            ring.remove(0);
        }
        ring.push(snapshot.clone());
        Some(snapshot)
    }

    fn breakdown_at(&self, rss_mb: f64) -> MemoryBreakdown {
        let probes = self.probes.lock().unwrap();
        let read = |name: &str| {
            probes
                .get(name)
                .map(|p| p() as f64 / (1024.0 * 1024.0))
                .unwrap_or(0.0)
        };
        let global_index_mb = read("global_index");
        let project_indexes_mb = read("project_indexes");
        let overhead_mb = read("overhead");
        let other_mb = (rss_mb - global_index_mb - project_indexes_mb - overhead_mb).max(0.0);
        MemoryBreakdown {
            global_index_mb,
            project_indexes_mb,
            overhead_mb,
            other_mb,
        }
    }

    /// Breakdown of the most recent sample (fresh probe if none taken yet).
    pub fn breakdown(&self) -> MemoryBreakdown {
        let rss = self
            .latest()
            .map(|s| s.rss_mb)
            .or_else(|| self.probe_rss_bytes().map(|b| b as f64 / (1024.0 * 1024.0)))
            .unwrap_or(0.0);
        self.breakdown_at(rss)
    }

    pub fn current_mb(&self) -> f64 {
        self.latest().map(|s| s.rss_mb).unwrap_or(0.0)
    }

    pub fn peak_mb(&self) -> f64 {
        *self.peak_mb.lock().unwrap()
    }

    pub fn latest(&self) -> Option<MemorySnapshot> {
        self.ring.lock().unwrap().last().cloned()
    }

    /// Most recent `n` snapshots, oldest first.
    pub fn recent(&self, n: usize) -> Vec<MemorySnapshot> {
        let ring = self.ring.lock().unwrap();
        let start = ring.len().saturating_sub(n);
        ring[start..].to_vec()
    }

    /// Growth rate over the sampled window, in MB per minute.
    pub fn growth_rate_mb_per_min(&self) -> f64 {
        let ring = self.ring.lock().unwrap();
        let (Some(first), Some(last)) = (ring.first(), ring.last()) else {
            return 0.0;
        };
        let dt_secs = (last.timestamp - first.timestamp) as f64;
        if dt_secs <= 0.0 {
            return 0.0;
        }
        (last.rss_mb - first.rss_mb) / (dt_secs / 60.0)
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    /// Cadence between samples; the service's monitor task drives this.
    pub fn sample_interval(&self) -> Duration {
        DEFAULT_SAMPLE_INTERVAL
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LeIndexConfig;

    fn tracker() -> MemoryTracker {
        let mgr = Arc::new(ConfigManager::from_config(LeIndexConfig::default()).unwrap());
        MemoryTracker::new(mgr)
    }

    #[test]
    fn sample_records_rss_and_ring() {
        let t = tracker();
        let snap = t.sample().expect("RSS probe should work on test host");
        assert!(snap.rss_mb > 0.0);
        assert!(snap.usage_percent > 0.0);
        assert_eq!(t.recent(10).len(), 1);
        assert!(t.peak_mb() >= snap.rss_mb);
        assert!(!t.is_degraded());
    }

    #[test]
    fn unattributed_bytes_fall_into_other() {
        let t = tracker();
        t.register_probe("global_index", || 10 * 1024 * 1024);
        t.register_probe("project_indexes", || 5 * 1024 * 1024);
        let snap = t.sample().unwrap();
        let b = t.breakdown();
        assert!((b.global_index_mb - 10.0).abs() < 0.01);
        assert!((b.project_indexes_mb - 5.0).abs() < 0.01);
        // A real process RSS far exceeds 15MB of accounted bytes.
        assert!(b.other_mb > 0.0);
        assert!(snap.accounted_mb >= 15.0 - 0.01);
    }

    #[test]
    fn ring_is_bounded() {
        let t = tracker();
        for _ in 0..(RING_CAPACITY + 20) {
            t.sample();
        }
        assert_eq!(t.recent(usize::MAX).len(), RING_CAPACITY);
    }
}
