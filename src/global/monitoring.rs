//! Monitoring primitives: structured operation logs, metrics, and
//! per-component health checks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};

/// Outcome tag for the ops log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpStatus {
    Success,
    Error,
    Warning,
}

impl OpStatus {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
            Self::Warning => "warning",
        }
    }
}

/// Structured JSON log for non-trivial operations. Sink is the tracing
/// subscriber configured at startup (JSON formatter).
pub struct OpsLog;

impl OpsLog {
    pub fn record(
        operation: &str,
        component: &str,
        status: OpStatus,
        duration_ms: u64,
        metadata: Value,
    ) {
        let entry = json!({
            "timestamp": Utc::now().to_rfc3339(),
            "operation": operation,
            "component": component,
            "status": status.as_str(),
            "duration_ms": duration_ms,
            "metadata": metadata,
        });
        match status {
            OpStatus::Success => tracing::info!(target: "leindex::ops", entry = %entry, "op"),
            OpStatus::Warning => tracing::warn!(target: "leindex::ops", entry = %entry, "op"),
            OpStatus::Error => tracing::error!(target: "leindex::ops", entry = %entry, "op"),
        }
    }
}

/// Bounded sample reservoir with percentile summaries.
pub struct Histogram {
    samples: Mutex<Vec<f64>>,
    count: AtomicU64,
}

const HISTOGRAM_CAPACITY: usize = 1024;

impl Histogram {
    fn new() -> Self {
        Self {
            samples: Mutex::new(Vec::with_capacity(HISTOGRAM_CAPACITY)),
            count: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, value: f64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        let mut samples = self.samples.lock().unwrap();
        if samples.len() == HISTOGRAM_CAPACITY {
            samples.remove(0);
        }
        samples.push(value);
    }

    fn percentile(sorted: &[f64], p: f64) -> f64 {
        if sorted.is_empty() {
            return 0.0;
        }
        let idx = ((sorted.len() as f64 - 1.0) * p).round() as usize;
        sorted[idx.min(sorted.len() - 1)]
    }

    pub fn summary(&self) -> HistogramSummary {
        let mut sorted = self.samples.lock().unwrap().clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        HistogramSummary {
            count: self.count.load(Ordering::Relaxed),
            p50: Self::percentile(&sorted, 0.50),
            p95: Self::percentile(&sorted, 0.95),
            p99: Self::percentile(&sorted, 0.99),
        }
    }
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct HistogramSummary {
    pub count: u64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

/// Named counters, gauges, and histograms.
pub struct MetricsRegistry {
    counters: Mutex<HashMap<String, Arc<AtomicU64>>>,
    gauges: Mutex<HashMap<String, Arc<Mutex<f64>>>>,
    histograms: Mutex<HashMap<String, Arc<Histogram>>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            counters: Mutex::new(HashMap::new()),
            gauges: Mutex::new(HashMap::new()),
            histograms: Mutex::new(HashMap::new()),
        }
    }

    pub fn counter(&self, name: &str) -> Arc<AtomicU64> {
        self.counters
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(AtomicU64::new(0)))
            .clone()
    }

    pub fn incr(&self, name: &str) {
        self.counter(name).fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_gauge(&self, name: &str, value: f64) {
        let gauge = self
            .gauges
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(0.0)))
            .clone();
        *gauge.lock().unwrap() = value;
    }

    pub fn histogram(&self, name: &str) -> Arc<Histogram> {
        self.histograms
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Histogram::new()))
            .clone()
    }

    pub fn observe(&self, name: &str, value: f64) {
        self.histogram(name).observe(value);
    }

    /// Full metrics snapshot as one JSON object.
    pub fn snapshot(&self) -> Value {
        let counters: HashMap<String, u64> = self
            .counters
            .lock()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), v.load(Ordering::Relaxed)))
            .collect();
        let gauges: HashMap<String, f64> = self
            .gauges
            .lock()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), *v.lock().unwrap()))
            .collect();
        let histograms: HashMap<String, HistogramSummary> = self
            .histograms
            .lock()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), v.summary()))
            .collect();
        json!({
            "counters": counters,
            "gauges": gauges,
            "histograms": histograms,
        })
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// One component's health report.
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub healthy: bool,
    pub message: String,
    pub details: Value,
}

impl HealthStatus {
    pub fn healthy(message: impl Into<String>) -> Self {
        Self {
            healthy: true,
            message: message.into(),
            details: json!({}),
        }
    }

    pub fn unhealthy(message: impl Into<String>, details: Value) -> Self {
        Self {
            healthy: false,
            message: message.into(),
            details,
        }
    }
}
