//! Threshold state machine — classifies memory usage and emits one warning
//! per rising edge.

use std::sync::Mutex;

use serde::Serialize;

use crate::config::MemoryConfig;
use crate::memory::actions::MemoryActionKind;
use crate::memory::tracker::MemorySnapshot;

/// Usage classification against the configured budget. `Caution` maps to
/// the warning threshold, `Warning` to prompt, `Critical` to emergency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryLevel {
    Healthy,
    Caution,
    Warning,
    Critical,
}

impl MemoryLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Caution => "caution",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

/// Transient advisory produced at a threshold crossing. Never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct ThresholdWarning {
    pub level: MemoryLevel,
    pub urgency: &'static str,
    pub message: String,
    pub recommended_actions: Vec<MemoryActionKind>,
}

/// Classify a usage fraction against the three configured thresholds.
pub fn classify(current_mb: f64, memory: &MemoryConfig) -> MemoryLevel {
    let frac = current_mb / memory.total_budget_mb as f64;
    if frac >= memory.emergency_threshold {
        MemoryLevel::Critical
    } else if frac >= memory.prompt_threshold {
        MemoryLevel::Warning
    } else if frac >= memory.warning_threshold {
        MemoryLevel::Caution
    } else {
        MemoryLevel::Healthy
    }
}

fn recommendations(level: MemoryLevel) -> Vec<MemoryActionKind> {
    match level {
        MemoryLevel::Healthy => vec![],
        MemoryLevel::Caution => vec![MemoryActionKind::GarbageCollect],
        MemoryLevel::Warning => vec![
            MemoryActionKind::GarbageCollect,
            MemoryActionKind::ClearQueryCache,
            MemoryActionKind::UnloadFiles,
        ],
        MemoryLevel::Critical => vec![
            MemoryActionKind::ClearQueryCache,
            MemoryActionKind::UnloadProjects,
            MemoryActionKind::EmergencyEvict,
        ],
    }
}

fn urgency(level: MemoryLevel) -> &'static str {
    match level {
        MemoryLevel::Healthy => "none",
        MemoryLevel::Caution => "low",
        MemoryLevel::Warning => "high",
        MemoryLevel::Critical => "immediate",
    }
}

type CriticalHook = Box<dyn Fn(f64) + Send + Sync>;

/// Rising-edge detector over the classified level. At `Critical` the
/// registered hook runs emergency eviction without external dispatch.
pub struct ThresholdStateMachine {
    last_level: Mutex<MemoryLevel>,
    on_critical: Mutex<Option<CriticalHook>>,
}

impl ThresholdStateMachine {
    pub fn new() -> Self {
        Self {
            last_level: Mutex::new(MemoryLevel::Healthy),
            on_critical: Mutex::new(None),
        }
    }

    /// Install the emergency-eviction hook; receives the MB overage to free.
    pub fn set_critical_hook<F>(&self, hook: F)
    where
        F: Fn(f64) + Send + Sync + 'static,
    {
        *self.on_critical.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn current_level(&self) -> MemoryLevel {
        *self.last_level.lock().unwrap()
    }

    /// Feed one snapshot. Returns a warning only on a rising edge; falling
    /// edges silently re-arm the detector.
    pub fn check(&self, snapshot: &MemorySnapshot, memory: &MemoryConfig) -> Option<ThresholdWarning> {
        let level = classify(snapshot.rss_mb, memory);
        let mut last = self.last_level.lock().unwrap();
        let rising = level > *last;
        *last = level;
        drop(last);

        if !rising || level == MemoryLevel::Healthy {
            return None;
        }

        let budget = memory.total_budget_mb as f64;
        let warning = ThresholdWarning {
            level,
            urgency: urgency(level),
            message: format!(
                "memory usage {:.0}MB is {:.1}% of the {:.0}MB budget ({})",
                snapshot.rss_mb,
                100.0 * snapshot.rss_mb / budget,
                budget,
                level.as_str()
            ),
            recommended_actions: recommendations(level),
        };

        if level == MemoryLevel::Critical {
            // Free back down to the prompt threshold.
            let target_mb = (snapshot.rss_mb - budget * memory.prompt_threshold).max(1.0);
            if let Some(hook) = self.on_critical.lock().unwrap().as_ref() {
                tracing::warn!(target_mb, "critical memory level, invoking emergency eviction");
                hook(target_mb);
            }
        }

        tracing::warn!(
            level = level.as_str(),
            rss_mb = snapshot.rss_mb,
            "memory threshold crossed"
        );
        Some(warning)
    }
}

impl Default for ThresholdStateMachine {
    fn default() -> Self {
        Self::new()
    }
}
