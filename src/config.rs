//! Hierarchical YAML configuration with validation and zero-downtime reload.
//!
//! The live config is an `Arc` swapped atomically under a lock; readers
//! clone the `Arc` and never observe a half-updated struct. Reload observers
//! receive deep copies of (old, new) and run outside the config lock.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, TryLockError};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{GlobalIndexError, Result};

/// Project priority used by eviction scoring and project defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectPriority {
    High,
    Normal,
    Low,
}

impl ProjectPriority {
    /// Multiplier on access age during eviction scoring; lower priority
    /// means a higher weight and therefore earlier eviction.
    pub fn eviction_weight(&self) -> f64 {
        match self {
            Self::Low => 2.0,
            Self::Normal => 1.0,
            Self::High => 0.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemoryConfig {
    pub total_budget_mb: u64,
    pub global_index_mb: u64,
    pub warning_threshold: f64,
    pub prompt_threshold: f64,
    pub emergency_threshold: f64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            total_budget_mb: 3072,
            global_index_mb: 512,
            warning_threshold: 0.80,
            prompt_threshold: 0.93,
            emergency_threshold: 0.98,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProjectDefaults {
    pub default_estimated_mb: u64,
    pub default_priority: ProjectPriority,
    pub max_file_size_kb: u64,
}

impl Default for ProjectDefaults {
    fn default() -> Self {
        Self {
            default_estimated_mb: 100,
            default_priority: ProjectPriority::Normal,
            max_file_size_kb: 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PerformanceConfig {
    pub cache_enabled: bool,
    pub cache_ttl_seconds: u64,
    pub parallel_workers: usize,
    pub batch_size: usize,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            cache_enabled: true,
            cache_ttl_seconds: 300,
            parallel_workers: num_cpus::get().clamp(1, 64),
            batch_size: 32,
        }
    }
}

/// Root configuration (`~/.leindex/mcp_config.yaml`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct LeIndexConfig {
    pub version: u32,
    pub memory: MemoryConfig,
    pub projects: ProjectDefaults,
    pub performance: PerformanceConfig,
}

impl LeIndexConfig {
    /// Validate every field against the rule set. Collects all violations.
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();
        let m = &self.memory;

        if !(512..=65536).contains(&m.total_budget_mb) {
            errors.push(format!("memory.total_budget_mb {} outside [512, 65536]", m.total_budget_mb));
        }
        let lo = m.total_budget_mb / 10;
        let hi = m.total_budget_mb / 2;
        if !(lo..=hi).contains(&m.global_index_mb) {
            errors.push(format!(
                "memory.global_index_mb {} outside [10%, 50%] of budget ({lo}..{hi})",
                m.global_index_mb
            ));
        }
        for (name, v) in [
            ("warning_threshold", m.warning_threshold),
            ("prompt_threshold", m.prompt_threshold),
            ("emergency_threshold", m.emergency_threshold),
        ] {
            if !(v > 0.0 && v < 1.0) {
                errors.push(format!("memory.{name} {v} outside (0, 1)"));
            }
        }
        if !(m.warning_threshold < m.prompt_threshold && m.prompt_threshold < m.emergency_threshold)
        {
            errors.push(format!(
                "thresholds must satisfy warning < prompt < emergency, got {} / {} / {}",
                m.warning_threshold, m.prompt_threshold, m.emergency_threshold
            ));
        }

        let p = &self.projects;
        if !(1..=102400).contains(&p.max_file_size_kb) {
            errors.push(format!("projects.max_file_size_kb {} outside [1, 102400]", p.max_file_size_kb));
        }

        let perf = &self.performance;
        if !(1..=64).contains(&perf.parallel_workers) {
            errors.push(format!("performance.parallel_workers {} outside [1, 64]", perf.parallel_workers));
        }
        if !(1..=4096).contains(&perf.batch_size) {
            errors.push(format!("performance.batch_size {} outside [1, 4096]", perf.batch_size));
        }
        if !(1..=86400).contains(&perf.cache_ttl_seconds) {
            errors.push(format!("performance.cache_ttl_seconds {} outside [1, 86400]", perf.cache_ttl_seconds));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(GlobalIndexError::ConfigValidation(errors.join("; ")))
        }
    }
}

/// Outcome of a `reload_config` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReloadStatus {
    Success,
    ValidationFailed,
    FileError,
    AlreadyInProgress,
    NoChange,
}

/// One entry in the bounded reload history.
#[derive(Debug, Clone, Serialize)]
pub struct ReloadEvent {
    pub at: i64,
    pub status: ReloadStatus,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct ConfigStats {
    pub reloads_attempted: u64,
    pub reloads_succeeded: u64,
    pub reloads_failed: u64,
    pub last_reload_at: Option<i64>,
    pub observer_count: usize,
    pub history: Vec<ReloadEvent>,
}

type Observer = Box<dyn Fn(&LeIndexConfig, &LeIndexConfig) + Send + Sync>;

const RELOAD_HISTORY_LIMIT: usize = 50;

/// Owns the live config reference and the reload path.
pub struct ConfigManager {
    path: PathBuf,
    current: RwLock<Arc<LeIndexConfig>>,
    /// Hash of the last successfully loaded file content, for NoChange detection.
    last_hash: Mutex<Option<[u8; 32]>>,
    observers: Mutex<Vec<Observer>>,
    reload_guard: Mutex<()>,
    history: Mutex<VecDeque<ReloadEvent>>,
    reloads_attempted: AtomicU64,
    reloads_succeeded: AtomicU64,
    reloads_failed: AtomicU64,
    last_reload_at: Mutex<Option<i64>>,
}

impl ConfigManager {
    /// Load from `path`, falling back to defaults when the file is absent.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let (config, hash) = match std::fs::read_to_string(&path) {
            Ok(content) => {
                let cfg: LeIndexConfig = serde_yaml::from_str(&content)
                    .map_err(|e| GlobalIndexError::ConfigValidation(format!("YAML parse error: {e}")))?;
                (cfg, Some(Self::hash_content(&content)))
            }
            Err(_) => {
                tracing::info!(path = %path.display(), "no config file, using defaults");
                (LeIndexConfig::default(), None)
            }
        };
        config.validate()?;

        Ok(Self {
            path,
            current: RwLock::new(Arc::new(config)),
            last_hash: Mutex::new(hash),
            observers: Mutex::new(Vec::new()),
            reload_guard: Mutex::new(()),
            history: Mutex::new(VecDeque::new()),
            reloads_attempted: AtomicU64::new(0),
            reloads_succeeded: AtomicU64::new(0),
            reloads_failed: AtomicU64::new(0),
            last_reload_at: Mutex::new(None),
        })
    }

    /// In-memory manager for tests and embedded use.
    pub fn from_config(config: LeIndexConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            path: PathBuf::new(),
            current: RwLock::new(Arc::new(config)),
            last_hash: Mutex::new(None),
            observers: Mutex::new(Vec::new()),
            reload_guard: Mutex::new(()),
            history: Mutex::new(VecDeque::new()),
            reloads_attempted: AtomicU64::new(0),
            reloads_succeeded: AtomicU64::new(0),
            reloads_failed: AtomicU64::new(0),
            last_reload_at: Mutex::new(None),
        })
    }

    fn hash_content(content: &str) -> [u8; 32] {
        let mut h = Sha256::new();
        h.update(content.as_bytes());
        h.finalize().into()
    }

    /// Cheap snapshot of the live config.
    pub fn current(&self) -> Arc<LeIndexConfig> {
        self.current.read().unwrap().clone()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Register a reload observer; called with deep copies of (old, new).
    pub fn add_observer<F>(&self, f: F)
    where
        F: Fn(&LeIndexConfig, &LeIndexConfig) + Send + Sync + 'static,
    {
        self.observers.lock().unwrap().push(Box::new(f));
    }

    /// Reload from disk. Serialized by `reload_guard`; re-entrant calls get
    /// `AlreadyInProgress`. A failed reload keeps the old config.
    pub fn reload(&self) -> ReloadStatus {
        let _guard = match self.reload_guard.try_lock() {
            Ok(g) => g,
            Err(TryLockError::WouldBlock) => return ReloadStatus::AlreadyInProgress,
            Err(TryLockError::Poisoned(e)) => e.into_inner(),
        };
        self.reloads_attempted.fetch_add(1, Ordering::Relaxed);

        let content = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) => {
                self.reloads_failed.fetch_add(1, Ordering::Relaxed);
                self.record(ReloadStatus::FileError, format!("read failed: {e}"));
                return ReloadStatus::FileError;
            }
        };

        let hash = Self::hash_content(&content);
        if *self.last_hash.lock().unwrap() == Some(hash) {
            self.record(ReloadStatus::NoChange, "content unchanged".into());
            return ReloadStatus::NoChange;
        }

        let new_config: LeIndexConfig = match serde_yaml::from_str(&content) {
            Ok(c) => c,
            Err(e) => {
                self.reloads_failed.fetch_add(1, Ordering::Relaxed);
                self.record(ReloadStatus::ValidationFailed, format!("parse error: {e}"));
                return ReloadStatus::ValidationFailed;
            }
        };
        if let Err(e) = new_config.validate() {
            self.reloads_failed.fetch_add(1, Ordering::Relaxed);
            self.record(ReloadStatus::ValidationFailed, e.to_string());
            return ReloadStatus::ValidationFailed;
        }

        // Deep copies for observer payloads, then the atomic swap.
        let old_copy: LeIndexConfig;
        let new_arc = Arc::new(new_config.clone());
        {
            let mut cur = self.current.write().unwrap();
            old_copy = (**cur).clone();
            *cur = new_arc;
        }
        *self.last_hash.lock().unwrap() = Some(hash);

        // Observers run outside the config lock; one failure cannot block
        // the others (panics are caught and logged).
        let observers = self.observers.lock().unwrap();
        for obs in observers.iter() {
            let res = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                obs(&old_copy, &new_config)
            }));
            if res.is_err() {
                tracing::warn!("config reload observer panicked");
            }
        }
        drop(observers);

        self.reloads_succeeded.fetch_add(1, Ordering::Relaxed);
        *self.last_reload_at.lock().unwrap() = Some(Utc::now().timestamp());
        self.record(ReloadStatus::Success, "config reloaded".into());
        tracing::info!("config reloaded from {}", self.path.display());
        ReloadStatus::Success
    }

    /// Programmatic config mutation (e.g. `configure_memory`). Validates the
    /// result, swaps atomically, and notifies observers like a file reload.
    pub fn apply<F>(&self, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut LeIndexConfig),
    {
        let _guard = match self.reload_guard.try_lock() {
            Ok(g) => g,
            Err(TryLockError::WouldBlock) => {
                return Err(GlobalIndexError::ConfigValidation(
                    "reload already in progress".into(),
                ))
            }
            Err(TryLockError::Poisoned(e)) => e.into_inner(),
        };

        let old_copy = (*self.current()).clone();
        let mut new_config = old_copy.clone();
        mutate(&mut new_config);
        new_config.validate()?;

        {
            let mut cur = self.current.write().unwrap();
            *cur = Arc::new(new_config.clone());
        }
        let observers = self.observers.lock().unwrap();
        for obs in observers.iter() {
            let res = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                obs(&old_copy, &new_config)
            }));
            if res.is_err() {
                tracing::warn!("config observer panicked");
            }
        }
        drop(observers);
        self.record(ReloadStatus::Success, "programmatic update".into());
        Ok(())
    }

    fn record(&self, status: ReloadStatus, message: String) {
        let mut history = self.history.lock().unwrap();
        history.push_back(ReloadEvent {
            at: Utc::now().timestamp(),
            status,
            message,
        });
        while history.len() > RELOAD_HISTORY_LIMIT {
            history.pop_front();
        }
    }

    pub fn stats(&self) -> ConfigStats {
        ConfigStats {
            reloads_attempted: self.reloads_attempted.load(Ordering::Relaxed),
            reloads_succeeded: self.reloads_succeeded.load(Ordering::Relaxed),
            reloads_failed: self.reloads_failed.load(Ordering::Relaxed),
            last_reload_at: *self.last_reload_at.lock().unwrap(),
            observer_count: self.observers.lock().unwrap().len(),
            history: self.history.lock().unwrap().iter().cloned().collect(),
        }
    }
}
