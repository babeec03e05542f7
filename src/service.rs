//! The global index service — wires every subsystem together and exposes
//! the consumer-facing surface.
//!
//! Instantiation is bottom-up (config, metrics, stores, caches, search,
//! schedulers); shutdown is top-down via one cancellation token.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cache::keys::sorted_string_set;
use crate::cache::tier2::{ComputeFn, Tier2QueryCache, ALL_PROJECTS};
use crate::config::ConfigManager;
use crate::error::{GlobalIndexError, Result};
use crate::events::{EventBus, IndexStats, IndexStatus, ProjectEvent};
use crate::global::monitoring::{HealthStatus, MetricsRegistry, OpStatus, OpsLog};
use crate::global::router::QueryRouter;
use crate::global::tier1::{ProjectFilters, Tier1MetadataStore};
use crate::memory::actions::{ActionExecutor, ActionQueue, MemoryAction, MemoryActionKind};
use crate::memory::eviction::EvictionEngine;
use crate::memory::thresholds::{classify, ThresholdStateMachine, ThresholdWarning};
use crate::memory::tracker::MemoryTracker;
use crate::paths::DataRoot;
use crate::projects::ProjectManager;
use crate::registry::backup::{BackupScheduler, SHUTDOWN_GRACE};
use crate::registry::orphan::{OrphanDetector, DEFAULT_MAX_DEPTH};
use crate::registry::store::RegistryStore;
use crate::search::cross_project::{CrossProjectParams, CrossProjectSearcher, ProjectBackendProvider};
use crate::search::semantic::EmbedderPool;

const WARNING_HISTORY: usize = 10;
/// Idle age beyond which `unload_files` releases a project's indexes.
const IDLE_UNLOAD_SECS: f64 = 600.0;

pub struct GlobalIndexService {
    config: Arc<ConfigManager>,
    paths: DataRoot,
    bus: Arc<EventBus>,
    tier1: Arc<Tier1MetadataStore>,
    tier2: Arc<Tier2QueryCache>,
    router: Arc<QueryRouter>,
    metrics: Arc<MetricsRegistry>,
    tracker: Arc<MemoryTracker>,
    thresholds: Arc<ThresholdStateMachine>,
    action_queue: Arc<ActionQueue>,
    eviction: Arc<EvictionEngine>,
    manager: Arc<ProjectManager>,
    searcher: Arc<CrossProjectSearcher>,
    backup: BackupScheduler,
    warnings: Mutex<VecDeque<ThresholdWarning>>,
    shutdown: CancellationToken,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl GlobalIndexService {
    /// Build and start the service. `embedder` is optional — without it the
    /// semantic backend reports unavailable and search degrades.
    pub async fn start(
        config: Arc<ConfigManager>,
        paths: DataRoot,
        embedder: Option<Arc<EmbedderPool>>,
    ) -> Result<Arc<Self>> {
        paths.ensure()?;
        let cfg = config.current();

        let metrics = Arc::new(MetricsRegistry::new());
        let bus = Arc::new(EventBus::new());
        let tier1 = Arc::new(Tier1MetadataStore::new(cfg.projects.clone()));
        let tier2 = Tier2QueryCache::new(cfg.memory.global_index_mb as usize);
        if cfg.performance.cache_enabled {
            tier2.set_ttl_seconds(Some(cfg.performance.cache_ttl_seconds as i64));
        }
        let router = Arc::new(QueryRouter::new());

        let registry = RegistryStore::open(
            paths
                .registry_db()
                .to_str()
                .ok_or_else(|| GlobalIndexError::ConfigValidation("non-UTF8 data root".into()))?,
        )
        .await?;
        let manager = Arc::new(ProjectManager::new(
            registry.clone(),
            paths.clone(),
            config.clone(),
            embedder,
            metrics.clone(),
        ));
        let searcher = Arc::new(CrossProjectSearcher::new(manager.clone()));
        let backup = BackupScheduler::new(registry, paths.backups_dir());

        let tracker = Arc::new(MemoryTracker::new(config.clone()));
        {
            let t1 = tier1.clone();
            let t2 = tier2.clone();
            tracker.register_probe("global_index", move || {
                t1.accounted_bytes() + t2.total_bytes() as u64
            });
            let mgr = manager.clone();
            tracker.register_probe("project_indexes", move || mgr.accounted_bytes());
            let mgr = manager.clone();
            tracker.set_loaded_projects_probe(move || mgr.loaded_count());
            let t2 = tier2.clone();
            tracker.set_cached_queries_probe(move || t2.len());
        }

        let thresholds = Arc::new(ThresholdStateMachine::new());
        let eviction = Arc::new(EvictionEngine::new());
        {
            // Emergency eviction runs straight off the threshold crossing.
            let mgr: Weak<ProjectManager> = Arc::downgrade(&manager);
            let engine = eviction.clone();
            let metrics = metrics.clone();
            thresholds.set_critical_hook(move |target_mb| {
                let Some(mgr) = mgr.upgrade() else { return };
                metrics.incr("emergency_evictions");
                let result = engine.emergency_eviction(
                    mgr.eviction_candidates(),
                    target_mb,
                    |id| mgr.unload(id).is_some(),
                );
                OpsLog::record(
                    "emergency_eviction",
                    "eviction_engine",
                    if result.success { OpStatus::Success } else { OpStatus::Warning },
                    result.duration_ms,
                    json!({"freed_mb": result.freed_mb, "evicted": result.projects_evicted}),
                );
            });
        }

        let service = Arc::new(Self {
            config,
            paths,
            bus,
            tier1,
            tier2,
            router,
            metrics,
            tracker,
            thresholds,
            action_queue: Arc::new(ActionQueue::new()),
            eviction,
            manager,
            searcher,
            backup,
            warnings: Mutex::new(VecDeque::new()),
            shutdown: CancellationToken::new(),
            background: Mutex::new(Vec::new()),
        });

        service.wire_event_handlers();
        service.replay_registry().await?;
        service.spawn_background();
        Ok(service)
    }

    /// Tier 1 updates synchronously on every event; Tier 2 only marks
    /// affected entries stale.
    fn wire_event_handlers(&self) {
        for event_type in ["project_indexed", "project_updated", "project_deleted"] {
            let tier1 = self.tier1.clone();
            let tier2 = self.tier2.clone();
            let manager = self.manager.clone();
            self.bus.subscribe(event_type, move |event| {
                tier1.apply_event(event);
                tier2.mark_project_stale(event.project_id());
                match event {
                    ProjectEvent::Indexed { project_id, .. } => manager.add_known_id(project_id),
                    ProjectEvent::Deleted { project_id, .. } => {
                        manager.remove_known_id(project_id)
                    }
                    ProjectEvent::Updated { .. } => {}
                }
                Ok(())
            });
        }
    }

    /// Rebuild Tier 1 from the durable registry through the same event path
    /// a live indexing run would take.
    async fn replay_registry(&self) -> Result<()> {
        let records = self.manager.registry().list_all().await?;
        self.manager
            .set_known_ids(records.iter().map(|r| r.id.clone()));
        for record in records {
            let (stats, status, error_message) = decode_stats_json(&record.stats_json);
            let event = ProjectEvent::Indexed {
                project_id: record.id.clone(),
                project_path: record.path.clone(),
                timestamp: record.indexed_at,
                stats,
                status,
                error_message,
                metadata: Default::default(),
            };
            self.bus.emit(&event);
        }
        tracing::info!(projects = self.tier1.len(), "registry replayed into tier 1");
        Ok(())
    }

    fn spawn_background(self: &Arc<Self>) {
        let mut handles = self.background.lock().unwrap();

        // Singleton memory cadence: sample, classify, record warnings.
        let svc = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        handles.push(tokio::spawn(async move {
            loop {
                let every = match svc.upgrade() {
                    Some(s) => s.tracker.sample_interval(),
                    None => return,
                };
                tokio::select! {
                    _ = tokio::time::sleep(every) => {}
                    _ = shutdown.cancelled() => return,
                }
                let Some(s) = svc.upgrade() else { return };
                s.monitor_tick();
            }
        }));

        let backup = self.backup.clone();
        let shutdown = self.shutdown.clone();
        handles.push(tokio::spawn(async move {
            backup.run(shutdown).await;
        }));
    }

    /// One memory-monitor cycle. Public so tests and callers can force it.
    pub fn monitor_tick(&self) {
        let Some(snapshot) = self.tracker.sample() else {
            return;
        };
        self.metrics.set_gauge("rss_mb", snapshot.rss_mb);
        self.metrics
            .set_gauge("loaded_projects", snapshot.loaded_projects as f64);
        let memory = self.config.current().memory.clone();
        if let Some(warning) = self.thresholds.check(&snapshot, &memory) {
            let mut warnings = self.warnings.lock().unwrap();
            warnings.push_back(warning);
            while warnings.len() > WARNING_HISTORY {
                warnings.pop_front();
            }
        }
    }

    // --- indexing integration --------------------------------------------

    /// Called by the indexer after a payload write: registers or refreshes
    /// the project row, then emits `project_indexed`. The payload file must
    /// already be fsynced (the serializer guarantees this), keeping a crash
    /// between payload and registry row recoverable via orphan detection.
    pub async fn on_index_complete(
        &self,
        project_path: &str,
        stats: IndexStats,
        status: IndexStatus,
        error_message: Option<String>,
    ) -> Result<String> {
        let registry = self.manager.registry();
        let record = registry.get_by_path(project_path).await?;
        let id = match record {
            Some(r) => r.id,
            None => {
                let id = registry.register(project_path, "").await?;
                // Record where the payload lives for health checks.
                let index_dir = self.paths.project_index_dir(&id);
                sqlx::query("UPDATE projects SET index_location = ? WHERE id = ?")
                    .bind(index_dir.display().to_string())
                    .bind(&id)
                    .execute(registry.pool())
                    .await?;
                id
            }
        };

        registry
            .update_indexed(
                &id,
                stats.file_count as i64,
                &encode_stats_json(&stats, status, &error_message),
            )
            .await?;

        let event = ProjectEvent::Indexed {
            project_id: id.clone(),
            project_path: project_path.to_string(),
            timestamp: chrono::Utc::now().timestamp(),
            stats,
            status,
            error_message,
            metadata: Default::default(),
        };
        self.bus.emit(&event);
        self.metrics.incr("projects_indexed");
        Ok(id)
    }

    pub fn emit(&self, event: &ProjectEvent) {
        self.bus.emit(event);
    }

    // --- read surface -----------------------------------------------------

    pub fn dashboard(&self) -> Value {
        let started = Instant::now();
        let data = self.tier1.dashboard();
        self.metrics
            .observe("dashboard_latency_ms", started.elapsed().as_millis() as f64);
        json!({"status": "success", "data": data})
    }

    pub fn list_projects(&self, filters: &Value) -> Result<Value> {
        let parsed = parse_filters(filters)?;
        let projects = self.tier1.list_projects(&parsed);
        Ok(json!({"status": "success", "count": projects.len(), "projects": projects}))
    }

    pub fn project_metadata(&self, project_id: &str) -> Result<Value> {
        let meta = self
            .tier1
            .get(project_id)
            .ok_or_else(|| GlobalIndexError::ProjectNotFound(project_id.to_string()))?;
        Ok(json!({"status": "success", "project": &*meta}))
    }

    pub fn router(&self) -> &QueryRouter {
        &self.router
    }

    /// Route a query by kind string: Tier 1 reads, direct single-project
    /// search, cached cross-project search, or uncached federation.
    pub async fn query(&self, kind: &str, params: &Value) -> Result<Value> {
        use crate::global::router::Route;
        match self.router.route_str(kind, params)? {
            Route::Tier1 => match kind {
                "dashboard" => Ok(self.dashboard()),
                "global_stats" => {
                    Ok(json!({"status": "success", "stats": self.tier1.global_stats()}))
                }
                "list_projects" => self.list_projects(params),
                "project_metadata" | "project_health" => {
                    let id = params
                        .get("project_id")
                        .and_then(Value::as_str)
                        .ok_or_else(|| {
                            GlobalIndexError::Routing(format!("{kind} requires project_id"))
                        })?;
                    self.project_metadata(id)
                }
                other => Err(GlobalIndexError::Routing(format!(
                    "tier1 cannot serve {other}"
                ))),
            },
            Route::DirectProject(project_id) => {
                let mut search = params_to_search(params)?;
                search.project_ids = Some(vec![project_id]);
                let result = self.searcher.search(&search).await?;
                Ok(json!({
                    "status": "success",
                    "data": result,
                    "metadata": {"source": "direct", "is_stale": false, "rebuild_in_progress": false},
                }))
            }
            Route::Tier2 { .. } => {
                let mut search = params_to_search(params)?;
                search.project_ids = params
                    .get("project_ids")
                    .and_then(Value::as_array)
                    .map(|ids| {
                        ids.iter()
                            .filter_map(Value::as_str)
                            .map(String::from)
                            .collect()
                    });
                self.cross_project_search(search).await
            }
            Route::Federation => {
                let search = params_to_search(params)?;
                let result = self.searcher.search(&search).await?;
                Ok(json!({
                    "status": "success",
                    "data": result,
                    "metadata": {"source": "federation", "is_stale": false, "rebuild_in_progress": false},
                }))
            }
        }
    }

    // --- federated search -------------------------------------------------

    /// Cross-project search through the Tier 2 cache. Stale answers are
    /// served immediately with rebuild metadata attached.
    pub async fn cross_project_search(&self, params: CrossProjectParams) -> Result<Value> {
        let started = Instant::now();

        // Request-local failures surface before any cache involvement.
        crate::search::security::validate_pattern(&params.pattern)?;
        let known = self.manager.known_project_ids();
        if let Some(ids) = &params.project_ids {
            for id in ids {
                if !known.contains(id) {
                    return Err(GlobalIndexError::ProjectNotFound(id.clone()));
                }
            }
        }

        let involved = match &params.project_ids {
            Some(ids) => sorted_string_set(ids.iter().cloned()),
            None => vec![ALL_PROJECTS.to_string()],
        };
        let cache_params = json!({
            "pattern": params.pattern,
            "project_ids": params.project_ids.as_ref().map(|ids| sorted_string_set(ids.iter().cloned())),
            "fuzzy": params.fuzzy,
            "case_sensitive": params.case_sensitive,
            "file_pattern": params.file_pattern,
            "context_lines": params.context_lines,
            "max_results_per_project": params.max_results_per_project,
        });

        if !self.config.current().performance.cache_enabled {
            let result = self.searcher.search(&params).await?;
            return Ok(json!({
                "status": "success",
                "data": result,
                "metadata": {"source": "direct", "is_stale": false, "rebuild_in_progress": false},
            }));
        }

        let searcher = self.searcher.clone();
        let compute: ComputeFn = Arc::new(move || {
            let searcher = searcher.clone();
            let params = params.clone();
            Box::pin(async move {
                let result = searcher.search(&params).await.map_err(anyhow::Error::new)?;
                Ok(serde_json::to_value(&result)?)
            })
        });

        let outcome = self
            .tier2
            .query("cross_project_search", &cache_params, involved, compute)
            .await?;

        self.metrics
            .observe("cross_project_latency_ms", started.elapsed().as_millis() as f64);
        OpsLog::record(
            "cross_project_search",
            "query_router",
            OpStatus::Success,
            started.elapsed().as_millis() as u64,
            json!({"source": outcome.metadata.source.as_str()}),
        );
        Ok(json!({
            "status": "success",
            "data": outcome.data,
            "metadata": outcome.metadata,
        }))
    }

    // --- memory surface ---------------------------------------------------

    pub fn get_memory_status(&self) -> Value {
        let snapshot = self.tracker.latest().or_else(|| self.tracker.sample());
        let memory = self.config.current().memory.clone();
        let level = snapshot
            .as_ref()
            .map(|s| classify(s.rss_mb, &memory))
            .unwrap_or(self.thresholds.current_level());
        let warnings: Vec<ThresholdWarning> =
            self.warnings.lock().unwrap().iter().cloned().collect();
        json!({
            "status": "success",
            "level": level.as_str(),
            "snapshot": snapshot,
            "breakdown": self.tracker.breakdown(),
            "peak_mb": self.tracker.peak_mb(),
            "growth_rate_mb_per_min": self.tracker.growth_rate_mb_per_min(),
            "budget_mb": memory.total_budget_mb,
            "probe_degraded": self.tracker.is_degraded(),
            "warnings": warnings,
        })
    }

    /// Adjust the live budget: `hard` becomes the total budget, `soft`
    /// positions the prompt threshold; warning and emergency are re-derived
    /// around it so the ordering invariant holds.
    pub fn configure_memory(&self, soft_mb: u64, hard_mb: u64) -> Result<Value> {
        if soft_mb >= hard_mb {
            return Err(GlobalIndexError::ConfigValidation(format!(
                "soft limit {soft_mb}MB must be below hard limit {hard_mb}MB"
            )));
        }
        let prompt = (soft_mb as f64 / hard_mb as f64).clamp(0.05, 0.95);
        self.config.apply(|c| {
            c.memory.total_budget_mb = hard_mb;
            c.memory.prompt_threshold = prompt;
            c.memory.warning_threshold = prompt * 0.86;
            c.memory.emergency_threshold = prompt + (1.0 - prompt) * 0.7;
            // Keep the global-index slice inside its allowed share.
            let lo = hard_mb / 10;
            let hi = hard_mb / 2;
            c.memory.global_index_mb = c.memory.global_index_mb.clamp(lo, hi);
        })?;
        Ok(json!({
            "status": "success",
            "total_budget_mb": hard_mb,
            "prompt_threshold": prompt,
        }))
    }

    /// Enqueue and run one named relief action.
    pub fn manage_memory(&self, action: &str) -> Result<Value> {
        let kind = MemoryActionKind::parse(action).ok_or_else(|| {
            GlobalIndexError::ConfigValidation(format!("unknown memory action: {action}"))
        })?;
        self.action_queue.enqueue(MemoryAction {
            kind,
            priority: 10,
            payload: None,
            estimated_mb: 0.0,
        });
        let results = self.action_queue.execute_all(self);
        Ok(json!({"status": "success", "results": results}))
    }

    pub fn trigger_eviction(&self, target_mb: f64) -> Value {
        let result = self.eviction.emergency_eviction(
            self.manager.eviction_candidates(),
            target_mb,
            |id| self.manager.unload(id).is_some(),
        );
        json!({"status": "success", "result": result})
    }

    // --- config surface ---------------------------------------------------

    pub fn reload_config(&self) -> Value {
        let status = self.config.reload();
        let config = self.config.current();
        json!({"status": status, "config": &*config})
    }

    pub fn get_config_stats(&self) -> Value {
        json!({"status": "success", "stats": self.config.stats()})
    }

    // --- registry surface -------------------------------------------------

    pub async fn registry_health_check(&self) -> Value {
        let health = self.manager.registry().health_check().await;
        let status = if health.healthy { "success" } else { "error" };
        json!({"status": status, "health": health})
    }

    pub async fn detect_orphaned_indexes(&self, max_depth: Option<usize>) -> Result<Value> {
        let detector = OrphanDetector::new(self.paths.indexes_dir());
        let orphans = detector
            .detect(self.manager.registry(), max_depth.unwrap_or(DEFAULT_MAX_DEPTH))
            .await?;
        Ok(json!({"status": "success", "count": orphans.len(), "orphans": orphans}))
    }

    pub async fn backup_registry(&self) -> Result<Value> {
        let path = self.backup.backup_now().await?;
        Ok(json!({"status": "success", "backup_path": path.display().to_string()}))
    }

    // --- health & lifecycle -----------------------------------------------

    pub async fn health_check(&self) -> Value {
        let registry = self.manager.registry().health_check().await;
        let tracker = if self.tracker.is_degraded() {
            HealthStatus::unhealthy("RSS probe failing", json!({}))
        } else {
            HealthStatus::healthy("memory tracker sampling")
        };
        let bus_stats = self.bus.stats();
        let tier2_stats = self.tier2.stats();
        let healthy = registry.healthy && !self.tracker.is_degraded();
        let status = if healthy { "success" } else { "error" };
        json!({
            "status": status,
            "components": {
                "project_registry": registry,
                "memory_tracker": tracker,
                "event_bus": bus_stats,
                "tier2_cache": tier2_stats,
                "query_router": self.router.stats(),
            },
            "metrics": self.metrics.snapshot(),
        })
    }

    pub fn tier2(&self) -> &Arc<Tier2QueryCache> {
        &self.tier2
    }

    pub fn tier1(&self) -> &Arc<Tier1MetadataStore> {
        &self.tier1
    }

    pub fn manager(&self) -> &Arc<ProjectManager> {
        &self.manager
    }

    /// Top-down shutdown: cancel background work, give the in-flight backup
    /// its grace, then return.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handles: Vec<JoinHandle<()>> = self.background.lock().unwrap().drain(..).collect();
        for handle in handles {
            if tokio::time::timeout(SHUTDOWN_GRACE, handle).await.is_err() {
                tracing::warn!("background task did not stop within grace period");
            }
        }
        tracing::info!("global index service stopped");
    }
}

impl ActionExecutor for GlobalIndexService {
    fn execute(&self, action: &MemoryAction) -> anyhow::Result<f64> {
        match action.kind {
            // No on-demand collector in Rust; the action is nominal.
            MemoryActionKind::GarbageCollect => Ok(0.0),
            MemoryActionKind::ClearQueryCache => {
                let mb = self.tier2.total_bytes() as f64 / (1024.0 * 1024.0);
                self.tier2.clear();
                Ok(mb)
            }
            MemoryActionKind::UnloadFiles => Ok(self.manager.unload_idle(IDLE_UNLOAD_SECS)),
            MemoryActionKind::UnloadProjects => match &action.payload {
                Some(ids) => Ok(ids
                    .iter()
                    .filter_map(|id| self.manager.unload(id))
                    .sum()),
                None => Ok(self.manager.unload_idle(60.0)),
            },
            MemoryActionKind::EmergencyEvict => {
                let target = if action.estimated_mb > 0.0 {
                    action.estimated_mb
                } else {
                    256.0
                };
                let result = self.eviction.emergency_eviction(
                    self.manager.eviction_candidates(),
                    target,
                    |id| self.manager.unload(id).is_some(),
                );
                Ok(result.freed_mb)
            }
        }
    }
}

// --- helpers --------------------------------------------------------------

fn encode_stats_json(
    stats: &IndexStats,
    status: IndexStatus,
    error_message: &Option<String>,
) -> Value {
    let mut v = serde_json::to_value(stats).unwrap_or_else(|_| json!({}));
    v["status"] = json!(status);
    v["error_message"] = json!(error_message);
    v
}

fn decode_stats_json(raw: &str) -> (IndexStats, IndexStatus, Option<String>) {
    let value: Value = serde_json::from_str(raw).unwrap_or_else(|_| json!({}));
    let stats: IndexStats = serde_json::from_value(value.clone()).unwrap_or_default();
    let status: IndexStatus =
        serde_json::from_value(value["status"].clone()).unwrap_or(IndexStatus::Completed);
    let error_message = value["error_message"].as_str().map(String::from);
    (stats, status, error_message)
}

fn params_to_search(params: &Value) -> Result<CrossProjectParams> {
    let pattern = params
        .get("pattern")
        .or_else(|| params.get("query"))
        .and_then(Value::as_str)
        .ok_or_else(|| GlobalIndexError::Routing("search requires a pattern".into()))?;
    let mut search = CrossProjectParams::new(pattern);
    search.fuzzy = params.get("fuzzy").and_then(Value::as_bool).unwrap_or(false);
    search.case_sensitive = params
        .get("case_sensitive")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    search.file_pattern = params
        .get("file_pattern")
        .and_then(Value::as_str)
        .map(String::from);
    search.context_lines = params
        .get("context_lines")
        .and_then(Value::as_u64)
        .unwrap_or(0) as u32;
    search.max_results_per_project = params
        .get("max_results_per_project")
        .and_then(Value::as_u64)
        .unwrap_or(20) as usize;
    Ok(search)
}

fn parse_filters(filters: &Value) -> Result<ProjectFilters> {
    let status = match filters.get("status").and_then(Value::as_str) {
        Some(s) => Some(
            serde_json::from_value(json!(s))
                .map_err(|_| GlobalIndexError::Routing(format!("unknown status filter: {s}")))?,
        ),
        None => None,
    };
    Ok(ProjectFilters {
        status,
        language: filters
            .get("language")
            .and_then(Value::as_str)
            .map(String::from),
        min_health: filters.get("min_health").and_then(Value::as_f64),
        limit: filters
            .get("limit")
            .and_then(Value::as_u64)
            .map(|v| v as usize),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LeIndexConfig;
    use std::collections::HashMap;
    use tempfile::TempDir;

    async fn service(dir: &TempDir) -> Arc<GlobalIndexService> {
        let config = Arc::new(ConfigManager::from_config(LeIndexConfig::default()).unwrap());
        let paths = DataRoot::new(dir.path().join("data"));
        GlobalIndexService::start(config, paths, None).await.unwrap()
    }

    fn stats(files: u64, symbols: u64, langs: &[(&str, u64)], size_mb: f64) -> IndexStats {
        IndexStats {
            file_count: files,
            symbol_count: symbols,
            languages: langs.iter().map(|(l, c)| (l.to_string(), *c)).collect(),
            size_mb,
            dependencies: vec![],
        }
    }

    /// Seed one project with real files and full-text segments so search
    /// has something to find.
    async fn seed_searchable(
        svc: &Arc<GlobalIndexService>,
        dir: &TempDir,
        name: &str,
        content: &str,
    ) -> String {
        let root = dir.path().join("work").join(name);
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(root.join("lib.rs"), content).unwrap();

        let id = svc
            .on_index_complete(
                root.to_str().unwrap(),
                stats(1, 5, &[("Rust", 1)], 1.0),
                IndexStatus::Completed,
                None,
            )
            .await
            .unwrap();

        // Write full-text segments the way the indexer collaborator would.
        let state = svc.manager().get_or_load(&id).await.unwrap();
        if let Some(ft) = &state.fulltext {
            ft.upsert_file("lib.rs", &[(1, content.lines().count() as u32, content.into())])
                .await
                .unwrap();
        }
        id
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn dashboard_after_three_indexings() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir).await;

        for (name, st, status, err) in [
            ("a", stats(10, 100, &[("Py", 10)], 5.0), IndexStatus::Completed, None),
            ("b", stats(5, 50, &[("Rust", 5)], 3.0), IndexStatus::Completed, None),
            ("c", stats(0, 0, &[], 0.0), IndexStatus::Error, Some("x".to_string())),
        ] {
            let root = dir.path().join("work").join(name);
            std::fs::create_dir_all(&root).unwrap();
            svc.on_index_complete(root.to_str().unwrap(), st, status, err)
                .await
                .unwrap();
        }

        let dash = svc.dashboard();
        let data = &dash["data"];
        assert_eq!(data["stats"]["total_projects"], 3);
        assert_eq!(data["stats"]["total_files"], 15);
        assert_eq!(data["stats"]["total_symbols"], 150);
        assert_eq!(data["stats"]["languages"]["Py"], 10);
        assert_eq!(data["stats"]["languages"]["Rust"], 5);
        let health = data["stats"]["average_health"].as_f64().unwrap();
        assert!((health - 2.0 / 3.0).abs() < 1e-9);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn reindex_event_is_idempotent_in_tier1() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir).await;
        let root = dir.path().join("work").join("a");
        std::fs::create_dir_all(&root).unwrap();

        let st = stats(10, 100, &[("Py", 10)], 5.0);
        svc.on_index_complete(root.to_str().unwrap(), st.clone(), IndexStatus::Completed, None)
            .await
            .unwrap();
        svc.on_index_complete(root.to_str().unwrap(), st, IndexStatus::Completed, None)
            .await
            .unwrap();

        let dash = svc.dashboard();
        assert_eq!(dash["data"]["stats"]["total_projects"], 1);
        assert_eq!(dash["data"]["stats"]["total_symbols"], 100);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cross_project_search_end_to_end_with_staleness() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir).await;
        let id_a = seed_searchable(&svc, &dir, "alpha", "fn shared_needle() {}\n").await;
        seed_searchable(&svc, &dir, "beta", "fn other_stuff() {}\n").await;

        let mut params = CrossProjectParams::new("shared_needle");
        params.project_ids = Some(vec![id_a.clone()]);
        let first = svc.cross_project_search(params.clone()).await.unwrap();
        assert_eq!(first["metadata"]["source"], "miss");
        assert_eq!(first["data"]["successful_projects"], 1);
        assert!(first["data"]["total_results"].as_u64().unwrap() >= 1);

        // Identical query now hits the cache.
        let second = svc.cross_project_search(params.clone()).await.unwrap();
        assert_eq!(second["metadata"]["source"], "fresh");

        // A re-index of the involved project makes the entry stale.
        svc.on_index_complete(
            dir.path().join("work").join("alpha").to_str().unwrap(),
            stats(1, 6, &[("Rust", 1)], 1.0),
            IndexStatus::Completed,
            None,
        )
        .await
        .unwrap();
        let third = svc.cross_project_search(params).await.unwrap();
        assert_eq!(third["metadata"]["source"], "stale");
        assert_eq!(third["metadata"]["rebuild_in_progress"], true);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unknown_project_id_rejected_before_cache() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir).await;
        let mut params = CrossProjectParams::new("anything");
        params.project_ids = Some(vec!["ghost".into()]);
        let err = svc.cross_project_search(params).await.unwrap_err();
        assert_eq!(err.error_type(), "project_not_found");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn memory_surface_round_trip() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir).await;
        svc.monitor_tick();

        let status = svc.get_memory_status();
        assert_eq!(status["status"], "success");
        assert!(status["snapshot"]["rss_mb"].as_f64().unwrap() > 0.0);

        let configured = svc.configure_memory(2048, 4096).unwrap();
        assert_eq!(configured["total_budget_mb"], 4096);
        assert!(svc.configure_memory(4096, 4096).is_err());

        let managed = svc.manage_memory("clear_query_cache").unwrap();
        assert_eq!(managed["results"][0]["success"], true);
        assert!(svc.manage_memory("defragment").is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn eviction_frees_loaded_projects() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir).await;
        let id = seed_searchable(&svc, &dir, "alpha", "fn f() {}\n").await;
        assert_eq!(svc.manager().loaded_count(), 1);

        let result = svc.trigger_eviction(10_000.0);
        assert_eq!(result["result"]["projects_evicted"], 1);
        assert_eq!(svc.manager().loaded_count(), 0);

        // The project is still registered and reloadable.
        assert!(svc.manager().get_or_load(&id).await.is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn registry_surface_and_shutdown() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir).await;
        seed_searchable(&svc, &dir, "alpha", "fn f() {}\n").await;

        let health = svc.registry_health_check().await;
        assert_eq!(health["status"], "success");

        let orphans = svc.detect_orphaned_indexes(None).await.unwrap();
        assert_eq!(orphans["count"], 0);

        let backup = svc.backup_registry().await.unwrap();
        assert!(std::path::Path::new(backup["backup_path"].as_str().unwrap()).exists());

        svc.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn replay_rebuilds_tier1_from_registry() {
        let dir = TempDir::new().unwrap();
        let config = Arc::new(ConfigManager::from_config(LeIndexConfig::default()).unwrap());
        let paths = DataRoot::new(dir.path().join("data"));
        {
            let svc = GlobalIndexService::start(config.clone(), paths.clone(), None)
                .await
                .unwrap();
            let root = dir.path().join("work").join("a");
            std::fs::create_dir_all(&root).unwrap();
            svc.on_index_complete(
                root.to_str().unwrap(),
                stats(7, 70, &[("Go", 7)], 2.0),
                IndexStatus::Completed,
                None,
            )
            .await
            .unwrap();
            svc.shutdown().await;
        }

        // A fresh service over the same data root sees the project again.
        let svc = GlobalIndexService::start(config, paths, None).await.unwrap();
        let dash = svc.dashboard();
        assert_eq!(dash["data"]["stats"]["total_projects"], 1);
        assert_eq!(dash["data"]["stats"]["total_files"], 7);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn routed_queries_reach_each_tier() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir).await;
        let id = seed_searchable(&svc, &dir, "alpha", "fn routed_needle() {}\n").await;

        let dash = svc.query("dashboard", &json!({})).await.unwrap();
        assert_eq!(dash["data"]["stats"]["total_projects"], 1);

        let meta = svc
            .query("project_metadata", &json!({"project_id": id}))
            .await
            .unwrap();
        assert_eq!(meta["project"]["id"], json!(id));

        let direct = svc
            .query(
                "project_search",
                &json!({"project_id": id, "pattern": "routed_needle"}),
            )
            .await
            .unwrap();
        assert_eq!(direct["metadata"]["source"], "direct");

        let cached = svc
            .query("cross_project_search", &json!({"pattern": "routed_needle"}))
            .await
            .unwrap();
        assert_eq!(cached["metadata"]["source"], "miss");

        let err = svc.query("telepathy", &json!({})).await.unwrap_err();
        assert_eq!(err.error_type(), "routing_error");
        assert!(svc.router().stats().routing_errors >= 1);
    }

    #[test]
    fn stats_json_round_trip() {
        let mut langs = HashMap::new();
        langs.insert("Rust".to_string(), 3u64);
        let original = IndexStats {
            file_count: 3,
            symbol_count: 30,
            languages: langs,
            size_mb: 1.5,
            dependencies: vec!["dep-a".into()],
        };
        let encoded = encode_stats_json(&original, IndexStatus::Partial, &Some("half".into()));
        let (stats, status, error) = decode_stats_json(&encoded.to_string());
        assert_eq!(stats.file_count, 3);
        assert_eq!(stats.languages["Rust"], 3);
        assert_eq!(status, IndexStatus::Partial);
        assert_eq!(error.as_deref(), Some("half"));
    }
}
