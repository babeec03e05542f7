//! Loaded-project management: per-project backend sets, lazy loading from
//! the index payload, and unloading for memory relief.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use async_trait::async_trait;

use crate::config::{ConfigManager, ProjectPriority};
use crate::error::{GlobalIndexError, Result};
use crate::global::monitoring::MetricsRegistry;
use crate::memory::eviction::EvictionCandidate;
use crate::paths::DataRoot;
use crate::registry::serializer::{self, FULLTEXT_DIR, PAYLOAD_FILE};
use crate::registry::store::RegistryStore;
use crate::search::backend::SearchBackend;
use crate::search::cross_project::ProjectBackendProvider;
use crate::search::fulltext::FullTextBackend;
use crate::search::regexsearch::{EmbeddedGrepBackend, RipgrepBackend};
use crate::search::semantic::{EmbedderPool, SemanticBackend};

/// One project's resident backend set.
pub struct ProjectState {
    pub id: String,
    pub path: PathBuf,
    pub semantic: Arc<SemanticBackend>,
    pub fulltext: Option<Arc<FullTextBackend>>,
    pub ripgrep: Arc<RipgrepBackend>,
    pub grep: Arc<EmbeddedGrepBackend>,
    pub priority: ProjectPriority,
    pub estimated_mb: f64,
    pub pinned: AtomicBool,
    pub building: AtomicBool,
    last_access: Mutex<Instant>,
}

impl std::fmt::Debug for ProjectState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectState")
            .field("id", &self.id)
            .field("path", &self.path)
            .finish()
    }
}

impl ProjectState {
    pub fn touch(&self) {
        *self.last_access.lock().unwrap() = Instant::now();
    }

    pub fn idle_secs(&self) -> f64 {
        self.last_access.lock().unwrap().elapsed().as_secs_f64()
    }

    pub fn backends(&self) -> Vec<Arc<dyn SearchBackend>> {
        let mut backends: Vec<Arc<dyn SearchBackend>> = vec![
            self.semantic.clone(),
            self.ripgrep.clone(),
            self.grep.clone(),
        ];
        if let Some(ft) = &self.fulltext {
            backends.push(ft.clone());
        }
        backends
    }
}

/// Owns the loaded-project map. Loading is lazy; unloading drops the whole
/// state (indexes included) and is the unit of memory relief.
pub struct ProjectManager {
    registry: RegistryStore,
    paths: DataRoot,
    config: Arc<ConfigManager>,
    embedder: Option<Arc<EmbedderPool>>,
    metrics: Arc<MetricsRegistry>,
    projects: RwLock<HashMap<String, Arc<ProjectState>>>,
    /// Registered ids, kept in sync so availability checks stay synchronous.
    known_ids: RwLock<HashSet<String>>,
}

impl ProjectManager {
    pub fn new(
        registry: RegistryStore,
        paths: DataRoot,
        config: Arc<ConfigManager>,
        embedder: Option<Arc<EmbedderPool>>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            registry,
            paths,
            config,
            embedder,
            metrics,
            projects: RwLock::new(HashMap::new()),
            known_ids: RwLock::new(HashSet::new()),
        }
    }

    pub fn registry(&self) -> &RegistryStore {
        &self.registry
    }

    pub fn set_known_ids(&self, ids: impl IntoIterator<Item = String>) {
        *self.known_ids.write().unwrap() = ids.into_iter().collect();
    }

    pub fn add_known_id(&self, id: &str) {
        self.known_ids.write().unwrap().insert(id.to_string());
    }

    pub fn remove_known_id(&self, id: &str) {
        self.known_ids.write().unwrap().remove(id);
        self.unload(id);
    }

    pub fn loaded_count(&self) -> usize {
        self.projects.read().unwrap().len()
    }

    pub fn loaded_ids(&self) -> Vec<String> {
        self.projects.read().unwrap().keys().cloned().collect()
    }

    /// Resident bytes across loaded semantic indexes, for the memory tracker.
    pub fn accounted_bytes(&self) -> u64 {
        self.projects
            .read()
            .unwrap()
            .values()
            .map(|p| p.semantic.index_memory_bytes() as u64)
            .sum()
    }

    pub fn get_loaded(&self, id: &str) -> Option<Arc<ProjectState>> {
        self.projects.read().unwrap().get(id).cloned()
    }

    /// Load a project's backends from its index directory, or return the
    /// resident state.
    pub async fn get_or_load(&self, project_id: &str) -> Result<Arc<ProjectState>> {
        if let Some(state) = self.get_loaded(project_id) {
            state.touch();
            return Ok(state);
        }

        let record = self
            .registry
            .get(project_id)
            .await?
            .ok_or_else(|| GlobalIndexError::ProjectNotFound(project_id.to_string()))?;

        let index_dir = if record.index_location.is_empty() {
            self.paths.project_index_dir(project_id)
        } else {
            PathBuf::from(&record.index_location)
        };
        let project_root = PathBuf::from(&record.path);

        let semantic = Arc::new(SemanticBackend::new(
            project_root.clone(),
            self.embedder.clone(),
            self.metrics.clone(),
        ));
        let payload_path = index_dir.join(PAYLOAD_FILE);
        let mut estimated_mb = self.config.current().projects.default_estimated_mb as f64;
        if payload_path.is_file() {
            let load_path = payload_path.clone();
            let loaded =
                tokio::task::spawn_blocking(move || serializer::read_payload(&load_path))
                    .await
                    .map_err(|e| GlobalIndexError::Internal(e.into()))?;
            match loaded {
                Ok(payload) => {
                    semantic.load_index(payload);
                    let bytes = semantic.index_memory_bytes();
                    if bytes > 0 {
                        estimated_mb = (bytes as f64 / (1024.0 * 1024.0)).max(1.0);
                    }
                }
                Err(e) => {
                    // Corrupt or unknown-generation payload: project stays
                    // registered, index rebuilds on the next run.
                    tracing::warn!(project_id, error = %e, "index payload unreadable, marked corrupt");
                    self.metrics.incr("corrupt_index_payloads");
                }
            }
        }

        let fulltext = match FullTextBackend::open(&index_dir.join(FULLTEXT_DIR)).await {
            Ok(ft) => Some(Arc::new(ft)),
            Err(e) => {
                tracing::warn!(project_id, error = %e, "full-text segments unavailable");
                None
            }
        };

        let state = Arc::new(ProjectState {
            id: record.id.clone(),
            path: project_root.clone(),
            semantic,
            fulltext,
            ripgrep: Arc::new(RipgrepBackend::new(project_root.clone())),
            grep: Arc::new(EmbeddedGrepBackend::new(project_root)),
            priority: self.config.current().projects.default_priority,
            estimated_mb,
            pinned: AtomicBool::new(false),
            building: AtomicBool::new(false),
            last_access: Mutex::new(Instant::now()),
        });

        self.projects
            .write()
            .unwrap()
            .insert(record.id.clone(), state.clone());
        self.add_known_id(&record.id);
        tracing::info!(project_id = %record.id, path = %record.path, "project loaded");
        Ok(state)
    }

    /// Drop a project's resident state. Returns the MB estimate it held.
    pub fn unload(&self, project_id: &str) -> Option<f64> {
        let state = self.projects.write().unwrap().remove(project_id)?;
        if state.pinned.load(Ordering::Relaxed) || state.building.load(Ordering::Relaxed) {
            // Owner refuses: put it back untouched.
            self.projects
                .write()
                .unwrap()
                .insert(project_id.to_string(), state);
            return None;
        }
        state.semantic.unload_index();
        tracing::info!(project_id, "project unloaded");
        Some(state.estimated_mb)
    }

    /// Unload every project idle longer than `min_idle_secs`. Returns MB freed.
    pub fn unload_idle(&self, min_idle_secs: f64) -> f64 {
        let idle: Vec<String> = self
            .projects
            .read()
            .unwrap()
            .values()
            .filter(|p| p.idle_secs() >= min_idle_secs)
            .map(|p| p.id.clone())
            .collect();
        idle.iter().filter_map(|id| self.unload(id)).sum()
    }

    /// Eviction candidates for every currently-loaded project.
    pub fn eviction_candidates(&self) -> Vec<EvictionCandidate> {
        self.projects
            .read()
            .unwrap()
            .values()
            .map(|p| EvictionCandidate {
                project_id: p.id.clone(),
                idle_secs: p.idle_secs(),
                priority: p.priority,
                estimated_mb: p.estimated_mb,
                pinned: p.pinned.load(Ordering::Relaxed),
                building: p.building.load(Ordering::Relaxed),
            })
            .collect()
    }
}

#[async_trait]
impl ProjectBackendProvider for ProjectManager {
    fn known_project_ids(&self) -> Vec<String> {
        self.known_ids.read().unwrap().iter().cloned().collect()
    }

    async fn backends_for(&self, project_id: &str) -> anyhow::Result<Vec<Arc<dyn SearchBackend>>> {
        let state = self.get_or_load(project_id).await?;
        Ok(state.backends())
    }
}
