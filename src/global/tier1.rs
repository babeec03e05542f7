//! Tier 1 — materialized per-project metadata, always fresh.
//!
//! Event application replaces the whole entry under a lock; global
//! aggregates are recomputed lazily on the next dashboard read.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use serde::Serialize;

use crate::config::{ProjectPriority, ProjectDefaults};
use crate::events::{IndexStatus, ProjectEvent};

/// Per-project configuration carried in the metadata entry.
#[derive(Debug, Clone, Serialize)]
pub struct ProjectConfigMeta {
    pub priority: ProjectPriority,
    pub estimated_mb: u64,
}

/// A project's materialized metadata. Owned by the store; handed out as a
/// read-only `Arc` snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct ProjectMetadata {
    pub id: String,
    pub path: String,
    pub name: String,
    pub last_indexed: i64,
    pub symbol_count: u64,
    pub file_count: u64,
    pub languages: HashMap<String, u64>,
    pub dependencies: Vec<String>,
    pub health_score: f64,
    pub status: IndexStatus,
    pub size_mb: f64,
    pub error_message: Option<String>,
    pub config: ProjectConfigMeta,
}

/// Derived view over all projects. Recomputed lazily; never persisted.
#[derive(Debug, Clone, Serialize, Default)]
pub struct GlobalStats {
    pub total_projects: usize,
    pub total_symbols: u64,
    pub total_files: u64,
    pub languages: HashMap<String, u64>,
    pub average_health: f64,
    pub total_size_mb: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DashboardData {
    pub stats: GlobalStats,
    pub projects: Vec<ProjectMetadata>,
}

/// Filters for `list_projects`.
#[derive(Debug, Clone, Default)]
pub struct ProjectFilters {
    pub status: Option<IndexStatus>,
    /// Case-insensitive membership in the project's language histogram.
    pub language: Option<String>,
    pub min_health: Option<f64>,
    pub limit: Option<usize>,
}

/// Health from status, refined by stats without breaking the status bound.
fn health_score(status: IndexStatus, symbol_count: u64) -> f64 {
    let base = match status {
        IndexStatus::Completed => 1.0,
        IndexStatus::Partial => 0.7,
        IndexStatus::Building => 0.5,
        IndexStatus::Error => 0.0,
    };
    let refined: f64 = if status == IndexStatus::Completed && symbol_count == 0 {
        base - 0.1
    } else {
        base
    };
    refined.clamp(0.0, 1.0)
}

/// The Tier 1 store. All reads are O(1) or O(projects); the dashboard path
/// must stay under a millisecond for ~100 projects.
pub struct Tier1MetadataStore {
    projects: RwLock<HashMap<String, Arc<ProjectMetadata>>>,
    aggregates_dirty: AtomicBool,
    cached_stats: Mutex<GlobalStats>,
    defaults: ProjectDefaults,
}

impl Tier1MetadataStore {
    pub fn new(defaults: ProjectDefaults) -> Self {
        Self {
            projects: RwLock::new(HashMap::new()),
            aggregates_dirty: AtomicBool::new(false),
            cached_stats: Mutex::new(GlobalStats::default()),
            defaults,
        }
    }

    /// Apply one registry event. Synchronous; must complete in <5 ms.
    pub fn apply_event(&self, event: &ProjectEvent) {
        match event {
            ProjectEvent::Indexed {
                project_id,
                project_path,
                timestamp,
                stats,
                status,
                error_message,
                ..
            } => {
                let name = std::path::Path::new(project_path)
                    .file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or(project_id)
                    .to_string();
                let meta = Arc::new(ProjectMetadata {
                    id: project_id.clone(),
                    path: project_path.clone(),
                    name,
                    last_indexed: *timestamp,
                    symbol_count: stats.symbol_count,
                    file_count: stats.file_count,
                    languages: stats.languages.clone(),
                    dependencies: stats.dependencies.clone(),
                    health_score: health_score(*status, stats.symbol_count),
                    status: *status,
                    size_mb: stats.size_mb,
                    error_message: error_message.clone(),
                    config: ProjectConfigMeta {
                        priority: self.defaults.default_priority,
                        estimated_mb: self.defaults.default_estimated_mb,
                    },
                });
                self.projects
                    .write()
                    .unwrap()
                    .insert(project_id.clone(), meta);
                self.aggregates_dirty.store(true, Ordering::Release);
            }
            ProjectEvent::Updated { project_id, timestamp, .. } => {
                let mut projects = self.projects.write().unwrap();
                if let Some(existing) = projects.get(project_id) {
                    let mut updated = (**existing).clone();
                    updated.last_indexed = *timestamp;
                    projects.insert(project_id.clone(), Arc::new(updated));
                    self.aggregates_dirty.store(true, Ordering::Release);
                }
            }
            ProjectEvent::Deleted { project_id, .. } => {
                if self.projects.write().unwrap().remove(project_id).is_some() {
                    self.aggregates_dirty.store(true, Ordering::Release);
                }
            }
        }
    }

    pub fn get(&self, project_id: &str) -> Option<Arc<ProjectMetadata>> {
        self.projects.read().unwrap().get(project_id).cloned()
    }

    pub fn project_ids(&self) -> Vec<String> {
        self.projects.read().unwrap().keys().cloned().collect()
    }

    pub fn contains(&self, project_id: &str) -> bool {
        self.projects.read().unwrap().contains_key(project_id)
    }

    pub fn len(&self) -> usize {
        self.projects.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rough accounting of Tier 1 resident bytes for the memory tracker.
    pub fn accounted_bytes(&self) -> u64 {
        let projects = self.projects.read().unwrap();
        projects
            .values()
            .map(|p| {
                512 + p.path.len()
                    + p.name.len()
                    + p.languages.len() * 32
                    + p.dependencies.iter().map(String::len).sum::<usize>()
            })
            .sum::<usize>() as u64
    }

    /// Global aggregates, recomputed only when projects changed.
    pub fn global_stats(&self) -> GlobalStats {
        if self.aggregates_dirty.swap(false, Ordering::AcqRel) {
            let projects = self.projects.read().unwrap();
            let mut stats = GlobalStats {
                total_projects: projects.len(),
                ..GlobalStats::default()
            };
            for p in projects.values() {
                stats.total_symbols += p.symbol_count;
                stats.total_files += p.file_count;
                stats.total_size_mb += p.size_mb;
                for (lang, count) in &p.languages {
                    *stats.languages.entry(lang.clone()).or_insert(0) += count;
                }
            }
            if !projects.is_empty() {
                stats.average_health = projects.values().map(|p| p.health_score).sum::<f64>()
                    / projects.len() as f64;
            }
            *self.cached_stats.lock().unwrap() = stats;
        }
        self.cached_stats.lock().unwrap().clone()
    }

    /// Full dashboard snapshot: stats plus the project list.
    pub fn dashboard(&self) -> DashboardData {
        let stats = self.global_stats();
        let mut projects: Vec<ProjectMetadata> = self
            .projects
            .read()
            .unwrap()
            .values()
            .map(|p| (**p).clone())
            .collect();
        projects.sort_by(|a, b| a.id.cmp(&b.id));
        DashboardData { stats, projects }
    }

    pub fn list_projects(&self, filters: &ProjectFilters) -> Vec<ProjectMetadata> {
        let language = filters.language.as_ref().map(|l| l.to_lowercase());
        let mut result: Vec<ProjectMetadata> = self
            .projects
            .read()
            .unwrap()
            .values()
            .filter(|p| {
                if let Some(status) = filters.status {
                    if p.status != status {
                        return false;
                    }
                }
                if let Some(lang) = &language {
                    if !p.languages.keys().any(|l| l.to_lowercase() == *lang) {
                        return false;
                    }
                }
                if let Some(min) = filters.min_health {
                    if p.health_score < min {
                        return false;
                    }
                }
                true
            })
            .map(|p| (**p).clone())
            .collect();
        result.sort_by(|a, b| a.id.cmp(&b.id));
        if let Some(limit) = filters.limit {
            result.truncate(limit);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::IndexStats;

    fn store() -> Tier1MetadataStore {
        Tier1MetadataStore::new(ProjectDefaults::default())
    }

    fn indexed(
        id: &str,
        status: IndexStatus,
        files: u64,
        symbols: u64,
        langs: &[(&str, u64)],
        size_mb: f64,
        error: Option<&str>,
    ) -> ProjectEvent {
        ProjectEvent::indexed(
            id,
            format!("/work/{id}"),
            IndexStats {
                file_count: files,
                symbol_count: symbols,
                languages: langs.iter().map(|(l, c)| (l.to_string(), *c)).collect(),
                size_mb,
                dependencies: vec![],
            },
            status,
            error.map(String::from),
        )
        .unwrap()
    }

    #[test]
    fn dashboard_after_three_indexings() {
        let store = store();
        store.apply_event(&indexed("A", IndexStatus::Completed, 10, 100, &[("Py", 10)], 5.0, None));
        store.apply_event(&indexed("B", IndexStatus::Completed, 5, 50, &[("Rust", 5)], 3.0, None));
        store.apply_event(&indexed("C", IndexStatus::Error, 0, 0, &[], 0.0, Some("x")));

        let dash = store.dashboard();
        assert_eq!(dash.stats.total_projects, 3);
        assert_eq!(dash.stats.total_files, 15);
        assert_eq!(dash.stats.total_symbols, 150);
        assert_eq!(dash.stats.languages["Py"], 10);
        assert_eq!(dash.stats.languages["Rust"], 5);
        let expected = (1.0 + 1.0 + 0.0) / 3.0;
        assert!((dash.stats.average_health - expected).abs() < 1e-9);
        assert_eq!(dash.projects.len(), 3);
    }

    #[test]
    fn health_scores_follow_status() {
        assert_eq!(health_score(IndexStatus::Completed, 100), 1.0);
        assert_eq!(health_score(IndexStatus::Partial, 100), 0.7);
        assert_eq!(health_score(IndexStatus::Building, 0), 0.5);
        assert_eq!(health_score(IndexStatus::Error, 0), 0.0);
        // Completed with no symbols is suspicious but still bounded by status.
        let refined = health_score(IndexStatus::Completed, 0);
        assert!((refined - 0.9).abs() < 1e-9);
    }

    #[test]
    fn applying_same_event_twice_is_idempotent() {
        let store = store();
        let event = indexed("A", IndexStatus::Completed, 10, 100, &[("Py", 10)], 5.0, None);
        store.apply_event(&event);
        let first = store.dashboard();
        store.apply_event(&event);
        let second = store.dashboard();
        assert_eq!(first.stats.total_projects, second.stats.total_projects);
        assert_eq!(first.stats.total_symbols, second.stats.total_symbols);
        assert_eq!(first.projects[0].last_indexed, second.projects[0].last_indexed);
    }

    #[test]
    fn list_projects_filters() {
        let store = store();
        store.apply_event(&indexed("A", IndexStatus::Completed, 10, 100, &[("Python", 10)], 5.0, None));
        store.apply_event(&indexed("B", IndexStatus::Partial, 5, 50, &[("Rust", 5)], 3.0, None));
        store.apply_event(&indexed("C", IndexStatus::Error, 0, 0, &[], 0.0, Some("x")));

        let by_status = store.list_projects(&ProjectFilters {
            status: Some(IndexStatus::Partial),
            ..Default::default()
        });
        assert_eq!(by_status.len(), 1);
        assert_eq!(by_status[0].id, "B");

        // Language filter is case-insensitive.
        let by_lang = store.list_projects(&ProjectFilters {
            language: Some("python".into()),
            ..Default::default()
        });
        assert_eq!(by_lang.len(), 1);
        assert_eq!(by_lang[0].id, "A");

        let healthy = store.list_projects(&ProjectFilters {
            min_health: Some(0.6),
            ..Default::default()
        });
        assert_eq!(healthy.len(), 2);

        let limited = store.list_projects(&ProjectFilters {
            limit: Some(1),
            ..Default::default()
        });
        assert_eq!(limited.len(), 1);
    }

    #[test]
    fn deleted_project_leaves_aggregates() {
        let store = store();
        store.apply_event(&indexed("A", IndexStatus::Completed, 10, 100, &[("Py", 10)], 5.0, None));
        store.apply_event(&indexed("B", IndexStatus::Completed, 5, 50, &[("Rust", 5)], 3.0, None));
        store.apply_event(&ProjectEvent::Deleted {
            project_id: "A".into(),
            timestamp: 0,
        });
        let stats = store.global_stats();
        assert_eq!(stats.total_projects, 1);
        assert_eq!(stats.total_symbols, 50);
    }
}
