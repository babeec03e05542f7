//! Query router — maps query kinds to the tier that should serve them.
//!
//! The router only classifies; dispatch happens in the service facade. This
//! keeps routing decisions testable without live backends.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde::Serialize;
use serde_json::Value;

use crate::cache::tier2::ALL_PROJECTS;
use crate::error::{GlobalIndexError, Result};

/// Query kinds the service understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryKind {
    Dashboard,
    GlobalStats,
    ListProjects,
    ProjectMetadata,
    ProjectHealth,
    ProjectSearch,
    CrossProjectSearch,
    CrossProjectDependencies,
    AggregateExports,
    FindPattern,
    Federated,
}

impl QueryKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "dashboard" => Some(Self::Dashboard),
            "global_stats" => Some(Self::GlobalStats),
            "list_projects" => Some(Self::ListProjects),
            "project_metadata" => Some(Self::ProjectMetadata),
            "project_health" => Some(Self::ProjectHealth),
            "project_search" => Some(Self::ProjectSearch),
            "cross_project_search" => Some(Self::CrossProjectSearch),
            "cross_project_dependencies" => Some(Self::CrossProjectDependencies),
            "aggregate_exports" => Some(Self::AggregateExports),
            "find_pattern" => Some(Self::FindPattern),
            "federated" => Some(Self::Federated),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dashboard => "dashboard",
            Self::GlobalStats => "global_stats",
            Self::ListProjects => "list_projects",
            Self::ProjectMetadata => "project_metadata",
            Self::ProjectHealth => "project_health",
            Self::ProjectSearch => "project_search",
            Self::CrossProjectSearch => "cross_project_search",
            Self::CrossProjectDependencies => "cross_project_dependencies",
            Self::AggregateExports => "aggregate_exports",
            Self::FindPattern => "find_pattern",
            Self::Federated => "federated",
        }
    }
}

/// Where a query goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Served from Tier 1 metadata in O(1).
    Tier1,
    /// Sent straight to one project's backend, uncached.
    DirectProject(String),
    /// Served through the Tier 2 cache with the given involved set.
    Tier2 { involved_projects: Vec<String> },
    /// Direct federation, no caching.
    Federation,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct RouterStats {
    pub by_route: HashMap<String, u64>,
    pub routing_errors: u64,
}

pub struct QueryRouter {
    tier1_routed: AtomicU64,
    direct_routed: AtomicU64,
    tier2_routed: AtomicU64,
    federated_routed: AtomicU64,
    routing_errors: AtomicU64,
    by_kind: Mutex<HashMap<QueryKind, u64>>,
}

impl QueryRouter {
    pub fn new() -> Self {
        Self {
            tier1_routed: AtomicU64::new(0),
            direct_routed: AtomicU64::new(0),
            tier2_routed: AtomicU64::new(0),
            federated_routed: AtomicU64::new(0),
            routing_errors: AtomicU64::new(0),
            by_kind: Mutex::new(HashMap::new()),
        }
    }

    /// Classify a query into a route. `params` may carry `project_id`,
    /// `project_ids`, and a `cross_project` override.
    pub fn route(&self, kind: QueryKind, params: &Value) -> Result<Route> {
        *self.by_kind.lock().unwrap().entry(kind).or_insert(0) += 1;

        let cross_project = params
            .get("cross_project")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let route = match kind {
            QueryKind::Dashboard
            | QueryKind::GlobalStats
            | QueryKind::ListProjects
            | QueryKind::ProjectMetadata
            | QueryKind::ProjectHealth => Route::Tier1,

            QueryKind::ProjectSearch => {
                let project_id = params.get("project_id").and_then(Value::as_str);
                match project_id {
                    Some(id) if !cross_project => Route::DirectProject(id.to_string()),
                    Some(_) => Route::Tier2 {
                        involved_projects: involved_from(params),
                    },
                    None => {
                        self.routing_errors.fetch_add(1, Ordering::Relaxed);
                        return Err(GlobalIndexError::Routing(
                            "project_search requires project_id".into(),
                        ));
                    }
                }
            }

            QueryKind::CrossProjectSearch
            | QueryKind::CrossProjectDependencies
            | QueryKind::AggregateExports
            | QueryKind::FindPattern => Route::Tier2 {
                involved_projects: involved_from(params),
            },

            QueryKind::Federated => Route::Federation,
        };

        match &route {
            Route::Tier1 => self.tier1_routed.fetch_add(1, Ordering::Relaxed),
            Route::DirectProject(_) => self.direct_routed.fetch_add(1, Ordering::Relaxed),
            Route::Tier2 { .. } => self.tier2_routed.fetch_add(1, Ordering::Relaxed),
            Route::Federation => self.federated_routed.fetch_add(1, Ordering::Relaxed),
        };
        Ok(route)
    }

    /// Classify from a raw kind string; unknown kinds are routing errors.
    pub fn route_str(&self, kind: &str, params: &Value) -> Result<Route> {
        let Some(kind) = QueryKind::parse(kind) else {
            self.routing_errors.fetch_add(1, Ordering::Relaxed);
            return Err(GlobalIndexError::Routing(format!("unknown query kind: {kind}")));
        };
        self.route(kind, params)
    }

    pub fn stats(&self) -> RouterStats {
        let mut by_route = HashMap::new();
        by_route.insert("tier1".into(), self.tier1_routed.load(Ordering::Relaxed));
        by_route.insert("direct".into(), self.direct_routed.load(Ordering::Relaxed));
        by_route.insert("tier2".into(), self.tier2_routed.load(Ordering::Relaxed));
        by_route.insert(
            "federation".into(),
            self.federated_routed.load(Ordering::Relaxed),
        );
        RouterStats {
            by_route,
            routing_errors: self.routing_errors.load(Ordering::Relaxed),
        }
    }
}

impl Default for QueryRouter {
    fn default() -> Self {
        Self::new()
    }
}

/// The involved set for a Tier 2 route: explicit ids, or the `"all"`
/// sentinel when the query spans every registered project.
fn involved_from(params: &Value) -> Vec<String> {
    match params.get("project_ids").and_then(Value::as_array) {
        Some(ids) if !ids.is_empty() => {
            let mut v: Vec<String> = ids
                .iter()
                .filter_map(Value::as_str)
                .map(String::from)
                .collect();
            v.sort();
            v.dedup();
            v
        }
        _ => vec![ALL_PROJECTS.to_string()],
    }
}
