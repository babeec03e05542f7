//! Cross-project search — validated fan-out across per-project backends.
//!
//! A project that fails or times out is recorded and skipped; only a total
//! wipe-out raises. This function body is also the `compute_fn` handed to
//! the Tier 2 cache for cacheable cross-project queries.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use serde::Serialize;
use serde_json::json;

use crate::error::{GlobalIndexError, Result};
use crate::search::backend::{SearchBackend, SearchRequest};
use crate::search::circuit::CircuitBreaker;
use crate::search::degradation::FallbackChain;
use crate::search::merger::{MergedResult, ResultMerger};
use crate::search::security::validate_pattern;

const DEFAULT_PROJECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Parameters of one cross-project search.
#[derive(Debug, Clone)]
pub struct CrossProjectParams {
    pub pattern: String,
    /// `None` means every registered project.
    pub project_ids: Option<Vec<String>>,
    pub fuzzy: bool,
    pub case_sensitive: bool,
    pub file_pattern: Option<String>,
    pub context_lines: u32,
    pub max_results_per_project: usize,
}

impl CrossProjectParams {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            project_ids: None,
            fuzzy: false,
            case_sensitive: false,
            file_pattern: None,
            context_lines: 0,
            max_results_per_project: 20,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectSearchStatus {
    Ok,
    Error,
    Timeout,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProjectSearchResult {
    pub project_id: String,
    pub status: ProjectSearchStatus,
    pub matches: usize,
    pub results: Vec<MergedResult>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CrossProjectSearchResult {
    pub project_results: Vec<ProjectSearchResult>,
    pub total_results: usize,
    pub successful_projects: usize,
    pub failed_projects: usize,
}

/// Supplies the per-project backend sets; implemented by the service facade.
#[async_trait]
pub trait ProjectBackendProvider: Send + Sync {
    fn known_project_ids(&self) -> Vec<String>;

    async fn backends_for(&self, project_id: &str) -> anyhow::Result<Vec<Arc<dyn SearchBackend>>>;
}

pub struct CrossProjectSearcher {
    provider: Arc<dyn ProjectBackendProvider>,
    merger: ResultMerger,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
    per_project_timeout: Duration,
}

impl CrossProjectSearcher {
    pub fn new(provider: Arc<dyn ProjectBackendProvider>) -> Self {
        Self {
            provider,
            merger: ResultMerger::rrf(),
            breakers: Mutex::new(HashMap::new()),
            per_project_timeout: DEFAULT_PROJECT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.per_project_timeout = timeout;
        self
    }

    fn breaker_for(&self, project_id: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .lock()
            .unwrap()
            .entry(project_id.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::for_project()))
            .clone()
    }

    /// Resolve the target ids: explicit ids must all be known; omitted ids
    /// expand to every registered project.
    fn resolve_targets(&self, params: &CrossProjectParams) -> Result<Vec<String>> {
        let known = self.provider.known_project_ids();
        match &params.project_ids {
            Some(ids) => {
                for id in ids {
                    if !known.contains(id) {
                        return Err(GlobalIndexError::ProjectNotFound(id.clone()));
                    }
                }
                let mut ids = ids.clone();
                ids.sort();
                ids.dedup();
                Ok(ids)
            }
            None => {
                let mut ids = known;
                ids.sort();
                Ok(ids)
            }
        }
    }

    pub async fn search(&self, params: &CrossProjectParams) -> Result<CrossProjectSearchResult> {
        validate_pattern(&params.pattern)?;
        let targets = self.resolve_targets(params)?;

        let request = SearchRequest {
            query: params.pattern.clone(),
            case_sensitive: params.case_sensitive,
            fuzzy: params.fuzzy,
            file_pattern: params.file_pattern.clone(),
            context_lines: params.context_lines,
            max_results: params.max_results_per_project,
        };

        let tasks = targets.iter().map(|project_id| {
            let project_id = project_id.clone();
            let request = request.clone();
            let breaker = self.breaker_for(&project_id);
            async move {
                if !breaker.allow() {
                    return ProjectSearchResult {
                        project_id,
                        status: ProjectSearchStatus::Error,
                        matches: 0,
                        results: vec![],
                        error: Some("circuit breaker open".into()),
                    };
                }
                let outcome = tokio::time::timeout(
                    self.per_project_timeout,
                    self.search_one(&project_id, &request),
                )
                .await;
                match outcome {
                    Ok(Ok(results)) => {
                        breaker.on_success();
                        ProjectSearchResult {
                            project_id,
                            status: ProjectSearchStatus::Ok,
                            matches: results.len(),
                            results,
                            error: None,
                        }
                    }
                    Ok(Err(e)) => {
                        breaker.on_failure();
                        tracing::warn!(project_id = %project_id, error = %e, "project search failed");
                        ProjectSearchResult {
                            project_id,
                            status: ProjectSearchStatus::Error,
                            matches: 0,
                            results: vec![],
                            error: Some(e.to_string()),
                        }
                    }
                    Err(_) => {
                        breaker.on_failure();
                        tracing::warn!(project_id = %project_id, "project search timed out");
                        ProjectSearchResult {
                            project_id,
                            status: ProjectSearchStatus::Timeout,
                            matches: 0,
                            results: vec![],
                            error: Some(format!(
                                "timed out after {:?}",
                                self.per_project_timeout
                            )),
                        }
                    }
                }
            }
        });

        let project_results: Vec<ProjectSearchResult> = join_all(tasks).await;

        let successful = project_results
            .iter()
            .filter(|r| r.status == ProjectSearchStatus::Ok)
            .count();
        let failed = project_results.len() - successful;

        if successful == 0 && !project_results.is_empty() {
            let diagnostics: serde_json::Map<String, serde_json::Value> = project_results
                .iter()
                .map(|r| {
                    (
                        r.project_id.clone(),
                        json!(r.error.clone().unwrap_or_default()),
                    )
                })
                .collect();
            return Err(GlobalIndexError::AllProjectsFailed {
                failed,
                diagnostics: serde_json::Value::Object(diagnostics),
            });
        }

        let total_results = project_results.iter().map(|r| r.matches).sum();
        Ok(CrossProjectSearchResult {
            total_results,
            successful_projects: successful,
            failed_projects: failed,
            project_results,
        })
    }

    /// One project's merged search over its available backends.
    async fn search_one(
        &self,
        project_id: &str,
        request: &SearchRequest,
    ) -> anyhow::Result<Vec<MergedResult>> {
        let backends = self.provider.backends_for(project_id).await?;
        let selected = FallbackChain::select(&backends);
        if selected.is_empty() {
            anyhow::bail!("degraded: no backend available");
        }

        let mut per_backend = Vec::new();
        let mut errors = Vec::new();
        for backend in &selected {
            match backend.search(request).await {
                Ok(hits) => per_backend.push((backend.kind(), hits)),
                Err(e) => {
                    tracing::debug!(
                        backend = backend.kind().as_str(),
                        error = %e,
                        "backend search failed, degrading"
                    );
                    errors.push(format!("{}: {e}", backend.kind().as_str()));
                }
            }
        }
        if per_backend.is_empty() {
            anyhow::bail!("all backends failed: {}", errors.join("; "));
        }
        Ok(self.merger.merge(per_backend, request.max_results))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::global::monitoring::HealthStatus;
    use crate::search::backend::{BackendKind, Capability, SearchHit};

    struct StubBackend {
        kind: BackendKind,
        up: bool,
        fail: bool,
        delay: Option<Duration>,
        hits: Vec<SearchHit>,
    }

    #[async_trait]
    impl SearchBackend for StubBackend {
        fn kind(&self) -> BackendKind {
            self.kind
        }
        fn capabilities(&self) -> &'static [Capability] {
            &[Capability::Search]
        }
        fn is_available(&self) -> bool {
            self.up
        }
        async fn health_check(&self) -> HealthStatus {
            HealthStatus::healthy("stub")
        }
        async fn search(&self, _request: &SearchRequest) -> anyhow::Result<Vec<SearchHit>> {
            if let Some(d) = self.delay {
                tokio::time::sleep(d).await;
            }
            if self.fail {
                anyhow::bail!("stub backend down");
            }
            Ok(self.hits.clone())
        }
    }

    struct StubProvider {
        projects: HashMap<String, Vec<Arc<dyn SearchBackend>>>,
    }

    #[async_trait]
    impl ProjectBackendProvider for StubProvider {
        fn known_project_ids(&self) -> Vec<String> {
            self.projects.keys().cloned().collect()
        }
        async fn backends_for(
            &self,
            project_id: &str,
        ) -> anyhow::Result<Vec<Arc<dyn SearchBackend>>> {
            Ok(self.projects.get(project_id).cloned().unwrap_or_default())
        }
    }

    fn hit(path: &str) -> SearchHit {
        SearchHit {
            file_path: path.into(),
            start_line: Some(1),
            end_line: Some(1),
            content: "x".into(),
            score: 1.0,
            symbol: None,
        }
    }

    fn working(kind: BackendKind, hits: Vec<SearchHit>) -> Arc<dyn SearchBackend> {
        Arc::new(StubBackend { kind, up: true, fail: false, delay: None, hits })
    }

    fn unavailable(kind: BackendKind) -> Arc<dyn SearchBackend> {
        Arc::new(StubBackend { kind, up: false, fail: false, delay: None, hits: vec![] })
    }

    fn provider(projects: Vec<(&str, Vec<Arc<dyn SearchBackend>>)>) -> Arc<StubProvider> {
        Arc::new(StubProvider {
            projects: projects
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        })
    }

    #[tokio::test]
    async fn partial_failure_is_tolerated() {
        let p = provider(vec![
            ("a", vec![working(BackendKind::FullText, vec![hit("a1.rs")])]),
            ("b", vec![working(BackendKind::FullText, vec![hit("b1.rs"), hit("b2.rs")])]),
            ("c", vec![unavailable(BackendKind::FullText)]),
        ]);
        let searcher = CrossProjectSearcher::new(p);
        let result = searcher
            .search(&CrossProjectParams::new("needle"))
            .await
            .unwrap();

        assert_eq!(result.successful_projects, 2);
        assert_eq!(result.failed_projects, 1);
        assert_eq!(result.total_results, 3);
        let c = result
            .project_results
            .iter()
            .find(|r| r.project_id == "c")
            .unwrap();
        assert_eq!(c.status, ProjectSearchStatus::Error);
    }

    #[tokio::test]
    async fn unknown_project_id_raises() {
        let p = provider(vec![("a", vec![])]);
        let searcher = CrossProjectSearcher::new(p);
        let mut params = CrossProjectParams::new("needle");
        params.project_ids = Some(vec!["ghost".into()]);
        let err = searcher.search(&params).await.unwrap_err();
        assert_eq!(err.error_type(), "project_not_found");
    }

    #[tokio::test]
    async fn invalid_pattern_rejected_before_fanout() {
        let p = provider(vec![("a", vec![])]);
        let searcher = CrossProjectSearcher::new(p);
        let err = searcher
            .search(&CrossProjectParams::new("../../../etc"))
            .await
            .unwrap_err();
        assert_eq!(err.error_type(), "invalid_pattern");
    }

    #[tokio::test]
    async fn all_failed_raises_with_diagnostics() {
        let p = provider(vec![
            ("a", vec![unavailable(BackendKind::FullText)]),
            ("b", vec![unavailable(BackendKind::Semantic)]),
        ]);
        let searcher = CrossProjectSearcher::new(p);
        let err = searcher
            .search(&CrossProjectParams::new("needle"))
            .await
            .unwrap_err();
        match err {
            GlobalIndexError::AllProjectsFailed { failed, diagnostics } => {
                assert_eq!(failed, 2);
                assert!(diagnostics.get("a").is_some());
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn slow_project_times_out() {
        let slow: Arc<dyn SearchBackend> = Arc::new(StubBackend {
            kind: BackendKind::FullText,
            up: true,
            fail: false,
            delay: Some(Duration::from_secs(300)),
            hits: vec![hit("slow.rs")],
        });
        let p = provider(vec![
            ("fast", vec![working(BackendKind::FullText, vec![hit("f.rs")])]),
            ("slow", vec![slow]),
        ]);
        let searcher =
            CrossProjectSearcher::new(p).with_timeout(Duration::from_millis(100));
        let result = searcher
            .search(&CrossProjectParams::new("needle"))
            .await
            .unwrap();
        let slow = result
            .project_results
            .iter()
            .find(|r| r.project_id == "slow")
            .unwrap();
        assert_eq!(slow.status, ProjectSearchStatus::Timeout);
        assert_eq!(result.successful_projects, 1);
    }

    #[tokio::test]
    async fn circuit_breaker_short_circuits_failing_project() {
        let failing: Vec<Arc<dyn SearchBackend>> = vec![Arc::new(StubBackend {
            kind: BackendKind::FullText,
            up: true,
            fail: true,
            delay: None,
            hits: vec![],
        })];
        let p = provider(vec![
            ("ok", vec![working(BackendKind::FullText, vec![hit("x.rs")])]),
            ("bad", failing),
        ]);
        let searcher = CrossProjectSearcher::new(p);
        let params = CrossProjectParams::new("needle");

        // Three real failures trip the breaker.
        for _ in 0..3 {
            searcher.search(&params).await.unwrap();
        }
        let result = searcher.search(&params).await.unwrap();
        let bad = result
            .project_results
            .iter()
            .find(|r| r.project_id == "bad")
            .unwrap();
        assert_eq!(bad.error.as_deref(), Some("circuit breaker open"));
    }
}
