//! The uniform search contract implemented by every backend adapter.
//!
//! Adapters are described by their capability set, not by inheritance; the
//! merger and router never branch on a concrete adapter type.

use anyhow::bail;
use async_trait::async_trait;
use serde::Serialize;

use crate::global::monitoring::HealthStatus;

/// Concrete backend families, ordered by preference in the fallback chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Semantic,
    FullText,
    Ripgrep,
    GrepFallback,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Semantic => "semantic",
            Self::FullText => "full_text",
            Self::Ripgrep => "ripgrep",
            Self::GrepFallback => "grep_fallback",
        }
    }

    /// Default fusion weight for the weighted merge strategy. The two regex
    /// variants share the regex weight.
    pub fn default_weight(&self) -> f64 {
        match self {
            Self::Semantic => 0.5,
            Self::FullText => 0.3,
            Self::Ripgrep | Self::GrepFallback => 0.2,
        }
    }
}

/// Operations a backend may support.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    HealthCheck,
    ListFiles,
    UploadFile,
    DeleteFile,
    Search,
    AskRag,
}

/// One search request as seen by a backend adapter.
#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub query: String,
    pub case_sensitive: bool,
    pub fuzzy: bool,
    /// Glob applied to file paths.
    pub file_pattern: Option<String>,
    pub context_lines: u32,
    pub max_results: usize,
}

impl SearchRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            case_sensitive: false,
            fuzzy: false,
            file_pattern: None,
            context_lines: 0,
            max_results: 20,
        }
    }
}

/// One raw hit from a single backend, before fusion.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub file_path: String,
    pub start_line: Option<u32>,
    pub end_line: Option<u32>,
    pub content: String,
    /// Backend-native score; scales differ per backend.
    pub score: f64,
    pub symbol: Option<String>,
}

/// Polymorphic adapter over a search engine.
#[async_trait]
pub trait SearchBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn capabilities(&self) -> &'static [Capability];

    /// Cheap availability probe; consulted by the fallback chain before
    /// every federated query.
    fn is_available(&self) -> bool;

    async fn health_check(&self) -> HealthStatus;

    async fn search(&self, request: &SearchRequest) -> anyhow::Result<Vec<SearchHit>>;

    /// Optional capabilities default to unsupported.
    async fn list_files(&self) -> anyhow::Result<Vec<String>> {
        bail!("{} does not support list_files", self.kind().as_str())
    }

    async fn upload_file(&self, _path: &str, _content: &str) -> anyhow::Result<()> {
        bail!("{} does not support upload_file", self.kind().as_str())
    }

    async fn delete_file(&self, _path: &str) -> anyhow::Result<()> {
        bail!("{} does not support delete_file", self.kind().as_str())
    }

    async fn ask_rag(&self, _question: &str) -> anyhow::Result<String> {
        bail!("{} does not support ask_rag", self.kind().as_str())
    }
}
