//! Unified error type for the leindex service — categorized errors with
//! stable `error_type` tags and component attribution for clients.

use serde_json::{json, Value};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GlobalIndexError {
    #[error("Config validation failed: {0}")]
    ConfigValidation(String),

    #[error("Project not found: {0}")]
    ProjectNotFound(String),

    #[error("Invalid search pattern: {0}")]
    InvalidPattern(String),

    #[error("All {failed} projects failed")]
    AllProjectsFailed { failed: usize, diagnostics: Value },

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Routing error: {0}")]
    Routing(String),

    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Index migration failed: {0}")]
    Migration(String),

    #[error("Orphan purge failed for {path}: {reason}")]
    OrphanPurge { path: String, reason: String },

    #[error("Registry error: {0}")]
    Registry(#[from] sqlx::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("{0}")]
    Internal(#[from] anyhow::Error),
}

impl GlobalIndexError {
    /// Stable machine-readable tag surfaced to clients.
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::ConfigValidation(_) => "config_validation_error",
            Self::ProjectNotFound(_) => "project_not_found",
            Self::InvalidPattern(_) => "invalid_pattern",
            Self::AllProjectsFailed { .. } => "all_projects_failed",
            Self::Cache(_) => "cache_error",
            Self::Routing(_) => "routing_error",
            Self::BackendUnavailable(_) => "backend_unavailable",
            Self::Migration(_) => "migration_error",
            Self::OrphanPurge { .. } => "orphan_purge_error",
            Self::Registry(_) => "registry_error",
            Self::Io(_) => "io_error",
            Self::Timeout(_) => "timeout",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Which component raised this error.
    pub fn component(&self) -> &'static str {
        match self {
            Self::ConfigValidation(_) => "config_manager",
            Self::ProjectNotFound(_) | Self::InvalidPattern(_) | Self::AllProjectsFailed { .. } => {
                "cross_project_search"
            }
            Self::Cache(_) => "tier2_cache",
            Self::Routing(_) => "query_router",
            Self::BackendUnavailable(_) => "backend_adapter",
            Self::Migration(_) => "index_serializer",
            Self::OrphanPurge { .. } => "orphan_detector",
            Self::Registry(_) => "project_registry",
            Self::Io(_) | Self::Timeout(_) | Self::Internal(_) => "global_index",
        }
    }

    /// Transient errors may be retried; permanent ones are surfaced as-is.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Timeout(_) | Self::Registry(_))
    }

    /// Structured payload for the service surface.
    pub fn to_payload(&self) -> Value {
        let mut details = json!({});
        if let Self::AllProjectsFailed { diagnostics, .. } = self {
            details = diagnostics.clone();
        }
        json!({
            "status": "error",
            "error_type": self.error_type(),
            "component": self.component(),
            "message": self.to_string(),
            "transient": self.is_transient(),
            "details": details,
        })
    }
}

pub type Result<T> = std::result::Result<T, GlobalIndexError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_type_tags_are_stable() {
        let e = GlobalIndexError::ProjectNotFound("p1".into());
        assert_eq!(e.error_type(), "project_not_found");
        assert_eq!(e.component(), "cross_project_search");
        assert!(!e.is_transient());

        let e = GlobalIndexError::Cache("bad params".into());
        assert_eq!(e.error_type(), "cache_error");
        assert_eq!(e.component(), "tier2_cache");
    }

    #[test]
    fn payload_carries_diagnostics() {
        let e = GlobalIndexError::AllProjectsFailed {
            failed: 2,
            diagnostics: json!({"a": "timeout", "b": "backend down"}),
        };
        let p = e.to_payload();
        assert_eq!(p["error_type"], "all_projects_failed");
        assert_eq!(p["details"]["a"], "timeout");
    }
}
