//! Federated search: backend adapters, result fusion, graceful degradation,
//! and cross-project fan-out.

pub mod backend;
pub mod circuit;
pub mod cross_project;
pub mod degradation;
pub mod fulltext;
pub mod merger;
pub mod regexsearch;
pub mod security;
pub mod semantic;

pub use backend::{BackendKind, Capability, SearchBackend, SearchHit, SearchRequest};
pub use cross_project::{
    CrossProjectParams, CrossProjectSearchResult, CrossProjectSearcher, ProjectSearchResult,
    ProjectSearchStatus,
};
pub use degradation::FallbackChain;
pub use merger::{MergeStrategy, MergedResult, ResultMerger};
