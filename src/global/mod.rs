//! Global index: always-fresh Tier 1 metadata, query routing, and
//! service monitoring.

pub mod monitoring;
pub mod router;
pub mod tier1;

pub use monitoring::{HealthStatus, MetricsRegistry, OpsLog};
pub use router::{QueryKind, QueryRouter, Route};
pub use tier1::{DashboardData, GlobalStats, ProjectFilters, ProjectMetadata, Tier1MetadataStore};
