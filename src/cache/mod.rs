//! Caching layer: size-budgeted LRU tracker and the stale-allowed Tier 2
//! query cache built on top of it.

pub mod keys;
pub mod lru;
pub mod tier2;

pub use keys::{derive_cache_key, normalize_params, NormalizedParams};
pub use lru::LruTracker;
pub use tier2::{CacheMetadata, CacheSource, ComputeFn, QueryOutcome, Tier2QueryCache, Tier2Stats};
