//! Memory management core: RSS tracking, threshold detection, relief
//! actions, and priority-scored eviction.

pub mod actions;
pub mod eviction;
pub mod thresholds;
pub mod tracker;

pub use actions::{ActionQueue, ActionResult, MemoryAction, MemoryActionKind};
pub use eviction::{EvictionCandidate, EvictionEngine, EvictionResult};
pub use thresholds::{MemoryLevel, ThresholdStateMachine, ThresholdWarning};
pub use tracker::{MemoryBreakdown, MemorySnapshot, MemoryTracker};
