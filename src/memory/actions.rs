//! Priority queue of memory-relief actions.
//!
//! Actions are idempotent; a failing action is logged and the drain
//! continues with the rest of the queue.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::Mutex;
use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Closed set of relief actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryActionKind {
    /// Nominal "ask the runtime to release freeable memory"; reports zero
    /// bytes freed here since Rust has no on-demand collector.
    GarbageCollect,
    ClearQueryCache,
    UnloadFiles,
    UnloadProjects,
    EmergencyEvict,
}

impl MemoryActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GarbageCollect => "garbage_collect",
            Self::ClearQueryCache => "clear_query_cache",
            Self::UnloadFiles => "unload_files",
            Self::UnloadProjects => "unload_projects",
            Self::EmergencyEvict => "emergency_evict",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "garbage_collect" => Some(Self::GarbageCollect),
            "clear_query_cache" => Some(Self::ClearQueryCache),
            "unload_files" => Some(Self::UnloadFiles),
            "unload_projects" => Some(Self::UnloadProjects),
            "emergency_evict" => Some(Self::EmergencyEvict),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MemoryAction {
    pub kind: MemoryActionKind,
    /// Higher executes first.
    pub priority: i32,
    /// Optional target project ids.
    pub payload: Option<Vec<String>>,
    pub estimated_mb: f64,
}

impl PartialEq for MemoryAction {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.kind == other.kind
    }
}
impl Eq for MemoryAction {}

impl PartialOrd for MemoryAction {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}
impl Ord for MemoryAction {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.priority.cmp(&other.priority)
    }
}

/// Outcome of one executed action.
#[derive(Debug, Clone, Serialize)]
pub struct ActionResult {
    pub kind: MemoryActionKind,
    pub success: bool,
    pub freed_mb: f64,
    pub duration_ms: u64,
    pub message: String,
}

/// What the queue runs actions against; implemented by the service facade.
pub trait ActionExecutor: Send + Sync {
    /// Execute one action and report bytes actually freed (MB).
    fn execute(&self, action: &MemoryAction) -> anyhow::Result<f64>;
}

/// Max-heap of pending actions, drained in priority order.
pub struct ActionQueue {
    heap: Mutex<BinaryHeap<MemoryAction>>,
}

impl ActionQueue {
    pub fn new() -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
        }
    }

    pub fn enqueue(&self, action: MemoryAction) {
        self.heap.lock().unwrap().push(action);
    }

    pub fn len(&self) -> usize {
        self.heap.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.lock().unwrap().is_empty()
    }

    /// Drain the queue in priority order, returning one result per action.
    pub fn execute_all(&self, executor: &dyn ActionExecutor) -> Vec<ActionResult> {
        let mut results = Vec::new();
        loop {
            let Some(action) = self.heap.lock().unwrap().pop() else {
                break;
            };
            let start = Instant::now();
            let result = match executor.execute(&action) {
                Ok(freed_mb) => ActionResult {
                    kind: action.kind,
                    success: true,
                    freed_mb,
                    duration_ms: start.elapsed().as_millis() as u64,
                    message: format!("{} freed {:.1}MB", action.kind.as_str(), freed_mb),
                },
                Err(e) => {
                    tracing::warn!(kind = action.kind.as_str(), error = %e, "memory action failed");
                    ActionResult {
                        kind: action.kind,
                        success: false,
                        freed_mb: 0.0,
                        duration_ms: start.elapsed().as_millis() as u64,
                        message: e.to_string(),
                    }
                }
            };
            results.push(result);
        }
        results
    }
}

impl Default for ActionQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct RecordingExecutor {
        order: Mutex<Vec<MemoryActionKind>>,
        failures: AtomicUsize,
    }

    impl ActionExecutor for RecordingExecutor {
        fn execute(&self, action: &MemoryAction) -> anyhow::Result<f64> {
            self.order.lock().unwrap().push(action.kind);
            if action.kind == MemoryActionKind::UnloadFiles {
                self.failures.fetch_add(1, Ordering::SeqCst);
                anyhow::bail!("cannot unload");
            }
            Ok(action.estimated_mb)
        }
    }

    fn action(kind: MemoryActionKind, priority: i32) -> MemoryAction {
        MemoryAction {
            kind,
            priority,
            payload: None,
            estimated_mb: 10.0,
        }
    }

    #[test]
    fn drains_in_priority_order_and_survives_failures() {
        let q = ActionQueue::new();
        q.enqueue(action(MemoryActionKind::GarbageCollect, 1));
        q.enqueue(action(MemoryActionKind::EmergencyEvict, 10));
        q.enqueue(action(MemoryActionKind::UnloadFiles, 5));

        let exec = RecordingExecutor {
            order: Mutex::new(Vec::new()),
            failures: AtomicUsize::new(0),
        };
        let results = q.execute_all(&exec);

        assert_eq!(
            *exec.order.lock().unwrap(),
            vec![
                MemoryActionKind::EmergencyEvict,
                MemoryActionKind::UnloadFiles,
                MemoryActionKind::GarbageCollect,
            ]
        );
        // The failing action did not abort the drain.
        assert_eq!(results.len(), 3);
        assert!(!results[1].success);
        assert!(results[2].success);
        assert!(q.is_empty());
    }

    #[test]
    fn kind_round_trips_through_names() {
        for kind in [
            MemoryActionKind::GarbageCollect,
            MemoryActionKind::ClearQueryCache,
            MemoryActionKind::UnloadFiles,
            MemoryActionKind::UnloadProjects,
            MemoryActionKind::EmergencyEvict,
        ] {
            assert_eq!(MemoryActionKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(MemoryActionKind::parse("defragment"), None);
    }
}
