//! Event bus connecting the project registry to the global index.
//!
//! Delivery is synchronous in subscription order; handlers must defer heavy
//! work. A handler that returns an error is logged and removed from the bus.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use anyhow::{bail, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Indexing outcome carried by `ProjectEvent::Indexed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexStatus {
    Building,
    Completed,
    Error,
    Partial,
}

impl IndexStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Building => "building",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Partial => "partial",
        }
    }
}

/// Per-project indexing statistics attached to an `Indexed` event.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexStats {
    pub file_count: u64,
    pub symbol_count: u64,
    /// Language → file count histogram.
    #[serde(default)]
    pub languages: HashMap<String, u64>,
    pub size_mb: f64,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

/// Events flowing from the registry/indexer into the global index.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum ProjectEvent {
    Indexed {
        project_id: String,
        project_path: String,
        timestamp: i64,
        stats: IndexStats,
        status: IndexStatus,
        error_message: Option<String>,
        #[serde(default)]
        metadata: HashMap<String, Value>,
    },
    Updated {
        project_id: String,
        timestamp: i64,
        change_type: String,
        affected_files: Vec<String>,
    },
    Deleted {
        project_id: String,
        timestamp: i64,
    },
}

impl ProjectEvent {
    /// Build an `Indexed` event, enforcing that error status carries a message.
    pub fn indexed(
        project_id: impl Into<String>,
        project_path: impl Into<String>,
        stats: IndexStats,
        status: IndexStatus,
        error_message: Option<String>,
    ) -> Result<Self> {
        if status == IndexStatus::Error && error_message.is_none() {
            bail!("error_message required when status is 'error'");
        }
        Ok(Self::Indexed {
            project_id: project_id.into(),
            project_path: project_path.into(),
            timestamp: Utc::now().timestamp(),
            stats,
            status,
            error_message,
            metadata: HashMap::new(),
        })
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Indexed { .. } => "project_indexed",
            Self::Updated { .. } => "project_updated",
            Self::Deleted { .. } => "project_deleted",
        }
    }

    pub fn project_id(&self) -> &str {
        match self {
            Self::Indexed { project_id, .. }
            | Self::Updated { project_id, .. }
            | Self::Deleted { project_id, .. } => project_id,
        }
    }
}

/// Handler return value; `Err` removes the subscriber from the bus.
pub type HandlerResult = Result<()>;
type Handler = Box<dyn Fn(&ProjectEvent) -> HandlerResult + Send + Sync>;

/// Opaque token returned by `subscribe`; identifies the subscription for
/// `unsubscribe` independent of closure identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionToken(u64);

#[derive(Debug, Default, Clone, Serialize)]
pub struct EventBusStats {
    pub events_emitted: u64,
    pub events_delivered: u64,
    pub delivery_errors: u64,
    pub subscriber_count: usize,
}

struct Subscriber {
    token: SubscriptionToken,
    handler: Handler,
}

/// Thread-safe publish-subscribe bus keyed by event type.
///
/// All mutable state sits behind a single lock; `emit` holds it across the
/// fan-out, which keeps per-event-type delivery FIFO across subscribers.
pub struct EventBus {
    subscribers: Mutex<HashMap<String, Vec<Subscriber>>>,
    next_token: AtomicU64,
    events_emitted: AtomicU64,
    events_delivered: AtomicU64,
    delivery_errors: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
            events_emitted: AtomicU64::new(0),
            events_delivered: AtomicU64::new(0),
            delivery_errors: AtomicU64::new(0),
        }
    }

    /// Subscribe a handler to one event type. Returns a token for `unsubscribe`.
    pub fn subscribe<F>(&self, event_type: &str, handler: F) -> SubscriptionToken
    where
        F: Fn(&ProjectEvent) -> HandlerResult + Send + Sync + 'static,
    {
        let token = SubscriptionToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        let mut subs = self.subscribers.lock().unwrap();
        subs.entry(event_type.to_string()).or_default().push(Subscriber {
            token,
            handler: Box::new(handler),
        });
        token
    }

    /// Remove a subscription. Returns true if it existed.
    pub fn unsubscribe(&self, token: SubscriptionToken) -> bool {
        let mut subs = self.subscribers.lock().unwrap();
        let mut removed = false;
        for list in subs.values_mut() {
            let before = list.len();
            list.retain(|s| s.token != token);
            removed |= list.len() != before;
        }
        removed
    }

    /// Deliver an event synchronously to every subscriber of its type, in
    /// subscription order. Failing handlers are logged and dropped.
    pub fn emit(&self, event: &ProjectEvent) {
        self.events_emitted.fetch_add(1, Ordering::Relaxed);
        let mut subs = self.subscribers.lock().unwrap();
        let Some(list) = subs.get_mut(event.event_type()) else {
            return;
        };

        let mut failed: Vec<SubscriptionToken> = Vec::new();
        for sub in list.iter() {
            match (sub.handler)(event) {
                Ok(()) => {
                    self.events_delivered.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    self.delivery_errors.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        event_type = event.event_type(),
                        error = %e,
                        "event handler failed, removing subscriber"
                    );
                    failed.push(sub.token);
                }
            }
        }
        if !failed.is_empty() {
            list.retain(|s| !failed.contains(&s.token));
        }
    }

    pub fn stats(&self) -> EventBusStats {
        let subs = self.subscribers.lock().unwrap();
        EventBusStats {
            events_emitted: self.events_emitted.load(Ordering::Relaxed),
            events_delivered: self.events_delivered.load(Ordering::Relaxed),
            delivery_errors: self.delivery_errors.load(Ordering::Relaxed),
            subscriber_count: subs.values().map(Vec::len).sum(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn indexed_event(id: &str) -> ProjectEvent {
        ProjectEvent::indexed(id, format!("/tmp/{id}"), IndexStats::default(), IndexStatus::Completed, None)
            .unwrap()
    }

    #[test]
    fn delivers_in_subscription_order() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..3 {
            let order = order.clone();
            bus.subscribe("project_indexed", move |_| {
                order.lock().unwrap().push(i);
                Ok(())
            });
        }

        bus.emit(&indexed_event("p1"));
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
        assert_eq!(bus.stats().events_delivered, 3);
    }

    #[test]
    fn failing_handler_is_removed() {
        let bus = EventBus::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let c = calls.clone();
        bus.subscribe("project_indexed", move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("boom")
        });

        bus.emit(&indexed_event("p1"));
        bus.emit(&indexed_event("p2"));

        // Second emit never reaches the removed handler.
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(bus.stats().delivery_errors, 1);
        assert_eq!(bus.stats().subscriber_count, 0);
    }

    #[test]
    fn unsubscribe_by_token() {
        let bus = EventBus::new();
        let token = bus.subscribe("project_deleted", |_| Ok(()));
        assert!(bus.unsubscribe(token));
        assert!(!bus.unsubscribe(token));
        assert_eq!(bus.stats().subscriber_count, 0);
    }

    #[test]
    fn error_status_requires_message() {
        let res = ProjectEvent::indexed("p", "/p", IndexStats::default(), IndexStatus::Error, None);
        assert!(res.is_err());
    }
}
