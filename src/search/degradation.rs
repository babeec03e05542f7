//! Graceful degradation — capability detection and the static fallback
//! chain semantic → full-text → ripgrep → embedded grep.

use std::sync::Arc;

use serde::Serialize;

use crate::search::backend::{BackendKind, SearchBackend};

/// The preference order; earlier entries are better.
pub const FALLBACK_ORDER: [BackendKind; 4] = [
    BackendKind::Semantic,
    BackendKind::FullText,
    BackendKind::Ripgrep,
    BackendKind::GrepFallback,
];

#[derive(Debug, Clone, Serialize)]
pub struct DegradationReport {
    pub available: Vec<BackendKind>,
    pub unavailable: Vec<BackendKind>,
    pub degraded: bool,
}

pub struct FallbackChain;

impl FallbackChain {
    /// Partition a backend set by live availability.
    pub fn probe(backends: &[Arc<dyn SearchBackend>]) -> DegradationReport {
        let mut available = Vec::new();
        let mut unavailable = Vec::new();
        for b in backends {
            if b.is_available() {
                available.push(b.kind());
            } else {
                unavailable.push(b.kind());
            }
        }
        DegradationReport {
            degraded: !unavailable.is_empty(),
            available,
            unavailable,
        }
    }

    /// The backends to actually query: every available one, in chain order.
    /// Fusion quality degrades gracefully as members drop out.
    pub fn select<'a>(
        backends: &'a [Arc<dyn SearchBackend>],
    ) -> Vec<&'a Arc<dyn SearchBackend>> {
        let mut selected: Vec<&Arc<dyn SearchBackend>> = backends
            .iter()
            .filter(|b| b.is_available())
            .collect();
        selected.sort_by_key(|b| chain_position(b.kind()));
        selected
    }

    /// Best available successor for a preferred kind, walking the chain
    /// forward from it. `None` means fully degraded.
    pub fn successor(
        preferred: BackendKind,
        backends: &[Arc<dyn SearchBackend>],
    ) -> Option<BackendKind> {
        let start = chain_position(preferred);
        FALLBACK_ORDER[start..]
            .iter()
            .find(|kind| {
                backends
                    .iter()
                    .any(|b| b.kind() == **kind && b.is_available())
            })
            .copied()
    }
}

fn chain_position(kind: BackendKind) -> usize {
    FALLBACK_ORDER
        .iter()
        .position(|k| *k == kind)
        .unwrap_or(FALLBACK_ORDER.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::global::monitoring::HealthStatus;
    use crate::search::backend::{Capability, SearchHit, SearchRequest};
    use async_trait::async_trait;

    struct Stub {
        kind: BackendKind,
        up: bool,
    }

    #[async_trait]
    impl SearchBackend for Stub {
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
            Ok(vec![])
        }
    }

    fn stub(kind: BackendKind, up: bool) -> Arc<dyn SearchBackend> {
        Arc::new(Stub { kind, up })
    }

    #[test]
    fn selects_available_in_chain_order() {
        let backends = vec![
            stub(BackendKind::Ripgrep, true),
            stub(BackendKind::Semantic, false),
            stub(BackendKind::FullText, true),
        ];
        let selected = FallbackChain::select(&backends);
        let kinds: Vec<BackendKind> = selected.iter().map(|b| b.kind()).collect();
        assert_eq!(kinds, vec![BackendKind::FullText, BackendKind::Ripgrep]);
    }

    #[test]
    fn successor_walks_past_unavailable() {
        let backends = vec![
            stub(BackendKind::Semantic, false),
            stub(BackendKind::FullText, false),
            stub(BackendKind::GrepFallback, true),
        ];
        assert_eq!(
            FallbackChain::successor(BackendKind::Semantic, &backends),
            Some(BackendKind::GrepFallback)
        );
    }

    #[test]
    fn no_backend_means_fully_degraded() {
        let backends = vec![stub(BackendKind::Semantic, false)];
        assert_eq!(FallbackChain::successor(BackendKind::Semantic, &backends), None);
        let report = FallbackChain::probe(&backends);
        assert!(report.degraded);
        assert!(report.available.is_empty());
    }
}
