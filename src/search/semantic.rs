//! Semantic backend: fastembed embeddings over a flat cosine index.
//!
//! The embedding pool keeps N model instances behind a semaphore so
//! CPU-bound embedding never oversubscribes; queries run on the blocking
//! pool. The vector index is the payload's flat embedding matrix.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use anyhow::Context;
use async_trait::async_trait;
use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use serde_json::json;
use tokio::sync::Semaphore;

use crate::global::monitoring::{HealthStatus, MetricsRegistry};
use crate::registry::serializer::{ChunkMeta, IndexPayload};
use crate::search::backend::{BackendKind, Capability, SearchBackend, SearchHit, SearchRequest};

/// Single embedder instance; the model is not Sync, so calls serialize
/// through a mutex.
struct Embedder {
    model: Mutex<TextEmbedding>,
}

impl Embedder {
    fn new(cache_dir: &PathBuf) -> anyhow::Result<Self> {
        std::fs::create_dir_all(cache_dir).ok();
        let model = TextEmbedding::try_new(
            InitOptions::new(EmbeddingModel::AllMiniLML6V2)
                .with_cache_dir(cache_dir.clone())
                .with_show_download_progress(false),
        )
        .context("failed to initialize embedding model")?;
        Ok(Self {
            model: Mutex::new(model),
        })
    }

    fn embed(&self, texts: Vec<String>, batch_size: Option<usize>) -> anyhow::Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let mut model = self.model.lock().unwrap();
        model.embed(texts, batch_size)
    }
}

/// Pool of embedder instances shared across all loaded projects.
pub struct EmbedderPool {
    instances: Vec<Arc<Embedder>>,
    semaphore: Arc<Semaphore>,
    next: AtomicUsize,
    dimension: usize,
}

impl EmbedderPool {
    pub fn new(pool_size: usize, cache_dir: PathBuf) -> anyhow::Result<Self> {
        let pool_size = pool_size.max(1);
        let mut instances = Vec::with_capacity(pool_size);
        for _ in 0..pool_size {
            instances.push(Arc::new(Embedder::new(&cache_dir)?));
        }
        // Probe the model once for its output dimension.
        let dimension = instances[0]
            .embed(vec!["dimension probe".to_string()], None)?
            .first()
            .map(Vec::len)
            .unwrap_or(0);
        tracing::info!(pool_size, dimension, "embedding pool ready");
        Ok(Self {
            semaphore: Arc::new(Semaphore::new(pool_size)),
            instances,
            next: AtomicUsize::new(0),
            dimension,
        })
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    fn pick(&self) -> Arc<Embedder> {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.instances.len();
        self.instances[idx].clone()
    }

    /// Embed one query string off the async runtime.
    pub async fn embed_query(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        let _permit = self.semaphore.clone().acquire_owned().await?;
        let embedder = self.pick();
        let text = text.to_string();
        let mut vectors =
            tokio::task::spawn_blocking(move || embedder.embed(vec![text], None)).await??;
        vectors
            .pop()
            .ok_or_else(|| anyhow::anyhow!("embedder returned no vector"))
    }

    /// Embed a batch, honoring the configured batch size.
    pub async fn embed_batch(
        &self,
        texts: Vec<String>,
        batch_size: usize,
    ) -> anyhow::Result<Vec<Vec<f32>>> {
        let _permit = self.semaphore.clone().acquire_owned().await?;
        let embedder = self.pick();
        tokio::task::spawn_blocking(move || embedder.embed(texts, Some(batch_size))).await?
    }
}

/// Flat cosine index over the payload's embedding matrix.
pub struct VectorIndex {
    dim: usize,
    chunks: Vec<ChunkMeta>,
    /// Row-major, one L2-normalized row per chunk.
    rows: Vec<f32>,
}

impl VectorIndex {
    pub fn from_payload(payload: IndexPayload) -> Self {
        let dim = payload.embedding_dim as usize;
        let mut rows = payload.embeddings;
        if dim > 0 {
            for row in rows.chunks_mut(dim) {
                normalize(row);
            }
        }
        Self {
            dim,
            chunks: payload.chunks,
            rows,
        }
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn memory_bytes(&self) -> usize {
        self.rows.len() * std::mem::size_of::<f32>()
            + self
                .chunks
                .iter()
                .map(|c| 64 + c.file_path.len() + c.chunk_type.len())
                .sum::<usize>()
    }

    /// Top-k chunks by cosine similarity. Returns (chunk index, score).
    pub fn search(&self, query: &[f32], k: usize) -> Vec<(usize, f32)> {
        if self.dim == 0 || query.len() != self.dim {
            return Vec::new();
        }
        let mut q = query.to_vec();
        normalize(&mut q);

        let mut scored: Vec<(usize, f32)> = self
            .rows
            .chunks(self.dim)
            .enumerate()
            .map(|(i, row)| (i, dot(row, &q)))
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        scored
    }

    pub fn chunk(&self, idx: usize) -> Option<&ChunkMeta> {
        self.chunks.get(idx)
    }
}

fn normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in v {
            *x /= norm;
        }
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// The semantic backend adapter for one project.
pub struct SemanticBackend {
    project_root: PathBuf,
    embedder: Option<Arc<EmbedderPool>>,
    index: RwLock<Option<Arc<VectorIndex>>>,
    metrics: Arc<MetricsRegistry>,
}

impl SemanticBackend {
    pub fn new(
        project_root: PathBuf,
        embedder: Option<Arc<EmbedderPool>>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            project_root,
            embedder,
            index: RwLock::new(None),
            metrics,
        }
    }

    pub fn load_index(&self, payload: IndexPayload) {
        let index = VectorIndex::from_payload(payload);
        tracing::debug!(chunks = index.len(), "semantic index loaded");
        *self.index.write().unwrap() = Some(Arc::new(index));
    }

    pub fn unload_index(&self) {
        *self.index.write().unwrap() = None;
    }

    pub fn index_memory_bytes(&self) -> usize {
        self.index
            .read()
            .unwrap()
            .as_ref()
            .map(|i| i.memory_bytes())
            .unwrap_or(0)
    }

    /// Pull the chunk's source lines for the hit preview; empty when the
    /// file is gone or unreadable.
    fn snippet(&self, chunk: &ChunkMeta) -> String {
        let path = self.project_root.join(&chunk.file_path);
        let Ok(content) = std::fs::read_to_string(&path) else {
            return chunk.parent_context.clone().unwrap_or_default();
        };
        let start = chunk.start_line.saturating_sub(1) as usize;
        let end = (chunk.end_line as usize).min(start + 10);
        content
            .lines()
            .skip(start)
            .take(end.saturating_sub(start).max(1))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[async_trait]
impl SearchBackend for SemanticBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Semantic
    }

    fn capabilities(&self) -> &'static [Capability] {
        &[Capability::HealthCheck, Capability::Search, Capability::ListFiles]
    }

    fn is_available(&self) -> bool {
        self.embedder.is_some() && self.index.read().unwrap().is_some()
    }

    async fn health_check(&self) -> HealthStatus {
        let chunks = self
            .index
            .read()
            .unwrap()
            .as_ref()
            .map(|i| i.len())
            .unwrap_or(0);
        if self.is_available() {
            HealthStatus::healthy(format!("semantic index resident ({chunks} chunks)"))
        } else {
            HealthStatus::unhealthy(
                "semantic backend unavailable",
                json!({"model_loaded": self.embedder.is_some(), "index_loaded": chunks > 0}),
            )
        }
    }

    async fn search(&self, request: &SearchRequest) -> anyhow::Result<Vec<SearchHit>> {
        let Some(embedder) = &self.embedder else {
            anyhow::bail!("embedding model not loaded");
        };
        let Some(index) = self.index.read().unwrap().clone() else {
            anyhow::bail!("semantic index not loaded");
        };

        let started = Instant::now();
        let query_vec = embedder.embed_query(&request.query).await?;
        let glob = request
            .file_pattern
            .as_deref()
            .and_then(|p| glob::Pattern::new(p).ok());

        // Over-fetch so a glob filter still fills max_results.
        let fetch = request.max_results * 2;
        let mut hits = Vec::new();
        for (idx, score) in index.search(&query_vec, fetch) {
            let Some(chunk) = index.chunk(idx) else {
                continue;
            };
            if let Some(g) = &glob {
                if !g.matches(&chunk.file_path) {
                    continue;
                }
            }
            hits.push(SearchHit {
                file_path: chunk.file_path.clone(),
                start_line: Some(chunk.start_line),
                end_line: Some(chunk.end_line),
                content: self.snippet(chunk),
                score: f64::from(score).clamp(0.0, 1.0),
                symbol: chunk.parent_context.clone(),
            });
            if hits.len() >= request.max_results {
                break;
            }
        }

        self.metrics
            .observe("semantic_search_latency_ms", started.elapsed().as_millis() as f64);
        Ok(hits)
    }

    async fn list_files(&self) -> anyhow::Result<Vec<String>> {
        let Some(index) = self.index.read().unwrap().clone() else {
            anyhow::bail!("semantic index not loaded");
        };
        let mut files: Vec<String> = index.chunks.iter().map(|c| c.file_path.clone()).collect();
        files.sort();
        files.dedup();
        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(i: u32, path: &str) -> ChunkMeta {
        ChunkMeta {
            chunk_index: i,
            file_path: path.into(),
            start_line: 1,
            end_line: 10,
            chunk_type: "function".into(),
            parent_context: None,
        }
    }

    #[test]
    fn flat_index_ranks_by_cosine() {
        let payload = IndexPayload {
            project_id: "p".into(),
            embedding_dim: 3,
            chunks: vec![chunk(0, "a.rs"), chunk(1, "b.rs"), chunk(2, "c.rs")],
            embeddings: vec![
                1.0, 0.0, 0.0, // a: aligned with query
                0.0, 1.0, 0.0, // b: orthogonal
                0.7, 0.7, 0.0, // c: diagonal
            ],
        };
        let index = VectorIndex::from_payload(payload);
        let results = index.search(&[1.0, 0.0, 0.0], 3);
        assert_eq!(results[0].0, 0);
        assert_eq!(results[1].0, 2);
        assert_eq!(results[2].0, 1);
        assert!(results[0].1 > 0.99);
    }

    #[test]
    fn dimension_mismatch_returns_nothing() {
        let payload = IndexPayload {
            project_id: "p".into(),
            embedding_dim: 3,
            chunks: vec![chunk(0, "a.rs")],
            embeddings: vec![1.0, 0.0, 0.0],
        };
        let index = VectorIndex::from_payload(payload);
        assert!(index.search(&[1.0, 0.0], 5).is_empty());
    }

    #[test]
    fn unavailable_without_model_or_index() {
        let backend = SemanticBackend::new(
            PathBuf::from("/nonexistent"),
            None,
            Arc::new(MetricsRegistry::new()),
        );
        assert!(!backend.is_available());
        backend.load_index(IndexPayload {
            project_id: "p".into(),
            embedding_dim: 1,
            chunks: vec![],
            embeddings: vec![],
        });
        // Index present but no embedder: still unavailable.
        assert!(!backend.is_available());
    }

    #[test]
    fn index_memory_accounting_is_nonzero() {
        let payload = IndexPayload {
            project_id: "p".into(),
            embedding_dim: 2,
            chunks: vec![chunk(0, "a.rs")],
            embeddings: vec![0.5, 0.5],
        };
        let index = VectorIndex::from_payload(payload);
        assert!(index.memory_bytes() > 8);
    }
}
