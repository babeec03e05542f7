//! Orphan detection — index payloads on disk that the registry has
//! forgotten, usually the residue of a crash between payload write and
//! registry insert.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::Serialize;
use walkdir::WalkDir;

use crate::error::{GlobalIndexError, Result};
use crate::registry::serializer::{self, PAYLOAD_FILE};
use crate::registry::store::RegistryStore;

pub const DEFAULT_MAX_DEPTH: usize = 3;

/// One orphaned index directory with inferred metadata.
#[derive(Debug, Clone, Serialize)]
pub struct OrphanReport {
    /// Project id implied by the directory name.
    pub project_id: String,
    pub index_dir: String,
    pub payload_bytes: u64,
    pub chunk_count: Option<usize>,
    pub schema_version: Option<u16>,
}

pub struct OrphanDetector {
    indexes_root: PathBuf,
}

impl OrphanDetector {
    pub fn new(indexes_root: PathBuf) -> Self {
        Self { indexes_root }
    }

    /// Scan for well-formed payload files whose directory is not in the
    /// registry. Symlinks are never followed.
    pub async fn detect(&self, registry: &RegistryStore, max_depth: usize) -> Result<Vec<OrphanReport>> {
        let known: HashSet<String> = registry.by_id().await?.into_keys().collect();
        Ok(self.scan(&known, max_depth))
    }

    fn scan(&self, known_ids: &HashSet<String>, max_depth: usize) -> Vec<OrphanReport> {
        let mut orphans = Vec::new();
        if !self.indexes_root.is_dir() {
            return orphans;
        }

        let walker = WalkDir::new(&self.indexes_root)
            .max_depth(max_depth.max(1))
            .follow_links(false);
        for entry in walker.into_iter().flatten() {
            if entry.file_type().is_symlink()
                || entry.file_name() != std::ffi::OsStr::new(PAYLOAD_FILE)
            {
                continue;
            }
            let payload_path = entry.path();
            let Some(index_dir) = payload_path.parent() else {
                continue;
            };
            let Some(project_id) = index_dir.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if known_ids.contains(project_id) {
                continue;
            }

            // Only well-formed payloads count; garbage files are ignored.
            let Ok(schema) = serializer::read_schema_tag(payload_path) else {
                continue;
            };
            let chunk_count = serializer::read_payload(payload_path)
                .ok()
                .map(|p| p.chunk_count());
            let payload_bytes = entry.metadata().map(|m| m.len()).unwrap_or(0);

            orphans.push(OrphanReport {
                project_id: project_id.to_string(),
                index_dir: index_dir.display().to_string(),
                payload_bytes,
                chunk_count,
                schema_version: Some(schema),
            });
        }
        orphans.sort_by(|a, b| a.project_id.cmp(&b.project_id));
        orphans
    }

    /// Adopt an orphan: insert a registry row with defaults, keeping the
    /// directory name as the project id.
    pub async fn register(&self, registry: &RegistryStore, orphan: &OrphanReport) -> Result<()> {
        // Project source path is unknown at this point; the index dir stands
        // in until the next indexing run corrects it.
        registry
            .insert_with_id(&orphan.project_id, &orphan.index_dir, &orphan.index_dir)
            .await?;
        tracing::info!(project_id = %orphan.project_id, "orphaned index registered");
        Ok(())
    }

    /// Delete an orphan's files. The registry is untouched on failure.
    pub async fn purge(&self, orphan: &OrphanReport) -> Result<()> {
        let dir = Path::new(&orphan.index_dir);
        // Refuse to delete anything outside the configured root.
        if !dir.starts_with(&self.indexes_root) {
            return Err(GlobalIndexError::OrphanPurge {
                path: orphan.index_dir.clone(),
                reason: "outside the indexes root".into(),
            });
        }
        tokio::fs::remove_dir_all(dir)
            .await
            .map_err(|e| GlobalIndexError::OrphanPurge {
                path: orphan.index_dir.clone(),
                reason: e.to_string(),
            })?;
        tracing::info!(project_id = %orphan.project_id, "orphaned index purged");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::serializer::{write_payload, IndexPayload};
    use tempfile::TempDir;

    fn payload(id: &str) -> IndexPayload {
        IndexPayload {
            project_id: id.into(),
            embedding_dim: 2,
            chunks: vec![],
            embeddings: vec![],
        }
    }

    async fn registry(dir: &TempDir) -> RegistryStore {
        let db = dir.path().join("registry.sqlite");
        RegistryStore::open(db.to_str().unwrap()).await.unwrap()
    }

    #[tokio::test]
    async fn finds_unregistered_payloads() {
        let dir = TempDir::new().unwrap();
        let indexes = dir.path().join("indexes");
        write_payload(&indexes.join("known-1"), &payload("known-1")).unwrap();
        write_payload(&indexes.join("lost-1"), &payload("lost-1")).unwrap();

        let registry = registry(&dir).await;
        registry
            .insert_with_id("known-1", "/work/known", indexes.join("known-1").to_str().unwrap())
            .await
            .unwrap();

        let detector = OrphanDetector::new(indexes.clone());
        let orphans = detector.detect(&registry, DEFAULT_MAX_DEPTH).await.unwrap();
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].project_id, "lost-1");
        assert_eq!(orphans[0].chunk_count, Some(0));
    }

    #[tokio::test]
    async fn malformed_payloads_are_not_orphans() {
        let dir = TempDir::new().unwrap();
        let indexes = dir.path().join("indexes");
        let bad_dir = indexes.join("garbage");
        std::fs::create_dir_all(&bad_dir).unwrap();
        std::fs::write(bad_dir.join(PAYLOAD_FILE), b"not an index").unwrap();

        let registry = registry(&dir).await;
        let detector = OrphanDetector::new(indexes);
        let orphans = detector.detect(&registry, DEFAULT_MAX_DEPTH).await.unwrap();
        assert!(orphans.is_empty());
    }

    #[tokio::test]
    async fn register_adopts_orphan() {
        let dir = TempDir::new().unwrap();
        let indexes = dir.path().join("indexes");
        write_payload(&indexes.join("lost-1"), &payload("lost-1")).unwrap();

        let registry = registry(&dir).await;
        let detector = OrphanDetector::new(indexes);
        let orphans = detector.detect(&registry, DEFAULT_MAX_DEPTH).await.unwrap();
        detector.register(&registry, &orphans[0]).await.unwrap();

        assert!(registry.get("lost-1").await.unwrap().is_some());
        let after = detector.detect(&registry, DEFAULT_MAX_DEPTH).await.unwrap();
        assert!(after.is_empty());
    }

    #[tokio::test]
    async fn purge_removes_files() {
        let dir = TempDir::new().unwrap();
        let indexes = dir.path().join("indexes");
        write_payload(&indexes.join("lost-1"), &payload("lost-1")).unwrap();

        let registry = registry(&dir).await;
        let detector = OrphanDetector::new(indexes.clone());
        let orphans = detector.detect(&registry, DEFAULT_MAX_DEPTH).await.unwrap();
        detector.purge(&orphans[0]).await.unwrap();
        assert!(!indexes.join("lost-1").exists());
    }

    #[tokio::test]
    async fn purge_refuses_paths_outside_root() {
        let dir = TempDir::new().unwrap();
        let detector = OrphanDetector::new(dir.path().join("indexes"));
        let bogus = OrphanReport {
            project_id: "evil".into(),
            index_dir: "/tmp/somewhere-else".into(),
            payload_bytes: 0,
            chunk_count: None,
            schema_version: None,
        };
        let err = detector.purge(&bogus).await.unwrap_err();
        assert_eq!(err.error_type(), "orphan_purge_error");
    }
}
