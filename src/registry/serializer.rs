//! Versioned binary index payloads.
//!
//! Layout: 4 magic bytes `LEIX`, little-endian u16 schema tag, one flags
//! byte (absent in v1), then the rkyv-serialized body. Writes go to a temp
//! file, are fsynced, and land via atomic rename. A prior-generation tag is
//! migrated in place; an unknown tag marks the index corrupt without
//! touching the registry.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};
use serde_json::json;

use crate::error::{GlobalIndexError, Result};

pub const PAYLOAD_FILE: &str = "index.bin";
pub const SIDECAR_FILE: &str = "chunks.meta";
pub const FULLTEXT_DIR: &str = "fulltext";

const MAGIC: &[u8; 4] = b"LEIX";
const SCHEMA_V1: u16 = 1;
const SCHEMA_V2: u16 = 2;
pub const CURRENT_SCHEMA: u16 = SCHEMA_V2;

/// Mapping from a chunk back to its source location.
#[derive(Archive, RkyvSerialize, RkyvDeserialize, Debug, Clone, PartialEq)]
#[archive(check_bytes)]
pub struct ChunkMeta {
    pub chunk_index: u32,
    pub file_path: String,
    pub start_line: u32,
    pub end_line: u32,
    pub chunk_type: String,
    pub parent_context: Option<String>,
}

/// The on-disk index payload: chunk sidecar data plus the flat embedding
/// matrix (row-major, `chunks.len() × embedding_dim`).
#[derive(Archive, RkyvSerialize, RkyvDeserialize, Debug, Clone, PartialEq)]
#[archive(check_bytes)]
pub struct IndexPayload {
    pub project_id: String,
    pub embedding_dim: u32,
    pub chunks: Vec<ChunkMeta>,
    pub embeddings: Vec<f32>,
}

/// v1 lacked `parent_context` and the flags byte.
#[derive(Archive, RkyvSerialize, RkyvDeserialize, Debug, Clone)]
#[archive(check_bytes)]
struct ChunkMetaV1 {
    chunk_index: u32,
    file_path: String,
    start_line: u32,
    end_line: u32,
    chunk_type: String,
}

#[derive(Archive, RkyvSerialize, RkyvDeserialize, Debug, Clone)]
#[archive(check_bytes)]
struct IndexPayloadV1 {
    project_id: String,
    embedding_dim: u32,
    chunks: Vec<ChunkMetaV1>,
    embeddings: Vec<f32>,
}

impl IndexPayload {
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }
}

/// Serialize and write `index.bin` plus the `chunks.meta` sidecar into a
/// project index directory. The payload file is fsynced before return so
/// the caller can safely write the registry row afterwards.
pub fn write_payload(index_dir: &Path, payload: &IndexPayload) -> Result<PathBuf> {
    std::fs::create_dir_all(index_dir)?;
    let target = index_dir.join(PAYLOAD_FILE);

    let body = rkyv::to_bytes::<_, 1024>(payload)
        .map_err(|e| GlobalIndexError::Migration(format!("serialize failed: {e}")))?;

    let tmp = index_dir.join(format!("{PAYLOAD_FILE}.tmp"));
    {
        let mut f = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp)?;
        f.write_all(MAGIC)?;
        f.write_all(&CURRENT_SCHEMA.to_le_bytes())?;
        f.write_all(&[0u8])?; // flags
        f.write_all(&body)?;
        f.sync_all()?;
    }
    std::fs::rename(&tmp, &target)?;

    write_sidecar(index_dir, payload)?;
    Ok(target)
}

fn write_sidecar(index_dir: &Path, payload: &IndexPayload) -> Result<()> {
    let mut map = BTreeMap::new();
    for chunk in &payload.chunks {
        map.insert(
            chunk.chunk_index.to_string(),
            json!({
                "file_path": chunk.file_path,
                "start_line": chunk.start_line,
                "end_line": chunk.end_line,
                "chunk_type": chunk.chunk_type,
                "parent_context": chunk.parent_context,
            }),
        );
    }
    let tmp = index_dir.join(format!("{SIDECAR_FILE}.tmp"));
    {
        let mut f = File::create(&tmp)?;
        f.write_all(serde_json::to_string_pretty(&map).unwrap_or_default().as_bytes())?;
        f.sync_all()?;
    }
    std::fs::rename(tmp, index_dir.join(SIDECAR_FILE))?;
    Ok(())
}

/// Schema tag of a payload file without reading the body.
pub fn read_schema_tag(path: &Path) -> Result<u16> {
    let mut f = File::open(path)?;
    let mut header = [0u8; 6];
    f.read_exact(&mut header)?;
    if &header[0..4] != MAGIC {
        return Err(GlobalIndexError::Migration(format!(
            "{}: bad magic bytes",
            path.display()
        )));
    }
    Ok(u16::from_le_bytes([header[4], header[5]]))
}

/// Read a payload, migrating a prior supported generation in place first.
pub fn read_payload(path: &Path) -> Result<IndexPayload> {
    let tag = read_schema_tag(path)?;
    match tag {
        SCHEMA_V2 => read_v2(path),
        SCHEMA_V1 => {
            tracing::info!(path = %path.display(), "migrating v1 index payload");
            let migrated = migrate_v1(path)?;
            Ok(migrated)
        }
        other => Err(GlobalIndexError::Migration(format!(
            "{}: unknown schema tag {other}",
            path.display()
        ))),
    }
}

fn read_v2(path: &Path) -> Result<IndexPayload> {
    let bytes = std::fs::read(path)?;
    if bytes.len() < 7 {
        return Err(GlobalIndexError::Migration(format!(
            "{}: truncated payload",
            path.display()
        )));
    }
    // The header is 7 bytes, so the body must be re-aligned for rkyv.
    let mut body = rkyv::AlignedVec::new();
    body.extend_from_slice(&bytes[7..]);
    let archived = rkyv::check_archived_root::<IndexPayload>(&body)
        .map_err(|e| GlobalIndexError::Migration(format!("payload validation failed: {e}")))?;
    let payload: IndexPayload = archived
        .deserialize(&mut rkyv::Infallible)
        .map_err(|_| GlobalIndexError::Migration("payload deserialize failed".into()))?;
    Ok(payload)
}

/// Convert a v1 file to the current schema: write to a temp file, fsync,
/// atomic rename over the original, then return the converted payload.
fn migrate_v1(path: &Path) -> Result<IndexPayload> {
    let bytes = std::fs::read(path)?;
    if bytes.len() < 6 {
        return Err(GlobalIndexError::Migration(format!(
            "{}: truncated v1 payload",
            path.display()
        )));
    }
    // v1 had no flags byte; body starts right after the tag.
    let mut body = rkyv::AlignedVec::new();
    body.extend_from_slice(&bytes[6..]);
    let archived = rkyv::check_archived_root::<IndexPayloadV1>(&body)
        .map_err(|e| GlobalIndexError::Migration(format!("v1 validation failed: {e}")))?;
    let v1: IndexPayloadV1 = archived
        .deserialize(&mut rkyv::Infallible)
        .map_err(|_| GlobalIndexError::Migration("v1 deserialize failed".into()))?;

    let payload = IndexPayload {
        project_id: v1.project_id,
        embedding_dim: v1.embedding_dim,
        chunks: v1
            .chunks
            .into_iter()
            .map(|c| ChunkMeta {
                chunk_index: c.chunk_index,
                file_path: c.file_path,
                start_line: c.start_line,
                end_line: c.end_line,
                chunk_type: c.chunk_type,
                parent_context: None,
            })
            .collect(),
        embeddings: v1.embeddings,
    };

    let dir = path
        .parent()
        .ok_or_else(|| GlobalIndexError::Migration("payload has no parent dir".into()))?;
    write_payload(dir, &payload)?;
    Ok(payload)
}

/// Raw v1 writer, kept for migration tests.
#[cfg(test)]
fn write_v1(index_dir: &Path, payload: &IndexPayloadV1) -> Result<PathBuf> {
    std::fs::create_dir_all(index_dir)?;
    let target = index_dir.join(PAYLOAD_FILE);
    let body = rkyv::to_bytes::<_, 1024>(payload)
        .map_err(|e| GlobalIndexError::Migration(format!("serialize failed: {e}")))?;
    let mut f = File::create(&target)?;
    f.write_all(MAGIC)?;
    f.write_all(&SCHEMA_V1.to_le_bytes())?;
    f.write_all(&body)?;
    f.sync_all()?;
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_payload() -> IndexPayload {
        IndexPayload {
            project_id: "proj-1".into(),
            embedding_dim: 4,
            chunks: vec![
                ChunkMeta {
                    chunk_index: 0,
                    file_path: "src/main.rs".into(),
                    start_line: 1,
                    end_line: 20,
                    chunk_type: "function".into(),
                    parent_context: Some("mod main".into()),
                },
                ChunkMeta {
                    chunk_index: 1,
                    file_path: "src/lib.rs".into(),
                    start_line: 5,
                    end_line: 40,
                    chunk_type: "struct".into(),
                    parent_context: None,
                },
            ],
            embeddings: vec![0.1, 0.2, 0.3, 0.4, 0.5, 0.6, 0.7, 0.8],
        }
    }

    #[test]
    fn round_trip_is_identity() {
        let dir = TempDir::new().unwrap();
        let payload = sample_payload();
        let path = write_payload(dir.path(), &payload).unwrap();
        let loaded = read_payload(&path).unwrap();
        assert_eq!(loaded, payload);
    }

    #[test]
    fn sidecar_written_alongside() {
        let dir = TempDir::new().unwrap();
        write_payload(dir.path(), &sample_payload()).unwrap();
        let sidecar = std::fs::read_to_string(dir.path().join(SIDECAR_FILE)).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&sidecar).unwrap();
        assert_eq!(parsed["0"]["file_path"], "src/main.rs");
        assert_eq!(parsed["1"]["chunk_type"], "struct");
    }

    #[test]
    fn v1_payload_migrates_in_place() {
        let dir = TempDir::new().unwrap();
        let v1 = IndexPayloadV1 {
            project_id: "old".into(),
            embedding_dim: 2,
            chunks: vec![ChunkMetaV1 {
                chunk_index: 0,
                file_path: "a.rs".into(),
                start_line: 1,
                end_line: 2,
                chunk_type: "file".into(),
            }],
            embeddings: vec![1.0, 0.0],
        };
        let path = write_v1(dir.path(), &v1).unwrap();
        assert_eq!(read_schema_tag(&path).unwrap(), SCHEMA_V1);

        let migrated = read_payload(&path).unwrap();
        assert_eq!(migrated.project_id, "old");
        assert_eq!(migrated.chunks[0].parent_context, None);

        // The file on disk is now current-generation.
        assert_eq!(read_schema_tag(&path).unwrap(), CURRENT_SCHEMA);
        let reread = read_payload(&path).unwrap();
        assert_eq!(reread, migrated);
    }

    #[test]
    fn unknown_tag_is_migration_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(PAYLOAD_FILE);
        let mut f = File::create(&path).unwrap();
        f.write_all(MAGIC).unwrap();
        f.write_all(&99u16.to_le_bytes()).unwrap();
        f.write_all(&[0u8; 16]).unwrap();
        drop(f);

        let err = read_payload(&path).unwrap_err();
        assert_eq!(err.error_type(), "migration_error");
    }

    #[test]
    fn bad_magic_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(PAYLOAD_FILE);
        std::fs::write(&path, b"NOPE\x02\x00rest").unwrap();
        assert!(read_payload(&path).is_err());
    }
}
