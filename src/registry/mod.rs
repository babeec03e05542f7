//! Durable state: project registry, versioned index payloads, orphan
//! detection, and scheduled backups.

pub mod backup;
pub mod orphan;
pub mod serializer;
pub mod store;

pub use backup::BackupScheduler;
pub use orphan::{OrphanDetector, OrphanReport};
pub use serializer::{ChunkMeta, IndexPayload, PAYLOAD_FILE, SIDECAR_FILE};
pub use store::{ProjectRecord, RegistryStore};
