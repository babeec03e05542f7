//! Project registry — durable project list in a global SQLite database.
//!
//! Writes serialize through a small WAL pool. Sequential-write contract:
//! callers fsync the index payload before touching the registry row, so a
//! crash between the two steps is recoverable by orphan detection.

use std::collections::HashMap;
use std::path::Path;

use chrono::Utc;
use serde_json::{json, Value};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;

use crate::error::Result;
use crate::global::monitoring::HealthStatus;

const SCHEMA_VERSION: i64 = 2;
const META_SCHEMA_VERSION: &str = "schema_version";
const META_LAST_BACKUP_AT: &str = "last_backup_at";

/// A row in the project registry.
#[derive(Debug, Clone)]
pub struct ProjectRecord {
    pub id: String,
    pub path: String,
    pub name: String,
    pub created_at: i64,
    pub indexed_at: i64,
    pub file_count: i64,
    pub config_json: String,
    pub stats_json: String,
    pub index_location: String,
}

impl ProjectRecord {
    fn from_row(r: &sqlx::sqlite::SqliteRow) -> Self {
        Self {
            id: r.get("id"),
            path: r.get("path"),
            name: r.get("name"),
            created_at: r.get("created_at"),
            indexed_at: r.get("indexed_at"),
            file_count: r.get("file_count"),
            config_json: r.get("config_json"),
            stats_json: r.get("stats_json"),
            index_location: r.get("index_location"),
        }
    }
}

/// Wrapper around the registry database.
#[derive(Clone)]
pub struct RegistryStore {
    pool: SqlitePool,
    db_path: String,
}

impl RegistryStore {
    /// Open (or create) the registry database at the given path.
    pub async fn open(db_path: &str) -> Result<Self> {
        if let Some(parent) = Path::new(db_path).parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let opts = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect_with(opts)
            .await?;

        let store = Self {
            pool,
            db_path: db_path.to_string(),
        };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS projects (
                id             TEXT PRIMARY KEY,
                path           TEXT NOT NULL UNIQUE,
                name           TEXT NOT NULL,
                created_at     INTEGER NOT NULL,
                indexed_at     INTEGER NOT NULL,
                file_count     INTEGER NOT NULL DEFAULT 0,
                config_json    TEXT NOT NULL DEFAULT '{}',
                stats_json     TEXT NOT NULL DEFAULT '{}',
                index_location TEXT NOT NULL DEFAULT ''
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS registry_meta (
                key   TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("INSERT OR IGNORE INTO registry_meta (key, value) VALUES (?, ?)")
            .bind(META_SCHEMA_VERSION)
            .bind(SCHEMA_VERSION.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub fn db_path(&self) -> &str {
        &self.db_path
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Register a project path. Returns the id (new or existing).
    pub async fn register(&self, abs_path: &str, index_location: &str) -> Result<String> {
        if let Some(existing) = self.get_by_path(abs_path).await? {
            return Ok(existing.id);
        }

        let id = uuid::Uuid::new_v4().to_string();
        self.insert_with_id(&id, abs_path, index_location).await?;
        Ok(id)
    }

    /// Insert with a caller-chosen id (orphan adoption keeps the directory
    /// name as the project id).
    pub async fn insert_with_id(
        &self,
        id: &str,
        abs_path: &str,
        index_location: &str,
    ) -> Result<()> {
        let name = Path::new(abs_path)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unnamed")
            .to_string();
        let now = Utc::now().timestamp();

        sqlx::query(
            r#"
            INSERT INTO projects (id, path, name, created_at, indexed_at, file_count,
                                  config_json, stats_json, index_location)
            VALUES (?, ?, ?, ?, ?, 0, '{}', '{}', ?)
            "#,
        )
        .bind(id)
        .bind(abs_path)
        .bind(&name)
        .bind(now)
        .bind(now)
        .bind(index_location)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record a completed (re-)index: refresh indexed-at, stats, file count.
    pub async fn update_indexed(
        &self,
        id: &str,
        file_count: i64,
        stats_json: &Value,
    ) -> Result<()> {
        let now = Utc::now().timestamp();
        sqlx::query("UPDATE projects SET indexed_at = ?, file_count = ?, stats_json = ? WHERE id = ?")
            .bind(now)
            .bind(file_count)
            .bind(stats_json.to_string())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn update_config(&self, id: &str, config_json: &Value) -> Result<()> {
        sqlx::query("UPDATE projects SET config_json = ? WHERE id = ?")
            .bind(config_json.to_string())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Option<ProjectRecord>> {
        let row = sqlx::query("SELECT * FROM projects WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| ProjectRecord::from_row(&r)))
    }

    pub async fn get_by_path(&self, abs_path: &str) -> Result<Option<ProjectRecord>> {
        let row = sqlx::query("SELECT * FROM projects WHERE path = ?")
            .bind(abs_path)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| ProjectRecord::from_row(&r)))
    }

    pub async fn exists(&self, abs_path: &str) -> Result<bool> {
        Ok(self.get_by_path(abs_path).await?.is_some())
    }

    pub async fn list_all(&self) -> Result<Vec<ProjectRecord>> {
        let rows = sqlx::query("SELECT * FROM projects ORDER BY indexed_at DESC")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(ProjectRecord::from_row).collect())
    }

    pub async fn remove(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM projects WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // --- registry metadata ------------------------------------------------

    pub async fn meta_get(&self, key: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM registry_meta WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get("value")))
    }

    pub async fn meta_set(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query("INSERT OR REPLACE INTO registry_meta (key, value) VALUES (?, ?)")
            .bind(key)
            .bind(value)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn last_backup_at(&self) -> Result<Option<i64>> {
        Ok(self
            .meta_get(META_LAST_BACKUP_AT)
            .await?
            .and_then(|v| v.parse().ok()))
    }

    pub async fn set_last_backup_at(&self, at: i64) -> Result<()> {
        self.meta_set(META_LAST_BACKUP_AT, &at.to_string()).await
    }

    /// Registry health: database reachable, schema version known, and every
    /// referenced index location present on disk.
    pub async fn health_check(&self) -> HealthStatus {
        let version = match self.meta_get(META_SCHEMA_VERSION).await {
            Ok(v) => v,
            Err(e) => {
                return HealthStatus::unhealthy(
                    "registry database unreachable",
                    json!({"error": e.to_string()}),
                )
            }
        };
        let version_ok = version
            .as_deref()
            .and_then(|v| v.parse::<i64>().ok())
            .map(|v| v <= SCHEMA_VERSION)
            .unwrap_or(false);
        if !version_ok {
            return HealthStatus::unhealthy(
                "registry schema version unsupported",
                json!({"found": version, "supported": SCHEMA_VERSION}),
            );
        }

        let records = match self.list_all().await {
            Ok(r) => r,
            Err(e) => {
                return HealthStatus::unhealthy(
                    "registry listing failed",
                    json!({"error": e.to_string()}),
                )
            }
        };
        let missing: Vec<String> = records
            .iter()
            .filter(|r| !r.index_location.is_empty() && !Path::new(&r.index_location).exists())
            .map(|r| r.id.clone())
            .collect();
        if missing.is_empty() {
            HealthStatus::healthy(format!("registry healthy ({} projects)", records.len()))
        } else {
            HealthStatus::unhealthy(
                "registry references missing index locations",
                json!({"projects": records.len(), "missing_index_locations": missing}),
            )
        }
    }

    /// Id → record map, used by orphan detection.
    pub async fn by_id(&self) -> Result<HashMap<String, ProjectRecord>> {
        Ok(self
            .list_all()
            .await?
            .into_iter()
            .map(|r| (r.id.clone(), r))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn store() -> (RegistryStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("registry.sqlite");
        let store = RegistryStore::open(db.to_str().unwrap()).await.unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn register_is_idempotent_per_path() {
        let (store, _dir) = store().await;
        let id1 = store.register("/work/alpha", "/data/indexes/x").await.unwrap();
        let id2 = store.register("/work/alpha", "/data/indexes/x").await.unwrap();
        assert_eq!(id1, id2);
        assert_eq!(store.list_all().await.unwrap().len(), 1);
        assert!(store.exists("/work/alpha").await.unwrap());
        assert!(!store.exists("/work/beta").await.unwrap());
    }

    #[tokio::test]
    async fn update_indexed_refreshes_stats() {
        let (store, _dir) = store().await;
        let id = store.register("/work/alpha", "").await.unwrap();
        store
            .update_indexed(&id, 42, &json!({"symbol_count": 100}))
            .await
            .unwrap();
        let rec = store.get(&id).await.unwrap().unwrap();
        assert_eq!(rec.file_count, 42);
        let stats: Value = serde_json::from_str(&rec.stats_json).unwrap();
        assert_eq!(stats["symbol_count"], 100);
    }

    #[tokio::test]
    async fn remove_deletes_row() {
        let (store, _dir) = store().await;
        let id = store.register("/work/alpha", "").await.unwrap();
        assert!(store.remove(&id).await.unwrap());
        assert!(!store.remove(&id).await.unwrap());
        assert!(store.get(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn meta_round_trip() {
        let (store, _dir) = store().await;
        assert!(store.last_backup_at().await.unwrap().is_none());
        store.set_last_backup_at(1_700_000_000).await.unwrap();
        assert_eq!(store.last_backup_at().await.unwrap(), Some(1_700_000_000));
    }

    #[tokio::test]
    async fn health_check_flags_missing_index_dirs() {
        let (store, dir) = store().await;
        let real = dir.path().join("real-index");
        std::fs::create_dir_all(&real).unwrap();
        store
            .insert_with_id("ok", "/work/ok", real.to_str().unwrap())
            .await
            .unwrap();
        assert!(store.health_check().await.healthy);

        store
            .insert_with_id("ghost", "/work/ghost", "/definitely/not/here")
            .await
            .unwrap();
        let health = store.health_check().await;
        assert!(!health.healthy);
        assert_eq!(health.details["missing_index_locations"][0], "ghost");
    }
}
