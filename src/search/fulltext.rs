//! Full-text backend over SQLite FTS5.
//!
//! Each project owns a standalone segment database under
//! `indexes/<id>/fulltext/segments.db` with one FTS5 table of chunk text.
//! Supports tokenized match, phrase, prefix, and wildcard queries.

use std::path::Path;

use async_trait::async_trait;
use serde_json::json;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;

use crate::global::monitoring::HealthStatus;
use crate::search::backend::{BackendKind, Capability, SearchBackend, SearchHit, SearchRequest};

const DEFAULT_TOKENIZER: &str = "porter unicode61";

/// Translate a user query into FTS5 MATCH syntax.
///
/// - `"exact phrase"` stays a phrase query,
/// - a trailing `*` on a word becomes a prefix query,
/// - other special characters are neutralized by quoting each token,
/// - remaining tokens are OR'd so partial matches still rank.
fn build_match_query(query: &str) -> String {
    let trimmed = query.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    // A fully-quoted input is an explicit phrase query.
    if trimmed.len() >= 2 && trimmed.starts_with('"') && trimmed.ends_with('"') {
        let inner = &trimmed[1..trimmed.len() - 1];
        return format!("\"{}\"", inner.replace('"', "\"\""));
    }

    trimmed
        .split_whitespace()
        .filter_map(|word| {
            let (stem, prefix) = match word.strip_suffix('*') {
                Some(stem) => (stem, true),
                None => (word, false),
            };
            let escaped = stem.replace('"', "\"\"");
            // Tokens with no letters or digits tokenize to nothing.
            if !escaped.chars().any(char::is_alphanumeric) {
                None
            } else if prefix {
                Some(format!("\"{escaped}\"*"))
            } else {
                Some(format!("\"{escaped}\""))
            }
        })
        .collect::<Vec<_>>()
        .join(" OR ")
}

/// The per-project full-text segment store and its backend adapter.
pub struct FullTextBackend {
    pool: SqlitePool,
}

impl FullTextBackend {
    /// Open (or create) the segment database in `fulltext_dir`.
    pub async fn open(fulltext_dir: &Path) -> anyhow::Result<Self> {
        Self::open_with_tokenizer(fulltext_dir, DEFAULT_TOKENIZER).await
    }

    /// Open with a configurable analyzer (FTS5 tokenize= option).
    pub async fn open_with_tokenizer(
        fulltext_dir: &Path,
        tokenizer: &str,
    ) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(fulltext_dir).await?;
        let db_path = fulltext_dir.join("segments.db");

        let opts = SqliteConnectOptions::new()
            .filename(&db_path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(opts)
            .await?;

        sqlx::query(&format!(
            r#"
            CREATE VIRTUAL TABLE IF NOT EXISTS chunks_fts USING fts5(
                content,
                file_path UNINDEXED,
                start_line UNINDEXED,
                end_line UNINDEXED,
                tokenize = '{tokenizer}'
            )
            "#
        ))
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    /// Replace a file's chunks in the segment store.
    pub async fn upsert_file(
        &self,
        file_path: &str,
        chunks: &[(u32, u32, String)],
    ) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM chunks_fts WHERE file_path = ?")
            .bind(file_path)
            .execute(&mut *tx)
            .await?;
        for (start, end, content) in chunks {
            sqlx::query(
                "INSERT INTO chunks_fts (content, file_path, start_line, end_line) VALUES (?, ?, ?, ?)",
            )
            .bind(content.as_str())
            .bind(file_path)
            .bind(*start as i64)
            .bind(*end as i64)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn remove_file(&self, file_path: &str) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM chunks_fts WHERE file_path = ?")
            .bind(file_path)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn document_count(&self) -> anyhow::Result<i64> {
        let row = sqlx::query("SELECT count(*) AS n FROM chunks_fts")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("n"))
    }
}

#[async_trait]
impl SearchBackend for FullTextBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::FullText
    }

    fn capabilities(&self) -> &'static [Capability] {
        &[
            Capability::HealthCheck,
            Capability::Search,
            Capability::ListFiles,
            Capability::UploadFile,
            Capability::DeleteFile,
        ]
    }

    fn is_available(&self) -> bool {
        !self.pool.is_closed()
    }

    async fn health_check(&self) -> HealthStatus {
        match self.document_count().await {
            Ok(n) => HealthStatus::healthy(format!("full-text segments open ({n} chunks)")),
            Err(e) => HealthStatus::unhealthy("segment database unreachable", json!({"error": e.to_string()})),
        }
    }

    async fn search(&self, request: &SearchRequest) -> anyhow::Result<Vec<SearchHit>> {
        let match_query = build_match_query(&request.query);
        if match_query.is_empty() {
            return Ok(Vec::new());
        }

        // bm25() is ascending-better; negate into a descending score.
        let rows = sqlx::query(
            r#"
            SELECT file_path, start_line, end_line, content, bm25(chunks_fts) AS rank
            FROM chunks_fts
            WHERE chunks_fts MATCH ?
            ORDER BY rank
            LIMIT ?
            "#,
        )
        .bind(&match_query)
        .bind((request.max_results * 2) as i64)
        .fetch_all(&self.pool)
        .await?;

        let glob = request
            .file_pattern
            .as_deref()
            .and_then(|p| glob::Pattern::new(p).ok());

        let mut hits = Vec::new();
        for row in rows {
            let file_path: String = row.get("file_path");
            if let Some(g) = &glob {
                if !g.matches(&file_path) {
                    continue;
                }
            }
            let rank: f64 = row.get("rank");
            hits.push(SearchHit {
                file_path,
                start_line: row.get::<Option<i64>, _>("start_line").map(|v| v as u32),
                end_line: row.get::<Option<i64>, _>("end_line").map(|v| v as u32),
                content: row.get("content"),
                score: -rank,
                symbol: None,
            });
            if hits.len() >= request.max_results {
                break;
            }
        }
        Ok(hits)
    }

    async fn list_files(&self) -> anyhow::Result<Vec<String>> {
        let rows = sqlx::query("SELECT DISTINCT file_path FROM chunks_fts ORDER BY file_path")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|r| r.get("file_path")).collect())
    }

    async fn upload_file(&self, path: &str, content: &str) -> anyhow::Result<()> {
        let line_count = content.lines().count() as u32;
        self.upsert_file(path, &[(1, line_count.max(1), content.to_string())])
            .await
    }

    async fn delete_file(&self, path: &str) -> anyhow::Result<()> {
        self.remove_file(path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn backend_with_docs() -> (FullTextBackend, TempDir) {
        let dir = TempDir::new().unwrap();
        let backend = FullTextBackend::open(dir.path()).await.unwrap();
        backend
            .upsert_file(
                "src/server.rs",
                &[
                    (1, 30, "async fn handle_request accepts the incoming connection".into()),
                    (31, 60, "fn shutdown gracefully drains pending work".into()),
                ],
            )
            .await
            .unwrap();
        backend
            .upsert_file(
                "src/client.rs",
                &[(1, 20, "fn connect opens a connection to the server".into())],
            )
            .await
            .unwrap();
        (backend, dir)
    }

    #[tokio::test]
    async fn tokenized_match() {
        let (backend, _dir) = backend_with_docs().await;
        let hits = backend
            .search(&SearchRequest::new("connection"))
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits.iter().all(|h| h.score > 0.0));
    }

    #[tokio::test]
    async fn phrase_query_is_exact() {
        let (backend, _dir) = backend_with_docs().await;
        let hits = backend
            .search(&SearchRequest::new("\"incoming connection\""))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].file_path, "src/server.rs");
    }

    #[tokio::test]
    async fn prefix_query() {
        let (backend, _dir) = backend_with_docs().await;
        let hits = backend.search(&SearchRequest::new("shut*")).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].content.contains("shutdown"));
    }

    #[tokio::test]
    async fn glob_filter_restricts_paths() {
        let (backend, _dir) = backend_with_docs().await;
        let mut req = SearchRequest::new("connection");
        req.file_pattern = Some("src/client*".into());
        let hits = backend.search(&req).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].file_path, "src/client.rs");
    }

    #[tokio::test]
    async fn upsert_replaces_previous_chunks() {
        let (backend, _dir) = backend_with_docs().await;
        backend
            .upsert_file("src/server.rs", &[(1, 5, "completely new text".into())])
            .await
            .unwrap();
        let hits = backend
            .search(&SearchRequest::new("incoming"))
            .await
            .unwrap();
        assert!(hits.is_empty());
        assert_eq!(backend.document_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn malicious_query_does_not_error() {
        let (backend, _dir) = backend_with_docs().await;
        // FTS5 operators must not leak through as syntax.
        for q in ["NEAR(", "a\" OR \"b", "(((", "-connection"] {
            let res = backend.search(&SearchRequest::new(q)).await;
            assert!(res.is_ok(), "query {q:?} errored: {res:?}");
        }
    }
}
