//! Regex/symbol backend.
//!
//! Prefers an external ripgrep binary; an embedded matcher built on the
//! `regex` and `ignore` crates is the always-available last link of the
//! fallback chain. Both honor case sensitivity, context lines, file globs,
//! and the relaxed fuzzy mode.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use serde_json::{json, Value};
use tokio::io::AsyncReadExt;
use tokio::process::Command;

use crate::global::monitoring::HealthStatus;
use crate::search::backend::{BackendKind, Capability, SearchBackend, SearchHit, SearchRequest};

const MAX_FILE_BYTES: u64 = 1024 * 1024;

/// Resolved once: the ripgrep binary on PATH, if any.
static RIPGREP_BIN: Lazy<Option<PathBuf>> = Lazy::new(|| {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join("rg"))
        .find(|candidate| candidate.is_file())
});

/// Build the effective pattern. Fuzzy mode joins whitespace-separated terms
/// with a lazy gap so near matches still hit.
fn effective_pattern(request: &SearchRequest) -> String {
    if request.fuzzy {
        request
            .query
            .split_whitespace()
            .map(regex::escape)
            .collect::<Vec<_>>()
            .join(".*")
    } else {
        request.query.clone()
    }
}

/// External ripgrep adapter for one project root.
pub struct RipgrepBackend {
    root: PathBuf,
}

impl RipgrepBackend {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn binary_available() -> bool {
        RIPGREP_BIN.is_some()
    }

    async fn run(&self, request: &SearchRequest) -> anyhow::Result<Vec<SearchHit>> {
        let Some(bin) = RIPGREP_BIN.as_ref() else {
            anyhow::bail!("ripgrep binary not on PATH");
        };

        let mut cmd = Command::new(bin);
        cmd.arg("--json")
            .arg("--no-config")
            .arg("--max-count")
            .arg(request.max_results.to_string());
        if !request.case_sensitive || request.fuzzy {
            cmd.arg("-i");
        }
        if request.context_lines > 0 {
            cmd.arg("-C").arg(request.context_lines.to_string());
        }
        if let Some(glob) = &request.file_pattern {
            cmd.arg("--glob").arg(glob);
        }
        cmd.arg("-e")
            .arg(effective_pattern(request))
            .arg(".")
            .current_dir(&self.root)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .stdin(Stdio::null());

        let mut child = cmd.spawn()?;
        let mut stdout = child.stdout.take().expect("stdout piped");
        let mut raw = String::new();
        stdout.read_to_string(&mut raw).await?;
        let status = child.wait().await?;
        // Exit code 1 just means "no matches".
        if !status.success() && status.code() != Some(1) {
            anyhow::bail!("ripgrep exited with {status}");
        }

        Ok(parse_rg_json(&raw, request.max_results))
    }
}

/// Fold the rg JSON event stream into hits, attaching context lines to
/// their match.
fn parse_rg_json(raw: &str, max_results: usize) -> Vec<SearchHit> {
    struct RawLine {
        line: u32,
        text: String,
        is_match: bool,
    }
    let mut by_path: HashMap<String, Vec<RawLine>> = HashMap::new();

    for line in raw.lines() {
        let Ok(event) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        let kind = event.get("type").and_then(Value::as_str).unwrap_or("");
        if kind != "match" && kind != "context" {
            continue;
        }
        let data = &event["data"];
        let (Some(path), Some(line_number)) = (
            data.pointer("/path/text").and_then(Value::as_str),
            data.get("line_number").and_then(Value::as_u64),
        ) else {
            continue;
        };
        let text = data
            .pointer("/lines/text")
            .and_then(Value::as_str)
            .unwrap_or("")
            .trim_end_matches('\n')
            .to_string();
        by_path.entry(path.to_string()).or_default().push(RawLine {
            line: line_number as u32,
            text,
            is_match: kind == "match",
        });
    }

    let mut hits = Vec::new();
    for (path, mut lines) in by_path {
        lines.sort_by_key(|l| l.line);
        // Each match claims the contiguous run of context lines around it.
        for i in 0..lines.len() {
            if !lines[i].is_match {
                continue;
            }
            let mut start = i;
            while start > 0 && !lines[start - 1].is_match && lines[start - 1].line + 1 == lines[start].line
            {
                start -= 1;
            }
            let mut end = i;
            while end + 1 < lines.len()
                && !lines[end + 1].is_match
                && lines[end + 1].line == lines[end].line + 1
            {
                end += 1;
            }
            let content = lines[start..=end]
                .iter()
                .map(|l| l.text.as_str())
                .collect::<Vec<_>>()
                .join("\n");
            hits.push(SearchHit {
                file_path: path.trim_start_matches("./").to_string(),
                start_line: Some(lines[start].line),
                end_line: Some(lines[end].line),
                content,
                score: 1.0,
                symbol: None,
            });
        }
    }
    hits.sort_by(|a, b| (a.file_path.as_str(), a.start_line).cmp(&(b.file_path.as_str(), b.start_line)));
    hits.truncate(max_results);
    hits
}

#[async_trait]
impl SearchBackend for RipgrepBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Ripgrep
    }

    fn capabilities(&self) -> &'static [Capability] {
        &[Capability::HealthCheck, Capability::Search]
    }

    fn is_available(&self) -> bool {
        Self::binary_available() && self.root.is_dir()
    }

    async fn health_check(&self) -> HealthStatus {
        if self.is_available() {
            HealthStatus::healthy("ripgrep present")
        } else {
            HealthStatus::unhealthy(
                "ripgrep unavailable",
                json!({"binary_found": Self::binary_available(), "root_exists": self.root.is_dir()}),
            )
        }
    }

    async fn search(&self, request: &SearchRequest) -> anyhow::Result<Vec<SearchHit>> {
        self.run(request).await
    }
}

/// Embedded matcher — the grep-class fallback that is always available.
pub struct EmbeddedGrepBackend {
    root: PathBuf,
}

impl EmbeddedGrepBackend {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn search_sync(root: &Path, request: &SearchRequest) -> anyhow::Result<Vec<SearchHit>> {
        let pattern = effective_pattern(request);
        let re = regex::RegexBuilder::new(&pattern)
            .case_insensitive(!request.case_sensitive || request.fuzzy)
            .build()?;
        let glob = request
            .file_pattern
            .as_deref()
            .map(glob::Pattern::new)
            .transpose()?;

        let mut hits = Vec::new();
        let walker = ignore::WalkBuilder::new(root)
            .follow_links(false)
            .hidden(true)
            .build();
        'files: for entry in walker.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            if entry
                .metadata()
                .map(|m| m.len() > MAX_FILE_BYTES)
                .unwrap_or(true)
            {
                continue;
            }
            let rel = path.strip_prefix(root).unwrap_or(path);
            let rel_str = rel.to_string_lossy();
            if let Some(g) = &glob {
                let file_name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_default();
                if !g.matches(&rel_str) && !g.matches(&file_name) {
                    continue;
                }
            }
            let Ok(content) = std::fs::read_to_string(path) else {
                continue;
            };
            let file_lines: Vec<&str> = content.lines().collect();
            for (idx, line) in file_lines.iter().enumerate() {
                if !re.is_match(line) {
                    continue;
                }
                let ctx = request.context_lines as usize;
                let start = idx.saturating_sub(ctx);
                let end = (idx + ctx).min(file_lines.len().saturating_sub(1));
                hits.push(SearchHit {
                    file_path: rel_str.to_string(),
                    start_line: Some(start as u32 + 1),
                    end_line: Some(end as u32 + 1),
                    content: file_lines[start..=end].join("\n"),
                    score: 1.0,
                    symbol: None,
                });
                if hits.len() >= request.max_results {
                    break 'files;
                }
            }
        }
        Ok(hits)
    }
}

#[async_trait]
impl SearchBackend for EmbeddedGrepBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::GrepFallback
    }

    fn capabilities(&self) -> &'static [Capability] {
        &[Capability::HealthCheck, Capability::Search]
    }

    fn is_available(&self) -> bool {
        self.root.is_dir()
    }

    async fn health_check(&self) -> HealthStatus {
        if self.is_available() {
            HealthStatus::healthy("embedded matcher ready")
        } else {
            HealthStatus::unhealthy("project root missing", json!({"root": self.root.display().to_string()}))
        }
    }

    async fn search(&self, request: &SearchRequest) -> anyhow::Result<Vec<SearchHit>> {
        let root = self.root.clone();
        let request = request.clone();
        tokio::task::spawn_blocking(move || Self::search_sync(&root, &request)).await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn fixture() -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("src")).unwrap();
        fs::write(
            dir.path().join("src/alpha.rs"),
            "fn alpha() {}\nfn beta_helper() {}\nconst GAMMA: u32 = 3;\n",
        )
        .unwrap();
        fs::write(
            dir.path().join("src/beta.py"),
            "def beta():\n    return 'beta value'\n",
        )
        .unwrap();
        dir
    }

    #[tokio::test]
    async fn embedded_finds_matches_with_lines() {
        let dir = fixture();
        let backend = EmbeddedGrepBackend::new(dir.path().to_path_buf());
        let hits = backend.search(&SearchRequest::new("beta")).await.unwrap();
        // One in alpha.rs, two in beta.py.
        assert_eq!(hits.len(), 3);
        assert!(hits.iter().all(|h| h.start_line.is_some()));
    }

    #[tokio::test]
    async fn embedded_case_sensitivity() {
        let dir = fixture();
        let backend = EmbeddedGrepBackend::new(dir.path().to_path_buf());
        let mut req = SearchRequest::new("GAMMA");
        req.case_sensitive = true;
        assert_eq!(backend.search(&req).await.unwrap().len(), 1);

        let mut req = SearchRequest::new("gamma");
        req.case_sensitive = true;
        assert!(backend.search(&req).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn embedded_glob_filter() {
        let dir = fixture();
        let backend = EmbeddedGrepBackend::new(dir.path().to_path_buf());
        let mut req = SearchRequest::new("beta");
        req.file_pattern = Some("*.py".into());
        let hits = backend.search(&req).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits.iter().all(|h| h.file_path.ends_with("beta.py")));
    }

    #[tokio::test]
    async fn embedded_context_lines() {
        let dir = fixture();
        let backend = EmbeddedGrepBackend::new(dir.path().to_path_buf());
        let mut req = SearchRequest::new("beta_helper");
        req.context_lines = 1;
        let hits = backend.search(&req).await.unwrap();
        assert_eq!(hits.len(), 1);
        let content = &hits[0].content;
        assert!(content.contains("fn alpha"));
        assert!(content.contains("GAMMA"));
        assert_eq!(hits[0].start_line, Some(1));
        assert_eq!(hits[0].end_line, Some(3));
    }

    #[tokio::test]
    async fn fuzzy_joins_terms() {
        let dir = fixture();
        let backend = EmbeddedGrepBackend::new(dir.path().to_path_buf());
        let mut req = SearchRequest::new("def beta");
        req.fuzzy = true;
        let hits = backend.search(&req).await.unwrap();
        assert!(!hits.is_empty());
    }

    #[test]
    fn rg_json_parser_groups_context() {
        let raw = concat!(
            r#"{"type":"context","data":{"path":{"text":"./a.rs"},"line_number":9,"lines":{"text":"before\n"}}}"#,
            "\n",
            r#"{"type":"match","data":{"path":{"text":"./a.rs"},"line_number":10,"lines":{"text":"the match\n"},"submatches":[]}}"#,
            "\n",
            r#"{"type":"context","data":{"path":{"text":"./a.rs"},"line_number":11,"lines":{"text":"after\n"}}}"#,
            "\n",
        );
        let hits = parse_rg_json(raw, 10);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].file_path, "a.rs");
        assert_eq!(hits[0].start_line, Some(9));
        assert_eq!(hits[0].end_line, Some(11));
        assert_eq!(hits[0].content, "before\nthe match\nafter");
    }

    #[test]
    fn grep_fallback_always_available_on_real_root() {
        let dir = fixture();
        assert!(EmbeddedGrepBackend::new(dir.path().to_path_buf()).is_available());
        assert!(!EmbeddedGrepBackend::new(PathBuf::from("/definitely/missing")).is_available());
    }
}
