//! Local-file adapter: text search over allowed filesystem roots.
//!
//! Uses the `ignore` crate's gitignore-aware walker (the same traversal
//! idiom ripgrep itself is built on) so build caches and anything excluded
//! by a `.gitignore` are skipped for free, on top of the explicit exclusion
//! list spec.md §4.5 requires for credential paths and key material.

use std::path::{Path, PathBuf};
use std::time::Instant;

use async_trait::async_trait;
use ignore::WalkBuilder;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::search::adapter::{SearchHit, SearchOptions, SourceSearchAdapter};

/// Max single-file size searched (spec.md §4.5: 10 MB).
pub const MAX_FILE_SIZE_BYTES: u64 = 10 * 1024 * 1024;

fn default_exclusions() -> Vec<&'static str> {
    vec![
        ".ssh",
        ".gnupg",
        ".aws",
        "id_rsa",
        "id_ed25519",
        ".env",
        "target",
        "node_modules",
        ".git",
    ]
}

pub struct LocalFileAdapter {
    roots: Vec<PathBuf>,
    exclusions: Vec<String>,
}

impl LocalFileAdapter {
    pub fn new(roots: Vec<PathBuf>) -> Self {
        Self {
            roots,
            exclusions: default_exclusions().into_iter().map(String::from).collect(),
        }
    }

    fn is_excluded(&self, path: &Path) -> bool {
        let path_str = path.to_string_lossy();
        self.exclusions.iter().any(|pattern| path_str.contains(pattern.as_str()))
    }
}

#[async_trait]
impl SourceSearchAdapter for LocalFileAdapter {
    fn source_name(&self) -> &str {
        "local_file"
    }

    async fn is_available(&self) -> bool {
        self.roots.iter().any(|r| r.exists())
    }

    async fn search(
        &self,
        query: &str,
        max: usize,
        opts: &SearchOptions,
        cancel: CancellationToken,
    ) -> Result<Vec<SearchHit>> {
        let needle = query.to_ascii_lowercase();
        let started = Instant::now();
        let mut hits = Vec::new();

        let roots: Vec<PathBuf> = match &opts.folder_path {
            Some(folder) => self.roots.iter().map(|r| r.join(folder)).collect(),
            None => self.roots.clone(),
        };

        for root in roots {
            if cancel.is_cancelled() || hits.len() >= max {
                break;
            }
            let walker = WalkBuilder::new(&root).hidden(false).build();
            for entry in walker {
                if cancel.is_cancelled() || hits.len() >= max {
                    break;
                }
                let Ok(entry) = entry else { continue };
                let path = entry.path();
                if !path.is_file() || self.is_excluded(path) {
                    continue;
                }
                let Ok(metadata) = entry.metadata() else { continue };
                if metadata.len() > MAX_FILE_SIZE_BYTES {
                    continue;
                }
                let Ok(content) = std::fs::read_to_string(path) else { continue };
                let lower = content.to_ascii_lowercase();
                if let Some(pos) = lower.find(&needle) {
                    let snippet_start = pos.saturating_sub(40);
                    let snippet_end = (pos + needle.len() + 40).min(content.len());
                    hits.push(SearchHit {
                        source: self.source_name().to_string(),
                        identifier: path.to_string_lossy().to_string(),
                        title: path
                            .file_name()
                            .map(|n| n.to_string_lossy().to_string())
                            .unwrap_or_default(),
                        snippet: content[snippet_start..snippet_end].to_string(),
                        adapter_relevance: 0.8,
                        days_old: file_age_days(metadata.modified().ok()),
                    });
                }
            }
        }

        let _ = started;
        Ok(hits)
    }
}

fn file_age_days(modified: Option<std::time::SystemTime>) -> f64 {
    modified
        .and_then(|m| m.elapsed().ok())
        .map(|d| d.as_secs_f64() / 86_400.0)
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn finds_matching_file() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("notes.txt"), "Budget Q1 review").unwrap();

        let adapter = LocalFileAdapter::new(vec![dir.path().to_path_buf()]);
        let hits = adapter
            .search("budget", 10, &SearchOptions::default(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn excludes_credential_paths() {
        let dir = TempDir::new().unwrap();
        let ssh_dir = dir.path().join(".ssh");
        std::fs::create_dir_all(&ssh_dir).unwrap();
        std::fs::write(ssh_dir.join("id_rsa"), "budget secret key").unwrap();

        let adapter = LocalFileAdapter::new(vec![dir.path().to_path_buf()]);
        let hits = adapter
            .search("budget", 10, &SearchOptions::default(), CancellationToken::new())
            .await
            .unwrap();

        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn skips_oversized_files() {
        let dir = TempDir::new().unwrap();
        let big_content = "budget ".repeat(2_000_000);
        std::fs::write(dir.path().join("huge.txt"), big_content).unwrap();

        let adapter = LocalFileAdapter::new(vec![dir.path().to_path_buf()]);
        let hits = adapter
            .search("budget", 10, &SearchOptions::default(), CancellationToken::new())
            .await
            .unwrap();

        assert!(hits.is_empty());
    }
}
