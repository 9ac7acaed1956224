//! Source-tree snapshots.

use std::path::{Path, PathBuf};

use crate::config::KnowledgeConfig;

use super::error::KnowledgeError;

/// One document of a source snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceDocument {
    /// Path relative to the source root, `/`-separated.
    pub id: String,
    pub path: PathBuf,
    pub content: String,
}

impl SourceDocument {
    pub fn new(id: impl Into<String>, path: impl Into<PathBuf>, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            path: path.into(),
            content: content.into(),
        }
    }
}

/// Decides which files belong in a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFilter {
    allowed_extensions: Vec<String>,
    ignored_filenames: Vec<String>,
    max_file_bytes: u64,
}

impl SourceFilter {
    /// Build a filter; extension and name comparisons are case-insensitive.
    #[must_use]
    pub fn new(allowed_extensions: &[String], ignored_filenames: &[String], max_file_bytes: u64) -> Self {
        Self {
            allowed_extensions: allowed_extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_lowercase())
                .collect(),
            ignored_filenames: ignored_filenames.iter().map(|n| n.to_lowercase()).collect(),
            max_file_bytes,
        }
    }

    #[must_use]
    pub fn from_config(config: &KnowledgeConfig) -> Self {
        Self::new(
            &config.allowed_extensions,
            &config.ignored_filenames,
            config.max_file_bytes,
        )
    }

    /// Whether the file name and extension qualify. Size is checked at scan time.
    #[must_use]
    pub fn is_eligible(&self, path: &Path) -> bool {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            return false;
        };
        if self.ignored_filenames.contains(&name.to_lowercase()) {
            return false;
        }
        path.extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| self.allowed_extensions.contains(&ext.to_lowercase()))
    }

    #[must_use]
    pub fn max_file_bytes(&self) -> u64 {
        self.max_file_bytes
    }
}

/// Document id of `path` under `root`.
#[must_use]
pub fn document_id(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Recursively snapshot eligible files under `root`, sorted by id.
///
/// Oversized and unreadable files are logged and left out.
///
/// # Errors
///
/// Returns an error if `root` is missing or a directory cannot be listed.
pub fn scan_source_dir(root: &Path, filter: &SourceFilter) -> Result<Vec<SourceDocument>, KnowledgeError> {
    if !root.is_dir() {
        return Err(KnowledgeError::SourceNotFound(root.to_path_buf()));
    }

    let mut documents = Vec::new();
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let entries = std::fs::read_dir(&dir).map_err(|source| KnowledgeError::Io {
            path: dir.clone(),
            source,
        })?;

        for entry in entries {
            let entry = entry.map_err(|source| KnowledgeError::Io {
                path: dir.clone(),
                source,
            })?;
            let path = entry.path();
            let Ok(file_type) = entry.file_type() else {
                continue;
            };

            if file_type.is_dir() {
                pending.push(path);
                continue;
            }
            if !file_type.is_file() || !filter.is_eligible(&path) {
                continue;
            }

            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            if size > filter.max_file_bytes() {
                tracing::warn!(path = %path.display(), size, "Skipping oversized document");
                continue;
            }

            match std::fs::read(&path) {
                Ok(bytes) => documents.push(SourceDocument {
                    id: document_id(root, &path),
                    content: String::from_utf8_lossy(&bytes).into_owned(),
                    path,
                }),
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable document"),
            }
        }
    }

    documents.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(documents)
}
