//! Configuration types.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level orchestrator configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Retry and revision limits.
    pub scheduler: SchedulerConfig,
    /// Manager/specialist delegation limits.
    pub delegation: DelegationConfig,
    /// Knowledge store sources and index location.
    pub knowledge: KnowledgeConfig,
    /// Embedding provider settings.
    pub embedding: EmbeddingConfig,
    /// Run log location.
    pub runlog: RunLogConfig,
}

/// Scheduler retry and revision settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Attempts per task revision, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub backoff_base_ms: u64,
    /// Upper bound on any retry delay.
    pub backoff_max_ms: u64,
    /// Gate revisions allowed per phase before the run fails.
    pub max_revisions_per_phase: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base_ms: 500,
            backoff_max_ms: 30_000,
            max_revisions_per_phase: 3,
        }
    }
}

impl SchedulerConfig {
    /// Delay before retrying after the given (1-based) failed attempt.
    ///
    /// `min(base * 2^(attempt - 1), max)`.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32);
        let delay = self
            .backoff_base_ms
            .saturating_mul(1u64 << exponent)
            .min(self.backoff_max_ms);
        Duration::from_millis(delay)
    }
}

/// Delegation settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DelegationConfig {
    /// Deepest level at which delegated children may run.
    pub max_depth: u32,
}

impl Default for DelegationConfig {
    fn default() -> Self {
        Self { max_depth: 2 }
    }
}

/// Knowledge store settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KnowledgeConfig {
    /// Directory scanned for source documents.
    pub source_dir: PathBuf,
    /// `SQLite` file holding hashes and embeddings.
    pub index_path: PathBuf,
    /// Watcher debounce window.
    pub debounce_ms: u64,
    /// File extensions (without dot) eligible for ingestion.
    pub allowed_extensions: Vec<String>,
    /// File names skipped regardless of extension, compared case-insensitively.
    pub ignored_filenames: Vec<String>,
    /// Files above this size are skipped.
    pub max_file_bytes: u64,
    /// Result count when a query does not specify one.
    pub default_k: usize,
    /// Maximum chunk length in characters.
    pub chunk_size: usize,
    /// Characters shared by consecutive chunks.
    pub chunk_overlap: usize,
}

impl Default for KnowledgeConfig {
    fn default() -> Self {
        Self {
            source_dir: PathBuf::from("./knowledge_base"),
            index_path: PathBuf::from("./rag_storage/index.db"),
            debounce_ms: 500,
            allowed_extensions: ["txt", "md", "json", "yaml", "yml"]
                .into_iter()
                .map(String::from)
                .collect(),
            ignored_filenames: vec!["readme.md".to_string(), "readme.txt".to_string()],
            max_file_bytes: 10 * 1024 * 1024,
            default_k: 5,
            chunk_size: 1000,
            chunk_overlap: 200,
        }
    }
}

impl KnowledgeConfig {
    /// Debounce window as a [`Duration`].
    #[must_use]
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

/// Embedding provider settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Embedding model name.
    #[serde(default = "default_model")]
    pub model: String,
    /// Base URL for the API.
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Environment variable name for the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
}

fn default_model() -> String {
    "embedding-001".to_string()
}

fn default_base_url() -> String {
    "https://generativelanguage.googleapis.com/v1beta".to_string()
}

fn default_api_key_env() -> String {
    "GEMINI_API_KEY".to_string()
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            base_url: default_base_url(),
            api_key_env: default_api_key_env(),
        }
    }
}

/// Run log settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunLogConfig {
    /// `SQLite` file holding run history and snapshots.
    pub path: PathBuf,
}

impl Default for RunLogConfig {
    fn default() -> Self {
        Self {
            path: default_runlog_path(),
        }
    }
}

/// Returns the default path for the run log database.
///
/// This is `~/.local/share/phaseflow/runs.db` on Unix systems.
#[must_use]
pub fn default_runlog_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("phaseflow")
        .join("runs.db")
}
