//! Configuration file loader.

use std::path::{Path, PathBuf};

use super::types::OrchestratorConfig;

/// Overrides `knowledge.source_dir`.
pub const KNOWLEDGE_BASE_PATH_ENV: &str = "KNOWLEDGE_BASE_PATH";
/// Overrides the directory holding `knowledge.index_path`.
pub const RAG_STORAGE_PATH_ENV: &str = "RAG_STORAGE_PATH";
/// Overrides `runlog.path`.
pub const RUNLOG_PATH_ENV: &str = "PHASEFLOW_RUNLOG_PATH";

/// Configuration loader that searches multiple locations.
#[derive(Debug)]
pub struct ConfigLoader {
    /// Search paths in order of priority.
    search_paths: Vec<PathBuf>,
}

impl ConfigLoader {
    /// Create a new config loader with default search paths.
    #[must_use]
    pub fn new() -> Self {
        let mut search_paths = vec![PathBuf::from(".phaseflow.toml")];

        if let Some(config_dir) = dirs::config_dir() {
            search_paths.push(config_dir.join("phaseflow").join("config.toml"));
        }

        Self { search_paths }
    }

    /// Create a config loader with a specific config file path.
    #[must_use]
    pub fn with_path(path: PathBuf) -> Self {
        Self {
            search_paths: vec![path],
        }
    }

    /// Load configuration from the first available file, or return defaults.
    ///
    /// Environment overrides are applied on top of whichever source was used.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed.
    pub fn load(&self) -> Result<OrchestratorConfig, ConfigError> {
        let mut config = match self.find_config_file() {
            Some(path) => {
                tracing::debug!(path = %path.display(), "Loading config file");
                Self::load_from_path(&path)?
            }
            None => {
                tracing::debug!("No config file found, using defaults");
                OrchestratorConfig::default()
            }
        };
        apply_env_overrides(&mut config, |key| std::env::var(key).ok());
        Ok(config)
    }

    fn load_from_path(path: &Path) -> Result<OrchestratorConfig, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Get the search paths for debugging.
    #[must_use]
    pub fn search_paths(&self) -> &[PathBuf] {
        &self.search_paths
    }

    /// Find the first config file that exists.
    #[must_use]
    pub fn find_config_file(&self) -> Option<PathBuf> {
        self.search_paths.iter().find(|p| p.exists()).cloned()
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Apply path overrides looked up through `var`.
///
/// `RAG_STORAGE_PATH` names a directory; the index file name is kept.
pub fn apply_env_overrides<F>(config: &mut OrchestratorConfig, var: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(dir) = var(KNOWLEDGE_BASE_PATH_ENV) {
        config.knowledge.source_dir = PathBuf::from(dir);
    }
    if let Some(dir) = var(RAG_STORAGE_PATH_ENV) {
        let file_name = config
            .knowledge
            .index_path
            .file_name()
            .map_or_else(|| PathBuf::from("index.db"), PathBuf::from);
        config.knowledge.index_path = PathBuf::from(dir).join(file_name);
    }
    if let Some(path) = var(RUNLOG_PATH_ENV) {
        config.runlog.path = PathBuf::from(path);
    }
}

/// Errors that can occur during configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    ReadError {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    ParseError {
        path: PathBuf,
        source: toml::de::Error,
    },
}
