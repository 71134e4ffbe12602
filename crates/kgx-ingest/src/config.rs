//! Ingest configuration
//!
//! Two layers:
//! - [`IngestConfig`]: process settings from environment variables (and CLI
//!   overrides applied by the binary)
//! - [`SourcesConfig`]: the ordered list of data sources from a YAML file

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::error::{IngestError, Result};

/// Source ids become directory and file names
const SOURCE_ID_PATTERN: &str = r"^[A-Za-z0-9][A-Za-z0-9_.-]*$";

const DEFAULT_WORKER_THREADS: usize = 4;

// ============================================================================
// Scheduling mode
// ============================================================================

/// How the orchestrator dispatches eligible work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SchedulingMode {
    /// One (source, stage) at a time, all update work before any normalization
    #[default]
    Sequential,
    /// Each stage as a batch over a bounded worker pool
    Batch,
}

impl SchedulingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SchedulingMode::Sequential => "sequential",
            SchedulingMode::Batch => "batch",
        }
    }
}

impl std::fmt::Display for SchedulingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SchedulingMode {
    type Err = IngestError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sequential" | "serial" => Ok(SchedulingMode::Sequential),
            "batch" | "parallel" => Ok(SchedulingMode::Batch),
            _ => Err(IngestError::Config(format!(
                "Invalid scheduling mode: {s}. Must be 'sequential' or 'batch'"
            ))),
        }
    }
}

// ============================================================================
// Process configuration
// ============================================================================

/// Process level settings for an ingest run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Root directory for metadata and produced files
    pub storage: PathBuf,
    /// YAML file listing the data sources
    pub sources_config: PathBuf,
    /// Where the local loader finds raw source drops
    pub inbox: PathBuf,
    /// Pool size for batch mode
    pub worker_threads: usize,
    pub scheduling_mode: SchedulingMode,
    /// Re-attempt `Failed` updates even when the upstream version is unchanged
    pub retry_failed_updates: bool,
    /// Fail `InProgress` records older than this at startup (unset = never)
    pub in_progress_grace_secs: Option<u64>,
    /// Ask loaders for a small sample instead of the full data set
    pub test_mode: bool,
}

impl IngestConfig {
    /// Defaults for a storage root
    pub fn with_storage(storage: impl Into<PathBuf>) -> Self {
        let storage = storage.into();
        Self {
            sources_config: storage.join("sources.yml"),
            inbox: storage.join("inbox"),
            storage,
            worker_threads: DEFAULT_WORKER_THREADS,
            scheduling_mode: SchedulingMode::Sequential,
            retry_failed_updates: false,
            in_progress_grace_secs: None,
            test_mode: false,
        }
    }

    /// Load configuration from environment variables
    ///
    /// `KGX_STORAGE` is required.
    pub fn from_env() -> anyhow::Result<Self> {
        let storage = std::env::var("KGX_STORAGE")
            .map_err(|_| anyhow::anyhow!("KGX_STORAGE must be set"))?;
        Self::from_env_for(storage)
    }

    /// Load the remaining environment settings for an explicit storage root
    pub fn from_env_for(storage: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let mut config = Self::with_storage(storage);

        if let Ok(path) = std::env::var("KGX_SOURCES_CONFIG") {
            config.sources_config = PathBuf::from(path);
        }
        if let Ok(path) = std::env::var("KGX_INBOX") {
            config.inbox = PathBuf::from(path);
        }
        config.worker_threads = std::env::var("KGX_WORKER_THREADS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_WORKER_THREADS);
        if let Ok(mode) = std::env::var("KGX_SCHEDULING_MODE") {
            config.scheduling_mode = mode.parse()?;
        }
        config.retry_failed_updates = std::env::var("KGX_RETRY_FAILED_UPDATES")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(false);
        config.in_progress_grace_secs = std::env::var("KGX_IN_PROGRESS_GRACE_SECS")
            .ok()
            .and_then(|s| s.parse().ok());
        config.test_mode = std::env::var("KGX_TEST_MODE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(false);

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.storage.is_dir() {
            anyhow::bail!(
                "KGX_STORAGE must be an existing directory, got: {}",
                self.storage.display()
            );
        }
        if self.worker_threads == 0 {
            anyhow::bail!("KGX_WORKER_THREADS must be greater than 0");
        }
        Ok(())
    }

    pub fn in_progress_grace(&self) -> Option<chrono::Duration> {
        self.in_progress_grace_secs
            .and_then(|secs| i64::try_from(secs).ok())
            .and_then(chrono::Duration::try_seconds)
    }
}

// ============================================================================
// Data sources
// ============================================================================

fn default_true() -> bool {
    true
}

/// Per-source settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub id: String,

    /// Drop records whose identifiers cannot be normalized (default: true)
    #[serde(default = "default_true")]
    pub strict_normalization: bool,

    /// The source carries sequence variants that need supplementing (default: false)
    #[serde(default)]
    pub has_sequence_variants: bool,
}

impl SourceConfig {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            strict_normalization: true,
            has_sequence_variants: false,
        }
    }

    pub fn lenient(mut self) -> Self {
        self.strict_normalization = false;
        self
    }

    pub fn with_sequence_variants(mut self) -> Self {
        self.has_sequence_variants = true;
        self
    }
}

/// The sources file
///
/// ```yaml
/// data_sources:
///   - id: CTD
///   - id: HGNC
///     strict_normalization: false
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourcesConfig {
    pub data_sources: Vec<SourceConfig>,
}

impl SourcesConfig {
    /// Load and validate a sources file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(IngestError::Config(format!(
                "Sources file not found: {}",
                path.display()
            )));
        }

        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: SourcesConfig = serde_yaml::from_str(content)
            .map_err(|e| IngestError::Config(format!("Failed to parse YAML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.data_sources.is_empty() {
            return Err(IngestError::Config(
                "data_sources must list at least one source".to_string(),
            ));
        }

        let pattern = Regex::new(SOURCE_ID_PATTERN)
            .map_err(|e| IngestError::Config(format!("Invalid source id pattern: {e}")))?;
        let mut seen = HashSet::new();

        for source in &self.data_sources {
            if !pattern.is_match(&source.id) {
                return Err(IngestError::Config(format!(
                    "Invalid source id '{}': use letters, digits, '_', '.' or '-'",
                    source.id
                )));
            }
            if !seen.insert(source.id.as_str()) {
                return Err(IngestError::Config(format!(
                    "Duplicate source id '{}'",
                    source.id
                )));
            }
        }

        Ok(())
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.data_sources.iter().map(|s| s.id.as_str())
    }
}
