//! Error types for the ingest orchestrator

use kgx_common::{KgxError, Stage};
use thiserror::Error;

/// Failure of the metadata persistence layer
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error for {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt metadata for {source_id}: {message}")]
    Corrupt { source_id: String, message: String },

    #[error("Metadata for {0} is unavailable")]
    Unavailable(String),
}

impl StoreError {
    pub(crate) fn io(path: impl AsRef<std::path::Path>, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.as_ref().display().to_string(),
            source,
        }
    }
}

/// Errors that stop an ingest run
#[derive(Error, Debug)]
pub enum IngestError {
    /// A collaborator failed in a way it did not classify, or the orchestrator
    /// found itself in a state that should be impossible
    #[error("Defect in {stage} for {source_id}: {message}")]
    Defect {
        source_id: String,
        stage: Stage,
        message: String,
    },

    #[error("Version check for {source_id} hit a defect: {message}")]
    VersionCheckDefect { source_id: String, message: String },

    #[error("Unknown data source: {0}")]
    UnknownSource(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Common(#[from] KgxError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl IngestError {
    /// True for the errors that mean a collaborator or the engine misbehaved
    pub fn is_defect(&self) -> bool {
        matches!(
            self,
            IngestError::Defect { .. } | IngestError::VersionCheckDefect { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, IngestError>;
