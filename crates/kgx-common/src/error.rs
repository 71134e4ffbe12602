//! Error types shared across the KGX ingest crates

use thiserror::Error;

/// Result type alias for common operations
pub type Result<T> = std::result::Result<T, KgxError>;

/// Main error type for shared functionality
#[derive(Error, Debug)]
pub enum KgxError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Checksum mismatch for {path}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("Invalid stage: {0}")]
    InvalidStage(String),

    #[error("Invalid status: {0}")]
    InvalidStatus(String),

    #[error("Parse error: {0}")]
    Parse(String),
}
