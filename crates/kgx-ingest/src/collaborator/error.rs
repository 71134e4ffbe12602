//! Classified collaborator failures

use serde::{Deserialize, Serialize};
use std::fmt;

/// How a collaborator failure affects the stage that invoked it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Transient; the stage is marked `Failed` and retried on a later pass
    Recoverable,
    /// Structural; the stage is marked `Broken` until an operator resets it
    Unrecoverable,
    /// A bug in the collaborator; recorded and then stops the run
    Defect,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Recoverable => "recoverable",
            ErrorKind::Unrecoverable => "unrecoverable",
            ErrorKind::Defect => "defect",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned by loaders, normalizers and supplementers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollaboratorError {
    pub kind: ErrorKind,
    pub message: String,
    pub detail: Option<String>,
}

impl CollaboratorError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            detail: None,
        }
    }

    pub fn recoverable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Recoverable, message)
    }

    pub fn unrecoverable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unrecoverable, message)
    }

    pub fn defect(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Defect, message)
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

impl fmt::Display for CollaboratorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.detail {
            Some(detail) => write!(f, "{} - {}", self.message, detail),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for CollaboratorError {}

pub type CollaboratorResult<T> = std::result::Result<T, CollaboratorError>;
