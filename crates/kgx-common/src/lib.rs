//! KGX Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared types, utilities, and error handling for the KGX ingest workspace.
//!
//! # Overview
//!
//! - **Error Handling**: [`KgxError`] and the crate-wide [`Result`] alias
//! - **Status Model**: per-source, per-stage status records ([`types`])
//! - **Checksums**: integrity digests for produced KGX files
//! - **Logging**: `tracing` subscriber setup driven by [`logging::LogConfig`]
//!
//! # Example
//!
//! ```no_run
//! use kgx_common::types::{Stage, StatusRecord};
//!
//! let mut record = StatusRecord::not_started();
//! record.start(Some("2024-01-01".to_string()));
//! record.succeed(Some("2024-01-01".to_string()));
//! assert!(record.is_stable());
//! assert_eq!(Stage::Update.downstream(), Some(Stage::Normalize));
//! ```

pub mod checksum;
pub mod error;
pub mod logging;
pub mod types;

// Re-export commonly used types
pub use error::{KgxError, Result};
pub use types::{Stage, Status, StatusRecord};
