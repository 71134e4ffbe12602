//! KGX Ingest Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Orchestrates biomedical data sources through three stages: update
//! (fetch and parse into KGX node/edge files), normalize and supplement.
//! Per-source, per-stage status is persisted after every transition so an
//! interrupted run resumes where it stopped.
//!
//! # Components
//!
//! - [`metadata::SourceMetadata`]: status records of one source
//! - [`store::MetadataStore`]: durable load/save of metadata
//! - [`registry::SourceRegistry`]: ordered sources and their loaders
//! - [`executor::StageExecutor`]: runs one (source, stage) against its collaborator
//! - [`orchestrator::Orchestrator`]: selects and dispatches eligible work
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use kgx_ingest::collaborator::local::{LocalFileLoader, NullSupplementer, PassthroughNormalizer};
//! use kgx_ingest::collaborator::SourceLoader;
//! use kgx_ingest::config::{SourceConfig, SourcesConfig};
//! use kgx_ingest::executor::StageExecutor;
//! use kgx_ingest::orchestrator::{Orchestrator, SchedulerSettings};
//! use kgx_ingest::paths::StorageLayout;
//! use kgx_ingest::registry::SourceRegistry;
//! use kgx_ingest::store::FileMetadataStore;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let layout = StorageLayout::new("./storage");
//!     let sources = SourcesConfig {
//!         data_sources: vec![SourceConfig::new("CTD")],
//!     };
//!     let registry = SourceRegistry::from_config(&sources, |source| {
//!         Arc::new(LocalFileLoader::new(std::path::Path::new("./inbox"), &source.id))
//!             as Arc<dyn SourceLoader>
//!     })?;
//!
//!     let store = Arc::new(FileMetadataStore::new(layout.clone()));
//!     let executor = StageExecutor::new(
//!         store.clone(),
//!         layout,
//!         Arc::new(PassthroughNormalizer::new()),
//!         Arc::new(NullSupplementer::new()),
//!     );
//!
//!     let mut orchestrator =
//!         Orchestrator::new(registry, store, Arc::new(executor), SchedulerSettings::default());
//!     let report = orchestrator.run().await?;
//!     println!("dispatched {} work items", report.total_dispatched());
//!     Ok(())
//! }
//! ```

pub mod collaborator;
pub mod config;
pub mod error;
pub mod executor;
pub mod metadata;
pub mod orchestrator;
pub mod paths;
pub mod registry;
pub mod store;

pub use error::{IngestError, Result, StoreError};
