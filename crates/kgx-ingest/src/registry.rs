//! Source registry
//!
//! The ordered set of active data sources for a run, each paired with the
//! loader that fetches it. Built once and handed to the orchestrator; the scan
//! order of every stage is the registration order.

use std::fmt;
use std::sync::Arc;

use crate::collaborator::SourceLoader;
use crate::config::{SourceConfig, SourcesConfig};
use crate::error::{IngestError, Result};

/// One registered data source
#[derive(Clone)]
pub struct SourceEntry {
    pub config: SourceConfig,
    pub loader: Arc<dyn SourceLoader>,
}

impl SourceEntry {
    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn strict_normalization(&self) -> bool {
        self.config.strict_normalization
    }

    /// Configured flag combined with what the loader reports
    pub fn has_sequence_variants(&self) -> bool {
        self.config.has_sequence_variants || self.loader.has_sequence_variants()
    }
}

impl fmt::Debug for SourceEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceEntry")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Ordered, immutable-after-build list of sources
#[derive(Debug, Clone, Default)]
pub struct SourceRegistry {
    entries: Vec<SourceEntry>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from a sources file, asking `make_loader` for each loader
    pub fn from_config<F>(config: &SourcesConfig, mut make_loader: F) -> Result<Self>
    where
        F: FnMut(&SourceConfig) -> Arc<dyn SourceLoader>,
    {
        let mut registry = Self::new();
        for source in &config.data_sources {
            let loader = make_loader(source);
            registry.register(source.clone(), loader)?;
        }
        Ok(registry)
    }

    /// Append a source; ids must be unique
    pub fn register(&mut self, config: SourceConfig, loader: Arc<dyn SourceLoader>) -> Result<()> {
        if self.get(&config.id).is_some() {
            return Err(IngestError::Config(format!(
                "Source '{}' is registered twice",
                config.id
            )));
        }
        self.entries.push(SourceEntry { config, loader });
        Ok(())
    }

    /// Builder form of [`register`](Self::register)
    pub fn with_source(mut self, config: SourceConfig, loader: Arc<dyn SourceLoader>) -> Result<Self> {
        self.register(config, loader)?;
        Ok(self)
    }

    pub fn get(&self, source_id: &str) -> Option<&SourceEntry> {
        self.entries.iter().find(|entry| entry.id() == source_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SourceEntry> {
        self.entries.iter()
    }

    pub fn ids(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.id().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Narrow the registry to a single source
    pub fn only(self, source_id: &str) -> Result<Self> {
        let entries: Vec<_> = self
            .entries
            .into_iter()
            .filter(|entry| entry.id() == source_id)
            .collect();

        if entries.is_empty() {
            return Err(IngestError::UnknownSource(source_id.to_string()));
        }
        Ok(Self { entries })
    }
}
