//! Metadata persistence
//!
//! The [`MetadataStore`] is the durability boundary of the engine. The
//! orchestrator awaits a save after every status transition, so a crash loses
//! at most the transition in flight. Records are keyed by source id and writes
//! for different sources never touch the same file.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::error::StoreError;
use crate::metadata::SourceMetadata;
use crate::paths::StorageLayout;

/// Loads and persists [`SourceMetadata`] by source id
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Persisted state for `source_id`, or fresh metadata if none exists
    async fn load(&self, source_id: &str) -> Result<SourceMetadata, StoreError>;

    /// Atomically replace the stored record for `metadata.source_id()`
    async fn save(&self, metadata: &SourceMetadata) -> Result<(), StoreError>;

    /// Keep a snapshot of `metadata` before it is reset for a new version
    async fn archive(&self, metadata: &SourceMetadata) -> Result<(), StoreError>;
}

// ============================================================================
// File store
// ============================================================================

/// JSON files under the storage root, one per source
#[derive(Debug, Clone)]
pub struct FileMetadataStore {
    layout: StorageLayout,
}

impl FileMetadataStore {
    pub fn new(layout: StorageLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }
}

/// Write `bytes` to a sibling temp file, fsync it, then rename over `path`
async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| StoreError::io(parent, e))?;
    }

    let temp_path = path.with_extension("json.tmp");
    let mut file = tokio::fs::File::create(&temp_path)
        .await
        .map_err(|e| StoreError::io(&temp_path, e))?;
    file.write_all(bytes)
        .await
        .map_err(|e| StoreError::io(&temp_path, e))?;
    file.sync_all()
        .await
        .map_err(|e| StoreError::io(&temp_path, e))?;
    drop(file);

    tokio::fs::rename(&temp_path, path)
        .await
        .map_err(|e| StoreError::io(path, e))
}

fn to_json(metadata: &SourceMetadata) -> Result<Vec<u8>, StoreError> {
    serde_json::to_vec_pretty(metadata).map_err(|e| StoreError::Corrupt {
        source_id: metadata.source_id().to_string(),
        message: e.to_string(),
    })
}

#[async_trait]
impl MetadataStore for FileMetadataStore {
    async fn load(&self, source_id: &str) -> Result<SourceMetadata, StoreError> {
        let path = self.layout.metadata_path(source_id);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(source_id, "No stored metadata, starting fresh");
                return Ok(SourceMetadata::new(source_id));
            }
            Err(e) => return Err(StoreError::io(&path, e)),
        };

        let metadata: SourceMetadata =
            serde_json::from_slice(&bytes).map_err(|e| StoreError::Corrupt {
                source_id: source_id.to_string(),
                message: e.to_string(),
            })?;

        if metadata.source_id() != source_id {
            return Err(StoreError::Corrupt {
                source_id: source_id.to_string(),
                message: format!("record belongs to {}", metadata.source_id()),
            });
        }

        Ok(metadata)
    }

    async fn save(&self, metadata: &SourceMetadata) -> Result<(), StoreError> {
        let path = self.layout.metadata_path(metadata.source_id());
        write_atomic(&path, &to_json(metadata)?).await
    }

    async fn archive(&self, metadata: &SourceMetadata) -> Result<(), StoreError> {
        let path = self.layout.archive_path(
            metadata.source_id(),
            metadata.current_version(),
            Utc::now(),
        );
        write_atomic(&path, &to_json(metadata)?).await?;
        debug!(
            source_id = metadata.source_id(),
            path = %path.display(),
            "Archived metadata"
        );
        Ok(())
    }
}

// ============================================================================
// In-memory store
// ============================================================================

#[derive(Debug, Default)]
struct MemoryState {
    records: HashMap<String, SourceMetadata>,
    history: Vec<SourceMetadata>,
    archives: Vec<SourceMetadata>,
    failing_loads: HashSet<String>,
    failing_saves: HashSet<String>,
    failing_archives: HashSet<String>,
}

/// Store that keeps everything in memory
///
/// Meant for tests. Every successful save is also appended to an unbounded
/// history so callers can inspect the sequence of persisted transitions, and
/// failures can be injected per source.
#[derive(Debug, Default)]
pub struct MemoryMetadataStore {
    state: Mutex<MemoryState>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Seed a stored record
    pub fn insert(&self, metadata: SourceMetadata) {
        self.state()
            .records
            .insert(metadata.source_id().to_string(), metadata);
    }

    pub fn fail_loads_for(&self, source_id: &str) {
        self.state().failing_loads.insert(source_id.to_string());
    }

    pub fn fail_saves_for(&self, source_id: &str) {
        self.state().failing_saves.insert(source_id.to_string());
    }

    pub fn fail_archives_for(&self, source_id: &str) {
        self.state().failing_archives.insert(source_id.to_string());
    }

    pub fn clear_failures(&self) {
        let mut state = self.state();
        state.failing_loads.clear();
        state.failing_saves.clear();
        state.failing_archives.clear();
    }

    /// The currently stored record
    pub fn get(&self, source_id: &str) -> Option<SourceMetadata> {
        self.state().records.get(source_id).cloned()
    }

    /// Every record saved for `source_id`, oldest first
    pub fn history(&self, source_id: &str) -> Vec<SourceMetadata> {
        self.state()
            .history
            .iter()
            .filter(|m| m.source_id() == source_id)
            .cloned()
            .collect()
    }

    pub fn archived(&self, source_id: &str) -> Vec<SourceMetadata> {
        self.state()
            .archives
            .iter()
            .filter(|m| m.source_id() == source_id)
            .cloned()
            .collect()
    }

    pub fn save_count(&self) -> usize {
        self.state().history.len()
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn load(&self, source_id: &str) -> Result<SourceMetadata, StoreError> {
        let state = self.state();
        if state.failing_loads.contains(source_id) {
            return Err(StoreError::Unavailable(source_id.to_string()));
        }
        Ok(state
            .records
            .get(source_id)
            .cloned()
            .unwrap_or_else(|| SourceMetadata::new(source_id)))
    }

    async fn save(&self, metadata: &SourceMetadata) -> Result<(), StoreError> {
        let mut state = self.state();
        if state.failing_saves.contains(metadata.source_id()) {
            return Err(StoreError::Unavailable(metadata.source_id().to_string()));
        }
        state.history.push(metadata.clone());
        state
            .records
            .insert(metadata.source_id().to_string(), metadata.clone());
        Ok(())
    }

    async fn archive(&self, metadata: &SourceMetadata) -> Result<(), StoreError> {
        let mut state = self.state();
        if state.failing_archives.contains(metadata.source_id()) {
            return Err(StoreError::Unavailable(metadata.source_id().to_string()));
        }
        state.archives.push(metadata.clone());
        Ok(())
    }
}
