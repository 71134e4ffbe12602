//! Storage layout
//!
//! Every file the engine or a collaborator writes lives under one storage
//! root, in a directory per source:
//!
//! ```text
//! <root>/<source_id>/<source_id>.meta.json
//! <root>/<source_id>/<source_id>_<version>_source_nodes.json
//! <root>/<source_id>/<source_id>_<version>_norm_nodes.json
//! <root>/<source_id>/archive/<source_id>_<version>_<timestamp>.json
//! ```

use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};

const METADATA_SUFFIX: &str = "meta.json";
const ARCHIVE_DIR: &str = "archive";
const UNVERSIONED: &str = "unversioned";

/// Replace characters that are unsafe in file names with `_`
///
/// Allowed characters are ASCII letters, digits, `_`, `.` and `-`.
pub fn sanitize_version(version: &str) -> String {
    let sanitized: String = version
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();

    if sanitized.is_empty() {
        UNVERSIONED.to_string()
    } else {
        sanitized
    }
}

/// Paths derived from the storage root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageLayout {
    root: PathBuf,
}

impl StorageLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn source_dir(&self, source_id: &str) -> PathBuf {
        self.root.join(source_id)
    }

    pub fn archive_dir(&self, source_id: &str) -> PathBuf {
        self.source_dir(source_id).join(ARCHIVE_DIR)
    }

    pub fn metadata_path(&self, source_id: &str) -> PathBuf {
        self.source_dir(source_id)
            .join(format!("{source_id}.{METADATA_SUFFIX}"))
    }

    /// Destination of an archived metadata snapshot
    pub fn archive_path(
        &self,
        source_id: &str,
        version: Option<&str>,
        archived_at: DateTime<Utc>,
    ) -> PathBuf {
        let version = version.map(sanitize_version);
        let version = version.as_deref().unwrap_or(UNVERSIONED);
        let stamp = archived_at.format("%Y%m%dT%H%M%S%.6fZ");
        self.archive_dir(source_id)
            .join(format!("{source_id}_{version}_{stamp}.json"))
    }

    pub fn source_paths(&self, source_id: &str, version: &str) -> SourcePaths {
        SourcePaths::new(&self.source_dir(source_id), source_id, version)
    }

    /// Create the source directory and its archive directory
    pub async fn ensure_source_dirs(&self, source_id: &str) -> std::io::Result<()> {
        tokio::fs::create_dir_all(self.archive_dir(source_id)).await
    }
}

/// Artifact paths for one (source, version)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourcePaths {
    pub source_nodes: PathBuf,
    pub source_edges: PathBuf,
    pub norm_nodes: PathBuf,
    pub norm_edges: PathBuf,
    pub norm_node_failures: PathBuf,
    pub norm_edge_failures: PathBuf,
    pub supp_nodes: PathBuf,
    pub supp_edges: PathBuf,
    pub norm_supp_nodes: PathBuf,
    pub norm_supp_edges: PathBuf,
    pub norm_supp_node_failures: PathBuf,
    pub norm_supp_edge_failures: PathBuf,
}

impl SourcePaths {
    fn new(dir: &Path, source_id: &str, version: &str) -> Self {
        let prefix = format!("{}_{}", source_id, sanitize_version(version));
        let file = |suffix: &str| dir.join(format!("{prefix}_{suffix}"));

        Self {
            source_nodes: file("source_nodes.json"),
            source_edges: file("source_edges.json"),
            norm_nodes: file("norm_nodes.json"),
            norm_edges: file("norm_edges.json"),
            norm_node_failures: file("norm_node_failures.log"),
            norm_edge_failures: file("norm_edge_failures.log"),
            supp_nodes: file("supp_nodes.json"),
            supp_edges: file("supp_edges.json"),
            norm_supp_nodes: file("norm_supp_nodes.json"),
            norm_supp_edges: file("norm_supp_edges.json"),
            norm_supp_node_failures: file("norm_supp_node_failures.log"),
            norm_supp_edge_failures: file("norm_supp_edge_failures.log"),
        }
    }
}
