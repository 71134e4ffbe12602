//! Collaborator traits for the three processing stages
//!
//! The orchestrator never fetches, parses or normalizes anything itself. Each
//! stage hands its inputs to a collaborator and turns the classified result
//! into a status transition. Implement these traits for real data sources;
//! [`local`] holds a small file based set used by the binary and the tests.

pub mod error;
pub mod local;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub use error::{CollaboratorError, CollaboratorResult, ErrorKind};

/// Free-form extra values a collaborator wants recorded with its result
pub type Details = BTreeMap<String, serde_json::Value>;

/// Summary returned by a successful load
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoadResultMetadata {
    pub node_count: u64,
    pub edge_count: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub details: Details,
}

/// Summary returned by a successful normalization
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NormalizationStats {
    pub nodes_normalized: u64,
    pub nodes_failed: u64,
    pub edges_normalized: u64,
    pub edges_failed: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub details: Details,
}

/// Summary returned by a successful supplementation
///
/// The default value is what a source without sequence variants records.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SupplementationStats {
    pub nodes_added: u64,
    pub edges_added: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub details: Details,
}

impl SupplementationStats {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

/// Everything a normalizer needs for one source version
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizationRequest {
    pub source_id: String,
    pub version: String,
    pub source_nodes: PathBuf,
    pub source_edges: PathBuf,
    pub nodes_output: PathBuf,
    pub edges_output: PathBuf,
    pub node_failure_log: PathBuf,
    pub edge_failure_log: PathBuf,
    pub strict_normalization: bool,
    pub has_sequence_variants: bool,
}

/// Everything a supplementer needs for one source version
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupplementationRequest {
    pub source_id: String,
    pub version: String,
    pub normalized_nodes: PathBuf,
    pub nodes_output: PathBuf,
    pub edges_output: PathBuf,
    pub normalized_nodes_output: PathBuf,
    pub normalized_edges_output: PathBuf,
    pub node_failure_log: PathBuf,
    pub edge_failure_log: PathBuf,
    pub strict_normalization: bool,
}

/// Fetches and parses one data source into KGX node/edge files
#[async_trait]
pub trait SourceLoader: Send + Sync {
    /// Ask the upstream provider for its newest data version
    async fn get_latest_source_version(&self) -> CollaboratorResult<String>;

    /// Write the newest version's nodes and edges to the given paths
    async fn load(&self, nodes_output: &Path, edges_output: &Path)
        -> CollaboratorResult<LoadResultMetadata>;

    /// Whether the loaded data contains sequence variants that need supplementing
    fn has_sequence_variants(&self) -> bool {
        false
    }
}

/// Rewrites identifiers in loaded files into canonical form
#[async_trait]
pub trait Normalizer: Send + Sync {
    /// Normalize the source files, writing unresolvable records to the failure logs
    async fn normalize(&self, request: &NormalizationRequest)
        -> CollaboratorResult<NormalizationStats>;
}

/// Derives additional records from normalized sequence variant nodes
#[async_trait]
pub trait Supplementer: Send + Sync {
    async fn supplement(
        &self,
        request: &SupplementationRequest,
    ) -> CollaboratorResult<SupplementationStats>;
}
