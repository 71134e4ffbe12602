use kgx_common::Stage;

use super::{current_version, StageExecutor};
use crate::collaborator::{CollaboratorResult, NormalizationRequest};
use crate::metadata::SourceMetadata;
use crate::registry::SourceEntry;

impl StageExecutor {
    pub(super) async fn run_normalize(
        &self,
        entry: &SourceEntry,
        metadata: &mut SourceMetadata,
    ) -> CollaboratorResult<()> {
        let version = current_version(metadata, Stage::Normalize)?;
        let paths = self.layout.source_paths(entry.id(), &version);

        let request = NormalizationRequest {
            source_id: entry.id().to_string(),
            source_nodes: paths.source_nodes,
            source_edges: paths.source_edges,
            nodes_output: paths.norm_nodes,
            edges_output: paths.norm_edges,
            node_failure_log: paths.norm_node_failures,
            edge_failure_log: paths.norm_edge_failures,
            strict_normalization: entry.strict_normalization(),
            has_sequence_variants: metadata.has_sequence_variants(),
            version,
        };

        let stats = self.normalizer.normalize(&request).await?;
        metadata.complete_normalization(stats);
        Ok(())
    }
}
