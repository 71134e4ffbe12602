use kgx_common::Stage;
use tracing::info;

use super::{current_version, StageExecutor};
use crate::collaborator::{CollaboratorResult, SupplementationRequest, SupplementationStats};
use crate::metadata::SourceMetadata;
use crate::registry::SourceEntry;

impl StageExecutor {
    /// Supplement sequence variant nodes; sources without variants complete
    /// immediately with empty statistics
    pub(super) async fn run_supplement(
        &self,
        entry: &SourceEntry,
        metadata: &mut SourceMetadata,
    ) -> CollaboratorResult<()> {
        if !metadata.has_sequence_variants() {
            info!(source_id = entry.id(), "No sequence variants, nothing to supplement");
            metadata.complete_supplementation(SupplementationStats::default());
            return Ok(());
        }

        let version = current_version(metadata, Stage::Supplement)?;
        let paths = self.layout.source_paths(entry.id(), &version);

        let request = SupplementationRequest {
            source_id: entry.id().to_string(),
            normalized_nodes: paths.norm_nodes,
            nodes_output: paths.supp_nodes,
            edges_output: paths.supp_edges,
            normalized_nodes_output: paths.norm_supp_nodes,
            normalized_edges_output: paths.norm_supp_edges,
            node_failure_log: paths.norm_supp_node_failures,
            edge_failure_log: paths.norm_supp_edge_failures,
            strict_normalization: entry.strict_normalization(),
            version,
        };

        let stats = self.supplementer.supplement(&request).await?;
        metadata.complete_supplementation(stats);
        Ok(())
    }
}
