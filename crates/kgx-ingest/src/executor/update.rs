use kgx_common::Stage;
use tracing::{debug, info};

use super::{current_version, StageExecutor};
use crate::collaborator::{CollaboratorError, CollaboratorResult};
use crate::metadata::{SourceMetadata, VersionCheck};
use crate::registry::SourceEntry;

impl StageExecutor {
    /// Ask the loader which version to fetch when the scheduler did not
    ///
    /// A version that differs from the stored one is a new version: the prior
    /// metadata is archived and the stages start over before the update is
    /// marked in progress.
    pub(super) async fn resolve_update_version(
        &self,
        entry: &SourceEntry,
        metadata: &mut SourceMetadata,
    ) -> CollaboratorResult<String> {
        let version = entry.loader.get_latest_source_version().await?;

        if let Some(previous) = metadata
            .current_version()
            .filter(|v| *v != version)
            .map(str::to_string)
        {
            info!(
                source_id = entry.id(),
                %previous,
                latest = %version,
                "New upstream version"
            );
            self.store.archive(metadata).await.map_err(|e| {
                CollaboratorError::recoverable("Could not archive metadata").with_detail(e.to_string())
            })?;
            metadata.reset_for_new_version();
        }

        metadata.record_version_check(VersionCheck::found(&version));
        Ok(version)
    }

    /// Fetch the current version of the source into its source node/edge files
    pub(super) async fn run_update(
        &self,
        entry: &SourceEntry,
        metadata: &mut SourceMetadata,
    ) -> CollaboratorResult<()> {
        let version = current_version(metadata, Stage::Update)?;
        let paths = self.layout.source_paths(entry.id(), &version);
        debug!(
            source_id = entry.id(),
            %version,
            nodes = %paths.source_nodes.display(),
            "Loading source"
        );

        let info = entry
            .loader
            .load(&paths.source_nodes, &paths.source_edges)
            .await?;
        metadata.complete_update(version, info, entry.has_sequence_variants());
        Ok(())
    }
}
