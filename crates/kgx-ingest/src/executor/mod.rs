//! Stage executors
//!
//! Every stage runs through the same protocol:
//!
//! 1. mark the stage `InProgress` and persist it
//! 2. invoke the collaborator
//! 3. apply the result and persist it
//!
//! Classified collaborator errors become `Failed` (recoverable) or `Broken`
//! (unrecoverable) and never leave this module. A defect is recorded as
//! `Failed` and then returned so the run stops.

mod normalize;
mod supplement;
mod update;

use std::sync::Arc;
use tracing::{error, info, warn};

use kgx_common::Stage;

use crate::collaborator::{CollaboratorError, CollaboratorResult, ErrorKind, Normalizer, Supplementer};
use crate::error::{IngestError, Result};
use crate::metadata::SourceMetadata;
use crate::paths::StorageLayout;
use crate::registry::SourceEntry;
use crate::store::MetadataStore;

/// Terminal result of one stage execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageOutcome {
    Succeeded,
    /// Recoverable error, or the transition could not be persisted
    Failed,
    Broken,
}

/// Runs single (source, stage) work items against the collaborators
pub struct StageExecutor {
    store: Arc<dyn MetadataStore>,
    layout: StorageLayout,
    normalizer: Arc<dyn Normalizer>,
    supplementer: Arc<dyn Supplementer>,
}

impl StageExecutor {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        layout: StorageLayout,
        normalizer: Arc<dyn Normalizer>,
        supplementer: Arc<dyn Supplementer>,
    ) -> Self {
        Self {
            store,
            layout,
            normalizer,
            supplementer,
        }
    }

    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    /// Run `stage` for `entry`, applying every transition to `metadata`
    ///
    /// `known_version` is the upstream version already discovered by the
    /// scheduler for this run; the update stage asks the loader when it is
    /// `None`, before anything is persisted. Only defects are returned as
    /// errors.
    pub async fn execute(
        &self,
        stage: Stage,
        entry: &SourceEntry,
        metadata: &mut SourceMetadata,
        known_version: Option<String>,
    ) -> Result<StageOutcome> {
        let source_id = entry.id();
        let version = match (stage, known_version) {
            (Stage::Update, None) => match self.resolve_update_version(entry, metadata).await {
                Ok(version) => Some(version),
                Err(err) => {
                    let outcome = self.apply_error(stage, entry, metadata, err).await?;
                    return Ok(self.finish(stage, metadata, outcome).await);
                }
            },
            (_, version) => version,
        };

        metadata.begin_stage(stage, version);
        info!(
            source_id,
            %stage,
            version = metadata.stage(stage).version().unwrap_or("unknown"),
            "Stage started"
        );

        if let Err(e) = self.store.save(metadata).await {
            warn!(source_id, %stage, error = %e, "Could not persist stage start");
            return Ok(self.persist_failure(stage, metadata, e).await);
        }

        let result = match stage {
            Stage::Update => self.run_update(entry, metadata).await,
            Stage::Normalize => self.run_normalize(entry, metadata).await,
            Stage::Supplement => self.run_supplement(entry, metadata).await,
        };

        let outcome = match result {
            Ok(()) => StageOutcome::Succeeded,
            Err(err) => self.apply_error(stage, entry, metadata, err).await?,
        };

        Ok(self.finish(stage, metadata, outcome).await)
    }

    /// Persist the result of a stage and log it
    async fn finish(&self, stage: Stage, metadata: &mut SourceMetadata, outcome: StageOutcome) -> StageOutcome {
        let source_id = metadata.source_id().to_string();
        if let Err(e) = self.store.save(metadata).await {
            warn!(%source_id, %stage, error = %e, "Could not persist stage result");
            return self.persist_failure(stage, metadata, e).await;
        }

        match outcome {
            StageOutcome::Succeeded => info!(
                %source_id,
                %stage,
                version = metadata.current_version().unwrap_or("unknown"),
                "Stage complete"
            ),
            StageOutcome::Failed | StageOutcome::Broken => warn!(
                %source_id,
                %stage,
                status = %metadata.status(stage),
                error = metadata.stage(stage).error_message().unwrap_or(""),
                "Stage did not complete"
            ),
        }

        outcome
    }

    async fn apply_error(
        &self,
        stage: Stage,
        entry: &SourceEntry,
        metadata: &mut SourceMetadata,
        err: CollaboratorError,
    ) -> Result<StageOutcome> {
        let message = err.to_string();
        match err.kind {
            ErrorKind::Recoverable => {
                metadata.fail_stage(stage, message);
                Ok(StageOutcome::Failed)
            }
            ErrorKind::Unrecoverable => {
                metadata.break_stage(stage, message);
                Ok(StageOutcome::Broken)
            }
            ErrorKind::Defect => {
                error!(source_id = entry.id(), %stage, error = %message, "Collaborator defect");
                metadata.fail_stage(stage, message.clone());
                if let Err(e) = self.store.save(metadata).await {
                    error!(source_id = entry.id(), %stage, error = %e, "Could not persist defect");
                }
                Err(IngestError::Defect {
                    source_id: entry.id().to_string(),
                    stage,
                    message,
                })
            }
        }
    }

    /// The store rejected a write: record the stage as failed and try once more
    async fn persist_failure(
        &self,
        stage: Stage,
        metadata: &mut SourceMetadata,
        cause: impl std::fmt::Display,
    ) -> StageOutcome {
        metadata.fail_stage(stage, format!("failed to persist metadata: {cause}"));
        if let Err(e) = self.store.save(metadata).await {
            warn!(
                source_id = metadata.source_id(),
                %stage,
                error = %e,
                "Failure status not persisted; will be retried on the next run"
            );
        }
        StageOutcome::Failed
    }
}

/// Version the downstream stages run against
fn current_version(metadata: &SourceMetadata, stage: Stage) -> CollaboratorResult<String> {
    metadata
        .current_version()
        .map(str::to_string)
        .ok_or_else(|| CollaboratorError::defect(format!("{stage} dispatched without a current version")))
}
