//! Work selection
//!
//! Decides whether a (source, stage) pair should be dispatched. Update
//! eligibility can require asking the loader for its newest version; the
//! answer is remembered for the rest of the run and handed to the executor.

use kgx_common::{Stage, Status};
use tracing::{debug, info, warn};

use super::{Orchestrator, RunState};
use crate::collaborator::ErrorKind;
use crate::error::{IngestError, Result};
use crate::metadata::{SourceMetadata, VersionCheck};

/// A dispatchable (source, stage) pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub source_id: String,
    pub stage: Stage,
    /// Upstream version discovered while selecting an update
    pub known_version: Option<String>,
}

/// What the update status alone says about eligibility
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UpdateCheck {
    Eligible,
    /// Eligible only if the loader reports a different version
    CheckVersion,
    Never,
}

/// `interrupted` marks a failure left by reconciliation, which is always
/// retried
pub(crate) fn update_check(status: Status, retry_failed_updates: bool, interrupted: bool) -> UpdateCheck {
    match status {
        Status::NotStarted | Status::WaitingOnDependency => UpdateCheck::Eligible,
        Status::InProgress => UpdateCheck::Never,
        Status::Failed if retry_failed_updates || interrupted => UpdateCheck::Eligible,
        Status::Stable | Status::Failed | Status::Broken => UpdateCheck::CheckVersion,
    }
}

/// Normalize and supplement run once their upstream stage is stable
pub(crate) fn downstream_eligible(metadata: &SourceMetadata, stage: Stage) -> bool {
    let Some(upstream) = stage.upstream() else {
        return false;
    };
    metadata.stage(upstream).is_stable()
        && matches!(
            metadata.status(stage),
            Status::NotStarted | Status::WaitingOnDependency | Status::Failed
        )
}

impl Orchestrator {
    /// First eligible work item, update work before normalization before
    /// supplementation, sources in registry order
    pub(super) async fn find_work(&mut self, run: &mut RunState) -> Result<Option<WorkItem>> {
        for stage in Stage::ALL {
            for source_id in self.active.clone() {
                if let Some(item) = self.select(stage, &source_id, run).await? {
                    return Ok(Some(item));
                }
            }
        }
        Ok(None)
    }

    /// Eligible work for `stage` on `source_id`, if any
    ///
    /// Each pair is dispatched at most once per run; a failed stage waits for
    /// the next run.
    pub(super) async fn select(
        &mut self,
        stage: Stage,
        source_id: &str,
        run: &mut RunState,
    ) -> Result<Option<WorkItem>> {
        if run.was_attempted(source_id, stage) {
            return Ok(None);
        }
        let Some(metadata) = self.metadata.get(source_id) else {
            return Ok(None);
        };

        let known_version = match stage {
            Stage::Update => {
                let check = update_check(
                    metadata.status(Stage::Update),
                    self.settings.retry_failed_updates,
                    metadata.was_interrupted(Stage::Update),
                );
                match check {
                    UpdateCheck::Never => return Ok(None),
                    UpdateCheck::Eligible => run.pending_versions.get(source_id).cloned(),
                    UpdateCheck::CheckVersion => {
                        match self.check_for_new_version(source_id, run).await? {
                            Some(version) => Some(version),
                            None => return Ok(None),
                        }
                    }
                }
            }
            Stage::Normalize | Stage::Supplement => {
                if !downstream_eligible(metadata, stage) {
                    return Ok(None);
                }
                None
            }
        };

        Ok(Some(WorkItem {
            source_id: source_id.to_string(),
            stage,
            known_version,
        }))
    }

    /// Ask the loader for its newest version and archive on change
    ///
    /// Returns the new version when the source should be updated. A classified
    /// failure means "no update this run"; a defect stops the run.
    async fn check_for_new_version(
        &mut self,
        source_id: &str,
        run: &mut RunState,
    ) -> Result<Option<String>> {
        if !run.version_checked.insert(source_id.to_string()) {
            return Ok(None);
        }
        let Some(entry) = self.registry.get(source_id).cloned() else {
            return Ok(None);
        };
        run.report.version_checks += 1;

        let latest = entry.loader.get_latest_source_version().await;
        let store = self.store.clone();
        let Some(metadata) = self.metadata.get_mut(source_id) else {
            return Ok(None);
        };

        let latest = match latest {
            Ok(version) => version,
            Err(err) => {
                metadata.record_version_check(VersionCheck::failed(err.to_string()));
                if let Err(e) = store.save(metadata).await {
                    warn!(source_id, error = %e, "Could not persist version check");
                }
                if err.kind == ErrorKind::Defect {
                    return Err(IngestError::VersionCheckDefect {
                        source_id: source_id.to_string(),
                        message: err.to_string(),
                    });
                }
                warn!(source_id, error = %err, "Version check failed, no update this run");
                return Ok(None);
            }
        };

        if metadata.current_version() == Some(latest.as_str()) {
            debug!(source_id, version = %latest, "Source is up to date");
            metadata.record_version_check(VersionCheck::found(&latest));
            if let Err(e) = store.save(metadata).await {
                warn!(source_id, error = %e, "Could not persist version check");
            }
            return Ok(None);
        }

        info!(
            source_id,
            previous = metadata.current_version().unwrap_or("none"),
            latest = %latest,
            "New upstream version"
        );

        if let Err(e) = store.archive(metadata).await {
            warn!(source_id, error = %e, "Could not archive metadata, update postponed");
            return Ok(None);
        }

        metadata.reset_for_new_version();
        metadata.record_version_check(VersionCheck::found(&latest));
        if let Err(e) = store.save(metadata).await {
            warn!(source_id, error = %e, "Could not persist reset metadata");
        }

        run.report.new_versions += 1;
        run.pending_versions
            .insert(source_id.to_string(), latest.clone());
        Ok(Some(latest))
    }
}
