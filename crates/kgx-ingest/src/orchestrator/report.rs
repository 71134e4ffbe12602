//! End-of-run summary

use chrono::{DateTime, Utc};
use kgx_common::Stage;
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::config::SchedulingMode;
use crate::error::Result;
use crate::executor::StageOutcome;

/// Dispatch counts for one stage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StageTally {
    pub dispatched: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub broken: usize,
}

impl StageTally {
    fn record(&mut self, outcome: Option<StageOutcome>) {
        self.dispatched += 1;
        match outcome {
            Some(StageOutcome::Succeeded) => self.succeeded += 1,
            Some(StageOutcome::Failed) | None => self.failed += 1,
            Some(StageOutcome::Broken) => self.broken += 1,
        }
    }
}

/// What one orchestrator run did
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub mode: SchedulingMode,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub update: StageTally,
    pub normalize: StageTally,
    pub supplement: StageTally,
    /// Upstream version checks performed
    pub version_checks: usize,
    /// Sources for which a new upstream version was detected and archived
    pub new_versions: usize,
    /// Sources left out because their metadata could not be loaded
    pub excluded_sources: Vec<String>,
}

impl RunReport {
    pub fn new(run_id: Uuid, mode: SchedulingMode) -> Self {
        Self {
            run_id,
            mode,
            started_at: Utc::now(),
            finished_at: None,
            update: StageTally::default(),
            normalize: StageTally::default(),
            supplement: StageTally::default(),
            version_checks: 0,
            new_versions: 0,
            excluded_sources: Vec::new(),
        }
    }

    pub fn tally(&self, stage: Stage) -> &StageTally {
        match stage {
            Stage::Update => &self.update,
            Stage::Normalize => &self.normalize,
            Stage::Supplement => &self.supplement,
        }
    }

    fn tally_mut(&mut self, stage: Stage) -> &mut StageTally {
        match stage {
            Stage::Update => &mut self.update,
            Stage::Normalize => &mut self.normalize,
            Stage::Supplement => &mut self.supplement,
        }
    }

    /// Count one dispatched work item; a defect counts as a failure
    pub fn record(&mut self, stage: Stage, result: &Result<StageOutcome>) {
        self.tally_mut(stage).record(result.as_ref().ok().copied());
    }

    /// Work items dispatched across all stages
    pub fn total_dispatched(&self) -> usize {
        Stage::ALL.iter().map(|s| self.tally(*s).dispatched).sum()
    }

    pub(crate) fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    /// Write the per-stage counts to the log
    pub fn log_summary(&self) {
        for stage in Stage::ALL {
            let tally = self.tally(stage);
            info!(
                run_id = %self.run_id,
                %stage,
                dispatched = tally.dispatched,
                succeeded = tally.succeeded,
                failed = tally.failed,
                broken = tally.broken,
                "Stage summary"
            );
        }

        let elapsed = self
            .finished_at
            .map(|end| (end - self.started_at).num_milliseconds() as f64 / 1000.0);
        info!(
            run_id = %self.run_id,
            mode = %self.mode,
            version_checks = self.version_checks,
            new_versions = self.new_versions,
            excluded = self.excluded_sources.len(),
            duration_secs = elapsed.unwrap_or_default(),
            "Run summary"
        );
    }
}
