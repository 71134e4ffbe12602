//! Per-source processing metadata
//!
//! [`SourceMetadata`] aggregates the three stage records of one source. All
//! status changes go through its transition methods so that the cross-stage
//! rules hold after every step:
//!
//! - a stage that has not produced anything keeps its downstream stages idle
//! - a stable stage is stable for the same version as the stage before it
//! - every failed or broken record carries an error message

use chrono::{DateTime, Duration, Utc};
use kgx_common::{Stage, Status, StatusRecord};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::collaborator::{LoadResultMetadata, NormalizationStats, SupplementationStats};

/// Prefix of the error message left on a reconciled `InProgress` record
const INTERRUPTED: &str = "interrupted:";

/// Outcome of the last upstream version check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionCheck {
    pub checked_at: DateTime<Utc>,
    #[serde(default)]
    pub latest_version: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
}

impl VersionCheck {
    pub fn found(version: impl Into<String>) -> Self {
        Self {
            checked_at: Utc::now(),
            latest_version: Some(version.into()),
            error_message: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            checked_at: Utc::now(),
            latest_version: None,
            error_message: Some(message.into()),
        }
    }
}

/// A broken cross-stage rule, reported by [`SourceMetadata::check_invariants`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvariantViolation {
    /// `error_message` present without an error status, or missing with one
    ErrorMessageMismatch { stage: Stage, status: Status },
    /// A stage holds results although its upstream stage is not stable
    DownstreamNotIdle {
        upstream: Stage,
        stage: Stage,
        status: Status,
    },
    /// A stable stage disagrees with its upstream stage about the version
    VersionMismatch {
        stage: Stage,
        version: Option<String>,
        upstream_version: Option<String>,
    },
}

impl fmt::Display for InvariantViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvariantViolation::ErrorMessageMismatch { stage, status } => {
                write!(f, "{stage} is {status} with an inconsistent error message")
            }
            InvariantViolation::DownstreamNotIdle {
                upstream,
                stage,
                status,
            } => write!(f, "{stage} is {status} while {upstream} is not stable"),
            InvariantViolation::VersionMismatch {
                stage,
                version,
                upstream_version,
            } => write!(
                f,
                "{stage} is stable for {:?} but its upstream is stable for {:?}",
                version, upstream_version
            ),
        }
    }
}

/// Processing state of one data source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceMetadata {
    source_id: String,

    /// Version of the data the update stage last attempted or loaded
    #[serde(default)]
    current_version: Option<String>,

    #[serde(default)]
    has_sequence_variants: bool,

    #[serde(default)]
    update: StatusRecord,
    #[serde(default)]
    normalization: StatusRecord,
    #[serde(default)]
    supplementation: StatusRecord,

    #[serde(default)]
    load_info: Option<LoadResultMetadata>,
    #[serde(default)]
    normalization_info: Option<NormalizationStats>,
    #[serde(default)]
    supplementation_info: Option<SupplementationStats>,

    #[serde(default)]
    version_check: Option<VersionCheck>,
}

impl SourceMetadata {
    /// Metadata for a source that has never been processed
    pub fn new(source_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            current_version: None,
            has_sequence_variants: false,
            update: StatusRecord::not_started(),
            normalization: StatusRecord::not_started(),
            supplementation: StatusRecord::not_started(),
            load_info: None,
            normalization_info: None,
            supplementation_info: None,
            version_check: None,
        }
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn current_version(&self) -> Option<&str> {
        self.current_version.as_deref()
    }

    pub fn has_sequence_variants(&self) -> bool {
        self.has_sequence_variants
    }

    pub fn stage(&self, stage: Stage) -> &StatusRecord {
        match stage {
            Stage::Update => &self.update,
            Stage::Normalize => &self.normalization,
            Stage::Supplement => &self.supplementation,
        }
    }

    pub fn status(&self, stage: Stage) -> Status {
        self.stage(stage).status()
    }

    pub fn load_info(&self) -> Option<&LoadResultMetadata> {
        self.load_info.as_ref()
    }

    pub fn normalization_info(&self) -> Option<&NormalizationStats> {
        self.normalization_info.as_ref()
    }

    pub fn supplementation_info(&self) -> Option<&SupplementationStats> {
        self.supplementation_info.as_ref()
    }

    pub fn version_check(&self) -> Option<&VersionCheck> {
        self.version_check.as_ref()
    }

    /// All three stages are stable
    pub fn is_complete(&self) -> bool {
        Stage::ALL.iter().all(|stage| self.stage(*stage).is_stable())
    }

    fn record_mut(&mut self, stage: Stage) -> &mut StatusRecord {
        match stage {
            Stage::Update => &mut self.update,
            Stage::Normalize => &mut self.normalization,
            Stage::Supplement => &mut self.supplementation,
        }
    }

    fn clear_results_from(&mut self, stage: Stage) {
        if stage <= Stage::Update {
            self.load_info = None;
        }
        if stage <= Stage::Normalize {
            self.normalization_info = None;
        }
        self.supplementation_info = None;
    }

    /// Mark `stage` as dispatched
    ///
    /// For the update stage `version` is the version about to be loaded and
    /// becomes the current version. Later stages always run against the
    /// current version and ignore the argument.
    pub fn begin_stage(&mut self, stage: Stage, version: Option<String>) {
        let version = match stage {
            Stage::Update => {
                if version.is_some() {
                    self.current_version = version.clone();
                }
                version
            }
            Stage::Normalize | Stage::Supplement => self.current_version.clone(),
        };
        self.record_mut(stage).start(version);
    }

    /// Record a successful load and block the downstream stages on it
    pub fn complete_update(
        &mut self,
        version: impl Into<String>,
        info: LoadResultMetadata,
        has_sequence_variants: bool,
    ) {
        let version = version.into();
        self.current_version = Some(version.clone());
        self.has_sequence_variants = has_sequence_variants;
        self.update.succeed(Some(version));
        self.clear_results_from(Stage::Normalize);
        self.load_info = Some(info);
        for stage in Stage::Update.all_downstream() {
            self.record_mut(stage).wait_on_dependency();
        }
    }

    pub fn complete_normalization(&mut self, stats: NormalizationStats) {
        self.normalization.succeed(self.current_version.clone());
        self.normalization_info = Some(stats);
        self.supplementation_info = None;
        self.supplementation.wait_on_dependency();
    }

    pub fn complete_supplementation(&mut self, stats: SupplementationStats) {
        self.supplementation.succeed(self.current_version.clone());
        self.supplementation_info = Some(stats);
    }

    /// Record a recoverable failure of `stage`
    pub fn fail_stage(&mut self, stage: Stage, message: impl Into<String>) {
        self.record_mut(stage).fail(message);
    }

    /// Record an unrecoverable failure of `stage`
    pub fn break_stage(&mut self, stage: Stage, message: impl Into<String>) {
        self.record_mut(stage).mark_broken(message);
    }

    pub fn record_version_check(&mut self, check: VersionCheck) {
        self.version_check = Some(check);
    }

    /// Start over for a newly detected upstream version
    ///
    /// Call after the current state has been archived. The update stage is
    /// reset and the downstream stages wait on it.
    pub fn reset_for_new_version(&mut self) {
        self.update.reset();
        for stage in Stage::Update.all_downstream() {
            self.record_mut(stage).wait_on_dependency();
        }
        self.clear_results_from(Stage::Update);
    }

    /// Operator reset: `stage` goes back to `NotStarted` and everything after
    /// it waits on it again
    pub fn reset_stage(&mut self, stage: Stage) {
        self.record_mut(stage).reset();
        for downstream in stage.all_downstream() {
            self.record_mut(downstream).wait_on_dependency();
        }
        self.clear_results_from(stage);
    }

    /// Mark stages left `InProgress` by an interrupted run as failed
    ///
    /// A record is considered interrupted when it has been in progress for
    /// longer than `grace`, or when it has no timestamp at all. Returns the
    /// stages that were changed.
    pub fn fail_interrupted(&mut self, now: DateTime<Utc>, grace: Duration) -> Vec<Stage> {
        let mut changed = Vec::new();
        for stage in Stage::ALL {
            let record = self.stage(stage);
            if record.status() != Status::InProgress {
                continue;
            }
            let stale = record.age(now).map_or(true, |age| age > grace);
            if stale {
                let message = match record.timestamp() {
                    Some(at) => format!("{INTERRUPTED} in progress since {}", at.to_rfc3339()),
                    None => format!("{INTERRUPTED} in progress with no start time"),
                };
                self.record_mut(stage).fail(message);
                changed.push(stage);
            }
        }
        changed
    }

    /// `stage` failed because a previous run was interrupted while running it
    pub fn was_interrupted(&self, stage: Stage) -> bool {
        let record = self.stage(stage);
        record.status() == Status::Failed
            && record
                .error_message()
                .is_some_and(|message| message.starts_with(INTERRUPTED))
    }

    /// Every cross-stage rule this metadata currently breaks
    pub fn check_invariants(&self) -> Vec<InvariantViolation> {
        let mut violations = Vec::new();

        for stage in Stage::ALL {
            let record = self.stage(stage);
            if !record.is_consistent() {
                violations.push(InvariantViolation::ErrorMessageMismatch {
                    stage,
                    status: record.status(),
                });
            }
        }

        for stage in [Stage::Normalize, Stage::Supplement] {
            let Some(upstream) = stage.upstream() else {
                continue;
            };
            let upstream_record = self.stage(upstream);
            let record = self.stage(stage);

            if !upstream_record.is_stable() && !record.status().is_idle() {
                violations.push(InvariantViolation::DownstreamNotIdle {
                    upstream,
                    stage,
                    status: record.status(),
                });
            }

            if record.is_stable()
                && upstream_record.is_stable()
                && record.version() != upstream_record.version()
            {
                violations.push(InvariantViolation::VersionMismatch {
                    stage,
                    version: record.version().map(str::to_string),
                    upstream_version: upstream_record.version().map(str::to_string),
                });
            }
        }

        violations
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn loaded(version: &str) -> SourceMetadata {
        let mut meta = SourceMetadata::new("CTD");
        meta.begin_stage(Stage::Update, Some(version.to_string()));
        meta.complete_update(version, LoadResultMetadata::default(), false);
        meta
    }

    fn fully_processed(version: &str) -> SourceMetadata {
        let mut meta = loaded(version);
        meta.begin_stage(Stage::Normalize, None);
        meta.complete_normalization(NormalizationStats::default());
        meta.begin_stage(Stage::Supplement, None);
        meta.complete_supplementation(SupplementationStats::default());
        meta
    }

    #[test]
    fn test_new_metadata_is_not_started() {
        let meta = SourceMetadata::new("HGNC");
        for stage in Stage::ALL {
            assert_eq!(meta.status(stage), Status::NotStarted);
        }
        assert_eq!(meta.current_version(), None);
        assert!(meta.check_invariants().is_empty());
    }

    #[test]
    fn test_update_success_cascades_waiting() {
        let meta = loaded("2024-01-01");
        assert_eq!(meta.status(Stage::Update), Status::Stable);
        assert_eq!(meta.stage(Stage::Update).version(), Some("2024-01-01"));
        assert_eq!(meta.status(Stage::Normalize), Status::WaitingOnDependency);
        assert_eq!(meta.status(Stage::Supplement), Status::WaitingOnDependency);
        assert_eq!(meta.current_version(), Some("2024-01-01"));
        assert!(meta.check_invariants().is_empty());
    }

    #[test]
    fn test_begin_update_records_attempted_version() {
        let mut meta = SourceMetadata::new("CTD");
        meta.begin_stage(Stage::Update, Some("v2".to_string()));
        assert_eq!(meta.current_version(), Some("v2"));
        meta.fail_stage(Stage::Update, "timeout");
        assert_eq!(meta.stage(Stage::Update).version(), Some("v2"));
        assert!(meta.check_invariants().is_empty());
    }

    #[test]
    fn test_normalize_runs_against_current_version() {
        let mut meta = loaded("v1");
        meta.begin_stage(Stage::Normalize, Some("ignored".to_string()));
        assert_eq!(meta.stage(Stage::Normalize).version(), Some("v1"));
        meta.complete_normalization(NormalizationStats::default());
        assert_eq!(meta.status(Stage::Supplement), Status::WaitingOnDependency);
        assert!(meta.check_invariants().is_empty());
    }

    #[test]
    fn test_reset_for_new_version() {
        let mut meta = fully_processed("v1");
        assert!(meta.is_complete());

        meta.reset_for_new_version();
        assert_eq!(meta.status(Stage::Update), Status::NotStarted);
        assert_eq!(meta.status(Stage::Normalize), Status::WaitingOnDependency);
        assert_eq!(meta.status(Stage::Supplement), Status::WaitingOnDependency);
        assert!(meta.load_info().is_none());
        assert!(meta.normalization_info().is_none());
        assert!(meta.supplementation_info().is_none());
        assert!(meta.check_invariants().is_empty());
    }

    #[test]
    fn test_reset_stage_only_touches_downstream() {
        let mut meta = fully_processed("v1");
        meta.reset_stage(Stage::Normalize);

        assert_eq!(meta.status(Stage::Update), Status::Stable);
        assert!(meta.load_info().is_some());
        assert_eq!(meta.status(Stage::Normalize), Status::NotStarted);
        assert_eq!(meta.status(Stage::Supplement), Status::WaitingOnDependency);
        assert!(meta.check_invariants().is_empty());
    }

    #[test]
    fn test_reset_broken_update() {
        let mut meta = SourceMetadata::new("CTD");
        meta.begin_stage(Stage::Update, Some("v1".to_string()));
        meta.break_stage(Stage::Update, "schema changed");
        meta.reset_stage(Stage::Update);
        assert_eq!(meta.status(Stage::Update), Status::NotStarted);
        assert_eq!(meta.stage(Stage::Update).error_message(), None);
    }

    #[test]
    fn test_fail_interrupted_respects_grace() {
        let mut meta = loaded("v1");
        meta.begin_stage(Stage::Normalize, None);

        let now = Utc::now();
        assert!(meta.fail_interrupted(now, Duration::hours(1)).is_empty());
        assert_eq!(meta.status(Stage::Normalize), Status::InProgress);

        let later = now + Duration::hours(2);
        assert_eq!(
            meta.fail_interrupted(later, Duration::hours(1)),
            vec![Stage::Normalize]
        );
        assert_eq!(meta.status(Stage::Normalize), Status::Failed);
        assert!(meta
            .stage(Stage::Normalize)
            .error_message()
            .unwrap()
            .starts_with("interrupted"));
        assert!(meta.was_interrupted(Stage::Normalize));
        assert!(!meta.was_interrupted(Stage::Update));
        assert!(meta.check_invariants().is_empty());
    }

    #[test]
    fn test_ordinary_failure_is_not_interrupted() {
        let mut meta = SourceMetadata::new("CTD");
        meta.begin_stage(Stage::Update, Some("v1".to_string()));
        meta.fail_stage(Stage::Update, "Connection reset");
        assert!(!meta.was_interrupted(Stage::Update));
    }

    #[test]
    fn test_check_invariants_detects_downstream_results() {
        let mut meta = fully_processed("v1");
        meta.update.start(Some("v2".to_string()));

        let violations = meta.check_invariants();
        assert!(violations.contains(&InvariantViolation::DownstreamNotIdle {
            upstream: Stage::Update,
            stage: Stage::Normalize,
            status: Status::Stable,
        }));
    }

    #[test]
    fn test_check_invariants_detects_version_mismatch() {
        let mut meta = fully_processed("v1");
        meta.update.succeed(Some("v2".to_string()));

        let violations = meta.check_invariants();
        assert_eq!(violations.len(), 1);
        assert!(matches!(
            &violations[0],
            InvariantViolation::VersionMismatch { stage: Stage::Normalize, .. }
        ));
        assert!(violations[0].to_string().contains("normalize"));
    }

    #[test]
    fn test_serde_roundtrip_keeps_state() {
        let mut meta = fully_processed("2024-01-01");
        meta.record_version_check(VersionCheck::found("2024-01-01"));

        let json = serde_json::to_string_pretty(&meta).unwrap();
        let restored: SourceMetadata = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, meta);
    }

    #[test]
    fn test_deserialize_minimal_record() {
        let meta: SourceMetadata = serde_json::from_str(r#"{"source_id":"CTD"}"#).unwrap();
        assert_eq!(meta, SourceMetadata::new("CTD"));
    }
}
