//! Status model shared across the ingest workspace
//!
//! Every data source moves through three [`Stage`]s. Each (source, stage) pair
//! carries one [`StatusRecord`] describing the last thing that happened to it.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::KgxError;

// ============================================================================
// Stage
// ============================================================================

/// One of the three sequential processing phases of a data source.
///
/// Stages are ordered: `Update < Normalize < Supplement`. A stage may only run
/// once the stage before it is stable for the current data version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Fetch and parse the raw source data into KGX node/edge files
    Update,
    /// Rewrite identifiers into canonical form
    Normalize,
    /// Derive additional facts from the normalized records
    Supplement,
}

impl Stage {
    /// All stages in dependency order
    pub const ALL: [Stage; 3] = [Stage::Update, Stage::Normalize, Stage::Supplement];

    /// The stage that consumes this stage's output, if any
    pub fn downstream(self) -> Option<Stage> {
        match self {
            Stage::Update => Some(Stage::Normalize),
            Stage::Normalize => Some(Stage::Supplement),
            Stage::Supplement => None,
        }
    }

    /// The stage this stage depends on, if any
    pub fn upstream(self) -> Option<Stage> {
        match self {
            Stage::Update => None,
            Stage::Normalize => Some(Stage::Update),
            Stage::Supplement => Some(Stage::Normalize),
        }
    }

    /// Every stage after this one, nearest first
    pub fn all_downstream(self) -> impl Iterator<Item = Stage> {
        Stage::ALL.into_iter().filter(move |stage| *stage > self)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Update => "update",
            Stage::Normalize => "normalize",
            Stage::Supplement => "supplement",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Stage {
    type Err = KgxError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "update" => Ok(Stage::Update),
            "normalize" | "normalization" => Ok(Stage::Normalize),
            "supplement" | "supplementation" => Ok(Stage::Supplement),
            _ => Err(KgxError::InvalidStage(s.to_string())),
        }
    }
}

// ============================================================================
// Status
// ============================================================================

/// Processing state of a single (source, stage) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Never attempted
    #[default]
    NotStarted,
    /// Dispatched with no terminal result yet
    InProgress,
    /// Last attempt succeeded for the recorded version
    Stable,
    /// Last attempt hit a recoverable error and may be retried
    Failed,
    /// Last attempt hit a structural error; needs an operator
    Broken,
    /// Blocked until the upstream stage becomes stable
    WaitingOnDependency,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::NotStarted => "not_started",
            Status::InProgress => "in_progress",
            Status::Stable => "stable",
            Status::Failed => "failed",
            Status::Broken => "broken",
            Status::WaitingOnDependency => "waiting_on_dependency",
        }
    }

    /// `Stable`, `Failed` or `Broken`: the last attempt produced a result
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Stable | Status::Failed | Status::Broken)
    }

    /// `Failed` or `Broken`: the record must carry an error message
    pub fn is_error(self) -> bool {
        matches!(self, Status::Failed | Status::Broken)
    }

    /// `NotStarted` or `WaitingOnDependency`: nothing has been produced yet
    pub fn is_idle(self) -> bool {
        matches!(self, Status::NotStarted | Status::WaitingOnDependency)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Status {
    type Err = KgxError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "not_started" => Ok(Status::NotStarted),
            "in_progress" => Ok(Status::InProgress),
            "stable" => Ok(Status::Stable),
            "failed" => Ok(Status::Failed),
            "broken" => Ok(Status::Broken),
            "waiting_on_dependency" => Ok(Status::WaitingOnDependency),
            _ => Err(KgxError::InvalidStatus(s.to_string())),
        }
    }
}

// ============================================================================
// StatusRecord
// ============================================================================

/// State of one (source, stage) pair.
///
/// Fields are only changed through the transition methods so that
/// `error_message` is present exactly when the status is `Failed` or `Broken`.
///
/// # Examples
///
/// ```rust
/// use kgx_common::types::{Status, StatusRecord};
///
/// let mut record = StatusRecord::not_started();
/// record.start(Some("v2".to_string()));
/// record.fail("connection reset by peer");
///
/// assert_eq!(record.status(), Status::Failed);
/// assert_eq!(record.error_message(), Some("connection reset by peer"));
/// assert!(record.is_consistent());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct StatusRecord {
    status: Status,

    /// Data version this status applies to
    #[serde(default)]
    version: Option<String>,

    #[serde(default)]
    error_message: Option<String>,

    /// When the status last changed
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
}

impl StatusRecord {
    /// A record for a stage that has never been attempted
    pub fn not_started() -> Self {
        Self::default()
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.timestamp
    }

    pub fn is_stable(&self) -> bool {
        self.status == Status::Stable
    }

    /// Mark the stage as dispatched for `version`
    pub fn start(&mut self, version: Option<String>) {
        self.transition(Status::InProgress, version, None);
    }

    /// Mark the stage as successfully completed for `version`
    pub fn succeed(&mut self, version: Option<String>) {
        self.transition(Status::Stable, version, None);
    }

    /// Record a recoverable failure; the version of the attempt is kept
    pub fn fail(&mut self, message: impl Into<String>) {
        let version = self.version.take();
        self.transition(Status::Failed, version, Some(message.into()));
    }

    /// Record a structural failure; the version of the attempt is kept
    pub fn mark_broken(&mut self, message: impl Into<String>) {
        let version = self.version.take();
        self.transition(Status::Broken, version, Some(message.into()));
    }

    /// Block the stage on its upstream stage
    pub fn wait_on_dependency(&mut self) {
        self.transition(Status::WaitingOnDependency, None, None);
    }

    /// Forget everything about the stage
    pub fn reset(&mut self) {
        *self = Self::not_started();
    }

    /// Override the transition time (used when replaying or reconciling)
    pub fn stamped_at(mut self, at: DateTime<Utc>) -> Self {
        self.timestamp = Some(at);
        self
    }

    /// How long the record has been in its current status
    pub fn age(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.timestamp.map(|at| now - at)
    }

    /// `error_message` is set iff the status is `Failed` or `Broken`
    pub fn is_consistent(&self) -> bool {
        self.status.is_error() == self.error_message.is_some()
    }

    fn transition(&mut self, status: Status, version: Option<String>, error: Option<String>) {
        self.status = status;
        self.version = version;
        self.error_message = error;
        self.timestamp = Some(Utc::now());
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_stage_order_and_neighbours() {
        assert!(Stage::Update < Stage::Normalize);
        assert!(Stage::Normalize < Stage::Supplement);
        assert_eq!(Stage::Update.upstream(), None);
        assert_eq!(Stage::Supplement.downstream(), None);
        assert_eq!(Stage::Supplement.upstream(), Some(Stage::Normalize));
        assert_eq!(
            Stage::Update.all_downstream().collect::<Vec<_>>(),
            vec![Stage::Normalize, Stage::Supplement]
        );
        assert_eq!(Stage::Supplement.all_downstream().count(), 0);
    }

    #[test]
    fn test_stage_from_str() {
        assert_eq!("update".parse::<Stage>().unwrap(), Stage::Update);
        assert_eq!("Normalization".parse::<Stage>().unwrap(), Stage::Normalize);
        assert_eq!("SUPPLEMENT".parse::<Stage>().unwrap(), Stage::Supplement);
        assert!("fetch".parse::<Stage>().is_err());
    }

    #[test]
    fn test_status_display_roundtrip() {
        for status in [
            Status::NotStarted,
            Status::InProgress,
            Status::Stable,
            Status::Failed,
            Status::Broken,
            Status::WaitingOnDependency,
        ] {
            assert_eq!(status.to_string().parse::<Status>().unwrap(), status);
        }
        assert_eq!("in-progress".parse::<Status>().unwrap(), Status::InProgress);
        assert!("done".parse::<Status>().is_err());
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let json = serde_json::to_string(&Status::WaitingOnDependency).unwrap();
        assert_eq!(json, "\"waiting_on_dependency\"");
    }

    #[test]
    fn test_failure_keeps_attempted_version() {
        let mut record = StatusRecord::not_started();
        record.start(Some("2024_01".to_string()));
        record.mark_broken("unexpected column count");

        assert_eq!(record.status(), Status::Broken);
        assert_eq!(record.version(), Some("2024_01"));
        assert_eq!(record.error_message(), Some("unexpected column count"));
        assert!(record.timestamp().is_some());
    }

    #[test]
    fn test_success_clears_previous_error() {
        let mut record = StatusRecord::not_started();
        record.start(None);
        record.fail("timeout");
        record.start(Some("v1".to_string()));
        assert_eq!(record.error_message(), None);
        record.succeed(Some("v1".to_string()));
        assert!(record.is_stable());
        assert!(record.is_consistent());
    }

    #[test]
    fn test_record_deserializes_without_optional_fields() {
        let record: StatusRecord = serde_json::from_str(r#"{"status":"not_started"}"#).unwrap();
        assert_eq!(record, StatusRecord::not_started());
    }

    #[test]
    fn test_age() {
        let at = Utc::now() - Duration::minutes(5);
        let record = StatusRecord::not_started().stamped_at(at);
        let age = record.age(Utc::now()).unwrap();
        assert!(age >= Duration::minutes(5));
    }

    #[derive(Debug, Clone)]
    enum Transition {
        Start,
        Succeed,
        Fail,
        Break,
        Wait,
        Reset,
    }

    fn transition() -> impl Strategy<Value = Transition> {
        prop_oneof![
            Just(Transition::Start),
            Just(Transition::Succeed),
            Just(Transition::Fail),
            Just(Transition::Break),
            Just(Transition::Wait),
            Just(Transition::Reset),
        ]
    }

    proptest! {
        #[test]
        fn error_message_present_iff_error_status(steps in proptest::collection::vec(transition(), 0..32)) {
            let mut record = StatusRecord::not_started();
            for step in steps {
                match step {
                    Transition::Start => record.start(Some("v".to_string())),
                    Transition::Succeed => record.succeed(Some("v".to_string())),
                    Transition::Fail => record.fail("recoverable"),
                    Transition::Break => record.mark_broken("structural"),
                    Transition::Wait => record.wait_on_dependency(),
                    Transition::Reset => record.reset(),
                }
                prop_assert!(record.is_consistent());
            }
        }
    }
}
