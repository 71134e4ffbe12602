//! Ingest orchestrator
//!
//! Owns the in-memory metadata for every active source during a run, selects
//! eligible (source, stage) work and dispatches it to the [`StageExecutor`].
//!
//! Two scheduling modes share the same eligibility rules:
//!
//! - **Sequential**: pick one work item, run it, scan again. All update work
//!   is drained before any normalization is considered.
//! - **Batch**: for each stage in order, collect every eligible source and run
//!   them on a bounded pool. The next stage starts only after the whole batch
//!   has finished.

mod recovery;
mod report;
mod selection;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use kgx_common::Stage;

use crate::config::{IngestConfig, SchedulingMode};
use crate::error::{IngestError, Result};
use crate::executor::{StageExecutor, StageOutcome};
use crate::metadata::SourceMetadata;
use crate::registry::SourceRegistry;
use crate::store::MetadataStore;

pub use report::{RunReport, StageTally};
pub use selection::WorkItem;

/// Scheduling knobs for a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerSettings {
    pub mode: SchedulingMode,
    /// Pool size in batch mode
    pub worker_threads: usize,
    pub retry_failed_updates: bool,
    pub in_progress_grace: Option<chrono::Duration>,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            mode: SchedulingMode::Sequential,
            worker_threads: 4,
            retry_failed_updates: false,
            in_progress_grace: None,
        }
    }
}

impl From<&IngestConfig> for SchedulerSettings {
    fn from(config: &IngestConfig) -> Self {
        Self {
            mode: config.scheduling_mode,
            worker_threads: config.worker_threads,
            retry_failed_updates: config.retry_failed_updates,
            in_progress_grace: config.in_progress_grace(),
        }
    }
}

/// Bookkeeping that lives for exactly one run
#[derive(Debug)]
pub(crate) struct RunState {
    attempted: HashSet<(String, Stage)>,
    version_checked: HashSet<String>,
    pending_versions: HashMap<String, String>,
    report: RunReport,
}

impl RunState {
    fn new(run_id: Uuid, mode: SchedulingMode) -> Self {
        Self {
            attempted: HashSet::new(),
            version_checked: HashSet::new(),
            pending_versions: HashMap::new(),
            report: RunReport::new(run_id, mode),
        }
    }

    fn was_attempted(&self, source_id: &str, stage: Stage) -> bool {
        self.attempted.contains(&(source_id.to_string(), stage))
    }

    fn mark_attempted(&mut self, source_id: &str, stage: Stage) {
        self.attempted.insert((source_id.to_string(), stage));
    }
}

/// Drives every registered source through update, normalize and supplement
pub struct Orchestrator {
    registry: SourceRegistry,
    store: Arc<dyn MetadataStore>,
    executor: Arc<StageExecutor>,
    settings: SchedulerSettings,
    metadata: HashMap<String, SourceMetadata>,
    /// Registered sources whose metadata loaded, in registry order
    active: Vec<String>,
    excluded: Vec<String>,
    loaded: bool,
}

impl Orchestrator {
    pub fn new(
        registry: SourceRegistry,
        store: Arc<dyn MetadataStore>,
        executor: Arc<StageExecutor>,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            registry,
            store,
            executor,
            settings,
            metadata: HashMap::new(),
            active: Vec::new(),
            excluded: Vec::new(),
            loaded: false,
        }
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    pub fn metadata(&self, source_id: &str) -> Option<&SourceMetadata> {
        self.metadata.get(source_id)
    }

    /// Sources taking part in the run, in scan order
    pub fn active_sources(&self) -> &[String] {
        &self.active
    }

    /// Sources whose metadata failed to load
    pub fn excluded_sources(&self) -> &[String] {
        &self.excluded
    }

    /// Load metadata for every registered source
    ///
    /// A source whose metadata cannot be loaded is excluded from the run
    /// instead of failing it.
    pub async fn load_metadata(&mut self) -> Result<()> {
        self.metadata.clear();
        self.active.clear();
        self.excluded.clear();

        for entry in self.registry.iter() {
            let source_id = entry.id();

            if let Err(e) = self.executor.layout().ensure_source_dirs(source_id).await {
                warn!(source_id, error = %e, "Could not create source directory");
            }

            match self.store.load(source_id).await {
                Ok(metadata) => {
                    for violation in metadata.check_invariants() {
                        warn!(source_id, %violation, "Stored metadata breaks an invariant");
                    }
                    self.metadata.insert(source_id.to_string(), metadata);
                    self.active.push(source_id.to_string());
                }
                Err(e) => {
                    error!(source_id, error = %e, "Could not load metadata, excluding source");
                    self.excluded.push(source_id.to_string());
                }
            }
        }

        info!(
            active = self.active.len(),
            excluded = self.excluded.len(),
            "Metadata loaded"
        );
        self.loaded = true;

        if self.settings.in_progress_grace.is_some() {
            self.reconcile_interrupted(Utc::now()).await;
        }
        Ok(())
    }

    /// Run until no work is eligible
    ///
    /// Returns the run report, or the first defect that stopped the run.
    pub async fn run(&mut self) -> Result<RunReport> {
        let run_id = Uuid::new_v4();
        let span = info_span!("ingest_run", %run_id, mode = %self.settings.mode);

        async move {
            if !self.loaded {
                self.load_metadata().await?;
            }

            let mut run = RunState::new(run_id, self.settings.mode);
            run.report.excluded_sources = self.excluded.clone();
            info!(sources = self.active.len(), "Starting ingest run");

            let result = match self.settings.mode {
                SchedulingMode::Sequential => self.run_sequential(&mut run).await,
                SchedulingMode::Batch => self.run_batches(&mut run).await,
            };

            run.report.finish();
            run.report.log_summary();

            match result {
                Ok(()) => Ok(run.report),
                Err(e) => {
                    error!(error = %e, "Ingest run stopped");
                    Err(e)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn run_sequential(&mut self, run: &mut RunState) -> Result<()> {
        while let Some(item) = self.find_work(run).await? {
            self.dispatch(item, run).await?;
        }
        Ok(())
    }

    /// Run one work item in place
    async fn dispatch(&mut self, item: WorkItem, run: &mut RunState) -> Result<StageOutcome> {
        let WorkItem {
            source_id,
            stage,
            known_version,
        } = item;

        run.mark_attempted(&source_id, stage);
        if stage == Stage::Update {
            run.pending_versions.remove(&source_id);
        }

        let (Some(entry), Some(metadata)) =
            (self.registry.get(&source_id), self.metadata.get_mut(&source_id))
        else {
            return Err(IngestError::UnknownSource(source_id));
        };

        let result = self
            .executor
            .execute(stage, entry, metadata, known_version)
            .await;
        run.report.record(stage, &result);
        result
    }

    async fn run_batches(&mut self, run: &mut RunState) -> Result<()> {
        for stage in Stage::ALL {
            self.run_stage_batch(stage, run).await?;
        }
        Ok(())
    }

    /// Dispatch every eligible source for `stage` and wait for all of them
    ///
    /// A defect does not cancel the rest of the batch; the first one is
    /// returned once every job has finished.
    async fn run_stage_batch(&mut self, stage: Stage, run: &mut RunState) -> Result<()> {
        let mut items = Vec::new();
        for source_id in self.active.clone() {
            if let Some(item) = self.select(stage, &source_id, run).await? {
                items.push(item);
            }
        }

        if items.is_empty() {
            return Ok(());
        }

        info!(
            %stage,
            sources = items.len(),
            concurrency = self.settings.worker_threads,
            "Dispatching batch"
        );

        let mut jobs = Vec::with_capacity(items.len());
        for item in items {
            run.mark_attempted(&item.source_id, stage);
            run.pending_versions.remove(&item.source_id);
            let entry = self.registry.get(&item.source_id).cloned();
            let metadata = self.metadata.remove(&item.source_id);
            if let (Some(entry), Some(metadata)) = (entry, metadata) {
                jobs.push((entry, metadata, item.known_version));
            }
        }

        let executor = self.executor.clone();
        let results: Vec<_> = stream::iter(jobs)
            .map(|(entry, mut metadata, known_version)| {
                let executor = executor.clone();
                let source_id = entry.id().to_string();
                let handle = tokio::spawn(async move {
                    let result = executor
                        .execute(stage, &entry, &mut metadata, known_version)
                        .await;
                    (metadata, result)
                });
                async move { (source_id, handle.await) }
            })
            .buffer_unordered(self.settings.worker_threads.max(1))
            .collect()
            .await;

        let mut first_defect = None;
        for (source_id, joined) in results {
            let result = match joined {
                Ok((metadata, result)) => {
                    self.metadata.insert(source_id.clone(), metadata);
                    result
                }
                Err(e) => {
                    error!(source_id = %source_id, %stage, error = %e, "Stage task panicked");
                    self.recover_after_panic(&source_id).await;
                    Err(IngestError::Defect {
                        source_id: source_id.clone(),
                        stage,
                        message: format!("stage task panicked: {e}"),
                    })
                }
            };

            run.report.record(stage, &result);
            if let Err(e) = result {
                first_defect.get_or_insert(e);
            }
        }

        match first_defect {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Reload a source whose task died so later stages see the stored state
    async fn recover_after_panic(&mut self, source_id: &str) {
        match self.store.load(source_id).await {
            Ok(metadata) => {
                self.metadata.insert(source_id.to_string(), metadata);
            }
            Err(e) => {
                error!(source_id, error = %e, "Could not reload metadata, excluding source");
                self.active.retain(|id| id != source_id);
                self.excluded.push(source_id.to_string());
            }
        }
    }
}
