//! Shared test doubles for the orchestrator integration tests
#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use kgx_common::Stage;
use kgx_ingest::collaborator::{
    CollaboratorError, CollaboratorResult, LoadResultMetadata, NormalizationRequest,
    NormalizationStats, Normalizer, SourceLoader, SupplementationRequest, SupplementationStats,
    Supplementer,
};
use kgx_ingest::config::SourceConfig;
use kgx_ingest::executor::StageExecutor;
use kgx_ingest::orchestrator::{Orchestrator, SchedulerSettings};
use kgx_ingest::paths::StorageLayout;
use kgx_ingest::registry::SourceRegistry;
use kgx_ingest::store::MemoryMetadataStore;

// ============================================================================
// Event log and concurrency gauge
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Start,
    End,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub source_id: String,
    pub stage: Stage,
    pub phase: Phase,
}

/// Ordered record of collaborator calls across all doubles
#[derive(Debug, Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<Event>>>);

impl EventLog {
    pub fn push(&self, source_id: &str, stage: Stage, phase: Phase) {
        self.0.lock().unwrap().push(Event {
            source_id: source_id.to_string(),
            stage,
            phase,
        });
    }

    pub fn events(&self) -> Vec<Event> {
        self.0.lock().unwrap().clone()
    }

    /// Index of the first event matching `stage` and `phase`
    pub fn first(&self, stage: Stage, phase: Phase) -> Option<usize> {
        self.events()
            .iter()
            .position(|e| e.stage == stage && e.phase == phase)
    }

    /// Index of the last event matching `stage` and `phase`
    pub fn last(&self, stage: Stage, phase: Phase) -> Option<usize> {
        self.events()
            .iter()
            .rposition(|e| e.stage == stage && e.phase == phase)
    }
}

/// Tracks how many calls are in flight at once
#[derive(Debug, Default)]
pub struct ConcurrencyGauge {
    current: AtomicUsize,
    max: AtomicUsize,
}

impl ConcurrencyGauge {
    pub fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(now, Ordering::SeqCst);
    }

    pub fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn max(&self) -> usize {
        self.max.load(Ordering::SeqCst)
    }
}

// ============================================================================
// Loader
// ============================================================================

/// Loader whose version and load results are scripted by the test
pub struct FakeLoader {
    source_id: String,
    version: Mutex<CollaboratorResult<String>>,
    loads: Mutex<VecDeque<CollaboratorResult<LoadResultMetadata>>>,
    version_calls: AtomicUsize,
    load_calls: AtomicUsize,
    delay: Option<Duration>,
    events: Option<EventLog>,
    gauge: Option<Arc<ConcurrencyGauge>>,
    sequence_variants: bool,
}

impl FakeLoader {
    pub fn new(source_id: &str, version: &str) -> Self {
        Self {
            source_id: source_id.to_string(),
            version: Mutex::new(Ok(version.to_string())),
            loads: Mutex::new(VecDeque::new()),
            version_calls: AtomicUsize::new(0),
            load_calls: AtomicUsize::new(0),
            delay: None,
            events: None,
            gauge: None,
            sequence_variants: false,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_events(mut self, events: EventLog) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_gauge(mut self, gauge: Arc<ConcurrencyGauge>) -> Self {
        self.gauge = Some(gauge);
        self
    }

    pub fn with_sequence_variants(mut self) -> Self {
        self.sequence_variants = true;
        self
    }

    pub fn set_version(&self, version: &str) {
        *self.version.lock().unwrap() = Ok(version.to_string());
    }

    pub fn fail_version_check(&self, error: CollaboratorError) {
        *self.version.lock().unwrap() = Err(error);
    }

    /// Queue the result of the next load; an empty queue loads successfully
    pub fn push_load(&self, result: CollaboratorResult<LoadResultMetadata>) {
        self.loads.lock().unwrap().push_back(result);
    }

    pub fn version_calls(&self) -> usize {
        self.version_calls.load(Ordering::SeqCst)
    }

    pub fn load_calls(&self) -> usize {
        self.load_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceLoader for FakeLoader {
    async fn get_latest_source_version(&self) -> CollaboratorResult<String> {
        self.version_calls.fetch_add(1, Ordering::SeqCst);
        self.version.lock().unwrap().clone()
    }

    async fn load(&self, _: &Path, _: &Path) -> CollaboratorResult<LoadResultMetadata> {
        self.load_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(events) = &self.events {
            events.push(&self.source_id, Stage::Update, Phase::Start);
        }
        if let Some(gauge) = &self.gauge {
            gauge.enter();
        }

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let result = self.loads.lock().unwrap().pop_front().unwrap_or_else(|| {
            Ok(LoadResultMetadata {
                node_count: 2,
                edge_count: 1,
                ..Default::default()
            })
        });

        if let Some(gauge) = &self.gauge {
            gauge.exit();
        }
        if let Some(events) = &self.events {
            events.push(&self.source_id, Stage::Update, Phase::End);
        }
        result
    }

    fn has_sequence_variants(&self) -> bool {
        self.sequence_variants
    }
}

// ============================================================================
// Normalizer and supplementer
// ============================================================================

/// Normalizer with per-source scripted results
#[derive(Default)]
pub struct FakeNormalizer {
    scripts: Mutex<HashMap<String, VecDeque<CollaboratorResult<NormalizationStats>>>>,
    calls: Mutex<Vec<NormalizationRequest>>,
    events: Option<EventLog>,
}

impl FakeNormalizer {
    pub fn new(events: EventLog) -> Self {
        Self {
            events: Some(events),
            ..Default::default()
        }
    }

    pub fn push(&self, source_id: &str, result: CollaboratorResult<NormalizationStats>) {
        self.scripts
            .lock()
            .unwrap()
            .entry(source_id.to_string())
            .or_default()
            .push_back(result);
    }

    pub fn calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn calls_for(&self, source_id: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.source_id == source_id)
            .count()
    }

    pub fn requests(&self) -> Vec<NormalizationRequest> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Normalizer for FakeNormalizer {
    async fn normalize(
        &self,
        request: &NormalizationRequest,
    ) -> CollaboratorResult<NormalizationStats> {
        if let Some(events) = &self.events {
            events.push(&request.source_id, Stage::Normalize, Phase::Start);
        }
        self.calls.lock().unwrap().push(request.clone());
        let scripted = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&request.source_id)
            .and_then(VecDeque::pop_front);
        if let Some(events) = &self.events {
            events.push(&request.source_id, Stage::Normalize, Phase::End);
        }
        scripted.unwrap_or_else(|| {
            Ok(NormalizationStats {
                nodes_normalized: 2,
                edges_normalized: 1,
                ..Default::default()
            })
        })
    }
}

#[derive(Default)]
pub struct FakeSupplementer {
    calls: AtomicUsize,
    events: Option<EventLog>,
}

impl FakeSupplementer {
    pub fn new(events: EventLog) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            events: Some(events),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Supplementer for FakeSupplementer {
    async fn supplement(
        &self,
        request: &SupplementationRequest,
    ) -> CollaboratorResult<SupplementationStats> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(events) = &self.events {
            events.push(&request.source_id, Stage::Supplement, Phase::Start);
            events.push(&request.source_id, Stage::Supplement, Phase::End);
        }
        Ok(SupplementationStats {
            nodes_added: 1,
            ..Default::default()
        })
    }
}

// ============================================================================
// Harness
// ============================================================================

/// Memory store, scripted collaborators and a temporary storage root
pub struct Harness {
    pub dir: TempDir,
    pub store: Arc<MemoryMetadataStore>,
    pub normalizer: Arc<FakeNormalizer>,
    pub supplementer: Arc<FakeSupplementer>,
    pub events: EventLog,
}

impl Harness {
    pub fn new() -> Self {
        let events = EventLog::default();
        Self {
            dir: tempfile::tempdir().unwrap(),
            store: Arc::new(MemoryMetadataStore::new()),
            normalizer: Arc::new(FakeNormalizer::new(events.clone())),
            supplementer: Arc::new(FakeSupplementer::new(events.clone())),
            events,
        }
    }

    pub fn layout(&self) -> StorageLayout {
        StorageLayout::new(self.dir.path())
    }

    /// A fresh orchestrator over the shared store, as a restarted process would build
    pub fn orchestrator(
        &self,
        sources: &[(SourceConfig, Arc<FakeLoader>)],
        settings: SchedulerSettings,
    ) -> Orchestrator {
        let mut registry = SourceRegistry::new();
        for (config, loader) in sources {
            registry.register(config.clone(), loader.clone()).unwrap();
        }

        let executor = StageExecutor::new(
            self.store.clone(),
            self.layout(),
            self.normalizer.clone(),
            self.supplementer.clone(),
        );
        Orchestrator::new(registry, self.store.clone(), Arc::new(executor), settings)
    }

    pub fn loader(&self, source_id: &str, version: &str) -> Arc<FakeLoader> {
        Arc::new(FakeLoader::new(source_id, version).with_events(self.events.clone()))
    }
}

pub fn sequential() -> SchedulerSettings {
    SchedulerSettings::default()
}

pub fn batch(worker_threads: usize) -> SchedulerSettings {
    SchedulerSettings {
        mode: kgx_ingest::config::SchedulingMode::Batch,
        worker_threads,
        ..Default::default()
    }
}
