//! KGX Ingest - source ingestion orchestrator

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use kgx_common::logging::{init_logging, LogConfig, LogLevel};
use kgx_common::{Stage, StatusRecord};
use kgx_ingest::collaborator::local::{LocalFileLoader, NullSupplementer, PassthroughNormalizer};
use kgx_ingest::collaborator::SourceLoader;
use kgx_ingest::config::{IngestConfig, SchedulingMode, SourcesConfig};
use kgx_ingest::executor::StageExecutor;
use kgx_ingest::metadata::SourceMetadata;
use kgx_ingest::orchestrator::{Orchestrator, SchedulerSettings};
use kgx_ingest::paths::StorageLayout;
use kgx_ingest::registry::SourceRegistry;
use kgx_ingest::store::{FileMetadataStore, MetadataStore};
use kgx_ingest::IngestError;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

const ALL_SOURCES: &str = "all";

#[derive(Parser, Debug)]
#[command(name = "kgx-ingest")]
#[command(author, version, about = "KGX source ingestion orchestrator")]
struct Cli {
    /// Storage root for metadata and produced files
    #[arg(long, env = "KGX_STORAGE")]
    storage: PathBuf,

    /// Sources YAML file (default: <storage>/sources.yml)
    #[arg(long, env = "KGX_SOURCES_CONFIG")]
    sources: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run every eligible stage until nothing is left to do
    Run {
        /// Source id to process, or "all"
        #[arg(short = 'd', long, default_value = ALL_SOURCES)]
        data_source: String,

        /// Load only a small sample of each source
        #[arg(short, long)]
        test_mode: bool,

        /// Scheduling mode: sequential or batch
        #[arg(long)]
        mode: Option<SchedulingMode>,

        /// Worker pool size in batch mode
        #[arg(long)]
        workers: Option<usize>,

        /// Inbox directory for the local loader (default: <storage>/inbox)
        #[arg(long)]
        inbox: Option<PathBuf>,

        /// Retry failed updates even when the upstream version is unchanged
        #[arg(long)]
        retry_failed_updates: bool,

        /// Fail stages left in progress for longer than this many seconds
        #[arg(long)]
        grace_secs: Option<u64>,
    },

    /// Show the stored status of each source
    Status {
        /// Only show this source
        #[arg(short = 'd', long)]
        data_source: Option<String>,

        /// Print the raw metadata as JSON
        #[arg(long)]
        json: bool,
    },

    /// Reset a stage to not started; later stages wait on it again
    Reset {
        #[arg(short = 'd', long)]
        data_source: String,

        /// update, normalize or supplement
        #[arg(long)]
        stage: Stage,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    let log_config = LogConfig::builder()
        .level(log_level)
        .log_dir(cli.storage.join("logs"))
        .log_file_prefix("kgx-ingest")
        .build();

    // Environment variables take precedence
    let log_config = LogConfig::from_env_with(log_config)?;
    let _log_guard = init_logging(&log_config)?;

    let mut config = IngestConfig::from_env_for(cli.storage.clone())?;
    if let Some(sources) = cli.sources {
        config.sources_config = sources;
    }

    match cli.command {
        Command::Run {
            data_source,
            test_mode,
            mode,
            workers,
            inbox,
            retry_failed_updates,
            grace_secs,
        } => {
            if let Some(mode) = mode {
                config.scheduling_mode = mode;
            }
            if let Some(workers) = workers {
                config.worker_threads = workers;
            }
            if let Some(inbox) = inbox {
                config.inbox = inbox;
            }
            if grace_secs.is_some() {
                config.in_progress_grace_secs = grace_secs;
            }
            config.retry_failed_updates |= retry_failed_updates;
            config.test_mode |= test_mode;
            config.validate()?;

            run(&config, &data_source).await
        }
        Command::Status { data_source, json } => {
            status(&config, data_source.as_deref(), json).await
        }
        Command::Reset { data_source, stage } => reset(&config, &data_source, stage).await,
    }
}

fn load_sources(config: &IngestConfig) -> Result<SourcesConfig> {
    SourcesConfig::load(&config.sources_config).with_context(|| {
        format!(
            "Failed to load sources from {}",
            config.sources_config.display()
        )
    })
}

/// Source ids to act on, in configuration order
fn select_ids(sources: &SourcesConfig, data_source: Option<&str>) -> Result<Vec<String>> {
    match data_source {
        None => Ok(sources.ids().map(str::to_string).collect()),
        Some(id) if id.eq_ignore_ascii_case(ALL_SOURCES) => {
            Ok(sources.ids().map(str::to_string).collect())
        }
        Some(id) if sources.ids().any(|known| known == id) => Ok(vec![id.to_string()]),
        Some(id) => Err(IngestError::UnknownSource(id.to_string()).into()),
    }
}

async fn run(config: &IngestConfig, data_source: &str) -> Result<()> {
    let sources = load_sources(config)?;
    let inbox = config.inbox.clone();
    let test_mode = config.test_mode;

    let registry = SourceRegistry::from_config(&sources, |source| {
        Arc::new(LocalFileLoader::new(&inbox, &source.id).test_mode(test_mode))
            as Arc<dyn SourceLoader>
    })?;
    let registry = if data_source.eq_ignore_ascii_case(ALL_SOURCES) {
        registry
    } else {
        registry.only(data_source)?
    };

    info!(
        sources = registry.len(),
        mode = %config.scheduling_mode,
        test_mode,
        "Ingesting"
    );

    let layout = StorageLayout::new(&config.storage);
    let store: Arc<dyn MetadataStore> = Arc::new(FileMetadataStore::new(layout.clone()));
    let executor = StageExecutor::new(
        store.clone(),
        layout,
        Arc::new(PassthroughNormalizer::new()),
        Arc::new(NullSupplementer::new()),
    );

    let mut orchestrator = Orchestrator::new(
        registry,
        store,
        Arc::new(executor),
        SchedulerSettings::from(config),
    );
    let report = orchestrator.run().await?;

    info!(
        dispatched = report.total_dispatched(),
        new_versions = report.new_versions,
        "Ingestion complete"
    );
    Ok(())
}

fn describe(record: &StatusRecord) -> String {
    match record.version() {
        Some(version) => format!("{}@{}", record.status(), version),
        None => record.status().to_string(),
    }
}

async fn status(config: &IngestConfig, data_source: Option<&str>, json: bool) -> Result<()> {
    let sources = load_sources(config)?;
    let store = FileMetadataStore::new(StorageLayout::new(&config.storage));

    let mut records: Vec<SourceMetadata> = Vec::new();
    for id in select_ids(&sources, data_source)? {
        records.push(store.load(&id).await?);
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }

    for metadata in &records {
        let stages: Vec<String> = Stage::ALL
            .iter()
            .map(|stage| format!("{}={}", stage, describe(metadata.stage(*stage))))
            .collect();
        println!("{:<20} {}", metadata.source_id(), stages.join("  "));

        for stage in Stage::ALL {
            if let Some(message) = metadata.stage(stage).error_message() {
                println!("{:<20} {}: {}", "", stage, message);
            }
        }
    }
    Ok(())
}

async fn reset(config: &IngestConfig, data_source: &str, stage: Stage) -> Result<()> {
    let sources = load_sources(config)?;
    if !sources.ids().any(|known| known == data_source) {
        return Err(IngestError::UnknownSource(data_source.to_string()).into());
    }

    let store = FileMetadataStore::new(StorageLayout::new(&config.storage));
    let mut metadata = store.load(data_source).await?;
    let previous = metadata.status(stage);
    metadata.reset_stage(stage);
    store.save(&metadata).await?;

    info!(source_id = data_source, %stage, %previous, "Stage reset");
    println!("{data_source}: {stage} reset (was {previous})");
    Ok(())
}
