//! Phaseflow - phased task-graph orchestration with a live knowledge store.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use phaseflow::checkpoint::CheckpointError;
use phaseflow::config::{ConfigError, ConfigLoader, OrchestratorConfig};
use phaseflow::display;
use phaseflow::gate::GateRegistry;
use phaseflow::knowledge::{
    run_ingest_loop, scan_source_dir, ChunkConfig, EmbeddingError, GeminiEmbedder,
    KnowledgeError, KnowledgeIndex, KnowledgeStore, KnowledgeWatcher, SourceFilter,
};
use phaseflow::runlog::{RunLog, RunLogError};
use phaseflow::scheduler::{Scheduler, WorkerRegistry};
use phaseflow::workflow::{ValidatedSpec, ValidationError, WorkflowSpec};

#[derive(Parser)]
#[command(
    name = "phaseflow",
    about = "Phased task-graph orchestration with an incrementally indexed knowledge store",
    version
)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short = 'v', long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Configuration file (defaults to .phaseflow.toml, then the user config dir).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a workflow specification.
    Validate {
        /// Path to the workflow TOML file.
        spec: PathBuf,
    },
    /// Ingest the knowledge source directory once.
    Ingest,
    /// Query the knowledge store.
    Query {
        /// Query text.
        text: String,
        /// Number of results.
        #[arg(short)]
        k: Option<usize>,
    },
    /// Watch the knowledge source directory and re-ingest on change.
    Watch,
    /// List recorded runs.
    Runs,
    /// Show the history of a run.
    History {
        run_id: String,
    },
    /// Resume a run suspended at a human checkpoint.
    Resume {
        run_id: String,
        /// Selected option to hand over to the next phase.
        #[arg(long)]
        selection: String,
        /// Free-text feedback.
        #[arg(long)]
        feedback: Option<String>,
    },
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Knowledge(#[from] KnowledgeError),
    #[error(transparent)]
    Embedding(#[from] EmbeddingError),
    #[error(transparent)]
    RunLog(#[from] RunLogError),
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    #[error("Failed to listen for shutdown signal: {0}")]
    Signal(#[source] std::io::Error),
}

fn init_tracing(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();
}

fn load_config(path: Option<PathBuf>) -> Result<OrchestratorConfig, ConfigError> {
    let loader = path.map_or_else(ConfigLoader::new, ConfigLoader::with_path);
    loader.load()
}

async fn open_store(config: &OrchestratorConfig) -> Result<KnowledgeStore, CliError> {
    let embedder = GeminiEmbedder::from_config(&config.embedding)?;
    let index = KnowledgeIndex::open(&config.knowledge.index_path).await?;
    let chunking = ChunkConfig::new(config.knowledge.chunk_size, config.knowledge.chunk_overlap);
    Ok(KnowledgeStore::open(index, Arc::new(embedder))
        .await?
        .with_chunking(chunking))
}

async fn ingest_once(store: &KnowledgeStore, config: &OrchestratorConfig) -> Result<(), CliError> {
    let filter = SourceFilter::from_config(&config.knowledge);
    let snapshot = scan_source_dir(&config.knowledge.source_dir, &filter)?;
    let report = store.ingest(&snapshot).await?;
    display::print_ingest_report(&report);
    display::print_stats(&store.stats().await);
    Ok(())
}

async fn watch(config: &OrchestratorConfig) -> Result<(), CliError> {
    let store = Arc::new(open_store(config).await?);
    ingest_once(&store, config).await?;

    let filter = SourceFilter::from_config(&config.knowledge);
    let (watcher, events) = KnowledgeWatcher::new(
        config.knowledge.source_dir.clone(),
        config.knowledge.debounce(),
        filter.clone(),
    )?;
    let cancel = CancellationToken::new();
    let ingest = tokio::spawn(run_ingest_loop(
        Arc::clone(&store),
        config.knowledge.source_dir.clone(),
        filter,
        events,
        cancel.clone(),
    ));
    tracing::info!(source_dir = %config.knowledge.source_dir.display(), "Watching knowledge source");

    let signal = tokio::signal::ctrl_c().await;
    cancel.cancel();
    watcher.stop();
    if let Err(e) = ingest.await {
        tracing::error!(error = %e, "Ingest loop aborted");
    }
    signal.map_err(CliError::Signal)?;
    display::print_stats(&store.stats().await);
    Ok(())
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let config = load_config(cli.config)?;

    match cli.command {
        Commands::Validate { spec } => {
            let validated = ValidatedSpec::new(WorkflowSpec::load(&spec)?)?;
            display::print_workflow(&validated);
        }
        Commands::Ingest => {
            let store = open_store(&config).await?;
            ingest_once(&store, &config).await?;
        }
        Commands::Query { text, k } => {
            let store = open_store(&config).await?;
            let result = store
                .query(&text, k.unwrap_or(config.knowledge.default_k))
                .await;
            display::print_retrieval(&text, &result);
        }
        Commands::Watch => watch(&config).await?,
        Commands::Runs => {
            let runlog = RunLog::open(&config.runlog.path).await?;
            display::print_runs(&runlog.list_runs().await?);
        }
        Commands::History { run_id } => {
            let runlog = RunLog::open(&config.runlog.path).await?;
            display::print_history(&run_id, &runlog.history(&run_id).await?);
        }
        Commands::Resume {
            run_id,
            selection,
            feedback,
        } => {
            let runlog = RunLog::open(&config.runlog.path).await?;
            let scheduler = Scheduler::new(WorkerRegistry::new(), GateRegistry::with_defaults())
                .with_config(config.scheduler.clone())
                .with_run_log(runlog);
            let ack = scheduler.submit_input(&run_id, selection, feedback).await?;
            display::print_ack(&ack);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            display::print_error(&e.to_string());
            ExitCode::FAILURE
        }
    }
}
