//! medcrawl main entry point
//!
//! This is the command-line interface for the medcrawl harvester.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use medcrawl::config::{load_config_with_hash, load_keywords, Config, SourceConfig, StorageBackend};
use medcrawl::crawler::{crawl, crawl_targets};
use medcrawl::output::{load_source_status, print_missing_keys, print_run_summary, print_source_status};
use medcrawl::recrawl::{RecrawlManager, RecrawlMode, RecrawlOutcome};
use medcrawl::storage::{DocumentIndex, KeyStore, RecordSink, SqliteStorage, Storage};
use medcrawl::{DrugBase, PipelineHandle};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing_subscriber::EnvFilter;

/// medcrawl: a harvester for drug registration and hospital procurement APIs
///
/// medcrawl walks each configured source's list endpoint, fans out to the
/// detail endpoint for every drug, and stores every drug × hospital pair
/// exactly once.
#[derive(Parser, Debug)]
#[command(name = "medcrawl")]
#[command(version)]
#[command(about = "Multi-source drug and hospital procurement harvester", long_about = None)]
struct Cli {
    /// Path to TOML configuration file
    #[arg(short, long, value_name = "CONFIG", default_value = "medcrawl.toml", global = true)]
    config: PathBuf,

    /// Increase logging verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, conflicts_with = "verbose", global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Execute a full traversal
    Run {
        /// Source to traverse (repeatable)
        #[arg(long = "source", value_name = "ID", conflicts_with = "all")]
        sources: Vec<String>,

        /// Traverse every configured source (default)
        #[arg(long)]
        all: bool,
    },

    /// List remote keys missing from the local store
    Check {
        /// Source to check
        #[arg(long = "source", value_name = "ID", conflicts_with = "all")]
        source: Option<String>,

        /// Check every configured source (default)
        #[arg(long)]
        all: bool,
    },

    /// Repair gaps between the remote catalog and the local store
    Recrawl {
        /// Source to repair
        #[arg(long = "source", value_name = "ID")]
        source: String,

        /// Only these drug keys
        #[arg(long, value_delimiter = ',', value_name = "K1,K2")]
        keys: Vec<String>,

        /// Bump updated_at on stored rows instead of fetching
        #[arg(long, requires = "keys")]
        touch: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    // Setup logging based on verbosity
    setup_logging(cli.verbose, cli.quiet);

    // Load and validate configuration
    tracing::info!("Loading configuration from: {}", cli.config.display());
    let (config, config_hash) = load_config_with_hash(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    tracing::info!("Configuration loaded successfully (hash: {})", config_hash);

    match cli.command {
        Command::Run { sources, .. } => handle_run(&config, &config_hash, &sources).await,
        Command::Check { source, .. } => handle_check(&config, source.as_deref()).await,
        Command::Recrawl { source, keys, touch } => {
            handle_recrawl(&config, &config_hash, &source, keys, touch).await
        }
    }
}

/// Sets up the logging/tracing subscriber based on verbosity level
fn setup_logging(verbose: u8, quiet: bool) {
    let filter = if quiet {
        // Only show errors
        EnvFilter::new("error")
    } else {
        match verbose {
            0 => EnvFilter::new("medcrawl=info,warn"),
            1 => EnvFilter::new("medcrawl=debug,info"),
            2 => EnvFilter::new("medcrawl=trace,debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .init();
}

/// Resolves `--source` arguments; none means every configured source
fn select_sources(config: &Config, ids: &[String]) -> anyhow::Result<Vec<SourceConfig>> {
    if ids.is_empty() {
        return Ok(config.sources.clone());
    }
    ids.iter()
        .map(|id| {
            config
                .source(id)
                .cloned()
                .with_context(|| format!("unknown source '{}'", id))
        })
        .collect()
}

/// Handles `run`: traverses the selected sources
async fn handle_run(config: &Config, config_hash: &str, ids: &[String]) -> anyhow::Result<ExitCode> {
    let sources = select_sources(config, ids)?;
    if sources.is_empty() {
        bail!("no sources configured");
    }

    let report = crawl(config, config_hash, sources).await?;
    print_run_summary(&report);

    if report.any_fatal() {
        let failed: Vec<&str> = report
            .sources
            .iter()
            .filter(|s| s.fatal)
            .map(|s| s.source_id.as_str())
            .collect();
        eprintln!("Failed sources: {}", failed.join(", "));
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}

/// Handles `check`: prints stored status and missing keys per source
async fn handle_check(config: &Config, id: Option<&str>) -> anyhow::Result<ExitCode> {
    let ids: Vec<String> = id.map(str::to_string).into_iter().collect();
    let sources = select_sources(config, &ids)?;
    let (storage, keys) = open_stores(config, &sources)?;

    {
        let storage = storage
            .lock()
            .map_err(|_| anyhow::anyhow!("storage lock poisoned"))?;
        print_source_status(&load_source_status(&*storage, &sources)?);
    }
    println!();

    let stop = interrupt_flag();
    for source in sources {
        let source_id = source.id.clone();
        let mut manager = recrawl_manager(config, source, Arc::clone(&keys), Arc::clone(&stop))?;
        let missing = manager.find_missing().await?;
        print_missing_keys(&source_id, &missing);
    }
    Ok(ExitCode::SUCCESS)
}

/// Handles `recrawl`: repairs one source
///
/// With `--keys` the list traversal is replayed for those keys only, or
/// their stored rows are touched with `--touch`. Without keys every missing
/// key is fetched.
async fn handle_recrawl(
    config: &Config,
    config_hash: &str,
    id: &str,
    keys: Vec<String>,
    touch: bool,
) -> anyhow::Result<ExitCode> {
    let source = config
        .source(id)
        .cloned()
        .with_context(|| format!("unknown source '{}'", id))?;

    if !keys.is_empty() && !touch {
        let targets: HashSet<String> = keys.into_iter().collect();
        let report = crawl_targets(config, config_hash, source, targets).await?;
        print_run_summary(&report);
        return Ok(if report.any_fatal() {
            ExitCode::FAILURE
        } else {
            ExitCode::SUCCESS
        });
    }

    let (storage, key_store) = open_stores(config, std::slice::from_ref(&source))?;
    let sink: Arc<dyn RecordSink> = match config.output.backend {
        StorageBackend::Sqlite => storage,
        StorageBackend::DocumentIndex => {
            Arc::new(Mutex::new(DocumentIndex::new(Path::new(&config.output.database_path))?))
        }
    };
    let pipeline = PipelineHandle::spawn(sink, config.pipeline.clone());
    let mut manager = recrawl_manager(config, source, key_store, interrupt_flag())?;

    let outcome = if touch {
        let missing: BTreeMap<String, DrugBase> = keys
            .into_iter()
            .map(|key| (key.clone(), DrugBase::from_key(key)))
            .collect();
        manager.recrawl(missing, RecrawlMode::UpdateOnly, &pipeline).await
    } else {
        manager.full_recrawl(RecrawlMode::Insert, &pipeline).await
    };
    let totals = pipeline.close().await?;
    let outcome = outcome?;

    print_recrawl_outcome(id, &outcome, totals.total_inserted());
    Ok(if outcome.keys_failed.is_empty() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Opens the database, creating the sources' fact tables
fn open_stores(
    config: &Config,
    sources: &[SourceConfig],
) -> anyhow::Result<(Arc<Mutex<SqliteStorage>>, Arc<dyn KeyStore>)> {
    let path = Path::new(&config.output.database_path);
    let mut storage = SqliteStorage::new(path)?;
    for source in sources {
        storage.ensure_fact_table(&source.table, config.output.unique_md5_index)?;
    }
    let storage = Arc::new(Mutex::new(storage));

    let keys: Arc<dyn KeyStore> = match config.output.backend {
        StorageBackend::Sqlite => storage.clone(),
        StorageBackend::DocumentIndex => Arc::new(Mutex::new(DocumentIndex::new(path)?)),
    };
    Ok((storage, keys))
}

fn recrawl_manager(
    config: &Config,
    source: SourceConfig,
    keys: Arc<dyn KeyStore>,
    stop: Arc<AtomicBool>,
) -> anyhow::Result<RecrawlManager> {
    let keywords = match &source.keywords_path {
        Some(path) => load_keywords(Path::new(path))?,
        None => Vec::new(),
    };
    Ok(RecrawlManager::new(&config.engine, source, keys)?
        .with_keywords(keywords)
        .with_stop_check(move || stop.load(Ordering::SeqCst)))
}

/// A flag raised by Ctrl-C
fn interrupt_flag() -> Arc<AtomicBool> {
    let flag = Arc::new(AtomicBool::new(false));
    let raised = Arc::clone(&flag);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, stopping after the current record");
            raised.store(true, Ordering::SeqCst);
        }
    });
    flag
}

fn print_recrawl_outcome(source_id: &str, outcome: &RecrawlOutcome, inserted: u64) {
    println!("=== Recrawl of {} ===\n", source_id);
    println!("  Keys requested: {}", outcome.keys_requested);
    println!("  Keys completed: {}", outcome.keys_completed);
    println!("  Items emitted: {}", outcome.items_emitted);
    println!("  Rows inserted: {}", inserted);
    if outcome.rows_touched > 0 {
        println!("  Rows touched: {}", outcome.rows_touched);
    }
    if !outcome.keys_failed.is_empty() {
        println!("  WARNING: {} key(s) failed: {}", outcome.keys_failed.len(), outcome.keys_failed.join(", "));
    }
    if outcome.stopped {
        println!("  Stopped before completion");
    }
}
