//! Crawler module for traversing two-tier JSON APIs
//!
//! This module contains the core crawling logic, including:
//! - HTTP fetching and failure classification
//! - Response-path extraction and the list → detail protocol driver
//! - Request scheduling, pacing and retry verdicts
//! - Overall run coordination

mod coordinator;
mod error;
mod extract;
mod fetcher;
mod protocol;
mod request;
mod retry;
mod scheduler;
mod session;

pub use coordinator::{Coordinator, RunReport, ShutdownHandle, SourceStats};
pub use error::FetchError;
pub use extract::{extract_path, parse_detail_page, parse_list_page, DetailPage, ListPage};
pub use fetcher::{build_http_client, check_response_code, fetch_json, fetch_token, RequestSpec};
pub use protocol::{
    build_detail_items, detail_request_spec, execute, list_request_spec, Exchange, Page, ProtocolDriver,
};
pub use request::{CrawlRequest, DetailRequest, ListRequest, RequestKind};
pub use retry::{RetryPolicy, RetryVerdict};
pub use scheduler::{Dispatch, Scheduler};
pub use session::{Session, SourceSession};

use crate::config::{load_keywords, Config, SourceConfig, StorageBackend};
use crate::storage::{DocumentIndex, RecordSink, RunStatus, SqliteStorage, Storage, StorageError};
use crate::HarvestError;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Runs a complete crawl of the given sources
///
/// This is the main entry point for starting a crawl. It will:
/// 1. Open the database and create the sources' fact tables
/// 2. Record a new run
/// 3. Load keyword files of keyword-seeded sources
/// 4. Traverse every source until done or interrupted (Ctrl-C)
/// 5. Mark the run completed, interrupted or failed
///
/// # Arguments
///
/// * `config` - The loaded configuration
/// * `config_hash` - Hash of the configuration file, stored with the run
/// * `sources` - The sources to traverse
///
/// # Returns
///
/// * `Ok(RunReport)` - The run finished (possibly with failed sources)
/// * `Err(HarvestError)` - The run could not be set up
pub async fn crawl(config: &Config, config_hash: &str, sources: Vec<SourceConfig>) -> Result<RunReport, HarvestError> {
    run_sources(config, config_hash, sources, HashMap::new()).await
}

/// Re-traverses one source looking only for the given drug keys
///
/// The list traversal stops as soon as every key was found.
pub async fn crawl_targets(
    config: &Config,
    config_hash: &str,
    source: SourceConfig,
    keys: HashSet<String>,
) -> Result<RunReport, HarvestError> {
    let targets = HashMap::from([(source.id.clone(), keys)]);
    run_sources(config, config_hash, vec![source], targets).await
}

async fn run_sources(
    config: &Config,
    config_hash: &str,
    sources: Vec<SourceConfig>,
    targets: HashMap<String, HashSet<String>>,
) -> Result<RunReport, HarvestError> {
    let db_path = Path::new(&config.output.database_path);
    let mut storage = SqliteStorage::new(db_path)?;
    for source in &sources {
        storage.ensure_fact_table(&source.table, config.output.unique_md5_index)?;
    }
    let run_id = storage.create_run(config_hash)?;
    let storage = Arc::new(Mutex::new(storage));

    let sink: Arc<dyn RecordSink> = match config.output.backend {
        StorageBackend::Sqlite => storage.clone(),
        StorageBackend::DocumentIndex => Arc::new(Mutex::new(DocumentIndex::new(db_path)?)),
    };

    let mut coordinator = Coordinator::new(
        config.engine.clone(),
        config.pipeline.clone(),
        sources.clone(),
        sink,
        run_id,
    );
    for source in &sources {
        if let Some(path) = &source.keywords_path {
            let keywords = load_keywords(Path::new(path))?;
            tracing::info!("Loaded {} keyword(s) for {}", keywords.len(), source.id);
            coordinator = coordinator.with_keywords(&source.id, keywords);
        }
    }
    for (source_id, keys) in targets {
        coordinator = coordinator.with_target_keys(source_id, keys);
    }

    let shutdown = coordinator.shutdown_handle();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, shutting down");
            shutdown.trigger();
        }
    });

    let result = coordinator.run().await;
    interrupt.abort();

    let status = match &result {
        Ok(report) if report.interrupted => RunStatus::Interrupted,
        Ok(report) if report.any_fatal() => RunStatus::Failed,
        Ok(_) => RunStatus::Completed,
        Err(_) => RunStatus::Failed,
    };
    {
        let mut storage = storage
            .lock()
            .map_err(|_| StorageError::Database("storage lock poisoned".to_string()))?;
        storage.complete_run(run_id, status)?;
    }

    result
}
