//! Crawler coordinator - main crawl orchestration logic
//!
//! This module contains the dispatch loop that coordinates all aspects of
//! a run, including:
//! - Seeding each source's traversals
//! - Admitting requests through the scheduler and spawning worker tasks
//! - Feeding responses to the protocol driver
//! - Applying retry verdicts
//! - Handling shutdown and draining in-flight work

use crate::config::{EngineConfig, PipelineConfig, SourceConfig};
use crate::crawler::protocol::{execute, Exchange, Page, ProtocolDriver};
use crate::crawler::request::{CrawlRequest, DetailRequest, ListRequest, RequestKind};
use crate::crawler::retry::{RetryPolicy, RetryVerdict};
use crate::crawler::scheduler::Scheduler;
use crate::crawler::session::SourceSession;
use crate::crawler::extract::{DetailPage, ListPage};
use crate::crawler::FetchError;
use crate::item::{clean_item, Item};
use crate::pipeline::{PipelineHandle, PipelineTotals};
use crate::state::{PageFailure, PageReport, PipelineReporter, ProgressStatus, Reporter, Stage};
use crate::storage::RecordSink;
use crate::HarvestError;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{sleep_until, Instant};

/// Per-source counters of a run
#[derive(Debug, Clone, Default)]
pub struct SourceStats {
    pub source_id: String,
    /// Fact table of the source
    pub table: String,
    /// Request attempts executed, retries included
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    /// Pages given up after retries
    pub failed_pages: u64,
    /// Items handed to the pipeline
    pub items_emitted: u64,
    /// Items dropped at the cleaning step
    pub items_dropped: u64,
    /// Requests dropped by shutdown
    pub abandoned: u64,
    /// The source ended with a fatal failure
    pub fatal: bool,
    pub last_error: Option<String>,
}

impl SourceStats {
    fn new(source: &SourceConfig) -> Self {
        Self {
            source_id: source.id.clone(),
            table: source.table.clone(),
            ..Self::default()
        }
    }

    /// Successful share of all attempts, in percent
    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            return 100.0;
        }
        self.successful_requests as f64 * 100.0 / self.total_requests as f64
    }
}

/// Summary of a finished run
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: i64,
    pub sources: Vec<SourceStats>,
    pub pipeline: PipelineTotals,
    /// The run stopped on a shutdown signal or the traversal timeout
    pub interrupted: bool,
    /// Queued and in-flight requests dropped by shutdown
    pub abandoned: u64,
}

impl RunReport {
    pub fn any_fatal(&self) -> bool {
        self.sources.iter().any(|s| s.fatal)
    }

    pub fn source(&self, id: &str) -> Option<&SourceStats> {
        self.sources.iter().find(|s| s.source_id == id)
    }
}

/// Requests a running coordinator to shut down
#[derive(Debug, Clone)]
pub struct ShutdownHandle(Arc<watch::Sender<bool>>);

impl ShutdownHandle {
    pub fn trigger(&self) {
        self.0.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.0.borrow()
    }
}

type WorkerOutput = (CrawlRequest, Exchange);

/// Main crawler coordinator structure
pub struct Coordinator {
    engine: EngineConfig,
    pipeline: PipelineConfig,
    sources: Vec<Arc<SourceConfig>>,
    sink: Arc<dyn RecordSink>,
    run_id: i64,
    keywords: HashMap<String, Vec<String>>,
    target_keys: HashMap<String, HashSet<String>>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Coordinator {
    /// Creates a new coordinator instance
    ///
    /// # Arguments
    ///
    /// * `engine` - Retry, concurrency and timeout settings
    /// * `pipeline` - Buffering thresholds of the persistence pipeline
    /// * `sources` - The sources to traverse
    /// * `sink` - Where items, audit and progress records go
    /// * `run_id` - Run the audit and progress records belong to
    pub fn new(
        engine: EngineConfig,
        pipeline: PipelineConfig,
        sources: Vec<SourceConfig>,
        sink: Arc<dyn RecordSink>,
        run_id: i64,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            engine,
            pipeline,
            sources: sources.into_iter().map(Arc::new).collect(),
            sink,
            run_id,
            keywords: HashMap::new(),
            target_keys: HashMap::new(),
            shutdown_tx: Arc::new(shutdown_tx),
            shutdown_rx,
        }
    }

    /// Search terms of a keyword-seeded source
    pub fn with_keywords(mut self, source_id: impl Into<String>, keywords: Vec<String>) -> Self {
        self.keywords.insert(source_id.into(), keywords);
        self
    }

    /// Restricts a source to the given drug keys (recrawl mode)
    pub fn with_target_keys(mut self, source_id: impl Into<String>, keys: HashSet<String>) -> Self {
        self.target_keys.insert(source_id.into(), keys);
        self
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle(Arc::clone(&self.shutdown_tx))
    }

    pub fn run_id(&self) -> i64 {
        self.run_id
    }

    /// Runs every source to completion or until shutdown
    ///
    /// The loop:
    /// 1. Dispatches every request the scheduler admits as a worker task
    /// 2. Waits for a worker to finish, the next wake-up deadline, a
    ///    shutdown signal or the traversal timeout
    /// 3. Feeds finished responses to the driver and applies retry verdicts
    ///
    /// On shutdown the scheduler is closed, in-flight workers get the grace
    /// period, and the pipeline is flushed before returning.
    pub async fn run(self) -> Result<RunReport, HarvestError> {
        let mut sessions = Vec::with_capacity(self.sources.len());
        for source in &self.sources {
            sessions.push(Arc::new(SourceSession::new(&self.engine, source)?));
        }

        tracing::info!(
            "Starting run {} over {} source(s)",
            self.run_id,
            self.sources.len()
        );

        let pipeline = PipelineHandle::spawn(Arc::clone(&self.sink), self.pipeline.clone());
        let mut state = RunState {
            scheduler: Scheduler::new(self.engine.global_concurrency as usize),
            sources: Vec::with_capacity(self.sources.len()),
            policy: RetryPolicy::from_config(&self.engine),
            pipeline: pipeline.clone(),
            run_id: self.run_id,
        };

        for (source, session) in self.sources.iter().zip(sessions) {
            let lane = state
                .scheduler
                .add_lane(source.effective_concurrency() as usize, source.min_delay());
            let mut driver = ProtocolDriver::new(Arc::clone(source), lane);
            if let Some(keywords) = self.keywords.get(&source.id) {
                driver = driver.with_keywords(keywords.clone());
            }
            if let Some(keys) = self.target_keys.get(&source.id) {
                driver = driver.with_target_keys(keys.clone());
            }

            state.sources.push(SourceRuntime {
                source: Arc::clone(source),
                session,
                driver,
                reporter: Box::new(PipelineReporter::new(&source.id, self.run_id, pipeline.clone())),
                stats: SourceStats::new(source),
            });
        }

        for lane in 0..state.sources.len() {
            let requests = state.sources[lane].driver.start();
            tracing::info!(
                "Source {} started with {} traversal(s)",
                state.sources[lane].source.id,
                requests.len()
            );
            state.enqueue_all(requests);
        }

        let mut workers: JoinSet<WorkerOutput> = JoinSet::new();
        let mut shutdown = self.shutdown_rx.clone();
        let deadline = self.engine.traversal_timeout().map(|t| Instant::now() + t);
        let far_future = Instant::now() + Duration::from_secs(86_400);
        let mut interrupted = false;

        loop {
            if *shutdown.borrow() {
                interrupted = true;
                break;
            }

            state.dispatch_ready(&mut workers);
            if workers.is_empty() && state.scheduler.is_idle() {
                break;
            }

            let wake = state.scheduler.next_wakeup(Instant::now());
            tokio::select! {
                Some(joined) = workers.join_next(), if !workers.is_empty() => match joined {
                    Ok((request, exchange)) => state.handle(request, exchange),
                    Err(e) => tracing::error!("Worker task failed: {}", e),
                },
                _ = sleep_until(wake.unwrap_or(far_future)), if wake.is_some() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::warn!("Shutdown requested, draining run {}", self.run_id);
                        interrupted = true;
                        break;
                    }
                }
                _ = sleep_until(deadline.unwrap_or(far_future)), if deadline.is_some() => {
                    tracing::warn!("Traversal timeout reached, draining run {}", self.run_id);
                    interrupted = true;
                    break;
                }
            }
        }

        let mut abandoned = state.close_scheduler();
        abandoned += state.drain(&mut workers, self.engine.shutdown_grace()).await;

        for runtime in &mut state.sources {
            let status = if runtime.stats.fatal {
                ProgressStatus::Error
            } else if interrupted {
                ProgressStatus::Paused
            } else {
                ProgressStatus::Finished
            };
            runtime.reporter.finish(status);
            tracing::info!(
                "Source {} {}: {} requests, {} items, {} failed pages",
                runtime.source.id,
                status.to_db_string(),
                runtime.stats.total_requests,
                runtime.stats.items_emitted,
                runtime.stats.failed_pages
            );
        }

        let totals = pipeline.close().await?;
        tracing::info!(
            "Run {} done: {} rows inserted, {} already stored",
            self.run_id,
            totals.total_inserted(),
            totals.skipped_existing
        );

        Ok(RunReport {
            run_id: self.run_id,
            sources: state.sources.into_iter().map(|s| s.stats).collect(),
            pipeline: totals,
            interrupted,
            abandoned,
        })
    }
}

/// Everything the dispatch loop knows about one source
struct SourceRuntime {
    source: Arc<SourceConfig>,
    session: Arc<SourceSession>,
    driver: ProtocolDriver,
    reporter: Box<dyn Reporter>,
    stats: SourceStats,
}

/// Mutable state of one run, confined to the coordinator task
struct RunState {
    scheduler: Scheduler,
    sources: Vec<SourceRuntime>,
    policy: RetryPolicy,
    pipeline: PipelineHandle,
    run_id: i64,
}

impl RunState {
    /// Spawns a worker for every request admitted right now
    fn dispatch_ready(&mut self, workers: &mut JoinSet<WorkerOutput>) {
        let now = Instant::now();
        while let Some(dispatch) = self.scheduler.next_ready(now) {
            let runtime = &self.sources[dispatch.request.lane];
            let session = Arc::clone(&runtime.session);
            let source = Arc::clone(&runtime.source);

            tracing::debug!(
                "Source {} requesting {} page {} (attempt {})",
                source.id,
                kind_name(&dispatch.request.kind),
                dispatch.request.page(),
                dispatch.request.attempt
            );

            // The worker owns the whole dispatch so its slots stay taken
            // until the exchange is over
            workers.spawn(async move {
                let dispatch = dispatch;
                let exchange = execute(&session, &source, &dispatch.request.kind).await;
                (dispatch.into_request(), exchange)
            });
        }
    }

    fn enqueue(&mut self, request: CrawlRequest) {
        if let Err(request) = self.scheduler.enqueue(request) {
            self.abandon(&request);
        }
    }

    fn enqueue_all(&mut self, requests: Vec<CrawlRequest>) {
        for request in requests {
            self.enqueue(request);
        }
    }

    fn abandon(&mut self, request: &CrawlRequest) {
        let runtime = &mut self.sources[request.lane];
        runtime.stats.abandoned += 1;
        if let RequestKind::List(list) = &request.kind {
            runtime.driver.on_list_abandoned(list);
        }
    }

    /// Processes one finished exchange
    fn handle(&mut self, request: CrawlRequest, exchange: Exchange) {
        let Exchange {
            generation,
            api_url,
            params,
            result,
        } = exchange;

        let stats = &mut self.sources[request.lane].stats;
        stats.total_requests += 1;

        match result {
            Ok(page) => {
                stats.successful_requests += 1;
                let lane = request.lane;
                match (request.kind, page) {
                    (RequestKind::List(list), Page::List(page)) => {
                        self.on_list_page(lane, list, page, api_url, params)
                    }
                    (RequestKind::Detail(detail), Page::Detail(page)) => {
                        self.on_detail_page(lane, detail, page, api_url, params)
                    }
                    (kind, _) => tracing::error!("Response does not match request {:?}", kind),
                }
            }
            Err(error) => {
                stats.failed_requests += 1;
                self.on_failure(request, generation, api_url, params, error);
            }
        }
    }

    fn on_list_page(&mut self, lane: usize, list: ListRequest, page: ListPage, api_url: String, params: Value) {
        let runtime = &mut self.sources[lane];
        let event_id = runtime.reporter.page_ok(PageReport {
            stage: Stage::List,
            page_no: list.page,
            total_pages: page.total_pages,
            items_found: page.record_count as u32,
            items_stored: 0,
            params,
            api_url,
            parent_event_id: None,
            reference_id: list.keyword.clone(),
        });

        tracing::debug!(
            "Source {} list page {}/{} with {} drug(s)",
            runtime.source.id,
            list.page,
            page.total_pages.map_or_else(|| "?".to_string(), |t| t.to_string()),
            page.drugs.len()
        );

        let step = runtime.driver.on_list_page(&list, page, &event_id);
        if step.stop_listing {
            let purged = self
                .scheduler
                .purge(lane, |r| matches!(r.kind, RequestKind::List(_)));
            tracing::debug!("Dropped {} queued list request(s) of lane {}", purged.len(), lane);
            let driver = &mut self.sources[lane].driver;
            for request in &purged {
                if let RequestKind::List(list) = &request.kind {
                    driver.on_list_abandoned(list);
                }
            }
        }
        self.enqueue_all(step.requests);
    }

    fn on_detail_page(&mut self, lane: usize, detail: DetailRequest, page: DetailPage, api_url: String, params: Value) {
        let (items, next) = self.sources[lane].driver.on_detail_page(&detail, &page);
        let stored = self.emit_items(lane, items);

        self.sources[lane].reporter.page_ok(PageReport {
            stage: Stage::Detail,
            page_no: detail.page,
            total_pages: page.total_pages,
            items_found: page.rows.len() as u32,
            items_stored: stored,
            params,
            api_url,
            parent_event_id: detail.parent_event_id.clone(),
            reference_id: Some(detail.drug.drug_key.clone()),
        });

        if let Some(next) = next {
            self.enqueue(next);
        }
    }

    /// Cleans items and hands the survivors to the pipeline
    fn emit_items(&mut self, lane: usize, items: Vec<Item>) -> u32 {
        let runtime = &mut self.sources[lane];
        let mut stored = 0;

        for item in items {
            match clean_item(item) {
                Ok(item) => {
                    if self.pipeline.send(item) {
                        stored += 1;
                    } else {
                        tracing::warn!("Pipeline closed, item of {} lost", runtime.source.id);
                    }
                }
                Err(e) => {
                    runtime.stats.items_dropped += 1;
                    tracing::warn!("Source {} dropped item: {}", runtime.source.id, e);
                }
            }
        }

        runtime.stats.items_emitted += u64::from(stored);
        stored
    }

    /// Applies the retry verdict for a failed attempt
    fn on_failure(&mut self, request: CrawlRequest, generation: u64, api_url: String, params: Value, error: FetchError) {
        let source_id = self.sources[request.lane].source.id.clone();

        match self.policy.decide(&error, request.attempt) {
            RetryVerdict::RetryNow => {
                tracing::debug!("Source {} retrying after {}", source_id, error);
                self.enqueue(request.retry());
            }
            RetryVerdict::RetryAfter(delay) => {
                tracing::debug!(
                    "Source {} attempt {} failed ({}), retrying in {:?}",
                    source_id,
                    request.attempt,
                    error,
                    delay
                );
                if let Err(request) = self.scheduler.enqueue_at(request.retry(), Instant::now() + delay) {
                    self.abandon(&request);
                }
            }
            RetryVerdict::CleanSlateRetry => {
                tracing::info!(
                    "Source {} starting over on a fresh session ({})",
                    source_id,
                    error
                );
                match self.sources[request.lane].session.reset(generation) {
                    Ok(_) => self.enqueue(request.retry()),
                    Err(reset_error) => self.give_up(request, api_url, params, reset_error),
                }
            }
            RetryVerdict::GiveUp => self.give_up(request, api_url, params, error),
        }
    }

    /// Surfaces a failure that will not be retried
    ///
    /// Network failures abandon the page only; exhausted Logic failures and
    /// Fatal failures also mark the source as failed.
    fn give_up(&mut self, request: CrawlRequest, api_url: String, params: Value, error: FetchError) {
        let run_id = self.run_id;
        let runtime = &mut self.sources[request.lane];
        runtime.stats.failed_pages += 1;
        runtime.stats.last_error = Some(error.to_string());

        if matches!(error, FetchError::Network { .. }) {
            tracing::warn!(
                "Run {}: source {} gave up on {} after {} attempt(s): {}",
                run_id,
                runtime.source.id,
                error.url(),
                request.attempt,
                error
            );
        } else {
            runtime.stats.fatal = true;
            tracing::error!(
                "Run {}: source {} failed on {}: {}",
                run_id,
                runtime.source.id,
                error.url(),
                error
            );
        }

        let (stage, page_no, parent_event_id, reference_id) = match &request.kind {
            RequestKind::List(list) => (Stage::List, list.page, None, list.keyword.clone()),
            RequestKind::Detail(detail) => (
                Stage::Detail,
                detail.page,
                detail.parent_event_id.clone(),
                Some(detail.drug.drug_key.clone()),
            ),
        };
        runtime.reporter.page_error(PageFailure {
            stage,
            page_no,
            params,
            api_url,
            error: error.to_string(),
            parent_event_id,
            reference_id,
        });

        if let RequestKind::List(list) = &request.kind {
            let follow_up = runtime.driver.on_list_failed(list);
            self.enqueue_all(follow_up);
        }
    }

    /// Refuses new work; returns the number of queued requests dropped
    fn close_scheduler(&mut self) -> u64 {
        let dropped = self.scheduler.close();
        for request in &dropped {
            self.abandon(request);
        }
        if !dropped.is_empty() {
            tracing::warn!("Abandoned {} queued request(s)", dropped.len());
        }
        dropped.len() as u64
    }

    /// Waits for in-flight workers up to `grace`, then aborts the rest
    ///
    /// Returns the number of workers aborted. Follow-up requests produced
    /// while draining are refused by the closed scheduler and counted as
    /// abandoned there.
    async fn drain(&mut self, workers: &mut JoinSet<WorkerOutput>, grace: Duration) -> u64 {
        if workers.is_empty() {
            return 0;
        }

        let deadline = sleep_until(Instant::now() + grace);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                joined = workers.join_next() => match joined {
                    Some(Ok((request, exchange))) => self.handle(request, exchange),
                    Some(Err(e)) => tracing::error!("Worker task failed: {}", e),
                    None => return 0,
                },
                _ = &mut deadline => {
                    let remaining = workers.len() as u64;
                    tracing::warn!(
                        "Grace period over, abandoning {} in-flight request(s)",
                        remaining
                    );
                    workers.abort_all();
                    while workers.join_next().await.is_some() {}
                    return remaining;
                }
            }
        }
    }
}

fn kind_name(kind: &RequestKind) -> &'static str {
    match kind {
        RequestKind::List(_) => "list",
        RequestKind::Detail(_) => "detail",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{SqliteStorage, Storage};
    use serde_json::json;
    use std::sync::Mutex;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn source(server: &MockServer) -> SourceConfig {
        toml::from_str(&format!(
            r#"
            id = "demo"
            table = "demo_items"
            list-url = "{uri}/list"
            detail-url = "{uri}/detail"
            concurrency = 2

            [list]
            page-param = "pageNum"
            items-path = "data.list"
            total-pages-path = "data.pages"

            [detail]
            key-param = "drugId"
            items-path = "data.rows"

            [drug-fields]
            drug-key = "drugId"
            drug-name = "name"

            [detail-fields]
            hospital-name = "hospital"
            "#,
            uri = server.uri()
        ))
        .unwrap()
    }

    fn engine() -> EngineConfig {
        EngineConfig {
            retry_base_delay_ms: 10,
            retry_max_jitter_ms: 0,
            shutdown_grace_secs: 1,
            ..EngineConfig::default()
        }
    }

    fn storage() -> Arc<Mutex<SqliteStorage>> {
        let mut storage = SqliteStorage::new_in_memory().unwrap();
        storage.ensure_fact_table("demo_items", true).unwrap();
        Arc::new(Mutex::new(storage))
    }

    /// Run state of one source, as `run` builds it
    fn run_state(engine: &EngineConfig, source: SourceConfig) -> RunState {
        let source = Arc::new(source);
        let sink: Arc<dyn RecordSink> = storage();
        let pipeline = PipelineHandle::spawn(sink, PipelineConfig::default());
        let mut scheduler = Scheduler::new(engine.global_concurrency as usize);
        let lane = scheduler.add_lane(source.effective_concurrency() as usize, source.min_delay());

        RunState {
            scheduler,
            sources: vec![SourceRuntime {
                session: Arc::new(SourceSession::new(engine, &source).unwrap()),
                driver: ProtocolDriver::new(Arc::clone(&source), lane),
                reporter: Box::new(PipelineReporter::new(&source.id, 1, pipeline.clone())),
                stats: SourceStats::new(&source),
                source,
            }],
            policy: RetryPolicy::from_config(engine),
            pipeline,
            run_id: 1,
        }
    }

    #[tokio::test]
    async fn test_network_failure_backs_off_exponentially() {
        let server = MockServer::start().await;
        let engine = EngineConfig {
            retry_base_delay_ms: 1000,
            retry_max_jitter_ms: 0,
            ..EngineConfig::default()
        };
        let mut state = run_state(&engine, source(&server));
        let seeds = state.sources[0].driver.start();
        state.enqueue_all(seeds);

        let mut now = Instant::now();
        for expected in [Duration::from_secs(1), Duration::from_secs(2)] {
            let request = state.scheduler.next_ready(now).unwrap().into_request();
            let before = Instant::now();
            state.on_failure(request, 0, "u".to_string(), Value::Null, FetchError::network("u", "reset"));
            let after = Instant::now();

            let wake = state.scheduler.next_wakeup(after).unwrap();
            assert!(wake >= before + expected && wake <= after + expected);
            assert!(state.scheduler.next_ready(after).is_none());
            now = wake;
        }

        // The third attempt is the last one
        let request = state.scheduler.next_ready(now).unwrap().into_request();
        assert_eq!(request.attempt, 3);
        state.on_failure(request, 0, "u".to_string(), Value::Null, FetchError::network("u", "reset"));
        assert!(state.scheduler.is_idle());
        assert_eq!(state.sources[0].stats.failed_pages, 1);
        assert!(!state.sources[0].stats.fatal);
    }

    #[tokio::test]
    async fn test_run_single_page() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/list"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {"pages": 1, "list": [{"drugId": "A1", "name": "甲"}, {"drugId": "A2", "name": "乙"}]}
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/detail"))
            .and(body_string_contains("drugId=A1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {"rows": [{"hospital": "一院"}, {"hospital": "二院"}]}
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/detail"))
            .and(body_string_contains("drugId=A2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": {"rows": []}})))
            .mount(&server)
            .await;

        let storage = storage();
        let coordinator = Coordinator::new(
            engine(),
            PipelineConfig::default(),
            vec![source(&server)],
            storage.clone(),
            1,
        );
        let report = coordinator.run().await.unwrap();

        assert!(!report.interrupted);
        assert!(!report.any_fatal());
        let stats = report.source("demo").unwrap();
        assert_eq!(stats.total_requests, 3);
        assert_eq!(stats.items_emitted, 3);
        assert_eq!(report.pipeline.total_inserted(), 3);

        let storage = storage.lock().unwrap();
        assert_eq!(storage.count_rows("demo_items").unwrap(), 3);
        let progress = storage.load_progress("demo").unwrap().unwrap();
        assert_eq!(progress.status, ProgressStatus::Finished);
    }

    #[tokio::test]
    async fn test_fatal_list_marks_source_failed() {
        let server = MockServer::start().await;
        Mock::given(path("/list"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let storage = storage();
        let report = Coordinator::new(
            engine(),
            PipelineConfig::default(),
            vec![source(&server)],
            storage.clone(),
            1,
        )
        .run()
        .await
        .unwrap();

        let stats = report.source("demo").unwrap();
        assert!(stats.fatal);
        assert_eq!(stats.total_requests, 1);
        assert_eq!(stats.failed_pages, 1);

        let storage = storage.lock().unwrap();
        let progress = storage.load_progress("demo").unwrap().unwrap();
        assert_eq!(progress.status, ProgressStatus::Error);
        assert_eq!(progress.errors_count, 1);
        assert_eq!(storage.count_audit("demo", Some(Stage::Error)).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_before_start_pauses_sources() {
        let server = MockServer::start().await;
        let storage = storage();
        let coordinator = Coordinator::new(
            engine(),
            PipelineConfig::default(),
            vec![source(&server)],
            storage.clone(),
            1,
        );
        let handle = coordinator.shutdown_handle();
        handle.trigger();
        assert!(handle.is_triggered());

        let report = coordinator.run().await.unwrap();
        assert!(report.interrupted);
        assert_eq!(report.abandoned, 1);
        assert_eq!(report.source("demo").unwrap().total_requests, 0);

        let storage = storage.lock().unwrap();
        let progress = storage.load_progress("demo").unwrap().unwrap();
        assert_eq!(progress.status, ProgressStatus::Paused);
    }
}
