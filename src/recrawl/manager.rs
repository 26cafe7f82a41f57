use crate::config::{EngineConfig, SourceConfig};
use crate::crawler::{
    execute, CrawlRequest, DetailRequest, FetchError, Page, ProtocolDriver, RequestKind, RetryPolicy,
    RetryVerdict, SourceSession,
};
use crate::item::{clean_item, DrugBase};
use crate::pipeline::PipelineHandle;
use crate::state::SourcePacing;
use crate::storage::KeyStore;
use crate::HarvestError;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::time::Instant;

/// What `recrawl` does with each missing key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecrawlMode {
    /// Fetch the key's detail pages and insert the items
    #[default]
    Insert,
    /// Bump `updated_at` on the key's stored rows without fetching
    UpdateOnly,
}

/// Result of one `recrawl` pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecrawlOutcome {
    pub keys_requested: usize,
    pub keys_completed: usize,
    pub keys_failed: Vec<String>,
    /// Items handed to the pipeline
    pub items_emitted: u64,
    /// Rows whose `updated_at` was bumped
    pub rows_touched: u64,
    /// The stop check ended the pass early
    pub stopped: bool,
}

type StopCheck = Arc<dyn Fn() -> bool + Send + Sync>;

/// Detects and repairs gaps between a source's remote catalog and its table
///
/// Requests run one at a time on the manager's own task. Pacing and
/// backoff delays await a timer; nothing blocks a thread.
pub struct RecrawlManager {
    source: Arc<SourceConfig>,
    keys: Arc<dyn KeyStore>,
    session: SourceSession,
    policy: RetryPolicy,
    pacing: SourcePacing,
    keywords: Vec<String>,
    stop_check: StopCheck,
}

impl RecrawlManager {
    pub fn new(engine: &EngineConfig, source: SourceConfig, keys: Arc<dyn KeyStore>) -> Result<Self, HarvestError> {
        let session = SourceSession::new(engine, &source)?;
        Ok(Self {
            pacing: SourcePacing::new(source.min_delay()),
            source: Arc::new(source),
            keys,
            session,
            policy: RetryPolicy::from_config(engine),
            keywords: Vec::new(),
            stop_check: Arc::new(|| false),
        })
    }

    /// Search terms of a keyword-seeded source
    pub fn with_keywords(mut self, keywords: Vec<String>) -> Self {
        self.keywords = keywords;
        self
    }

    /// Callback polled between records; returning true stops the pass
    pub fn with_stop_check<F>(mut self, stop_check: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        self.stop_check = Arc::new(stop_check);
        self
    }

    pub fn source(&self) -> &SourceConfig {
        &self.source
    }

    fn should_stop(&self) -> bool {
        (self.stop_check)()
    }

    /// Replays the list traversal without detail fan-out
    ///
    /// Pages are visited in order. The first record seen for a key wins.
    ///
    /// # Errors
    ///
    /// Fails when a list page cannot be fetched after retries, since a
    /// partial catalog would under-report missing keys.
    pub async fn fetch_all_keys(&mut self) -> Result<BTreeMap<String, DrugBase>, HarvestError> {
        let mut driver = ProtocolDriver::new(Arc::clone(&self.source), 0).with_keywords(self.keywords.clone());
        let mut queue: VecDeque<CrawlRequest> = driver.start().into();
        let mut catalog = BTreeMap::new();

        while let Some(request) = queue.pop_front() {
            if self.should_stop() {
                tracing::info!("Stop requested, catalog of {} is partial", self.source.id);
                break;
            }
            let RequestKind::List(list) = &request.kind else {
                continue;
            };

            let page = match self.fetch(&request.kind).await? {
                Page::List(page) => page,
                Page::Detail(_) => continue,
            };
            for drug in &page.drugs {
                catalog
                    .entry(drug.drug_key.clone())
                    .or_insert_with(|| drug.clone());
            }

            let step = driver.on_list_page(list, page, "");
            queue.extend(
                step.requests
                    .into_iter()
                    .filter(|r| matches!(r.kind, RequestKind::List(_))),
            );
        }

        tracing::info!("Remote catalog of {} holds {} key(s)", self.source.id, catalog.len());
        Ok(catalog)
    }

    /// Remote keys absent from the source's table
    pub async fn find_missing(&mut self) -> Result<BTreeMap<String, DrugBase>, HarvestError> {
        let mut remote = self.fetch_all_keys().await?;
        let local = self.local_keys().await?;

        remote.retain(|key, _| !local.contains(key));
        tracing::info!(
            "Source {}: {} key(s) stored locally, {} missing",
            self.source.id,
            local.len(),
            remote.len()
        );
        Ok(remote)
    }

    async fn local_keys(&self) -> Result<HashSet<String>, HarvestError> {
        let keys = Arc::clone(&self.keys);
        let table = self.source.table.clone();
        let stored = tokio::task::spawn_blocking(move || keys.distinct_drug_keys(&table))
            .await
            .map_err(|e| HarvestError::Pipeline(format!("key lookup task failed: {}", e)))??;
        Ok(stored.into_iter().collect())
    }

    /// Repairs the given keys
    ///
    /// In insert mode every key's detail chain is fetched and the items go
    /// through `pipeline`; a key whose chain fails is reported and skipped.
    /// In update-only mode the stored rows of each key are touched.
    pub async fn recrawl(
        &mut self,
        missing: BTreeMap<String, DrugBase>,
        mode: RecrawlMode,
        pipeline: &PipelineHandle,
    ) -> Result<RecrawlOutcome, HarvestError> {
        let mut outcome = RecrawlOutcome {
            keys_requested: missing.len(),
            ..RecrawlOutcome::default()
        };

        for (key, drug) in missing {
            if self.should_stop() {
                outcome.stopped = true;
                break;
            }

            match mode {
                RecrawlMode::Insert => match self.recrawl_key(drug, pipeline).await {
                    Ok(emitted) => {
                        outcome.items_emitted += emitted;
                        outcome.keys_completed += 1;
                    }
                    Err(e) => {
                        tracing::warn!("Recrawl of {} key {} failed: {}", self.source.id, key, e);
                        outcome.keys_failed.push(key);
                    }
                },
                RecrawlMode::UpdateOnly => {
                    let touched = self.touch(&key).await?;
                    if touched == 0 {
                        tracing::warn!("Key {} has no stored rows in {}", key, self.source.table);
                    }
                    outcome.rows_touched += touched;
                    outcome.keys_completed += 1;
                }
            }
        }

        tracing::info!(
            "Recrawl of {}: {}/{} key(s) done, {} item(s), {} row(s) touched",
            self.source.id,
            outcome.keys_completed,
            outcome.keys_requested,
            outcome.items_emitted,
            outcome.rows_touched
        );
        Ok(outcome)
    }

    /// `recrawl(find_missing())`
    pub async fn full_recrawl(&mut self, mode: RecrawlMode, pipeline: &PipelineHandle) -> Result<RecrawlOutcome, HarvestError> {
        let missing = self.find_missing().await?;
        self.recrawl(missing, mode, pipeline).await
    }

    /// Fetches every detail page of one drug; returns items emitted
    async fn recrawl_key(&mut self, drug: DrugBase, pipeline: &PipelineHandle) -> Result<u64, FetchError> {
        let driver = ProtocolDriver::new(Arc::clone(&self.source), 0);
        let mut next = Some(DetailRequest {
            drug: Arc::new(drug),
            page: 1,
            list_page: 0,
            parent_event_id: None,
        });
        let mut emitted = 0;

        while let Some(request) = next.take() {
            let kind = RequestKind::Detail(request);
            let page = match self.fetch(&kind).await? {
                Page::Detail(page) => page,
                Page::List(_) => break,
            };
            let RequestKind::Detail(request) = kind else {
                break;
            };

            let (items, follow_up) = driver.on_detail_page(&request, &page);
            for item in items {
                match clean_item(item) {
                    Ok(item) => {
                        if pipeline.send(item) {
                            emitted += 1;
                        }
                    }
                    Err(e) => tracing::warn!("Dropped recrawled item of {}: {}", request.drug.drug_key, e),
                }
            }

            next = follow_up.and_then(|r| match r.kind {
                RequestKind::Detail(detail) => Some(detail),
                RequestKind::List(_) => None,
            });
        }

        Ok(emitted)
    }

    async fn touch(&self, key: &str) -> Result<u64, HarvestError> {
        let keys = Arc::clone(&self.keys);
        let table = self.source.table.clone();
        let key = key.to_string();
        let touched = tokio::task::spawn_blocking(move || keys.touch_drug_key(&table, &key))
            .await
            .map_err(|e| HarvestError::Pipeline(format!("touch task failed: {}", e)))??;
        Ok(touched)
    }

    /// Executes one request with pacing and the retry policy
    async fn fetch(&mut self, kind: &RequestKind) -> Result<Page, FetchError> {
        let mut attempt = 1;
        loop {
            self.pace().await;
            let exchange = execute(&self.session, &self.source, kind).await;
            let error = match exchange.result {
                Ok(page) => return Ok(page),
                Err(error) => error,
            };

            match self.policy.decide(&error, attempt) {
                RetryVerdict::RetryNow => {}
                RetryVerdict::RetryAfter(delay) => {
                    tracing::debug!("{} (attempt {}), retrying in {:?}", error, attempt, delay);
                    tokio::time::sleep(delay).await;
                }
                RetryVerdict::CleanSlateRetry => {
                    tracing::info!("{}, starting over on a fresh session", error);
                    self.session.reset(exchange.generation)?;
                }
                RetryVerdict::GiveUp => return Err(error),
            }
            attempt += 1;
        }
    }

    async fn pace(&mut self) {
        if let Some(wait) = self.pacing.time_until_next_request(Instant::now()) {
            tokio::time::sleep(wait).await;
        }
        self.pacing.record_request(Instant::now());
    }
}
