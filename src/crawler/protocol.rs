//! Two-tier protocol driver
//!
//! Per source, a traversal walks the list endpoint page by page; every drug
//! found there spawns a detail chain, and every detail row becomes an
//! `Item`. The driver is pure bookkeeping: it turns parsed pages into
//! follow-up requests and items, while the coordinator does the I/O.

use crate::config::{AuthMode, Pagination, SourceConfig};
use crate::crawler::extract::{parse_detail_page, parse_list_page, DetailPage, ListPage};
use crate::crawler::fetcher::{check_response_code, fetch_json, fetch_token, RequestSpec};
use crate::crawler::request::{CrawlRequest, DetailRequest, ListRequest, RequestKind};
use crate::crawler::session::SourceSession;
use crate::crawler::FetchError;
use crate::item::{DrugBase, Item, ItemContext};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

/// A successfully parsed response
#[derive(Debug, Clone)]
pub enum Page {
    List(ListPage),
    Detail(DetailPage),
}

/// Outcome of executing one request
#[derive(Debug)]
pub struct Exchange {
    /// Session generation the request ran on
    pub generation: u64,
    pub api_url: String,
    /// Parameters sent, echoed into audit events
    pub params: Value,
    pub result: Result<Page, FetchError>,
}

/// Executes one list or detail request on the source's current session
///
/// In token mode a fresh token is fetched before every list request.
pub async fn execute(session: &SourceSession, source: &SourceConfig, kind: &RequestKind) -> Exchange {
    let current = session.current();
    let mut spec = match kind {
        RequestKind::List(list) => list_request_spec(source, list),
        RequestKind::Detail(detail) => detail_request_spec(source, detail),
    };

    let result = async {
        if let (RequestKind::List(_), AuthMode::TokenPerRequest, Some(token)) =
            (kind, source.auth_mode, source.token.as_ref())
        {
            let value = fetch_token(&current.client, token).await?;
            spec.params.insert(token.param_name.clone(), Value::String(value));
        }

        let body = fetch_json(&current.client, &spec).await?;
        check_response_code(&source.response, &body, &spec.url)?;

        match kind {
            RequestKind::List(_) => parse_list_page(source, &body, &spec.url).map(Page::List),
            RequestKind::Detail(_) => parse_detail_page(source, &body, &spec.url).map(Page::Detail),
        }
    }
    .await;

    Exchange {
        generation: current.generation,
        api_url: spec.url.clone(),
        params: spec.params_echo(),
        result,
    }
}

fn static_params(params: &BTreeMap<String, Value>) -> Map<String, Value> {
    params.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
}

/// Builds the request of one list page
///
/// `request.page` is 1-based; the page parameter is shifted by the
/// source's start page and offsets are `(page - 1) * page_size`.
pub fn list_request_spec(source: &SourceConfig, request: &ListRequest) -> RequestSpec {
    let list = &source.list;
    let mut params = static_params(&source.static_params);

    if let (Some(param), Some(keyword)) = (&source.keyword_param, &request.keyword) {
        params.insert(param.clone(), Value::String(keyword.clone()));
    }

    let index = request.page.saturating_sub(1);
    match list.pagination {
        Pagination::Page => {
            if let Some(param) = &list.page_param {
                params.insert(param.clone(), json!(list.start_page + index));
            }
        }
        Pagination::Offset => {
            if let Some(param) = &list.page_param {
                params.insert(param.clone(), json!(u64::from(index) * u64::from(list.page_size)));
            }
        }
        Pagination::Cursor => {
            if let (Some(param), Some(cursor)) = (&list.cursor_param, &request.cursor) {
                params.insert(param.clone(), Value::String(cursor.clone()));
            }
        }
    }

    if let Some(param) = &list.page_size_param {
        params.insert(param.clone(), json!(list.page_size));
    }

    RequestSpec {
        method: source.method,
        format: source.request_format,
        url: source.list_url.clone(),
        params,
    }
}

/// Builds the request of one detail page of a drug
pub fn detail_request_spec(source: &SourceConfig, request: &DetailRequest) -> RequestSpec {
    let detail = &source.detail;
    let mut params = static_params(&detail.static_params);
    params.insert(detail.key_param.clone(), Value::String(request.drug.drug_key.clone()));

    if let Some(param) = &detail.page_param {
        params.insert(param.clone(), json!(detail.start_page + request.page.saturating_sub(1)));
    }
    if let Some(param) = &detail.page_size_param {
        params.insert(param.clone(), json!(detail.page_size));
    }

    RequestSpec {
        method: source.method,
        format: source.request_format,
        url: source.detail_url.clone(),
        params,
    }
}

/// Flattens one detail page of a drug into items
///
/// An empty first page yields the single `has_record = false` item.
pub fn build_detail_items(source: &SourceConfig, request: &DetailRequest, page: &DetailPage) -> Vec<Item> {
    let ctx = ItemContext {
        table: &source.table,
        source_id: &source.id,
        url: &source.detail_url,
        page_no: request.list_page,
    };

    if page.rows.is_empty() {
        return if request.page == 1 {
            vec![Item::from_pair(&ctx, &request.drug, None)]
        } else {
            Vec::new()
        };
    }

    page.rows
        .iter()
        .map(|row| Item::from_pair(&ctx, &request.drug, Some(row)))
        .collect()
}

/// Follow-up of a processed list page
#[derive(Debug, Default)]
pub struct ListStep {
    pub requests: Vec<CrawlRequest>,
    /// Recrawl target set exhausted; queued list requests should be dropped
    pub stop_listing: bool,
}

#[derive(Debug)]
struct Traversal {
    keyword: Option<String>,
    /// List requests issued and not yet resolved
    open_pages: u32,
}

/// Driver state of one source
pub struct ProtocolDriver {
    source: Arc<SourceConfig>,
    lane: usize,
    keywords: std::vec::IntoIter<String>,
    traversals: Vec<Traversal>,
    active: usize,
    target_keys: Option<HashSet<String>>,
    list_closed: bool,
}

impl ProtocolDriver {
    pub fn new(source: Arc<SourceConfig>, lane: usize) -> Self {
        Self {
            source,
            lane,
            keywords: Vec::new().into_iter(),
            traversals: Vec::new(),
            active: 0,
            target_keys: None,
            list_closed: false,
        }
    }

    /// Seeds one traversal per keyword
    pub fn with_keywords(mut self, keywords: Vec<String>) -> Self {
        self.keywords = keywords.into_iter();
        self
    }

    /// Restricts the crawl to the given drug keys
    pub fn with_target_keys(mut self, keys: HashSet<String>) -> Self {
        self.target_keys = Some(keys);
        self
    }

    pub fn source(&self) -> &SourceConfig {
        &self.source
    }

    pub fn lane(&self) -> usize {
        self.lane
    }

    /// Drug keys still sought in recrawl mode
    pub fn remaining_targets(&self) -> Option<usize> {
        self.target_keys.as_ref().map(HashSet::len)
    }

    /// Initial list requests
    ///
    /// Keyword-seeded sources start up to `concurrency` traversals; the rest
    /// start as earlier ones finish.
    pub fn start(&mut self) -> Vec<CrawlRequest> {
        if self.target_keys.as_ref().map_or(false, HashSet::is_empty) {
            self.list_closed = true;
            return Vec::new();
        }

        if !self.source.is_keyword_seeded() {
            return vec![self.open_traversal(None)];
        }

        let width = self.source.effective_concurrency() as usize;
        let mut requests = Vec::new();
        while self.active < width {
            match self.keywords.next() {
                Some(keyword) => requests.push(self.open_traversal(Some(keyword))),
                None => break,
            }
        }
        if requests.is_empty() {
            tracing::warn!("Source {} has no keywords to search", self.source.id);
        }
        requests
    }

    fn open_traversal(&mut self, keyword: Option<String>) -> CrawlRequest {
        let traversal = self.traversals.len();
        self.traversals.push(Traversal {
            keyword: keyword.clone(),
            open_pages: 1,
        });
        self.active += 1;
        CrawlRequest::new(
            self.lane,
            RequestKind::List(ListRequest {
                traversal,
                keyword,
                page: 1,
                cursor: None,
            }),
        )
    }

    fn list_request(&mut self, traversal: usize, page: u32, cursor: Option<String>) -> CrawlRequest {
        let state = &mut self.traversals[traversal];
        state.open_pages += 1;
        CrawlRequest::new(
            self.lane,
            RequestKind::List(ListRequest {
                traversal,
                keyword: state.keyword.clone(),
                page,
                cursor,
            }),
        )
    }

    /// Closes one page of a traversal; true when the traversal just ended
    fn close_list_page(&mut self, traversal: usize) -> bool {
        let Some(state) = self.traversals.get_mut(traversal) else {
            return false;
        };
        if state.open_pages == 0 {
            return false;
        }
        state.open_pages -= 1;
        if state.open_pages > 0 {
            return false;
        }
        self.active = self.active.saturating_sub(1);
        true
    }

    /// Marks one list request of a traversal resolved
    ///
    /// Returns the first request of the next keyword traversal when this
    /// one just finished.
    fn resolve_list(&mut self, traversal: usize) -> Option<CrawlRequest> {
        if !self.close_list_page(traversal) {
            return None;
        }
        let state = self.traversals.get(traversal)?;

        tracing::debug!(
            "Source {} finished traversal {}{}",
            self.source.id,
            traversal,
            state
                .keyword
                .as_deref()
                .map(|k| format!(" ({})", k))
                .unwrap_or_default()
        );

        if self.list_closed {
            return None;
        }
        let keyword = self.keywords.next()?;
        Some(self.open_traversal(Some(keyword)))
    }

    /// Processes a list page
    ///
    /// # Arguments
    ///
    /// * `request` - The list request that produced the page
    /// * `page` - The parsed page
    /// * `event_id` - Audit event of the page, parent of the detail chains
    pub fn on_list_page(&mut self, request: &ListRequest, page: ListPage, event_id: &str) -> ListStep {
        let mut step = ListStep::default();

        let drugs: Vec<DrugBase> = match self.target_keys.as_mut() {
            Some(targets) => page
                .drugs
                .into_iter()
                .filter(|drug| targets.remove(&drug.drug_key))
                .collect(),
            None => page.drugs,
        };

        for drug in drugs {
            step.requests.push(CrawlRequest::new(
                self.lane,
                RequestKind::Detail(DetailRequest {
                    drug: Arc::new(drug),
                    page: 1,
                    list_page: request.page,
                    parent_event_id: Some(event_id.to_string()),
                }),
            ));
        }

        if !self.list_closed && self.target_keys.as_ref().map_or(false, HashSet::is_empty) {
            tracing::info!("Source {} found every recrawl target, stopping list traversal", self.source.id);
            self.list_closed = true;
            step.stop_listing = true;
        }

        if !self.list_closed {
            let more = self.next_list_pages(request, page.record_count, page.total_pages, page.next_cursor);
            step.requests.extend(more);
        }

        step.requests.extend(self.resolve_list(request.traversal));
        step
    }

    fn next_list_pages(
        &mut self,
        request: &ListRequest,
        record_count: usize,
        total_pages: Option<u32>,
        next_cursor: Option<String>,
    ) -> Vec<CrawlRequest> {
        let traversal = request.traversal;
        let pagination = self.source.list.pagination;
        match pagination {
            Pagination::Cursor => match next_cursor {
                Some(cursor) if record_count > 0 => {
                    vec![self.list_request(traversal, request.page + 1, Some(cursor))]
                }
                _ => Vec::new(),
            },
            Pagination::Page | Pagination::Offset => match total_pages {
                // Page 1 fans out every remaining page at once
                Some(total) if request.page == 1 => (2..=total)
                    .map(|page| self.list_request(traversal, page, None))
                    .collect(),
                Some(_) => Vec::new(),
                None if record_count > 0 => {
                    vec![self.list_request(traversal, request.page + 1, None)]
                }
                None => Vec::new(),
            },
        }
    }

    /// Accounts for a list request that was given up
    pub fn on_list_failed(&mut self, request: &ListRequest) -> Vec<CrawlRequest> {
        self.resolve_list(request.traversal).into_iter().collect()
    }

    /// Accounts for a list request dropped without execution
    ///
    /// A traversal whose last open page is dropped ends; no further keyword
    /// traversal is started for it.
    pub fn on_list_abandoned(&mut self, request: &ListRequest) {
        if self.close_list_page(request.traversal) {
            tracing::debug!(
                "Source {} dropped the rest of traversal {}",
                self.source.id,
                request.traversal
            );
        }
    }

    /// Processes a detail page
    ///
    /// Returns the page's items and the next page of the chain, if any.
    pub fn on_detail_page(&self, request: &DetailRequest, page: &DetailPage) -> (Vec<Item>, Option<CrawlRequest>) {
        let items = build_detail_items(&self.source, request, page);

        let paginated = self.source.detail.page_param.is_some();
        let more = match page.total_pages {
            Some(total) => request.page < total,
            None => !page.rows.is_empty(),
        };
        let next = (paginated && more && !page.rows.is_empty()).then(|| {
            CrawlRequest::new(
                self.lane,
                RequestKind::Detail(DetailRequest {
                    drug: Arc::clone(&request.drug),
                    page: request.page + 1,
                    list_page: request.list_page,
                    parent_event_id: request.parent_event_id.clone(),
                }),
            )
        });

        (items, next)
    }

    /// True once no list traversal is open and none remains to start
    pub fn list_done(&self) -> bool {
        self.active == 0 && (self.list_closed || self.keywords.len() == 0)
    }
}
