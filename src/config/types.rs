use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;

/// Main configuration structure for medcrawl
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,

    pub output: OutputConfig,

    #[serde(default, rename = "source")]
    pub sources: Vec<SourceConfig>,
}

impl Config {
    /// Looks up a source by its identifier
    pub fn source(&self, id: &str) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| s.id == id)
    }
}

/// Engine-wide crawl behavior
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct EngineConfig {
    /// Maximum attempts per request, including the first one
    pub max_retries: u32,

    /// Base delay of the exponential backoff (milliseconds)
    pub retry_base_delay_ms: u64,

    /// Upper bound of the random jitter added to backoff delays (milliseconds)
    pub retry_max_jitter_ms: u64,

    /// Maximum number of requests in flight across all sources
    pub global_concurrency: u32,

    /// Per-request timeout (seconds)
    pub request_timeout_secs: u64,

    /// Optional wall-clock limit for a whole traversal (seconds)
    pub traversal_timeout_secs: Option<u64>,

    /// Grace period granted to in-flight requests on shutdown (seconds)
    pub shutdown_grace_secs: u64,

    /// User agent sent with every request
    pub user_agent: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_base_delay_ms: 1000,
            retry_max_jitter_ms: 50,
            global_concurrency: 16,
            request_timeout_secs: 30,
            traversal_timeout_secs: None,
            shutdown_grace_secs: 30,
            user_agent: format!("medcrawl/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl EngineConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn traversal_timeout(&self) -> Option<Duration> {
        self.traversal_timeout_secs.map(Duration::from_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// Persistence pipeline buffering thresholds
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct PipelineConfig {
    /// Flush once this many records are buffered
    pub size_threshold: usize,

    /// Flush once this much time passed since the last flush (milliseconds)
    pub time_threshold_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            size_threshold: 100,
            time_threshold_ms: 2000,
        }
    }
}

impl PipelineConfig {
    pub fn time_threshold(&self) -> Duration {
        Duration::from_millis(self.time_threshold_ms)
    }
}

/// Output configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct OutputConfig {
    /// Path to the SQLite database file
    pub database_path: String,

    /// Which sink receives harvested items
    #[serde(default)]
    pub backend: StorageBackend,

    /// Whether fact tables carry a unique index on `md5_id`
    #[serde(default = "default_true")]
    pub unique_md5_index: bool,
}

/// Persistence backend for harvested items
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StorageBackend {
    /// Relational fact table per source with pre-query dedup
    #[default]
    Sqlite,

    /// Create-only document index keyed by fingerprint
    DocumentIndex,
}

/// Descriptor of one remote site
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SourceConfig {
    /// Unique identifier of the source
    pub id: String,

    /// Fact table receiving this source's items
    pub table: String,

    /// List endpoint URL
    pub list_url: String,

    /// Detail endpoint URL
    pub detail_url: String,

    #[serde(default)]
    pub method: HttpMethod,

    #[serde(default)]
    pub request_format: RequestFormat,

    /// Extra headers sent with every request
    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    /// Parameters sent with every list request
    #[serde(default)]
    pub static_params: BTreeMap<String, serde_json::Value>,

    /// Maximum requests in flight for this source
    #[serde(default = "default_concurrency")]
    pub concurrency: u32,

    /// Minimum delay between two requests to this source (seconds)
    #[serde(default)]
    pub delay_seconds: f64,

    #[serde(default)]
    pub auth_mode: AuthMode,

    /// CAPTCHA-gated sources are limited to a single worker
    #[serde(default)]
    pub needs_captcha: bool,

    /// Parameter carrying the search term for keyword-seeded traversal
    #[serde(default)]
    pub keyword_param: Option<String>,

    /// Newline-separated keyword file
    #[serde(default)]
    pub keywords_path: Option<String>,

    pub list: ListConfig,

    pub detail: DetailConfig,

    #[serde(default)]
    pub response: ResponseConfig,

    #[serde(default)]
    pub token: Option<TokenConfig>,

    pub drug_fields: DrugFields,

    #[serde(default)]
    pub detail_fields: DetailFields,
}

impl SourceConfig {
    /// Worker ceiling for this source; CAPTCHA-gated sources get exactly one
    pub fn effective_concurrency(&self) -> u32 {
        if self.needs_captcha {
            1
        } else {
            self.concurrency.max(1)
        }
    }

    pub fn min_delay(&self) -> Duration {
        Duration::from_secs_f64(self.delay_seconds.max(0.0))
    }

    pub fn is_keyword_seeded(&self) -> bool {
        self.keyword_param.is_some()
    }

    /// Session cookies matter to cookie-jar and token-gated sources
    pub fn uses_cookie_jar(&self) -> bool {
        matches!(self.auth_mode, AuthMode::CookieJar | AuthMode::TokenPerRequest)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HttpMethod {
    Get,
    #[default]
    Post,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RequestFormat {
    /// `application/x-www-form-urlencoded`
    #[default]
    Form,
    /// `application/json;charset=utf-8`
    Json,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthMode {
    #[default]
    None,
    TokenPerRequest,
    CookieJar,
}

/// Pagination dialect of an endpoint
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Pagination {
    /// Page number parameter
    #[default]
    Page,
    /// Row offset parameter, `(page - start) * page_size`
    Offset,
    /// Opaque cursor echoed from the previous response
    Cursor,
}

/// List endpoint pagination and response selectors
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ListConfig {
    #[serde(default)]
    pub pagination: Pagination,

    #[serde(default)]
    pub page_param: Option<String>,

    #[serde(default)]
    pub page_size_param: Option<String>,

    #[serde(default = "default_page_size")]
    pub page_size: u32,

    #[serde(default = "default_start_page")]
    pub start_page: u32,

    #[serde(default)]
    pub cursor_param: Option<String>,

    /// Dotted path of the record array
    pub items_path: String,

    #[serde(default)]
    pub page_path: Option<String>,

    #[serde(default)]
    pub total_pages_path: Option<String>,

    #[serde(default)]
    pub total_count_path: Option<String>,

    #[serde(default)]
    pub cursor_path: Option<String>,
}

/// Detail endpoint parameters and response selectors
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DetailConfig {
    /// Parameter carrying the drug key
    pub key_param: String,

    #[serde(default)]
    pub static_params: BTreeMap<String, serde_json::Value>,

    /// Detail pagination is disabled when unset
    #[serde(default)]
    pub page_param: Option<String>,

    #[serde(default)]
    pub page_size_param: Option<String>,

    #[serde(default = "default_page_size")]
    pub page_size: u32,

    #[serde(default = "default_start_page")]
    pub start_page: u32,

    pub items_path: String,

    #[serde(default)]
    pub total_pages_path: Option<String>,

    #[serde(default)]
    pub total_count_path: Option<String>,
}

/// Upstream status-code conventions
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ResponseConfig {
    #[serde(default)]
    pub code_path: Option<String>,

    /// Codes meaning success; any code is accepted when empty
    #[serde(default)]
    pub success_codes: Vec<i64>,

    /// Codes asking the client to start over (CAPTCHA, expired token)
    #[serde(default)]
    pub retry_codes: Vec<i64>,
}

/// Companion endpoint issuing short-lived request tokens
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TokenConfig {
    pub url: String,

    #[serde(default = "default_token_method")]
    pub method: HttpMethod,

    pub token_path: String,

    pub param_name: String,
}

/// Paths of drug fields inside a list record
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DrugFields {
    pub drug_key: String,
    #[serde(default)]
    pub drug_name: Option<String>,
    #[serde(default)]
    pub dosage_form: Option<String>,
    #[serde(default)]
    pub spec: Option<String>,
    #[serde(default)]
    pub package: Option<String>,
    #[serde(default)]
    pub manufacturer: Option<String>,
    #[serde(default)]
    pub price: Option<String>,
}

/// Paths of hospital fields inside a detail record
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DetailFields {
    #[serde(default)]
    pub hospital_name: Option<String>,
    #[serde(default)]
    pub hospital_code: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub price: Option<String>,
    #[serde(default)]
    pub inventory: Option<String>,
    #[serde(default)]
    pub time: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_concurrency() -> u32 {
    4
}

fn default_page_size() -> u32 {
    20
}

fn default_start_page() -> u32 {
    1
}

fn default_token_method() -> HttpMethod {
    HttpMethod::Get
}
