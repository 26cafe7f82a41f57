//! medcrawl: a multi-source harvester for drug registration and hospital procurement APIs
//!
//! This crate drives paginated two-tier (list → detail) JSON APIs, flattens every
//! drug × hospital pair into a fingerprinted record and persists it idempotently.

pub mod config;
pub mod crawler;
pub mod item;
pub mod output;
pub mod pipeline;
pub mod recrawl;
pub mod state;
pub mod storage;

use thiserror::Error;

/// Main error type for medcrawl operations
#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("HTTP client error: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("Fetch error: {0}")]
    Fetch(#[from] crawler::FetchError),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Storage error: {0}")]
    Storage(#[from] storage::StorageError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unknown source: {0}")]
    UnknownSource(String),

    #[error("Pipeline error: {0}")]
    Pipeline(String),
}

/// Configuration-specific errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid URL in config: {0}")]
    InvalidUrl(String),

    #[error("Failed to read keyword file {path}: {source}")]
    Keywords {
        path: String,
        source: std::io::Error,
    },
}

/// Result type alias for medcrawl operations
pub type Result<T> = std::result::Result<T, HarvestError>;

/// Result type alias for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

// Re-export commonly used types
pub use config::{Config, SourceConfig};
pub use crawler::{Coordinator, RunReport};
pub use item::{fingerprint, DetailRow, DrugBase, Item};
pub use pipeline::{PersistencePipeline, PipelineHandle};
pub use recrawl::{RecrawlManager, RecrawlMode};
pub use state::ProgressStatus;
pub use storage::{Record, RecordSink, SqliteStorage};
