//! Configuration module for medcrawl
//!
//! This module handles loading, parsing, and validating TOML configuration files.
//! Every remote site is described by a `[[source]]` block; site differences are
//! configuration, not code.
//!
//! # Example
//!
//! ```no_run
//! use medcrawl::config::load_config;
//! use std::path::Path;
//!
//! let config = load_config(Path::new("medcrawl.toml")).unwrap();
//! println!("Max retries: {}", config.engine.max_retries);
//! ```

mod parser;
mod types;
mod validation;

// Re-export types
pub use types::{
    AuthMode, Config, DetailConfig, DetailFields, DrugFields, EngineConfig, HttpMethod,
    ListConfig, OutputConfig, Pagination, PipelineConfig, RequestFormat, ResponseConfig,
    SourceConfig, StorageBackend, TokenConfig,
};

// Re-export parser functions
pub use parser::{compute_config_hash, load_config, load_config_with_hash, load_keywords};
