use crate::config::types::{
    AuthMode, Config, EngineConfig, OutputConfig, Pagination, PipelineConfig, SourceConfig,
};
use crate::ConfigError;
use std::collections::HashSet;
use url::Url;

/// Table names owned by the engine itself
const RESERVED_TABLES: &[&str] = &["runs", "crawl_audit", "spider_progress", "documents"];

/// Validates the entire configuration
pub fn validate(config: &Config) -> Result<(), ConfigError> {
    validate_engine_config(&config.engine)?;
    validate_pipeline_config(&config.pipeline)?;
    validate_output_config(&config.output)?;

    let mut ids = HashSet::new();
    let mut tables = HashSet::new();
    for source in &config.sources {
        validate_source(source)?;

        if !ids.insert(source.id.as_str()) {
            return Err(ConfigError::Validation(format!(
                "duplicate source id '{}'",
                source.id
            )));
        }
        if !tables.insert(source.table.as_str()) {
            return Err(ConfigError::Validation(format!(
                "table '{}' is used by more than one source",
                source.table
            )));
        }
    }

    Ok(())
}

fn validate_engine_config(config: &EngineConfig) -> Result<(), ConfigError> {
    if config.max_retries < 1 {
        return Err(ConfigError::Validation(
            "max_retries must be >= 1".to_string(),
        ));
    }

    if config.global_concurrency < 1 || config.global_concurrency > 256 {
        return Err(ConfigError::Validation(format!(
            "global_concurrency must be between 1 and 256, got {}",
            config.global_concurrency
        )));
    }

    if config.request_timeout_secs == 0 {
        return Err(ConfigError::Validation(
            "request_timeout_secs must be > 0".to_string(),
        ));
    }

    if config.user_agent.trim().is_empty() {
        return Err(ConfigError::Validation(
            "user_agent cannot be empty".to_string(),
        ));
    }

    Ok(())
}

fn validate_pipeline_config(config: &PipelineConfig) -> Result<(), ConfigError> {
    if config.size_threshold == 0 {
        return Err(ConfigError::Validation(
            "size_threshold must be >= 1".to_string(),
        ));
    }

    if config.time_threshold_ms == 0 {
        return Err(ConfigError::Validation(
            "time_threshold_ms must be > 0".to_string(),
        ));
    }

    Ok(())
}

fn validate_output_config(config: &OutputConfig) -> Result<(), ConfigError> {
    if config.database_path.is_empty() {
        return Err(ConfigError::Validation(
            "database_path cannot be empty".to_string(),
        ));
    }

    Ok(())
}

/// Validates a single source descriptor
fn validate_source(source: &SourceConfig) -> Result<(), ConfigError> {
    if source.id.trim().is_empty() {
        return Err(ConfigError::Validation(
            "source id cannot be empty".to_string(),
        ));
    }

    validate_table_name(&source.table)?;
    validate_endpoint(&source.id, "list_url", &source.list_url)?;
    validate_endpoint(&source.id, "detail_url", &source.detail_url)?;

    if source.concurrency < 1 || source.concurrency > 64 {
        return Err(ConfigError::Validation(format!(
            "source '{}': concurrency must be between 1 and 64, got {}",
            source.id, source.concurrency
        )));
    }

    if !source.delay_seconds.is_finite() || source.delay_seconds < 0.0 {
        return Err(ConfigError::Validation(format!(
            "source '{}': delay_seconds must be a non-negative number",
            source.id
        )));
    }

    if source.keyword_param.is_some() != source.keywords_path.is_some() {
        return Err(ConfigError::Validation(format!(
            "source '{}': keyword_param and keywords_path must be set together",
            source.id
        )));
    }

    match (&source.auth_mode, &source.token) {
        (AuthMode::TokenPerRequest, None) => {
            return Err(ConfigError::Validation(format!(
                "source '{}': auth_mode token-per-request requires a [source.token] block",
                source.id
            )));
        }
        (_, Some(token)) => {
            validate_endpoint(&source.id, "token.url", &token.url)?;
            if token.token_path.is_empty() || token.param_name.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "source '{}': token_path and param_name cannot be empty",
                    source.id
                )));
            }
        }
        _ => {}
    }

    validate_list_pagination(source)?;

    if source.list.items_path.is_empty() || source.detail.items_path.is_empty() {
        return Err(ConfigError::Validation(format!(
            "source '{}': items_path cannot be empty",
            source.id
        )));
    }

    if source.detail.key_param.is_empty() {
        return Err(ConfigError::Validation(format!(
            "source '{}': detail key_param cannot be empty",
            source.id
        )));
    }

    if source.drug_fields.drug_key.is_empty() {
        return Err(ConfigError::Validation(format!(
            "source '{}': drug_fields.drug_key cannot be empty",
            source.id
        )));
    }

    Ok(())
}

fn validate_list_pagination(source: &SourceConfig) -> Result<(), ConfigError> {
    let list = &source.list;

    if list.page_size == 0 || source.detail.page_size == 0 {
        return Err(ConfigError::Validation(format!(
            "source '{}': page_size must be >= 1",
            source.id
        )));
    }

    match list.pagination {
        Pagination::Page | Pagination::Offset => {
            if list.page_param.is_none() {
                return Err(ConfigError::Validation(format!(
                    "source '{}': {:?} pagination requires page_param",
                    source.id, list.pagination
                )));
            }
        }
        Pagination::Cursor => {
            if list.cursor_param.is_none() || list.cursor_path.is_none() {
                return Err(ConfigError::Validation(format!(
                    "source '{}': cursor pagination requires cursor_param and cursor_path",
                    source.id
                )));
            }
        }
    }

    Ok(())
}

/// Validates an endpoint URL: absolute, http or https
fn validate_endpoint(source_id: &str, field: &str, value: &str) -> Result<(), ConfigError> {
    let url = Url::parse(value).map_err(|e| {
        ConfigError::InvalidUrl(format!("source '{}': {} '{}': {}", source_id, field, value, e))
    })?;

    if url.scheme() != "https" && url.scheme() != "http" {
        return Err(ConfigError::InvalidUrl(format!(
            "source '{}': {} must use http or https, got '{}'",
            source_id,
            field,
            url.scheme()
        )));
    }

    Ok(())
}

/// Validates a fact table name: a plain SQL identifier not owned by the engine
fn validate_table_name(table: &str) -> Result<(), ConfigError> {
    let mut chars = table.chars();
    let valid_start = chars
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false);

    if !valid_start || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(ConfigError::Validation(format!(
            "table '{}' must be a plain identifier (letters, digits, underscore)",
            table
        )));
    }

    if RESERVED_TABLES.contains(&table.to_ascii_lowercase().as_str()) {
        return Err(ConfigError::Validation(format!(
            "table '{}' is reserved",
            table
        )));
    }

    Ok(())
}
