//! Storage traits and error types
//!
//! This module defines the trait interface for storage backends and
//! associated error types.

use crate::state::{AuditEvent, ProgressSnapshot, Stage};
use crate::storage::{BatchOutcome, Record, RunRecord, RunStatus};
use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Run not found: {0}")]
    RunNotFound(i64),

    /// Lock contention; the batch was rolled back
    #[error("Database busy, batch rolled back: {0}")]
    Busy(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(&'static str),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Trait for the relational storage backend
///
/// This trait defines the database operations needed by the engine, the
/// recrawl manager and the CLI.
pub trait Storage {
    // ===== Run Management =====

    /// Creates a new crawl run
    ///
    /// # Arguments
    ///
    /// * `config_hash` - Hash of the configuration file
    ///
    /// # Returns
    ///
    /// The ID of the newly created run
    fn create_run(&mut self, config_hash: &str) -> StorageResult<i64>;

    /// Gets a run by ID
    fn get_run(&self, run_id: i64) -> StorageResult<RunRecord>;

    /// Gets the most recent run
    fn get_latest_run(&self) -> StorageResult<Option<RunRecord>>;

    /// Marks a run as ended with the given status and a finish timestamp
    fn complete_run(&mut self, run_id: i64, status: RunStatus) -> StorageResult<()>;

    // ===== Fact Tables =====

    /// Creates a source's fact table if it does not exist
    fn ensure_fact_table(&mut self, table: &str, unique_md5: bool) -> StorageResult<()>;

    /// Persists a heterogeneous batch idempotently
    ///
    /// Items are deduplicated by fingerprint against the existing rows of
    /// their table; audit records are appended; progress records upserted.
    fn save_records(&mut self, batch: Vec<Record>) -> StorageResult<BatchOutcome>;

    /// Distinct drug keys stored in a fact table
    fn distinct_drug_keys(&self, table: &str) -> StorageResult<Vec<String>>;

    /// Bumps `updated_at` on every row of a drug key, returning the row count
    fn touch_drug_key(&mut self, table: &str, drug_key: &str) -> StorageResult<u64>;

    /// Counts rows of a fact table
    fn count_rows(&self, table: &str) -> StorageResult<u64>;

    // ===== Status =====

    /// Loads the progress row of a source
    fn load_progress(&self, source: &str) -> StorageResult<Option<ProgressSnapshot>>;

    /// Counts audit events of a source, optionally restricted to one stage
    fn count_audit(&self, source: &str, stage: Option<Stage>) -> StorageResult<u64>;

    /// Loads the audit events of a source in insertion order
    fn audit_events(&self, source: &str) -> StorageResult<Vec<AuditEvent>>;
}

/// Thread-safe batch sink used by the persistence pipeline
///
/// `save_batch` runs on the blocking pool; implementations serialize access
/// to their connection.
pub trait RecordSink: Send + Sync {
    fn save_batch(&self, batch: Vec<Record>) -> StorageResult<BatchOutcome>;
}

/// Thread-safe view of stored drug keys used by the recrawl manager
pub trait KeyStore: Send + Sync {
    fn distinct_drug_keys(&self, table: &str) -> StorageResult<Vec<String>>;

    fn touch_drug_key(&self, table: &str, drug_key: &str) -> StorageResult<u64>;
}
