//! Storage module for persisting harvested data
//!
//! This module handles all database operations for the engine, including:
//! - SQLite database initialization and per-source fact tables
//! - Idempotent batch ingestion keyed by fingerprint
//! - Audit and progress records
//! - Run tracking
//! - The create-only document index backend

mod document;
mod schema;
mod sqlite;
mod traits;

pub use document::DocumentIndex;
pub use schema::fact_table_sql;
pub use sqlite::SqliteStorage;
pub use traits::{KeyStore, RecordSink, Storage, StorageError, StorageResult};

use crate::item::Item;
use crate::state::{AuditEvent, ProgressUpdate};

use std::collections::BTreeMap;

/// A unit of work handed to a sink
#[derive(Debug, Clone)]
pub enum Record {
    /// A harvested item, deduplicated by fingerprint
    Item(Item),
    /// An audit event, appended
    Audit(AuditEvent),
    /// A progress update, upserted
    Progress(ProgressUpdate),
}

impl From<Item> for Record {
    fn from(item: Item) -> Self {
        Self::Item(item)
    }
}

/// What a sink did with one batch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    /// Newly inserted items per table
    pub inserted: BTreeMap<String, u64>,
    /// Items whose fingerprint was already stored (or repeated in the batch)
    pub skipped_existing: u64,
    /// Items rejected by a constraint during the row-by-row fallback
    pub rejected: u64,
    pub audits: u64,
    pub progress: u64,
}

impl BatchOutcome {
    pub fn total_inserted(&self) -> u64 {
        self.inserted.values().sum()
    }

    /// Adds the counters of `other` to this outcome
    pub fn merge(&mut self, other: &BatchOutcome) {
        for (table, count) in &other.inserted {
            *self.inserted.entry(table.clone()).or_default() += count;
        }
        self.skipped_existing += other.skipped_existing;
        self.rejected += other.rejected;
        self.audits += other.audits;
        self.progress += other.progress;
    }
}

/// Represents a crawl run
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub id: i64,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub config_hash: String,
    pub status: RunStatus,
}

/// Status of a crawl run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Completed,
    Interrupted,
    Failed,
}

impl RunStatus {
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Interrupted => "interrupted",
            Self::Failed => "failed",
        }
    }

    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "interrupted" => Some(Self::Interrupted),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_status_roundtrip() {
        for status in &[
            RunStatus::Running,
            RunStatus::Completed,
            RunStatus::Interrupted,
            RunStatus::Failed,
        ] {
            let db_str = status.to_db_string();
            let parsed = RunStatus::from_db_string(db_str);
            assert_eq!(Some(*status), parsed);
        }
    }

    #[test]
    fn test_run_status_invalid() {
        assert_eq!(RunStatus::from_db_string("invalid"), None);
    }

    #[test]
    fn test_batch_outcome_merge() {
        let mut total = BatchOutcome::default();
        let mut first = BatchOutcome::default();
        first.inserted.insert("a".to_string(), 3);
        first.skipped_existing = 1;
        let mut second = BatchOutcome::default();
        second.inserted.insert("a".to_string(), 2);
        second.inserted.insert("b".to_string(), 5);
        second.rejected = 1;
        second.audits = 4;

        total.merge(&first);
        total.merge(&second);

        assert_eq!(total.inserted.get("a"), Some(&5));
        assert_eq!(total.total_inserted(), 10);
        assert_eq!(total.skipped_existing, 1);
        assert_eq!(total.rejected, 1);
        assert_eq!(total.audits, 4);
    }
}
