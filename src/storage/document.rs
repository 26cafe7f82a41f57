//! Append-only document index backend
//!
//! Items are stored as JSON documents keyed by `(index, md5_id)` with
//! create-only semantics: a document whose key already exists is rejected by
//! the primary key and counted, so no pre-query round trip is needed. Audit
//! and progress records go to the same tables as the relational backend.

use crate::item::Item;
use crate::storage::schema::{initialize_schema, DOCUMENT_SCHEMA_SQL};
use crate::storage::sqlite::{append_audits, upsert_progress};
use crate::storage::traits::{KeyStore, RecordSink, StorageError, StorageResult};
use crate::storage::{BatchOutcome, Record};
use crate::HarvestError;
use chrono::Utc;
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

/// Create-only document store
pub struct DocumentIndex {
    conn: Connection,
}

impl DocumentIndex {
    /// Opens or creates a document index database
    pub fn new(path: &Path) -> Result<Self, HarvestError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;
        conn.busy_timeout(Duration::from_secs(5))?;
        initialize_schema(&conn)?;
        conn.execute_batch(DOCUMENT_SCHEMA_SQL)?;
        Ok(Self { conn })
    }

    #[cfg(test)]
    pub fn new_in_memory() -> Result<Self, HarvestError> {
        let conn = Connection::open_in_memory()?;
        initialize_schema(&conn)?;
        conn.execute_batch(DOCUMENT_SCHEMA_SQL)?;
        Ok(Self { conn })
    }

    /// Creates documents for the items, rejecting existing keys
    pub fn save_records(&mut self, batch: Vec<Record>) -> StorageResult<BatchOutcome> {
        let mut outcome = BatchOutcome::default();
        let mut items = Vec::new();
        let mut audits = Vec::new();
        let mut progress = Vec::new();

        for record in batch {
            match record {
                Record::Item(item) => items.push(item),
                Record::Audit(event) => audits.push(event),
                Record::Progress(update) => progress.push(update),
            }
        }

        if !items.is_empty() {
            self.create_documents(&items, &mut outcome)?;
        }

        if !audits.is_empty() {
            append_audits(&mut self.conn, &audits)?;
            outcome.audits = audits.len() as u64;
        }

        for update in &progress {
            upsert_progress(&self.conn, update)?;
        }
        outcome.progress = progress.len() as u64;

        Ok(outcome)
    }

    fn create_documents(&mut self, items: &[Item], outcome: &mut BatchOutcome) -> StorageResult<()> {
        let now = Utc::now().to_rfc3339();
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR IGNORE INTO documents (index_name, doc_id, drug_key, body, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for item in items {
                let body = serde_json::to_string(item)
                    .map_err(|e| StorageError::Serialization(e.to_string()))?;
                let created = stmt.execute(params![
                    item.table,
                    item.md5_id,
                    item.drug_key,
                    body,
                    now
                ])?;
                if created == 0 {
                    outcome.skipped_existing += 1;
                } else {
                    *outcome.inserted.entry(item.table.clone()).or_default() += 1;
                }
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Counts documents of one index
    pub fn count_documents(&self, index: &str) -> StorageResult<u64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM documents WHERE index_name = ?1",
            params![index],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Distinct drug keys of one index
    pub fn distinct_drug_keys(&self, index: &str) -> StorageResult<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT drug_key FROM documents WHERE index_name = ?1 ORDER BY drug_key",
        )?;
        let keys = stmt
            .query_map(params![index], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(keys)
    }
}

impl RecordSink for Mutex<DocumentIndex> {
    fn save_batch(&self, batch: Vec<Record>) -> StorageResult<BatchOutcome> {
        let mut index = self
            .lock()
            .map_err(|_| StorageError::Database("document index lock poisoned".to_string()))?;
        index.save_records(batch)
    }
}

impl KeyStore for Mutex<DocumentIndex> {
    fn distinct_drug_keys(&self, table: &str) -> StorageResult<Vec<String>> {
        let index = self
            .lock()
            .map_err(|_| StorageError::Database("document index lock poisoned".to_string()))?;
        index.distinct_drug_keys(table)
    }

    fn touch_drug_key(&self, _table: &str, _drug_key: &str) -> StorageResult<u64> {
        Err(StorageError::Unsupported(
            "documents are create-only and cannot be touched",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::{DrugBase, ItemContext};
    use crate::state::{ProgressStatus, ProgressUpdate};

    fn record(key: &str) -> Record {
        let ctx = ItemContext {
            table: "gd_drug",
            source_id: "gd",
            url: "",
            page_no: 1,
        };
        let mut drug = DrugBase::from_key(key);
        drug.drug_name = Some(key.to_string());
        Record::Item(Item::from_pair(&ctx, &drug, None))
    }

    #[test]
    fn test_duplicates_rejected_and_counted() {
        let mut index = DocumentIndex::new_in_memory().unwrap();

        let first = index
            .save_records(vec![record("K1"), record("K2"), record("K1")])
            .unwrap();
        assert_eq!(first.total_inserted(), 2);
        assert_eq!(first.skipped_existing, 1);

        let second = index.save_records(vec![record("K1"), record("K2")]).unwrap();
        assert_eq!(second.total_inserted(), 0);
        assert_eq!(second.skipped_existing, 2);
        assert_eq!(index.count_documents("gd_drug").unwrap(), 2);
    }

    #[test]
    fn test_status_records_share_relational_tables() {
        let mut index = DocumentIndex::new_in_memory().unwrap();
        let outcome = index
            .save_records(vec![Record::Progress(ProgressUpdate::new(
                "gd",
                1,
                ProgressStatus::Running,
            ))])
            .unwrap();
        assert_eq!(outcome.progress, 1);
    }

    #[test]
    fn test_touch_is_unsupported() {
        let index = Mutex::new(DocumentIndex::new_in_memory().unwrap());
        index.save_batch(vec![record("K1")]).unwrap();

        assert_eq!(
            KeyStore::distinct_drug_keys(&index, "gd_drug").unwrap(),
            vec!["K1".to_string()]
        );
        assert!(matches!(
            index.touch_drug_key("gd_drug", "K1"),
            Err(StorageError::Unsupported(_))
        ));
    }
}
