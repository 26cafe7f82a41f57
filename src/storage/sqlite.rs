//! SQLite storage implementation
//!
//! This module provides a SQLite-based implementation of the Storage trait.

use crate::item::Item;
use crate::state::{AuditEvent, ProgressSnapshot, ProgressStatus, ProgressUpdate, Stage};
use crate::storage::schema::{fact_table_sql, initialize_schema};
use crate::storage::traits::{KeyStore, RecordSink, Storage, StorageError, StorageResult};
use crate::storage::{BatchOutcome, Record, RunRecord, RunStatus};
use crate::HarvestError;
use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, Connection, ErrorCode, OptionalExtension};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

/// Maximum number of fingerprints bound to one `IN (...)` query
const EXISTING_CHUNK: usize = 1000;

const FACT_COLUMNS: &str = "md5_id, source_id, drug_key, drug_name, dosage_form, spec, package, \
     manufacturer, price, hospital_name, hospital_code, region, detail_price, inventory, \
     detail_time, has_record, source_data, url, page_num, collect_time, updated_at";

/// SQLite storage backend
pub struct SqliteStorage {
    conn: Connection,
    /// Fact tables known to this connection and whether their md5 index is unique
    fact_tables: HashMap<String, bool>,
}

impl SqliteStorage {
    /// Creates a new SqliteStorage instance
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the SQLite database file
    ///
    /// # Returns
    ///
    /// * `Ok(SqliteStorage)` - Successfully opened/created database
    /// * `Err(HarvestError)` - Failed to open database
    pub fn new(path: &Path) -> Result<Self, HarvestError> {
        let conn = Connection::open(path)?;

        // Configure SQLite for better performance
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;
            PRAGMA mmap_size = 268435456;
        ",
        )?;
        conn.busy_timeout(Duration::from_secs(5))?;

        initialize_schema(&conn)?;

        Ok(Self {
            conn,
            fact_tables: HashMap::new(),
        })
    }

    /// Creates an in-memory database (for testing)
    #[cfg(test)]
    pub fn new_in_memory() -> Result<Self, HarvestError> {
        let conn = Connection::open_in_memory()?;
        initialize_schema(&conn)?;
        Ok(Self {
            conn,
            fact_tables: HashMap::new(),
        })
    }

    /// Whether the md5 index of a fact table is unique, creating the table
    /// with a unique index when it does not exist yet
    fn fact_table_unique(&mut self, table: &str) -> StorageResult<bool> {
        if let Some(unique) = self.fact_tables.get(table) {
            return Ok(*unique);
        }

        check_identifier(table)?;
        if !self.table_exists(table)? {
            self.ensure_fact_table(table, true)?;
            return Ok(true);
        }

        let unique: Option<bool> = self
            .conn
            .query_row(
                "SELECT \"unique\" FROM pragma_index_list(?1) WHERE name = ?2",
                params![table, format!("idx_{}_md5", table)],
                |row| row.get(0),
            )
            .optional()?;
        let unique = unique.unwrap_or(false);
        self.fact_tables.insert(table.to_string(), unique);
        Ok(unique)
    }

    fn table_exists(&self, table: &str) -> StorageResult<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            params![table],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Fingerprints of `items` already stored in `table`
    fn existing_md5s(&self, table: &str, items: &[Item]) -> StorageResult<HashSet<String>> {
        let ids: Vec<&str> = items
            .iter()
            .map(|item| item.md5_id.as_str())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();

        let mut existing = HashSet::new();
        for chunk in ids.chunks(EXISTING_CHUNK) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let sql = format!(
                "SELECT md5_id FROM {} WHERE md5_id IN ({})",
                table, placeholders
            );
            let mut stmt = self.conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(chunk.iter()), |row| {
                row.get::<_, String>(0)
            })?;
            for row in rows {
                existing.insert(row?);
            }
        }

        Ok(existing)
    }

    /// Inserts every item inside one transaction
    fn bulk_insert(&mut self, table: &str, items: &[Item]) -> StorageResult<u64> {
        let sql = insert_sql(table);
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(&sql)?;
            for item in items {
                execute_insert(&mut stmt, item)?;
            }
        }
        tx.commit()?;
        Ok(items.len() as u64)
    }

    /// Inserts items one statement at a time, skipping constraint violations
    ///
    /// Returns `(inserted, rejected)`.
    fn insert_row_by_row(&mut self, table: &str, items: &[Item]) -> StorageResult<(u64, u64)> {
        let sql = insert_sql(table);
        let mut stmt = self.conn.prepare_cached(&sql)?;
        let mut inserted = 0;
        let mut rejected = 0;

        for item in items {
            match execute_insert(&mut stmt, item) {
                Ok(()) => inserted += 1,
                Err(StorageError::Sqlite(e)) if is_constraint_violation(&e) => {
                    tracing::warn!(
                        "Rejected row {} (drug {}) in {}: {}",
                        item.md5_id,
                        item.drug_key,
                        table,
                        e
                    );
                    rejected += 1;
                }
                Err(e) => return Err(e),
            }
        }

        Ok((inserted, rejected))
    }

    fn save_items(
        &mut self,
        table: &str,
        items: Vec<Item>,
        outcome: &mut BatchOutcome,
    ) -> StorageResult<()> {
        let unique = self.fact_table_unique(table)?;
        let existing = self.existing_md5s(table, &items)?;

        // Without a unique index the pre-query is the only guard, so repeats
        // inside the batch are dropped here as well.
        let mut seen = HashSet::new();
        let mut fresh = Vec::with_capacity(items.len());
        for item in items {
            if existing.contains(&item.md5_id) || (!unique && !seen.insert(item.md5_id.clone()))
            {
                outcome.skipped_existing += 1;
                continue;
            }
            fresh.push(item);
        }

        if fresh.is_empty() {
            return Ok(());
        }

        let inserted = match self.bulk_insert(table, &fresh) {
            Ok(count) => count,
            Err(StorageError::Sqlite(e)) if is_constraint_violation(&e) => {
                tracing::debug!(
                    "Bulk insert of {} rows into {} rolled back ({}), retrying row by row",
                    fresh.len(),
                    table,
                    e
                );
                let (inserted, rejected) = self.insert_row_by_row(table, &fresh)?;
                outcome.rejected += rejected;
                inserted
            }
            Err(e) => return Err(e),
        };

        *outcome.inserted.entry(table.to_string()).or_default() += inserted;
        Ok(())
    }

    fn save_records_inner(&mut self, batch: Vec<Record>) -> StorageResult<BatchOutcome> {
        let mut outcome = BatchOutcome::default();
        let mut groups: BTreeMap<String, Vec<Item>> = BTreeMap::new();
        let mut audits = Vec::new();
        let mut progress = Vec::new();

        for record in batch {
            match record {
                Record::Item(item) => groups.entry(item.table.clone()).or_default().push(item),
                Record::Audit(event) => audits.push(event),
                Record::Progress(update) => progress.push(update),
            }
        }

        for (table, items) in groups {
            self.save_items(&table, items, &mut outcome)?;
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
}

impl Storage for SqliteStorage {
    // ===== Run Management =====

    fn create_run(&mut self, config_hash: &str) -> StorageResult<i64> {
        let now = Utc::now().to_rfc3339();
        self.conn.execute(
            "INSERT INTO runs (started_at, config_hash, status) VALUES (?1, ?2, ?3)",
            params![now, config_hash, RunStatus::Running.to_db_string()],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn get_run(&self, run_id: i64) -> StorageResult<RunRecord> {
        let mut stmt = self.conn.prepare(
            "SELECT id, started_at, finished_at, config_hash, status FROM runs WHERE id = ?1",
        )?;

        let run = stmt
            .query_row(params![run_id], map_run)
            .map_err(|_| StorageError::RunNotFound(run_id))?;

        Ok(run)
    }

    fn get_latest_run(&self) -> StorageResult<Option<RunRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, started_at, finished_at, config_hash, status FROM runs ORDER BY id DESC LIMIT 1",
        )?;

        let run = stmt.query_row([], map_run).optional()?;

        Ok(run)
    }

    fn complete_run(&mut self, run_id: i64, status: RunStatus) -> StorageResult<()> {
        let now = Utc::now().to_rfc3339();
        self.conn.execute(
            "UPDATE runs SET status = ?1, finished_at = ?2 WHERE id = ?3",
            params![status.to_db_string(), now, run_id],
        )?;
        Ok(())
    }

    // ===== Fact Tables =====

    fn ensure_fact_table(&mut self, table: &str, unique_md5: bool) -> StorageResult<()> {
        check_identifier(table)?;
        self.conn.execute_batch(&fact_table_sql(table, unique_md5))?;
        self.fact_tables.remove(table);

        // An index created by an earlier run wins over the requested flavor
        let unique: Option<bool> = self
            .conn
            .query_row(
                "SELECT \"unique\" FROM pragma_index_list(?1) WHERE name = ?2",
                params![table, format!("idx_{}_md5", table)],
                |row| row.get(0),
            )
            .optional()?;
        self.fact_tables
            .insert(table.to_string(), unique.unwrap_or(unique_md5));
        Ok(())
    }

    fn save_records(&mut self, batch: Vec<Record>) -> StorageResult<BatchOutcome> {
        self.save_records_inner(batch).map_err(classify_busy)
    }

    fn distinct_drug_keys(&self, table: &str) -> StorageResult<Vec<String>> {
        check_identifier(table)?;
        if !self.table_exists(table)? {
            return Ok(Vec::new());
        }

        let mut stmt = self
            .conn
            .prepare(&format!("SELECT DISTINCT drug_key FROM {} ORDER BY drug_key", table))?;
        let keys = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(keys)
    }

    fn touch_drug_key(&mut self, table: &str, drug_key: &str) -> StorageResult<u64> {
        check_identifier(table)?;
        let now = Utc::now().to_rfc3339();
        let changed = self.conn.execute(
            &format!("UPDATE {} SET updated_at = ?1 WHERE drug_key = ?2", table),
            params![now, drug_key],
        )?;
        Ok(changed as u64)
    }

    fn count_rows(&self, table: &str) -> StorageResult<u64> {
        check_identifier(table)?;
        if !self.table_exists(table)? {
            return Ok(0);
        }
        let count: i64 =
            self.conn
                .query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| {
                    row.get(0)
                })?;
        Ok(count as u64)
    }

    // ===== Status =====

    fn load_progress(&self, source: &str) -> StorageResult<Option<ProgressSnapshot>> {
        let snapshot = self
            .conn
            .query_row(
                "SELECT spider_name, run_id, status, total_tasks, completed_tasks,
                 progress_percent, current_stage, items_scraped, errors_count, last_updated
                 FROM spider_progress WHERE spider_name = ?1",
                params![source],
                |row| {
                    Ok(ProgressSnapshot {
                        spider_name: row.get(0)?,
                        run_id: row.get(1)?,
                        status: ProgressStatus::from_db_string(&row.get::<_, String>(2)?)
                            .unwrap_or(ProgressStatus::Running),
                        total_tasks: row.get(3)?,
                        completed_tasks: row.get(4)?,
                        progress_percent: row.get(5)?,
                        current_stage: row.get(6)?,
                        items_scraped: row.get::<_, i64>(7)? as u64,
                        errors_count: row.get::<_, i64>(8)? as u64,
                        last_updated: row.get(9)?,
                    })
                },
            )
            .optional()?;

        Ok(snapshot)
    }

    fn count_audit(&self, source: &str, stage: Option<Stage>) -> StorageResult<u64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM crawl_audit WHERE spider = ?1 AND (?2 IS NULL OR stage = ?2)",
            params![source, stage.map(|s| s.to_db_string())],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    fn audit_events(&self, source: &str) -> StorageResult<Vec<AuditEvent>> {
        let mut stmt = self.conn.prepare(
            "SELECT event_id, spider, run_id, stage, page_no, total_pages, items_found,
             items_stored, params, api_url, success, error_message, parent_event_id,
             reference_id, created_at
             FROM crawl_audit WHERE spider = ?1 ORDER BY id",
        )?;

        let events = stmt
            .query_map(params![source], |row| {
                let params: Option<String> = row.get(8)?;
                let created_at: String = row.get(14)?;
                Ok(AuditEvent {
                    event_id: row.get(0)?,
                    spider: row.get(1)?,
                    run_id: row.get(2)?,
                    stage: Stage::from_db_string(&row.get::<_, String>(3)?)
                        .unwrap_or(Stage::Error),
                    page_no: row.get(4)?,
                    total_pages: row.get(5)?,
                    items_found: row.get(6)?,
                    items_stored: row.get(7)?,
                    params: params
                        .and_then(|p| serde_json::from_str(&p).ok())
                        .unwrap_or(serde_json::Value::Null),
                    api_url: row.get::<_, Option<String>>(9)?.unwrap_or_default(),
                    success: row.get(10)?,
                    error_message: row.get(11)?,
                    parent_event_id: row.get(12)?,
                    reference_id: row.get(13)?,
                    created_at: DateTime::parse_from_rfc3339(&created_at)
                        .map(|t| t.with_timezone(&Utc))
                        .unwrap_or_else(|_| Utc::now()),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(events)
    }
}

impl RecordSink for Mutex<SqliteStorage> {
    fn save_batch(&self, batch: Vec<Record>) -> StorageResult<BatchOutcome> {
        let mut storage = self
            .lock()
            .map_err(|_| StorageError::Database("storage lock poisoned".to_string()))?;
        storage.save_records(batch)
    }
}

impl KeyStore for Mutex<SqliteStorage> {
    fn distinct_drug_keys(&self, table: &str) -> StorageResult<Vec<String>> {
        let storage = self
            .lock()
            .map_err(|_| StorageError::Database("storage lock poisoned".to_string()))?;
        Storage::distinct_drug_keys(&*storage, table)
    }

    fn touch_drug_key(&self, table: &str, drug_key: &str) -> StorageResult<u64> {
        let mut storage = self
            .lock()
            .map_err(|_| StorageError::Database("storage lock poisoned".to_string()))?;
        Storage::touch_drug_key(&mut *storage, table, drug_key)
    }
}

pub(super) fn append_audits(conn: &mut Connection, events: &[AuditEvent]) -> StorageResult<()> {
    let tx = conn.transaction()?;
    {
        let mut stmt = tx.prepare_cached(
            "INSERT INTO crawl_audit (event_id, spider, run_id, stage, page_no, total_pages,
             items_found, items_stored, params, api_url, success, error_message,
             parent_event_id, reference_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
        )?;
        for event in events {
            stmt.execute(params![
                event.event_id,
                event.spider,
                event.run_id,
                event.stage.to_db_string(),
                event.page_no,
                event.total_pages,
                event.items_found,
                event.items_stored,
                event.params.to_string(),
                event.api_url,
                event.success,
                event.error_message,
                event.parent_event_id,
                event.reference_id,
                event.created_at.to_rfc3339(),
            ])?;
        }
    }
    tx.commit()?;
    Ok(())
}

/// Upserts a progress row
///
/// Within a run `completed_tasks` only grows and counters accumulate; a
/// new run id resets the row. A terminal status is not overwritten by a
/// later `running` update of the same run.
pub(super) fn upsert_progress(conn: &Connection, update: &ProgressUpdate) -> StorageResult<()> {
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO spider_progress (spider_name, run_id, status, total_tasks,
         completed_tasks, progress_percent, current_stage, items_scraped, errors_count,
         last_updated)
         VALUES (?1, ?2, ?3, COALESCE(?4, 0), COALESCE(?5, 0), 0, ?6, ?7, ?8, ?9)
         ON CONFLICT(spider_name) DO UPDATE SET
            status = CASE
                WHEN spider_progress.run_id = excluded.run_id
                     AND spider_progress.status IN ('finished', 'error')
                     AND excluded.status = 'running'
                THEN spider_progress.status
                ELSE excluded.status END,
            total_tasks = CASE
                WHEN spider_progress.run_id <> excluded.run_id THEN COALESCE(?4, 0)
                ELSE MAX(spider_progress.total_tasks, COALESCE(?4, 0)) END,
            completed_tasks = CASE
                WHEN spider_progress.run_id <> excluded.run_id THEN COALESCE(?5, 0)
                ELSE MAX(spider_progress.completed_tasks, COALESCE(?5, 0)) END,
            current_stage = COALESCE(excluded.current_stage, spider_progress.current_stage),
            items_scraped = CASE
                WHEN spider_progress.run_id <> excluded.run_id THEN excluded.items_scraped
                ELSE spider_progress.items_scraped + excluded.items_scraped END,
            errors_count = CASE
                WHEN spider_progress.run_id <> excluded.run_id THEN excluded.errors_count
                ELSE spider_progress.errors_count + excluded.errors_count END,
            run_id = excluded.run_id,
            last_updated = excluded.last_updated",
        params![
            update.source,
            update.run_id,
            update.status.to_db_string(),
            update.total_tasks,
            update.completed_tasks,
            update.current_stage,
            update.items_delta as i64,
            update.errors_delta as i64,
            now,
        ],
    )?;

    conn.execute(
        "UPDATE spider_progress SET progress_percent = CASE
            WHEN total_tasks > 0 THEN MIN(100.0, completed_tasks * 100.0 / total_tasks)
            ELSE 0 END
         WHERE spider_name = ?1",
        params![update.source],
    )?;

    Ok(())
}

fn map_run(row: &rusqlite::Row<'_>) -> rusqlite::Result<RunRecord> {
    Ok(RunRecord {
        id: row.get(0)?,
        started_at: row.get(1)?,
        finished_at: row.get(2)?,
        config_hash: row.get(3)?,
        status: RunStatus::from_db_string(&row.get::<_, String>(4)?)
            .unwrap_or(RunStatus::Running),
    })
}

fn insert_sql(table: &str) -> String {
    let placeholders = (1..=21)
        .map(|i| format!("?{}", i))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "INSERT INTO {} ({}) VALUES ({})",
        table, FACT_COLUMNS, placeholders
    )
}

fn execute_insert(stmt: &mut rusqlite::CachedStatement<'_>, item: &Item) -> StorageResult<()> {
    stmt.execute(params![
        item.md5_id,
        item.source_id,
        item.drug_key,
        item.drug_name,
        item.dosage_form,
        item.spec,
        item.package,
        item.manufacturer,
        item.price,
        item.hospital_name,
        item.hospital_code,
        item.region,
        item.detail_price,
        item.inventory,
        item.detail_time,
        item.has_record,
        item.source_data,
        item.url,
        item.page_no,
        item.collect_time.to_rfc3339(),
        Option::<String>::None,
    ])?;
    Ok(())
}

/// Rejects table names that are not plain identifiers
fn check_identifier(table: &str) -> StorageResult<()> {
    let valid = !table.is_empty()
        && !table.starts_with(|c: char| c.is_ascii_digit())
        && table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(StorageError::Database(format!(
            "invalid table name '{}'",
            table
        )))
    }
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(err, rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation)
}

/// Maps lock contention onto `StorageError::Busy`
fn classify_busy(err: StorageError) -> StorageError {
    match err {
        StorageError::Sqlite(rusqlite::Error::SqliteFailure(e, msg))
            if matches!(e.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) =>
        {
            StorageError::Busy(msg.unwrap_or_else(|| e.to_string()))
        }
        other => other,
    }
}
