//! Database schema definitions
//!
//! Engine-owned tables are created once per connection; one fact table per
//! source is created on demand by `fact_table_sql`.

/// SQL schema for the engine-owned tables
pub const SCHEMA_SQL: &str = r#"
-- Track crawl runs
CREATE TABLE IF NOT EXISTS runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    started_at TEXT NOT NULL,
    finished_at TEXT,
    config_hash TEXT NOT NULL,
    status TEXT NOT NULL
);

-- Append-only page and error events
CREATE TABLE IF NOT EXISTS crawl_audit (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    event_id TEXT NOT NULL,
    spider TEXT NOT NULL,
    run_id INTEGER NOT NULL,
    stage TEXT NOT NULL,
    page_no INTEGER NOT NULL,
    total_pages INTEGER,
    items_found INTEGER NOT NULL DEFAULT 0,
    items_stored INTEGER NOT NULL DEFAULT 0,
    params TEXT,
    api_url TEXT,
    success INTEGER NOT NULL,
    error_message TEXT,
    parent_event_id TEXT,
    reference_id TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_crawl_audit_spider_run ON crawl_audit(spider, run_id);
CREATE INDEX IF NOT EXISTS idx_crawl_audit_event ON crawl_audit(event_id);

-- One progress row per source
CREATE TABLE IF NOT EXISTS spider_progress (
    spider_name TEXT PRIMARY KEY,
    run_id INTEGER NOT NULL,
    status TEXT NOT NULL,
    total_tasks INTEGER NOT NULL DEFAULT 0,
    completed_tasks INTEGER NOT NULL DEFAULT 0,
    progress_percent REAL NOT NULL DEFAULT 0,
    current_stage TEXT,
    items_scraped INTEGER NOT NULL DEFAULT 0,
    errors_count INTEGER NOT NULL DEFAULT 0,
    last_updated TEXT NOT NULL
);
"#;

/// SQL schema for the create-only document index backend
pub const DOCUMENT_SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS documents (
    index_name TEXT NOT NULL,
    doc_id TEXT NOT NULL,
    drug_key TEXT NOT NULL,
    body TEXT NOT NULL,
    created_at TEXT NOT NULL,
    PRIMARY KEY (index_name, doc_id)
);

CREATE INDEX IF NOT EXISTS idx_documents_drug_key ON documents(index_name, drug_key);
"#;

/// DDL of one source's fact table
///
/// `table` must already be validated as a plain identifier.
pub fn fact_table_sql(table: &str, unique_md5: bool) -> String {
    let md5_index = if unique_md5 {
        format!("CREATE UNIQUE INDEX IF NOT EXISTS idx_{t}_md5 ON {t}(md5_id);", t = table)
    } else {
        format!("CREATE INDEX IF NOT EXISTS idx_{t}_md5 ON {t}(md5_id);", t = table)
    };

    format!(
        r#"
CREATE TABLE IF NOT EXISTS {t} (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    md5_id TEXT NOT NULL,
    source_id TEXT NOT NULL,
    drug_key TEXT NOT NULL,
    drug_name TEXT,
    dosage_form TEXT,
    spec TEXT,
    package TEXT,
    manufacturer TEXT,
    price TEXT,
    hospital_name TEXT,
    hospital_code TEXT,
    region TEXT,
    detail_price TEXT,
    inventory TEXT,
    detail_time TEXT,
    has_record INTEGER NOT NULL DEFAULT 1,
    source_data TEXT,
    url TEXT,
    page_num INTEGER,
    collect_time TEXT NOT NULL,
    updated_at TEXT
);

{md5_index}
CREATE INDEX IF NOT EXISTS idx_{t}_drug_key ON {t}(drug_key);
"#,
        t = table,
        md5_index = md5_index
    )
}

/// Initializes the database schema
///
/// # Arguments
///
/// * `conn` - The database connection
///
/// # Returns
///
/// * `Ok(())` - Schema initialized successfully
/// * `Err(rusqlite::Error)` - Failed to initialize schema
pub fn initialize_schema(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(SCHEMA_SQL)?;
    Ok(())
}
