//! Run and source summaries
//!
//! This module renders the end-of-run summary and the per-source status
//! read back from the storage layer.

use crate::config::SourceConfig;
use crate::crawler::RunReport;
use crate::item::DrugBase;
use crate::state::ProgressSnapshot;
use crate::storage::{Storage, StorageResult};
use std::collections::BTreeMap;
use std::fmt::Write;

/// Stored state of one source
#[derive(Debug, Clone)]
pub struct SourceStatus {
    pub source_id: String,
    pub table: String,
    /// Rows in the source's fact table
    pub rows: u64,
    pub progress: Option<ProgressSnapshot>,
}

/// Loads the stored state of each source
///
/// # Arguments
///
/// * `storage` - The storage backend to query
/// * `sources` - The sources to report on
pub fn load_source_status(storage: &dyn Storage, sources: &[SourceConfig]) -> StorageResult<Vec<SourceStatus>> {
    sources
        .iter()
        .map(|source| {
            Ok(SourceStatus {
                source_id: source.id.clone(),
                table: source.table.clone(),
                rows: storage.count_rows(&source.table)?,
                progress: storage.load_progress(&source.id)?,
            })
        })
        .collect()
}

/// Renders the end-of-run summary
///
/// Per source: total requests, successful requests, success rate and items
/// stored, with a warning line when any request failed.
pub fn render_run_summary(report: &RunReport) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "=== Run {} Summary ===\n", report.run_id);

    for source in &report.sources {
        let stored = report
            .pipeline
            .inserted
            .get(&source.table)
            .copied()
            .unwrap_or(0);

        let _ = writeln!(out, "Source {}:", source.source_id);
        let _ = writeln!(out, "  Total requests: {}", source.total_requests);
        let _ = writeln!(out, "  Successful requests: {}", source.successful_requests);
        let _ = writeln!(out, "  Success rate: {:.1}%", source.success_rate());
        let _ = writeln!(out, "  Items emitted: {}", source.items_emitted);
        let _ = writeln!(out, "  Items stored: {}", stored);
        if source.failed_requests > 0 {
            let _ = writeln!(
                out,
                "  WARNING: {} failed request(s), {} page(s) given up",
                source.failed_requests, source.failed_pages
            );
        }
        if source.fatal {
            let _ = writeln!(
                out,
                "  FAILED: {}",
                source.last_error.as_deref().unwrap_or("unknown error")
            );
        }
        let _ = writeln!(out);
    }

    let _ = writeln!(out, "Rows inserted: {}", report.pipeline.total_inserted());
    for (table, count) in &report.pipeline.inserted {
        let _ = writeln!(out, "  {}: {}", table, count);
    }
    let _ = writeln!(out, "Already stored: {}", report.pipeline.skipped_existing);
    if report.pipeline.rejected > 0 {
        let _ = writeln!(out, "Rejected by constraints: {}", report.pipeline.rejected);
    }
    if report.pipeline.failed_batches > 0 {
        let _ = writeln!(
            out,
            "WARNING: {} batch(es) failed, {} record(s) lost",
            report.pipeline.failed_batches, report.pipeline.failed_records
        );
    }
    if report.interrupted {
        let _ = writeln!(out, "Run interrupted, {} request(s) abandoned", report.abandoned);
    }

    out
}

/// Prints the end-of-run summary to stdout
pub fn print_run_summary(report: &RunReport) {
    print!("{}", render_run_summary(report));
}

/// Prints the stored state of sources to stdout
pub fn print_source_status(statuses: &[SourceStatus]) {
    for status in statuses {
        println!("Source {} ({}):", status.source_id, status.table);
        println!("  Stored rows: {}", status.rows);
        match &status.progress {
            Some(progress) => {
                println!(
                    "  Last run {}: {} ({}/{} pages, {:.1}%)",
                    progress.run_id,
                    progress.status.to_db_string(),
                    progress.completed_tasks,
                    progress.total_tasks,
                    progress.progress_percent
                );
                println!(
                    "  Items scraped: {}, errors: {}",
                    progress.items_scraped, progress.errors_count
                );
            }
            None => println!("  Never crawled"),
        }
    }
}

/// Prints the keys missing from a source's table
pub fn print_missing_keys(source_id: &str, missing: &BTreeMap<String, DrugBase>) {
    if missing.is_empty() {
        println!("Source {}: no missing keys", source_id);
        return;
    }

    println!("Source {}: {} missing key(s)", source_id, missing.len());
    for (key, drug) in missing {
        match &drug.drug_name {
            Some(name) => println!("  - {} ({})", key, name),
            None => println!("  - {}", key),
        }
    }
}
