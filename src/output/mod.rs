//! Output module for run summaries and source status
//!
//! This module handles:
//! - The end-of-run summary printed by the CLI
//! - Per-source status read back from the database
//! - Missing-key listings of the recrawl check

pub mod stats;

pub use stats::{
    load_source_status, print_missing_keys, print_run_summary, print_source_status, render_run_summary,
    SourceStatus,
};
