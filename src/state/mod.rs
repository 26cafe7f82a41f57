//! State module for tracking crawl progress
//!
//! This module provides pacing and status reporting for sources during a run.
//!
//! # Components
//!
//! - `SourcePacing`: Enforces the minimum delay between requests to a source
//! - `AuditEvent` / `Stage`: Append-only page and error events
//! - `ProgressUpdate` / `ProgressSnapshot`: The per-source progress row
//! - `Reporter`: The interface the driver calls at page transitions

mod audit;
mod pacing;
mod progress;
mod reporter;

// Re-export main types
pub use audit::{AuditEvent, Stage};
pub use pacing::SourcePacing;
pub use progress::{ProgressSnapshot, ProgressStatus, ProgressUpdate};
pub use reporter::{PageFailure, PageReport, PipelineReporter, Reporter};
