//! Differential recrawl
//!
//! Compares a source's remote catalog with the drug keys stored in its fact
//! table and repairs the difference, either by fetching the missing keys'
//! detail pages or by touching rows that already exist.

mod manager;

pub use manager::{RecrawlManager, RecrawlMode, RecrawlOutcome};
