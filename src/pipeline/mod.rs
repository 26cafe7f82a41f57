//! Asynchronous persistence pipeline
//!
//! Records are buffered and handed to the sink in batches on the blocking
//! pool, so producers never wait on a slow commit:
//! - `PersistencePipeline`: the buffer, the active flushes and the flush clock
//! - `PipelineHandle`: a cloneable sender feeding a pipeline task

mod handle;

pub use handle::PipelineHandle;

use crate::config::PipelineConfig;
use crate::storage::{BatchOutcome, Record, RecordSink, StorageResult};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::{JoinError, JoinSet};

/// Cumulative result of every flush of a pipeline
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineTotals {
    /// Items inserted per table
    pub inserted: BTreeMap<String, u64>,
    pub skipped_existing: u64,
    pub rejected: u64,
    pub audits: u64,
    pub progress: u64,
    /// Batches handed to the sink
    pub batches: u64,
    pub failed_batches: u64,
    /// Records lost with failed batches
    pub failed_records: u64,
}

impl PipelineTotals {
    pub fn total_inserted(&self) -> u64 {
        self.inserted.values().sum()
    }

    fn absorb(&mut self, outcome: &BatchOutcome) {
        for (table, count) in &outcome.inserted {
            *self.inserted.entry(table.clone()).or_default() += count;
        }
        self.skipped_existing += outcome.skipped_existing;
        self.rejected += outcome.rejected;
        self.audits += outcome.audits;
        self.progress += outcome.progress;
    }
}

type FlushResult = (usize, StorageResult<BatchOutcome>);

/// Buffered batcher in front of a `RecordSink`
pub struct PersistencePipeline {
    sink: Arc<dyn RecordSink>,
    config: PipelineConfig,
    buffer: Vec<Record>,
    active_flushes: JoinSet<FlushResult>,
    last_flush: Instant,
    totals: PipelineTotals,
}

impl PersistencePipeline {
    pub fn new(sink: Arc<dyn RecordSink>, config: PipelineConfig) -> Self {
        Self {
            sink,
            buffer: Vec::with_capacity(config.size_threshold),
            config,
            active_flushes: JoinSet::new(),
            last_flush: Instant::now(),
            totals: PipelineTotals::default(),
        }
    }

    /// Buffers a record, flushing when a threshold is crossed
    ///
    /// Never waits for a flush to finish. Must be called from within a tokio
    /// runtime.
    pub fn accept(&mut self, record: Record) {
        self.buffer.push(record);
        self.reap();

        if self.buffer.len() >= self.config.size_threshold || self.flush_due() {
            self.flush_buffer();
        }
    }

    /// Flushes a non-empty buffer whose time threshold has passed
    pub fn tick(&mut self) {
        self.reap();
        if self.flush_due() {
            self.flush_buffer();
        }
    }

    /// Flushes the remainder and waits for every active flush
    pub async fn close(&mut self) -> PipelineTotals {
        if !self.buffer.is_empty() {
            self.flush_buffer();
        }

        while let Some(result) = self.active_flushes.join_next().await {
            self.record_flush(result);
        }

        tracing::debug!(
            "Pipeline closed: {} batches, {} items inserted",
            self.totals.batches,
            self.totals.total_inserted()
        );
        self.totals.clone()
    }

    /// Records waiting in the buffer
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Flushes handed to the sink and not yet reaped
    pub fn active_flushes(&self) -> usize {
        self.active_flushes.len()
    }

    pub fn totals(&self) -> &PipelineTotals {
        &self.totals
    }

    fn flush_due(&self) -> bool {
        !self.buffer.is_empty() && self.last_flush.elapsed() >= self.config.time_threshold()
    }

    /// Detaches the buffer and commits it on the blocking pool
    fn flush_buffer(&mut self) {
        let batch = std::mem::replace(
            &mut self.buffer,
            Vec::with_capacity(self.config.size_threshold),
        );
        self.last_flush = Instant::now();
        self.totals.batches += 1;

        let sink = Arc::clone(&self.sink);
        let len = batch.len();
        tracing::debug!("Flushing batch of {} records", len);
        self.active_flushes
            .spawn_blocking(move || (len, sink.save_batch(batch)));
    }

    /// Collects finished flushes without waiting
    fn reap(&mut self) {
        while let Some(result) = self.active_flushes.try_join_next() {
            self.record_flush(result);
        }
    }

    fn record_flush(&mut self, result: Result<FlushResult, JoinError>) {
        match result {
            Ok((_, Ok(outcome))) => self.totals.absorb(&outcome),
            Ok((len, Err(e))) => {
                tracing::error!("Flush of {} records failed: {}", len, e);
                self.totals.failed_batches += 1;
                self.totals.failed_records += len as u64;
            }
            Err(e) => {
                tracing::error!("Flush task did not complete: {}", e);
                self.totals.failed_batches += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::{DrugBase, Item, ItemContext};
    use crate::storage::StorageError;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Sink that records batch sizes and optionally stalls or fails
    #[derive(Default)]
    struct RecordingSink {
        batches: Mutex<Vec<usize>>,
        delay: Duration,
        fail: bool,
    }

    impl RecordSink for RecordingSink {
        fn save_batch(&self, batch: Vec<Record>) -> StorageResult<BatchOutcome> {
            std::thread::sleep(self.delay);
            self.batches.lock().unwrap().push(batch.len());
            if self.fail {
                return Err(StorageError::Busy("locked".to_string()));
            }
            let mut outcome = BatchOutcome::default();
            outcome.inserted.insert("t".to_string(), batch.len() as u64);
            Ok(outcome)
        }
    }

    fn record(i: usize) -> Record {
        let ctx = ItemContext {
            table: "t",
            source_id: "s",
            url: "",
            page_no: 1,
        };
        Record::Item(Item::from_pair(&ctx, &DrugBase::from_key(format!("K{}", i)), None))
    }

    fn config(size: usize, time_ms: u64) -> PipelineConfig {
        PipelineConfig {
            size_threshold: size,
            time_threshold_ms: time_ms,
        }
    }

    #[tokio::test]
    async fn test_size_threshold_triggers_flush() {
        let sink = Arc::new(RecordingSink::default());
        let mut pipeline = PersistencePipeline::new(sink.clone(), config(10, 60_000));

        for i in 0..25 {
            pipeline.accept(record(i));
        }
        assert_eq!(pipeline.buffered(), 5);

        let totals = pipeline.close().await;
        assert_eq!(totals.total_inserted(), 25);
        assert_eq!(totals.batches, 3);
        let mut sizes = sink.batches.lock().unwrap().clone();
        sizes.sort_unstable();
        assert_eq!(sizes, vec![5, 10, 10]);
    }

    #[tokio::test]
    async fn test_time_threshold_triggers_flush() {
        let sink = Arc::new(RecordingSink::default());
        let mut pipeline = PersistencePipeline::new(sink.clone(), config(1000, 20));

        pipeline.accept(record(0));
        assert_eq!(pipeline.buffered(), 1);

        tokio::time::sleep(Duration::from_millis(40)).await;
        pipeline.tick();
        assert_eq!(pipeline.buffered(), 0);

        let totals = pipeline.close().await;
        assert_eq!(totals.batches, 1);
    }

    #[tokio::test]
    async fn test_close_leaves_nothing_behind() {
        let sink = Arc::new(RecordingSink {
            delay: Duration::from_millis(50),
            ..RecordingSink::default()
        });
        let mut pipeline = PersistencePipeline::new(sink, config(4, 60_000));

        for i in 0..10 {
            pipeline.accept(record(i));
        }
        assert!(pipeline.active_flushes() > 0);

        let totals = pipeline.close().await;
        assert_eq!(pipeline.buffered(), 0);
        assert_eq!(pipeline.active_flushes(), 0);
        assert_eq!(totals.total_inserted(), 10);
    }

    #[tokio::test]
    async fn test_failed_flush_is_counted_not_retried() {
        let sink = Arc::new(RecordingSink {
            fail: true,
            ..RecordingSink::default()
        });
        let mut pipeline = PersistencePipeline::new(sink.clone(), config(3, 60_000));

        for i in 0..3 {
            pipeline.accept(record(i));
        }
        let totals = pipeline.close().await;

        assert_eq!(totals.failed_batches, 1);
        assert_eq!(totals.failed_records, 3);
        assert_eq!(sink.batches.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_accept_does_not_wait_for_slow_sink() {
        let sink = Arc::new(RecordingSink {
            delay: Duration::from_millis(300),
            ..RecordingSink::default()
        });
        let mut pipeline = PersistencePipeline::new(sink, config(10, 60_000));

        let started = Instant::now();
        for i in 0..100 {
            pipeline.accept(record(i));
        }
        assert!(started.elapsed() < Duration::from_millis(200));

        let totals = pipeline.close().await;
        assert_eq!(totals.total_inserted(), 100);
    }
}
