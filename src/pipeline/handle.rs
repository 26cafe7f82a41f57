use crate::config::PipelineConfig;
use crate::pipeline::{PersistencePipeline, PipelineTotals};
use crate::storage::{Record, RecordSink};
use crate::HarvestError;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;

enum Command {
    Record(Record),
    Close(oneshot::Sender<PipelineTotals>),
}

/// Cloneable producer side of a pipeline task
///
/// The pipeline itself is confined to one task; producers only touch the
/// channel.
#[derive(Clone)]
pub struct PipelineHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl PipelineHandle {
    /// Spawns a pipeline task in front of `sink`
    pub fn spawn(sink: Arc<dyn RecordSink>, config: PipelineConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let pipeline = PersistencePipeline::new(sink, config.clone());
        tokio::spawn(run_pipeline(pipeline, config, rx));
        Self { tx }
    }

    /// Hands a record to the pipeline
    ///
    /// Returns false if the pipeline was already closed.
    pub fn send(&self, record: impl Into<Record>) -> bool {
        self.tx.send(Command::Record(record.into())).is_ok()
    }

    /// Flushes everything, waits for every active flush and stops the task
    pub async fn close(&self) -> Result<PipelineTotals, HarvestError> {
        let (reply, totals) = oneshot::channel();
        self.tx
            .send(Command::Close(reply))
            .map_err(|_| HarvestError::Pipeline("pipeline already closed".to_string()))?;
        totals
            .await
            .map_err(|_| HarvestError::Pipeline("pipeline task stopped".to_string()))
    }
}

async fn run_pipeline(
    mut pipeline: PersistencePipeline,
    config: PipelineConfig,
    mut rx: mpsc::UnboundedReceiver<Command>,
) {
    let mut tick = tokio::time::interval(config.time_threshold());
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            command = rx.recv() => match command {
                Some(Command::Record(record)) => pipeline.accept(record),
                Some(Command::Close(reply)) => {
                    let totals = pipeline.close().await;
                    let _ = reply.send(totals);
                    return;
                }
                None => {
                    pipeline.close().await;
                    return;
                }
            },
            _ = tick.tick() => pipeline.tick(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::{DrugBase, Item, ItemContext};
    use crate::storage::{BatchOutcome, StorageResult};
    use std::sync::Mutex;

    #[derive(Default)]
    struct CountingSink {
        records: Mutex<usize>,
    }

    impl RecordSink for CountingSink {
        fn save_batch(&self, batch: Vec<Record>) -> StorageResult<BatchOutcome> {
            *self.records.lock().unwrap() += batch.len();
            Ok(BatchOutcome::default())
        }
    }

    fn item(i: usize) -> Item {
        let ctx = ItemContext {
            table: "t",
            source_id: "s",
            url: "",
            page_no: 1,
        };
        Item::from_pair(&ctx, &DrugBase::from_key(format!("K{}", i)), None)
    }

    #[tokio::test]
    async fn test_handle_flushes_on_close() {
        let sink = Arc::new(CountingSink::default());
        let handle = PipelineHandle::spawn(sink.clone(), PipelineConfig::default());

        let producer = handle.clone();
        let task = tokio::spawn(async move {
            for i in 0..150 {
                assert!(producer.send(item(i)));
            }
        });
        task.await.unwrap();

        let totals = handle.close().await.unwrap();
        assert_eq!(totals.batches, 2);
        assert_eq!(*sink.records.lock().unwrap(), 150);
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let sink = Arc::new(CountingSink::default());
        let handle = PipelineHandle::spawn(sink, PipelineConfig::default());

        handle.close().await.unwrap();
        tokio::task::yield_now().await;

        assert!(!handle.send(item(0)));
        assert!(handle.close().await.is_err());
    }
}
