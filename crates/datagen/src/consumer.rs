//! Drains the result queue, persists batches, and feeds extracted rows to
//! the accumulator.
//!
//! The consumer is the queue's single reader and runs synchronously on a
//! blocking thread. Feature extraction of a flushed batch overlaps with
//! accumulation of the next one: exactly one extraction is in flight, and
//! the consumer waits on it only when about to flush again or at stream end.

use std::sync::Arc;
use std::thread;

use anyhow::{Result, anyhow};
use log::{debug, warn};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::accumulator::TrainingDataAccumulator;
use crate::chunks::ChunkStore;
use crate::collaborators::{FeatureExtractor, ResultStore};
use crate::queue::CounterBlock;
use crate::schema::{ExtractedBatch, SimulationResult};

/// What to do with drained results.
#[derive(Clone, Debug, Default)]
pub struct PersistenceOptions {
    /// Attempt bulk saves to the durable store.
    pub save_to_store: bool,
    /// Extract training rows for this generation. `None` disables extraction
    /// and chunk output entirely.
    pub generation_name: Option<String>,
    /// Passed through to the accumulator's first-chunk overwrite guard.
    pub allow_overwrite: bool,
}

pub struct PersistenceConsumer {
    store: Arc<dyn ResultStore>,
    extractor: Arc<dyn FeatureExtractor>,
    batch_size: usize,
    cancel: CancellationToken,
}

type ExtractionHandle = thread::JoinHandle<Result<ExtractedBatch>>;

impl PersistenceConsumer {
    pub fn new(
        store: Arc<dyn ResultStore>,
        extractor: Arc<dyn FeatureExtractor>,
        batch_size: usize,
        cancel: CancellationToken,
    ) -> Self {
        assert!(batch_size > 0, "batch size must be positive");
        Self {
            store,
            extractor,
            batch_size,
            cancel,
        }
    }

    /// Drain `rx` until the queue completes and empties, flushing batches of
    /// `batch_size` (plus a final remainder). Returns the accumulator so the
    /// caller can keep it across sub-batches.
    pub fn consume_and_persist<S: ChunkStore>(
        &self,
        mut rx: mpsc::Receiver<SimulationResult>,
        counters: Arc<CounterBlock>,
        mut accumulator: Option<TrainingDataAccumulator<S>>,
        options: &PersistenceOptions,
    ) -> Result<Option<TrainingDataAccumulator<S>>> {
        let mut batch: Vec<SimulationResult> = Vec::with_capacity(self.batch_size);
        let mut pending: Option<ExtractionHandle> = None;

        while let Some(result) = rx.blocking_recv() {
            if self.cancel.is_cancelled() {
                debug!("consumer cancelled, discarding remaining queue items");
                break;
            }
            batch.push(result);
            if batch.len() >= self.batch_size {
                self.flush(&mut batch, &mut pending, &mut accumulator, options, &counters)?;
            }
        }
        if !batch.is_empty() && !self.cancel.is_cancelled() {
            self.flush(&mut batch, &mut pending, &mut accumulator, options, &counters)?;
        }
        if let Some(handle) = pending.take() {
            absorb_extraction(handle, accumulator.as_mut())?;
        }

        if !self.cancel.is_cancelled() {
            if let (Some(name), Some(acc)) =
                (options.generation_name.as_deref(), accumulator.as_mut())
            {
                acc.save_chunk(name, options.allow_overwrite)?;
            }
        }
        Ok(accumulator)
    }

    fn flush<S: ChunkStore>(
        &self,
        batch: &mut Vec<SimulationResult>,
        pending: &mut Option<ExtractionHandle>,
        accumulator: &mut Option<TrainingDataAccumulator<S>>,
        options: &PersistenceOptions,
        counters: &CounterBlock,
    ) -> Result<()> {
        let results = std::mem::take(batch);
        let count = results.len() as u64;
        debug!("flushing batch of {count} result(s)");

        if options.save_to_store {
            let progress = |_saved: usize| {};
            if let Err(err) = self.store.save_batch(&results, &progress) {
                // Storage trouble must never stall the run; the batch is
                // still credited below.
                warn!("store persistence failed for batch of {count}: {err:#}");
            }
        }

        if options.generation_name.is_some() && accumulator.is_some() {
            // One extraction in flight at a time: settle the previous batch
            // before handing off this one.
            if let Some(handle) = pending.take() {
                absorb_extraction(handle, accumulator.as_mut())?;
            }
            let extractor = Arc::clone(&self.extractor);
            *pending = Some(thread::spawn(move || extractor.extract(&results)));
        }

        counters.record(|c| c.saved += count);
        batch.reserve(self.batch_size);
        Ok(())
    }
}

fn absorb_extraction<S: ChunkStore>(
    handle: ExtractionHandle,
    accumulator: Option<&mut TrainingDataAccumulator<S>>,
) -> Result<()> {
    let extracted = handle
        .join()
        .map_err(|_| anyhow!("feature extraction thread panicked"))??;
    if extracted.stats.rows_failed > 0 {
        warn!(
            "{} row(s) failed extraction and were skipped",
            extracted.stats.rows_failed
        );
    }
    if let Some(acc) = accumulator {
        acc.add(extracted);
    }
    Ok(())
}
