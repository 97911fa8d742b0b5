//! Batch run coordination: a bounded producer pool on one side of the result
//! queue, the persistence consumer on the other.
//!
//! Large runs are split into sub-batches. Each sub-batch is a complete
//! queue-and-consumer cycle that ends by flushing accumulated rows as chunk
//! files, so a crash mid-run loses at most one sub-batch of rows. Counters
//! carry across sub-batches, so progress reporting sees one continuous run.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use log::{debug, info, warn};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::accumulator::{StatusFn, TrainingDataAccumulator};
use crate::collaborators::{FeatureExtractor, ResultStore, TrialProducer};
use crate::config::PipelineConfig;
use crate::consumer::{PersistenceConsumer, PersistenceOptions};
use crate::parallelism::effective_parallelism;
use crate::queue::{ProgressFn, ResultQueue, RunCounters};
use crate::schema::DatasetFile;

/// Below this sub-batch size the per-cycle overhead outweighs the finer
/// crash granularity, and the run stays monolithic.
const MIN_TRIALS_PER_SUB_BATCH: u64 = 250;

/// Final counters and wall time for one `run_batch` call.
#[derive(Clone, Copy, Debug)]
pub struct BatchResults {
    pub counters: RunCounters,
    pub elapsed: Duration,
}

/// Whether a run of `total` trials should be split into sub-batches of
/// `sub_batch_size`.
pub fn should_use_sub_batches(total: u64, sub_batch_size: u64) -> bool {
    sub_batch_size >= MIN_TRIALS_PER_SUB_BATCH && total > sub_batch_size
}

/// Drives trial production and persistence for one or more batch runs, and
/// owns the accumulator between them.
pub struct WorkOrchestrator {
    producer: Arc<dyn TrialProducer>,
    store: Arc<dyn ResultStore>,
    extractor: Arc<dyn FeatureExtractor>,
    config: PipelineConfig,
    cancel: CancellationToken,
    accumulator: Option<TrainingDataAccumulator>,
}

impl WorkOrchestrator {
    pub fn new(
        producer: Arc<dyn TrialProducer>,
        store: Arc<dyn ResultStore>,
        extractor: Arc<dyn FeatureExtractor>,
        config: PipelineConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            producer,
            store,
            extractor,
            config,
            cancel,
            accumulator: None,
        }
    }

    /// Run `trials` trials through the pipeline. Production fans out to at
    /// most the effective parallelism; every trial is credited exactly once,
    /// as a success or a failure.
    pub async fn run_batch(
        &mut self,
        trials: u64,
        progress: Option<ProgressFn>,
        options: PersistenceOptions,
    ) -> Result<BatchResults> {
        if trials == 0 {
            bail!("trial count must be positive");
        }
        let parallelism = effective_parallelism(self.config.max_parallelism);
        let start = Instant::now();

        if options.generation_name.is_some() && self.accumulator.is_none() {
            self.accumulator = Some(TrainingDataAccumulator::new(
                self.config.output_dir.clone(),
                self.config.write_empty_categories,
            ));
        }

        let sub_batch = if should_use_sub_batches(trials, self.config.sub_batch_size) {
            self.config.sub_batch_size
        } else {
            trials
        };
        info!(
            "running {trials} trial(s), parallelism {parallelism}, \
             sub-batches of {sub_batch}"
        );

        let semaphore = Arc::new(Semaphore::new(parallelism));
        let mut totals = RunCounters::default();
        let mut next_trial = 0u64;
        while next_trial < trials {
            let count = sub_batch.min(trials - next_trial);
            totals = self
                .run_sub_batch(next_trial, count, totals, &semaphore, &progress, &options)
                .await?;
            next_trial += count;
            if self.cancel.is_cancelled() {
                bail!("run cancelled after {} trial(s)", totals.completed);
            }
        }

        Ok(BatchResults {
            counters: totals,
            elapsed: start.elapsed(),
        })
    }

    async fn run_sub_batch(
        &mut self,
        first_trial: u64,
        count: u64,
        initial: RunCounters,
        semaphore: &Arc<Semaphore>,
        progress: &Option<ProgressFn>,
        options: &PersistenceOptions,
    ) -> Result<RunCounters> {
        debug!("sub-batch of {count} trial(s) starting at {first_trial}");
        let queue = ResultQueue::with_initial(self.config.queue_capacity, initial, progress.clone());
        let counters = queue.counters();
        let rx = queue.take_receiver()?;
        let tx = queue.sender()?;

        let consumer = PersistenceConsumer::new(
            Arc::clone(&self.store),
            Arc::clone(&self.extractor),
            self.config.batch_size,
            self.cancel.clone(),
        );
        let consumer_handle = {
            let counters = Arc::clone(&counters);
            let accumulator = self.accumulator.take();
            let options = options.clone();
            tokio::task::spawn_blocking(move || {
                consumer.consume_and_persist(rx, counters, accumulator, &options)
            })
        };

        let mut producers = JoinSet::new();
        for trial_index in first_trial..first_trial + count {
            let semaphore = Arc::clone(semaphore);
            let producer = Arc::clone(&self.producer);
            let counters = Arc::clone(&counters);
            let tx = tx.clone();
            let cancel = self.cancel.clone();
            producers.spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return,
                };
                if cancel.is_cancelled() {
                    return;
                }
                let produced =
                    tokio::task::spawn_blocking(move || producer.produce(trial_index)).await;
                match produced {
                    Ok(Ok(result)) => {
                        let won = result.won;
                        let deals = result.deal_count();
                        let tricks = result.trick_count();
                        let decisions = result.decision_count();
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => return,
                            sent = tx.send(result) => {
                                if sent.is_err() {
                                    return;
                                }
                            }
                        }
                        counters.record(|c| {
                            c.completed += 1;
                            if won {
                                c.wins += 1;
                            }
                            c.deals += deals;
                            c.tricks += tricks;
                            c.decisions += decisions;
                        });
                    }
                    Ok(Err(err)) => {
                        warn!("trial {trial_index} failed: {err:#}");
                        counters.record(|c| {
                            c.completed += 1;
                            c.failures += 1;
                        });
                    }
                    Err(join_err) => {
                        warn!("trial {trial_index} task aborted: {join_err}");
                        counters.record(|c| {
                            c.completed += 1;
                            c.failures += 1;
                        });
                    }
                }
            });
        }
        drop(tx);

        while let Some(joined) = producers.join_next().await {
            joined.context("producer task panicked")?;
        }
        queue.complete_writing();

        self.accumulator = consumer_handle
            .await
            .context("consumer thread panicked")?
            .context("persistence consumer failed")?;
        Ok(counters.snapshot())
    }

    /// Convert everything accumulated since the first `run_batch` into final
    /// dataset files. A no-op returning no files when nothing was extracted.
    pub async fn finalize(
        &mut self,
        generation_name: &str,
        status: Option<Arc<StatusFn>>,
    ) -> Result<Vec<DatasetFile>> {
        let Some(mut accumulator) = self.accumulator.take() else {
            return Ok(Vec::new());
        };
        let name = generation_name.to_owned();
        tokio::task::spawn_blocking(move || accumulator.finalize(&name, status.as_deref()))
            .await
            .context("finalize thread panicked")?
    }
}
