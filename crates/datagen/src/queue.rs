//! Bounded hand-off between trial producers and the persistence consumer,
//! plus the shared aggregate-counter block.
//!
//! The queue has a fixed capacity chosen at construction and exactly one
//! reader. Writers block (not drop) when the queue is full, which is the
//! pipeline's backpressure. The counter block is the single critical section
//! for run bookkeeping: every counter mutation and its progress callback run
//! together inside one lock, so observers never see the two out of sync.

use std::sync::Arc;

use anyhow::{Result, bail};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::schema::SimulationResult;

/// Progress callback invoked inside the counter critical section.
pub type ProgressFn = Arc<dyn Fn(&RunCounters) + Send + Sync>;

/// Aggregate counters for one batch run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RunCounters {
    /// Trials finished, successfully or not.
    pub completed: u64,
    /// Successful trials whose outcome flag was a win.
    pub wins: u64,
    /// Trials whose production failed.
    pub failures: u64,
    pub deals: u64,
    pub tricks: u64,
    pub decisions: u64,
    /// Results credited as persisted by the consumer.
    pub saved: u64,
}

impl RunCounters {
    /// Trials that produced a usable result.
    pub fn successes(&self) -> u64 {
        self.completed - self.failures
    }

    /// Fraction of successful trials won; 0 when nothing succeeded.
    pub fn win_rate(&self) -> f64 {
        match self.successes() {
            0 => 0.0,
            n => self.wins as f64 / n as f64,
        }
    }

    /// Fraction of successful trials lost; 0 when nothing succeeded.
    pub fn loss_rate(&self) -> f64 {
        match self.successes() {
            0 => 0.0,
            n => (n - self.wins) as f64 / n as f64,
        }
    }
}

/// The one lock guarding the run counters.
pub struct CounterBlock {
    counters: Mutex<RunCounters>,
    progress: Option<ProgressFn>,
}

impl CounterBlock {
    fn new(initial: RunCounters, progress: Option<ProgressFn>) -> Self {
        Self {
            counters: Mutex::new(initial),
            progress,
        }
    }

    /// Apply a counter mutation and fire the progress callback, both inside
    /// the same critical section.
    pub fn record(&self, apply: impl FnOnce(&mut RunCounters)) {
        let mut counters = self.counters.lock();
        apply(&mut counters);
        if let Some(progress) = &self.progress {
            progress(&counters);
        }
    }

    /// Copy of the current counters.
    pub fn snapshot(&self) -> RunCounters {
        *self.counters.lock()
    }
}

/// Capacity-bounded many-writer / one-reader result queue.
pub struct ResultQueue {
    tx: Mutex<Option<mpsc::Sender<SimulationResult>>>,
    rx: Mutex<Option<mpsc::Receiver<SimulationResult>>>,
    counters: Arc<CounterBlock>,
    capacity: usize,
}

impl ResultQueue {
    pub fn new(capacity: usize, progress: Option<ProgressFn>) -> Self {
        Self::with_initial(capacity, RunCounters::default(), progress)
    }

    /// Queue whose counters start from `initial` — used when a run is split
    /// into sub-batches and the bookkeeping carries across queue instances.
    pub fn with_initial(
        capacity: usize,
        initial: RunCounters,
        progress: Option<ProgressFn>,
    ) -> Self {
        assert!(capacity > 0, "queue capacity must be positive");
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(Some(rx)),
            counters: Arc::new(CounterBlock::new(initial, progress)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Clone a writer handle. `send` on the handle blocks when the queue is
    /// at capacity and errors once the reader is gone.
    pub fn sender(&self) -> Result<mpsc::Sender<SimulationResult>> {
        match self.tx.lock().as_ref() {
            Some(tx) => Ok(tx.clone()),
            None => bail!("queue writing already completed"),
        }
    }

    /// Signal that no more items will arrive. Outstanding writer handles may
    /// still drain their in-flight sends; the reader finishes once the queue
    /// is empty and every handle is dropped.
    pub fn complete_writing(&self) {
        self.tx.lock().take();
    }

    /// Take the single receiver. Fails on a second call: the queue has
    /// exactly one reader by construction.
    pub fn take_receiver(&self) -> Result<mpsc::Receiver<SimulationResult>> {
        match self.rx.lock().take() {
            Some(rx) => Ok(rx),
            None => bail!("queue receiver already taken"),
        }
    }

    /// Shared counter block for this run.
    pub fn counters(&self) -> Arc<CounterBlock> {
        Arc::clone(&self.counters)
    }
}
