//! Capability traits for the external collaborators the pipeline drives.
//!
//! All three are synchronous: trial production and feature extraction are
//! CPU-bound and the store is bulk I/O, so callers run them on blocking
//! threads. Implementations must be shareable across workers.

use anyhow::Result;

use crate::schema::{ExtractedBatch, SimulationResult};

/// Produces one simulation trial per call. A returned error is an item
/// failure, not a pipeline failure; the orchestrator counts it and moves on.
pub trait TrialProducer: Send + Sync {
    fn produce(&self, trial_index: u64) -> Result<SimulationResult>;
}

/// Durable store for raw results. Failures during a bulk save are caught,
/// logged, and never abort the pipeline.
pub trait ResultStore: Send + Sync {
    /// Save a batch, reporting per-item progress through `progress`.
    fn save_batch(
        &self,
        results: &[SimulationResult],
        progress: &(dyn Fn(usize) + Send + Sync),
    ) -> Result<()>;
}

/// Turns a batch of results into categorized training rows plus run stats.
/// Per-row failures are counted in the returned stats and skipped.
pub trait FeatureExtractor: Send + Sync {
    fn extract(&self, results: &[SimulationResult]) -> Result<ExtractedBatch>;
}
