//! Training-dataset generation pipeline for euchre self-play.
//!
//! Trials run concurrently and push results through a bounded queue to a
//! single persistence consumer, which extracts feature rows and buffers them
//! in a chunked accumulator. Finalizing a generation turns the chunks into
//! one immutable data file plus a verified metadata sidecar per decision
//! category; finished generations can later be merged round-robin into
//! larger datasets.

pub mod accumulator;
pub mod chunks;
pub mod collaborators;
pub mod config;
pub mod consumer;
pub mod layout;
pub mod merge;
pub mod metadata;
pub mod orchestrator;
pub mod parallelism;
pub mod queue;
pub mod schema;

#[cfg(test)]
pub(crate) mod testkit;

pub use accumulator::{GenerationStats, StatusFn, TrainingDataAccumulator};
pub use collaborators::{FeatureExtractor, ResultStore, TrialProducer};
pub use config::PipelineConfig;
pub use consumer::{PersistenceConsumer, PersistenceOptions};
pub use merge::CrossGenerationMergeService;
pub use metadata::DatasetMetadata;
pub use orchestrator::{BatchResults, WorkOrchestrator};
pub use queue::{ProgressFn, ResultQueue, RunCounters};
pub use schema::{
    Actor, CallTrumpRow, DatasetFile, DealRecord, DecisionCategory, DiscardRow, ExtractedBatch,
    ExtractionStats, PlayRow, SimulationResult,
};
