//! Shared fakes for pipeline tests.

use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Result, bail};
use parking_lot::Mutex;

use crate::collaborators::{FeatureExtractor, ResultStore, TrialProducer};
use crate::schema::{
    Actor, DealRecord, ExtractedBatch, ExtractionStats, PlayRow, SimulationResult,
};

/// Produces identical results: every trial wins and plays `deals` deals of
/// `tricks_per_deal` tricks each.
pub struct FixedProducer {
    deals: u32,
    tricks_per_deal: u32,
    fail_every: Option<u64>,
    calls: AtomicU64,
}

impl FixedProducer {
    pub fn all_wins(deals: u32, tricks_per_deal: u32) -> Self {
        Self {
            deals,
            tricks_per_deal,
            fail_every: None,
            calls: AtomicU64::new(0),
        }
    }

    /// Every `n`th call (1-based) returns an error instead of a result.
    pub fn failing_every(deals: u32, tricks_per_deal: u32, n: u64) -> Self {
        Self {
            deals,
            tricks_per_deal,
            fail_every: Some(n),
            calls: AtomicU64::new(0),
        }
    }

}

impl TrialProducer for FixedProducer {
    fn produce(&self, trial_index: u64) -> Result<SimulationResult> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(n) = self.fail_every {
            if call % n == 0 {
                bail!("scripted failure on trial {trial_index}");
            }
        }
        Ok(SimulationResult {
            won: true,
            deals: (0..self.deals)
                .map(|_| DealRecord {
                    tricks: self.tricks_per_deal,
                    decisions: self.tricks_per_deal,
                })
                .collect(),
        })
    }
}

/// Records the size of every batch handed to it; optionally errors on each.
#[derive(Default)]
pub struct CountingStore {
    batches: Mutex<Vec<usize>>,
    fail: bool,
}

impl CountingStore {
    pub fn failing() -> Self {
        Self {
            batches: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batches.lock().clone()
    }
}

impl ResultStore for CountingStore {
    fn save_batch(
        &self,
        results: &[SimulationResult],
        progress: &(dyn Fn(usize) + Send + Sync),
    ) -> Result<()> {
        self.batches.lock().push(results.len());
        progress(results.len());
        if self.fail {
            bail!("store unavailable");
        }
        Ok(())
    }
}

/// Emits one play row per trick played, with a single fixed actor.
#[derive(Default)]
pub struct TrickExtractor;

impl FeatureExtractor for TrickExtractor {
    fn extract(&self, results: &[SimulationResult]) -> Result<ExtractedBatch> {
        let mut play_rows = Vec::new();
        for result in results {
            for _ in 0..result.trick_count() {
                play_rows.push(PlayRow {
                    hand: [0.0; 24],
                    table: [0.0; 24],
                    trump: 0,
                    lead_suit: 0,
                    seat: 0,
                    trick_index: 0,
                    chosen_card: 0,
                    outcome: if result.won { 1.0 } else { -1.0 },
                });
            }
        }
        Ok(ExtractedBatch {
            play_rows,
            call_trump_rows: Vec::new(),
            discard_rows: Vec::new(),
            stats: ExtractionStats {
                game_count: results.len() as u64,
                deal_count: results.iter().map(SimulationResult::deal_count).sum(),
                trick_count: results.iter().map(SimulationResult::trick_count).sum(),
                rows_failed: 0,
                actors: vec![Actor {
                    actor_type: "Chaos".into(),
                    model_name: None,
                    exploration_temperature: 0.0,
                }],
            },
        })
    }
}
