//! Shared row schemas and trial result types.
//!
//! Each decision category keeps its own row layout; all three implement the
//! bincode derives so generic writers in `idv-codec` can operate over them.

use std::hash::{Hash, Hasher};
use std::path::PathBuf;

use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

/// The three parallel training-data streams produced by every trial.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DecisionCategory {
    Play,
    CallTrump,
    Discard,
}

impl DecisionCategory {
    pub const ALL: [DecisionCategory; 3] = [
        DecisionCategory::Play,
        DecisionCategory::CallTrump,
        DecisionCategory::Discard,
    ];

    /// Name used in file names and the metadata sidecar.
    pub fn as_str(self) -> &'static str {
        match self {
            DecisionCategory::Play => "Play",
            DecisionCategory::CallTrump => "CallTrump",
            DecisionCategory::Discard => "Discard",
        }
    }
}

impl std::fmt::Display for DecisionCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Feature row for one card-play decision.
///
/// Hands and table state are one-hot over the 24-card euchre deck.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Encode, Decode)]
pub struct PlayRow {
    pub hand: [f32; 24],
    pub table: [f32; 24],
    pub trump: u8,
    pub lead_suit: u8,
    pub seat: u8,
    pub trick_index: u8,
    pub chosen_card: u8,
    pub outcome: f32,
}

/// Feature row for one trump-calling decision.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Encode, Decode)]
pub struct CallTrumpRow {
    pub hand: [f32; 24],
    pub upcard: u8,
    pub seat: u8,
    pub bidding_round: u8,
    pub chosen_call: u8,
    pub outcome: f32,
}

/// Feature row for one dealer-discard decision.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Encode, Decode)]
pub struct DiscardRow {
    pub hand: [f32; 24],
    pub trump: u8,
    pub chosen_discard: u8,
    pub outcome: f32,
}

/// Decision sub-records for one deal within a trial. The core treats the
/// contents as opaque; only the extractor interprets them.
#[derive(Clone, Debug, Default)]
pub struct DealRecord {
    pub tricks: u32,
    pub decisions: u32,
}

/// One completed simulation trial.
#[derive(Clone, Debug, Default)]
pub struct SimulationResult {
    pub won: bool,
    pub deals: Vec<DealRecord>,
}

impl SimulationResult {
    pub fn deal_count(&self) -> u64 {
        self.deals.len() as u64
    }

    pub fn trick_count(&self) -> u64 {
        self.deals.iter().map(|d| d.tricks as u64).sum()
    }

    pub fn decision_count(&self) -> u64 {
        self.deals.iter().map(|d| d.decisions as u64).sum()
    }
}

/// Provenance descriptor for the strategy that produced a trial.
///
/// Actors compare by identity: type, model name, and exploration temperature
/// (bit-for-bit), so actor sets union with exact deduplication.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Actor {
    pub actor_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_name: Option<String>,
    pub exploration_temperature: f32,
}

impl PartialEq for Actor {
    fn eq(&self, other: &Self) -> bool {
        self.actor_type == other.actor_type
            && self.model_name == other.model_name
            && self.exploration_temperature.to_bits() == other.exploration_temperature.to_bits()
    }
}

impl Eq for Actor {}

impl Hash for Actor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.actor_type.hash(state);
        self.model_name.hash(state);
        self.exploration_temperature.to_bits().hash(state);
    }
}

/// Run-wide statistics reported by the extractor for one batch.
#[derive(Clone, Debug, Default)]
pub struct ExtractionStats {
    pub game_count: u64,
    pub deal_count: u64,
    pub trick_count: u64,
    /// Rows that failed extraction and were skipped.
    pub rows_failed: u64,
    pub actors: Vec<Actor>,
}

/// Categorized rows plus stats extracted from one batch of results.
#[derive(Debug, Default)]
pub struct ExtractedBatch {
    pub play_rows: Vec<PlayRow>,
    pub call_trump_rows: Vec<CallTrumpRow>,
    pub discard_rows: Vec<DiscardRow>,
    pub stats: ExtractionStats,
}

/// One finalized category file within a generation.
#[derive(Clone, Debug)]
pub struct DatasetFile {
    pub category: DecisionCategory,
    pub path: PathBuf,
    pub rows: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn actor_identity_unions_exactly() {
        let chaos = Actor {
            actor_type: "Chaos".into(),
            model_name: None,
            exploration_temperature: 0.0,
        };
        let model_a = Actor {
            actor_type: "Model".into(),
            model_name: Some("ModelA".into()),
            exploration_temperature: 0.5,
        };
        let mut set = HashSet::new();
        for actor in [chaos.clone(), model_a.clone(), chaos, model_a] {
            set.insert(actor);
        }
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn temperatures_compare_by_bits() {
        let warm = Actor {
            actor_type: "Model".into(),
            model_name: Some("ModelA".into()),
            exploration_temperature: 0.5,
        };
        let mut hot = warm.clone();
        hot.exploration_temperature = 0.75;
        assert_ne!(warm, hot);
    }

    #[test]
    fn result_counts_sum_over_deals() {
        let result = SimulationResult {
            won: true,
            deals: vec![
                DealRecord {
                    tricks: 5,
                    decisions: 7,
                },
                DealRecord {
                    tricks: 5,
                    decisions: 6,
                },
            ],
        };
        assert_eq!(result.deal_count(), 2);
        assert_eq!(result.trick_count(), 10);
        assert_eq!(result.decision_count(), 13);
    }
}
