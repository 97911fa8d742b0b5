//! The JSON metadata sidecar written next to every dataset file.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::schema::{Actor, DecisionCategory};

/// Sidecar contents describing one finalized dataset file.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasetMetadata {
    pub generation_name: String,
    pub decision_category: DecisionCategory,
    pub row_count: u64,
    pub game_count: u64,
    pub deal_count: u64,
    pub trick_count: u64,
    pub actors: Vec<Actor>,
    pub generated_at_utc: DateTime<Utc>,
}

/// Sidecar path for a dataset file: `<dataPath>.meta.json`.
pub fn metadata_path(data_path: &Path) -> PathBuf {
    let mut name = data_path.as_os_str().to_owned();
    name.push(".meta.json");
    PathBuf::from(name)
}

/// Serialize `metadata` next to `data_path`, then immediately read it back
/// and compare row counts. A mismatch means the write was truncated or
/// otherwise corrupted and is fatal.
pub fn save_metadata_with_verification(data_path: &Path, metadata: &DatasetMetadata) -> Result<()> {
    let path = metadata_path(data_path);
    let mut json = serde_json::to_string_pretty(metadata)
        .with_context(|| format!("failed to serialize metadata for {}", data_path.display()))?;
    json.push('\n');
    fs::write(&path, json).with_context(|| format!("failed to write {}", path.display()))?;

    verify_row_count(data_path, metadata.row_count)
}

/// Read the sidecar back and compare its row count against `expected`.
pub fn verify_row_count(data_path: &Path, expected: u64) -> Result<()> {
    let read_back = load_metadata(data_path)?;
    if read_back.row_count != expected {
        bail!(
            "metadata verification failed for {}: wrote rowCount {} but read back {}",
            metadata_path(data_path).display(),
            expected,
            read_back.row_count
        );
    }
    Ok(())
}

/// Load the sidecar for `data_path`.
pub fn load_metadata(data_path: &Path) -> Result<DatasetMetadata> {
    let path = metadata_path(data_path);
    let contents =
        fs::read_to_string(&path).with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&contents)
        .with_context(|| format!("failed to parse {}", path.display()))
}
