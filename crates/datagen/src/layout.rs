//! On-disk layout of a generation and the overwrite guard.

use std::path::{Path, PathBuf};

use anyhow::{Result, bail};
use log::info;

use crate::schema::DecisionCategory;

/// Final data file for one category of a generation:
/// `<output_dir>/<name>_<Category>.idv`.
pub fn final_data_path(output_dir: &Path, name: &str, category: DecisionCategory) -> PathBuf {
    output_dir.join(format!(
        "{name}_{}.{}",
        category.as_str(),
        idv_codec::DATA_EXTENSION
    ))
}

/// Working directory holding a generation's chunks:
/// `<output_dir>/_chunks/<name>`.
pub fn chunk_dir(output_dir: &Path, name: &str) -> PathBuf {
    output_dir.join("_chunks").join(name)
}

/// Numbered chunk file within a chunk directory. Sequence numbers are
/// 1-based and contiguous: `<Category>_chunk<NNNN>.idv`.
pub fn chunk_path(chunk_dir: &Path, category: DecisionCategory, seq: usize) -> PathBuf {
    chunk_dir.join(format!(
        "{}_chunk{seq:04}.{}",
        category.as_str(),
        idv_codec::DATA_EXTENSION
    ))
}

/// Check every candidate output path before any destructive write. Either
/// all conflicts are acceptable (`allow_overwrite`) or the guard aborts with
/// every conflicting path named and zero bytes written.
pub fn overwrite_guard(paths: &[PathBuf], allow_overwrite: bool) -> Result<()> {
    let conflicts: Vec<&PathBuf> = paths.iter().filter(|p| p.exists()).collect();
    if conflicts.is_empty() {
        return Ok(());
    }
    if allow_overwrite {
        info!("overwriting {} existing file(s)", conflicts.len());
        return Ok(());
    }
    let listing = conflicts
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ");
    bail!("output already exists (pass overwrite to replace): {listing}");
}
