//! Chunk finalization: streamed merge, single-chunk rename, and cleanup.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use log::{debug, warn};
use tokio_util::sync::CancellationToken;

use idv_codec::{Row, RowWriter, stream_rows};

/// One on-disk chunk recorded by the accumulator.
#[derive(Clone, Debug)]
pub struct ChunkFile {
    pub path: PathBuf,
    pub rows: u64,
}

/// Seam over the chunk-to-final-file operations, so finalize behavior can be
/// observed in tests without touching the streaming implementation.
pub trait ChunkStore: Send + Sync {
    /// Stream all `chunks` in order into one file at `final_path`. Peak
    /// memory must not depend on `total_rows`.
    fn merge_chunks<T: Row>(
        &self,
        chunks: &[ChunkFile],
        final_path: &Path,
        total_rows: u64,
    ) -> Result<()>;

    /// Move a lone chunk to its final path without copying rows.
    fn rename_chunk(&self, chunk_path: &Path, final_path: &Path, total_rows: u64) -> Result<()>;

    /// Produce an empty final file for a category with no rows.
    fn write_empty<T: Row>(&self, final_path: &Path) -> Result<()>;

    /// Recursively delete a generation's chunk working directory.
    fn cleanup_chunk_directory(&self, dir: &Path) -> Result<()>;
}

/// Filesystem-backed chunk store used by the real pipeline.
pub struct FsChunkStore {
    cancel: CancellationToken,
}

/// Rows between cancellation checks during a streamed merge.
const CANCEL_CHECK_INTERVAL: u64 = 8_192;

const CLEANUP_RETRY_DELAY: Duration = Duration::from_millis(100);

impl FsChunkStore {
    pub fn new(cancel: CancellationToken) -> Self {
        Self { cancel }
    }
}

impl Default for FsChunkStore {
    fn default() -> Self {
        Self::new(CancellationToken::new())
    }
}

impl ChunkStore for FsChunkStore {
    fn merge_chunks<T: Row>(
        &self,
        chunks: &[ChunkFile],
        final_path: &Path,
        total_rows: u64,
    ) -> Result<()> {
        let mut writer = RowWriter::<T>::create(final_path)?;
        for chunk in chunks {
            for row in stream_rows::<T>(&chunk.path)? {
                let row =
                    row.with_context(|| format!("while merging {}", chunk.path.display()))?;
                writer.write(&row)?;
                if writer.rows_written() % CANCEL_CHECK_INTERVAL == 0
                    && self.cancel.is_cancelled()
                {
                    bail!("chunk merge cancelled");
                }
            }
        }
        let written = writer.finish()?;
        if written != total_rows {
            bail!(
                "merged {} rows into {} but expected {}",
                written,
                final_path.display(),
                total_rows
            );
        }
        debug!(
            "merged {} chunk(s), {} rows -> {}",
            chunks.len(),
            written,
            final_path.display()
        );
        Ok(())
    }

    fn rename_chunk(&self, chunk_path: &Path, final_path: &Path, total_rows: u64) -> Result<()> {
        fs::rename(chunk_path, final_path).with_context(|| {
            format!(
                "failed to rename {} -> {}",
                chunk_path.display(),
                final_path.display()
            )
        })?;
        debug!("renamed lone chunk ({total_rows} rows) -> {}", final_path.display());
        Ok(())
    }

    fn write_empty<T: Row>(&self, final_path: &Path) -> Result<()> {
        RowWriter::<T>::create(final_path)?.finish()?;
        Ok(())
    }

    fn cleanup_chunk_directory(&self, dir: &Path) -> Result<()> {
        match fs::remove_dir_all(dir) {
            Ok(()) => Ok(()),
            Err(first) => {
                // A lingering handle right after heavy file I/O can block the
                // delete; give the OS a beat and try once more.
                warn!(
                    "cleanup of {} failed ({first}), retrying shortly",
                    dir.display()
                );
                std::thread::sleep(CLEANUP_RETRY_DELAY);
                fs::remove_dir_all(dir).with_context(|| {
                    format!(
                        "failed to remove chunk directory {} after retry (first failure: {first})",
                        dir.display()
                    )
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::DiscardRow;
    use idv_codec::{load_rows, save_rows};
    use tempfile::tempdir;

    fn discard_row(tag: u8) -> DiscardRow {
        DiscardRow {
            hand: [tag as f32; 24],
            trump: tag,
            chosen_discard: tag,
            outcome: 1.0,
        }
    }

    fn write_chunk(dir: &Path, name: &str, tags: &[u8]) -> ChunkFile {
        let rows: Vec<DiscardRow> = tags.iter().map(|&t| discard_row(t)).collect();
        let path = dir.join(name);
        let rows_written = save_rows(&rows, &path).unwrap();
        ChunkFile {
            path,
            rows: rows_written,
        }
    }

    #[test]
    fn merge_concatenates_chunks_in_order() {
        let td = tempdir().unwrap();
        let a = write_chunk(td.path(), "Discard_chunk0001.idv", &[1, 2]);
        let b = write_chunk(td.path(), "Discard_chunk0002.idv", &[3]);
        let c = write_chunk(td.path(), "Discard_chunk0003.idv", &[4, 5]);

        let final_path = td.path().join("gen_Discard.idv");
        FsChunkStore::default()
            .merge_chunks::<DiscardRow>(&[a, b, c], &final_path, 5)
            .unwrap();

        let rows = load_rows::<DiscardRow>(&final_path).unwrap();
        let tags: Vec<u8> = rows.iter().map(|r| r.trump).collect();
        assert_eq!(tags, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn merge_rejects_row_count_mismatch() {
        let td = tempdir().unwrap();
        let a = write_chunk(td.path(), "Discard_chunk0001.idv", &[1, 2]);
        let final_path = td.path().join("gen_Discard.idv");
        let err = FsChunkStore::default()
            .merge_chunks::<DiscardRow>(&[a], &final_path, 3)
            .unwrap_err();
        assert!(format!("{err:#}").contains("expected 3"));
    }

    #[test]
    fn rename_moves_the_chunk() {
        let td = tempdir().unwrap();
        let chunk = write_chunk(td.path(), "Discard_chunk0001.idv", &[9]);
        let final_path = td.path().join("gen_Discard.idv");
        FsChunkStore::default()
            .rename_chunk(&chunk.path, &final_path, 1)
            .unwrap();
        assert!(!chunk.path.exists());
        assert_eq!(load_rows::<DiscardRow>(&final_path).unwrap().len(), 1);
    }

    #[test]
    fn cleanup_removes_the_directory() {
        let td = tempdir().unwrap();
        let dir = td.path().join("_chunks").join("gen");
        fs::create_dir_all(&dir).unwrap();
        write_chunk(&dir, "Discard_chunk0001.idv", &[1]);
        FsChunkStore::default().cleanup_chunk_directory(&dir).unwrap();
        assert!(!dir.exists());
    }

    #[test]
    fn cancelled_merge_aborts() {
        let td = tempdir().unwrap();
        let tags: Vec<u8> = vec![0; (CANCEL_CHECK_INTERVAL + 1) as usize];
        let chunk = write_chunk(td.path(), "Discard_chunk0001.idv", &tags);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let store = FsChunkStore::new(cancel);
        let err = store
            .merge_chunks::<DiscardRow>(&[chunk], &td.path().join("out.idv"), tags.len() as u64)
            .unwrap_err();
        assert!(format!("{err:#}").contains("cancelled"));
    }
}
