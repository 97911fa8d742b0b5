//! Per-category row buffering, chunk flushes, and generation finalize.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use log::{debug, info};

use idv_codec::Row;

use crate::chunks::{ChunkFile, ChunkStore, FsChunkStore};
use crate::layout;
use crate::metadata::{self, DatasetMetadata};
use crate::schema::{
    Actor, CallTrumpRow, DatasetFile, DecisionCategory, DiscardRow, ExtractedBatch, PlayRow,
};

/// Status callback for long-running finalize/merge phases.
pub type StatusFn = dyn Fn(&str) + Send + Sync;

/// Run-wide statistics accumulated across every `add` for a generation.
#[derive(Clone, Debug, Default)]
pub struct GenerationStats {
    pub game_count: u64,
    pub deal_count: u64,
    pub trick_count: u64,
    pub actors: Vec<Actor>,
}

impl GenerationStats {
    fn absorb(&mut self, stats: &crate::schema::ExtractionStats) {
        self.game_count += stats.game_count;
        self.deal_count += stats.deal_count;
        self.trick_count += stats.trick_count;
        for actor in &stats.actors {
            if !self.actors.contains(actor) {
                self.actors.push(actor.clone());
            }
        }
    }
}

struct CategoryBuffer<T> {
    rows: Vec<T>,
    chunks: Vec<ChunkFile>,
}

impl<T> Default for CategoryBuffer<T> {
    fn default() -> Self {
        Self {
            rows: Vec::new(),
            chunks: Vec::new(),
        }
    }
}

impl<T: Row> CategoryBuffer<T> {
    fn total_chunk_rows(&self) -> u64 {
        self.chunks.iter().map(|c| c.rows).sum()
    }

    /// Flush buffered rows as the next numbered chunk, if any.
    fn write_chunk(&mut self, chunk_dir: &Path, category: DecisionCategory) -> Result<()> {
        if self.rows.is_empty() {
            return Ok(());
        }
        let seq = self.chunks.len() + 1;
        let path = layout::chunk_path(chunk_dir, category, seq);
        let rows = idv_codec::save_rows(&self.rows, &path)
            .with_context(|| format!("failed to write chunk {}", path.display()))?;
        debug!("wrote {category} chunk {seq} ({rows} rows)");
        self.chunks.push(ChunkFile { path, rows });
        self.rows.clear();
        Ok(())
    }
}

/// Buffers extracted rows per decision category and turns them into a
/// finalized generation: chunk files while running, one immutable data file
/// plus verified sidecar per category at the end.
pub struct TrainingDataAccumulator<S: ChunkStore = FsChunkStore> {
    output_dir: PathBuf,
    write_empty_categories: bool,
    store: S,
    play: CategoryBuffer<PlayRow>,
    call_trump: CategoryBuffer<CallTrumpRow>,
    discard: CategoryBuffer<DiscardRow>,
    stats: GenerationStats,
    guard_checked: bool,
    allow_overwrite: bool,
    any_added: bool,
}

impl TrainingDataAccumulator<FsChunkStore> {
    pub fn new(output_dir: PathBuf, write_empty_categories: bool) -> Self {
        Self::with_store(output_dir, write_empty_categories, FsChunkStore::default())
    }
}

impl<S: ChunkStore> TrainingDataAccumulator<S> {
    pub fn with_store(output_dir: PathBuf, write_empty_categories: bool, store: S) -> Self {
        Self {
            output_dir,
            write_empty_categories,
            store,
            play: CategoryBuffer::default(),
            call_trump: CategoryBuffer::default(),
            discard: CategoryBuffer::default(),
            stats: GenerationStats::default(),
            guard_checked: false,
            allow_overwrite: false,
            any_added: false,
        }
    }

    /// Append one extracted batch. Stats accumulate for the whole generation,
    /// not just the rows still buffered.
    pub fn add(&mut self, batch: ExtractedBatch) {
        self.any_added = true;
        self.stats.absorb(&batch.stats);
        self.play.rows.extend(batch.play_rows);
        self.call_trump.rows.extend(batch.call_trump_rows);
        self.discard.rows.extend(batch.discard_rows);
    }

    /// Run-wide stats accumulated so far.
    pub fn stats(&self) -> &GenerationStats {
        &self.stats
    }

    /// Rows buffered but not yet flushed to a chunk.
    pub fn buffered_rows(&self) -> u64 {
        (self.play.rows.len() + self.call_trump.rows.len() + self.discard.rows.len()) as u64
    }

    /// Flush every category's buffered rows as new numbered chunk files.
    ///
    /// The very first call for a generation runs the overwrite guard against
    /// the *final* output paths of all three categories; any conflict aborts
    /// with every colliding path named and nothing written. Later calls skip
    /// the guard, a chunk being a fresh non-conflicting file.
    pub fn save_chunk(&mut self, name: &str, allow_overwrite: bool) -> Result<()> {
        if !self.guard_checked {
            let mut candidates = Vec::with_capacity(6);
            for category in DecisionCategory::ALL {
                let data = layout::final_data_path(&self.output_dir, name, category);
                candidates.push(metadata::metadata_path(&data));
                candidates.push(data);
            }
            layout::overwrite_guard(&candidates, allow_overwrite)?;
            self.guard_checked = true;
            self.allow_overwrite = allow_overwrite;
        }

        let chunk_dir = layout::chunk_dir(&self.output_dir, name);
        std::fs::create_dir_all(&chunk_dir)
            .with_context(|| format!("failed to create {}", chunk_dir.display()))?;

        // The three categories touch disjoint files; write them in parallel.
        let (mut r_play, mut r_call, mut r_discard) = (Ok(()), Ok(()), Ok(()));
        {
            let play = &mut self.play;
            let call_trump = &mut self.call_trump;
            let discard = &mut self.discard;
            let dir = chunk_dir.as_path();
            rayon::scope(|s| {
                s.spawn(|_| r_play = play.write_chunk(dir, DecisionCategory::Play));
                s.spawn(|_| r_call = call_trump.write_chunk(dir, DecisionCategory::CallTrump));
                s.spawn(|_| r_discard = discard.write_chunk(dir, DecisionCategory::Discard));
            });
        }
        r_play?;
        r_call?;
        r_discard?;
        Ok(())
    }

    /// Convert the generation's chunks into final dataset files.
    ///
    /// Per category: no chunks is skipped (or written empty under the
    /// configured policy), a lone chunk is renamed, two or more are streamed
    /// into one file. Sidecars carry the accumulated run stats plus each
    /// category's total row count. The chunk working directory is removed
    /// last.
    pub fn finalize(
        &mut self,
        name: &str,
        status: Option<&StatusFn>,
    ) -> Result<Vec<DatasetFile>> {
        if !self.any_added {
            debug!("finalize({name}): nothing was added, skipping");
            return Ok(Vec::new());
        }
        let notify = |msg: &str| {
            if let Some(cb) = status {
                cb(msg);
            }
        };

        if self.buffered_rows() > 0 {
            notify("Saving remaining rows...");
            let allow = self.allow_overwrite;
            self.save_chunk(name, allow)?;
        }

        let (mut r_play, mut r_call, mut r_discard) = (Ok(None), Ok(None), Ok(None));
        {
            let ctx = FinalizeContext {
                output_dir: &self.output_dir,
                name,
                store: &self.store,
                stats: &self.stats,
                write_empty: self.write_empty_categories,
                status,
            };
            let play = &self.play.chunks;
            let call_trump = &self.call_trump.chunks;
            let discard = &self.discard.chunks;
            rayon::scope(|s| {
                s.spawn(|_| {
                    r_play = finalize_category::<PlayRow, S>(&ctx, DecisionCategory::Play, play)
                });
                s.spawn(|_| {
                    r_call = finalize_category::<CallTrumpRow, S>(
                        &ctx,
                        DecisionCategory::CallTrump,
                        call_trump,
                    )
                });
                s.spawn(|_| {
                    r_discard = finalize_category::<DiscardRow, S>(
                        &ctx,
                        DecisionCategory::Discard,
                        discard,
                    )
                });
            });
        }
        let files: Vec<DatasetFile> = [r_play?, r_call?, r_discard?]
            .into_iter()
            .flatten()
            .collect();

        let chunk_dir = layout::chunk_dir(&self.output_dir, name);
        if chunk_dir.exists() {
            notify("Cleaning up...");
            self.store.cleanup_chunk_directory(&chunk_dir)?;
        }

        info!(
            "finalized generation '{name}': {} file(s), {} games, {} deals",
            files.len(),
            self.stats.game_count,
            self.stats.deal_count
        );
        Ok(files)
    }
}

struct FinalizeContext<'a, S: ChunkStore> {
    output_dir: &'a Path,
    name: &'a str,
    store: &'a S,
    stats: &'a GenerationStats,
    write_empty: bool,
    status: Option<&'a StatusFn>,
}

fn finalize_category<T: Row, S: ChunkStore>(
    ctx: &FinalizeContext<'_, S>,
    category: DecisionCategory,
    chunks: &[ChunkFile],
) -> Result<Option<DatasetFile>> {
    let notify = |msg: &str| {
        if let Some(cb) = ctx.status {
            cb(msg);
        }
    };
    let final_path = layout::final_data_path(ctx.output_dir, ctx.name, category);
    let total_rows: u64 = chunks.iter().map(|c| c.rows).sum();

    match chunks.len() {
        0 => {
            if !ctx.write_empty {
                return Ok(None);
            }
            notify(&format!("Finalizing {category} (empty)..."));
            ctx.store.write_empty::<T>(&final_path)?;
        }
        1 => {
            notify(&format!("Finalizing {category}..."));
            ctx.store.rename_chunk(&chunks[0].path, &final_path, total_rows)?;
        }
        n => {
            notify(&format!("Merging {category} ({n} chunks)..."));
            ctx.store.merge_chunks::<T>(chunks, &final_path, total_rows)?;
        }
    }

    let meta = DatasetMetadata {
        generation_name: ctx.name.to_string(),
        decision_category: category,
        row_count: total_rows,
        game_count: ctx.stats.game_count,
        deal_count: ctx.stats.deal_count,
        trick_count: ctx.stats.trick_count,
        actors: ctx.stats.actors.clone(),
        generated_at_utc: Utc::now(),
    };
    metadata::save_metadata_with_verification(&final_path, &meta)?;

    Ok(Some(DatasetFile {
        category,
        path: final_path,
        rows: total_rows,
    }))
}
