//! Combining finalized generations into one larger dataset.
//!
//! Unlike finalize, which concatenates a single generation's chunks in order,
//! the cross-generation merge interleaves rows round-robin across the source
//! generations so that a prefix of the merged file already samples every
//! source. Sources are read and written as streams; no category is ever fully
//! resident in memory.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use log::info;
use tokio_util::sync::CancellationToken;

use idv_codec::{Row, RowReader, RowWriter};

use crate::accumulator::StatusFn;
use crate::layout;
use crate::metadata::{self, DatasetMetadata};
use crate::schema::{Actor, CallTrumpRow, DatasetFile, DecisionCategory, DiscardRow, PlayRow};

const CANCEL_CHECK_INTERVAL: u64 = 8_192;

/// Counts aggregated across the source generations' sidecars.
struct MergedCounts {
    game_count: u64,
    deal_count: u64,
    trick_count: u64,
    actors: Vec<Actor>,
}

pub struct CrossGenerationMergeService {
    output_dir: PathBuf,
    cancel: CancellationToken,
}

impl CrossGenerationMergeService {
    pub fn new(output_dir: PathBuf, cancel: CancellationToken) -> Self {
        Self { output_dir, cancel }
    }

    /// Merge the named source generations into `output_name`.
    ///
    /// Every source must be complete: all three category files plus their
    /// sidecars present. Validation runs before anything is written, so a
    /// missing file aborts the merge with no partial output.
    pub async fn merge(
        &self,
        sources: &[String],
        output_name: &str,
        allow_overwrite: bool,
        status: Option<Arc<StatusFn>>,
    ) -> Result<Vec<DatasetFile>> {
        if sources.is_empty() {
            bail!("at least one source generation is required");
        }
        self.validate_sources(sources)?;

        let mut outputs = Vec::with_capacity(6);
        for category in DecisionCategory::ALL {
            let data = layout::final_data_path(&self.output_dir, output_name, category);
            outputs.push(metadata::metadata_path(&data));
            outputs.push(data);
        }
        layout::overwrite_guard(&outputs, allow_overwrite)?;

        let counts = self.aggregate_counts(sources)?;
        info!(
            "merging {} generation(s) into '{output_name}' ({} games total)",
            sources.len(),
            counts.game_count
        );

        let mut tasks = Vec::with_capacity(3);
        for category in DecisionCategory::ALL {
            let source_paths: Vec<PathBuf> = sources
                .iter()
                .map(|name| layout::final_data_path(&self.output_dir, name, category))
                .collect();
            let out_path = layout::final_data_path(&self.output_dir, output_name, category);
            let cancel = self.cancel.clone();
            let status = status.clone();
            tasks.push(tokio::task::spawn_blocking(move || {
                if let Some(cb) = &status {
                    cb(&format!("Merging {category}..."));
                }
                let rows = match category {
                    DecisionCategory::Play => {
                        interleave_sources::<PlayRow>(&source_paths, &out_path, &cancel)?
                    }
                    DecisionCategory::CallTrump => {
                        interleave_sources::<CallTrumpRow>(&source_paths, &out_path, &cancel)?
                    }
                    DecisionCategory::Discard => {
                        interleave_sources::<DiscardRow>(&source_paths, &out_path, &cancel)?
                    }
                };
                Ok::<_, anyhow::Error>(DatasetFile {
                    category,
                    path: out_path,
                    rows,
                })
            }));
        }

        let mut files = Vec::with_capacity(3);
        for task in tasks {
            files.push(task.await.context("merge task panicked")??);
        }

        for file in &files {
            let meta = DatasetMetadata {
                generation_name: output_name.to_owned(),
                decision_category: file.category,
                row_count: file.rows,
                game_count: counts.game_count,
                deal_count: counts.deal_count,
                trick_count: counts.trick_count,
                actors: counts.actors.clone(),
                generated_at_utc: Utc::now(),
            };
            metadata::save_metadata_with_verification(&file.path, &meta)?;
        }
        Ok(files)
    }

    fn validate_sources(&self, sources: &[String]) -> Result<()> {
        for name in sources {
            for category in DecisionCategory::ALL {
                let data = layout::final_data_path(&self.output_dir, name, category);
                if !data.exists() {
                    bail!("source generation '{name}' is missing {}", data.display());
                }
                let sidecar = metadata::metadata_path(&data);
                if !sidecar.exists() {
                    bail!(
                        "source generation '{name}' is missing {}",
                        sidecar.display()
                    );
                }
            }
        }
        Ok(())
    }

    /// Sum game, deal, and trick counts over the sources and union their
    /// actor sets. Per generation those counts are identical across the three
    /// sidecars, so one category serves as canonical.
    fn aggregate_counts(&self, sources: &[String]) -> Result<MergedCounts> {
        let mut counts = MergedCounts {
            game_count: 0,
            deal_count: 0,
            trick_count: 0,
            actors: Vec::new(),
        };
        for name in sources {
            let data = layout::final_data_path(&self.output_dir, name, DecisionCategory::Play);
            let meta = metadata::load_metadata(&data)?;
            counts.game_count += meta.game_count;
            counts.deal_count += meta.deal_count;
            counts.trick_count += meta.trick_count;
            for actor in meta.actors {
                if !counts.actors.contains(&actor) {
                    counts.actors.push(actor);
                }
            }
        }
        Ok(counts)
    }
}

/// Stream rows from `sources` into `out_path` round-robin: one row from each
/// still-open source per pass, dropping a source once exhausted.
fn interleave_sources<T: Row>(
    sources: &[PathBuf],
    out_path: &Path,
    cancel: &CancellationToken,
) -> Result<u64> {
    let mut readers: Vec<RowReader<T>> = sources
        .iter()
        .map(|p| idv_codec::stream_rows(p))
        .collect::<Result<_>>()?;
    let mut writer = RowWriter::create(out_path)?;

    while !readers.is_empty() {
        let mut exhausted = Vec::new();
        for (i, reader) in readers.iter_mut().enumerate() {
            match reader.next() {
                Some(row) => writer.write(&row?)?,
                None => exhausted.push(i),
            }
            if writer.rows_written() % CANCEL_CHECK_INTERVAL == 0 && cancel.is_cancelled() {
                bail!("merge cancelled while writing {}", out_path.display());
            }
        }
        for i in exhausted.into_iter().rev() {
            readers.remove(i);
        }
    }
    writer.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn play_row(tag: f32) -> PlayRow {
        PlayRow {
            hand: [tag; 24],
            table: [0.0; 24],
            trump: 0,
            lead_suit: 0,
            seat: 0,
            trick_index: 0,
            chosen_card: 0,
            outcome: tag,
        }
    }

    fn write_generation(dir: &Path, name: &str, play_tags: &[f32], games: u64) {
        for category in DecisionCategory::ALL {
            let data = layout::final_data_path(dir, name, category);
            let rows = match category {
                DecisionCategory::Play => {
                    let rows: Vec<PlayRow> = play_tags.iter().map(|&t| play_row(t)).collect();
                    idv_codec::save_rows(&rows, &data).unwrap()
                }
                DecisionCategory::CallTrump => {
                    idv_codec::save_rows::<CallTrumpRow>(&[], &data).unwrap()
                }
                DecisionCategory::Discard => idv_codec::save_rows::<DiscardRow>(&[], &data).unwrap(),
            };
            let meta = DatasetMetadata {
                generation_name: name.into(),
                decision_category: category,
                row_count: rows,
                game_count: games,
                deal_count: games * 2,
                trick_count: games * 10,
                actors: vec![
                    Actor {
                        actor_type: "Chaos".into(),
                        model_name: None,
                        exploration_temperature: 1.0,
                    },
                    Actor {
                        actor_type: "Model".into(),
                        model_name: Some(name.to_uppercase()),
                        exploration_temperature: 0.5,
                    },
                ],
                generated_at_utc: Utc::now(),
            };
            metadata::save_metadata_with_verification(&data, &meta).unwrap();
        }
    }

    fn service(dir: &Path) -> CrossGenerationMergeService {
        CrossGenerationMergeService::new(dir.to_path_buf(), CancellationToken::new())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn merge_interleaves_sources_round_robin() {
        let td = tempdir().unwrap();
        write_generation(td.path(), "a", &[1.0, 2.0, 3.0], 1_000);
        write_generation(td.path(), "b", &[10.0], 2_000);

        let files = service(td.path())
            .merge(&["a".into(), "b".into()], "merged", false, None)
            .await
            .unwrap();

        let play = files
            .iter()
            .find(|f| f.category == DecisionCategory::Play)
            .unwrap();
        assert_eq!(play.rows, 4);
        let rows = idv_codec::load_rows::<PlayRow>(&play.path).unwrap();
        let tags: Vec<f32> = rows.iter().map(|r| r.outcome).collect();
        assert_eq!(tags, vec![1.0, 10.0, 2.0, 3.0]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn merged_sidecars_sum_counts_and_union_actors() {
        let td = tempdir().unwrap();
        let tags_a: Vec<f32> = (0..100).map(|i| i as f32).collect();
        let tags_b: Vec<f32> = (0..200).map(|i| -(i as f32)).collect();
        write_generation(td.path(), "a", &tags_a, 1_000);
        write_generation(td.path(), "b", &tags_b, 2_000);

        let files = service(td.path())
            .merge(&["a".into(), "b".into()], "merged", false, None)
            .await
            .unwrap();

        assert_eq!(files.len(), 3);
        let play = files
            .iter()
            .find(|f| f.category == DecisionCategory::Play)
            .unwrap();
        assert_eq!(play.rows, 300);
        for file in &files {
            let meta = metadata::load_metadata(&file.path).unwrap();
            assert_eq!(meta.game_count, 3_000);
            assert_eq!(meta.deal_count, 6_000);
            assert_eq!(meta.trick_count, 30_000);
            // Chaos is shared across both sources and deduplicates.
            assert_eq!(meta.actors.len(), 3);
            assert_eq!(meta.generation_name, "merged");
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn missing_source_file_is_named_and_nothing_is_written() {
        let td = tempdir().unwrap();
        write_generation(td.path(), "a", &[1.0], 100);
        std::fs::remove_file(layout::final_data_path(
            td.path(),
            "a",
            DecisionCategory::Discard,
        ))
        .unwrap();

        let err = service(td.path())
            .merge(&["a".into()], "merged", false, None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("a_Discard.idv"));
        assert!(
            !layout::final_data_path(td.path(), "merged", DecisionCategory::Play).exists()
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn empty_source_list_is_rejected() {
        let td = tempdir().unwrap();
        let err = service(td.path())
            .merge(&[], "merged", false, None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("at least one"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn existing_output_blocks_without_overwrite() {
        let td = tempdir().unwrap();
        write_generation(td.path(), "a", &[1.0], 100);
        write_generation(td.path(), "merged", &[9.0], 1);

        let sources = vec!["a".to_string()];
        let err = service(td.path())
            .merge(&sources, "merged", false, None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("already exists"));

        let files = service(td.path())
            .merge(&sources, "merged", true, None)
            .await
            .unwrap();
        let play = files
            .iter()
            .find(|f| f.category == DecisionCategory::Play)
            .unwrap();
        assert_eq!(play.rows, 1);
        let rows = idv_codec::load_rows::<PlayRow>(&play.path).unwrap();
        assert_eq!(rows[0].outcome, 1.0);
    }
}
