use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use env_logger::Env;
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info, warn};
use rand::Rng;
use tokio::signal;
use tokio_util::sync::CancellationToken;

use datagen::{
    Actor, CallTrumpRow, CrossGenerationMergeService, DealRecord, DiscardRow, ExtractedBatch,
    ExtractionStats, FeatureExtractor, PersistenceOptions, PipelineConfig, PlayRow, ProgressFn,
    ResultStore, SimulationResult, TrialProducer, WorkOrchestrator,
};

#[derive(Debug, Parser)]
#[command(author, version, about = "Generate and merge euchre training datasets")]
struct Cli {
    /// TOML pipeline configuration; omit to use defaults with --output
    #[arg(long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Output directory (overrides the config file's)
    #[arg(long, value_name = "DIR", global = true)]
    output: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run simulation trials and finalize a dataset generation
    Generate {
        /// Number of trials to run
        #[arg(long, value_name = "N")]
        trials: u64,

        /// Generation name; omit to run trials without persisting rows
        #[arg(long, value_name = "NAME")]
        generation: Option<String>,

        /// Also persist raw results to the trial store
        #[arg(long)]
        save_results: bool,

        /// Overwrite existing dataset files if present
        #[arg(long)]
        overwrite: bool,
    },
    /// Merge finalized generations into one dataset
    Merge {
        /// Source generation names, in priority order
        #[arg(long, value_name = "NAME", num_args = 1.., required = true)]
        sources: Vec<String>,

        /// Name of the merged output generation
        #[arg(long, value_name = "NAME")]
        output_name: String,

        /// Overwrite existing dataset files if present
        #[arg(long)]
        overwrite: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let mut config = match &cli.config {
        Some(path) => PipelineConfig::from_toml(path)?,
        None => {
            let output = cli
                .output
                .clone()
                .context("either --config or --output is required")?;
            PipelineConfig::with_output_dir(output)
        }
    };
    if let Some(output) = cli.output {
        config.output_dir = output;
    }
    std::fs::create_dir_all(&config.output_dir)
        .with_context(|| format!("failed to create {}", config.output_dir.display()))?;

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            shutdown_signal().await;
            warn!("shutdown requested, stopping after in-flight work");
            cancel.cancel();
        }
    });

    match cli.command {
        Command::Generate {
            trials,
            generation,
            save_results,
            overwrite,
        } => run_generate(config, cancel, trials, generation, save_results, overwrite).await,
        Command::Merge {
            sources,
            output_name,
            overwrite,
        } => run_merge(config, cancel, &sources, &output_name, overwrite).await,
    }
}

async fn run_generate(
    config: PipelineConfig,
    cancel: CancellationToken,
    trials: u64,
    generation: Option<String>,
    save_results: bool,
    overwrite: bool,
) -> Result<()> {
    let mut orchestrator = WorkOrchestrator::new(
        Arc::new(ChaosProducer),
        Arc::new(LoggingStore),
        Arc::new(SyntheticExtractor),
        config,
        cancel,
    );

    let bar = default_progress_bar(trials);
    let progress: ProgressFn = {
        let bar = bar.clone();
        Arc::new(move |counters| {
            bar.set_position(counters.completed);
            bar.set_message(format!("win rate {:.1}%", counters.win_rate() * 100.0));
        })
    };

    let options = PersistenceOptions {
        save_to_store: save_results,
        generation_name: generation.clone(),
        allow_overwrite: overwrite,
    };
    let results = orchestrator
        .run_batch(trials, Some(progress), options)
        .await?;
    bar.finish_and_clear();
    info!(
        "{} trial(s) in {:.1}s: {} win(s), {} failure(s), {} deal(s)",
        results.counters.completed,
        results.elapsed.as_secs_f64(),
        results.counters.wins,
        results.counters.failures,
        results.counters.deals
    );

    if let Some(name) = generation {
        let status: Arc<datagen::StatusFn> = Arc::new(|msg: &str| info!("{msg}"));
        let files = orchestrator.finalize(&name, Some(status)).await?;
        for file in files {
            info!("wrote {} ({} rows)", file.path.display(), file.rows);
        }
    }
    Ok(())
}

async fn run_merge(
    config: PipelineConfig,
    cancel: CancellationToken,
    sources: &[String],
    output_name: &str,
    overwrite: bool,
) -> Result<()> {
    let service = CrossGenerationMergeService::new(config.output_dir, cancel);
    let status: Arc<datagen::StatusFn> = Arc::new(|msg: &str| info!("{msg}"));
    let files = service
        .merge(sources, output_name, overwrite, Some(status))
        .await?;
    for file in files {
        info!("wrote {} ({} rows)", file.path.display(), file.rows);
    }
    Ok(())
}

fn default_progress_bar(len: u64) -> ProgressBar {
    let pb = ProgressBar::new(len);
    pb.set_style(
        ProgressStyle::with_template("[{elapsed_precise}] {wide_bar} {pos}/{len} {msg}")
            .unwrap()
            .progress_chars("=> "),
    );
    pb
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install CTRL+C handler");
    };
    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

/// Baseline producer: both sides play uniformly random legal-ish games.
/// Useful for generation zero, before any model exists.
struct ChaosProducer;

impl TrialProducer for ChaosProducer {
    fn produce(&self, _trial_index: u64) -> Result<SimulationResult> {
        let mut rng = rand::thread_rng();
        let deals = rng.gen_range(6..=12);
        Ok(SimulationResult {
            won: rng.gen_bool(0.5),
            deals: (0..deals)
                .map(|_| DealRecord {
                    tricks: 5,
                    decisions: 5 + rng.gen_range(1..=3),
                })
                .collect(),
        })
    }
}

/// Durable trial store stand-in; real deployments plug in a database-backed
/// implementation here.
struct LoggingStore;

impl ResultStore for LoggingStore {
    fn save_batch(
        &self,
        results: &[SimulationResult],
        progress: &(dyn Fn(usize) + Send + Sync),
    ) -> Result<()> {
        debug!("store received batch of {}", results.len());
        progress(results.len());
        Ok(())
    }
}

/// Emits synthetic feature rows shaped like real extraction output, one play
/// row per trick and one call/discard pair per deal.
struct SyntheticExtractor;

impl FeatureExtractor for SyntheticExtractor {
    fn extract(&self, results: &[SimulationResult]) -> Result<ExtractedBatch> {
        let mut rng = rand::thread_rng();
        let mut batch = ExtractedBatch::default();
        for result in results {
            let outcome = if result.won { 1.0 } else { -1.0 };
            for (deal_index, deal) in result.deals.iter().enumerate() {
                let seat = (deal_index % 4) as u8;
                batch.call_trump_rows.push(CallTrumpRow {
                    hand: random_hand(&mut rng),
                    upcard: rng.gen_range(0..24),
                    seat,
                    bidding_round: rng.gen_range(1..=2),
                    chosen_call: rng.gen_range(0..6),
                    outcome,
                });
                batch.discard_rows.push(DiscardRow {
                    hand: random_hand(&mut rng),
                    trump: rng.gen_range(0..4),
                    chosen_discard: rng.gen_range(0..24),
                    outcome,
                });
                for trick_index in 0..deal.tricks {
                    batch.play_rows.push(PlayRow {
                        hand: random_hand(&mut rng),
                        table: random_hand(&mut rng),
                        trump: rng.gen_range(0..4),
                        lead_suit: rng.gen_range(0..4),
                        seat,
                        trick_index: trick_index as u8,
                        chosen_card: rng.gen_range(0..24),
                        outcome,
                    });
                }
            }
        }
        batch.stats = ExtractionStats {
            game_count: results.len() as u64,
            deal_count: results.iter().map(SimulationResult::deal_count).sum(),
            trick_count: results.iter().map(SimulationResult::trick_count).sum(),
            rows_failed: 0,
            actors: vec![Actor {
                actor_type: "Chaos".into(),
                model_name: None,
                exploration_temperature: 1.0,
            }],
        };
        Ok(batch)
    }
}

fn random_hand<R: Rng>(rng: &mut R) -> [f32; 24] {
    let mut hand = [0.0; 24];
    for _ in 0..5 {
        hand[rng.gen_range(0..24)] = 1.0;
    }
    hand
}
