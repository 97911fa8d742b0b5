use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

/// Pipeline configuration, usually loaded from a TOML file.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct PipelineConfig {
    /// Directory receiving final dataset files and the `_chunks` work area.
    pub output_dir: PathBuf,

    /// Maximum degree of parallelism for trial production. Unset or zero
    /// falls back to the hardware default.
    #[serde(default)]
    pub max_parallelism: Option<usize>,

    /// Capacity of the result hand-off queue.
    #[serde(default = "defaults::queue_capacity")]
    pub queue_capacity: usize,

    /// Number of results accumulated before a persistence flush.
    #[serde(default = "defaults::batch_size")]
    pub batch_size: usize,

    /// Trials per sub-batch when a large run is split for finer-grained
    /// progress and chunked output.
    #[serde(default = "defaults::sub_batch_size")]
    pub sub_batch_size: u64,

    /// When true, a category that produced zero rows still gets an empty
    /// final file plus sidecar at finalize.
    #[serde(default)]
    pub write_empty_categories: bool,
}

impl PipelineConfig {
    pub fn from_toml<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let cfg: Self = toml::from_str(&contents)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        Ok(cfg)
    }

    /// Config with defaults for everything but the output directory.
    pub fn with_output_dir<P: Into<PathBuf>>(output_dir: P) -> Self {
        Self {
            output_dir: output_dir.into(),
            max_parallelism: None,
            queue_capacity: defaults::queue_capacity(),
            batch_size: defaults::batch_size(),
            sub_batch_size: defaults::sub_batch_size(),
            write_empty_categories: false,
        }
    }
}

mod defaults {
    pub fn queue_capacity() -> usize {
        256
    }
    pub fn batch_size() -> usize {
        100
    }
    pub fn sub_batch_size() -> u64 {
        1_000
    }
}
