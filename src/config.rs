use std::path::PathBuf;

use serde::Deserialize;

pub const DEFAULT_CONCURRENCY: usize = 128;
pub const DEFAULT_SERIES_BATCH_SIZE: usize = 250_000;

/// Builder options. `output_dir` is the only required setting; everything
/// else carries a production default.
#[derive(Debug, Clone, Deserialize)]
pub struct BuilderConfig {
    /// Workspace root for temporary blocks and spills.
    pub output_dir: PathBuf,
    /// Number of fetch-and-build workers.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Upload the block on success.
    #[serde(default = "default_true")]
    pub upload: bool,
    /// Remove the local block directory after a successful upload.
    #[serde(default = "default_true")]
    pub delete_local_blocks: bool,
    /// Series held in memory before spilling a sorted run file.
    #[serde(default = "default_series_batch_size")]
    pub series_batch_size: usize,
    /// Max per-sample shift (ms) when aligning timestamps to whole
    /// seconds. 0 disables the re-quantization.
    #[serde(default)]
    pub timestamp_tolerance_ms: i64,
}

fn default_concurrency() -> usize {
    DEFAULT_CONCURRENCY
}

fn default_series_batch_size() -> usize {
    DEFAULT_SERIES_BATCH_SIZE
}

fn default_true() -> bool {
    true
}

impl BuilderConfig {
    pub fn new<P: Into<PathBuf>>(output_dir: P) -> Self {
        Self {
            output_dir: output_dir.into(),
            concurrency: DEFAULT_CONCURRENCY,
            upload: true,
            delete_local_blocks: true,
            series_batch_size: DEFAULT_SERIES_BATCH_SIZE,
            timestamp_tolerance_ms: 0,
        }
    }

    pub fn concurrency(mut self, value: usize) -> Self {
        self.concurrency = value;
        self
    }

    pub fn upload(mut self, value: bool) -> Self {
        self.upload = value;
        self
    }

    pub fn delete_local_blocks(mut self, value: bool) -> Self {
        self.delete_local_blocks = value;
        self
    }

    pub fn series_batch_size(mut self, value: usize) -> Self {
        self.series_batch_size = value;
        self
    }

    pub fn timestamp_tolerance_ms(mut self, value: i64) -> Self {
        self.timestamp_tolerance_ms = value;
        self
    }
}
