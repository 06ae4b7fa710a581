//! Shared types for the grayblock reduction pipeline.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::arena::ArenaError;

/// Image dimensions in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl Dimensions {
    /// Create a new dimension pair.
    #[must_use]
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl fmt::Display for Dimensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// How the reduction work is spread across the machine.
///
/// The two modes are never combined: either every worker owns a row
/// partition and runs the reducer loops serially, or a single worker
/// spreads each reducer loop across a thread pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ExecutionMode {
    /// Cooperating workers, each owning a contiguous row partition and
    /// meeting at the phase barriers.
    #[default]
    Workers,
    /// One worker; the block and luma loops are split across a pool of
    /// `workers` threads.
    Threads,
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Workers => f.write_str("Workers"),
            Self::Threads => f.write_str("Threads"),
        }
    }
}

/// Configuration for a reduction run.
///
/// Validated by [`ReduceConfig::validate`] before any image data is
/// touched; an invalid configuration never reaches the workers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReduceConfig {
    /// Linear downsampling ratio. Each `block_factor x block_factor`
    /// tile of the source becomes one output pixel.
    ///
    /// Must be a power of two.
    pub block_factor: u32,

    /// Number of cooperating workers (or pool threads in
    /// [`ExecutionMode::Threads`]).
    pub workers: usize,

    /// Whether the work is partitioned across workers or spread across
    /// a thread pool inside one worker.
    pub mode: ExecutionMode,
}

impl ReduceConfig {
    /// Default block factor: 2x2 tiles.
    pub const DEFAULT_BLOCK_FACTOR: u32 = 2;

    /// Default worker count.
    pub const DEFAULT_WORKERS: usize = 1;

    /// Default execution mode.
    pub const DEFAULT_MODE: ExecutionMode = ExecutionMode::Workers;

    /// Check the configuration before any work starts.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidConfig`] if the block factor is
    /// zero or not a power of two, or if no workers are requested.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if !self.block_factor.is_power_of_two() {
            return Err(PipelineError::InvalidConfig(format!(
                "block factor must be a power of two, got {}",
                self.block_factor,
            )));
        }
        if self.workers == 0 {
            return Err(PipelineError::InvalidConfig(
                "at least one worker is required".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for ReduceConfig {
    fn default() -> Self {
        Self {
            block_factor: Self::DEFAULT_BLOCK_FACTOR,
            workers: Self::DEFAULT_WORKERS,
            mode: Self::DEFAULT_MODE,
        }
    }
}

/// Which of the two reduced images a buffer belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputKind {
    /// Block-averaged image with the source channel count.
    Downsampled,
    /// Single-channel luma image.
    Grayscale,
}

impl fmt::Display for OutputKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Downsampled => f.write_str("downsampled"),
            Self::Grayscale => f.write_str("grayscale"),
        }
    }
}

/// Image dimensions that cannot be split into whole blocks per worker.
///
/// Dimensions are truncated to a multiple of the block factor once,
/// right after decode. Anything that still does not fit is rejected
/// here rather than padded or cropped further.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DimensionError {
    /// The image does not contain a single whole block.
    #[error("image {width}x{height} is smaller than one {block_factor}x{block_factor} block")]
    SmallerThanBlock {
        /// Decoded width in pixels.
        width: u32,
        /// Decoded height in pixels.
        height: u32,
        /// Configured block factor.
        block_factor: u32,
    },

    /// The truncated height does not split into whole blocks per worker.
    #[error(
        "image height {height} is not divisible by {workers} workers x block factor {block_factor}"
    )]
    HeightNotDivisible {
        /// Height after truncation to the block factor.
        height: u32,
        /// Number of workers.
        workers: usize,
        /// Configured block factor.
        block_factor: u32,
    },

    /// There are fewer rows than workers, so some worker would own nothing.
    #[error("{rows} rows cannot be split across {workers} workers")]
    TooFewRows {
        /// Total rows to partition.
        rows: usize,
        /// Number of workers.
        workers: usize,
    },

    /// A worker index outside `0..workers` asked for its partition.
    #[error("worker {index} is out of range for {workers} workers")]
    WorkerOutOfRange {
        /// Requested worker index.
        index: usize,
        /// Number of workers.
        workers: usize,
    },

    /// A source partition boundary falls inside a block.
    #[error("worker {worker} owns rows {start}..{end}, which do not align to block factor {block_factor}")]
    MisalignedPartition {
        /// Worker index.
        worker: usize,
        /// First source row (inclusive).
        start: usize,
        /// Last source row (exclusive).
        end: usize,
        /// Block factor the bounds must be multiples of.
        block_factor: usize,
    },
}

/// Errors that can occur during a reduction run.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Failed to decode the input image.
    #[error("failed to decode image: {0}")]
    ImageDecode(#[from] image::ImageError),

    /// The input image bytes were empty.
    #[error("input image data is empty")]
    EmptyInput,

    /// Reduction configuration is invalid.
    #[error("invalid reduction configuration: {0}")]
    InvalidConfig(String),

    /// Pixel data with a channel count outside `1..=4`.
    #[error("unsupported channel count {0} (expected 1 to 4)")]
    UnsupportedChannels(usize),

    /// Pixel buffer length does not match its declared shape.
    #[error("pixel buffer holds {actual} bytes, expected {expected}")]
    BufferSize {
        /// Bytes required by the declared dimensions.
        expected: usize,
        /// Bytes actually supplied.
        actual: usize,
    },

    /// Image dimensions do not fit the block/worker layout.
    #[error(transparent)]
    Dimension(#[from] DimensionError),

    /// Shared buffer protocol violation.
    #[error(transparent)]
    Arena(#[from] ArenaError),

    /// The output sink failed to serialize a reduced image.
    #[error("failed to write {output} image: {source}")]
    Encode {
        /// Which image failed.
        output: OutputKind,
        /// Underlying sink error.
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Another worker failed, so this worker stopped with it.
    #[error("worker {rank} stopped because another worker failed")]
    CollectiveAbort {
        /// Rank of the worker reporting the abort.
        rank: usize,
    },

    /// A worker thread could not be started.
    #[error("failed to start worker {rank}: {source}")]
    Spawn {
        /// Rank of the worker that did not start.
        rank: usize,
        /// Error from the operating system.
        source: std::io::Error,
    },

    /// A worker thread panicked.
    #[error("worker {rank} panicked")]
    WorkerPanicked {
        /// Rank of the worker that panicked.
        rank: usize,
    },
}

impl PipelineError {
    /// Returns `true` for the secondary error a worker reports when it
    /// stops because some other worker failed.
    #[must_use]
    pub const fn is_collective_abort(&self) -> bool {
        matches!(self, Self::CollectiveAbort { .. })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn default_config_uses_two_by_two_blocks() {
        let config = ReduceConfig::default();
        assert_eq!(config.block_factor, 2);
        assert_eq!(config.workers, 1);
        assert_eq!(config.mode, ExecutionMode::Workers);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_block_factor_is_rejected() {
        let config = ReduceConfig {
            block_factor: 0,
            ..ReduceConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(PipelineError::InvalidConfig(_))
        ));
    }

    #[test]
    fn non_power_of_two_block_factor_is_rejected() {
        let config = ReduceConfig {
            block_factor: 3,
            ..ReduceConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(PipelineError::InvalidConfig(_))
        ));
    }

    #[test]
    fn block_factor_one_is_accepted() {
        let config = ReduceConfig {
            block_factor: 1,
            ..ReduceConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_workers_is_rejected() {
        let config = ReduceConfig {
            workers: 0,
            ..ReduceConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(PipelineError::InvalidConfig(_))
        ));
    }

    #[test]
    fn config_json_fills_missing_fields_with_defaults() {
        let config: ReduceConfig = serde_json::from_str(r#"{"workers": 4}"#).unwrap();
        assert_eq!(config.workers, 4);
        assert_eq!(config.block_factor, ReduceConfig::DEFAULT_BLOCK_FACTOR);
    }

    #[test]
    fn dimension_error_message_names_the_divisor() {
        let err = DimensionError::HeightNotDivisible {
            height: 6,
            workers: 2,
            block_factor: 2,
        };
        let msg = err.to_string();
        assert!(msg.contains("height 6"), "{msg}");
        assert!(msg.contains("2 workers"), "{msg}");
    }

    #[test]
    fn collective_abort_is_recognized() {
        assert!(PipelineError::CollectiveAbort { rank: 1 }.is_collective_abort());
        assert!(!PipelineError::EmptyInput.is_collective_abort());
    }

    #[test]
    fn dimensions_display() {
        assert_eq!(Dimensions::new(8, 4).to_string(), "8x4");
    }
}
