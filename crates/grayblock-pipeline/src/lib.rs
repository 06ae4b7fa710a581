//! grayblock-pipeline: partitioned block downsampling and luma reduction
//! (sans-IO).
//!
//! Turns one source image into two derived images:
//!
//! - a downsampled image, where every `B x B` tile of the source is
//!   averaged per channel into one pixel, and
//! - a grayscale image of the same size, where every downsampled pixel is
//!   collapsed to the mean of its color channels.
//!
//! Work is spread across cooperating workers that each own a contiguous
//! band of rows ([`ExecutionMode::Workers`]), or across a thread pool
//! inside a single worker ([`ExecutionMode::Threads`]).
//!
//! This crate has **no I/O dependencies**: it reads encoded bytes or an
//! already decoded [`Raster`] and hands finished images to an
//! [`ImageSink`]. Filesystem access and output encoding live in the
//! `grayblock` binary and `grayblock-export`.

pub mod arena;
pub mod block;
pub mod collective;
pub mod diagnostics;
pub mod luma;
pub mod parallel;
pub mod partition;
pub mod raster;
pub mod sink;
pub mod spmd;
pub mod types;

pub use arena::{Attachment, BufferLayout, BufferSizes, SharedArena};
pub use diagnostics::{Clock, PhaseTimings, RunDiagnostics};
pub use partition::RowRange;
pub use raster::Raster;
pub use sink::{ImageSink, MemorySink};
pub use types::{
    DimensionError, Dimensions, ExecutionMode, OutputKind, PipelineError, ReduceConfig,
};

/// Input image for a run.
#[derive(Debug, Clone)]
pub enum Source<'a> {
    /// Encoded bytes in any format the `image` crate can decode.
    Encoded(&'a [u8]),
    /// An already decoded raster.
    Decoded(Raster),
}

/// Run a full reduction.
///
/// Decodes (if needed) and block-aligns `source`, computes the
/// downsampled and grayscale images according to `config.mode`, writes
/// the downsampled image and then the grayscale image to `sink`, and
/// returns diagnostics for the run.
///
/// Nothing reaches `sink` unless every phase succeeded.
///
/// # Errors
///
/// - [`PipelineError::InvalidConfig`] if `config` fails validation.
/// - [`PipelineError::EmptyInput`] or [`PipelineError::ImageDecode`] if
///   the source cannot be decoded.
/// - [`PipelineError::Dimension`] if the image is smaller than one block
///   or its height does not split into whole blocks per worker.
/// - [`PipelineError::Encode`] if the sink fails.
/// - [`PipelineError::WorkerPanicked`] if a worker thread panicked.
pub fn reduce<S, C>(
    source: Source<'_>,
    config: &ReduceConfig,
    sink: &S,
    clock: &C,
) -> Result<RunDiagnostics, PipelineError>
where
    S: ImageSink,
    C: Clock + Sync,
{
    tracing::debug!(
        mode = %config.mode,
        workers = config.workers,
        block_factor = config.block_factor,
        "starting reduction"
    );
    match config.mode {
        ExecutionMode::Workers => spmd::run(source, config, sink, clock),
        ExecutionMode::Threads => parallel::run(source, config, sink, clock),
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::time::{Duration, Instant};

    use crate::diagnostics::Clock;
    use crate::raster::Raster;

    /// [`Clock`] backed by [`std::time::Instant`].
    pub struct TestClock;

    impl Clock for TestClock {
        type Instant = Instant;

        fn now(&self) -> Instant {
            Instant::now()
        }

        fn elapsed(&self, since: &Instant) -> Duration {
            since.elapsed()
        }
    }

    /// 8x4 RGB image with `r = 10x + y`, `g = 20y`, `b = 100 + x`.
    #[allow(clippy::unwrap_used, clippy::cast_possible_truncation)]
    pub fn gradient_8x4() -> Raster {
        Raster::from_fn(8, 4, 3, |x, y, c| match c {
            0 => (10 * x + y) as u8,
            1 => (20 * y) as u8,
            _ => (100 + x) as u8,
        })
        .unwrap()
    }

    /// [`gradient_8x4`] reduced with 2x2 blocks.
    pub const GRADIENT_DOWNSAMPLED: &[u8] = &[
        5, 10, 100, 25, 10, 102, 45, 10, 104, 65, 10, 106, //
        7, 50, 100, 27, 50, 102, 47, 50, 104, 67, 50, 106,
    ];

    /// Luma of [`GRADIENT_DOWNSAMPLED`].
    pub const GRADIENT_GRAYSCALE: &[u8] = &[38, 45, 53, 60, 52, 59, 67, 74];
}
