//! Thread-pool execution mode.
//!
//! A single worker decodes the source and owns every row. The block and
//! luma loops are split by output row across a rayon pool of
//! `config.workers` threads. Each pool task writes only the output row it
//! was handed, so the loops need no synchronization beyond the join at
//! the end of each one.

use std::time::Duration;

use rayon::prelude::*;
use tracing::{debug, info};

use crate::Source;
use crate::arena::BufferLayout;
use crate::block;
use crate::diagnostics::{Clock, PhaseTimings, RunDiagnostics};
use crate::luma;
use crate::raster::load_source;
use crate::sink::{ImageSink, write_outputs};
use crate::types::{ExecutionMode, PipelineError, ReduceConfig};

/// Run a reduction on one worker with a pool of `config.workers` threads.
///
/// The worker count here only sizes the pool; the source height just has
/// to be a multiple of the block factor.
///
/// # Errors
///
/// See [`reduce`](crate::reduce). Thread pool creation failures are
/// reported as [`PipelineError::InvalidConfig`].
pub fn run<S, C>(
    source: Source<'_>,
    config: &ReduceConfig,
    sink: &S,
    clock: &C,
) -> Result<RunDiagnostics, PipelineError>
where
    S: ImageSink,
    C: Clock,
{
    config.validate()?;
    let started = clock.now();
    let mut timings = PhaseTimings::default();

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.workers)
        .thread_name(|index| format!("grayblock-{index}"))
        .build()
        .map_err(|err| {
            PipelineError::InvalidConfig(format!("failed to build thread pool: {err}"))
        })?;

    let phase = clock.now();
    let (raster, decoded) = load_source(source, config.block_factor)?;
    let layout = BufferLayout::new(
        raster.dimensions(),
        raster.channels(),
        config.block_factor,
        1,
    );
    layout.validate()?;
    timings.decode = clock.elapsed(&phase);
    info!(
        %decoded,
        aligned = %layout.source,
        channels = layout.channels,
        threads = config.workers,
        "source loaded"
    );

    let phase = clock.now();
    let sizes = layout.sizes();
    let mut downsampled = vec![0_u8; sizes.downsampled];
    let mut grayscale = vec![0_u8; sizes.grayscale];
    timings.allocate = clock.elapsed(&phase);
    // The source stays in the worker's own raster; nothing to publish.
    timings.publish = Duration::ZERO;

    let phase = clock.now();
    let view = raster.view();
    let block_factor = layout.block();
    pool.install(|| {
        downsampled
            .par_chunks_mut(layout.downsampled_row_bytes())
            .enumerate()
            .for_each(|(out_y, out_row)| block::reduce_row(&view, block_factor, out_y, out_row));
    });
    timings.block = clock.elapsed(&phase);
    debug!(rows = layout.reduced().height, "blocks reduced");

    let phase = clock.now();
    let channels = layout.channels;
    pool.install(|| {
        grayscale
            .par_chunks_mut(layout.grayscale_row_bytes())
            .zip(downsampled.par_chunks(layout.downsampled_row_bytes()))
            .for_each(|(gray_row, down_row)| luma::reduce_pixels(down_row, channels, gray_row));
    });
    timings.luma = clock.elapsed(&phase);

    let phase = clock.now();
    let (downsampled, grayscale) = layout.output_images(downsampled, grayscale)?;
    write_outputs(sink, &downsampled, &grayscale)?;
    timings.write = clock.elapsed(&phase);
    info!(reduced = %layout.reduced(), "outputs written");

    Ok(RunDiagnostics::from_layout(
        ExecutionMode::Threads,
        config.workers,
        &layout,
        decoded,
        timings,
        clock.elapsed(&started),
    ))
}
