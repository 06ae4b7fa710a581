//! Cooperating-workers execution mode.
//!
//! `workers` threads run the same program, each identified by its rank.
//! Rank 0 doubles as the loader and the writer. A run moves through four
//! collective phases:
//!
//! 1. The loader decodes and block-aligns the source, validates the
//!    layout, and broadcasts it. Every worker allocates (or attaches to)
//!    the shared regions. Barrier [`Phase::Allocated`].
//! 2. The loader publishes the source pixels. Barrier
//!    [`Phase::SourcePublished`].
//! 3. Each worker block-reduces its own source rows into its own
//!    downsampled rows. Barrier [`Phase::BlocksReduced`].
//! 4. Each worker luma-reduces its own downsampled rows into its own
//!    grayscale rows. Barrier [`Phase::LumaReduced`].
//!
//! Afterwards the writer rejoins both regions and hands them to the sink.
//! A failure in any phase is reported at that phase's barrier. A worker
//! that stops early, whether by error or by panic, still attends the
//! barriers it has not reached, so the others are never left waiting and
//! the whole group aborts together.

use std::thread;

use tracing::{debug, debug_span, info};

use crate::Source;
use crate::arena::{Attachment, BufferLayout, ROOT_RANK, SharedArena};
use crate::block;
use crate::collective::{Participant, Phase, Rendezvous};
use crate::diagnostics::{Clock, PhaseTimings, RunDiagnostics};
use crate::luma;
use crate::raster::{Raster, load_source};
use crate::sink::{ImageSink, write_outputs};
use crate::types::{Dimensions, ExecutionMode, PipelineError, ReduceConfig};

/// Value the loader broadcasts. Workers receive `None` if loading failed.
type Broadcast = BufferLayout;

/// Outcome of one worker: the writer returns diagnostics, everyone else
/// returns `None`.
type WorkerResult = Result<Option<RunDiagnostics>, PipelineError>;

/// Run a reduction with `config.workers` cooperating workers.
///
/// # Errors
///
/// Returns the first non-abort error reported by any worker, in rank
/// order. See [`reduce`](crate::reduce) for the full list.
pub fn run<S, C>(
    source: Source<'_>,
    config: &ReduceConfig,
    sink: &S,
    clock: &C,
) -> Result<RunDiagnostics, PipelineError>
where
    S: ImageSink,
    C: Clock + Sync,
{
    config.validate()?;

    let arena = SharedArena::new();
    let rendezvous = Rendezvous::<Broadcast>::new(config.workers);
    let mut source = Some(source);
    let mut spawn_error = None;

    let results: Vec<WorkerResult> = thread::scope(|scope| {
        let mut handles = Vec::with_capacity(config.workers);
        for rank in 0..config.workers {
            let source = if rank == ROOT_RANK {
                source.take()
            } else {
                None
            };
            let worker = Worker {
                me: rendezvous.join(rank),
                arena: &arena,
                config,
                clock,
            };
            let spawned = thread::Builder::new()
                .name(format!("grayblock-worker-{rank}"))
                .spawn_scoped(scope, move || worker.run(source, sink));
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(err) => {
                    spawn_error = Some(PipelineError::Spawn { rank, source: err });
                    break;
                }
            }
        }

        // Workers wait at check-in until the whole group is running.
        if spawn_error.is_some() {
            rendezvous.cancel();
        } else {
            rendezvous.start();
        }

        handles
            .into_iter()
            .enumerate()
            .map(|(rank, handle)| {
                handle
                    .join()
                    .unwrap_or_else(|_| Err(PipelineError::WorkerPanicked { rank }))
            })
            .collect()
    });

    if let Some(err) = spawn_error {
        return Err(err);
    }
    merge(results)
}

/// What the loader holds between decoding and publishing the source.
struct Loaded {
    raster: Raster,
    decoded: Dimensions,
}

/// Per-thread state of one worker.
struct Worker<'a, C> {
    me: Participant<'a, Broadcast>,
    arena: &'a SharedArena,
    config: &'a ReduceConfig,
    clock: &'a C,
}

impl<C: Clock> Worker<'_, C> {
    fn run<S: ImageSink>(mut self, source: Option<Source<'_>>, sink: &S) -> WorkerResult {
        let rank = self.me.rank();
        self.me.check_in()?;
        let _span = debug_span!("worker", rank).entered();
        let started = self.clock.now();
        let mut timings = PhaseTimings::default();

        let phase = self.clock.now();
        let mut loaded = None;
        let layout = self.me.broadcast(|| {
            let outcome = load(source, self.config);
            let layout = outcome.as_ref().ok().map(|(_, layout)| layout.clone());
            loaded = Some(outcome.map(|(loaded, _)| loaded));
            layout
        });
        timings.decode = self.clock.elapsed(&phase);

        let phase = self.clock.now();
        let allocated = loaded.transpose().and_then(|loaded| {
            let layout = layout.ok_or(PipelineError::CollectiveAbort { rank })?;
            let regions = self.arena.allocate_shared(rank, layout)?;
            Ok((loaded, regions.attach(rank)?))
        });
        let (loaded, shared) = self.me.settle(Phase::Allocated, allocated)?;
        timings.allocate = self.clock.elapsed(&phase);

        let phase = self.clock.now();
        let decoded = loaded.as_ref().map(|loaded| loaded.decoded);
        let published = match loaded {
            Some(loaded) => shared.publish_source(loaded.raster.pixels()),
            None => Ok(()),
        };
        self.me
            .settle(Phase::SourcePublished, published.map_err(PipelineError::from))?;
        timings.publish = self.clock.elapsed(&phase);

        let phase = self.clock.now();
        self.me.settle(Phase::BlocksReduced, reduce_blocks(shared))?;
        timings.block = self.clock.elapsed(&phase);

        let phase = self.clock.now();
        self.me.settle(Phase::LumaReduced, reduce_luma(shared))?;
        timings.luma = self.clock.elapsed(&phase);

        if !self.me.is_root() {
            return Ok(None);
        }

        let phase = self.clock.now();
        let regions = shared.regions();
        let layout = shared.layout();
        let (downsampled, grayscale) = layout.output_images(
            regions.downsampled.gather()?.into(),
            regions.grayscale.gather()?.into(),
        )?;
        write_outputs(sink, &downsampled, &grayscale)?;
        timings.write = self.clock.elapsed(&phase);

        info!(reduced = %layout.reduced(), "outputs written");

        Ok(Some(RunDiagnostics::from_layout(
            ExecutionMode::Workers,
            self.config.workers,
            layout,
            decoded.unwrap_or(layout.source),
            timings,
            self.clock.elapsed(&started),
        )))
    }
}

/// Decode, block-align, and lay out the source. Runs on the loader only.
fn load(
    source: Option<Source<'_>>,
    config: &ReduceConfig,
) -> Result<(Loaded, BufferLayout), PipelineError> {
    let Some(source) = source else {
        return Err(PipelineError::EmptyInput);
    };
    let (raster, decoded) = load_source(source, config.block_factor)?;
    let layout = BufferLayout::new(
        raster.dimensions(),
        raster.channels(),
        config.block_factor,
        config.workers,
    );
    layout.validate()?;
    info!(
        %decoded,
        aligned = %layout.source,
        channels = layout.channels,
        workers = layout.workers,
        "source loaded"
    );
    Ok((Loaded { raster, decoded }, layout))
}

/// Block-reduce the worker's source rows into its downsampled rows.
fn reduce_blocks(shared: Attachment<'_>) -> Result<(), PipelineError> {
    let source_rows = shared.source_rows();
    let block_factor = shared.layout().block();
    let mut window = shared.downsampled_window()?;
    debug!(
        source_rows = ?source_rows.as_range(),
        reduced_rows = ?window.rows().as_range(),
        "reducing blocks"
    );
    shared.with_source(|view| {
        block::reduce_rows(&view, block_factor, source_rows, window.as_mut_slice());
    })?;
    shared.publish(window)?;
    Ok(())
}

/// Luma-reduce the worker's downsampled rows into its grayscale rows.
fn reduce_luma(shared: Attachment<'_>) -> Result<(), PipelineError> {
    let channels = shared.layout().channels;
    let mut window = shared.grayscale_window()?;
    debug!(rows = ?shared.reduced_rows().as_range(), "reducing luma");
    shared.with_downsampled_rows(|downsampled| {
        luma::reduce_pixels(downsampled, channels, window.as_mut_slice());
    })?;
    shared.publish(window)?;
    Ok(())
}

/// Combine per-worker outcomes into the run's result.
///
/// A worker's own error outranks the collective aborts it caused in
/// everyone else; among own errors the lowest rank wins.
fn merge(results: Vec<WorkerResult>) -> Result<RunDiagnostics, PipelineError> {
    let mut diagnostics = None;
    let mut abort = None;
    for result in results {
        match result {
            Ok(report) => diagnostics = diagnostics.or(report),
            Err(err) if err.is_collective_abort() => abort = abort.or(Some(err)),
            Err(err) => return Err(err),
        }
    }
    match (abort, diagnostics) {
        (Some(err), _) => Err(err),
        (None, Some(diagnostics)) => Ok(diagnostics),
        (None, None) => Err(PipelineError::CollectiveAbort { rank: ROOT_RANK }),
    }
}
