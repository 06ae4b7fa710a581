//! grayblock: block-average an image and reduce it to grayscale.
//!
//! Reads one image, splits its rows across cooperating workers, and writes
//! a downsampled copy and a grayscale copy of the downsampled image. The
//! output formats follow the destination extensions.
//!
//! # Usage
//!
//! ```text
//! grayblock [OPTIONS] <INPUT> <DOWNSAMPLED> <GRAYSCALE>
//! ```

#![allow(clippy::print_stdout, clippy::print_stderr)]

mod sink;

use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::{Duration, Instant};

use clap::{Parser, ValueEnum};
use grayblock_export::{EncodeOptions, ExportError};
use grayblock_pipeline::{
    Clock, ExecutionMode, PipelineError, ReduceConfig, RunDiagnostics, Source,
};
use tracing_subscriber::EnvFilter;

use crate::sink::{Destination, FileSink};

/// Downsample an image by block averaging and reduce it to grayscale.
///
/// Every `B x B` tile of the input becomes one pixel of the downsampled
/// output; each downsampled pixel becomes one gray byte of the grayscale
/// output.
#[derive(Parser)]
#[command(name = "grayblock", version)]
struct Cli {
    /// Path to the input image (PNG, JPEG, BMP, WebP).
    input: PathBuf,

    /// Where to write the downsampled image (.png, .jpg, .jpeg, .bmp).
    downsampled: PathBuf,

    /// Where to write the grayscale image (.png, .jpg, .jpeg, .bmp).
    grayscale: PathBuf,

    /// Number of workers (or pool threads with `--mode threads`).
    ///
    /// Defaults to the machine's available parallelism.
    #[arg(long, value_parser = clap::builder::RangedU64ValueParser::<usize>::new().range(1..))]
    workers: Option<usize>,

    /// Linear downsampling ratio; must be a power of two.
    #[arg(long, default_value_t = ReduceConfig::DEFAULT_BLOCK_FACTOR)]
    block_factor: u32,

    /// How work is spread across the machine.
    #[arg(long, value_enum, default_value_t = Mode::Workers)]
    mode: Mode,

    /// JPEG quality (1-100) for `.jpg`/`.jpeg` outputs.
    #[arg(long, default_value_t = EncodeOptions::DEFAULT_JPEG_QUALITY)]
    jpeg_quality: u8,

    /// Full reduction config as a JSON string.
    ///
    /// When provided, `--workers`, `--block-factor` and `--mode` are
    /// ignored. Missing fields take their defaults.
    #[arg(long)]
    config_json: Option<String>,

    /// Print a human-readable diagnostics report to stdout.
    #[arg(long)]
    report: bool,

    /// Print diagnostics as JSON to stdout.
    #[arg(long, conflicts_with = "report")]
    json: bool,

    /// Log progress (equivalent to `RUST_LOG=debug`).
    #[arg(short, long)]
    verbose: bool,
}

/// Execution mode selection.
#[derive(Clone, Copy, ValueEnum)]
enum Mode {
    /// Cooperating workers, each owning a band of rows.
    Workers,
    /// One worker with a thread pool for the reducer loops.
    Threads,
}

impl From<Mode> for ExecutionMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Workers => Self::Workers,
            Mode::Threads => Self::Threads,
        }
    }
}

/// Everything that can stop a run.
#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("error parsing --config-json: {0}")]
    ConfigJson(#[source] serde_json::Error),

    #[error(transparent)]
    Output(#[from] ExportError),

    #[error("error reading {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error("error serializing diagnostics: {0}")]
    Diagnostics(#[source] serde_json::Error),
}

/// [`Clock`] implementation backed by [`std::time::Instant`].
struct StdClock;

impl Clock for StdClock {
    type Instant = Instant;

    fn now(&self) -> Instant {
        Instant::now()
    }

    fn elapsed(&self, since: &Instant) -> Duration {
        since.elapsed()
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism().map_or(1, NonZeroUsize::get)
}

/// Build a [`ReduceConfig`] from CLI arguments.
///
/// If `--config-json` is provided, the JSON is parsed directly and the
/// individual flags are ignored.
fn config_from_cli(cli: &Cli) -> Result<ReduceConfig, CliError> {
    if let Some(ref json) = cli.config_json {
        return serde_json::from_str(json).map_err(CliError::ConfigJson);
    }

    Ok(ReduceConfig {
        block_factor: cli.block_factor,
        workers: cli.workers.unwrap_or_else(default_workers),
        mode: cli.mode.into(),
    })
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run(cli: &Cli) -> Result<RunDiagnostics, CliError> {
    // Everything that can be rejected without touching the image is
    // rejected here, before any output exists.
    let config = config_from_cli(cli)?;
    config.validate()?;
    let options = EncodeOptions {
        jpeg_quality: cli.jpeg_quality,
    };
    options.validate()?;
    let sink = FileSink::new(
        Destination::new(&cli.downsampled)?,
        Destination::new(&cli.grayscale)?,
        options,
    );

    let image_bytes = std::fs::read(&cli.input).map_err(|source| CliError::Read {
        path: cli.input.clone(),
        source,
    })?;
    tracing::info!(
        input = %cli.input.display(),
        bytes = image_bytes.len(),
        ?config,
        "read input"
    );

    Ok(grayblock_pipeline::reduce(
        Source::Encoded(&image_bytes),
        &config,
        &sink,
        &StdClock,
    )?)
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let diagnostics = match run(&cli) {
        Ok(diagnostics) => diagnostics,
        Err(e) => {
            tracing::error!(error = %e, "run failed");
            eprintln!("Error: {e}");
            return ExitCode::FAILURE;
        }
    };

    if cli.json {
        match serde_json::to_string_pretty(&diagnostics) {
            Ok(json) => println!("{json}"),
            Err(e) => {
                eprintln!("{}", CliError::Diagnostics(e));
                return ExitCode::FAILURE;
            }
        }
    } else if cli.report {
        println!("{}", diagnostics.report());
    }

    ExitCode::SUCCESS
}
