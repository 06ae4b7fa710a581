//! Run diagnostics: phase timings and buffer sizes.
//!
//! Every call to [`reduce`](crate::reduce) returns a [`RunDiagnostics`]
//! describing what was decoded, how large each shared region was, and
//! how long each phase took on the loader/writer.
//!
//! The pipeline never reads the system clock itself; callers inject a
//! [`Clock`]. Durations are serialized as fractional seconds (`f64`)
//! since `std::time::Duration` does not implement serde traits.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::arena::{BufferLayout, BufferSizes};
use crate::types::{Dimensions, ExecutionMode};

/// Source of timestamps for phase timing.
pub trait Clock {
    /// Opaque point in time.
    type Instant;

    /// The current instant.
    fn now(&self) -> Self::Instant;

    /// Time elapsed since `since`.
    fn elapsed(&self, since: &Self::Instant) -> Duration;
}

/// Serde support for `std::time::Duration` as fractional seconds.
mod duration_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        duration.as_secs_f64().serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(|_| {
            serde::de::Error::custom(
                "duration seconds must be finite, non-negative, and representable as a Duration",
            )
        })
    }
}

/// Wall-clock duration of each phase, measured on the loader/writer.
///
/// In [`ExecutionMode::Workers`] the allocate, block, and luma phases end
/// at their barrier, so they include time spent waiting for the slowest
/// worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseTimings {
    /// Decode and block alignment.
    #[serde(with = "duration_serde")]
    pub decode: Duration,
    /// Layout broadcast and shared region allocation.
    #[serde(with = "duration_serde")]
    pub allocate: Duration,
    /// Publishing the decoded source.
    #[serde(with = "duration_serde")]
    pub publish: Duration,
    /// Block reduction.
    #[serde(with = "duration_serde")]
    pub block: Duration,
    /// Luma reduction.
    #[serde(with = "duration_serde")]
    pub luma: Duration,
    /// Gathering and handing both images to the sink.
    #[serde(with = "duration_serde")]
    pub write: Duration,
}

/// Diagnostics collected from a single reduction run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunDiagnostics {
    /// Execution mode used.
    pub mode: ExecutionMode,
    /// Workers (or pool threads).
    pub workers: usize,
    /// Linear downsampling ratio.
    pub block_factor: u32,
    /// Channels per source pixel.
    pub channels: usize,
    /// Dimensions as decoded, before block alignment.
    pub decoded: Dimensions,
    /// Block-aligned source dimensions.
    pub source: Dimensions,
    /// Dimensions of both reduced images.
    pub reduced: Dimensions,
    /// Bytes held by each shared region.
    pub buffers: BufferSizes,
    /// Per-phase durations.
    pub timings: PhaseTimings,
    /// Total wall-clock duration of the run (seconds).
    #[serde(with = "duration_serde")]
    pub total_duration: Duration,
}

impl RunDiagnostics {
    pub(crate) fn from_layout(
        mode: ExecutionMode,
        workers: usize,
        layout: &BufferLayout,
        decoded: Dimensions,
        timings: PhaseTimings,
        total_duration: Duration,
    ) -> Self {
        Self {
            mode,
            workers,
            block_factor: layout.block_factor,
            channels: layout.channels,
            decoded,
            source: layout.source,
            reduced: layout.reduced(),
            buffers: layout.sizes(),
            timings,
            total_duration,
        }
    }

    /// Format diagnostics as a human-readable report.
    #[must_use]
    pub fn report(&self) -> String {
        let mut lines = Vec::new();

        lines.push(format!("Reduction Diagnostics Report\n{}", "=".repeat(60)));
        lines.push(format!(
            "Mode: {}  |  Workers: {}  |  Block factor: {}",
            self.mode, self.workers, self.block_factor,
        ));
        lines.push(format!(
            "Image: {} decoded, {} aligned, {} reduced ({} channels)",
            self.decoded, self.source, self.reduced, self.channels,
        ));
        lines.push(format!(
            "Buffers: source {} B, downsampled {} B, grayscale {} B",
            self.buffers.source, self.buffers.downsampled, self.buffers.grayscale,
        ));
        lines.push(format!(
            "Total duration: {:.3}ms",
            duration_ms(self.total_duration),
        ));
        lines.push(String::new());

        lines.push(format!("{:<16} {:>10} {:>10}", "Phase", "Duration", "% Total"));
        lines.push("-".repeat(38));

        let total_ms = duration_ms(self.total_duration);
        let phases = [
            ("Decode", self.timings.decode),
            ("Allocate", self.timings.allocate),
            ("Publish", self.timings.publish),
            ("Block", self.timings.block),
            ("Luma", self.timings.luma),
            ("Write", self.timings.write),
        ];
        for (name, duration) in phases {
            let ms = duration_ms(duration);
            let pct = if total_ms > 0.0 {
                ms / total_ms * 100.0
            } else {
                0.0
            };
            lines.push(format!("{name:<16} {ms:>8.3}ms {pct:>9.1}%"));
        }

        lines.join("\n")
    }
}

/// Convert a `Duration` to milliseconds as `f64`.
fn duration_ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}
