//! Row partitioning across workers.
//!
//! Every worker owns one contiguous, half-open range of source rows.
//! Ranges are disjoint, cover `0..total_rows` exactly once, keep worker
//! order, and differ in length by at most one row: the first
//! `total_rows % workers` workers take the extra rows.
//!
//! The downsampled image is not partitioned independently. Each worker
//! keeps the rows produced from its own source rows, found by dividing
//! its source bounds by the block factor. That division is only exact
//! when the source bounds land on block boundaries, which
//! [`derive_block_partition`] checks instead of rebalancing.

use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::types::DimensionError;

/// A half-open range of image rows `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowRange {
    /// First row (inclusive).
    pub start: usize,
    /// Last row (exclusive).
    pub end: usize,
}

impl RowRange {
    /// Create a new row range.
    #[must_use]
    pub const fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    /// Number of rows in the range.
    #[must_use]
    pub const fn len(self) -> usize {
        self.end.saturating_sub(self.start)
    }

    /// Returns `true` if the range holds no rows.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.end <= self.start
    }

    /// The range as a standard library [`Range`].
    #[must_use]
    pub const fn as_range(self) -> Range<usize> {
        self.start..self.end
    }
}

/// Rows owned by worker `index` out of `workers`.
///
/// With `q = total_rows / workers` and `m = total_rows % workers`,
/// workers below `m` own `q + 1` rows starting at `index * (q + 1)`;
/// the rest own `q` rows starting at `m * (q + 1) + (index - m) * q`.
///
/// # Errors
///
/// Returns [`DimensionError::TooFewRows`] if `workers` is zero or larger
/// than `total_rows` (some worker would own nothing), and
/// [`DimensionError::WorkerOutOfRange`] if `index >= workers`.
pub const fn partition(
    total_rows: usize,
    workers: usize,
    index: usize,
) -> Result<RowRange, DimensionError> {
    if workers == 0 || total_rows < workers {
        return Err(DimensionError::TooFewRows {
            rows: total_rows,
            workers,
        });
    }
    if index >= workers {
        return Err(DimensionError::WorkerOutOfRange { index, workers });
    }

    let quota = total_rows / workers;
    let remainder = total_rows % workers;

    let range = if index < remainder {
        let start = index * (quota + 1);
        RowRange::new(start, start + quota + 1)
    } else {
        let start = remainder * (quota + 1) + (index - remainder) * quota;
        RowRange::new(start, start + quota)
    };
    Ok(range)
}

/// Partitions for every worker, in worker order.
///
/// # Errors
///
/// Same conditions as [`partition`].
pub fn partitions(total_rows: usize, workers: usize) -> Result<Vec<RowRange>, DimensionError> {
    (0..workers)
        .map(|index| partition(total_rows, workers, index))
        .collect()
}

/// Downsampled rows produced from a worker's source rows.
///
/// # Errors
///
/// Returns [`DimensionError::MisalignedPartition`] if either bound of
/// `source` is not a multiple of `block_factor`; such a worker would own
/// a fractional block.
pub const fn derive_block_partition(
    source: RowRange,
    block_factor: usize,
    worker: usize,
) -> Result<RowRange, DimensionError> {
    if block_factor == 0 || source.start % block_factor != 0 || source.end % block_factor != 0 {
        return Err(DimensionError::MisalignedPartition {
            worker,
            start: source.start,
            end: source.end,
            block_factor,
        });
    }
    Ok(RowRange::new(
        source.start / block_factor,
        source.end / block_factor,
    ))
}
