//! Shared buffer manager.
//!
//! Owns the three regions every worker can address: the decoded
//! source, the downsampled image, and the grayscale image. Each region is
//! one contiguous allocation, split at allocation time into per-owner row
//! windows laid out in worker order. A window is claimed by its owner,
//! filled in place, then published back to the region exactly once.
//! Workers never hold a mutable alias into another worker's rows, and a
//! reader that has passed the phase barrier after a publish sees the
//! owner's bytes.
//!
//! Once every window is published the writer rejoins them into the
//! region's original buffer without copying.
//!
//! The source region has a single owner (the loader) spanning every
//! row. The downsampled and grayscale regions have one owner per worker,
//! with rows taken from the worker partition.

use std::fmt;
use std::mem;
use std::sync::{OnceLock, PoisonError, RwLock, RwLockWriteGuard};

use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::partition::{RowRange, derive_block_partition, partition, partitions};
use crate::raster::{PixelView, Raster};
use crate::types::{Dimensions, DimensionError, PipelineError};

/// Rank of the worker that loads the source and writes the outputs.
pub const ROOT_RANK: usize = 0;

/// Which shared region a window or error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegionKind {
    /// Decoded, block-aligned source pixels.
    Source,
    /// Block-averaged image.
    Downsampled,
    /// Single-channel luma image.
    Grayscale,
}

impl fmt::Display for RegionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Source => f.write_str("source"),
            Self::Downsampled => f.write_str("downsampled"),
            Self::Grayscale => f.write_str("grayscale"),
        }
    }
}

/// Violations of the shared buffer protocol.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ArenaError {
    /// Two workers disagreed on the layout during allocation.
    #[error("worker {rank} allocated with a layout that differs from the shared one")]
    LayoutMismatch {
        /// Rank of the disagreeing worker.
        rank: usize,
    },

    /// A rank that owns no rows in the region tried to claim or read.
    #[error("worker {rank} owns no rows in the {region} region")]
    NotOwner {
        /// Region addressed.
        region: RegionKind,
        /// Offending rank.
        rank: usize,
    },

    /// A window was claimed while its owner still held it.
    #[error("{region} rows of worker {rank} are already claimed")]
    AlreadyClaimed {
        /// Region addressed.
        region: RegionKind,
        /// Owning rank.
        rank: usize,
    },

    /// A window was claimed or published after it was published.
    #[error("{region} rows of worker {rank} were already published")]
    AlreadyPublished {
        /// Region addressed.
        region: RegionKind,
        /// Owning rank.
        rank: usize,
    },

    /// Rows were read or gathered before their owner published them.
    #[error("{region} rows of worker {rank} have not been published")]
    Unpublished {
        /// Region addressed.
        region: RegionKind,
        /// Owning rank.
        rank: usize,
    },

    /// A window's byte length does not match the rows it covers.
    #[error("{region} window of worker {rank} holds {actual} bytes, expected {expected}")]
    WindowSize {
        /// Region addressed.
        region: RegionKind,
        /// Owning rank.
        rank: usize,
        /// Bytes the owner's rows require.
        expected: usize,
        /// Bytes supplied.
        actual: usize,
    },

    /// A window was published to a region it was not claimed from.
    #[error("a {window} window cannot be published to the {region} region")]
    WrongRegion {
        /// Region the window was claimed from.
        window: RegionKind,
        /// Region it was published to.
        region: RegionKind,
    },
}

/// Geometry of the three shared regions.
///
/// Computed once by the loader from the decoded image and broadcast to
/// every worker before allocation, so all workers size the regions
/// identically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferLayout {
    /// Block-aligned source dimensions.
    pub source: Dimensions,
    /// Channels per source (and downsampled) pixel.
    pub channels: usize,
    /// Linear downsampling ratio.
    pub block_factor: u32,
    /// Number of workers sharing the regions.
    pub workers: usize,
}

/// Byte sizes of the three regions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferSizes {
    /// Source region bytes.
    pub source: usize,
    /// Downsampled region bytes.
    pub downsampled: usize,
    /// Grayscale region bytes.
    pub grayscale: usize,
}

impl BufferLayout {
    /// Describe the regions for a block-aligned source image.
    #[must_use]
    pub const fn new(
        source: Dimensions,
        channels: usize,
        block_factor: u32,
        workers: usize,
    ) -> Self {
        Self {
            source,
            channels,
            block_factor,
            workers,
        }
    }

    /// Block factor as a row/column count.
    #[must_use]
    pub const fn block(&self) -> usize {
        self.block_factor as usize
    }

    /// Dimensions of the downsampled and grayscale images.
    #[must_use]
    pub const fn reduced(&self) -> Dimensions {
        if self.block_factor == 0 {
            return self.source;
        }
        Dimensions::new(
            self.source.width / self.block_factor,
            self.source.height / self.block_factor,
        )
    }

    /// Bytes per source row.
    #[must_use]
    pub const fn source_row_bytes(&self) -> usize {
        self.source.width as usize * self.channels
    }

    /// Bytes per downsampled row.
    #[must_use]
    pub const fn downsampled_row_bytes(&self) -> usize {
        self.reduced().width as usize * self.channels
    }

    /// Bytes per grayscale row.
    #[must_use]
    pub const fn grayscale_row_bytes(&self) -> usize {
        self.reduced().width as usize
    }

    /// Byte size of every region.
    #[must_use]
    pub const fn sizes(&self) -> BufferSizes {
        let reduced_rows = self.reduced().height as usize;
        BufferSizes {
            source: self.source_row_bytes() * self.source.height as usize,
            downsampled: self.downsampled_row_bytes() * reduced_rows,
            grayscale: self.grayscale_row_bytes() * reduced_rows,
        }
    }

    /// Source rows owned by worker `rank`.
    ///
    /// # Errors
    ///
    /// See [`partition`].
    pub const fn source_rows(&self, rank: usize) -> Result<RowRange, DimensionError> {
        partition(self.source.height as usize, self.workers, rank)
    }

    /// Downsampled (and grayscale) rows owned by worker `rank`.
    ///
    /// # Errors
    ///
    /// See [`partition`] and [`derive_block_partition`].
    pub fn reduced_rows(&self, rank: usize) -> Result<RowRange, DimensionError> {
        derive_block_partition(self.source_rows(rank)?, self.block(), rank)
    }

    /// Downsampled rows of every worker, in worker order.
    ///
    /// # Errors
    ///
    /// See [`reduced_rows`](Self::reduced_rows).
    pub fn reduced_partitions(&self) -> Result<Vec<RowRange>, DimensionError> {
        partitions(self.source.height as usize, self.workers)?
            .into_iter()
            .enumerate()
            .map(|(rank, rows)| derive_block_partition(rows, self.block(), rank))
            .collect()
    }

    /// Wrap gathered region bytes as the two output images.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::BufferSize`] if either buffer does not
    /// match the reduced dimensions.
    pub fn output_images(
        &self,
        downsampled: Vec<u8>,
        grayscale: Vec<u8>,
    ) -> Result<(Raster, Raster), PipelineError> {
        let reduced = self.reduced();
        Ok((
            Raster::new(reduced.width, reduced.height, self.channels, downsampled)?,
            Raster::new(reduced.width, reduced.height, 1, grayscale)?,
        ))
    }

    /// Check that every worker owns a whole number of block rows.
    ///
    /// Runs on the loader before the layout is broadcast, so a rejected
    /// image never reaches allocation.
    ///
    /// # Errors
    ///
    /// Returns [`DimensionError::HeightNotDivisible`] if the source height
    /// is not a multiple of `workers * block_factor`, and any partition
    /// error for an individual worker.
    pub fn validate(&self) -> Result<(), DimensionError> {
        let divisor = self.workers * self.block();
        if divisor == 0 || self.source.height as usize % divisor != 0 {
            return Err(DimensionError::HeightNotDivisible {
                height: self.source.height,
                workers: self.workers,
                block_factor: self.block_factor,
            });
        }
        self.reduced_partitions().map(drop)
    }
}

/// Rows of one region, held by the worker that claimed them.
#[derive(Debug)]
#[must_use = "a claimed window must be published back to its region"]
pub struct RowWindow {
    region: RegionKind,
    rank: usize,
    rows: RowRange,
    data: BytesMut,
}

impl RowWindow {
    /// Region the window belongs to.
    pub const fn region(&self) -> RegionKind {
        self.region
    }

    /// Rows covered, in the region's row units.
    pub const fn rows(&self) -> RowRange {
        self.rows
    }

    /// Window bytes, writable by the owner.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data[..]
    }
}

/// Where one owner's rows currently are.
#[derive(Debug)]
enum Window {
    /// Allocated, waiting for the owner to claim it.
    Vacant(BytesMut),
    /// Held by the owner as a [`RowWindow`].
    Claimed,
    /// Back in the region and readable by every worker.
    Published(BytesMut),
    /// Merged into the region buffer by [`SharedRegion::gather`].
    Gathered,
}

/// One shared region: a row-major byte buffer split into owner windows.
#[derive(Debug)]
pub struct SharedRegion {
    kind: RegionKind,
    row_bytes: usize,
    owners: Vec<RowRange>,
    windows: Vec<RwLock<Window>>,
}

impl SharedRegion {
    /// Allocate the region and carve it into one window per owner.
    ///
    /// `owners` must be contiguous row ranges in row order.
    fn new(kind: RegionKind, row_bytes: usize, owners: Vec<RowRange>) -> Self {
        let total = owners.iter().map(|rows| rows.len()).sum::<usize>() * row_bytes;
        let mut storage = BytesMut::zeroed(total);
        let windows = owners
            .iter()
            .map(|rows| RwLock::new(Window::Vacant(storage.split_to(rows.len() * row_bytes))))
            .collect();
        Self {
            kind,
            row_bytes,
            owners,
            windows,
        }
    }

    /// Total bytes across every owner's rows.
    #[must_use]
    pub fn byte_size(&self) -> usize {
        self.owners.iter().map(|rows| rows.len()).sum::<usize>() * self.row_bytes
    }

    /// Rows owned by `rank`.
    ///
    /// # Errors
    ///
    /// Returns [`ArenaError::NotOwner`] if `rank` owns no rows here.
    pub fn owned_rows(&self, rank: usize) -> Result<RowRange, ArenaError> {
        self.owners.get(rank).copied().ok_or(ArenaError::NotOwner {
            region: self.kind,
            rank,
        })
    }

    fn window(&self, rank: usize) -> Result<RwLockWriteGuard<'_, Window>, ArenaError> {
        let lock = self.windows.get(rank).ok_or(ArenaError::NotOwner {
            region: self.kind,
            rank,
        })?;
        Ok(lock.write().unwrap_or_else(PoisonError::into_inner))
    }

    /// Claim `rank`'s rows. A fresh window is zeroed.
    ///
    /// # Errors
    ///
    /// Returns [`ArenaError::NotOwner`], [`ArenaError::AlreadyClaimed`] or
    /// [`ArenaError::AlreadyPublished`].
    pub fn claim(&self, rank: usize) -> Result<RowWindow, ArenaError> {
        let rows = self.owned_rows(rank)?;
        let mut window = self.window(rank)?;
        match mem::replace(&mut *window, Window::Claimed) {
            Window::Vacant(data) => Ok(RowWindow {
                region: self.kind,
                rank,
                rows,
                data,
            }),
            held => {
                let err = if matches!(held, Window::Claimed) {
                    ArenaError::AlreadyClaimed {
                        region: self.kind,
                        rank,
                    }
                } else {
                    ArenaError::AlreadyPublished {
                        region: self.kind,
                        rank,
                    }
                };
                *window = held;
                Err(err)
            }
        }
    }

    /// Claim `rank`'s rows and copy `bytes` into them.
    ///
    /// # Errors
    ///
    /// Returns [`ArenaError::WindowSize`] if `bytes` does not exactly cover
    /// the owner's rows, plus the [`claim`](Self::claim) errors.
    pub fn claim_filled(&self, rank: usize, bytes: &[u8]) -> Result<RowWindow, ArenaError> {
        let expected = self.owned_rows(rank)?.len() * self.row_bytes;
        if bytes.len() != expected {
            return Err(ArenaError::WindowSize {
                region: self.kind,
                rank,
                expected,
                actual: bytes.len(),
            });
        }
        let mut window = self.claim(rank)?;
        window.as_mut_slice().copy_from_slice(bytes);
        Ok(window)
    }

    /// Publish a finished window so other workers can read it after the
    /// next barrier.
    ///
    /// # Errors
    ///
    /// Returns [`ArenaError::WrongRegion`] if the window was claimed from
    /// another region and [`ArenaError::AlreadyPublished`] if its rows are
    /// already published.
    pub fn publish(&self, window: RowWindow) -> Result<(), ArenaError> {
        if window.region != self.kind {
            return Err(ArenaError::WrongRegion {
                window: window.region,
                region: self.kind,
            });
        }
        let rank = window.rank;
        let mut slot = self.window(rank)?;
        if !matches!(*slot, Window::Claimed) {
            return Err(ArenaError::AlreadyPublished {
                region: self.kind,
                rank,
            });
        }
        *slot = Window::Published(window.data);
        Ok(())
    }

    /// Run `read` on the published bytes of `rank`'s rows.
    ///
    /// Readers never block each other.
    ///
    /// # Errors
    ///
    /// Returns [`ArenaError::NotOwner`] or [`ArenaError::Unpublished`].
    pub fn with_published<R>(
        &self,
        rank: usize,
        read: impl FnOnce(&[u8]) -> R,
    ) -> Result<R, ArenaError> {
        let lock = self.windows.get(rank).ok_or(ArenaError::NotOwner {
            region: self.kind,
            rank,
        })?;
        let window = lock.read().unwrap_or_else(PoisonError::into_inner);
        match &*window {
            Window::Published(data) => Ok(read(&data[..])),
            _ => Err(ArenaError::Unpublished {
                region: self.kind,
                rank,
            }),
        }
    }

    /// Rejoin every owner's published rows into the region buffer.
    ///
    /// Only valid after the barrier that follows the last publish. The
    /// windows are merged in row order back into the allocation they were
    /// carved from, so no bytes are copied. Leaves the region empty.
    ///
    /// # Errors
    ///
    /// Returns [`ArenaError::Unpublished`] if any owner has not published.
    pub fn gather(&self) -> Result<BytesMut, ArenaError> {
        let unpublished =
            (0..self.windows.len()).find(|&rank| self.with_published(rank, |_| ()).is_err());
        if let Some(rank) = unpublished {
            return Err(ArenaError::Unpublished {
                region: self.kind,
                rank,
            });
        }

        let mut whole = BytesMut::new();
        for rank in 0..self.windows.len() {
            let mut window = self.window(rank)?;
            match mem::replace(&mut *window, Window::Gathered) {
                Window::Published(data) => whole.unsplit(data),
                held => {
                    *window = held;
                    return Err(ArenaError::Unpublished {
                        region: self.kind,
                        rank,
                    });
                }
            }
        }
        Ok(whole)
    }
}

/// The three regions, allocated together from one [`BufferLayout`].
#[derive(Debug)]
pub struct SharedRegions {
    layout: BufferLayout,
    /// Decoded source pixels; single owner, the loader.
    pub source: SharedRegion,
    /// Downsampled pixels; one window per worker.
    pub downsampled: SharedRegion,
    /// Grayscale pixels; one window per worker.
    pub grayscale: SharedRegion,
}

impl SharedRegions {
    fn new(layout: &BufferLayout) -> Result<Self, DimensionError> {
        let reduced_owners = layout.reduced_partitions()?;
        let source_owner = RowRange::new(0, layout.source.height as usize);

        Ok(Self {
            layout: layout.clone(),
            source: SharedRegion::new(
                RegionKind::Source,
                layout.source_row_bytes(),
                vec![source_owner],
            ),
            downsampled: SharedRegion::new(
                RegionKind::Downsampled,
                layout.downsampled_row_bytes(),
                reduced_owners.clone(),
            ),
            grayscale: SharedRegion::new(
                RegionKind::Grayscale,
                layout.grayscale_row_bytes(),
                reduced_owners,
            ),
        })
    }

    /// Layout the regions were allocated from.
    #[must_use]
    pub const fn layout(&self) -> &BufferLayout {
        &self.layout
    }

    /// Run `read` on a view of the published source pixels.
    ///
    /// # Errors
    ///
    /// Returns [`ArenaError::Unpublished`] before the loader has published.
    pub fn with_source<R>(&self, read: impl FnOnce(PixelView<'_>) -> R) -> Result<R, ArenaError> {
        let width = self.layout.source.width as usize;
        let channels = self.layout.channels;
        self.source.with_published(ROOT_RANK, |pixels| {
            read(PixelView::new(pixels, width, channels))
        })
    }

    /// Attach worker `rank` to the regions.
    ///
    /// # Errors
    ///
    /// Returns partition errors if `rank` is not a worker of the layout.
    pub fn attach(&self, rank: usize) -> Result<Attachment<'_>, DimensionError> {
        Ok(Attachment {
            regions: self,
            rank,
            source_rows: self.layout.source_rows(rank)?,
            reduced_rows: self.layout.reduced_rows(rank)?,
        })
    }
}

/// One worker's access to the shared regions.
///
/// Obtained with [`SharedRegions::attach`]. Reads the whole source once
/// it is published, and claims and publishes only the attached rank's
/// rows of the downsampled and grayscale regions.
#[derive(Debug, Clone, Copy)]
pub struct Attachment<'a> {
    regions: &'a SharedRegions,
    rank: usize,
    source_rows: RowRange,
    reduced_rows: RowRange,
}

impl<'a> Attachment<'a> {
    /// Layout of the attached regions.
    #[must_use]
    pub const fn layout(&self) -> &'a BufferLayout {
        &self.regions.layout
    }

    /// The regions this attachment reads and writes.
    #[must_use]
    pub const fn regions(&self) -> &'a SharedRegions {
        self.regions
    }

    /// Source rows this worker reduces.
    #[must_use]
    pub const fn source_rows(&self) -> RowRange {
        self.source_rows
    }

    /// Downsampled and grayscale rows this worker owns.
    #[must_use]
    pub const fn reduced_rows(&self) -> RowRange {
        self.reduced_rows
    }

    /// Copy the decoded source pixels into the source region and publish
    /// them. Only the loader may do this.
    ///
    /// # Errors
    ///
    /// Returns [`ArenaError::NotOwner`] for any rank but the loader, and
    /// [`ArenaError::WindowSize`] if `pixels` does not match the layout.
    pub fn publish_source(&self, pixels: &[u8]) -> Result<(), ArenaError> {
        let window = self.regions.source.claim_filled(self.rank, pixels)?;
        self.regions.source.publish(window)
    }

    /// Run `read` on a view of the whole published source.
    ///
    /// # Errors
    ///
    /// Returns [`ArenaError::Unpublished`] before the loader has published.
    pub fn with_source<R>(&self, read: impl FnOnce(PixelView<'_>) -> R) -> Result<R, ArenaError> {
        self.regions.with_source(read)
    }

    /// Claim this worker's downsampled rows.
    ///
    /// # Errors
    ///
    /// See [`SharedRegion::claim`].
    pub fn downsampled_window(&self) -> Result<RowWindow, ArenaError> {
        self.regions.downsampled.claim(self.rank)
    }

    /// Claim this worker's grayscale rows.
    ///
    /// # Errors
    ///
    /// See [`SharedRegion::claim`].
    pub fn grayscale_window(&self) -> Result<RowWindow, ArenaError> {
        self.regions.grayscale.claim(self.rank)
    }

    /// Run `read` on this worker's published downsampled rows.
    ///
    /// # Errors
    ///
    /// Returns [`ArenaError::Unpublished`] before they are published.
    pub fn with_downsampled_rows<R>(&self, read: impl FnOnce(&[u8]) -> R) -> Result<R, ArenaError> {
        self.regions.downsampled.with_published(self.rank, read)
    }

    /// Publish a window claimed through this attachment.
    ///
    /// # Errors
    ///
    /// See [`SharedRegion::publish`].
    pub fn publish(&self, window: RowWindow) -> Result<(), ArenaError> {
        let region = match window.region() {
            RegionKind::Source => &self.regions.source,
            RegionKind::Downsampled => &self.regions.downsampled,
            RegionKind::Grayscale => &self.regions.grayscale,
        };
        region.publish(window)
    }
}

/// Owner of the shared regions for one run.
///
/// Allocation is collective: every worker calls
/// [`allocate_shared`](Self::allocate_shared) with the broadcast layout,
/// the first caller builds the regions, and every caller gets a reference
/// to the same ones. The regions live until the arena is dropped, after
/// every worker has finished.
#[derive(Debug, Default)]
pub struct SharedArena {
    regions: OnceLock<SharedRegions>,
}

impl SharedArena {
    /// An arena with nothing allocated yet.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            regions: OnceLock::new(),
        }
    }

    /// Allocate (or attach to) the regions described by `layout`.
    ///
    /// # Errors
    ///
    /// Returns [`ArenaError::LayoutMismatch`] if the regions were already
    /// allocated with a different layout, and partition errors if the
    /// layout does not split into whole blocks per worker.
    pub fn allocate_shared(
        &self,
        rank: usize,
        layout: &BufferLayout,
    ) -> Result<&SharedRegions, PipelineError> {
        let regions = match self.regions.get() {
            Some(existing) => existing,
            None => {
                let fresh = SharedRegions::new(layout)?;
                self.regions.get_or_init(|| {
                    debug!(
                        rank,
                        source = fresh.source.byte_size(),
                        downsampled = fresh.downsampled.byte_size(),
                        grayscale = fresh.grayscale.byte_size(),
                        "allocated shared regions"
                    );
                    fresh
                })
            }
        };
        if regions.layout != *layout {
            return Err(ArenaError::LayoutMismatch { rank }.into());
        }
        Ok(regions)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn layout(width: u32, height: u32, channels: usize, workers: usize) -> BufferLayout {
        BufferLayout::new(Dimensions::new(width, height), channels, 2, workers)
    }

    #[test]
    fn sizes_follow_dimensions() {
        let sizes = layout(8, 4, 3, 2).sizes();
        assert_eq!(
            sizes,
            BufferSizes {
                source: 96,
                downsampled: 24,
                grayscale: 8,
            }
        );
    }

    #[test]
    fn validate_rejects_height_not_divisible_by_workers_times_block() {
        assert_eq!(
            layout(8, 6, 1, 2).validate(),
            Err(DimensionError::HeightNotDivisible {
                height: 6,
                workers: 2,
                block_factor: 2,
            })
        );
    }

    #[test]
    fn validate_accepts_aligned_layout() {
        assert!(layout(8, 8, 1, 4).validate().is_ok());
    }

    #[test]
    fn reduced_rows_follow_source_partition() {
        let layout = layout(4, 8, 1, 2);
        assert_eq!(layout.source_rows(1).unwrap(), RowRange::new(4, 8));
        assert_eq!(layout.reduced_rows(1).unwrap(), RowRange::new(2, 4));
        assert_eq!(
            layout.reduced_partitions().unwrap(),
            vec![RowRange::new(0, 2), RowRange::new(2, 4)]
        );
    }

    #[test]
    fn allocation_is_shared_between_callers() {
        let arena = SharedArena::new();
        let layout = layout(4, 4, 1, 2);
        let first = arena.allocate_shared(0, &layout).unwrap();
        let second = arena.allocate_shared(1, &layout).unwrap();
        assert!(std::ptr::eq(first, second));
        assert_eq!(first.downsampled.byte_size(), 4);
        assert_eq!(first.grayscale.byte_size(), 4);
        assert_eq!(first.source.byte_size(), 16);
    }

    #[test]
    fn allocation_with_a_different_layout_is_rejected() {
        let arena = SharedArena::new();
        arena.allocate_shared(0, &layout(4, 4, 1, 2)).unwrap();
        let result = arena.allocate_shared(1, &layout(4, 4, 3, 2));
        assert!(matches!(
            result,
            Err(PipelineError::Arena(ArenaError::LayoutMismatch { rank: 1 }))
        ));
    }

    #[test]
    fn claim_publish_read_cycle() {
        let arena = SharedArena::new();
        let regions = arena.allocate_shared(0, &layout(4, 8, 1, 2)).unwrap();

        let mut window = regions.downsampled.claim(1).unwrap();
        assert_eq!(window.rows(), RowRange::new(2, 4));
        assert_eq!(window.as_mut_slice(), &[0, 0, 0, 0]);
        window.as_mut_slice().copy_from_slice(&[1, 2, 3, 4]);
        regions.downsampled.publish(window).unwrap();

        let read = regions.downsampled.with_published(1, <[u8]>::to_vec);
        assert_eq!(read.unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(
            regions.downsampled.with_published(0, |_| ()).unwrap_err(),
            ArenaError::Unpublished {
                region: RegionKind::Downsampled,
                rank: 0
            }
        );
    }

    #[test]
    fn windows_are_claimed_and_published_once() {
        let arena = SharedArena::new();
        let regions = arena.allocate_shared(0, &layout(4, 4, 1, 1)).unwrap();
        let window = regions.grayscale.claim(0).unwrap();
        assert_eq!(
            regions.grayscale.claim(0).unwrap_err(),
            ArenaError::AlreadyClaimed {
                region: RegionKind::Grayscale,
                rank: 0
            }
        );
        regions.grayscale.publish(window).unwrap();
        assert_eq!(
            regions.grayscale.claim(0).unwrap_err(),
            ArenaError::AlreadyPublished {
                region: RegionKind::Grayscale,
                rank: 0
            }
        );
    }

    #[test]
    fn windows_stay_in_their_region() {
        let arena = SharedArena::new();
        let regions = arena.allocate_shared(0, &layout(4, 4, 1, 1)).unwrap();
        let window = regions.grayscale.claim(0).unwrap();
        assert_eq!(
            regions.downsampled.publish(window).unwrap_err(),
            ArenaError::WrongRegion {
                window: RegionKind::Grayscale,
                region: RegionKind::Downsampled
            }
        );
    }

    #[test]
    fn non_owner_cannot_claim() {
        let arena = SharedArena::new();
        let regions = arena.allocate_shared(0, &layout(4, 4, 1, 2)).unwrap();
        assert_eq!(
            regions.source.claim(1).unwrap_err(),
            ArenaError::NotOwner {
                region: RegionKind::Source,
                rank: 1
            }
        );
    }

    #[test]
    fn claim_filled_checks_window_size() {
        let arena = SharedArena::new();
        let regions = arena.allocate_shared(0, &layout(4, 4, 1, 1)).unwrap();
        assert!(matches!(
            regions.source.claim_filled(0, &[0; 15]),
            Err(ArenaError::WindowSize {
                expected: 16,
                actual: 15,
                ..
            })
        ));
        // A rejected fill leaves the window claimable.
        assert!(regions.source.claim_filled(0, &[0; 16]).is_ok());
    }

    #[test]
    fn gather_rejoins_windows_in_row_order() {
        let arena = SharedArena::new();
        let regions = arena.allocate_shared(0, &layout(2, 8, 1, 2)).unwrap();

        // Publish out of order; gather still follows row order.
        let mut second = regions.grayscale.claim(1).unwrap();
        second.as_mut_slice().copy_from_slice(&[3, 4]);
        regions.grayscale.publish(second).unwrap();
        assert_eq!(
            regions.grayscale.gather().unwrap_err(),
            ArenaError::Unpublished {
                region: RegionKind::Grayscale,
                rank: 0
            }
        );

        let mut first = regions.grayscale.claim(0).unwrap();
        first.as_mut_slice().copy_from_slice(&[1, 2]);
        regions.grayscale.publish(first).unwrap();

        let whole = regions.grayscale.gather().unwrap();
        assert_eq!(&whole[..], &[1, 2, 3, 4]);
        assert_eq!(Vec::from(whole), vec![1, 2, 3, 4]);
    }

    #[test]
    fn windows_share_one_allocation() {
        let arena = SharedArena::new();
        let regions = arena.allocate_shared(0, &layout(2, 8, 1, 2)).unwrap();
        let mut first = regions.grayscale.claim(0).unwrap();
        let mut second = regions.grayscale.claim(1).unwrap();
        let first_end = first.as_mut_slice().as_ptr_range().end;
        let second_start = second.as_mut_slice().as_ptr();
        assert_eq!(first_end, second_start);
        regions.grayscale.publish(first).unwrap();
        regions.grayscale.publish(second).unwrap();
    }

    #[test]
    fn attachment_publishes_only_its_own_rows() {
        let arena = SharedArena::new();
        let regions = arena.allocate_shared(0, &layout(2, 8, 1, 2)).unwrap();
        let second = regions.attach(1).unwrap();
        assert_eq!(second.source_rows(), RowRange::new(4, 8));
        assert_eq!(second.reduced_rows(), RowRange::new(2, 4));

        let mut window = second.grayscale_window().unwrap();
        window.as_mut_slice().copy_from_slice(&[7, 8]);
        second.publish(window).unwrap();
        let read = regions.grayscale.with_published(1, <[u8]>::to_vec);
        assert_eq!(read.unwrap(), vec![7, 8]);

        assert_eq!(
            second.publish_source(&[0; 16]).unwrap_err(),
            ArenaError::NotOwner {
                region: RegionKind::Source,
                rank: 1
            }
        );
    }

    #[test]
    fn attach_rejects_unknown_rank() {
        let arena = SharedArena::new();
        let regions = arena.allocate_shared(0, &layout(2, 8, 1, 2)).unwrap();
        assert!(matches!(
            regions.attach(2),
            Err(DimensionError::WorkerOutOfRange { index: 2, workers: 2 })
        ));
    }

    #[test]
    fn source_is_readable_after_publish() {
        let arena = SharedArena::new();
        let regions = arena.allocate_shared(0, &layout(2, 2, 1, 1)).unwrap();
        let loader = regions.attach(ROOT_RANK).unwrap();
        assert!(loader.with_source(|_| ()).is_err());
        loader.publish_source(&[1, 2, 3, 4]).unwrap();
        let row = loader.with_source(|view| view.row(1).to_vec()).unwrap();
        assert_eq!(row, vec![3, 4]);
    }
}
