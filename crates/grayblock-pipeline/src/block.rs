//! Block reduction: average each `B x B` tile into one pixel.
//!
//! Each channel is summed over the tile and divided by `B * B` with
//! integer truncation. Channel order and count are preserved.
//!
//! The reducer only ever writes the output rows it is handed and only
//! reads the source rows that feed them, so workers with disjoint row
//! ranges need no synchronization while it runs.

use crate::partition::RowRange;
use crate::raster::{MAX_CHANNELS, PixelView};

/// Compute output row `out_y` from source rows
/// `out_y * block_factor .. (out_y + 1) * block_factor`.
///
/// `out_row` must hold `source.width() / block_factor` pixels and the
/// source must hold every row the output row reads.
pub fn reduce_row(source: &PixelView<'_>, block_factor: usize, out_y: usize, out_row: &mut [u8]) {
    let channels = source.channels();
    debug_assert!(block_factor > 0, "block factor must be positive");
    debug_assert!(
        (out_y + 1) * block_factor <= source.height(),
        "output row {out_y} reads past source row {}",
        source.height()
    );
    debug_assert_eq!(out_row.len(), source.width() / block_factor * channels);
    let area = (block_factor * block_factor) as u64;
    let block_bytes = block_factor * channels;

    for (block_x, out_pixel) in out_row.chunks_exact_mut(channels).enumerate() {
        let mut sums = [0_u64; MAX_CHANNELS];
        let first = block_x * block_bytes;

        for dy in 0..block_factor {
            let row = source.row(out_y * block_factor + dy);
            for pixel in row[first..first + block_bytes].chunks_exact(channels) {
                for (sum, &value) in sums.iter_mut().zip(pixel) {
                    *sum += u64::from(value);
                }
            }
        }

        for (dst, sum) in out_pixel.iter_mut().zip(sums) {
            // The mean of u8 values always fits in a u8.
            #[expect(clippy::cast_possible_truncation)]
            let mean = (sum / area) as u8;
            *dst = mean;
        }
    }
}

/// Reduce the source rows in `rows` into `out`.
///
/// `rows` is in source-row units and must start and end on block
/// boundaries; `out` receives `rows.len() / block_factor` output rows.
pub fn reduce_rows(source: &PixelView<'_>, block_factor: usize, rows: RowRange, out: &mut [u8]) {
    let out_row_bytes = (source.width() / block_factor) * source.channels();
    debug_assert!(out_row_bytes > 0, "source is narrower than one block");
    debug_assert_eq!(rows.start % block_factor, 0);
    let first_out_row = rows.start / block_factor;
    for (i, out_row) in out.chunks_exact_mut(out_row_bytes).enumerate() {
        reduce_row(source, block_factor, first_out_row + i, out_row);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::raster::Raster;

    fn reduce_all(raster: &Raster, block_factor: usize) -> Vec<u8> {
        let out_w = raster.width() as usize / block_factor;
        let out_h = raster.height() as usize / block_factor;
        let mut out = vec![0; out_w * out_h * raster.channels()];
        reduce_rows(
            &raster.view(),
            block_factor,
            RowRange::new(0, raster.height() as usize),
            &mut out,
        );
        out
    }

    #[test]
    fn four_by_four_gray_quadrants() {
        let raster = Raster::new(
            4,
            4,
            1,
            vec![0, 0, 4, 4, 0, 0, 4, 4, 8, 8, 12, 12, 8, 8, 12, 12],
        )
        .unwrap();
        assert_eq!(reduce_all(&raster, 2), vec![0, 4, 8, 12]);
    }

    #[test]
    fn average_truncates() {
        // 1 + 2 + 2 + 2 = 7, 7 / 4 = 1.75 -> 1.
        let raster = Raster::new(2, 2, 1, vec![1, 2, 2, 2]).unwrap();
        assert_eq!(reduce_all(&raster, 2), vec![1]);
    }

    #[test]
    fn channels_are_averaged_independently() {
        let raster = Raster::new(
            2,
            2,
            3,
            vec![
                10, 100, 255, //
                20, 100, 255, //
                30, 100, 255, //
                40, 101, 254, //
            ],
        )
        .unwrap();
        assert_eq!(reduce_all(&raster, 2), vec![25, 100, 254]);
    }

    #[test]
    fn saturated_tile_stays_saturated() {
        let raster = Raster::from_fn(8, 8, 4, |_, _, _| 255).unwrap();
        assert_eq!(reduce_all(&raster, 8), vec![255, 255, 255, 255]);
    }

    #[test]
    fn block_factor_four() {
        // Left tile is uniformly 3, right tile uniformly 9.
        let raster = Raster::from_fn(8, 4, 1, |x, _, _| if x < 4 { 3 } else { 9 }).unwrap();
        assert_eq!(reduce_all(&raster, 4), vec![3, 9]);
    }

    #[test]
    fn block_factor_one_copies() {
        let raster = Raster::from_fn(3, 2, 2, |x, y, c| (x * 7 + y * 3) as u8 + c as u8).unwrap();
        assert_eq!(reduce_all(&raster, 1), raster.pixels());
    }

    #[test]
    fn partial_rows_write_only_their_output_rows() {
        let raster = Raster::from_fn(4, 4, 1, |_, y, _| (y * 10) as u8).unwrap();
        let mut out = vec![0; 2];
        reduce_rows(&raster.view(), 2, RowRange::new(2, 4), &mut out);
        // Rows 2 and 3 hold 20 and 30; their mean is 25.
        assert_eq!(out, vec![25, 25]);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "reads past source row")]
    fn output_row_past_the_source_is_rejected() {
        let raster = Raster::from_fn(4, 2, 1, |_, _, _| 1).unwrap();
        let mut out = vec![0; 2];
        reduce_row(&raster.view(), 2, 1, &mut out);
    }
}
