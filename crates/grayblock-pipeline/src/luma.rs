//! Luma reduction: collapse each pixel to one gray byte.
//!
//! The gray value is the unweighted, truncating mean of the pixel's
//! color channels. Alpha never contributes: four-channel pixels average
//! their first three channels and luma+alpha pixels keep their luma.

use crate::raster::MAX_CHANNELS;

/// Number of leading channels that carry color for a pixel with
/// `channels` interleaved channels.
#[must_use]
pub const fn color_channels(channels: usize) -> usize {
    match channels {
        2 => 1,
        4 => 3,
        other => other,
    }
}

/// Gray value of a single pixel with `pixel.len()` channels.
///
/// `pixel` holds one to four channels.
#[must_use]
pub fn luma(pixel: &[u8]) -> u8 {
    debug_assert!(
        (1..=MAX_CHANNELS).contains(&pixel.len()),
        "pixel with {} channels",
        pixel.len()
    );
    let colors = color_channels(pixel.len());
    let sum: u32 = pixel[..colors].iter().map(|&v| u32::from(v)).sum();
    // The mean of u8 values always fits in a u8.
    #[expect(clippy::cast_possible_truncation)]
    let mean = (sum / colors as u32) as u8;
    mean
}

/// Reduce interleaved `pixels` with `channels` channels into one byte
/// per pixel in `out`.
///
/// Works on any run of whole rows; `out` must hold
/// `pixels.len() / channels` bytes.
pub fn reduce_pixels(pixels: &[u8], channels: usize, out: &mut [u8]) {
    debug_assert_eq!(out.len() * channels, pixels.len());
    for (dst, pixel) in out.iter_mut().zip(pixels.chunks_exact(channels)) {
        *dst = luma(pixel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rgb_mean_truncates() {
        // (10 + 20 + 33) / 3 = 21.0
        assert_eq!(luma(&[10, 20, 33]), 21);
        // (10 + 20 + 32) / 3 = 20.67 -> 20
        assert_eq!(luma(&[10, 20, 32]), 20);
    }

    #[test]
    fn rgba_excludes_alpha() {
        assert_eq!(luma(&[10, 20, 30, 255]), 20);
        assert_eq!(luma(&[10, 20, 30, 0]), 20);
    }

    #[test]
    fn luma_alpha_keeps_luma() {
        assert_eq!(luma(&[77, 255]), 77);
    }

    #[test]
    fn single_channel_is_unchanged() {
        assert_eq!(luma(&[123]), 123);
    }

    #[test]
    fn color_channel_counts() {
        assert_eq!(color_channels(1), 1);
        assert_eq!(color_channels(2), 1);
        assert_eq!(color_channels(3), 3);
        assert_eq!(color_channels(4), 3);
    }

    #[test]
    fn reduce_pixels_writes_one_byte_per_pixel() {
        let pixels = [255, 255, 255, 0, 0, 0, 1, 2, 3];
        let mut out = [9; 3];
        reduce_pixels(&pixels, 3, &mut out);
        assert_eq!(out, [255, 0, 2]);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "pixel with 0 channels")]
    fn empty_pixel_is_rejected() {
        let _ = luma(&[]);
    }
}
