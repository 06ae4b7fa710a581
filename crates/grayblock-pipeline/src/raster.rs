//! Decoded raster images and the block-aligned source they become.
//!
//! A [`Raster`] is a row-major, channel-interleaved 8-bit buffer with
//! one to four channels. Decoding accepts whatever the `image` crate can
//! read and keeps the source channel count; higher bit depths are
//! narrowed to 8 bits.

use image::DynamicImage;

use crate::types::{Dimensions, DimensionError, PipelineError};

/// Largest channel count a raster can carry (RGBA).
pub const MAX_CHANNELS: usize = 4;

/// An owned 8-bit raster image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Raster {
    width: u32,
    height: u32,
    channels: usize,
    pixels: Vec<u8>,
}

impl Raster {
    /// Wrap an interleaved pixel buffer.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::UnsupportedChannels`] if `channels` is not
    /// in `1..=4`, and [`PipelineError::BufferSize`] if `pixels` does not
    /// hold exactly `width * height * channels` bytes.
    pub fn new(
        width: u32,
        height: u32,
        channels: usize,
        pixels: Vec<u8>,
    ) -> Result<Self, PipelineError> {
        if !(1..=MAX_CHANNELS).contains(&channels) {
            return Err(PipelineError::UnsupportedChannels(channels));
        }
        let expected = width as usize * height as usize * channels;
        if pixels.len() != expected {
            return Err(PipelineError::BufferSize {
                expected,
                actual: pixels.len(),
            });
        }
        Ok(Self {
            width,
            height,
            channels,
            pixels,
        })
    }

    /// Build a raster by evaluating `f(x, y, channel)` for every byte.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::UnsupportedChannels`] if `channels` is not
    /// in `1..=4`.
    pub fn from_fn(
        width: u32,
        height: u32,
        channels: usize,
        mut f: impl FnMut(u32, u32, usize) -> u8,
    ) -> Result<Self, PipelineError> {
        let mut pixels = Vec::with_capacity(width as usize * height as usize * channels);
        for y in 0..height {
            for x in 0..width {
                for c in 0..channels {
                    pixels.push(f(x, y, c));
                }
            }
        }
        Self::new(width, height, channels, pixels)
    }

    /// Width in pixels.
    #[must_use]
    pub const fn width(&self) -> u32 {
        self.width
    }

    /// Height in pixels.
    #[must_use]
    pub const fn height(&self) -> u32 {
        self.height
    }

    /// Interleaved channels per pixel.
    #[must_use]
    pub const fn channels(&self) -> usize {
        self.channels
    }

    /// Width and height together.
    #[must_use]
    pub const fn dimensions(&self) -> Dimensions {
        Dimensions::new(self.width, self.height)
    }

    /// Bytes per row.
    #[must_use]
    pub const fn row_bytes(&self) -> usize {
        self.width as usize * self.channels
    }

    /// The whole pixel buffer.
    #[must_use]
    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    /// Borrow the raster as a [`PixelView`].
    #[must_use]
    pub fn view(&self) -> PixelView<'_> {
        PixelView {
            pixels: &self.pixels,
            width: self.width as usize,
            channels: self.channels,
        }
    }

    /// Crop width and height down to the nearest multiple of
    /// `block_factor`, dropping the trailing columns and rows.
    ///
    /// An image whose dimensions are already multiples is returned as-is.
    #[must_use]
    pub fn truncate_to_block(self, block_factor: u32) -> Self {
        if block_factor == 0 {
            return self;
        }
        let width = self.width - self.width % block_factor;
        let height = self.height - self.height % block_factor;
        if width == self.width && height == self.height {
            return self;
        }

        let row_bytes = width as usize * self.channels;
        let mut pixels = Vec::with_capacity(row_bytes * height as usize);
        if row_bytes > 0 {
            for row in self.pixels.chunks_exact(self.row_bytes()).take(height as usize) {
                pixels.extend_from_slice(&row[..row_bytes]);
            }
        }
        Self {
            width,
            height,
            channels: self.channels,
            pixels,
        }
    }
}

/// Borrowed read-only view of interleaved pixel rows.
///
/// Used by the reducers so they can read either an owned [`Raster`] or
/// a published shared region without copying.
#[derive(Debug, Clone, Copy)]
pub struct PixelView<'a> {
    pixels: &'a [u8],
    width: usize,
    channels: usize,
}

impl<'a> PixelView<'a> {
    /// View `pixels` as rows of `width` pixels with `channels` each.
    #[must_use]
    pub const fn new(pixels: &'a [u8], width: usize, channels: usize) -> Self {
        Self {
            pixels,
            width,
            channels,
        }
    }

    /// Width in pixels.
    #[must_use]
    pub const fn width(&self) -> usize {
        self.width
    }

    /// Interleaved channels per pixel.
    #[must_use]
    pub const fn channels(&self) -> usize {
        self.channels
    }

    /// Bytes per row.
    #[must_use]
    pub const fn row_bytes(&self) -> usize {
        self.width * self.channels
    }

    /// Number of whole rows in the view.
    #[must_use]
    pub const fn height(&self) -> usize {
        if self.row_bytes() == 0 {
            0
        } else {
            self.pixels.len() / self.row_bytes()
        }
    }

    /// Bytes of row `y`. Empty if `y` is past the last row.
    #[must_use]
    pub fn row(&self, y: usize) -> &'a [u8] {
        let row_bytes = self.row_bytes();
        self.pixels
            .get(y * row_bytes..(y + 1) * row_bytes)
            .unwrap_or_default()
    }
}

/// Decode raw image bytes, keeping the source channel count.
///
/// # Errors
///
/// Returns [`PipelineError::EmptyInput`] if `bytes` is empty and
/// [`PipelineError::ImageDecode`] if the format is unrecognized or the
/// data is corrupt.
pub fn decode(bytes: &[u8]) -> Result<Raster, PipelineError> {
    if bytes.is_empty() {
        return Err(PipelineError::EmptyInput);
    }
    let image = image::load_from_memory(bytes)?;
    from_dynamic(image)
}

/// Convert a decoded [`DynamicImage`] into a [`Raster`].
///
/// 16-bit and floating point images are narrowed to 8 bits with the same
/// number of channels.
///
/// # Errors
///
/// Propagates [`Raster::new`] errors, which cannot occur for images the
/// `image` crate produces.
pub fn from_dynamic(image: DynamicImage) -> Result<Raster, PipelineError> {
    let (width, height) = (image.width(), image.height());
    match image.color().channel_count() {
        1 => Raster::new(width, height, 1, image.into_luma8().into_raw()),
        2 => Raster::new(width, height, 2, image.into_luma_alpha8().into_raw()),
        3 => Raster::new(width, height, 3, image.into_rgb8().into_raw()),
        _ => Raster::new(width, height, 4, image.into_rgba8().into_raw()),
    }
}

/// Decode (if needed) and block-align the input image.
///
/// Returns the truncated raster together with the dimensions it had
/// before truncation.
///
/// # Errors
///
/// Returns decode errors from [`decode`], and
/// [`DimensionError::SmallerThanBlock`] if the image does not contain a
/// single whole block.
pub fn load_source(
    source: crate::Source<'_>,
    block_factor: u32,
) -> Result<(Raster, Dimensions), PipelineError> {
    let raster = match source {
        crate::Source::Encoded(bytes) => decode(bytes)?,
        crate::Source::Decoded(raster) => raster,
    };
    let decoded = raster.dimensions();
    if decoded.width < block_factor || decoded.height < block_factor {
        return Err(DimensionError::SmallerThanBlock {
            width: decoded.width,
            height: decoded.height,
            block_factor,
        }
        .into());
    }
    Ok((raster.truncate_to_block(block_factor), decoded))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::Source;

    fn encode_png(img: &image::RgbaImage) -> Vec<u8> {
        let mut buf = Vec::new();
        let encoder = image::codecs::png::PngEncoder::new(&mut buf);
        image::ImageEncoder::write_image(
            encoder,
            img.as_raw(),
            img.width(),
            img.height(),
            image::ExtendedColorType::Rgba8,
        )
        .unwrap();
        buf
    }

    #[test]
    fn new_rejects_bad_channel_count() {
        let result = Raster::new(1, 1, 5, vec![0; 5]);
        assert!(matches!(result, Err(PipelineError::UnsupportedChannels(5))));
    }

    #[test]
    fn new_rejects_short_buffer() {
        let result = Raster::new(2, 2, 3, vec![0; 11]);
        assert!(matches!(
            result,
            Err(PipelineError::BufferSize {
                expected: 12,
                actual: 11
            })
        ));
    }

    #[test]
    fn truncate_aligned_image_is_a_no_op() {
        let raster = Raster::from_fn(8, 4, 3, |x, y, c| (x + y + c as u32) as u8).unwrap();
        let truncated = raster.clone().truncate_to_block(2);
        assert_eq!(truncated, raster);
    }

    #[test]
    fn truncate_is_idempotent() {
        let raster = Raster::from_fn(7, 5, 1, |x, y, _| (x * 5 + y) as u8).unwrap();
        let once = raster.truncate_to_block(2);
        let twice = once.clone().truncate_to_block(2);
        assert_eq!(once, twice);
    }

    #[test]
    fn truncate_drops_trailing_rows_and_columns() {
        let raster = Raster::from_fn(5, 3, 1, |x, y, _| (y * 10 + x) as u8).unwrap();
        let truncated = raster.truncate_to_block(2);
        assert_eq!(truncated.dimensions(), Dimensions::new(4, 2));
        assert_eq!(truncated.pixels(), &[0, 1, 2, 3, 10, 11, 12, 13]);
    }

    #[test]
    fn view_rows() {
        let raster = Raster::from_fn(2, 3, 1, |x, y, _| (y * 2 + x) as u8).unwrap();
        let view = raster.view();
        assert_eq!(view.height(), 3);
        assert_eq!(view.row(1), &[2, 3]);
        assert!(view.row(3).is_empty());
    }

    #[test]
    fn decode_empty_input() {
        assert!(matches!(decode(&[]), Err(PipelineError::EmptyInput)));
    }

    #[test]
    fn decode_corrupt_input() {
        assert!(matches!(
            decode(&[0xFF, 0xFE, 0x00, 0x01]),
            Err(PipelineError::ImageDecode(_))
        ));
    }

    #[test]
    fn decode_keeps_rgba_channels() {
        let img = image::RgbaImage::from_fn(3, 2, |x, _| image::Rgba([x as u8, 1, 2, 200]));
        let raster = decode(&encode_png(&img)).unwrap();
        assert_eq!(raster.channels(), 4);
        assert_eq!(raster.dimensions(), Dimensions::new(3, 2));
        // Last pixel of the second row.
        assert_eq!(&raster.pixels()[20..24], &[2, 1, 2, 200]);
    }

    #[test]
    fn decode_keeps_single_channel() {
        let img = DynamicImage::ImageLuma8(image::GrayImage::from_pixel(2, 2, image::Luma([77])));
        let raster = from_dynamic(img).unwrap();
        assert_eq!(raster.channels(), 1);
        assert_eq!(raster.pixels(), &[77, 77, 77, 77]);
    }

    #[test]
    fn sixteen_bit_input_is_narrowed() {
        let img = DynamicImage::ImageRgb16(image::ImageBuffer::from_pixel(
            1,
            1,
            image::Rgb([u16::MAX, 0, u16::MAX]),
        ));
        let raster = from_dynamic(img).unwrap();
        assert_eq!(raster.channels(), 3);
        assert_eq!(raster.pixels(), &[255, 0, 255]);
    }

    #[test]
    fn load_source_rejects_image_smaller_than_block() {
        let raster = Raster::from_fn(1, 4, 1, |_, _, _| 0).unwrap();
        let result = load_source(Source::Decoded(raster), 2);
        assert!(matches!(
            result,
            Err(PipelineError::Dimension(DimensionError::SmallerThanBlock { .. }))
        ));
    }

    #[test]
    fn load_source_reports_pre_truncation_dimensions() {
        let raster = Raster::from_fn(9, 7, 1, |_, _, _| 0).unwrap();
        let (truncated, decoded) = load_source(Source::Decoded(raster), 2).unwrap();
        assert_eq!(decoded, Dimensions::new(9, 7));
        assert_eq!(truncated.dimensions(), Dimensions::new(8, 6));
    }
}
