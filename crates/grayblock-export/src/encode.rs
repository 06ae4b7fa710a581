//! Raster encoding.

use std::path::PathBuf;

use grayblock_pipeline::Raster;
use image::codecs::bmp::BmpEncoder;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::{ExtendedColorType, ImageEncoder};

use crate::format::OutputFormat;

/// Errors that can occur while encoding an output image.
#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    /// The destination's extension names no supported format.
    #[error("unrecognized output extension for {}: expected png, jpg, jpeg, or bmp", .0.display())]
    UnrecognizedExtension(PathBuf),

    /// The JPEG quality is outside `1..=100`.
    #[error("JPEG quality must be between 1 and 100, got {0}")]
    InvalidQuality(u8),

    /// The raster has a channel layout no encoder accepts.
    #[error("cannot encode a {0}-channel image")]
    UnsupportedChannels(usize),

    /// The underlying encoder failed.
    #[error("image encoding failed: {0}")]
    Image(#[from] image::ImageError),
}

/// Encoder settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodeOptions {
    /// JPEG quality, `1..=100`. Ignored for lossless formats.
    pub jpeg_quality: u8,
}

impl EncodeOptions {
    /// Default JPEG quality: the least lossy setting.
    pub const DEFAULT_JPEG_QUALITY: u8 = 100;

    /// Check option ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ExportError::InvalidQuality`] for a JPEG quality outside
    /// `1..=100`.
    pub fn validate(&self) -> Result<(), ExportError> {
        if (1..=100).contains(&self.jpeg_quality) {
            Ok(())
        } else {
            Err(ExportError::InvalidQuality(self.jpeg_quality))
        }
    }
}

impl Default for EncodeOptions {
    fn default() -> Self {
        Self {
            jpeg_quality: Self::DEFAULT_JPEG_QUALITY,
        }
    }
}

const fn color_type(channels: usize) -> Option<ExtendedColorType> {
    match channels {
        1 => Some(ExtendedColorType::L8),
        2 => Some(ExtendedColorType::La8),
        3 => Some(ExtendedColorType::Rgb8),
        4 => Some(ExtendedColorType::Rgba8),
        _ => None,
    }
}

/// Strip the trailing alpha channel, keeping the color channels.
fn without_alpha(raster: &Raster) -> (Vec<u8>, usize) {
    let channels = raster.channels();
    let kept = channels - 1;
    let pixels = raster
        .pixels()
        .chunks_exact(channels)
        .flat_map(|pixel| &pixel[..kept])
        .copied()
        .collect();
    (pixels, kept)
}

/// Encode `raster` in `format`.
///
/// JPEG has no alpha channel, so luma+alpha and RGBA rasters lose their
/// alpha when written as JPEG. PNG and BMP keep every channel.
///
/// # Errors
///
/// Returns [`ExportError::InvalidQuality`] for an out-of-range JPEG
/// quality and [`ExportError::Image`] if the encoder fails.
pub fn encode(
    raster: &Raster,
    format: OutputFormat,
    options: &EncodeOptions,
) -> Result<Vec<u8>, ExportError> {
    options.validate()?;

    let (width, height) = (raster.width(), raster.height());
    let mut buf = Vec::new();

    match format {
        OutputFormat::Png => {
            let color = color_type(raster.channels())
                .ok_or(ExportError::UnsupportedChannels(raster.channels()))?;
            PngEncoder::new(&mut buf).write_image(raster.pixels(), width, height, color)?;
        }
        OutputFormat::Bmp => {
            let color = color_type(raster.channels())
                .ok_or(ExportError::UnsupportedChannels(raster.channels()))?;
            BmpEncoder::new(&mut buf).write_image(raster.pixels(), width, height, color)?;
        }
        OutputFormat::Jpeg => {
            let encoder = JpegEncoder::new_with_quality(&mut buf, options.jpeg_quality);
            if matches!(raster.channels(), 2 | 4) {
                let (pixels, channels) = without_alpha(raster);
                let color = color_type(channels)
                    .ok_or(ExportError::UnsupportedChannels(channels))?;
                encoder.write_image(&pixels, width, height, color)?;
            } else {
                let color = color_type(raster.channels())
                    .ok_or(ExportError::UnsupportedChannels(raster.channels()))?;
                encoder.write_image(raster.pixels(), width, height, color)?;
            }
        }
    }

    Ok(buf)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn default_quality_is_lossless_setting() {
        assert_eq!(EncodeOptions::default().jpeg_quality, 100);
        assert!(EncodeOptions::default().validate().is_ok());
    }

    #[test]
    fn zero_quality_is_rejected() {
        let raster = Raster::new(1, 1, 1, vec![0]).unwrap();
        let options = EncodeOptions { jpeg_quality: 0 };
        assert!(matches!(
            encode(&raster, OutputFormat::Jpeg, &options),
            Err(ExportError::InvalidQuality(0))
        ));
    }

    #[test]
    fn alpha_is_stripped_for_jpeg() {
        let raster = Raster::new(2, 1, 4, vec![1, 2, 3, 255, 4, 5, 6, 0]).unwrap();
        let (pixels, channels) = without_alpha(&raster);
        assert_eq!(channels, 3);
        assert_eq!(pixels, vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn png_signature() {
        let raster = Raster::new(2, 2, 1, vec![0, 64, 128, 255]).unwrap();
        let bytes = encode(&raster, OutputFormat::Png, &EncodeOptions::default()).unwrap();
        assert!(bytes.starts_with(b"\x89PNG\r\n\x1a\n"));
    }

    #[test]
    fn bmp_signature() {
        let raster = Raster::new(2, 2, 3, vec![9; 12]).unwrap();
        let bytes = encode(&raster, OutputFormat::Bmp, &EncodeOptions::default()).unwrap();
        assert!(bytes.starts_with(b"BM"));
    }

    #[test]
    fn jpeg_signature() {
        let raster = Raster::new(2, 2, 2, vec![50, 255, 60, 255, 70, 255, 80, 255]).unwrap();
        let bytes = encode(&raster, OutputFormat::Jpeg, &EncodeOptions::default()).unwrap();
        assert!(bytes.starts_with(&[0xFF, 0xD8]));
    }
}
