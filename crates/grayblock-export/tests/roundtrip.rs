//! Integration test: reduce an image through the pipeline and encode both
//! outputs in every supported format.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::time::{Duration, Instant};

use grayblock_export::{EncodeOptions, OutputFormat, encode};
use grayblock_pipeline::{
    Clock, ExecutionMode, MemorySink, OutputKind, Raster, ReduceConfig, Source, reduce,
};

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

fn reduced_outputs() -> (Raster, Raster) {
    let source = Raster::from_fn(32, 16, 3, |x, y, c| {
        u8::try_from((x * 8 + y * 4) as usize % 256 + c).unwrap_or(u8::MAX)
    })
    .unwrap();
    let config = ReduceConfig {
        workers: 4,
        mode: ExecutionMode::Workers,
        ..ReduceConfig::default()
    };
    let sink = MemorySink::new();
    reduce(Source::Decoded(source), &config, &sink, &StdClock).expect("reduction should succeed");
    (
        sink.get(OutputKind::Downsampled).unwrap(),
        sink.get(OutputKind::Grayscale).unwrap(),
    )
}

#[test]
fn lossless_formats_preserve_pixels() {
    let (downsampled, grayscale) = reduced_outputs();
    for format in [OutputFormat::Png, OutputFormat::Bmp] {
        let bytes = encode(&downsampled, format, &EncodeOptions::default()).unwrap();
        let decoded = image::load_from_memory_with_format(&bytes, format.image_format())
            .unwrap()
            .into_rgb8();
        assert_eq!(decoded.dimensions(), (16, 8), "{format}");
        assert_eq!(decoded.as_raw(), downsampled.pixels(), "{format}");

        let bytes = encode(&grayscale, format, &EncodeOptions::default()).unwrap();
        let decoded = image::load_from_memory_with_format(&bytes, format.image_format())
            .unwrap()
            .into_luma8();
        assert_eq!(decoded.as_raw(), grayscale.pixels(), "{format}");
    }
}

#[test]
fn jpeg_stays_close_to_source() {
    let (_, grayscale) = reduced_outputs();
    let bytes = encode(&grayscale, OutputFormat::Jpeg, &EncodeOptions::default()).unwrap();
    let decoded = image::load_from_memory_with_format(&bytes, image::ImageFormat::Jpeg)
        .unwrap()
        .into_luma8();
    assert_eq!(decoded.dimensions(), (16, 8));

    let max_error = decoded
        .as_raw()
        .iter()
        .zip(grayscale.pixels())
        .map(|(&a, &b)| a.abs_diff(b))
        .max()
        .unwrap();
    assert!(max_error <= 8, "JPEG error {max_error} at quality 100");
}

#[test]
fn every_format_matches_its_extension() {
    for format in OutputFormat::ALL {
        let path = std::path::PathBuf::from(format!("out.{}", format.extension()));
        assert_eq!(OutputFormat::from_path(&path), Some(format));
    }
}
