//! File-backed image sink.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use grayblock_export::{EncodeOptions, ExportError, OutputFormat};
use grayblock_pipeline::{ImageSink, OutputKind, Raster};
use tracing::info;

/// Errors from writing an output file.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    /// Encoding the image failed.
    #[error(transparent)]
    Encode(#[from] ExportError),

    /// Writing the encoded bytes failed.
    #[error("failed to write {}: {source}", path.display())]
    Write {
        /// Destination path.
        path: PathBuf,
        /// Underlying I/O error.
        source: io::Error,
    },
}

/// An output path together with the format its extension selects.
#[derive(Debug, Clone)]
pub struct Destination {
    path: PathBuf,
    format: OutputFormat,
}

impl Destination {
    /// Resolve the output format from `path`'s extension.
    ///
    /// # Errors
    ///
    /// Returns [`ExportError::UnrecognizedExtension`] if the extension is
    /// not png, jpg, jpeg, or bmp.
    pub fn new(path: &Path) -> Result<Self, ExportError> {
        let format = OutputFormat::from_path(path)
            .ok_or_else(|| ExportError::UnrecognizedExtension(path.to_path_buf()))?;
        Ok(Self {
            path: path.to_path_buf(),
            format,
        })
    }
}

/// Encodes each finished image and writes it to its destination path.
#[derive(Debug)]
pub struct FileSink {
    downsampled: Destination,
    grayscale: Destination,
    options: EncodeOptions,
}

impl FileSink {
    pub const fn new(
        downsampled: Destination,
        grayscale: Destination,
        options: EncodeOptions,
    ) -> Self {
        Self {
            downsampled,
            grayscale,
            options,
        }
    }
}

impl ImageSink for FileSink {
    type Error = SinkError;

    fn write(&self, output: OutputKind, image: &Raster) -> Result<(), SinkError> {
        let destination = match output {
            OutputKind::Downsampled => &self.downsampled,
            OutputKind::Grayscale => &self.grayscale,
        };
        let bytes = grayblock_export::encode(image, destination.format, &self.options)?;
        fs::write(&destination.path, &bytes).map_err(|source| SinkError::Write {
            path: destination.path.clone(),
            source,
        })?;
        info!(
            %output,
            format = %destination.format,
            path = %destination.path.display(),
            bytes = bytes.len(),
            "image written"
        );
        Ok(())
    }
}
