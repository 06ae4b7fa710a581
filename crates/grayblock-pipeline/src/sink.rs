//! Output sinks.
//!
//! The pipeline never touches the filesystem. Finished images are handed
//! to an [`ImageSink`], which decides how to serialize and where to put
//! them. The binary supplies a file-backed sink; tests use
//! [`MemorySink`].

use std::convert::Infallible;
use std::sync::{Mutex, PoisonError};

use crate::raster::Raster;
use crate::types::{OutputKind, PipelineError};

/// Destination for the two reduced images.
///
/// Called only by the loader/writer, after every worker has finished.
pub trait ImageSink: Sync {
    /// Error produced when an image cannot be written.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Persist one finished image.
    ///
    /// # Errors
    ///
    /// Implementation-defined.
    fn write(&self, output: OutputKind, image: &Raster) -> Result<(), Self::Error>;
}

impl<S: ImageSink> ImageSink for &S {
    type Error = S::Error;

    fn write(&self, output: OutputKind, image: &Raster) -> Result<(), Self::Error> {
        (**self).write(output, image)
    }
}

/// Sink that keeps every written image in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    images: Mutex<Vec<(OutputKind, Raster)>>,
}

impl MemorySink {
    /// An empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything written so far, in write order.
    #[must_use]
    pub fn into_images(self) -> Vec<(OutputKind, Raster)> {
        self.images
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// The most recently written image of kind `output`.
    #[must_use]
    pub fn get(&self, output: OutputKind) -> Option<Raster> {
        self.images
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .rev()
            .find(|(kind, _)| *kind == output)
            .map(|(_, image)| image.clone())
    }

    /// Number of images written.
    #[must_use]
    pub fn len(&self) -> usize {
        self.images
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Returns `true` if nothing has been written.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ImageSink for MemorySink {
    type Error = Infallible;

    fn write(&self, output: OutputKind, image: &Raster) -> Result<(), Infallible> {
        self.images
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((output, image.clone()));
        Ok(())
    }
}

/// Write the downsampled image, then the grayscale image.
///
/// # Errors
///
/// Returns [`PipelineError::Encode`] naming the image that failed. The
/// grayscale image is not attempted if the downsampled one fails.
pub fn write_outputs<S: ImageSink>(
    sink: &S,
    downsampled: &Raster,
    grayscale: &Raster,
) -> Result<(), PipelineError> {
    for (output, image) in [
        (OutputKind::Downsampled, downsampled),
        (OutputKind::Grayscale, grayscale),
    ] {
        sink.write(output, image)
            .map_err(|source| PipelineError::Encode {
                output,
                source: Box::new(source),
            })?;
    }
    Ok(())
}
