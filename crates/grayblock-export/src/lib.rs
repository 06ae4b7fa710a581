//! grayblock-export: image encoders for reduced outputs (sans-IO).
//!
//! Serializes a [`Raster`](grayblock_pipeline::Raster) into PNG, JPEG, or
//! BMP bytes. The output format is chosen from the destination path's
//! extension; writing the bytes is left to the caller.

pub mod encode;
pub mod format;

pub use encode::{EncodeOptions, ExportError, encode};
pub use format::OutputFormat;
