//! Super-resolution inference.
//!
//! The service talks to the network through the [`Enhancer`] trait. [`onnx::OnnxEnhancer`] is the
//! production adapter (BSRGAN exported to ONNX, executed with ONNX Runtime); tests swap in
//! deterministic in-process adapters. [`pipeline`] holds the file-to-file flow that the upload
//! handler drives.

pub mod onnx;
pub mod pipeline;

use image::DynamicImage;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while loading a model or enhancing an image.
#[derive(Debug, Error)]
pub enum EnhanceError {
    #[error("model weights not found at {}", path.display())]
    ModelNotFound { path: PathBuf },

    #[error("model checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("failed to initialise inference session: {0}")]
    SessionInit(String),

    #[error("failed to decode input image: {0}")]
    Decode(String),

    #[error("failed to encode output image: {0}")]
    Encode(String),

    #[error("inference failed: {0}")]
    Inference(String),

    #[error("failed to convert network output: {0}")]
    Postprocessing(String),

    #[error("unexpected output size {actual_width}x{actual_height}, expected {expected_width}x{expected_height}")]
    UnexpectedScale {
        expected_width: u32,
        expected_height: u32,
        actual_width: u32,
        actual_height: u32,
    },

    #[error("inference session lock poisoned")]
    LockPoisoned,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A super-resolution model.
///
/// Implementations must be safe to share across request tasks. `enhance` is blocking and is
/// always called from tokio's blocking pool.
pub trait Enhancer: Send + Sync {
    /// Short label used in logs, e.g. `"bsrgan-x4 (cpu)"`.
    fn name(&self) -> &str;

    /// Fixed upscale factor the model applies to both dimensions.
    fn scale_factor(&self) -> u32;

    /// Runs one forward pass over `image` and returns the upscaled RGB image.
    fn enhance(&self, image: &DynamicImage) -> Result<DynamicImage, EnhanceError>;
}
