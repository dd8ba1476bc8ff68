//! BSRGAN x4 executed with ONNX Runtime.
//!
//! The network is the RRDB generator (`in_nc=3, out_nc=3, nf=64, nb=23`) exported to ONNX with
//! dynamic spatial axes. It takes an NCHW `f32` tensor in `[0, 1]` with RGB channel order and
//! returns the same layout at four times the spatial size.

use std::fmt::Display;
use std::fs::File;
use std::path::Path;
use std::sync::Mutex;

use image::{DynamicImage, RgbImage};
use ndarray::Array4;
use ort::execution_providers::{CUDAExecutionProvider, ExecutionProvider};
use ort::session::{Session, builder::GraphOptimizationLevel, builder::SessionBuilder};
use tracing::{info, instrument, warn};

use super::{EnhanceError, Enhancer};
use crate::config::{Device, ModelConfig};

/// The production [`Enhancer`]: one ONNX Runtime session shared by every request.
pub struct OnnxEnhancer {
    /// Runs need exclusive access to the session
    session: Mutex<Session>,
    input_name: String,
    scale_factor: u32,
    label: String,
}

impl std::fmt::Debug for OnnxEnhancer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OnnxEnhancer")
            .field("input_name", &self.input_name)
            .field("scale_factor", &self.scale_factor)
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

impl OnnxEnhancer {
    /// Builds the session from `config.path`.
    ///
    /// Fails if the weights are missing, the checksum does not match, the requested device cannot
    /// be registered or ONNX Runtime rejects the model. This is blocking and can take seconds.
    #[instrument(skip_all, fields(path = %config.path.display(), device = ?config.device))]
    pub fn load(config: &ModelConfig) -> Result<Self, EnhanceError> {
        if !config.path.is_file() {
            return Err(EnhanceError::ModelNotFound { path: config.path.clone() });
        }

        if let Some(expected) = &config.checksum {
            verify_checksum(&config.path, expected)?;
        }

        let (builder, device) = session_builder(config)?;
        let session = builder.commit_from_file(&config.path).map_err(session_error)?;

        let input_name = session.inputs.first().map_or_else(|| "input".to_string(), |i| i.name.clone());
        let label = format!("bsrgan-x{} ({device})", config.scale_factor);
        info!(model = %label, input = %input_name, "Inference session ready");

        Ok(Self {
            session: Mutex::new(session),
            input_name,
            scale_factor: config.scale_factor,
            label,
        })
    }
}

impl Enhancer for OnnxEnhancer {
    fn name(&self) -> &str {
        &self.label
    }

    fn scale_factor(&self) -> u32 {
        self.scale_factor
    }

    fn enhance(&self, image: &DynamicImage) -> Result<DynamicImage, EnhanceError> {
        let input = preprocess_image(image);
        let input_ref = ort::value::TensorRef::from_array_view(&input).map_err(|e| EnhanceError::Inference(e.to_string()))?;

        let mut session = self.session.lock().map_err(|_| EnhanceError::LockPoisoned)?;
        let outputs = session
            .run(ort::inputs![self.input_name.as_str() => input_ref])
            .map_err(|e| EnhanceError::Inference(e.to_string()))?;

        let (_, output) = outputs
            .iter()
            .next()
            .ok_or_else(|| EnhanceError::Postprocessing("model produced no output".to_string()))?;
        let (shape, data) = output
            .try_extract_tensor::<f32>()
            .map_err(|e| EnhanceError::Postprocessing(e.to_string()))?;

        postprocess_output(shape, data)
    }
}

/// Picks execution providers for `config.device`. Returns the builder and a label for logs.
fn session_builder(config: &ModelConfig) -> Result<(SessionBuilder, &'static str), EnhanceError> {
    let mut builder = Session::builder()
        .map_err(session_error)?
        .with_optimization_level(GraphOptimizationLevel::Level3)
        .map_err(session_error)?;

    if let Some(threads) = config.intra_threads {
        builder = builder.with_intra_threads(threads).map_err(session_error)?;
    }

    let cuda = CUDAExecutionProvider::default();
    let device = match config.device {
        Device::Cpu => "cpu",
        Device::Cuda => {
            builder = builder
                .with_execution_providers([cuda.build().error_on_failure()])
                .map_err(session_error)?;
            "cuda"
        }
        Device::Auto => match cuda.is_available() {
            Ok(true) => {
                builder = builder.with_execution_providers([cuda.build()]).map_err(session_error)?;
                "cuda"
            }
            Ok(false) => "cpu",
            Err(e) => {
                warn!(error = %e, "Could not query CUDA availability, using CPU");
                "cpu"
            }
        },
    };

    Ok((builder, device))
}

fn session_error(e: impl Display) -> EnhanceError {
    EnhanceError::SessionInit(e.to_string())
}

/// Compares the BLAKE3 digest of the weight file with `expected` (hex, any case).
pub fn verify_checksum(path: &Path, expected: &str) -> Result<(), EnhanceError> {
    let actual = file_checksum(path)?;
    if !actual.eq_ignore_ascii_case(expected.trim()) {
        return Err(EnhanceError::ChecksumMismatch {
            expected: expected.to_string(),
            actual,
        });
    }
    Ok(())
}

/// BLAKE3 hex digest of a file, streamed so large weights are never held in memory.
pub fn file_checksum(path: &Path) -> Result<String, EnhanceError> {
    let mut hasher = blake3::Hasher::new();
    hasher.update_reader(File::open(path)?)?;
    Ok(hasher.finalize().to_hex().to_string())
}

/// Converts an image into the NCHW `[1, 3, H, W]` tensor the network expects.
///
/// Alpha is dropped, channels are RGB, values are scaled to `[0, 1]`.
pub fn preprocess_image(image: &DynamicImage) -> Array4<f32> {
    let rgb = image.to_rgb8();
    let (width, height) = rgb.dimensions();
    let mut tensor = Array4::<f32>::zeros((1, 3, height as usize, width as usize));

    for (x, y, pixel) in rgb.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        for (channel, value) in pixel.0.iter().enumerate() {
            tensor[[0, channel, y, x]] = f32::from(*value) / 255.0;
        }
    }

    tensor
}

/// Converts an NCHW output tensor back to an RGB image.
///
/// Values are clamped to `[0, 1]` and rounded to the nearest byte. This deliberately differs from
/// the truncating `mul(255).byte()` conversion of the PyTorch pipeline, so a tensor built by
/// [`preprocess_image`] maps back to exactly the bytes it came from.
pub fn postprocess_output(shape: &[i64], data: &[f32]) -> Result<DynamicImage, EnhanceError> {
    let [_, channels, height, width] = shape else {
        return Err(EnhanceError::Postprocessing(format!("expected a 4D tensor, got {}D", shape.len())));
    };
    if *channels != 3 {
        return Err(EnhanceError::Postprocessing(format!("expected 3 channels, got {channels}")));
    }

    let dimension = |value: i64, what: &str| {
        u32::try_from(value).map_err(|_| EnhanceError::Postprocessing(format!("invalid tensor {what}: {value}")))
    };
    let (width, height) = (dimension(*width, "width")?, dimension(*height, "height")?);

    let plane = width as usize * height as usize;
    if data.len() < 3 * plane {
        return Err(EnhanceError::Postprocessing(format!(
            "tensor holds {} values, expected {}",
            data.len(),
            3 * plane
        )));
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let to_byte = |value: f32| (value.clamp(0.0, 1.0) * 255.0).round() as u8;

    let mut pixels = Vec::with_capacity(3 * plane);
    for idx in 0..plane {
        pixels.extend([to_byte(data[idx]), to_byte(data[plane + idx]), to_byte(data[2 * plane + idx])]);
    }

    RgbImage::from_raw(width, height, pixels)
        .map(DynamicImage::ImageRgb8)
        .ok_or_else(|| EnhanceError::Postprocessing("pixel buffer does not match dimensions".to_string()))
}
