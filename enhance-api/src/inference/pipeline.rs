//! File-to-file enhancement: decode, one forward pass, check the scale, save as PNG.

use std::path::{Path, PathBuf};

use image::{DynamicImage, ImageFormat, ImageReader, Rgb, RgbImage};
use tracing::{debug, instrument};

use super::{EnhanceError, Enhancer};
use crate::storage::output_path;

/// Side of the grey square used for the warm-up inference.
const VALIDATION_SIZE: u32 = 64;

/// Enhances the image at `input` and writes the result next to it.
///
/// The format is sniffed from the content, with the extension as fallback. The output path is
/// derived with [`output_path`] and is always a PNG. Returns that path on success; on failure no
/// output file is left behind.
#[instrument(skip(enhancer), fields(model = enhancer.name()))]
pub fn enhance_file(enhancer: &dyn Enhancer, input: &Path, suffix: &str) -> Result<PathBuf, EnhanceError> {
    let image = ImageReader::open(input)?
        .with_guessed_format()?
        .decode()
        .map_err(|e| EnhanceError::Decode(e.to_string()))?;
    debug!(width = image.width(), height = image.height(), "Decoded input");

    let enhanced = enhance_checked(enhancer, &image)?;

    let output = output_path(input, suffix);
    enhanced.save_with_format(&output, ImageFormat::Png).map_err(|e| {
        crate::storage::remove_quietly(&output);
        EnhanceError::Encode(e.to_string())
    })?;
    debug!(output = %output.display(), width = enhanced.width(), height = enhanced.height(), "Saved enhanced image");

    Ok(output)
}

/// Runs the enhancer and verifies the output is exactly `scale_factor` times the input.
pub fn enhance_checked(enhancer: &dyn Enhancer, image: &DynamicImage) -> Result<DynamicImage, EnhanceError> {
    let enhanced = enhancer.enhance(image)?;

    let factor = enhancer.scale_factor();
    let (expected_width, expected_height) = (image.width() * factor, image.height() * factor);
    if enhanced.width() != expected_width || enhanced.height() != expected_height {
        return Err(EnhanceError::UnexpectedScale {
            expected_width,
            expected_height,
            actual_width: enhanced.width(),
            actual_height: enhanced.height(),
        });
    }

    Ok(enhanced)
}

/// Warm-up check: enhances a 64x64 grey image and verifies the output size.
pub fn validate_model(enhancer: &dyn Enhancer) -> Result<(), EnhanceError> {
    let sample = DynamicImage::ImageRgb8(RgbImage::from_pixel(VALIDATION_SIZE, VALIDATION_SIZE, Rgb([128, 128, 128])));
    enhance_checked(enhancer, &sample).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{FailingEnhancer, NearestEnhancer, WrongScaleEnhancer, jpeg_bytes, png_bytes};

    #[test]
    fn test_output_is_scaled_png_next_to_input() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("temp_abc.jpg");
        std::fs::write(&input, jpeg_bytes(12, 7)).unwrap();

        let output = enhance_file(&NearestEnhancer::new(4), &input, "_enhanced").unwrap();

        assert_eq!(output, dir.path().join("temp_abc_enhanced.png"));
        let bytes = std::fs::read(&output).unwrap();
        assert_eq!(image::guess_format(&bytes).unwrap(), ImageFormat::Png);
        let decoded = image::load_from_memory(&bytes).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (48, 28));
    }

    #[test]
    fn test_format_sniffed_from_content() {
        let dir = tempfile::tempdir().unwrap();
        // PNG bytes behind a .jpg name
        let input = dir.path().join("temp_mislabelled.JPG");
        std::fs::write(&input, png_bytes(5, 5)).unwrap();

        let output = enhance_file(&NearestEnhancer::new(2), &input, "_enhanced").unwrap();

        let decoded = image::open(&output).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (10, 10));
    }

    #[test]
    fn test_enhancing_twice_is_identical() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("temp_same.png");
        std::fs::write(&input, png_bytes(9, 6)).unwrap();
        let enhancer = NearestEnhancer::new(4);

        let first = std::fs::read(enhance_file(&enhancer, &input, "_a").unwrap()).unwrap();
        let second = std::fs::read(enhance_file(&enhancer, &input, "_b").unwrap()).unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn test_garbage_input_is_decode_error() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("temp_bad.png");
        std::fs::write(&input, b"definitely not an image").unwrap();

        let err = enhance_file(&NearestEnhancer::new(4), &input, "_enhanced").unwrap_err();

        assert!(matches!(err, EnhanceError::Decode(_)));
        assert!(!dir.path().join("temp_bad_enhanced.png").exists());
    }

    #[test]
    fn test_missing_input_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = enhance_file(&NearestEnhancer::new(4), &dir.path().join("gone.png"), "_enhanced").unwrap_err();
        assert!(matches!(err, EnhanceError::Io(_)));
    }

    #[test]
    fn test_wrong_scale_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("temp_x.png");
        std::fs::write(&input, png_bytes(4, 4)).unwrap();

        let err = enhance_file(&WrongScaleEnhancer, &input, "_enhanced").unwrap_err();

        assert!(matches!(
            err,
            EnhanceError::UnexpectedScale {
                expected_width: 16,
                actual_width: 8,
                ..
            }
        ));
        assert!(!dir.path().join("temp_x_enhanced.png").exists());
    }

    #[test]
    fn test_inference_error_propagates() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("temp_y.png");
        std::fs::write(&input, png_bytes(4, 4)).unwrap();

        let err = enhance_file(&FailingEnhancer, &input, "_enhanced").unwrap_err();
        assert!(matches!(err, EnhanceError::Inference(_)));
    }

    #[test]
    fn test_validate_model() {
        assert!(validate_model(&NearestEnhancer::new(4)).is_ok());
        assert!(validate_model(&WrongScaleEnhancer).is_err());
        assert!(validate_model(&FailingEnhancer).is_err());
    }
}
