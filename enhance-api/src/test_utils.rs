//! Test utilities: deterministic enhancers, image fixtures and a ready-made test server.

use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;

use axum_test::TestServer;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage, imageops::FilterType};

use crate::config::Config;
use crate::inference::{EnhanceError, Enhancer};

/// Upscales with nearest-neighbour sampling. Deterministic, fast, no model needed.
#[derive(Debug, Clone)]
pub struct NearestEnhancer {
    factor: u32,
}

impl NearestEnhancer {
    pub fn new(factor: u32) -> Self {
        Self { factor }
    }
}

impl Enhancer for NearestEnhancer {
    fn name(&self) -> &str {
        "nearest"
    }

    fn scale_factor(&self) -> u32 {
        self.factor
    }

    fn enhance(&self, image: &DynamicImage) -> Result<DynamicImage, EnhanceError> {
        let rgb = image.to_rgb8();
        let (width, height) = rgb.dimensions();
        let resized = image::imageops::resize(&rgb, width * self.factor, height * self.factor, FilterType::Nearest);
        Ok(DynamicImage::ImageRgb8(resized))
    }
}

/// Always fails inference.
#[derive(Debug, Clone)]
pub struct FailingEnhancer;

impl Enhancer for FailingEnhancer {
    fn name(&self) -> &str {
        "failing"
    }

    fn scale_factor(&self) -> u32 {
        4
    }

    fn enhance(&self, _image: &DynamicImage) -> Result<DynamicImage, EnhanceError> {
        Err(EnhanceError::Inference("simulated failure".to_string()))
    }
}

/// Claims x4 but only doubles the image.
#[derive(Debug, Clone)]
pub struct WrongScaleEnhancer;

impl Enhancer for WrongScaleEnhancer {
    fn name(&self) -> &str {
        "wrong-scale"
    }

    fn scale_factor(&self) -> u32 {
        4
    }

    fn enhance(&self, image: &DynamicImage) -> Result<DynamicImage, EnhanceError> {
        NearestEnhancer::new(2).enhance(image)
    }
}

fn gradient(width: u32, height: u32) -> DynamicImage {
    DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |x, y| {
        Rgb([(x * 255 / width.max(1)) as u8, (y * 255 / height.max(1)) as u8, 128])
    }))
}

fn encode(image: &DynamicImage, format: ImageFormat) -> Vec<u8> {
    let mut bytes = Cursor::new(Vec::new());
    image.write_to(&mut bytes, format).expect("Failed to encode test image");
    bytes.into_inner()
}

pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    encode(&gradient(width, height), ImageFormat::Png)
}

pub fn jpeg_bytes(width: u32, height: u32) -> Vec<u8> {
    encode(&gradient(width, height), ImageFormat::Jpeg)
}

/// Config pointing all temp files at `temp_dir`. Startup validation is off since there is no
/// real model.
pub fn create_test_config(temp_dir: &Path) -> Config {
    let mut config = Config::default();
    config.host = "127.0.0.1".to_string();
    config.port = 0;
    config.storage.temp_dir = temp_dir.to_path_buf();
    config.model.validate_on_startup = false;
    config
}

pub async fn create_test_server_with(config: Config, enhancer: Arc<dyn Enhancer>) -> TestServer {
    crate::Application::with_enhancer(config, enhancer)
        .await
        .expect("Failed to create application")
        .into_test_server()
}

/// Test server backed by a x4 [`NearestEnhancer`].
pub async fn create_test_server(temp_dir: &Path) -> TestServer {
    create_test_server_with(create_test_config(temp_dir), Arc::new(NearestEnhancer::new(4))).await
}

/// Files currently in `dir`.
pub fn dir_entries(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .expect("Failed to read dir")
        .map(|entry| entry.expect("Failed to read entry").file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}
