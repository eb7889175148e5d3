use std::io::Cursor;
use std::sync::Arc;

use async_trait::async_trait;
use image::{DynamicImage, GenericImageView, ImageFormat};
use thiserror::Error;

use crate::ai::payload::ImagePayload;
use crate::scan::types::{DetectedRegion, Rotation};

pub const DEFAULT_TRIM_RATIO: f32 = 0.01;

#[derive(Debug, Error)]
pub enum CropError {
    #[error("failed to decode source image: {0}")]
    Decode(image::ImageError),
    #[error("region {0} is empty after trimming")]
    EmptyRegion(String),
    #[error("failed to encode crop: {0}")]
    Encode(image::ImageError),
    #[error("crop worker stopped: {0}")]
    Worker(String),
}

impl From<tokio::task::JoinError> for CropError {
    fn from(value: tokio::task::JoinError) -> Self {
        CropError::Worker(value.to_string())
    }
}

/// A scan decoded once and shared by every region cut from it.
#[derive(Debug, Clone)]
pub struct DecodedScan {
    pub pixels: Arc<DynamicImage>,
    pub mime_type: String,
}

/// Turns a detected region of a scan into a standalone encoded image.
#[async_trait]
pub trait CropExtractor: Send + Sync {
    async fn decode(&self, source: Arc<ImagePayload>) -> Result<DecodedScan, CropError>;

    async fn extract(
        &self,
        source: &DecodedScan,
        region: &DetectedRegion,
    ) -> Result<ImagePayload, CropError>;
}

/// Crops with the `image` crate: maps the normalized box to pixels, trims a
/// fixed share of each edge to drop scanner-bed slivers, then rotates upright.
#[derive(Debug, Clone, Copy)]
pub struct ImageCropExtractor {
    trim_ratio: f32,
}

impl Default for ImageCropExtractor {
    fn default() -> Self {
        Self::new(DEFAULT_TRIM_RATIO)
    }
}

impl ImageCropExtractor {
    pub fn new(trim_ratio: f32) -> Self {
        Self {
            trim_ratio: trim_ratio.clamp(0.0, 0.45),
        }
    }

    pub fn crop_decoded(
        &self,
        image: &DynamicImage,
        region: &DetectedRegion,
    ) -> Result<DynamicImage, CropError> {
        let (width, height) = image.dimensions();
        let (x0, y0, x1, y1) = region.bbox.to_pixels(width, height);
        if x1 <= x0 || y1 <= y0 {
            return Err(CropError::EmptyRegion(region.id.clone()));
        }

        let trim_x = ((x1 - x0) as f32 * self.trim_ratio).floor() as u32;
        let trim_y = ((y1 - y0) as f32 * self.trim_ratio).floor() as u32;
        let (x0, x1) = (x0 + trim_x, x1 - trim_x);
        let (y0, y1) = (y0 + trim_y, y1 - trim_y);
        if x1 <= x0 || y1 <= y0 {
            return Err(CropError::EmptyRegion(region.id.clone()));
        }

        let cropped = image.crop_imm(x0, y0, x1 - x0, y1 - y0);
        Ok(match region.rotation {
            Rotation::Upright => cropped,
            Rotation::Quarter => cropped.rotate90(),
            Rotation::Half => cropped.rotate180(),
            Rotation::ThreeQuarter => cropped.rotate270(),
        })
    }
}

// Decoding and encoding are CPU-bound, so both run on the blocking pool.
#[async_trait]
impl CropExtractor for ImageCropExtractor {
    async fn decode(&self, source: Arc<ImagePayload>) -> Result<DecodedScan, CropError> {
        let mime_type = source.mime_type.clone();
        let pixels = tokio::task::spawn_blocking(move || image::load_from_memory(&source.data))
            .await?
            .map_err(CropError::Decode)?;
        Ok(DecodedScan {
            pixels: Arc::new(pixels),
            mime_type,
        })
    }

    async fn extract(
        &self,
        source: &DecodedScan,
        region: &DetectedRegion,
    ) -> Result<ImagePayload, CropError> {
        let extractor = *self;
        let source = source.clone();
        let region = region.clone();
        tokio::task::spawn_blocking(move || {
            let cropped = extractor.crop_decoded(&source.pixels, &region)?;
            encode_like(&cropped, &source.mime_type)
        })
        .await?
    }
}

/// Encodes in the source format when it is one we can write losslessly or as
/// JPEG; anything else becomes PNG.
pub fn encode_like(image: &DynamicImage, mime_type: &str) -> Result<ImagePayload, CropError> {
    let format = match ImageFormat::from_mime_type(mime_type) {
        Some(ImageFormat::Jpeg) => ImageFormat::Jpeg,
        _ => ImageFormat::Png,
    };
    let mut bytes = Vec::new();
    let result = if format == ImageFormat::Jpeg {
        DynamicImage::ImageRgb8(image.to_rgb8()).write_to(&mut Cursor::new(&mut bytes), format)
    } else {
        image.write_to(&mut Cursor::new(&mut bytes), format)
    };
    result.map_err(CropError::Encode)?;
    Ok(ImagePayload::new(
        format.to_mime_type().to_string(),
        bytes,
    ))
}
