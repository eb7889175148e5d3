use std::collections::HashMap;

use image::{GenericImageView, GrayImage, Luma};
use imageproc::contrast::otsu_level;
use imageproc::distance_transform::Norm;
use imageproc::morphology::{close, open};
use imageproc::region_labelling::{connected_components, Connectivity};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ai::payload::ImagePayload;
use crate::scan::types::{NormalizedBox, ProvisionalScan, COORDINATE_SCALE};

const MIN_CONTRAST: u8 = 16;

#[derive(Debug, Error)]
pub enum PrescanError {
    #[error("failed to decode image: {0}")]
    Decode(#[from] image::ImageError),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrescanConfig {
    /// Longest edge of the thumbnail the heuristic runs on.
    pub max_dimension: u32,
    /// Components whose bounding box covers less than this share of the frame are noise.
    pub min_area_ratio: f32,
    pub max_regions: u32,
}

impl Default for PrescanConfig {
    fn default() -> Self {
        Self {
            max_dimension: 256,
            min_area_ratio: 0.02,
            max_regions: 4,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct ComponentBounds {
    x0: u32,
    y0: u32,
    x1: u32,
    y1: u32,
}

impl ComponentBounds {
    fn area(&self) -> u64 {
        (self.x1 - self.x0) as u64 * (self.y1 - self.y0) as u64
    }
}

/// Cheap, network-free estimate of how many photos sit on a scan: Otsu
/// threshold on a thumbnail, morphological cleanup, then connected components.
/// Always yields between 1 and `max_regions` boxes.
pub fn estimate_regions(
    image: &ImagePayload,
    config: &PrescanConfig,
) -> Result<ProvisionalScan, PrescanError> {
    let decoded = image::load_from_memory(&image.data)?;
    let (width, height) = decoded.dimensions();
    if width == 0 || height == 0 {
        return Ok(full_frame());
    }

    let thumb = decoded.thumbnail(config.max_dimension.max(16), config.max_dimension.max(16));
    let gray = thumb.to_luma8();
    let mask = match foreground_mask(&gray) {
        Some(mask) => mask,
        None => return Ok(full_frame()),
    };

    let cleaned = close(&open(&mask, Norm::LInf, 1), Norm::LInf, 2);
    let labels = connected_components(&cleaned, Connectivity::Eight, Luma([0u8]));

    let mut components: HashMap<u32, ComponentBounds> = HashMap::new();
    for (x, y, label) in labels.enumerate_pixels() {
        let label = label[0];
        if label == 0 {
            continue;
        }
        components
            .entry(label)
            .and_modify(|current| {
                current.x0 = current.x0.min(x);
                current.y0 = current.y0.min(y);
                current.x1 = current.x1.max(x + 1);
                current.y1 = current.y1.max(y + 1);
            })
            .or_insert(ComponentBounds {
                x0: x,
                y0: y,
                x1: x + 1,
                y1: y + 1,
            });
    }

    let (thumb_w, thumb_h) = gray.dimensions();
    let frame_area = thumb_w as u64 * thumb_h as u64;
    let min_area = (frame_area as f64 * config.min_area_ratio.max(0.0) as f64).ceil() as u64;

    let mut kept: Vec<ComponentBounds> = components
        .into_values()
        .filter(|bounds| bounds.area() >= min_area.max(1))
        .collect();
    kept.sort_by(|a, b| {
        b.area()
            .cmp(&a.area())
            .then_with(|| a.y0.cmp(&b.y0))
            .then_with(|| a.x0.cmp(&b.x0))
    });
    kept.truncate(config.max_regions.max(1) as usize);

    let regions: Vec<NormalizedBox> = kept
        .iter()
        .filter_map(|bounds| normalize(bounds, thumb_w, thumb_h))
        .collect();
    if regions.is_empty() {
        return Ok(full_frame());
    }

    Ok(ProvisionalScan {
        count: regions.len() as u32,
        regions,
    })
}

fn foreground_mask(gray: &GrayImage) -> Option<GrayImage> {
    let (min, max) = gray
        .pixels()
        .fold((u8::MAX, u8::MIN), |(lo, hi), p| (lo.min(p[0]), hi.max(p[0])));
    if max.saturating_sub(min) < MIN_CONTRAST {
        return None;
    }
    let level = otsu_level(gray);
    // Scanner beds are brighter than the prints lying on them.
    Some(GrayImage::from_fn(gray.width(), gray.height(), |x, y| {
        if gray.get_pixel(x, y)[0] <= level {
            Luma([255u8])
        } else {
            Luma([0u8])
        }
    }))
}

fn normalize(bounds: &ComponentBounds, width: u32, height: u32) -> Option<NormalizedBox> {
    let scale = COORDINATE_SCALE as f64;
    NormalizedBox::from_model(
        bounds.x0 as f64 * scale / width as f64,
        bounds.y0 as f64 * scale / height as f64,
        bounds.x1 as f64 * scale / width as f64,
        bounds.y1 as f64 * scale / height as f64,
    )
}

fn full_frame() -> ProvisionalScan {
    ProvisionalScan {
        count: 1,
        regions: vec![NormalizedBox::full_frame()],
    }
}
