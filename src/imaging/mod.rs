//! Local raster work: the fast pre-scan heuristic and the crop extractor.

pub mod crop;
pub mod prescan;

pub use crop::{CropError, CropExtractor, ImageCropExtractor};
pub use prescan::{estimate_regions, PrescanConfig, PrescanError};
