use serde::{Deserialize, Serialize};

use crate::ai::payload::ImagePayload;

/// Upper bound of the normalized coordinate space shared with the vision model.
pub const COORDINATE_SCALE: u16 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScanStatus {
    Uploading,
    PendingVerification,
    Detecting,
    Cropped,
    Restoring,
    Restored,
    Error,
}

impl ScanStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ScanStatus::Restored)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ScanStatus::Uploading => "UPLOADING",
            ScanStatus::PendingVerification => "PENDING_VERIFICATION",
            ScanStatus::Detecting => "DETECTING",
            ScanStatus::Cropped => "CROPPED",
            ScanStatus::Restoring => "RESTORING",
            ScanStatus::Restored => "RESTORED",
            ScanStatus::Error => "ERROR",
        }
    }
}

impl std::fmt::Display for ScanStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Clockwise rotation needed to bring a detected photo upright.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub enum Rotation {
    #[default]
    Upright,
    Quarter,
    Half,
    ThreeQuarter,
}

impl Rotation {
    pub fn degrees(self) -> u16 {
        match self {
            Rotation::Upright => 0,
            Rotation::Quarter => 90,
            Rotation::Half => 180,
            Rotation::ThreeQuarter => 270,
        }
    }

    /// Accepts any multiple of 90, including negative angles and full turns.
    pub fn from_degrees(degrees: i64) -> Option<Self> {
        if degrees % 90 != 0 {
            return None;
        }
        match degrees.rem_euclid(360) {
            0 => Some(Rotation::Upright),
            90 => Some(Rotation::Quarter),
            180 => Some(Rotation::Half),
            270 => Some(Rotation::ThreeQuarter),
            _ => None,
        }
    }

    /// Snaps an arbitrary model-reported angle to the closest quarter turn.
    pub fn nearest(degrees: f64) -> Self {
        if !degrees.is_finite() {
            return Rotation::Upright;
        }
        // reduce in floating point; huge angles would overflow as integers
        match (degrees / 90.0).round().rem_euclid(4.0) as u8 {
            1 => Rotation::Quarter,
            2 => Rotation::Half,
            3 => Rotation::ThreeQuarter,
            _ => Rotation::Upright,
        }
    }
}

impl TryFrom<u16> for Rotation {
    type Error = String;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Rotation::Upright),
            90 => Ok(Rotation::Quarter),
            180 => Ok(Rotation::Half),
            270 => Ok(Rotation::ThreeQuarter),
            other => Err(format!("rotation must be 0, 90, 180 or 270, got {}", other)),
        }
    }
}

impl From<Rotation> for u16 {
    fn from(value: Rotation) -> Self {
        value.degrees()
    }
}

/// Bounding box in the 0..=1000 coordinate space. Construction guarantees
/// `xmin < xmax`, `ymin < ymax` and all coordinates within range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawBox")]
pub struct NormalizedBox {
    xmin: u16,
    ymin: u16,
    xmax: u16,
    ymax: u16,
}

#[derive(Deserialize)]
struct RawBox {
    xmin: u16,
    ymin: u16,
    xmax: u16,
    ymax: u16,
}

impl TryFrom<RawBox> for NormalizedBox {
    type Error = String;

    fn try_from(raw: RawBox) -> Result<Self, Self::Error> {
        NormalizedBox::new(raw.xmin, raw.ymin, raw.xmax, raw.ymax).ok_or_else(|| {
            format!(
                "invalid box [{}, {}, {}, {}]",
                raw.xmin, raw.ymin, raw.xmax, raw.ymax
            )
        })
    }
}

impl NormalizedBox {
    pub fn new(xmin: u16, ymin: u16, xmax: u16, ymax: u16) -> Option<Self> {
        let in_range = xmax <= COORDINATE_SCALE && ymax <= COORDINATE_SCALE;
        if in_range && xmin < xmax && ymin < ymax {
            Some(Self {
                xmin,
                ymin,
                xmax,
                ymax,
            })
        } else {
            None
        }
    }

    /// Builds a box from untrusted model output: clamps into range, orders each
    /// axis and rejects boxes that collapse to zero width or height.
    pub fn from_model(xmin: f64, ymin: f64, xmax: f64, ymax: f64) -> Option<Self> {
        let clamp = |value: f64| -> Option<u16> {
            if !value.is_finite() {
                return None;
            }
            Some(value.round().clamp(0.0, COORDINATE_SCALE as f64) as u16)
        };
        let (x0, x1) = (clamp(xmin)?, clamp(xmax)?);
        let (y0, y1) = (clamp(ymin)?, clamp(ymax)?);
        Self::new(x0.min(x1), y0.min(y1), x0.max(x1), y0.max(y1))
    }

    pub fn full_frame() -> Self {
        Self {
            xmin: 0,
            ymin: 0,
            xmax: COORDINATE_SCALE,
            ymax: COORDINATE_SCALE,
        }
    }

    pub fn xmin(&self) -> u16 {
        self.xmin
    }

    pub fn ymin(&self) -> u16 {
        self.ymin
    }

    pub fn xmax(&self) -> u16 {
        self.xmax
    }

    pub fn ymax(&self) -> u16 {
        self.ymax
    }

    pub fn width(&self) -> u16 {
        self.xmax - self.xmin
    }

    pub fn height(&self) -> u16 {
        self.ymax - self.ymin
    }

    pub fn area(&self) -> u32 {
        self.width() as u32 * self.height() as u32
    }

    /// Maps the box onto a `width` x `height` raster as `(x0, y0, x1, y1)`,
    /// half-open on the right and bottom edges.
    pub fn to_pixels(&self, width: u32, height: u32) -> (u32, u32, u32, u32) {
        let scale = COORDINATE_SCALE as u64;
        let map = |value: u16, extent: u32| -> u32 {
            ((value as u64 * extent as u64) / scale).min(extent as u64) as u32
        };
        (
            map(self.xmin, width),
            map(self.ymin, height),
            map(self.xmax, width),
            map(self.ymax, height),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectedRegion {
    pub id: String,
    pub label: String,
    pub confidence: f32,
    #[serde(rename = "box")]
    pub bbox: NormalizedBox,
    pub rotation: Rotation,
}

impl DetectedRegion {
    pub fn region_id(scan_id: &str, ordinal: usize) -> String {
        format!("{}-r{}", scan_id, ordinal)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoredShard {
    pub id: String,
    pub scan_id: String,
    pub region_id: String,
    pub label: String,
    pub source_crop: ImagePayload,
    pub restored: ImagePayload,
    /// `false` when the restoration service failed and the crop was passed through.
    pub was_restored: bool,
    pub completed_at: i64, // unix ms
}

/// Output of the local pre-scan heuristic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionalScan {
    pub count: u32,
    pub regions: Vec<NormalizedBox>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanRecord {
    pub id: String,
    pub filename: String,
    pub size: u64,
    pub mime_type: String,
    pub content_hash: String,
    pub uploaded_at: i64, // unix ms
    pub updated_at: i64,
    pub status: ScanStatus,
    pub expected_count: Option<u32>,
    pub provisional_count: Option<u32>,
    pub detected_count: usize,
    pub detections: Vec<DetectedRegion>,
    pub restoration_results: Vec<RestoredShard>,
    pub error_message: Option<String>,
}

/// Lightweight view of a record without image data.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanSummary {
    pub id: String,
    pub filename: String,
    pub size: u64,
    pub status: ScanStatus,
    pub expected_count: Option<u32>,
    pub provisional_count: Option<u32>,
    pub detected_count: usize,
    pub restored_count: usize,
    pub fallback_count: usize,
    pub error_message: Option<String>,
    pub uploaded_at: i64,
    pub updated_at: i64,
}

impl ScanRecord {
    pub fn summary(&self) -> ScanSummary {
        ScanSummary {
            id: self.id.clone(),
            filename: self.filename.clone(),
            size: self.size,
            status: self.status,
            expected_count: self.expected_count,
            provisional_count: self.provisional_count,
            detected_count: self.detected_count,
            restored_count: self.restoration_results.len(),
            fallback_count: self
                .restoration_results
                .iter()
                .filter(|shard| !shard.was_restored)
                .count(),
            error_message: self.error_message.clone(),
            uploaded_at: self.uploaded_at,
            updated_at: self.updated_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogLine {
    pub level: LogLevel,
    pub message: String,
    pub timestamp: i64,
}
