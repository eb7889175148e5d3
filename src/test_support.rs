//! Scripted fakes for the AI and crop seams, shared by the in-crate tests.

use std::collections::{HashSet, VecDeque};
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};

use crate::ai::adapter::{
    AiError, DetectionCandidate, DetectionClient, DetectionRequest, RestorationClient,
};
use crate::ai::payload::ImagePayload;
use crate::imaging::crop::{CropError, CropExtractor, DecodedScan, ImageCropExtractor};
use crate::scan::types::{DetectedRegion, NormalizedBox, Rotation};

/// `count` non-overlapping candidates laid out left to right.
pub fn candidates(count: usize) -> Vec<DetectionCandidate> {
    let width = (1000 / count.max(1)) as u16;
    (0..count)
        .map(|index| {
            let x0 = index as u16 * width;
            DetectionCandidate {
                label: format!("photo {}", index + 1),
                confidence: 0.9,
                bbox: NormalizedBox::new(x0, 100, x0 + width.max(2) - 1, 900)
                    .expect("valid test box"),
                rotation: Rotation::Upright,
            }
        })
        .collect()
}

/// A light canvas with `prints` dark rectangles, encoded as PNG.
pub fn sample_scan(prints: u32) -> ImagePayload {
    let mut canvas = RgbImage::from_pixel(320, 160, Rgb([245, 245, 245]));
    for index in 0..prints.min(4) {
        let x0 = 10 + index * 78;
        for y in 20..140 {
            for x in x0..x0 + 60 {
                canvas.put_pixel(x, y, Rgb([40, 50, 60]));
            }
        }
    }
    let mut bytes = Vec::new();
    DynamicImage::ImageRgb8(canvas)
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .expect("encode sample scan");
    ImagePayload::new("image/png", bytes)
}

/// Replays queued detection results in order; an exhausted queue answers `Ok(vec![])`.
pub struct ScriptedDetector {
    script: Mutex<VecDeque<Result<Vec<DetectionCandidate>, AiError>>>,
    directives: Mutex<Vec<String>>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    delay: Duration,
}

impl ScriptedDetector {
    pub fn new(script: Vec<Result<Vec<DetectionCandidate>, AiError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            directives: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            delay: Duration::ZERO,
        }
    }

    /// Shorthand for a script of successful responses with the given region counts.
    pub fn counts(counts: &[usize]) -> Self {
        Self::new(counts.iter().map(|count| Ok(candidates(*count))).collect())
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn directives(&self) -> Vec<String> {
        self.directives.lock().expect("directives").clone()
    }
}

#[async_trait]
impl DetectionClient for ScriptedDetector {
    async fn detect(
        &self,
        request: DetectionRequest<'_>,
    ) -> Result<Vec<DetectionCandidate>, AiError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(current, Ordering::SeqCst);
        self.directives
            .lock()
            .expect("directives")
            .push(request.directive.to_string());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        let next = self.script.lock().expect("script").pop_front();
        next.unwrap_or_else(|| Ok(Vec::new()))
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// Panics on its first call and finds a single photo afterwards.
pub struct PanicsOnceDetector {
    calls: AtomicUsize,
}

impl PanicsOnceDetector {
    pub fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl DetectionClient for PanicsOnceDetector {
    async fn detect(
        &self,
        _request: DetectionRequest<'_>,
    ) -> Result<Vec<DetectionCandidate>, AiError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            panic!("detector blew up");
        }
        Ok(candidates(1))
    }

    fn name(&self) -> &str {
        "panics-once"
    }
}

/// Returns the same image for every crop and records the peak number of
/// overlapping calls.
pub struct ScriptedRestorer {
    output: ImagePayload,
    delay: Duration,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedRestorer {
    pub fn returning(output: ImagePayload) -> Self {
        Self {
            output,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RestorationClient for ScriptedRestorer {
    async fn restore(&self, _crop: &ImagePayload) -> Result<ImagePayload, AiError> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(current, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.output.clone())
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

pub struct FlakyRestorer {
    calls: AtomicUsize,
}

impl FlakyRestorer {
    pub fn always_failing() -> Self {
        Self {
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RestorationClient for FlakyRestorer {
    async fn restore(&self, _crop: &ImagePayload) -> Result<ImagePayload, AiError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(AiError::MissingImage)
    }

    fn name(&self) -> &str {
        "flaky"
    }
}

/// Real cropping, except for the listed region ids which always fail.
#[derive(Default)]
pub struct SelectiveCropExtractor {
    failing: HashSet<String>,
    inner: ImageCropExtractor,
}

impl SelectiveCropExtractor {
    pub fn failing_for<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            failing: ids.into_iter().map(Into::into).collect(),
            inner: ImageCropExtractor::default(),
        }
    }
}

#[async_trait]
impl CropExtractor for SelectiveCropExtractor {
    async fn decode(&self, source: Arc<ImagePayload>) -> Result<DecodedScan, CropError> {
        self.inner.decode(source).await
    }

    async fn extract(
        &self,
        source: &DecodedScan,
        region: &DetectedRegion,
    ) -> Result<ImagePayload, CropError> {
        if self.failing.contains(&region.id) {
            return Err(CropError::EmptyRegion(region.id.clone()));
        }
        self.inner.extract(source, region).await
    }
}
