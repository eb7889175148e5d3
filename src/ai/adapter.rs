use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::payload::ImagePayload;
use crate::imaging::prescan::{estimate_regions, PrescanConfig};
use crate::scan::types::{NormalizedBox, Rotation};

#[derive(Debug, Error)]
pub enum AiError {
    #[error("request error: {0}")]
    Request(String),
    #[error("unexpected response status: {0}")]
    UnexpectedStatus(u16),
    #[error("response did not match schema: {0}")]
    Schema(String),
    #[error("response was empty")]
    EmptyResponse,
    #[error("response contained no image part")]
    MissingImage,
    #[error("service unavailable: {0}")]
    Unavailable(String),
    #[error("deadline of {0} ms exceeded")]
    Timeout(u64),
}

#[cfg(feature = "gemini-http")]
impl From<reqwest::Error> for AiError {
    fn from(value: reqwest::Error) -> Self {
        if value.is_timeout() {
            return AiError::Request(format!("timed out: {}", value));
        }
        match value.status() {
            Some(status) => AiError::UnexpectedStatus(status.as_u16()),
            None => AiError::Request(value.to_string()),
        }
    }
}

/// One object reported by the vision model, already validated and normalized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionCandidate {
    pub label: String,
    pub confidence: f32,
    #[serde(rename = "box")]
    pub bbox: NormalizedBox,
    pub rotation: Rotation,
}

#[derive(Debug, Clone, Copy)]
pub struct DetectionRequest<'a> {
    pub image: &'a ImagePayload,
    pub directive: &'a str,
    pub target_count: Option<u32>,
}

#[async_trait]
pub trait DetectionClient: Send + Sync {
    /// Issues a single structured-output detection call. Retrying is the
    /// caller's responsibility.
    async fn detect(&self, request: DetectionRequest<'_>)
        -> Result<Vec<DetectionCandidate>, AiError>;

    fn name(&self) -> &str;
}

#[async_trait]
pub trait RestorationClient: Send + Sync {
    async fn restore(&self, crop: &ImagePayload) -> Result<ImagePayload, AiError>;

    fn name(&self) -> &str;
}

#[derive(Debug, Clone, PartialEq)]
pub struct RestoredImage {
    pub image: ImagePayload,
    pub was_restored: bool,
}

/// Runs the restoration call and degrades to the untouched crop on any failure,
/// so a single bad response never blocks the batch.
pub async fn restore_with_fallback(
    client: &dyn RestorationClient,
    crop: &ImagePayload,
) -> RestoredImage {
    match client.restore(crop).await {
        Ok(image) if !image.is_empty() => RestoredImage {
            image,
            was_restored: true,
        },
        Ok(_) => {
            tracing::warn!(client = client.name(), "restoration returned an empty image; passing crop through");
            passthrough(crop)
        }
        Err(err) => {
            tracing::warn!(client = client.name(), error = %err, "restoration failed; passing crop through");
            passthrough(crop)
        }
    }
}

fn passthrough(crop: &ImagePayload) -> RestoredImage {
    RestoredImage {
        image: ImagePayload::new(crop.mime_type.clone(), crop.data.clone()),
        was_restored: false,
    }
}

/// A detection adapter that does not perform network calls.
/// It answers with the local pre-scan boxes so the pipeline can run without credentials.
#[derive(Debug, Default)]
pub struct OfflineDetectionClient {
    config: PrescanConfig,
}

impl OfflineDetectionClient {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DetectionClient for OfflineDetectionClient {
    async fn detect(
        &self,
        request: DetectionRequest<'_>,
    ) -> Result<Vec<DetectionCandidate>, AiError> {
        let image = request.image.clone();
        let config = self.config;
        let provisional = tokio::task::spawn_blocking(move || estimate_regions(&image, &config))
            .await
            .map_err(|err| AiError::Unavailable(format!("offline detection stopped: {}", err)))?
            .map_err(|err| AiError::Unavailable(format!("offline detection failed: {}", err)))?;
        let mut boxes = provisional.regions;
        if let Some(target) = request.target_count {
            boxes.truncate(target as usize);
        }
        Ok(boxes
            .into_iter()
            .map(|bbox| DetectionCandidate {
                label: "photo".into(),
                confidence: 0.5,
                bbox,
                rotation: Rotation::Upright,
            })
            .collect())
    }

    fn name(&self) -> &str {
        "offline"
    }
}

/// Restoration adapter used in demo mode; every crop is passed through.
#[derive(Debug, Default)]
pub struct OfflineRestorationClient;

#[async_trait]
impl RestorationClient for OfflineRestorationClient {
    async fn restore(&self, _crop: &ImagePayload) -> Result<ImagePayload, AiError> {
        Err(AiError::Unavailable("no API key configured".into()))
    }

    fn name(&self) -> &str {
        "offline"
    }
}
