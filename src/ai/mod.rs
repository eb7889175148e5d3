//! Vision-model adapters. The pipeline only sees the `DetectionClient` and
//! `RestorationClient` traits; the HTTP client and the offline fallbacks plug in behind them.

pub mod adapter;
#[cfg(feature = "gemini-http")]
pub mod gemini;
pub mod payload;

pub use adapter::{
    restore_with_fallback, AiError, DetectionCandidate, DetectionClient, DetectionRequest,
    OfflineDetectionClient, OfflineRestorationClient, RestorationClient, RestoredImage,
};
#[cfg(feature = "gemini-http")]
pub use gemini::{GeminiClient, GeminiConfig};
pub use payload::ImagePayload;
