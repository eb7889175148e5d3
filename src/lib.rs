//! Splits scans of several physical photos into individual, restored images.
//!
//! A scan moves through a per-record state machine: a local pre-scan guesses
//! how many photos it holds, an operator confirms the count, a vision model is
//! asked for bounding boxes with increasingly aggressive strategies until the
//! count matches, and each crop is then sent through a restoration model under
//! a concurrency cap.

pub mod ai;
pub mod batch;
pub mod imaging;
pub mod logging;
pub mod scan;
pub mod server;
pub mod settings;

#[cfg(test)]
mod test_support;

use std::sync::Arc;
use std::time::Duration;

use ai::adapter::{
    AiError, DetectionClient, OfflineDetectionClient, OfflineRestorationClient, RestorationClient,
};
use imaging::crop::ImageCropExtractor;
use scan::{EngineConfig, EscalationOptions, RestorationScheduler, ScanEngine};
use server::HealthInfo;
use settings::ServiceSettings;

/// A ready-to-use engine plus what the health probe should report about it.
#[derive(Clone)]
pub struct Runtime {
    pub engine: ScanEngine,
    pub health: HealthInfo,
}

#[cfg(feature = "gemini-http")]
fn live_clients(
    settings: &ServiceSettings,
    api_key: &str,
) -> Result<(Arc<dyn DetectionClient>, Arc<dyn RestorationClient>), AiError> {
    let client = Arc::new(ai::gemini::GeminiClient::new(ai::gemini::GeminiConfig {
        api_base: settings.api_base.clone(),
        api_key: api_key.to_string(),
        detection_model: settings.detection_model.clone(),
        restoration_model: settings.restoration_model.clone(),
        timeout: Duration::from_secs(settings.request_timeout_secs),
    })?);
    let detector: Arc<dyn DetectionClient> = client.clone();
    let restorer: Arc<dyn RestorationClient> = client;
    Ok((detector, restorer))
}

#[cfg(not(feature = "gemini-http"))]
fn live_clients(
    _settings: &ServiceSettings,
    _api_key: &str,
) -> Result<(Arc<dyn DetectionClient>, Arc<dyn RestorationClient>), AiError> {
    Err(AiError::Unavailable(
        "built without the gemini-http feature".into(),
    ))
}

/// Wires the engine from settings: HTTP adapters when an API key is present,
/// the offline adapters otherwise.
pub fn build_runtime(settings: &ServiceSettings) -> Result<Runtime, AiError> {
    let (detector, restorer, mode) = match settings.api_key.as_deref() {
        Some(key) => {
            let (detector, restorer) = live_clients(settings, key)?;
            (detector, restorer, "live")
        }
        None => {
            let detector: Arc<dyn DetectionClient> = Arc::new(OfflineDetectionClient::new());
            let restorer: Arc<dyn RestorationClient> = Arc::new(OfflineRestorationClient);
            (detector, restorer, "demo")
        }
    };

    let request_timeout = Duration::from_secs(settings.request_timeout_secs.max(1));
    let scheduler = RestorationScheduler::new(
        Arc::new(ImageCropExtractor::new(settings.crop_trim_ratio)),
        restorer,
    )
    .with_concurrency(settings.restore_concurrency)
    .with_shard_timeout(Some(request_timeout * 2));

    let config = EngineConfig {
        escalation: EscalationOptions {
            attempt_timeout: Some(request_timeout),
        },
        prescan_delay: Duration::from_millis(settings.prescan_delay_ms),
        ..EngineConfig::default()
    };

    let health = HealthInfo {
        backend: detector.name().to_string(),
        mode: mode.to_string(),
        configured: settings.has_api_key() || settings.allow_demo,
    };
    tracing::info!(backend = %health.backend, mode = %health.mode, "engine ready");

    Ok(Runtime {
        engine: ScanEngine::new(detector, scheduler, config),
        health,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_key_selects_demo_mode() {
        let runtime = build_runtime(&ServiceSettings::default()).expect("runtime");
        assert_eq!(runtime.health.mode, "demo");
        assert_eq!(runtime.health.backend, "offline");
        assert!(runtime.health.configured);

        let strict = ServiceSettings {
            allow_demo: false,
            ..ServiceSettings::default()
        };
        assert!(!build_runtime(&strict).expect("runtime").health.configured);
    }

    #[cfg(feature = "gemini-http")]
    #[test]
    fn api_key_selects_live_mode() {
        let settings = ServiceSettings {
            api_key: Some("key".into()),
            ..ServiceSettings::default()
        };
        let runtime = build_runtime(&settings).expect("runtime");
        assert_eq!(runtime.health.mode, "live");
        assert_eq!(runtime.health.backend, "gemini");
    }

    #[tokio::test]
    async fn demo_runtime_processes_a_scan_end_to_end() {
        let runtime = build_runtime(&ServiceSettings::default()).expect("runtime");
        let engine = runtime.engine;
        let record = engine
            .upload("page.png", test_support::sample_scan(3))
            .expect("upload");

        let provisional = engine.run_fast_prescan(&record.id).await.expect("prescan");
        assert_eq!(provisional.count, 3);
        let verified = engine.verify_manifest(&record.id, 3).await.expect("verify");
        assert_eq!(verified.status, scan::ScanStatus::Cropped);

        let restored = engine.approve_and_restore(&record.id).await.expect("approve");
        assert_eq!(restored.status, scan::ScanStatus::Restored);
        assert_eq!(restored.restoration_results.len(), 3);
        assert!(restored.restoration_results.iter().all(|shard| !shard.was_restored));
    }
}
