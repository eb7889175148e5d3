use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::future::join_all;
use thiserror::Error;
use tokio::sync::OwnedMutexGuard;

use super::escalator::{escalate, DetectionError, DetectionLog, EscalationOptions};
use super::lifecycle::TransitionError;
use super::restoration::RestorationScheduler;
use super::strategy::{default_ladder, DetectionStrategy};
use super::types::{DetectedRegion, LogLine, ProvisionalScan, ScanRecord, ScanSummary};
use crate::ai::adapter::DetectionClient;
use crate::ai::payload::ImagePayload;
use crate::imaging::prescan::{estimate_regions, PrescanConfig};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("scan {0} not found")]
    NotFound(String),
    #[error("uploaded file {0} is empty")]
    EmptyUpload(String),
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error("pre-scan failed: {0}")]
    Prescan(String),
    #[error("scan {id} was interrupted during {stage}: {reason}")]
    Interrupted {
        id: String,
        stage: &'static str,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub ladder: Vec<DetectionStrategy>,
    pub escalation: EscalationOptions,
    pub prescan: PrescanConfig,
    /// Pause before the pre-scan reports, giving an operator time to see UPLOADING.
    pub prescan_delay: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ladder: default_ladder(),
            escalation: EscalationOptions::default(),
            prescan: PrescanConfig::default(),
            prescan_delay: Duration::ZERO,
        }
    }
}

struct Entry {
    record: ScanRecord,
    image: Arc<ImagePayload>,
    /// Held for the whole duration of any operation on this record. Tokio's
    /// mutex is fair, so queued operations run in arrival order.
    op_lock: Arc<tokio::sync::Mutex<()>>,
}

struct EngineInner {
    entries: Mutex<HashMap<String, Entry>>,
    detector: Arc<dyn DetectionClient>,
    scheduler: RestorationScheduler,
    config: EngineConfig,
    next_id: AtomicU64,
}

/// Moves the record to ERROR if the detection or restoration it guards stops
/// before settling the record. Must be dropped while the op lock is still held.
struct InFlight {
    engine: ScanEngine,
    id: String,
    stage: &'static str,
    settled: bool,
}

impl InFlight {
    fn settle(mut self) {
        self.settled = true;
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let message = format!("{} was interrupted before it finished", self.stage);
        match self.engine.update(&self.id, |record| record.fail(message)) {
            Ok(()) => tracing::error!(scan_id = %self.id, stage = self.stage, "scan left unsettled; moved to ERROR"),
            Err(err) => tracing::debug!(scan_id = %self.id, error = %err, "unsettled scan not moved to ERROR"),
        }
    }
}

/// Owns every scan record and is the single mutation entry point for them.
/// Operations on the same record never overlap; different records proceed
/// independently.
#[derive(Clone)]
pub struct ScanEngine {
    inner: Arc<EngineInner>,
}

impl ScanEngine {
    pub fn new(
        detector: Arc<dyn DetectionClient>,
        scheduler: RestorationScheduler,
        config: EngineConfig,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                entries: Mutex::new(HashMap::new()),
                detector,
                scheduler,
                config,
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn detector_name(&self) -> &str {
        self.inner.detector.name()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        match self.inner.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn op_lock(&self, id: &str) -> Result<Arc<tokio::sync::Mutex<()>>, EngineError> {
        self.entries()
            .get(id)
            .map(|entry| entry.op_lock.clone())
            .ok_or_else(|| EngineError::NotFound(id.to_string()))
    }

    fn snapshot(&self, id: &str) -> Result<(ScanRecord, Arc<ImagePayload>), EngineError> {
        self.entries()
            .get(id)
            .map(|entry| (entry.record.clone(), entry.image.clone()))
            .ok_or_else(|| EngineError::NotFound(id.to_string()))
    }

    fn update<T>(
        &self,
        id: &str,
        apply: impl FnOnce(&mut ScanRecord) -> Result<T, TransitionError>,
    ) -> Result<T, EngineError> {
        let mut entries = self.entries();
        let entry = entries
            .get_mut(id)
            .ok_or_else(|| EngineError::NotFound(id.to_string()))?;
        Ok(apply(&mut entry.record)?)
    }

    /// Registers a new record in UPLOADING.
    pub fn upload(
        &self,
        filename: impl Into<String>,
        image: ImagePayload,
    ) -> Result<ScanRecord, EngineError> {
        let filename = filename.into();
        if image.is_empty() {
            return Err(EngineError::EmptyUpload(filename));
        }
        let id = format!("scan-{}", self.inner.next_id.fetch_add(1, Ordering::SeqCst));
        let record = ScanRecord::new(id.clone(), filename, &image);
        tracing::info!(scan_id = %id, filename = %record.filename, size = record.size, hash = %record.content_hash, "scan uploaded");
        self.entries().insert(
            id,
            Entry {
                record: record.clone(),
                image: Arc::new(image),
                op_lock: Arc::new(tokio::sync::Mutex::new(())),
            },
        );
        Ok(record)
    }

    /// Runs the local heuristic and moves the record to PENDING_VERIFICATION.
    /// A scan that cannot be decoded goes to ERROR instead.
    pub async fn run_fast_prescan(&self, id: &str) -> Result<ProvisionalScan, EngineError> {
        let lock = self.op_lock(id)?;
        let _guard = lock.lock().await;
        let (_, image) = self.snapshot(id)?;

        if !self.inner.config.prescan_delay.is_zero() {
            tokio::time::sleep(self.inner.config.prescan_delay).await;
        }
        let config = self.inner.config.prescan;
        let estimate = tokio::task::spawn_blocking(move || estimate_regions(&image, &config))
            .await
            .map_err(|err| err.to_string())
            .and_then(|result| result.map_err(|err| err.to_string()));

        match estimate {
            Ok(provisional) => {
                self.update(id, |record| record.complete_prescan(&provisional))?;
                tracing::info!(scan_id = %id, count = provisional.count, "pre-scan complete");
                Ok(provisional)
            }
            Err(message) => {
                self.update(id, |record| record.fail(format!("pre-scan failed: {}", message)))?;
                Err(EngineError::Prescan(message))
            }
        }
    }

    /// Commits the operator's manifest count and runs escalated detection.
    pub async fn verify_manifest(&self, id: &str, count: u32) -> Result<ScanRecord, EngineError> {
        let guard = self.op_lock(id)?.lock_owned().await;
        self.update(id, |record| record.commit_manifest(count))?;
        self.settle_detached(id, guard, "detection", |engine, id| async move {
            engine.detect(&id).await
        })
        .await
    }

    /// Re-runs detection for each id with its stored manifest count. Each id
    /// queues behind any operation already running on it.
    pub async fn retry(&self, ids: &[String]) -> Vec<(String, Result<ScanRecord, EngineError>)> {
        let runs = ids.iter().map(|id| async move {
            let result = self.retry_one(id).await;
            if let Err(err) = &result {
                tracing::warn!(scan_id = %id, error = %err, "retry rejected");
            }
            (id.clone(), result)
        });
        join_all(runs).await
    }

    async fn retry_one(&self, id: &str) -> Result<ScanRecord, EngineError> {
        let guard = self.op_lock(id)?.lock_owned().await;
        self.update(id, |record| record.begin_retry())?;
        self.settle_detached(id, guard, "detection", |engine, id| async move {
            engine.detect(&id).await
        })
        .await
    }

    /// Crops and restores every detected region, then settles the record in
    /// RESTORED (at least one shard) or ERROR.
    pub async fn approve_and_restore(&self, id: &str) -> Result<ScanRecord, EngineError> {
        let guard = self.op_lock(id)?.lock_owned().await;
        self.update(id, |record| record.begin_restoration())?;
        self.settle_detached(id, guard, "restoration", |engine, id| async move {
            engine.restore(&id).await
        })
        .await
    }

    /// Runs `work` on its own task, holding the record's op lock until it
    /// returns. The record has already left its resting state, so the work
    /// outlives a dropped caller, and a panic moves the record to ERROR.
    async fn settle_detached<F, Fut>(
        &self,
        id: &str,
        guard: OwnedMutexGuard<()>,
        stage: &'static str,
        work: F,
    ) -> Result<ScanRecord, EngineError>
    where
        F: FnOnce(ScanEngine, String) -> Fut,
        Fut: Future<Output = Result<ScanRecord, EngineError>> + Send + 'static,
    {
        let in_flight = InFlight {
            engine: self.clone(),
            id: id.to_string(),
            stage,
            settled: false,
        };
        let pending = work(self.clone(), id.to_string());
        let task = tokio::spawn(async move {
            let _guard = guard;
            let in_flight = in_flight;
            let result = pending.await;
            if result.is_ok() {
                in_flight.settle();
            }
            result
        });
        task.await.map_err(|err| EngineError::Interrupted {
            id: id.to_string(),
            stage,
            reason: err.to_string(),
        })?
    }

    async fn detect(&self, id: &str) -> Result<ScanRecord, EngineError> {
        let (record, image) = self.snapshot(id)?;
        let mut log = DetectionLog::new(id);
        let result = escalate(
            self.inner.detector.as_ref(),
            id,
            &image,
            record.expected_count,
            &self.inner.config.ladder,
            self.inner.config.escalation,
            &mut log,
        )
        .await;
        let outcome = result
            .map(|escalation| escalation.regions)
            .map_err(|err| err.to_string());
        self.update(id, |record| record.complete_detection(outcome))?;
        Ok(self.snapshot(id)?.0)
    }

    async fn restore(&self, id: &str) -> Result<ScanRecord, EngineError> {
        let (record, image) = self.snapshot(id)?;
        let outcome = self
            .inner
            .scheduler
            .run(id, image, &record.detections, |shard| {
                let _ = self.update(id, |record| {
                    record.record_shard(shard.clone());
                    Ok(())
                });
            })
            .await;

        self.update(id, |record| record.finish_restoration(outcome.failure_count()))?;
        Ok(self.snapshot(id)?.0)
    }

    /// Stateless escalation used by the analyze endpoint: no record is created.
    pub async fn analyze(
        &self,
        file_id: &str,
        image: &ImagePayload,
        expected: Option<u32>,
    ) -> (Result<Vec<DetectedRegion>, DetectionError>, Vec<LogLine>) {
        let mut log = DetectionLog::new(file_id);
        log.info(format!(
            "Analyzing {} ({} bytes, {})",
            file_id,
            image.len(),
            image.mime_type
        ));
        let result = escalate(
            self.inner.detector.as_ref(),
            file_id,
            image,
            expected,
            &self.inner.config.ladder,
            self.inner.config.escalation,
            &mut log,
        )
        .await
        .map(|escalation| escalation.regions);
        (result, log.into_lines())
    }

    pub fn get(&self, id: &str) -> Option<ScanRecord> {
        self.entries().get(id).map(|entry| entry.record.clone())
    }

    pub fn list(&self) -> Vec<ScanSummary> {
        let mut summaries: Vec<ScanSummary> = self
            .entries()
            .values()
            .map(|entry| entry.record.summary())
            .collect();
        summaries.sort_by(|a, b| {
            a.uploaded_at
                .cmp(&b.uploaded_at)
                .then_with(|| natord::compare(&a.id, &b.id))
        });
        summaries
    }

    /// Waits for any running operation on the record, then drops it.
    pub async fn delete(&self, id: &str) -> Result<(), EngineError> {
        let lock = self.op_lock(id)?;
        let _guard = lock.lock().await;
        if self.entries().remove(id).is_none() {
            return Err(EngineError::NotFound(id.to_string()));
        }
        tracing::info!(scan_id = %id, "scan deleted");
        Ok(())
    }

    pub async fn clear(&self) -> usize {
        let ids: Vec<String> = self.entries().keys().cloned().collect();
        let mut removed = 0;
        for id in ids {
            if self.delete(&id).await.is_ok() {
                removed += 1;
            }
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::adapter::RestorationClient;
    use crate::imaging::crop::{CropExtractor, ImageCropExtractor};
    use crate::scan::types::{ScanStatus, COORDINATE_SCALE};
    use crate::test_support::{
        candidates, sample_scan, PanicsOnceDetector, ScriptedDetector, ScriptedRestorer,
        SelectiveCropExtractor,
    };

    fn engine_with(
        detector: Arc<dyn DetectionClient>,
        extractor: Arc<dyn CropExtractor>,
        restorer: Arc<dyn RestorationClient>,
    ) -> ScanEngine {
        ScanEngine::new(
            detector,
            RestorationScheduler::new(extractor, restorer),
            EngineConfig::default(),
        )
    }

    fn engine(detector: Arc<ScriptedDetector>) -> ScanEngine {
        engine_with(
            detector,
            Arc::new(ImageCropExtractor::default()),
            Arc::new(ScriptedRestorer::returning(ImagePayload::new(
                "image/png",
                vec![4, 2],
            ))),
        )
    }

    fn assert_detection_invariant(record: &ScanRecord) {
        assert_eq!(record.detected_count, record.detections.len());
        for region in &record.detections {
            let bbox = region.bbox;
            assert!(bbox.xmin() < bbox.xmax());
            assert!(bbox.ymin() < bbox.ymax());
            assert!(bbox.xmax() <= COORDINATE_SCALE && bbox.ymax() <= COORDINATE_SCALE);
            assert!([0, 90, 180, 270].contains(&region.rotation.degrees()));
        }
    }

    #[tokio::test]
    async fn upload_prescan_verify_escalates_to_cropped() {
        let detector = Arc::new(ScriptedDetector::counts(&[2, 3]));
        let engine = engine(detector.clone());

        let record = engine.upload("page_01.png", sample_scan(2)).expect("upload");
        assert_eq!(record.status, ScanStatus::Uploading);

        let provisional = engine.run_fast_prescan(&record.id).await.expect("prescan");
        assert_eq!(provisional.count, 2);
        assert_eq!(
            engine.get(&record.id).expect("record").status,
            ScanStatus::PendingVerification
        );

        let verified = engine.verify_manifest(&record.id, 3).await.expect("verify");

        assert_eq!(verified.status, ScanStatus::Cropped);
        assert_eq!(verified.expected_count, Some(3));
        assert_eq!(verified.detected_count, 3);
        assert_eq!(detector.calls(), 2);
        assert_detection_invariant(&verified);

        let restored = engine.approve_and_restore(&record.id).await.expect("approve");
        assert_eq!(restored.status, ScanStatus::Restored);
        assert_eq!(restored.restoration_results.len(), 3);
    }

    #[tokio::test]
    async fn best_effort_detection_keeps_invariant() {
        let detector = Arc::new(ScriptedDetector::counts(&[1, 4, 2, 5]));
        let engine = engine(detector.clone());
        let record = engine.upload("page.png", sample_scan(3)).expect("upload");
        engine.run_fast_prescan(&record.id).await.expect("prescan");

        let verified = engine.verify_manifest(&record.id, 3).await.expect("verify");

        assert_eq!(detector.calls(), 4);
        assert_eq!(verified.status, ScanStatus::Cropped);
        assert_eq!(verified.detected_count, 5);
        assert_detection_invariant(&verified);
    }

    #[tokio::test]
    async fn partial_restoration_failure_still_restores() {
        let detector = Arc::new(ScriptedDetector::counts(&[3]));
        let engine = engine_with(
            detector,
            Arc::new(SelectiveCropExtractor::failing_for(["scan-1-r1"])),
            Arc::new(ScriptedRestorer::returning(ImagePayload::new("image/png", vec![1]))),
        );
        let record = engine.upload("page.png", sample_scan(3)).expect("upload");
        engine.run_fast_prescan(&record.id).await.expect("prescan");
        engine.verify_manifest(&record.id, 3).await.expect("verify");

        let restored = engine.approve_and_restore(&record.id).await.expect("approve");

        assert_eq!(restored.status, ScanStatus::Restored);
        assert_eq!(restored.restoration_results.len(), 2);
        assert!(restored
            .restoration_results
            .iter()
            .all(|shard| shard.region_id != "scan-1-r1"));
    }

    #[tokio::test]
    async fn every_shard_failing_ends_in_error() {
        let detector = Arc::new(ScriptedDetector::counts(&[2]));
        let engine = engine_with(
            detector,
            Arc::new(SelectiveCropExtractor::failing_for(["scan-1-r0", "scan-1-r1"])),
            Arc::new(ScriptedRestorer::returning(ImagePayload::new("image/png", vec![1]))),
        );
        let record = engine.upload("page.png", sample_scan(2)).expect("upload");
        engine.run_fast_prescan(&record.id).await.expect("prescan");
        engine.verify_manifest(&record.id, 2).await.expect("verify");

        let finished = engine.approve_and_restore(&record.id).await.expect("approve");

        assert_eq!(finished.status, ScanStatus::Error);
        assert!(finished.restoration_results.is_empty());
        assert!(finished.error_message.is_some());
    }

    #[tokio::test]
    async fn approve_before_prescan_is_rejected() {
        let engine = engine(Arc::new(ScriptedDetector::counts(&[])));
        let record = engine.upload("page.png", sample_scan(1)).expect("upload");

        let result = engine.approve_and_restore(&record.id).await;

        assert!(matches!(
            result,
            Err(EngineError::Transition(TransitionError::Invalid {
                from: ScanStatus::Uploading,
                ..
            }))
        ));
        assert_eq!(
            engine.get(&record.id).expect("record").status,
            ScanStatus::Uploading
        );
    }

    #[tokio::test]
    async fn approving_placeholders_skips_detection() {
        let detector = Arc::new(ScriptedDetector::counts(&[]));
        let engine = engine(detector.clone());
        let record = engine.upload("page.png", sample_scan(2)).expect("upload");
        engine.run_fast_prescan(&record.id).await.expect("prescan");

        let restored = engine.approve_and_restore(&record.id).await.expect("approve");

        assert_eq!(detector.calls(), 0);
        assert_eq!(restored.status, ScanStatus::Restored);
        assert_eq!(restored.restoration_results.len(), 2);
    }

    #[tokio::test]
    async fn overlapping_retries_run_one_at_a_time_in_order() {
        let detector = Arc::new(
            ScriptedDetector::new(vec![
                Ok(candidates(2)),
                Ok(candidates(2)),
                Ok(candidates(1)),
            ])
            .with_delay(Duration::from_millis(20)),
        );
        let engine = engine(detector.clone());
        let record = engine.upload("page.png", sample_scan(2)).expect("upload");
        engine.run_fast_prescan(&record.id).await.expect("prescan");
        engine.verify_manifest(&record.id, 2).await.expect("verify");
        let ids = vec![record.id.clone()];

        let (first, second) = tokio::join!(engine.retry(&ids), engine.retry(&ids));

        assert!(first[0].1.is_ok());
        assert!(second[0].1.is_ok());
        assert_eq!(detector.peak_in_flight(), 1);
        // first retry matches on its only call; the second falls through the ladder
        assert_eq!(detector.calls(), 1 + 1 + 4);
        let last = engine.get(&record.id).expect("record");
        assert_eq!(last.status, ScanStatus::Cropped);
        assert_eq!(last.detected_count, 1);
    }

    #[tokio::test]
    async fn undecodable_upload_errors_then_retries_without_oracle() {
        let detector = Arc::new(ScriptedDetector::counts(&[1, 1]));
        let engine = engine(detector.clone());
        let record = engine
            .upload("broken.png", ImagePayload::new("image/png", b"nope".to_vec()))
            .expect("upload");

        let prescan = engine.run_fast_prescan(&record.id).await;
        assert!(matches!(prescan, Err(EngineError::Prescan(_))));
        assert_eq!(engine.get(&record.id).expect("record").status, ScanStatus::Error);

        let results = engine.retry(&[record.id.clone()]).await;

        let retried = results[0].1.as_ref().expect("retry");
        assert_eq!(retried.status, ScanStatus::Cropped);
        assert_eq!(detector.calls(), 1);
    }

    #[tokio::test]
    async fn verify_after_error_overwrites_manifest() {
        let detector = Arc::new(ScriptedDetector::new(vec![
            Ok(Vec::new()),
            Ok(Vec::new()),
            Ok(Vec::new()),
            Ok(Vec::new()),
            Ok(candidates(1)),
        ]));
        let engine = engine(detector);
        let record = engine.upload("page.png", sample_scan(1)).expect("upload");
        engine.run_fast_prescan(&record.id).await.expect("prescan");

        let failed = engine.verify_manifest(&record.id, 2).await.expect("verify");
        assert_eq!(failed.status, ScanStatus::Error);
        assert_eq!(failed.detected_count, 0);

        let recovered = engine.verify_manifest(&record.id, 1).await.expect("verify");
        assert_eq!(recovered.status, ScanStatus::Cropped);
        assert_eq!(recovered.expected_count, Some(1));
    }

    #[tokio::test]
    async fn retry_of_unknown_id_reports_not_found() {
        let engine = engine(Arc::new(ScriptedDetector::counts(&[])));

        let results = engine.retry(&["missing".to_string()]).await;

        assert!(matches!(results[0].1, Err(EngineError::NotFound(_))));
    }

    #[tokio::test]
    async fn delete_and_clear_drop_records() {
        let engine = engine(Arc::new(ScriptedDetector::counts(&[])));
        let first = engine.upload("a.png", sample_scan(1)).expect("upload");
        engine.upload("b.png", sample_scan(1)).expect("upload");
        engine.upload("c.png", sample_scan(1)).expect("upload");
        assert_eq!(engine.list().len(), 3);

        engine.delete(&first.id).await.expect("delete");
        assert!(engine.get(&first.id).is_none());
        assert!(matches!(
            engine.delete(&first.id).await,
            Err(EngineError::NotFound(_))
        ));

        assert_eq!(engine.clear().await, 2);
        assert!(engine.list().is_empty());
    }

    #[tokio::test]
    async fn empty_upload_is_rejected() {
        let engine = engine(Arc::new(ScriptedDetector::counts(&[])));
        assert!(matches!(
            engine.upload("empty.png", ImagePayload::new("image/png", Vec::new())),
            Err(EngineError::EmptyUpload(_))
        ));
    }

    #[tokio::test]
    async fn analyze_returns_regions_and_logs() {
        let engine = engine(Arc::new(ScriptedDetector::counts(&[1, 2])));

        let (result, logs) = engine.analyze("file-9", &sample_scan(2), Some(2)).await;

        let regions = result.expect("regions");
        assert_eq!(regions.len(), 2);
        assert_eq!(regions[0].id, "file-9-r0");
        assert!(logs.len() >= 3);
        assert!(engine.list().is_empty());
    }

    #[tokio::test]
    async fn cancelled_verify_still_settles_the_record() {
        let detector =
            Arc::new(ScriptedDetector::counts(&[2, 2]).with_delay(Duration::from_millis(200)));
        let engine = engine(detector.clone());
        let record = engine.upload("page.png", sample_scan(2)).expect("upload");
        engine.run_fast_prescan(&record.id).await.expect("prescan");

        let cancelled = tokio::time::timeout(
            Duration::from_millis(20),
            engine.verify_manifest(&record.id, 2),
        )
        .await;
        assert!(cancelled.is_err());
        tokio::time::sleep(Duration::from_millis(300)).await;

        let settled = engine.get(&record.id).expect("record");
        assert_eq!(settled.status, ScanStatus::Cropped);
        assert_eq!(settled.detected_count, 2);

        let results = engine.retry(&[record.id.clone()]).await;
        assert_eq!(
            results[0].1.as_ref().expect("retry").status,
            ScanStatus::Cropped
        );
    }

    #[tokio::test]
    async fn cancelled_approve_still_restores() {
        let engine = engine_with(
            Arc::new(ScriptedDetector::counts(&[2])),
            Arc::new(ImageCropExtractor::default()),
            Arc::new(
                ScriptedRestorer::returning(ImagePayload::new("image/png", vec![1]))
                    .with_delay(Duration::from_millis(150)),
            ),
        );
        let record = engine.upload("page.png", sample_scan(2)).expect("upload");
        engine.run_fast_prescan(&record.id).await.expect("prescan");
        engine.verify_manifest(&record.id, 2).await.expect("verify");

        let cancelled = tokio::time::timeout(
            Duration::from_millis(20),
            engine.approve_and_restore(&record.id),
        )
        .await;
        assert!(cancelled.is_err());

        let settled = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let current = engine.get(&record.id).expect("record");
                if current.status != ScanStatus::Restoring {
                    return current;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("restoration settles");
        assert_eq!(settled.status, ScanStatus::Restored);
        assert_eq!(settled.restoration_results.len(), 2);
    }

    #[tokio::test]
    async fn panicking_detection_moves_record_to_error() {
        let engine = engine_with(
            Arc::new(PanicsOnceDetector::new()),
            Arc::new(ImageCropExtractor::default()),
            Arc::new(ScriptedRestorer::returning(ImagePayload::new("image/png", vec![1]))),
        );
        let record = engine.upload("page.png", sample_scan(1)).expect("upload");
        engine.run_fast_prescan(&record.id).await.expect("prescan");

        let result = engine.verify_manifest(&record.id, 1).await;

        assert!(matches!(
            result,
            Err(EngineError::Interrupted {
                stage: "detection",
                ..
            })
        ));
        let failed = engine.get(&record.id).expect("record");
        assert_eq!(failed.status, ScanStatus::Error);
        assert!(failed
            .error_message
            .as_deref()
            .is_some_and(|message| message.contains("interrupted")));

        let results = engine.retry(&[record.id.clone()]).await;
        assert_eq!(
            results[0].1.as_ref().expect("retry").status,
            ScanStatus::Cropped
        );
    }
}
