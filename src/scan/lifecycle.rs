use thiserror::Error;

use super::types::{
    DetectedRegion, ProvisionalScan, RestoredShard, ScanRecord, ScanStatus,
};
use crate::ai::payload::ImagePayload;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransitionError {
    #[error("cannot {action} a scan in state {from} (would move to {to})")]
    Invalid {
        from: ScanStatus,
        to: ScanStatus,
        action: &'static str,
    },
    #[error("manifest count must be at least 1, got {0}")]
    InvalidManifestCount(u32),
    #[error("scan has no detected regions to restore")]
    NothingToRestore,
}

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl ScanStatus {
    pub fn can_transition_to(self, next: ScanStatus) -> bool {
        use ScanStatus::*;
        match (self, next) {
            (Restored, _) => false,
            (_, Error) => true,
            (Uploading, PendingVerification) => true,
            (PendingVerification, Detecting | Restoring) => true,
            (Detecting, Cropped) => true,
            (Cropped, Detecting | Restoring) => true,
            (Restoring, Restored) => true,
            (Error, Detecting) => true,
            _ => false,
        }
    }
}

/// Transition functions. These are the only code paths that change `status`,
/// and each one keeps `detected_count == detections.len()`.
impl ScanRecord {
    pub fn new(id: impl Into<String>, filename: impl Into<String>, image: &ImagePayload) -> Self {
        let now = now_ms();
        Self {
            id: id.into(),
            filename: filename.into(),
            size: image.len() as u64,
            mime_type: image.mime_type.clone(),
            content_hash: image.sha256_hex(),
            uploaded_at: now,
            updated_at: now,
            status: ScanStatus::Uploading,
            expected_count: None,
            provisional_count: None,
            detected_count: 0,
            detections: Vec::new(),
            restoration_results: Vec::new(),
            error_message: None,
        }
    }

    fn transition(&mut self, to: ScanStatus, action: &'static str) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(to) {
            return Err(TransitionError::Invalid {
                from: self.status,
                to,
                action,
            });
        }
        tracing::debug!(scan_id = %self.id, from = %self.status, to = %to, action, "scan transition");
        self.status = to;
        self.updated_at = now_ms();
        Ok(())
    }

    fn replace_detections(&mut self, detections: Vec<DetectedRegion>) {
        self.detected_count = detections.len();
        self.detections = detections;
        self.restoration_results.clear();
    }

    /// UPLOADING -> PENDING_VERIFICATION. The provisional boxes are kept as
    /// placeholder detections so an operator can approve them directly.
    pub fn complete_prescan(&mut self, provisional: &ProvisionalScan) -> Result<(), TransitionError> {
        self.transition(ScanStatus::PendingVerification, "complete pre-scan of")?;
        self.provisional_count = Some(provisional.count);
        let placeholders = provisional
            .regions
            .iter()
            .enumerate()
            .map(|(ordinal, bbox)| DetectedRegion {
                id: DetectedRegion::region_id(&self.id, ordinal),
                label: "provisional".into(),
                confidence: 0.0,
                bbox: *bbox,
                rotation: Default::default(),
            })
            .collect();
        self.replace_detections(placeholders);
        Ok(())
    }

    /// Commits the operator's manifest count and re-enters DETECTING.
    pub fn commit_manifest(&mut self, count: u32) -> Result<(), TransitionError> {
        if count == 0 {
            return Err(TransitionError::InvalidManifestCount(count));
        }
        self.transition(ScanStatus::Detecting, "verify")?;
        self.expected_count = Some(count);
        self.error_message = None;
        self.replace_detections(Vec::new());
        Ok(())
    }

    /// Re-enters DETECTING from CROPPED or ERROR with the stored manifest count.
    pub fn begin_retry(&mut self) -> Result<(), TransitionError> {
        if !matches!(self.status, ScanStatus::Cropped | ScanStatus::Error) {
            return Err(TransitionError::Invalid {
                from: self.status,
                to: ScanStatus::Detecting,
                action: "retry",
            });
        }
        self.transition(ScanStatus::Detecting, "retry")?;
        self.error_message = None;
        self.replace_detections(Vec::new());
        Ok(())
    }

    /// DETECTING -> CROPPED when at least one region came back, ERROR otherwise.
    pub fn complete_detection(
        &mut self,
        outcome: Result<Vec<DetectedRegion>, String>,
    ) -> Result<(), TransitionError> {
        if self.status != ScanStatus::Detecting {
            return Err(TransitionError::Invalid {
                from: self.status,
                to: ScanStatus::Cropped,
                action: "complete detection of",
            });
        }
        match outcome {
            Ok(regions) if !regions.is_empty() => {
                self.transition(ScanStatus::Cropped, "complete detection of")?;
                self.replace_detections(regions);
                Ok(())
            }
            Ok(_) => self.fail("detection returned no photos"),
            Err(message) => self.fail(message),
        }
    }

    pub fn fail(&mut self, message: impl Into<String>) -> Result<(), TransitionError> {
        self.transition(ScanStatus::Error, "fail")?;
        let message = message.into();
        tracing::warn!(scan_id = %self.id, error = %message, "scan failed");
        self.error_message = Some(message);
        Ok(())
    }

    /// PENDING_VERIFICATION/CROPPED -> RESTORING.
    pub fn begin_restoration(&mut self) -> Result<(), TransitionError> {
        if !matches!(
            self.status,
            ScanStatus::PendingVerification | ScanStatus::Cropped
        ) {
            return Err(TransitionError::Invalid {
                from: self.status,
                to: ScanStatus::Restoring,
                action: "approve",
            });
        }
        if self.detections.is_empty() {
            return Err(TransitionError::NothingToRestore);
        }
        self.transition(ScanStatus::Restoring, "approve")?;
        self.restoration_results.clear();
        Ok(())
    }

    /// Appends a finished shard while restoring. Shards for unknown regions
    /// and duplicates are ignored.
    pub fn record_shard(&mut self, shard: RestoredShard) {
        if self.status != ScanStatus::Restoring {
            return;
        }
        let known = self.detections.iter().any(|region| region.id == shard.region_id);
        let duplicate = self
            .restoration_results
            .iter()
            .any(|existing| existing.region_id == shard.region_id);
        if known && !duplicate {
            self.restoration_results.push(shard);
            self.updated_at = now_ms();
        }
    }

    /// RESTORING -> RESTORED when at least one shard exists, ERROR otherwise.
    pub fn finish_restoration(&mut self, failures: usize) -> Result<(), TransitionError> {
        if self.status != ScanStatus::Restoring {
            return Err(TransitionError::Invalid {
                from: self.status,
                to: ScanStatus::Restored,
                action: "finish restoring",
            });
        }
        if self.restoration_results.is_empty() {
            let message = format!("all {} shard(s) failed to restore", failures);
            self.transition(ScanStatus::Error, "fail")?;
            tracing::warn!(scan_id = %self.id, error = %message, "scan failed");
            self.error_message = Some(message);
            return Ok(());
        }
        if failures > 0 {
            tracing::warn!(
                scan_id = %self.id,
                restored = self.restoration_results.len(),
                failed = failures,
                "restoration finished with partial failures"
            );
        }
        self.transition(ScanStatus::Restored, "finish restoring")
    }
}
