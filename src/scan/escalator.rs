use std::time::Duration;

use thiserror::Error;

use super::strategy::DetectionStrategy;
use super::types::{DetectedRegion, LogLevel, LogLine};
use crate::ai::adapter::{AiError, DetectionCandidate, DetectionClient, DetectionRequest};
use crate::ai::payload::ImagePayload;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DetectionError {
    #[error("no detection strategies configured")]
    EmptyLadder,
    #[error("no photos detected after {attempts} attempt(s){}", suffix(.last_error))]
    NoRegions {
        attempts: usize,
        last_error: Option<String>,
    },
}

fn suffix(last_error: &Option<String>) -> String {
    last_error
        .as_ref()
        .map(|err| format!(": {}", err))
        .unwrap_or_default()
}

/// Log lines collected during one escalation. Every line is mirrored to
/// `tracing` so the same story shows up in the service log.
#[derive(Debug, Clone, Default)]
pub struct DetectionLog {
    scan_id: String,
    lines: Vec<LogLine>,
}

impl DetectionLog {
    pub fn new(scan_id: impl Into<String>) -> Self {
        Self {
            scan_id: scan_id.into(),
            lines: Vec::new(),
        }
    }

    pub fn info(&mut self, message: impl Into<String>) {
        let message = message.into();
        tracing::info!(scan_id = %self.scan_id, "{}", message);
        self.push(LogLevel::Info, message);
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!(scan_id = %self.scan_id, "{}", message);
        self.push(LogLevel::Warn, message);
    }

    pub fn error(&mut self, message: impl Into<String>) {
        let message = message.into();
        tracing::error!(scan_id = %self.scan_id, "{}", message);
        self.push(LogLevel::Error, message);
    }

    fn push(&mut self, level: LogLevel, message: String) {
        self.lines.push(LogLine {
            level,
            message,
            timestamp: chrono::Utc::now().timestamp_millis(),
        });
    }

    pub fn lines(&self) -> &[LogLine] {
        &self.lines
    }

    pub fn into_lines(self) -> Vec<LogLine> {
        self.lines
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EscalationOptions {
    /// Deadline for a single detection call; an expired attempt counts as failed.
    pub attempt_timeout: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Escalation {
    pub regions: Vec<DetectedRegion>,
    pub attempts: usize,
    /// Level of the strategy whose count matched the manifest, if any.
    pub matched_level: Option<u8>,
}

/// Walks `ladder` in order until a detection attempt returns exactly
/// `expected` regions.
///
/// Without an expected count only the first strategy runs and its result is
/// returned as is. Attempt errors are logged and treated as mismatches. When
/// the ladder runs out, the last attempt that produced regions wins; only a
/// run in which no attempt produced any region is an error.
pub async fn escalate(
    client: &dyn DetectionClient,
    scan_id: &str,
    image: &ImagePayload,
    expected: Option<u32>,
    ladder: &[DetectionStrategy],
    options: EscalationOptions,
    log: &mut DetectionLog,
) -> Result<Escalation, DetectionError> {
    if ladder.is_empty() {
        return Err(DetectionError::EmptyLadder);
    }
    let rungs = match expected {
        Some(_) => ladder,
        None => &ladder[..1],
    };

    let mut attempts = 0;
    let mut best_effort: Option<Vec<DetectionCandidate>> = None;
    let mut last_error = None;

    for strategy in rungs {
        attempts += 1;
        log.info(format!(
            "Strategy {} ({}) via {}",
            strategy.level,
            strategy.name,
            client.name()
        ));

        let found = match attempt(client, image, strategy, expected, options).await {
            Ok(found) => found,
            Err(err) => {
                log.error(format!("Strategy {} failed: {}", strategy.level, err));
                last_error = Some(err.to_string());
                continue;
            }
        };

        match expected {
            Some(count) if found.len() == count as usize => {
                log.info(format!(
                    "Strategy {} matched manifest count {}",
                    strategy.level, count
                ));
                return Ok(Escalation {
                    regions: into_regions(scan_id, found),
                    attempts,
                    matched_level: Some(strategy.level),
                });
            }
            Some(count) => log.warn(format!(
                "Strategy {} found {} photo(s), manifest says {}",
                strategy.level,
                found.len(),
                count
            )),
            None => log.info(format!(
                "Strategy {} found {} photo(s)",
                strategy.level,
                found.len()
            )),
        }

        if !found.is_empty() {
            best_effort = Some(found);
        }
    }

    match best_effort {
        Some(found) => {
            if expected.is_some() {
                log.warn(format!(
                    "Strategies exhausted; keeping best-effort result of {} photo(s)",
                    found.len()
                ));
            }
            Ok(Escalation {
                regions: into_regions(scan_id, found),
                attempts,
                matched_level: None,
            })
        }
        None => {
            let err = DetectionError::NoRegions {
                attempts,
                last_error,
            };
            log.error(err.to_string());
            Err(err)
        }
    }
}

async fn attempt(
    client: &dyn DetectionClient,
    image: &ImagePayload,
    strategy: &DetectionStrategy,
    expected: Option<u32>,
    options: EscalationOptions,
) -> Result<Vec<DetectionCandidate>, AiError> {
    let call = client.detect(DetectionRequest {
        image,
        directive: &strategy.directive,
        target_count: expected,
    });
    match options.attempt_timeout {
        Some(deadline) => tokio::time::timeout(deadline, call)
            .await
            .unwrap_or_else(|_| Err(AiError::Timeout(deadline.as_millis() as u64))),
        None => call.await,
    }
}

fn into_regions(scan_id: &str, found: Vec<DetectionCandidate>) -> Vec<DetectedRegion> {
    found
        .into_iter()
        .enumerate()
        .map(|(ordinal, candidate)| DetectedRegion {
            id: DetectedRegion::region_id(scan_id, ordinal),
            label: candidate.label,
            confidence: candidate.confidence,
            bbox: candidate.bbox,
            rotation: candidate.rotation,
        })
        .collect()
}
