use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::join_all;

use super::lifecycle::now_ms;
use super::types::{DetectedRegion, RestoredShard};
use crate::ai::adapter::{restore_with_fallback, RestorationClient};
use crate::ai::payload::ImagePayload;
use crate::imaging::crop::{CropExtractor, DecodedScan};

pub const DEFAULT_CONCURRENCY: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardFailure {
    pub region_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct RestorationOutcome {
    /// In completion order, not region order.
    pub successes: Vec<RestoredShard>,
    pub failures: Vec<ShardFailure>,
}

impl RestorationOutcome {
    pub fn failure_count(&self) -> usize {
        self.failures.len()
    }

    /// Shards that went through unchanged because the restoration service failed.
    pub fn fallback_count(&self) -> usize {
        self.successes.iter().filter(|shard| !shard.was_restored).count()
    }
}

/// Bounded worker pool: `min(concurrency, regions)` workers pull regions off a
/// shared cursor until it runs dry, and `run` returns only after every worker
/// has finished.
#[derive(Clone)]
pub struct RestorationScheduler {
    concurrency: usize,
    extractor: Arc<dyn CropExtractor>,
    restorer: Arc<dyn RestorationClient>,
    shard_timeout: Option<Duration>,
}

impl RestorationScheduler {
    pub fn new(extractor: Arc<dyn CropExtractor>, restorer: Arc<dyn RestorationClient>) -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            extractor,
            restorer,
            shard_timeout: None,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_shard_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.shard_timeout = timeout;
        self
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub async fn run<F>(
        &self,
        scan_id: &str,
        source: Arc<ImagePayload>,
        regions: &[DetectedRegion],
        on_shard: F,
    ) -> RestorationOutcome
    where
        F: Fn(&RestoredShard) + Sync,
    {
        if regions.is_empty() {
            return RestorationOutcome::default();
        }
        let source = match self.extractor.decode(source).await {
            Ok(decoded) => decoded,
            Err(err) => {
                tracing::warn!(scan_id, error = %err, "scan could not be decoded for cropping");
                let reason = err.to_string();
                return RestorationOutcome {
                    successes: Vec::new(),
                    failures: regions
                        .iter()
                        .map(|region| ShardFailure {
                            region_id: region.id.clone(),
                            reason: reason.clone(),
                        })
                        .collect(),
                };
            }
        };
        let source = &source;

        let cursor = AtomicUsize::new(0);
        let outcome = Mutex::new(RestorationOutcome::default());
        let workers = self.concurrency.min(regions.len());

        tracing::info!(scan_id, regions = regions.len(), workers, "restoration started");

        let pool = (0..workers).map(|worker| {
            let cursor = &cursor;
            let outcome = &outcome;
            let on_shard = &on_shard;
            async move {
                loop {
                    let index = cursor.fetch_add(1, Ordering::SeqCst);
                    let Some(region) = regions.get(index) else {
                        break;
                    };
                    let result = self.restore_region(scan_id, source, region).await;
                    let mut guard = match outcome.lock() {
                        Ok(guard) => guard,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                    match result {
                        Ok(shard) => {
                            tracing::debug!(scan_id, worker, region_id = %region.id, was_restored = shard.was_restored, "shard finished");
                            on_shard(&shard);
                            guard.successes.push(shard);
                        }
                        Err(reason) => {
                            tracing::warn!(scan_id, worker, region_id = %region.id, error = %reason, "shard failed");
                            guard.failures.push(ShardFailure {
                                region_id: region.id.clone(),
                                reason,
                            });
                        }
                    }
                }
            }
        });
        join_all(pool).await;

        let outcome = match outcome.into_inner() {
            Ok(outcome) => outcome,
            Err(poisoned) => poisoned.into_inner(),
        };
        tracing::info!(
            scan_id,
            restored = outcome.successes.len(),
            fallbacks = outcome.fallback_count(),
            failed = outcome.failure_count(),
            "restoration finished"
        );
        outcome
    }

    async fn restore_region(
        &self,
        scan_id: &str,
        source: &DecodedScan,
        region: &DetectedRegion,
    ) -> Result<RestoredShard, String> {
        let work = async {
            let crop = self
                .extractor
                .extract(source, region)
                .await
                .map_err(|err| err.to_string())?;
            let restored = restore_with_fallback(self.restorer.as_ref(), &crop).await;
            Ok(RestoredShard {
                id: format!("{}-shard", region.id),
                scan_id: scan_id.to_string(),
                region_id: region.id.clone(),
                label: region.label.clone(),
                source_crop: crop,
                restored: restored.image,
                was_restored: restored.was_restored,
                completed_at: now_ms(),
            })
        };
        match self.shard_timeout {
            Some(deadline) => tokio::time::timeout(deadline, work)
                .await
                .unwrap_or_else(|_| Err(format!("shard exceeded {} ms", deadline.as_millis()))),
            None => work.await,
        }
    }
}
