//! Offline batch mode: run every scan in a directory through the full
//! pipeline and write the shards plus a JSON summary to disk.

use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;
use walkdir::WalkDir;

use crate::ai::payload::{mime_for_path, ImagePayload};
use crate::scan::{ScanEngine, ScanRecord, ScanStatus};

pub const SUMMARY_FILE_NAME: &str = "summary.json";

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("failed to encode summary: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub out_dir: PathBuf,
    /// Manifest count applied to every scan; the provisional count is used when absent.
    pub expected: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchEntry {
    pub file: String,
    pub scan_id: Option<String>,
    pub status: Option<ScanStatus>,
    pub expected_count: Option<u32>,
    pub detected_count: usize,
    pub restored: usize,
    pub fallbacks: usize,
    pub shards: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BatchEntry {
    fn new(file: &Path) -> Self {
        Self {
            file: file.display().to_string(),
            scan_id: None,
            status: None,
            expected_count: None,
            detected_count: 0,
            restored: 0,
            fallbacks: 0,
            shards: Vec::new(),
            error: None,
        }
    }

    fn absorb(&mut self, record: &ScanRecord) {
        let summary = record.summary();
        self.scan_id = Some(summary.id);
        self.status = Some(summary.status);
        self.expected_count = summary.expected_count;
        self.detected_count = summary.detected_count;
        self.restored = summary.restored_count;
        self.fallbacks = summary.fallback_count;
        if self.error.is_none() {
            self.error = summary.error_message;
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSummary {
    pub processed: usize,
    pub restored: usize,
    pub failed: usize,
    pub entries: Vec<BatchEntry>,
}

/// Image files under `dir`, in natural filename order (`page2` before `page10`).
/// The `skip` directory (typically the output directory) is not descended into.
pub fn collect_images(dir: &Path, skip: Option<&Path>) -> Vec<PathBuf> {
    let skip = skip.and_then(|path| path.canonicalize().ok());
    let mut files: Vec<PathBuf> = WalkDir::new(dir)
        .follow_links(true)
        .into_iter()
        .filter_entry(|entry| match &skip {
            Some(skip) if entry.file_type().is_dir() => entry
                .path()
                .canonicalize()
                .map(|path| &path != skip)
                .unwrap_or(true),
            _ => true,
        })
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| mime_for_path(path).is_some())
        .collect();
    files.sort_by(|a, b| natord::compare(&a.to_string_lossy(), &b.to_string_lossy()));
    files
}

pub async fn process_directory(
    engine: &ScanEngine,
    dir: &Path,
    options: &BatchOptions,
) -> Result<BatchSummary, BatchError> {
    tokio::fs::create_dir_all(&options.out_dir).await?;
    let files = collect_images(dir, Some(&options.out_dir));
    tracing::info!(dir = %dir.display(), files = files.len(), "batch started");

    let mut summary = BatchSummary::default();
    for file in files {
        let entry = process_file(engine, &file, options).await;
        match entry.status {
            Some(ScanStatus::Restored) => summary.restored += 1,
            _ => summary.failed += 1,
        }
        summary.processed += 1;
        summary.entries.push(entry);
    }

    let json = serde_json::to_vec_pretty(&summary)?;
    tokio::fs::write(options.out_dir.join(SUMMARY_FILE_NAME), json).await?;
    tracing::info!(
        processed = summary.processed,
        restored = summary.restored,
        failed = summary.failed,
        "batch finished"
    );
    Ok(summary)
}

async fn process_file(engine: &ScanEngine, file: &Path, options: &BatchOptions) -> BatchEntry {
    let mut entry = BatchEntry::new(file);
    match run_pipeline(engine, file, options, &mut entry).await {
        Ok(record) => {
            entry.absorb(&record);
            if record.status == ScanStatus::Restored {
                match write_shards(file, &record, &options.out_dir).await {
                    Ok(paths) => entry.shards = paths,
                    Err(err) => entry.error = Some(format!("failed to write shards: {}", err)),
                }
            }
        }
        Err(message) => {
            tracing::warn!(file = %file.display(), error = %message, "scan skipped");
            if let Some(record) = entry.scan_id.as_deref().and_then(|id| engine.get(id)) {
                entry.absorb(&record);
            }
            entry.error = Some(message);
        }
    }

    if let Some(id) = entry.scan_id.clone() {
        if let Err(err) = engine.delete(&id).await {
            tracing::debug!(scan_id = %id, error = %err, "record already gone");
        }
    }
    entry
}

async fn run_pipeline(
    engine: &ScanEngine,
    file: &Path,
    options: &BatchOptions,
    entry: &mut BatchEntry,
) -> Result<ScanRecord, String> {
    let bytes = tokio::fs::read(file).await.map_err(|err| err.to_string())?;
    let filename = file
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();
    let record = engine
        .upload(filename, ImagePayload::from_path(file, bytes))
        .map_err(|err| err.to_string())?;
    entry.scan_id = Some(record.id.clone());

    let provisional = match engine.run_fast_prescan(&record.id).await {
        Ok(provisional) => provisional,
        Err(err) => {
            let current = engine.get(&record.id).ok_or_else(|| err.to_string())?;
            entry.error = Some(err.to_string());
            return Ok(current);
        }
    };

    let expected = options.expected.unwrap_or(provisional.count).max(1);
    let detected = engine
        .verify_manifest(&record.id, expected)
        .await
        .map_err(|err| err.to_string())?;
    if detected.status != ScanStatus::Cropped {
        return Ok(detected);
    }
    engine
        .approve_and_restore(&record.id)
        .await
        .map_err(|err| err.to_string())
}

async fn write_shards(
    file: &Path,
    record: &ScanRecord,
    out_dir: &Path,
) -> Result<Vec<String>, io::Error> {
    let stem = file
        .file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .unwrap_or_else(|| record.id.clone());
    let mut shards: Vec<_> = record.restoration_results.iter().collect();
    shards.sort_by(|a, b| natord::compare(&a.region_id, &b.region_id));

    let mut written = Vec::with_capacity(shards.len());
    for (index, shard) in shards.into_iter().enumerate() {
        let path = out_dir.join(format!(
            "{}_{:02}.{}",
            stem,
            index + 1,
            shard.restored.extension()
        ));
        tokio::fs::write(&path, &shard.restored.data).await?;
        written.push(path.display().to_string());
    }
    Ok(written)
}
