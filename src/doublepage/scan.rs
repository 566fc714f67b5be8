use std::any::Any;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::num::NonZeroUsize;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, PoisonError};
use std::thread;

use chrono::{SecondsFormat, Utc};
use natord::compare;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};
use walkdir::{DirEntry, WalkDir};

use super::labels::{AppliedDecision, LabelEntry, LabelError, LabelLog};
use super::{fingerprint, Confidence, DetectionResult, Detector};

pub const CACHE_DIR_NAME: &str = ".spread_split";
pub const REPORT_FILE_NAME: &str = "split-report.json";

const SUPPORTED_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "webp", "bmp", "tif", "tiff", "gif",
];

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("directory not found: {0}")]
    DirectoryNotFound(PathBuf),
    #[error("no supported images under {0}")]
    EmptyDirectory(PathBuf),
    #[error("failed to walk {path}: {reason}")]
    Walk { path: PathBuf, reason: String },
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("failed to write report: {0}")]
    Report(#[from] serde_json::Error),
    #[error(transparent)]
    Labels(#[from] LabelError),
}

#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub directory: PathBuf,
    /// Worker cap; defaults to the available parallelism.
    pub concurrency: Option<NonZeroUsize>,
    pub write_report: bool,
    pub labels: Option<PathBuf>,
}

impl ScanOptions {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            concurrency: None,
            write_report: false,
            labels: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ScanProgress {
    pub total_files: usize,
    pub processed_files: usize,
    pub current_file: Option<PathBuf>,
    pub stage: ScanProgressStage,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ScanProgressStage {
    Initializing,
    Processing,
    Completed,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ScanItemStatus {
    Detected,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanItem {
    pub source: PathBuf,
    pub status: ScanItemStatus,
    pub image_sha256: Option<String>,
    pub result: Option<DetectionResult>,
    pub auto_apply: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanOutcome {
    pub analyzed_files: usize,
    pub spreads: usize,
    pub single_pages: usize,
    pub high_confidence: usize,
    pub medium_confidence: usize,
    pub low_confidence: usize,
    pub auto_applicable: usize,
    pub failed: usize,
    pub report_path: Option<PathBuf>,
    pub labels_path: Option<PathBuf>,
    pub items: Vec<ScanItem>,
    pub warnings: Vec<String>,
}

fn is_supported_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| SUPPORTED_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

fn should_descend(entry: &DirEntry) -> bool {
    if entry.depth() == 0 {
        return true;
    }
    !(entry.file_type().is_dir() && entry.file_name() == CACHE_DIR_NAME)
}

fn collect_images(root: &Path) -> Result<Vec<PathBuf>, ScanError> {
    if !root.is_dir() {
        return Err(ScanError::DirectoryNotFound(root.to_path_buf()));
    }

    let mut entries = Vec::new();
    for entry in WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(should_descend)
    {
        let entry = entry.map_err(|err| ScanError::Walk {
            path: root.to_path_buf(),
            reason: err.to_string(),
        })?;
        if entry.file_type().is_file() && is_supported_image(entry.path()) {
            entries.push(entry.into_path());
        }
    }

    if entries.is_empty() {
        return Err(ScanError::EmptyDirectory(root.to_path_buf()));
    }

    entries.sort_by(|a, b| compare(a.to_string_lossy().as_ref(), b.to_string_lossy().as_ref()));
    Ok(entries)
}

fn emit_progress(callback: &mut Option<&mut dyn FnMut(ScanProgress)>, payload: ScanProgress) {
    if let Some(listener) = callback.as_mut() {
        listener(payload);
    }
}

fn failed_item(path: &Path, error: String) -> ScanItem {
    ScanItem {
        source: path.to_path_buf(),
        status: ScanItemStatus::Failed,
        image_sha256: None,
        result: None,
        auto_apply: false,
        error: Some(error),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

fn scan_entry(path: &Path, detector: &dyn Detector) -> ScanItem {
    let failed = |error: String| failed_item(path, error);

    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) => return failed(err.to_string()),
    };

    match detector.detect(&bytes) {
        Ok(result) => ScanItem {
            source: path.to_path_buf(),
            status: ScanItemStatus::Detected,
            image_sha256: Some(hex::encode(fingerprint(&bytes))),
            auto_apply: result.should_auto_apply(),
            result: Some(result),
            error: None,
        },
        Err(err) => {
            let mut item = failed(err.to_string());
            item.image_sha256 = Some(hex::encode(fingerprint(&bytes)));
            item
        }
    }
}

/// Runs `detector` over every supported image below `options.directory`.
///
/// Pages are processed in parallel, but progress events and the returned items
/// follow the natural sort order of the file names. A page that cannot be read
/// or decoded is reported as failed and never aborts the batch.
pub fn scan_directory<'a>(
    options: ScanOptions,
    detector: &dyn Detector,
    mut progress: Option<&'a mut dyn FnMut(ScanProgress)>,
) -> Result<ScanOutcome, ScanError> {
    let ScanOptions {
        directory,
        concurrency,
        write_report,
        labels,
    } = options;

    let entries = collect_images(&directory)?;
    let total_files = entries.len();
    let mut processed_files = 0usize;

    emit_progress(
        &mut progress,
        ScanProgress {
            total_files,
            processed_files,
            current_file: None,
            stage: ScanProgressStage::Initializing,
        },
    );

    let worker_count = concurrency
        .or_else(|| thread::available_parallelism().ok())
        .map(NonZeroUsize::get)
        .unwrap_or(1)
        .min(total_files);
    info!(
        directory = %directory.display(),
        files = total_files,
        workers = worker_count,
        detector = detector.name(),
        "scanning directory"
    );

    let results: Mutex<Vec<(usize, ScanItem)>> = Mutex::new(Vec::with_capacity(total_files));
    let finished: (Mutex<BTreeMap<usize, PathBuf>>, Condvar) =
        (Mutex::new(BTreeMap::new()), Condvar::new());
    let cursor = AtomicUsize::new(0);

    thread::scope(|scope| {
        for _ in 0..worker_count {
            let entries = &entries;
            let results = &results;
            let finished = &finished;
            let cursor = &cursor;

            scope.spawn(move || loop {
                let index = cursor.fetch_add(1, Ordering::SeqCst);
                if index >= entries.len() {
                    break;
                }

                // every index has to reach `finished`, panics included
                let path = &entries[index];
                let item = panic::catch_unwind(AssertUnwindSafe(|| scan_entry(path, detector)))
                    .unwrap_or_else(|payload| {
                        failed_item(path, format!("detector panicked: {}", panic_message(&*payload)))
                    });
                if let Some(error) = &item.error {
                    warn!(path = %item.source.display(), error = %error, "page detection failed");
                }

                {
                    let (lock, cvar) = finished;
                    let mut pending = lock.lock().unwrap_or_else(PoisonError::into_inner);
                    pending.insert(index, item.source.clone());
                    cvar.notify_one();
                }

                results
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push((index, item));
            });
        }

        let (lock, cvar) = &finished;
        while processed_files < total_files {
            let path = {
                let mut pending = lock.lock().unwrap_or_else(PoisonError::into_inner);
                loop {
                    if let Some(path) = pending.remove(&processed_files) {
                        break path;
                    }
                    pending = cvar.wait(pending).unwrap_or_else(PoisonError::into_inner);
                }
            };

            processed_files += 1;
            emit_progress(
                &mut progress,
                ScanProgress {
                    total_files,
                    processed_files,
                    current_file: Some(path),
                    stage: ScanProgressStage::Processing,
                },
            );
        }
    });

    let mut results = results.into_inner().unwrap_or_else(PoisonError::into_inner);
    results.sort_by_key(|(index, _)| *index);

    let mut outcome = ScanOutcome {
        analyzed_files: total_files,
        ..ScanOutcome::default()
    };
    for (_, item) in results {
        match (&item.result, &item.error) {
            (Some(result), _) => {
                if result.is_two_page_spread {
                    outcome.spreads += 1;
                } else {
                    outcome.single_pages += 1;
                }
                match result.confidence {
                    Confidence::High => outcome.high_confidence += 1,
                    Confidence::Medium => outcome.medium_confidence += 1,
                    Confidence::Low => outcome.low_confidence += 1,
                }
                if item.auto_apply {
                    outcome.auto_applicable += 1;
                }
            }
            (None, error) => {
                outcome.failed += 1;
                outcome.warnings.push(format!(
                    "failed to detect {}: {}",
                    item.source.display(),
                    error.as_deref().unwrap_or("unknown error")
                ));
            }
        }
        outcome.items.push(item);
    }

    if let Some(path) = labels {
        let log = LabelLog::new(&path);
        let entries: Vec<LabelEntry> = outcome
            .items
            .iter()
            .filter_map(|item| {
                let result = item.result.as_ref()?;
                let sha = item.image_sha256.clone()?;
                let applied = if item.auto_apply {
                    AppliedDecision::Auto
                } else {
                    AppliedDecision::Pending
                };
                Some(LabelEntry::new(
                    sha,
                    item.source.to_string_lossy(),
                    result,
                    applied,
                ))
            })
            .collect();
        log.append_all(&entries)?;
        outcome.labels_path = Some(path);
    }

    if write_report {
        let cache_dir = directory.join(CACHE_DIR_NAME);
        fs::create_dir_all(&cache_dir)?;
        let path = cache_dir.join(REPORT_FILE_NAME);
        let json = serde_json::json!({
            "generatedAt": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            "directory": directory,
            "detector": detector.name(),
            "summary": {
                "analyzedFiles": outcome.analyzed_files,
                "spreads": outcome.spreads,
                "singlePages": outcome.single_pages,
                "high": outcome.high_confidence,
                "medium": outcome.medium_confidence,
                "low": outcome.low_confidence,
                "autoApplicable": outcome.auto_applicable,
                "failed": outcome.failed,
            },
            "items": outcome.items,
        });
        fs::write(&path, format!("{}\n", serde_json::to_string_pretty(&json)?))?;
        outcome.report_path = Some(path);
    }

    emit_progress(
        &mut progress,
        ScanProgress {
            total_files,
            processed_files,
            current_file: None,
            stage: ScanProgressStage::Completed,
        },
    );

    info!(
        spreads = outcome.spreads,
        single_pages = outcome.single_pages,
        failed = outcome.failed,
        "scan finished"
    );

    Ok(outcome)
}
