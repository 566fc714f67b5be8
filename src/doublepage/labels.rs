use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{fingerprint, Confidence, DetectionResult};

#[derive(Debug, Error)]
pub enum LabelError {
    #[error("label log I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("label log is not valid CSV: {0}")]
    Csv(#[from] csv::Error),
}

/// How the split for a logged prediction was finally settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppliedDecision {
    Auto,
    Manual,
    Vision,
    Pending,
}

/// One CSV row. Field order is the column order of the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelEntry {
    pub recorded_at: String,
    pub image_sha256: String,
    pub source: String,
    pub is_two_page_spread: bool,
    pub confidence: Confidence,
    pub split_position: u16,
    pub has_text_at_split: bool,
    pub gutter_score: f64,
    pub applied: AppliedDecision,
    pub final_split_position: Option<u16>,
}

impl LabelEntry {
    pub fn new(
        image_sha256: String,
        source: impl Into<String>,
        result: &DetectionResult,
        applied: AppliedDecision,
    ) -> Self {
        let final_split_position = match applied {
            AppliedDecision::Auto if result.is_two_page_spread => Some(result.split_position),
            _ => None,
        };
        Self {
            recorded_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            image_sha256,
            source: source.into(),
            is_two_page_spread: result.is_two_page_spread,
            confidence: result.confidence,
            split_position: result.split_position,
            has_text_at_split: result.has_text_at_split,
            gutter_score: result.metrics.gutter_score,
            applied,
            final_split_position,
        }
    }

    pub fn for_image(
        bytes: &[u8],
        source: impl Into<String>,
        result: &DetectionResult,
        applied: AppliedDecision,
    ) -> Self {
        Self::new(hex::encode(fingerprint(bytes)), source, result, applied)
    }

    /// Records where a reviewer or the vision model actually cut the page.
    pub fn settled(mut self, applied: AppliedDecision, final_split_position: Option<u16>) -> Self {
        self.applied = applied;
        self.final_split_position = final_split_position;
        self
    }
}

/// Append-only CSV log of predictions, kept for threshold tuning.
pub struct LabelLog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl LabelLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, entry: &LabelEntry) -> Result<(), LabelError> {
        self.append_all(std::slice::from_ref(entry))
    }

    pub fn append_all(&self, entries: &[LabelEntry]) -> Result<(), LabelError> {
        if entries.is_empty() {
            return Ok(());
        }
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let is_new = file.metadata()?.len() == 0;

        let mut writer = csv::WriterBuilder::new()
            .has_headers(is_new)
            .from_writer(file);
        for entry in entries {
            writer.serialize(entry)?;
        }
        writer.flush()?;
        Ok(())
    }

    pub fn read_all(&self) -> Result<Vec<LabelEntry>, LabelError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let mut reader = csv::Reader::from_path(&self.path)?;
        let entries = reader
            .deserialize()
            .collect::<Result<Vec<LabelEntry>, csv::Error>>()?;
        Ok(entries)
    }
}
