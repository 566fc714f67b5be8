use std::io;
use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};

mod config;
pub use config::{
    DecisionConfig, DecisionOverrides, DetectionConfig, DetectionOverrides, GutterWeights,
    TextSafetyConfig, TextSafetyOverrides, DEFAULT_TARGET_WIDTH,
};

pub mod raster;
pub use raster::PixelMatrix;

pub mod columns;
use columns::extract_columns;

pub mod gutter;
use gutter::locate_gutter;

pub mod text_safety;
use text_safety::has_text_at;

pub mod decision;
pub use decision::{Confidence, DetectionMetrics, DetectionResult};
use decision::{classify, is_single_page};

pub mod fetch;
pub use fetch::{detect_from_url, FetchError, ImageFetcher};

pub mod vision;
pub use vision::VisionError;

pub mod labels;
pub mod scan;

#[derive(Debug, Error)]
pub enum DetectError {
    #[error("no image bytes to analyse")]
    NoBytes,
    #[error("image could not be decoded: {0}")]
    Image(#[from] image::ImageError),
    #[error("image could not be decoded: {0}")]
    Decode(String),
    #[error("decoded image is empty ({width}x{height})")]
    EmptyImage { width: u32, height: u32 },
    #[error("image fetch failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("vision model failed: {0}")]
    Vision(#[from] VisionError),
    #[error("invalid detection config: {0}")]
    Config(#[from] serde_json::Error),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl DetectError {
    /// Unreadable input. Fatal for the page and never retried here.
    pub fn is_decode_failure(&self) -> bool {
        matches!(
            self,
            DetectError::NoBytes
                | DetectError::Image(_)
                | DetectError::Decode(_)
                | DetectError::EmptyImage { .. }
        )
    }
}

/// Runs the heuristic pipeline on encoded image bytes with the default thresholds.
pub fn detect(bytes: &[u8], target_width: u32) -> Result<DetectionResult, DetectError> {
    let config = DetectionConfig {
        target_width,
        ..DetectionConfig::default()
    };
    detect_with_config(bytes, &config)
}

pub fn detect_with_config(
    bytes: &[u8],
    config: &DetectionConfig,
) -> Result<DetectionResult, DetectError> {
    let matrix = raster::decode(bytes, config.target_width)?;
    Ok(detect_matrix(&matrix, config))
}

pub fn detect_matrix(matrix: &PixelMatrix, config: &DetectionConfig) -> DetectionResult {
    let aspect_ratio = matrix.aspect_ratio();
    if is_single_page(aspect_ratio, &config.decision) {
        debug!(aspect_ratio, "portrait scan, column analysis skipped");
        return DetectionResult::single_page(aspect_ratio);
    }

    let columns = extract_columns(matrix, config.darkness_threshold);
    let Some(candidate) = locate_gutter(&columns, config) else {
        return DetectionResult::single_page(aspect_ratio);
    };
    let safety = has_text_at(&columns, candidate.position, &config.text_safety);
    let result = classify(
        aspect_ratio,
        matrix.width(),
        &candidate,
        &safety,
        &config.decision,
    );

    debug!(
        aspect_ratio,
        gutter = candidate.position,
        score = candidate.score,
        text_votes = safety.votes,
        confidence = result.confidence.as_str(),
        "spread detection finished"
    );

    result
}

pub fn fingerprint(bytes: &[u8]) -> [u8; 32] {
    Sha256::digest(bytes).into()
}

pub trait Detector: Send + Sync {
    fn name(&self) -> &'static str;
    fn detect(&self, bytes: &[u8]) -> Result<DetectionResult, DetectError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicDetector {
    pub config: DetectionConfig,
}

impl HeuristicDetector {
    pub fn new(config: DetectionConfig) -> Self {
        Self { config }
    }
}

impl Detector for HeuristicDetector {
    fn name(&self) -> &'static str {
        "heuristic"
    }

    fn detect(&self, bytes: &[u8]) -> Result<DetectionResult, DetectError> {
        detect_with_config(bytes, &self.config)
    }
}

/// Runs `primary` and escalates to `fallback` when the primary verdict is less
/// certain than `escalate_below`.
pub struct HybridDetector<P, F> {
    primary: P,
    fallback: F,
    escalate_below: Confidence,
}

impl<P: Detector, F: Detector> HybridDetector<P, F> {
    pub fn new(primary: P, fallback: F, escalate_below: Confidence) -> Self {
        Self {
            primary,
            fallback,
            escalate_below,
        }
    }
}

impl<P: Detector, F: Detector> Detector for HybridDetector<P, F> {
    fn name(&self) -> &'static str {
        "hybrid"
    }

    fn detect(&self, bytes: &[u8]) -> Result<DetectionResult, DetectError> {
        let primary = self.primary.detect(bytes)?;
        if primary.confidence >= self.escalate_below {
            return Ok(primary);
        }

        debug!(
            primary = self.primary.name(),
            fallback = self.fallback.name(),
            confidence = primary.confidence.as_str(),
            "escalating detection"
        );

        match self.fallback.detect(bytes) {
            Ok(result) => Ok(result),
            Err(err) => {
                warn!(fallback = self.fallback.name(), error = %err, "fallback detector failed, keeping primary verdict");
                Ok(primary)
            }
        }
    }
}

/// Memoizes verdicts by image content so repeated requests skip the pipeline.
pub struct CachedDetector<D> {
    inner: D,
    cache: Mutex<LruCache<[u8; 32], DetectionResult>>,
}

impl<D: Detector> CachedDetector<D> {
    pub fn new(inner: D, capacity: NonZeroUsize) -> Self {
        Self {
            inner,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn len(&self) -> usize {
        self.cache.lock().map(|cache| cache.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<D: Detector> Detector for CachedDetector<D> {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn detect(&self, bytes: &[u8]) -> Result<DetectionResult, DetectError> {
        let key = fingerprint(bytes);
        if let Ok(mut cache) = self.cache.lock() {
            if let Some(hit) = cache.get(&key) {
                return Ok(*hit);
            }
        }

        let result = self.inner.detect(bytes)?;
        if let Ok(mut cache) = self.cache.lock() {
            cache.put(key, result);
        }
        Ok(result)
    }
}
