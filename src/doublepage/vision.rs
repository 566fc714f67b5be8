use serde::Deserialize;
use thiserror::Error;

use super::decision::{Confidence, DetectionMetrics, DetectionResult};
use crate::pages::Crop;

#[derive(Debug, Error)]
pub enum VisionError {
    #[error("vision endpoint timed out")]
    Timeout,
    #[error("vision endpoint returned HTTP {0}")]
    Status(u16),
    #[error("vision transport error: {0}")]
    Transport(String),
    #[error("vision response malformed: {0}")]
    Malformed(String),
    #[error("vision model did not report a two-page spread")]
    NotASpread,
    #[error("vision model returned an unusable region: {0}")]
    InvalidRegion(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegionBox {
    pub x_start: u16,
    pub x_end: u16,
}

/// Verdict returned by the vision endpoint. Regions are on the 0–1000 scale.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisionVerdict {
    pub is_two_page_spread: bool,
    #[serde(default)]
    pub split_percent: Option<f64>,
    #[serde(default)]
    pub has_text_at_split: bool,
    #[serde(default)]
    pub confidence: Option<Confidence>,
    #[serde(default)]
    pub left_page: Option<RegionBox>,
    #[serde(default)]
    pub right_page: Option<RegionBox>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VisionRegions {
    pub left: Crop,
    pub right: Crop,
}

impl VisionVerdict {
    fn split_position(&self) -> u16 {
        if let Some(percent) = self.split_percent {
            return (percent * 10.0).round().clamp(0.0, 1000.0) as u16;
        }
        match (self.left_page, self.right_page) {
            (Some(left), _) => left.x_end.min(1000),
            (None, Some(right)) => right.x_start.min(1000),
            (None, None) => 500,
        }
    }

    pub fn into_result(self, aspect_ratio: f64) -> DetectionResult {
        if !self.is_two_page_spread {
            let mut result = DetectionResult::single_page(aspect_ratio);
            result.confidence = self.confidence.unwrap_or(Confidence::Medium);
            return result;
        }

        let split_position = self.split_position();
        DetectionResult {
            is_two_page_spread: true,
            confidence: self.confidence.unwrap_or(Confidence::Medium),
            split_position,
            split_percent: split_position as f64 / 10.0,
            has_text_at_split: self.has_text_at_split,
            metrics: DetectionMetrics {
                aspect_ratio,
                gutter_score: 0.0,
                max_dark_run: 0.0,
                transitions: 0,
            },
        }
    }

    pub fn regions(&self) -> Result<VisionRegions, VisionError> {
        if !self.is_two_page_spread {
            return Err(VisionError::NotASpread);
        }

        let boxed = |region: RegionBox| {
            Crop::new(region.x_start, region.x_end)
                .map_err(|err| VisionError::InvalidRegion(err.to_string()))
        };

        match (self.left_page, self.right_page) {
            (Some(left), Some(right)) => Ok(VisionRegions {
                left: boxed(left)?,
                right: boxed(right)?,
            }),
            _ => {
                let split = self.split_position();
                Crop::halves(split)
                    .map(|(left, right)| VisionRegions { left, right })
                    .map_err(|err| VisionError::InvalidRegion(err.to_string()))
            }
        }
    }
}

/// Reads only the image header to get the aspect ratio.
#[cfg(feature = "remote")]
fn probe_aspect_ratio(bytes: &[u8]) -> Result<f64, super::DetectError> {
    if bytes.is_empty() {
        return Err(super::DetectError::NoBytes);
    }
    let (width, height) = image::ImageReader::new(std::io::Cursor::new(bytes))
        .with_guessed_format()?
        .into_dimensions()?;
    if width == 0 || height == 0 {
        return Err(super::DetectError::EmptyImage { width, height });
    }
    Ok(width as f64 / height as f64)
}

#[cfg(feature = "remote")]
pub use http::VisionModelDetector;

#[cfg(feature = "remote")]
mod http {
    use std::time::Duration;

    use reqwest::blocking::multipart::{Form, Part};
    use reqwest::blocking::Client;
    use tracing::debug;

    use super::{probe_aspect_ratio, VisionError, VisionRegions, VisionVerdict};
    use crate::doublepage::fetch::parse_http_url;
    use crate::doublepage::{DetectError, DetectionResult, Detector};

    pub const DEFAULT_VISION_TIMEOUT: Duration = Duration::from_secs(60);

    const DEFAULT_PROMPT: &str = "Decide whether this scan shows two facing book pages. \
        Reply with JSON: isTwoPageSpread, splitPercent, hasTextAtSplit, confidence \
        (high|medium|low), leftPage and rightPage as {xStart, xEnd} on a 0-1000 scale.";

    pub struct VisionModelDetector {
        client: Client,
        endpoint: url::Url,
        api_key: Option<String>,
        prompt: String,
    }

    impl VisionModelDetector {
        pub fn new(endpoint: &str, api_key: Option<String>) -> Result<Self, DetectError> {
            Self::with_timeout(endpoint, api_key, DEFAULT_VISION_TIMEOUT)
        }

        pub fn with_timeout(
            endpoint: &str,
            api_key: Option<String>,
            timeout: Duration,
        ) -> Result<Self, DetectError> {
            let endpoint = parse_http_url(endpoint)?;
            let client = Client::builder()
                .timeout(timeout)
                .build()
                .map_err(|err| VisionError::Transport(err.to_string()))?;
            Ok(Self {
                client,
                endpoint,
                api_key,
                prompt: DEFAULT_PROMPT.to_string(),
            })
        }

        pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
            self.prompt = prompt.into();
            self
        }

        pub fn verdict(&self, bytes: &[u8]) -> Result<VisionVerdict, VisionError> {
            let form = Form::new()
                .text("prompt", self.prompt.clone())
                .part("image", Part::bytes(bytes.to_vec()).file_name("page"));

            let mut request = self.client.post(self.endpoint.clone()).multipart(form);
            if let Some(key) = self.api_key.as_deref() {
                request = request.bearer_auth(key);
            }

            let classify = |err: reqwest::Error| {
                if err.is_timeout() {
                    VisionError::Timeout
                } else {
                    VisionError::Transport(err.to_string())
                }
            };

            let response = request.send().map_err(classify)?;
            if !response.status().is_success() {
                return Err(VisionError::Status(response.status().as_u16()));
            }

            let raw = response.text().map_err(classify)?;
            let verdict: VisionVerdict =
                serde_json::from_str(&raw).map_err(|err| VisionError::Malformed(err.to_string()))?;
            debug!(
                spread = verdict.is_two_page_spread,
                split = ?verdict.split_percent,
                "vision verdict received"
            );
            Ok(verdict)
        }

        /// Left and right page boxes proposed by the model.
        pub fn detect_regions(&self, bytes: &[u8]) -> Result<VisionRegions, DetectError> {
            probe_aspect_ratio(bytes)?;
            Ok(self.verdict(bytes)?.regions()?)
        }
    }

    impl Detector for VisionModelDetector {
        fn name(&self) -> &'static str {
            "vision"
        }

        fn detect(&self, bytes: &[u8]) -> Result<DetectionResult, DetectError> {
            let aspect_ratio = probe_aspect_ratio(bytes)?;
            Ok(self.verdict(bytes)?.into_result(aspect_ratio))
        }
    }
}
