use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::DetectError;

pub const DEFAULT_TARGET_WIDTH: u32 = 1000;

/// Weights applied to the four per-column gutter signals.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GutterWeights {
    /// Darkness of the darkest decile (`p10`).
    pub darkness: f64,
    /// Longest unbroken dark run.
    pub dark_run: f64,
    /// Absence of light/dark flicker.
    pub calm: f64,
    /// Uniformity of the darkest quartile.
    pub uniformity: f64,
}

impl Default for GutterWeights {
    fn default() -> Self {
        Self {
            darkness: 0.30,
            dark_run: 0.35,
            calm: 0.20,
            uniformity: 0.15,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextSafetyConfig {
    pub window_radius: usize,
    pub candidate_transitions: u32,
    pub window_transitions: f64,
    pub candidate_dark_run: f64,
    pub window_dark_run: f64,
    pub window_dark_std_dev: f64,
    pub min_votes: u8,
}

impl Default for TextSafetyConfig {
    fn default() -> Self {
        Self {
            window_radius: 3,
            candidate_transitions: 30,
            window_transitions: 40.0,
            candidate_dark_run: 40.0,
            window_dark_run: 50.0,
            window_dark_std_dev: 30.0,
            min_votes: 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionConfig {
    /// Below this width/height ratio the page is a single page, no analysis.
    pub single_page_max_aspect: f64,
    /// Above this ratio the page counts as a spread.
    pub spread_min_aspect: f64,
    pub high_min_aspect: f64,
    pub high_min_score: f64,
    pub low_max_score: f64,
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            single_page_max_aspect: 0.9,
            spread_min_aspect: 1.0,
            high_min_aspect: 1.1,
            high_min_score: 50.0,
            low_max_score: 30.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionConfig {
    pub target_width: u32,
    pub darkness_threshold: u8,
    pub band_start_ratio: f64,
    pub band_end_ratio: f64,
    pub weights: GutterWeights,
    pub text_safety: TextSafetyConfig,
    pub decision: DecisionConfig,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            target_width: DEFAULT_TARGET_WIDTH,
            darkness_threshold: 180,
            band_start_ratio: 0.35,
            band_end_ratio: 0.65,
            weights: GutterWeights::default(),
            text_safety: TextSafetyConfig::default(),
            decision: DecisionConfig::default(),
        }
    }
}

impl DetectionConfig {
    pub fn with_overrides(mut self, overrides: &DetectionOverrides) -> Self {
        self.target_width = overrides.target_width.unwrap_or(self.target_width);
        self.darkness_threshold = overrides
            .darkness_threshold
            .unwrap_or(self.darkness_threshold);
        self.band_start_ratio = overrides.band_start_ratio.unwrap_or(self.band_start_ratio);
        self.band_end_ratio = overrides.band_end_ratio.unwrap_or(self.band_end_ratio);

        if let Some(weights) = overrides.weights {
            self.weights = GutterWeights {
                darkness: weights[0],
                dark_run: weights[1],
                calm: weights[2],
                uniformity: weights[3],
            };
        }

        if let Some(text) = overrides.text_safety.as_ref() {
            self.text_safety = self.text_safety.apply_overrides(text);
        }

        if let Some(decision) = overrides.decision.as_ref() {
            self.decision = self.decision.apply_overrides(decision);
        }

        self
    }

    /// Reads a JSON overrides document and layers it over the defaults.
    pub fn load_overrides(path: &Path) -> Result<Self, DetectError> {
        let raw = fs::read_to_string(path)?;
        let overrides: DetectionOverrides = serde_json::from_str(&raw)?;
        Ok(Self::default().with_overrides(&overrides))
    }
}

impl TextSafetyConfig {
    pub fn apply_overrides(mut self, overrides: &TextSafetyOverrides) -> Self {
        if let Some(radius) = overrides.window_radius {
            self.window_radius = radius;
        }
        if let Some(value) = overrides.candidate_transitions {
            self.candidate_transitions = value;
        }
        if let Some(value) = overrides.window_transitions {
            self.window_transitions = value;
        }
        if let Some(value) = overrides.candidate_dark_run {
            self.candidate_dark_run = value;
        }
        if let Some(value) = overrides.window_dark_run {
            self.window_dark_run = value;
        }
        if let Some(value) = overrides.window_dark_std_dev {
            self.window_dark_std_dev = value;
        }
        if let Some(votes) = overrides.min_votes {
            self.min_votes = votes;
        }
        self
    }
}

impl DecisionConfig {
    pub fn apply_overrides(mut self, overrides: &DecisionOverrides) -> Self {
        self.single_page_max_aspect = overrides
            .single_page_max_aspect
            .unwrap_or(self.single_page_max_aspect);
        self.spread_min_aspect = overrides
            .spread_min_aspect
            .unwrap_or(self.spread_min_aspect);
        self.high_min_aspect = overrides.high_min_aspect.unwrap_or(self.high_min_aspect);
        self.high_min_score = overrides.high_min_score.unwrap_or(self.high_min_score);
        self.low_max_score = overrides.low_max_score.unwrap_or(self.low_max_score);
        self
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct DetectionOverrides {
    #[serde(default)]
    pub target_width: Option<u32>,
    #[serde(default)]
    pub darkness_threshold: Option<u8>,
    #[serde(default)]
    pub band_start_ratio: Option<f64>,
    #[serde(default)]
    pub band_end_ratio: Option<f64>,
    /// `[darkness, darkRun, calm, uniformity]`
    #[serde(default)]
    pub weights: Option<[f64; 4]>,
    #[serde(default)]
    pub text_safety: Option<TextSafetyOverrides>,
    #[serde(default)]
    pub decision: Option<DecisionOverrides>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct TextSafetyOverrides {
    pub window_radius: Option<usize>,
    pub candidate_transitions: Option<u32>,
    pub window_transitions: Option<f64>,
    pub candidate_dark_run: Option<f64>,
    pub window_dark_run: Option<f64>,
    pub window_dark_std_dev: Option<f64>,
    pub min_votes: Option<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct DecisionOverrides {
    pub single_page_max_aspect: Option<f64>,
    pub spread_min_aspect: Option<f64>,
    pub high_min_aspect: Option<f64>,
    pub high_min_score: Option<f64>,
    pub low_max_score: Option<f64>,
}
