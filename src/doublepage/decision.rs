use serde::{Deserialize, Serialize};

use super::config::DecisionConfig;
use super::gutter::GutterCandidate;
use super::text_safety::TextSafety;

/// Ordered from least to most certain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

impl Confidence {
    pub fn as_str(self) -> &'static str {
        match self {
            Confidence::Low => "low",
            Confidence::Medium => "medium",
            Confidence::High => "high",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionMetrics {
    pub aspect_ratio: f64,
    pub gutter_score: f64,
    pub max_dark_run: f64,
    pub transitions: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionResult {
    pub is_two_page_spread: bool,
    pub confidence: Confidence,
    /// Gutter position on the 0–1000 scale; zero for single pages.
    pub split_position: u16,
    pub split_percent: f64,
    pub has_text_at_split: bool,
    pub metrics: DetectionMetrics,
}

impl DetectionResult {
    /// Portrait scans never reach column analysis.
    pub fn single_page(aspect_ratio: f64) -> Self {
        Self {
            is_two_page_spread: false,
            confidence: Confidence::High,
            split_position: 0,
            split_percent: 0.0,
            has_text_at_split: false,
            metrics: DetectionMetrics {
                aspect_ratio,
                gutter_score: 0.0,
                max_dark_run: 0.0,
                transitions: 0,
            },
        }
    }

    /// Only confident splits with a clean gutter may be applied without review.
    pub fn should_auto_apply(&self) -> bool {
        self.is_two_page_spread && self.confidence == Confidence::High && !self.has_text_at_split
    }
}

pub fn is_single_page(aspect_ratio: f64, config: &DecisionConfig) -> bool {
    aspect_ratio < config.single_page_max_aspect
}

pub fn classify_confidence(
    aspect_ratio: f64,
    gutter_score: f64,
    has_text: bool,
    config: &DecisionConfig,
) -> Confidence {
    if aspect_ratio > config.high_min_aspect && gutter_score > config.high_min_score && !has_text {
        Confidence::High
    } else if aspect_ratio < config.spread_min_aspect
        || gutter_score < config.low_max_score
        || has_text
    {
        Confidence::Low
    } else {
        Confidence::Medium
    }
}

/// Maps a column index onto the resolution-independent 0–1000 scale.
pub fn to_split_scale(position: u32, total_columns: u32) -> u16 {
    if total_columns == 0 {
        return 0;
    }
    let scaled = (position as f64 / total_columns as f64 * 1000.0).round();
    scaled.clamp(0.0, 1000.0) as u16
}

pub fn classify(
    aspect_ratio: f64,
    total_columns: u32,
    candidate: &GutterCandidate,
    safety: &TextSafety,
    config: &DecisionConfig,
) -> DetectionResult {
    let confidence = classify_confidence(aspect_ratio, candidate.score, safety.has_text, config);
    let is_two_page_spread = aspect_ratio > config.spread_min_aspect;

    let (split_position, split_percent) = if is_two_page_spread {
        (
            to_split_scale(candidate.position, total_columns),
            candidate.position as f64 / total_columns as f64 * 100.0,
        )
    } else {
        (0, 0.0)
    };

    DetectionResult {
        is_two_page_spread,
        confidence,
        split_position,
        split_percent,
        has_text_at_split: safety.has_text,
        metrics: DetectionMetrics {
            aspect_ratio,
            gutter_score: candidate.score,
            max_dark_run: candidate.stats.max_dark_run_fraction,
            transitions: candidate.stats.transitions,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doublepage::columns::ColumnStats;

    fn candidate(position: u32, score: f64) -> GutterCandidate {
        GutterCandidate {
            position,
            score,
            stats: ColumnStats {
                x: position,
                mean: 0.0,
                p10: 0,
                max_dark_run_fraction: 100.0,
                transitions: 0,
                dark_std_dev: 0.0,
            },
        }
    }

    fn safety(has_text: bool) -> TextSafety {
        TextSafety {
            has_text,
            votes: if has_text { 2 } else { 0 },
            avg_transitions: 0.0,
            avg_dark_run: 0.0,
            avg_dark_std_dev: 0.0,
        }
    }

    #[test]
    fn confidence_tiers_follow_thresholds() {
        let config = DecisionConfig::default();
        assert_eq!(classify_confidence(2.0, 80.0, false, &config), Confidence::High);
        assert_eq!(classify_confidence(2.0, 80.0, true, &config), Confidence::Low);
        assert_eq!(classify_confidence(2.0, 20.0, false, &config), Confidence::Low);
        assert_eq!(classify_confidence(0.95, 80.0, false, &config), Confidence::Low);
        assert_eq!(classify_confidence(2.0, 40.0, false, &config), Confidence::Medium);
        assert_eq!(classify_confidence(1.05, 80.0, false, &config), Confidence::Medium);
        // boundaries are exclusive
        assert_eq!(classify_confidence(1.1, 80.0, false, &config), Confidence::Medium);
        assert_eq!(classify_confidence(2.0, 50.0, false, &config), Confidence::Medium);
        assert_eq!(classify_confidence(2.0, 30.0, false, &config), Confidence::Medium);
    }

    #[test]
    fn confidence_never_drops_as_score_rises() {
        let config = DecisionConfig::default();
        for &aspect in &[0.95, 1.0, 1.05, 1.2, 2.0] {
            for &has_text in &[false, true] {
                let mut previous = Confidence::Low;
                for step in 0..=200 {
                    let score = step as f64 * 0.5;
                    let tier = classify_confidence(aspect, score, has_text, &config);
                    assert!(tier >= previous, "aspect {aspect} text {has_text} score {score}");
                    previous = tier;
                }
            }
        }
    }

    #[test]
    fn split_scale_is_monotonic_and_bounded() {
        let mut previous = 0;
        for position in 0..=777 {
            let scaled = to_split_scale(position, 777);
            assert!(scaled >= previous);
            assert!(scaled <= 1000);
            previous = scaled;
        }
        assert_eq!(to_split_scale(500, 1000), 500);
        assert_eq!(to_split_scale(1, 3), 333);
        assert_eq!(to_split_scale(5, 0), 0);
    }

    #[test]
    fn non_spread_zeroes_split_position() {
        let config = DecisionConfig::default();
        let result = classify(0.95, 100, &candidate(50, 90.0), &safety(false), &config);
        assert!(!result.is_two_page_spread);
        assert_eq!(result.split_position, 0);
        assert_eq!(result.confidence, Confidence::Low);
        assert!((result.metrics.gutter_score - 90.0).abs() < 1e-9);
    }

    #[test]
    fn spread_reports_scaled_position_and_metrics() {
        let config = DecisionConfig::default();
        let result = classify(2.0, 400, &candidate(202, 92.5), &safety(false), &config);
        assert!(result.is_two_page_spread);
        assert_eq!(result.split_position, 505);
        assert!((result.split_percent - 50.5).abs() < 1e-9);
        assert_eq!(result.confidence, Confidence::High);
        assert!(result.should_auto_apply());
        assert!((result.metrics.max_dark_run - 100.0).abs() < 1e-9);
    }

    #[test]
    fn text_at_split_blocks_auto_apply() {
        let config = DecisionConfig::default();
        let result = classify(2.0, 400, &candidate(200, 92.5), &safety(true), &config);
        assert_eq!(result.confidence, Confidence::Low);
        assert!(!result.should_auto_apply());
    }

    #[test]
    fn serializes_with_stable_field_names() {
        let value = serde_json::to_value(DetectionResult::single_page(0.7)).expect("serialize");
        assert_eq!(value["isTwoPageSpread"], false);
        assert_eq!(value["confidence"], "high");
        assert_eq!(value["splitPosition"], 0);
        assert_eq!(value["hasTextAtSplit"], false);
        assert!(value["metrics"]["aspectRatio"].as_f64().is_some());
        assert_eq!(value["metrics"]["transitions"], 0);
        assert!(value.get("splitPercent").is_some());
    }
}
