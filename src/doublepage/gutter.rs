use serde::Serialize;

use super::columns::ColumnStats;
use super::config::{DetectionConfig, GutterWeights};

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GutterCandidate {
    pub position: u32,
    pub score: f64,
    pub stats: ColumnStats,
}

pub fn gutter_score(stats: &ColumnStats, weights: &GutterWeights) -> f64 {
    let darkness = (255.0 - stats.p10 as f64) / 2.55;
    let calm = (100.0 - stats.transitions as f64 / 5.0).max(0.0);
    let uniformity = (50.0 - stats.dark_std_dev).max(0.0);

    darkness * weights.darkness
        + stats.max_dark_run_fraction * weights.dark_run
        + calm * weights.calm
        + uniformity * weights.uniformity
}

/// Column range searched for the binding, `[start, end)`.
pub fn search_band(width: u32, config: &DetectionConfig) -> (usize, usize) {
    let start = (width as f64 * config.band_start_ratio).floor() as usize;
    let end = (width as f64 * config.band_end_ratio).floor() as usize;
    (start, end.min(width as usize))
}

/// Picks the best-scoring column in the central band. Columns are scanned in
/// ascending order and only a strictly greater score replaces the current best,
/// so exact ties resolve to the leftmost column.
pub fn locate_gutter(columns: &[ColumnStats], config: &DetectionConfig) -> Option<GutterCandidate> {
    let width = columns.len() as u32;
    if width == 0 {
        return None;
    }

    let (start, end) = search_band(width, config);
    if start >= end {
        let centre = columns[(width / 2) as usize];
        return Some(GutterCandidate {
            position: centre.x,
            score: gutter_score(&centre, &config.weights),
            stats: centre,
        });
    }

    let mut best: Option<GutterCandidate> = None;
    for stats in columns[start..end].iter() {
        let score = gutter_score(stats, &config.weights);
        let replace = match best {
            None => true,
            Some(current) => score > current.score,
        };
        if replace {
            best = Some(GutterCandidate {
                position: stats.x,
                score,
                stats: *stats,
            });
        }
    }

    best
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain(x: u32) -> ColumnStats {
        ColumnStats {
            x,
            mean: 255.0,
            p10: 255,
            max_dark_run_fraction: 0.0,
            transitions: 0,
            dark_std_dev: 0.0,
        }
    }

    fn shadow(x: u32) -> ColumnStats {
        ColumnStats {
            x,
            mean: 0.0,
            p10: 0,
            max_dark_run_fraction: 100.0,
            transitions: 0,
            dark_std_dev: 0.0,
        }
    }

    #[test]
    fn score_matches_weighted_formula() {
        let weights = GutterWeights::default();
        assert!((gutter_score(&plain(0), &weights) - 27.5).abs() < 1e-9);
        assert!((gutter_score(&shadow(0), &weights) - 92.5).abs() < 1e-9);

        let busy = ColumnStats {
            x: 0,
            mean: 120.0,
            p10: 51,
            max_dark_run_fraction: 10.0,
            transitions: 600,
            dark_std_dev: 70.0,
        };
        // 80 * 0.30 + 10 * 0.35 + 0 + 0
        assert!((gutter_score(&busy, &weights) - 27.5).abs() < 1e-9);
    }

    #[test]
    fn picks_highest_score_inside_band() {
        let mut columns: Vec<ColumnStats> = (0..100).map(plain).collect();
        columns[5] = shadow(5);
        columns[52] = shadow(52);

        let candidate = locate_gutter(&columns, &DetectionConfig::default()).expect("candidate");
        assert_eq!(candidate.position, 52);
        assert!((candidate.score - 92.5).abs() < 1e-9);
    }

    #[test]
    fn ties_resolve_to_leftmost_column() {
        let mut columns: Vec<ColumnStats> = (0..100).map(plain).collect();
        columns[40] = shadow(40);
        columns[60] = shadow(60);

        let candidate = locate_gutter(&columns, &DetectionConfig::default()).expect("candidate");
        assert_eq!(candidate.position, 40);

        let uniform: Vec<ColumnStats> = (0..100).map(plain).collect();
        let candidate = locate_gutter(&uniform, &DetectionConfig::default()).expect("candidate");
        assert_eq!(candidate.position, 35);
    }

    #[test]
    fn band_edges_are_half_open() {
        let config = DetectionConfig::default();
        assert_eq!(search_band(100, &config), (35, 65));

        let mut columns: Vec<ColumnStats> = (0..100).map(plain).collect();
        columns[65] = shadow(65);
        let candidate = locate_gutter(&columns, &config).expect("candidate");
        assert_ne!(candidate.position, 65);
    }

    #[test]
    fn narrow_images_fall_back_to_centre() {
        // floor(3 * 0.35) == floor(3 * 0.65) == 1, so the band is empty
        let columns: Vec<ColumnStats> = (0..3).map(plain).collect();
        let candidate = locate_gutter(&columns, &DetectionConfig::default()).expect("candidate");
        assert_eq!(candidate.position, 1);
        assert!(locate_gutter(&[], &DetectionConfig::default()).is_none());
    }
}
