use serde::Serialize;

use super::columns::ColumnStats;
use super::config::TextSafetyConfig;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TextSafety {
    pub has_text: bool,
    pub votes: u8,
    pub avg_transitions: f64,
    pub avg_dark_run: f64,
    pub avg_dark_std_dev: f64,
}

/// Judges whether running text crosses the column at `position`.
///
/// Three independent signals are computed over a window of columns centred on the
/// candidate (clipped at the image edges):
///
/// 1. the candidate flickers (`transitions`) and so does its neighbourhood,
/// 2. the candidate has no long dark run and neither does its neighbourhood,
/// 3. the darkest pixels around the candidate vary a lot.
///
/// Text is reported once `min_votes` of them agree, so one ambiguous metric never
/// blocks a split on its own.
pub fn has_text_at(columns: &[ColumnStats], position: u32, config: &TextSafetyConfig) -> TextSafety {
    let Some(candidate) = columns.get(position as usize) else {
        return TextSafety {
            has_text: false,
            votes: 0,
            avg_transitions: 0.0,
            avg_dark_run: 0.0,
            avg_dark_std_dev: 0.0,
        };
    };

    let centre = position as usize;
    let start = centre.saturating_sub(config.window_radius);
    let end = (centre + config.window_radius + 1).min(columns.len());
    let window = &columns[start..end];
    let count = window.len() as f64;

    let avg_transitions = window.iter().map(|c| c.transitions as f64).sum::<f64>() / count;
    let avg_dark_run = window.iter().map(|c| c.max_dark_run_fraction).sum::<f64>() / count;
    let avg_dark_std_dev = window.iter().map(|c| c.dark_std_dev).sum::<f64>() / count;

    let flicker = candidate.transitions > config.candidate_transitions
        && avg_transitions > config.window_transitions;
    let broken = candidate.max_dark_run_fraction < config.candidate_dark_run
        && avg_dark_run < config.window_dark_run;
    let varied = avg_dark_std_dev > config.window_dark_std_dev;

    let votes = [flicker, broken, varied].iter().filter(|&&v| v).count() as u8;

    TextSafety {
        has_text: votes >= config.min_votes,
        votes,
        avg_transitions,
        avg_dark_run,
        avg_dark_std_dev,
    }
}
