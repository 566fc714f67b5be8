use serde::Serialize;

use super::raster::PixelMatrix;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnStats {
    pub x: u32,
    pub mean: f64,
    pub p10: u8,
    /// Longest vertical dark run as a percentage of the page height.
    pub max_dark_run_fraction: f64,
    pub transitions: u32,
    /// Standard deviation of the darkest quartile of the column.
    pub dark_std_dev: f64,
}

/// One `ColumnStats` per column, ordered by `x`.
pub fn extract_columns(matrix: &PixelMatrix, darkness_threshold: u8) -> Vec<ColumnStats> {
    let mut sorted: Vec<u8> = Vec::with_capacity(matrix.height() as usize);
    (0..matrix.width())
        .map(|x| column_stats(matrix, x, darkness_threshold, &mut sorted))
        .collect()
}

fn column_stats(
    matrix: &PixelMatrix,
    x: u32,
    darkness_threshold: u8,
    sorted: &mut Vec<u8>,
) -> ColumnStats {
    let height = matrix.height() as usize;
    sorted.clear();

    let mut sum = 0u64;
    let mut run = 0usize;
    let mut max_run = 0usize;
    let mut transitions = 0u32;
    let mut previous_dark: Option<bool> = None;

    for value in matrix.column(x) {
        sum += value as u64;
        sorted.push(value);

        let dark = value < darkness_threshold;
        if dark {
            run += 1;
            max_run = max_run.max(run);
        } else {
            run = 0;
        }

        if let Some(previous) = previous_dark {
            if previous != dark {
                transitions += 1;
            }
        }
        previous_dark = Some(dark);
    }

    sorted.sort_unstable();

    let p10 = sorted[(height as f64 * 0.1).floor() as usize];
    let quartile = &sorted[..(height / 4).max(1)];

    ColumnStats {
        x,
        mean: sum as f64 / height as f64,
        p10,
        max_dark_run_fraction: max_run as f64 / height as f64 * 100.0,
        transitions,
        dark_std_dev: std_dev(quartile),
    }
}

fn std_dev(values: &[u8]) -> f64 {
    let count = values.len() as f64;
    let mean = values.iter().map(|&v| v as f64).sum::<f64>() / count;
    let variance = values
        .iter()
        .map(|&v| {
            let delta = v as f64 - mean;
            delta * delta
        })
        .sum::<f64>()
        / count;
    variance.sqrt()
}
