use log::{info, warn};
use serde::{Deserialize, Serialize};

use super::{EngineeredFeatureRow, stats};

/// Per-lap columns repeated once per lag.
const LAG_COLUMNS: [&str; 6] = [
    "lap_time",
    "avg_speed",
    "speed_variance",
    "throttle_variance",
    "avg_lateral_g",
    "brake_variance",
];

const WINDOW_COLUMNS: [&str; 6] = [
    "lap_time_mean",
    "lap_time_std",
    "lap_time_trend",
    "lateral_g_mean",
    "lateral_g_trend",
    "delta_to_best_current",
];

/// Supervised samples for lap time regression. Unknown inputs stay `None`.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct TrainingSet {
    pub feature_names: Vec<String>,
    pub samples: Vec<Vec<Option<f64>>>,
    pub targets: Vec<f64>,
}

impl TrainingSet {
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Append another set built with the same lookback.
    pub fn extend(&mut self, other: TrainingSet) {
        if self.feature_names.is_empty() {
            self.feature_names = other.feature_names;
        }
        self.samples.extend(other.samples);
        self.targets.extend(other.targets);
    }
}

pub fn feature_names(lookback: usize) -> Vec<String> {
    let mut names = Vec::with_capacity(lookback * LAG_COLUMNS.len() + WINDOW_COLUMNS.len());
    for lag in 0..lookback {
        for column in LAG_COLUMNS {
            names.push(format!("{}_lag_{}", column, lag));
        }
    }
    names.extend(WINDOW_COLUMNS.iter().map(|c| c.to_string()));
    names
}

fn lag_values(row: &EngineeredFeatureRow) -> [Option<f64>; 6] {
    [
        Some(row.features.lap_time),
        row.features.avg_speed,
        row.features.speed_variance,
        row.features.throttle_variance,
        row.features.avg_lateral_g,
        row.brake_variance,
    ]
}

/// Flatten a window of consecutive rows, oldest first, into one input vector
/// laid out as `feature_names(window.len())`.
pub fn window_features(window: &[EngineeredFeatureRow]) -> Vec<Option<f64>> {
    let mut values: Vec<Option<f64>> = window.iter().flat_map(lag_values).collect();

    let lap_times: Vec<f64> = window.iter().map(|r| r.features.lap_time).collect();
    let lateral: Vec<f64> = window.iter().filter_map(|r| r.features.avg_lateral_g).collect();
    let lateral_diffs: Vec<f64> = window
        .windows(2)
        .filter_map(|pair| Some(pair[1].features.avg_lateral_g? - pair[0].features.avg_lateral_g?))
        .collect();
    let last = window.last();

    values.push(stats::mean(&lap_times));
    values.push(stats::sample_std(&lap_times));
    values.push(last.map(|r| r.pace_trend_slope));
    values.push(stats::mean(&lateral));
    values.push(stats::mean(&lateral_diffs));
    values.push(last.map(|r| r.delta_to_best));
    values
}

/// Build sliding-window samples: `lookback` laps of inputs, the lap time
/// `lookahead` laps after the window as target.
pub fn build_training_set(
    rows: &[EngineeredFeatureRow],
    lookback: usize,
    lookahead: usize,
) -> TrainingSet {
    let names = feature_names(lookback);
    if lookback == 0 || lookahead == 0 || rows.len() < lookback + lookahead {
        warn!(
            "Not enough laps to build a training set ({} laps, need {})",
            rows.len(),
            lookback + lookahead
        );
        return TrainingSet {
            feature_names: names,
            ..Default::default()
        };
    }

    let sample_count = rows.len() - lookback - lookahead + 1;
    let mut samples = Vec::with_capacity(sample_count);
    let mut targets = Vec::with_capacity(sample_count);

    for start in 0..sample_count {
        samples.push(window_features(&rows[start..start + lookback]));
        targets.push(rows[start + lookback + lookahead - 1].features.lap_time);
    }

    info!(
        "Built training set: {} samples, {} features",
        samples.len(),
        names.len()
    );

    TrainingSet {
        feature_names: names,
        samples,
        targets,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::{FeatureEngineer, LapFeatureVector};

    fn rows(count: u32) -> Vec<EngineeredFeatureRow> {
        let laps: Vec<_> = (1..=count)
            .map(|n| LapFeatureVector {
                lap_number: n,
                lap_time: 90.0 + n as f64 * 0.1,
                avg_speed: Some(120.0),
                avg_lateral_g: Some(1.5 - n as f64 * 0.01),
                ..Default::default()
            })
            .collect();
        FeatureEngineer::default().engineer(&laps)
    }

    #[test]
    fn test_names_match_feature_layout() {
        let names = feature_names(5);
        assert_eq!(names.len(), 36);
        assert_eq!(names[0], "lap_time_lag_0");
        assert_eq!(names[35], "delta_to_best_current");
        assert_eq!(window_features(&rows(5)).len(), names.len());
    }

    #[test]
    fn test_sliding_windows_and_targets() {
        let set = build_training_set(&rows(10), 5, 1);
        assert_eq!(set.len(), 5);
        assert_eq!(set.targets[0], rows(10)[5].features.lap_time);
        assert_eq!(set.samples[0][0], Some(90.1));
        // speed variance was never recorded
        assert_eq!(set.samples[0][2], None);
    }

    #[test]
    fn test_too_few_laps_gives_empty_set() {
        let set = build_training_set(&rows(5), 5, 1);
        assert!(set.is_empty());
        assert_eq!(set.feature_names.len(), 36);
    }

    #[test]
    fn test_lookahead_shifts_target() {
        let set = build_training_set(&rows(10), 5, 3);
        assert_eq!(set.len(), 3);
        assert_eq!(set.targets[0], rows(10)[7].features.lap_time);
    }
}
