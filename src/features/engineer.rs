use std::fmt;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::config::{FeatureConfig, SeverityThresholds};
use crate::telemetry::{Lap, TelemetryFrame};

use super::{LapFeatureVector, lap_features, stats};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum DegradationSeverity {
    Optimal,
    Degrading,
    Critical,
}

impl DegradationSeverity {
    pub fn classify(score: f64, thresholds: &SeverityThresholds) -> Self {
        if score < thresholds.degrading {
            DegradationSeverity::Optimal
        } else if score <= thresholds.critical {
            DegradationSeverity::Degrading
        } else {
            DegradationSeverity::Critical
        }
    }
}

impl fmt::Display for DegradationSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            DegradationSeverity::Optimal => "optimal",
            DegradationSeverity::Degrading => "degrading",
            DegradationSeverity::Critical => "critical",
        };
        write!(f, "{}", label)
    }
}

/// A lap's features plus rolling, trend and degradation features.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct EngineeredFeatureRow {
    #[serde(flatten)]
    pub features: LapFeatureVector,
    /// 1-based stint index
    pub stint: u32,

    pub lap_time_rolling_mean: f64,
    /// Needs two laps in the window
    pub lap_time_rolling_std: Option<f64>,
    /// Seconds per lap over the rolling window
    pub pace_trend_slope: f64,
    /// Set when the window held fewer than two laps and the slope was forced to 0
    pub trend_low_confidence: bool,
    /// Lap time minus the best lap so far
    pub delta_to_best: f64,
    pub lap_time_delta: Option<f64>,

    pub speed_variance_trend: Option<f64>,
    pub throttle_variance_trend: Option<f64>,
    pub lateral_g_trend: Option<f64>,
    /// Peak minus average front brake pressure
    pub brake_variance: Option<f64>,

    /// Percent drop of lateral g against the stint baseline, positive when grip is lost
    pub lateral_grip_loss: Option<f64>,
    /// Percent rise of steering magnitude against the stint baseline
    pub steering_increase: Option<f64>,
    /// Percent rise of throttle variance against the stint baseline
    pub throttle_hesitation: Option<f64>,
    /// Percent change of peak deceleration against the stint baseline
    pub brake_point_shift: Option<f64>,

    /// Weighted average of the available indicators
    pub degradation_score: Option<f64>,
    pub degradation_severity: Option<DegradationSeverity>,
}

impl EngineeredFeatureRow {
    pub fn lap_number(&self) -> u32 {
        self.features.lap_number
    }

    pub fn lap_time(&self) -> f64 {
        self.features.lap_time
    }
}

/// Stint baseline, fixed once computed.
#[derive(Clone, Copy, Debug, Default)]
struct Baseline {
    avg_lateral_g: Option<f64>,
    avg_steering_abs: Option<f64>,
    throttle_variance: Option<f64>,
    max_brake_g: Option<f64>,
}

impl Baseline {
    fn from_laps(laps: &[LapFeatureVector]) -> Self {
        let mean_of = |value: fn(&LapFeatureVector) -> Option<f64>| {
            stats::mean(&laps.iter().filter_map(value).collect::<Vec<_>>())
        };
        Self {
            avg_lateral_g: mean_of(|f| f.avg_lateral_g),
            avg_steering_abs: mean_of(|f| f.avg_steering_abs),
            throttle_variance: mean_of(|f| f.throttle_variance),
            max_brake_g: mean_of(|f| f.max_brake_g),
        }
    }
}

/// Percent deviation from baseline. Absent when either side is unknown or the
/// baseline is zero.
fn percent_change(current: Option<f64>, baseline: Option<f64>) -> Option<f64> {
    let (current, baseline) = (current?, baseline?);
    if baseline == 0.0 || !baseline.is_finite() || !current.is_finite() {
        return None;
    }
    Some((current - baseline) / baseline.abs() * 100.0)
}

fn diff(current: Option<f64>, previous: Option<f64>) -> Option<f64> {
    Some(current? - previous?)
}

/// Turns per-lap features into rolling, trend and degradation features.
#[derive(Clone, Debug, Default)]
pub struct FeatureEngineer {
    config: FeatureConfig,
}

impl FeatureEngineer {
    pub fn new(config: FeatureConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &FeatureConfig {
        &self.config
    }

    pub fn lap_features(&self, laps: &[Lap], frames: &[TelemetryFrame]) -> Vec<LapFeatureVector> {
        lap_features(laps, frames, &self.config)
    }

    /// Engineer a table for a single stint.
    pub fn engineer(&self, features: &[LapFeatureVector]) -> Vec<EngineeredFeatureRow> {
        self.engineer_stints(features, &[])
    }

    /// Engineer a table where new tyres were fitted at the start of each lap in
    /// `stint_starts`. The degradation baseline resets at every stint.
    pub fn engineer_stints(
        &self,
        features: &[LapFeatureVector],
        stint_starts: &[u32],
    ) -> Vec<EngineeredFeatureRow> {
        let window = self.config.window_size.max(1);
        let lap_times: Vec<f64> = features.iter().map(|f| f.lap_time).collect();
        let stints = Self::stint_ranges(features, stint_starts);

        let mut rows = Vec::with_capacity(features.len());
        let mut best = f64::INFINITY;

        for (stint_idx, stint) in stints.iter().enumerate() {
            let stint_laps = &features[stint.clone()];
            let baseline = (stint_laps.len() >= self.config.baseline_laps)
                .then(|| Baseline::from_laps(&stint_laps[..self.config.baseline_laps]));

            for idx in stint.clone() {
                let current = &features[idx];
                let window_times = &lap_times[(idx + 1).saturating_sub(window)..=idx];
                let previous = idx.checked_sub(1).map(|prev| &features[prev]);

                let (pace_trend_slope, trend_low_confidence) = match stats::ols_slope(window_times) {
                    Some(slope) => (slope, false),
                    None => (0.0, true),
                };
                best = best.min(current.lap_time);

                let mut row = EngineeredFeatureRow {
                    features: current.clone(),
                    stint: stint_idx as u32 + 1,
                    lap_time_rolling_mean: stats::mean(window_times).unwrap_or(current.lap_time),
                    lap_time_rolling_std: stats::sample_std(window_times),
                    pace_trend_slope,
                    trend_low_confidence,
                    delta_to_best: current.lap_time - best,
                    lap_time_delta: previous.map(|p| current.lap_time - p.lap_time),
                    speed_variance_trend: diff(
                        current.speed_variance,
                        previous.and_then(|p| p.speed_variance),
                    ),
                    throttle_variance_trend: diff(
                        current.throttle_variance,
                        previous.and_then(|p| p.throttle_variance),
                    ),
                    lateral_g_trend: diff(
                        current.avg_lateral_g,
                        previous.and_then(|p| p.avg_lateral_g),
                    ),
                    brake_variance: diff(current.max_brake_front, current.avg_brake_front),
                    lateral_grip_loss: None,
                    steering_increase: None,
                    throttle_hesitation: None,
                    brake_point_shift: None,
                    degradation_score: None,
                    degradation_severity: None,
                };

                if let Some(baseline) = &baseline {
                    self.apply_degradation(&mut row, baseline);
                }
                rows.push(row);
            }
        }

        debug!(
            "Engineered {} rows across {} stints",
            rows.len(),
            stints.len()
        );
        rows
    }

    fn apply_degradation(&self, row: &mut EngineeredFeatureRow, baseline: &Baseline) {
        let features = &row.features;
        row.lateral_grip_loss =
            percent_change(features.avg_lateral_g, baseline.avg_lateral_g).map(|pct| -pct);
        row.steering_increase =
            percent_change(features.avg_steering_abs, baseline.avg_steering_abs);
        row.throttle_hesitation =
            percent_change(features.throttle_variance, baseline.throttle_variance);
        row.brake_point_shift = percent_change(features.max_brake_g, baseline.max_brake_g);

        let weights = &self.config.weights;
        let weighted = [
            (row.lateral_grip_loss, weights.lateral_grip_loss),
            (row.steering_increase, weights.steering_increase),
            (row.throttle_hesitation, weights.throttle_hesitation),
        ];
        let (sum, weight_total) = weighted
            .iter()
            .filter_map(|(value, weight)| value.map(|v| (v * weight, *weight)))
            .fold((0.0, 0.0), |(sum, total), (v, w)| (sum + v, total + w));

        if weight_total > 0.0 {
            let score = sum / weight_total;
            row.degradation_score = Some(score);
            row.degradation_severity = Some(DegradationSeverity::classify(
                score,
                &self.config.severity,
            ));
        }
    }

    /// Index ranges of each stint. Stint starts outside the table are ignored.
    fn stint_ranges(
        features: &[LapFeatureVector],
        stint_starts: &[u32],
    ) -> Vec<std::ops::Range<usize>> {
        if features.is_empty() {
            return Vec::new();
        }
        let mut cuts: Vec<usize> = features
            .iter()
            .enumerate()
            .skip(1)
            .filter(|(_, f)| stint_starts.contains(&f.lap_number))
            .map(|(idx, _)| idx)
            .collect();
        cuts.push(features.len());

        let mut ranges = Vec::with_capacity(cuts.len());
        let mut start = 0;
        for end in cuts {
            ranges.push(start..end);
            start = end;
        }
        ranges
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn lap(lap_number: u32, lap_time: f64) -> LapFeatureVector {
        LapFeatureVector {
            lap_number,
            lap_time,
            avg_lateral_g: Some(1.5),
            avg_steering_abs: Some(50.0),
            throttle_variance: Some(10.0),
            max_brake_g: Some(-1.2),
            avg_brake_front: Some(20.0),
            max_brake_front: Some(80.0),
            ..Default::default()
        }
    }

    fn degrading_laps(count: u32) -> Vec<LapFeatureVector> {
        (1..=count)
            .map(|n| {
                let wear = (n - 1) as f64;
                LapFeatureVector {
                    avg_lateral_g: Some(1.5 - wear * 0.03),
                    avg_steering_abs: Some(50.0 + wear * 2.0),
                    throttle_variance: Some(10.0 + wear * 0.8),
                    ..lap(n, 90.0 + wear * 0.1)
                }
            })
            .collect()
    }

    #[test]
    fn test_severity_classification() {
        let thresholds = SeverityThresholds::default();
        assert_eq!(DegradationSeverity::classify(4.9, &thresholds), DegradationSeverity::Optimal);
        assert_eq!(DegradationSeverity::classify(5.0, &thresholds), DegradationSeverity::Degrading);
        assert_eq!(DegradationSeverity::classify(10.0, &thresholds), DegradationSeverity::Degrading);
        assert_eq!(DegradationSeverity::classify(10.1, &thresholds), DegradationSeverity::Critical);
    }

    #[test]
    fn test_rolling_features_are_causal() {
        let engineer = FeatureEngineer::default();
        let laps: Vec<_> = [90.0, 91.0, 89.0, 92.0]
            .iter()
            .enumerate()
            .map(|(idx, t)| lap(idx as u32 + 1, *t))
            .collect();

        let rows = engineer.engineer(&laps);
        assert_eq!(rows[0].lap_time_rolling_mean, 90.0);
        assert_eq!(rows[0].lap_time_rolling_std, None);
        assert_eq!(rows[0].pace_trend_slope, 0.0);
        assert!(rows[0].trend_low_confidence);
        assert_eq!(rows[0].lap_time_delta, None);

        assert_eq!(rows[1].lap_time_rolling_mean, 90.5);
        assert_eq!(rows[1].pace_trend_slope, 1.0);
        assert!(!rows[1].trend_low_confidence);
        assert_eq!(rows[1].delta_to_best, 1.0);
        assert_eq!(rows[2].delta_to_best, 0.0);
        assert_eq!(rows[3].delta_to_best, 3.0);
        assert_eq!(rows[3].lap_time_delta, Some(3.0));
        assert_eq!(rows[3].brake_variance, Some(60.0));
    }

    #[test]
    fn test_rolling_window_limits_history() {
        let engineer = FeatureEngineer::new(FeatureConfig {
            window_size: 2,
            ..Default::default()
        });
        let laps: Vec<_> = [80.0, 90.0, 90.0]
            .iter()
            .enumerate()
            .map(|(idx, t)| lap(idx as u32 + 1, *t))
            .collect();

        let rows = engineer.engineer(&laps);
        assert_eq!(rows[2].lap_time_rolling_mean, 90.0);
        assert_eq!(rows[2].pace_trend_slope, 0.0);
        assert!(!rows[2].trend_low_confidence);
    }

    #[test]
    fn test_no_degradation_before_baseline_complete() {
        let engineer = FeatureEngineer::default();
        let rows = engineer.engineer(&degrading_laps(2));
        assert!(rows.iter().all(|r| r.degradation_score.is_none()));
    }

    #[test]
    fn test_degradation_indicators_point_to_wear() {
        let engineer = FeatureEngineer::default();
        let rows = engineer.engineer(&degrading_laps(10));

        let last = rows.last().unwrap();
        assert!(last.lateral_grip_loss.unwrap() > 0.0);
        assert!(last.steering_increase.unwrap() > 0.0);
        assert!(last.throttle_hesitation.unwrap() > 0.0);
        assert_eq!(last.degradation_severity, Some(DegradationSeverity::Critical));
        assert_eq!(rows[0].degradation_severity, Some(DegradationSeverity::Optimal));
    }

    #[test]
    fn test_missing_indicator_renormalizes_weights() {
        let engineer = FeatureEngineer::default();
        let laps: Vec<_> = degrading_laps(5)
            .into_iter()
            .map(|f| LapFeatureVector {
                avg_lateral_g: None,
                throttle_variance: None,
                ..f
            })
            .collect();

        let rows = engineer.engineer(&laps);
        let last = rows.last().unwrap();
        assert_eq!(last.lateral_grip_loss, None);
        let steering = last.steering_increase.unwrap();
        assert!((last.degradation_score.unwrap() - steering).abs() < 1e-9);
    }

    #[test]
    fn test_zero_baseline_leaves_indicator_absent() {
        let engineer = FeatureEngineer::default();
        let laps: Vec<_> = (1..=4)
            .map(|n| LapFeatureVector {
                throttle_variance: Some(0.0),
                ..lap(n, 90.0)
            })
            .collect();

        let rows = engineer.engineer(&laps);
        assert_eq!(rows[3].throttle_hesitation, None);
        assert_eq!(rows[3].degradation_score, Some(0.0));
    }

    #[test]
    fn test_stint_resets_baseline() {
        let engineer = FeatureEngineer::default();
        let mut laps = degrading_laps(6);
        // Fresh tyres from lap 7 bring grip back to the lap 1 level
        laps.extend(degrading_laps(4).into_iter().map(|f| LapFeatureVector {
            lap_number: f.lap_number + 6,
            ..f
        }));

        let rows = engineer.engineer_stints(&laps, &[7]);
        assert_eq!(rows[6].stint, 2);
        assert!(rows[6].degradation_score.unwrap().abs() < rows[5].degradation_score.unwrap());
        assert_eq!(rows[6].delta_to_best, 0.0);
    }

    #[test]
    fn test_engineer_is_idempotent() {
        let engineer = FeatureEngineer::default();
        let laps = degrading_laps(8);
        let first = serde_json::to_string(&engineer.engineer(&laps)).unwrap();
        let second = serde_json::to_string(&engineer.engineer(&laps)).unwrap();
        assert_eq!(first, second);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_single_lap_window_mean_is_lap_time(lap_time in 60.0f64..200.0) {
            let engineer = FeatureEngineer::new(FeatureConfig { window_size: 1, ..Default::default() });
            let rows = engineer.engineer(&[lap(1, lap_time), lap(2, lap_time + 1.0)]);
            prop_assert_eq!(rows[1].lap_time_rolling_mean, lap_time + 1.0);
            prop_assert_eq!(rows[1].pace_trend_slope, 0.0);
            prop_assert!(rows[1].trend_low_confidence);
        }

        #[test]
        fn prop_score_non_decreasing_under_wear(
            grip_loss in prop::collection::vec(0.001f64..0.05, 4..15),
            steering_gain in prop::collection::vec(0.1f64..3.0, 4..15),
            throttle_gain in prop::collection::vec(0.05f64..1.0, 4..15),
        ) {
            let count = grip_loss.len().min(steering_gain.len()).min(throttle_gain.len());
            let mut grip = 1.5;
            let mut steering = 50.0;
            let mut throttle = 10.0;
            let laps: Vec<_> = (0..count)
                .map(|idx| {
                    if idx > 0 {
                        grip -= grip_loss[idx];
                        steering += steering_gain[idx];
                        throttle += throttle_gain[idx];
                    }
                    LapFeatureVector {
                        avg_lateral_g: Some(grip),
                        avg_steering_abs: Some(steering),
                        throttle_variance: Some(throttle),
                        ..lap(idx as u32 + 1, 90.0)
                    }
                })
                .collect();

            let rows = FeatureEngineer::default().engineer(&laps);
            for pair in rows.windows(2) {
                prop_assert!(pair[1].degradation_score.unwrap() >= pair[0].degradation_score.unwrap());
            }
        }
    }
}
