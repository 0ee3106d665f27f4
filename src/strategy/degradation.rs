use serde::{Deserialize, Serialize};

use crate::config::SeverityThresholds;
use crate::features::{DegradationSeverity, EngineeredFeatureRow, stats};

/// Laps shown in a degradation curve.
pub const CURVE_LAPS: usize = 10;
/// Laps needed before a degradation rate is reported.
pub const MIN_RATE_LAPS: usize = 3;
/// Laps at which rate confidence saturates.
pub const FULL_CONFIDENCE_LAPS: f64 = 10.0;
/// Lateral grip loss, percent, that names grip as a cause.
pub const GRIP_LOSS_CAUSE_PCT: f64 = 5.0;
/// Steering increase, percent, that names understeer as a cause.
pub const STEERING_INCREASE_CAUSE_PCT: f64 = 10.0;
const GRIP_LOSS_CAUSE_CONFIDENCE: f64 = 0.78;
const UNDERSTEER_CAUSE_CONFIDENCE: f64 = 0.65;

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct DegradationIndicators {
    /// Mean lap over lap change in lap time, seconds per lap
    pub degradation_rate: f64,
    pub lateral_g_trend: f64,
    pub steering_variance_trend: f64,
    pub confidence: f64,
}

fn mean_step(values: &[f64]) -> f64 {
    if values.len() < MIN_RATE_LAPS {
        return 0.0;
    }
    let steps: Vec<f64> = values.windows(2).map(|pair| pair[1] - pair[0]).collect();
    stats::mean(&steps).unwrap_or(0.0)
}

/// Degradation rate over a run of consecutive laps. Everything is zero with
/// fewer than three laps.
pub fn degradation_indicators(history: &[EngineeredFeatureRow]) -> DegradationIndicators {
    if history.len() < MIN_RATE_LAPS {
        return DegradationIndicators::default();
    }
    let lap_times: Vec<f64> = history.iter().map(|r| r.lap_time()).collect();
    let lateral: Vec<f64> = history.iter().filter_map(|r| r.features.avg_lateral_g).collect();
    let steering: Vec<f64> = history
        .iter()
        .filter_map(|r| r.features.steering_variance)
        .collect();

    DegradationIndicators {
        degradation_rate: mean_step(&lap_times),
        lateral_g_trend: mean_step(&lateral),
        steering_variance_trend: mean_step(&steering),
        confidence: (lap_times.len() as f64 / FULL_CONFIDENCE_LAPS).min(1.0),
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct DegradationPoint {
    pub lap: u32,
    /// Lap time above the best lap so far
    pub delta_seconds: f64,
    /// Degradation score scaled to 0..1 per 100 points
    pub severity: f64,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CauseKind {
    LateralGripLoss,
    Understeer,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DegradationCause {
    pub kind: CauseKind,
    pub confidence: f64,
    pub indicators: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DegradationReport {
    pub lap_number: u32,
    pub curve: Vec<DegradationPoint>,
    pub degradation_rate: f64,
    pub primary_causes: Vec<DegradationCause>,
    pub stint_health: DegradationSeverity,
    pub recommended_action: String,
}

/// Degradation state of `current_lap`. `None` when that lap is not in the
/// table.
pub fn analyze_degradation(
    rows: &[EngineeredFeatureRow],
    current_lap: u32,
    thresholds: &SeverityThresholds,
) -> Option<DegradationReport> {
    let current = rows.iter().find(|r| r.lap_number() == current_lap)?;
    let history: Vec<&EngineeredFeatureRow> =
        rows.iter().filter(|r| r.lap_number() <= current_lap).collect();
    let best = history
        .iter()
        .map(|r| r.lap_time())
        .fold(f64::INFINITY, f64::min);

    let curve = history
        .iter()
        .skip(history.len().saturating_sub(CURVE_LAPS))
        .map(|r| DegradationPoint {
            lap: r.lap_number(),
            delta_seconds: r.lap_time() - best,
            severity: r.degradation_score.unwrap_or(0.0) / 100.0,
        })
        .collect();

    let mut primary_causes = Vec::new();
    if current
        .lateral_grip_loss
        .is_some_and(|loss| loss > GRIP_LOSS_CAUSE_PCT)
    {
        primary_causes.push(DegradationCause {
            kind: CauseKind::LateralGripLoss,
            confidence: GRIP_LOSS_CAUSE_CONFIDENCE,
            indicators: vec![
                "Reduced lateral G in corners".to_string(),
                "Understeering detected".to_string(),
            ],
        });
    }
    if current
        .steering_increase
        .is_some_and(|increase| increase > STEERING_INCREASE_CAUSE_PCT)
    {
        primary_causes.push(DegradationCause {
            kind: CauseKind::Understeer,
            confidence: UNDERSTEER_CAUSE_CONFIDENCE,
            indicators: vec![
                "Increased steering angle".to_string(),
                "Compensation for grip loss".to_string(),
            ],
        });
    }

    let stint_health = current.degradation_severity.unwrap_or_else(|| {
        DegradationSeverity::classify(current.degradation_score.unwrap_or(0.0), thresholds)
    });
    let recommended_action = match stint_health {
        DegradationSeverity::Critical => "Consider pit window in next 2-3 laps",
        _ => "Monitor closely",
    }
    .to_string();

    Some(DegradationReport {
        lap_number: current_lap,
        curve,
        degradation_rate: current.pace_trend_slope,
        primary_causes,
        stint_health,
        recommended_action,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::{FeatureEngineer, LapFeatureVector};

    fn worn_rows(count: u32) -> Vec<EngineeredFeatureRow> {
        let laps: Vec<_> = (1..=count)
            .map(|n| {
                let wear = n.saturating_sub(3) as f64;
                LapFeatureVector {
                    lap_number: n,
                    lap_time: 90.0 + wear * 0.2,
                    avg_lateral_g: Some(1.5 * (1.0 - wear * 0.03)),
                    avg_steering_abs: Some(20.0 * (1.0 + wear * 0.05)),
                    throttle_variance: Some(100.0 * (1.0 + wear * 0.05)),
                    steering_variance: Some(40.0 + wear),
                    ..Default::default()
                }
            })
            .collect();
        FeatureEngineer::default().engineer(&laps)
    }

    #[test]
    fn test_indicators_need_three_laps() {
        let rows = worn_rows(2);
        assert_eq!(degradation_indicators(&rows), DegradationIndicators::default());
    }

    #[test]
    fn test_indicator_rate_and_confidence() {
        let rows = worn_rows(8);
        let indicators = degradation_indicators(&rows);
        // 5 laps of 0.2s wear over 7 steps
        assert!((indicators.degradation_rate - 1.0 / 7.0).abs() < 1e-9);
        assert!(indicators.lateral_g_trend < 0.0);
        assert!(indicators.steering_variance_trend > 0.0);
        assert!((indicators.confidence - 0.8).abs() < 1e-9);

        let long = degradation_indicators(&worn_rows(15));
        assert_eq!(long.confidence, 1.0);
    }

    #[test]
    fn test_report_for_worn_tyres() {
        let rows = worn_rows(14);
        let report = analyze_degradation(&rows, 14, &SeverityThresholds::default()).unwrap();

        assert_eq!(report.curve.len(), CURVE_LAPS);
        assert_eq!(report.curve.first().unwrap().lap, 5);
        assert!((report.curve.last().unwrap().delta_seconds - 2.2).abs() < 1e-9);
        assert_eq!(report.stint_health, DegradationSeverity::Critical);
        assert_eq!(report.recommended_action, "Consider pit window in next 2-3 laps");
        let kinds: Vec<CauseKind> = report.primary_causes.iter().map(|c| c.kind).collect();
        assert_eq!(kinds, vec![CauseKind::LateralGripLoss, CauseKind::Understeer]);
        assert!(report.degradation_rate > 0.0);
    }

    #[test]
    fn test_report_early_stint_is_optimal() {
        let rows = worn_rows(14);
        let report = analyze_degradation(&rows, 3, &SeverityThresholds::default()).unwrap();
        assert_eq!(report.curve.len(), 3);
        assert_eq!(report.stint_health, DegradationSeverity::Optimal);
        assert!(report.primary_causes.is_empty());
        assert_eq!(report.recommended_action, "Monitor closely");
    }

    #[test]
    fn test_unknown_lap_has_no_report() {
        assert!(analyze_degradation(&worn_rows(5), 9, &SeverityThresholds::default()).is_none());
    }
}
