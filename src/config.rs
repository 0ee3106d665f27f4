use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::RaceCraftError;

const CONFIG_DIR_NAME: &str = "racecraft";
const CONFIG_FILE_NAME: &str = "strategy.json";

/// Track length and wraparound settings have to keep this ratio, otherwise a
/// full lap could be mistaken for noise (or noise for a lap).
pub const MIN_TRACK_TO_THRESHOLD_RATIO: f64 = 2.0;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct SegmenterConfig {
    /// Track length in meters (Barber Motorsports Park = 2380m)
    pub track_length_m: f64,
    /// Negative distance jump, in meters, that marks a start/finish crossing
    pub wraparound_threshold_m: f64,
    /// Accepted difference between detected and expected lap counts
    pub lap_count_tolerance: u32,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            track_length_m: 2380.0,
            wraparound_threshold_m: 100.0,
            lap_count_tolerance: 2,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
#[serde(default)]
pub struct SeverityThresholds {
    /// Scores below this are optimal
    pub degrading: f64,
    /// Scores above this are critical
    pub critical: f64,
}

impl Default for SeverityThresholds {
    fn default() -> Self {
        Self {
            degrading: 5.0,
            critical: 10.0,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
#[serde(default)]
pub struct DegradationWeights {
    pub lateral_grip_loss: f64,
    pub steering_increase: f64,
    pub throttle_hesitation: f64,
}

impl Default for DegradationWeights {
    fn default() -> Self {
        Self {
            lateral_grip_loss: 0.4,
            steering_increase: 0.3,
            throttle_hesitation: 0.3,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct FeatureConfig {
    /// Laps in the causal rolling window
    pub window_size: usize,
    /// Laps at the start of a stint averaged into the degradation baseline
    pub baseline_laps: usize,
    /// Front brake pressure (bar) above which the car counts as braking
    pub braking_pressure_threshold: f64,
    /// Throttle percentage counted as full throttle
    pub full_throttle_pct: f64,
    pub severity: SeverityThresholds,
    pub weights: DegradationWeights,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            window_size: 5,
            baseline_laps: 3,
            braking_pressure_threshold: 10.0,
            full_throttle_pct: 95.0,
            severity: SeverityThresholds::default(),
            weights: DegradationWeights::default(),
        }
    }
}

/// Seeded gaussian jitter added to multi-lap forecasts. Off unless asked for.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct NoiseConfig {
    pub seed: u64,
    pub std_dev_s: f64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ForecastConfig {
    /// Laps of history needed before any forecast is produced
    pub min_history: usize,
    /// Laps of lag features fed to the regressor
    pub lookback: usize,
    /// Upper bound of the forecast horizon
    pub max_laps_ahead: usize,
    pub base_confidence: f64,
    pub confidence_decay: f64,
    pub min_confidence: f64,
    /// Per-lap reduction of the trend factor
    pub trend_decay: f64,
    pub min_trend_factor: f64,
    /// Validation MAE (seconds) the regressor is expected to reach
    pub mae_target_s: f64,
    pub noise: Option<NoiseConfig>,
}

impl Default for ForecastConfig {
    fn default() -> Self {
        Self {
            min_history: 5,
            lookback: 5,
            max_laps_ahead: 5,
            base_confidence: 0.90,
            confidence_decay: 0.06,
            min_confidence: 0.60,
            trend_decay: 0.15,
            min_trend_factor: 0.3,
            mae_target_s: 0.25,
            noise: None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
#[serde(default)]
pub struct ThreatWeights {
    pub pace_advantage: f64,
    pub gap_closing: f64,
    pub sector_advantage: f64,
    pub consistency: f64,
}

impl Default for ThreatWeights {
    fn default() -> Self {
        Self {
            pace_advantage: 0.35,
            gap_closing: 0.30,
            sector_advantage: 0.25,
            consistency: 0.10,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ThreatConfig {
    /// Recent laps compared on each side
    pub lookback_laps: usize,
    /// Laps required on each side before a threat is scored
    pub min_laps: usize,
    /// Gap (s) under which the rival is in attack range
    pub attack_gap_s: f64,
    /// Gap (s) under which the rival is actively closing
    pub close_gap_s: f64,
    /// Gap (s) under which the rival is slowly closing
    pub far_gap_s: f64,
    pub close_closing_rate: f64,
    pub far_closing_rate: f64,
    /// Share of the closing rate converted into seconds gained per lap
    pub closing_rate_to_seconds: f64,
    /// Pace advantage (s/lap) mapped to a full pace factor
    pub pace_normalization_s: f64,
    /// Lap-time standard deviation (s) mapped to zero consistency
    pub consistency_normalization_s: f64,
    pub speed_margin_kph: f64,
    pub lateral_g_margin: f64,
    pub brake_variance_margin: f64,
    pub straight_speed_credit_s: f64,
    pub cornering_credit_s: f64,
    pub braking_credit_s: f64,
    pub imminent_multiplier: f64,
    pub close_multiplier: f64,
    pub high_threshold: f64,
    pub medium_threshold: f64,
    /// Pace advantage (s/lap) worth flagging in the recommendations
    pub significant_pace_advantage_s: f64,
    pub weights: ThreatWeights,
}

impl Default for ThreatConfig {
    fn default() -> Self {
        Self {
            lookback_laps: 5,
            min_laps: 3,
            attack_gap_s: 1.0,
            close_gap_s: 2.0,
            far_gap_s: 5.0,
            close_closing_rate: 0.5,
            far_closing_rate: 0.2,
            closing_rate_to_seconds: 0.5,
            pace_normalization_s: 1.0,
            consistency_normalization_s: 1.0,
            speed_margin_kph: 2.0,
            lateral_g_margin: 0.05,
            brake_variance_margin: 1.0,
            straight_speed_credit_s: 0.15,
            cornering_credit_s: 0.12,
            braking_credit_s: 0.10,
            imminent_multiplier: 1.5,
            close_multiplier: 1.2,
            high_threshold: 0.7,
            medium_threshold: 0.4,
            significant_pace_advantage_s: 0.5,
            weights: ThreatWeights::default(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct AggregatorConfig {
    /// Gap-to-ahead (s) under which consecutive cars form a battle
    pub battle_gap_s: f64,
    /// Recent laps used for pace comparisons
    pub pace_window: usize,
    /// Half-stint pace change (s) needed to call a trend
    pub trend_margin_s: f64,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            battle_gap_s: 2.0,
            pace_window: 5,
            trend_margin_s: 0.1,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub struct StrategyConfig {
    pub segmenter: SegmenterConfig,
    pub features: FeatureConfig,
    pub forecast: ForecastConfig,
    pub threat: ThreatConfig,
    pub aggregator: AggregatorConfig,
}

fn invalid(field: &str, reason: impl Into<String>) -> RaceCraftError {
    RaceCraftError::InvalidConfiguration {
        field: field.to_string(),
        reason: reason.into(),
    }
}

impl StrategyConfig {
    /// Load the config stored in the user's config directory, if any.
    pub fn from_local_file() -> Result<Option<Self>, RaceCraftError> {
        let config_path = dirs::config_dir()
            .ok_or(RaceCraftError::NoConfigDir)?
            .join(CONFIG_DIR_NAME)
            .join(CONFIG_FILE_NAME);

        if config_path.exists() {
            Self::from_path(&config_path).map(Some)
        } else {
            Ok(None)
        }
    }

    pub fn from_path(path: &Path) -> Result<Self, RaceCraftError> {
        let file =
            std::fs::File::open(path).map_err(|e| RaceCraftError::ConfigIOError { source: e })?;
        let config: Self = serde_json::from_reader(std::io::BufReader::new(file))
            .map_err(|e| RaceCraftError::ConfigSerializeError { source: e })?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self) -> Result<(), RaceCraftError> {
        let config_path = dirs::config_dir()
            .ok_or(RaceCraftError::NoConfigDir)?
            .join(CONFIG_DIR_NAME)
            .join(CONFIG_FILE_NAME);
        self.save_to(&config_path)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), RaceCraftError> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| RaceCraftError::ConfigIOError { source: e })?;
            }
        }

        let file =
            std::fs::File::create(path).map_err(|e| RaceCraftError::ConfigIOError { source: e })?;
        serde_json::to_writer_pretty(file, self)
            .map_err(|e| RaceCraftError::ConfigSerializeError { source: e })
    }

    /// Reject settings that would make a component silently misbehave.
    pub fn validate(&self) -> Result<(), RaceCraftError> {
        let seg = &self.segmenter;
        if !seg.wraparound_threshold_m.is_finite() || seg.wraparound_threshold_m <= 0.0 {
            return Err(RaceCraftError::InvalidThreshold {
                threshold: seg.wraparound_threshold_m,
            });
        }
        if !seg.track_length_m.is_finite()
            || seg.track_length_m < seg.wraparound_threshold_m * MIN_TRACK_TO_THRESHOLD_RATIO
        {
            return Err(RaceCraftError::InvalidTrackLength {
                track_length: seg.track_length_m,
                threshold: seg.wraparound_threshold_m,
                reason: format!(
                    "track must be at least {MIN_TRACK_TO_THRESHOLD_RATIO}x the wraparound threshold"
                ),
            });
        }

        let features = &self.features;
        if features.window_size == 0 {
            return Err(invalid("features.window_size", "must be at least 1 lap"));
        }
        if features.baseline_laps == 0 {
            return Err(invalid("features.baseline_laps", "must be at least 1 lap"));
        }
        if features.severity.degrading > features.severity.critical {
            return Err(invalid(
                "features.severity",
                "degrading threshold must not exceed critical threshold",
            ));
        }
        let w = features.weights;
        if [w.lateral_grip_loss, w.steering_increase, w.throttle_hesitation]
            .iter()
            .any(|weight| !weight.is_finite() || *weight < 0.0)
        {
            return Err(invalid("features.weights", "weights must be non-negative"));
        }

        let forecast = &self.forecast;
        if forecast.lookback == 0 {
            return Err(invalid("forecast.lookback", "must be at least 1 lap"));
        }
        if forecast.min_history < forecast.lookback {
            return Err(invalid(
                "forecast.min_history",
                "must cover at least the regressor lookback",
            ));
        }
        if forecast.max_laps_ahead == 0 {
            return Err(invalid("forecast.max_laps_ahead", "must be at least 1 lap"));
        }
        if !(0.0..=1.0).contains(&forecast.min_confidence)
            || !(forecast.min_confidence..=1.0).contains(&forecast.base_confidence)
        {
            return Err(invalid(
                "forecast.confidence",
                "expected 0 <= min_confidence <= base_confidence <= 1",
            ));
        }

        let threat = &self.threat;
        if threat.lookback_laps < threat.min_laps || threat.min_laps == 0 {
            return Err(invalid(
                "threat.lookback_laps",
                "lookback must cover the minimum lap count",
            ));
        }
        if !(threat.attack_gap_s < threat.close_gap_s && threat.close_gap_s < threat.far_gap_s) {
            return Err(invalid(
                "threat.gaps",
                "expected attack_gap_s < close_gap_s < far_gap_s",
            ));
        }
        if threat.medium_threshold > threat.high_threshold {
            return Err(invalid(
                "threat.thresholds",
                "medium threshold must not exceed high threshold",
            ));
        }
        if threat.pace_normalization_s <= 0.0 || threat.consistency_normalization_s <= 0.0 {
            return Err(invalid("threat.normalization", "must be positive"));
        }

        let aggregator = &self.aggregator;
        if aggregator.battle_gap_s < 0.0 {
            return Err(invalid("aggregator.battle_gap_s", "must not be negative"));
        }
        if aggregator.pace_window == 0 {
            return Err(invalid("aggregator.pace_window", "must be at least 1 lap"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config_is_valid() {
        assert!(StrategyConfig::default().validate().is_ok());
    }

    #[test]
    fn test_track_shorter_than_threshold_rejected() {
        let mut config = StrategyConfig::default();
        config.segmenter.track_length_m = 150.0;
        let result = config.validate();
        assert!(matches!(
            result,
            Err(RaceCraftError::InvalidTrackLength { .. })
        ));
    }

    #[test]
    fn test_non_monotonic_threat_gaps_rejected() {
        let mut config = StrategyConfig::default();
        config.threat.close_gap_s = 6.0;
        assert!(matches!(
            config.validate(),
            Err(RaceCraftError::InvalidConfiguration { field, .. }) if field == "threat.gaps"
        ));
    }

    #[test]
    fn test_zero_window_rejected() {
        let mut config = StrategyConfig::default();
        config.features.window_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_severity_thresholds_must_be_ordered() {
        let mut config = StrategyConfig::default();
        config.features.severity = SeverityThresholds {
            degrading: 12.0,
            critical: 10.0,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join(CONFIG_FILE_NAME);

        let mut config = StrategyConfig::default();
        config.segmenter.track_length_m = 5513.0;
        config.aggregator.battle_gap_s = 1.5;
        config.save_to(&path).unwrap();

        let loaded = StrategyConfig::from_path(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, r#"{"segmenter": {"track_length_m": 4052.0}}"#).unwrap();

        let loaded = StrategyConfig::from_path(&path).unwrap();
        assert_eq!(loaded.segmenter.track_length_m, 4052.0);
        assert_eq!(loaded.segmenter.wraparound_threshold_m, 100.0);
        assert_eq!(loaded.features.window_size, 5);
    }

    #[test]
    fn test_invalid_file_is_rejected_on_load() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, r#"{"segmenter": {"track_length_m": 10.0}}"#).unwrap();

        assert!(StrategyConfig::from_path(&path).is_err());
    }
}
