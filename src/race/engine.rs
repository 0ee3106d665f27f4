use log::debug;

use crate::RaceCraftError;
use crate::config::StrategyConfig;
use crate::features::{EngineeredFeatureRow, FeatureEngineer, LapFeatureVector};
use crate::strategy::{
    DegradationReport, Forecaster, PaceForecast, PaceForecaster, PitOptimizer, PitRecommendation,
    ThreatAssessment, ThreatDetector, analyze_degradation, degradation_indicators,
};
use crate::telemetry::sectors::{SectorAnalyzer, SectorTime};
use crate::telemetry::{Lap, LapSegmenter, Segmentation, TelemetryFrame};

use super::aggregator::{Aggregator, LeaderboardEntry, VehicleHistories};

/// The strategy pipeline for one configuration. Every operation is a pure
/// function of its inputs.
#[derive(Clone, Debug)]
pub struct StrategyEngine {
    config: StrategyConfig,
    segmenter: LapSegmenter,
    sectors: SectorAnalyzer,
    engineer: FeatureEngineer,
    forecaster: PaceForecaster,
    threat: ThreatDetector,
    pit: PitOptimizer,
    aggregator: Aggregator,
}

impl StrategyEngine {
    pub fn new(config: StrategyConfig, forecaster: Forecaster) -> Result<Self, RaceCraftError> {
        config.validate()?;
        Ok(Self {
            segmenter: LapSegmenter::from_config(&config.segmenter)?,
            sectors: SectorAnalyzer::new(config.segmenter.track_length_m),
            engineer: FeatureEngineer::new(config.features.clone()),
            forecaster: PaceForecaster::new(config.forecast.clone(), forecaster),
            threat: ThreatDetector::new(config.threat.clone()),
            pit: PitOptimizer,
            aggregator: Aggregator::new(config.aggregator.clone()),
            config,
        })
    }

    pub fn trend_only(config: StrategyConfig) -> Result<Self, RaceCraftError> {
        Self::new(config, Forecaster::TrendOnly)
    }

    pub fn config(&self) -> &StrategyConfig {
        &self.config
    }

    pub fn forecaster(&self) -> &Forecaster {
        self.forecaster.forecaster()
    }

    pub fn aggregator(&self) -> &Aggregator {
        &self.aggregator
    }

    /// Same engine for a track of another length.
    pub fn with_track_length(&self, track_length_m: f64) -> Result<Self, RaceCraftError> {
        let mut config = self.config.clone();
        config.segmenter.track_length_m = track_length_m;
        Self::new(config, self.forecaster.forecaster().clone())
    }

    pub fn segment(&self, frames: &[TelemetryFrame], expected_laps: Option<u32>) -> Segmentation {
        self.segmenter.segment_validated(frames, expected_laps)
    }

    /// Features of each completed lap in `frames`.
    pub fn segment_and_extract(&self, frames: &[TelemetryFrame]) -> Vec<LapFeatureVector> {
        let laps = self.segmenter.segment(frames);
        self.engineer.lap_features(&laps, frames)
    }

    pub fn lap_features(&self, laps: &[Lap], frames: &[TelemetryFrame]) -> Vec<LapFeatureVector> {
        self.engineer.lap_features(laps, frames)
    }

    /// Sector times of each completed lap in `frames`, in lap order.
    pub fn sector_times(&self, frames: &[TelemetryFrame]) -> Vec<Vec<SectorTime>> {
        self.segmenter
            .segment(frames)
            .iter()
            .filter(|lap| lap.closed)
            .map(|lap| self.sectors.sector_times(lap.frames(frames)))
            .collect()
    }

    pub fn engineer(&self, features: &[LapFeatureVector]) -> Vec<EngineeredFeatureRow> {
        self.engineer.engineer(features)
    }

    pub fn engineer_stints(
        &self,
        features: &[LapFeatureVector],
        stint_starts: &[u32],
    ) -> Vec<EngineeredFeatureRow> {
        self.engineer.engineer_stints(features, stint_starts)
    }

    pub fn forecast_pace(&self, history: &[EngineeredFeatureRow], laps_ahead: usize) -> PaceForecast {
        self.forecaster.predict(history, laps_ahead)
    }

    pub fn assess_threat(
        &self,
        own: &[EngineeredFeatureRow],
        rival: &[EngineeredFeatureRow],
        gap: f64,
    ) -> ThreatAssessment {
        self.threat.assess(own, rival, gap)
    }

    pub fn assess_threat_at_lap(
        &self,
        own: &[EngineeredFeatureRow],
        rival: &[EngineeredFeatureRow],
        gap: f64,
        current_lap: u32,
    ) -> ThreatAssessment {
        self.threat.assess_at_lap(own, rival, gap, Some(current_lap))
    }

    pub fn optimize_pit(
        &self,
        history: &[EngineeredFeatureRow],
        current_lap: u32,
        position: u32,
        total_laps: u32,
    ) -> PitRecommendation {
        self.optimize_pit_against(history, current_lap, position, total_laps, 0)
    }

    /// Pit recommendation for the current stint. The degradation rate is the
    /// mean lap over lap change of the stint's laps up to `current_lap`.
    pub fn optimize_pit_against(
        &self,
        history: &[EngineeredFeatureRow],
        current_lap: u32,
        position: u32,
        total_laps: u32,
        rival_count: usize,
    ) -> PitRecommendation {
        let completed: Vec<EngineeredFeatureRow> = history
            .iter()
            .filter(|r| r.lap_number() <= current_lap)
            .cloned()
            .collect();
        let stint = completed.last().map(|r| r.stint).unwrap_or(1);
        let stint_laps: Vec<EngineeredFeatureRow> =
            completed.into_iter().filter(|r| r.stint == stint).collect();

        let indicators = degradation_indicators(&stint_laps);
        debug!(
            "Degradation rate {:.3}s/lap over {} laps (confidence {:.1})",
            indicators.degradation_rate,
            stint_laps.len(),
            indicators.confidence
        );
        self.pit.optimize_with_rivals(
            &stint_laps,
            current_lap,
            position,
            total_laps,
            indicators.degradation_rate,
            rival_count,
        )
    }

    pub fn analyze_degradation(
        &self,
        history: &[EngineeredFeatureRow],
        current_lap: u32,
    ) -> Option<DegradationReport> {
        analyze_degradation(history, current_lap, &self.config.features.severity)
    }

    pub fn build_leaderboard(&self, histories: &VehicleHistories) -> Vec<LeaderboardEntry> {
        self.aggregator.build_leaderboard(histories, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SegmenterConfig;

    fn frames(laps: u32, points_per_lap: u32) -> Vec<TelemetryFrame> {
        let mut frames = Vec::new();
        let mut time = 0.0;
        for lap in 0..laps {
            for point in 0..points_per_lap {
                frames.push(TelemetryFrame {
                    time,
                    lap_distance_m: Some(2380.0 * point as f64 / points_per_lap as f64),
                    speed_kph: Some(120.0 + lap as f64),
                    throttle_pct: Some(80.0),
                    ..Default::default()
                });
                time += 90.0 / points_per_lap as f64;
            }
        }
        frames
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = StrategyConfig {
            segmenter: SegmenterConfig {
                track_length_m: 50.0,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(matches!(
            StrategyEngine::trend_only(config),
            Err(RaceCraftError::InvalidTrackLength { .. })
        ));
    }

    #[test]
    fn test_open_lap_not_extracted() {
        let engine = StrategyEngine::trend_only(StrategyConfig::default()).unwrap();
        let features = engine.segment_and_extract(&frames(4, 60));
        assert_eq!(features.len(), 3);
        assert!((features[0].lap_time - 90.0).abs() < 1e-6);
        assert_eq!(features[2].avg_speed, Some(122.0));
    }

    #[test]
    fn test_pit_uses_current_stint_only() {
        let engine = StrategyEngine::trend_only(StrategyConfig::default()).unwrap();
        let laps: Vec<LapFeatureVector> = (1..=14)
            .map(|n| LapFeatureVector {
                lap_number: n,
                // slow first stint, steady second
                lap_time: if n < 8 { 90.0 + n as f64 } else { 90.0 },
                ..Default::default()
            })
            .collect();
        let rows = engine.engineer_stints(&laps, &[1, 8]);

        let recommendation = engine.optimize_pit(&rows, 14, 4, 40);
        // no degradation in the current stint means a half distance target
        assert_eq!(recommendation.critical_lap, 20);
    }

    #[test]
    fn test_sector_times_per_closed_lap() {
        let engine = StrategyEngine::trend_only(StrategyConfig::default()).unwrap();
        let sectors = engine.sector_times(&frames(4, 60));
        assert_eq!(sectors.len(), 3);
        for lap in &sectors {
            assert_eq!(lap.len(), 3);
            assert!(lap.iter().all(|sector| sector.time_s > 0.0 && sector.time_s < 30.0));
        }
    }

    #[test]
    fn test_retargeted_track_length() {
        let engine = StrategyEngine::trend_only(StrategyConfig::default()).unwrap();
        let shorter = engine.with_track_length(1200.0).unwrap();
        assert_eq!(shorter.config().segmenter.track_length_m, 1200.0);
        assert!(engine.with_track_length(120.0).is_err());
    }
}
