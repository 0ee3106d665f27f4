pub mod degradation;
pub mod model;
pub mod pace;
pub mod pit;
pub mod threat;

use serde::{Deserialize, Serialize};

pub use degradation::{DegradationIndicators, DegradationReport, analyze_degradation, degradation_indicators};
pub use model::{PaceModel, TrainingMetrics, TrainingTask, train};
pub use pace::{ForecastSource, ForecastStatus, Forecaster, PaceForecast, PaceForecaster, PacePrediction, PaceTrend};
pub use pit::{PitOptimizer, PitRecommendation, PitScenario, PitWindow, RiskLevel, StrategicOpportunity};
pub use threat::{AttackEta, GapTrend, ThreatAssessment, ThreatDetector, ThreatLevel};

/// Output of one strategy engine for one vehicle.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StrategyOutput {
    Pace(PaceForecast),
    Threat(ThreatAssessment),
    Pit(PitRecommendation),
}
