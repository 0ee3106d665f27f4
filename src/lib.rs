// Library interface for racecraft
// Also used by the integration tests and benchmarks

pub mod config;
pub mod errors;
pub mod features;
pub mod race;
pub mod strategy;
pub mod telemetry;

// Re-export commonly used types
pub use config::StrategyConfig;
pub use errors::RaceCraftError;
pub use features::{EngineeredFeatureRow, FeatureEngineer, LapFeatureVector};
pub use race::{Aggregator, LeaderboardEntry, RaceSession, StrategyEngine};
pub use strategy::{
    Forecaster, PaceForecast, PaceForecaster, PitOptimizer, PitRecommendation, StrategyOutput,
    ThreatAssessment, ThreatDetector,
};
pub use telemetry::{LapSegmenter, TelemetryFrame, TelemetrySample};
