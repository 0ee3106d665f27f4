use log::{debug, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::config::{ForecastConfig, NoiseConfig};
use crate::features::EngineeredFeatureRow;

use super::model::PaceModel;

/// Lap-over-lap change under which pace counts as stable, seconds.
pub const STABLE_TREND_BAND_S: f64 = 0.05;

/// How the session forecasts pace. Chosen once per session.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum Forecaster {
    Trained(PaceModel),
    #[default]
    TrendOnly,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ForecastSource {
    Model,
    Trend,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ForecastStatus {
    Ready,
    InsufficientData { available: usize, required: usize },
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PaceTrend {
    Improving,
    Stable,
    Degrading,
}

impl PaceTrend {
    /// Classify a lap time change in seconds per lap.
    pub fn from_change(change_s: f64, band_s: f64) -> Self {
        if change_s > band_s {
            PaceTrend::Degrading
        } else if change_s < -band_s {
            PaceTrend::Improving
        } else {
            PaceTrend::Stable
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PacePrediction {
    pub lap_number: u32,
    pub predicted_time: f64,
    /// Predicted minus current pace
    pub delta: f64,
    pub confidence: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PaceForecast {
    pub status: ForecastStatus,
    pub predictions: Vec<PacePrediction>,
    pub current_pace: Option<f64>,
    /// Seconds per lap used to extrapolate
    pub trend_s: f64,
    pub trend: PaceTrend,
    pub source: ForecastSource,
}

impl PaceForecast {
    fn insufficient(available: usize, required: usize) -> Self {
        Self {
            status: ForecastStatus::InsufficientData {
                available,
                required,
            },
            predictions: Vec::new(),
            current_pace: None,
            trend_s: 0.0,
            trend: PaceTrend::Stable,
            source: ForecastSource::Trend,
        }
    }
}

/// Standard normal draw from two uniforms (Box-Muller).
fn standard_normal(rng: &mut StdRng) -> f64 {
    let u1: f64 = rng.random::<f64>().max(f64::MIN_POSITIVE);
    let u2: f64 = rng.random::<f64>();
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}

/// Predicts the next laps from an engineered feature history.
#[derive(Clone, Debug)]
pub struct PaceForecaster {
    config: ForecastConfig,
    forecaster: Forecaster,
}

impl PaceForecaster {
    pub fn new(config: ForecastConfig, forecaster: Forecaster) -> Self {
        Self { config, forecaster }
    }

    pub fn trend_only(config: ForecastConfig) -> Self {
        Self::new(config, Forecaster::TrendOnly)
    }

    pub fn forecaster(&self) -> &Forecaster {
        &self.forecaster
    }

    /// Trend in seconds per lap: the rolling slope, or half the change over
    /// the last three laps when the slope is unreliable.
    fn trend(history: &[EngineeredFeatureRow]) -> f64 {
        let Some(last) = history.last() else {
            return 0.0;
        };
        if !last.trend_low_confidence {
            return last.pace_trend_slope;
        }
        if history.len() >= 3 {
            (last.lap_time() - history[history.len() - 3].lap_time()) / 2.0
        } else {
            0.0
        }
    }

    fn confidence(&self, laps_ahead: usize) -> f64 {
        (self.config.base_confidence - self.config.confidence_decay * (laps_ahead - 1) as f64)
            .max(self.config.min_confidence)
    }

    fn trend_factor(&self, laps_ahead: usize) -> f64 {
        (1.0 - self.config.trend_decay * (laps_ahead - 1) as f64).max(self.config.min_trend_factor)
    }

    /// Forecast `laps_ahead` laps, clamped to the configured range.
    ///
    /// Without enough history the result is empty and flagged, never an error.
    pub fn predict(&self, history: &[EngineeredFeatureRow], laps_ahead: usize) -> PaceForecast {
        if history.len() < self.config.min_history {
            debug!(
                "Need at least {} laps to forecast pace, got {}",
                self.config.min_history,
                history.len()
            );
            return PaceForecast::insufficient(history.len(), self.config.min_history);
        }
        let Some(last) = history.last() else {
            return PaceForecast::insufficient(0, self.config.min_history);
        };

        let max_laps = self.config.max_laps_ahead.max(1);
        let laps_ahead = if (1..=max_laps).contains(&laps_ahead) {
            laps_ahead
        } else {
            warn!(
                "Requested {} laps ahead, clamping to [1, {}]",
                laps_ahead, max_laps
            );
            laps_ahead.clamp(1, max_laps)
        };

        let current_pace = last.lap_time();
        let trend = Self::trend(history);

        let (first, source) = match &self.forecaster {
            Forecaster::Trained(model) => match model.predict_next(history) {
                Some(prediction) => (prediction, ForecastSource::Model),
                None => {
                    warn!("Model prediction failed, using trend");
                    (current_pace + trend, ForecastSource::Trend)
                }
            },
            Forecaster::TrendOnly => (current_pace + trend, ForecastSource::Trend),
        };

        let mut noise = self
            .config
            .noise
            .as_ref()
            .map(|NoiseConfig { seed, std_dev_s }| (StdRng::seed_from_u64(*seed), *std_dev_s));

        let mut predictions = Vec::with_capacity(laps_ahead);
        let mut previous = first;
        for k in 1..=laps_ahead {
            let mut predicted = first;
            if k > 1 {
                predicted = previous + trend * self.trend_factor(k);
                if let Some((rng, std_dev)) = noise.as_mut() {
                    predicted += standard_normal(rng) * *std_dev;
                }
            }
            predictions.push(PacePrediction {
                lap_number: last.lap_number() + k as u32,
                predicted_time: predicted,
                delta: predicted - current_pace,
                confidence: self.confidence(k),
            });
            previous = predicted;
        }

        debug!("Predicted next {} laps ({:?})", predictions.len(), source);

        PaceForecast {
            status: ForecastStatus::Ready,
            predictions,
            current_pace: Some(current_pace),
            trend_s: trend,
            trend: PaceTrend::from_change(trend, STABLE_TREND_BAND_S),
            source,
        }
    }
}
