pub mod dataset;
pub mod engineer;
pub mod stats;

use serde::{Deserialize, Serialize};

use crate::config::FeatureConfig;
use crate::telemetry::{Lap, TelemetryFrame};

pub use dataset::{TrainingSet, build_training_set};
pub use engineer::{DegradationSeverity, EngineeredFeatureRow, FeatureEngineer};

/// Summary statistics of one completed lap.
///
/// A signal that never reported during the lap leaves its features as `None`.
/// Consumers must read that as unknown, never as zero.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct LapFeatureVector {
    pub lap_number: u32,
    pub start_time: f64,
    /// Seconds
    pub lap_time: f64,

    pub avg_speed: Option<f64>,
    pub max_speed: Option<f64>,
    pub min_speed: Option<f64>,
    pub speed_variance: Option<f64>,

    pub avg_throttle: Option<f64>,
    pub throttle_variance: Option<f64>,
    /// Share of frames with the throttle above the full throttle threshold, 0-100
    pub full_throttle_pct: Option<f64>,

    pub avg_brake_front: Option<f64>,
    pub max_brake_front: Option<f64>,
    /// Brake applications crossing the pressure threshold
    pub braking_events: Option<u32>,

    /// Mean absolute lateral acceleration, g
    pub avg_lateral_g: Option<f64>,
    pub max_lateral_g: Option<f64>,
    /// Mean absolute longitudinal acceleration, g
    pub avg_longitudinal_g: Option<f64>,
    /// Strongest deceleration (most negative longitudinal g)
    pub max_brake_g: Option<f64>,

    pub avg_steering_abs: Option<f64>,
    pub steering_variance: Option<f64>,
    pub max_steering_angle: Option<f64>,

    pub avg_rpm: Option<f64>,
    pub max_rpm: Option<f64>,
}

fn readings(frames: &[TelemetryFrame], value: impl Fn(&TelemetryFrame) -> Option<f64>) -> Vec<f64> {
    frames.iter().filter_map(value).collect()
}

fn rising_edges(values: &[f64], threshold: f64) -> u32 {
    let mut events = 0;
    let mut pressed = false;
    for value in values {
        let above = *value > threshold;
        if above && !pressed {
            events += 1;
        }
        pressed = above;
    }
    events
}

/// Compute the summary features of one lap from the frames it spans.
pub fn extract_lap_features(
    lap: &Lap,
    frames: &[TelemetryFrame],
    config: &FeatureConfig,
) -> LapFeatureVector {
    let lap_frames = lap.frames(frames);

    let speed = readings(lap_frames, |f| f.speed_kph);
    let throttle = readings(lap_frames, |f| f.throttle_pct);
    let brake = readings(lap_frames, |f| f.brake_front_bar);
    let lateral = readings(lap_frames, |f| f.accel_lat_g.map(f64::abs));
    let longitudinal = readings(lap_frames, |f| f.accel_long_g);
    let steering = readings(lap_frames, |f| f.steering_angle_deg);
    let steering_abs: Vec<f64> = steering.iter().map(|s| s.abs()).collect();
    let rpm = readings(lap_frames, |f| f.rpm);

    let full_throttle_pct = (!throttle.is_empty()).then(|| {
        let full = throttle
            .iter()
            .filter(|t| **t > config.full_throttle_pct)
            .count();
        full as f64 / throttle.len() as f64 * 100.0
    });

    LapFeatureVector {
        lap_number: lap.lap_number,
        start_time: lap.start_time,
        lap_time: lap.duration(),

        avg_speed: stats::mean(&speed),
        max_speed: stats::max(&speed),
        min_speed: stats::min(&speed),
        speed_variance: stats::sample_variance(&speed),

        avg_throttle: stats::mean(&throttle),
        throttle_variance: stats::sample_variance(&throttle),
        full_throttle_pct,

        avg_brake_front: stats::mean(&brake),
        max_brake_front: stats::max(&brake),
        braking_events: (!brake.is_empty())
            .then(|| rising_edges(&brake, config.braking_pressure_threshold)),

        avg_lateral_g: stats::mean(&lateral),
        max_lateral_g: stats::max(&lateral),
        avg_longitudinal_g: stats::mean(
            &longitudinal.iter().map(|g| g.abs()).collect::<Vec<_>>(),
        ),
        max_brake_g: stats::min(&longitudinal),

        avg_steering_abs: stats::mean(&steering_abs),
        steering_variance: stats::sample_variance(&steering),
        max_steering_angle: stats::max(&steering_abs),

        avg_rpm: stats::mean(&rpm),
        max_rpm: stats::max(&rpm),
    }
}

/// Features of every completed lap. The trailing open lap is left out until
/// it crosses the line.
pub fn lap_features(
    laps: &[Lap],
    frames: &[TelemetryFrame],
    config: &FeatureConfig,
) -> Vec<LapFeatureVector> {
    laps.iter()
        .filter(|lap| lap.closed)
        .map(|lap| extract_lap_features(lap, frames, config))
        .collect()
}
