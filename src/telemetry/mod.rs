pub mod sectors;
pub mod segmentation;
pub mod source;

use std::collections::BTreeMap;

use itertools::Itertools;
use log::debug;
use serde::{Deserialize, Serialize};

pub use segmentation::{Lap, LapSegmenter, Segmentation, SegmentationWarning};
pub use source::{JsonlTelemetrySource, TelemetryBatch, TelemetrySource, VehicleDirectory, VehicleInfo};

/// Telemetry channels understood by the pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Signal {
    /// Vehicle speed, km/h
    Speed,
    /// Steering wheel angle, degrees
    SteeringAngle,
    /// Throttle pedal position, 0-100%
    Throttle,
    /// Front brake pressure, bar
    BrakeFront,
    /// Rear brake pressure, bar
    BrakeRear,
    /// Longitudinal acceleration, g (negative = braking)
    AccelLongitudinal,
    /// Lateral acceleration, g
    AccelLateral,
    /// Meters traveled from S/F this lap
    LapDistance,
    GpsLatitude,
    GpsLongitude,
    /// Engine speed, RPM
    Rpm,
    Gear,
    /// Lap counter reported by the logger. Unreliable, never used to segment.
    ReportedLap,
}

impl Signal {
    pub const ALL: [Signal; 13] = [
        Signal::Speed,
        Signal::SteeringAngle,
        Signal::Throttle,
        Signal::BrakeFront,
        Signal::BrakeRear,
        Signal::AccelLongitudinal,
        Signal::AccelLateral,
        Signal::LapDistance,
        Signal::GpsLatitude,
        Signal::GpsLongitude,
        Signal::Rpm,
        Signal::Gear,
        Signal::ReportedLap,
    ];

    /// Channel name as written by the data logger.
    pub fn name(&self) -> &'static str {
        match self {
            Signal::Speed => "speed",
            Signal::SteeringAngle => "Steering_Angle",
            Signal::Throttle => "aps",
            Signal::BrakeFront => "pbrake_f",
            Signal::BrakeRear => "pbrake_r",
            Signal::AccelLongitudinal => "accx_can",
            Signal::AccelLateral => "accy_can",
            Signal::LapDistance => "Laptrigger_lapdist_dls",
            Signal::GpsLatitude => "VBOX_Lat_Min",
            Signal::GpsLongitude => "VBOX_Long_Minutes",
            Signal::Rpm => "nmot",
            Signal::Gear => "gear",
            Signal::ReportedLap => "lap",
        }
    }

    /// Resolve a logger channel name or one of its readable aliases.
    pub fn from_name(name: &str) -> Option<Signal> {
        let signal = match name {
            "speed" | "Speed" => Signal::Speed,
            "Steering_Angle" | "steering_angle" => Signal::SteeringAngle,
            "aps" | "ath" | "throttle" => Signal::Throttle,
            "pbrake_f" | "brake_front" => Signal::BrakeFront,
            "pbrake_r" | "brake_rear" => Signal::BrakeRear,
            "accx_can" | "accel_long" => Signal::AccelLongitudinal,
            "accy_can" | "accel_lat" => Signal::AccelLateral,
            "Laptrigger_lapdist_dls" | "lapdist" | "lap_distance" => Signal::LapDistance,
            "VBOX_Lat_Min" | "gps_lat" => Signal::GpsLatitude,
            "VBOX_Long_Minutes" | "gps_lon" => Signal::GpsLongitude,
            "nmot" | "rpm" => Signal::Rpm,
            "gear" => Signal::Gear,
            "lap" => Signal::ReportedLap,
            _ => return None,
        };
        Some(signal)
    }
}

/// One sensor reading at one instant for one vehicle.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TelemetrySample {
    /// Seconds on the session clock
    #[serde(alias = "meta_time")]
    pub time: f64,
    pub vehicle_id: String,
    #[serde(alias = "telemetry_name")]
    pub signal_name: String,
    #[serde(alias = "telemetry_value")]
    pub value: f64,
}

impl TelemetrySample {
    pub fn new(time: f64, vehicle_id: &str, signal: Signal, value: f64) -> Self {
        Self {
            time,
            vehicle_id: vehicle_id.to_string(),
            signal_name: signal.name().to_string(),
            value,
        }
    }
}

/// All known signals for one vehicle at one timestamp, forward filled.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct TelemetryFrame {
    pub time: f64,
    pub speed_kph: Option<f64>,
    pub steering_angle_deg: Option<f64>,
    pub throttle_pct: Option<f64>,
    pub brake_front_bar: Option<f64>,
    pub brake_rear_bar: Option<f64>,
    pub accel_long_g: Option<f64>,
    pub accel_lat_g: Option<f64>,
    pub lap_distance_m: Option<f64>,
    pub gps_lat: Option<f64>,
    pub gps_lon: Option<f64>,
    pub rpm: Option<f64>,
    pub gear: Option<f64>,
    pub reported_lap: Option<f64>,
}

impl TelemetryFrame {
    pub fn get(&self, signal: Signal) -> Option<f64> {
        match signal {
            Signal::Speed => self.speed_kph,
            Signal::SteeringAngle => self.steering_angle_deg,
            Signal::Throttle => self.throttle_pct,
            Signal::BrakeFront => self.brake_front_bar,
            Signal::BrakeRear => self.brake_rear_bar,
            Signal::AccelLongitudinal => self.accel_long_g,
            Signal::AccelLateral => self.accel_lat_g,
            Signal::LapDistance => self.lap_distance_m,
            Signal::GpsLatitude => self.gps_lat,
            Signal::GpsLongitude => self.gps_lon,
            Signal::Rpm => self.rpm,
            Signal::Gear => self.gear,
            Signal::ReportedLap => self.reported_lap,
        }
    }

    pub fn set(&mut self, signal: Signal, value: f64) {
        let slot = match signal {
            Signal::Speed => &mut self.speed_kph,
            Signal::SteeringAngle => &mut self.steering_angle_deg,
            Signal::Throttle => &mut self.throttle_pct,
            Signal::BrakeFront => &mut self.brake_front_bar,
            Signal::BrakeRear => &mut self.brake_rear_bar,
            Signal::AccelLongitudinal => &mut self.accel_long_g,
            Signal::AccelLateral => &mut self.accel_lat_g,
            Signal::LapDistance => &mut self.lap_distance_m,
            Signal::GpsLatitude => &mut self.gps_lat,
            Signal::GpsLongitude => &mut self.gps_lon,
            Signal::Rpm => &mut self.rpm,
            Signal::Gear => &mut self.gear,
            Signal::ReportedLap => &mut self.reported_lap,
        };
        *slot = Some(value);
    }
}

/// Merge one vehicle's samples into time-ordered frames.
///
/// Samples may arrive out of order; they are stably sorted by time and every
/// distinct timestamp becomes one frame. A signal missing at a timestamp keeps
/// the last value seen for it (sensor dropout tolerance). Non-finite readings
/// count as dropouts and unknown channels are ignored.
pub fn merge_samples<'a>(
    samples: impl IntoIterator<Item = &'a TelemetrySample>,
) -> Vec<TelemetryFrame> {
    let mut skipped = 0usize;
    let ordered = samples
        .into_iter()
        .filter(|sample| {
            let keep = sample.time.is_finite();
            if !keep {
                skipped += 1;
            }
            keep
        })
        .sorted_by(|a, b| a.time.total_cmp(&b.time))
        .collect_vec();

    let mut frames: Vec<TelemetryFrame> = Vec::new();
    let mut last_known = TelemetryFrame::default();
    let mut unknown_signals = 0usize;

    for (time, group) in &ordered.into_iter().chunk_by(|sample| sample.time) {
        for sample in group {
            match Signal::from_name(&sample.signal_name) {
                Some(signal) if sample.value.is_finite() => last_known.set(signal, sample.value),
                Some(_) => skipped += 1,
                None => unknown_signals += 1,
            }
        }
        last_known.time = time;
        frames.push(last_known.clone());
    }

    if skipped > 0 || unknown_signals > 0 {
        debug!(
            "Merged {} frames ({} non-finite samples dropped, {} samples on unknown channels)",
            frames.len(),
            skipped,
            unknown_signals
        );
    }

    frames
}

/// Split a mixed-vehicle sample stream and merge each vehicle's frames.
pub fn frames_by_vehicle(samples: &[TelemetrySample]) -> BTreeMap<String, Vec<TelemetryFrame>> {
    let mut grouped: BTreeMap<&str, Vec<&TelemetrySample>> = BTreeMap::new();
    for sample in samples {
        grouped
            .entry(sample.vehicle_id.as_str())
            .or_default()
            .push(sample);
    }

    grouped
        .into_iter()
        .map(|(vehicle_id, vehicle_samples)| {
            (vehicle_id.to_string(), merge_samples(vehicle_samples))
        })
        .collect()
}
