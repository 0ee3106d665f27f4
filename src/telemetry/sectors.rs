use serde::{Deserialize, Serialize};
use uom::si::f64::{Length, Time, Velocity};
use uom::si::length::meter;
use uom::si::time::second;
use uom::si::velocity::kilometer_per_hour;

use crate::features::stats;

use super::TelemetryFrame;

pub const SECTOR_COUNT: usize = 3;
/// Time deltas inside this margin count as an even sector.
pub const SECTOR_ADVANTAGE_MARGIN_S: f64 = 0.05;
/// Coefficient of variation (in percent) at which consistency reaches zero.
const CONSISTENCY_CV_SCALE: f64 = 10.0;
/// Quickest passes averaged into an optimal sector.
pub const OPTIMAL_SECTOR_LAPS: usize = 3;
const SECTOR_ISSUE_TIME_LOSS_S: f64 = 0.2;
const SECTOR_ISSUE_HIGH_TIME_LOSS_S: f64 = 0.5;
const SECTOR_ISSUE_SPEED_DEFICIT_KPH: f64 = 5.0;
const SECTOR_ISSUE_THROTTLE_DEFICIT_PCT: f64 = 10.0;
const SECTOR_ISSUE_BRAKE_EXCESS_BAR: f64 = 5.0;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SectorTime {
    /// 1-based
    pub sector: usize,
    pub time_s: f64,
    pub avg_speed_kph: f64,
    pub avg_throttle_pct: Option<f64>,
    pub avg_brake_bar: Option<f64>,
    pub avg_lateral_g: Option<f64>,
    pub distance_m: f64,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SectorAdvantage {
    Own,
    Rival,
    Even,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SectorComparison {
    pub sector: usize,
    pub own_time_s: f64,
    pub rival_time_s: f64,
    /// Positive when the rival is quicker
    pub time_delta_s: f64,
    pub speed_delta_kph: f64,
    pub advantage: SectorAdvantage,
    pub advantage_margin_s: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SectorConsistency {
    pub sector: usize,
    pub mean_time_s: f64,
    pub std_dev_s: f64,
    pub coefficient_of_variation: f64,
    /// 0 to 1, higher is more consistent
    pub consistency_score: f64,
    pub sample_size: usize,
}

/// Reference characteristics from the quickest laps through a sector.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct OptimalSector {
    pub sector: usize,
    pub best_time_s: f64,
    pub optimal_speed_kph: f64,
    pub optimal_throttle_pct: Option<f64>,
    pub optimal_brake_bar: Option<f64>,
    pub time_std_dev_s: f64,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum IssueSeverity {
    Medium,
    High,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SectorIssue {
    pub sector: usize,
    pub time_loss_s: f64,
    pub severity: IssueSeverity,
    pub potential_causes: Vec<String>,
}

/// Sector picture of one vehicle over its completed laps.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SectorReport {
    pub last_lap: Vec<SectorTime>,
    pub consistency: Vec<SectorConsistency>,
    pub optimal: Vec<OptimalSector>,
    /// Sectors of the last lap slower than the optimal pass
    pub issues: Vec<SectorIssue>,
}

impl SectorReport {
    /// `None` until one lap is complete.
    pub fn from_laps(history: &[Vec<SectorTime>]) -> Option<Self> {
        let last_lap = history.last()?.clone();
        let optimal = optimal_sectors(history, OPTIMAL_SECTOR_LAPS);
        Some(Self {
            issues: detect_sector_issues(&last_lap, &optimal),
            consistency: sector_consistency(history),
            optimal,
            last_lap,
        })
    }
}

/// Splits the track in equal thirds and times each lap through them.
#[derive(Clone, Debug)]
pub struct SectorAnalyzer {
    boundaries: [(f64, f64); SECTOR_COUNT],
}

impl SectorAnalyzer {
    pub fn new(track_length_m: f64) -> Self {
        let third = track_length_m / SECTOR_COUNT as f64;
        Self {
            boundaries: [
                (0.0, third),
                (third, 2.0 * third),
                (2.0 * third, track_length_m),
            ],
        }
    }

    pub fn boundaries(&self) -> &[(f64, f64); SECTOR_COUNT] {
        &self.boundaries
    }

    /// Time one lap's frames through each sector.
    ///
    /// A sector with no frames inside it is left out of the result.
    pub fn sector_times(&self, lap_frames: &[TelemetryFrame]) -> Vec<SectorTime> {
        let mut result = Vec::with_capacity(SECTOR_COUNT);

        for (idx, (start, end)) in self.boundaries.iter().enumerate() {
            let in_sector: Vec<&TelemetryFrame> = lap_frames
                .iter()
                .filter(|frame| {
                    frame
                        .lap_distance_m
                        .is_some_and(|distance| distance >= *start && distance < *end)
                })
                .collect();

            let (Some(first), Some(last)) = (in_sector.first(), in_sector.last()) else {
                continue;
            };

            let time_s = last.time - first.time;
            let distance_m = end - start;
            let avg_speed_kph = if time_s > 0.0 {
                let speed: Velocity =
                    Length::new::<meter>(distance_m) / Time::new::<second>(time_s);
                speed.get::<kilometer_per_hour>()
            } else {
                0.0
            };

            let mean_of = |value: fn(&TelemetryFrame) -> Option<f64>| {
                stats::mean(&in_sector.iter().filter_map(|frame| value(frame)).collect::<Vec<_>>())
            };

            result.push(SectorTime {
                sector: idx + 1,
                time_s,
                avg_speed_kph,
                avg_throttle_pct: mean_of(|frame| frame.throttle_pct),
                avg_brake_bar: mean_of(|frame| frame.brake_front_bar),
                avg_lateral_g: mean_of(|frame| frame.accel_lat_g),
                distance_m,
            });
        }

        result
    }
}

fn find_sector(sectors: &[SectorTime], sector: usize) -> Option<&SectorTime> {
    sectors.iter().find(|s| s.sector == sector)
}

/// Compare one lap of each vehicle sector by sector.
pub fn compare_sectors(own: &[SectorTime], rival: &[SectorTime]) -> Vec<SectorComparison> {
    (1..=SECTOR_COUNT)
        .filter_map(|sector| {
            let own_sector = find_sector(own, sector)?;
            let rival_sector = find_sector(rival, sector)?;
            let time_delta_s = own_sector.time_s - rival_sector.time_s;

            let (advantage, advantage_margin_s) = if time_delta_s > SECTOR_ADVANTAGE_MARGIN_S {
                (SectorAdvantage::Rival, time_delta_s.abs())
            } else if time_delta_s < -SECTOR_ADVANTAGE_MARGIN_S {
                (SectorAdvantage::Own, time_delta_s.abs())
            } else {
                (SectorAdvantage::Even, 0.0)
            };

            Some(SectorComparison {
                sector,
                own_time_s: own_sector.time_s,
                rival_time_s: rival_sector.time_s,
                time_delta_s,
                speed_delta_kph: own_sector.avg_speed_kph - rival_sector.avg_speed_kph,
                advantage,
                advantage_margin_s,
            })
        })
        .collect()
}

/// Lap-to-lap consistency of each sector. Needs two laps through a sector.
pub fn sector_consistency(history: &[Vec<SectorTime>]) -> Vec<SectorConsistency> {
    (1..=SECTOR_COUNT)
        .filter_map(|sector| {
            let times: Vec<f64> = history
                .iter()
                .filter_map(|lap| find_sector(lap, sector))
                .map(|s| s.time_s)
                .collect();
            if times.len() < 2 {
                return None;
            }

            let mean_time_s = stats::mean(&times)?;
            let std_dev_s = stats::population_std(&times)?;
            let coefficient_of_variation = if mean_time_s > 0.0 {
                std_dev_s / mean_time_s * 100.0
            } else {
                0.0
            };

            Some(SectorConsistency {
                sector,
                mean_time_s,
                std_dev_s,
                coefficient_of_variation,
                consistency_score: (1.0 - coefficient_of_variation / CONSISTENCY_CV_SCALE)
                    .clamp(0.0, 1.0),
                sample_size: times.len(),
            })
        })
        .collect()
}

/// Average the `top_n` quickest passes through each sector.
pub fn optimal_sectors(history: &[Vec<SectorTime>], top_n: usize) -> Vec<OptimalSector> {
    (1..=SECTOR_COUNT)
        .filter_map(|sector| {
            let mut passes: Vec<&SectorTime> = history
                .iter()
                .filter_map(|lap| find_sector(lap, sector))
                .collect();
            if passes.is_empty() {
                return None;
            }
            let all_times: Vec<f64> = passes.iter().map(|s| s.time_s).collect();
            passes.sort_by(|a, b| a.time_s.total_cmp(&b.time_s));
            let best = &passes[..top_n.max(1).min(passes.len())];

            let mean_opt = |value: fn(&SectorTime) -> Option<f64>| {
                stats::mean(&best.iter().filter_map(|s| value(s)).collect::<Vec<_>>())
            };

            Some(OptimalSector {
                sector,
                best_time_s: mean_opt(|s| Some(s.time_s))?,
                optimal_speed_kph: mean_opt(|s| Some(s.avg_speed_kph))?,
                optimal_throttle_pct: mean_opt(|s| s.avg_throttle_pct),
                optimal_brake_bar: mean_opt(|s| s.avg_brake_bar),
                time_std_dev_s: stats::population_std(&all_times).unwrap_or(0.0),
            })
        })
        .collect()
}

/// Sectors of the current lap that are noticeably slower than the optimal pass.
pub fn detect_sector_issues(current: &[SectorTime], optimal: &[OptimalSector]) -> Vec<SectorIssue> {
    current
        .iter()
        .filter_map(|sector| {
            let reference = optimal.iter().find(|o| o.sector == sector.sector)?;
            let time_loss_s = sector.time_s - reference.best_time_s;
            if time_loss_s <= SECTOR_ISSUE_TIME_LOSS_S {
                return None;
            }

            let mut potential_causes = Vec::new();
            if sector.avg_speed_kph < reference.optimal_speed_kph - SECTOR_ISSUE_SPEED_DEFICIT_KPH {
                potential_causes.push("Low speed through sector".to_string());
            }
            if let (Some(throttle), Some(optimal_throttle)) =
                (sector.avg_throttle_pct, reference.optimal_throttle_pct)
            {
                if throttle < optimal_throttle - SECTOR_ISSUE_THROTTLE_DEFICIT_PCT {
                    potential_causes.push("Insufficient throttle application".to_string());
                }
            }
            if let (Some(brake), Some(optimal_brake)) =
                (sector.avg_brake_bar, reference.optimal_brake_bar)
            {
                if brake > optimal_brake + SECTOR_ISSUE_BRAKE_EXCESS_BAR {
                    potential_causes.push("Excessive braking".to_string());
                }
            }

            Some(SectorIssue {
                sector: sector.sector,
                time_loss_s,
                severity: if time_loss_s > SECTOR_ISSUE_HIGH_TIME_LOSS_S {
                    IssueSeverity::High
                } else {
                    IssueSeverity::Medium
                },
                potential_causes,
            })
        })
        .collect()
}
