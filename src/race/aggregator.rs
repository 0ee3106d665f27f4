use std::collections::BTreeMap;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::config::AggregatorConfig;
use crate::features::{EngineeredFeatureRow, stats};
use crate::strategy::PaceTrend;

/// Engineered feature tables by vehicle id.
pub type VehicleHistories = BTreeMap<String, Vec<EngineeredFeatureRow>>;

/// Minimum laps for a vehicle to be compared.
const MIN_COMPARISON_LAPS: usize = 2;
/// Minimum laps before the first/second half trend is read.
const MIN_TREND_LAPS: usize = 3;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct LeaderboardEntry {
    pub vehicle_id: String,
    pub position: usize,
    pub laps_completed: usize,
    /// Sum of completed lap times, seconds
    pub total_time: f64,
    pub current_pace: f64,
    pub last_lap: u32,
    pub gap_to_leader: f64,
    pub gap_to_ahead: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PaceComparison {
    pub vehicle_id: String,
    /// Own average pace minus theirs, negative when we are faster
    pub pace_delta: f64,
    pub own_faster: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RelativePace {
    pub vehicle_id: String,
    pub avg_pace: f64,
    pub relative_position: usize,
    pub cars_faster: usize,
    pub cars_slower: usize,
    pub pace_comparison: Vec<PaceComparison>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct VehicleMetrics {
    pub vehicle_id: String,
    pub position: usize,
    pub avg_pace: f64,
    pub best_lap: f64,
    pub worst_lap: f64,
    /// 0-1, higher is steadier
    pub consistency_score: f64,
    pub pace_trend: PaceTrend,
    pub lap_count: usize,
    pub gap_to_leader: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct VehicleComparison {
    pub comparisons: Vec<VehicleMetrics>,
    pub fastest_overall: String,
    pub fastest_single_lap: String,
    pub most_consistent: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PositionChange {
    pub vehicle_id: String,
    pub current_position: usize,
    pub predicted_position: usize,
    /// Positive when the vehicle is predicted to gain places
    pub position_change: i64,
    pub predicted_total_time: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PaceSummary {
    pub current_pace: f64,
    pub average_pace: f64,
    pub best_lap: f64,
    pub pace_trend: PaceTrend,
    pub consistency: f64,
    pub recent_laps: usize,
}

fn laps_up_to(rows: &[EngineeredFeatureRow], current_lap: Option<u32>) -> &[EngineeredFeatureRow] {
    match current_lap {
        Some(lap) => {
            let end = rows.partition_point(|r| r.lap_number() <= lap);
            &rows[..end]
        }
        None => rows,
    }
}

fn recent(rows: &[EngineeredFeatureRow], window: usize) -> Vec<f64> {
    rows[rows.len().saturating_sub(window)..]
        .iter()
        .map(|r| r.lap_time())
        .collect()
}

fn consistency_score(lap_times: &[f64], avg_pace: f64) -> f64 {
    match stats::sample_std(lap_times) {
        Some(std) if avg_pace > 0.0 => (1.0 - std / avg_pace).clamp(0.0, 1.0),
        _ => 1.0,
    }
}

/// Cross-vehicle views over finalised feature tables.
#[derive(Clone, Debug, Default)]
pub struct Aggregator {
    config: AggregatorConfig,
}

impl Aggregator {
    pub fn new(config: AggregatorConfig) -> Self {
        Self { config }
    }

    /// Second half of the laps against the first half.
    fn half_trend(&self, lap_times: &[f64]) -> PaceTrend {
        if lap_times.len() < MIN_TREND_LAPS {
            return PaceTrend::Stable;
        }
        let (first, second) = lap_times.split_at(lap_times.len() / 2);
        match (stats::mean(first), stats::mean(second)) {
            (Some(first), Some(second)) => {
                PaceTrend::from_change(second - first, self.config.trend_margin_s)
            }
            _ => PaceTrend::Stable,
        }
    }

    /// Order by laps completed, then by total time. Vehicles with no laps up to
    /// `current_lap` are left out.
    pub fn build_leaderboard(
        &self,
        vehicles: &VehicleHistories,
        current_lap: Option<u32>,
    ) -> Vec<LeaderboardEntry> {
        let mut entries: Vec<LeaderboardEntry> = vehicles
            .iter()
            .filter_map(|(vehicle_id, rows)| {
                let rows = laps_up_to(rows, current_lap);
                let last = rows.last()?;
                Some(LeaderboardEntry {
                    vehicle_id: vehicle_id.clone(),
                    position: 0,
                    laps_completed: rows.len(),
                    total_time: rows.iter().map(|r| r.lap_time()).sum(),
                    current_pace: last.lap_time(),
                    last_lap: last.lap_number(),
                    gap_to_leader: 0.0,
                    gap_to_ahead: 0.0,
                })
            })
            .collect();

        entries.sort_by(|a, b| {
            b.laps_completed
                .cmp(&a.laps_completed)
                .then(a.total_time.total_cmp(&b.total_time))
        });

        let leader_time = entries.first().map(|e| e.total_time).unwrap_or_default();
        let mut ahead_time = leader_time;
        for (index, entry) in entries.iter_mut().enumerate() {
            entry.position = index + 1;
            entry.gap_to_leader = entry.total_time - leader_time;
            entry.gap_to_ahead = entry.total_time - ahead_time;
            ahead_time = entry.total_time;
        }
        entries
    }

    /// Runs of consecutive vehicles on the same lap, each within the battle gap
    /// of the one ahead. Single vehicles are not battles.
    pub fn battle_groups(&self, leaderboard: &[LeaderboardEntry]) -> Vec<Vec<String>> {
        let mut groups = Vec::new();
        let mut current: Vec<String> = Vec::new();
        let mut ahead: Option<&LeaderboardEntry> = None;

        for entry in leaderboard {
            let in_battle = ahead.is_some_and(|ahead| {
                ahead.laps_completed == entry.laps_completed
                    && entry.gap_to_ahead <= self.config.battle_gap_s
            });
            if !in_battle {
                if current.len() > 1 {
                    groups.push(std::mem::take(&mut current));
                } else {
                    current.clear();
                }
            }
            current.push(entry.vehicle_id.clone());
            ahead = Some(entry);
        }
        if current.len() > 1 {
            groups.push(current);
        }
        groups
    }

    /// Recent average pace of one vehicle against every other.
    pub fn relative_pace(
        &self,
        vehicle_id: &str,
        vehicles: &VehicleHistories,
        current_lap: Option<u32>,
    ) -> Option<RelativePace> {
        let window = self.config.pace_window;
        let own = vehicles.get(vehicle_id)?;
        let avg_pace = stats::mean(&recent(laps_up_to(own, current_lap), window))?;

        let mut pace_comparison: Vec<PaceComparison> = vehicles
            .iter()
            .filter(|(other_id, _)| other_id.as_str() != vehicle_id)
            .filter_map(|(other_id, rows)| {
                let other_pace = stats::mean(&recent(laps_up_to(rows, current_lap), window))?;
                let pace_delta = avg_pace - other_pace;
                Some(PaceComparison {
                    vehicle_id: other_id.clone(),
                    pace_delta,
                    own_faster: pace_delta < 0.0,
                })
            })
            .collect();
        pace_comparison.sort_by(|a, b| a.pace_delta.total_cmp(&b.pace_delta));

        let cars_slower = pace_comparison.iter().filter(|p| p.own_faster).count();
        let cars_faster = pace_comparison.len() - cars_slower;

        Some(RelativePace {
            vehicle_id: vehicle_id.to_string(),
            avg_pace,
            relative_position: cars_faster + 1,
            cars_faster,
            cars_slower,
            pace_comparison,
        })
    }

    /// Rank vehicles by recent average pace. `None` when no vehicle has
    /// enough laps.
    pub fn compare_vehicles(
        &self,
        vehicles: &VehicleHistories,
        current_lap: Option<u32>,
    ) -> Option<VehicleComparison> {
        let mut comparisons: Vec<VehicleMetrics> = vehicles
            .iter()
            .filter_map(|(vehicle_id, rows)| {
                let lap_times = recent(laps_up_to(rows, current_lap), self.config.pace_window);
                if lap_times.len() < MIN_COMPARISON_LAPS {
                    debug!("Skipping {} in comparison, {} laps", vehicle_id, lap_times.len());
                    return None;
                }
                let avg_pace = stats::mean(&lap_times)?;
                Some(VehicleMetrics {
                    vehicle_id: vehicle_id.clone(),
                    position: 0,
                    avg_pace,
                    best_lap: stats::min(&lap_times)?,
                    worst_lap: stats::max(&lap_times)?,
                    consistency_score: consistency_score(&lap_times, avg_pace),
                    pace_trend: self.half_trend(&lap_times),
                    lap_count: lap_times.len(),
                    gap_to_leader: 0.0,
                })
            })
            .collect();

        comparisons.sort_by(|a, b| a.avg_pace.total_cmp(&b.avg_pace));
        let leader_pace = comparisons.first()?.avg_pace;
        for (index, metrics) in comparisons.iter_mut().enumerate() {
            metrics.position = index + 1;
            metrics.gap_to_leader = metrics.avg_pace - leader_pace;
        }

        let fastest_overall = comparisons.first()?.vehicle_id.clone();
        let fastest_single_lap = comparisons
            .iter()
            .min_by(|a, b| a.best_lap.total_cmp(&b.best_lap))?
            .vehicle_id
            .clone();
        // First of equals wins
        let most_consistent = comparisons
            .iter()
            .rev()
            .max_by(|a, b| a.consistency_score.total_cmp(&b.consistency_score))?
            .vehicle_id
            .clone();

        Some(VehicleComparison {
            comparisons,
            fastest_overall,
            fastest_single_lap,
            most_consistent,
        })
    }

    /// Project total race time `laps_ahead` laps on from predicted lap times,
    /// falling back to current pace for vehicles without a forecast.
    pub fn predict_position_changes(
        &self,
        leaderboard: &[LeaderboardEntry],
        predicted_laps: &BTreeMap<String, Vec<f64>>,
        laps_ahead: usize,
    ) -> Vec<PositionChange> {
        let mut projected: Vec<(&LeaderboardEntry, f64)> = leaderboard
            .iter()
            .map(|entry| {
                let future = match predicted_laps.get(&entry.vehicle_id) {
                    Some(laps) => laps.iter().take(laps_ahead).sum(),
                    None => entry.current_pace * laps_ahead as f64,
                };
                (entry, entry.total_time + future)
            })
            .collect();
        projected.sort_by(|a, b| a.1.total_cmp(&b.1));

        projected
            .into_iter()
            .enumerate()
            .map(|(index, (entry, predicted_total_time))| PositionChange {
                vehicle_id: entry.vehicle_id.clone(),
                current_position: entry.position,
                predicted_position: index + 1,
                position_change: entry.position as i64 - (index + 1) as i64,
                predicted_total_time,
            })
            .collect()
    }

    /// Current pace picture of one vehicle over the pace window.
    pub fn pace_summary(&self, rows: &[EngineeredFeatureRow]) -> Option<PaceSummary> {
        let lap_times = recent(rows, self.config.pace_window);
        let average_pace = stats::mean(&lap_times)?;
        Some(PaceSummary {
            current_pace: *lap_times.last()?,
            average_pace,
            best_lap: stats::min(&lap_times)?,
            pace_trend: self.half_trend(&lap_times),
            consistency: consistency_score(&lap_times, average_pace),
            recent_laps: lap_times.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::{FeatureEngineer, LapFeatureVector};

    fn rows(lap_times: &[f64]) -> Vec<EngineeredFeatureRow> {
        let laps: Vec<_> = lap_times
            .iter()
            .enumerate()
            .map(|(i, lap_time)| LapFeatureVector {
                lap_number: i as u32 + 1,
                lap_time: *lap_time,
                ..Default::default()
            })
            .collect();
        FeatureEngineer::default().engineer(&laps)
    }

    fn field() -> VehicleHistories {
        let mut vehicles = VehicleHistories::new();
        vehicles.insert("GR86-002-2".to_string(), rows(&[90.0, 90.0, 90.0]));
        vehicles.insert("GR86-004-4".to_string(), rows(&[90.0, 91.0, 90.5]));
        vehicles.insert("GR86-007-7".to_string(), rows(&[89.0, 89.5]));
        vehicles.insert("GR86-010-10".to_string(), rows(&[95.0, 95.0, 95.0]));
        vehicles
    }

    #[test]
    fn test_leaderboard_orders_by_laps_then_time() {
        let board = Aggregator::default().build_leaderboard(&field(), None);
        let order: Vec<&str> = board.iter().map(|e| e.vehicle_id.as_str()).collect();
        assert_eq!(order, vec!["GR86-002-2", "GR86-004-4", "GR86-010-10", "GR86-007-7"]);

        assert_eq!(board[0].position, 1);
        assert_eq!(board[0].gap_to_leader, 0.0);
        assert_eq!(board[0].gap_to_ahead, 0.0);
        assert!((board[1].gap_to_leader - 1.5).abs() < 1e-9);
        assert!((board[2].gap_to_ahead - 13.5).abs() < 1e-9);
        assert_eq!(board[3].laps_completed, 2);
        assert_eq!(board[1].current_pace, 90.5);
        assert_eq!(board[1].last_lap, 3);
    }

    #[test]
    fn test_leaderboard_respects_current_lap() {
        let board = Aggregator::default().build_leaderboard(&field(), Some(2));
        assert!(board.iter().all(|e| e.laps_completed == 2));
        assert_eq!(board[0].vehicle_id, "GR86-007-7");
    }

    #[test]
    fn test_battle_groups() {
        let aggregator = Aggregator::default();
        let board = aggregator.build_leaderboard(&field(), None);
        let groups = aggregator.battle_groups(&board);
        assert_eq!(groups, vec![vec!["GR86-002-2".to_string(), "GR86-004-4".to_string()]]);
        assert!(aggregator.battle_groups(&[]).is_empty());
    }

    #[test]
    fn test_relative_pace() {
        let relative = Aggregator::default()
            .relative_pace("GR86-004-4", &field(), None)
            .unwrap();
        assert!((relative.avg_pace - 90.5).abs() < 1e-9);
        assert_eq!(relative.cars_faster, 2);
        assert_eq!(relative.cars_slower, 1);
        assert_eq!(relative.relative_position, 3);
        assert_eq!(relative.pace_comparison.first().unwrap().vehicle_id, "GR86-010-10");
        assert!(Aggregator::default().relative_pace("GR86-099-99", &field(), None).is_none());
    }

    #[test]
    fn test_compare_vehicles() {
        let comparison = Aggregator::default().compare_vehicles(&field(), None).unwrap();
        assert_eq!(comparison.comparisons.len(), 4);
        assert_eq!(comparison.fastest_overall, "GR86-007-7");
        assert_eq!(comparison.fastest_single_lap, "GR86-007-7");
        assert_eq!(comparison.most_consistent, "GR86-002-2");
        let last = comparison.comparisons.last().unwrap();
        assert_eq!(last.position, 4);
        assert!((last.gap_to_leader - 5.75).abs() < 1e-9);
    }

    #[test]
    fn test_compare_skips_short_histories() {
        let mut vehicles = VehicleHistories::new();
        vehicles.insert("GR86-001-1".to_string(), rows(&[90.0]));
        assert!(Aggregator::default().compare_vehicles(&vehicles, None).is_none());
    }

    #[test]
    fn test_predicted_position_changes() {
        let aggregator = Aggregator::default();
        let board = aggregator.build_leaderboard(&field(), Some(2));
        let mut predicted = BTreeMap::new();
        predicted.insert("GR86-010-10".to_string(), vec![80.0, 80.0, 80.0]);

        let changes = aggregator.predict_position_changes(&board, &predicted, 3);
        let gainer = changes.iter().find(|c| c.vehicle_id == "GR86-010-10").unwrap();
        assert_eq!(gainer.current_position, 4);
        assert_eq!(gainer.predicted_position, 1);
        assert_eq!(gainer.position_change, 3);
        assert_eq!(changes.iter().map(|c| c.position_change).sum::<i64>(), 0);
    }

    #[test]
    fn test_pace_summary_trend() {
        let aggregator = Aggregator::default();
        let summary = aggregator
            .pace_summary(&rows(&[90.0, 90.1, 90.2, 90.6, 90.8, 91.0]))
            .unwrap();
        assert_eq!(summary.recent_laps, 5);
        assert_eq!(summary.current_pace, 91.0);
        assert_eq!(summary.best_lap, 90.1);
        assert_eq!(summary.pace_trend, PaceTrend::Degrading);
        assert!(summary.consistency > 0.99);
        assert!(aggregator.pace_summary(&[]).is_none());
    }
}
