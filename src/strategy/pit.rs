use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::features::EngineeredFeatureRow;

/// Time lost driving through the pit lane and stopping.
pub const PIT_LOSS_S: f64 = 25.0;
/// Lap time gained per lap on fresh tyres.
pub const FRESH_TIRE_ADVANTAGE_S: f64 = 1.5;
/// Degradation rate, seconds per lap, at which tyres are considered worn.
pub const DEGRADATION_THRESHOLD_S: f64 = 0.15;
/// Cumulative degradation, as a multiple of the threshold, that makes a lap critical.
pub const CRITICAL_DEGRADATION_MULTIPLE: f64 = 3.0;
/// Laps a stint runs before degradation starts to accumulate.
pub const DEGRADATION_ONSET_LAPS: i64 = 5;
/// Critical lap never later than this many laps before the flag.
pub const CRITICAL_LAP_END_MARGIN: i64 = 3;
pub const WINDOW_LEAD_LAPS: i64 = 3;
pub const WINDOW_TRAIL_LAPS: i64 = 2;
/// Window closes this many laps before the flag.
pub const WINDOW_END_MARGIN: i64 = 5;
/// Laps of fresh tyre advantage an undercut is credited with.
pub const UNDERCUT_LAPS: f64 = 3.0;
/// Extra laps of rival degradation an overcut is credited with.
pub const OVERCUT_LAPS: f64 = 4.0;
pub const VIABLE_GAIN_S: f64 = 2.0;
/// One strategy must beat the other by this much to move off the window midpoint.
pub const STRATEGY_PREFERENCE_MARGIN_S: f64 = 1.0;
pub const BASE_CONFIDENCE: f64 = 0.7;
pub const STRATEGY_CONFIDENCE_BONUS: f64 = 0.1;
pub const RISK_CONFIDENCE_PENALTY: f64 = 0.1;
pub const LEADER_POSITION: u32 = 1;
pub const PODIUM_POSITION: u32 = 3;
pub const FRONT_RUNNER_POSITION: u32 = 5;
/// Under this many laps to go the stop is pulled forward.
pub const LATE_RACE_LAPS: u32 = 10;
pub const LATE_RACE_MAX_DELAY_LAPS: u32 = 3;
/// Quadratic time loss per lap squared on worn tyres.
pub const OLD_TIRE_LOSS_FACTOR: f64 = 0.1;
/// Laps over which fresh tyres are faster.
pub const FRESH_TIRE_GAIN_LAPS: u32 = 5;
/// No stop simulated in the last laps of the race.
pub const SCENARIO_END_MARGIN: u32 = 3;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

/// Inclusive range of laps to pit on.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PitWindow {
    pub start: u32,
    pub end: u32,
}

impl PitWindow {
    pub fn contains(&self, lap: u32) -> bool {
        (self.start..=self.end).contains(&lap)
    }

    pub fn lap_count(&self) -> u32 {
        self.end - self.start + 1
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct StrategicOpportunity {
    pub gain_seconds: f64,
    pub viable: bool,
}

impl StrategicOpportunity {
    fn new(gain_seconds: f64) -> Self {
        Self {
            gain_seconds,
            viable: gain_seconds > VIABLE_GAIN_S,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PitRecommendation {
    pub critical_lap: u32,
    /// `None` when no lap is left to pit on before the flag
    pub window: Option<PitWindow>,
    pub recommended_lap: Option<u32>,
    pub confidence: f64,
    pub undercut: StrategicOpportunity,
    pub overcut: StrategicOpportunity,
    pub position_risk: RiskLevel,
    pub traffic_risk: RiskLevel,
    pub reasoning: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PitScenario {
    pub pit_lap: u32,
    pub estimated_time_loss: f64,
    pub laps_on_old_tires: u32,
    pub laps_on_new_tires: u32,
}

/// Pit window policy. Every threshold is a named constant in this module.
#[derive(Clone, Copy, Debug, Default)]
pub struct PitOptimizer;

impl PitOptimizer {
    pub fn optimize(
        &self,
        history: &[EngineeredFeatureRow],
        current_lap: u32,
        position: u32,
        total_laps: u32,
        degradation_rate: f64,
    ) -> PitRecommendation {
        self.optimize_with_rivals(history, current_lap, position, total_laps, degradation_rate, 0)
    }

    /// Undercut and overcut are only estimated when at least one rival is
    /// being tracked.
    pub fn optimize_with_rivals(
        &self,
        history: &[EngineeredFeatureRow],
        current_lap: u32,
        position: u32,
        total_laps: u32,
        degradation_rate: f64,
        rival_count: usize,
    ) -> PitRecommendation {
        let degradation_rate = if degradation_rate.is_finite() {
            degradation_rate
        } else {
            warn!("Ignoring non-finite degradation rate {}", degradation_rate);
            0.0
        };

        let critical_lap = Self::critical_lap(history.len(), current_lap, total_laps, degradation_rate);
        let window = Self::window(current_lap, critical_lap, total_laps);

        let (undercut_gain, overcut_gain) = if rival_count > 0 {
            (
                FRESH_TIRE_ADVANTAGE_S * UNDERCUT_LAPS,
                degradation_rate * OVERCUT_LAPS,
            )
        } else {
            (0.0, 0.0)
        };
        let position_risk = Self::position_risk(position);
        let traffic_risk = Self::traffic_risk(position);

        let mut reasoning = Vec::new();
        let mut confidence = BASE_CONFIDENCE;
        let mut recommended_lap = window.map(|w| (w.start + w.end) / 2);

        if undercut_gain > overcut_gain + STRATEGY_PREFERENCE_MARGIN_S {
            recommended_lap = window.map(|w| w.start);
            reasoning.push(format!("Undercut opportunity: +{:.1}s advantage", undercut_gain));
            confidence += STRATEGY_CONFIDENCE_BONUS;
        } else if overcut_gain > undercut_gain + STRATEGY_PREFERENCE_MARGIN_S {
            recommended_lap = window.map(|w| w.end);
            reasoning.push(format!("Overcut opportunity: +{:.1}s advantage", overcut_gain));
            confidence += STRATEGY_CONFIDENCE_BONUS;
        }

        if position_risk == RiskLevel::High {
            reasoning.push("High position risk - consider strategic timing".to_string());
            confidence -= RISK_CONFIDENCE_PENALTY;
        }
        if traffic_risk == RiskLevel::High {
            reasoning.push("High traffic risk - may lose positions on rejoin".to_string());
            confidence -= RISK_CONFIDENCE_PENALTY;
        }

        match window {
            Some(w) => reasoning.push(format!(
                "Optimal window: laps {}-{} ({} lap window)",
                w.start,
                w.end,
                w.lap_count()
            )),
            None => reasoning.push("No laps left to pit before the finish".to_string()),
        }

        if total_laps.saturating_sub(current_lap) < LATE_RACE_LAPS {
            reasoning.push("Limited laps remaining - early pit recommended".to_string());
            recommended_lap = recommended_lap
                .map(|lap| lap.min(current_lap + LATE_RACE_MAX_DELAY_LAPS));
        }
        // The late race cap may land before the window opens
        if let (Some(lap), Some(w)) = (recommended_lap, window) {
            recommended_lap = Some(lap.clamp(w.start, w.end));
        }

        debug!(
            "Pit window {:?}, recommended lap {:?} (critical lap {})",
            window, recommended_lap, critical_lap
        );

        PitRecommendation {
            critical_lap,
            window,
            recommended_lap,
            confidence: confidence.clamp(0.0, 1.0),
            undercut: StrategicOpportunity::new(undercut_gain),
            overcut: StrategicOpportunity::new(overcut_gain),
            position_risk,
            traffic_risk,
            reasoning,
        }
    }

    /// Lap at which cumulative degradation crosses the critical level, or half
    /// distance without a degradation signal.
    fn critical_lap(history_laps: usize, current_lap: u32, total_laps: u32, degradation_rate: f64) -> u32 {
        if degradation_rate <= 0.0 {
            return total_laps / 2;
        }
        let current_degradation =
            degradation_rate * (history_laps as i64 - DEGRADATION_ONSET_LAPS) as f64;
        let laps_until_critical = ((DEGRADATION_THRESHOLD_S * CRITICAL_DEGRADATION_MULTIPLE
            - current_degradation)
            / degradation_rate)
            .trunc() as i64;
        let critical = (current_lap as i64)
            .saturating_add(laps_until_critical)
            .min(total_laps as i64 - CRITICAL_LAP_END_MARGIN);
        critical.max(0) as u32
    }

    /// Window around the critical lap, kept strictly between the current lap
    /// and the flag.
    fn window(current_lap: u32, critical_lap: u32, total_laps: u32) -> Option<PitWindow> {
        let first_possible = current_lap as i64 + 1;
        let last_possible = total_laps as i64 - 1;
        if first_possible > last_possible {
            return None;
        }

        let start = first_possible.max(critical_lap as i64 - WINDOW_LEAD_LAPS);
        let end = (critical_lap as i64 + WINDOW_TRAIL_LAPS).min(total_laps as i64 - WINDOW_END_MARGIN);

        let start = start.min(last_possible);
        let end = end.clamp(start, last_possible);
        Some(PitWindow {
            start: start as u32,
            end: end as u32,
        })
    }

    fn position_risk(position: u32) -> RiskLevel {
        if position == LEADER_POSITION {
            RiskLevel::High
        } else if position <= PODIUM_POSITION {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        }
    }

    fn traffic_risk(position: u32) -> RiskLevel {
        if position <= FRONT_RUNNER_POSITION {
            RiskLevel::Medium
        } else {
            RiskLevel::High
        }
    }

    /// Estimated net time loss of stopping on each candidate lap, best first.
    /// Candidates at or before the current lap or in the final laps are skipped.
    pub fn simulate_scenarios(
        &self,
        current_lap: u32,
        total_laps: u32,
        pit_laps: &[u32],
    ) -> Vec<PitScenario> {
        let mut scenarios: Vec<PitScenario> = pit_laps
            .iter()
            .copied()
            .filter(|pit_lap| {
                *pit_lap > current_lap && *pit_lap <= total_laps.saturating_sub(SCENARIO_END_MARGIN)
            })
            .map(|pit_lap| {
                let old = pit_lap - current_lap;
                let new = total_laps - pit_lap;
                let old_tire_loss = old as f64 * OLD_TIRE_LOSS_FACTOR * old as f64;
                let new_tire_gain = new.min(FRESH_TIRE_GAIN_LAPS) as f64 * FRESH_TIRE_ADVANTAGE_S;
                PitScenario {
                    pit_lap,
                    estimated_time_loss: PIT_LOSS_S + old_tire_loss - new_tire_gain,
                    laps_on_old_tires: old,
                    laps_on_new_tires: new,
                }
            })
            .collect();

        scenarios.sort_by(|a, b| a.estimated_time_loss.total_cmp(&b.estimated_time_loss));
        scenarios
    }

    /// Scenarios for every lap a stop is still possible on.
    pub fn simulate_remaining(&self, current_lap: u32, total_laps: u32) -> Vec<PitScenario> {
        let candidates: Vec<u32> = (current_lap + 1..=total_laps).collect();
        self.simulate_scenarios(current_lap, total_laps, &candidates)
    }
}
