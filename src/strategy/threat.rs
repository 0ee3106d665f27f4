use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::config::ThreatConfig;
use crate::features::{EngineeredFeatureRow, stats};

pub const MAX_RECOMMENDATIONS: usize = 3;
/// Laps reported when the rival is not closing in.
pub const NOT_CLOSING_LAPS: u32 = 999;
const SECTOR_ADVANTAGE_KINDS: f64 = 3.0;
/// Consistency assumed when the rival has a single lap.
const DEFAULT_CONSISTENCY: f64 = 0.5;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum ThreatLevel {
    Low,
    Medium,
    High,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum GapTrend {
    Closing,
    Stable,
    Opening,
    Unknown,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AdvantageKind {
    StraightSpeed,
    CorneringSpeed,
    BrakingStability,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SectorAdvantageEstimate {
    pub sector: String,
    pub advantage_seconds: f64,
    pub kind: AdvantageKind,
}

/// When the rival is expected within attack range.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AttackEta {
    InRange,
    Laps(u32),
    NotClosing,
}

impl AttackEta {
    pub fn laps(&self) -> u32 {
        match self {
            AttackEta::InRange => 0,
            AttackEta::Laps(laps) => *laps,
            AttackEta::NotClosing => NOT_CLOSING_LAPS,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ThreatAssessment {
    pub attack_probability: f64,
    pub current_gap: f64,
    pub gap_trend: GapTrend,
    pub laps_until_attack: AttackEta,
    /// Own average minus rival average lap time, positive when the rival is faster
    pub pace_delta: f64,
    pub sector_advantages: Vec<SectorAdvantageEstimate>,
    pub defensive_recommendations: Vec<String>,
    pub threat_level: ThreatLevel,
}

impl ThreatAssessment {
    pub fn insufficient_data() -> Self {
        Self {
            attack_probability: 0.0,
            current_gap: 0.0,
            gap_trend: GapTrend::Unknown,
            laps_until_attack: AttackEta::NotClosing,
            pace_delta: 0.0,
            sector_advantages: Vec::new(),
            defensive_recommendations: vec!["Insufficient data for threat analysis".to_string()],
            threat_level: ThreatLevel::Low,
        }
    }
}

fn tail(history: &[EngineeredFeatureRow], count: usize) -> &[EngineeredFeatureRow] {
    &history[history.len().saturating_sub(count)..]
}

fn mean_of(rows: &[EngineeredFeatureRow], value: fn(&EngineeredFeatureRow) -> Option<f64>) -> Option<f64> {
    stats::mean(&rows.iter().filter_map(value).collect::<Vec<_>>())
}

/// Scores how likely a rival behind is to attack within the next laps.
#[derive(Clone, Debug, Default)]
pub struct ThreatDetector {
    config: ThreatConfig,
}

impl ThreatDetector {
    pub fn new(config: ThreatConfig) -> Self {
        Self { config }
    }

    pub fn assess(
        &self,
        own: &[EngineeredFeatureRow],
        rival: &[EngineeredFeatureRow],
        current_gap: f64,
    ) -> ThreatAssessment {
        self.assess_at_lap(own, rival, current_gap, None)
    }

    /// Assess using only laps up to `current_lap` when given.
    pub fn assess_at_lap(
        &self,
        own: &[EngineeredFeatureRow],
        rival: &[EngineeredFeatureRow],
        current_gap: f64,
        current_lap: Option<u32>,
    ) -> ThreatAssessment {
        let upto = |rows: &[EngineeredFeatureRow]| -> Vec<EngineeredFeatureRow> {
            rows.iter()
                .filter(|r| current_lap.is_none_or(|lap| r.lap_number() <= lap))
                .cloned()
                .collect()
        };
        let own = upto(own);
        let rival = upto(rival);
        let own_recent = tail(&own, self.config.lookback_laps);
        let rival_recent = tail(&rival, self.config.lookback_laps);

        if own_recent.len() < self.config.min_laps || rival_recent.len() < self.config.min_laps {
            warn!("Not enough lap data for threat analysis");
            return ThreatAssessment::insufficient_data();
        }
        if !current_gap.is_finite() {
            warn!("Gap {} is not a number, skipping threat analysis", current_gap);
            return ThreatAssessment::insufficient_data();
        }

        let pace_delta = self.pace_advantage(own_recent, rival_recent);
        let closing_rate = self.gap_closing_rate(current_gap);
        let sector_advantages = self.sector_advantages(own_recent, rival_recent);
        let consistency = self.consistency(rival_recent);

        let attack_probability = self.attack_probability(
            pace_delta,
            closing_rate,
            sector_advantages.len(),
            consistency,
            current_gap,
        );
        let laps_until_attack = self.laps_until_attack(current_gap, closing_rate);
        let defensive_recommendations =
            self.recommendations(attack_probability, &sector_advantages, pace_delta);

        let gap_trend = if closing_rate > 0.0 {
            GapTrend::Closing
        } else if closing_rate == 0.0 {
            GapTrend::Stable
        } else {
            GapTrend::Opening
        };

        debug!(
            "Threat: probability {:.2}, pace delta {:.3}s, {} sector advantages",
            attack_probability,
            pace_delta,
            sector_advantages.len()
        );

        ThreatAssessment {
            attack_probability,
            current_gap,
            gap_trend,
            laps_until_attack,
            pace_delta,
            sector_advantages,
            defensive_recommendations,
            threat_level: self.threat_level(attack_probability),
        }
    }

    fn pace_advantage(&self, own: &[EngineeredFeatureRow], rival: &[EngineeredFeatureRow]) -> f64 {
        let own_pace = mean_of(own, |r| Some(r.lap_time()));
        let rival_pace = mean_of(rival, |r| Some(r.lap_time()));
        match (own_pace, rival_pace) {
            (Some(own), Some(rival)) => own - rival,
            _ => 0.0,
        }
    }

    /// Closing rate estimated from how close the rival already is.
    fn gap_closing_rate(&self, current_gap: f64) -> f64 {
        if current_gap < self.config.close_gap_s {
            self.config.close_closing_rate
        } else if current_gap < self.config.far_gap_s {
            self.config.far_closing_rate
        } else {
            0.0
        }
    }

    /// Where the rival is quicker, inferred from lap averages. A signal unknown
    /// on either side contributes nothing.
    fn sector_advantages(
        &self,
        own: &[EngineeredFeatureRow],
        rival: &[EngineeredFeatureRow],
    ) -> Vec<SectorAdvantageEstimate> {
        let mut advantages = Vec::new();
        let compare = |value: fn(&EngineeredFeatureRow) -> Option<f64>| {
            Some((mean_of(own, value)?, mean_of(rival, value)?))
        };

        if let Some((own_speed, rival_speed)) = compare(|r| r.features.avg_speed) {
            if rival_speed > own_speed + self.config.speed_margin_kph {
                advantages.push(SectorAdvantageEstimate {
                    sector: "Sector 1".to_string(),
                    advantage_seconds: self.config.straight_speed_credit_s,
                    kind: AdvantageKind::StraightSpeed,
                });
            }
        }
        if let Some((own_g, rival_g)) = compare(|r| r.features.avg_lateral_g) {
            if rival_g > own_g + self.config.lateral_g_margin {
                advantages.push(SectorAdvantageEstimate {
                    sector: "Sector 2".to_string(),
                    advantage_seconds: self.config.cornering_credit_s,
                    kind: AdvantageKind::CorneringSpeed,
                });
            }
        }
        if let Some((own_brake, rival_brake)) = compare(|r| r.brake_variance) {
            if rival_brake < own_brake - self.config.brake_variance_margin {
                advantages.push(SectorAdvantageEstimate {
                    sector: "Sector 3".to_string(),
                    advantage_seconds: self.config.braking_credit_s,
                    kind: AdvantageKind::BrakingStability,
                });
            }
        }

        advantages
    }

    /// 1 for a metronomic rival, 0 when lap times scatter by the normalisation or more.
    fn consistency(&self, rival: &[EngineeredFeatureRow]) -> f64 {
        let times: Vec<f64> = rival.iter().map(|r| r.lap_time()).collect();
        match stats::sample_std(&times) {
            Some(std) => (1.0 - std / self.config.consistency_normalization_s).clamp(0.0, 1.0),
            None => DEFAULT_CONSISTENCY,
        }
    }

    fn attack_probability(
        &self,
        pace_delta: f64,
        closing_rate: f64,
        sector_count: usize,
        consistency: f64,
        current_gap: f64,
    ) -> f64 {
        let weights = &self.config.weights;
        let pace_factor = (pace_delta / self.config.pace_normalization_s).clamp(0.0, 1.0);
        let gap_factor = closing_rate.clamp(0.0, 1.0);
        let sector_factor = (sector_count as f64 / SECTOR_ADVANTAGE_KINDS).min(1.0);

        let mut probability = weights.pace_advantage * pace_factor
            + weights.gap_closing * gap_factor
            + weights.sector_advantage * sector_factor
            + weights.consistency * consistency;

        if current_gap < self.config.attack_gap_s {
            probability *= self.config.imminent_multiplier;
        } else if current_gap < self.config.close_gap_s {
            probability *= self.config.close_multiplier;
        }

        probability.clamp(0.0, 1.0)
    }

    fn laps_until_attack(&self, current_gap: f64, closing_rate: f64) -> AttackEta {
        if closing_rate <= 0.0 {
            return AttackEta::NotClosing;
        }
        let gap_to_close = current_gap - self.config.attack_gap_s;
        if gap_to_close <= 0.0 {
            return AttackEta::InRange;
        }
        let laps = (gap_to_close / (closing_rate * self.config.closing_rate_to_seconds)).ceil();
        if laps >= NOT_CLOSING_LAPS as f64 {
            AttackEta::NotClosing
        } else {
            AttackEta::Laps(laps as u32)
        }
    }

    fn recommendations(
        &self,
        attack_probability: f64,
        sector_advantages: &[SectorAdvantageEstimate],
        pace_delta: f64,
    ) -> Vec<String> {
        let mut recommendations = Vec::new();

        if attack_probability > self.config.high_threshold {
            recommendations.push("High threat - prepare defensive line".to_string());
            recommendations.push("Focus on corner exits to maintain speed".to_string());
        }
        if pace_delta > self.config.significant_pace_advantage_s {
            recommendations.push("Rival has significant pace advantage".to_string());
            recommendations.push("Consider pit strategy adjustment".to_string());
        }
        for advantage in sector_advantages {
            recommendations.push(match advantage.kind {
                AdvantageKind::StraightSpeed => {
                    format!("Defend inside line on straights in {}", advantage.sector)
                }
                AdvantageKind::CorneringSpeed => {
                    format!("Tighten racing line in {}", advantage.sector)
                }
                AdvantageKind::BrakingStability => {
                    format!("Late braking defense in {}", advantage.sector)
                }
            });
        }
        if recommendations.is_empty() {
            recommendations.push("Maintain current pace and strategy".to_string());
        }

        recommendations.truncate(MAX_RECOMMENDATIONS);
        recommendations
    }

    fn threat_level(&self, attack_probability: f64) -> ThreatLevel {
        if attack_probability >= self.config.high_threshold {
            ThreatLevel::High
        } else if attack_probability >= self.config.medium_threshold {
            ThreatLevel::Medium
        } else {
            ThreatLevel::Low
        }
    }
}
