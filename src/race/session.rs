use std::collections::BTreeMap;
use std::thread;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::RaceCraftError;
use crate::strategy::{DegradationReport, StrategyOutput};
use crate::telemetry::sectors::{SectorComparison, SectorReport, SectorTime, compare_sectors};
use crate::telemetry::{
    SegmentationWarning, TelemetryBatch, TelemetrySample, TelemetrySource, VehicleInfo,
    merge_samples,
};

use super::aggregator::{LeaderboardEntry, VehicleHistories};
use super::cache::{CacheKey, FeatureCache, FeatureTable, TableVariant};
use super::engine::StrategyEngine;

/// Track lengths closer than this are the same track.
const TRACK_LENGTH_TOLERANCE_M: f64 = 0.5;

/// Result of running one vehicle's feature pipeline.
#[derive(Clone, Debug)]
pub struct VehicleUpdate {
    pub vehicle: VehicleInfo,
    pub rows: FeatureTable,
    /// Only set when the table was rebuilt on this call
    pub warnings: Vec<SegmentationWarning>,
}

/// Strategy picture of one vehicle at its latest completed lap.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct VehicleStrategy {
    pub vehicle_id: String,
    pub position: usize,
    pub current_lap: u32,
    pub outputs: Vec<StrategyOutput>,
    pub degradation: Option<DegradationReport>,
    pub sectors: Option<SectorReport>,
}

/// Live state of one race: the samples seen so far, the engine chosen for the
/// session and the engineered table cache.
pub struct RaceSession {
    race: String,
    engine: StrategyEngine,
    samples: BTreeMap<String, Vec<TelemetrySample>>,
    stint_starts: BTreeMap<String, Vec<u32>>,
    expected_laps: Option<u32>,
    cache: FeatureCache,
}

impl RaceSession {
    pub fn new(race: &str, engine: StrategyEngine) -> Self {
        Self {
            race: race.to_string(),
            engine,
            samples: BTreeMap::new(),
            stint_starts: BTreeMap::new(),
            expected_laps: None,
            cache: FeatureCache::new(),
        }
    }

    /// Lap count the segmentation of every vehicle is checked against.
    pub fn with_expected_laps(mut self, laps: u32) -> Self {
        self.expected_laps = Some(laps);
        self
    }

    pub fn race(&self) -> &str {
        &self.race
    }

    pub fn engine(&self) -> &StrategyEngine {
        &self.engine
    }

    pub fn cache(&self) -> &FeatureCache {
        &self.cache
    }

    pub fn vehicles(&self) -> Vec<VehicleInfo> {
        self.samples.keys().map(|id| VehicleInfo::from_id(id)).collect()
    }

    /// Add sample batches and return how many vehicles received samples.
    ///
    /// Tables of those vehicles are invalidated. A batch declaring another
    /// track length rebuilds the engine; a batch whose track length the
    /// engine rejects is skipped whole and the others still apply.
    pub fn ingest(&mut self, batches: Vec<TelemetryBatch>) -> usize {
        let mut updated = 0;
        for batch in batches {
            if batch.race != self.race {
                debug!("Ignoring batch for race {} in session {}", batch.race, self.race);
                continue;
            }
            let current_length = self.engine.config().segmenter.track_length_m;
            if (batch.track_length_m - current_length).abs() > TRACK_LENGTH_TOLERANCE_M {
                match self.engine.with_track_length(batch.track_length_m) {
                    Ok(engine) => {
                        info!(
                            "Track length changed from {}m to {}m, rebuilding engine",
                            current_length, batch.track_length_m
                        );
                        self.engine = engine;
                        self.cache.clear();
                    }
                    Err(e) => {
                        warn!(
                            "Skipping {} samples of {}: {}",
                            batch.samples.len(),
                            batch.vehicle_id,
                            e
                        );
                        continue;
                    }
                }
            }
            if batch.samples.is_empty() {
                continue;
            }

            self.cache.invalidate_vehicle(&self.race, &batch.vehicle_id);
            self.samples
                .entry(batch.vehicle_id)
                .or_default()
                .extend(batch.samples);
            updated += 1;
        }
        updated
    }

    pub fn poll(&mut self, source: &mut dyn TelemetrySource) -> Result<usize, RaceCraftError> {
        let batches = source.poll(&self.race)?;
        Ok(self.ingest(batches))
    }

    /// New tyres fitted at the start of `lap`. Resets the degradation baseline
    /// from that lap on.
    pub fn record_pit_stop(&mut self, vehicle_id: &str, lap: u32) {
        let starts = self.stint_starts.entry(vehicle_id.to_string()).or_default();
        if !starts.contains(&lap) {
            starts.push(lap);
            starts.sort_unstable();
        }
        self.cache.invalidate_vehicle(&self.race, vehicle_id);
    }

    fn cache_key(&self, vehicle_id: &str) -> CacheKey {
        let variant = match self.stint_starts.get(vehicle_id) {
            Some(starts) if !starts.is_empty() => TableVariant::Stints(starts.clone()),
            _ => TableVariant::Engineered,
        };
        CacheKey::new(&self.race, vehicle_id, variant)
    }

    fn update_vehicle(&self, vehicle_id: &str) -> Result<VehicleUpdate, RaceCraftError> {
        let mut warnings = Vec::new();
        let rows = self.cache.get_or_build(&self.cache_key(vehicle_id), || {
            let samples = self.samples.get(vehicle_id).map(Vec::as_slice).unwrap_or(&[]);
            let frames = merge_samples(samples);
            let segmentation = self.engine.segment(&frames, self.expected_laps);
            warnings = segmentation.warnings;
            let features = self.engine.lap_features(&segmentation.laps, &frames);
            Ok(match self.stint_starts.get(vehicle_id) {
                Some(starts) => self.engine.engineer_stints(&features, starts),
                None => self.engine.engineer(&features),
            })
        })?;

        Ok(VehicleUpdate {
            vehicle: VehicleInfo::from_id(vehicle_id),
            rows,
            warnings,
        })
    }

    /// Engineered table of one vehicle, `None` when it never reported.
    pub fn features(&self, vehicle_id: &str) -> Result<Option<FeatureTable>, RaceCraftError> {
        if !self.samples.contains_key(vehicle_id) {
            return Ok(None);
        }
        self.update_vehicle(vehicle_id).map(|update| Some(update.rows))
    }

    /// Run every vehicle's pipeline, one thread per vehicle.
    pub fn process_vehicles(&self) -> Result<Vec<VehicleUpdate>, RaceCraftError> {
        thread::scope(|scope| {
            let handles: Vec<_> = self
                .samples
                .keys()
                .map(|vehicle_id| {
                    (
                        vehicle_id,
                        scope.spawn(move || self.update_vehicle(vehicle_id)),
                    )
                })
                .collect();

            handles
                .into_iter()
                .map(|(vehicle_id, handle)| {
                    handle
                        .join()
                        .map_err(|_| RaceCraftError::PipelineWorkerLost {
                            vehicle_id: vehicle_id.clone(),
                        })
                        .and_then(|result| result)
                })
                .collect()
        })
    }

    /// Sector times of every completed lap of one vehicle.
    fn lap_sectors(&self, vehicle_id: &str) -> Option<Vec<Vec<SectorTime>>> {
        let frames = merge_samples(self.samples.get(vehicle_id)?);
        Some(self.engine.sector_times(&frames))
    }

    /// Sector by sector comparison of both vehicles' last completed laps.
    pub fn compare_last_laps(&self, own_id: &str, rival_id: &str) -> Option<Vec<SectorComparison>> {
        let own = self.lap_sectors(own_id)?.pop()?;
        let rival = self.lap_sectors(rival_id)?.pop()?;
        Some(compare_sectors(&own, &rival))
    }

    /// Consistency, optimal passes and slow sectors of one vehicle.
    pub fn sector_report(&self, vehicle_id: &str) -> Option<SectorReport> {
        SectorReport::from_laps(&self.lap_sectors(vehicle_id)?)
    }

    pub fn histories(&self) -> Result<VehicleHistories, RaceCraftError> {
        Ok(self
            .process_vehicles()?
            .into_iter()
            .map(|update| (update.vehicle.vehicle_id, update.rows.as_ref().clone()))
            .collect())
    }

    pub fn leaderboard(&self) -> Result<Vec<LeaderboardEntry>, RaceCraftError> {
        Ok(self.engine.build_leaderboard(&self.histories()?))
    }

    /// Pace, threat from the car behind, pit window and degradation for every
    /// vehicle on the leaderboard.
    pub fn strategy(
        &self,
        laps_ahead: usize,
        total_laps: u32,
    ) -> Result<Vec<VehicleStrategy>, RaceCraftError> {
        let histories = self.histories()?;
        let leaderboard = self.engine.build_leaderboard(&histories);
        let empty = Vec::new();

        let strategies = leaderboard
            .iter()
            .enumerate()
            .map(|(index, entry)| {
                let history = histories.get(&entry.vehicle_id).unwrap_or(&empty);
                let mut outputs = vec![StrategyOutput::Pace(
                    self.engine.forecast_pace(history, laps_ahead),
                )];

                // Only a car on the same lap can attack
                let behind = leaderboard
                    .get(index + 1)
                    .filter(|behind| behind.laps_completed == entry.laps_completed);
                if let Some(behind) = behind {
                    let rival = histories.get(&behind.vehicle_id).unwrap_or(&empty);
                    outputs.push(StrategyOutput::Threat(self.engine.assess_threat(
                        history,
                        rival,
                        behind.gap_to_ahead,
                    )));
                }

                let rival_count = usize::from(behind.is_some()) + usize::from(index > 0);
                outputs.push(StrategyOutput::Pit(self.engine.optimize_pit_against(
                    history,
                    entry.last_lap,
                    entry.position as u32,
                    total_laps,
                    rival_count,
                )));

                VehicleStrategy {
                    vehicle_id: entry.vehicle_id.clone(),
                    position: entry.position,
                    current_lap: entry.last_lap,
                    outputs,
                    degradation: self.engine.analyze_degradation(history, entry.last_lap),
                    sectors: self.sector_report(&entry.vehicle_id),
                }
            })
            .collect::<Vec<_>>();

        if strategies.is_empty() {
            warn!("No vehicle in {} has completed a lap yet", self.race);
        }
        Ok(strategies)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StrategyConfig;
    use crate::telemetry::Signal;

    fn lap_samples(vehicle_id: &str, laps: u32, lap_time: f64) -> Vec<TelemetrySample> {
        let points = 40;
        let mut samples = Vec::new();
        for lap in 0..laps {
            for point in 0..points {
                let time = lap as f64 * lap_time + point as f64 * lap_time / points as f64;
                let distance = 2380.0 * point as f64 / points as f64;
                samples.push(TelemetrySample::new(time, vehicle_id, Signal::LapDistance, distance));
                samples.push(TelemetrySample::new(time, vehicle_id, Signal::Speed, 110.0));
            }
        }
        samples
    }

    fn batch(vehicle_id: &str, laps: u32, lap_time: f64) -> TelemetryBatch {
        TelemetryBatch {
            race: "R1".to_string(),
            vehicle_id: vehicle_id.to_string(),
            track_length_m: 2380.0,
            samples: lap_samples(vehicle_id, laps, lap_time),
        }
    }

    fn session() -> RaceSession {
        RaceSession::new("R1", StrategyEngine::trend_only(StrategyConfig::default()).unwrap())
    }

    #[test]
    fn test_process_vehicles_builds_each_table() {
        let mut session = session();
        session
            .ingest(vec![batch("GR86-002-2", 6, 90.0), batch("GR86-004-4", 6, 91.0)]);

        let updates = session.process_vehicles().unwrap();
        assert_eq!(updates.len(), 2);
        // trailing lap is still open
        assert!(updates.iter().all(|u| u.rows.len() == 5));
        assert_eq!(updates[1].vehicle.vehicle_number, Some(4));
        assert_eq!(session.cache().len(), 2);
    }

    #[test]
    fn test_ingest_invalidates_vehicle() {
        let mut session = session();
        session.ingest(vec![batch("GR86-002-2", 3, 90.0)]);
        let before = session.features("GR86-002-2").unwrap().unwrap();
        assert_eq!(before.len(), 2);

        let more = TelemetryBatch {
            samples: lap_samples("GR86-002-2", 5, 90.0)
                .into_iter()
                .filter(|s| s.time >= 270.0)
                .collect(),
            ..batch("GR86-002-2", 0, 90.0)
        };
        session.ingest(vec![more]);
        let after = session.features("GR86-002-2").unwrap().unwrap();
        assert_eq!(after.len(), 4);
        assert!(session.features("GR86-099-99").unwrap().is_none());
    }

    #[test]
    fn test_other_race_is_ignored() {
        let mut session = session();
        let other = TelemetryBatch {
            race: "R2".to_string(),
            ..batch("GR86-002-2", 3, 90.0)
        };
        assert_eq!(session.ingest(vec![other]), 0);
        assert!(session.vehicles().is_empty());
    }

    #[test]
    fn test_new_track_length_rebuilds_engine() {
        let mut session = session();
        session.ingest(vec![batch("GR86-002-2", 3, 90.0)]);
        session.features("GR86-002-2").unwrap();
        assert_eq!(session.cache().len(), 1);

        let longer = TelemetryBatch {
            track_length_m: 3700.0,
            ..batch("GR86-004-4", 3, 95.0)
        };
        assert_eq!(session.ingest(vec![longer]), 1);
        assert_eq!(session.engine().config().segmenter.track_length_m, 3700.0);
        assert!(session.cache().is_empty());
    }

    #[test]
    fn test_rejected_track_length_skips_only_that_batch() {
        let mut session = session();
        let too_short = TelemetryBatch {
            track_length_m: 50.0,
            ..batch("GR86-004-4", 3, 90.0)
        };
        let updated = session.ingest(vec![
            batch("GR86-002-2", 3, 90.0),
            too_short,
            batch("GR86-010-10", 3, 91.0),
        ]);

        assert_eq!(updated, 2);
        assert_eq!(session.engine().config().segmenter.track_length_m, 2380.0);
        let ids: Vec<String> = session.vehicles().into_iter().map(|v| v.vehicle_id).collect();
        assert_eq!(ids, vec!["GR86-002-2", "GR86-010-10"]);
    }

    #[test]
    fn test_pit_stop_switches_table_variant() {
        let mut session = session();
        session.ingest(vec![batch("GR86-002-2", 8, 90.0)]);
        session.record_pit_stop("GR86-002-2", 4);
        let rows = session.features("GR86-002-2").unwrap().unwrap();
        assert_eq!(rows.iter().filter(|r| r.stint == 2).count(), 4);
    }

    #[test]
    fn test_compare_last_laps() {
        let mut session = session();
        session
            .ingest(vec![batch("GR86-002-2", 4, 90.0), batch("GR86-004-4", 4, 93.0)]);

        let comparison = session.compare_last_laps("GR86-002-2", "GR86-004-4").unwrap();
        assert_eq!(comparison.len(), 3);
        assert!(comparison.iter().all(|sector| sector.time_delta_s < 0.0));
        assert!(session.compare_last_laps("GR86-002-2", "GR86-099-9").is_none());
    }

    #[test]
    fn test_sector_report_covers_completed_laps() {
        let mut session = session();
        session.ingest(vec![batch("GR86-002-2", 4, 90.0)]);

        let report = session.sector_report("GR86-002-2").unwrap();
        assert_eq!(report.last_lap.len(), 3);
        assert_eq!(report.consistency.len(), 3);
        // identical laps leave nothing to fix
        assert!(report.issues.is_empty());
        assert!(session.sector_report("GR86-099-9").is_none());
    }

    #[test]
    fn test_strategy_for_each_vehicle() {
        let mut session = session();
        session
            .ingest(vec![batch("GR86-002-2", 8, 90.0), batch("GR86-004-4", 8, 90.2)]);

        let strategies = session.strategy(3, 27).unwrap();
        assert_eq!(strategies.len(), 2);
        assert_eq!(strategies[0].vehicle_id, "GR86-002-2");
        assert_eq!(strategies[0].current_lap, 7);
        // leader gets pace, threat and pit
        assert_eq!(strategies[0].outputs.len(), 3);
        assert_eq!(strategies[1].outputs.len(), 2);
        assert!(matches!(strategies[0].outputs[1], StrategyOutput::Threat(_)));
        assert!(strategies.iter().all(|s| s.sectors.is_some()));
    }
}
