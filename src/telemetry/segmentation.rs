use std::ops::Range;

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::RaceCraftError;
use crate::config::{MIN_TRACK_TO_THRESHOLD_RATIO, SegmenterConfig};

use super::TelemetryFrame;

/// A contiguous run of frames for one vehicle between two start/finish crossings.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Lap {
    /// Sequential from 1, assigned by the segmenter
    pub lap_number: u32,
    pub start_time: f64,
    /// First frame of the next lap for closed laps, last frame otherwise
    pub end_time: f64,
    /// Indices into the frame slice the lap was segmented from
    pub frame_range: Range<usize>,
    /// False for the trailing lap that has not crossed the line yet
    pub closed: bool,
}

impl Lap {
    pub fn duration(&self) -> f64 {
        self.end_time - self.start_time
    }

    pub fn frames<'a>(&self, frames: &'a [TelemetryFrame]) -> &'a [TelemetryFrame] {
        let end = self.frame_range.end.min(frames.len());
        let start = self.frame_range.start.min(end);
        &frames[start..end]
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum SegmentationWarning {
    /// Detected lap count is further from the expected count than the tolerance.
    LapCountMismatch {
        detected: u32,
        expected: u32,
        tolerance: u32,
    },
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Segmentation {
    pub laps: Vec<Lap>,
    pub warnings: Vec<SegmentationWarning>,
}

/// Splits a vehicle's frames into laps by looking for lap distance resets.
///
/// Only the lap distance signal is used. The lap counter reported by the
/// logger is ignored.
#[derive(Clone, Debug)]
pub struct LapSegmenter {
    track_length_m: f64,
    wraparound_threshold_m: f64,
    lap_count_tolerance: u32,
}

impl LapSegmenter {
    pub fn new(track_length_m: f64, wraparound_threshold_m: f64) -> Result<Self, RaceCraftError> {
        if !wraparound_threshold_m.is_finite() || wraparound_threshold_m <= 0.0 {
            return Err(RaceCraftError::InvalidThreshold {
                threshold: wraparound_threshold_m,
            });
        }
        if !track_length_m.is_finite() || track_length_m <= 0.0 {
            return Err(RaceCraftError::InvalidTrackLength {
                track_length: track_length_m,
                threshold: wraparound_threshold_m,
                reason: "track length must be a positive distance".to_string(),
            });
        }
        if track_length_m < wraparound_threshold_m * MIN_TRACK_TO_THRESHOLD_RATIO {
            return Err(RaceCraftError::InvalidTrackLength {
                track_length: track_length_m,
                threshold: wraparound_threshold_m,
                reason: format!(
                    "track must be at least {}x the wraparound threshold",
                    MIN_TRACK_TO_THRESHOLD_RATIO
                ),
            });
        }

        Ok(Self {
            track_length_m,
            wraparound_threshold_m,
            lap_count_tolerance: 2,
        })
    }

    pub fn from_config(config: &SegmenterConfig) -> Result<Self, RaceCraftError> {
        Ok(Self::new(config.track_length_m, config.wraparound_threshold_m)?
            .with_lap_count_tolerance(config.lap_count_tolerance))
    }

    pub fn with_lap_count_tolerance(mut self, tolerance: u32) -> Self {
        self.lap_count_tolerance = tolerance;
        self
    }

    pub fn track_length_m(&self) -> f64 {
        self.track_length_m
    }

    /// Indices of the frames that open a new lap.
    ///
    /// A reset is a drop in lap distance larger than the threshold between two
    /// consecutive readings. Smaller reversals are sensor noise.
    pub fn detect_boundaries(&self, frames: &[TelemetryFrame]) -> Vec<usize> {
        let mut boundaries = Vec::new();
        let mut previous: Option<f64> = None;

        for (idx, frame) in frames.iter().enumerate() {
            let Some(distance) = frame.lap_distance_m else {
                continue;
            };
            if previous.is_some_and(|prev| distance - prev < -self.wraparound_threshold_m) {
                boundaries.push(idx);
            }
            previous = Some(distance);
        }

        boundaries
    }

    /// Partition `frames` into laps. The trailing lap is always emitted, even
    /// when it has not crossed the line yet.
    pub fn segment(&self, frames: &[TelemetryFrame]) -> Vec<Lap> {
        if frames.is_empty() {
            return Vec::new();
        }

        let boundaries = self.detect_boundaries(frames);
        let mut laps = Vec::with_capacity(boundaries.len() + 1);
        let mut start = 0usize;

        for (lap_idx, end) in boundaries
            .iter()
            .copied()
            .chain(std::iter::once(frames.len()))
            .enumerate()
        {
            let closed = end < frames.len();
            let end_time = if closed {
                frames[end].time
            } else {
                frames[end - 1].time
            };
            laps.push(Lap {
                lap_number: lap_idx as u32 + 1,
                start_time: frames[start].time,
                end_time,
                frame_range: start..end,
                closed,
            });
            start = end;
        }

        debug!(
            "Segmented {} frames into {} laps ({} closed)",
            frames.len(),
            laps.len(),
            boundaries.len()
        );

        laps
    }

    /// Segment and compare the lap count against an externally known one.
    pub fn segment_validated(
        &self,
        frames: &[TelemetryFrame],
        expected_laps: Option<u32>,
    ) -> Segmentation {
        let laps = self.segment(frames);
        let warnings = expected_laps
            .and_then(|expected| self.validate_lap_count(laps.len() as u32, expected))
            .into_iter()
            .collect();
        Segmentation { laps, warnings }
    }

    pub fn validate_lap_count(&self, detected: u32, expected: u32) -> Option<SegmentationWarning> {
        if detected.abs_diff(expected) <= self.lap_count_tolerance {
            return None;
        }
        warn!(
            "Detected {} laps but expected {} (tolerance {})",
            detected, expected, self.lap_count_tolerance
        );
        Some(SegmentationWarning::LapCountMismatch {
            detected,
            expected,
            tolerance: self.lap_count_tolerance,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn frames_from_distances(distances: &[f64]) -> Vec<TelemetryFrame> {
        distances
            .iter()
            .enumerate()
            .map(|(idx, distance)| TelemetryFrame {
                time: idx as f64 * 0.5,
                lap_distance_m: Some(*distance),
                ..Default::default()
            })
            .collect()
    }

    #[test]
    fn test_track_much_shorter_than_threshold_rejected() {
        let result = LapSegmenter::new(50.0, 100.0);
        assert!(matches!(
            result,
            Err(RaceCraftError::InvalidTrackLength { .. })
        ));
        assert!(matches!(
            LapSegmenter::new(2380.0, 0.0),
            Err(RaceCraftError::InvalidThreshold { .. })
        ));
    }

    #[test]
    fn test_single_wraparound_splits_two_laps() {
        let segmenter = LapSegmenter::new(2380.0, 100.0).unwrap();
        let frames = frames_from_distances(&[0.0, 800.0, 1600.0, 2370.0, 10.0, 900.0]);

        let laps = segmenter.segment(&frames);
        assert_eq!(laps.len(), 2);
        assert_eq!(laps[0].frame_range, 0..4);
        assert!(laps[0].closed);
        assert_eq!(laps[0].end_time, frames[4].time);
        assert_eq!(laps[1].lap_number, 2);
        assert_eq!(laps[1].frame_range, 4..6);
        assert!(!laps[1].closed);
        assert_eq!(laps[1].end_time, frames[5].time);
    }

    #[test]
    fn test_noise_dips_do_not_trigger() {
        let segmenter = LapSegmenter::new(2380.0, 100.0).unwrap();
        let frames = frames_from_distances(&[0.0, 500.0, 460.0, 470.0, 420.0, 1000.0, 950.0]);

        let laps = segmenter.segment(&frames);
        assert_eq!(laps.len(), 1);
        assert!(!laps[0].closed);
    }

    #[test]
    fn test_reported_lap_is_ignored() {
        let segmenter = LapSegmenter::new(2380.0, 100.0).unwrap();
        let mut frames = frames_from_distances(&[0.0, 1200.0, 2300.0, 5.0, 1000.0]);
        for frame in frames.iter_mut() {
            frame.reported_lap = Some(32768.0);
        }
        frames[1].reported_lap = Some(7.0);

        assert_eq!(segmenter.segment(&frames).len(), 2);
    }

    #[test]
    fn test_frames_without_distance_stay_in_current_lap() {
        let segmenter = LapSegmenter::new(2380.0, 100.0).unwrap();
        let mut frames = frames_from_distances(&[0.0, 0.0, 1200.0, 2300.0, 5.0]);
        frames[0].lap_distance_m = None;
        frames[1].lap_distance_m = None;

        let laps = segmenter.segment(&frames);
        assert_eq!(laps.len(), 2);
        assert_eq!(laps[0].frame_range, 0..4);
    }

    #[test]
    fn test_empty_input_yields_no_laps() {
        let segmenter = LapSegmenter::new(2380.0, 100.0).unwrap();
        assert!(segmenter.segment(&[]).is_empty());
    }

    #[test]
    fn test_lap_count_mismatch_is_a_warning() {
        let segmenter = LapSegmenter::new(2380.0, 100.0).unwrap();
        let frames = frames_from_distances(&[0.0, 1200.0, 2300.0, 5.0, 1000.0]);

        let within = segmenter.segment_validated(&frames, Some(4));
        assert!(within.warnings.is_empty());
        assert_eq!(within.laps.len(), 2);

        let outside = segmenter.segment_validated(&frames, Some(27));
        assert_eq!(outside.laps.len(), 2);
        assert_eq!(
            outside.warnings,
            vec![SegmentationWarning::LapCountMismatch {
                detected: 2,
                expected: 27,
                tolerance: 2
            }]
        );
    }

    #[test]
    fn test_lap_frames_slice() {
        let segmenter = LapSegmenter::new(2380.0, 100.0).unwrap();
        let frames = frames_from_distances(&[0.0, 1200.0, 2300.0, 5.0, 1000.0]);
        let laps = segmenter.segment(&frames);

        assert_eq!(laps[1].frames(&frames).len(), 2);
        assert_eq!(laps[0].duration(), 1.5);
    }

    fn lap_profile() -> impl Strategy<Value = Vec<Vec<f64>>> {
        // Each lap: monotonic distances with optional small dips
        prop::collection::vec(
            prop::collection::vec((1.0f64..80.0, 0.0f64..60.0, any::<bool>()), 2..40),
            1..8,
        )
        .prop_map(|laps| {
            laps.into_iter()
                .map(|steps| {
                    let mut distance = 0.0;
                    steps
                        .into_iter()
                        .map(|(advance, dip, dips)| {
                            distance += advance;
                            if dips {
                                (distance - dip).max(0.0)
                            } else {
                                distance
                            }
                        })
                        .collect()
                })
                .collect()
        })
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_one_boundary_per_reset(laps in lap_profile()) {
            let segmenter = LapSegmenter::new(5000.0, 100.0).unwrap();
            let mut distances = Vec::new();
            let mut resets = 0usize;
            for (idx, lap) in laps.iter().enumerate() {
                // Every generated lap ends well past the threshold, so the
                // next lap's first reading is a reset.
                let mut lap = lap.clone();
                lap.push(lap.last().copied().unwrap_or(0.0) + 400.0);
                if idx > 0 {
                    resets += 1;
                }
                distances.extend(lap);
            }
            let frames = frames_from_distances(&distances);

            let boundaries = segmenter.detect_boundaries(&frames);
            prop_assert_eq!(boundaries.len(), resets);

            let segmented = segmenter.segment(&frames);
            prop_assert_eq!(segmented.len(), resets + 1);
            prop_assert_eq!(segmented[0].frame_range.start, 0);
            prop_assert_eq!(segmented.last().unwrap().frame_range.end, frames.len());
            for pair in segmented.windows(2) {
                prop_assert_eq!(pair[0].frame_range.end, pair[1].frame_range.start);
                prop_assert!(pair[0].closed);
            }
        }
    }
}
