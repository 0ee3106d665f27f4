use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_jsonlines::JsonLinesReader;

use crate::RaceCraftError;

use super::TelemetrySample;

/// Samples for one vehicle of one race session.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TelemetryBatch {
    pub race: String,
    pub vehicle_id: String,
    pub track_length_m: f64,
    pub samples: Vec<TelemetrySample>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct VehicleInfo {
    pub vehicle_id: String,
    pub vehicle_number: Option<u32>,
}

impl VehicleInfo {
    /// Build from an id like `GR86-004-78`, whose last segment is the car number.
    pub fn from_id(vehicle_id: &str) -> Self {
        let vehicle_number = vehicle_id
            .rsplit('-')
            .next()
            .and_then(|number| number.parse().ok());
        Self {
            vehicle_id: vehicle_id.to_string(),
            vehicle_number,
        }
    }
}

/// Producer of telemetry sample batches.
pub trait TelemetrySource {
    /// Return the samples that arrived since the previous poll, one batch per vehicle.
    fn poll(&mut self, race: &str) -> Result<Vec<TelemetryBatch>, RaceCraftError>;
}

/// Lookup of the vehicles taking part in a race.
pub trait VehicleDirectory {
    fn vehicles(&self, race: &str) -> Result<Vec<VehicleInfo>, RaceCraftError>;
}

/// Reads samples from a JSON lines file, one `TelemetrySample` per line.
///
/// Each poll only returns lines appended since the previous poll, so the
/// source can follow a file that is still being written. A trailing line
/// without its newline is left for the next poll.
pub struct JsonlTelemetrySource {
    path: PathBuf,
    track_length_m: f64,
    /// Bytes of complete lines already returned
    offset: u64,
}

impl JsonlTelemetrySource {
    pub fn new(path: &Path, track_length_m: f64) -> Result<Self, RaceCraftError> {
        if !path.exists() {
            return Err(RaceCraftError::InvalidTelemetryFile {
                path: format!("{:?}", path),
            });
        }
        Ok(Self {
            path: path.to_path_buf(),
            track_length_m,
            offset: 0,
        })
    }

    /// Complete lines from byte `from` on, and the offset just past them.
    fn read_complete_lines(&self, from: u64) -> Result<(Vec<u8>, u64), RaceCraftError> {
        let mut file =
            File::open(&self.path).map_err(|e| RaceCraftError::TelemetryLoaderError { source: e })?;
        let len = file
            .metadata()
            .map_err(|e| RaceCraftError::TelemetryLoaderError { source: e })?
            .len();
        let from = if len < from {
            warn!(
                "{:?} shrank to {} bytes, reading it again from the start",
                self.path, len
            );
            0
        } else {
            from
        };

        file.seek(SeekFrom::Start(from))
            .map_err(|e| RaceCraftError::TelemetryLoaderError { source: e })?;
        let mut buffer = Vec::new();
        file.read_to_end(&mut buffer)
            .map_err(|e| RaceCraftError::TelemetryLoaderError { source: e })?;

        let complete = buffer
            .iter()
            .rposition(|byte| *byte == b'\n')
            .map_or(0, |newline| newline + 1);
        buffer.truncate(complete);
        Ok((buffer, from + complete as u64))
    }

    fn read_samples(&self, from: u64) -> Result<(Vec<TelemetrySample>, u64), RaceCraftError> {
        let (lines, offset) = self.read_complete_lines(from)?;

        let mut samples = Vec::new();
        let mut malformed = 0usize;
        for (idx, line) in JsonLinesReader::new(lines.as_slice())
            .read_all::<TelemetrySample>()
            .enumerate()
        {
            match line {
                Ok(sample) => samples.push(sample),
                Err(e) => {
                    malformed += 1;
                    debug!("Skipping malformed telemetry line {} after byte {}: {}", idx + 1, from, e);
                }
            }
        }
        if malformed > 0 {
            warn!(
                "Skipped {} malformed lines while reading {:?}",
                malformed, self.path
            );
        }
        Ok((samples, offset))
    }
}

impl TelemetrySource for JsonlTelemetrySource {
    fn poll(&mut self, race: &str) -> Result<Vec<TelemetryBatch>, RaceCraftError> {
        let (samples, offset) = self.read_samples(self.offset)?;
        self.offset = offset;

        let mut grouped: BTreeMap<String, Vec<TelemetrySample>> = BTreeMap::new();
        for sample in samples {
            grouped
                .entry(sample.vehicle_id.clone())
                .or_default()
                .push(sample);
        }
        debug!(
            "Polled {:?} for race {}: {} vehicles with new samples",
            self.path,
            race,
            grouped.len()
        );

        Ok(grouped
            .into_iter()
            .map(|(vehicle_id, samples)| TelemetryBatch {
                race: race.to_string(),
                vehicle_id,
                track_length_m: self.track_length_m,
                samples,
            })
            .collect())
    }
}

impl VehicleDirectory for JsonlTelemetrySource {
    fn vehicles(&self, _race: &str) -> Result<Vec<VehicleInfo>, RaceCraftError> {
        let (samples, _) = self.read_samples(0)?;
        let mut ids: Vec<&str> = samples.iter().map(|s| s.vehicle_id.as_str()).collect();
        ids.sort_unstable();
        ids.dedup();
        Ok(ids.into_iter().map(VehicleInfo::from_id).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::Signal;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_samples(path: &Path, samples: &[TelemetrySample]) {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        for sample in samples {
            writeln!(file, "{}", serde_json::to_string(sample).unwrap()).unwrap();
        }
    }

    #[test]
    fn test_vehicle_number_parsed_from_id() {
        assert_eq!(VehicleInfo::from_id("GR86-004-78").vehicle_number, Some(78));
        assert_eq!(VehicleInfo::from_id("unknown").vehicle_number, None);
    }

    #[test]
    fn test_missing_file_rejected() {
        let result = JsonlTelemetrySource::new(Path::new("/nonexistent/telemetry.jsonl"), 2380.0);
        assert!(matches!(
            result,
            Err(RaceCraftError::InvalidTelemetryFile { .. })
        ));
    }

    #[test]
    fn test_poll_returns_only_new_lines() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("race.jsonl");
        write_samples(
            &path,
            &[
                TelemetrySample::new(0.0, "GR86-002-2", Signal::Speed, 100.0),
                TelemetrySample::new(0.0, "GR86-004-78", Signal::Speed, 110.0),
            ],
        );

        let mut source = JsonlTelemetrySource::new(&path, 2380.0).unwrap();
        let first = source.poll("R1").unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].track_length_m, 2380.0);

        write_samples(
            &path,
            &[TelemetrySample::new(0.1, "GR86-004-78", Signal::Speed, 111.0)],
        );
        let second = source.poll("R1").unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].vehicle_id, "GR86-004-78");
        assert_eq!(second[0].samples.len(), 1);

        assert!(source.poll("R1").unwrap().is_empty());
    }

    #[test]
    fn test_malformed_lines_are_skipped() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("race.jsonl");
        write_samples(
            &path,
            &[TelemetrySample::new(0.0, "GR86-002-2", Signal::Speed, 100.0)],
        );
        {
            let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
            writeln!(file, "{{not json").unwrap();
        }

        let mut source = JsonlTelemetrySource::new(&path, 2380.0).unwrap();
        let batches = source.poll("R1").unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].samples.len(), 1);
    }

    #[test]
    fn test_partial_last_line_is_read_once_complete() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("race.jsonl");
        write_samples(
            &path,
            &[TelemetrySample::new(0.0, "GR86-002-2", Signal::Speed, 100.0)],
        );
        let line = serde_json::to_string(&TelemetrySample::new(
            0.1,
            "GR86-002-2",
            Signal::Speed,
            101.0,
        ))
        .unwrap();
        let (head, tail) = line.split_at(line.len() / 2);
        {
            let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
            write!(file, "{}", head).unwrap();
        }

        let mut source = JsonlTelemetrySource::new(&path, 2380.0).unwrap();
        let first = source.poll("R1").unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].samples.len(), 1);
        assert!(source.poll("R1").unwrap().is_empty());

        {
            let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
            writeln!(file, "{}", tail).unwrap();
        }
        let second = source.poll("R1").unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].samples.len(), 1);
        assert_eq!(second[0].samples[0].value, 101.0);
        assert!(source.poll("R1").unwrap().is_empty());
    }

    #[test]
    fn test_truncated_file_is_read_from_start() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("race.jsonl");
        write_samples(
            &path,
            &[
                TelemetrySample::new(0.0, "GR86-002-2", Signal::Speed, 100.0),
                TelemetrySample::new(0.1, "GR86-002-2", Signal::Speed, 101.0),
            ],
        );
        let mut source = JsonlTelemetrySource::new(&path, 2380.0).unwrap();
        assert_eq!(source.poll("R1").unwrap()[0].samples.len(), 2);

        std::fs::remove_file(&path).unwrap();
        write_samples(
            &path,
            &[TelemetrySample::new(0.0, "GR86-004-78", Signal::Speed, 90.0)],
        );
        let batches = source.poll("R1").unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].vehicle_id, "GR86-004-78");
    }

    #[test]
    fn test_directory_lists_distinct_vehicles() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("race.jsonl");
        write_samples(
            &path,
            &[
                TelemetrySample::new(0.0, "GR86-004-78", Signal::Speed, 100.0),
                TelemetrySample::new(0.1, "GR86-004-78", Signal::Speed, 101.0),
                TelemetrySample::new(0.0, "GR86-002-2", Signal::Speed, 99.0),
            ],
        );

        let source = JsonlTelemetrySource::new(&path, 2380.0).unwrap();
        let vehicles = source.vehicles("R1").unwrap();
        assert_eq!(
            vehicles,
            vec![
                VehicleInfo::from_id("GR86-002-2"),
                VehicleInfo::from_id("GR86-004-78")
            ]
        );
    }
}
