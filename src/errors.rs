// Error types for racecraft

use snafu::Snafu;
use std::io;

#[derive(Debug, Snafu)]
pub enum RaceCraftError {
    // Configuration errors, fatal at construction time
    #[snafu(display(
        "Invalid track length {track_length}m for wraparound threshold {threshold}m: {reason}"
    ))]
    InvalidTrackLength {
        track_length: f64,
        threshold: f64,
        reason: String,
    },
    #[snafu(display("Invalid wraparound threshold {threshold}m"))]
    InvalidThreshold { threshold: f64 },
    #[snafu(display("Invalid configuration: {field} - {reason}"))]
    InvalidConfiguration { field: String, reason: String },

    // Config management errors
    #[snafu(display("Could not find application config directory"))]
    NoConfigDir,
    #[snafu(display("Error reading or writing config file"))]
    ConfigIOError { source: io::Error },
    #[snafu(display("Error (de)serializing config file"))]
    ConfigSerializeError { source: serde_json::Error },

    // Telemetry loading errors
    #[snafu(display("Error loading telemetry file"))]
    TelemetryLoaderError { source: io::Error },
    #[snafu(display("Invalid telemetry file: {path}"))]
    InvalidTelemetryFile { path: String },

    // Model artifact errors
    #[snafu(display("Error reading model artifact {path}"))]
    ModelArtifactIOError { path: String, source: io::Error },
    #[snafu(display("Malformed model artifact {path}"))]
    ModelArtifactFormatError {
        path: String,
        source: serde_json::Error,
    },
    #[snafu(display("Model artifact is inconsistent: {reason}"))]
    ModelArtifactMismatch { reason: String },

    // Training errors, never surfaced by the forecasting hot path
    #[snafu(display("Not enough samples to train: got {available}, need {required}"))]
    InsufficientTrainingData { available: usize, required: usize },
    #[snafu(display("Could not solve regression system: {reason}"))]
    TrainingSolveFailed { reason: String },
    #[snafu(display("Training was cancelled"))]
    TrainingCancelled,
    #[snafu(display("Training worker exited without reporting a result"))]
    TrainingWorkerLost,

    // Session errors
    #[snafu(display("Feature pipeline for vehicle {vehicle_id} panicked"))]
    PipelineWorkerLost { vehicle_id: String },
    #[snafu(display("Error writing strategy output"))]
    OutputError { source: serde_json::Error },
}
