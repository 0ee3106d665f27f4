use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::thread::{self, JoinHandle};

use log::{info, warn};
use nalgebra::{DMatrix, DVector};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::RaceCraftError;
use crate::features::EngineeredFeatureRow;
use crate::features::dataset::{TrainingSet, feature_names, window_features};

use super::pace::Forecaster;

/// Ridge penalties tried during training, best validation MAE wins.
pub const RIDGE_PENALTY_GRID: [f64; 5] = [0.01, 0.1, 1.0, 10.0, 100.0];
pub const VALIDATION_FRACTION: f64 = 0.2;
pub const SPLIT_SEED: u64 = 42;
pub const MIN_TRAINING_SAMPLES: usize = 5;

/// Linear lap time regressor over standardised window features.
///
/// Missing inputs are imputed with the training mean, which contributes
/// nothing after standardisation.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PaceModel {
    pub lookback: usize,
    pub feature_names: Vec<String>,
    pub means: Vec<f64>,
    pub scales: Vec<f64>,
    pub weights: Vec<f64>,
    pub intercept: f64,
    pub ridge_penalty: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TrainingMetrics {
    pub train_rmse: f64,
    pub train_mae: f64,
    pub val_rmse: f64,
    pub val_mae: f64,
    pub num_samples: usize,
    pub num_features: usize,
    pub ridge_penalty: f64,
}

impl PaceModel {
    /// Predict one lap time from a flattened input vector.
    pub fn predict(&self, inputs: &[Option<f64>]) -> Option<f64> {
        if inputs.len() != self.weights.len() {
            return None;
        }
        let prediction = self.intercept
            + inputs
                .iter()
                .zip(self.means.iter().zip(&self.scales))
                .zip(&self.weights)
                .map(|((value, (mean, scale)), weight)| {
                    let value = value.filter(|v| v.is_finite()).unwrap_or(*mean);
                    (value - mean) / scale * weight
                })
                .sum::<f64>();
        prediction.is_finite().then_some(prediction)
    }

    /// Predict the lap after the last row of `history`.
    pub fn predict_next(&self, history: &[EngineeredFeatureRow]) -> Option<f64> {
        if history.len() < self.lookback {
            return None;
        }
        self.predict(&window_features(&history[history.len() - self.lookback..]))
    }

    pub fn load(path: &Path) -> Result<Self, RaceCraftError> {
        let file = File::open(path).map_err(|e| RaceCraftError::ModelArtifactIOError {
            path: format!("{:?}", path),
            source: e,
        })?;
        let model: PaceModel = serde_json::from_reader(BufReader::new(file)).map_err(|e| {
            RaceCraftError::ModelArtifactFormatError {
                path: format!("{:?}", path),
                source: e,
            }
        })?;
        model.validate()?;
        info!(
            "Loaded pace model from {:?} ({} features, lookback {})",
            path,
            model.weights.len(),
            model.lookback
        );
        Ok(model)
    }

    pub fn save(&self, path: &Path) -> Result<(), RaceCraftError> {
        let io_error = |e: std::io::Error| RaceCraftError::ModelArtifactIOError {
            path: format!("{:?}", path),
            source: e,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_error)?;
        }
        let file = File::create(path).map_err(io_error)?;
        serde_json::to_writer_pretty(BufWriter::new(file), self).map_err(|e| {
            RaceCraftError::ModelArtifactFormatError {
                path: format!("{:?}", path),
                source: e,
            }
        })
    }

    fn validate(&self) -> Result<(), RaceCraftError> {
        let expected = feature_names(self.lookback);
        if self.feature_names != expected {
            return Err(RaceCraftError::ModelArtifactMismatch {
                reason: format!(
                    "feature names do not match the layout for lookback {}",
                    self.lookback
                ),
            });
        }
        let n = expected.len();
        if self.means.len() != n || self.scales.len() != n || self.weights.len() != n {
            return Err(RaceCraftError::ModelArtifactMismatch {
                reason: format!("expected {} means, scales and weights", n),
            });
        }
        if self.scales.iter().any(|s| *s <= 0.0 || !s.is_finite()) {
            return Err(RaceCraftError::ModelArtifactMismatch {
                reason: "scales must be positive".to_string(),
            });
        }
        Ok(())
    }
}

/// Column means and scales over the observed training values.
fn standardisation(samples: &[&Vec<Option<f64>>], width: usize) -> (Vec<f64>, Vec<f64>) {
    (0..width)
        .map(|col| {
            let observed: Vec<f64> = samples
                .iter()
                .filter_map(|row| row[col].filter(|v| v.is_finite()))
                .collect();
            let mean = crate::features::stats::mean(&observed).unwrap_or(0.0);
            let scale = crate::features::stats::population_std(&observed)
                .filter(|s| *s > f64::EPSILON)
                .unwrap_or(1.0);
            (mean, scale)
        })
        .unzip()
}

fn design_matrix(samples: &[&Vec<Option<f64>>], means: &[f64], scales: &[f64]) -> DMatrix<f64> {
    DMatrix::from_fn(samples.len(), means.len(), |row, col| {
        let value = samples[row][col]
            .filter(|v| v.is_finite())
            .unwrap_or(means[col]);
        (value - means[col]) / scales[col]
    })
}

fn fit_ridge(
    x: &DMatrix<f64>,
    y: &DVector<f64>,
    penalty: f64,
) -> Result<(DVector<f64>, f64), RaceCraftError> {
    let intercept = y.mean();
    let centered = y.add_scalar(-intercept);
    let gram = x.transpose() * x + DMatrix::identity(x.ncols(), x.ncols()) * penalty;
    let rhs = x.transpose() * centered;
    let cholesky = gram.cholesky().ok_or_else(|| RaceCraftError::TrainingSolveFailed {
        reason: format!("normal equations not positive definite for penalty {}", penalty),
    })?;
    Ok((cholesky.solve(&rhs), intercept))
}

fn errors(x: &DMatrix<f64>, y: &DVector<f64>, weights: &DVector<f64>, intercept: f64) -> (f64, f64) {
    let residuals = (x * weights).add_scalar(intercept) - y;
    let n = residuals.len().max(1) as f64;
    let rmse = (residuals.iter().map(|r| r * r).sum::<f64>() / n).sqrt();
    let mae = residuals.iter().map(|r| r.abs()).sum::<f64>() / n;
    (rmse, mae)
}

/// Fit a pace model with a seeded train/validation split.
///
/// `cancel` is checked between penalty candidates.
pub fn train(
    set: &TrainingSet,
    lookback: usize,
    mae_target_s: f64,
    cancel: &AtomicBool,
) -> Result<(PaceModel, TrainingMetrics), RaceCraftError> {
    if set.len() < MIN_TRAINING_SAMPLES {
        return Err(RaceCraftError::InsufficientTrainingData {
            available: set.len(),
            required: MIN_TRAINING_SAMPLES,
        });
    }
    let width = set.feature_names.len();
    if width != feature_names(lookback).len() || set.samples.iter().any(|s| s.len() != width) {
        return Err(RaceCraftError::ModelArtifactMismatch {
            reason: format!("training samples do not match lookback {}", lookback),
        });
    }

    let mut indices: Vec<usize> = (0..set.len()).collect();
    indices.shuffle(&mut StdRng::seed_from_u64(SPLIT_SEED));
    let val_count = ((set.len() as f64 * VALIDATION_FRACTION).ceil() as usize).max(1);
    let (val_idx, train_idx) = indices.split_at(val_count);

    let pick = |idx: &[usize]| -> (Vec<&Vec<Option<f64>>>, DVector<f64>) {
        (
            idx.iter().map(|i| &set.samples[*i]).collect(),
            DVector::from_iterator(idx.len(), idx.iter().map(|i| set.targets[*i])),
        )
    };
    let (train_samples, y_train) = pick(train_idx);
    let (val_samples, y_val) = pick(val_idx);

    let (means, scales) = standardisation(&train_samples, width);
    let x_train = design_matrix(&train_samples, &means, &scales);
    let x_val = design_matrix(&val_samples, &means, &scales);

    let mut best: Option<(f64, DVector<f64>, f64, f64)> = None;
    for penalty in RIDGE_PENALTY_GRID {
        if cancel.load(Ordering::Relaxed) {
            warn!("Pace model training cancelled");
            return Err(RaceCraftError::TrainingCancelled);
        }
        let (weights, intercept) = fit_ridge(&x_train, &y_train, penalty)?;
        let (_, val_mae) = errors(&x_val, &y_val, &weights, intercept);
        if best.as_ref().is_none_or(|(_, _, _, best_mae)| val_mae < *best_mae) {
            best = Some((penalty, weights, intercept, val_mae));
        }
    }
    let Some((ridge_penalty, weights, intercept, _)) = best else {
        return Err(RaceCraftError::TrainingSolveFailed {
            reason: "no penalty candidate was evaluated".to_string(),
        });
    };

    let (train_rmse, train_mae) = errors(&x_train, &y_train, &weights, intercept);
    let (val_rmse, val_mae) = errors(&x_val, &y_val, &weights, intercept);
    let metrics = TrainingMetrics {
        train_rmse,
        train_mae,
        val_rmse,
        val_mae,
        num_samples: set.len(),
        num_features: width,
        ridge_penalty,
    };

    info!(
        "Training complete: RMSE={:.3}s, MAE={:.3}s (penalty {})",
        val_rmse, val_mae, ridge_penalty
    );
    if val_mae > mae_target_s {
        warn!(
            "Target accuracy not met. MAE={:.3}s > {:.2}s",
            val_mae, mae_target_s
        );
    }

    let model = PaceModel {
        lookback,
        feature_names: set.feature_names.clone(),
        means,
        scales,
        weights: weights.iter().copied().collect(),
        intercept,
        ridge_penalty,
    };
    Ok((model, metrics))
}

type TrainingResult = Result<(PaceModel, TrainingMetrics), RaceCraftError>;

/// Model training running on its own thread.
///
/// Inference keeps using the session's current forecaster while this runs.
pub struct TrainingTask {
    cancel: Arc<AtomicBool>,
    receiver: Receiver<TrainingResult>,
    handle: Option<JoinHandle<()>>,
}

impl TrainingTask {
    pub fn spawn(set: TrainingSet, lookback: usize, mae_target_s: f64) -> Self {
        let cancel = Arc::new(AtomicBool::new(false));
        let (sender, receiver) = mpsc::channel();
        let worker_cancel = Arc::clone(&cancel);

        let handle = thread::spawn(move || {
            let result = train(&set, lookback, mae_target_s, &worker_cancel);
            // The receiver may be gone if the task was dropped
            let _ = sender.send(result);
        });

        Self {
            cancel,
            receiver,
            handle: Some(handle),
        }
    }

    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    /// Non-blocking check for a finished result.
    pub fn try_result(&mut self) -> Option<TrainingResult> {
        match self.receiver.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(RaceCraftError::TrainingWorkerLost)),
        }
    }

    /// Block until training ends.
    pub fn join(mut self) -> TrainingResult {
        let result = self
            .receiver
            .recv()
            .unwrap_or(Err(RaceCraftError::TrainingWorkerLost));
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                return Err(RaceCraftError::TrainingWorkerLost);
            }
        }
        result
    }

    /// Block until training ends and pick the forecaster to use. Any failure
    /// falls back to trend extrapolation.
    pub fn finish(self) -> Forecaster {
        match self.join() {
            Ok((model, _)) => Forecaster::Trained(model),
            Err(e) => {
                warn!("Pace model unavailable, using trend extrapolation: {}", e);
                Forecaster::TrendOnly
            }
        }
    }
}
