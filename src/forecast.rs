//! Forecaster contract consumed by sequence models, plus a mean-yield
//! baseline.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::sequencer::{FeatureMatrix, SequenceExample};

/// z-score of a two-sided 95% band.
const BAND_Z: f64 = 1.96;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub point: f64,
    pub lower: f64,
    pub upper: f64,
}

#[derive(Debug, Error, PartialEq)]
pub enum ForecastError {
    #[error("no training examples")]
    NoTrainingExamples,
    #[error("feature matrix has no rows")]
    EmptyFeatures,
    #[error("feature width mismatch: model expects {expected} columns, got {actual}")]
    FeatureWidthMismatch { expected: usize, actual: usize },
}

pub trait YieldModel {
    fn predict(&self, features: &FeatureMatrix) -> Result<Prediction, ForecastError>;
}

pub trait Forecaster {
    type Model: YieldModel;

    fn train(&self, examples: &[SequenceExample]) -> Result<Self::Model, ForecastError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MeanYieldForecaster;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeanYieldModel {
    pub mean: f64,
    pub std: f64,
    pub n_cols: usize,
    pub seasons: usize,
}

impl Forecaster for MeanYieldForecaster {
    type Model = MeanYieldModel;

    /// Every prefix of a season repeats the same label, so only the final
    /// prefix of each season is counted.
    fn train(&self, examples: &[SequenceExample]) -> Result<MeanYieldModel, ForecastError> {
        let first = examples.first().ok_or(ForecastError::NoTrainingExamples)?;
        let finals: Vec<f64> = examples
            .iter()
            .filter(|ex| ex.metadata.is_final)
            .map(|ex| ex.label)
            .collect();
        let labels = if finals.is_empty() {
            examples.iter().map(|ex| ex.label).collect()
        } else {
            finals
        };

        let n = labels.len() as f64;
        let mean = labels.iter().sum::<f64>() / n;
        let variance = labels.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        let model = MeanYieldModel {
            mean,
            std: variance.sqrt(),
            n_cols: first.features.n_cols(),
            seasons: labels.len(),
        };

        info!(
            component = "forecast",
            event = "forecast.train.finish",
            seasons = model.seasons,
            mean = model.mean,
            std = model.std
        );
        Ok(model)
    }
}

impl YieldModel for MeanYieldModel {
    fn predict(&self, features: &FeatureMatrix) -> Result<Prediction, ForecastError> {
        if features.n_rows() == 0 {
            return Err(ForecastError::EmptyFeatures);
        }
        if features.n_cols() != self.n_cols {
            return Err(ForecastError::FeatureWidthMismatch {
                expected: self.n_cols,
                actual: features.n_cols(),
            });
        }
        let half_width = BAND_Z * self.std;
        Ok(Prediction {
            point: self.mean,
            lower: self.mean - half_width,
            upper: self.mean + half_width,
        })
    }
}
