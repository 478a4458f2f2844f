//! Missing-value imputation, derived columns and fitted scaling.
//!
//! `fit` learns per-column global means and scaler statistics once; `transform`
//! replays them without refitting, so training and inference share one code
//! path and `transform(x, fit(x))` equals `fit_transform(x).0` exactly.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::features::{
    add_growth_stage, add_heat_units, assert_schema_compatible, build_feature_schema,
    FeatureError, FeatureSchema, DEFAULT_BASE_TEMPERATURE, DEFAULT_ROLLING_SPANS,
};
use crate::table::{ColumnKind, TableColumn, WindowTable};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizerConfig {
    pub base_temperature: f64,
    pub rolling_spans: Vec<u32>,
    pub scaler_range: (f64, f64),
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            base_temperature: DEFAULT_BASE_TEMPERATURE,
            rolling_spans: DEFAULT_ROLLING_SPANS.to_vec(),
            scaler_range: (0.0, 1.0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ColumnScaler {
    Standard {
        mean: f64,
        scale: f64,
    },
    MinMax {
        data_min: f64,
        data_span: f64,
        range_min: f64,
        range_max: f64,
    },
}

impl ColumnScaler {
    fn fit(kind: ColumnKind, values: &[f64], range: (f64, f64)) -> Self {
        match kind {
            ColumnKind::Weather => {
                let n = values.len().max(1) as f64;
                let mean = values.iter().sum::<f64>() / n;
                let variance = values
                    .iter()
                    .map(|v| {
                        let d = *v - mean;
                        d * d
                    })
                    .sum::<f64>()
                    / n;
                let std = variance.sqrt();
                Self::Standard {
                    mean,
                    scale: if std > f64::EPSILON { std } else { 1.0 },
                }
            }
            ColumnKind::Bounded => {
                let data_min = values.iter().copied().fold(f64::INFINITY, f64::min);
                let data_max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                let (data_min, data_span) = if data_min.is_finite() && data_max.is_finite() {
                    let span = data_max - data_min;
                    (data_min, if span > 0.0 { span } else { 1.0 })
                } else {
                    (0.0, 1.0)
                };
                Self::MinMax {
                    data_min,
                    data_span,
                    range_min: range.0,
                    range_max: range.1,
                }
            }
        }
    }

    pub fn apply(&self, value: f64) -> f64 {
        match *self {
            Self::Standard { mean, scale } => (value - mean) / scale,
            Self::MinMax {
                data_min,
                data_span,
                range_min,
                range_max,
            } => (value - data_min) / data_span * (range_max - range_min) + range_min,
        }
    }

    pub fn inverse(&self, value: f64) -> f64 {
        match *self {
            Self::Standard { mean, scale } => value * scale + mean,
            Self::MinMax {
                data_min,
                data_span,
                range_min,
                range_max,
            } => (value - range_min) / (range_max - range_min) * data_span + data_min,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FittedColumn {
    pub name: String,
    pub kind: ColumnKind,
    pub scaler: ColumnScaler,
}

/// Everything learned at fit time. Persist next to the trained model and
/// reload it for inference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FittedScalers {
    pub config: NormalizerConfig,
    pub input_columns: Vec<TableColumn>,
    /// Fallback fill per input column; `None` when the column had no values.
    pub global_means: Vec<Option<f64>>,
    pub schema: FeatureSchema,
    pub columns: Vec<FittedColumn>,
}

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("cannot fit scalers on an empty window table")]
    EmptyTable,
    #[error("invalid scaler range ({0}, {1}): min must be below max")]
    InvalidRange(f64, f64),
    #[error("input columns differ from fitted layout: expected {expected:?}, got {actual:?}")]
    ColumnMismatch {
        expected: Vec<String>,
        actual: Vec<String>,
    },
    #[error(transparent)]
    Feature(#[from] FeatureError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("scaler serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl FittedScalers {
    pub fn column(&self, name: &str) -> Option<&FittedColumn> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Maps a scaled value of `column` back to its engineered unit.
    pub fn inverse(&self, column: &str, value: f64) -> Option<f64> {
        self.column(column).map(|c| c.scaler.inverse(value))
    }

    pub fn save_json(&self, path: &Path) -> Result<(), NormalizeError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }

    pub fn load_json(path: &Path) -> Result<Self, NormalizeError> {
        let bytes = fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

pub fn fit(table: &WindowTable, cfg: &NormalizerConfig) -> Result<FittedScalers, NormalizeError> {
    if table.rows.is_empty() {
        return Err(NormalizeError::EmptyTable);
    }
    let (range_min, range_max) = cfg.scaler_range;
    if !(range_min < range_max) {
        return Err(NormalizeError::InvalidRange(range_min, range_max));
    }

    let global_means: Vec<Option<f64>> = (0..table.columns.len())
        .map(|idx| mean(table.rows.iter().filter_map(|row| row.values[idx])))
        .collect();

    let prepared = prepare(table, &global_means, cfg)?;
    let columns = prepared
        .columns
        .iter()
        .enumerate()
        .map(|(idx, column)| {
            let values: Vec<f64> = prepared.rows.iter().filter_map(|r| r.values[idx]).collect();
            FittedColumn {
                name: column.name.clone(),
                kind: column.kind,
                scaler: ColumnScaler::fit(column.kind, &values, cfg.scaler_range),
            }
        })
        .collect();
    let schema = build_feature_schema(&prepared.columns, cfg.base_temperature, &cfg.rolling_spans);

    info!(
        component = "normalize",
        event = "normalize.fit.finish",
        rows = table.rows.len(),
        columns = prepared.columns.len(),
        fingerprint = %schema.fingerprint
    );

    Ok(FittedScalers {
        config: cfg.clone(),
        input_columns: table.columns.clone(),
        global_means,
        schema,
        columns,
    })
}

/// Applies previously fitted state. Never refits.
pub fn transform(table: &WindowTable, scalers: &FittedScalers) -> Result<WindowTable, NormalizeError> {
    if table.columns != scalers.input_columns {
        return Err(NormalizeError::ColumnMismatch {
            expected: scalers.input_columns.iter().map(|c| c.name.clone()).collect(),
            actual: table.column_names(),
        });
    }

    let mut prepared = prepare(table, &scalers.global_means, &scalers.config)?;
    let schema = build_feature_schema(
        &prepared.columns,
        scalers.config.base_temperature,
        &scalers.config.rolling_spans,
    );
    assert_schema_compatible(scalers.schema.version, &scalers.schema.fingerprint, &schema)?;

    for row in &mut prepared.rows {
        for (cell, fitted) in row.values.iter_mut().zip(&scalers.columns) {
            *cell = cell.map(|v| fitted.scaler.apply(v));
        }
    }
    Ok(prepared)
}

pub fn fit_transform(
    table: &WindowTable,
    cfg: &NormalizerConfig,
) -> Result<(WindowTable, FittedScalers), NormalizeError> {
    let scalers = fit(table, cfg)?;
    let transformed = transform(table, &scalers)?;
    Ok((transformed, scalers))
}

fn prepare(
    table: &WindowTable,
    global_means: &[Option<f64>],
    cfg: &NormalizerConfig,
) -> Result<WindowTable, NormalizeError> {
    let mut prepared = table.clone();
    impute(&mut prepared, global_means);
    add_heat_units(&mut prepared, cfg.base_temperature)?;
    add_growth_stage(&mut prepared);
    Ok(prepared)
}

/// Group mean first, then the fitted global mean, then zero.
fn impute(table: &mut WindowTable, global_means: &[Option<f64>]) {
    let groups = table.group_indices();
    for col_idx in 0..table.columns.len() {
        let mut group_means = BTreeMap::new();
        for (key, indices) in &groups {
            let group_mean = mean(indices.iter().filter_map(|i| table.rows[*i].values[col_idx]));
            group_means.insert(key.clone(), group_mean);
        }

        let global = global_means.get(col_idx).copied().flatten();
        let mut zero_filled = 0usize;
        for row in &mut table.rows {
            if row.values[col_idx].is_some() {
                continue;
            }
            let fill = group_means.get(&row.key).copied().flatten().or(global);
            row.values[col_idx] = Some(fill.unwrap_or_else(|| {
                zero_filled += 1;
                0.0
            }));
        }

        if zero_filled > 0 {
            warn!(
                component = "normalize",
                event = "normalize.impute.zero_fill",
                column = %table.columns[col_idx].name,
                rows = zero_filled
            );
        }
    }
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, count) = values.fold((0.0, 0usize), |(s, c), v| (s + v, c + 1));
    (count > 0).then(|| sum / count as f64)
}
