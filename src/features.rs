//! Derived agronomic features and the feature schema fingerprint.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::info;

use crate::records::{CropRecord, Covariate};
use crate::table::{ColumnKind, TableColumn, WindowTable};
use crate::windows::{RollingValue, Window};

pub const FEATURE_SCHEMA_VERSION: u32 = 1;
pub const DEFAULT_BASE_TEMPERATURE: f64 = 10.0;
pub const DEFAULT_ROLLING_SPANS: [u32; 3] = [7, 14, 30];

pub const HEAT_UNIT_COLUMN: &str = "gdd";
pub const GROWTH_STAGE_COLUMN: &str = "growth_stage";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSchema {
    pub version: u32,
    pub fingerprint: String,
    pub columns: Vec<TableColumn>,
}

#[derive(Debug, Error, PartialEq)]
pub enum FeatureError {
    #[error("required column missing: {0}")]
    MissingColumn(String),
    #[error("windows cover {window_records} records but {records} records were supplied")]
    WindowRecordMismatch { window_records: usize, records: usize },
    #[error("schema version mismatch: expected {expected}, got {actual}")]
    SchemaVersionMismatch { expected: u32, actual: u32 },
    #[error("schema fingerprint mismatch: expected {expected}, got {actual}")]
    SchemaFingerprintMismatch { expected: String, actual: String },
}

pub fn temperature_rolling_column(span: u32) -> String {
    format!("temp_{span}d_avg")
}

pub fn precipitation_rolling_column(span: u32) -> String {
    format!("precip_{span}d_sum")
}

#[derive(Debug, Clone)]
struct Trailing {
    values: VecDeque<Option<f64>>,
    span: usize,
}

impl Trailing {
    fn new(span: usize) -> Self {
        Self {
            values: VecDeque::with_capacity(span),
            span,
        }
    }

    fn push(&mut self, value: Option<f64>) {
        self.values.push_back(value);
        while self.values.len() > self.span {
            self.values.pop_front();
        }
    }

    fn present(&self) -> impl Iterator<Item = f64> + '_ {
        self.values.iter().filter_map(|v| *v)
    }

    fn mean(&self) -> Option<f64> {
        let (sum, count) = self.present().fold((0.0, 0usize), |(s, c), v| (s + v, c + 1));
        (count > 0).then(|| sum / count as f64)
    }

    fn sum(&self) -> Option<f64> {
        let (sum, count) = self.present().fold((0.0, 0usize), |(s, c), v| (s + v, c + 1));
        (count > 0).then_some(sum)
    }
}

/// Trailing temperature means and precipitation sums for every record of a
/// group. Spans longer than the available history use whatever history
/// exists, so early records still get a value.
pub fn trailing_features(records: &[CropRecord], spans: &[u32]) -> Vec<Vec<RollingValue>> {
    let mut temps: Vec<Trailing> = spans.iter().map(|s| Trailing::new(*s as usize)).collect();
    let mut precips: Vec<Trailing> = spans.iter().map(|s| Trailing::new(*s as usize)).collect();

    records
        .iter()
        .map(|record| {
            let mut out = Vec::with_capacity(spans.len() * 2);
            for (span, state) in spans.iter().zip(temps.iter_mut()) {
                state.push(record.covariates.get(Covariate::Temperature2mMean));
                if let Some(value) = state.mean() {
                    out.push(RollingValue {
                        name: temperature_rolling_column(*span),
                        value,
                    });
                }
            }
            for (span, state) in spans.iter().zip(precips.iter_mut()) {
                state.push(record.covariates.get(Covariate::PrecipitationSum));
                if let Some(value) = state.sum() {
                    out.push(RollingValue {
                        name: precipitation_rolling_column(*span),
                        value,
                    });
                }
            }
            out
        })
        .collect()
}

/// Samples the trailing features at each window's final record.
pub fn attach_rolling(
    windows: &mut [Window],
    records: &[CropRecord],
    spans: &[u32],
) -> Result<(), FeatureError> {
    let window_records: usize = windows.iter().map(|w| w.record_count).sum();
    if window_records != records.len() {
        return Err(FeatureError::WindowRecordMismatch {
            window_records,
            records: records.len(),
        });
    }

    let mut per_record = trailing_features(records, spans);
    let mut end = 0usize;
    for window in windows.iter_mut() {
        end += window.record_count;
        window.rolling = std::mem::take(&mut per_record[end - 1]);
    }
    Ok(())
}

/// Adds the cumulative heat-unit column: the running sum of
/// `max(0, avg_temperature - base_temperature)` over each group's windows.
pub fn add_heat_units(table: &mut WindowTable, base_temperature: f64) -> Result<(), FeatureError> {
    let temp_column = Covariate::Temperature2mMean.window_column();
    let temp_idx = table
        .column_index(&temp_column)
        .ok_or(FeatureError::MissingColumn(temp_column))?;

    let mut values = vec![None; table.rows.len()];
    for (_, mut indices) in table.group_indices() {
        indices.sort_by_key(|idx| table.rows[*idx].window_num);
        let mut accumulated = 0.0;
        for idx in indices {
            if let Some(temp) = table.rows[idx].values[temp_idx] {
                accumulated += (temp - base_temperature).max(0.0);
            }
            values[idx] = Some(accumulated);
        }
    }

    table.set_column(TableColumn::bounded(HEAT_UNIT_COLUMN), values);
    Ok(())
}

/// Adds `window_num / last_window_num` per group, a 0..1 season progress.
pub fn add_growth_stage(table: &mut WindowTable) {
    let mut values = vec![None; table.rows.len()];
    for (_, indices) in table.group_indices() {
        let last = indices
            .iter()
            .map(|idx| table.rows[*idx].window_num)
            .max()
            .unwrap_or(1)
            .max(1);
        for idx in indices {
            values[idx] = Some(f64::from(table.rows[idx].window_num) / f64::from(last));
        }
    }
    table.set_column(TableColumn::bounded(GROWTH_STAGE_COLUMN), values);
}

pub fn build_feature_schema(
    columns: &[TableColumn],
    base_temperature: f64,
    rolling_spans: &[u32],
) -> FeatureSchema {
    let fingerprint = schema_fingerprint(columns, base_temperature, rolling_spans);

    info!(
        component = "features",
        event = "features.schema.built",
        version = FEATURE_SCHEMA_VERSION,
        spans = ?rolling_spans,
        column_count = columns.len(),
        fingerprint = fingerprint
    );

    FeatureSchema {
        version: FEATURE_SCHEMA_VERSION,
        fingerprint,
        columns: columns.to_vec(),
    }
}

pub fn assert_schema_compatible(
    expected_version: u32,
    expected_fingerprint: &str,
    actual: &FeatureSchema,
) -> Result<(), FeatureError> {
    if expected_version != actual.version {
        return Err(FeatureError::SchemaVersionMismatch {
            expected: expected_version,
            actual: actual.version,
        });
    }

    if expected_fingerprint != actual.fingerprint {
        return Err(FeatureError::SchemaFingerprintMismatch {
            expected: expected_fingerprint.to_string(),
            actual: actual.fingerprint.clone(),
        });
    }

    Ok(())
}

fn schema_fingerprint(columns: &[TableColumn], base_temperature: f64, spans: &[u32]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("version:{FEATURE_SCHEMA_VERSION};"));
    hasher.update(format!("base_temperature:{base_temperature};"));
    hasher.update("spans:");
    for span in spans {
        hasher.update(format!("{span},"));
    }
    hasher.update(";columns:");
    for column in columns {
        hasher.update(column.name.as_bytes());
        hasher.update(match column.kind {
            ColumnKind::Weather => ":weather;",
            ColumnKind::Bounded => ":bounded;",
        });
    }
    hex::encode(hasher.finalize())
}
