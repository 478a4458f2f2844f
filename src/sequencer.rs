//! Prefix-sequence construction over contiguous season windows.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::records::SeasonKey;
use crate::table::{TableColumn, WindowRow, WindowTable};

/// Row-major matrix, one row per window, oldest first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureMatrix {
    n_rows: usize,
    n_cols: usize,
    values: Vec<f64>,
}

impl FeatureMatrix {
    pub fn from_rows(rows: &[Vec<f64>]) -> Self {
        let n_cols = rows.first().map(Vec::len).unwrap_or(0);
        Self {
            n_rows: rows.len(),
            n_cols,
            values: rows.iter().flatten().copied().collect(),
        }
    }

    pub fn n_rows(&self) -> usize {
        self.n_rows
    }

    pub fn n_cols(&self) -> usize {
        self.n_cols
    }

    pub fn row(&self, idx: usize) -> &[f64] {
        &self.values[idx * self.n_cols..(idx + 1) * self.n_cols]
    }

    pub fn rows(&self) -> impl Iterator<Item = &[f64]> {
        (0..self.n_rows).map(move |idx| self.row(idx))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceMetadata {
    pub key: SeasonKey,
    pub length: usize,
    pub total_windows: usize,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub is_final: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceExample {
    pub features: FeatureMatrix,
    pub label: f64,
    pub metadata: SequenceMetadata,
}

#[derive(Debug, Error, PartialEq)]
pub enum SequenceError {
    #[error("rows from {found} mixed into group {expected}")]
    MixedGroups { expected: SeasonKey, found: SeasonKey },
    #[error("window numbers for {key} are not contiguous from 1: {window_nums:?}")]
    SequenceIntegrity { key: SeasonKey, window_nums: Vec<u32> },
    #[error("window {window_num} of {key} carries a season-end flag or label but is not last")]
    MisplacedSeasonEnd { key: SeasonKey, window_num: u32 },
    #[error("window {window_num} of {key} has no value for {column}")]
    MissingValue {
        key: SeasonKey,
        window_num: u32,
        column: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectedGroup {
    pub key: SeasonKey,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SequenceReport {
    pub groups_total: usize,
    pub groups_used: usize,
    pub groups_unlabeled: usize,
    pub rejected: Vec<RejectedGroup>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SequenceBatch {
    pub examples: Vec<SequenceExample>,
    pub report: SequenceReport,
}

/// Emits one example per non-empty prefix of a single group's windows, each
/// labeled with the season-end yield. Unlabeled groups produce no examples.
pub fn build_sequences(
    rows: &[WindowRow],
    columns: &[TableColumn],
) -> Result<Vec<SequenceExample>, SequenceError> {
    let Some(first) = rows.first() else {
        return Ok(Vec::new());
    };
    let key = &first.key;
    let last_idx = rows.len() - 1;

    if let Some(other) = rows.iter().find(|row| &row.key != key) {
        return Err(SequenceError::MixedGroups {
            expected: key.clone(),
            found: other.key.clone(),
        });
    }

    let contiguous = rows
        .iter()
        .enumerate()
        .all(|(idx, row)| row.window_num as usize == idx + 1);
    if !contiguous {
        return Err(SequenceError::SequenceIntegrity {
            key: key.clone(),
            window_nums: rows.iter().map(|row| row.window_num).collect(),
        });
    }

    if let Some(row) = rows[..last_idx]
        .iter()
        .find(|row| row.is_season_end || row.label.is_some())
    {
        return Err(SequenceError::MisplacedSeasonEnd {
            key: key.clone(),
            window_num: row.window_num,
        });
    }

    let last = &rows[last_idx];
    let label = match (last.is_season_end, last.label) {
        (true, Some(label)) => label,
        _ => {
            debug!(
                component = "sequencer",
                event = "sequencer.group.unlabeled",
                key = %key,
                windows = rows.len()
            );
            return Ok(Vec::new());
        }
    };

    let mut dense: Vec<Vec<f64>> = Vec::with_capacity(rows.len());
    for row in rows {
        let mut values = Vec::with_capacity(row.values.len());
        for (idx, cell) in row.values.iter().copied().enumerate() {
            let value = cell.ok_or_else(|| SequenceError::MissingValue {
                key: key.clone(),
                window_num: row.window_num,
                column: columns
                    .get(idx)
                    .map(|c| c.name.clone())
                    .unwrap_or_else(|| format!("#{idx}")),
            })?;
            values.push(value);
        }
        dense.push(values);
    }

    let examples = (1..=rows.len())
        .map(|len| SequenceExample {
            features: FeatureMatrix::from_rows(&dense[..len]),
            label,
            metadata: SequenceMetadata {
                key: key.clone(),
                length: len,
                total_windows: rows.len(),
                start_date: first.start_date,
                end_date: rows[len - 1].end_date,
                is_final: len == rows.len(),
            },
        })
        .collect();

    Ok(examples)
}

/// Sequences every group of `table`. A group failing validation is dropped
/// whole and recorded in the report; the others are unaffected.
pub fn build_all(table: &WindowTable) -> SequenceBatch {
    let mut batch = SequenceBatch::default();

    for (key, indices) in table.group_indices() {
        batch.report.groups_total += 1;
        let mut rows: Vec<WindowRow> = indices.iter().map(|i| table.rows[*i].clone()).collect();
        rows.sort_by_key(|row| row.window_num);

        match build_sequences(&rows, &table.columns) {
            Ok(examples) if examples.is_empty() => batch.report.groups_unlabeled += 1,
            Ok(mut examples) => {
                batch.report.groups_used += 1;
                batch.examples.append(&mut examples);
            }
            Err(err) => {
                warn!(
                    component = "sequencer",
                    event = "sequencer.group.rejected",
                    key = %key,
                    error = %err
                );
                batch.report.rejected.push(RejectedGroup {
                    key,
                    reason: err.to_string(),
                });
            }
        }
    }

    info!(
        component = "sequencer",
        event = "sequencer.build.finish",
        groups_total = batch.report.groups_total,
        groups_used = batch.report.groups_used,
        groups_unlabeled = batch.report.groups_unlabeled,
        groups_rejected = batch.report.rejected.len(),
        examples = batch.examples.len()
    );

    batch
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feature_matrix_is_row_major() {
        let m = FeatureMatrix::from_rows(&[vec![1.0, 2.0], vec![3.0, 4.0]]);
        assert_eq!(m.n_rows(), 2);
        assert_eq!(m.n_cols(), 2);
        assert_eq!(m.row(1), &[3.0, 4.0]);
        assert_eq!(m.rows().count(), 2);
    }

    #[test]
    fn empty_matrix_has_no_columns() {
        let m = FeatureMatrix::from_rows(&[]);
        assert_eq!(m.n_rows(), 0);
        assert_eq!(m.n_cols(), 0);
    }
}
