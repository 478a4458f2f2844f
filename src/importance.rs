//! Mutual-information feature importance against season-end yield.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::table::WindowTable;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureImportance {
    pub column: String,
    /// Share of total mutual information, in percent.
    pub percent: f64,
}

/// Scores every column by its mutual information with the yield label,
/// using season-end rows with a label only. Scores are normalized to sum to
/// 100. Returns an empty list with fewer than two usable rows or when no
/// column carries any information.
pub fn feature_importance(table: &WindowTable) -> Vec<FeatureImportance> {
    let rows: Vec<_> = table
        .rows
        .iter()
        .filter(|row| row.is_season_end && row.label.is_some())
        .collect();
    if rows.len() < 2 {
        debug!(
            component = "importance",
            event = "importance.skipped",
            season_end_rows = rows.len()
        );
        return Vec::new();
    }

    let labels: Vec<f64> = rows.iter().filter_map(|row| row.label).collect();
    let bins = bin_count(rows.len());
    let label_bins = discretize(&labels, bins);

    let raw: Vec<(String, f64)> = table
        .columns
        .iter()
        .enumerate()
        .filter_map(|(idx, column)| {
            let pairs: Vec<(f64, usize)> = rows
                .iter()
                .zip(&label_bins)
                .filter_map(|(row, label_bin)| row.values[idx].map(|v| (v, *label_bin)))
                .collect();
            if pairs.len() < 2 {
                return None;
            }
            let values: Vec<f64> = pairs.iter().map(|(v, _)| *v).collect();
            let value_bins = discretize(&values, bins);
            let ys: Vec<usize> = pairs.iter().map(|(_, y)| *y).collect();
            Some((column.name.clone(), mutual_information(&value_bins, &ys, bins)))
        })
        .collect();

    let total: f64 = raw.iter().map(|(_, mi)| *mi).sum();
    if total <= 0.0 {
        warn!(
            component = "importance",
            event = "importance.no_information",
            season_end_rows = rows.len()
        );
        return Vec::new();
    }

    raw.into_iter()
        .map(|(column, mi)| FeatureImportance {
            column,
            percent: mi / total * 100.0,
        })
        .collect()
}

fn bin_count(samples: usize) -> usize {
    ((samples as f64).sqrt().floor() as usize).clamp(2, 16)
}

/// Equal-width binning; a constant series falls into one bin.
fn discretize(values: &[f64], bins: usize) -> Vec<usize> {
    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let width = max - min;
    values
        .iter()
        .map(|v| {
            if width <= 0.0 {
                0
            } else {
                (((v - min) / width * bins as f64) as usize).min(bins - 1)
            }
        })
        .collect()
}

/// Plug-in estimate in nats over a `bins x bins` contingency table.
fn mutual_information(xs: &[usize], ys: &[usize], bins: usize) -> f64 {
    let n = xs.len() as f64;
    let mut joint = vec![0usize; bins * bins];
    let mut px = vec![0usize; bins];
    let mut py = vec![0usize; bins];
    for (x, y) in xs.iter().zip(ys) {
        joint[x * bins + y] += 1;
        px[*x] += 1;
        py[*y] += 1;
    }

    let mut mi = 0.0;
    for x in 0..bins {
        for y in 0..bins {
            let count = joint[x * bins + y];
            if count == 0 {
                continue;
            }
            let pxy = count as f64 / n;
            let marginal = (px[x] as f64 / n) * (py[y] as f64 / n);
            mi += pxy * (pxy / marginal).ln();
        }
    }
    mi.max(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{Season, SeasonKey};
    use crate::table::{TableColumn, WindowRow};
    use chrono::NaiveDate;

    fn row(year: i32, is_season_end: bool, label: f64, values: [f64; 3]) -> WindowRow {
        let start = NaiveDate::from_ymd_opt(year, 6, 15).unwrap();
        WindowRow {
            key: SeasonKey::new("f1", "rice", Season::Kharif, year),
            window_num: if is_season_end { 2 } else { 1 },
            start_date: start,
            end_date: start,
            is_season_end,
            label: Some(label),
            values: values.into_iter().map(Some).collect(),
        }
    }

    /// `signal` tracks yield and `step` partly does on season-end rows.
    /// `noise` is flat there and only tracks the labels of partial rows.
    fn table() -> WindowTable {
        let mut rows = Vec::new();
        for (i, year) in (2020..2024).enumerate() {
            let label = (i + 1) as f64;
            let step = if i == 3 { 2.0 } else { 1.0 };
            rows.push(row(year, false, label * 10.0, [0.0, label * 10.0, 0.0]));
            rows.push(row(year, true, label, [label, 5.0, step]));
        }
        WindowTable {
            columns: vec![
                TableColumn::weather("signal"),
                TableColumn::weather("noise"),
                TableColumn::weather("step"),
            ],
            rows,
        }
    }

    #[test]
    fn scores_use_season_end_rows_and_sum_to_one_hundred() {
        let scores = feature_importance(&table());
        assert_eq!(scores.len(), 3);
        let percent = |name: &str| {
            scores
                .iter()
                .find(|s| s.column == name)
                .map(|s| s.percent)
                .unwrap()
        };

        let total: f64 = scores.iter().map(|s| s.percent).sum();
        assert!((total - 100.0).abs() < 1e-9);
        assert_eq!(percent("noise"), 0.0);
        assert!(percent("signal") > percent("step"));
        assert!(percent("step") > 0.0);
    }

    #[test]
    fn partial_season_rows_alone_score_nothing() {
        let mut table = table();
        table.rows.retain(|row| !row.is_season_end);
        assert!(feature_importance(&table).is_empty());
    }

    #[test]
    fn identical_series_carry_information() {
        let xs = discretize(&[1.0, 2.0, 3.0, 4.0], 2);
        assert_eq!(xs, vec![0, 0, 1, 1]);
        let mi = mutual_information(&xs, &xs, 2);
        assert!((mi - 2f64.ln()).abs() < 1e-12);
    }

    #[test]
    fn constant_series_carry_none() {
        let xs = discretize(&[5.0, 5.0, 5.0, 5.0], 2);
        let ys = discretize(&[1.0, 2.0, 3.0, 4.0], 2);
        assert_eq!(mutual_information(&xs, &ys, 2), 0.0);
    }
}
