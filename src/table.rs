//! Column-oriented view of windows used by normalization and sequencing.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::records::{Covariate, SeasonKey};
use crate::windows::Window;

/// Decides which scaler a column receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnKind {
    /// Continuous weather signal, standardized.
    Weather,
    /// Bounded soil, nutrient, management or derived value, min-max scaled.
    Bounded,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableColumn {
    pub name: String,
    pub kind: ColumnKind,
}

impl TableColumn {
    pub fn weather(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ColumnKind::Weather,
        }
    }

    pub fn bounded(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ColumnKind::Bounded,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowRow {
    pub key: SeasonKey,
    pub window_num: u32,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub is_season_end: bool,
    pub label: Option<f64>,
    /// Aligned with [`WindowTable::columns`].
    pub values: Vec<Option<f64>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WindowTable {
    pub columns: Vec<TableColumn>,
    pub rows: Vec<WindowRow>,
}

const STATIC_NUMERIC_COLUMNS: [&str; 3] =
    ["soil_ph", "organic_matter_content", "plant_population_density"];
const NUTRIENT_COLUMNS: [&str; 4] = ["n", "p", "k", "total_npk"];
const AREA_COLUMNS: [&str; 3] = ["area_2025_26", "area_2024_25", "area_change_pct"];

impl WindowTable {
    pub fn from_windows(windows: &[Window]) -> Self {
        let mut columns: Vec<TableColumn> = STATIC_NUMERIC_COLUMNS
            .iter()
            .map(|name| TableColumn::bounded(*name))
            .collect();
        for covariate in Covariate::ALL {
            columns.push(TableColumn::weather(covariate.window_column()));
        }

        let mut rolling_names: Vec<String> = Vec::new();
        for window in windows {
            for value in &window.rolling {
                if !rolling_names.contains(&value.name) {
                    rolling_names.push(value.name.clone());
                }
            }
        }
        columns.extend(rolling_names.iter().cloned().map(TableColumn::weather));
        columns.extend(NUTRIENT_COLUMNS.iter().map(|name| TableColumn::bounded(*name)));
        columns.extend(AREA_COLUMNS.iter().map(|name| TableColumn::bounded(*name)));

        let rows = windows
            .iter()
            .map(|window| {
                let mut values = vec![
                    window.statics.soil_ph,
                    window.statics.organic_matter_content,
                    window.statics.plant_population_density,
                ];
                values.extend(Covariate::ALL.iter().map(|c| window.means.get(*c)));
                for name in &rolling_names {
                    values.push(
                        window
                            .rolling
                            .iter()
                            .find(|value| &value.name == name)
                            .map(|value| value.value),
                    );
                }
                let nutrients = window.site.nutrients;
                values.push(nutrients.map(|n| n.n));
                values.push(nutrients.map(|n| n.p));
                values.push(nutrients.map(|n| n.k));
                values.push(nutrients.map(|n| n.total_npk));
                let area = window.site.area;
                values.push(area.map(|a| a.area_2025_26));
                values.push(area.map(|a| a.area_2024_25));
                values.push(area.map(|a| a.area_change_pct));

                WindowRow {
                    key: window.key.clone(),
                    window_num: window.window_num,
                    start_date: window.start_date,
                    end_date: window.end_date,
                    is_season_end: window.is_season_end,
                    label: window.yield_value,
                    values,
                }
            })
            .collect();

        Self { columns, rows }
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|column| column.name == name)
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    /// Appends a column, or overwrites it when a column of that name exists.
    pub fn set_column(&mut self, column: TableColumn, values: Vec<Option<f64>>) {
        debug_assert_eq!(values.len(), self.rows.len());
        match self.column_index(&column.name) {
            Some(idx) => {
                self.columns[idx] = column;
                for (row, value) in self.rows.iter_mut().zip(values) {
                    row.values[idx] = value;
                }
            }
            None => {
                self.columns.push(column);
                for (row, value) in self.rows.iter_mut().zip(values) {
                    row.values.push(value);
                }
            }
        }
    }

    pub fn column_values(&self, idx: usize) -> Vec<Option<f64>> {
        self.rows.iter().map(|row| row.values[idx]).collect()
    }

    /// Row indices per season group, each list in table order.
    pub fn group_indices(&self) -> BTreeMap<SeasonKey, Vec<usize>> {
        let mut groups: BTreeMap<SeasonKey, Vec<usize>> = BTreeMap::new();
        for (idx, row) in self.rows.iter().enumerate() {
            groups.entry(row.key.clone()).or_default().push(idx);
        }
        groups
    }
}
