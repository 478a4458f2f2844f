//! State nutrient and crop area-sown lookup tables.

use std::collections::HashMap;
use std::fs;
use std::io::Read;
use std::path::Path;

use csv::StringRecord;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::records::{AreaSown, Nutrients};

const AREA_CROP_MAPPING: [(&str, &str); 11] = [
    ("rice", "rice"),
    ("total_pulses", "total_pulses"),
    ("tur", "tur"),
    ("urad", "urad"),
    ("moong", "moong"),
    ("other_pulses", "other_pulses"),
    ("jowar", "jowar"),
    ("bajra", "bajra"),
    ("ragi", "ragi"),
    ("other_small_millets", "small_millets"),
    ("total_coarse_cereals", "nutri/coarse_cereals"),
];

const AREA_2025_COLUMN: &str = "area_sown-2025-26";
const AREA_2024_COLUMN: &str = "area_sown-2024-25";
const AREA_PCT_COLUMN: &str = "%_of_increase_(+)/decrease_(-)_over_-2024-25";

/// What to do with a crop missing from the area-sown mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum UnmappedCropPolicy {
    /// Use the column means of the area-sown report.
    #[default]
    MeanFallback,
    /// Leave the crop out of dataset generation.
    Exclude,
}

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("missing columns: {0:?}")]
    MissingColumns(Vec<String>),
    #[error("failed to parse field {field} value '{value}'")]
    ParseField { field: String, value: String },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NutrientTable {
    by_state: HashMap<String, Nutrients>,
}

impl NutrientTable {
    pub fn from_path(path: &Path) -> Result<Self, ContextError> {
        Self::from_reader(fs::File::open(path)?)
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Self, ContextError> {
        let mut reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
        let headers = clean_headers(reader.headers()?);
        let idx = column_indices(
            &headers,
            &["state", "n (kg/ha)", "p2o5 (kg/ha)", "k2o (kg/ha)", "total (kg/ha)"],
        )?;

        let mut by_state = HashMap::new();
        for record in reader.records() {
            let record = record?;
            let state = record.get(idx[0]).unwrap_or_default().trim().to_lowercase();
            let nutrients = Nutrients {
                n: parse_f64(&record, idx[1], "n")?,
                p: parse_f64(&record, idx[2], "p")?,
                k: parse_f64(&record, idx[3], "k")?,
                total_npk: parse_f64(&record, idx[4], "total_npk")?,
            };
            by_state.entry(state).or_insert(nutrients);
        }
        Ok(Self { by_state })
    }

    pub fn insert(&mut self, state: &str, nutrients: Nutrients) {
        self.by_state.insert(state.trim().to_lowercase(), nutrients);
    }

    pub fn lookup(&self, state: &str) -> Option<Nutrients> {
        self.by_state.get(&state.trim().to_lowercase()).copied()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AreaLookup {
    Mapped(AreaSown),
    Fallback(AreaSown),
    Excluded,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AreaSownTable {
    by_crop: HashMap<String, AreaSown>,
    means: AreaSown,
}

impl AreaSownTable {
    pub fn new(by_crop: HashMap<String, AreaSown>, means: AreaSown) -> Self {
        let by_crop = by_crop
            .into_iter()
            .map(|(crop, area)| (normalize_crop(&crop), area))
            .collect();
        Self { by_crop, means }
    }

    pub fn from_path(path: &Path) -> Result<Self, ContextError> {
        Self::from_reader(fs::File::open(path)?)
    }

    /// Reads the weekly area-coverage report. Means are taken over every row,
    /// mapped or not; only mapped crops get their own entry.
    pub fn from_reader<R: Read>(reader: R) -> Result<Self, ContextError> {
        let mut reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
        let headers = clean_headers(reader.headers()?);
        let idx = column_indices(
            &headers,
            &["crop", AREA_2025_COLUMN, AREA_2024_COLUMN, AREA_PCT_COLUMN],
        )?;

        let mapping: HashMap<&str, &str> = AREA_CROP_MAPPING.iter().copied().collect();
        let mut by_crop = HashMap::new();
        let mut sums = [0.0f64; 3];
        let mut rows = 0usize;
        for record in reader.records() {
            let record = record?;
            let area = AreaSown {
                area_2025_26: parse_f64(&record, idx[1], "area_2025_26")?,
                area_2024_25: parse_f64(&record, idx[2], "area_2024_25")?,
                area_change_pct: parse_f64(&record, idx[3], "area_change_pct")?,
            };
            sums[0] += area.area_2025_26;
            sums[1] += area.area_2024_25;
            sums[2] += area.area_change_pct;
            rows += 1;

            let crop = normalize_crop(record.get(idx[0]).unwrap_or_default());
            match mapping.get(crop.as_str()) {
                Some(mapped) => {
                    by_crop.insert((*mapped).to_string(), area);
                }
                None => debug!(
                    component = "context",
                    event = "context.area.unmapped_row",
                    crop = %crop
                ),
            }
        }

        let n = rows.max(1) as f64;
        let means = AreaSown {
            area_2025_26: sums[0] / n,
            area_2024_25: sums[1] / n,
            area_change_pct: sums[2] / n,
        };
        Ok(Self { by_crop, means })
    }

    pub fn lookup(&self, crop: &str, policy: UnmappedCropPolicy) -> AreaLookup {
        if let Some(area) = self.by_crop.get(&normalize_crop(crop)) {
            return AreaLookup::Mapped(*area);
        }
        match policy {
            UnmappedCropPolicy::MeanFallback => AreaLookup::Fallback(self.means),
            UnmappedCropPolicy::Exclude => {
                warn!(
                    component = "context",
                    event = "context.area.crop_excluded",
                    crop = crop
                );
                AreaLookup::Excluded
            }
        }
    }
}

fn normalize_crop(raw: &str) -> String {
    raw.trim().to_lowercase().replace(' ', "_")
}

fn clean_headers(headers: &StringRecord) -> Vec<String> {
    headers
        .iter()
        .map(|h| h.trim().to_lowercase().replace(' ', "_"))
        .collect()
}

fn column_indices(headers: &[String], required: &[&str]) -> Result<Vec<usize>, ContextError> {
    let wanted: Vec<String> = required.iter().map(|r| r.replace(' ', "_")).collect();
    let missing: Vec<String> = wanted
        .iter()
        .filter(|w| !headers.contains(w))
        .cloned()
        .collect();
    if !missing.is_empty() {
        return Err(ContextError::MissingColumns(missing));
    }
    Ok(wanted
        .iter()
        .filter_map(|w| headers.iter().position(|h| h == w))
        .collect())
}

fn parse_f64(record: &StringRecord, idx: usize, field: &str) -> Result<f64, ContextError> {
    let raw = record.get(idx).unwrap_or_default();
    raw.trim().parse::<f64>().map_err(|_| ContextError::ParseField {
        field: field.to_string(),
        value: raw.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const NPK_CSV: &str = "State,N (kg/ha),P2O5 (kg/ha),K2O (kg/ha),Total (kg/ha)\n Punjab ,180.5,60,20,260.5\nBihar,100,40,15,155\n";

    const AREA_CSV: &str = "Crop,Area Sown-2025-26,Area Sown-2024-25,Difference in Area coverage over-2024-25,% of Increase (+)/Decrease (-) over -2024-25\nRice,100,90,10,11.1\nTur,20,30,-10,-33.3\nCotton,60,60,0,0\n";

    #[test]
    fn nutrient_lookup_is_case_insensitive() {
        let table = NutrientTable::from_reader(NPK_CSV.as_bytes()).unwrap();
        let punjab = table.lookup("PUNJAB").unwrap();
        assert_eq!(punjab.n, 180.5);
        assert_eq!(punjab.total_npk, 260.5);
        assert!(table.lookup("kerala").is_none());
    }

    #[test]
    fn area_lookup_maps_known_and_falls_back_for_others() {
        let table = AreaSownTable::from_reader(AREA_CSV.as_bytes()).unwrap();
        match table.lookup("rice", UnmappedCropPolicy::MeanFallback) {
            AreaLookup::Mapped(area) => assert_eq!(area.area_2025_26, 100.0),
            other => panic!("unexpected lookup: {other:?}"),
        }
        match table.lookup("wheat", UnmappedCropPolicy::MeanFallback) {
            AreaLookup::Fallback(area) => assert_eq!(area.area_2025_26, 60.0),
            other => panic!("unexpected lookup: {other:?}"),
        }
        assert_eq!(
            table.lookup("wheat", UnmappedCropPolicy::Exclude),
            AreaLookup::Excluded
        );
    }

    #[test]
    fn missing_columns_are_reported() {
        let err = NutrientTable::from_reader("state,n\nx,1\n".as_bytes()).unwrap_err();
        assert!(matches!(err, ContextError::MissingColumns(_)));
    }
}
