//! Persisted per-(farm, crop) window tables.
//!
//! Layout: `{root}/{farm}/crops/{crop}/{crop}.csv`, one row per window with
//! identity columns, static attributes, `avg_*` means, trailing features,
//! nutrients, area sown and `yield` (blank except on season-end rows).

use std::fs;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use csv::StringRecord;
use thiserror::Error;
use tracing::info;

use crate::records::{
    crop_key, AreaSown, Covariate, Covariates, Nutrients, Season, SeasonKey, SiteContext, StaticAttributes,
};
use crate::windows::{RollingValue, Window};

const IDENTITY_COLUMNS: [&str; 10] = [
    "farm_id",
    "state",
    "district",
    "crop",
    "season",
    "year",
    "window_num",
    "start_date",
    "end_date",
    "is_season_end",
];
const STATIC_COLUMNS: [&str; 9] = [
    "soil_type",
    "soil_ph",
    "organic_matter_content",
    "irrigation_type",
    "tillage_type",
    "sowing_method",
    "fertilizer_type_used",
    "seed_variety",
    "plant_population_density",
];
const NUTRIENT_COLUMNS: [&str; 4] = ["n", "p", "k", "total_npk"];
const AREA_COLUMNS: [&str; 3] = ["area_2025_26", "area_2024_25", "area_change_pct"];
const YIELD_COLUMN: &str = "yield";

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("window table {path} is missing columns: {columns:?}")]
    MissingColumns { path: PathBuf, columns: Vec<String> },
    #[error("'{0}' cannot be used as a directory name")]
    InvalidPathComponent(String),
    #[error("invalid value '{value}' for {column} at row {row}")]
    InvalidValue {
        column: String,
        value: String,
        row: usize,
    },
}

/// Directory-safe form of a farm id or crop name. Case is kept, so farm ids
/// differing only in case get separate directories. Names that would leave
/// the output root are rejected.
pub fn path_component(raw: &str) -> Result<String, ArtifactError> {
    let component = raw.trim().replace(['/', '\\', ' '], "_");
    if component.is_empty() || component.chars().all(|c| c == '.') || component.contains('\0') {
        return Err(ArtifactError::InvalidPathComponent(raw.to_string()));
    }
    Ok(component)
}

/// Crop directories use the canonical crop name.
pub fn window_table_path(
    root: &Path,
    farm_id: &str,
    crop: &str,
) -> Result<PathBuf, ArtifactError> {
    let crop = path_component(&crop_key(crop))?;
    Ok(root
        .join(path_component(farm_id)?)
        .join("crops")
        .join(&crop)
        .join(format!("{crop}.csv")))
}

/// Overwrites the table for one farm and crop with `windows`.
pub fn write_window_table(
    root: &Path,
    farm_id: &str,
    crop: &str,
    windows: &[Window],
) -> Result<PathBuf, ArtifactError> {
    let path = window_table_path(root, farm_id, crop)?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut rolling_names: Vec<&str> = Vec::new();
    for window in windows {
        for value in &window.rolling {
            if !rolling_names.contains(&value.name.as_str()) {
                rolling_names.push(&value.name);
            }
        }
    }

    let mut header: Vec<String> = IDENTITY_COLUMNS.iter().map(|c| c.to_string()).collect();
    header.extend(STATIC_COLUMNS.iter().map(|c| c.to_string()));
    header.extend(Covariate::ALL.iter().map(|c| c.window_column()));
    header.extend(rolling_names.iter().map(|c| c.to_string()));
    header.extend(NUTRIENT_COLUMNS.iter().map(|c| c.to_string()));
    header.extend(AREA_COLUMNS.iter().map(|c| c.to_string()));
    header.push(YIELD_COLUMN.to_string());

    let mut writer = csv::Writer::from_path(&path)?;
    writer.write_record(&header)?;
    for window in windows {
        let statics = &window.statics;
        let mut row = vec![
            window.key.farm_id.clone(),
            window.site.state.clone(),
            window.site.district.clone(),
            window.key.crop.clone(),
            window.key.season.to_string(),
            window.key.year.to_string(),
            window.window_num.to_string(),
            window.start_date.to_string(),
            window.end_date.to_string(),
            window.is_season_end.to_string(),
            statics.soil_type.clone(),
            cell(statics.soil_ph),
            cell(statics.organic_matter_content),
            statics.irrigation_type.clone(),
            statics.tillage_type.clone(),
            statics.sowing_method.clone(),
            statics.fertilizer_type_used.clone(),
            statics.seed_variety.clone(),
            cell(statics.plant_population_density),
        ];
        row.extend(Covariate::ALL.iter().map(|c| cell(window.means.get(*c))));
        for name in &rolling_names {
            let value = window.rolling.iter().find(|v| v.name == *name).map(|v| v.value);
            row.push(cell(value));
        }
        let nutrients = window.site.nutrients;
        row.push(cell(nutrients.map(|n| n.n)));
        row.push(cell(nutrients.map(|n| n.p)));
        row.push(cell(nutrients.map(|n| n.k)));
        row.push(cell(nutrients.map(|n| n.total_npk)));
        let area = window.site.area;
        row.push(cell(area.map(|a| a.area_2025_26)));
        row.push(cell(area.map(|a| a.area_2024_25)));
        row.push(cell(area.map(|a| a.area_change_pct)));
        row.push(cell(window.yield_value));
        writer.write_record(&row)?;
    }
    writer.flush()?;

    info!(
        component = "artifact",
        event = "artifact.window_table.written",
        path = %path.display(),
        windows = windows.len()
    );
    Ok(path)
}

/// Reads a window table back. Identity, `avg_*` and `yield` columns are
/// required; static attribute columns fall back to their defaults.
pub fn read_window_table(path: &Path) -> Result<Vec<Window>, ArtifactError> {
    let mut reader = csv::Reader::from_path(path)?;
    let headers = reader.headers()?.clone();
    let index = |name: &str| headers.iter().position(|h| h.trim() == name);

    let mut required: Vec<String> = IDENTITY_COLUMNS.iter().map(|c| c.to_string()).collect();
    required.extend(Covariate::ALL.iter().map(|c| c.window_column()));
    required.push(YIELD_COLUMN.to_string());
    let missing: Vec<String> = required.iter().filter(|c| index(c.as_str()).is_none()).cloned().collect();
    if !missing.is_empty() {
        return Err(ArtifactError::MissingColumns {
            path: path.to_path_buf(),
            columns: missing,
        });
    }

    let rolling_columns: Vec<(usize, String)> = headers
        .iter()
        .enumerate()
        .filter(|(_, h)| is_rolling_column(h.trim()))
        .map(|(idx, h)| (idx, h.trim().to_string()))
        .collect();

    let mut windows = Vec::new();
    for (row_idx, record) in reader.records().enumerate() {
        let record = record?;
        let row = Row {
            record: &record,
            headers: &headers,
            row: row_idx + 1,
        };

        let season: Season = row
            .text("season")
            .parse()
            .map_err(|_| row.invalid("season"))?;
        let key = SeasonKey::new(
            row.text("farm_id"),
            row.text("crop"),
            season,
            row.parse::<i32>("year")?,
        );
        let start_date = row.parse::<NaiveDate>("start_date")?;
        let end_date = row.parse::<NaiveDate>("end_date")?;

        let mut means = Covariates::new();
        for covariate in Covariate::ALL {
            means.set(covariate, row.optional(&covariate.window_column())?);
        }

        let mut rolling = Vec::new();
        for (idx, name) in &rolling_columns {
            if let Some(value) = row.optional_at(*idx, name)? {
                rolling.push(RollingValue {
                    name: name.clone(),
                    value,
                });
            }
        }

        let defaults = StaticAttributes::default();
        let statics = StaticAttributes {
            soil_type: row.text_or("soil_type", defaults.soil_type),
            soil_ph: row.optional_or("soil_ph", defaults.soil_ph)?,
            organic_matter_content: row
                .optional_or("organic_matter_content", defaults.organic_matter_content)?,
            irrigation_type: row.text_or("irrigation_type", defaults.irrigation_type),
            tillage_type: row.text_or("tillage_type", defaults.tillage_type),
            sowing_method: row.text_or("sowing_method", defaults.sowing_method),
            fertilizer_type_used: row.text_or("fertilizer_type_used", defaults.fertilizer_type_used),
            seed_variety: row.text_or("seed_variety", defaults.seed_variety),
            plant_population_density: row
                .optional_or("plant_population_density", defaults.plant_population_density)?,
        };

        let nutrients = match (
            row.optional("n")?,
            row.optional("p")?,
            row.optional("k")?,
            row.optional("total_npk")?,
        ) {
            (Some(n), Some(p), Some(k), Some(total_npk)) => Some(Nutrients { n, p, k, total_npk }),
            _ => None,
        };
        let area = match (
            row.optional("area_2025_26")?,
            row.optional("area_2024_25")?,
            row.optional("area_change_pct")?,
        ) {
            (Some(area_2025_26), Some(area_2024_25), Some(area_change_pct)) => Some(AreaSown {
                area_2025_26,
                area_2024_25,
                area_change_pct,
            }),
            _ => None,
        };

        windows.push(Window {
            key,
            window_num: row.parse::<u32>("window_num")?,
            start_date,
            end_date,
            record_count: ((end_date - start_date).num_days() + 1).max(1) as usize,
            is_season_end: parse_bool(&row.text("is_season_end")).ok_or_else(|| row.invalid("is_season_end"))?,
            means,
            rolling,
            statics,
            site: SiteContext {
                state: row.text("state"),
                district: row.text("district"),
                nutrients,
                area,
            },
            yield_value: row.optional(YIELD_COLUMN)?,
        });
    }

    Ok(windows)
}

fn is_rolling_column(name: &str) -> bool {
    (name.starts_with("temp_") && name.ends_with("d_avg"))
        || (name.starts_with("precip_") && name.ends_with("d_sum"))
}

fn cell(value: Option<f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" => Some(true),
        "false" | "0" => Some(false),
        _ => None,
    }
}

struct Row<'a> {
    record: &'a StringRecord,
    headers: &'a StringRecord,
    row: usize,
}

impl Row<'_> {
    fn raw(&self, column: &str) -> Option<&str> {
        let idx = self.headers.iter().position(|h| h.trim() == column)?;
        self.record.get(idx).map(str::trim)
    }

    fn text(&self, column: &str) -> String {
        self.raw(column).unwrap_or_default().to_string()
    }

    fn text_or(&self, column: &str, default: String) -> String {
        match self.raw(column) {
            Some(value) if !value.is_empty() => value.to_string(),
            _ => default,
        }
    }

    fn invalid(&self, column: &str) -> ArtifactError {
        ArtifactError::InvalidValue {
            column: column.to_string(),
            value: self.text(column),
            row: self.row,
        }
    }

    fn parse<T: std::str::FromStr>(&self, column: &str) -> Result<T, ArtifactError> {
        self.raw(column)
            .and_then(|raw| raw.parse().ok())
            .ok_or_else(|| self.invalid(column))
    }

    fn optional(&self, column: &str) -> Result<Option<f64>, ArtifactError> {
        match self.raw(column) {
            None | Some("") => Ok(None),
            Some(raw) => raw.parse().map(Some).map_err(|_| self.invalid(column)),
        }
    }

    fn optional_at(&self, idx: usize, column: &str) -> Result<Option<f64>, ArtifactError> {
        match self.record.get(idx).map(str::trim) {
            None | Some("") => Ok(None),
            Some(raw) => raw.parse().map(Some).map_err(|_| self.invalid(column)),
        }
    }

    fn optional_or(&self, column: &str, default: Option<f64>) -> Result<Option<f64>, ArtifactError> {
        if self.raw(column).is_none() {
            return Ok(default);
        }
        self.optional(column)
    }
}
