//! Record store adapters: the boundary that supplies raw season records.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::records::{
    crop_key, AreaSown, CropRecord, Covariate, Covariates, Nutrients, RecordError, Season,
    SeasonKey,
    SiteContext, StaticAttributes,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("farm not found: {0}")]
    FarmNotFound(String),
    #[error("crop {crop} not found for farm {farm_id}")]
    CropNotFound { farm_id: String, crop: String },
    #[error("record store unavailable: {0}")]
    Unavailable(String),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("corrupt rows for farm {farm_id} crop {crop} at lines {lines:?}: {reason}")]
    CorruptRows {
        farm_id: String,
        crop: String,
        lines: Vec<u64>,
        reason: String,
    },
}

impl StoreError {
    /// Only transient storage outages are worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

pub trait RecordStore: Send + Sync {
    /// Records for one farm and crop, optionally narrowed to a season and
    /// year, ordered by group key then date.
    fn fetch_records(
        &self,
        farm_id: &str,
        crop: &str,
        season: Option<Season>,
        year: Option<i32>,
    ) -> Result<Vec<CropRecord>, StoreError>;

    fn list_groups(&self) -> Result<Vec<SeasonKey>, StoreError>;
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryRecordStore {
    farms: BTreeMap<String, Vec<CropRecord>>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Crop names are stored in canonical form so lookups by any spelling
    /// of a listed key succeed.
    pub fn insert(&mut self, mut record: CropRecord) {
        record.key = record.key.normalized();
        self.farms
            .entry(record.key.farm_id.clone())
            .or_default()
            .push(record);
    }

    pub fn extend(&mut self, records: impl IntoIterator<Item = CropRecord>) {
        for record in records {
            self.insert(record);
        }
    }
}

impl RecordStore for InMemoryRecordStore {
    fn fetch_records(
        &self,
        farm_id: &str,
        crop: &str,
        season: Option<Season>,
        year: Option<i32>,
    ) -> Result<Vec<CropRecord>, StoreError> {
        let records = self
            .farms
            .get(farm_id)
            .ok_or_else(|| StoreError::FarmNotFound(farm_id.to_string()))?;
        select(records.iter().cloned(), farm_id, crop, season, year)
    }

    fn list_groups(&self) -> Result<Vec<SeasonKey>, StoreError> {
        let keys: BTreeSet<SeasonKey> = self
            .farms
            .values()
            .flatten()
            .map(|record| record.key.clone())
            .collect();
        Ok(keys.into_iter().collect())
    }
}

/// Flat CSV row of one daily record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct RecordRow {
    farm_id: String,
    crop: String,
    season: String,
    year: i32,
    date: NaiveDate,
    temperature_2m_mean: Option<f64>,
    temperature_2m_max: Option<f64>,
    temperature_2m_min: Option<f64>,
    relative_humidity_2m_mean: Option<f64>,
    wind_speed_10m_max: Option<f64>,
    wind_direction_10m_dominant: Option<f64>,
    precipitation_sum: Option<f64>,
    shortwave_radiation_sum: Option<f64>,
    surface_pressure_mean: Option<f64>,
    cloud_cover_mean: Option<f64>,
    #[serde(default)]
    soil_type: Option<String>,
    #[serde(default)]
    soil_ph: Option<f64>,
    #[serde(default)]
    organic_matter_content: Option<f64>,
    #[serde(default)]
    irrigation_type: Option<String>,
    #[serde(default)]
    tillage_type: Option<String>,
    #[serde(default)]
    sowing_method: Option<String>,
    #[serde(default)]
    fertilizer_type_used: Option<String>,
    #[serde(default)]
    seed_variety: Option<String>,
    #[serde(default)]
    plant_population_density: Option<f64>,
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    district: Option<String>,
    #[serde(default)]
    n: Option<f64>,
    #[serde(default)]
    p: Option<f64>,
    #[serde(default)]
    k: Option<f64>,
    #[serde(default)]
    total_npk: Option<f64>,
    #[serde(default)]
    area_2025_26: Option<f64>,
    #[serde(default)]
    area_2024_25: Option<f64>,
    #[serde(default)]
    area_change_pct: Option<f64>,
    #[serde(default, rename = "yield")]
    yield_value: Option<f64>,
}

impl RecordRow {
    fn from_record(record: &CropRecord) -> Self {
        let c = &record.covariates;
        let s = &record.statics;
        let nutrients = record.site.nutrients;
        let area = record.site.area;
        Self {
            farm_id: record.key.farm_id.clone(),
            crop: record.key.crop.clone(),
            season: record.key.season.to_string(),
            year: record.key.year,
            date: record.date,
            temperature_2m_mean: c.get(Covariate::Temperature2mMean),
            temperature_2m_max: c.get(Covariate::Temperature2mMax),
            temperature_2m_min: c.get(Covariate::Temperature2mMin),
            relative_humidity_2m_mean: c.get(Covariate::RelativeHumidity2mMean),
            wind_speed_10m_max: c.get(Covariate::WindSpeed10mMax),
            wind_direction_10m_dominant: c.get(Covariate::WindDirection10mDominant),
            precipitation_sum: c.get(Covariate::PrecipitationSum),
            shortwave_radiation_sum: c.get(Covariate::ShortwaveRadiationSum),
            surface_pressure_mean: c.get(Covariate::SurfacePressureMean),
            cloud_cover_mean: c.get(Covariate::CloudCoverMean),
            soil_type: Some(s.soil_type.clone()),
            soil_ph: s.soil_ph,
            organic_matter_content: s.organic_matter_content,
            irrigation_type: Some(s.irrigation_type.clone()),
            tillage_type: Some(s.tillage_type.clone()),
            sowing_method: Some(s.sowing_method.clone()),
            fertilizer_type_used: Some(s.fertilizer_type_used.clone()),
            seed_variety: Some(s.seed_variety.clone()),
            plant_population_density: s.plant_population_density,
            state: Some(record.site.state.clone()),
            district: Some(record.site.district.clone()),
            n: nutrients.map(|v| v.n),
            p: nutrients.map(|v| v.p),
            k: nutrients.map(|v| v.k),
            total_npk: nutrients.map(|v| v.total_npk),
            area_2025_26: area.map(|v| v.area_2025_26),
            area_2024_25: area.map(|v| v.area_2024_25),
            area_change_pct: area.map(|v| v.area_change_pct),
            yield_value: record.yield_value,
        }
    }

    fn into_record(self) -> Result<CropRecord, RecordError> {
        let season: Season = self.season.parse()?;
        let mut covariates = Covariates::new();
        for (covariate, value) in [
            (Covariate::Temperature2mMean, self.temperature_2m_mean),
            (Covariate::Temperature2mMax, self.temperature_2m_max),
            (Covariate::Temperature2mMin, self.temperature_2m_min),
            (Covariate::RelativeHumidity2mMean, self.relative_humidity_2m_mean),
            (Covariate::WindSpeed10mMax, self.wind_speed_10m_max),
            (Covariate::WindDirection10mDominant, self.wind_direction_10m_dominant),
            (Covariate::PrecipitationSum, self.precipitation_sum),
            (Covariate::ShortwaveRadiationSum, self.shortwave_radiation_sum),
            (Covariate::SurfacePressureMean, self.surface_pressure_mean),
            (Covariate::CloudCoverMean, self.cloud_cover_mean),
        ] {
            covariates.set(covariate, value);
        }

        let defaults = StaticAttributes::default();
        let statics = StaticAttributes {
            soil_type: self.soil_type.unwrap_or(defaults.soil_type),
            soil_ph: self.soil_ph.or(defaults.soil_ph),
            organic_matter_content: self.organic_matter_content.or(defaults.organic_matter_content),
            irrigation_type: self.irrigation_type.unwrap_or(defaults.irrigation_type),
            tillage_type: self.tillage_type.unwrap_or(defaults.tillage_type),
            sowing_method: self.sowing_method.unwrap_or(defaults.sowing_method),
            fertilizer_type_used: self.fertilizer_type_used.unwrap_or(defaults.fertilizer_type_used),
            seed_variety: self.seed_variety.unwrap_or(defaults.seed_variety),
            plant_population_density: self
                .plant_population_density
                .or(defaults.plant_population_density),
        };

        let nutrients = match (self.n, self.p, self.k, self.total_npk) {
            (Some(n), Some(p), Some(k), Some(total_npk)) => Some(Nutrients { n, p, k, total_npk }),
            _ => None,
        };
        let area = match (self.area_2025_26, self.area_2024_25, self.area_change_pct) {
            (Some(area_2025_26), Some(area_2024_25), Some(area_change_pct)) => Some(AreaSown {
                area_2025_26,
                area_2024_25,
                area_change_pct,
            }),
            _ => None,
        };

        let record = CropRecord {
            key: SeasonKey::new(self.farm_id, &self.crop, season, self.year),
            date: self.date,
            covariates,
            statics,
            site: SiteContext {
                state: self.state.unwrap_or_default(),
                district: self.district.unwrap_or_default(),
                nutrients,
                area,
            },
            yield_value: self.yield_value,
        };
        record.validate()?;
        Ok(record)
    }
}

/// One `records.csv` per farm directory under `root`.
#[derive(Debug, Clone)]
pub struct CsvRecordStore {
    root: PathBuf,
}

impl CsvRecordStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn farm_path(&self, farm_id: &str) -> PathBuf {
        self.root.join(farm_id).join("records.csv")
    }

    /// Replaces the farm's file with `records`.
    pub fn write_farm(&self, farm_id: &str, records: &[CropRecord]) -> Result<PathBuf, StoreError> {
        let path = self.farm_path(farm_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| unavailable(&path, err))?;
        }
        let mut writer = csv::Writer::from_path(&path)?;
        for record in records {
            writer.serialize(RecordRow::from_record(record))?;
        }
        writer.flush().map_err(|err| unavailable(&path, err))?;
        Ok(path)
    }

    /// Parses the farm file row by row. Rows that fail to parse are kept
    /// aside with whatever identity could be read, so only the groups they
    /// belong to are affected.
    fn read_farm(&self, farm_id: &str) -> Result<FarmFile, StoreError> {
        if !self.root.is_dir() {
            return Err(StoreError::Unavailable(format!(
                "store root {} is not a directory",
                self.root.display()
            )));
        }
        let path = self.farm_path(farm_id);
        if !path.is_file() {
            return Err(StoreError::FarmNotFound(farm_id.to_string()));
        }

        let mut reader = csv::ReaderBuilder::new().flexible(true).from_path(&path)?;
        let headers = reader.headers()?.clone();
        let column = |name: &str| headers.iter().position(|h| h.trim() == name);
        let (crop_idx, season_idx, year_idx) = (column("crop"), column("season"), column("year"));

        let mut file = FarmFile::default();
        for row in reader.records() {
            let row = match row {
                Ok(row) => row,
                Err(err) if err.is_io_error() => return Err(err.into()),
                Err(err) => {
                    let line = err.position().map(|p| p.line()).unwrap_or(0);
                    warn!(
                        component = "store",
                        event = "store.csv.row_unreadable",
                        farm_id,
                        line,
                        error = %err
                    );
                    continue;
                }
            };

            let parsed = row
                .deserialize::<RecordRow>(Some(&headers))
                .map_err(|err| err.to_string())
                .and_then(|raw| raw.into_record().map_err(|err| err.to_string()));
            match parsed {
                Ok(record) => file.records.push(record),
                Err(reason) => {
                    let field = |idx: Option<usize>| {
                        idx.and_then(|i| row.get(i)).unwrap_or_default().trim().to_string()
                    };
                    let rejected = RejectedRow {
                        line: row.position().map(|p| p.line()).unwrap_or(0),
                        crop: field(crop_idx),
                        season: field(season_idx),
                        year: field(year_idx),
                        reason,
                    };
                    warn!(
                        component = "store",
                        event = "store.csv.row_rejected",
                        farm_id,
                        line = rejected.line,
                        crop = %rejected.crop,
                        reason = %rejected.reason
                    );
                    file.rejected.push(rejected);
                }
            }
        }
        debug!(
            component = "store",
            event = "store.csv.loaded",
            farm_id = farm_id,
            records = file.records.len(),
            rejected = file.rejected.len()
        );
        Ok(file)
    }
}

#[derive(Debug, Default)]
struct FarmFile {
    records: Vec<CropRecord>,
    rejected: Vec<RejectedRow>,
}

#[derive(Debug, Clone)]
struct RejectedRow {
    line: u64,
    crop: String,
    season: String,
    year: String,
    reason: String,
}

impl RejectedRow {
    /// An unreadable season or year matches any requested one.
    fn affects(&self, crop: &str, season: Option<Season>, year: Option<i32>) -> bool {
        if crop_key(&self.crop) != crop {
            return false;
        }
        let season_matches = match (season, self.season.parse::<Season>()) {
            (Some(wanted), Ok(found)) => wanted == found,
            _ => true,
        };
        let year_matches = match (year, self.year.parse::<i32>()) {
            (Some(wanted), Ok(found)) => wanted == found,
            _ => true,
        };
        season_matches && year_matches
    }
}

impl RecordStore for CsvRecordStore {
    fn fetch_records(
        &self,
        farm_id: &str,
        crop: &str,
        season: Option<Season>,
        year: Option<i32>,
    ) -> Result<Vec<CropRecord>, StoreError> {
        let file = self.read_farm(farm_id)?;
        let wanted = crop_key(crop);
        let corrupt: Vec<&RejectedRow> = file
            .rejected
            .iter()
            .filter(|row| row.affects(&wanted, season, year))
            .collect();
        if let Some(first) = corrupt.first() {
            return Err(StoreError::CorruptRows {
                farm_id: farm_id.to_string(),
                crop: wanted,
                lines: corrupt.iter().map(|row| row.line).collect(),
                reason: first.reason.clone(),
            });
        }
        select(file.records.into_iter(), farm_id, crop, season, year)
    }

    fn list_groups(&self) -> Result<Vec<SeasonKey>, StoreError> {
        let entries = fs::read_dir(&self.root).map_err(|err| unavailable(&self.root, err))?;
        let mut keys = BTreeSet::new();
        for entry in entries {
            let entry = entry.map_err(|err| unavailable(&self.root, err))?;
            if !entry.path().join("records.csv").is_file() {
                continue;
            }
            let farm_id = entry.file_name().to_string_lossy().into_owned();
            keys.extend(self.read_farm(&farm_id)?.records.into_iter().map(|r| r.key));
        }
        Ok(keys.into_iter().collect())
    }
}

fn unavailable(path: &Path, err: io::Error) -> StoreError {
    StoreError::Unavailable(format!("{}: {err}", path.display()))
}

fn select(
    records: impl Iterator<Item = CropRecord>,
    farm_id: &str,
    crop: &str,
    season: Option<Season>,
    year: Option<i32>,
) -> Result<Vec<CropRecord>, StoreError> {
    let crop = crop_key(crop);
    let mut crop_seen = false;
    let mut selected: Vec<CropRecord> = records
        .filter(|r| r.key.crop == crop)
        .inspect(|_| crop_seen = true)
        .filter(|r| season.map_or(true, |s| r.key.season == s))
        .filter(|r| year.map_or(true, |y| r.key.year == y))
        .collect();
    if !crop_seen {
        return Err(StoreError::CropNotFound {
            farm_id: farm_id.to_string(),
            crop,
        });
    }
    selected.sort_by(|a, b| a.key.cmp(&b.key).then(a.date.cmp(&b.date)));
    Ok(selected)
}
