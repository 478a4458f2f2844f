//! Typed daily crop observations and the season calendar.

use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const COVARIATE_COUNT: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Season {
    Rabi,
    Kharif,
    Summer,
}

impl Season {
    pub const ALL: [Season; 3] = [Season::Rabi, Season::Kharif, Season::Summer];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Rabi => "rabi",
            Self::Kharif => "kharif",
            Self::Summer => "summer",
        }
    }

    /// Month/day bounds of the sowing-to-harvest calendar. Rabi wraps into the
    /// following year.
    fn calendar(self) -> ((u32, u32), (u32, u32)) {
        match self {
            Self::Rabi => ((11, 15), (4, 15)),
            Self::Kharif => ((6, 15), (11, 15)),
            Self::Summer => ((5, 15), (10, 15)),
        }
    }
}

impl fmt::Display for Season {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Season {
    type Err = RecordError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "rabi" => Ok(Self::Rabi),
            "kharif" => Ok(Self::Kharif),
            "summer" => Ok(Self::Summer),
            _ => Err(RecordError::UnknownSeason(raw.to_string())),
        }
    }
}

/// Inclusive start and end dates of `season` sown in `year`.
pub fn season_date_range(season: Season, year: i32) -> Result<(NaiveDate, NaiveDate), RecordError> {
    let ((start_month, start_day), (end_month, end_day)) = season.calendar();
    let end_year = if end_month < start_month {
        year.checked_add(1).ok_or(RecordError::InvalidYear(year))?
    } else {
        year
    };
    let start = NaiveDate::from_ymd_opt(year, start_month, start_day)
        .ok_or(RecordError::InvalidYear(year))?;
    let end = NaiveDate::from_ymd_opt(end_year, end_month, end_day)
        .ok_or(RecordError::InvalidYear(year))?;
    Ok((start, end))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Covariate {
    Temperature2mMean,
    Temperature2mMax,
    Temperature2mMin,
    RelativeHumidity2mMean,
    WindSpeed10mMax,
    WindDirection10mDominant,
    PrecipitationSum,
    ShortwaveRadiationSum,
    SurfacePressureMean,
    CloudCoverMean,
}

impl Covariate {
    pub const ALL: [Covariate; COVARIATE_COUNT] = [
        Covariate::Temperature2mMean,
        Covariate::Temperature2mMax,
        Covariate::Temperature2mMin,
        Covariate::RelativeHumidity2mMean,
        Covariate::WindSpeed10mMax,
        Covariate::WindDirection10mDominant,
        Covariate::PrecipitationSum,
        Covariate::ShortwaveRadiationSum,
        Covariate::SurfacePressureMean,
        Covariate::CloudCoverMean,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Temperature2mMean => "temperature_2m_mean",
            Self::Temperature2mMax => "temperature_2m_max",
            Self::Temperature2mMin => "temperature_2m_min",
            Self::RelativeHumidity2mMean => "relative_humidity_2m_mean",
            Self::WindSpeed10mMax => "wind_speed_10m_max",
            Self::WindDirection10mDominant => "wind_direction_10m_dominant",
            Self::PrecipitationSum => "precipitation_sum",
            Self::ShortwaveRadiationSum => "shortwave_radiation_sum",
            Self::SurfacePressureMean => "surface_pressure_mean",
            Self::CloudCoverMean => "cloud_cover_mean",
        }
    }

    /// Column name of the per-window mean.
    pub fn window_column(self) -> String {
        format!("avg_{}", self.name())
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// One value slot per [`Covariate`]; `None` marks a missing observation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Covariates([Option<f64>; COVARIATE_COUNT]);

impl Covariates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, covariate: Covariate, value: f64) -> Self {
        self.set(covariate, Some(value));
        self
    }

    pub fn get(&self, covariate: Covariate) -> Option<f64> {
        self.0[covariate.index()]
    }

    pub fn set(&mut self, covariate: Covariate, value: Option<f64>) {
        self.0[covariate.index()] = value;
    }

    pub fn iter(&self) -> impl Iterator<Item = (Covariate, Option<f64>)> + '_ {
        Covariate::ALL.iter().map(move |c| (*c, self.get(*c)))
    }
}

/// Management and soil attributes assumed constant within a season.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StaticAttributes {
    pub soil_type: String,
    pub soil_ph: Option<f64>,
    pub organic_matter_content: Option<f64>,
    pub irrigation_type: String,
    pub tillage_type: String,
    pub sowing_method: String,
    pub fertilizer_type_used: String,
    pub seed_variety: String,
    pub plant_population_density: Option<f64>,
}

impl Default for StaticAttributes {
    fn default() -> Self {
        Self {
            soil_type: "loamy".to_string(),
            soil_ph: Some(6.5),
            organic_matter_content: Some(2.0),
            irrigation_type: "rain-fed".to_string(),
            tillage_type: "conventional".to_string(),
            sowing_method: "drilling".to_string(),
            fertilizer_type_used: "NPK blend".to_string(),
            seed_variety: "high-yielding".to_string(),
            plant_population_density: Some(50_000.0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Nutrients {
    pub n: f64,
    pub p: f64,
    pub k: f64,
    pub total_npk: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AreaSown {
    pub area_2025_26: f64,
    pub area_2024_25: f64,
    pub area_change_pct: f64,
}

/// Location-derived context shared by every record of a farm.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SiteContext {
    pub state: String,
    pub district: String,
    pub nutrients: Option<Nutrients>,
    pub area: Option<AreaSown>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Farm {
    pub farm_id: String,
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SeasonKey {
    pub farm_id: String,
    pub crop: String,
    pub season: Season,
    pub year: i32,
}

/// Crop names are compared trimmed and lower-cased everywhere.
pub fn crop_key(raw: &str) -> String {
    raw.trim().to_lowercase()
}

impl SeasonKey {
    pub fn new(farm_id: impl Into<String>, crop: impl AsRef<str>, season: Season, year: i32) -> Self {
        Self {
            farm_id: farm_id.into(),
            crop: crop_key(crop.as_ref()),
            season,
            year,
        }
    }

    /// Same key with the crop name in canonical form.
    pub fn normalized(&self) -> Self {
        Self {
            crop: crop_key(&self.crop),
            ..self.clone()
        }
    }
}

impl fmt::Display for SeasonKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}/{}", self.farm_id, self.crop, self.season, self.year)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CropRecord {
    pub key: SeasonKey,
    pub date: NaiveDate,
    pub covariates: Covariates,
    pub statics: StaticAttributes,
    pub site: SiteContext,
    /// Only set on the terminal observation of a season.
    pub yield_value: Option<f64>,
}

#[derive(Debug, Error, PartialEq)]
pub enum RecordError {
    #[error("unknown season label: {0}")]
    UnknownSeason(String),
    #[error("invalid season year: {0}")]
    InvalidYear(i32),
    #[error("record field {field} must not be blank")]
    BlankField { field: &'static str },
    #[error("non-finite value for {field} on {date}")]
    NonFinite { field: String, date: NaiveDate },
    #[error("record {date} belongs to {found}, expected {expected}")]
    MixedGroup {
        expected: SeasonKey,
        found: SeasonKey,
        date: NaiveDate,
    },
    #[error("records are not strictly ascending by date: {previous} then {current}")]
    UnorderedDates {
        previous: NaiveDate,
        current: NaiveDate,
    },
    #[error("yield present on {date}, which is not the last record of {key}")]
    EarlyYield { key: SeasonKey, date: NaiveDate },
}

impl CropRecord {
    pub fn validate(&self) -> Result<(), RecordError> {
        if self.key.farm_id.trim().is_empty() {
            return Err(RecordError::BlankField { field: "farm_id" });
        }
        if self.key.crop.trim().is_empty() {
            return Err(RecordError::BlankField { field: "crop" });
        }
        for (covariate, value) in self.covariates.iter() {
            if matches!(value, Some(v) if !v.is_finite()) {
                return Err(RecordError::NonFinite {
                    field: covariate.name().to_string(),
                    date: self.date,
                });
            }
        }
        if matches!(self.yield_value, Some(v) if !v.is_finite()) {
            return Err(RecordError::NonFinite {
                field: "yield".to_string(),
                date: self.date,
            });
        }
        Ok(())
    }
}

/// Checks that `records` form one date-ordered season group whose yield, if
/// any, sits on the final record.
pub fn validate_group(records: &[CropRecord]) -> Result<(), RecordError> {
    let Some(first) = records.first() else {
        return Ok(());
    };
    let last_idx = records.len() - 1;

    for (idx, record) in records.iter().enumerate() {
        record.validate()?;
        if record.key != first.key {
            return Err(RecordError::MixedGroup {
                expected: first.key.clone(),
                found: record.key.clone(),
                date: record.date,
            });
        }
        if idx > 0 {
            let previous = records[idx - 1].date;
            if record.date <= previous {
                return Err(RecordError::UnorderedDates {
                    previous,
                    current: record.date,
                });
            }
        }
        if record.yield_value.is_some() && idx != last_idx {
            return Err(RecordError::EarlyYield {
                key: record.key.clone(),
                date: record.date,
            });
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(day: u32, yield_value: Option<f64>) -> CropRecord {
        CropRecord {
            key: SeasonKey::new("f1", "wheat", Season::Rabi, 2024),
            date: NaiveDate::from_ymd_opt(2024, 12, day).unwrap(),
            covariates: Covariates::new().with(Covariate::Temperature2mMean, 20.0),
            statics: StaticAttributes::default(),
            site: SiteContext::default(),
            yield_value,
        }
    }

    #[test]
    fn rabi_range_wraps_into_next_year() {
        let (start, end) = season_date_range(Season::Rabi, 2023).unwrap();
        assert_eq!(start, NaiveDate::from_ymd_opt(2023, 11, 15).unwrap());
        assert_eq!(end, NaiveDate::from_ymd_opt(2024, 4, 15).unwrap());

        let (start, end) = season_date_range(Season::Kharif, 2023).unwrap();
        assert_eq!(start, NaiveDate::from_ymd_opt(2023, 6, 15).unwrap());
        assert_eq!(end, NaiveDate::from_ymd_opt(2023, 11, 15).unwrap());
    }

    #[test]
    fn season_range_rejects_years_without_a_successor() {
        assert_eq!(
            season_date_range(Season::Rabi, i32::MAX),
            Err(RecordError::InvalidYear(i32::MAX))
        );
        assert_eq!(
            season_date_range(Season::Kharif, i32::MAX),
            Err(RecordError::InvalidYear(i32::MAX))
        );
    }

    #[test]
    fn season_keys_share_one_crop_spelling() {
        let key = SeasonKey::new("F1", " Wheat ", Season::Rabi, 2024);
        assert_eq!(key.crop, "wheat");

        let raw = SeasonKey {
            crop: "WHEAT".to_string(),
            ..key.clone()
        };
        assert_eq!(raw.normalized(), key);
    }

    #[test]
    fn season_parses_case_insensitively() {
        assert_eq!(" Kharif ".parse::<Season>().unwrap(), Season::Kharif);
        assert!(matches!(
            "winter".parse::<Season>(),
            Err(RecordError::UnknownSeason(_))
        ));
    }

    #[test]
    fn group_validation_rejects_disorder_and_early_yield() {
        let ok = vec![record(1, None), record(2, Some(3.1))];
        assert!(validate_group(&ok).is_ok());

        let unordered = vec![record(2, None), record(1, None)];
        assert!(matches!(
            validate_group(&unordered),
            Err(RecordError::UnorderedDates { .. })
        ));

        let early = vec![record(1, Some(3.0)), record(2, None)];
        assert!(matches!(
            validate_group(&early),
            Err(RecordError::EarlyYield { .. })
        ));

        let mut other = record(3, None);
        other.key.crop = "rice".to_string();
        let mixed = vec![record(1, None), other];
        assert!(matches!(
            validate_group(&mixed),
            Err(RecordError::MixedGroup { .. })
        ));
    }

    #[test]
    fn non_finite_covariate_is_rejected() {
        let mut bad = record(1, None);
        bad.covariates.set(Covariate::PrecipitationSum, Some(f64::NAN));
        assert!(matches!(bad.validate(), Err(RecordError::NonFinite { .. })));
    }
}
