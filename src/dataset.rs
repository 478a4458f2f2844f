//! Builds per-season record groups from a farm's daily weather and reported
//! district yields.

use std::collections::BTreeSet;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::context::{AreaLookup, AreaSownTable, NutrientTable, UnmappedCropPolicy};
use crate::records::{
    season_date_range, CropRecord, Covariates, Farm, Season, SeasonKey, SiteContext,
    StaticAttributes,
};

pub const ALLOWED_CROPS: [&str; 18] = [
    "rice",
    "cereals",
    "total food grains",
    "maize",
    "nutri/coarse cereals",
    "tur",
    "urad",
    "moong",
    "total pulses",
    "jowar",
    "bajra",
    "ragi",
    "small millets",
    "other pulses",
    "gram",
    "lentil",
    "wheat",
    "barley",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyObservation {
    pub date: NaiveDate,
    pub covariates: Covariates,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct YieldObservation {
    pub crop: String,
    pub season: String,
    pub year: i32,
    pub district: String,
    pub yield_value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeasonGroup {
    pub key: SeasonKey,
    pub records: Vec<CropRecord>,
}

/// Lower-cases and replaces spaces with underscores.
pub fn normalize_identifier(raw: &str) -> String {
    raw.trim().to_lowercase().replace(' ', "_")
}

pub struct DatasetGenerator<'a> {
    farm_id: String,
    state: String,
    statics: StaticAttributes,
    nutrients: &'a NutrientTable,
    area: Option<&'a AreaSownTable>,
    policy: UnmappedCropPolicy,
}

impl<'a> DatasetGenerator<'a> {
    pub fn new(farm: &Farm, state: &str, nutrients: &'a NutrientTable) -> Self {
        Self {
            farm_id: normalize_identifier(&farm.farm_id),
            state: state.trim().to_lowercase(),
            statics: StaticAttributes::default(),
            nutrients,
            area: None,
            policy: UnmappedCropPolicy::default(),
        }
    }

    pub fn with_statics(mut self, statics: StaticAttributes) -> Self {
        self.statics = statics;
        self
    }

    pub fn with_area(mut self, area: &'a AreaSownTable, policy: UnmappedCropPolicy) -> Self {
        self.area = Some(area);
        self.policy = policy;
        self
    }

    /// One group per usable yield row. Weather is sliced to the season
    /// calendar and the yield is attached to the last day of the slice.
    pub fn generate(
        &self,
        weather: &[DailyObservation],
        yields: &[YieldObservation],
    ) -> Vec<SeasonGroup> {
        let mut weather: Vec<&DailyObservation> = weather.iter().collect();
        weather.sort_by_key(|obs| obs.date);
        weather.dedup_by_key(|obs| obs.date);

        let nutrients = self.nutrients.lookup(&self.state);
        if nutrients.is_none() {
            warn!(
                component = "dataset",
                event = "dataset.nutrients.missing",
                state = %self.state
            );
        }

        let mut seen = BTreeSet::new();
        let mut groups = Vec::new();
        let mut skipped = 0usize;

        for row in yields {
            let crop = row.crop.trim().to_lowercase();
            if !ALLOWED_CROPS.contains(&crop.as_str()) {
                warn!(component = "dataset", event = "dataset.crop.skipped", crop = %crop);
                skipped += 1;
                continue;
            }
            let Ok(season) = row.season.parse::<Season>() else {
                warn!(
                    component = "dataset",
                    event = "dataset.season.unsupported",
                    season = %row.season
                );
                skipped += 1;
                continue;
            };
            if !row.yield_value.is_finite() {
                warn!(component = "dataset", event = "dataset.yield.invalid", crop = %crop);
                skipped += 1;
                continue;
            }

            let area = match self.area.map(|table| table.lookup(&crop, self.policy)) {
                Some(AreaLookup::Excluded) => {
                    skipped += 1;
                    continue;
                }
                Some(AreaLookup::Mapped(area)) | Some(AreaLookup::Fallback(area)) => Some(area),
                None => None,
            };

            let key = SeasonKey::new(self.farm_id.clone(), crop.clone(), season, row.year);
            if !seen.insert(key.clone()) {
                warn!(
                    component = "dataset",
                    event = "dataset.group.duplicate",
                    key = %key,
                    district = %row.district
                );
                skipped += 1;
                continue;
            }

            let Ok((start, end)) = season_date_range(season, row.year) else {
                skipped += 1;
                continue;
            };
            let slice: Vec<&DailyObservation> = weather
                .iter()
                .copied()
                .filter(|obs| obs.date >= start && obs.date <= end)
                .collect();
            if slice.is_empty() {
                warn!(
                    component = "dataset",
                    event = "dataset.weather.empty",
                    key = %key
                );
                skipped += 1;
                continue;
            }

            let site = SiteContext {
                state: self.state.clone(),
                district: row.district.trim().to_lowercase(),
                nutrients,
                area,
            };
            let last = slice.len() - 1;
            let records = slice
                .iter()
                .enumerate()
                .map(|(idx, obs)| CropRecord {
                    key: key.clone(),
                    date: obs.date,
                    covariates: obs.covariates,
                    statics: self.statics.clone(),
                    site: site.clone(),
                    yield_value: (idx == last).then_some(row.yield_value),
                })
                .collect();
            groups.push(SeasonGroup { key, records });
        }

        info!(
            component = "dataset",
            event = "dataset.generate.finish",
            farm_id = %self.farm_id,
            groups = groups.len(),
            skipped
        );
        groups
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{Covariate, Nutrients};
    use chrono::Days;

    fn farm() -> Farm {
        Farm {
            farm_id: "Green Acres".to_string(),
            name: "Green Acres".to_string(),
            latitude: 30.9,
            longitude: 75.8,
        }
    }

    fn weather(start: NaiveDate, days: u64) -> Vec<DailyObservation> {
        (0..days)
            .map(|i| DailyObservation {
                date: start.checked_add_days(Days::new(i)).unwrap(),
                covariates: Covariates::new().with(Covariate::Temperature2mMean, 25.0),
            })
            .collect()
    }

    fn yield_row(crop: &str, season: &str) -> YieldObservation {
        YieldObservation {
            crop: crop.to_string(),
            season: season.to_string(),
            year: 2023,
            district: "Ludhiana".to_string(),
            yield_value: 3.4,
        }
    }

    #[test]
    fn slices_weather_to_the_season_and_labels_the_last_day() {
        let mut nutrients = NutrientTable::default();
        nutrients.insert(
            "punjab",
            Nutrients {
                n: 180.0,
                p: 60.0,
                k: 20.0,
                total_npk: 260.0,
            },
        );
        let generator = DatasetGenerator::new(&farm(), "Punjab", &nutrients);
        let start = NaiveDate::from_ymd_opt(2023, 6, 1).unwrap();
        let groups = generator.generate(&weather(start, 200), &[yield_row("Rice", "Kharif")]);

        assert_eq!(groups.len(), 1);
        let group = &groups[0];
        assert_eq!(group.key.farm_id, "green_acres");
        assert_eq!(group.records.first().unwrap().date, NaiveDate::from_ymd_opt(2023, 6, 15).unwrap());
        assert_eq!(group.records.last().unwrap().date, NaiveDate::from_ymd_opt(2023, 11, 15).unwrap());
        assert_eq!(group.records.last().unwrap().yield_value, Some(3.4));
        assert!(group.records[..group.records.len() - 1]
            .iter()
            .all(|r| r.yield_value.is_none()));
        assert_eq!(group.records[0].site.nutrients.unwrap().n, 180.0);
        assert_eq!(group.records[0].site.district, "ludhiana");
    }

    #[test]
    fn skips_disallowed_crops_unknown_seasons_and_empty_slices() {
        let nutrients = NutrientTable::default();
        let generator = DatasetGenerator::new(&farm(), "punjab", &nutrients);
        let start = NaiveDate::from_ymd_opt(2023, 6, 1).unwrap();
        let rows = [
            yield_row("cotton", "kharif"),
            yield_row("rice", "autumn"),
            yield_row("wheat", "rabi"),
        ];
        assert!(generator.generate(&weather(start, 30), &rows).is_empty());
    }

    #[test]
    fn excluded_crops_are_dropped_under_exclude_policy() {
        let nutrients = NutrientTable::default();
        let area = AreaSownTable::new(Default::default(), crate::records::AreaSown {
            area_2025_26: 1.0,
            area_2024_25: 1.0,
            area_change_pct: 0.0,
        });
        let start = NaiveDate::from_ymd_opt(2023, 6, 1).unwrap();
        let fallback = DatasetGenerator::new(&farm(), "punjab", &nutrients)
            .with_area(&area, UnmappedCropPolicy::MeanFallback)
            .generate(&weather(start, 200), &[yield_row("maize", "kharif")]);
        assert_eq!(fallback.len(), 1);
        assert!(fallback[0].records[0].site.area.is_some());

        let excluded = DatasetGenerator::new(&farm(), "punjab", &nutrients)
            .with_area(&area, UnmappedCropPolicy::Exclude)
            .generate(&weather(start, 200), &[yield_row("maize", "kharif")]);
        assert!(excluded.is_empty());
    }
}
