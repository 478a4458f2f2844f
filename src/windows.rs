//! Fixed-span window aggregation over one season group.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::records::{
    validate_group, CropRecord, Covariate, Covariates, RecordError, SeasonKey, SiteContext,
    StaticAttributes,
};

pub const DEFAULT_WINDOW_SIZE: usize = 15;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollingValue {
    pub name: String,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Window {
    pub key: SeasonKey,
    /// 1-based and contiguous within the group.
    pub window_num: u32,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub record_count: usize,
    pub is_season_end: bool,
    pub means: Covariates,
    pub rolling: Vec<RollingValue>,
    pub statics: StaticAttributes,
    pub site: SiteContext,
    pub yield_value: Option<f64>,
}

#[derive(Debug, Error, PartialEq)]
pub enum AggregateError {
    #[error("window size must be > 0")]
    InvalidWindowSize,
    #[error("records span more than one season group: expected {expected}, found {found}")]
    InvalidGrouping { expected: SeasonKey, found: SeasonKey },
    #[error(transparent)]
    Record(RecordError),
}

impl From<RecordError> for AggregateError {
    fn from(err: RecordError) -> Self {
        match err {
            RecordError::MixedGroup {
                expected, found, ..
            } => Self::InvalidGrouping { expected, found },
            other => Self::Record(other),
        }
    }
}

/// Splits one date-ordered season group into windows of `window_size`
/// records. The final window absorbs the remainder, so it holds between
/// `window_size` and `2 * window_size - 1` records. Groups shorter than one
/// full window produce nothing.
pub fn aggregate(records: &[CropRecord], window_size: usize) -> Result<Vec<Window>, AggregateError> {
    if window_size == 0 {
        return Err(AggregateError::InvalidWindowSize);
    }
    if records.is_empty() {
        return Ok(Vec::new());
    }
    validate_group(records)?;

    let window_count = records.len() / window_size;
    if window_count == 0 {
        debug!(
            component = "windows",
            event = "windows.aggregate.insufficient",
            key = %records[0].key,
            records = records.len(),
            window_size
        );
        return Ok(Vec::new());
    }

    let terminal_yield = records[records.len() - 1].yield_value;
    let mut windows = Vec::with_capacity(window_count);
    for idx in 0..window_count {
        let start = idx * window_size;
        let is_last = idx + 1 == window_count;
        let end = if is_last { records.len() } else { start + window_size };
        let chunk = &records[start..end];

        let first = &chunk[0];
        windows.push(Window {
            key: first.key.clone(),
            window_num: (idx + 1) as u32,
            start_date: first.date,
            end_date: chunk[chunk.len() - 1].date,
            record_count: chunk.len(),
            is_season_end: is_last,
            means: chunk_means(chunk),
            rolling: Vec::new(),
            statics: first.statics.clone(),
            site: first.site.clone(),
            yield_value: if is_last { terminal_yield } else { None },
        });
    }

    debug!(
        component = "windows",
        event = "windows.aggregate.finish",
        key = %records[0].key,
        records = records.len(),
        windows = windows.len(),
        labeled = terminal_yield.is_some()
    );

    Ok(windows)
}

/// Rounds to two decimals, the precision of persisted window tables.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn chunk_means(chunk: &[CropRecord]) -> Covariates {
    let mut means = Covariates::new();
    for covariate in Covariate::ALL {
        let (sum, count) = chunk
            .iter()
            .filter_map(|r| r.covariates.get(covariate))
            .fold((0.0, 0usize), |(s, c), v| (s + v, c + 1));
        if count > 0 {
            means.set(covariate, Some(round2(sum / count as f64)));
        }
    }
    means
}
