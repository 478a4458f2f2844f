//! Pipeline configuration: defaults, environment overlay and JSON files.

use std::env;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::features::{DEFAULT_BASE_TEMPERATURE, DEFAULT_ROLLING_SPANS};
use crate::normalize::NormalizerConfig;
use crate::windows::DEFAULT_WINDOW_SIZE;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub window_size: usize,
    pub base_temperature: f64,
    pub rolling_spans: Vec<u32>,
    pub scaler_range: (f64, f64),
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub group_timeout_ms: u64,
    /// Groups aggregating to fewer windows are skipped.
    pub min_windows: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            window_size: DEFAULT_WINDOW_SIZE,
            base_temperature: DEFAULT_BASE_TEMPERATURE,
            rolling_spans: DEFAULT_ROLLING_SPANS.to_vec(),
            scaler_range: (0.0, 1.0),
            max_retries: 2,
            retry_backoff_ms: 200,
            group_timeout_ms: 30_000,
            min_windows: 1,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("window_size must be > 0")]
    ZeroWindowSize,
    #[error("rolling_spans must be non-empty, positive and unique: {0:?}")]
    InvalidRollingSpans(Vec<u32>),
    #[error("scaler_range ({0}, {1}) must have min < max")]
    InvalidScalerRange(f64, f64),
    #[error("base_temperature must be finite")]
    NonFiniteBaseTemperature,
    #[error("group_timeout_ms must be > 0")]
    ZeroGroupTimeout,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.window_size == 0 {
            return Err(ConfigError::ZeroWindowSize);
        }
        let mut spans = self.rolling_spans.clone();
        spans.sort_unstable();
        spans.dedup();
        if spans.is_empty() || spans[0] == 0 || spans.len() != self.rolling_spans.len() {
            return Err(ConfigError::InvalidRollingSpans(self.rolling_spans.clone()));
        }
        let (min, max) = self.scaler_range;
        if !(min < max) {
            return Err(ConfigError::InvalidScalerRange(min, max));
        }
        if !self.base_temperature.is_finite() {
            return Err(ConfigError::NonFiniteBaseTemperature);
        }
        if self.group_timeout_ms == 0 {
            return Err(ConfigError::ZeroGroupTimeout);
        }
        Ok(())
    }

    pub fn normalizer(&self) -> NormalizerConfig {
        NormalizerConfig {
            base_temperature: self.base_temperature,
            rolling_spans: self.rolling_spans.clone(),
            scaler_range: self.scaler_range,
        }
    }

    /// Missing keys take their defaults.
    pub fn load_json(path: &Path) -> Result<Self, ConfigError> {
        let bytes = fs::read(path)?;
        let cfg: Self = serde_json::from_slice(&bytes)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn save_json(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }
}

pub fn pipeline_config_from_env() -> PipelineConfig {
    let mut config = PipelineConfig::default();

    if let Some(window_size) = env_parsed::<usize>("AGRIYIELD_WINDOW_SIZE") {
        config.window_size = window_size;
    }
    if let Some(base) = env_parsed::<f64>("AGRIYIELD_BASE_TEMPERATURE") {
        config.base_temperature = base;
    }
    if let Ok(raw) = env::var("AGRIYIELD_ROLLING_SPANS") {
        match parse_spans(&raw) {
            Some(spans) => config.rolling_spans = spans,
            None => warn!(
                component = "config",
                event = "config.env.ignored",
                key = "AGRIYIELD_ROLLING_SPANS",
                value = %raw
            ),
        }
    }
    if let Some(retries) = env_parsed::<u32>("AGRIYIELD_MAX_RETRIES") {
        config.max_retries = retries;
    }
    if let Some(timeout) = env_parsed::<u64>("AGRIYIELD_GROUP_TIMEOUT_MS") {
        config.group_timeout_ms = timeout;
    }

    config
}

fn env_parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = env::var(key).ok()?;
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    match trimmed.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(
                component = "config",
                event = "config.env.ignored",
                key,
                value = %raw
            );
            None
        }
    }
}

fn parse_spans(raw: &str) -> Option<Vec<u32>> {
    let spans: Vec<u32> = raw
        .split(',')
        .map(|part| part.trim().parse().ok())
        .collect::<Option<_>>()?;
    (!spans.is_empty()).then_some(spans)
}
