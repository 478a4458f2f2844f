//! Seasonal windowing and sequence construction for crop-yield forecasting.
//!
//! Raw daily records for one (farm, crop, season, year) group are aggregated
//! into fixed-span windows, normalized with fitted scalers, and lifted into
//! labeled prefix sequences for a forecaster.

mod artifact;
mod config;
mod context;
mod dataset;
mod features;
mod forecast;
mod importance;
mod normalize;
mod observability;
mod pipeline;
mod records;
mod sequencer;
mod session;
mod store;
mod table;
mod windows;

pub use artifact::{
    path_component, read_window_table, window_table_path, write_window_table, ArtifactError,
};
pub use config::{pipeline_config_from_env, ConfigError, PipelineConfig};
pub use context::{AreaLookup, AreaSownTable, ContextError, NutrientTable, UnmappedCropPolicy};
pub use dataset::{
    normalize_identifier, DailyObservation, DatasetGenerator, SeasonGroup, YieldObservation,
    ALLOWED_CROPS,
};
pub use features::{
    add_growth_stage, add_heat_units, assert_schema_compatible, attach_rolling,
    build_feature_schema, precipitation_rolling_column, temperature_rolling_column,
    trailing_features, FeatureError, FeatureSchema, DEFAULT_BASE_TEMPERATURE,
    DEFAULT_ROLLING_SPANS, FEATURE_SCHEMA_VERSION, GROWTH_STAGE_COLUMN, HEAT_UNIT_COLUMN,
};
pub use forecast::{
    ForecastError, Forecaster, MeanYieldForecaster, MeanYieldModel, Prediction, YieldModel,
};
pub use importance::{feature_importance, FeatureImportance};
pub use normalize::{
    fit, fit_transform, transform, ColumnScaler, FittedColumn, FittedScalers, NormalizeError,
    NormalizerConfig,
};
pub use observability::{
    init_logging, log_app_start, log_batch_summary, logging_config_from_env, LogFormat,
    LoggingConfig, LoggingInitError,
};
#[cfg(feature = "async-driver")]
pub use pipeline::run_batch_concurrent;
pub use pipeline::{
    run_batch, BatchOutput, BatchReport, FailureStage, GroupFailure, PipelineError,
};
pub use records::{
    crop_key, season_date_range, validate_group, AreaSown, CropRecord, Covariate, Covariates, Farm,
    Nutrients, RecordError, Season, SeasonKey, SiteContext, StaticAttributes, COVARIATE_COUNT,
};
pub use sequencer::{
    build_all, build_sequences, FeatureMatrix, RejectedGroup, SequenceBatch, SequenceError,
    SequenceExample, SequenceMetadata, SequenceReport,
};
pub use session::{
    ChatTurn, InMemorySessionStore, Session, SessionError, SessionManager, SessionStore,
    SqliteSessionStore, WriteThroughSessionStore, DEFAULT_SESSION_TIMEOUT_SECS,
};
pub use store::{CsvRecordStore, InMemoryRecordStore, RecordStore, StoreError};
pub use table::{ColumnKind, TableColumn, WindowRow, WindowTable};
pub use windows::{aggregate, round2, AggregateError, RollingValue, Window, DEFAULT_WINDOW_SIZE};
