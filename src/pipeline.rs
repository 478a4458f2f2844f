//! Batch driver: fetch, aggregate, normalize and sequence many season groups.
//!
//! A failed or skipped group never aborts the batch. Each group is fetched
//! and aggregated independently; scalers are then fitted once over every
//! surviving window before sequencing.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::{ConfigError, PipelineConfig};
use crate::features::{attach_rolling, FeatureError};
use crate::importance::{feature_importance, FeatureImportance};
use crate::normalize::{fit_transform, FittedScalers, NormalizeError};
use crate::records::{CropRecord, SeasonKey};
use crate::sequencer::{build_all, SequenceExample};
use crate::store::{RecordStore, StoreError};
use crate::table::WindowTable;
use crate::windows::{aggregate, AggregateError, Window};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureStage {
    Fetch,
    Aggregate,
    Sequence,
    Worker,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupFailure {
    pub key: SeasonKey,
    pub stage: FailureStage,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    pub groups_total: usize,
    pub groups_processed: usize,
    pub groups_skipped: usize,
    pub groups_failed: usize,
    pub examples: usize,
    pub failures: Vec<GroupFailure>,
}

#[derive(Debug, Clone, Default)]
pub struct BatchOutput {
    /// Raw windows of every processed group, before imputation and scaling.
    pub windows: Vec<Window>,
    /// Normalized table; empty when no group produced windows.
    pub table: WindowTable,
    pub scalers: Option<FittedScalers>,
    pub examples: Vec<SequenceExample>,
    pub importance: Vec<FeatureImportance>,
    pub report: BatchReport,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Normalize(#[from] NormalizeError),
}

#[derive(Debug, Error)]
enum GroupError {
    #[error(transparent)]
    Aggregate(#[from] AggregateError),
    #[error(transparent)]
    Feature(#[from] FeatureError),
}

#[derive(Debug)]
enum GroupOutcome {
    Processed(Vec<Window>),
    Skipped(&'static str),
    Failed(FailureStage, String),
}

/// Runs every group in `groups` on the calling thread.
pub fn run_batch(
    store: &dyn RecordStore,
    groups: &[SeasonKey],
    cfg: &PipelineConfig,
) -> Result<BatchOutput, PipelineError> {
    cfg.validate()?;
    let groups = unique_groups(groups);
    log_batch_start(groups.len(), cfg);

    let never_cancelled = AtomicBool::new(false);
    let outcomes = groups
        .into_iter()
        .map(|key| {
            let outcome = collect_group(store, &key, cfg, &never_cancelled);
            (key, outcome)
        })
        .collect();
    finish_batch(outcomes, cfg)
}

/// Fans groups out onto the blocking pool. The whole batch shares one
/// deadline of `group_timeout_ms`; groups still running when it passes are
/// skipped and told to stop at their next fetch or retry.
#[cfg(feature = "async-driver")]
pub async fn run_batch_concurrent(
    store: std::sync::Arc<dyn RecordStore>,
    groups: &[SeasonKey],
    cfg: &PipelineConfig,
) -> Result<BatchOutput, PipelineError> {
    cfg.validate()?;
    let groups = unique_groups(groups);
    log_batch_start(groups.len(), cfg);

    let deadline = tokio::time::Instant::now() + Duration::from_millis(cfg.group_timeout_ms);
    let cancelled = std::sync::Arc::new(AtomicBool::new(false));
    let handles: Vec<_> = groups
        .into_iter()
        .map(|key| {
            let store = std::sync::Arc::clone(&store);
            let cancelled = std::sync::Arc::clone(&cancelled);
            let task_cfg = cfg.clone();
            let task_key = key.clone();
            let handle = tokio::task::spawn_blocking(move || {
                collect_group(store.as_ref(), &task_key, &task_cfg, &cancelled)
            });
            (key, handle)
        })
        .collect();

    let mut outcomes = Vec::with_capacity(handles.len());
    for (key, handle) in handles {
        let outcome = match tokio::time::timeout_at(deadline, handle).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(join_err)) => GroupOutcome::Failed(FailureStage::Worker, join_err.to_string()),
            Err(_) => {
                cancelled.store(true, Ordering::SeqCst);
                GroupOutcome::Skipped("timeout")
            }
        };
        outcomes.push((key, outcome));
    }
    finish_batch(outcomes, cfg)
}

fn unique_groups(groups: &[SeasonKey]) -> Vec<SeasonKey> {
    let mut seen = BTreeSet::new();
    groups
        .iter()
        .map(SeasonKey::normalized)
        .filter(|key| seen.insert(key.clone()))
        .collect()
}

fn log_batch_start(groups: usize, cfg: &PipelineConfig) {
    info!(
        component = "pipeline",
        event = "pipeline.batch.start",
        groups,
        window_size = cfg.window_size,
        spans = ?cfg.rolling_spans,
        max_retries = cfg.max_retries
    );
}

/// `key` must already be normalized.
fn collect_group(
    store: &dyn RecordStore,
    key: &SeasonKey,
    cfg: &PipelineConfig,
    cancelled: &AtomicBool,
) -> GroupOutcome {
    if cancelled.load(Ordering::SeqCst) {
        return GroupOutcome::Skipped("timeout");
    }
    let fetched = retry(cfg, key, cancelled, || {
        store.fetch_records(&key.farm_id, &key.crop, Some(key.season), Some(key.year))
    });
    let records: Vec<CropRecord> = match fetched {
        Ok(records) => records
            .into_iter()
            .filter_map(|mut record| {
                record.key = record.key.normalized();
                (record.key == *key).then_some(record)
            })
            .collect(),
        Err(err) => return GroupOutcome::Failed(FailureStage::Fetch, err.to_string()),
    };
    if records.is_empty() {
        return GroupOutcome::Skipped("no records");
    }
    if cancelled.load(Ordering::SeqCst) {
        return GroupOutcome::Skipped("timeout");
    }

    match window_group(&records, cfg) {
        Ok(windows) if windows.len() < cfg.min_windows.max(1) => {
            GroupOutcome::Skipped("insufficient data")
        }
        Ok(windows) => GroupOutcome::Processed(windows),
        Err(err) => GroupOutcome::Failed(FailureStage::Aggregate, err.to_string()),
    }
}

fn window_group(records: &[CropRecord], cfg: &PipelineConfig) -> Result<Vec<Window>, GroupError> {
    let mut windows = aggregate(records, cfg.window_size)?;
    if !windows.is_empty() {
        attach_rolling(&mut windows, records, &cfg.rolling_spans)?;
    }
    Ok(windows)
}

fn finish_batch(
    outcomes: Vec<(SeasonKey, GroupOutcome)>,
    cfg: &PipelineConfig,
) -> Result<BatchOutput, PipelineError> {
    let mut output = BatchOutput::default();
    output.report.groups_total = outcomes.len();

    for (key, outcome) in outcomes {
        match outcome {
            GroupOutcome::Processed(mut windows) => {
                output.report.groups_processed += 1;
                output.windows.append(&mut windows);
            }
            GroupOutcome::Skipped(reason) => {
                output.report.groups_skipped += 1;
                warn!(
                    component = "pipeline",
                    event = "pipeline.group.skipped",
                    key = %key,
                    reason
                );
            }
            GroupOutcome::Failed(stage, reason) => {
                record_failure(&mut output.report, key, stage, reason);
            }
        }
    }

    if !output.windows.is_empty() {
        let raw = WindowTable::from_windows(&output.windows);
        let (table, scalers) = fit_transform(&raw, &cfg.normalizer())?;
        let batch = build_all(&table);
        for rejected in batch.report.rejected {
            output.report.groups_processed = output.report.groups_processed.saturating_sub(1);
            record_failure(
                &mut output.report,
                rejected.key,
                FailureStage::Sequence,
                rejected.reason,
            );
        }
        output.importance = feature_importance(&table);
        output.examples = batch.examples;
        output.table = table;
        output.scalers = Some(scalers);
    }
    output.report.examples = output.examples.len();

    info!(
        component = "pipeline",
        event = "pipeline.batch.finish",
        groups_total = output.report.groups_total,
        groups_processed = output.report.groups_processed,
        groups_skipped = output.report.groups_skipped,
        groups_failed = output.report.groups_failed,
        examples = output.report.examples
    );
    Ok(output)
}

fn record_failure(report: &mut BatchReport, key: SeasonKey, stage: FailureStage, reason: String) {
    warn!(
        component = "pipeline",
        event = "pipeline.group.failed",
        key = %key,
        stage = ?stage,
        reason = %reason
    );
    report.groups_failed += 1;
    report.failures.push(GroupFailure { key, stage, reason });
}

/// Stops retrying once `cancelled` is set and returns the last error.
fn retry<T>(
    cfg: &PipelineConfig,
    key: &SeasonKey,
    cancelled: &AtomicBool,
    mut f: impl FnMut() -> Result<T, StoreError>,
) -> Result<T, StoreError> {
    let mut attempt: u32 = 0;
    loop {
        match f() {
            Ok(value) => return Ok(value),
            Err(err)
                if !err.is_retryable()
                    || attempt >= cfg.max_retries
                    || cancelled.load(Ordering::SeqCst) =>
            {
                return Err(err)
            }
            Err(err) => {
                attempt = attempt.saturating_add(1);
                let shift = attempt.saturating_sub(1).min(10);
                let factor = 1u64 << shift;
                let sleep_ms = cfg.retry_backoff_ms.saturating_mul(factor);
                warn!(
                    component = "pipeline",
                    event = "pipeline.fetch.retry",
                    key = %key,
                    attempt,
                    sleep_ms,
                    error = %err
                );
                std::thread::sleep(Duration::from_millis(sleep_ms));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::Season;
    use std::sync::atomic::AtomicU32;

    struct FlakyStore {
        failures_left: AtomicU32,
        calls: AtomicU32,
    }

    impl RecordStore for FlakyStore {
        fn fetch_records(
            &self,
            _farm_id: &str,
            _crop: &str,
            _season: Option<Season>,
            _year: Option<i32>,
        ) -> Result<Vec<CropRecord>, StoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failures_left.load(Ordering::SeqCst) > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                return Err(StoreError::Unavailable("db down".to_string()));
            }
            Err(StoreError::FarmNotFound("f1".to_string()))
        }

        fn list_groups(&self) -> Result<Vec<SeasonKey>, StoreError> {
            Ok(Vec::new())
        }
    }

    fn fast_cfg(max_retries: u32) -> PipelineConfig {
        PipelineConfig {
            max_retries,
            retry_backoff_ms: 0,
            ..PipelineConfig::default()
        }
    }

    #[test]
    fn retries_only_retryable_errors() {
        let store = FlakyStore {
            failures_left: AtomicU32::new(2),
            calls: AtomicU32::new(0),
        };
        let key = SeasonKey::new("f1", "rice", Season::Kharif, 2024);
        let err = retry(&fast_cfg(5), &key, &AtomicBool::new(false), || {
            store.fetch_records("f1", "rice", None, None)
        })
        .unwrap_err();
        assert!(matches!(err, StoreError::FarmNotFound(_)));
        assert_eq!(store.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn gives_up_after_max_retries() {
        let store = FlakyStore {
            failures_left: AtomicU32::new(10),
            calls: AtomicU32::new(0),
        };
        let key = SeasonKey::new("f1", "rice", Season::Kharif, 2024);
        let err = retry(&fast_cfg(2), &key, &AtomicBool::new(false), || {
            store.fetch_records("f1", "rice", None, None)
        })
        .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(store.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn cancelled_work_stops_retrying() {
        let store = FlakyStore {
            failures_left: AtomicU32::new(10),
            calls: AtomicU32::new(0),
        };
        let key = SeasonKey::new("f1", "rice", Season::Kharif, 2024);
        let cancelled = AtomicBool::new(true);
        let err = retry(&fast_cfg(5), &key, &cancelled, || {
            store.fetch_records("f1", "rice", None, None)
        })
        .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(store.calls.load(Ordering::SeqCst), 1);

        let outcome = collect_group(&store, &key, &fast_cfg(5), &cancelled);
        assert!(matches!(outcome, GroupOutcome::Skipped("timeout")));
        assert_eq!(store.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn store_failures_are_reported_per_group() {
        let store = FlakyStore {
            failures_left: AtomicU32::new(0),
            calls: AtomicU32::new(0),
        };
        let key = SeasonKey::new("f1", "rice", Season::Kharif, 2024);
        let output = run_batch(&store, &[key.clone(), key.clone()], &fast_cfg(0)).unwrap();
        assert_eq!(output.report.groups_total, 1);
        assert_eq!(output.report.groups_failed, 1);
        assert_eq!(output.report.failures[0].stage, FailureStage::Fetch);
        assert!(output.scalers.is_none());
    }
}
