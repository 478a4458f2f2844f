use std::io;
use std::io::Write;
use std::sync::{Arc, Mutex};

use agriyield::{
    fit_transform, log_app_start, log_batch_summary, run_batch, CropRecord, Covariate,
    Covariates, InMemoryRecordStore, LoggingConfig, NormalizerConfig, PipelineConfig, Season,
    SeasonKey, SiteContext, StaticAttributes, WindowRow, WindowTable, TableColumn,
};
use chrono::{Days, NaiveDate};
use regex::Regex;
use tracing::dispatcher::with_default;
use tracing::Level;
use tracing_subscriber::fmt::writer::MakeWriter;

#[derive(Clone, Default)]
struct SharedWriter {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl SharedWriter {
    fn output_string(&self) -> String {
        let bytes = self
            .inner
            .lock()
            .expect("writer lock should not be poisoned");
        String::from_utf8_lossy(&bytes).to_string()
    }
}

struct SharedWriterGuard {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl<'a> MakeWriter<'a> for SharedWriter {
    type Writer = SharedWriterGuard;

    fn make_writer(&'a self) -> Self::Writer {
        SharedWriterGuard {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Write for SharedWriterGuard {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut out = self
            .inner
            .lock()
            .expect("writer lock should not be poisoned");
        out.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn capture_logs(max_level: Level, f: impl FnOnce()) -> String {
    let writer = SharedWriter::default();
    let subscriber = tracing_subscriber::fmt()
        .json()
        .with_ansi(false)
        .with_max_level(max_level)
        .with_writer(writer.clone())
        .finish();
    let dispatch = tracing::Dispatch::new(subscriber);

    with_default(&dispatch, f);
    writer.output_string()
}

fn records(key: &SeasonKey, len: usize) -> Vec<CropRecord> {
    let start = NaiveDate::from_ymd_opt(2024, 11, 15).expect("valid start date");
    (0..len)
        .map(|i| CropRecord {
            key: key.clone(),
            date: start.checked_add_days(Days::new(i as u64)).expect("date"),
            covariates: Covariates::new().with(Covariate::Temperature2mMean, 19.0),
            statics: StaticAttributes::default(),
            site: SiteContext::default(),
            yield_value: (i + 1 == len).then_some(2.5),
        })
        .collect()
}

#[test]
fn batch_run_emits_lifecycle_and_skip_events() {
    let good = SeasonKey::new("F1", "wheat", Season::Rabi, 2024);
    let short = SeasonKey::new("F2", "wheat", Season::Rabi, 2024);
    let mut store = InMemoryRecordStore::new();
    store.extend(records(&good, 30));
    store.extend(records(&short, 4));
    let cfg = PipelineConfig {
        retry_backoff_ms: 0,
        ..PipelineConfig::default()
    };

    let logs = capture_logs(Level::INFO, || {
        let output = run_batch(&store, &[good.clone(), short.clone()], &cfg).expect("batch runs");
        log_batch_summary(&output.report);
    });

    assert!(logs.contains("\"event\":\"pipeline.batch.start\""));
    assert!(logs.contains("\"event\":\"pipeline.batch.finish\""));
    assert!(logs.contains("\"event\":\"batch.summary\""));
    let skipped = Regex::new(
        r#""event":"pipeline\.group\.skipped","key":"F2/wheat/rabi/2024","reason":"insufficient data""#,
    )
    .expect("valid regex");
    assert!(skipped.is_match(&logs), "logs: {logs}");
    let totals = Regex::new(r#""groups_total":2,"groups_processed":1,"groups_skipped":1"#)
        .expect("valid regex");
    assert!(totals.is_match(&logs), "logs: {logs}");
}

#[test]
fn zero_fill_is_reported_per_column() {
    let key = SeasonKey::new("F1", "rice", Season::Kharif, 2024);
    let start = NaiveDate::from_ymd_opt(2024, 6, 15).expect("valid date");
    let table = WindowTable {
        columns: vec![
            TableColumn::weather(Covariate::Temperature2mMean.window_column()),
            TableColumn::bounded("soil_ph"),
        ],
        rows: vec![WindowRow {
            key,
            window_num: 1,
            start_date: start,
            end_date: start,
            is_season_end: true,
            label: Some(2.0),
            values: vec![Some(21.0), None],
        }],
    };

    let logs = capture_logs(Level::WARN, || {
        fit_transform(&table, &NormalizerConfig::default()).expect("fit_transform succeeds");
    });

    let zero_fill =
        Regex::new(r#""event":"normalize\.impute\.zero_fill","column":"soil_ph","rows":\d+"#)
            .expect("valid regex");
    assert!(zero_fill.is_match(&logs), "logs: {logs}");
}

#[test]
fn app_start_records_logging_config() {
    let cfg = LoggingConfig::default();
    let logs = capture_logs(Level::INFO, || log_app_start(&cfg, "build_windows"));

    assert!(logs.contains("\"component\":\"build_windows\""));
    assert!(logs.contains("\"event\":\"app.start\""));
    assert!(logs.contains("\"log_level\":\"info\""));
}
