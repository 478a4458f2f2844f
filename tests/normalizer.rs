use agriyield::{
    aggregate, attach_rolling, fit, fit_transform, transform, CropRecord, Covariate, Covariates,
    FeatureError, FittedScalers, NormalizeError, NormalizerConfig, Nutrients, Season, SeasonKey,
    SiteContext, StaticAttributes, Window, WindowTable, GROWTH_STAGE_COLUMN, HEAT_UNIT_COLUMN,
};
use chrono::{Days, NaiveDate};

fn group_windows(
    key: SeasonKey,
    window_temps: &[f64],
    nutrients: Option<Nutrients>,
    yield_value: Option<f64>,
) -> Vec<Window> {
    let start = NaiveDate::from_ymd_opt(2024, 6, 15).expect("valid start date");
    let window_size = 5;
    let len = window_temps.len() * window_size;
    let records: Vec<CropRecord> = (0..len)
        .map(|i| CropRecord {
            key: key.clone(),
            date: start.checked_add_days(Days::new(i as u64)).expect("date"),
            covariates: Covariates::new()
                .with(Covariate::Temperature2mMean, window_temps[i / window_size])
                .with(Covariate::PrecipitationSum, 1.5)
                .with(Covariate::RelativeHumidity2mMean, 60.0 + i as f64),
            statics: StaticAttributes::default(),
            site: SiteContext {
                state: "Punjab".to_string(),
                district: "Ludhiana".to_string(),
                nutrients,
                area: None,
            },
            yield_value: if i + 1 == len { yield_value } else { None },
        })
        .collect();
    let mut windows = aggregate(&records, window_size).expect("valid group aggregates");
    attach_rolling(&mut windows, &records, &[7, 14]).expect("record counts line up");
    windows
}

fn sample_table() -> WindowTable {
    let mut windows = group_windows(
        SeasonKey::new("F1", "rice", Season::Kharif, 2024),
        &[12.0, 8.0, 15.0],
        None,
        Some(3.1),
    );
    windows.extend(group_windows(
        SeasonKey::new("F2", "rice", Season::Kharif, 2024),
        &[25.0, 27.0],
        Some(Nutrients {
            n: 100.0,
            p: 40.0,
            k: 30.0,
            total_npk: 170.0,
        }),
        Some(4.4),
    ));
    WindowTable::from_windows(&windows)
}

fn cfg() -> NormalizerConfig {
    NormalizerConfig {
        rolling_spans: vec![7, 14],
        ..NormalizerConfig::default()
    }
}

fn cell(table: &WindowTable, row: usize, column: &str) -> f64 {
    let idx = table
        .column_index(column)
        .unwrap_or_else(|| panic!("column {column} missing"));
    table.rows[row].values[idx].expect("imputed cell")
}

#[test]
fn transform_with_fitted_scalers_reproduces_fit_transform() {
    let raw = sample_table();
    let (fitted_table, scalers) = fit_transform(&raw, &cfg()).expect("fit_transform succeeds");

    let replayed = transform(&raw, &scalers).expect("transform succeeds");
    assert_eq!(replayed, fitted_table);

    let refit = fit(&raw, &cfg()).expect("fit succeeds");
    assert_eq!(refit, scalers);
}

#[test]
fn transformed_table_has_no_missing_cells() {
    let (table, _) = fit_transform(&sample_table(), &cfg()).expect("fit_transform succeeds");
    assert!(table
        .rows
        .iter()
        .all(|row| row.values.iter().all(|v| v.is_some())));
    assert!(table.column_index(HEAT_UNIT_COLUMN).is_some());
    assert!(table.column_index(GROWTH_STAGE_COLUMN).is_some());
}

#[test]
fn nutrients_missing_for_a_whole_group_take_the_global_mean() {
    let (table, scalers) = fit_transform(&sample_table(), &cfg()).expect("fit_transform succeeds");
    for row in 0..3 {
        let restored = scalers
            .inverse("n", cell(&table, row, "n"))
            .expect("n column fitted");
        assert!((restored - 100.0).abs() < 1e-9, "row {row}: {restored}");
    }
}

#[test]
fn columns_without_any_value_are_zero_filled() {
    let (table, scalers) = fit_transform(&sample_table(), &cfg()).expect("fit_transform succeeds");
    let column = Covariate::CloudCoverMean.window_column();
    for row in 0..table.rows.len() {
        let restored = scalers
            .inverse(&column, cell(&table, row, &column))
            .expect("cloud cover fitted");
        assert_eq!(restored, 0.0);
    }
}

#[test]
fn heat_units_accumulate_above_base_temperature() {
    let (table, scalers) = fit_transform(&sample_table(), &cfg()).expect("fit_transform succeeds");
    let gdd: Vec<f64> = (0..3)
        .map(|row| {
            scalers
                .inverse(HEAT_UNIT_COLUMN, cell(&table, row, HEAT_UNIT_COLUMN))
                .expect("gdd fitted")
        })
        .collect();
    let expected = [2.0, 2.0, 7.0];
    for (actual, expected) in gdd.iter().zip(expected) {
        assert!((actual - expected).abs() < 1e-9, "{gdd:?}");
    }

    let stage: Vec<f64> = (0..3)
        .map(|row| {
            scalers
                .inverse(GROWTH_STAGE_COLUMN, cell(&table, row, GROWTH_STAGE_COLUMN))
                .expect("growth stage fitted")
        })
        .collect();
    assert!((stage[0] - 1.0 / 3.0).abs() < 1e-9);
    assert!((stage[2] - 1.0).abs() < 1e-9);
}

#[test]
fn persisted_scalers_replay_identically() {
    let raw = sample_table();
    let (fitted_table, scalers) = fit_transform(&raw, &cfg()).expect("fit_transform succeeds");

    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("models").join("scalers.json");
    scalers.save_json(&path).expect("scalers saved");
    let loaded = FittedScalers::load_json(&path).expect("scalers loaded");

    assert_eq!(loaded, scalers);
    assert_eq!(transform(&raw, &loaded).expect("transform"), fitted_table);
}

#[test]
fn transform_rejects_a_different_column_layout() {
    let raw = sample_table();
    let scalers = fit(&raw, &cfg()).expect("fit succeeds");

    let mut narrowed = raw.clone();
    narrowed.columns.pop();
    for row in &mut narrowed.rows {
        row.values.pop();
    }
    assert!(matches!(
        transform(&narrowed, &scalers),
        Err(NormalizeError::ColumnMismatch { .. })
    ));
}

#[test]
fn transform_rejects_a_foreign_schema() {
    let raw = sample_table();
    let mut scalers = fit(&raw, &cfg()).expect("fit succeeds");
    scalers.schema.fingerprint = "0".repeat(64);
    assert!(matches!(
        transform(&raw, &scalers),
        Err(NormalizeError::Feature(
            FeatureError::SchemaFingerprintMismatch { .. }
        ))
    ));

    let mut scalers = fit(&raw, &cfg()).expect("fit succeeds");
    scalers.schema.version += 1;
    assert!(matches!(
        transform(&raw, &scalers),
        Err(NormalizeError::Feature(FeatureError::SchemaVersionMismatch { .. }))
    ));
}

#[test]
fn empty_table_and_bad_range_are_rejected() {
    assert!(matches!(
        fit(&WindowTable::default(), &cfg()),
        Err(NormalizeError::EmptyTable)
    ));
    let bad = NormalizerConfig {
        scaler_range: (1.0, 0.0),
        ..cfg()
    };
    assert!(matches!(
        fit(&sample_table(), &bad),
        Err(NormalizeError::InvalidRange(..))
    ));
}
