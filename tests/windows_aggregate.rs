use agriyield::{
    aggregate, attach_rolling, AggregateError, CropRecord, Covariate, Covariates, RecordError,
    Season, SeasonKey, SiteContext, StaticAttributes,
};
use chrono::{Days, NaiveDate};

fn rabi_group(len: usize, temperature: f64, yield_value: Option<f64>) -> Vec<CropRecord> {
    let start = NaiveDate::from_ymd_opt(2024, 11, 15).expect("valid start date");
    (0..len)
        .map(|i| CropRecord {
            key: SeasonKey::new("F1", "wheat", Season::Rabi, 2024),
            date: start
                .checked_add_days(Days::new(i as u64))
                .expect("date in range"),
            covariates: Covariates::new()
                .with(Covariate::Temperature2mMean, temperature)
                .with(Covariate::PrecipitationSum, 2.0),
            statics: StaticAttributes::default(),
            site: SiteContext::default(),
            yield_value: if i + 1 == len { yield_value } else { None },
        })
        .collect()
}

#[test]
fn thirty_seven_days_fold_into_two_windows() {
    let records = rabi_group(37, 20.0, Some(3.2));
    let windows = aggregate(&records, 15).expect("valid group aggregates");

    assert_eq!(windows.len(), 2);
    assert_eq!(windows[0].window_num, 1);
    assert_eq!(windows[0].record_count, 15);
    assert_eq!(windows[0].start_date, records[0].date);
    assert_eq!(windows[0].end_date, records[14].date);
    assert!(!windows[0].is_season_end);
    assert_eq!(windows[0].yield_value, None);

    assert_eq!(windows[1].window_num, 2);
    assert_eq!(windows[1].record_count, 22);
    assert_eq!(windows[1].start_date, records[15].date);
    assert_eq!(windows[1].end_date, records[36].date);
    assert!(windows[1].is_season_end);
    assert_eq!(windows[1].yield_value, Some(3.2));

    for window in &windows {
        assert_eq!(window.means.get(Covariate::Temperature2mMean), Some(20.0));
    }
}

#[test]
fn window_count_and_coverage_hold_for_all_lengths() {
    for window_size in 1..=16usize {
        for len in 1..=60usize {
            let records = rabi_group(len, 18.5, Some(1.0));
            let windows = aggregate(&records, window_size).expect("valid group aggregates");

            assert_eq!(windows.len(), len / window_size, "L={len} W={window_size}");
            if windows.is_empty() {
                continue;
            }

            let covered: usize = windows.iter().map(|w| w.record_count).sum();
            assert_eq!(covered, len, "L={len} W={window_size}");

            let nums: Vec<u32> = windows.iter().map(|w| w.window_num).collect();
            let expected: Vec<u32> = (1..=windows.len() as u32).collect();
            assert_eq!(nums, expected);

            let season_ends: Vec<u32> = windows
                .iter()
                .filter(|w| w.is_season_end)
                .map(|w| w.window_num)
                .collect();
            assert_eq!(season_ends, vec![windows.len() as u32]);

            let last = windows.last().expect("non-empty");
            assert!(last.record_count >= window_size && last.record_count < 2 * window_size);
        }
    }
}

#[test]
fn in_progress_season_still_produces_windows() {
    let windows = aggregate(&rabi_group(30, 21.0, None), 15).expect("valid group aggregates");
    assert_eq!(windows.len(), 2);
    assert!(windows[1].is_season_end);
    assert_eq!(windows[1].yield_value, None);
}

#[test]
fn unordered_records_are_rejected_not_repaired() {
    let mut records = rabi_group(20, 21.0, None);
    records.swap(3, 4);
    assert!(matches!(
        aggregate(&records, 5),
        Err(AggregateError::Record(RecordError::UnorderedDates { .. }))
    ));
}

#[test]
fn static_attributes_come_from_the_first_record_of_each_window() {
    let mut records = rabi_group(10, 21.0, None);
    records[0].statics.soil_type = "clay".to_string();
    records[5].statics.soil_type = "sandy".to_string();
    records[6].statics.soil_type = "silt".to_string();

    let windows = aggregate(&records, 5).expect("valid group aggregates");
    assert_eq!(windows[0].statics.soil_type, "clay");
    assert_eq!(windows[1].statics.soil_type, "sandy");
}

#[test]
fn rolling_features_are_sampled_at_window_ends() {
    let mut records = rabi_group(10, 0.0, None);
    for (i, record) in records.iter_mut().enumerate() {
        record
            .covariates
            .set(Covariate::Temperature2mMean, Some(i as f64));
    }
    let mut windows = aggregate(&records, 5).expect("valid group aggregates");
    attach_rolling(&mut windows, &records, &[3, 30]).expect("record counts line up");

    let value = |idx: usize, name: &str| {
        windows[idx]
            .rolling
            .iter()
            .find(|v| v.name == name)
            .map(|v| v.value)
    };
    // Window 1 ends at record 4: trailing 3 = mean(2, 3, 4).
    assert_eq!(value(0, "temp_3d_avg"), Some(3.0));
    // Only five records of history exist for the 30-day span.
    assert_eq!(value(0, "temp_30d_avg"), Some(2.0));
    assert_eq!(value(0, "precip_30d_sum"), Some(10.0));
    assert_eq!(value(1, "temp_3d_avg"), Some(8.0));
    assert_eq!(value(1, "precip_3d_sum"), Some(6.0));
}
