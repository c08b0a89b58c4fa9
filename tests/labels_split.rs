use std::collections::BTreeMap;

use chrono::{Duration, NaiveDate, NaiveDateTime};
use toxwatch::{
    add_future_max, apply_cutoffs, chronological_split, cutoff_column, future_max_column,
    rolling_column, FeatureTable, LabelConfig, RollingStat, RowKey, SplitConfig, SplitError,
};

fn start() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2017, 6, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .expect("valid start")
}

fn label_cfg(threshold: f64) -> LabelConfig {
    let mut thresholds = BTreeMap::new();
    thresholds.insert("toxin_a".to_string(), threshold);
    thresholds.insert("toxin_b".to_string(), 1.0);
    LabelConfig {
        horizon_hours: 1,
        samples_per_hour: 2,
        short_window_label: "30m".to_string(),
        thresholds,
    }
}

fn short_mean_table(devices: &[(&str, Vec<f64>)]) -> FeatureTable {
    let mut keys = Vec::new();
    let mut values = Vec::new();
    for (device, series) in devices {
        for (i, v) in series.iter().enumerate() {
            keys.push(RowKey::new(*device, start() + Duration::minutes(30 * i as i64)));
            values.push(Some(*v));
        }
    }
    let mut table = FeatureTable::new(keys);
    table
        .add_column(rolling_column("toxin_a", RollingStat::Mean, "30m"), values)
        .expect("short mean column");
    table
}

#[test]
fn future_max_starts_at_the_row_and_stays_within_the_device() {
    let mut table = short_mean_table(&[
        ("a", vec![1.0, 5.0, 2.0, 8.0, 3.0]),
        ("b", vec![9.0, 0.0]),
    ]);
    add_future_max(&mut table, &["toxin_a".to_string()], &label_cfg(4.9)).expect("future max");

    let future = table
        .column(&future_max_column("toxin_a"))
        .expect("future max column");
    assert_eq!(
        future,
        &[Some(5.0), Some(5.0), Some(8.0), Some(8.0), None, Some(9.0), None][..]
    );
}

#[test]
fn cutoff_is_strictly_greater_and_undefined_where_future_is() {
    let mut table = short_mean_table(&[("a", vec![1.0, 5.0, 2.0, 8.0, 3.0])]);
    let cfg = label_cfg(5.0);
    add_future_max(&mut table, &["toxin_a".to_string()], &cfg).expect("future max");

    // toxin_b has a threshold but no future max, so it is skipped.
    let added = apply_cutoffs(&mut table, &cfg).expect("cutoffs");
    assert_eq!(added, 1);
    assert!(!table.has_column(&cutoff_column("toxin_b")));

    let labels = table.column(&cutoff_column("toxin_a")).expect("labels");
    assert_eq!(labels, &[Some(0.0), Some(0.0), Some(1.0), Some(1.0), None][..]);
}

/// Two devices reporting on interleaved timestamps, labels alternating in
/// blocks so both classes appear everywhere.
fn staggered_table(rows_per_device: usize) -> FeatureTable {
    device_pair_table(rows_per_device, 5)
}

fn device_pair_table(rows_per_device: usize, south_offset_minutes: i64) -> FeatureTable {
    let mut keys = Vec::new();
    let mut readings = Vec::new();
    let mut labels = Vec::new();
    let mut future = Vec::new();
    for (device, offset) in [("north", 0), ("south", south_offset_minutes)] {
        for i in 0..rows_per_device {
            keys.push(RowKey::new(
                device,
                start() + Duration::minutes(15 * i as i64 + offset),
            ));
            readings.push(Some(i as f64));
            labels.push(Some(((i / 3) % 2) as f64));
            future.push(Some(i as f64 + 1.0));
        }
    }
    let mut table = FeatureTable::new(keys);
    table.add_column("toxin_a", readings).expect("readings");
    table
        .add_column(future_max_column("toxin_a"), future)
        .expect("future max");
    table
        .add_column(cutoff_column("toxin_a"), labels)
        .expect("labels");
    table
}

#[test]
fn split_is_chronological_with_a_discarded_gap() {
    let table = staggered_table(20);
    let cfg = SplitConfig {
        gap: 5,
        calibration_size: 10,
    };

    let split = chronological_split(&table, "toxin_a", &cfg).expect("split");

    assert_eq!(split.dropped_incomplete, 0);
    assert_eq!(split.train.len(), 25);
    assert_eq!(split.gap_bounds.rows, 5);
    assert_eq!(split.calibration.len(), 10);
    assert_eq!(split.features, vec!["toxin_a".to_string()]);

    let train_max = split.train.keys().iter().map(|k| k.timestamp).max();
    let calibration_min = split.calibration.keys().iter().map(|k| k.timestamp).min();
    assert!(train_max < calibration_min);
    assert_eq!(split.train_bounds.last, train_max);
    assert_eq!(split.calibration_bounds.first, calibration_min);

    // The most recent ten timestamps across both devices.
    let last = start() + Duration::minutes(15 * 19 + 5);
    assert_eq!(split.calibration_bounds.last, Some(last));
    assert_eq!(
        split.calibration_bounds.first,
        Some(start() + Duration::minutes(15 * 15))
    );
}

#[test]
fn shared_timestamps_never_straddle_a_segment_boundary() {
    // Both devices on the same 15-minute grid: sorted rows pair up per timestamp.
    let table = device_pair_table(20, 0);
    let split = chronological_split(
        &table,
        "toxin_a",
        &SplitConfig {
            gap: 4,
            calibration_size: 9,
        },
    )
    .expect("split");

    let at = |i: i64| Some(start() + Duration::minutes(15 * i));

    // Calibration keeps its exact size and starts with south at step 15; north
    // at step 15 is tied with it and dropped.
    assert_eq!(split.calibration.len(), 9);
    assert_eq!(split.boundary_ties, 1);
    assert_eq!(split.calibration_bounds.first, at(15));
    assert_eq!(split.calibration.key(0).device_id, "south");

    // The nominal gap would start on south at step 13; north at step 13 moves
    // out of training into the gap with it.
    assert_eq!(split.gap_bounds.rows, 4);
    assert_eq!(split.gap_bounds.first, at(13));
    assert_eq!(split.gap_bounds.last, at(14));
    assert_eq!(split.train.len(), 26);
    assert_eq!(split.train_bounds.last, at(12));

    assert!(split.train_bounds.last < split.gap_bounds.first);
    assert!(split.gap_bounds.last < split.calibration_bounds.first);
    assert_eq!(
        split.train.len() + split.gap_bounds.rows + split.boundary_ties + split.calibration.len(),
        40
    );
}

#[test]
fn incomplete_rows_are_dropped_before_counting() {
    let table = staggered_table(20);
    let mut readings: Vec<Option<f64>> = table.column("toxin_a").expect("readings").to_vec();
    readings[0] = None;

    let mut keys_only = FeatureTable::new(table.keys().to_vec());
    for column in table.columns() {
        let values = if column.name == "toxin_a" {
            readings.clone()
        } else {
            column.values.clone()
        };
        keys_only
            .add_column(column.name.clone(), values)
            .expect("copy column");
    }

    let split = chronological_split(
        &keys_only,
        "toxin_a",
        &SplitConfig {
            gap: 5,
            calibration_size: 10,
        },
    )
    .expect("split");
    assert_eq!(split.dropped_incomplete, 1);
    assert_eq!(split.train.len(), 24);
}

#[test]
fn oversized_gap_and_calibration_fail_fast() {
    let table = staggered_table(10);
    let err = chronological_split(
        &table,
        "toxin_a",
        &SplitConfig {
            gap: 15,
            calibration_size: 10,
        },
    )
    .unwrap_err();
    assert_eq!(
        err,
        SplitError::InsufficientRows {
            gap: 15,
            calibration_size: 10,
            available: 20,
        }
    );
}

#[test]
fn missing_label_column_is_reported() {
    let table = short_mean_table(&[("a", vec![1.0, 2.0])]);
    let err = chronological_split(&table, "toxin_a", &SplitConfig::default()).unwrap_err();
    assert_eq!(err, SplitError::MissingColumn(cutoff_column("toxin_a")));
}

#[test]
fn label_derived_columns_never_become_features() {
    let table = staggered_table(20);
    let split = chronological_split(
        &table,
        "toxin_a",
        &SplitConfig {
            gap: 0,
            calibration_size: 5,
        },
    )
    .expect("split");

    assert!(split
        .features
        .iter()
        .all(|f| !f.ends_with("_cutoff") && !f.ends_with("_future_max")));
}
