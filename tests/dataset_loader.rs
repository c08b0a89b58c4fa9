use std::fs;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use tempfile::TempDir;
use toxwatch::{
    load_dataset, load_readings, load_weather, DatasetError, DatasetPaths, WEATHER_FIELDS,
};

fn write(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, body).expect("fixture written");
    path
}

const WEATHER_HEADER: &str = "date,mean_temperature,max_temperature,min_temperature,precipitation,dew_point,average_humidity,maximum_humidity,minimum_humidity,wind_speed";

#[test]
fn readings_files_are_concatenated_and_last_duplicate_wins() {
    let dir = TempDir::new().expect("temp dir");
    let first = write(
        dir.path(),
        "type_a.csv",
        "device_uuid,timestamp,date,toxin_a,toxin_b\n\
         dev-2,2017-03-01 00:15:00,2017-03-01,2.0,\n\
         dev-1,2017-03-01 00:00:00,2017-03-01,1.0,10.0\n\
         dev-1,2017-03-01 00:15:00,2017-03-01,bad,11.0\n",
    );
    let second = write(
        dir.path(),
        "type_b.csv",
        "timestamp,device_uuid,toxin_c\n\
         2017-03-01T00:15:00,dev-1,7.5\n",
    );

    let (table, report) = load_readings(&[first, second]).expect("readings load");

    assert_eq!(report.files, 2);
    assert_eq!(report.rows_read, 4);
    assert_eq!(report.duplicate_keys, 1);
    assert_eq!(report.rows, 3);
    assert_eq!(report.devices, 2);
    assert!(!table.has_column("date"));
    assert_eq!(table.column_names(), vec!["toxin_a", "toxin_b", "toxin_c"]);

    // Sorted by device then time; the second file replaced dev-1 00:15.
    assert_eq!(table.key(0).device_id, "dev-1");
    assert_eq!(table.column("toxin_a").expect("a"), &[Some(1.0), None, Some(2.0)][..]);
    assert_eq!(table.column("toxin_b").expect("b"), &[Some(10.0), None, None][..]);
    assert_eq!(table.column("toxin_c").expect("c"), &[None, Some(7.5), None][..]);
}

#[test]
fn readings_without_key_columns_are_rejected() {
    let dir = TempDir::new().expect("temp dir");
    let path = write(dir.path(), "bad.csv", "uuid,timestamp,toxin_a\nx,2017-03-01 00:00:00,1\n");
    assert!(matches!(
        load_readings(&[path]),
        Err(DatasetError::MissingColumn {
            column: "device_uuid",
            ..
        })
    ));
}

#[test]
fn malformed_timestamp_is_an_error() {
    let dir = TempDir::new().expect("temp dir");
    let path = write(
        dir.path(),
        "bad_ts.csv",
        "device_uuid,timestamp,toxin_a\nx,01/03/2017,1\n",
    );
    assert!(matches!(
        load_readings(&[path]),
        Err(DatasetError::InvalidTimestamp { .. })
    ));
}

#[test]
fn weather_rows_with_empty_or_unparseable_fields_are_dropped() {
    let dir = TempDir::new().expect("temp dir");
    let path = write(
        dir.path(),
        "weather.csv",
        &format!(
            "{WEATHER_HEADER}\n\
             2017-03-01,50 °F,60 °F,40 °F,0.1 in,30 °F,70 %,90 %,50 %,5 mph\n\
             2017-03-02,51 °F,,40 °F,0.1 in,30 °F,70 %,90 %,50 %,5 mph\n\
             2017-03-03,T,60 °F,40 °F,0.1 in,30 °F,70 %,90 %,50 %,5 mph\n"
        ),
    );

    let (days, report) = load_weather(&path).expect("weather loads");
    assert_eq!(report.rows_read, 3);
    assert_eq!(report.dropped_empty, 1);
    assert_eq!(report.dropped_unparseable, 1);
    assert_eq!(days.len(), 1);
    assert_eq!(days[0].date, NaiveDate::from_ymd_opt(2017, 3, 1).expect("date"));
    assert_eq!(days[0].values, vec![50.0, 60.0, 40.0, 0.1, 30.0, 70.0, 90.0, 50.0, 5.0]);
}

#[test]
fn joins_are_left_joins_with_undefined_for_missing_keys() {
    let dir = TempDir::new().expect("temp dir");
    let readings = write(
        dir.path(),
        "readings.csv",
        "device_uuid,timestamp,toxin_a\n\
         dev-1,2017-03-01 23:45:00,1\n\
         dev-1,2017-03-02 00:00:00,2\n\
         dev-9,2017-03-01 12:00:00,3\n",
    );
    let locations = write(
        dir.path(),
        "locations.csv",
        "uuid,latitude,longitude\n\
         dev-1,0.0,0.0\n\
         dev-1,37.77,-122.42\n",
    );
    let weather = write(
        dir.path(),
        "weather.csv",
        &format!("{WEATHER_HEADER}\n2017-03-01,50,60,40,0.1,30,70,90,50,5\n"),
    );

    let (table, report) = load_dataset(&DatasetPaths {
        readings: vec![readings],
        locations: Some(locations),
        weather: Some(weather),
    })
    .expect("dataset loads");

    let location_join = report.locations.expect("location join report");
    assert_eq!(location_join.matched_rows, 2);
    assert_eq!(location_join.unmatched_rows, 1);
    assert_eq!(
        table.column("latitude").expect("latitude"),
        &[Some(37.77), Some(37.77), None][..]
    );

    let weather_join = report.weather_join.expect("weather join report");
    assert_eq!(weather_join.matched_rows, 2);
    assert_eq!(weather_join.unmatched_rows, 1);
    for field in WEATHER_FIELDS {
        assert!(table.has_column(field));
    }
    assert_eq!(
        table.column("mean_temperature").expect("temperature"),
        &[Some(50.0), None, Some(50.0)][..]
    );
}
