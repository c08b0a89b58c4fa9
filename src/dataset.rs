//! CSV loading of device readings, device locations and daily weather, and the
//! left joins that assemble them into one [`FeatureTable`].

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use csv::StringRecord;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::table::{FeatureTable, RowKey, TableError};

pub const DEVICE_COLUMN: &str = "device_uuid";
pub const TIMESTAMP_COLUMN: &str = "timestamp";
pub const LOCATION_KEY_COLUMN: &str = "uuid";
pub const DATE_COLUMN: &str = "date";

pub const WEATHER_FIELDS: [&str; 9] = [
    "mean_temperature",
    "max_temperature",
    "min_temperature",
    "precipitation",
    "dew_point",
    "average_humidity",
    "maximum_humidity",
    "minimum_humidity",
    "wind_speed",
];

const TIMESTAMP_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"];

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("no readings files configured")]
    NoReadingsFiles,
    #[error("CSV error in {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("{path} has no {column} column")]
    MissingColumn { path: PathBuf, column: &'static str },
    #[error("{path} line {line}: invalid timestamp '{value}'")]
    InvalidTimestamp {
        path: PathBuf,
        line: u64,
        value: String,
    },
    #[error(transparent)]
    Table(#[from] TableError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetPaths {
    pub readings: Vec<PathBuf>,
    pub locations: Option<PathBuf>,
    pub weather: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadingsLoadReport {
    pub files: usize,
    pub rows_read: usize,
    pub duplicate_keys: usize,
    pub rows: usize,
    pub devices: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeatherLoadReport {
    pub rows_read: usize,
    pub dropped_empty: usize,
    pub dropped_unparseable: usize,
    pub days: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinReport {
    pub matched_rows: usize,
    pub unmatched_rows: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetLoadReport {
    pub readings: ReadingsLoadReport,
    pub locations: Option<JoinReport>,
    pub weather: Option<WeatherLoadReport>,
    pub weather_join: Option<JoinReport>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WeatherDay {
    pub date: NaiveDate,
    /// Parsed values in [`WEATHER_FIELDS`] order.
    pub values: Vec<f64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LocationTable {
    pub columns: Vec<String>,
    pub rows: HashMap<String, Vec<Option<f64>>>,
}

/// Keeps only ASCII digits and `.`: `"12°F"` becomes `"12"`.
pub fn normalize_weather_text(raw: &str) -> String {
    raw.chars().filter(|c| c.is_ascii_digit() || *c == '.').collect()
}

pub fn parse_weather_value(raw: &str) -> Option<f64> {
    let normalized = normalize_weather_text(raw);
    if normalized.is_empty() {
        return None;
    }
    normalized.parse::<f64>().ok()
}

pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    TIMESTAMP_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .or_else(|| {
            DateTime::parse_from_rfc3339(raw)
                .ok()
                .map(|dt| dt.naive_utc())
        })
}

fn parse_cell(raw: &str) -> Option<f64> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    raw.parse::<f64>().ok().filter(|v| v.is_finite())
}

fn open_reader(path: &Path) -> Result<csv::Reader<std::fs::File>, DatasetError> {
    csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::Headers)
        .from_path(path)
        .map_err(|source| DatasetError::Csv {
            path: path.to_path_buf(),
            source,
        })
}

fn read_headers(
    reader: &mut csv::Reader<std::fs::File>,
    path: &Path,
) -> Result<StringRecord, DatasetError> {
    reader
        .headers()
        .cloned()
        .map_err(|source| DatasetError::Csv {
            path: path.to_path_buf(),
            source,
        })
}

fn column_index(
    headers: &StringRecord,
    path: &Path,
    column: &'static str,
) -> Result<usize, DatasetError> {
    headers
        .iter()
        .position(|h| h == column)
        .ok_or_else(|| DatasetError::MissingColumn {
            path: path.to_path_buf(),
            column,
        })
}

/// Concatenates readings files keyed by (device, timestamp). Value columns are
/// the union across files; a duplicate key keeps the last row read.
pub fn load_readings(paths: &[PathBuf]) -> Result<(FeatureTable, ReadingsLoadReport), DatasetError> {
    if paths.is_empty() {
        return Err(DatasetError::NoReadingsFiles);
    }

    let mut columns: Vec<String> = Vec::new();
    let mut column_ids: HashMap<String, usize> = HashMap::new();
    let mut rows: BTreeMap<RowKey, Vec<(usize, Option<f64>)>> = BTreeMap::new();
    let mut report = ReadingsLoadReport {
        files: paths.len(),
        ..ReadingsLoadReport::default()
    };

    for path in paths {
        let mut reader = open_reader(path)?;
        let headers = read_headers(&mut reader, path)?;
        let device_idx = column_index(&headers, path, DEVICE_COLUMN)?;
        let timestamp_idx = column_index(&headers, path, TIMESTAMP_COLUMN)?;

        let value_columns: Vec<(usize, usize)> = headers
            .iter()
            .enumerate()
            .filter(|(idx, name)| {
                *idx != device_idx && *idx != timestamp_idx && !name.is_empty() && *name != DATE_COLUMN
            })
            .map(|(idx, name)| {
                let id = *column_ids.entry(name.to_string()).or_insert_with(|| {
                    columns.push(name.to_string());
                    columns.len() - 1
                });
                (idx, id)
            })
            .collect();

        let mut file_rows = 0usize;
        for record in reader.records() {
            let record = record.map_err(|source| DatasetError::Csv {
                path: path.clone(),
                source,
            })?;
            let line = record.position().map(|p| p.line()).unwrap_or_default();
            let raw_ts = record.get(timestamp_idx).unwrap_or_default();
            let timestamp = parse_timestamp(raw_ts).ok_or_else(|| DatasetError::InvalidTimestamp {
                path: path.clone(),
                line,
                value: raw_ts.to_string(),
            })?;
            let device_id = record.get(device_idx).unwrap_or_default().trim().to_string();

            let values = value_columns
                .iter()
                .map(|(idx, id)| (*id, record.get(*idx).and_then(parse_cell)))
                .collect();
            if rows.insert(RowKey::new(device_id, timestamp), values).is_some() {
                report.duplicate_keys += 1;
            }
            file_rows += 1;
        }
        report.rows_read += file_rows;

        info!(
            component = "dataset",
            event = "dataset.readings.file_loaded",
            path = %path.display(),
            rows = file_rows,
            value_columns = value_columns.len()
        );
    }

    let mut data: Vec<Vec<Option<f64>>> = vec![vec![None; rows.len()]; columns.len()];
    let mut keys = Vec::with_capacity(rows.len());
    for (row, (key, values)) in rows.into_iter().enumerate() {
        for (id, value) in values {
            data[id][row] = value;
        }
        keys.push(key);
    }

    let mut table = FeatureTable::new(keys);
    for (name, values) in columns.into_iter().zip(data) {
        table.add_column(name, values)?;
    }

    report.rows = table.len();
    report.devices = table.partitions().len();
    if report.duplicate_keys > 0 {
        warn!(
            component = "dataset",
            event = "dataset.readings.duplicates",
            duplicate_keys = report.duplicate_keys
        );
    }
    info!(
        component = "dataset",
        event = "dataset.readings.finish",
        files = report.files,
        rows = report.rows,
        devices = report.devices,
        column_count = table.columns().len()
    );

    Ok((table, report))
}

/// Device coordinates keyed by `uuid`; the last duplicate uuid wins.
pub fn load_locations(path: &Path) -> Result<LocationTable, DatasetError> {
    let mut reader = open_reader(path)?;
    let headers = read_headers(&mut reader, path)?;
    let key_idx = column_index(&headers, path, LOCATION_KEY_COLUMN)?;
    let value_columns: Vec<(usize, String)> = headers
        .iter()
        .enumerate()
        .filter(|(idx, name)| *idx != key_idx && !name.is_empty())
        .map(|(idx, name)| (idx, name.to_string()))
        .collect();

    let mut rows = HashMap::new();
    for record in reader.records() {
        let record = record.map_err(|source| DatasetError::Csv {
            path: path.to_path_buf(),
            source,
        })?;
        let key = record.get(key_idx).unwrap_or_default().trim().to_string();
        let values = value_columns
            .iter()
            .map(|(idx, _)| record.get(*idx).and_then(parse_cell))
            .collect();
        rows.insert(key, values);
    }

    Ok(LocationTable {
        columns: value_columns.into_iter().map(|(_, name)| name).collect(),
        rows,
    })
}

/// Daily weather. Rows with an empty raw field, an unparseable date or a value
/// that is empty after normalization are dropped and counted.
pub fn load_weather(path: &Path) -> Result<(Vec<WeatherDay>, WeatherLoadReport), DatasetError> {
    let mut reader = open_reader(path)?;
    let headers = read_headers(&mut reader, path)?;
    let date_idx = column_index(&headers, path, DATE_COLUMN)?;
    let field_idx = WEATHER_FIELDS
        .iter()
        .map(|field| column_index(&headers, path, field))
        .collect::<Result<Vec<_>, _>>()?;

    let mut report = WeatherLoadReport::default();
    let mut days: BTreeMap<NaiveDate, Vec<f64>> = BTreeMap::new();
    for record in reader.records() {
        let record = record.map_err(|source| DatasetError::Csv {
            path: path.to_path_buf(),
            source,
        })?;
        report.rows_read += 1;

        let raw: Vec<&str> = field_idx
            .iter()
            .map(|idx| record.get(*idx).unwrap_or_default().trim())
            .collect();
        if raw.iter().any(|v| v.is_empty()) {
            report.dropped_empty += 1;
            continue;
        }

        let date = NaiveDate::parse_from_str(record.get(date_idx).unwrap_or_default().trim(), "%Y-%m-%d");
        let values: Option<Vec<f64>> = raw.iter().map(|v| parse_weather_value(v)).collect();
        match (date, values) {
            (Ok(date), Some(values)) => {
                days.insert(date, values);
            }
            _ => report.dropped_unparseable += 1,
        }
    }

    report.days = days.len();
    if report.dropped_empty + report.dropped_unparseable > 0 {
        warn!(
            component = "dataset",
            event = "dataset.weather.rows_dropped",
            path = %path.display(),
            dropped_empty = report.dropped_empty,
            dropped_unparseable = report.dropped_unparseable
        );
    }
    info!(
        component = "dataset",
        event = "dataset.weather.finish",
        path = %path.display(),
        days = report.days
    );

    Ok((
        days.into_iter()
            .map(|(date, values)| WeatherDay { date, values })
            .collect(),
        report,
    ))
}

/// Left join on device id. Unmatched devices get undefined coordinates.
pub fn join_locations(
    table: &mut FeatureTable,
    locations: &LocationTable,
) -> Result<JoinReport, DatasetError> {
    let matches: Vec<Option<&Vec<Option<f64>>>> = table
        .keys()
        .iter()
        .map(|key| locations.rows.get(&key.device_id))
        .collect();
    let report = join_report(&matches);

    let mut new_columns = Vec::with_capacity(locations.columns.len());
    for (col, name) in locations.columns.iter().enumerate() {
        let values = matches
            .iter()
            .map(|m| m.and_then(|values| values[col]))
            .collect();
        new_columns.push((name.clone(), values));
    }
    for (name, values) in new_columns {
        table.add_column(name, values)?;
    }

    log_join("locations", &report);
    Ok(report)
}

/// Left join on the calendar date of each row's timestamp.
pub fn join_weather(table: &mut FeatureTable, days: &[WeatherDay]) -> Result<JoinReport, DatasetError> {
    let by_date: HashMap<NaiveDate, &WeatherDay> = days.iter().map(|d| (d.date, d)).collect();
    let matches: Vec<Option<&WeatherDay>> = table
        .keys()
        .iter()
        .map(|key| by_date.get(&key.timestamp.date()).copied())
        .collect();
    let report = join_report(&matches);

    for (col, name) in WEATHER_FIELDS.iter().enumerate() {
        let values = matches
            .iter()
            .map(|m| m.map(|day| day.values[col]))
            .collect();
        table.add_column(*name, values)?;
    }

    log_join("weather", &report);
    Ok(report)
}

fn join_report<T>(matches: &[Option<T>]) -> JoinReport {
    let matched_rows = matches.iter().filter(|m| m.is_some()).count();
    JoinReport {
        matched_rows,
        unmatched_rows: matches.len() - matched_rows,
    }
}

fn log_join(source: &'static str, report: &JoinReport) {
    if report.unmatched_rows > 0 {
        warn!(
            component = "dataset",
            event = "dataset.join.unmatched",
            source = source,
            matched_rows = report.matched_rows,
            unmatched_rows = report.unmatched_rows
        );
    } else {
        info!(
            component = "dataset",
            event = "dataset.join.finish",
            source = source,
            matched_rows = report.matched_rows
        );
    }
}

/// Readings plus the optional location and weather joins.
pub fn load_dataset(paths: &DatasetPaths) -> Result<(FeatureTable, DatasetLoadReport), DatasetError> {
    let (mut table, readings) = load_readings(&paths.readings)?;
    let mut report = DatasetLoadReport {
        readings,
        ..DatasetLoadReport::default()
    };

    if let Some(path) = &paths.locations {
        let locations = load_locations(path)?;
        report.locations = Some(join_locations(&mut table, &locations)?);
    }
    if let Some(path) = &paths.weather {
        let (days, weather) = load_weather(path)?;
        report.weather = Some(weather);
        report.weather_join = Some(join_weather(&mut table, &days)?);
    }

    Ok((table, report))
}
