//! Per-device feature builders and the feature schema fingerprint.

use std::collections::HashSet;

use chrono::{Datelike, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::info;

use crate::table::{FeatureTable, TableError};
use crate::window;

pub const FEATURE_SCHEMA_VERSION: u32 = 1;

pub const DEFAULT_POLLUTANTS: [&str; 5] = ["toxin_a", "toxin_b", "toxin_c", "toxin_d", "toxin_e"];

pub const DAY_COLUMN: &str = "day";
pub const TIME_OF_DAY_COLUMN: &str = "time_of_day";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollingWindow {
    pub samples: usize,
    pub label: String,
}

impl RollingWindow {
    pub fn new(samples: usize, label: impl Into<String>) -> Self {
        Self {
            samples,
            label: label.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureConfig {
    pub pollutants: Vec<String>,
    pub rolling_windows: Vec<RollingWindow>,
    pub derivative_window: usize,
    pub long_window: usize,
    pub time_zone: String,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            pollutants: DEFAULT_POLLUTANTS.iter().map(|p| p.to_string()).collect(),
            rolling_windows: vec![
                RollingWindow::new(4, "1h"),
                RollingWindow::new(16, "4h"),
                RollingWindow::new(32, "8h"),
            ],
            derivative_window: 10,
            long_window: 96,
            time_zone: "UTC".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSchema {
    pub version: u32,
    pub fingerprint: String,
    pub columns: Vec<String>,
}

#[derive(Debug, Error)]
pub enum FeatureError {
    #[error("invalid feature config: {0}")]
    InvalidConfig(String),
    #[error("unknown time zone: {0}")]
    UnknownTimeZone(String),
    #[error(transparent)]
    Table(#[from] TableError),
    #[error("schema version mismatch: expected {expected}, got {actual}")]
    SchemaVersionMismatch { expected: u32, actual: u32 },
    #[error("schema fingerprint mismatch: expected {expected}, got {actual}")]
    SchemaFingerprintMismatch { expected: String, actual: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollingStat {
    Mean,
    Median,
    Std,
}

impl RollingStat {
    fn suffix(self) -> &'static str {
        match self {
            Self::Mean => "mn",
            Self::Median => "md",
            Self::Std => "std",
        }
    }

    fn apply(self, values: &[Option<f64>], window: usize) -> Vec<Option<f64>> {
        match self {
            Self::Mean => window::rolling_mean(values, window),
            Self::Median => window::rolling_median(values, window),
            Self::Std => window::rolling_std(values, window),
        }
    }
}

const ROLLING_STATS: [RollingStat; 3] = [RollingStat::Mean, RollingStat::Median, RollingStat::Std];

pub fn rolling_column(pollutant: &str, stat: RollingStat, label: &str) -> String {
    format!("{pollutant}_roll_{}_{label}", stat.suffix())
}

pub fn pct_change_column(pollutant: &str) -> String {
    format!("{pollutant}_1_period_change")
}

pub fn derivative_column(pollutant: &str, stat: RollingStat) -> String {
    format!("{pollutant}_1_period_{}", stat.suffix())
}

pub fn daily_max_column(pollutant: &str) -> String {
    format!("{pollutant}_daily_roll_max")
}

pub fn validate_feature_config(cfg: &FeatureConfig) -> Result<(), FeatureError> {
    if cfg.pollutants.is_empty() {
        return Err(FeatureError::InvalidConfig(
            "pollutants must not be empty".to_string(),
        ));
    }
    if cfg.derivative_window == 0 || cfg.long_window == 0 {
        return Err(FeatureError::InvalidConfig(
            "derivative_window and long_window must be > 0".to_string(),
        ));
    }

    let mut samples = HashSet::new();
    let mut labels = HashSet::new();
    for w in &cfg.rolling_windows {
        if w.samples == 0 {
            return Err(FeatureError::InvalidConfig(
                "rolling window sample counts must be > 0".to_string(),
            ));
        }
        if w.label.trim().is_empty() {
            return Err(FeatureError::InvalidConfig(
                "rolling window labels must not be empty".to_string(),
            ));
        }
        if !samples.insert(w.samples) || !labels.insert(w.label.as_str()) {
            return Err(FeatureError::InvalidConfig(
                "rolling windows must be unique".to_string(),
            ));
        }
    }

    parse_time_zone(&cfg.time_zone)?;
    Ok(())
}

pub fn parse_time_zone(raw: &str) -> Result<Tz, FeatureError> {
    raw.trim()
        .parse::<Tz>()
        .map_err(|_| FeatureError::UnknownTimeZone(raw.to_string()))
}

/// Trailing mean, median and standard deviation per pollutant and window.
pub fn add_rolling_stats(table: &mut FeatureTable, cfg: &FeatureConfig) -> Result<usize, FeatureError> {
    let mut added = 0;
    for w in &cfg.rolling_windows {
        for pollutant in &cfg.pollutants {
            for stat in ROLLING_STATS {
                let values = table.map_partitions(pollutant, |s| stat.apply(s, w.samples))?;
                table.add_column(rolling_column(pollutant, stat, &w.label), values)?;
                added += 1;
            }
        }
    }

    info!(
        component = "features",
        event = "features.rolling.finish",
        windows = ?cfg.rolling_windows.iter().map(|w| w.samples).collect::<Vec<_>>(),
        columns_added = added
    );
    Ok(added)
}

/// One-period percent change and its rolling statistics.
pub fn add_derivative_stats(
    table: &mut FeatureTable,
    cfg: &FeatureConfig,
) -> Result<usize, FeatureError> {
    let mut added = 0;
    for pollutant in &cfg.pollutants {
        let change = table.map_partitions(pollutant, window::pct_change)?;
        let change_name = pct_change_column(pollutant);
        table.add_column(change_name.clone(), change)?;
        added += 1;

        for stat in ROLLING_STATS {
            let values =
                table.map_partitions(&change_name, |s| stat.apply(s, cfg.derivative_window))?;
            table.add_column(derivative_column(pollutant, stat), values)?;
            added += 1;
        }
    }

    info!(
        component = "features",
        event = "features.derivative.finish",
        window = cfg.derivative_window,
        columns_added = added
    );
    Ok(added)
}

/// Trailing maximum over the long (nominally 24h) window.
pub fn add_long_term_stats(
    table: &mut FeatureTable,
    cfg: &FeatureConfig,
) -> Result<usize, FeatureError> {
    for pollutant in &cfg.pollutants {
        let values = table.map_partitions(pollutant, |s| window::rolling_max(s, cfg.long_window))?;
        table.add_column(daily_max_column(pollutant), values)?;
    }

    info!(
        component = "features",
        event = "features.long_term.finish",
        window = cfg.long_window,
        columns_added = cfg.pollutants.len()
    );
    Ok(cfg.pollutants.len())
}

/// Day of week (0 = Monday) and hour of day, in the configured zone.
pub fn add_time_features(table: &mut FeatureTable, cfg: &FeatureConfig) -> Result<(), FeatureError> {
    let tz = parse_time_zone(&cfg.time_zone)?;
    let (days, hours): (Vec<Option<f64>>, Vec<Option<f64>>) = table
        .keys()
        .iter()
        .map(|key| {
            let local = Utc.from_utc_datetime(&key.timestamp).with_timezone(&tz);
            (
                Some(f64::from(local.weekday().num_days_from_monday())),
                Some(f64::from(local.hour())),
            )
        })
        .unzip();

    table.add_column(DAY_COLUMN, days)?;
    table.add_column(TIME_OF_DAY_COLUMN, hours)?;
    Ok(())
}

/// Runs every feature builder in order.
pub fn build_features(table: &mut FeatureTable, cfg: &FeatureConfig) -> Result<(), FeatureError> {
    validate_feature_config(cfg)?;
    table.sort_by_device_time();

    info!(
        component = "features",
        event = "features.build.start",
        rows = table.len(),
        devices = table.partitions().len(),
        pollutants = ?cfg.pollutants
    );

    add_rolling_stats(table, cfg)?;
    add_derivative_stats(table, cfg)?;
    add_long_term_stats(table, cfg)?;
    add_time_features(table, cfg)?;

    info!(
        component = "features",
        event = "features.build.finish",
        rows = table.len(),
        column_count = table.columns().len()
    );
    Ok(())
}

pub fn build_feature_schema(columns: &[String]) -> FeatureSchema {
    let fingerprint = schema_fingerprint(FEATURE_SCHEMA_VERSION, columns);
    FeatureSchema {
        version: FEATURE_SCHEMA_VERSION,
        fingerprint,
        columns: columns.to_vec(),
    }
}

pub fn assert_schema_compatible(
    expected: &FeatureSchema,
    actual: &FeatureSchema,
) -> Result<(), FeatureError> {
    if expected.version != actual.version {
        return Err(FeatureError::SchemaVersionMismatch {
            expected: expected.version,
            actual: actual.version,
        });
    }

    if expected.fingerprint != actual.fingerprint {
        return Err(FeatureError::SchemaFingerprintMismatch {
            expected: expected.fingerprint.clone(),
            actual: actual.fingerprint.clone(),
        });
    }

    Ok(())
}

fn schema_fingerprint(version: u32, columns: &[String]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("version:{version};"));
    hasher.update("columns:");
    for column in columns {
        hasher.update(column.as_bytes());
        hasher.update(":f64;");
    }
    hex::encode(hasher.finalize())
}
