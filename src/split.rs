//! Chronological train / calibration split and leakage-safe feature selection.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::features::{DAY_COLUMN, TIME_OF_DAY_COLUMN};
use crate::labels::{cutoff_column, future_max_column};
use crate::table::FeatureTable;

/// Substrings identifying joined weather columns.
pub const WEATHER_MARKERS: [&str; 5] = ["tempe", "humidi", "wind", "precip", "dew"];

const LEAKAGE_SUFFIXES: [&str; 2] = ["_cutoff", "_future_max"];
const SCORING_MARKERS: [&str; 2] = ["_prediction_", "_result_"];
const SCORING_SUFFIXES: [&str; 3] = ["_ensemble_score", "_ensemble_pred", "_ensemble_result"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SplitConfig {
    pub gap: usize,
    pub calibration_size: usize,
}

impl Default for SplitConfig {
    fn default() -> Self {
        Self {
            gap: 20_000,
            calibration_size: 50_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentBounds {
    pub rows: usize,
    pub first: Option<NaiveDateTime>,
    pub last: Option<NaiveDateTime>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChronologicalSplit {
    pub train: FeatureTable,
    pub calibration: FeatureTable,
    pub features: Vec<String>,
    pub dropped_incomplete: usize,
    /// Rows sharing the calibration's first timestamp that fell before it.
    pub boundary_ties: usize,
    pub train_bounds: SegmentBounds,
    pub gap_bounds: SegmentBounds,
    pub calibration_bounds: SegmentBounds,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SplitError {
    #[error("column {0} required for the split is missing")]
    MissingColumn(String),
    #[error("gap ({gap}) + calibration_size ({calibration_size}) exceeds the {available} complete rows")]
    InsufficientRows {
        gap: usize,
        calibration_size: usize,
        available: usize,
    },
    #[error("calibration_size must be > 0")]
    EmptyCalibration,
    #[error("no feature columns selected for {0}")]
    EmptyFeatureSet(String),
    #[error("label-derived column {0} survived feature selection")]
    LeakageColumn(String),
}

/// True for label-derived and scoring columns that must never be features.
pub fn is_leakage_column(name: &str) -> bool {
    LEAKAGE_SUFFIXES.iter().any(|s| name.ends_with(s))
        || SCORING_MARKERS.iter().any(|m| name.contains(m))
        || SCORING_SUFFIXES.iter().any(|s| name.ends_with(s))
}

/// Target pollutant columns, weather columns and the time-context pair, in
/// table order, minus every label-derived column.
pub fn select_features(columns: &[&str], target: &str) -> Result<Vec<String>, SplitError> {
    let mut selected: Vec<String> = Vec::new();
    let mut push = |name: &str| {
        if !selected.iter().any(|s| s == name) {
            selected.push(name.to_string());
        }
    };

    for name in columns.iter().filter(|c| c.contains(target)) {
        push(*name);
    }
    for marker in WEATHER_MARKERS {
        for name in columns.iter().filter(|c| c.contains(marker)) {
            push(*name);
        }
    }
    for name in [DAY_COLUMN, TIME_OF_DAY_COLUMN] {
        if columns.contains(&name) {
            push(name);
        }
    }

    selected.retain(|name| !is_leakage_column(name));

    let target_leaks = [cutoff_column(target), future_max_column(target)];
    if let Some(leak) = selected.iter().find(|name| target_leaks.contains(*name)) {
        return Err(SplitError::LeakageColumn(leak.clone()));
    }
    if selected.is_empty() {
        return Err(SplitError::EmptyFeatureSet(target.to_string()));
    }
    Ok(selected)
}

/// Drops incomplete rows, orders by time and carves off the most recent
/// `calibration_size` rows, discarding the `gap` rows before them.
///
/// Segment boundaries never split a timestamp. Rows tied with the first
/// calibration timestamp but sorted ahead of it are dropped, and training rows
/// tied with the first gap timestamp move into the gap, so every train
/// timestamp is strictly before every gap timestamp, which is strictly before
/// every calibration timestamp.
pub fn chronological_split(
    table: &FeatureTable,
    target: &str,
    cfg: &SplitConfig,
) -> Result<ChronologicalSplit, SplitError> {
    let label = cutoff_column(target);
    if !table.has_column(&label) {
        return Err(SplitError::MissingColumn(label));
    }
    if cfg.calibration_size == 0 {
        return Err(SplitError::EmptyCalibration);
    }

    let features = select_features(&table.column_names(), target)?;

    let (mut complete, dropped_incomplete) = table.drop_incomplete_rows();
    complete.sort_by_time();

    let available = complete.len();
    let needed = cfg.gap + cfg.calibration_size;
    if needed > available {
        return Err(SplitError::InsufficientRows {
            gap: cfg.gap,
            calibration_size: cfg.calibration_size,
            available,
        });
    }

    let at = |row: usize| complete.key(row).timestamp;
    let calibration_start = available - cfg.calibration_size;
    let calibration_first = at(calibration_start);
    let mut gap_end = calibration_start;
    while gap_end > 0 && at(gap_end - 1) == calibration_first {
        gap_end -= 1;
    }
    let boundary_ties = calibration_start - gap_end;

    let mut train_end = (available - needed).min(gap_end);
    if train_end < gap_end {
        let gap_first = at(train_end);
        while train_end > 0 && at(train_end - 1) == gap_first {
            train_end -= 1;
        }
    }

    let train_rows: Vec<usize> = (0..train_end).collect();
    let calibration_rows: Vec<usize> = (calibration_start..available).collect();

    let split = ChronologicalSplit {
        train_bounds: bounds(&complete, 0..train_end),
        gap_bounds: bounds(&complete, train_end..gap_end),
        calibration_bounds: bounds(&complete, calibration_start..available),
        train: complete.take(&train_rows),
        calibration: complete.take(&calibration_rows),
        features,
        dropped_incomplete,
        boundary_ties,
    };

    info!(
        component = "split",
        event = "split.finish",
        pollutant = %target,
        dropped_incomplete = dropped_incomplete,
        train_rows = split.train.len(),
        gap_rows = split.gap_bounds.rows,
        boundary_ties = boundary_ties,
        calibration_rows = split.calibration.len(),
        feature_count = split.features.len()
    );

    Ok(split)
}

fn bounds(table: &FeatureTable, rows: std::ops::Range<usize>) -> SegmentBounds {
    SegmentBounds {
        rows: rows.len(),
        first: rows.clone().next().map(|r| table.key(r).timestamp),
        last: rows.last().map(|r| table.key(r).timestamp),
    }
}
