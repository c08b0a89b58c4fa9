//! Forward-looking exceedance labels.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::features::{rolling_column, RollingStat};
use crate::table::{FeatureTable, TableError};
use crate::window;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LabelConfig {
    pub horizon_hours: usize,
    pub samples_per_hour: usize,
    /// Label of the rolling window whose mean feeds the future max.
    pub short_window_label: String,
    pub thresholds: BTreeMap<String, f64>,
}

impl Default for LabelConfig {
    fn default() -> Self {
        let mut thresholds = BTreeMap::new();
        thresholds.insert("toxin_a".to_string(), 1359.64);
        thresholds.insert("toxin_b".to_string(), 2000.0);
        thresholds.insert("toxin_c".to_string(), 37.43);
        Self {
            horizon_hours: 8,
            samples_per_hour: 4,
            short_window_label: "1h".to_string(),
            thresholds,
        }
    }
}

impl LabelConfig {
    pub fn horizon_samples(&self) -> usize {
        self.horizon_hours * self.samples_per_hour
    }
}

#[derive(Debug, Error)]
pub enum LabelError {
    #[error("invalid label config: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Table(#[from] TableError),
}

pub fn future_max_column(pollutant: &str) -> String {
    format!("{pollutant}_future_max")
}

pub fn cutoff_column(pollutant: &str) -> String {
    format!("{pollutant}_cutoff")
}

pub fn validate_label_config(cfg: &LabelConfig) -> Result<(), LabelError> {
    if cfg.horizon_samples() == 0 {
        return Err(LabelError::InvalidConfig(
            "horizon_hours and samples_per_hour must be > 0".to_string(),
        ));
    }
    if let Some((pollutant, _)) = cfg.thresholds.iter().find(|(_, t)| !t.is_finite()) {
        return Err(LabelError::InvalidConfig(format!(
            "threshold for {pollutant} must be finite"
        )));
    }
    Ok(())
}

/// Binary label for one row: 1 iff the future max strictly exceeds the threshold.
pub fn label_from_future_max(future_max: Option<f64>, threshold: f64) -> Option<f64> {
    future_max.map(|v| if v > threshold { 1.0 } else { 0.0 })
}

/// Maximum of the short-window rolling mean over the horizon starting at each row.
pub fn add_future_max(
    table: &mut FeatureTable,
    pollutants: &[String],
    cfg: &LabelConfig,
) -> Result<(), LabelError> {
    validate_label_config(cfg)?;
    let horizon = cfg.horizon_samples();

    for pollutant in pollutants {
        let source = rolling_column(pollutant, RollingStat::Mean, &cfg.short_window_label);
        let values = table.map_partitions(&source, |s| window::forward_max(s, horizon))?;
        let undefined = values.iter().filter(|v| v.is_none()).count();
        table.add_column(future_max_column(pollutant), values)?;

        info!(
            component = "labels",
            event = "labels.future_max.finish",
            pollutant = %pollutant,
            horizon_samples = horizon,
            undefined_rows = undefined
        );
    }
    Ok(())
}

/// Thresholds every configured pollutant's future max into `<pollutant>_cutoff`.
pub fn apply_cutoffs(table: &mut FeatureTable, cfg: &LabelConfig) -> Result<usize, LabelError> {
    let mut added = 0;
    for (pollutant, threshold) in &cfg.thresholds {
        let Some(future_max) = table.column(&future_max_column(pollutant)) else {
            warn!(
                component = "labels",
                event = "labels.cutoff.skipped",
                pollutant = %pollutant,
                reason = "missing_future_max"
            );
            continue;
        };

        let labels: Vec<Option<f64>> = future_max
            .iter()
            .map(|v| label_from_future_max(*v, *threshold))
            .collect();
        let positives = labels.iter().filter(|v| **v == Some(1.0)).count();
        table.add_column(cutoff_column(pollutant), labels)?;
        added += 1;

        info!(
            component = "labels",
            event = "labels.cutoff.finish",
            pollutant = %pollutant,
            threshold = *threshold,
            positive_rows = positives
        );
    }
    Ok(added)
}

pub fn build_labels(
    table: &mut FeatureTable,
    pollutants: &[String],
    cfg: &LabelConfig,
) -> Result<(), LabelError> {
    add_future_max(table, pollutants, cfg)?;
    apply_cutoffs(table, cfg)?;
    Ok(())
}
