//! How early the ensemble detects the onset of each exceedance event.

use std::collections::BTreeMap;

use chrono::NaiveDateTime;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::ensemble::{ensemble_result_column, Outcome};
use crate::labels::cutoff_column;
use crate::table::{FeatureTable, TableError};

/// Offset recorded for events the ensemble never confirms.
pub const DEFAULT_MISSED_SENTINEL: usize = 32;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LatencyError {
    #[error("samples_per_hour must be > 0")]
    ZeroSamplesPerHour,
    #[error(transparent)]
    Table(#[from] TableError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectionOffset {
    pub device_id: String,
    pub event_start: NaiveDateTime,
    pub offset: usize,
    pub detected: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CdfPoint {
    pub offset: usize,
    pub count: usize,
    pub cumulative_percent: f64,
    pub hours_before_onset: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencySummary {
    pub events: usize,
    pub detected: usize,
    pub missed: usize,
    pub mean_detected_offset: Option<f64>,
}

impl LatencySummary {
    pub fn from_offsets(offsets: &[DetectionOffset]) -> Self {
        let detected: Vec<usize> = offsets
            .iter()
            .filter(|o| o.detected)
            .map(|o| o.offset)
            .collect();
        let mean_detected_offset = (!detected.is_empty())
            .then(|| detected.iter().sum::<usize>() as f64 / detected.len() as f64);
        Self {
            events: offsets.len(),
            detected: detected.len(),
            missed: offsets.len() - detected.len(),
            mean_detected_offset,
        }
    }
}

/// Rows where a run of positive labels begins within one device's sequence.
pub fn event_starts(labels: &[Option<f64>]) -> Vec<usize> {
    let positive = |i: usize| labels[i] == Some(1.0);
    (0..labels.len())
        .filter(|i| positive(*i) && (*i == 0 || !positive(i - 1)))
        .collect()
}

/// Rows from `start` to the first ensemble true positive inside the event that
/// begins there, or `None` when the event ends (or the device does) first.
pub fn offset_for_event(
    labels: &[Option<f64>],
    results: &[Option<f64>],
    start: usize,
) -> Option<usize> {
    (start..labels.len())
        .take_while(|j| labels[*j] == Some(1.0))
        .find(|j| results[*j] == Some(f64::from(Outcome::TruePositive.code())))
        .map(|j| j - start)
}

/// Detection offsets for every event in a scored table, in (device, time)
/// order. The table is re-sorted by device and time first.
pub fn detection_offsets(
    table: &mut FeatureTable,
    target: &str,
    missed_sentinel: usize,
) -> Result<Vec<DetectionOffset>, LatencyError> {
    table.sort_by_device_time();
    let labels = table.require(&cutoff_column(target))?;
    let results = table.require(&ensemble_result_column(target))?;
    let keys = table.keys();

    let per_device: Vec<Vec<DetectionOffset>> = table
        .partitions()
        .into_par_iter()
        .map(|p| {
            let labels = &labels[p.rows.clone()];
            let results = &results[p.rows.clone()];
            event_starts(labels)
                .into_iter()
                .map(|start| {
                    let found = offset_for_event(labels, results, start);
                    DetectionOffset {
                        device_id: p.device_id.clone(),
                        event_start: keys[p.rows.start + start].timestamp,
                        offset: found.unwrap_or(missed_sentinel),
                        detected: found.is_some(),
                    }
                })
                .collect()
        })
        .collect();

    let offsets: Vec<DetectionOffset> = per_device.into_iter().flatten().collect();
    let summary = LatencySummary::from_offsets(&offsets);
    info!(
        component = "latency",
        event = "latency.offsets.finish",
        pollutant = %target,
        events = summary.events,
        detected = summary.detected,
        missed = summary.missed,
        missed_sentinel = missed_sentinel
    );
    Ok(offsets)
}

pub fn offsets(detections: &[DetectionOffset]) -> Vec<usize> {
    detections.iter().map(|d| d.offset).collect()
}

/// Cumulative distribution of offsets, re-indexed to hours before onset.
pub fn offset_cdf(
    offsets: &[usize],
    missed_sentinel: usize,
    samples_per_hour: usize,
) -> Result<Vec<CdfPoint>, LatencyError> {
    if samples_per_hour == 0 {
        return Err(LatencyError::ZeroSamplesPerHour);
    }
    let mut counts: BTreeMap<usize, usize> = BTreeMap::new();
    for offset in offsets {
        *counts.entry(*offset).or_default() += 1;
    }

    let total = offsets.len() as f64;
    let mut cumulative = 0;
    Ok(counts
        .into_iter()
        .map(|(offset, count)| {
            cumulative += count;
            CdfPoint {
                offset,
                count,
                cumulative_percent: cumulative as f64 / total * 100.0,
                hours_before_onset: (missed_sentinel as f64 - offset as f64)
                    / samples_per_hour as f64,
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn col(values: &[f64]) -> Vec<Option<f64>> {
        values.iter().copied().map(Some).collect()
    }

    #[test]
    fn event_starts_follow_non_positive_rows() {
        let labels = col(&[1.0, 1.0, 0.0, 1.0, 0.0, 0.0, 1.0]);
        assert_eq!(event_starts(&labels), vec![0, 3, 6]);
        assert_eq!(event_starts(&[None, Some(1.0)]), vec![1]);
    }

    #[test]
    fn offset_counts_rows_to_first_confirmed_detection() {
        let labels = col(&[0.0, 1.0, 1.0, 1.0]);
        let results = col(&[0.0, -1.0, -1.0, 1.0]);
        assert_eq!(offset_for_event(&labels, &results, 1), Some(2));
        let missed = col(&[0.0, -1.0, -1.0, -1.0]);
        assert_eq!(offset_for_event(&labels, &missed, 1), None);
    }

    #[test]
    fn search_stops_at_the_end_of_the_event() {
        // A false positive after the event and a hit inside the next event
        // both lie outside the first event's span.
        let labels = col(&[1.0, 1.0, 0.0, 0.0, 1.0]);
        let results = col(&[-1.0, -1.0, 2.0, 0.0, 1.0]);
        assert_eq!(offset_for_event(&labels, &results, 0), None);
        assert_eq!(offset_for_event(&labels, &results, 4), Some(0));
    }

    #[test]
    fn cdf_ends_at_one_hundred_percent() {
        let cdf = offset_cdf(&[0, 0, 4, 32], 32, 4).expect("cdf");
        assert_eq!(cdf.len(), 3);
        assert_eq!(cdf[0].count, 2);
        assert_eq!(cdf[0].cumulative_percent, 50.0);
        assert_eq!(cdf[0].hours_before_onset, 8.0);
        assert_eq!(cdf[1].hours_before_onset, 7.0);
        assert_eq!(cdf[2].cumulative_percent, 100.0);
        assert_eq!(cdf[2].hours_before_onset, 0.0);
    }

    #[test]
    fn summary_separates_missed_events() {
        let ts = chrono::NaiveDate::from_ymd_opt(2017, 3, 1)
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .expect("timestamp");
        let make = |offset, detected| DetectionOffset {
            device_id: "a".to_string(),
            event_start: ts,
            offset,
            detected,
        };
        let summary = LatencySummary::from_offsets(&[make(2, true), make(4, true), make(32, false)]);
        assert_eq!(summary.events, 3);
        assert_eq!(summary.missed, 1);
        assert_eq!(summary.mean_detected_offset, Some(3.0));
    }
}
