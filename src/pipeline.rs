//! End-to-end run: features, labels, split, ensemble, scoring, latency and
//! output files.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;
use tracing::info;

use crate::classifier::{BinaryClassifier, GradientBoostedTrees};
use crate::config::{ConfigError, PipelineConfig};
use crate::dataset::{load_dataset, DatasetError, DatasetLoadReport, DEVICE_COLUMN, TIMESTAMP_COLUMN};
use crate::ensemble::{
    ensemble_pred_column, ensemble_result_column, ensemble_score_column, prediction_column,
    result_column, score_calibration, train_ensemble, EnsembleError, ScoreSummary,
    TrainedEnsemble,
};
use crate::features::{build_features, FeatureError};
use crate::labels::{build_labels, cutoff_column, future_max_column, LabelError};
use crate::latency::{
    detection_offsets, offset_cdf, offsets, CdfPoint, DetectionOffset, LatencyError,
    LatencySummary,
};
use crate::split::{chronological_split, SegmentBounds, SplitError};
use crate::table::{FeatureTable, TableError};

pub const SCORED_CALIBRATION_FILE: &str = "calibration_scored.csv";
pub const DETECTION_OFFSETS_FILE: &str = "detection_offsets.csv";
pub const OFFSET_CDF_FILE: &str = "offset_cdf.csv";
pub const REPORT_FILE: &str = "report.json";

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Dataset(#[from] DatasetError),
    #[error(transparent)]
    Feature(#[from] FeatureError),
    #[error(transparent)]
    Label(#[from] LabelError),
    #[error(transparent)]
    Split(#[from] SplitError),
    #[error(transparent)]
    Ensemble(#[from] EnsembleError),
    #[error(transparent)]
    Latency(#[from] LatencyError),
    #[error(transparent)]
    Table(#[from] TableError),
    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineReport {
    pub target: String,
    pub input_rows: usize,
    pub dropped_incomplete: usize,
    pub boundary_ties: usize,
    pub train: SegmentBounds,
    pub gap: SegmentBounds,
    pub calibration: SegmentBounds,
    pub feature_count: usize,
    pub feature_fingerprint: String,
    pub folds: usize,
    pub score: ScoreSummary,
    pub latency: LatencySummary,
    pub dataset: Option<DatasetLoadReport>,
}

#[derive(Debug)]
pub struct PipelineOutput<M> {
    pub trained: TrainedEnsemble<M>,
    pub calibration: FeatureTable,
    pub offsets: Vec<DetectionOffset>,
    pub cdf: Vec<CdfPoint>,
    pub report: PipelineReport,
}

/// Feature builders followed by the label generator, in place.
pub fn prepare_labeled_table(
    table: &mut FeatureTable,
    cfg: &PipelineConfig,
) -> Result<(), PipelineError> {
    build_features(table, &cfg.features)?;
    build_labels(table, &cfg.features.pollutants, &cfg.labels)?;
    Ok(())
}

/// Runs every stage after loading on an in-memory table.
pub fn run_on_table<C: BinaryClassifier>(
    mut table: FeatureTable,
    cfg: &PipelineConfig,
    classifier: &C,
) -> Result<PipelineOutput<C::Model>, PipelineError> {
    cfg.validate()?;
    let input_rows = table.len();
    let target = cfg.target.as_str();

    prepare_labeled_table(&mut table, cfg)?;
    let split = chronological_split(&table, target, &cfg.split)?;
    drop(table);

    let trained = train_ensemble(
        &split.train,
        &split.features,
        target,
        classifier,
        &cfg.ensemble,
    )?;

    let mut calibration = split.calibration;
    let score = score_calibration(&mut calibration, &trained.ensemble, cfg.ensemble.vote_cutoff)?;
    let detections = detection_offsets(&mut calibration, target, cfg.missed_sentinel)?;
    let cdf = offset_cdf(
        &offsets(&detections),
        cfg.missed_sentinel,
        cfg.labels.samples_per_hour,
    )?;

    let report = PipelineReport {
        target: target.to_string(),
        input_rows,
        dropped_incomplete: split.dropped_incomplete,
        boundary_ties: split.boundary_ties,
        train: split.train_bounds,
        gap: split.gap_bounds,
        calibration: split.calibration_bounds,
        feature_count: split.features.len(),
        feature_fingerprint: trained.ensemble.schema.fingerprint.clone(),
        folds: trained.folds.len(),
        score,
        latency: LatencySummary::from_offsets(&detections),
        dataset: None,
    };

    info!(
        component = "pipeline",
        event = "pipeline.run.finish",
        pollutant = %target,
        input_rows = input_rows,
        calibration_rows = calibration.len(),
        events = report.latency.events,
        detected = report.latency.detected
    );

    Ok(PipelineOutput {
        trained,
        calibration,
        offsets: detections,
        cdf,
        report,
    })
}

/// Loads the configured files, runs the gradient-boosted ensemble and writes
/// every output into `output_dir`.
pub fn run_pipeline(cfg: &PipelineConfig) -> Result<PipelineReport, PipelineError> {
    cfg.validate()?;
    let paths = cfg.dataset_paths()?;
    let (table, load_report) = load_dataset(&paths)?;

    let classifier = GradientBoostedTrees::new(cfg.classifier.clone());
    let mut output = run_on_table(table, cfg, &classifier)?;
    output.report.dataset = Some(load_report);

    write_outputs(&output, &cfg.output_dir)?;
    Ok(output.report)
}

pub fn write_outputs<M>(output: &PipelineOutput<M>, output_dir: &Path) -> Result<(), PipelineError> {
    fs::create_dir_all(output_dir).map_err(|source| PipelineError::Io {
        path: output_dir.to_path_buf(),
        source,
    })?;
    let target = output.report.target.as_str();

    let scored = scored_calibration_csv(&output.calibration, target, output.trained.ensemble.len())?;
    write_atomic(&output_dir.join(SCORED_CALIBRATION_FILE), &scored)?;

    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record([DEVICE_COLUMN, "event_start", "offset"])?;
    for d in &output.offsets {
        writer.write_record([
            d.device_id.clone(),
            d.event_start.format(TIMESTAMP_FORMAT).to_string(),
            d.offset.to_string(),
        ])?;
    }
    write_atomic(&output_dir.join(DETECTION_OFFSETS_FILE), &into_bytes(writer)?)?;

    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(["offset", "count", "cumulative_percent", "hours_before_onset"])?;
    for point in &output.cdf {
        writer.write_record([
            point.offset.to_string(),
            point.count.to_string(),
            point.cumulative_percent.to_string(),
            point.hours_before_onset.to_string(),
        ])?;
    }
    write_atomic(&output_dir.join(OFFSET_CDF_FILE), &into_bytes(writer)?)?;

    write_atomic(
        &output_dir.join(REPORT_FILE),
        &serde_json::to_vec_pretty(&output.report)?,
    )?;

    info!(
        component = "pipeline",
        event = "pipeline.outputs.written",
        output_dir = %output_dir.display(),
        scored_rows = output.calibration.len(),
        events = output.offsets.len()
    );
    Ok(())
}

fn scored_calibration_csv(
    table: &FeatureTable,
    target: &str,
    models: usize,
) -> Result<Vec<u8>, PipelineError> {
    let mut columns = vec![cutoff_column(target), future_max_column(target)];
    for k in 0..models {
        columns.push(prediction_column(target, k));
        columns.push(result_column(target, k));
    }
    columns.push(ensemble_score_column(target));
    columns.push(ensemble_pred_column(target));
    columns.push(ensemble_result_column(target));

    let values = columns
        .iter()
        .map(|name| table.require(name))
        .collect::<Result<Vec<_>, _>>()?;

    let mut writer = csv::Writer::from_writer(Vec::new());
    let mut header = vec![DEVICE_COLUMN.to_string(), TIMESTAMP_COLUMN.to_string()];
    header.extend(columns.iter().cloned());
    writer.write_record(&header)?;

    for (row, key) in table.keys().iter().enumerate() {
        let mut record = vec![
            key.device_id.clone(),
            key.timestamp.format(TIMESTAMP_FORMAT).to_string(),
        ];
        record.extend(
            values
                .iter()
                .map(|col| col[row].map(|v| v.to_string()).unwrap_or_default()),
        );
        writer.write_record(&record)?;
    }
    into_bytes(writer)
}

fn into_bytes(writer: csv::Writer<Vec<u8>>) -> Result<Vec<u8>, PipelineError> {
    writer
        .into_inner()
        .map_err(|err| PipelineError::Csv(csv::Error::from(err.into_error())))
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), PipelineError> {
    let io_err = |source| PipelineError::Io {
        path: path.to_path_buf(),
        source,
    };
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();
    let tmp_path = path.with_file_name(format!("{file_name}.tmp"));

    {
        let mut file = fs::File::create(&tmp_path).map_err(io_err)?;
        file.write_all(bytes).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;
    }

    fs::rename(&tmp_path, path).map_err(io_err)?;
    Ok(())
}
