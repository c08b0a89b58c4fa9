use std::collections::BTreeMap;
use std::fs;

use chrono::{Duration, NaiveDate};
use tempfile::TempDir;
use toxwatch::{
    build_feature_schema, chronological_split, cutoff_column, detection_offsets, event_starts,
    prepare_labeled_table, run_on_table, score_calibration, write_outputs, BinaryClassifier,
    ClassifierError, EnsembleConfig, FeatureConfig, FeatureMatrix, FeatureTable, GbmParams,
    GradientBoostedTrees, LabelConfig, ModelEnsemble, PipelineConfig, RollingWindow, RowKey,
    SplitConfig, TrainedClassifier, DETECTION_OFFSETS_FILE, OFFSET_CDF_FILE, REPORT_FILE,
    SCORED_CALIBRATION_FILE,
};

const SAMPLES: usize = 200;
const BASELINE: f64 = 10.0;
const PEAK: f64 = 200.0;
const EVENT_LEN: usize = 16;

/// Fires when the raw reading (first feature) exceeds a learned cut point.
#[derive(Debug)]
struct ReadingCut(f64);

impl TrainedClassifier for ReadingCut {
    fn predict(&self, features: &FeatureMatrix) -> Result<Vec<u8>, ClassifierError> {
        Ok((0..features.n_rows())
            .map(|r| u8::from(features.value(r, 0) > self.0))
            .collect())
    }
}

struct ReadingCutClassifier;

impl BinaryClassifier for ReadingCutClassifier {
    type Model = ReadingCut;

    fn fit(&self, features: &FeatureMatrix, labels: &[u8]) -> Result<ReadingCut, ClassifierError> {
        let mut sums = [0.0; 2];
        let mut counts = [0usize; 2];
        for (r, label) in labels.iter().enumerate() {
            sums[usize::from(*label)] += features.value(r, 0);
            counts[usize::from(*label)] += 1;
        }
        if counts.contains(&0) {
            return Err(ClassifierError::EmptyInput);
        }
        Ok(ReadingCut(
            (sums[0] / counts[0] as f64 + sums[1] / counts[1] as f64) / 2.0,
        ))
    }
}

/// Fires whenever the planted precursor feature is set.
#[derive(Debug, Clone, Copy)]
struct OnsetAlarm {
    feature: usize,
}

impl TrainedClassifier for OnsetAlarm {
    fn predict(&self, features: &FeatureMatrix) -> Result<Vec<u8>, ClassifierError> {
        Ok((0..features.n_rows())
            .map(|r| u8::from(features.value(r, self.feature) > 0.5))
            .collect())
    }
}

/// Devices sampled every 15 minutes from the same start, each shifted by its
/// own minute offset, with readings at `PEAK` for `EVENT_LEN` samples from
/// every listed event start.
fn readings_with_events(devices: &[(&str, i64, &[usize])]) -> FeatureTable {
    let start = NaiveDate::from_ymd_opt(2017, 3, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .expect("valid start");

    let mut keys = Vec::new();
    let mut values = Vec::new();
    for (device, offset, events) in devices {
        for i in 0..SAMPLES {
            keys.push(RowKey::new(
                *device,
                start + Duration::minutes(15 * i as i64 + offset),
            ));
            let in_event = events.iter().any(|s| (*s..*s + EVENT_LEN).contains(&i));
            values.push(Some(if in_event { PEAK } else { BASELINE }));
        }
    }

    let mut table = FeatureTable::new(keys);
    table.add_column("toxin_a", values).expect("readings");
    table
}

/// Two devices offset by 5 minutes from each other, each with one exceedance
/// event in the training period and one in the calibration period.
fn synthetic_readings() -> FeatureTable {
    readings_with_events(&[("sensor-a", 0, &[60, 150]), ("sensor-b", 5, &[70, 160])])
}

fn pipeline_config() -> PipelineConfig {
    let mut thresholds = BTreeMap::new();
    thresholds.insert("toxin_a".to_string(), 100.0);
    PipelineConfig {
        target: "toxin_a".to_string(),
        features: FeatureConfig {
            pollutants: vec!["toxin_a".to_string()],
            rolling_windows: vec![RollingWindow::new(2, "30m"), RollingWindow::new(4, "1h")],
            derivative_window: 2,
            long_window: 8,
            time_zone: "UTC".to_string(),
        },
        labels: LabelConfig {
            horizon_hours: 2,
            samples_per_hour: 4,
            short_window_label: "1h".to_string(),
            thresholds,
        },
        split: SplitConfig {
            gap: 20,
            calibration_size: 150,
        },
        ensemble: EnsembleConfig {
            folds: 5,
            vote_cutoff: 2,
            ..EnsembleConfig::default()
        },
        classifier: GbmParams {
            n_estimators: 20,
            max_depth: 3,
            ..GbmParams::default()
        },
        ..PipelineConfig::default()
    }
}

#[test]
fn reading_cut_ensemble_detects_each_event_at_its_onset() {
    let cfg = pipeline_config();
    let output = run_on_table(synthetic_readings(), &cfg, &ReadingCutClassifier)
        .expect("pipeline runs");
    let report = &output.report;

    // Rows 7..=192 of each device have every feature and label defined.
    assert_eq!(report.input_rows, 2 * SAMPLES);
    assert_eq!(report.dropped_incomplete, 2 * 14);
    assert_eq!(report.train.rows, 2 * 186 - 20 - 150);
    assert_eq!(report.gap.rows, 20);
    assert_eq!(report.calibration.rows, 150);
    assert!(report.train.last < report.calibration.first);
    assert_eq!(report.folds, 5);

    // Each calibration event is 24 positive rows: 6 lead-in, 16 at peak, 2 tail.
    assert_eq!(report.score.true_positives, 2 * EVENT_LEN);
    assert_eq!(report.score.false_negatives, 2 * 8);
    assert_eq!(report.score.false_positives, 0);
    assert_eq!(report.score.true_negatives, 150 - 2 * 24);

    let devices: Vec<&str> = output.offsets.iter().map(|o| o.device_id.as_str()).collect();
    assert_eq!(devices, vec!["sensor-a", "sensor-b"]);
    assert!(output.offsets.iter().all(|o| o.detected && o.offset == 6));
    assert_eq!(output.cdf.len(), 1);
    assert_eq!(output.cdf[0].cumulative_percent, 100.0);
    assert_eq!(output.cdf[0].hours_before_onset, (32.0 - 6.0) / 4.0);
}

#[test]
fn outputs_are_written_as_csv_and_json() {
    let cfg = pipeline_config();
    let output = run_on_table(synthetic_readings(), &cfg, &ReadingCutClassifier)
        .expect("pipeline runs");
    let dir = TempDir::new().expect("temp dir");

    write_outputs(&output, dir.path()).expect("outputs written");

    let scored = fs::read_to_string(dir.path().join(SCORED_CALIBRATION_FILE)).expect("scored csv");
    let header = scored.lines().next().expect("header line");
    assert!(header.starts_with("device_uuid,timestamp,toxin_a_cutoff,toxin_a_future_max,toxin_a_prediction_0,toxin_a_result_0"));
    assert!(header.ends_with("toxin_a_ensemble_score,toxin_a_ensemble_pred,toxin_a_ensemble_result"));
    assert_eq!(scored.lines().count(), 151);

    let offsets = fs::read_to_string(dir.path().join(DETECTION_OFFSETS_FILE)).expect("offsets csv");
    let lines: Vec<&str> = offsets.lines().collect();
    assert_eq!(lines[0], "device_uuid,event_start,offset");
    assert_eq!(lines.len(), 3);
    assert!(lines[1].starts_with("sensor-a,") && lines[1].ends_with(",6"));

    let cdf = fs::read_to_string(dir.path().join(OFFSET_CDF_FILE)).expect("cdf csv");
    assert!(cdf.starts_with("offset,count,cumulative_percent,hours_before_onset"));

    let report: serde_json::Value = serde_json::from_slice(
        &fs::read(dir.path().join(REPORT_FILE)).expect("report bytes"),
    )
    .expect("report is json");
    assert_eq!(report["target"], "toxin_a");
    assert_eq!(report["latency"]["events"], 2);
    assert_eq!(report["score"]["true_positives"], 32);
}

#[test]
fn onset_alarm_on_one_device_gives_zero_offset_and_the_other_the_sentinel() {
    let cfg = pipeline_config();
    let mut table = readings_with_events(&[("sensor-a", 0, &[140]), ("sensor-b", 5, &[150])]);
    prepare_labeled_table(&mut table, &cfg).expect("features and labels");

    // One contiguous labeled run per device.
    let labels = table.column(&cutoff_column("toxin_a")).expect("labels").to_vec();
    for partition in table.partitions() {
        assert_eq!(
            event_starts(&labels[partition.rows.clone()]).len(),
            1,
            "{}",
            partition.device_id
        );
    }

    // The simulated model on sensor-a sees the label itself; sensor-b's never fires.
    let precursor: Vec<Option<f64>> = (0..table.len())
        .map(|r| {
            let label = labels[r]?;
            Some(if table.key(r).device_id == "sensor-a" { label } else { 0.0 })
        })
        .collect();
    table
        .add_column("toxin_a_precursor", precursor)
        .expect("precursor");

    let split = chronological_split(&table, "toxin_a", &cfg.split).expect("split");
    let feature = split
        .features
        .iter()
        .position(|f| f == "toxin_a_precursor")
        .expect("precursor is a feature");
    let ensemble = ModelEnsemble {
        models: vec![OnsetAlarm { feature }; cfg.ensemble.folds],
        schema: build_feature_schema(&split.features),
        features: split.features.clone(),
        target: "toxin_a".to_string(),
    };

    let mut calibration = split.calibration;
    let score = score_calibration(&mut calibration, &ensemble, cfg.ensemble.vote_cutoff)
        .expect("calibration scores");
    assert_eq!(score.false_positives, 0);
    assert!(score.true_positives > 0);
    assert_eq!(score.true_positives, score.false_negatives);

    let found = detection_offsets(&mut calibration, "toxin_a", cfg.missed_sentinel)
        .expect("offsets");
    assert_eq!(found.len(), 2);
    assert_eq!(found[0].device_id, "sensor-a");
    assert_eq!(found[0].offset, 0);
    assert!(found[0].detected);
    assert_eq!(found[1].device_id, "sensor-b");
    assert_eq!(found[1].offset, cfg.missed_sentinel);
    assert!(!found[1].detected);
}

#[test]
fn gradient_boosted_ensemble_runs_end_to_end() {
    let cfg = pipeline_config();
    let classifier = GradientBoostedTrees::new(cfg.classifier.clone());
    let output = run_on_table(synthetic_readings(), &cfg, &classifier).expect("pipeline runs");
    let report = &output.report;

    assert_eq!(output.trained.ensemble.len(), 5);
    assert_eq!(report.feature_fingerprint, output.trained.ensemble.schema.fingerprint);

    // Peak readings only ever occur on positive rows, so every model separates them.
    assert_eq!(report.latency.events, 2);
    assert_eq!(report.latency.detected, 2);
    assert!(report.score.true_positives >= EVENT_LEN);
    for o in &output.offsets {
        assert!(o.offset < 24, "{} detected at {}", o.device_id, o.offset);
    }
    assert!(output.cdf.iter().all(|p| p.hours_before_onset > 0.0));
}
