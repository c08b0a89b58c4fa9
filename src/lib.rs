//! toxwatch core crate.
//!
//! Pipeline stages:
//! - Readings / locations / weather loading and joins
//! - Rolling, derivative, long-horizon and time-context features
//! - Forward-looking exceedance labels and the chronological split
//! - Balanced undersampling ensemble, calibration scoring, detection latency

mod classifier;
mod config;
mod dataset;
mod ensemble;
mod features;
mod labels;
mod latency;
mod observability;
mod pipeline;
mod split;
mod table;
pub mod window;

pub use classifier::{
    BinaryClassifier, ClassifierError, FeatureMatrix, GbmModel, GbmParams, GradientBoostedTrees,
    TrainedClassifier,
};
pub use config::{ConfigError, PipelineConfig, ENV_PREFIX};
pub use dataset::{
    join_locations, join_weather, load_dataset, load_locations, load_readings, load_weather,
    normalize_weather_text, parse_timestamp, parse_weather_value, DatasetError, DatasetLoadReport,
    DatasetPaths, JoinReport, LocationTable, ReadingsLoadReport, WeatherDay, WeatherLoadReport,
    DATE_COLUMN, DEVICE_COLUMN, LOCATION_KEY_COLUMN, TIMESTAMP_COLUMN, WEATHER_FIELDS,
};
pub use ensemble::{
    ensemble_pred_column, ensemble_result_column, ensemble_score_column, label_vector,
    prediction_column, result_code, result_column, score_calibration, train_ensemble,
    undersample_folds, validate_ensemble_config, EnsembleConfig, EnsembleError, Fold,
    ModelEnsemble, Outcome, ScoreSummary, TrainedEnsemble,
};
pub use features::{
    add_derivative_stats, add_long_term_stats, add_rolling_stats, add_time_features,
    assert_schema_compatible, build_feature_schema, build_features, daily_max_column,
    derivative_column, parse_time_zone, pct_change_column, rolling_column,
    validate_feature_config, FeatureConfig, FeatureError, FeatureSchema, RollingStat,
    RollingWindow, DAY_COLUMN, DEFAULT_POLLUTANTS, FEATURE_SCHEMA_VERSION, TIME_OF_DAY_COLUMN,
};
pub use labels::{
    add_future_max, apply_cutoffs, build_labels, cutoff_column, future_max_column,
    label_from_future_max, validate_label_config, LabelConfig, LabelError,
};
pub use latency::{
    detection_offsets, event_starts, offset_cdf, offset_for_event, offsets, CdfPoint,
    DetectionOffset, LatencyError, LatencySummary, DEFAULT_MISSED_SENTINEL,
};
pub use observability::{
    init_logging, log_app_start, log_config_loaded, log_run_finish, logging_config_from_env,
    logging_config_from_lookup, LogFormat, LoggingConfig, LoggingInitError,
};
pub use pipeline::{
    prepare_labeled_table, run_on_table, run_pipeline, write_outputs, PipelineError,
    PipelineOutput, PipelineReport, DETECTION_OFFSETS_FILE, OFFSET_CDF_FILE, REPORT_FILE,
    SCORED_CALIBRATION_FILE,
};
pub use split::{
    chronological_split, is_leakage_column, select_features, ChronologicalSplit, SegmentBounds,
    SplitConfig, SplitError, WEATHER_MARKERS,
};
pub use table::{Column, DevicePartition, FeatureTable, RowKey, TableError};
