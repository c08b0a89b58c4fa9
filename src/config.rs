//! Pipeline configuration: JSON file, environment overrides and validation.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::classifier::{ClassifierError, GbmParams};
use crate::dataset::DatasetPaths;
use crate::ensemble::{validate_ensemble_config, EnsembleConfig, EnsembleError};
use crate::features::{validate_feature_config, FeatureConfig, FeatureError};
use crate::labels::{validate_label_config, LabelConfig, LabelError};
use crate::latency::DEFAULT_MISSED_SENTINEL;
use crate::split::SplitConfig;

pub const ENV_PREFIX: &str = "TOXWATCH_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid value '{value}' for {key}")]
    InvalidEnv { key: String, value: String },
    #[error("data_dir must be set explicitly")]
    MissingDataDir,
    #[error("invalid config: {0}")]
    Invalid(String),
    #[error(transparent)]
    Feature(#[from] FeatureError),
    #[error(transparent)]
    Label(#[from] LabelError),
    #[error(transparent)]
    Ensemble(#[from] EnsembleError),
    #[error(transparent)]
    Classifier(#[from] ClassifierError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub data_dir: PathBuf,
    pub readings_files: Vec<String>,
    pub locations_file: Option<String>,
    pub weather_file: Option<String>,
    pub output_dir: PathBuf,
    pub target: String,
    pub missed_sentinel: usize,
    pub features: FeatureConfig,
    pub labels: LabelConfig,
    pub split: SplitConfig,
    pub ensemble: EnsembleConfig,
    pub classifier: GbmParams,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::new(),
            readings_files: vec!["readings.csv".to_string()],
            locations_file: None,
            weather_file: None,
            output_dir: PathBuf::from("out"),
            target: "toxin_a".to_string(),
            missed_sentinel: DEFAULT_MISSED_SENTINEL,
            features: FeatureConfig::default(),
            labels: LabelConfig::default(),
            split: SplitConfig::default(),
            ensemble: EnsembleConfig::default(),
            classifier: GbmParams::default(),
        }
    }
}

impl PipelineConfig {
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides_from(|key| env::var(key).ok())
    }

    /// Applies `TOXWATCH_*` overrides from any key lookup. Blank values are ignored.
    pub fn apply_overrides_from(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        let get = |name: &str| {
            let key = format!("{ENV_PREFIX}{name}");
            lookup(&key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .map(|v| (key, v))
        };

        if let Some((_, v)) = get("DATA_DIR") {
            self.data_dir = PathBuf::from(v);
        }
        if let Some((_, v)) = get("OUTPUT_DIR") {
            self.output_dir = PathBuf::from(v);
        }
        if let Some((_, v)) = get("TARGET") {
            self.target = v;
        }
        if let Some((key, v)) = get("FOLDS") {
            self.ensemble.folds = parse_env(&key, &v)?;
        }
        if let Some((key, v)) = get("VOTE_CUTOFF") {
            self.ensemble.vote_cutoff = parse_env(&key, &v)?;
        }
        if let Some((key, v)) = get("SEED") {
            self.ensemble.seed = parse_env(&key, &v)?;
        }
        if let Some((key, v)) = get("GAP") {
            self.split.gap = parse_env(&key, &v)?;
        }
        if let Some((key, v)) = get("CALIBRATION_SIZE") {
            self.split.calibration_size = parse_env(&key, &v)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_feature_config(&self.features)?;
        validate_label_config(&self.labels)?;
        validate_ensemble_config(&self.ensemble)?;
        self.classifier.validate()?;

        if !self.features.pollutants.contains(&self.target) {
            return Err(ConfigError::Invalid(format!(
                "target {} is not a monitored pollutant",
                self.target
            )));
        }
        if !self.labels.thresholds.contains_key(&self.target) {
            return Err(ConfigError::Invalid(format!(
                "target {} has no threshold",
                self.target
            )));
        }
        if !self
            .features
            .rolling_windows
            .iter()
            .any(|w| w.label == self.labels.short_window_label)
        {
            return Err(ConfigError::Invalid(format!(
                "short_window_label {} does not name a rolling window",
                self.labels.short_window_label
            )));
        }
        if self.split.calibration_size == 0 {
            return Err(ConfigError::Invalid(
                "calibration_size must be > 0".to_string(),
            ));
        }
        if self.missed_sentinel == 0 {
            return Err(ConfigError::Invalid(
                "missed_sentinel must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Input file locations resolved against `data_dir`.
    pub fn dataset_paths(&self) -> Result<DatasetPaths, ConfigError> {
        if self.data_dir.as_os_str().is_empty() {
            return Err(ConfigError::MissingDataDir);
        }
        if self.readings_files.is_empty() {
            return Err(ConfigError::Invalid(
                "readings_files must not be empty".to_string(),
            ));
        }
        Ok(DatasetPaths {
            readings: self
                .readings_files
                .iter()
                .map(|f| self.data_dir.join(f))
                .collect(),
            locations: self.locations_file.as_ref().map(|f| self.data_dir.join(f)),
            weather: self.weather_file.as_ref().map(|f| self.data_dir.join(f)),
        })
    }
}

fn parse_env<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse::<T>().map_err(|_| ConfigError::InvalidEnv {
        key: key.to_string(),
        value: value.to_string(),
    })
}
