//! Balanced undersampling ensemble: fold construction, training and scoring.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::classifier::{BinaryClassifier, ClassifierError, FeatureMatrix, TrainedClassifier};
use crate::features::{assert_schema_compatible, build_feature_schema, FeatureError, FeatureSchema};
use crate::labels::cutoff_column;
use crate::split::{select_features, SplitError};
use crate::table::{FeatureTable, TableError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnsembleConfig {
    pub folds: usize,
    /// The ensemble fires when strictly more than this many models vote 1.
    pub vote_cutoff: usize,
    pub max_train_rows: usize,
    pub test_fraction: f64,
    pub seed: u64,
}

impl Default for EnsembleConfig {
    fn default() -> Self {
        Self {
            folds: 10,
            vote_cutoff: 7,
            max_train_rows: 100_000,
            test_fraction: 0.3,
            seed: 42,
        }
    }
}

#[derive(Debug, Error)]
pub enum EnsembleError {
    #[error("cannot balance labels: {positives} positive and {negatives} negative rows")]
    DegenerateFold { positives: usize, negatives: usize },
    #[error("invalid ensemble config: {0}")]
    InvalidConfig(String),
    #[error("label {column} is undefined at row {row}")]
    UndefinedLabel { column: String, row: usize },
    #[error("label {column} at row {row} is {value}, expected 0 or 1")]
    NonBinaryLabel {
        column: String,
        row: usize,
        value: f64,
    },
    #[error("model {model} failed: {source}")]
    Model {
        model: usize,
        #[source]
        source: ClassifierError,
    },
    #[error(transparent)]
    Classifier(#[from] ClassifierError),
    #[error(transparent)]
    Feature(#[from] FeatureError),
    #[error(transparent)]
    Split(#[from] SplitError),
    #[error(transparent)]
    Table(#[from] TableError),
}

/// Per-row outcome of comparing a prediction with its label, encoded as
/// `2 * prediction - label`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Outcome {
    FalsePositive,
    TruePositive,
    TrueNegative,
    FalseNegative,
}

impl Outcome {
    pub fn new(prediction: u8, label: u8) -> Self {
        match (prediction, label) {
            (1, 0) => Self::FalsePositive,
            (1, _) => Self::TruePositive,
            (_, 0) => Self::TrueNegative,
            _ => Self::FalseNegative,
        }
    }

    pub fn code(self) -> i8 {
        match self {
            Self::FalsePositive => 2,
            Self::TruePositive => 1,
            Self::TrueNegative => 0,
            Self::FalseNegative => -1,
        }
    }

    pub fn from_code(code: i8) -> Option<Self> {
        match code {
            2 => Some(Self::FalsePositive),
            1 => Some(Self::TruePositive),
            0 => Some(Self::TrueNegative),
            -1 => Some(Self::FalseNegative),
            _ => None,
        }
    }
}

pub fn result_code(prediction: u8, label: u8) -> f64 {
    f64::from(Outcome::new(prediction, label).code())
}

pub fn prediction_column(pollutant: &str, model: usize) -> String {
    format!("{pollutant}_prediction_{model}")
}

pub fn result_column(pollutant: &str, model: usize) -> String {
    format!("{pollutant}_result_{model}")
}

pub fn ensemble_score_column(pollutant: &str) -> String {
    format!("{pollutant}_ensemble_score")
}

pub fn ensemble_pred_column(pollutant: &str) -> String {
    format!("{pollutant}_ensemble_pred")
}

pub fn ensemble_result_column(pollutant: &str) -> String {
    format!("{pollutant}_ensemble_result")
}

/// One undersampling draw. Row indices point into the table the labels came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fold {
    pub train_rows: Vec<usize>,
    pub test_rows: Vec<usize>,
    pub train_labels: Vec<u8>,
    pub test_labels: Vec<u8>,
}

#[derive(Debug)]
pub struct ModelEnsemble<M> {
    pub models: Vec<M>,
    pub features: Vec<String>,
    pub schema: FeatureSchema,
    pub target: String,
}

impl<M> ModelEnsemble<M> {
    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

#[derive(Debug)]
pub struct TrainedEnsemble<M> {
    pub ensemble: ModelEnsemble<M>,
    pub folds: Vec<Fold>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreSummary {
    pub rows: usize,
    pub models: usize,
    pub vote_cutoff: usize,
    pub true_positives: usize,
    pub false_positives: usize,
    pub true_negatives: usize,
    pub false_negatives: usize,
}

impl ScoreSummary {
    fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::FalsePositive => self.false_positives += 1,
            Outcome::TruePositive => self.true_positives += 1,
            Outcome::TrueNegative => self.true_negatives += 1,
            Outcome::FalseNegative => self.false_negatives += 1,
        }
    }

    pub fn precision(&self) -> Option<f64> {
        let fired = self.true_positives + self.false_positives;
        (fired > 0).then(|| self.true_positives as f64 / fired as f64)
    }

    pub fn recall(&self) -> Option<f64> {
        let actual = self.true_positives + self.false_negatives;
        (actual > 0).then(|| self.true_positives as f64 / actual as f64)
    }
}

pub fn validate_ensemble_config(cfg: &EnsembleConfig) -> Result<(), EnsembleError> {
    if cfg.folds == 0 {
        return Err(EnsembleError::InvalidConfig("folds must be > 0".to_string()));
    }
    validate_vote_cutoff(cfg.vote_cutoff, cfg.folds)?;
    if cfg.max_train_rows == 0 {
        return Err(EnsembleError::InvalidConfig(
            "max_train_rows must be > 0".to_string(),
        ));
    }
    if !(0.0..1.0).contains(&cfg.test_fraction) {
        return Err(EnsembleError::InvalidConfig(
            "test_fraction must be in [0, 1)".to_string(),
        ));
    }
    Ok(())
}

fn validate_vote_cutoff(vote_cutoff: usize, models: usize) -> Result<(), EnsembleError> {
    if vote_cutoff >= models {
        return Err(EnsembleError::InvalidConfig(format!(
            "vote_cutoff ({vote_cutoff}) must be below the model count ({models})"
        )));
    }
    Ok(())
}

/// Reads `<target>_cutoff` as 0/1 labels; every row must be defined.
pub fn label_vector(table: &FeatureTable, target: &str) -> Result<Vec<u8>, EnsembleError> {
    let column = cutoff_column(target);
    table
        .require(&column)?
        .iter()
        .enumerate()
        .map(|(row, v)| match v {
            None => Err(EnsembleError::UndefinedLabel {
                column: column.clone(),
                row,
            }),
            Some(x) if *x == 0.0 => Ok(0),
            Some(x) if *x == 1.0 => Ok(1),
            Some(x) => Err(EnsembleError::NonBinaryLabel {
                column: column.clone(),
                row,
                value: *x,
            }),
        })
        .collect()
}

/// Draws `cfg.folds` balanced subsets: every positive row plus as many
/// negatives, shuffled and split into fold-train / fold-test.
pub fn undersample_folds(labels: &[u8], cfg: &EnsembleConfig) -> Result<Vec<Fold>, EnsembleError> {
    validate_ensemble_config(cfg)?;
    let positives: Vec<usize> = (0..labels.len()).filter(|r| labels[*r] == 1).collect();
    let negatives: Vec<usize> = (0..labels.len()).filter(|r| labels[*r] != 1).collect();
    if positives.is_empty() || negatives.is_empty() {
        return Err(EnsembleError::DegenerateFold {
            positives: positives.len(),
            negatives: negatives.len(),
        });
    }

    let folds = (0..cfg.folds)
        .map(|k| {
            let mut rng = StdRng::seed_from_u64(cfg.seed.wrapping_add(k as u64));
            let mut pos = positives.clone();
            let mut neg = negatives.clone();
            pos.shuffle(&mut rng);
            neg.shuffle(&mut rng);
            neg.truncate(pos.len());

            let mut balanced = pos;
            balanced.extend(neg);
            balanced.shuffle(&mut rng);

            let n = balanced.len();
            let n_test = (n as f64 * cfg.test_fraction).floor() as usize;
            let test_rows = balanced.split_off(n - n_test);
            let train_rows = balanced;
            Fold {
                train_labels: train_rows.iter().map(|r| labels[*r]).collect(),
                test_labels: test_rows.iter().map(|r| labels[*r]).collect(),
                train_rows,
                test_rows,
            }
        })
        .collect();
    Ok(folds)
}

/// Fits one model per fold, in parallel, returning models in fold order.
pub fn train_ensemble<C: BinaryClassifier>(
    train: &FeatureTable,
    features: &[String],
    target: &str,
    classifier: &C,
    cfg: &EnsembleConfig,
) -> Result<TrainedEnsemble<C::Model>, EnsembleError> {
    let labels = label_vector(train, target)?;
    let folds = undersample_folds(&labels, cfg)?;

    info!(
        component = "ensemble",
        event = "ensemble.train.start",
        pollutant = %target,
        folds = folds.len(),
        train_rows = train.len(),
        positives = labels.iter().filter(|l| **l == 1).count(),
        feature_count = features.len()
    );

    let models = folds
        .par_iter()
        .enumerate()
        .map(|(k, fold)| -> Result<C::Model, EnsembleError> {
            let cap = fold.train_rows.len().min(cfg.max_train_rows);
            let rows = &fold.train_rows[..cap];
            let matrix = FeatureMatrix::from_table(train, features, Some(rows))?;
            let model = classifier
                .fit(&matrix, &fold.train_labels[..cap])
                .map_err(|source| EnsembleError::Model { model: k, source })?;
            debug!(
                component = "ensemble",
                event = "ensemble.fold.trained",
                fold = k,
                train_rows = cap,
                test_rows = fold.test_rows.len()
            );
            Ok(model)
        })
        .collect::<Result<Vec<_>, EnsembleError>>()?;

    info!(
        component = "ensemble",
        event = "ensemble.train.finish",
        pollutant = %target,
        models = models.len()
    );

    Ok(TrainedEnsemble {
        ensemble: ModelEnsemble {
            models,
            features: features.to_vec(),
            schema: build_feature_schema(features),
            target: target.to_string(),
        },
        folds,
    })
}

/// Adds per-model and ensemble prediction/result columns to `calibration`.
pub fn score_calibration<M: TrainedClassifier>(
    calibration: &mut FeatureTable,
    ensemble: &ModelEnsemble<M>,
    vote_cutoff: usize,
) -> Result<ScoreSummary, EnsembleError> {
    validate_vote_cutoff(vote_cutoff, ensemble.len())?;
    let target = ensemble.target.as_str();

    let actual = build_feature_schema(&select_features(&calibration.column_names(), target)?);
    assert_schema_compatible(&ensemble.schema, &actual)?;

    let labels = label_vector(calibration, target)?;
    let matrix = FeatureMatrix::from_table(calibration, &ensemble.features, None)?;
    let predictions = ensemble
        .models
        .par_iter()
        .enumerate()
        .map(|(k, model)| {
            model
                .predict(&matrix)
                .map_err(|source| EnsembleError::Model { model: k, source })
        })
        .collect::<Result<Vec<_>, EnsembleError>>()?;

    let mut score = vec![0usize; calibration.len()];
    for (k, preds) in predictions.iter().enumerate() {
        let mut pred_col = Vec::with_capacity(preds.len());
        let mut result_col = Vec::with_capacity(preds.len());
        for (row, (pred, label)) in preds.iter().zip(&labels).enumerate() {
            score[row] += usize::from(*pred);
            pred_col.push(Some(f64::from(*pred)));
            result_col.push(Some(result_code(*pred, *label)));
        }
        calibration.add_column(prediction_column(target, k), pred_col)?;
        calibration.add_column(result_column(target, k), result_col)?;
    }

    let mut summary = ScoreSummary {
        rows: calibration.len(),
        models: ensemble.len(),
        vote_cutoff,
        ..ScoreSummary::default()
    };
    let mut ensemble_pred = Vec::with_capacity(score.len());
    let mut ensemble_result = Vec::with_capacity(score.len());
    for (votes, label) in score.iter().zip(&labels) {
        let pred = u8::from(*votes > vote_cutoff);
        let outcome = Outcome::new(pred, *label);
        summary.record(outcome);
        ensemble_pred.push(Some(f64::from(pred)));
        ensemble_result.push(Some(f64::from(outcome.code())));
    }

    calibration.add_column(
        ensemble_score_column(target),
        score.iter().map(|s| Some(*s as f64)).collect(),
    )?;
    calibration.add_column(ensemble_pred_column(target), ensemble_pred)?;
    calibration.add_column(ensemble_result_column(target), ensemble_result)?;

    info!(
        component = "ensemble",
        event = "ensemble.score.finish",
        pollutant = %target,
        rows = summary.rows,
        vote_cutoff = vote_cutoff,
        true_positives = summary.true_positives,
        false_positives = summary.false_positives,
        true_negatives = summary.true_negatives,
        false_negatives = summary.false_negatives
    );

    Ok(summary)
}
