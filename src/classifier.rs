//! Binary classifier capability and a gradient-boosted trees implementation.
//!
//! The trainer and scorer only depend on [`BinaryClassifier`] and
//! [`TrainedClassifier`]; [`GradientBoostedTrees`] is the default algorithm.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::table::{FeatureTable, TableError};

#[derive(Debug, Error, PartialEq)]
pub enum ClassifierError {
    #[error("cannot fit on an empty feature matrix")]
    EmptyInput,
    #[error("labels must contain both classes, found only {0}")]
    SingleClass(u8),
    #[error("label at row {row} is {value}, expected 0 or 1")]
    NonBinaryLabel { row: usize, value: f64 },
    #[error("{labels} labels for {rows} feature rows")]
    LabelCountMismatch { rows: usize, labels: usize },
    #[error("model expects {expected} features, got {found}")]
    FeatureCountMismatch { expected: usize, found: usize },
    #[error("row {row} has {found} values, expected {expected}")]
    RaggedRow {
        row: usize,
        expected: usize,
        found: usize,
    },
    #[error("invalid classifier params: {0}")]
    InvalidParams(String),
    #[error(transparent)]
    Table(#[from] TableError),
}

/// Dense row-major feature matrix. Every value is defined.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureMatrix {
    n_features: usize,
    data: Vec<f64>,
}

impl FeatureMatrix {
    pub fn from_rows(rows: &[Vec<f64>]) -> Result<Self, ClassifierError> {
        let n_features = rows.first().map(Vec::len).unwrap_or(0);
        let mut data = Vec::with_capacity(rows.len() * n_features);
        for (row, values) in rows.iter().enumerate() {
            if values.len() != n_features {
                return Err(ClassifierError::RaggedRow {
                    row,
                    expected: n_features,
                    found: values.len(),
                });
            }
            data.extend_from_slice(values);
        }
        Ok(Self { n_features, data })
    }

    /// Gathers `features` for `rows` (all rows when `None`). Undefined values
    /// are rejected; incomplete rows must be dropped before this point.
    pub fn from_table(
        table: &FeatureTable,
        features: &[String],
        rows: Option<&[usize]>,
    ) -> Result<Self, ClassifierError> {
        let columns = features
            .iter()
            .map(|name| table.require(name))
            .collect::<Result<Vec<_>, _>>()?;
        let all_rows: Vec<usize>;
        let rows = match rows {
            Some(rows) => rows,
            None => {
                all_rows = (0..table.len()).collect();
                &all_rows
            }
        };

        let mut data = Vec::with_capacity(rows.len() * features.len());
        for row in rows {
            for (column, name) in columns.iter().zip(features) {
                let value = column[*row].ok_or_else(|| TableError::UndefinedValue {
                    column: name.clone(),
                    row: *row,
                })?;
                data.push(value);
            }
        }
        Ok(Self {
            n_features: features.len(),
            data,
        })
    }

    pub fn n_rows(&self) -> usize {
        if self.n_features == 0 {
            0
        } else {
            self.data.len() / self.n_features
        }
    }

    pub fn n_features(&self) -> usize {
        self.n_features
    }

    pub fn row(&self, row: usize) -> &[f64] {
        &self.data[row * self.n_features..(row + 1) * self.n_features]
    }

    pub fn value(&self, row: usize, feature: usize) -> f64 {
        self.data[row * self.n_features + feature]
    }
}

/// A fitted model producing 0/1 predictions.
pub trait TrainedClassifier: Send + Sync {
    fn predict(&self, features: &FeatureMatrix) -> Result<Vec<u8>, ClassifierError>;
}

/// A classification algorithm: `fit(features, labels) -> trained model`.
pub trait BinaryClassifier: Send + Sync {
    type Model: TrainedClassifier;

    fn fit(&self, features: &FeatureMatrix, labels: &[u8]) -> Result<Self::Model, ClassifierError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GbmParams {
    pub n_estimators: usize,
    pub max_depth: usize,
    pub learning_rate: f64,
    pub min_samples_leaf: usize,
    /// Upper bound on candidate split points per feature.
    pub max_bins: usize,
}

impl Default for GbmParams {
    fn default() -> Self {
        Self {
            n_estimators: 200,
            max_depth: 5,
            learning_rate: 0.1,
            min_samples_leaf: 1,
            max_bins: 64,
        }
    }
}

impl GbmParams {
    pub fn validate(&self) -> Result<(), ClassifierError> {
        if self.n_estimators == 0 || self.max_depth == 0 || self.min_samples_leaf == 0 {
            return Err(ClassifierError::InvalidParams(
                "n_estimators, max_depth and min_samples_leaf must be > 0".to_string(),
            ));
        }
        if !(self.learning_rate > 0.0 && self.learning_rate.is_finite()) {
            return Err(ClassifierError::InvalidParams(
                "learning_rate must be a positive finite number".to_string(),
            ));
        }
        if self.max_bins < 2 {
            return Err(ClassifierError::InvalidParams(
                "max_bins must be >= 2".to_string(),
            ));
        }
        Ok(())
    }
}

/// Log-loss gradient boosting over depth-limited regression trees.
#[derive(Debug, Clone, Default)]
pub struct GradientBoostedTrees {
    pub params: GbmParams,
}

impl GradientBoostedTrees {
    pub fn new(params: GbmParams) -> Self {
        Self { params }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum TreeNode {
    Leaf(f64),
    Split {
        feature: usize,
        bin: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
}

#[derive(Debug, Clone, PartialEq)]
struct RegressionTree {
    nodes: Vec<TreeNode>,
}

impl RegressionTree {
    fn predict(&self, row: &[f64]) -> f64 {
        let mut idx = 0;
        loop {
            match &self.nodes[idx] {
                TreeNode::Leaf(value) => return *value,
                TreeNode::Split {
                    feature,
                    threshold,
                    left,
                    right,
                    ..
                } => {
                    idx = if row[*feature] <= *threshold {
                        *left
                    } else {
                        *right
                    };
                }
            }
        }
    }

    fn predict_binned(&self, bins: &BinnedMatrix, row: usize) -> f64 {
        let mut idx = 0;
        loop {
            match &self.nodes[idx] {
                TreeNode::Leaf(value) => return *value,
                TreeNode::Split {
                    feature,
                    bin,
                    left,
                    right,
                    ..
                } => {
                    idx = if bins.bin(row, *feature) <= *bin {
                        *left
                    } else {
                        *right
                    };
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GbmModel {
    n_features: usize,
    initial_log_odds: f64,
    learning_rate: f64,
    trees: Vec<RegressionTree>,
}

impl GbmModel {
    pub fn n_trees(&self) -> usize {
        self.trees.len()
    }

    pub fn decision_function(&self, row: &[f64]) -> f64 {
        self.initial_log_odds
            + self.learning_rate * self.trees.iter().map(|t| t.predict(row)).sum::<f64>()
    }

    pub fn predict_proba(&self, features: &FeatureMatrix) -> Result<Vec<f64>, ClassifierError> {
        if features.n_features() != self.n_features && features.n_rows() > 0 {
            return Err(ClassifierError::FeatureCountMismatch {
                expected: self.n_features,
                found: features.n_features(),
            });
        }
        Ok((0..features.n_rows())
            .map(|r| sigmoid(self.decision_function(features.row(r))))
            .collect())
    }
}

impl TrainedClassifier for GbmModel {
    fn predict(&self, features: &FeatureMatrix) -> Result<Vec<u8>, ClassifierError> {
        Ok(self
            .predict_proba(features)?
            .into_iter()
            .map(|p| u8::from(p > 0.5))
            .collect())
    }
}

impl BinaryClassifier for GradientBoostedTrees {
    type Model = GbmModel;

    fn fit(&self, features: &FeatureMatrix, labels: &[u8]) -> Result<GbmModel, ClassifierError> {
        self.params.validate()?;
        let n = features.n_rows();
        if n == 0 || features.n_features() == 0 {
            return Err(ClassifierError::EmptyInput);
        }
        if labels.len() != n {
            return Err(ClassifierError::LabelCountMismatch {
                rows: n,
                labels: labels.len(),
            });
        }
        if let Some(row) = labels.iter().position(|l| *l > 1) {
            return Err(ClassifierError::NonBinaryLabel {
                row,
                value: f64::from(labels[row]),
            });
        }

        let positives = labels.iter().filter(|l| **l == 1).count();
        if positives == 0 {
            return Err(ClassifierError::SingleClass(0));
        }
        if positives == n {
            return Err(ClassifierError::SingleClass(1));
        }

        let prior = positives as f64 / n as f64;
        let initial_log_odds = (prior / (1.0 - prior)).ln();
        let y: Vec<f64> = labels.iter().map(|l| f64::from(*l)).collect();
        let bins = BinnedMatrix::new(features, self.params.max_bins);

        let mut raw = vec![initial_log_odds; n];
        let mut trees = Vec::with_capacity(self.params.n_estimators);
        let all_rows: Vec<usize> = (0..n).collect();

        for _ in 0..self.params.n_estimators {
            let mut gradient = Vec::with_capacity(n);
            let mut hessian = Vec::with_capacity(n);
            for (f, target) in raw.iter().zip(&y) {
                let p = sigmoid(*f);
                gradient.push(target - p);
                hessian.push(p * (1.0 - p));
            }

            let mut builder = TreeBuilder {
                params: &self.params,
                bins: &bins,
                gradient: &gradient,
                hessian: &hessian,
                nodes: Vec::new(),
            };
            builder.grow(all_rows.clone(), 0);
            let tree = RegressionTree {
                nodes: builder.nodes,
            };

            for (row, f) in raw.iter_mut().enumerate() {
                *f += self.params.learning_rate * tree.predict_binned(&bins, row);
            }
            trees.push(tree);
        }

        Ok(GbmModel {
            n_features: features.n_features(),
            initial_log_odds,
            learning_rate: self.params.learning_rate,
            trees,
        })
    }
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// Quantile-binned copy of a feature matrix used while growing trees.
/// `bin(v)` counts the thresholds strictly below `v`, so `v <= thresholds[b]`
/// exactly when `bin(v) <= b`.
#[derive(Debug)]
struct BinnedMatrix {
    n_features: usize,
    thresholds: Vec<Vec<f64>>,
    bins: Vec<u16>,
}

impl BinnedMatrix {
    fn new(features: &FeatureMatrix, max_bins: usize) -> Self {
        let n_features = features.n_features();
        let n = features.n_rows();
        let thresholds: Vec<Vec<f64>> = (0..n_features)
            .map(|f| {
                let mut values: Vec<f64> = (0..n).map(|r| features.value(r, f)).collect();
                values.sort_by(|a, b| a.total_cmp(b));
                values.dedup();
                candidate_thresholds(&values, max_bins.min(u16::MAX as usize))
            })
            .collect();

        let mut bins = Vec::with_capacity(n * n_features);
        for r in 0..n {
            for (f, cuts) in thresholds.iter().enumerate() {
                let v = features.value(r, f);
                bins.push(cuts.partition_point(|t| *t < v) as u16);
            }
        }

        Self {
            n_features,
            thresholds,
            bins,
        }
    }

    fn bin(&self, row: usize, feature: usize) -> usize {
        usize::from(self.bins[row * self.n_features + feature])
    }
}

fn candidate_thresholds(unique: &[f64], max_bins: usize) -> Vec<f64> {
    if unique.len() < 2 {
        return Vec::new();
    }
    let mut cuts: Vec<f64> = if unique.len() <= max_bins {
        unique.windows(2).map(|w| (w[0] + w[1]) / 2.0).collect()
    } else {
        (1..max_bins)
            .map(|q| {
                let idx = (q * unique.len() / max_bins).max(1);
                (unique[idx - 1] + unique[idx]) / 2.0
            })
            .collect()
    };
    cuts.dedup();
    cuts
}

struct TreeBuilder<'a> {
    params: &'a GbmParams,
    bins: &'a BinnedMatrix,
    gradient: &'a [f64],
    hessian: &'a [f64],
    nodes: Vec<TreeNode>,
}

impl TreeBuilder<'_> {
    fn grow(&mut self, rows: Vec<usize>, depth: usize) -> usize {
        let idx = self.nodes.len();
        self.nodes.push(TreeNode::Leaf(self.leaf_value(&rows)));

        if depth >= self.params.max_depth || rows.len() < 2 * self.params.min_samples_leaf {
            return idx;
        }
        let Some((feature, bin)) = self.best_split(&rows) else {
            return idx;
        };

        let (left_rows, right_rows): (Vec<usize>, Vec<usize>) = rows
            .into_iter()
            .partition(|r| self.bins.bin(*r, feature) <= bin);
        let left = self.grow(left_rows, depth + 1);
        let right = self.grow(right_rows, depth + 1);
        self.nodes[idx] = TreeNode::Split {
            feature,
            bin,
            threshold: self.bins.thresholds[feature][bin],
            left,
            right,
        };
        idx
    }

    /// One Newton step on the log loss: sum(residual) / sum(p * (1 - p)).
    fn leaf_value(&self, rows: &[usize]) -> f64 {
        let (num, den) = rows.iter().fold((0.0, 0.0), |(num, den), r| {
            (num + self.gradient[*r], den + self.hessian[*r])
        });
        if den.abs() < 1e-12 {
            0.0
        } else {
            num / den
        }
    }

    /// Best variance-reduction split on the residuals, as (feature, bin).
    fn best_split(&self, rows: &[usize]) -> Option<(usize, usize)> {
        let n = rows.len() as f64;
        let total: f64 = rows.iter().map(|r| self.gradient[*r]).sum();
        let parent_score = total * total / n;
        let min_leaf = self.params.min_samples_leaf;

        let mut best: Option<(usize, usize)> = None;
        let mut best_gain = 1e-12;

        for (feature, cuts) in self.bins.thresholds.iter().enumerate() {
            if cuts.is_empty() {
                continue;
            }
            let mut sums = vec![0.0; cuts.len() + 1];
            let mut counts = vec![0usize; cuts.len() + 1];
            for r in rows {
                let b = self.bins.bin(*r, feature);
                sums[b] += self.gradient[*r];
                counts[b] += 1;
            }

            let mut left_sum = 0.0;
            let mut left_count = 0usize;
            for bin in 0..cuts.len() {
                left_sum += sums[bin];
                left_count += counts[bin];
                let right_count = rows.len() - left_count;
                if left_count < min_leaf || right_count < min_leaf {
                    continue;
                }
                let right_sum = total - left_sum;
                let gain = left_sum * left_sum / left_count as f64
                    + right_sum * right_sum / right_count as f64
                    - parent_score;
                if gain > best_gain {
                    best_gain = gain;
                    best = Some((feature, bin));
                }
            }
        }

        best
    }
}
