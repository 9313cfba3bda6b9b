//! Bootstrap-aggregated ensembles of randomized regression trees.
//!
//! Every tree sees its own bootstrap resample of the fit rows. Rows a tree
//! never drew form that tree's out-of-bag set; averaging each row's
//! predictions over only those trees yields an error estimate that needs no
//! held-out data.
//!
//! Trees are grown on a caller-owned rayon pool. Per-tree seeds are drawn
//! sequentially from the ensemble seed before any tree is grown, so the
//! fitted ensemble does not depend on the pool size.

use crate::tree::{self, GrowParams, RegressionTree, SplitRule};
use ndarray::{Array1, ArrayView1, ArrayView2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Number of columns considered at each split.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum MaxFeatures {
    /// A fixed number of columns.
    Count(usize),
    /// A fraction of all columns, rounded down, at least one.
    Fraction(f64),
}

impl MaxFeatures {
    /// Resolves the setting to a column count in `1..=n_features`.
    pub fn resolve(self, n_features: usize) -> usize {
        let count = match self {
            Self::Count(count) => count,
            Self::Fraction(fraction) => (fraction * n_features as f64) as usize,
        };
        count.clamp(1, n_features.max(1))
    }
}

impl fmt::Display for MaxFeatures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Count(count) => write!(f, "{count} column(s)"),
            Self::Fraction(fraction) => write!(f, "{fraction} of columns"),
        }
    }
}

/// Hyperparameters of one ensemble fit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ForestConfig {
    pub n_trees: usize,
    pub min_split: usize,
    pub max_features: MaxFeatures,
    pub split_rule: SplitRule,
    /// Track out-of-bag predictions during fitting.
    pub oob: bool,
    pub seed: u64,
}

/// Error type for ensemble fitting and prediction.
#[derive(Error, Debug)]
pub enum ForestError {
    #[error("Row count mismatch: {rows} parameter rows but {targets} outcomes.")]
    RowCountMismatch { rows: usize, targets: usize },
    #[error("At least 2 rows are required to fit an ensemble, got {0}.")]
    TooFewRows(usize),
    #[error("The parameter matrix has no columns.")]
    NoFeatures,
    #[error("An ensemble needs at least one tree.")]
    NoTrees,
    #[error("min_split must be at least 2, got {0}.")]
    MinSplitTooSmall(usize),
    #[error("Non-finite values were found in the {0}.")]
    NonFiniteInput(&'static str),
    #[error("The model was fitted on {expected} columns, but {found} were supplied.")]
    FeatureCountMismatch { expected: usize, found: usize },
    #[error("Failed to build the worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

/// Builds the bounded worker pool used for tree construction and attribution.
pub fn build_pool(n_jobs: usize) -> Result<rayon::ThreadPool, ForestError> {
    Ok(rayon::ThreadPoolBuilder::new()
        .num_threads(n_jobs.max(1))
        .build()?)
}

/// A fitted ensemble.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Forest {
    n_features: usize,
    trees: Vec<RegressionTree>,
    #[serde(skip)]
    oob_predictions: Option<Vec<f64>>,
}

/// One grown tree together with its out-of-bag predictions `(row, value)`.
struct GrownTree {
    tree: RegressionTree,
    oob: Vec<(usize, f64)>,
}

impl Forest {
    /// Fits an ensemble on `x` (rows = samples) and `y`.
    pub fn fit(
        x: ArrayView2<f64>,
        y: ArrayView1<f64>,
        config: &ForestConfig,
        pool: &rayon::ThreadPool,
    ) -> Result<Self, ForestError> {
        validate_fit_inputs(x, y, config)?;

        let n_rows = x.nrows();
        let params = GrowParams {
            min_split: config.min_split,
            max_features: config.max_features.resolve(x.ncols()),
            split_rule: config.split_rule,
        };

        let mut seeder = StdRng::seed_from_u64(config.seed);
        let tree_seeds: Vec<u64> = (0..config.n_trees).map(|_| seeder.random()).collect();

        log::debug!(
            "Growing {} trees (min_split={}, max_features={}, rule={:?}) on {} rows",
            config.n_trees,
            params.min_split,
            params.max_features,
            params.split_rule,
            n_rows
        );

        let grown: Vec<GrownTree> = pool.install(|| {
            tree_seeds
                .par_iter()
                .map(|&seed| grow_bagged(x, y, &params, config.oob, seed))
                .collect()
        });

        let oob_predictions = config.oob.then(|| {
            let mut sums = vec![0.0; n_rows];
            let mut counts = vec![0u32; n_rows];
            for g in &grown {
                for &(row, value) in &g.oob {
                    sums[row] += value;
                    counts[row] += 1;
                }
            }
            let undefined = counts.iter().filter(|&&c| c == 0).count();
            if undefined > 0 {
                log::debug!("{undefined} of {n_rows} rows were in-bag for every tree");
            }
            sums.iter()
                .zip(&counts)
                .map(|(&s, &c)| if c == 0 { f64::NAN } else { s / c as f64 })
                .collect()
        });

        Ok(Self {
            n_features: x.ncols(),
            trees: grown.into_iter().map(|g| g.tree).collect(),
            oob_predictions,
        })
    }

    pub fn n_features(&self) -> usize {
        self.n_features
    }

    pub fn trees(&self) -> &[RegressionTree] {
        &self.trees
    }

    /// Total number of split nodes across all trees.
    pub fn n_splits(&self) -> usize {
        self.trees.iter().map(RegressionTree::n_splits).sum()
    }

    /// Mean of the trees' root values: the ensemble's unconditional output.
    pub fn baseline(&self) -> f64 {
        self.trees.iter().map(RegressionTree::root_value).sum::<f64>() / self.trees.len() as f64
    }

    pub fn predict_row(&self, row: ArrayView1<f64>) -> f64 {
        self.trees.iter().map(|t| t.predict_row(row)).sum::<f64>() / self.trees.len() as f64
    }

    /// Mean leaf output over all trees, per row.
    pub fn predict(&self, x: ArrayView2<f64>) -> Result<Array1<f64>, ForestError> {
        self.check_columns(x.ncols())?;
        Ok(x.rows().into_iter().map(|row| self.predict_row(row)).collect())
    }

    /// Per training row, the mean prediction of the trees that did not draw
    /// it; NaN for rows drawn by every tree. `None` unless fitted with OOB
    /// tracking.
    pub fn oob_predictions(&self) -> Option<&[f64]> {
        self.oob_predictions.as_deref()
    }

    /// Mean squared OOB error over the rows with a defined OOB prediction.
    pub fn oob_mse(&self, y: ArrayView1<f64>) -> Option<f64> {
        let predictions = self.oob_predictions()?;
        let (total, count) = predictions
            .iter()
            .zip(y.iter())
            .filter(|(p, _)| p.is_finite())
            .fold((0.0, 0usize), |(total, count), (p, t)| {
                (total + (p - t).powi(2), count + 1)
            });
        (count > 0).then(|| total / count as f64)
    }

    /// True when the ensemble has at least one tree and every tree is
    /// structurally valid for `n_features` columns.
    pub fn is_well_formed(&self) -> bool {
        self.n_features > 0
            && !self.trees.is_empty()
            && self.trees.iter().all(|t| t.is_well_formed(self.n_features))
    }

    #[cfg(test)]
    pub(crate) fn from_trees(n_features: usize, trees: Vec<RegressionTree>) -> Self {
        Self {
            n_features,
            trees,
            oob_predictions: None,
        }
    }

    pub(crate) fn check_columns(&self, found: usize) -> Result<(), ForestError> {
        if found != self.n_features {
            return Err(ForestError::FeatureCountMismatch {
                expected: self.n_features,
                found,
            });
        }
        Ok(())
    }
}

fn validate_fit_inputs(
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    config: &ForestConfig,
) -> Result<(), ForestError> {
    if x.nrows() != y.len() {
        return Err(ForestError::RowCountMismatch {
            rows: x.nrows(),
            targets: y.len(),
        });
    }
    if x.nrows() < 2 {
        return Err(ForestError::TooFewRows(x.nrows()));
    }
    if x.ncols() == 0 {
        return Err(ForestError::NoFeatures);
    }
    if config.n_trees == 0 {
        return Err(ForestError::NoTrees);
    }
    if config.min_split < 2 {
        return Err(ForestError::MinSplitTooSmall(config.min_split));
    }
    if x.iter().any(|v| !v.is_finite()) {
        return Err(ForestError::NonFiniteInput("parameter matrix"));
    }
    if y.iter().any(|v| !v.is_finite()) {
        return Err(ForestError::NonFiniteInput("outcome vector"));
    }
    Ok(())
}

fn grow_bagged(
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    params: &GrowParams,
    track_oob: bool,
    seed: u64,
) -> GrownTree {
    let mut rng = StdRng::seed_from_u64(seed);
    let n_rows = x.nrows();

    let samples: Vec<usize> = (0..n_rows).map(|_| rng.random_range(0..n_rows)).collect();
    let mut drawn = vec![false; n_rows];
    for &s in &samples {
        drawn[s] = true;
    }

    let tree = tree::grow(x, y, samples, params, &mut rng);

    let oob = if track_oob {
        (0..n_rows)
            .filter(|&row| !drawn[row])
            .map(|row| (row, tree.predict_row(x.row(row))))
            .collect()
    } else {
        Vec::new()
    };

    GrownTree { tree, oob }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array2, array};

    fn linear_data(n: usize) -> (Array2<f64>, Array1<f64>) {
        let x = Array2::from_shape_fn((n, 3), |(i, j)| ((i * (j + 3) + j) % 17) as f64 / 17.0);
        let y = x.column(0).mapv(|v| 4.0 * v) + &x.column(1).mapv(|v| 0.5 * v);
        (x, y)
    }

    fn config(n_trees: usize, oob: bool) -> ForestConfig {
        ForestConfig {
            n_trees,
            min_split: 2,
            max_features: MaxFeatures::Fraction(1.0),
            split_rule: SplitRule::Random,
            oob,
            seed: 1234,
        }
    }

    #[test]
    fn max_features_resolves_to_valid_counts() {
        assert_eq!(MaxFeatures::Count(1).resolve(10), 1);
        assert_eq!(MaxFeatures::Count(50).resolve(10), 10);
        assert_eq!(MaxFeatures::Fraction(0.33).resolve(10), 3);
        assert_eq!(MaxFeatures::Fraction(0.33).resolve(2), 1);
        assert_eq!(MaxFeatures::Fraction(1.0).resolve(7), 7);
    }

    #[test]
    fn identical_seeds_give_identical_trees() {
        let (x, y) = linear_data(40);
        let pool = build_pool(1).unwrap();
        let a = Forest::fit(x.view(), y.view(), &config(10, false), &pool).unwrap();
        let b = Forest::fit(x.view(), y.view(), &config(10, false), &pool).unwrap();
        assert_eq!(a.trees(), b.trees());
    }

    #[test]
    fn pool_size_does_not_change_the_fit() {
        let (x, y) = linear_data(40);
        let single = build_pool(1).unwrap();
        let several = build_pool(4).unwrap();
        let a = Forest::fit(x.view(), y.view(), &config(12, true), &single).unwrap();
        let b = Forest::fit(x.view(), y.view(), &config(12, true), &several).unwrap();
        assert_eq!(a.trees(), b.trees());
        let (pa, pb) = (a.oob_predictions().unwrap(), b.oob_predictions().unwrap());
        for (u, v) in pa.iter().zip(pb) {
            assert!(u.to_bits() == v.to_bits());
        }
    }

    #[test]
    fn different_seeds_give_different_trees() {
        let (x, y) = linear_data(40);
        let pool = build_pool(1).unwrap();
        let mut other = config(10, false);
        other.seed = 99;
        let a = Forest::fit(x.view(), y.view(), &config(10, false), &pool).unwrap();
        let b = Forest::fit(x.view(), y.view(), &other, &pool).unwrap();
        assert_ne!(a.trees(), b.trees());
    }

    #[test]
    fn oob_predictions_are_defined_for_out_of_bag_rows() {
        let (x, y) = linear_data(30);
        let pool = build_pool(2).unwrap();
        let forest = Forest::fit(x.view(), y.view(), &config(50, true), &pool).unwrap();
        let oob = forest.oob_predictions().unwrap();

        assert_eq!(oob.len(), 30);
        // With 50 trees the chance of a row being in-bag everywhere is tiny.
        assert!(oob.iter().filter(|p| p.is_finite()).count() >= 28);
        let mse = forest.oob_mse(y.view()).unwrap();
        assert!(mse.is_finite() && mse >= 0.0);
    }

    #[test]
    fn oob_error_skips_rows_drawn_by_every_tree() {
        let (x, y) = linear_data(30);
        let pool = build_pool(1).unwrap();
        let forest = Forest::fit(x.view(), y.view(), &config(1, true), &pool).unwrap();
        let oob = forest.oob_predictions().unwrap();

        let defined: Vec<usize> = (0..30).filter(|&i| oob[i].is_finite()).collect();
        assert!(!defined.is_empty());
        assert!(defined.len() < 30, "a single bootstrap draw leaves some rows in-bag");

        let tree = &forest.trees()[0];
        let mut expected = 0.0;
        for &i in &defined {
            assert_eq!(oob[i], tree.predict_row(x.row(i)));
            expected += (oob[i] - y[i]).powi(2);
        }
        expected /= defined.len() as f64;

        let mse = forest.oob_mse(y.view()).unwrap();
        assert!(mse.is_finite());
        assert_abs_diff_eq!(mse, expected, epsilon = 1e-12);
    }

    #[test]
    fn oob_is_absent_when_not_requested() {
        let (x, y) = linear_data(20);
        let pool = build_pool(1).unwrap();
        let forest = Forest::fit(x.view(), y.view(), &config(5, false), &pool).unwrap();
        assert!(forest.oob_predictions().is_none());
        assert!(forest.oob_mse(y.view()).is_none());
    }

    #[test]
    fn prediction_is_the_mean_of_tree_outputs() {
        let (x, y) = linear_data(25);
        let pool = build_pool(1).unwrap();
        let forest = Forest::fit(x.view(), y.view(), &config(7, false), &pool).unwrap();
        let predicted = forest.predict(x.view()).unwrap();
        for (i, row) in x.rows().into_iter().enumerate() {
            let mean = forest.trees().iter().map(|t| t.predict_row(row)).sum::<f64>() / 7.0;
            assert_abs_diff_eq!(predicted[i], mean, epsilon = 1e-12);
        }
    }

    #[test]
    fn fit_tracks_the_signal() {
        let (x, y) = linear_data(60);
        let pool = build_pool(2).unwrap();
        let forest = Forest::fit(x.view(), y.view(), &config(30, false), &pool).unwrap();
        let predicted = forest.predict(x.view()).unwrap();
        let mse = (&predicted - &y).mapv(|d| d * d).mean().unwrap();
        let variance = y.var(0.0);
        assert!(mse < 0.25 * variance, "mse {mse} vs variance {variance}");
    }

    #[test]
    fn invalid_inputs_are_rejected() {
        let pool = build_pool(1).unwrap();
        let x = array![[1.0, 2.0], [3.0, 4.0], [5.0, 6.0]];

        let short_y = array![1.0, 2.0];
        assert!(matches!(
            Forest::fit(x.view(), short_y.view(), &config(3, false), &pool),
            Err(ForestError::RowCountMismatch { rows: 3, targets: 2 })
        ));

        let single = array![[1.0, 2.0]];
        assert!(matches!(
            Forest::fit(single.view(), array![1.0].view(), &config(3, false), &pool),
            Err(ForestError::TooFewRows(1))
        ));

        let mut bad_split = config(3, false);
        bad_split.min_split = 1;
        assert!(matches!(
            Forest::fit(x.view(), array![1.0, 2.0, 3.0].view(), &bad_split, &pool),
            Err(ForestError::MinSplitTooSmall(1))
        ));

        assert!(matches!(
            Forest::fit(x.view(), array![1.0, f64::NAN, 3.0].view(), &config(3, false), &pool),
            Err(ForestError::NonFiniteInput(_))
        ));
    }

    #[test]
    fn prediction_checks_column_count() {
        let (x, y) = linear_data(20);
        let pool = build_pool(1).unwrap();
        let forest = Forest::fit(x.view(), y.view(), &config(3, false), &pool).unwrap();
        let narrow = array![[0.1, 0.2]];
        assert!(matches!(
            forest.predict(narrow.view()),
            Err(ForestError::FeatureCountMismatch { expected: 3, found: 2 })
        ));
    }
}
