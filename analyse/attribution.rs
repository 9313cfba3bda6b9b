//! Additive per-sample feature attributions.
//!
//! For every explained row the attributions satisfy
//! `baseline + sum(values[row, ..]) == prediction(row)`. Two modes are
//! offered:
//!
//! * [`AttributionMode::PathOnly`] credits each split on the row's decision
//!   path with the change in node mean it causes. Linear in tree depth.
//! * [`AttributionMode::Exact`] computes exact Shapley values of each tree's
//!   cover-weighted conditional expectation using the polynomial-time
//!   path-tracking recursion of Lundberg et al. (2020), "From local
//!   explanations to global understanding with explainable AI for trees".
//!
//! Both are evaluated per tree and averaged over the ensemble.

use crate::forest::Forest;
use crate::tree::RegressionTree;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, Zip};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How attributions are computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributionMode {
    /// Decision-path contributions (fast, approximate Shapley values).
    #[default]
    PathOnly,
    /// Exact path-dependent Shapley values.
    Exact,
}

#[derive(Error, Debug)]
pub enum AttributionError {
    #[error("The model was fitted on {expected} columns, but {found} were supplied for attribution.")]
    FeatureCountMismatch { expected: usize, found: usize },
}

/// Attributions for a batch of rows.
#[derive(Debug, Clone, PartialEq)]
pub struct Attribution {
    /// The ensemble's unconditional output, shared by every row.
    pub baseline: f64,
    /// One row per explained sample, one column per input feature.
    pub values: Array2<f64>,
}

impl Attribution {
    /// `baseline + row sum` for every row; equals the ensemble prediction.
    pub fn reconstruct(&self) -> Array1<f64> {
        self.values.sum_axis(Axis(1)) + self.baseline
    }

    /// Mean absolute attribution per feature over all explained rows.
    pub fn mean_abs(&self) -> Array1<f64> {
        self.values
            .mapv(f64::abs)
            .mean_axis(Axis(0))
            .unwrap_or_else(|| Array1::zeros(self.values.ncols()))
    }
}

/// Attributes every row of `x` to its input columns.
///
/// Rows are processed in parallel on `pool`; each row's result depends only
/// on that row, so the output is independent of the pool size.
pub fn attribute(
    forest: &Forest,
    x: ArrayView2<f64>,
    mode: AttributionMode,
    pool: &rayon::ThreadPool,
) -> Result<Attribution, AttributionError> {
    if x.ncols() != forest.n_features() {
        return Err(AttributionError::FeatureCountMismatch {
            expected: forest.n_features(),
            found: x.ncols(),
        });
    }

    let n_trees = forest.trees().len() as f64;
    let mut values = Array2::<f64>::zeros((x.nrows(), x.ncols()));

    pool.install(|| {
        Zip::from(values.rows_mut())
            .and(x.rows())
            .par_for_each(|mut out, row| {
                let mut phi = vec![0.0; row.len()];
                for tree in forest.trees() {
                    match mode {
                        AttributionMode::PathOnly => path_contributions(tree, row, &mut phi),
                        AttributionMode::Exact => tree_shap(tree, row, &mut phi),
                    }
                }
                for (slot, total) in out.iter_mut().zip(phi) {
                    *slot = total / n_trees;
                }
            });
    });

    Ok(Attribution {
        baseline: forest.baseline(),
        values,
    })
}

/// Adds `value(child) - value(node)` to the split feature of every node on
/// the row's path.
fn path_contributions(tree: &RegressionTree, row: ArrayView1<f64>, phi: &mut [f64]) {
    let mut node = 0;
    while !tree.is_leaf(node) {
        let (child, _) = tree.branches(node, row);
        phi[tree.feature(node)] += tree.value(child) - tree.value(node);
        node = child;
    }
}

/// One entry of the unique-feature path tracked by the exact recursion.
#[derive(Debug, Clone, Copy)]
struct PathElement {
    /// `None` for the sentinel element at the root.
    feature: Option<usize>,
    /// Fraction of "feature absent" flow that passes this split.
    zero_fraction: f64,
    /// Whether the row itself passes this split (1 or 0).
    one_fraction: f64,
    /// Weight of the subsets of a given size that reach this point.
    weight: f64,
}

fn tree_shap(tree: &RegressionTree, row: ArrayView1<f64>, phi: &mut [f64]) {
    let path = Vec::with_capacity(tree.depth() + 1);
    shap_recurse(tree, row, phi, 0, path, 1.0, 1.0, None);
}

#[allow(clippy::too_many_arguments)]
fn shap_recurse(
    tree: &RegressionTree,
    row: ArrayView1<f64>,
    phi: &mut [f64],
    node: usize,
    mut path: Vec<PathElement>,
    zero_fraction: f64,
    one_fraction: f64,
    feature: Option<usize>,
) {
    extend_path(&mut path, zero_fraction, one_fraction, feature);

    if tree.is_leaf(node) {
        let value = tree.value(node);
        for i in 1..path.len() {
            let element = path[i];
            if let Some(f) = element.feature {
                let weight = unwound_path_sum(&path, i);
                phi[f] += weight * (element.one_fraction - element.zero_fraction) * value;
            }
        }
        return;
    }

    let split_feature = tree.feature(node);
    let (hot, cold) = tree.branches(node, row);
    let hot_zero = tree.cover(hot) / tree.cover(node);
    let cold_zero = tree.cover(cold) / tree.cover(node);

    // A feature seen earlier on the path is merged into a single element.
    let mut incoming_zero = 1.0;
    let mut incoming_one = 1.0;
    if let Some(k) = (1..path.len()).find(|&i| path[i].feature == Some(split_feature)) {
        incoming_zero = path[k].zero_fraction;
        incoming_one = path[k].one_fraction;
        unwind_path(&mut path, k);
    }

    shap_recurse(
        tree,
        row,
        phi,
        hot,
        path.clone(),
        hot_zero * incoming_zero,
        incoming_one,
        Some(split_feature),
    );
    shap_recurse(
        tree,
        row,
        phi,
        cold,
        path,
        cold_zero * incoming_zero,
        0.0,
        Some(split_feature),
    );
}

fn extend_path(
    path: &mut Vec<PathElement>,
    zero_fraction: f64,
    one_fraction: f64,
    feature: Option<usize>,
) {
    let depth = path.len();
    path.push(PathElement {
        feature,
        zero_fraction,
        one_fraction,
        weight: if depth == 0 { 1.0 } else { 0.0 },
    });
    let scale = (depth + 1) as f64;
    for i in (0..depth).rev() {
        path[i + 1].weight += one_fraction * path[i].weight * (i + 1) as f64 / scale;
        path[i].weight = zero_fraction * path[i].weight * (depth - i) as f64 / scale;
    }
}

/// Removes element `index` from the path, undoing its `extend_path`.
fn unwind_path(path: &mut Vec<PathElement>, index: usize) {
    let depth = path.len() - 1;
    let PathElement {
        zero_fraction: zero,
        one_fraction: one,
        ..
    } = path[index];
    let scale = (depth + 1) as f64;

    let mut next = path[depth].weight;
    for i in (0..depth).rev() {
        if one != 0.0 {
            let current = path[i].weight;
            path[i].weight = next * scale / ((i + 1) as f64 * one);
            next = current - path[i].weight * zero * (depth - i) as f64 / scale;
        } else {
            path[i].weight = path[i].weight * scale / (zero * (depth - i) as f64);
        }
    }

    for i in index..depth {
        path[i].feature = path[i + 1].feature;
        path[i].zero_fraction = path[i + 1].zero_fraction;
        path[i].one_fraction = path[i + 1].one_fraction;
    }
    path.pop();
}

/// Total weight the path would carry with element `index` unwound, without
/// modifying it.
fn unwound_path_sum(path: &[PathElement], index: usize) -> f64 {
    let depth = path.len() - 1;
    let zero = path[index].zero_fraction;
    let one = path[index].one_fraction;
    let scale = (depth + 1) as f64;

    let mut next = path[depth].weight;
    let mut total = 0.0;
    for i in (0..depth).rev() {
        if one != 0.0 {
            let share = next * scale / ((i + 1) as f64 * one);
            total += share;
            next = path[i].weight - share * zero * (depth - i) as f64 / scale;
        } else if zero != 0.0 {
            total += path[i].weight / zero / ((depth - i) as f64 / scale);
        }
    }
    total
}
