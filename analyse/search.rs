//! Out-of-bag hyperparameter search.
//!
//! Every `(min_split, max_features)` pair of a small grid is fitted once with
//! out-of-bag tracking enabled and scored by its OOB mean squared error. One
//! fit per candidate is enough because the OOB rows act as the validation
//! set.

use crate::forest::{Forest, ForestConfig, ForestError, MaxFeatures};
use crate::tree::SplitRule;
use itertools::{Itertools, iproduct};
use ndarray::{ArrayView1, ArrayView2};
use rand::Rng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

/// Trees per candidate ensemble during the search.
pub const SEARCH_TREES: usize = 50;

/// Number of log-spaced points the `min_split` grid is drawn from.
const MIN_SPLIT_GRID_POINTS: usize = 10;

/// Upper bound of the `min_split` grid, before the half-sample cap.
const MIN_SPLIT_CAP: f64 = 1000.0;

/// The two tuned hyperparameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Hyperparameters {
    pub min_split: usize,
    pub max_features: MaxFeatures,
}

/// One scored grid point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    pub hyperparameters: Hyperparameters,
    /// `None` when no fit row was out-of-bag for any tree.
    pub oob_mse: Option<f64>,
}

/// Result of a search: the winner and every candidate in enumeration order.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchOutcome {
    pub best: Hyperparameters,
    pub best_mse: Option<f64>,
    pub candidates: Vec<Candidate>,
}

/// Settings shared by every candidate fit.
#[derive(Debug, Clone, Copy)]
pub struct SearchSettings {
    pub n_trees: usize,
    pub split_rule: SplitRule,
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            n_trees: SEARCH_TREES,
            split_rule: SplitRule::Random,
        }
    }
}

/// Distinct `min_split` candidates, ascending.
///
/// Ten log-spaced points between 2 and `min(1000, n_fit_rows / 2)`, rounded
/// half-to-even and clamped to at least 2.
pub fn min_split_candidates(n_fit_rows: usize) -> Vec<usize> {
    let upper = MIN_SPLIT_CAP.min(n_fit_rows as f64 / 2.0).max(f64::MIN_POSITIVE);
    let (start, stop) = (2f64.log10(), upper.log10());
    let step = (stop - start) / (MIN_SPLIT_GRID_POINTS - 1) as f64;

    (0..MIN_SPLIT_GRID_POINTS)
        .map(|i| 10f64.powf(start + step * i as f64).round_ties_even() as usize)
        .map(|m| m.max(2))
        .sorted_unstable()
        .dedup()
        .collect()
}

/// Feature-subsampling candidates in their fixed order: one column, a third
/// of the columns, all columns.
pub fn max_features_candidates() -> [MaxFeatures; 3] {
    [
        MaxFeatures::Count(1),
        MaxFeatures::Fraction(0.33),
        MaxFeatures::Fraction(1.0),
    ]
}

/// Scores every grid point and keeps the lowest OOB MSE.
///
/// Candidates are enumerated by `min_split` ascending, then in the fixed
/// `max_features` order; a later candidate replaces the incumbent only when
/// strictly better, so ties keep the first one. Each candidate's seed is the
/// next draw from `rng`.
pub fn search(
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    settings: &SearchSettings,
    rng: &mut StdRng,
    pool: &rayon::ThreadPool,
) -> Result<SearchOutcome, ForestError> {
    let grid: Vec<Hyperparameters> = iproduct!(
        min_split_candidates(x.nrows()),
        max_features_candidates()
    )
    .map(|(min_split, max_features)| Hyperparameters {
        min_split,
        max_features,
    })
    .collect();

    let mut candidates = Vec::with_capacity(grid.len());
    let mut best: Option<(Hyperparameters, f64)> = None;

    for hyperparameters in grid {
        let config = ForestConfig {
            n_trees: settings.n_trees,
            min_split: hyperparameters.min_split,
            max_features: hyperparameters.max_features,
            split_rule: settings.split_rule,
            oob: true,
            seed: rng.random(),
        };
        let forest = Forest::fit(x, y, &config, pool)?;
        let oob_mse = forest.oob_mse(y);

        log::debug!(
            "min_split={:>4} max_features={:<16} oob_mse={}",
            hyperparameters.min_split,
            hyperparameters.max_features.to_string(),
            oob_mse.map_or_else(|| "undefined".to_string(), |m| format!("{m:.6e}"))
        );

        if let Some(mse) = oob_mse.filter(|m| m.is_finite()) {
            if best.is_none_or(|(_, incumbent)| mse < incumbent) {
                best = Some((hyperparameters, mse));
            }
        }
        candidates.push(Candidate {
            hyperparameters,
            oob_mse,
        });
    }

    let (best, best_mse) = match best {
        Some((hyperparameters, mse)) => (hyperparameters, Some(mse)),
        None => {
            let first = candidates[0].hyperparameters;
            log::warn!(
                "No candidate produced a finite out-of-bag error; falling back to min_split={} and {}",
                first.min_split,
                first.max_features
            );
            (first, None)
        }
    };

    Ok(SearchOutcome {
        best,
        best_mse,
        candidates,
    })
}
