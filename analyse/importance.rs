//! Global feature importance from split gains.

use crate::forest::Forest;

/// A parameter with its normalized importance and 1-based rank.
#[derive(Debug, Clone, PartialEq)]
pub struct RankedFeature {
    pub name: String,
    pub importance: f64,
    pub rank: usize,
}

/// Per-column sum of split gains over every tree, L1-normalized.
///
/// A gain is the weighted variance reduction of one split. An ensemble
/// without any split (or whose splits all gained nothing) yields all zeros.
pub fn importances(forest: &Forest) -> Vec<f64> {
    let mut totals = vec![0.0; forest.n_features()];
    for tree in forest.trees() {
        tree.accumulate_gains(&mut totals);
    }

    let sum: f64 = totals.iter().sum();
    if sum > 0.0 && sum.is_finite() {
        totals.iter_mut().for_each(|v| *v /= sum);
    } else {
        totals.iter_mut().for_each(|v| *v = 0.0);
    }
    totals
}

/// Sorts features by descending importance, breaking ties by column order.
pub fn rank_features(names: &[String], importances: &[f64]) -> Vec<RankedFeature> {
    let mut features: Vec<RankedFeature> = names
        .iter()
        .zip(importances)
        .map(|(name, &importance)| RankedFeature {
            name: name.clone(),
            importance,
            rank: 0,
        })
        .collect();

    // Stable sort keeps column order among equal scores.
    features.sort_by(|a, b| b.importance.total_cmp(&a.importance));
    for (i, feature) in features.iter_mut().enumerate() {
        feature.rank = i + 1;
    }
    features
}
