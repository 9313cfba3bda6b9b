//! Randomized regression trees in a flat node layout.
//!
//! Nodes are stored as parallel arrays indexed by node id, with the root at
//! id 0. Every node keeps the mean outcome and the number of (bootstrap)
//! samples that reached it; split nodes additionally keep the weighted
//! variance reduction they achieved. Those three per-node statistics are
//! what the importance extractor and the attribution engine consume.

use ndarray::{ArrayView1, ArrayView2};
use rand::Rng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

/// Child id stored for leaves.
pub const NO_CHILD: u32 = u32::MAX;

/// Values closer than this are treated as identical when probing a column.
const FEATURE_THRESHOLD: f64 = 1e-7;

/// How a candidate threshold is chosen for a drawn column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SplitRule {
    /// One uniformly drawn threshold between the column's node minimum and
    /// maximum (extremely randomized trees).
    #[default]
    Random,
    /// The best midpoint between consecutive distinct values.
    Best,
}

/// Growth limits for a single tree.
#[derive(Debug, Clone, Copy)]
pub struct GrowParams {
    pub min_split: usize,
    pub max_features: usize,
    pub split_rule: SplitRule,
}

/// A fitted regression tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegressionTree {
    pub(crate) features: Vec<u32>,
    pub(crate) thresholds: Vec<f64>,
    pub(crate) left: Vec<u32>,
    pub(crate) right: Vec<u32>,
    pub(crate) values: Vec<f64>,
    pub(crate) covers: Vec<f64>,
    pub(crate) gains: Vec<f64>,
}

impl RegressionTree {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            features: Vec::with_capacity(capacity),
            thresholds: Vec::with_capacity(capacity),
            left: Vec::with_capacity(capacity),
            right: Vec::with_capacity(capacity),
            values: Vec::with_capacity(capacity),
            covers: Vec::with_capacity(capacity),
            gains: Vec::with_capacity(capacity),
        }
    }

    fn push_leaf(&mut self, value: f64, cover: f64) -> usize {
        self.features.push(0);
        self.thresholds.push(0.0);
        self.left.push(NO_CHILD);
        self.right.push(NO_CHILD);
        self.values.push(value);
        self.covers.push(cover);
        self.gains.push(0.0);
        self.values.len() - 1
    }

    pub fn n_nodes(&self) -> usize {
        self.values.len()
    }

    /// Number of internal (split) nodes.
    pub fn n_splits(&self) -> usize {
        self.left.iter().filter(|&&l| l != NO_CHILD).count()
    }

    #[inline]
    pub fn is_leaf(&self, node: usize) -> bool {
        self.left[node] == NO_CHILD
    }

    #[inline]
    pub fn feature(&self, node: usize) -> usize {
        self.features[node] as usize
    }

    #[inline]
    pub fn value(&self, node: usize) -> f64 {
        self.values[node]
    }

    #[inline]
    pub fn cover(&self, node: usize) -> f64 {
        self.covers[node]
    }

    /// Mean outcome over the tree's whole training sample.
    pub fn root_value(&self) -> f64 {
        self.values[0]
    }

    /// The child a row descends into from an internal node, followed by the
    /// sibling it does not take.
    #[inline]
    pub fn branches(&self, node: usize, row: ArrayView1<f64>) -> (usize, usize) {
        let left = self.left[node] as usize;
        let right = self.right[node] as usize;
        if row[self.features[node] as usize] <= self.thresholds[node] {
            (left, right)
        } else {
            (right, left)
        }
    }

    /// Id of the leaf reached by `row`.
    pub fn leaf_index(&self, row: ArrayView1<f64>) -> usize {
        let mut node = 0;
        while !self.is_leaf(node) {
            node = self.branches(node, row).0;
        }
        node
    }

    pub fn predict_row(&self, row: ArrayView1<f64>) -> f64 {
        self.values[self.leaf_index(row)]
    }

    /// Adds every split's variance reduction to the entry of its feature.
    pub fn accumulate_gains(&self, totals: &mut [f64]) {
        for node in 0..self.n_nodes() {
            if !self.is_leaf(node) {
                totals[self.feature(node)] += self.gains[node];
            }
        }
    }

    /// Checks the invariants a deserialized tree must satisfy before it can
    /// be traversed: equal array lengths, children stored after their parent,
    /// in-range split features and positive covers.
    pub fn is_well_formed(&self, n_features: usize) -> bool {
        let n = self.values.len();
        let lengths_match = [
            self.features.len(),
            self.thresholds.len(),
            self.left.len(),
            self.right.len(),
            self.covers.len(),
            self.gains.len(),
        ]
        .iter()
        .all(|&len| len == n);
        if n == 0 || !lengths_match {
            return false;
        }

        (0..n).all(|node| {
            let (l, r) = (self.left[node], self.right[node]);
            let cover_ok = self.covers[node] > 0.0;
            if l == NO_CHILD || r == NO_CHILD {
                return cover_ok && l == r;
            }
            let (l, r) = (l as usize, r as usize);
            cover_ok && l > node && r > node && l < n && r < n && self.feature(node) < n_features
        })
    }

    /// Length of the longest root-to-leaf path, counted in nodes.
    pub fn depth(&self) -> usize {
        let mut deepest = 0;
        let mut stack = vec![(0usize, 1usize)];
        while let Some((node, depth)) = stack.pop() {
            deepest = deepest.max(depth);
            if !self.is_leaf(node) {
                stack.push((self.left[node] as usize, depth + 1));
                stack.push((self.right[node] as usize, depth + 1));
            }
        }
        deepest
    }
}

/// Sufficient statistics of the outcomes in one node.
#[derive(Debug, Clone, Copy, Default)]
struct NodeStats {
    count: f64,
    sum: f64,
}

impl NodeStats {
    fn add(&mut self, y: f64) {
        self.count += 1.0;
        self.sum += y;
    }

    fn mean(&self) -> f64 {
        self.sum / self.count
    }

    /// `sum²/count`, the part of the weighted impurity a split can improve.
    fn proxy(&self) -> f64 {
        self.sum * self.sum / self.count
    }
}

/// A chosen split for one node.
#[derive(Debug, Clone, Copy)]
struct Split {
    feature: usize,
    threshold: f64,
    proxy: f64,
}

/// Grows one tree from a bootstrap sample.
///
/// `samples` holds row indices into `x`/`y`; duplicates are expected and each
/// occurrence counts as one unit of cover.
pub(crate) fn grow(
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    mut samples: Vec<usize>,
    params: &GrowParams,
    rng: &mut StdRng,
) -> RegressionTree {
    let mut tree = RegressionTree::with_capacity(2 * samples.len() / params.min_split.max(1) + 1);
    let mut candidates: Vec<usize> = (0..x.ncols()).collect();

    let (root_value, root_cover) = node_summary(y, &samples);
    tree.push_leaf(root_value, root_cover);

    let mut stack = vec![(0usize, 0usize, samples.len())];
    while let Some((node, start, end)) = stack.pop() {
        let segment = &mut samples[start..end];
        if segment.len() < params.min_split || node_variance(y, segment) <= f64::EPSILON {
            continue;
        }

        let Some(split) = find_split(x, y, segment, params, &mut candidates, rng) else {
            continue;
        };

        let mid = start + partition(x, segment, split.feature, split.threshold);
        let (left_value, left_cover) = node_summary(y, &samples[start..mid]);
        let (right_value, right_cover) = node_summary(y, &samples[mid..end]);

        let parent = stats_of(y, &samples[start..end]);
        let gain = (split.proxy - parent.proxy()).max(0.0);

        let left = tree.push_leaf(left_value, left_cover);
        let right = tree.push_leaf(right_value, right_cover);
        tree.features[node] = split.feature as u32;
        tree.thresholds[node] = split.threshold;
        tree.left[node] = left as u32;
        tree.right[node] = right as u32;
        tree.gains[node] = gain;

        stack.push((right, mid, end));
        stack.push((left, start, mid));
    }

    tree
}

fn stats_of(y: ArrayView1<f64>, samples: &[usize]) -> NodeStats {
    let mut stats = NodeStats::default();
    for &s in samples {
        stats.add(y[s]);
    }
    stats
}

fn node_summary(y: ArrayView1<f64>, samples: &[usize]) -> (f64, f64) {
    let stats = stats_of(y, samples);
    (stats.mean(), stats.count)
}

/// Two-pass variance, used for the zero-variance stopping rule.
fn node_variance(y: ArrayView1<f64>, samples: &[usize]) -> f64 {
    let n = samples.len() as f64;
    let mean = samples.iter().map(|&s| y[s]).sum::<f64>() / n;
    samples.iter().map(|&s| (y[s] - mean).powi(2)).sum::<f64>() / n
}

/// Draws columns without replacement until `max_features` non-constant ones
/// have been scored, and returns the best split among them.
fn find_split(
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    samples: &[usize],
    params: &GrowParams,
    candidates: &mut [usize],
    rng: &mut StdRng,
) -> Option<Split> {
    let mut best: Option<Split> = None;
    let mut remaining = candidates.len();
    let mut scored = 0;

    while remaining > 0 && scored < params.max_features {
        let pick = rng.random_range(0..remaining);
        candidates.swap(pick, remaining - 1);
        remaining -= 1;
        let feature = candidates[remaining];

        let (lo, hi) = column_range(x, samples, feature);
        if hi <= lo + FEATURE_THRESHOLD {
            continue;
        }
        scored += 1;

        let found = match params.split_rule {
            SplitRule::Random => random_split(x, y, samples, feature, lo, hi, rng),
            SplitRule::Best => best_split(x, y, samples, feature),
        };
        if let Some(split) = found {
            if best.is_none_or(|b| split.proxy > b.proxy) {
                best = Some(split);
            }
        }
    }

    best
}

fn column_range(x: ArrayView2<f64>, samples: &[usize], feature: usize) -> (f64, f64) {
    samples
        .iter()
        .map(|&s| x[[s, feature]])
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
            (lo.min(v), hi.max(v))
        })
}

fn random_split(
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    samples: &[usize],
    feature: usize,
    lo: f64,
    hi: f64,
    rng: &mut StdRng,
) -> Option<Split> {
    let mut threshold = lo + rng.random::<f64>() * (hi - lo);
    if threshold >= hi {
        threshold = lo;
    }

    let mut left = NodeStats::default();
    let mut right = NodeStats::default();
    for &s in samples {
        if x[[s, feature]] <= threshold {
            left.add(y[s]);
        } else {
            right.add(y[s]);
        }
    }
    if left.count == 0.0 || right.count == 0.0 {
        return None;
    }
    Some(Split {
        feature,
        threshold,
        proxy: left.proxy() + right.proxy(),
    })
}

fn best_split(
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    samples: &[usize],
    feature: usize,
) -> Option<Split> {
    let mut pairs: Vec<(f64, f64)> = samples.iter().map(|&s| (x[[s, feature]], y[s])).collect();
    pairs.sort_by(|a, b| a.0.total_cmp(&b.0));

    let mut total = NodeStats::default();
    for &(_, v) in &pairs {
        total.add(v);
    }

    let mut left = NodeStats::default();
    let mut best: Option<Split> = None;
    for i in 0..pairs.len() - 1 {
        left.add(pairs[i].1);
        let (current, next) = (pairs[i].0, pairs[i + 1].0);
        if next <= current + FEATURE_THRESHOLD {
            continue;
        }
        let right = NodeStats {
            count: total.count - left.count,
            sum: total.sum - left.sum,
        };
        let proxy = left.proxy() + right.proxy();
        if best.is_none_or(|b| proxy > b.proxy) {
            let mut threshold = current / 2.0 + next / 2.0;
            if threshold >= next {
                threshold = current;
            }
            best = Some(Split {
                feature,
                threshold,
                proxy,
            });
        }
    }
    best
}

/// Reorders `samples` so rows going left come first; returns the left count.
fn partition(x: ArrayView2<f64>, samples: &mut [usize], feature: usize, threshold: f64) -> usize {
    let mut boundary = 0;
    for i in 0..samples.len() {
        if x[[samples[i], feature]] <= threshold {
            samples.swap(i, boundary);
            boundary += 1;
        }
    }
    boundary
}
