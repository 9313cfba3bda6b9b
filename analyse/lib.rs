#![deny(dead_code)]
#![deny(unused_imports)]

//! Surrogate-model sensitivity analysis for stochastic epidemic simulations.
//!
//! Parameter samples and simulated outcome metrics go in; per-metric
//! randomized tree ensembles, normalized feature importances and additive
//! per-sample attributions come out.

pub mod attribution;
pub mod data;
pub mod forest;
pub mod importance;
pub mod model;
pub mod pipeline;
pub mod report;
pub mod search;
pub mod tree;
