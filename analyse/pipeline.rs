//! Per-metric orchestration.
//!
//! Every outcome metric runs through the same sequence of stages:
//!
//! ```text
//! Split -> Search -> FitFinal -> ExtractImportance -> Attribute -> Persist -> Report
//! ```
//!
//! Metrics are processed one after another in column order, each with its
//! own random stream seeded from the run seed, so a metric's results do not
//! depend on which other metrics are present. A failing metric is logged and
//! recorded; the run carries on with the next one. Importances enter the
//! aggregate table as soon as extraction succeeds, so a later failure while
//! attributing or writing artifacts does not lose them.

use crate::attribution::{self, Attribution, AttributionError, AttributionMode};
use crate::data::{DataError, SampleSet};
use crate::forest::{self, Forest, ForestConfig, ForestError};
use crate::importance::{importances, rank_features};
use crate::model::{MODEL_EXTENSION, ModelError, SurrogateModel};
use crate::report::{self, IMPORTANCE_FILE, ImportanceTable, ReportError};
use crate::search::{self, Hyperparameters, SEARCH_TREES, SearchSettings};
use crate::tree::SplitRule;
use indicatif::{ProgressBar, ProgressStyle};
use ndarray::Array1;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Trees in the persisted per-metric ensemble.
pub const FINAL_TREES: usize = 100;

/// Run settings written next to the outputs.
pub const CONFIG_FILE: &str = "analysis_config.toml";

/// Largest seed the TOML artifacts can record; TOML integers are signed
/// 64-bit.
pub const MAX_SEED: u64 = i64::MAX as u64;

/// Settings of one analysis run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisConfig {
    pub seed: u64,
    pub n_jobs: usize,
    pub search_trees: usize,
    pub final_trees: usize,
    pub attribution: AttributionMode,
    pub split_rule: SplitRule,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            seed: 1234,
            n_jobs: 1,
            search_trees: SEARCH_TREES,
            final_trees: FINAL_TREES,
            attribution: AttributionMode::PathOnly,
            split_rule: SplitRule::Random,
        }
    }
}

/// The stage a metric was in when it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStage {
    Split,
    Search,
    FitFinal,
    ExtractImportance,
    Attribute,
    Persist,
    Report,
}

impl PipelineStage {
    pub fn describe(self) -> &'static str {
        match self {
            Self::Split => "splitting samples into fit and held-out sets",
            Self::Search => "searching hyperparameters",
            Self::FitFinal => "fitting the final ensemble",
            Self::ExtractImportance => "extracting feature importances",
            Self::Attribute => "attributing held-out predictions",
            Self::Persist => "saving the fitted model",
            Self::Report => "writing report files",
        }
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error(
        "Cannot split the samples: {fit} fit rows and {held_out} held-out rows, but both sets need at least 2."
    )]
    DegenerateSplit { fit: usize, held_out: usize },
    #[error("Failed to load samples: {0}")]
    Data(#[from] DataError),
    #[error("Ensemble error: {0}")]
    Forest(#[from] ForestError),
    #[error("Attribution error: {0}")]
    Attribution(#[from] AttributionError),
    #[error("Failed to persist the model: {0}")]
    ModelPersistence(#[from] ModelError),
    #[error("Failed to write a report: {0}")]
    Report(#[from] ReportError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to serialize the run configuration: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),
}

/// Why and where one metric's analysis stopped.
#[derive(Debug)]
pub struct MetricFailure {
    pub metric: String,
    pub stage: PipelineStage,
    pub error: PipelineError,
}

impl fmt::Display for MetricFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "metric '{}' failed while {}: {}", self.metric, self.stage, self.error)
    }
}

/// Maps an error raised in `stage` to a failure record for `metric`.
fn at_stage<E: Into<PipelineError>>(
    metric: &str,
    stage: PipelineStage,
) -> impl FnOnce(E) -> MetricFailure + '_ {
    move |error| MetricFailure {
        metric: metric.to_string(),
        stage,
        error: error.into(),
    }
}

/// A metric after `ExtractImportance`.
#[derive(Debug, Clone)]
pub struct FittedMetric {
    pub metric: String,
    pub fit_rows: Vec<usize>,
    pub held_out_rows: Vec<usize>,
    pub hyperparameters: Hyperparameters,
    /// Out-of-bag MSE of the winning search candidate.
    pub search_mse: Option<f64>,
    pub forest: Forest,
    pub importances: Vec<f64>,
}

/// A metric after `Attribute`.
#[derive(Debug, Clone)]
pub struct MetricOutcome {
    pub fitted: FittedMetric,
    pub held_out_ids: Vec<String>,
    pub predicted: Array1<f64>,
    pub actual: Array1<f64>,
    pub attribution: Attribution,
    pub held_out_correlation: Option<f64>,
    pub held_out_mse: Option<f64>,
}

/// What a run produced.
#[derive(Debug)]
pub struct RunSummary {
    pub importances: ImportanceTable,
    /// Metrics that went through every stage.
    pub completed: Vec<String>,
    pub failures: Vec<MetricFailure>,
}

/// Shuffles row indices and splits them into `(fit, held_out)`; the held-out
/// set gets `ceil(n / 2)` rows.
pub fn split_rows(n_rows: usize, rng: &mut StdRng) -> Result<(Vec<usize>, Vec<usize>), PipelineError> {
    let mut order: Vec<usize> = (0..n_rows).collect();
    order.shuffle(rng);

    let n_held_out = n_rows.div_ceil(2);
    let fit = order.split_off(n_held_out);
    if fit.len() < 2 || order.len() < 2 {
        return Err(PipelineError::DegenerateSplit {
            fit: fit.len(),
            held_out: order.len(),
        });
    }
    Ok((fit, order))
}

/// Runs `Split` through `ExtractImportance` for one metric.
pub fn fit_metric(
    samples: &SampleSet,
    metric_index: usize,
    config: &AnalysisConfig,
    pool: &rayon::ThreadPool,
) -> Result<FittedMetric, MetricFailure> {
    let metric = &samples.metrics()[metric_index];
    let mut rng = StdRng::seed_from_u64(config.seed);

    let y = samples.outcome(metric_index);
    if y.iter().any(|v| !v.is_finite()) {
        let bad = y.iter().filter(|v| !v.is_finite()).count();
        return Err(at_stage(metric, PipelineStage::Split)(PipelineError::InvalidInput(format!(
            "{bad} of {} values of '{metric}' are missing or not numeric",
            y.len()
        ))));
    }
    let (fit_rows, held_out_rows) =
        split_rows(samples.n_trials(), &mut rng).map_err(at_stage(metric, PipelineStage::Split))?;
    log::debug!(
        "'{metric}': {} fit rows, {} held-out rows",
        fit_rows.len(),
        held_out_rows.len()
    );

    let x_fit = samples.parameters.select_rows(&fit_rows);
    let y_fit = y.select(ndarray::Axis(0), &fit_rows);

    let settings = SearchSettings {
        n_trees: config.search_trees,
        split_rule: config.split_rule,
    };
    let outcome = search::search(x_fit.view(), y_fit.view(), &settings, &mut rng, pool)
        .map_err(at_stage(metric, PipelineStage::Search))?;
    log::info!(
        "'{metric}': selected min_split={} with {} (OOB MSE {})",
        outcome.best.min_split,
        outcome.best.max_features,
        outcome
            .best_mse
            .map_or_else(|| "undefined".to_string(), |m| format!("{m:.6e}"))
    );

    let final_config = ForestConfig {
        n_trees: config.final_trees,
        min_split: outcome.best.min_split,
        max_features: outcome.best.max_features,
        split_rule: config.split_rule,
        oob: false,
        seed: rng.random(),
    };
    let forest = Forest::fit(x_fit.view(), y_fit.view(), &final_config, pool)
        .map_err(at_stage(metric, PipelineStage::FitFinal))?;

    let importances = importances(&forest);
    if forest.n_splits() == 0 {
        log::warn!("'{metric}': the final ensemble has no splits; importances are all zero");
    }

    Ok(FittedMetric {
        metric: metric.clone(),
        fit_rows,
        held_out_rows,
        hyperparameters: outcome.best,
        search_mse: outcome.best_mse,
        forest,
        importances,
    })
}

/// Runs `Attribute` for a fitted metric.
pub fn explain_metric(
    samples: &SampleSet,
    fitted: FittedMetric,
    mode: AttributionMode,
    pool: &rayon::ThreadPool,
) -> Result<MetricOutcome, MetricFailure> {
    let metric = fitted.metric.clone();
    let metric_index = samples
        .metrics()
        .iter()
        .position(|m| *m == metric)
        .ok_or_else(|| {
            at_stage(&metric, PipelineStage::Attribute)(PipelineError::InvalidInput(format!(
                "'{metric}' is not an outcome column"
            )))
        })?;

    let x_held_out = samples.parameters.select_rows(&fitted.held_out_rows);
    let actual = samples
        .outcome(metric_index)
        .select(ndarray::Axis(0), &fitted.held_out_rows);

    let predicted = fitted
        .forest
        .predict(x_held_out.view())
        .map_err(at_stage(&metric, PipelineStage::Attribute))?;
    let attribution = attribution::attribute(&fitted.forest, x_held_out.view(), mode, pool)
        .map_err(at_stage(&metric, PipelineStage::Attribute))?;

    let held_out_correlation = report::pearson(predicted.view(), actual.view());
    let held_out_mse = report::mean_squared_error(predicted.view(), actual.view());
    log::info!(
        "'{metric}': held-out correlation {}, MSE {}",
        held_out_correlation.map_or_else(|| "undefined".to_string(), |r| format!("{r:.3}")),
        held_out_mse.map_or_else(|| "undefined".to_string(), |m| format!("{m:.6e}"))
    );

    Ok(MetricOutcome {
        held_out_ids: samples.parameters.select_ids(&fitted.held_out_rows),
        fitted,
        predicted,
        actual,
        attribution,
        held_out_correlation,
        held_out_mse,
    })
}

/// Runs `Persist` and `Report`: saves the model and writes the per-metric
/// CSV files into `out_dir`, all named `<stem>.<suffix>`.
pub fn persist_metric(
    samples: &SampleSet,
    outcome: &MetricOutcome,
    config: &AnalysisConfig,
    out_dir: &Path,
    stem: &str,
) -> Result<(), MetricFailure> {
    let fitted = &outcome.fitted;
    let metric = fitted.metric.as_str();
    let parameters = samples.parameters.columns();

    let model = SurrogateModel {
        metric: metric.to_string(),
        seed: config.seed,
        split_rule: config.split_rule,
        feature_names: parameters.to_vec(),
        hyperparameters: fitted.hyperparameters,
        forest: fitted.forest.clone(),
    };
    let model_path = report::artifact_path(out_dir, stem, MODEL_EXTENSION);
    model
        .save(&model_path)
        .map_err(at_stage(metric, PipelineStage::Persist))?;

    let write_reports = || -> Result<(), ReportError> {
        report::write_predictions(
            &report::artifact_path(out_dir, stem, "predictions.csv"),
            &outcome.held_out_ids,
            outcome.predicted.view(),
            Some(outcome.actual.view()),
        )?;
        report::write_attributions(
            &report::artifact_path(out_dir, stem, "attributions.csv"),
            &outcome.held_out_ids,
            parameters,
            &outcome.attribution,
        )?;
        report::write_summary(
            &report::artifact_path(out_dir, stem, "summary.csv"),
            parameters,
            &fitted.importances,
            outcome.attribution.mean_abs().view(),
        )
    };
    write_reports().map_err(at_stage(metric, PipelineStage::Report))
}

/// Analyses every outcome metric of `samples` and writes all artifacts into
/// `out_dir`.
///
/// Per-metric failures are collected in the summary. Only problems affecting
/// the whole run (an invalid configuration, an unwritable output directory)
/// are returned as errors.
pub fn run_analysis(
    samples: &SampleSet,
    config: &AnalysisConfig,
    out_dir: &Path,
) -> Result<RunSummary, PipelineError> {
    validate_config(config)?;
    fs::create_dir_all(out_dir)?;
    fs::write(out_dir.join(CONFIG_FILE), toml::to_string_pretty(config)?)?;

    let pool = forest::build_pool(config.n_jobs)?;
    let metrics = samples.metrics();
    log::info!(
        "Analysing {} metric(s) over {} trials and {} parameters with {} worker(s)",
        metrics.len(),
        samples.n_trials(),
        samples.parameters.n_columns(),
        config.n_jobs
    );

    let pb = ProgressBar::new(metrics.len() as u64);
    if let Ok(style) = ProgressStyle::with_template(
        "\n> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
    ) {
        pb.set_style(style.progress_chars("█▉▊▋▌▍▎▏  "));
    }

    let stems = report::metric_stems(metrics);
    let mut table = ImportanceTable::new(samples.parameters.columns().to_vec());
    let mut completed = Vec::new();
    let mut failures = Vec::new();

    for (index, (metric, stem)) in metrics.iter().zip(&stems).enumerate() {
        pb.set_message(metric.clone());
        let result = fit_metric(samples, index, config, &pool).and_then(|fitted| {
            table
                .append(metric, fitted.importances.clone())
                .map_err(at_stage(metric, PipelineStage::ExtractImportance))?;
            for feature in rank_features(samples.parameters.columns(), &fitted.importances)
                .iter()
                .take(3)
            {
                log::info!(
                    "'{metric}': #{} {} ({:.3})",
                    feature.rank,
                    feature.name,
                    feature.importance
                );
            }
            let outcome = explain_metric(samples, fitted, config.attribution, &pool)?;
            persist_metric(samples, &outcome, config, out_dir, stem)
        });

        match result {
            Ok(()) => completed.push(metric.clone()),
            Err(failure) => {
                log::error!("{failure}");
                failures.push(failure);
            }
        }
        pb.inc(1);
    }
    pb.finish_and_clear();

    if table.is_empty() {
        log::warn!("No metric reached importance extraction; {IMPORTANCE_FILE} lists parameters only");
    }
    table.write_csv(&out_dir.join(IMPORTANCE_FILE))?;
    log::info!(
        "Finished: {} of {} metric(s) completed, importances written to {}",
        completed.len(),
        metrics.len(),
        out_dir.join(IMPORTANCE_FILE).display()
    );

    Ok(RunSummary {
        importances: table,
        completed,
        failures,
    })
}

fn validate_config(config: &AnalysisConfig) -> Result<(), PipelineError> {
    if config.seed > MAX_SEED {
        return Err(PipelineError::InvalidInput(format!(
            "seed {} is larger than the maximum of {MAX_SEED}",
            config.seed
        )));
    }
    if config.n_jobs == 0 {
        return Err(PipelineError::InvalidInput(
            "n_jobs must be at least 1".to_string(),
        ));
    }
    if config.search_trees == 0 || config.final_trees == 0 {
        return Err(PipelineError::InvalidInput(
            "ensembles need at least one tree".to_string(),
        ));
    }
    Ok(())
}
