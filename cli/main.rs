#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]

use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::process;

use episens::attribution::AttributionMode;
use episens::data::{load_parameter_table, load_sample_set};
use episens::forest::build_pool;
use episens::importance::rank_features;
use episens::model::SurrogateModel;
use episens::pipeline::{AnalysisConfig, MAX_SEED, run_analysis};
use episens::report;
use episens::search::SEARCH_TREES;
use episens::tree::SplitRule;

#[derive(Clone, Copy, ValueEnum)]
pub enum AttributionCli {
    /// Decision-path contributions (fast)
    PathOnly,
    /// Exact Shapley values
    Exact,
}

impl From<AttributionCli> for AttributionMode {
    fn from(value: AttributionCli) -> Self {
        match value {
            AttributionCli::PathOnly => AttributionMode::PathOnly,
            AttributionCli::Exact => AttributionMode::Exact,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
pub enum SplitRuleCli {
    /// One random threshold per candidate column (extremely randomized trees)
    Random,
    /// Best midpoint threshold per candidate column
    Best,
}

impl From<SplitRuleCli> for SplitRule {
    fn from(value: SplitRuleCli) -> Self {
        match value {
            SplitRuleCli::Random => SplitRule::Random,
            SplitRuleCli::Best => SplitRule::Best,
        }
    }
}

#[derive(Args)]
pub struct AnalyseArgs {
    /// Directory containing input_parameter_samples.csv and output_loss_samples.csv
    #[arg(value_name = "WORK_DIR")]
    pub work_dir: PathBuf,

    /// Seed of every metric's random stream
    #[arg(
        long,
        default_value_t = 1234,
        value_parser = clap::value_parser!(u64).range(..=MAX_SEED)
    )]
    pub seed: u64,

    /// Number of worker threads for tree construction and attribution
    #[arg(long, default_value_t = 1)]
    pub n_jobs: usize,

    #[arg(long, value_enum, default_value_t = AttributionCli::PathOnly)]
    pub attribution: AttributionCli,

    #[arg(long, value_enum, default_value_t = SplitRuleCli::Random)]
    pub split_rule: SplitRuleCli,

    /// Number of trees in the final per-metric ensemble
    #[arg(long, default_value_t = episens::pipeline::FINAL_TREES)]
    pub trees: usize,

    /// Where to write models and reports (defaults to WORK_DIR)
    #[arg(long, value_name = "DIR")]
    pub out_dir: Option<PathBuf>,
}

#[derive(Args)]
pub struct PredictArgs {
    /// Path to a saved <metric>.model file
    #[arg(value_name = "MODEL")]
    pub model: PathBuf,

    /// CSV with an identifier column followed by the model's parameter columns
    #[arg(value_name = "SAMPLES_CSV")]
    pub samples: PathBuf,

    /// Also write per-sample attributions
    #[arg(long)]
    pub explain: bool,

    #[arg(long, value_enum, default_value_t = AttributionCli::PathOnly)]
    pub attribution: AttributionCli,

    #[arg(long, default_value_t = 1)]
    pub n_jobs: usize,

    /// Output directory for predictions.csv and attributions.csv
    #[arg(long, value_name = "DIR", default_value = ".")]
    pub out_dir: PathBuf,
}

#[derive(Parser)]
#[command(
    name = "episens",
    about = "Surrogate-model sensitivity analysis of epidemic simulation outputs",
    long_about = "Fits a randomized tree ensemble per simulated outcome metric, ranks the \
                 sampled model parameters by importance and explains held-out predictions.",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Fit one surrogate per outcome metric and rank the parameters
    #[command(
        about = "Analyse sampled simulations (outputs: relative_importance.csv, <metric>.model, reports)"
    )]
    Analyse(AnalyseArgs),

    /// Apply a saved surrogate to new parameter samples
    #[command(about = "Predict with a saved model (outputs: predictions.csv)")]
    Predict(PredictArgs),
}

/// Caps the requested worker count at the number of logical CPUs.
fn effective_jobs(requested: usize) -> usize {
    let available = num_cpus::get().max(1);
    if requested > available {
        log::warn!("--n-jobs {requested} exceeds the {available} available CPUs; using {available}");
    }
    requested.clamp(1, available)
}

fn analyse(args: AnalyseArgs) -> Result<(), Box<dyn std::error::Error>> {
    let out_dir = args.out_dir.unwrap_or_else(|| args.work_dir.clone());
    let samples = load_sample_set(&args.work_dir)?;

    let config = AnalysisConfig {
        seed: args.seed,
        n_jobs: effective_jobs(args.n_jobs),
        search_trees: SEARCH_TREES,
        final_trees: args.trees,
        attribution: args.attribution.into(),
        split_rule: args.split_rule.into(),
    };
    let summary = run_analysis(&samples, &config, &out_dir)?;

    println!(
        "Analysed {} of {} metrics; results written to {}",
        summary.completed.len(),
        samples.metrics().len(),
        out_dir.display()
    );
    let table = &summary.importances;
    for metric in table.metrics() {
        if let Some(top) = table
            .get(metric)
            .and_then(|values| rank_features(table.parameters(), values).into_iter().next())
        {
            println!("  {metric}: most influential parameter is {} ({:.3})", top.name, top.importance);
        }
    }
    for failure in &summary.failures {
        println!("  skipped: {failure}");
    }
    if summary.completed.is_empty() && !summary.failures.is_empty() {
        return Err("every metric failed".into());
    }
    Ok(())
}

fn predict(args: PredictArgs) -> Result<(), Box<dyn std::error::Error>> {
    let model = SurrogateModel::load(&args.model)?;
    log::info!(
        "Loaded model for '{}' ({} trees over {} parameters)",
        model.metric,
        model.forest.trees().len(),
        model.feature_names.len()
    );
    let samples = load_parameter_table(&args.samples)?;
    let predicted = model.predict(&samples)?;

    let predictions_path = args.out_dir.join("predictions.csv");
    report::write_predictions(&predictions_path, samples.ids(), predicted.view(), None)?;
    println!("Predictions saved to: {}", predictions_path.display());

    if args.explain {
        let pool = build_pool(effective_jobs(args.n_jobs))?;
        let attribution = model.explain(&samples, args.attribution.into(), &pool)?;
        let attributions_path = args.out_dir.join("attributions.csv");
        report::write_attributions(
            &attributions_path,
            samples.ids(),
            &model.feature_names,
            &attribution,
        )?;
        println!("Attributions saved to: {}", attributions_path.display());
    }
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let Cli { command } = Cli::parse();
    let result = match command {
        Some(Commands::Analyse(args)) => analyse(args),
        Some(Commands::Predict(args)) => predict(args),
        None => Cli::command().print_help().map_err(Into::into),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}
