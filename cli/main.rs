#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

use clap::{Args, CommandFactory, Parser, Subcommand};
use std::error::Error;
use std::path::PathBuf;
use std::process;

use casefold::assemble::{AssembleConfig, assemble_and_save};
use casefold::config::PipelineConfig;
use casefold::impute::run_imputation;
use casefold::samples::run_sample_indexing;
use casefold::select::{CorrelationSelector, run_feature_selection};
use casefold::train::run_training;

type CliResult = Result<(), Box<dyn Error>>;

#[derive(Args)]
struct ConfigArgs {
    /// Pipeline configuration file (TOML)
    #[arg(long, value_name = "FILE")]
    config: PathBuf,
}

#[derive(Parser)]
#[command(
    name = "casefold",
    about = "Clinical feature-matrix assembly, imputation and per-target model selection",
    long_about = "Assembles per-case feature files into training and evaluation matrices, \
                 cleans and imputes them two ways, indexes samples into five folds per target, \
                 selects features, and picks and trains the best of six model combinations per target."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Assemble the training matrix, and the evaluation matrix when configured
    #[command(about = "Assemble feature matrices (outputs: <stem>.bin, <stem>_names.bin)")]
    Assemble(ConfigArgs),

    /// Clean columns and impute both splits
    #[command(about = "Clean and impute matrices (outputs: <stem>_mImp*, <stem>_rImp*)")]
    Impute(ConfigArgs),

    /// Write per-target feature-row, target-row and case-id indices
    #[command(about = "Index samples into full and fold records")]
    IndexSamples(ConfigArgs),

    /// Run feature selection for every sample key
    #[command(about = "Select features per key (outputs: <key>-mImp.txt, <key>-rImp.txt)")]
    SelectFeatures(ConfigArgs),

    /// Cross-validate, pick and refit the best combination per target
    #[command(about = "Train per-target models (outputs: model_types.txt, predictions_out.txt, probabilities_out.txt)")]
    Train(ConfigArgs),

    /// Run every configured stage in order
    #[command(about = "Run the whole pipeline")]
    Run(ConfigArgs),

    /// Print the default configuration for an experiment directory
    #[command(about = "Print the standard experiment layout as TOML")]
    Layout {
        #[arg(long, value_name = "DIR")]
        base_dir: PathBuf,
    },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let result = match cli.command {
        Some(Commands::Assemble(args)) => load(&args).and_then(|c| assemble_stage(&c)),
        Some(Commands::Impute(args)) => load(&args).and_then(|c| impute_stage(&c)),
        Some(Commands::IndexSamples(args)) => load(&args).and_then(|c| index_stage(&c)),
        Some(Commands::SelectFeatures(args)) => load(&args).and_then(|c| select_stage(&c, true)),
        Some(Commands::Train(args)) => load(&args).and_then(|c| train_stage(&c)),
        Some(Commands::Run(args)) => load(&args).and_then(|c| run_all(&c)),
        Some(Commands::Layout { base_dir }) => print_layout(base_dir),
        None => print_help(),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn load(args: &ConfigArgs) -> Result<PipelineConfig, Box<dyn Error>> {
    let config = PipelineConfig::load(&args.config)?;
    log::info!("Loaded configuration from '{}'", args.config.display());
    Ok(config)
}

fn assemble_one(label: &str, config: &AssembleConfig) -> CliResult {
    log::info!("Assembling {label} matrix from '{}'", config.feature_directory.display());
    let matrix = assemble_and_save(config)?;
    println!(
        "Assembled {label} matrix {:?} -> '{}'",
        matrix.shape(),
        config.output_stem.display()
    );
    Ok(())
}

fn assemble_stage(config: &PipelineConfig) -> CliResult {
    assemble_one("training", config.assemble()?)?;
    if let Some(eval) = &config.evaluation_assemble {
        assemble_one("evaluation", eval)?;
    }
    Ok(())
}

fn impute_stage(config: &PipelineConfig) -> CliResult {
    let summary = run_imputation(config.impute()?)?;
    println!(
        "Kept {} columns; regression-imputed train {:?} / eval {:?}, median-imputed train {:?} / eval {:?}",
        summary.kept_columns.len(),
        summary.regression.train.shape(),
        summary.regression.eval.shape(),
        summary.median.train.shape(),
        summary.median.eval.shape()
    );
    Ok(())
}

fn index_stage(config: &PipelineConfig) -> CliResult {
    let samples = config.samples()?;
    let records = run_sample_indexing(samples)?;
    println!(
        "Indexed {} sample records -> '{}'",
        records.len(),
        samples.feature_samples_out.display()
    );
    Ok(())
}

fn select_stage(config: &PipelineConfig, strict: bool) -> CliResult {
    let selection = config.selection()?;
    let selector: CorrelationSelector = selection.selector;
    let report = run_feature_selection(selection, &selector)?;
    println!(
        "Feature selection: {} files written, {} tasks failed",
        report.succeeded.len(),
        report.failed.len()
    );
    if strict && !report.is_complete() {
        return Err(format!("{} feature-selection tasks failed", report.failed.len()).into());
    }
    Ok(())
}

fn train_stage(config: &PipelineConfig) -> CliResult {
    let training = config.training()?;
    let report = run_training(training)?;
    println!(
        "Trained {} targets ({} failed); results in '{}'",
        report.succeeded.len(),
        report.failed.len(),
        training.result_dir.display()
    );
    Ok(())
}

fn run_all(config: &PipelineConfig) -> CliResult {
    if config.assemble.is_some() {
        assemble_stage(config)?;
    }
    if config.impute.is_some() {
        impute_stage(config)?;
    }
    if config.samples.is_some() {
        index_stage(config)?;
    }
    // Failed selection tasks surface again as per-target training failures.
    if config.selection.is_some() {
        select_stage(config, false)?;
    }
    if config.training.is_some() {
        train_stage(config)?;
    }
    Ok(())
}

fn print_help() -> CliResult {
    Cli::command().print_help()?;
    println!();
    Ok(())
}

fn print_layout(base_dir: PathBuf) -> CliResult {
    print!("{}", PipelineConfig::for_experiment(&base_dir).to_toml()?);
    Ok(())
}
