//! dialogkt CLI - knowledge-tracing experiments over tutoring dialogues
//!
//! Provides the `dialogkt` command for training, testing and inspecting
//! knowledge-tracing models with optional cross-validation and
//! hyperparameter sweeps.

mod args;
mod commands;

use args::{GlobalArgs, ModelArgs, RunArgs, TrainArgs};
use clap::{Parser, Subcommand};
use colored::Colorize;
use dialogkt_training::TrainingError;
use tokio_util::sync::CancellationToken;
use tracing::{Level, warn};
use tracing_subscriber::FmtSubscriber;

/// dialogkt - knowledge tracing over tutoring dialogues
#[derive(Parser, Debug)]
#[command(
    name = "dialogkt",
    author,
    version,
    about = "Knowledge-tracing experiments over tutoring dialogues",
    long_about = "dialogkt trains and evaluates knowledge-tracing models (LM-based, DKT, BKT and baselines)\non tutoring dialogue datasets, with optional cross-validation and hyperparameter sweeps."
)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Train a model, or sweep hyperparameters with --hyperparam_sweep
    ///
    /// Trained weights are saved under the artifacts directory as
    /// `<model_name>` (or `<model_name>_fold<i>` with --crossval).
    Train {
        #[command(flatten)]
        run: RunArgs,

        #[command(flatten)]
        train: TrainArgs,

        /// Output the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Evaluate a saved model, or fit and score a baseline
    Test {
        #[command(flatten)]
        run: RunArgs,

        /// Output the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Write per-turn KC mastery predictions for the fold-0 test split
    Visualize {
        #[command(flatten)]
        model: ModelArgs,

        /// Output the predictions as JSON
        #[arg(long)]
        json: bool,
    },

    /// List saved models
    Models {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

/// Exit status for a failed run: the code of the first [`TrainingError`] in
/// the chain, or 1.
fn exit_code(err: &anyhow::Error) -> i32 {
    err.chain().find_map(|cause| cause.downcast_ref::<TrainingError>()).map_or(1, TrainingError::exit_code)
}

fn install_ctrl_c(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling after the current epoch");
            cancel.cancel();
        }
    });
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    let level = match cli.global.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .without_time()
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("{} {e}", "Warning:".yellow().bold());
    }

    let cancel = CancellationToken::new();
    install_ctrl_c(cancel.clone());

    let result = match cli.command {
        Command::Train { run, train, json } => commands::run::train(&cli.global, &run, &train, json, cancel).await,
        Command::Test { run, json } => commands::run::test(&cli.global, &run, json, cancel).await,
        Command::Visualize { model, json } => commands::visualize::execute(&cli.global, &model, json),
        Command::Models { json } => commands::models::execute(&cli.global, json),
    };

    if let Err(err) = result {
        eprintln!("{} {err:#}", "Error:".red().bold());
        std::process::exit(exit_code(&err));
    }
}
