//! `train` and `test` commands.

use super::load_config_file;
use crate::args::{GlobalArgs, RunArgs, TrainArgs, raw_args};
use anyhow::Result;
use colored::Colorize;
use dialogkt_training::config::{RunMode, SelectionMetric};
use dialogkt_training::sweep::CandidateStatus;
use dialogkt_training::{
    CvSummary, Experiment, FoldStatus, MeanStd, NullProgressSink, ProgressSink, RunReport, StdoutProgressSink,
    SweepReport, TrainingError, resolve,
};
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn progress_sink(json_output: bool) -> Arc<dyn ProgressSink> {
    if json_output { Arc::new(NullProgressSink) } else { Arc::new(StdoutProgressSink) }
}

pub async fn train(
    global: &GlobalArgs,
    run: &RunArgs,
    train: &TrainArgs,
    json_output: bool,
    cancel: CancellationToken,
) -> Result<()> {
    let file = load_config_file(global)?;
    let raw = raw_args(RunMode::Train, global, run, Some(train))?;
    let config = resolve(&raw, file.as_ref())?;
    let experiment = Experiment::new(config).with_progress(progress_sink(json_output)).with_cancellation(cancel);

    if experiment.config().hyperparam_sweep {
        let (report, path) = experiment.sweep(&raw, file.as_ref()).await?;
        if json_output {
            println!("{}", serde_json::to_string_pretty(&report)?);
        } else {
            print_sweep(&report, &path);
        }
    } else {
        let (report, path) = experiment.run().await?;
        print_run(&report, &path, json_output)?;
        check_complete(&report.summary, &path)?;
    }
    Ok(())
}

pub async fn test(global: &GlobalArgs, run: &RunArgs, json_output: bool, cancel: CancellationToken) -> Result<()> {
    let file = load_config_file(global)?;
    let raw = raw_args(RunMode::Test, global, run, None)?;
    let config = resolve(&raw, file.as_ref())?;
    let experiment = Experiment::new(config).with_progress(progress_sink(json_output)).with_cancellation(cancel);

    let (report, path) = experiment.run().await?;
    print_run(&report, &path, json_output)?;
    check_complete(&report.summary, &path)
}

/// Fails a run whose summary only covers the folds finished before cancellation.
fn check_complete(summary: &CvSummary, path: &Path) -> Result<()> {
    if summary.cancelled {
        return Err(anyhow::Error::from(TrainingError::Cancelled).context(format!(
            "{} of {} folds completed, partial results in {}",
            summary.completed,
            summary.folds.len(),
            path.display()
        )));
    }
    Ok(())
}

fn format_mean_std(value: Option<&MeanStd>) -> String {
    match value {
        Some(MeanStd { mean, std: Some(std), .. }) => format!("{mean:.4} ± {std:.4}"),
        Some(MeanStd { mean, std: None, .. }) => format!("{mean:.4}"),
        None => "n/a".to_string(),
    }
}

fn print_summary(summary: &CvSummary) {
    println!("  {:<10} {}", "Accuracy", format_mean_std(summary.aggregate.accuracy.as_ref()).cyan());
    println!("  {:<10} {}", "AUC", format_mean_std(summary.aggregate.auc.as_ref()).cyan());
    println!("  {:<10} {}", "F1", format_mean_std(summary.aggregate.f1.as_ref()).cyan());
    println!("  {:<10} {}", "Loss", format_mean_std(summary.aggregate.loss.as_ref()).dimmed());
    println!();

    println!("{:<6} {:<10} {}", "Fold", "Status", "Accuracy");
    println!("{}", "─".repeat(40));
    for fold in &summary.folds {
        let status = match fold.status {
            FoldStatus::Completed => "completed".green(),
            FoldStatus::Diverged => "diverged".red(),
            FoldStatus::Cancelled => "cancelled".yellow(),
        };
        let accuracy = fold
            .metrics
            .as_ref()
            .and_then(|m| m.aggregate.accuracy)
            .map_or_else(|| "-".to_string(), |a| format!("{a:.4}"));
        println!("{:<6} {:<10} {}", fold.fold, status, accuracy);
        if let Some(error) = &fold.error {
            println!("       {}", error.dimmed());
        }
    }
}

fn print_run(report: &RunReport, path: &Path, json_output: bool) -> Result<()> {
    if json_output {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    let title = match report.mode {
        RunMode::Train => "Training complete",
        RunMode::Test => "Evaluation complete",
    };
    println!();
    println!("{}", title.bold().green());
    println!("  Model:   {}", report.model_type.to_string().cyan());
    println!("  Split:   {}", report.summary.split);
    println!("  Folds:   {}/{}", report.summary.completed, report.summary.folds.len());
    println!();
    print_summary(&report.summary);
    println!();
    println!("  Results: {}", path.display().to_string().dimmed());
    println!();
    Ok(())
}

fn metric_name(metric: SelectionMetric) -> &'static str {
    match metric {
        SelectionMetric::Auc => "AUC",
        SelectionMetric::Accuracy => "accuracy",
        SelectionMetric::F1 => "F1",
    }
}

fn print_sweep(report: &SweepReport, path: &Path) {
    let result = &report.result;
    println!();
    println!("{}", format!("Sweep complete ({} candidates)", result.history.len()).bold().green());
    println!("  Model:     {}", report.model_type.to_string().cyan());
    println!("  Selection: validation {}", metric_name(result.selection_metric));
    println!();

    println!("{:<4} {:<40} {}", "#", "Assignments", "Value");
    println!("{}", "─".repeat(60));
    for candidate in &result.history {
        let assignments = candidate
            .assignments
            .iter()
            .map(|a| format!("{}={}", a.param.as_str(), a.value))
            .collect::<Vec<_>>()
            .join(" ");
        let value = match (candidate.status, candidate.selection_value) {
            (CandidateStatus::Completed, Some(v)) => format!("{v:.4}"),
            (CandidateStatus::Completed, None) => "n/a".to_string(),
            (CandidateStatus::Failed, _) => "failed".red().to_string(),
        };
        let marker = if candidate.index == result.best { "*".green().bold() } else { " ".normal() };
        println!("{marker}{:<3} {:<40} {}", candidate.index, assignments, value);
    }
    println!();
    println!("  Results: {}", path.display().to_string().dimmed());
    println!("  {}", "Re-run `dialogkt test` with the best assignments to score the test split.".dimmed());
    println!();
}
