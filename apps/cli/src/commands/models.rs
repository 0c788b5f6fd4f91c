//! `models` command: lists saved models.

use super::load_config_file;
use crate::args::GlobalArgs;
use anyhow::{Context, Result};
use colored::Colorize;
use dialogkt_training::config::DEFAULT_ARTIFACTS_DIR;
use dialogkt_training::{ArtifactLayout, ModelStore};
use serde_json::json;
use std::path::PathBuf;

pub fn execute(global: &GlobalArgs, json_output: bool) -> Result<()> {
    let file = load_config_file(global)?;
    let root = global
        .artifacts_dir
        .clone()
        .or_else(|| file.and_then(|f| f.run.artifacts_dir))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_ARTIFACTS_DIR));
    let store = ModelStore::new(ArtifactLayout::new(root.clone()));
    let models = store.discover().context("Failed to discover saved models")?;

    if json_output {
        let out: Vec<_> = models
            .iter()
            .map(|m| {
                json!({
                    "model_name": m.model_name,
                    "model_type": m.variant,
                    "run_id": m.run_id,
                    "created_at": m.created_at,
                    "dataset_id": m.dataset_id,
                    "fold": m.fold,
                    "validation_accuracy": m.metrics.as_ref().and_then(|r| r.aggregate.accuracy),
                    "validation_auc": m.metrics.as_ref().and_then(|r| r.aggregate.auc),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!("{}", format!("Saved Models ({})", models.len()).bold().cyan());
    println!();

    if models.is_empty() {
        println!("  {}", format!("No saved models under {}.", root.display()).dimmed());
        println!();
        println!("  {}", "Tip: run `dialogkt train --model_name <name>` to save one.".dimmed());
        return Ok(());
    }

    println!("{:<28} {:<9} {:<5} {:<10} {}", "Name", "Type", "Fold", "Val AUC", "Created");
    println!("{}", "─".repeat(80));
    for m in models {
        let auc = m
            .metrics
            .as_ref()
            .and_then(|r| r.aggregate.auc)
            .map_or_else(|| "-".to_string(), |a| format!("{a:.4}"));
        println!(
            "{:<28} {:<9} {:<5} {:<10} {}",
            m.model_name.cyan(),
            m.variant.as_str(),
            m.fold,
            auc,
            m.created_at.format("%Y-%m-%d %H:%M").to_string().dimmed()
        );
    }
    println!();
    Ok(())
}
