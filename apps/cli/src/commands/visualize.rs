//! `visualize` command.

use super::load_config_file;
use crate::args::{GlobalArgs, ModelArgs, model_raw_args};
use anyhow::Result;
use colored::Colorize;
use dialogkt_training::config::RunMode;
use dialogkt_training::{Experiment, resolve};

pub fn execute(global: &GlobalArgs, model: &ModelArgs, json_output: bool) -> Result<()> {
    let file = load_config_file(global)?;
    let raw = model_raw_args(RunMode::Test, global, model)?;
    let config = resolve(&raw, file.as_ref())?;
    let (report, path) = Experiment::new(config).visualize()?;

    if json_output {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let turns: usize = report.dialogues.iter().map(|d| d.turns.len()).sum();
    println!();
    println!("{}", "Predictions written".bold().green());
    println!("  Model:     {}", report.model_type.to_string().cyan());
    println!("  Dialogues: {}", report.dialogues.len());
    println!("  Turns:     {}", turns);
    println!("  Output:    {}", path.display().to_string().dimmed());
    println!();
    Ok(())
}
