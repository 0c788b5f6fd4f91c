//! Flags of the `train`, `test` and `visualize` subcommands.

use clap::Args;
use clap::builder::BoolishValueParser;
use dialogkt_training::TrainingResult;
use dialogkt_training::config::{RawArgs, RunMode};
use std::path::PathBuf;

/// Options that apply to every invocation.
#[derive(Args, Debug, Clone)]
#[command(rename_all = "snake_case")]
pub struct GlobalArgs {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// TOML file with run defaults and per-model-type option defaults
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Directory holding `<dataset>.jsonl` [default: data]
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Root of saved models and results [default: .dialogkt]
    #[arg(long, global = true)]
    pub artifacts_dir: Option<PathBuf>,

    /// Run seed [default: 221]
    #[arg(long, global = true)]
    pub seed: Option<u64>,

    /// Number of cross-validation folds [default: 5]
    #[arg(long, global = true)]
    pub num_folds: Option<usize>,

    /// Reject batch sizes whose estimated footprint exceeds this many MiB
    #[arg(long, global = true)]
    pub memory_budget_mb: Option<u64>,
}

/// Dataset, model and scoring-protocol options accepted by every subcommand
/// that loads a model.
#[derive(Args, Debug, Clone, Default)]
#[command(rename_all = "snake_case")]
pub struct ModelArgs {
    /// Dataset (comta, mathdial) [default: comta]
    #[arg(long)]
    pub dataset: Option<String>,

    /// Keep each subject in a single fold
    #[arg(long)]
    pub split_by_subject: bool,

    /// MathDial dialogues below this typicality are dropped [default: 1]
    #[arg(long)]
    pub typical_cutoff: Option<i64>,

    /// KC tag source (base, atc) [default: atc]
    #[arg(long)]
    pub tag_src: Option<String>,

    /// Keep only a small slice of the dataset
    #[arg(long)]
    pub debug: bool,

    /// Model type (lmkt, dkt, bkt, majority, random) [default: lmkt]
    #[arg(long)]
    pub model_type: Option<String>,

    /// Saved model to write (train) or read (test)
    #[arg(long)]
    pub model_name: Option<String>,

    /// Frozen base encoder identifier
    #[arg(long)]
    pub base_model: Option<String>,

    /// Reveal the first labelled turn of every dialogue without scoring it
    #[arg(long)]
    pub inc_first_label: bool,

    /// Predict every KC of a turn from one encoding [default: true]
    #[arg(long, value_parser = BoolishValueParser::new())]
    pub pack_kcs: Option<bool>,

    /// Quantize the frozen projection to 4 bits [default: false]
    #[arg(long, value_parser = BoolishValueParser::new())]
    pub quantize: Option<bool>,

    /// Condition on true past labels when scoring [default: false]
    #[arg(long, value_parser = BoolishValueParser::new())]
    pub prompt_inc_labels: Option<bool>,

    /// Hidden size of the DKT recurrent cell
    #[arg(long)]
    pub emb_size: Option<usize>,
}

/// Options of the `train` and `test` experiment runs.
#[derive(Args, Debug, Clone, Default)]
#[command(rename_all = "snake_case")]
pub struct RunArgs {
    #[command(flatten)]
    pub model: ModelArgs,

    #[arg(long)]
    pub batch_size: Option<usize>,

    /// Run every fold instead of fold 0 only
    #[arg(long)]
    pub crossval: bool,

    /// Score the validation split instead of the test split
    #[arg(long)]
    pub testonval: bool,

    /// Folds run concurrently [default: 1]
    #[arg(long)]
    pub max_parallel: Option<usize>,

    /// Metric ranking epochs and sweep candidates (auc, accuracy, f1) [default: auc]
    #[arg(long)]
    pub selection_metric: Option<String>,
}

/// Options only meaningful when training.
#[derive(Args, Debug, Clone, Default)]
#[command(rename_all = "snake_case")]
pub struct TrainArgs {
    #[arg(long)]
    pub epochs: Option<usize>,

    /// Learning rate
    #[arg(long)]
    pub lr: Option<f64>,

    /// Weight decay
    #[arg(long)]
    pub wd: Option<f64>,

    /// Gradient clipping norm
    #[arg(long)]
    pub gc: Option<f64>,

    #[arg(long)]
    pub grad_accum_steps: Option<usize>,

    /// LoRA rank
    #[arg(long)]
    pub r: Option<usize>,

    #[arg(long)]
    pub lora_alpha: Option<f64>,

    #[arg(long)]
    pub lora_dropout: Option<f64>,

    /// Optimizer (adamw, adafactor) [default: adamw]
    #[arg(long)]
    pub optim: Option<String>,

    /// Saved adapters to continue training from
    #[arg(long)]
    pub pt_model_name: Option<String>,

    /// Search the hyperparameter space on the validation split
    #[arg(long)]
    pub hyperparam_sweep: bool,

    /// TOML search space for --hyperparam_sweep
    #[arg(long)]
    pub sweep_space: Option<PathBuf>,

    /// Stop after this many epochs without validation improvement
    #[arg(long)]
    pub patience: Option<usize>,
}

/// Builds resolver input from the flags every model-loading subcommand shares.
///
/// Enumerated values are parsed here so that a bad value surfaces as a
/// configuration error naming the flag.
pub fn model_raw_args(mode: RunMode, global: &GlobalArgs, model: &ModelArgs) -> TrainingResult<RawArgs> {
    let mut raw = RawArgs::new(mode);
    raw.dataset = model.dataset.as_deref().map(str::parse).transpose()?;
    raw.split_by_subject = model.split_by_subject;
    raw.typical_cutoff = model.typical_cutoff;
    raw.tag_src = model.tag_src.as_deref().map(str::parse).transpose()?;
    raw.debug = model.debug;
    raw.model_type.clone_from(&model.model_type);
    raw.model_name.clone_from(&model.model_name);
    raw.inc_first_label = model.inc_first_label;
    raw.pack_kcs = model.pack_kcs;
    raw.prompt_inc_labels = model.prompt_inc_labels;

    raw.data_dir.clone_from(&global.data_dir);
    raw.artifacts_dir.clone_from(&global.artifacts_dir);
    raw.seed = global.seed;
    raw.num_folds = global.num_folds;
    raw.memory_budget_mb = global.memory_budget_mb;

    raw.overrides.base_model.clone_from(&model.base_model);
    raw.overrides.quantize = model.quantize;
    raw.overrides.emb_size = model.emb_size;
    Ok(raw)
}

/// Builds resolver input for a `train` or `test` run.
pub fn raw_args(
    mode: RunMode,
    global: &GlobalArgs,
    run: &RunArgs,
    train: Option<&TrainArgs>,
) -> TrainingResult<RawArgs> {
    let mut raw = model_raw_args(mode, global, &run.model)?;
    raw.crossval = run.crossval;
    raw.testonval = run.testonval;
    raw.max_parallel = run.max_parallel;
    raw.selection_metric = run.selection_metric.as_deref().map(str::parse).transpose()?;
    raw.overrides.batch_size = run.batch_size;

    if let Some(train) = train {
        raw.overrides.epochs = train.epochs;
        raw.overrides.lr = train.lr;
        raw.overrides.wd = train.wd;
        raw.overrides.gc = train.gc;
        raw.overrides.grad_accum_steps = train.grad_accum_steps;
        raw.overrides.r = train.r;
        raw.overrides.lora_alpha = train.lora_alpha;
        raw.overrides.lora_dropout = train.lora_dropout;
        raw.overrides.optim = train.optim.as_deref().map(str::parse).transpose()?;
        raw.overrides.pt_model_name.clone_from(&train.pt_model_name);
        raw.overrides.patience = train.patience;
        raw.hyperparam_sweep = train.hyperparam_sweep;
        raw.sweep_space.clone_from(&train.sweep_space);
    }
    Ok(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dialogkt_training::config::{DatasetName, OptimizerKind};

    fn global() -> GlobalArgs {
        GlobalArgs {
            log_level: "info".to_string(),
            config: None,
            data_dir: Some(PathBuf::from("fixtures")),
            artifacts_dir: None,
            seed: Some(7),
            num_folds: Some(3),
            memory_budget_mb: None,
        }
    }

    #[test]
    fn test_raw_args_maps_shared_and_train_flags() {
        let run = RunArgs {
            model: ModelArgs {
                dataset: Some("mathdial".to_string()),
                model_type: Some("dkt".to_string()),
                emb_size: Some(16),
                ..ModelArgs::default()
            },
            crossval: true,
            ..RunArgs::default()
        };
        let train = TrainArgs { lr: Some(0.01), optim: Some("adafactor".to_string()), ..TrainArgs::default() };

        let raw = raw_args(RunMode::Train, &global(), &run, Some(&train)).unwrap();
        assert_eq!(raw.dataset, Some(DatasetName::Mathdial));
        assert_eq!(raw.overrides.emb_size, Some(16));
        assert_eq!(raw.overrides.lr, Some(0.01));
        assert_eq!(raw.overrides.optim, Some(OptimizerKind::Adafactor));
        assert_eq!(raw.seed, Some(7));
        assert_eq!(raw.num_folds, Some(3));
        assert!(raw.crossval);
    }

    #[test]
    fn test_unknown_enum_value_is_a_config_error() {
        let model = ModelArgs { tag_src: Some("llm".to_string()), ..ModelArgs::default() };
        let err = model_raw_args(RunMode::Test, &global(), &model).unwrap_err();
        assert_eq!(err.exit_code(), 2);
        assert!(err.to_string().contains("tag_src"));
    }

    #[test]
    fn test_model_raw_args_leaves_run_options_unset() {
        let model = ModelArgs { model_type: Some("bkt".to_string()), quantize: Some(true), ..ModelArgs::default() };
        let raw = model_raw_args(RunMode::Test, &global(), &model).unwrap();
        assert_eq!(raw.model_type.as_deref(), Some("bkt"));
        assert_eq!(raw.overrides.quantize, Some(true));
        assert!(!raw.crossval);
        assert!(!raw.testonval);
        assert_eq!(raw.overrides.batch_size, None);
        assert_eq!(raw.max_parallel, None);
    }
}
