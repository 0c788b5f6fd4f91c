//! Run configuration.
//!
//! Raw command-line values ([`RawArgs`]) and an optional TOML file
//! ([`ConfigFile`]) are merged by [`resolve`] into an immutable [`RunConfig`].

mod file;
mod resolver;

pub use file::{ConfigFile, RunDefaults};
pub use resolver::{builtin_overrides, resolve};

use dialogkt_models::ModelConfig;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::TrainingError;

/// Default run seed.
pub const DEFAULT_SEED: u64 = 221;

/// Default number of cross-validation folds.
pub const DEFAULT_NUM_FOLDS: usize = 5;

/// Default root of saved models and results.
pub const DEFAULT_ARTIFACTS_DIR: &str = ".dialogkt";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetName {
    Comta,
    Mathdial,
}

impl DatasetName {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Comta => "comta",
            Self::Mathdial => "mathdial",
        }
    }
}

impl fmt::Display for DatasetName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DatasetName {
    type Err = TrainingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "comta" => Ok(Self::Comta),
            "mathdial" => Ok(Self::Mathdial),
            other => Err(TrainingError::config("dataset", format!("unknown dataset `{other}`"))),
        }
    }
}

/// Which annotation provides the KC tags of a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TagSource {
    /// Tags generated by an LLM.
    Base,
    /// Achieve-the-Core standards.
    #[default]
    Atc,
}

impl FromStr for TagSource {
    type Err = TrainingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "base" => Ok(Self::Base),
            "atc" => Ok(Self::Atc),
            other => Err(TrainingError::config("tag_src", format!("unknown tag source `{other}`"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerKind {
    #[default]
    Adamw,
    Adafactor,
}

impl FromStr for OptimizerKind {
    type Err = TrainingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "adamw" => Ok(Self::Adamw),
            "adafactor" => Ok(Self::Adafactor),
            other => Err(TrainingError::config("optim", format!("unknown optimizer `{other}`"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Train,
    Test,
}

/// Metric used to rank epochs and sweep candidates. Higher is better.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionMetric {
    /// Macro AUC, falling back to accuracy when no KC has both classes.
    #[default]
    Auc,
    Accuracy,
    F1,
}

impl FromStr for SelectionMetric {
    type Err = TrainingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auc" => Ok(Self::Auc),
            "accuracy" | "acc" => Ok(Self::Accuracy),
            "f1" => Ok(Self::F1),
            other => Err(TrainingError::config("selection_metric", format!("unknown selection metric `{other}`"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetConfig {
    pub dataset: DatasetName,
    pub split_by_subject: bool,
    pub typical_cutoff: i64,
    pub tag_src: TagSource,
    pub debug: bool,
    pub num_folds: usize,
    pub data_dir: PathBuf,
}

impl DatasetConfig {
    /// `<data_dir>/<dataset>.jsonl`
    #[must_use]
    pub fn path(&self) -> PathBuf {
        self.data_dir.join(format!("{}.jsonl", self.dataset))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimConfig {
    pub optimizer: OptimizerKind,
    pub lr: f64,
    pub wd: f64,
    pub gc: f64,
    pub grad_accum_steps: usize,
    pub batch_size: usize,
    pub epochs: usize,
    /// Stop after this many epochs without validation improvement.
    pub patience: Option<usize>,
}

impl OptimConfig {
    /// Number of samples contributing to one optimizer step.
    #[must_use]
    pub const fn effective_batch_size(&self) -> usize {
        self.batch_size * self.grad_accum_steps
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalConfig {
    pub pack_kcs: bool,
    pub prompt_inc_labels: bool,
    pub inc_first_label: bool,
    pub testonval: bool,
    pub crossval: bool,
    pub selection_metric: SelectionMetric,
}

/// Fully resolved and validated run configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub mode: RunMode,
    pub dataset: DatasetConfig,
    pub model: ModelConfig,
    pub pt_model_name: Option<String>,
    pub optim: OptimConfig,
    pub eval: EvalConfig,
    pub seed: u64,
    pub model_name: Option<String>,
    pub hyperparam_sweep: bool,
    pub sweep_space: Option<PathBuf>,
    pub artifacts_dir: PathBuf,
    pub max_parallel: usize,
    pub memory_budget_mb: Option<u64>,
}

impl RunConfig {
    /// Fold indices this run covers.
    #[must_use]
    pub fn fold_indices(&self) -> Vec<usize> {
        if self.eval.crossval { (0..self.dataset.num_folds).collect() } else { vec![0] }
    }

    /// Name under which the model of `fold` is saved or loaded.
    #[must_use]
    pub fn fold_model_name(&self, fold: usize) -> Option<String> {
        self.model_name.as_ref().map(|name| if self.eval.crossval { format!("{name}_fold{fold}") } else { name.clone() })
    }
}

/// Per-run overrides of model and optimization options.
///
/// Used for command-line values, `[defaults.<model_type>]` tables and sweep
/// candidates alike.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Overrides {
    pub epochs: Option<usize>,
    pub lr: Option<f64>,
    pub wd: Option<f64>,
    pub gc: Option<f64>,
    pub grad_accum_steps: Option<usize>,
    pub batch_size: Option<usize>,
    pub optim: Option<OptimizerKind>,
    pub patience: Option<usize>,
    pub base_model: Option<String>,
    pub r: Option<usize>,
    pub lora_alpha: Option<f64>,
    pub lora_dropout: Option<f64>,
    pub quantize: Option<bool>,
    pub pt_model_name: Option<String>,
    pub emb_size: Option<usize>,
}

impl Overrides {
    /// Values from `self`, falling back to `lower` where unset.
    #[must_use]
    pub fn or(self, lower: &Self) -> Self {
        Self {
            epochs: self.epochs.or(lower.epochs),
            lr: self.lr.or(lower.lr),
            wd: self.wd.or(lower.wd),
            gc: self.gc.or(lower.gc),
            grad_accum_steps: self.grad_accum_steps.or(lower.grad_accum_steps),
            batch_size: self.batch_size.or(lower.batch_size),
            optim: self.optim.or(lower.optim),
            patience: self.patience.or(lower.patience),
            base_model: self.base_model.or_else(|| lower.base_model.clone()),
            r: self.r.or(lower.r),
            lora_alpha: self.lora_alpha.or(lower.lora_alpha),
            lora_dropout: self.lora_dropout.or(lower.lora_dropout),
            quantize: self.quantize.or(lower.quantize),
            pt_model_name: self.pt_model_name.or_else(|| lower.pt_model_name.clone()),
            emb_size: self.emb_size.or(lower.emb_size),
        }
    }

    /// Names of the set options that only gradient-trained variants accept.
    #[must_use]
    pub fn optimization_fields(&self) -> Vec<&'static str> {
        [
            ("epochs", self.epochs.is_some()),
            ("lr", self.lr.is_some()),
            ("wd", self.wd.is_some()),
            ("gc", self.gc.is_some()),
            ("grad_accum_steps", self.grad_accum_steps.is_some()),
            ("optim", self.optim.is_some()),
            ("patience", self.patience.is_some()),
        ]
        .into_iter()
        .filter_map(|(name, set)| set.then_some(name))
        .collect()
    }
}

/// Values as they arrive from the command line, before defaults are applied.
#[derive(Debug, Clone, PartialEq)]
pub struct RawArgs {
    pub mode: RunMode,
    pub dataset: Option<DatasetName>,
    pub split_by_subject: bool,
    pub typical_cutoff: Option<i64>,
    pub tag_src: Option<TagSource>,
    pub debug: bool,
    pub model_type: Option<String>,
    pub model_name: Option<String>,
    pub inc_first_label: bool,
    pub overrides: Overrides,
    pub hyperparam_sweep: bool,
    pub sweep_space: Option<PathBuf>,
    pub crossval: bool,
    pub testonval: bool,
    pub pack_kcs: Option<bool>,
    pub prompt_inc_labels: Option<bool>,
    pub max_parallel: Option<usize>,
    pub data_dir: Option<PathBuf>,
    pub artifacts_dir: Option<PathBuf>,
    pub seed: Option<u64>,
    pub num_folds: Option<usize>,
    pub memory_budget_mb: Option<u64>,
    pub selection_metric: Option<SelectionMetric>,
}

impl RawArgs {
    /// Empty arguments for `mode`; every option at its default.
    #[must_use]
    pub fn new(mode: RunMode) -> Self {
        Self {
            mode,
            dataset: None,
            split_by_subject: false,
            typical_cutoff: None,
            tag_src: None,
            debug: false,
            model_type: None,
            model_name: None,
            inc_first_label: false,
            overrides: Overrides::default(),
            hyperparam_sweep: false,
            sweep_space: None,
            crossval: false,
            testonval: false,
            pack_kcs: None,
            prompt_inc_labels: None,
            max_parallel: None,
            data_dir: None,
            artifacts_dir: None,
            seed: None,
            num_folds: None,
            memory_budget_mb: None,
            selection_metric: None,
        }
    }

    /// Copy of these arguments with `overrides` layered on top.
    #[must_use]
    pub fn with_overrides(&self, overrides: &Overrides) -> Self {
        let mut out = self.clone();
        out.overrides = overrides.clone().or(&self.overrides);
        out
    }
}
