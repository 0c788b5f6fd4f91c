//! Hyperparameter sweep.
//!
//! A search space is a list of dimensions, each a parameter name with its
//! candidate values:
//!
//! ```toml
//! max_candidates = 4
//!
//! [[dimension]]
//! name = "lr"
//! values = [1e-4, 2e-4]
//!
//! [[dimension]]
//! name = "r"
//! values = [8, 16]
//! ```
//!
//! Candidates are the cartesian product in declaration order, the first
//! dimension varying slowest. Every candidate is cross-validated on the
//! validation split only; the best mean selection metric wins and ties keep
//! the earlier candidate. A sweep never saves weights and never scores the
//! test split.

use crate::config::{ConfigFile, Overrides, RawArgs, RunConfig, SelectionMetric, resolve};
use crate::crossval::{CrossValidator, CvSummary, FoldRunner};
use crate::error::{TrainingError, TrainingResult};
use crate::folds::{FoldProvider, SplitKind};
use crate::progress::{NullProgressSink, ProgressSink};
use dialogkt_abstraction::ModelVariant;
use dialogkt_abstraction::seed::derive_seed;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepParam {
    Lr,
    Wd,
    Gc,
    GradAccumSteps,
    BatchSize,
    Epochs,
    R,
    LoraAlpha,
    EmbSize,
}

impl SweepParam {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Lr => "lr",
            Self::Wd => "wd",
            Self::Gc => "gc",
            Self::GradAccumSteps => "grad_accum_steps",
            Self::BatchSize => "batch_size",
            Self::Epochs => "epochs",
            Self::R => "r",
            Self::LoraAlpha => "lora_alpha",
            Self::EmbSize => "emb_size",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SweepValue {
    Int(i64),
    Float(f64),
}

impl SweepValue {
    fn as_f64(self) -> f64 {
        match self {
            Self::Int(i) => i as f64,
            Self::Float(f) => f,
        }
    }

    fn as_count(self, param: SweepParam) -> TrainingResult<usize> {
        let count = match self {
            Self::Int(i) => usize::try_from(i).ok(),
            Self::Float(_) => None,
        };
        count.ok_or_else(|| {
            TrainingError::config("sweep_space", format!("`{}` needs non-negative integers, got {self}", param.as_str()))
        })
    }
}

impl fmt::Display for SweepValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SweepDimension {
    pub name: SweepParam,
    pub values: Vec<SweepValue>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SearchSpace {
    #[serde(default)]
    pub max_candidates: Option<usize>,
    #[serde(default, rename = "dimension")]
    pub dimensions: Vec<SweepDimension>,
}

/// One parameter value of a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub param: SweepParam,
    pub value: SweepValue,
}

fn apply(overrides: &mut Overrides, assignment: Assignment) -> TrainingResult<()> {
    let Assignment { param, value } = assignment;
    match param {
        SweepParam::Lr => overrides.lr = Some(value.as_f64()),
        SweepParam::Wd => overrides.wd = Some(value.as_f64()),
        SweepParam::Gc => overrides.gc = Some(value.as_f64()),
        SweepParam::LoraAlpha => overrides.lora_alpha = Some(value.as_f64()),
        SweepParam::GradAccumSteps => overrides.grad_accum_steps = Some(value.as_count(param)?),
        SweepParam::BatchSize => overrides.batch_size = Some(value.as_count(param)?),
        SweepParam::Epochs => overrides.epochs = Some(value.as_count(param)?),
        SweepParam::R => overrides.r = Some(value.as_count(param)?),
        SweepParam::EmbSize => overrides.emb_size = Some(value.as_count(param)?),
    }
    Ok(())
}

impl SearchSpace {
    pub fn load_from_file(path: &Path) -> TrainingResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            TrainingError::config("sweep_space", format!("cannot read {}: {e}", path.display()))
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> TrainingResult<Self> {
        let space: Self =
            toml::from_str(content).map_err(|e| TrainingError::config("sweep_space", e.to_string()))?;
        space.validate()?;
        Ok(space)
    }

    fn validate(&self) -> TrainingResult<()> {
        if self.max_candidates == Some(0) {
            return Err(TrainingError::config("sweep_space", "max_candidates must be at least 1"));
        }
        for (i, dim) in self.dimensions.iter().enumerate() {
            if dim.values.is_empty() {
                return Err(TrainingError::config(
                    "sweep_space",
                    format!("dimension `{}` has no values", dim.name.as_str()),
                ));
            }
            if self.dimensions[..i].iter().any(|d| d.name == dim.name) {
                return Err(TrainingError::config(
                    "sweep_space",
                    format!("dimension `{}` is declared twice", dim.name.as_str()),
                ));
            }
        }
        Ok(())
    }

    /// Default space for a model type.
    #[must_use]
    pub fn builtin(variant: ModelVariant) -> Self {
        let dim = |name, values: &[SweepValue]| SweepDimension { name, values: values.to_vec() };
        let dimensions = match variant {
            ModelVariant::Lmkt => vec![
                dim(SweepParam::Lr, &[SweepValue::Float(1e-4), SweepValue::Float(2e-4), SweepValue::Float(5e-4)]),
                dim(SweepParam::R, &[SweepValue::Int(8), SweepValue::Int(16)]),
            ],
            ModelVariant::Dkt => vec![
                dim(SweepParam::Lr, &[SweepValue::Float(1e-3), SweepValue::Float(5e-3), SweepValue::Float(1e-2)]),
                dim(SweepParam::EmbSize, &[SweepValue::Int(32), SweepValue::Int(64)]),
            ],
            ModelVariant::Bkt | ModelVariant::Majority | ModelVariant::Random => Vec::new(),
        };
        Self { max_candidates: None, dimensions }
    }

    /// Parameter assignments of every candidate, in enumeration order.
    #[must_use]
    pub fn candidates(&self) -> Vec<Vec<Assignment>> {
        let mut out: Vec<Vec<Assignment>> = vec![Vec::new()];
        for dim in &self.dimensions {
            out = out
                .into_iter()
                .flat_map(|prefix| {
                    dim.values.iter().map(move |&value| {
                        let mut next = prefix.clone();
                        next.push(Assignment { param: dim.name, value });
                        next
                    })
                })
                .collect();
        }
        if let Some(max) = self.max_candidates {
            out.truncate(max);
        }
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateStatus {
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepCandidate {
    pub index: usize,
    pub seed: u64,
    pub assignments: Vec<Assignment>,
    pub overrides: Overrides,
    pub status: CandidateStatus,
    pub selection_value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<CvSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepResult {
    pub selection_metric: SelectionMetric,
    pub best: usize,
    pub best_overrides: Overrides,
    /// Configuration to re-run with for a test-split evaluation.
    pub best_config: RunConfig,
    pub history: Vec<SweepCandidate>,
}

impl SweepResult {
    #[must_use]
    pub fn best_candidate(&self) -> Option<&SweepCandidate> {
        self.history.get(self.best)
    }
}

fn describe(assignments: &[Assignment]) -> String {
    if assignments.is_empty() {
        return "(defaults)".to_string();
    }
    assignments.iter().map(|a| format!("{}={}", a.param.as_str(), a.value)).collect::<Vec<_>>().join(" ")
}

pub struct SweepOrchestrator {
    space: SearchSpace,
    cancel: CancellationToken,
    progress: Arc<dyn ProgressSink>,
}

impl SweepOrchestrator {
    #[must_use]
    pub fn new(space: SearchSpace) -> Self {
        Self { space, cancel: CancellationToken::new(), progress: Arc::new(NullProgressSink) }
    }

    /// Space from `path`, or the built-in space of the model type.
    pub fn for_config(config: &RunConfig) -> TrainingResult<Self> {
        let space = match &config.sweep_space {
            Some(path) => SearchSpace::load_from_file(path)?,
            None => SearchSpace::builtin(config.model.variant()),
        };
        Ok(Self::new(space))
    }

    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    #[must_use]
    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    #[must_use]
    pub const fn space(&self) -> &SearchSpace {
        &self.space
    }

    /// Cross-validates every candidate on the validation split.
    ///
    /// All candidates are resolved before any is run, so an invalid space
    /// fails before a model is built.
    ///
    /// # Errors
    /// `Config` for a candidate that does not resolve; the first candidate's
    /// error when no candidate completes; any run-global error.
    pub async fn run<F>(
        &self,
        raw: &RawArgs,
        file: Option<&ConfigFile>,
        provider: Arc<dyn FoldProvider>,
        make_runner: F,
    ) -> TrainingResult<SweepResult>
    where
        F: Fn(&RunConfig) -> TrainingResult<Arc<dyn FoldRunner>>,
    {
        if !raw.hyperparam_sweep {
            return Err(TrainingError::config("hyperparam_sweep", "sweep requested without --hyperparam_sweep"));
        }

        let mut planned = Vec::new();
        for assignments in self.space.candidates() {
            let mut overrides = Overrides::default();
            for assignment in &assignments {
                apply(&mut overrides, *assignment)?;
            }
            let config = resolve(&raw.with_overrides(&overrides), file)?;
            planned.push((assignments, overrides, config));
        }
        info!(candidates = planned.len(), "Starting hyperparameter sweep");

        let mut history = Vec::with_capacity(planned.len());
        let mut best: Option<(usize, f64)> = None;
        let mut first_error: Option<TrainingError> = None;

        for (index, (assignments, overrides, config)) in planned.iter().enumerate() {
            if self.cancel.is_cancelled() {
                return Err(TrainingError::Cancelled);
            }
            let seed = derive_seed(config.seed, "candidate", index as u64);
            let label = describe(assignments);
            let validator = CrossValidator::new(seed, config.max_parallel)
                .with_cancellation(self.cancel.clone())
                .with_progress(Arc::clone(&self.progress));
            let runner = make_runner(config)?;
            let outcome =
                validator.run(Arc::clone(&provider), &config.fold_indices(), SplitKind::Validation, runner).await;

            let candidate = match outcome {
                Ok(summary) if summary.cancelled => {
                    warn!(candidate = index, params = %label, "Sweep cancelled during candidate");
                    return Err(TrainingError::Cancelled);
                }
                Ok(summary) => {
                    let value = summary.selection_value(config.eval.selection_metric);
                    info!(candidate = index, params = %label, value = ?value, "Candidate complete");
                    let score = value.unwrap_or(f64::NEG_INFINITY);
                    if best.is_none_or(|(_, b)| score > b) {
                        best = Some((index, score));
                    }
                    SweepCandidate {
                        index,
                        seed,
                        assignments: assignments.clone(),
                        overrides: overrides.clone(),
                        status: CandidateStatus::Completed,
                        selection_value: value,
                        summary: Some(summary),
                        error: None,
                    }
                }
                Err(e) if e.is_fold_local() => {
                    warn!(candidate = index, params = %label, error = %e, "Candidate failed, excluded");
                    let candidate = SweepCandidate {
                        index,
                        seed,
                        assignments: assignments.clone(),
                        overrides: overrides.clone(),
                        status: CandidateStatus::Failed,
                        selection_value: None,
                        summary: None,
                        error: Some(e.to_string()),
                    };
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                    candidate
                }
                Err(e) => return Err(e),
            };
            history.push(candidate);
        }

        let Some((best, _)) = best else {
            return Err(first_error.unwrap_or_else(|| TrainingError::config("sweep_space", "no candidates")));
        };
        let (_, best_overrides, best_config) = &planned[best];
        info!(best, params = %describe(&planned[best].0), "Sweep complete");
        Ok(SweepResult {
            selection_metric: best_config.eval.selection_metric,
            best,
            best_overrides: best_overrides.clone(),
            best_config: best_config.clone(),
            history,
        })
    }
}
