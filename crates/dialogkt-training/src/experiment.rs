//! Train, test, sweep and visualize runs.
//!
//! An [`Experiment`] owns a resolved [`RunConfig`]. It loads the dataset,
//! builds the fold provider and hands an [`ExperimentRunner`] to the
//! cross-validation or sweep orchestrator. Every run writes a JSON report to
//! `<artifacts>/results/<run_id>.json`.

use crate::artifacts::write_json;
use crate::config::{ConfigFile, RawArgs, RunConfig, RunMode};
use crate::crossval::{CrossValidator, CvSummary, FoldRunner};
use crate::dataset::DatasetId;
use crate::error::{TrainingError, TrainingResult};
use crate::eval::{EvalOptions, TurnPrediction, evaluate, predict_dialogue};
use crate::folds::{DialogueFolds, FoldData, FoldProvider, SplitKind};
use crate::layout::ArtifactLayout;
use crate::metrics::{MetricsRecord, Provenance};
use crate::progress::{NullProgressSink, ProgressSink};
use crate::registry::{ModelStore, SaveInfo};
use crate::sweep::{SweepOrchestrator, SweepResult};
use crate::trainer::{Checkpoint, Trainer, TrainerConfig, check_memory_budget};
use chrono::{DateTime, Utc};
use dialogkt_abstraction::seed::derive_seed;
use dialogkt_abstraction::{DialogueId, KcVocab, KtModel, ModelVariant};
use dialogkt_models::ModelFactory;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub created_at: DateTime<Utc>,
    pub mode: RunMode,
    pub model_type: ModelVariant,
    pub dataset_id: DatasetId,
    pub config: RunConfig,
    pub summary: CvSummary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepReport {
    pub run_id: String,
    pub created_at: DateTime<Utc>,
    pub model_type: ModelVariant,
    pub dataset_id: DatasetId,
    pub result: SweepResult,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialoguePredictions {
    pub dialogue_id: DialogueId,
    pub turns: Vec<TurnPrediction>,
}

/// Per-turn KC predictions of the fold-0 test split.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionReport {
    pub run_id: String,
    pub created_at: DateTime<Utc>,
    pub model_type: ModelVariant,
    pub fold: usize,
    pub provenance: Provenance,
    pub dialogues: Vec<DialoguePredictions>,
}

fn new_run_id() -> String {
    Uuid::new_v4().to_string()
}

fn eval_options(config: &RunConfig) -> EvalOptions {
    EvalOptions {
        pack_kcs: config.eval.pack_kcs,
        teacher_forced: config.eval.prompt_inc_labels,
        inc_first_label: config.eval.inc_first_label,
    }
}

fn scored_split(config: &RunConfig) -> SplitKind {
    if config.eval.testonval { SplitKind::Validation } else { SplitKind::Test }
}

/// Builds, trains or loads, and scores the model of one fold.
pub struct ExperimentRunner {
    config: RunConfig,
    factory: Arc<ModelFactory>,
    store: ModelStore,
    vocab: KcVocab,
    dataset_id: DatasetId,
    run_id: String,
    progress: Arc<dyn ProgressSink>,
}

impl ExperimentRunner {
    /// Saved model to start from: the per-fold save when cross-validating and
    /// one exists, else the name itself.
    fn pretrained_name(&self, name: &str, fold: usize) -> String {
        let per_fold = format!("{name}_fold{fold}");
        if self.config.eval.crossval && self.store.exists(&per_fold) { per_fold } else { name.to_string() }
    }

    fn prepare_model(&self, fold: &FoldData, seed: u64) -> TrainingResult<Box<dyn KtModel>> {
        let mut model = self.factory.create(&self.config.model, &self.vocab, seed)?;
        check_memory_budget(model.as_ref(), self.config.optim.batch_size, self.config.memory_budget_mb)?;

        match self.config.mode {
            RunMode::Train => {
                if let Some(pt) = &self.config.pt_model_name {
                    let (_, state) = self.store.load(&self.pretrained_name(pt, fold.index))?;
                    model.load_state(&state)?;
                    info!(fold = fold.index, pt_model_name = %pt, "Continuing from saved adapters");
                }
            }
            RunMode::Test => match self.config.fold_model_name(fold.index) {
                Some(name) if self.store.exists(&name) || model.variant().is_trainable() => {
                    let (_, state) = self.store.load(&name)?;
                    model.load_state(&state)?;
                }
                _ => {
                    debug!(fold = fold.index, model_type = %model.variant(), "No saved model, fitting on the training split");
                    model.fit(&fold.train)?;
                }
            },
        }
        Ok(model)
    }

    fn checkpoint(&self, fold: usize) -> Option<Checkpoint> {
        self.config.fold_model_name(fold).map(|model_name| Checkpoint {
            store: self.store.clone(),
            model_name,
            info: SaveInfo {
                run_id: self.run_id.clone(),
                model_config: self.config.model.clone(),
                dataset_id: self.dataset_id.clone(),
                fold,
                metrics: None,
            },
        })
    }
}

impl FoldRunner for ExperimentRunner {
    fn run_fold(&self, fold: &FoldData, seed: u64, cancel: &CancellationToken) -> TrainingResult<MetricsRecord> {
        let eval = eval_options(&self.config);
        let split = scored_split(&self.config);
        let mut model = self.prepare_model(fold, seed)?;

        let mut loss_curve = Vec::new();
        if self.config.mode == RunMode::Train {
            let trainer = Trainer::new(TrainerConfig {
                optim: self.config.optim.clone(),
                eval,
                selection_metric: self.config.eval.selection_metric,
                fold: fold.index,
                seed,
            })
            .with_progress(Arc::clone(&self.progress))
            .with_cancellation(cancel.clone())
            .with_checkpoint(self.checkpoint(fold.index));
            loss_curve = trainer.train(model.as_mut(), &fold.train, &fold.validation)?.loss_curve;
        }

        let mut record = evaluate(model.as_ref(), fold.split(split), split, &eval)?;
        record.loss_curve = loss_curve;
        info!(
            fold = fold.index,
            %split,
            accuracy = ?record.aggregate.accuracy,
            auc = ?record.aggregate.auc,
            f1 = ?record.aggregate.f1,
            "Fold scored"
        );
        Ok(record)
    }
}

pub struct Experiment {
    config: RunConfig,
    factory: Arc<ModelFactory>,
    progress: Arc<dyn ProgressSink>,
    cancel: CancellationToken,
}

impl Experiment {
    #[must_use]
    pub fn new(config: RunConfig) -> Self {
        Self {
            config,
            factory: Arc::new(ModelFactory::new()),
            progress: Arc::new(NullProgressSink),
            cancel: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    #[must_use]
    pub const fn config(&self) -> &RunConfig {
        &self.config
    }

    #[must_use]
    pub fn store(&self) -> ModelStore {
        ModelStore::new(ArtifactLayout::new(self.config.artifacts_dir.clone()))
    }

    fn load_folds(&self) -> TrainingResult<Arc<DialogueFolds>> {
        Ok(Arc::new(DialogueFolds::from_config(&self.config.dataset, self.config.seed)?))
    }

    fn runner(&self, config: &RunConfig, folds: &DialogueFolds, run_id: &str) -> ExperimentRunner {
        ExperimentRunner {
            config: config.clone(),
            factory: Arc::clone(&self.factory),
            store: self.store(),
            vocab: folds.kc_vocab().clone(),
            dataset_id: folds.dataset_id().clone(),
            run_id: run_id.to_string(),
            progress: Arc::clone(&self.progress),
        }
    }

    /// Trains or tests across the configured folds and writes the report.
    ///
    /// Returns the report and the path it was written to.
    pub async fn run(&self) -> TrainingResult<(RunReport, PathBuf)> {
        if self.config.hyperparam_sweep {
            return Err(TrainingError::config("hyperparam_sweep", "use the sweep entry point"));
        }
        let run_id = new_run_id();
        let folds = self.load_folds()?;
        let runner = Arc::new(self.runner(&self.config, &folds, &run_id));
        info!(
            run_id = %run_id,
            mode = ?self.config.mode,
            model_type = %self.config.model.variant(),
            dataset = %self.config.dataset.dataset,
            folds = self.config.fold_indices().len(),
            "Starting run"
        );

        let validator = CrossValidator::new(self.config.seed, self.config.max_parallel)
            .with_cancellation(self.cancel.clone())
            .with_progress(Arc::clone(&self.progress));
        let provider: Arc<dyn FoldProvider> = folds.clone();
        let summary = validator.run(provider, &self.config.fold_indices(), scored_split(&self.config), runner).await?;

        let report = RunReport {
            run_id,
            created_at: Utc::now(),
            mode: self.config.mode,
            model_type: self.config.model.variant(),
            dataset_id: folds.dataset_id().clone(),
            config: self.config.clone(),
            summary,
        };
        let path = self.store().layout().results_path(&report.run_id);
        write_json(&path, &report)?;
        info!(path = %path.display(), "Wrote results");
        Ok((report, path))
    }

    /// Runs the hyperparameter sweep. `raw` and `file` are re-resolved with
    /// each candidate's overrides.
    pub async fn sweep(&self, raw: &RawArgs, file: Option<&ConfigFile>) -> TrainingResult<(SweepReport, PathBuf)> {
        let run_id = new_run_id();
        let orchestrator = SweepOrchestrator::for_config(&self.config)?
            .with_cancellation(self.cancel.clone())
            .with_progress(Arc::clone(&self.progress));
        let folds = self.load_folds()?;
        let provider: Arc<dyn FoldProvider> = folds.clone();

        let result = orchestrator
            .run(raw, file, provider, |config: &RunConfig| {
                Ok(Arc::new(self.runner(config, &folds, &run_id)) as Arc<dyn FoldRunner>)
            })
            .await?;

        let report = SweepReport {
            run_id,
            created_at: Utc::now(),
            model_type: self.config.model.variant(),
            dataset_id: folds.dataset_id().clone(),
            result,
        };
        let path = self.store().layout().results_path(&report.run_id);
        write_json(&path, &report)?;
        info!(path = %path.display(), best = report.result.best, "Wrote sweep results");
        Ok((report, path))
    }

    /// Writes per-turn KC predictions for the test split of fold 0.
    pub fn visualize(&self) -> TrainingResult<(PredictionReport, PathBuf)> {
        let run_id = new_run_id();
        let folds = self.load_folds()?;
        let fold = folds.fold(0)?;
        let runner = self.runner(&self.config, &folds, &run_id);
        let seed = derive_seed(self.config.seed, "fold", 0);
        let model = runner.prepare_model(&fold, seed)?;

        let eval = eval_options(&self.config);
        let dialogues = fold
            .test
            .iter()
            .map(|dialogue| {
                Ok(DialoguePredictions {
                    dialogue_id: dialogue.id.clone(),
                    turns: predict_dialogue(model.as_ref(), dialogue, &eval)?,
                })
            })
            .collect::<TrainingResult<Vec<_>>>()?;

        let report = PredictionReport {
            run_id,
            created_at: Utc::now(),
            model_type: self.config.model.variant(),
            fold: 0,
            provenance: eval.provenance(SplitKind::Test),
            dialogues,
        };
        let path = self.store().layout().predictions_path(&report.run_id);
        write_json(&path, &report)?;
        info!(path = %path.display(), dialogues = report.dialogues.len(), "Wrote predictions");
        Ok((report, path))
    }
}
