//! Training loop.
//!
//! Gradient-trained variants run `epochs` passes over teacher-forced training
//! examples. Each micro-batch contributes its mean gradient weighted by its
//! sample count; after `grad_accum_steps` micro-batches (or at the end of the
//! epoch) the sum is divided by the window's sample count, clipped by global
//! norm and handed to the optimizer. The model is validated after every epoch
//! and the best state is restored when training ends.
//!
//! Closed-form variants are fitted once and validated once.

use crate::config::{OptimConfig, SelectionMetric};
use crate::error::{TrainingError, TrainingResult};
use crate::eval::{EvalOptions, evaluate};
use crate::folds::SplitKind;
use crate::metrics::{EpochStats, MetricsRecord};
use crate::optim::{Optimizer, build_optimizer, clip_grad_norm};
use crate::progress::{NullProgressSink, ProgressEvent, ProgressSink};
use crate::registry::{ModelStore, SaveInfo};
use crate::scan::training_examples;
use dialogkt_abstraction::seed::derive_seed;
use dialogkt_abstraction::{Dialogue, KtModel, Mode, ModelState, ParamSet, Trainable, TrainingExample};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainingPhase {
    Init,
    EpochRunning,
    Validating,
    Done,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingState {
    pub phase: TrainingPhase,
    /// Completed epochs.
    pub epoch: usize,
    pub micro_batches: u64,
    pub optimizer_steps: u64,
    pub best_epoch: Option<usize>,
    pub best_metric: Option<f64>,
    pub epochs_without_improvement: usize,
    pub early_stopped: bool,
}

impl Default for TrainingState {
    fn default() -> Self {
        Self {
            phase: TrainingPhase::Init,
            epoch: 0,
            micro_batches: 0,
            optimizer_steps: 0,
            best_epoch: None,
            best_metric: None,
            epochs_without_improvement: 0,
            early_stopped: false,
        }
    }
}

/// Result of one training run. The model itself holds the best state.
#[derive(Debug, Clone)]
pub struct TrainOutcome {
    pub state: TrainingState,
    pub loss_curve: Vec<EpochStats>,
    /// Validation record of the restored state.
    pub best_validation: Option<MetricsRecord>,
}

/// Where the best state is persisted while training.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub store: ModelStore,
    pub model_name: String,
    pub info: SaveInfo,
}

impl Checkpoint {
    fn save(&self, state: &ModelState, metrics: &MetricsRecord) -> TrainingResult<()> {
        let info = SaveInfo { metrics: Some(metrics.clone()), ..self.info.clone() };
        self.store.save(&self.model_name, state, info)?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct TrainerConfig {
    pub optim: OptimConfig,
    /// Protocol used for the per-epoch validation pass.
    pub eval: EvalOptions,
    pub selection_metric: SelectionMetric,
    pub fold: usize,
    pub seed: u64,
}

pub struct Trainer {
    config: TrainerConfig,
    progress: Arc<dyn ProgressSink>,
    cancel: CancellationToken,
    checkpoint: Option<Checkpoint>,
}

/// Fails when one batch of `batch_size` is estimated to exceed `budget_mb`.
pub fn check_memory_budget(model: &dyn KtModel, batch_size: usize, budget_mb: Option<u64>) -> TrainingResult<()> {
    let Some(budget_mb) = budget_mb else {
        return Ok(());
    };
    let estimate = model.estimate_batch_bytes(batch_size);
    let budget = budget_mb.saturating_mul(1024 * 1024);
    if estimate > budget {
        return Err(TrainingError::Resource {
            field: "batch_size".to_string(),
            value: batch_size.to_string(),
            message: format!(
                "estimated {} MiB per batch for {} exceeds the {budget_mb} MiB budget",
                estimate.div_ceil(1024 * 1024),
                model.variant()
            ),
        });
    }
    Ok(())
}

/// Gradient sum of the current accumulation window.
struct Accumulator {
    grads: ParamSet,
    samples: usize,
    micro_batches: usize,
    loss_sum: f64,
}

impl Accumulator {
    fn new(params: &ParamSet) -> Self {
        Self { grads: params.zeros_like(), samples: 0, micro_batches: 0, loss_sum: 0.0 }
    }

    fn add(&mut self, loss: f64, grads: &ParamSet, samples: usize) -> TrainingResult<()> {
        let weight = samples as f64;
        self.grads.add_scaled(grads, weight)?;
        self.samples += samples;
        self.micro_batches += 1;
        self.loss_sum += loss * weight;
        Ok(())
    }

    fn reset(&mut self) {
        self.grads.scale(0.0);
        self.samples = 0;
        self.micro_batches = 0;
        self.loss_sum = 0.0;
    }
}

impl Trainer {
    #[must_use]
    pub fn new(config: TrainerConfig) -> Self {
        Self { config, progress: Arc::new(NullProgressSink), cancel: CancellationToken::new(), checkpoint: None }
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
    pub fn with_checkpoint(mut self, checkpoint: Option<Checkpoint>) -> Self {
        self.checkpoint = checkpoint;
        self
    }

    /// Trains `model` on `train`, selecting the best epoch on `validation`.
    ///
    /// # Errors
    /// `Divergence` on a non-finite loss, gradient or parameter; `Cancelled`
    /// when the token fires between epochs; any model or artifact error.
    pub fn train(
        &self,
        model: &mut dyn KtModel,
        train: &[Dialogue],
        validation: &[Dialogue],
    ) -> TrainingResult<TrainOutcome> {
        if self.cancel.is_cancelled() {
            return Err(TrainingError::Cancelled);
        }
        if model.trainable().is_none() {
            return self.fit_closed_form(model, train, validation);
        }

        let fold = self.config.fold;
        let optim = &self.config.optim;
        let examples = training_examples(train);
        if examples.is_empty() {
            return Err(TrainingError::Data(format!("fold {fold} has no labelled training turns")));
        }

        let mut optimizer = build_optimizer(optim.optimizer, optim.lr, optim.wd);
        let mut state = TrainingState::default();
        let mut loss_curve = Vec::with_capacity(optim.epochs);
        let mut best: Option<(ModelState, MetricsRecord)> = None;
        let mut best_value = f64::NEG_INFINITY;

        info!(
            fold,
            model_type = %model.variant(),
            optimizer = optimizer.name(),
            examples = examples.len(),
            epochs = optim.epochs,
            effective_batch_size = optim.effective_batch_size(),
            "Starting training"
        );
        self.progress.on_event(ProgressEvent::Started { fold, epochs: optim.epochs });

        for epoch in 0..optim.epochs {
            if self.cancel.is_cancelled() {
                warn!(fold, epoch, "Training cancelled");
                return Err(TrainingError::Cancelled);
            }

            state.phase = TrainingPhase::EpochRunning;
            let train_loss = {
                let trainable = model
                    .trainable()
                    .ok_or_else(|| TrainingError::Other(anyhow::anyhow!("model lost gradient access")))?;
                self.run_epoch(trainable, optimizer.as_mut(), &examples, epoch, &mut state)?
            };
            state.epoch = epoch + 1;

            state.phase = TrainingPhase::Validating;
            let record = evaluate(&*model, validation, SplitKind::Validation, &self.config.eval)?;
            let metric = record.selection_value(self.config.selection_metric);
            let stats = EpochStats {
                epoch: epoch + 1,
                train_loss,
                optimizer_steps: state.optimizer_steps,
                validation_loss: record.loss,
                validation_metric: metric,
            };
            info!(
                fold,
                epoch = epoch + 1,
                train_loss,
                validation_loss = record.loss,
                validation_metric = ?metric,
                steps = state.optimizer_steps,
                "Epoch complete"
            );
            self.progress.on_event(ProgressEvent::Epoch {
                fold,
                epoch: epoch + 1,
                epochs: optim.epochs,
                train_loss,
                validation_metric: metric,
            });
            loss_curve.push(stats);

            let value = metric.unwrap_or(f64::NEG_INFINITY);
            if best.is_none() || value > best_value {
                let snapshot = model.save_state()?;
                if let Some(checkpoint) = &self.checkpoint {
                    checkpoint.save(&snapshot, &record)?;
                }
                state.best_epoch = Some(epoch + 1);
                state.best_metric = metric;
                best_value = value;
                state.epochs_without_improvement = 0;
                best = Some((snapshot, record));
            } else {
                state.epochs_without_improvement += 1;
                if let Some(patience) = optim.patience
                    && state.epochs_without_improvement >= patience
                {
                    info!(fold, epoch = epoch + 1, patience, "Early stopping");
                    state.early_stopped = true;
                    break;
                }
            }
        }

        let best_validation = match best {
            Some((snapshot, record)) => {
                model.load_state(&snapshot)?;
                Some(record)
            }
            None => None,
        };
        state.phase = TrainingPhase::Done;
        self.progress.on_event(ProgressEvent::Finished { fold, best_epoch: state.best_epoch });
        Ok(TrainOutcome { state, loss_curve, best_validation })
    }

    fn fit_closed_form(
        &self,
        model: &mut dyn KtModel,
        train: &[Dialogue],
        validation: &[Dialogue],
    ) -> TrainingResult<TrainOutcome> {
        let fold = self.config.fold;
        self.progress.on_event(ProgressEvent::Started { fold, epochs: 1 });
        model.fit(train)?;
        let record = evaluate(&*model, validation, SplitKind::Validation, &self.config.eval)?;
        if let Some(checkpoint) = &self.checkpoint {
            checkpoint.save(&model.save_state()?, &record)?;
        }
        debug!(fold, model_type = %model.variant(), "Fitted closed-form model");

        let state = TrainingState {
            phase: TrainingPhase::Done,
            epoch: 1,
            best_epoch: Some(1),
            best_metric: record.selection_value(self.config.selection_metric),
            ..TrainingState::default()
        };
        self.progress.on_event(ProgressEvent::Finished { fold, best_epoch: Some(1) });
        Ok(TrainOutcome { state, loss_curve: Vec::new(), best_validation: Some(record) })
    }

    /// One pass over `examples` in an order derived from the seed and epoch.
    ///
    /// Returns the sample-weighted mean training loss.
    fn run_epoch(
        &self,
        trainable: &mut dyn Trainable,
        optimizer: &mut dyn Optimizer,
        examples: &[TrainingExample],
        epoch: usize,
        state: &mut TrainingState,
    ) -> TrainingResult<f64> {
        let optim = &self.config.optim;
        let mut order: Vec<usize> = (0..examples.len()).collect();
        let mut rng = StdRng::seed_from_u64(derive_seed(self.config.seed, "epoch", epoch as u64));
        order.shuffle(&mut rng);

        trainable.set_mode(Mode::Train);
        let mut window = Accumulator::new(trainable.parameters());
        let mut epoch_loss = 0.0;

        for chunk in order.chunks(optim.batch_size.max(1)) {
            let batch: Vec<TrainingExample> = chunk.iter().map(|&i| examples[i].clone()).collect();
            let (loss, grads) = trainable.loss_and_grad(&batch)?;
            if !loss.is_finite() {
                return Err(TrainingError::Divergence { step: state.optimizer_steps, loss });
            }
            window.add(loss, &grads, batch.len())?;
            epoch_loss += loss * batch.len() as f64;
            state.micro_batches += 1;

            if window.micro_batches == optim.grad_accum_steps {
                self.apply_step(trainable, optimizer, &mut window, state)?;
            }
        }
        if window.micro_batches > 0 {
            self.apply_step(trainable, optimizer, &mut window, state)?;
        }
        trainable.set_mode(Mode::Eval);

        Ok(epoch_loss / examples.len() as f64)
    }

    fn apply_step(
        &self,
        trainable: &mut dyn Trainable,
        optimizer: &mut dyn Optimizer,
        window: &mut Accumulator,
        state: &mut TrainingState,
    ) -> TrainingResult<()> {
        let samples = window.samples as f64;
        let loss = window.loss_sum / samples;
        window.grads.scale(1.0 / samples);
        if !window.grads.is_finite() {
            return Err(TrainingError::Divergence { step: state.optimizer_steps, loss });
        }

        let norm = clip_grad_norm(&mut window.grads, self.config.optim.gc);
        optimizer.step(trainable.parameters_mut(), &window.grads)?;
        if !trainable.parameters().is_finite() {
            return Err(TrainingError::Divergence { step: state.optimizer_steps, loss });
        }
        state.optimizer_steps += 1;
        debug!(step = state.optimizer_steps, loss, grad_norm = norm, samples = window.samples, "Optimizer step");
        window.reset();
        Ok(())
    }
}
