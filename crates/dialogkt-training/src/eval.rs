//! Evaluation engine.
//!
//! Scans each dialogue turn by turn, asks the model for a probability per KC of
//! every scored turn and accumulates per-KC metrics. The model is only borrowed
//! immutably, so evaluation never changes its state.

use crate::error::{TrainingError, TrainingResult};
use crate::folds::SplitKind;
use crate::metrics::{MetricsAccumulator, MetricsRecord, Provenance};
use crate::scan::{DialogueScan, ScanProtocol, ScoredTurn};
use dialogkt_abstraction::{Dialogue, DialogueId, KtModel, ModelError};
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvalOptions {
    /// Score all KCs of a turn in one `predict` call.
    pub pack_kcs: bool,
    /// Expose ground-truth correctness of earlier turns instead of the model's own predictions.
    pub teacher_forced: bool,
    pub inc_first_label: bool,
}

impl EvalOptions {
    #[must_use]
    pub const fn protocol(&self) -> ScanProtocol {
        ScanProtocol { teacher_forced: self.teacher_forced, inc_first_label: self.inc_first_label }
    }

    #[must_use]
    pub const fn provenance(&self, split: SplitKind) -> Provenance {
        Provenance {
            split,
            teacher_forced: self.teacher_forced,
            inc_first_label: self.inc_first_label,
            pack_kcs: self.pack_kcs,
        }
    }
}

/// Predictions for one scored turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnPrediction {
    pub dialogue_id: DialogueId,
    pub turn_index: usize,
    pub label: bool,
    pub kcs: Vec<String>,
    pub probabilities: Vec<f64>,
}

fn predict_turn(model: &dyn KtModel, turn: &ScoredTurn, pack_kcs: bool) -> TrainingResult<Vec<f64>> {
    let probabilities = if pack_kcs {
        model.predict(&turn.context, &turn.kcs)?
    } else {
        let mut out = Vec::with_capacity(turn.kcs.len());
        for kc in &turn.kcs {
            out.extend(model.predict(&turn.context, std::slice::from_ref(kc))?);
        }
        out
    };

    if probabilities.len() != turn.kcs.len() {
        return Err(TrainingError::Model(ModelError::Other(format!(
            "model returned {} predictions for {} KCs",
            probabilities.len(),
            turn.kcs.len()
        ))));
    }
    if let Some(bad) = probabilities.iter().find(|p| !p.is_finite()) {
        return Err(TrainingError::Model(ModelError::NonFinite(format!(
            "prediction {bad} at turn {} of dialogue {}",
            turn.turn_index(),
            turn.context.dialogue_id
        ))));
    }
    Ok(probabilities)
}

/// Predictions for every scored turn of `dialogue`, in turn order.
pub fn predict_dialogue(
    model: &dyn KtModel,
    dialogue: &Dialogue,
    options: &EvalOptions,
) -> TrainingResult<Vec<TurnPrediction>> {
    let mut scan = DialogueScan::new(dialogue, options.protocol());
    let mut out = Vec::new();
    while let Some(turn) = scan.next() {
        let probabilities = predict_turn(model, &turn, options.pack_kcs)?;
        scan.feedback(&probabilities);
        out.push(TurnPrediction {
            dialogue_id: dialogue.id.clone(),
            turn_index: turn.turn_index(),
            label: turn.label,
            kcs: turn.kcs,
            probabilities,
        });
    }
    Ok(out)
}

/// Scores `model` on `dialogues`.
pub fn evaluate(
    model: &dyn KtModel,
    dialogues: &[Dialogue],
    split: SplitKind,
    options: &EvalOptions,
) -> TrainingResult<MetricsRecord> {
    let mut acc = MetricsAccumulator::new();
    for dialogue in dialogues {
        for prediction in predict_dialogue(model, dialogue, options)? {
            for (kc, p) in prediction.kcs.iter().zip(&prediction.probabilities) {
                acc.add(kc, *p, prediction.label);
            }
        }
    }
    let record = acc.finish(options.provenance(split));
    debug!(
        %split,
        model_type = %model.variant(),
        samples = record.num_samples,
        loss = record.loss,
        accuracy = ?record.aggregate.accuracy,
        auc = ?record.aggregate.auc,
        "Evaluated split"
    );
    Ok(record)
}
