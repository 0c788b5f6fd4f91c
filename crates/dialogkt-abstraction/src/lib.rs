//! Model abstraction layer for dialogkt.
//!
//! This crate defines the dialogue types every knowledge-tracing model consumes
//! and the capability traits the experiment harness drives:
//!
//! - [`KtModel`]: forward prediction, closed-form fitting, state persistence
//! - [`Trainable`]: gradient access for variants trained by the optimizer loop

pub mod dialogue;
pub mod params;
pub mod seed;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub use dialogue::{Dialogue, DialogueId, KcVocab, ObservedTurn, TrainingExample, Turn, TurnContext};
pub use params::{ParamSet, ParamTensor};

/// Represents an error raised by a knowledge-tracing model.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ModelError {
    /// An option was supplied that the variant does not accept, or a value is invalid.
    #[error("invalid model option `{field}`: {message}")]
    InvalidOption {
        /// The offending configuration field.
        field: String,
        /// Why it was rejected.
        message: String,
    },

    /// The requested model type does not exist.
    #[error("unknown model type: {0}")]
    UnknownVariant(String),

    /// A KC was requested that is not part of the model's vocabulary.
    #[error("unknown knowledge component: {0}")]
    UnknownKc(String),

    /// Saved state does not match the model it is loaded into.
    #[error("model state error: {0}")]
    State(String),

    /// The forward pass produced a non-finite value.
    #[error("non-finite value in {0}")]
    NonFinite(String),

    /// The requested configuration does not fit the available memory.
    #[error("`{field}` = {value} exceeds resources: {message}")]
    Resource {
        /// The offending configuration field.
        field: String,
        /// The configured value.
        value: String,
        /// Details of the estimate.
        message: String,
    },

    /// Other unexpected errors.
    #[error("model error: {0}")]
    Other(String),
}

/// Model families supported by the harness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelVariant {
    /// LLM-backed predictor with low-rank adapters.
    Lmkt,
    /// Deep knowledge tracing sequence model.
    Dkt,
    /// Bayesian knowledge tracing.
    Bkt,
    /// Predicts the training positive rate.
    Majority,
    /// Uniform random predictions.
    Random,
}

impl ModelVariant {
    /// All variants, in CLI order.
    pub const ALL: [Self; 5] = [Self::Lmkt, Self::Random, Self::Majority, Self::Bkt, Self::Dkt];

    /// Whether the variant is trained by gradient descent.
    #[must_use]
    pub const fn is_trainable(self) -> bool {
        matches!(self, Self::Lmkt | Self::Dkt)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Lmkt => "lmkt",
            Self::Dkt => "dkt",
            Self::Bkt => "bkt",
            Self::Majority => "majority",
            Self::Random => "random",
        }
    }
}

impl fmt::Display for ModelVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelVariant {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "lmkt" => Ok(Self::Lmkt),
            "dkt" => Ok(Self::Dkt),
            "bkt" => Ok(Self::Bkt),
            "majority" => Ok(Self::Majority),
            "random" => Ok(Self::Random),
            other => Err(ModelError::UnknownVariant(other.to_string())),
        }
    }
}

/// Forward-pass mode. Evaluation always runs in `Eval`, which disables dropout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    Train,
    #[default]
    Eval,
}

/// Serializable snapshot of a model's learnable state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelState {
    pub variant: ModelVariant,
    /// Gradient-trained parameters (empty for statistical baselines).
    #[serde(default)]
    pub params: ParamSet,
    /// Variant-specific fitted statistics.
    #[serde(default)]
    pub extra: serde_json::Value,
}

impl ModelState {
    #[must_use]
    pub fn new(variant: ModelVariant) -> Self {
        Self { variant, params: ParamSet::default(), extra: serde_json::Value::Null }
    }

    /// Fails unless the state was produced by `variant`.
    pub fn expect_variant(&self, variant: ModelVariant) -> Result<(), ModelError> {
        if self.variant == variant {
            Ok(())
        } else {
            Err(ModelError::State(format!(
                "state was saved by a `{}` model, cannot load into `{}`",
                self.variant, variant
            )))
        }
    }
}

/// Gradient access for variants trained by the optimizer loop.
pub trait Trainable: Send {
    /// Trainable parameters only; frozen weights are never exposed.
    fn parameters(&self) -> &ParamSet;

    fn parameters_mut(&mut self) -> &mut ParamSet;

    fn set_mode(&mut self, mode: Mode);

    /// Mean binary cross-entropy over `batch` and its gradient with respect to
    /// [`Trainable::parameters`].
    fn loss_and_grad(&mut self, batch: &[TrainingExample]) -> Result<(f64, ParamSet), ModelError>;
}

/// Capability interface implemented by every model variant.
///
/// Orchestrators depend only on this trait and never branch on the variant tag.
pub trait KtModel: Send {
    fn variant(&self) -> ModelVariant;

    /// Closed-form parameter estimation over the training dialogues.
    ///
    /// Gradient-trained variants keep the default no-op.
    fn fit(&mut self, _train: &[Dialogue]) -> Result<(), ModelError> {
        Ok(())
    }

    /// Predicted probability that the learner answers correctly, one per KC in
    /// `kcs`, conditioned on the prior turns in `context`.
    fn predict(&self, context: &TurnContext, kcs: &[String]) -> Result<Vec<f64>, ModelError>;

    /// Gradient access, `None` for statistical baselines.
    fn trainable(&mut self) -> Option<&mut dyn Trainable> {
        None
    }

    fn save_state(&self) -> Result<ModelState, ModelError>;

    fn load_state(&mut self, state: &ModelState) -> Result<(), ModelError>;

    /// Estimated working-set bytes for one batch of `batch_size` examples.
    fn estimate_batch_bytes(&self, _batch_size: usize) -> u64 {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_variant_round_trips_through_str() {
        for variant in ModelVariant::ALL {
            assert_eq!(variant.as_str().parse::<ModelVariant>().unwrap(), variant);
        }
        assert!("LMKT".parse::<ModelVariant>().is_ok());
    }

    #[test]
    fn test_unknown_variant_is_rejected() {
        let err = "transformer".parse::<ModelVariant>().unwrap_err();
        assert_eq!(err, ModelError::UnknownVariant("transformer".to_string()));
    }

    #[test]
    fn test_only_gradient_models_are_trainable() {
        assert!(ModelVariant::Lmkt.is_trainable());
        assert!(ModelVariant::Dkt.is_trainable());
        assert!(!ModelVariant::Bkt.is_trainable());
        assert!(!ModelVariant::Majority.is_trainable());
        assert!(!ModelVariant::Random.is_trainable());
    }

    #[test]
    fn test_state_variant_mismatch() {
        let state = ModelState::new(ModelVariant::Bkt);
        assert!(state.expect_variant(ModelVariant::Bkt).is_ok());
        assert!(matches!(state.expect_variant(ModelVariant::Dkt), Err(ModelError::State(_))));
    }
}
