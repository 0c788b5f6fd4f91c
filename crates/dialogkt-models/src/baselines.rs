//! Reference predictors that ignore the dialogue content.

use dialogkt_abstraction::seed::{derive_seed, fnv1a, mix64, unit_interval};
use dialogkt_abstraction::{Dialogue, KtModel, ModelError, ModelState, ModelVariant, TurnContext};
use serde_json::json;

/// Predicts the positive rate of the training labels for every KC.
#[derive(Debug, Clone)]
pub struct MajorityModel {
    rate: f64,
}

impl Default for MajorityModel {
    fn default() -> Self {
        Self { rate: 0.5 }
    }
}

impl MajorityModel {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn rate(&self) -> f64 {
        self.rate
    }
}

impl KtModel for MajorityModel {
    fn variant(&self) -> ModelVariant {
        ModelVariant::Majority
    }

    fn fit(&mut self, train: &[Dialogue]) -> Result<(), ModelError> {
        let (positives, total) = train
            .iter()
            .flat_map(|d| d.turns.iter())
            .filter(|t| t.is_scored())
            .fold((0_usize, 0_usize), |(p, n), t| {
                let k = t.kcs.len();
                (p + if t.correct == Some(true) { k } else { 0 }, n + k)
            });
        if total > 0 {
            self.rate = positives as f64 / total as f64;
        }
        Ok(())
    }

    fn predict(&self, _context: &TurnContext, kcs: &[String]) -> Result<Vec<f64>, ModelError> {
        Ok(vec![self.rate; kcs.len()])
    }

    fn save_state(&self) -> Result<ModelState, ModelError> {
        let mut state = ModelState::new(ModelVariant::Majority);
        state.extra = json!({ "rate": self.rate });
        Ok(state)
    }

    fn load_state(&mut self, state: &ModelState) -> Result<(), ModelError> {
        state.expect_variant(ModelVariant::Majority)?;
        self.rate = state
            .extra
            .get("rate")
            .and_then(serde_json::Value::as_f64)
            .ok_or_else(|| ModelError::State("majority state is missing `rate`".to_string()))?;
        Ok(())
    }
}

/// Uniform predictions in `[0, 1)`.
///
/// Each value is a hash of the seed, the dialogue, the turn and the KC, so a
/// prediction does not depend on how KCs are grouped into calls.
#[derive(Debug, Clone)]
pub struct RandomModel {
    seed: u64,
}

impl RandomModel {
    #[must_use]
    pub const fn new(seed: u64) -> Self {
        Self { seed }
    }
}

impl KtModel for RandomModel {
    fn variant(&self) -> ModelVariant {
        ModelVariant::Random
    }

    fn predict(&self, context: &TurnContext, kcs: &[String]) -> Result<Vec<f64>, ModelError> {
        let turn_seed = derive_seed(self.seed ^ fnv1a(context.dialogue_id.0.as_bytes()), "turn", context.turn_index as u64);
        Ok(kcs.iter().map(|kc| unit_interval(mix64(turn_seed ^ fnv1a(kc.as_bytes())))).collect())
    }

    fn save_state(&self) -> Result<ModelState, ModelError> {
        let mut state = ModelState::new(ModelVariant::Random);
        state.extra = json!({ "seed": self.seed });
        Ok(state)
    }

    fn load_state(&mut self, state: &ModelState) -> Result<(), ModelError> {
        state.expect_variant(ModelVariant::Random)?;
        self.seed = state
            .extra
            .get("seed")
            .and_then(serde_json::Value::as_u64)
            .ok_or_else(|| ModelError::State("random state is missing `seed`".to_string()))?;
        Ok(())
    }
}
