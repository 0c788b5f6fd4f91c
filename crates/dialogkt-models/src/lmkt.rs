//! LLM-KT: a frozen base model with trainable low-rank adapters.
//!
//! The prompt embedding `x` (context plus KC query) passes through the frozen
//! projection `W0` and an adapter `B·A` scaled by `alpha / r`:
//!
//! ```text
//! h     = tanh(W0·x + (alpha / r)·B·A·dropout(x))
//! logit = v·h            (yes-token minus no-token logit)
//! p     = sigmoid(logit)
//! ```
//!
//! Only `A` and `B` are trainable. `B` starts at zero so an untrained model
//! reproduces the base model's answer.

use crate::encoder::BaseModel;
use dialogkt_abstraction::{
    KtModel, Mode, ModelError, ModelState, ModelVariant, ParamSet, Trainable, TrainingExample, TurnContext,
};
use ndarray::{Array1, Array2, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const LORA_A: &str = "lora_a";
pub const LORA_B: &str = "lora_b";

/// Low-rank adapter hyperparameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoraConfig {
    pub rank: usize,
    pub alpha: f64,
    pub dropout: f64,
}

impl Default for LoraConfig {
    fn default() -> Self {
        Self { rank: 16, alpha: 16.0, dropout: 0.05 }
    }
}

impl LoraConfig {
    #[must_use]
    pub fn scaling(&self) -> f64 {
        self.alpha / self.rank as f64
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct LmktExtra {
    base_model: String,
    rank: usize,
    alpha: f64,
    quantize: bool,
}

/// Intermediate values of one forward pass, kept for the backward pass.
struct Forward {
    x_drop: Array1<f64>,
    a: Array1<f64>,
    h: Array1<f64>,
    logit: f64,
}

pub struct LmktModel {
    base: Arc<dyn BaseModel>,
    lora: LoraConfig,
    quantize: bool,
    params: ParamSet,
    mode: Mode,
    rng: StdRng,
}

impl LmktModel {
    #[must_use]
    pub fn new(base: Arc<dyn BaseModel>, lora: LoraConfig, quantize: bool, seed: u64) -> Self {
        let d = base.hidden_size();
        let r = lora.rank;
        let mut rng = StdRng::seed_from_u64(seed);
        let bound = 1.0 / (d as f64).sqrt();

        let mut params = ParamSet::new();
        params.push(LORA_A, Array2::from_shape_simple_fn((r, d), || rng.gen_range(-bound..bound)));
        params.push(LORA_B, Array2::zeros((d, r)));

        Self { base, lora, quantize, params, mode: Mode::Eval, rng }
    }

    #[must_use]
    pub fn base_model(&self) -> &str {
        self.base.id()
    }

    #[must_use]
    pub const fn lora(&self) -> &LoraConfig {
        &self.lora
    }

    fn embed(&self, context: &TurnContext, context_emb: &Array1<f64>, kc: &str) -> Array1<f64> {
        context_emb + &self.base.encode_query(context, kc)
    }

    fn forward(&self, x: &Array1<f64>, x_drop: Array1<f64>) -> Result<Forward, ModelError> {
        let lora_a = self.params.require(LORA_A)?;
        let lora_b = self.params.require(LORA_B)?;

        let a = lora_a.dot(&x_drop);
        let z = self.base.projection().dot(x) + &(lora_b.dot(&a) * self.lora.scaling());
        let h = z.mapv(f64::tanh);
        let logit = self.base.readout().dot(&h);
        if !logit.is_finite() {
            return Err(ModelError::NonFinite("lmkt logit".to_string()));
        }
        Ok(Forward { x_drop, a, h, logit })
    }

    fn dropout(&mut self, x: &Array1<f64>) -> Array1<f64> {
        let p = self.lora.dropout;
        if self.mode == Mode::Eval || p <= 0.0 {
            return x.clone();
        }
        let keep = 1.0 / (1.0 - p);
        x.mapv(|v| if self.rng.gen_range(0.0..1.0) < p { 0.0 } else { v * keep })
    }
}

pub(crate) fn sigmoid(x: f64) -> f64 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

/// Binary cross-entropy of `sigmoid(logit)` against `y`, computed without overflow.
pub(crate) fn bce_with_logit(logit: f64, y: f64) -> f64 {
    logit.max(0.0) + (-logit.abs()).exp().ln_1p() - y * logit
}

impl Trainable for LmktModel {
    fn parameters(&self) -> &ParamSet {
        &self.params
    }

    fn parameters_mut(&mut self) -> &mut ParamSet {
        &mut self.params
    }

    fn set_mode(&mut self, mode: Mode) {
        self.mode = mode;
    }

    fn loss_and_grad(&mut self, batch: &[TrainingExample]) -> Result<(f64, ParamSet), ModelError> {
        let mut grad = self.params.zeros_like();
        if batch.is_empty() {
            return Ok((0.0, grad));
        }
        let d = self.base.hidden_size();
        let r = self.lora.rank;
        let s = self.lora.scaling();
        let mut d_a = Array2::<f64>::zeros((r, d));
        let mut d_b = Array2::<f64>::zeros((d, r));
        let mut total = 0.0;

        for example in batch {
            let context_emb = self.base.encode_context(&example.context);
            let x = self.embed(&example.context, &context_emb, &example.kc);
            let x_drop = self.dropout(&x);
            let fwd = self.forward(&x, x_drop)?;
            let y = example.target();
            total += bce_with_logit(fwd.logit, y);

            let p = sigmoid(fwd.logit);
            let g: Array1<f64> = self.base.readout() * &fwd.h.mapv(|h| 1.0 - h * h) * (p - y);
            let g_col = g.view().insert_axis(Axis(1));
            d_b += &(g_col.dot(&fwd.a.view().insert_axis(Axis(0))) * s);

            let lora_b = self.params.require(LORA_B)?;
            let da = lora_b.t().dot(&g) * s;
            d_a += &da.view().insert_axis(Axis(1)).dot(&fwd.x_drop.view().insert_axis(Axis(0)));
        }

        let n = batch.len() as f64;
        if let Some(t) = grad.get_mut(LORA_A) {
            *t = d_a / n;
        }
        if let Some(t) = grad.get_mut(LORA_B) {
            *t = d_b / n;
        }
        Ok((total / n, grad))
    }
}

impl KtModel for LmktModel {
    fn variant(&self) -> ModelVariant {
        ModelVariant::Lmkt
    }

    fn predict(&self, context: &TurnContext, kcs: &[String]) -> Result<Vec<f64>, ModelError> {
        let context_emb = self.base.encode_context(context);
        kcs.iter()
            .map(|kc| {
                let x = self.embed(context, &context_emb, kc);
                self.forward(&x, x.clone()).map(|f| sigmoid(f.logit))
            })
            .collect()
    }

    fn trainable(&mut self) -> Option<&mut dyn Trainable> {
        Some(self)
    }

    fn save_state(&self) -> Result<ModelState, ModelError> {
        let extra = LmktExtra {
            base_model: self.base.id().to_string(),
            rank: self.lora.rank,
            alpha: self.lora.alpha,
            quantize: self.quantize,
        };
        let mut state = ModelState::new(ModelVariant::Lmkt);
        state.params = self.params.clone();
        state.extra = serde_json::to_value(extra).map_err(|e| ModelError::State(e.to_string()))?;
        Ok(state)
    }

    fn load_state(&mut self, state: &ModelState) -> Result<(), ModelError> {
        state.expect_variant(ModelVariant::Lmkt)?;
        let extra: LmktExtra =
            serde_json::from_value(state.extra.clone()).map_err(|e| ModelError::State(e.to_string()))?;
        if extra.base_model != self.base.id() {
            return Err(ModelError::State(format!(
                "adapters were trained on `{}`, this model wraps `{}`",
                extra.base_model,
                self.base.id()
            )));
        }
        if extra.quantize != self.quantize {
            return Err(ModelError::InvalidOption {
                field: "quantize".to_string(),
                message: format!(
                    "adapters were trained with quantize = {}, this run sets quantize = {}",
                    extra.quantize, self.quantize
                ),
            });
        }
        if extra.rank != self.lora.rank {
            return Err(ModelError::State(format!(
                "adapter rank {} does not match configured rank {}",
                extra.rank, self.lora.rank
            )));
        }
        self.params.assign(&state.params)
    }

    fn estimate_batch_bytes(&self, batch_size: usize) -> u64 {
        let d = self.base.hidden_size() as u64;
        let nominal = self.base.nominal_parameters().unwrap_or(d * d + d);
        let weights = if self.quantize { nominal / 2 } else { nominal * 2 };
        // adapters plus two optimizer moments
        let adapters = self.params.num_elements() as u64 * 8 * 3;
        let activations = batch_size as u64 * (nominal / 16).max(d * 8);
        weights + adapters + activations
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::HashedEncoder;
    use approx::assert_relative_eq;
    use dialogkt_abstraction::ObservedTurn;

    fn model(dropout: f64) -> LmktModel {
        let base: Arc<dyn BaseModel> = Arc::new(HashedEncoder::load("test-base", 12));
        LmktModel::new(base, LoraConfig { rank: 3, alpha: 6.0, dropout }, false, 7)
    }

    fn example(kc: &str, label: bool, evidence: Option<f64>) -> TrainingExample {
        let mut ctx = TurnContext::new("d1".into());
        ctx.history.push(ObservedTurn {
            speaker: "student".to_string(),
            text: "I think the answer is seven".to_string(),
            kcs: vec![kc.to_string()],
            evidence,
        });
        ctx.turn_index = 1;
        TrainingExample { context: Arc::new(ctx), kc: kc.to_string(), label }
    }

    fn perturb_b(model: &mut LmktModel) {
        if let Some(b) = model.params.get_mut(LORA_B) {
            for (i, v) in b.iter_mut().enumerate() {
                *v = (i as f64 * 0.37).sin() * 0.3;
            }
        }
    }

    #[test]
    fn test_untrained_model_matches_base() {
        let m = model(0.0);
        let ex = example("fractions", true, Some(1.0));
        let x = m.embed(&ex.context, &m.base.encode_context(&ex.context), "fractions");
        let base_logit = m.base.readout().dot(&m.base.projection().dot(&x).mapv(f64::tanh));
        let p = m.predict(&ex.context, &["fractions".to_string()]).unwrap()[0];
        assert_relative_eq!(p, sigmoid(base_logit), epsilon = 1e-12);
    }

    #[test]
    fn test_gradient_matches_finite_differences() {
        let mut m = model(0.0);
        perturb_b(&mut m);
        let batch = vec![example("a", true, Some(0.0)), example("b", false, Some(1.0))];
        let (_, grad) = m.loss_and_grad(&batch).unwrap();

        let eps = 1e-6;
        for name in [LORA_A, LORA_B] {
            for idx in [(0, 0), (1, 2), (2, 1)] {
                let original = m.params.get(name).unwrap()[idx];
                m.params.get_mut(name).unwrap()[idx] = original + eps;
                let (plus, _) = m.loss_and_grad(&batch).unwrap();
                m.params.get_mut(name).unwrap()[idx] = original - eps;
                let (minus, _) = m.loss_and_grad(&batch).unwrap();
                m.params.get_mut(name).unwrap()[idx] = original;
                let numeric = (plus - minus) / (2.0 * eps);
                assert_relative_eq!(grad.get(name).unwrap()[idx], numeric, epsilon = 1e-6);
            }
        }
    }

    #[test]
    fn test_eval_mode_is_deterministic_with_dropout() {
        let mut m = model(0.5);
        perturb_b(&mut m);
        m.set_mode(Mode::Eval);
        let ex = example("a", true, None);
        let kcs = vec!["a".to_string()];
        assert_eq!(m.predict(&ex.context, &kcs).unwrap(), m.predict(&ex.context, &kcs).unwrap());
    }

    #[test]
    fn test_state_round_trip_and_base_mismatch() {
        let mut m = model(0.0);
        perturb_b(&mut m);
        let state = m.save_state().unwrap();

        let mut restored = model(0.0);
        restored.load_state(&state).unwrap();
        assert_eq!(restored.params, m.params);

        let other_base: Arc<dyn BaseModel> = Arc::new(HashedEncoder::load("other-base", 12));
        let mut other = LmktModel::new(other_base, LoraConfig { rank: 3, alpha: 6.0, dropout: 0.0 }, false, 7);
        assert!(matches!(other.load_state(&state), Err(ModelError::State(_))));
    }

    #[test]
    fn test_quantize_mismatch_is_rejected() {
        let base: Arc<dyn BaseModel> = Arc::new(HashedEncoder::load("test-base", 12));
        let lora = LoraConfig { rank: 3, alpha: 6.0, dropout: 0.0 };
        let state = LmktModel::new(Arc::clone(&base), lora.clone(), true, 7).save_state().unwrap();

        let mut full = LmktModel::new(Arc::clone(&base), lora.clone(), false, 7);
        let err = full.load_state(&state).unwrap_err();
        assert!(matches!(&err, ModelError::InvalidOption { field, .. } if field == "quantize"));

        let mut quantized = LmktModel::new(base, lora, true, 7);
        assert!(quantized.load_state(&state).is_ok());
    }

    #[test]
    fn test_quantized_estimate_is_smaller() {
        let base: Arc<dyn BaseModel> = Arc::new(HashedEncoder::load("llama-8B", 12));
        let full = LmktModel::new(Arc::clone(&base), LoraConfig::default(), false, 1);
        let quant = LmktModel::new(base, LoraConfig::default(), true, 1);
        assert!(quant.estimate_batch_bytes(8) < full.estimate_batch_bytes(8));
        assert!(full.estimate_batch_bytes(8) > 16_000_000_000);
    }

    #[test]
    fn test_bce_with_logit_is_stable() {
        assert!(bce_with_logit(1000.0, 1.0).abs() < 1e-9);
        assert_relative_eq!(bce_with_logit(-1000.0, 1.0), 1000.0, epsilon = 1e-9);
        assert_relative_eq!(bce_with_logit(0.0, 0.0), std::f64::consts::LN_2, epsilon = 1e-12);
    }
}
