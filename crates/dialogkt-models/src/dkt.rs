//! Deep knowledge tracing over dialogue turns.
//!
//! Every observed (KC, outcome) pair is embedded as `E[2k + outcome]`; the
//! knowledge state is a recency-weighted sum of those embeddings squashed by
//! `tanh`, and each KC is read out by its own query vector and bias. Soft
//! evidence (autoregressive protocol) interpolates between the two outcome
//! embeddings.

use crate::lmkt::{bce_with_logit, sigmoid};
use dialogkt_abstraction::{
    KcVocab, KtModel, Mode, ModelError, ModelState, ModelVariant, ParamSet, Trainable, TrainingExample, TurnContext,
};
use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub const INTERACTION_EMB: &str = "interaction_emb";
pub const KC_QUERY: &str = "kc_query";
pub const KC_BIAS: &str = "kc_bias";

const DECAY: f64 = 0.8;
const INIT_RANGE: f64 = 0.1;

pub struct DktModel {
    vocab: KcVocab,
    emb_size: usize,
    params: ParamSet,
}

/// One (vocabulary index, soft outcome, recency weight) observation.
struct Interaction {
    kc: usize,
    outcome: f64,
    weight: f64,
}

impl DktModel {
    #[must_use]
    pub fn new(vocab: KcVocab, emb_size: usize, seed: u64) -> Self {
        let k = vocab.len();
        let mut rng = StdRng::seed_from_u64(seed);
        let mut init = |shape: (usize, usize)| Array2::from_shape_simple_fn(shape, || rng.gen_range(-INIT_RANGE..INIT_RANGE));

        let mut params = ParamSet::new();
        params.push(INTERACTION_EMB, init((2 * k, emb_size)));
        params.push(KC_QUERY, init((k, emb_size)));
        params.push(KC_BIAS, Array2::zeros((1, k)));
        Self { vocab, emb_size, params }
    }

    #[must_use]
    pub const fn vocab(&self) -> &KcVocab {
        &self.vocab
    }

    fn kc_index(&self, kc: &str) -> Result<usize, ModelError> {
        self.vocab.index_of(kc).ok_or_else(|| ModelError::UnknownKc(kc.to_string()))
    }

    /// Observations that carry evidence, weighted by recency. KCs outside the
    /// vocabulary cannot be embedded and are skipped.
    fn interactions(&self, context: &TurnContext) -> Vec<Interaction> {
        let n = context.history.len();
        let mut out = Vec::new();
        for (i, turn) in context.history.iter().enumerate() {
            let Some(outcome) = turn.evidence else { continue };
            let weight = DECAY.powi((n - 1 - i) as i32);
            for kc in &turn.kcs {
                if let Some(idx) = self.vocab.index_of(kc) {
                    out.push(Interaction { kc: idx, outcome, weight });
                }
            }
        }
        out
    }

    fn hidden(&self, interactions: &[Interaction]) -> Result<Array1<f64>, ModelError> {
        let emb = self.params.require(INTERACTION_EMB)?;
        let mut pre = Array1::<f64>::zeros(self.emb_size);
        for it in interactions {
            let right = emb.row(2 * it.kc + 1);
            let wrong = emb.row(2 * it.kc);
            pre.scaled_add(it.weight * it.outcome, &right);
            pre.scaled_add(it.weight * (1.0 - it.outcome), &wrong);
        }
        Ok(pre.mapv(f64::tanh))
    }

    fn logit(&self, h: &Array1<f64>, kc: usize) -> Result<f64, ModelError> {
        let query = self.params.require(KC_QUERY)?;
        let bias = self.params.require(KC_BIAS)?;
        let logit = query.row(kc).dot(h) + bias[(0, kc)];
        if logit.is_finite() { Ok(logit) } else { Err(ModelError::NonFinite("dkt logit".to_string())) }
    }
}

impl Trainable for DktModel {
    fn parameters(&self) -> &ParamSet {
        &self.params
    }

    fn parameters_mut(&mut self) -> &mut ParamSet {
        &mut self.params
    }

    fn set_mode(&mut self, _mode: Mode) {}

    fn loss_and_grad(&mut self, batch: &[TrainingExample]) -> Result<(f64, ParamSet), ModelError> {
        let mut grad = self.params.zeros_like();
        if batch.is_empty() {
            return Ok((0.0, grad));
        }
        let k = self.vocab.len();
        let mut d_emb = Array2::<f64>::zeros((2 * k, self.emb_size));
        let mut d_query = Array2::<f64>::zeros((k, self.emb_size));
        let mut d_bias = Array2::<f64>::zeros((1, k));
        let mut total = 0.0;

        let query = self.params.require(KC_QUERY)?;
        for example in batch {
            let kc = self.kc_index(&example.kc)?;
            let interactions = self.interactions(&example.context);
            let h = self.hidden(&interactions)?;
            let logit = self.logit(&h, kc)?;
            let y = example.target();
            total += bce_with_logit(logit, y);

            let dl = sigmoid(logit) - y;
            d_bias[(0, kc)] += dl;
            d_query.row_mut(kc).scaled_add(dl, &h);

            let dpre = query.row(kc).to_owned() * dl * h.mapv(|v| 1.0 - v * v);
            for it in &interactions {
                d_emb.row_mut(2 * it.kc + 1).scaled_add(it.weight * it.outcome, &dpre);
                d_emb.row_mut(2 * it.kc).scaled_add(it.weight * (1.0 - it.outcome), &dpre);
            }
        }

        let n = batch.len() as f64;
        for (name, value) in [(INTERACTION_EMB, d_emb), (KC_QUERY, d_query), (KC_BIAS, d_bias)] {
            if let Some(t) = grad.get_mut(name) {
                *t = value / n;
            }
        }
        Ok((total / n, grad))
    }
}

impl KtModel for DktModel {
    fn variant(&self) -> ModelVariant {
        ModelVariant::Dkt
    }

    fn predict(&self, context: &TurnContext, kcs: &[String]) -> Result<Vec<f64>, ModelError> {
        let h = self.hidden(&self.interactions(context))?;
        kcs.iter().map(|kc| self.logit(&h, self.kc_index(kc)?).map(sigmoid)).collect()
    }

    fn trainable(&mut self) -> Option<&mut dyn Trainable> {
        Some(self)
    }

    fn save_state(&self) -> Result<ModelState, ModelError> {
        let mut state = ModelState::new(ModelVariant::Dkt);
        state.params = self.params.clone();
        state.extra = serde_json::to_value(&self.vocab).map_err(|e| ModelError::State(e.to_string()))?;
        Ok(state)
    }

    fn load_state(&mut self, state: &ModelState) -> Result<(), ModelError> {
        state.expect_variant(ModelVariant::Dkt)?;
        let vocab: KcVocab =
            serde_json::from_value(state.extra.clone()).map_err(|e| ModelError::State(e.to_string()))?;
        let vocab = vocab.reindexed();
        if vocab != self.vocab {
            return Err(ModelError::State(format!(
                "saved model covers {} KCs, this dataset has {}",
                vocab.len(),
                self.vocab.len()
            )));
        }
        self.params.assign(&state.params)
    }

    fn estimate_batch_bytes(&self, batch_size: usize) -> u64 {
        let params = self.params.num_elements() as u64 * 8 * 4;
        params + batch_size as u64 * self.emb_size as u64 * 8 * 4
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use dialogkt_abstraction::ObservedTurn;
    use std::sync::Arc;

    fn context(observed: &[(&str, Option<f64>)]) -> TurnContext {
        let mut ctx = TurnContext::new("d1".into());
        for (kc, evidence) in observed {
            ctx.history.push(ObservedTurn {
                speaker: "student".to_string(),
                text: String::new(),
                kcs: vec![(*kc).to_string()],
                evidence: *evidence,
            });
        }
        ctx.turn_index = observed.len();
        ctx
    }

    fn model() -> DktModel {
        DktModel::new(KcVocab::new(["a", "b", "c"]), 4, 3)
    }

    #[test]
    fn test_unknown_query_kc_is_an_error() {
        let m = model();
        let err = m.predict(&context(&[]), &["z".to_string()]).unwrap_err();
        assert_eq!(err, ModelError::UnknownKc("z".to_string()));
    }

    #[test]
    fn test_outcome_changes_prediction() {
        let m = model();
        let kcs = vec!["a".to_string()];
        let right = m.predict(&context(&[("a", Some(1.0))]), &kcs).unwrap();
        let wrong = m.predict(&context(&[("a", Some(0.0))]), &kcs).unwrap();
        let hidden = m.predict(&context(&[("a", None)]), &kcs).unwrap();
        assert_ne!(right, wrong);
        assert_eq!(hidden, m.predict(&context(&[]), &kcs).unwrap());
    }

    #[test]
    fn test_gradient_matches_finite_differences() {
        let mut m = model();
        let batch: Vec<TrainingExample> = [("a", true), ("b", false), ("c", true)]
            .iter()
            .map(|(kc, label)| TrainingExample {
                context: Arc::new(context(&[("a", Some(1.0)), ("b", Some(0.3)), ("c", None)])),
                kc: (*kc).to_string(),
                label: *label,
            })
            .collect();
        let (_, grad) = m.loss_and_grad(&batch).unwrap();

        let eps = 1e-6;
        for (name, idx) in [(INTERACTION_EMB, (1, 2)), (INTERACTION_EMB, (2, 0)), (KC_QUERY, (1, 3)), (KC_BIAS, (0, 2))] {
            let original = m.params.get(name).unwrap()[idx];
            m.params.get_mut(name).unwrap()[idx] = original + eps;
            let (plus, _) = m.loss_and_grad(&batch).unwrap();
            m.params.get_mut(name).unwrap()[idx] = original - eps;
            let (minus, _) = m.loss_and_grad(&batch).unwrap();
            m.params.get_mut(name).unwrap()[idx] = original;
            assert_relative_eq!(grad.get(name).unwrap()[idx], (plus - minus) / (2.0 * eps), epsilon = 1e-6);
        }
    }

    #[test]
    fn test_load_rejects_different_vocabulary() {
        let state = model().save_state().unwrap();
        let mut other = DktModel::new(KcVocab::new(["a", "b"]), 4, 3);
        assert!(matches!(other.load_state(&state), Err(ModelError::State(_))));

        let mut same = model();
        same.load_state(&state).unwrap();
    }
}
