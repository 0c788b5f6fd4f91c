//! Bayesian knowledge tracing with per-KC parameters fitted by grid search.

use dialogkt_abstraction::{Dialogue, KtModel, ModelError, ModelState, ModelVariant, TurnContext};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

const INIT_GRID: [f64; 10] = [0.05, 0.15, 0.25, 0.35, 0.45, 0.55, 0.65, 0.75, 0.85, 0.95];
const LEARN_GRID: [f64; 6] = [0.01, 0.05, 0.1, 0.2, 0.3, 0.4];
const GUESS_GRID: [f64; 4] = [0.05, 0.1, 0.2, 0.3];
const SLIP_GRID: [f64; 4] = [0.05, 0.1, 0.2, 0.3];

const MIN_PROB: f64 = 1e-6;

/// The four classic BKT probabilities.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BktParams {
    pub init: f64,
    pub learn: f64,
    pub guess: f64,
    pub slip: f64,
}

impl Default for BktParams {
    fn default() -> Self {
        Self { init: 0.3, learn: 0.1, guess: 0.2, slip: 0.1 }
    }
}

impl BktParams {
    /// Probability of a correct answer given mastery probability `mastery`.
    #[must_use]
    pub fn correct_prob(&self, mastery: f64) -> f64 {
        mastery * (1.0 - self.slip) + (1.0 - mastery) * self.guess
    }

    /// Mastery after observing an outcome with correctness `evidence` in
    /// `[0, 1]`, followed by the learning transition. Fractional evidence
    /// mixes the correct and incorrect posteriors.
    #[must_use]
    pub fn update(&self, mastery: f64, evidence: f64) -> f64 {
        let p_correct = self.correct_prob(mastery).clamp(MIN_PROB, 1.0 - MIN_PROB);
        let if_correct = mastery * (1.0 - self.slip) / p_correct;
        let if_wrong = mastery * self.slip / (1.0 - p_correct);
        let posterior = evidence * if_correct + (1.0 - evidence) * if_wrong;
        posterior + (1.0 - posterior) * self.learn
    }

    /// Negative log-likelihood of binary outcome sequences.
    #[must_use]
    pub fn nll(&self, sequences: &[Vec<bool>]) -> f64 {
        let mut total = 0.0;
        for seq in sequences {
            let mut mastery = self.init;
            for &correct in seq {
                let p = self.correct_prob(mastery).clamp(MIN_PROB, 1.0 - MIN_PROB);
                total -= if correct { p.ln() } else { (1.0 - p).ln() };
                mastery = self.update(mastery, if correct { 1.0 } else { 0.0 });
            }
        }
        total
    }

    /// Grid point with the lowest NLL; ties keep the earliest grid point.
    #[must_use]
    pub fn fit(sequences: &[Vec<bool>]) -> Self {
        let mut best = Self::default();
        let mut best_nll = f64::INFINITY;
        for &init in &INIT_GRID {
            for &learn in &LEARN_GRID {
                for &guess in &GUESS_GRID {
                    for &slip in &SLIP_GRID {
                        let candidate = Self { init, learn, guess, slip };
                        let nll = candidate.nll(sequences);
                        if nll < best_nll {
                            best = candidate;
                            best_nll = nll;
                        }
                    }
                }
            }
        }
        best
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct BktFit {
    global: BktParams,
    per_kc: BTreeMap<String, BktParams>,
}

#[derive(Debug, Default)]
pub struct BktModel {
    fitted: BktFit,
}

impl BktModel {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parameters used for `kc`; KCs unseen in training use the pooled fit.
    #[must_use]
    pub fn params_for(&self, kc: &str) -> BktParams {
        self.fitted.per_kc.get(kc).copied().unwrap_or(self.fitted.global)
    }
}

/// Per-dialogue outcome sequences for every KC, in turn order.
fn sequences_by_kc(train: &[Dialogue]) -> BTreeMap<String, Vec<Vec<bool>>> {
    let mut by_kc: BTreeMap<String, Vec<Vec<bool>>> = BTreeMap::new();
    for dialogue in train {
        let mut current: BTreeMap<&str, Vec<bool>> = BTreeMap::new();
        for turn in dialogue.turns.iter().filter(|t| t.is_scored()) {
            let Some(correct) = turn.correct else { continue };
            for kc in &turn.kcs {
                current.entry(kc.as_str()).or_default().push(correct);
            }
        }
        for (kc, seq) in current {
            by_kc.entry(kc.to_string()).or_default().push(seq);
        }
    }
    by_kc
}

impl KtModel for BktModel {
    fn variant(&self) -> ModelVariant {
        ModelVariant::Bkt
    }

    fn fit(&mut self, train: &[Dialogue]) -> Result<(), ModelError> {
        let by_kc = sequences_by_kc(train);
        let pooled: Vec<Vec<bool>> = by_kc.values().flatten().cloned().collect();
        let global = if pooled.is_empty() { BktParams::default() } else { BktParams::fit(&pooled) };
        let per_kc = by_kc.iter().map(|(kc, seqs)| (kc.clone(), BktParams::fit(seqs))).collect();
        debug!(kcs = by_kc.len(), ?global, "Fitted BKT parameters");
        self.fitted = BktFit { global, per_kc };
        Ok(())
    }

    fn predict(&self, context: &TurnContext, kcs: &[String]) -> Result<Vec<f64>, ModelError> {
        Ok(kcs
            .iter()
            .map(|kc| {
                let params = self.params_for(kc);
                let mastery = context.evidence_for(kc).fold(params.init, |m, e| params.update(m, e));
                params.correct_prob(mastery)
            })
            .collect())
    }

    fn save_state(&self) -> Result<ModelState, ModelError> {
        let mut state = ModelState::new(ModelVariant::Bkt);
        state.extra = serde_json::to_value(&self.fitted).map_err(|e| ModelError::State(e.to_string()))?;
        Ok(state)
    }

    fn load_state(&mut self, state: &ModelState) -> Result<(), ModelError> {
        state.expect_variant(ModelVariant::Bkt)?;
        self.fitted = serde_json::from_value(state.extra.clone()).map_err(|e| ModelError::State(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use dialogkt_abstraction::{ObservedTurn, Turn};

    fn dialogue(id: &str, outcomes: &[(&str, bool)]) -> Dialogue {
        Dialogue {
            id: id.into(),
            subject: None,
            turns: outcomes
                .iter()
                .map(|(kc, correct)| Turn {
                    speaker: "student".to_string(),
                    text: String::new(),
                    correct: Some(*correct),
                    kcs: vec![(*kc).to_string()],
                })
                .collect(),
        }
    }

    #[test]
    fn test_update_moves_mastery_toward_evidence() {
        let p = BktParams::default();
        assert!(p.update(0.5, 1.0) > 0.5);
        assert!(p.update(0.5, 0.0) < p.update(0.5, 1.0));
        let soft = p.update(0.5, 0.5);
        assert!(soft > p.update(0.5, 0.0) && soft < p.update(0.5, 1.0));
    }

    #[test]
    fn test_fit_prefers_high_init_for_always_correct_kc() {
        let seqs = vec![vec![true; 6]; 4];
        let fitted = BktParams::fit(&seqs);
        assert!(fitted.init >= 0.85, "{fitted:?}");
        assert!(fitted.nll(&seqs) <= BktParams::default().nll(&seqs));
    }

    #[test]
    fn test_unseen_kc_uses_global_params() {
        let mut model = BktModel::new();
        model
            .fit(&[dialogue("d1", &[("a", true), ("a", true), ("b", false)]), dialogue("d2", &[("a", true)])])
            .unwrap();
        assert_eq!(model.params_for("zzz"), model.fitted.global);
        assert_ne!(model.params_for("a"), model.params_for("b"));
    }

    #[test]
    fn test_predict_conditions_on_evidence() {
        let model = BktModel::new();
        let mut ctx = TurnContext::new("d".into());
        let kcs = vec!["a".to_string()];
        let prior = model.predict(&ctx, &kcs).unwrap()[0];
        assert_relative_eq!(prior, BktParams::default().correct_prob(0.3), epsilon = 1e-12);

        ctx.history.push(ObservedTurn { speaker: "s".into(), text: String::new(), kcs: kcs.clone(), evidence: Some(1.0) });
        assert!(model.predict(&ctx, &kcs).unwrap()[0] > prior);
    }

    #[test]
    fn test_state_round_trip() {
        let mut model = BktModel::new();
        model.fit(&[dialogue("d1", &[("a", false), ("a", true), ("a", true)])]).unwrap();
        let state = model.save_state().unwrap();
        let mut restored = BktModel::new();
        restored.load_state(&state).unwrap();
        assert_eq!(restored.fitted, model.fitted);
    }
}
