//! Frozen base models for LLM-KT.
//!
//! The pretrained language model is an external collaborator; the harness only
//! needs three things from it: an embedding of the dialogue prompt, an
//! embedding of each KC query, and a frozen hidden projection plus answer-token
//! readout that low-rank adapters attach to. [`HashedEncoder`] provides those
//! deterministically from the base model identifier so the pipeline runs
//! without network access or accelerator libraries.

use dialogkt_abstraction::seed::{fnv1a, mix64};
use dialogkt_abstraction::TurnContext;
use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use regex::Regex;
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::LazyLock;

/// Width of the built-in encoder's hidden state.
pub const DEFAULT_HIDDEN_SIZE: usize = 64;

/// Weight of a prior turn decays by this factor per turn of distance.
const RECENCY_DECAY: f64 = 0.85;

static PARAM_COUNT: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?i)(\d+(?:\.\d+)?)\s*([bm])\b").ok());

/// Read-only interface to a pretrained base model.
pub trait BaseModel: Send + Sync + fmt::Debug {
    fn id(&self) -> &str;

    fn hidden_size(&self) -> usize;

    /// Embedding of the KC-independent part of the prompt: prior turns, their
    /// KC tags, and whatever correctness evidence the protocol exposes.
    fn encode_context(&self, context: &TurnContext) -> Array1<f64>;

    /// Embedding of the question "will the learner get `kc` right?", including
    /// the evidence already observed for that KC.
    fn encode_query(&self, context: &TurnContext, kc: &str) -> Array1<f64>;

    /// Frozen hidden projection `[hidden, hidden]` that adapters attach to.
    fn projection(&self) -> &Array2<f64>;

    /// Frozen readout: logit difference between the "yes" and "no" answer tokens.
    fn readout(&self) -> &Array1<f64>;

    /// Parameter count advertised by the identifier (e.g. `8B`), if any.
    fn nominal_parameters(&self) -> Option<u64>;
}

/// Deterministic feature-hashing stand-in for a pretrained LLM.
#[derive(Clone)]
pub struct HashedEncoder {
    id: String,
    hidden: usize,
    projection: Array2<f64>,
    readout: Array1<f64>,
}

impl fmt::Debug for HashedEncoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HashedEncoder").field("id", &self.id).field("hidden", &self.hidden).finish()
    }
}

impl HashedEncoder {
    /// Loads the encoder for `base_model`; the same identifier always yields the same weights.
    #[must_use]
    pub fn load(base_model: &str, hidden: usize) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(base_model.as_bytes());
        let digest = hasher.finalize();
        let mut seed_bytes = [0_u8; 8];
        seed_bytes.copy_from_slice(&digest[..8]);
        let mut rng = StdRng::seed_from_u64(u64::from_le_bytes(seed_bytes));

        let bound = 1.0 / (hidden as f64).sqrt();
        let projection = Array2::from_shape_simple_fn((hidden, hidden), || rng.gen_range(-bound..bound));
        let readout = Array1::from_shape_simple_fn(hidden, || rng.gen_range(-1.0..1.0));

        Self { id: base_model.to_string(), hidden, projection, readout }
    }

    fn add_token(&self, out: &mut Array1<f64>, token: &str, weight: f64) {
        let h = mix64(fnv1a(token.as_bytes()));
        let idx = (h % self.hidden as u64) as usize;
        let sign = if (h >> 63) == 0 { 1.0 } else { -1.0 };
        out[idx] += sign * weight;
    }

    fn add_text(&self, out: &mut Array1<f64>, text: &str, weight: f64) {
        let tokens: Vec<String> = text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(str::to_lowercase)
            .collect();
        if tokens.is_empty() {
            return;
        }
        let w = weight / (tokens.len() as f64).sqrt();
        for t in &tokens {
            self.add_token(out, t, w);
        }
    }
}

impl BaseModel for HashedEncoder {
    fn id(&self) -> &str {
        &self.id
    }

    fn hidden_size(&self) -> usize {
        self.hidden
    }

    fn encode_context(&self, context: &TurnContext) -> Array1<f64> {
        let mut out = Array1::zeros(self.hidden);
        let n = context.history.len();
        for (i, turn) in context.history.iter().enumerate() {
            let recency = RECENCY_DECAY.powi((n - 1 - i) as i32);
            self.add_token(&mut out, &format!("speaker:{}", turn.speaker.to_lowercase()), 0.5 * recency);
            self.add_text(&mut out, &turn.text, recency);
            for kc in &turn.kcs {
                self.add_token(&mut out, &format!("kc:{kc}"), 0.5 * recency);
                if let Some(evidence) = turn.evidence {
                    self.add_token(&mut out, &format!("kc-result:{kc}"), (2.0 * evidence - 1.0) * recency);
                    self.add_token(&mut out, "result", (2.0 * evidence - 1.0) * recency);
                }
            }
        }
        out
    }

    fn encode_query(&self, context: &TurnContext, kc: &str) -> Array1<f64> {
        let mut out = Array1::zeros(self.hidden);
        self.add_token(&mut out, &format!("query:{kc}"), 1.0);
        self.add_text(&mut out, kc, 0.5);

        let evidence: Vec<f64> = context.evidence_for(kc).collect();
        if !evidence.is_empty() {
            let signed = evidence.iter().map(|e| 2.0 * e - 1.0).sum::<f64>() / evidence.len() as f64;
            self.add_token(&mut out, "query-mastery", signed);
            self.add_token(&mut out, "query-attempts", (evidence.len() as f64).ln_1p());
        }
        out
    }

    fn projection(&self) -> &Array2<f64> {
        &self.projection
    }

    fn readout(&self) -> &Array1<f64> {
        &self.readout
    }

    fn nominal_parameters(&self) -> Option<u64> {
        parse_nominal_parameters(&self.id)
    }
}

/// Parses sizes such as `8B`, `1.5b` or `350M` out of a model identifier.
#[must_use]
pub fn parse_nominal_parameters(id: &str) -> Option<u64> {
    let caps = PARAM_COUNT.as_ref()?.captures(id)?;
    let value: f64 = caps.get(1)?.as_str().parse().ok()?;
    let unit = match caps.get(2)?.as_str().to_ascii_lowercase().as_str() {
        "b" => 1e9,
        _ => 1e6,
    };
    Some((value * unit) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dialogkt_abstraction::ObservedTurn;

    fn context(evidence: Option<f64>) -> TurnContext {
        let mut ctx = TurnContext::new("d1".into());
        ctx.history.push(ObservedTurn {
            speaker: "tutor".to_string(),
            text: "What is 3/4 + 1/4?".to_string(),
            kcs: vec![],
            evidence: None,
        });
        ctx.history.push(ObservedTurn {
            speaker: "student".to_string(),
            text: "It is 1".to_string(),
            kcs: vec!["fractions".to_string()],
            evidence,
        });
        ctx.turn_index = 2;
        ctx
    }

    #[test]
    fn test_same_id_loads_same_weights() {
        let a = HashedEncoder::load("meta-llama/Meta-Llama-3.1-8B-Instruct", 16);
        let b = HashedEncoder::load("meta-llama/Meta-Llama-3.1-8B-Instruct", 16);
        let c = HashedEncoder::load("other/model", 16);
        assert_eq!(a.projection(), b.projection());
        assert_ne!(a.projection(), c.projection());
    }

    #[test]
    fn test_evidence_changes_encoding() {
        let enc = HashedEncoder::load("m", 32);
        let right = enc.encode_context(&context(Some(1.0)));
        let wrong = enc.encode_context(&context(Some(0.0)));
        assert_ne!(right, wrong);
        assert_ne!(enc.encode_query(&context(Some(1.0)), "fractions"), enc.encode_query(&context(Some(0.0)), "fractions"));
    }

    #[test]
    fn test_empty_context_encodes_to_zero() {
        let enc = HashedEncoder::load("m", 8);
        let ctx = TurnContext::new("d".into());
        assert!(enc.encode_context(&ctx).iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_parse_nominal_parameters() {
        assert_eq!(parse_nominal_parameters("meta-llama/Meta-Llama-3.1-8B-Instruct"), Some(8_000_000_000));
        assert_eq!(parse_nominal_parameters("Qwen2-1.5b"), Some(1_500_000_000));
        assert_eq!(parse_nominal_parameters("gpt2-350M"), Some(350_000_000));
        assert_eq!(parse_nominal_parameters("hashed-encoder"), None);
    }
}
