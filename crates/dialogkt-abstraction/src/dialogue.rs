//! Dialogue types shared by the fold provider, the models and the evaluation engine.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

/// Stable dialogue identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DialogueId(pub String);

impl fmt::Display for DialogueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for DialogueId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// One utterance of a tutoring dialogue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub speaker: String,
    pub text: String,
    /// Correctness of the learner's answer, when the turn was annotated.
    #[serde(default)]
    pub correct: Option<bool>,
    /// Knowledge components exercised by this turn.
    #[serde(default)]
    pub kcs: Vec<String>,
}

impl Turn {
    /// A turn is scored when it carries both a correctness label and at least one KC.
    #[must_use]
    pub fn is_scored(&self) -> bool {
        self.correct.is_some() && !self.kcs.is_empty()
    }
}

/// A tutoring dialogue with KC tags already resolved to one tag source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dialogue {
    pub id: DialogueId,
    #[serde(default)]
    pub subject: Option<String>,
    pub turns: Vec<Turn>,
}

impl Dialogue {
    /// Number of (turn, KC) pairs with a correctness label.
    #[must_use]
    pub fn labelled_kc_count(&self) -> usize {
        self.turns.iter().filter(|t| t.is_scored()).map(|t| t.kcs.len()).sum()
    }
}

/// A prior turn as exposed to a model.
///
/// `evidence` is the correctness signal the scoring protocol reveals for the
/// turn: the ground-truth label (teacher-forced), the model's own earlier
/// prediction (autoregressive), or `None` for unlabelled turns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservedTurn {
    pub speaker: String,
    pub text: String,
    pub kcs: Vec<String>,
    pub evidence: Option<f64>,
}

/// Everything a model may condition on when predicting turn `turn_index`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnContext {
    pub dialogue_id: DialogueId,
    pub turn_index: usize,
    pub history: Vec<ObservedTurn>,
}

impl TurnContext {
    #[must_use]
    pub fn new(dialogue_id: DialogueId) -> Self {
        Self { dialogue_id, turn_index: 0, history: Vec::new() }
    }

    /// Evidence values observed so far for `kc`, oldest first.
    pub fn evidence_for<'a>(&'a self, kc: &'a str) -> impl Iterator<Item = f64> + 'a {
        self.history
            .iter()
            .filter(move |t| t.kcs.iter().any(|k| k == kc))
            .filter_map(|t| t.evidence)
    }
}

/// One supervised (context, KC, label) sample for gradient training.
#[derive(Debug, Clone)]
pub struct TrainingExample {
    /// Shared by every KC of the same turn.
    pub context: Arc<TurnContext>,
    pub kc: String,
    pub label: bool,
}

impl TrainingExample {
    #[must_use]
    pub fn target(&self) -> f64 {
        if self.label { 1.0 } else { 0.0 }
    }
}

/// Sorted, de-duplicated KC names with stable indices.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KcVocab {
    names: Vec<String>,
    #[serde(skip)]
    index: HashMap<String, usize>,
}

impl KcVocab {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let set: BTreeSet<String> = names.into_iter().map(Into::into).collect();
        let names: Vec<String> = set.into_iter().collect();
        let index = names.iter().enumerate().map(|(i, n)| (n.clone(), i)).collect();
        Self { names, index }
    }

    /// Vocabulary of every KC tagged anywhere in `dialogues`.
    #[must_use]
    pub fn from_dialogues(dialogues: &[Dialogue]) -> Self {
        Self::new(dialogues.iter().flat_map(|d| d.turns.iter()).flat_map(|t| t.kcs.iter().cloned()))
    }

    #[must_use]
    pub fn index_of(&self, kc: &str) -> Option<usize> {
        self.index.get(kc).copied()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.names.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }

    /// Rebuilds the lookup table after deserialization.
    #[must_use]
    pub fn reindexed(self) -> Self {
        Self::new(self.names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn turn(kcs: &[&str], correct: Option<bool>) -> Turn {
        Turn {
            speaker: "student".to_string(),
            text: "x".to_string(),
            correct,
            kcs: kcs.iter().map(|s| (*s).to_string()).collect(),
        }
    }

    #[test]
    fn test_vocab_is_sorted_and_deduplicated() {
        let vocab = KcVocab::new(["fractions", "algebra", "fractions"]);
        assert_eq!(vocab.len(), 2);
        assert_eq!(vocab.index_of("algebra"), Some(0));
        assert_eq!(vocab.index_of("fractions"), Some(1));
        assert_eq!(vocab.index_of("geometry"), None);
    }

    #[test]
    fn test_vocab_reindexed_after_deserialize() {
        let vocab = KcVocab::new(["b", "a"]);
        let json = serde_json::to_string(&vocab).unwrap();
        let back: KcVocab = serde_json::from_str(&json).unwrap();
        assert_eq!(back.index_of("a"), None);
        assert_eq!(back.reindexed().index_of("a"), Some(0));
    }

    #[test]
    fn test_labelled_kc_count_skips_unscored_turns() {
        let dialogue = Dialogue {
            id: "d1".into(),
            subject: None,
            turns: vec![turn(&["a", "b"], Some(true)), turn(&["a"], None), turn(&[], Some(false))],
        };
        assert_eq!(dialogue.labelled_kc_count(), 2);
    }

    #[test]
    fn test_evidence_for_filters_by_kc() {
        let mut ctx = TurnContext::new("d1".into());
        ctx.history.push(ObservedTurn {
            speaker: "student".to_string(),
            text: String::new(),
            kcs: vec!["a".to_string()],
            evidence: Some(1.0),
        });
        ctx.history.push(ObservedTurn {
            speaker: "student".to_string(),
            text: String::new(),
            kcs: vec!["b".to_string()],
            evidence: Some(0.0),
        });
        assert_eq!(ctx.evidence_for("a").collect::<Vec<_>>(), vec![1.0]);
        assert_eq!(ctx.evidence_for("c").count(), 0);
    }
}
