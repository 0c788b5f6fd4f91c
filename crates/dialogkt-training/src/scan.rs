//! Turn-by-turn scan of a dialogue.
//!
//! [`DialogueScan`] walks the turns of one dialogue and yields every scored
//! turn together with the context a model may condition on. What the context
//! reveals about earlier turns depends on the protocol:
//!
//! - teacher-forced: the ground-truth correctness of each earlier labelled turn;
//! - autoregressive: the model's own predicted probability for it, supplied
//!   through [`DialogueScan::feedback`] before the next call to `next`.
//!
//! With `inc_first_label`, the first labelled turn is revealed as ground truth
//! and not yielded. A scan is consumed once; restart by constructing a new one.

use dialogkt_abstraction::{Dialogue, ObservedTurn, TrainingExample, Turn, TurnContext};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScanProtocol {
    pub teacher_forced: bool,
    pub inc_first_label: bool,
}

/// A labelled turn awaiting predictions.
#[derive(Debug, Clone)]
pub struct ScoredTurn {
    pub context: Arc<TurnContext>,
    pub kcs: Vec<String>,
    pub label: bool,
}

impl ScoredTurn {
    #[must_use]
    pub fn turn_index(&self) -> usize {
        self.context.turn_index
    }
}

pub struct DialogueScan<'a> {
    dialogue: &'a Dialogue,
    protocol: ScanProtocol,
    cursor: usize,
    history: Vec<ObservedTurn>,
    pending: Option<&'a Turn>,
    feedback: Option<f64>,
    first_label_seen: bool,
}

fn label_value(correct: bool) -> f64 {
    if correct { 1.0 } else { 0.0 }
}

impl<'a> DialogueScan<'a> {
    #[must_use]
    pub const fn new(dialogue: &'a Dialogue, protocol: ScanProtocol) -> Self {
        Self {
            dialogue,
            protocol,
            cursor: 0,
            history: Vec::new(),
            pending: None,
            feedback: None,
            first_label_seen: false,
        }
    }

    /// Records the model's predictions for the turn most recently yielded.
    ///
    /// Only used by the autoregressive protocol; the turn's evidence becomes
    /// the mean predicted probability over its KCs.
    pub fn feedback(&mut self, predictions: &[f64]) {
        if !predictions.is_empty() {
            self.feedback = Some(predictions.iter().sum::<f64>() / predictions.len() as f64);
        }
    }

    fn observe(turn: &Turn, evidence: Option<f64>) -> ObservedTurn {
        ObservedTurn { speaker: turn.speaker.clone(), text: turn.text.clone(), kcs: turn.kcs.clone(), evidence }
    }

    fn commit_pending(&mut self) {
        let feedback = self.feedback.take();
        if let Some(turn) = self.pending.take() {
            let evidence =
                if self.protocol.teacher_forced { turn.correct.map(label_value) } else { feedback };
            self.history.push(Self::observe(turn, evidence));
        }
    }
}

impl Iterator for DialogueScan<'_> {
    type Item = ScoredTurn;

    fn next(&mut self) -> Option<Self::Item> {
        self.commit_pending();

        let dialogue = self.dialogue;
        while let Some(turn) = dialogue.turns.get(self.cursor) {
            let index = self.cursor;
            self.cursor += 1;

            let Some(label) = turn.correct.filter(|_| turn.is_scored()) else {
                self.history.push(Self::observe(turn, None));
                continue;
            };
            if self.protocol.inc_first_label && !self.first_label_seen {
                self.first_label_seen = true;
                self.history.push(Self::observe(turn, Some(label_value(label))));
                continue;
            }
            self.first_label_seen = true;

            let context = TurnContext {
                dialogue_id: dialogue.id.clone(),
                turn_index: index,
                history: self.history.clone(),
            };
            self.pending = Some(turn);
            return Some(ScoredTurn { context: Arc::new(context), kcs: turn.kcs.clone(), label });
        }
        None
    }
}

/// Teacher-forced (context, KC, label) samples for gradient training, in
/// dialogue and turn order.
#[must_use]
pub fn training_examples(dialogues: &[Dialogue]) -> Vec<TrainingExample> {
    let protocol = ScanProtocol { teacher_forced: true, inc_first_label: false };
    dialogues
        .iter()
        .flat_map(|d| DialogueScan::new(d, protocol))
        .flat_map(|scored| {
            let ScoredTurn { context, kcs, label } = scored;
            kcs.into_iter().map(move |kc| TrainingExample { context: Arc::clone(&context), kc, label })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn turn(speaker: &str, correct: Option<bool>, kcs: &[&str]) -> Turn {
        Turn {
            speaker: speaker.to_string(),
            text: format!("{speaker} says something"),
            correct,
            kcs: kcs.iter().map(|s| (*s).to_string()).collect(),
        }
    }

    fn dialogue() -> Dialogue {
        Dialogue {
            id: "d1".into(),
            subject: None,
            turns: vec![
                turn("tutor", None, &[]),
                turn("student", Some(false), &["a"]),
                turn("tutor", None, &["a"]),
                turn("student", Some(true), &["a", "b"]),
                turn("student", Some(true), &[]),
                turn("student", Some(false), &["b"]),
            ],
        }
    }

    #[test]
    fn test_teacher_forced_exposes_labels() {
        let d = dialogue();
        let scan = DialogueScan::new(&d, ScanProtocol { teacher_forced: true, inc_first_label: false });
        let turns: Vec<ScoredTurn> = scan.collect();
        assert_eq!(turns.iter().map(ScoredTurn::turn_index).collect::<Vec<_>>(), vec![1, 3, 5]);

        let last = &turns[2].context;
        assert_eq!(last.history.len(), 5);
        assert_eq!(last.history[1].evidence, Some(0.0));
        assert_eq!(last.history[2].evidence, None);
        assert_eq!(last.history[3].evidence, Some(1.0));
    }

    #[test]
    fn test_autoregressive_uses_feedback() {
        let d = dialogue();
        let mut scan = DialogueScan::new(&d, ScanProtocol { teacher_forced: false, inc_first_label: false });
        let first = scan.next().unwrap();
        assert!(first.context.history.iter().all(|t| t.evidence.is_none()));
        scan.feedback(&[0.8]);
        let second = scan.next().unwrap();
        assert_eq!(second.context.history[1].evidence, Some(0.8));
        scan.feedback(&[0.2, 0.4]);
        let third = scan.next().unwrap();
        assert!((third.context.history[3].evidence.unwrap() - 0.3).abs() < 1e-12);
        assert!(scan.next().is_none());
    }

    #[test]
    fn test_inc_first_label_reveals_and_skips_first() {
        let d = dialogue();
        let scan = DialogueScan::new(&d, ScanProtocol { teacher_forced: false, inc_first_label: true });
        let turns: Vec<ScoredTurn> = scan.collect();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].turn_index(), 3);
        assert_eq!(turns[0].context.history[1].evidence, Some(0.0));
    }

    #[test]
    fn test_training_examples_one_per_kc() {
        let examples = training_examples(&[dialogue()]);
        let kcs: Vec<(&str, bool)> = examples.iter().map(|e| (e.kc.as_str(), e.label)).collect();
        assert_eq!(kcs, vec![("a", false), ("a", true), ("b", true), ("b", false)]);
        assert!(Arc::ptr_eq(&examples[1].context, &examples[2].context));
    }

    #[test]
    fn test_scan_restarts_from_scratch() {
        let d = dialogue();
        let protocol = ScanProtocol { teacher_forced: true, inc_first_label: false };
        let a: Vec<usize> = DialogueScan::new(&d, protocol).map(|t| t.turn_index()).collect();
        let b: Vec<usize> = DialogueScan::new(&d, protocol).map(|t| t.turn_index()).collect();
        assert_eq!(a, b);
    }
}
