//! Deterministic train/validation/test partitions.
//!
//! Dialogues (or, with `split_by_subject`, whole subjects) are shuffled with a
//! generator seeded from the run seed and dealt round-robin into K groups.
//! Fold `i` tests on group `i`, validates on group `(i + 1) % K` and trains on
//! the rest, so every group is tested exactly once across the K folds.

use crate::config::DatasetConfig;
use crate::dataset::{DatasetId, compute_dataset_id, load_dataset, validate_dialogues};
use crate::error::{TrainingError, TrainingResult};
use dialogkt_abstraction::seed::derive_seed;
use dialogkt_abstraction::{Dialogue, DialogueId, KcVocab};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SplitKind {
    Train,
    Validation,
    Test,
}

impl fmt::Display for SplitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Train => "train",
            Self::Validation => "validation",
            Self::Test => "test",
        })
    }
}

/// Dialogue-ID assignment of one fold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fold {
    pub index: usize,
    pub train: Vec<DialogueId>,
    pub validation: Vec<DialogueId>,
    pub test: Vec<DialogueId>,
}

impl Fold {
    #[must_use]
    pub fn ids(&self, split: SplitKind) -> &[DialogueId] {
        match split {
            SplitKind::Train => &self.train,
            SplitKind::Validation => &self.validation,
            SplitKind::Test => &self.test,
        }
    }
}

/// A fold with its dialogues materialized.
#[derive(Debug, Clone)]
pub struct FoldData {
    pub index: usize,
    pub train: Vec<Dialogue>,
    pub validation: Vec<Dialogue>,
    pub test: Vec<Dialogue>,
}

impl FoldData {
    #[must_use]
    pub fn split(&self, split: SplitKind) -> &[Dialogue] {
        match split {
            SplitKind::Train => &self.train,
            SplitKind::Validation => &self.validation,
            SplitKind::Test => &self.test,
        }
    }
}

/// Source of cross-validation folds.
pub trait FoldProvider: Send + Sync {
    fn dataset_id(&self) -> &DatasetId;

    fn num_folds(&self) -> usize;

    /// Vocabulary of every KC in the dataset, shared by all folds.
    fn kc_vocab(&self) -> &KcVocab;

    fn fold(&self, index: usize) -> TrainingResult<FoldData>;
}

/// Fold provider over an in-memory dialogue collection.
#[derive(Debug, Clone)]
pub struct DialogueFolds {
    id: DatasetId,
    dialogues: Vec<Dialogue>,
    folds: Vec<Fold>,
    vocab: KcVocab,
}

impl DialogueFolds {
    /// Partitions `dialogues` into `num_folds` folds.
    ///
    /// # Errors
    /// Returns `TrainingError::Data` when the dialogues cannot fill every
    /// train, validation and test split.
    pub fn new(dialogues: Vec<Dialogue>, num_folds: usize, split_by_subject: bool, seed: u64) -> TrainingResult<Self> {
        validate_dialogues(&dialogues)?;
        if num_folds < 3 {
            return Err(TrainingError::Data(format!("need at least 3 folds, got {num_folds}")));
        }

        let mut rng = StdRng::seed_from_u64(derive_seed(seed, "split", 0));
        let groups = if split_by_subject {
            group_by_subject(&dialogues, num_folds, &mut rng)?
        } else {
            let mut ids: Vec<DialogueId> = dialogues.iter().map(|d| d.id.clone()).collect();
            ids.sort();
            ids.shuffle(&mut rng);
            deal(ids, num_folds)
        };

        let folds: Vec<Fold> = (0..num_folds)
            .map(|i| {
                let validation_group = (i + 1) % num_folds;
                let mut train: Vec<DialogueId> = groups
                    .iter()
                    .enumerate()
                    .filter(|(g, _)| *g != i && *g != validation_group)
                    .flat_map(|(_, ids)| ids.iter().cloned())
                    .collect();
                train.sort();
                Fold { index: i, train, validation: groups[validation_group].clone(), test: groups[i].clone() }
            })
            .collect();

        for fold in &folds {
            for split in [SplitKind::Train, SplitKind::Validation, SplitKind::Test] {
                if fold.ids(split).is_empty() {
                    return Err(TrainingError::Data(format!(
                        "fold {} has an empty {split} split ({} dialogues across {num_folds} folds)",
                        fold.index,
                        dialogues.len()
                    )));
                }
            }
        }

        let id = compute_dataset_id(&dialogues)?;
        let vocab = KcVocab::from_dialogues(&dialogues);
        Ok(Self { id, dialogues, folds, vocab })
    }

    /// Loads the dataset file named by `config` and partitions it.
    pub fn from_config(config: &DatasetConfig, seed: u64) -> TrainingResult<Self> {
        let loaded = load_dataset(config)?;
        let mut folds = Self::new(loaded.dialogues, config.num_folds, config.split_by_subject, seed)?;
        folds.id = loaded.id;
        Ok(folds)
    }

    #[must_use]
    pub fn folds(&self) -> &[Fold] {
        &self.folds
    }

    #[must_use]
    pub fn dialogues(&self) -> &[Dialogue] {
        &self.dialogues
    }
}

/// Deals `ids` round-robin into `k` groups, each sorted.
fn deal(ids: Vec<DialogueId>, k: usize) -> Vec<Vec<DialogueId>> {
    let mut groups = vec![Vec::new(); k];
    for (i, id) in ids.into_iter().enumerate() {
        groups[i % k].push(id);
    }
    for group in &mut groups {
        group.sort();
    }
    groups
}

fn group_by_subject(dialogues: &[Dialogue], k: usize, rng: &mut StdRng) -> TrainingResult<Vec<Vec<DialogueId>>> {
    let mut by_subject: BTreeMap<&str, Vec<DialogueId>> = BTreeMap::new();
    for dialogue in dialogues {
        let subject = dialogue.subject.as_deref().ok_or_else(|| {
            TrainingError::Data(format!("dialogue `{}` has no subject, cannot split by subject", dialogue.id))
        })?;
        by_subject.entry(subject).or_default().push(dialogue.id.clone());
    }
    if by_subject.len() < k {
        return Err(TrainingError::Data(format!(
            "split_by_subject needs at least {k} subjects, found {}",
            by_subject.len()
        )));
    }

    let mut subjects: Vec<&str> = by_subject.keys().copied().collect();
    subjects.shuffle(rng);
    let mut groups = vec![Vec::new(); k];
    for (i, subject) in subjects.into_iter().enumerate() {
        groups[i % k].extend(by_subject[subject].iter().cloned());
    }
    for group in &mut groups {
        group.sort();
    }
    Ok(groups)
}

impl FoldProvider for DialogueFolds {
    fn dataset_id(&self) -> &DatasetId {
        &self.id
    }

    fn num_folds(&self) -> usize {
        self.folds.len()
    }

    fn kc_vocab(&self) -> &KcVocab {
        &self.vocab
    }

    fn fold(&self, index: usize) -> TrainingResult<FoldData> {
        let fold = self
            .folds
            .get(index)
            .ok_or_else(|| TrainingError::Data(format!("fold {index} out of range (have {})", self.folds.len())))?;
        let by_id: HashMap<&DialogueId, &Dialogue> = self.dialogues.iter().map(|d| (&d.id, d)).collect();
        let materialize = |ids: &[DialogueId]| -> Vec<Dialogue> {
            ids.iter().filter_map(|id| by_id.get(id).map(|d| (*d).clone())).collect()
        };
        Ok(FoldData {
            index,
            train: materialize(&fold.train),
            validation: materialize(&fold.validation),
            test: materialize(&fold.test),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dialogkt_abstraction::Turn;
    use std::collections::HashSet;

    fn dialogues(n: usize, subjects: usize) -> Vec<Dialogue> {
        (0..n)
            .map(|i| Dialogue {
                id: DialogueId(format!("d{i:02}")),
                subject: (subjects > 0).then(|| format!("subject{}", i % subjects)),
                turns: vec![Turn {
                    speaker: "student".to_string(),
                    text: String::new(),
                    correct: Some(i % 2 == 0),
                    kcs: vec!["kc".to_string()],
                }],
            })
            .collect()
    }

    #[test]
    fn test_folds_are_disjoint_and_cover_dataset() {
        let folds = DialogueFolds::new(dialogues(17, 0), 5, false, 221).unwrap();
        let all: HashSet<DialogueId> = folds.dialogues().iter().map(|d| d.id.clone()).collect();
        let mut tested = HashSet::new();
        for fold in folds.folds() {
            let train: HashSet<_> = fold.train.iter().cloned().collect();
            let val: HashSet<_> = fold.validation.iter().cloned().collect();
            let test: HashSet<_> = fold.test.iter().cloned().collect();
            assert!(train.is_disjoint(&val) && train.is_disjoint(&test) && val.is_disjoint(&test));
            let union: HashSet<_> = train.union(&val).cloned().collect::<HashSet<_>>().union(&test).cloned().collect();
            assert_eq!(union, all);
            tested.extend(test);
        }
        assert_eq!(tested, all);
    }

    #[test]
    fn test_partition_is_deterministic_per_seed() {
        let a = DialogueFolds::new(dialogues(12, 0), 3, false, 1).unwrap();
        let b = DialogueFolds::new(dialogues(12, 0), 3, false, 1).unwrap();
        let c = DialogueFolds::new(dialogues(12, 0), 3, false, 2).unwrap();
        assert_eq!(a.folds(), b.folds());
        assert_ne!(a.folds(), c.folds());
    }

    #[test]
    fn test_input_order_does_not_matter() {
        let mut reversed = dialogues(12, 0);
        reversed.reverse();
        let a = DialogueFolds::new(dialogues(12, 0), 3, false, 9).unwrap();
        let b = DialogueFolds::new(reversed, 3, false, 9).unwrap();
        assert_eq!(a.folds(), b.folds());
    }

    #[test]
    fn test_split_by_subject_keeps_subjects_together() {
        let data = dialogues(20, 4);
        let subject_of: HashMap<DialogueId, String> =
            data.iter().map(|d| (d.id.clone(), d.subject.clone().unwrap())).collect();
        let folds = DialogueFolds::new(data, 4, true, 3).unwrap();
        for fold in folds.folds() {
            let test_subjects: HashSet<&String> = fold.test.iter().map(|id| &subject_of[id]).collect();
            let train_subjects: HashSet<&String> = fold.train.iter().map(|id| &subject_of[id]).collect();
            assert!(test_subjects.is_disjoint(&train_subjects));
        }
    }

    #[test]
    fn test_too_few_dialogues_or_subjects() {
        assert!(matches!(DialogueFolds::new(dialogues(2, 0), 3, false, 1), Err(TrainingError::Data(_))));
        assert!(matches!(DialogueFolds::new(dialogues(10, 2), 3, true, 1), Err(TrainingError::Data(_))));
        assert!(matches!(DialogueFolds::new(dialogues(10, 0), 3, true, 1), Err(TrainingError::Data(_))));
    }

    #[test]
    fn test_materialized_fold_matches_ids() {
        let folds = DialogueFolds::new(dialogues(9, 0), 3, false, 221).unwrap();
        let data = folds.fold(1).unwrap();
        let ids: Vec<DialogueId> = data.test.iter().map(|d| d.id.clone()).collect();
        assert_eq!(ids, folds.folds()[1].test);
        assert_eq!(data.train.len() + data.validation.len() + data.test.len(), 9);
        assert!(folds.fold(3).is_err());
    }
}
