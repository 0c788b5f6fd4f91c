//! Dialogue datasets on disk.
//!
//! A dataset is a JSONL file, one [`DialogueRecord`] per line. Records carry KC
//! tags from both annotation sources; loading resolves them to the configured
//! [`TagSource`] and applies the `typical` and debug filters.

use crate::config::{DatasetConfig, DatasetName, TagSource};
use crate::error::{TrainingError, TrainingResult};
use dialogkt_abstraction::{Dialogue, DialogueId, Turn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;
use tracing::{debug, info};

/// Number of dialogues kept by `--debug`.
pub const DEBUG_SUBSET: usize = 20;

/// Stable identifier for a dataset (content hash).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DatasetId(pub String);

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KcTags {
    #[serde(default)]
    pub base: Vec<String>,
    #[serde(default)]
    pub atc: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnRecord {
    pub speaker: String,
    pub text: String,
    #[serde(default)]
    pub correct: Option<bool>,
    #[serde(default)]
    pub kcs: KcTags,
}

/// One line of a dataset file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DialogueRecord {
    pub id: String,
    #[serde(default)]
    pub subject: Option<String>,
    /// MathDial annotator rating of how typical the student behaviour is.
    #[serde(default)]
    pub typical: Option<i64>,
    pub turns: Vec<TurnRecord>,
}

impl DialogueRecord {
    #[must_use]
    pub fn into_dialogue(self, tag_src: TagSource) -> Dialogue {
        let turns = self
            .turns
            .into_iter()
            .map(|t| Turn {
                speaker: t.speaker,
                text: t.text,
                correct: t.correct,
                kcs: match tag_src {
                    TagSource::Base => t.kcs.base,
                    TagSource::Atc => t.kcs.atc,
                },
            })
            .collect();
        Dialogue { id: DialogueId(self.id), subject: self.subject, turns }
    }
}

pub fn write_jsonl_dataset(path: &Path, records: &[DialogueRecord]) -> TrainingResult<()> {
    let mut out = String::new();
    for record in records {
        out.push_str(&serde_json::to_string(record)?);
        out.push('\n');
    }
    std::fs::write(path, out)?;
    Ok(())
}

pub fn read_jsonl_dataset(path: &Path) -> TrainingResult<Vec<DialogueRecord>> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| TrainingError::Data(format!("cannot read dataset {}: {e}", path.display())))?;
    let mut records = Vec::new();

    for (idx, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let record: DialogueRecord = serde_json::from_str(line)
            .map_err(|e| TrainingError::Data(format!("failed to parse jsonl line {}: {}", idx + 1, e)))?;
        records.push(record);
    }

    Ok(records)
}

pub fn compute_dataset_id(dialogues: &[Dialogue]) -> TrainingResult<DatasetId> {
    let mut hasher = Sha256::new();

    for dialogue in dialogues {
        let bytes = serde_json::to_vec(dialogue)?;
        hasher.update(bytes);
        hasher.update(b"\n");
    }

    Ok(DatasetId(hex::encode(hasher.finalize())))
}

pub fn validate_dialogues(dialogues: &[Dialogue]) -> TrainingResult<()> {
    if dialogues.is_empty() {
        return Err(TrainingError::Data("dataset must not be empty".to_string()));
    }
    let mut seen = std::collections::HashSet::new();
    for dialogue in dialogues {
        if !seen.insert(&dialogue.id) {
            return Err(TrainingError::Data(format!("duplicate dialogue id `{}`", dialogue.id)));
        }
    }
    if dialogues.iter().all(|d| d.labelled_kc_count() == 0) {
        return Err(TrainingError::Data("no turn carries both a correctness label and a KC".to_string()));
    }
    Ok(())
}

/// Applies the dataset filters to raw records.
#[must_use]
pub fn prepare_dialogues(records: Vec<DialogueRecord>, config: &DatasetConfig) -> Vec<Dialogue> {
    let total = records.len();
    let mut dialogues: Vec<Dialogue> = records
        .into_iter()
        .filter(|r| {
            config.dataset != DatasetName::Mathdial || r.typical.is_none_or(|t| t >= config.typical_cutoff)
        })
        .map(|r| r.into_dialogue(config.tag_src))
        .collect();
    if config.debug {
        dialogues.truncate(DEBUG_SUBSET);
    }
    debug!(total, kept = dialogues.len(), "Filtered dataset records");
    dialogues
}

/// Loaded, filtered and validated dialogues.
#[derive(Debug, Clone)]
pub struct LoadedDataset {
    pub id: DatasetId,
    pub dialogues: Vec<Dialogue>,
}

/// Reads `<data_dir>/<dataset>.jsonl` and applies the configured filters.
pub fn load_dataset(config: &DatasetConfig) -> TrainingResult<LoadedDataset> {
    let path = config.path();
    if !path.exists() {
        return Err(TrainingError::Data(format!("dataset file not found: {}", path.display())));
    }
    let dialogues = prepare_dialogues(read_jsonl_dataset(&path)?, config);
    validate_dialogues(&dialogues)?;
    let id = compute_dataset_id(&dialogues)?;
    info!(dataset = %config.dataset, dialogues = dialogues.len(), id = %id.0, "Loaded dataset");
    Ok(LoadedDataset { id, dialogues })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn record(id: &str, typical: Option<i64>) -> DialogueRecord {
        DialogueRecord {
            id: id.to_string(),
            subject: None,
            typical,
            turns: vec![TurnRecord {
                speaker: "student".to_string(),
                text: "4".to_string(),
                correct: Some(true),
                kcs: KcTags { base: vec!["arithmetic".to_string()], atc: vec!["4.NF.A.1".to_string()] },
            }],
        }
    }

    fn config(dataset: DatasetName, dir: PathBuf) -> DatasetConfig {
        DatasetConfig {
            dataset,
            split_by_subject: false,
            typical_cutoff: 2,
            tag_src: TagSource::Atc,
            debug: false,
            num_folds: 3,
            data_dir: dir,
        }
    }

    #[test]
    fn test_tag_source_selects_kcs() {
        assert_eq!(record("a", None).into_dialogue(TagSource::Base).turns[0].kcs, vec!["arithmetic"]);
        assert_eq!(record("a", None).into_dialogue(TagSource::Atc).turns[0].kcs, vec!["4.NF.A.1"]);
    }

    #[test]
    fn test_typical_cutoff_only_filters_mathdial() {
        let records = vec![record("a", Some(1)), record("b", Some(3)), record("c", None)];
        let math = prepare_dialogues(records.clone(), &config(DatasetName::Mathdial, PathBuf::new()));
        assert_eq!(math.iter().map(|d| d.id.0.as_str()).collect::<Vec<_>>(), vec!["b", "c"]);
        let comta = prepare_dialogues(records, &config(DatasetName::Comta, PathBuf::new()));
        assert_eq!(comta.len(), 3);
    }

    #[test]
    fn test_load_round_trip_and_stable_id() {
        let temp = TempDir::new().unwrap();
        let cfg = config(DatasetName::Comta, temp.path().to_path_buf());
        write_jsonl_dataset(&cfg.path(), &[record("a", None), record("b", None)]).unwrap();

        let first = load_dataset(&cfg).unwrap();
        let second = load_dataset(&cfg).unwrap();
        assert_eq!(first.dialogues.len(), 2);
        assert_eq!(first.id, second.id);
    }

    #[test]
    fn test_missing_file_and_bad_line_are_data_errors() {
        let temp = TempDir::new().unwrap();
        let cfg = config(DatasetName::Comta, temp.path().to_path_buf());
        assert!(matches!(load_dataset(&cfg), Err(TrainingError::Data(_))));

        std::fs::write(cfg.path(), "{\"id\": \"a\", \"turns\": []}\nnot json\n").unwrap();
        let err = load_dataset(&cfg).unwrap_err();
        assert!(err.to_string().contains("line 2"), "{err}");
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let dialogues = vec![record("a", None).into_dialogue(TagSource::Atc), record("a", None).into_dialogue(TagSource::Atc)];
        assert!(validate_dialogues(&dialogues).is_err());
    }
}
