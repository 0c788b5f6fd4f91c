//! TOML configuration file support.
//!
//! ```toml
//! [run]
//! dataset = "mathdial"
//! data_dir = "data"
//! seed = 7
//!
//! [defaults.lmkt]
//! lr = 2e-4
//! r = 8
//! ```

use super::{DatasetName, Overrides, SelectionMetric, TagSource};
use crate::error::{TrainingError, TrainingResult};
use dialogkt_abstraction::ModelVariant;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Run-level defaults; command-line values take precedence.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunDefaults {
    pub dataset: Option<DatasetName>,
    pub tag_src: Option<TagSource>,
    pub typical_cutoff: Option<i64>,
    pub data_dir: Option<PathBuf>,
    pub artifacts_dir: Option<PathBuf>,
    pub seed: Option<u64>,
    pub num_folds: Option<usize>,
    pub max_parallel: Option<usize>,
    pub memory_budget_mb: Option<u64>,
    pub pack_kcs: Option<bool>,
    pub prompt_inc_labels: Option<bool>,
    pub selection_metric: Option<SelectionMetric>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    #[serde(default)]
    pub run: RunDefaults,

    /// Per-model-type option defaults, keyed by model type.
    #[serde(default)]
    pub defaults: BTreeMap<String, Overrides>,
}

impl ConfigFile {
    /// Load configuration from a TOML file.
    pub fn load_from_file(path: &Path) -> TrainingResult<Self> {
        if !path.exists() {
            return Err(TrainingError::config("config", format!("file not found: {}", path.display())));
        }

        let content = std::fs::read_to_string(path)?;
        Self::parse(&content).map_err(|e| match e {
            TrainingError::Config { field, message } => {
                TrainingError::Config { field, message: format!("{}: {message}", path.display()) }
            }
            other => other,
        })
    }

    /// Parses and validates TOML content.
    pub fn parse(content: &str) -> TrainingResult<Self> {
        let file: Self = toml::from_str(content).map_err(|e| TrainingError::config("config", e.to_string()))?;
        for key in file.defaults.keys() {
            key.parse::<ModelVariant>()
                .map_err(|_| TrainingError::config(format!("defaults.{key}"), "unknown model type"))?;
        }
        Ok(file)
    }

    /// Defaults declared for `variant`, if any.
    #[must_use]
    pub fn defaults_for(&self, variant: ModelVariant) -> Overrides {
        self.defaults.get(variant.as_str()).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_defaults_table() {
        let file = ConfigFile::parse(
            r#"
            [run]
            dataset = "mathdial"
            seed = 7

            [defaults.lmkt]
            lr = 0.0002
            r = 8
            "#,
        )
        .unwrap();
        assert_eq!(file.run.dataset, Some(DatasetName::Mathdial));
        assert_eq!(file.run.seed, Some(7));
        let lmkt = file.defaults_for(ModelVariant::Lmkt);
        assert_eq!(lmkt.r, Some(8));
        assert_eq!(file.defaults_for(ModelVariant::Dkt), Overrides::default());
    }

    #[test]
    fn test_unknown_model_type_table_is_rejected() {
        let err = ConfigFile::parse("[defaults.transformer]\nlr = 0.1\n").unwrap_err();
        assert!(matches!(err, TrainingError::Config { ref field, .. } if field == "defaults.transformer"));
    }

    #[test]
    fn test_unknown_key_is_rejected() {
        assert!(ConfigFile::parse("[defaults.lmkt]\nlearning_rate = 0.1\n").is_err());
    }

    #[test]
    fn test_missing_file() {
        let temp = TempDir::new().unwrap();
        let err = ConfigFile::load_from_file(&temp.path().join("nope.toml")).unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }
}
