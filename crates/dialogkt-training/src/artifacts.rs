//! Manifests and digests of persisted artifacts.

use crate::dataset::DatasetId;
use crate::error::{TrainingError, TrainingResult};
use crate::metrics::MetricsRecord;
use chrono::{DateTime, Utc};
use dialogkt_abstraction::ModelVariant;
use dialogkt_models::ModelConfig;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    ModelState,
    Results,
    Predictions,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub kind: ArtifactKind,
    pub path: PathBuf,
    pub sha256: String,
}

/// Everything needed to reload and audit a saved model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelManifest {
    pub model_name: String,
    pub run_id: String,
    pub created_at: DateTime<Utc>,
    pub variant: ModelVariant,
    pub model_config: ModelConfig,
    pub dataset_id: DatasetId,
    pub fold: usize,
    /// Validation metrics of the saved state.
    #[serde(default)]
    pub metrics: Option<MetricsRecord>,
    pub artifacts: Vec<Artifact>,
}

impl ModelManifest {
    #[must_use]
    pub fn artifact(&self, kind: ArtifactKind) -> Option<&Artifact> {
        self.artifacts.iter().find(|a| a.kind == kind)
    }
}

#[must_use]
pub fn sha256_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

pub fn sha256_file(path: &Path) -> TrainingResult<String> {
    let bytes = std::fs::read(path)?;
    Ok(sha256_bytes(&bytes))
}

pub fn make_artifact(kind: ArtifactKind, path: PathBuf) -> TrainingResult<Artifact> {
    if !path.exists() {
        return Err(TrainingError::Artifact(format!("artifact path does not exist: {}", path.display())));
    }

    let hash = sha256_file(&path)?;
    Ok(Artifact { kind, path, sha256: hash })
}

/// Writes `value` as pretty JSON, creating parent directories.
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> TrainingResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let bytes = serde_json::to_vec_pretty(value)?;
    std::fs::write(path, bytes)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_artifact_digest_matches_content() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested").join("x.json");
        write_json(&path, &serde_json::json!({"a": 1})).unwrap();

        let artifact = make_artifact(ArtifactKind::Results, path.clone()).unwrap();
        assert_eq!(artifact.sha256, sha256_bytes(&std::fs::read(&path).unwrap()));
        assert_eq!(artifact.sha256.len(), 64);
    }

    #[test]
    fn test_missing_artifact_is_an_error() {
        let temp = TempDir::new().unwrap();
        let err = make_artifact(ArtifactKind::ModelState, temp.path().join("missing")).unwrap_err();
        assert!(matches!(err, TrainingError::Artifact(_)));
    }
}
