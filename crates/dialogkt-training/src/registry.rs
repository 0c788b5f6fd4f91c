use crate::artifacts::{ArtifactKind, ModelManifest, make_artifact, sha256_file, write_json};
use crate::dataset::DatasetId;
use crate::error::{TrainingError, TrainingResult};
use crate::layout::ArtifactLayout;
use crate::metrics::MetricsRecord;
use chrono::Utc;
use dialogkt_abstraction::ModelState;
use dialogkt_models::ModelConfig;
use std::path::Path;
use tracing::{debug, info};

/// Provenance recorded alongside a saved model.
#[derive(Debug, Clone)]
pub struct SaveInfo {
    pub run_id: String,
    pub model_config: ModelConfig,
    pub dataset_id: DatasetId,
    pub fold: usize,
    pub metrics: Option<MetricsRecord>,
}

/// Saved model states keyed by model name.
#[derive(Debug, Clone)]
pub struct ModelStore {
    layout: ArtifactLayout,
}

fn read_manifest(path: &Path) -> TrainingResult<ModelManifest> {
    let bytes = std::fs::read(path)?;
    Ok(serde_json::from_slice::<ModelManifest>(&bytes)?)
}

impl ModelStore {
    #[must_use]
    pub const fn new(layout: ArtifactLayout) -> Self {
        Self { layout }
    }

    #[must_use]
    pub const fn layout(&self) -> &ArtifactLayout {
        &self.layout
    }

    #[must_use]
    pub fn exists(&self, model_name: &str) -> bool {
        self.layout.model_manifest_path(model_name).is_file()
    }

    /// Writes `state` and its manifest, replacing any earlier save under the same name.
    pub fn save(&self, model_name: &str, state: &ModelState, info: SaveInfo) -> TrainingResult<ModelManifest> {
        self.layout.ensure_model_dir(model_name)?;
        let state_path = self.layout.model_state_path(model_name);
        write_json(&state_path, state)?;

        let manifest = ModelManifest {
            model_name: model_name.to_string(),
            run_id: info.run_id,
            created_at: Utc::now(),
            variant: state.variant,
            model_config: info.model_config,
            dataset_id: info.dataset_id,
            fold: info.fold,
            metrics: info.metrics,
            artifacts: vec![make_artifact(ArtifactKind::ModelState, state_path)?],
        };
        write_json(&self.layout.model_manifest_path(model_name), &manifest)?;
        debug!(model_name, variant = %state.variant, "Saved model state");
        Ok(manifest)
    }

    /// Loads a saved state after checking its digest against the manifest.
    pub fn load(&self, model_name: &str) -> TrainingResult<(ModelManifest, ModelState)> {
        let manifest_path = self.layout.model_manifest_path(model_name);
        if !manifest_path.is_file() {
            return Err(TrainingError::Artifact(format!(
                "saved model `{model_name}` not found under {}",
                self.layout.models_dir().display()
            )));
        }
        let manifest = read_manifest(&manifest_path)?;
        let recorded = manifest.artifact(ArtifactKind::ModelState).ok_or_else(|| {
            TrainingError::Artifact(format!("manifest of `{model_name}` has no model_state artifact"))
        })?;

        let state_path = self.layout.model_state_path(model_name);
        let actual = sha256_file(&state_path)?;
        if actual != recorded.sha256 {
            return Err(TrainingError::Artifact(format!(
                "state of `{model_name}` does not match its manifest digest (expected {}, found {actual})",
                recorded.sha256
            )));
        }
        let bytes = std::fs::read(&state_path)?;
        let state: ModelState = serde_json::from_slice(&bytes)?;
        info!(model_name, variant = %state.variant, fold = manifest.fold, "Loaded model state");
        Ok((manifest, state))
    }

    /// Manifests of every saved model, sorted by name.
    pub fn discover(&self) -> TrainingResult<Vec<ModelManifest>> {
        let mut out = Vec::new();
        let dir = match std::fs::read_dir(self.layout.models_dir()) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e.into()),
        };

        for entry in dir {
            let entry = entry?;
            let model_dir = entry.path();
            if !model_dir.is_dir() {
                continue;
            }
            let manifest_path = model_dir.join("manifest.json");
            if !manifest_path.exists() {
                continue;
            }
            out.push(read_manifest(&manifest_path)?);
        }
        out.sort_by(|a, b| a.model_name.cmp(&b.model_name));
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dialogkt_abstraction::ModelVariant;
    use tempfile::TempDir;

    fn store(temp: &TempDir) -> ModelStore {
        ModelStore::new(ArtifactLayout::new(temp.path().to_path_buf()))
    }

    fn info() -> SaveInfo {
        SaveInfo {
            run_id: "run-1".to_string(),
            model_config: ModelConfig::Majority,
            dataset_id: DatasetId("abc".to_string()),
            fold: 2,
            metrics: None,
        }
    }

    fn state() -> ModelState {
        let mut state = ModelState::new(ModelVariant::Majority);
        state.extra = serde_json::json!({"rate": 0.75});
        state
    }

    #[test]
    fn test_save_load_round_trip() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);
        assert!(!store.exists("m"));

        store.save("m", &state(), info()).unwrap();
        assert!(store.exists("m"));
        let (manifest, loaded) = store.load("m").unwrap();
        assert_eq!(loaded, state());
        assert_eq!(manifest.fold, 2);
        assert_eq!(manifest.variant, ModelVariant::Majority);
    }

    #[test]
    fn test_tampered_state_is_rejected() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);
        store.save("m", &state(), info()).unwrap();
        std::fs::write(store.layout().model_state_path("m"), b"{}").unwrap();
        assert!(matches!(store.load("m"), Err(TrainingError::Artifact(_))));
    }

    #[test]
    fn test_missing_model_is_an_artifact_error() {
        let temp = TempDir::new().unwrap();
        assert!(matches!(store(&temp).load("nope"), Err(TrainingError::Artifact(_))));
    }

    #[test]
    fn test_discover_lists_sorted() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);
        assert!(store.discover().unwrap().is_empty());
        store.save("b", &state(), info()).unwrap();
        store.save("a", &state(), info()).unwrap();
        let names: Vec<String> = store.discover().unwrap().into_iter().map(|m| m.model_name).collect();
        assert_eq!(names, vec!["a", "b"]);
    }
}
