use crate::error::TrainingResult;
use std::path::{Path, PathBuf};

/// Filesystem layout of the artifact directory.
///
/// ```text
/// <root>/models/<model_name>/state.json
/// <root>/models/<model_name>/manifest.json
/// <root>/results/<run_id>.json
/// <root>/predictions/<run_id>.json
/// ```
#[derive(Debug, Clone)]
pub struct ArtifactLayout {
    root: PathBuf,
}

impl ArtifactLayout {
    #[must_use]
    pub const fn new(root: PathBuf) -> Self {
        Self { root }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn models_dir(&self) -> PathBuf {
        self.root.join("models")
    }

    #[must_use]
    pub fn model_dir(&self, model_name: &str) -> PathBuf {
        self.models_dir().join(model_name)
    }

    #[must_use]
    pub fn model_state_path(&self, model_name: &str) -> PathBuf {
        self.model_dir(model_name).join("state.json")
    }

    #[must_use]
    pub fn model_manifest_path(&self, model_name: &str) -> PathBuf {
        self.model_dir(model_name).join("manifest.json")
    }

    #[must_use]
    pub fn results_path(&self, run_id: &str) -> PathBuf {
        self.root.join("results").join(format!("{run_id}.json"))
    }

    #[must_use]
    pub fn predictions_path(&self, run_id: &str) -> PathBuf {
        self.root.join("predictions").join(format!("{run_id}.json"))
    }

    pub fn ensure_model_dir(&self, model_name: &str) -> TrainingResult<PathBuf> {
        let dir = self.model_dir(model_name);
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_layout_paths() {
        let temp = TempDir::new().unwrap();
        let layout = ArtifactLayout::new(temp.path().join(".dialogkt"));

        assert!(layout.model_state_path("dkt_fold0").ends_with("models/dkt_fold0/state.json"));
        assert!(layout.results_path("abc").ends_with("results/abc.json"));
        let dir = layout.ensure_model_dir("m").unwrap();
        assert!(dir.is_dir());
    }
}
