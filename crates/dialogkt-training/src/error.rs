use dialogkt_abstraction::ModelError;
use thiserror::Error;

pub type TrainingResult<T> = std::result::Result<T, TrainingError>;

#[derive(Debug, Error)]
pub enum TrainingError {
    #[error("invalid configuration `{field}`: {message}")]
    Config { field: String, message: String },

    #[error("dataset error: {0}")]
    Data(String),

    #[error("training diverged at optimizer step {step} (loss = {loss})")]
    Divergence { step: u64, loss: f64 },

    #[error("`{field}` = {value} exceeds available resources: {message}")]
    Resource { field: String, value: String, message: String },

    #[error("run cancelled")]
    Cancelled,

    #[error("artifact error: {0}")]
    Artifact(String),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl TrainingError {
    pub fn config(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Config { field: field.into(), message: message.into() }
    }

    /// Whether the failure is local to one fold and the run may continue without it.
    #[must_use]
    pub const fn is_fold_local(&self) -> bool {
        matches!(self, Self::Divergence { .. } | Self::Model(ModelError::NonFinite(_)))
    }

    /// Process exit status for this error.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::Config { .. } | Self::Model(ModelError::InvalidOption { .. } | ModelError::UnknownVariant(_)) => 2,
            Self::Data(_) => 3,
            Self::Divergence { .. } | Self::Model(ModelError::NonFinite(_)) => 4,
            Self::Resource { .. } | Self::Model(ModelError::Resource { .. }) => 5,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(TrainingError::config("lr", "must be > 0").exit_code(), 2);
        assert_eq!(TrainingError::Data("missing".into()).exit_code(), 3);
        assert_eq!(TrainingError::Divergence { step: 3, loss: f64::NAN }.exit_code(), 4);
        let resource = TrainingError::Resource { field: "batch_size".into(), value: "64".into(), message: String::new() };
        assert_eq!(resource.exit_code(), 5);
        assert_eq!(TrainingError::Cancelled.exit_code(), 1);
        assert_eq!(TrainingError::from(ModelError::UnknownVariant("x".into())).exit_code(), 2);
    }

    #[test]
    fn test_fold_local_errors() {
        assert!(TrainingError::Divergence { step: 0, loss: f64::INFINITY }.is_fold_local());
        assert!(!TrainingError::Data("x".into()).is_fold_local());
    }
}
