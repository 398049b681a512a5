use std::path::PathBuf;
use thiserror::Error;

/// Everything that can end a single job (or skip it before it starts). None of
/// these abort the sweep; the driver records them and moves on.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("configuration_missing: {role} file not found: {}", path.display())]
    ConfigurationMissing { role: &'static str, path: PathBuf },

    #[error("search_failed: {reason}")]
    SearchFailure { reason: String },

    #[error("evaluation_failed: {reason}")]
    EvaluationFailure { reason: String },

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("environment: {0:#}")]
    Environment(#[from] anyhow::Error),
}

impl JobError {
    pub fn kind(&self) -> &'static str {
        match self {
            JobError::ConfigurationMissing { .. } => "configuration_missing",
            JobError::SearchFailure { .. } => "search_failed",
            JobError::EvaluationFailure { .. } => "evaluation_failed",
            JobError::Io(_) | JobError::Environment(_) => "environment",
        }
    }
}
