use thiserror::Error;

use crate::config::ConfigError;
use crate::loader::LoaderError;
use crate::model::WeightMismatch;
use crate::transform::TransformError;

/// Fatal errors of an export run. Backend failures are not among them; they
/// end up in the run's report.
#[derive(Error, Debug)]
pub enum ExportError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("failed to load checkpoint: {0}")]
    Load(LoaderError),
    #[error("{0}")]
    WeightMismatch(WeightMismatch),
    #[error("export transform failed: {0}")]
    Transform(#[from] TransformError),
}

impl ExportError {
    /// Pipeline stage the error stopped at.
    pub fn stage(&self) -> &'static str {
        match self {
            ExportError::Configuration(_) => "configuration",
            ExportError::Load(_) | ExportError::WeightMismatch(_) => "load",
            ExportError::Transform(_) => "transform",
        }
    }
}

impl From<ConfigError> for ExportError {
    fn from(e: ConfigError) -> Self {
        ExportError::Configuration(e.to_string())
    }
}

impl From<LoaderError> for ExportError {
    fn from(e: LoaderError) -> Self {
        match e {
            LoaderError::MissingArchitecture(_) => ExportError::Configuration(e.to_string()),
            LoaderError::WeightMismatch(m) => ExportError::WeightMismatch(m),
            other => ExportError::Load(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_loader_errors_are_classified() {
        let missing: ExportError = LoaderError::MissingArchitecture(PathBuf::from("w.pt")).into();
        assert_eq!(missing.stage(), "configuration");
        assert_eq!(
            missing.to_string(),
            "configuration error: checkpoint w.pt has no embedded module and no architecture config given"
        );

        let mismatch: ExportError = LoaderError::WeightMismatch(WeightMismatch {
            missing: vec!["model.0.conv.weight".to_string()],
            ..Default::default()
        })
        .into();
        assert!(matches!(mismatch, ExportError::WeightMismatch(_)));
        assert_eq!(mismatch.stage(), "load");

        let io: ExportError = LoaderError::NotFound(PathBuf::from("w.pt")).into();
        assert!(matches!(io, ExportError::Load(_)));
    }

    #[test]
    fn test_config_error_is_configuration() {
        let e: ExportError = ConfigError::RecipeConflict("dynamic axes").into();
        assert_eq!(e.stage(), "configuration");
    }
}
