use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::model::{ArchitectureConfig, ModelError, StateDict, WeightMismatch};
use crate::sparsify::RecipeError;

#[derive(Error, Debug)]
pub enum LoaderError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid format: {0}")]
    InvalidFormat(String),
    #[error("Unsupported version: {0}")]
    UnsupportedVersion(String),
    #[error("Weights not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("checkpoint {} has no embedded module and no architecture config given", .0.display())]
    MissingArchitecture(PathBuf),
    #[error(transparent)]
    WeightMismatch(#[from] WeightMismatch),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error("Sparsification recipe: {0}")]
    Recipe(#[from] RecipeError),
}

/// A model saved together with its own architecture, as opposed to a bare
/// weight mapping.
#[derive(Debug, Clone, PartialEq)]
pub struct PackagedModel {
    pub config: ArchitectureConfig,
    pub state: StateDict,
    pub names: Vec<String>,
    /// Legacy per-layer buffer tracking, keyed by layer prefix.
    pub non_persistent_buffers: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CheckpointPayload {
    PackagedModel(PackagedModel),
    RawWeights(StateDict),
    Both(PackagedModel, StateDict),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointDescriptor {
    pub payload: CheckpointPayload,
    pub architecture_config: Option<ArchitectureConfig>,
}

impl CheckpointDescriptor {
    pub fn packaged(&self) -> Option<&PackagedModel> {
        match &self.payload {
            CheckpointPayload::PackagedModel(p) | CheckpointPayload::Both(p, _) => Some(p),
            CheckpointPayload::RawWeights(_) => None,
        }
    }

    pub fn raw_weights(&self) -> Option<&StateDict> {
        match &self.payload {
            CheckpointPayload::RawWeights(w) | CheckpointPayload::Both(_, w) => Some(w),
            CheckpointPayload::PackagedModel(_) => None,
        }
    }
}

pub trait ModelLoader {
    fn load<P: AsRef<Path>>(path: P) -> Result<CheckpointDescriptor, LoaderError>;
}

pub mod pytorch;
pub mod resolver;
pub mod safetensors;

pub use resolver::{CheckpointResolver, LocalWeights, ResolvedModel, WeightSource};

/// Reads a checkpoint, picking the format from the file extension.
pub fn read_checkpoint(path: &Path) -> Result<CheckpointDescriptor, LoaderError> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("safetensors") => safetensors::SafetensorsLoader::load(path),
        Some("pt") | Some("pth") => pytorch::PytorchLoader::load(path),
        other => Err(LoaderError::UnsupportedVersion(format!(
            "unrecognized checkpoint extension {:?} for {}",
            other.unwrap_or(""),
            path.display()
        ))),
    }
}
