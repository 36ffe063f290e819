use std::path::Path;

use serde::Serialize;

use crate::exporter::{Backend, ExportContext, ExporterError};
use crate::exporter::torchscript::TracedModule;
use crate::verifier::VerifierError;

/// Image input of a converted model: pixels are multiplied by `scale` and
/// offset by `bias` per channel before reaching the network.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageInput {
    pub name: String,
    pub shape: Vec<usize>,
    pub scale: f32,
    pub bias: [f32; 3],
}

impl ImageInput {
    /// 8-bit pixels normalized to `[0, 1]`.
    pub fn normalized(shape: &[usize]) -> Self {
        Self {
            name: "image".to_string(),
            shape: shape.to_vec(),
            scale: 1.0 / 255.0,
            bias: [0.0, 0.0, 0.0],
        }
    }
}

/// Converts a traced module into a serialized CoreML model.
pub trait CoremlConverter {
    fn convert(&self, traced: &TracedModule, inputs: &[ImageInput]) -> Result<Vec<u8>, ExporterError>;

    /// Loads serialized bytes back and checks they form a valid model.
    fn validate(&self, model: &[u8]) -> Result<(), ExporterError>;
}

/// Stand-in used when no converter is linked into the build.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableConverter;

impl CoremlConverter for UnavailableConverter {
    fn convert(&self, _traced: &TracedModule, _inputs: &[ImageInput]) -> Result<Vec<u8>, ExporterError> {
        Err(ExporterError::Unavailable("CoreML converter".to_string()))
    }

    fn validate(&self, _model: &[u8]) -> Result<(), ExporterError> {
        Err(ExporterError::Unavailable("CoreML converter".to_string()))
    }
}

pub struct CoremlBackend {
    converter: Box<dyn CoremlConverter>,
}

impl CoremlBackend {
    pub fn new(converter: Box<dyn CoremlConverter>) -> Self {
        Self { converter }
    }
}

impl Backend for CoremlBackend {
    type Artifact = Vec<u8>;

    fn name(&self) -> &'static str {
        "CoreML"
    }

    fn suffix(&self) -> &'static str {
        ".mlmodel"
    }

    fn depends_on(&self) -> Option<&'static str> {
        Some("TorchScript")
    }

    fn build(&self, ctx: &ExportContext<'_>) -> Result<Vec<u8>, ExporterError> {
        let traced = ctx
            .artifacts
            .traced("TorchScript")
            .ok_or(ExporterError::MissingArtifact("TorchScript"))?;
        let inputs = [ImageInput::normalized(ctx.sample.shape())];
        self.converter.convert(traced, &inputs)
    }

    fn serialize(&self, artifact: &Vec<u8>, path: &Path) -> Result<(), ExporterError> {
        std::fs::write(path, artifact)?;
        Ok(())
    }

    fn verify(&self, path: &Path, _ctx: &ExportContext<'_>) -> Result<(), ExporterError> {
        let bytes = std::fs::read(path)?;
        if bytes.is_empty() {
            return Err(VerifierError::EmptyArtifact(path.to_path_buf()).into());
        }
        self.converter.validate(&bytes)
    }
}
