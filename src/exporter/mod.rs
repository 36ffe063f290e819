//! Format backends and the sequencer that runs them with per-backend failure
//! isolation.

pub mod onnx {
    include!("onnx.rs");
}

pub mod coreml;
pub mod onnx_exporter;
pub mod torchscript;

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};

use ndarray::ArrayD;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::ExportConfig;
use crate::loader::LoaderError;
use crate::model::{DetectionModel, ModelError, OutputSignature};
use crate::optimizer::OptimizerError;
use crate::verifier::VerifierError;

pub use coreml::{CoremlBackend, CoremlConverter, ImageInput, UnavailableConverter};
pub use onnx_exporter::OnnxBackend;
pub use torchscript::{TorchScriptBackend, TraceMode, TracedModule};

#[derive(Error, Debug)]
pub enum ExporterError {
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Unsupported operator: {0}")]
    UnsupportedOperator(String),
    #[error("Tracing failed: {0}")]
    Tracing(#[from] ModelError),
    #[error("Traced graphs diverge: {0}")]
    TraceMismatch(String),
    #[error("Verification failed: {0}")]
    Verification(#[from] VerifierError),
    #[error("Archive error: {0}")]
    Archive(#[from] LoaderError),
    #[error("Graph optimization failed: {0}")]
    Optimization(#[from] OptimizerError),
    #[error("{0} is not available")]
    Unavailable(String),
    #[error("missing {0} artifact")]
    MissingArtifact(&'static str),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Artifact one backend leaves for later ones.
#[derive(Debug)]
pub enum SharedArtifact {
    Traced(TracedModule),
}

#[derive(Debug, Default)]
pub struct ArtifactStore {
    artifacts: HashMap<&'static str, SharedArtifact>,
}

impl ArtifactStore {
    pub fn insert(&mut self, backend: &'static str, artifact: SharedArtifact) {
        self.artifacts.insert(backend, artifact);
    }

    pub fn get(&self, backend: &str) -> Option<&SharedArtifact> {
        self.artifacts.get(backend)
    }

    pub fn traced(&self, backend: &str) -> Option<&TracedModule> {
        match self.get(backend)? {
            SharedArtifact::Traced(t) => Some(t),
        }
    }

    pub fn remove(&mut self, backend: &str) -> Option<SharedArtifact> {
        self.artifacts.remove(backend)
    }

    pub fn backends(&self) -> Vec<&'static str> {
        self.artifacts.keys().copied().collect()
    }
}

/// Everything a backend may read while exporting.
pub struct ExportContext<'a> {
    pub model: &'a DetectionModel,
    pub config: &'a ExportConfig,
    pub sample: &'a ArrayD<f32>,
    pub signature: OutputSignature,
    pub artifacts: &'a ArtifactStore,
}

impl ExportContext<'_> {
    /// Quantization-aware graphs are exported when a recipe was applied.
    pub fn quantized(&self) -> bool {
        self.config.recipe().is_some()
    }
}

/// One serialization format: build an artifact, write it, check the file.
pub trait Backend {
    type Artifact;

    fn name(&self) -> &'static str;

    /// Appended to the weights file stem to form the output path.
    fn suffix(&self) -> &'static str;

    /// Backend whose success this one requires.
    fn depends_on(&self) -> Option<&'static str> {
        None
    }

    fn build(&self, ctx: &ExportContext<'_>) -> Result<Self::Artifact, ExporterError>;

    fn serialize(&self, artifact: &Self::Artifact, path: &Path) -> Result<(), ExporterError>;

    fn verify(&self, path: &Path, ctx: &ExportContext<'_>) -> Result<(), ExporterError>;

    /// Hands the artifact to later backends once verified.
    fn share(&self, _artifact: Self::Artifact) -> Option<SharedArtifact> {
        None
    }
}

/// Object-safe form of [`Backend`] used by the sequencer.
pub trait Exporter {
    fn name(&self) -> &'static str;
    fn depends_on(&self) -> Option<&'static str>;
    fn export(&self, ctx: &ExportContext<'_>) -> Result<(PathBuf, Option<SharedArtifact>), ExporterError>;
}

impl<B: Backend> Exporter for B {
    fn name(&self) -> &'static str {
        Backend::name(self)
    }

    fn depends_on(&self) -> Option<&'static str> {
        Backend::depends_on(self)
    }

    fn export(&self, ctx: &ExportContext<'_>) -> Result<(PathBuf, Option<SharedArtifact>), ExporterError> {
        let path = ctx.config.output_path(self.suffix());
        info!("{} starting export", Backend::name(self));
        let artifact = self.build(ctx)?;
        self.serialize(&artifact, &path)?;
        self.verify(&path, ctx)?;
        Ok((path, self.share(artifact)))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExportOutcome {
    Success { path: PathBuf },
    Failed { error: String },
}

/// Outcome of one backend. Created once, never changed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExportResult {
    pub backend: &'static str,
    #[serde(flatten)]
    pub outcome: ExportOutcome,
}

impl ExportResult {
    pub fn success(backend: &'static str, path: PathBuf) -> Self {
        Self {
            backend,
            outcome: ExportOutcome::Success { path },
        }
    }

    pub fn failed(backend: &'static str, error: impl Into<String>) -> Self {
        Self {
            backend,
            outcome: ExportOutcome::Failed { error: error.into() },
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, ExportOutcome::Success { .. })
    }

    pub fn output_path(&self) -> Option<&Path> {
        match &self.outcome {
            ExportOutcome::Success { path } => Some(path),
            ExportOutcome::Failed { .. } => None,
        }
    }

    pub fn error_detail(&self) -> Option<&str> {
        match &self.outcome {
            ExportOutcome::Success { .. } => None,
            ExportOutcome::Failed { error } => Some(error),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Runs one exporter, turning errors and panics into a failed result.
pub fn attempt(exporter: &dyn Exporter, ctx: &ExportContext<'_>) -> (ExportResult, Option<SharedArtifact>) {
    let name = exporter.name();
    match catch_unwind(AssertUnwindSafe(|| exporter.export(ctx))) {
        Ok(Ok((path, shared))) => {
            info!("{name} export success, saved as {}", path.display());
            (ExportResult::success(name, path), shared)
        }
        Ok(Err(e)) => {
            warn!("{name} export failure: {e}");
            (ExportResult::failed(name, e.to_string()), None)
        }
        Err(payload) => {
            let message = format!("panicked: {}", panic_message(payload.as_ref()));
            warn!("{name} export failure: {message}");
            (ExportResult::failed(name, message), None)
        }
    }
}

/// Ordered registry of exporters. `run` yields one result per exporter, in
/// registration order, and never fails.
#[derive(Default)]
pub struct Sequencer {
    exporters: Vec<Box<dyn Exporter>>,
}

impl Sequencer {
    pub fn new() -> Self {
        Self::default()
    }

    /// TorchScript, then ONNX, then CoreML from the TorchScript trace.
    pub fn standard(converter: Box<dyn CoremlConverter>) -> Self {
        Self::new()
            .register(TorchScriptBackend::default())
            .register(OnnxBackend::default())
            .register(CoremlBackend::new(converter))
    }

    pub fn register(mut self, exporter: impl Exporter + 'static) -> Self {
        self.exporters.push(Box::new(exporter));
        self
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.exporters.iter().map(|e| e.name()).collect()
    }

    pub fn run(
        &self,
        model: &DetectionModel,
        config: &ExportConfig,
        sample: &ArrayD<f32>,
        signature: OutputSignature,
    ) -> Vec<ExportResult> {
        let mut store = ArtifactStore::default();
        let mut succeeded: HashSet<&'static str> = HashSet::new();
        let mut results = Vec::with_capacity(self.exporters.len());

        for (i, exporter) in self.exporters.iter().enumerate() {
            let name = exporter.name();
            let result = match exporter.depends_on() {
                Some(dep) if !succeeded.contains(dep) => {
                    warn!("{name} export skipped: requires a successful {dep} export");
                    ExportResult::failed(name, format!("requires a successful {dep} export"))
                }
                _ => {
                    let ctx = ExportContext {
                        model,
                        config,
                        sample,
                        signature,
                        artifacts: &store,
                    };
                    let (result, shared) = attempt(exporter.as_ref(), &ctx);
                    if let Some(shared) = shared {
                        store.insert(name, shared);
                    }
                    result
                }
            };
            if result.is_success() {
                succeeded.insert(name);
            }
            results.push(result);

            let later = &self.exporters[i + 1..];
            for backend in store.backends() {
                if !later.iter().any(|e| e.depends_on() == Some(backend)) {
                    debug!("releasing {backend} artifact");
                    store.remove(backend);
                }
            }
        }
        results
    }
}
