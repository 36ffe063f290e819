use std::collections::BTreeMap;
use std::path::Path;

use ndarray::ArrayD;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::exporter::{Backend, ExportContext, ExporterError, SharedArtifact};
use crate::ir::{DataType, ModelIR, Node, Tensor};
use crate::loader::pytorch::{ArchiveWriter, PickleArchive};
use crate::loader::LoaderError;
use crate::model::{DetectionModel, OutputSignature};
use crate::verifier::archive::check_archive;

const ARCHIVE_VERSION: &str = "3";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TraceMode {
    /// Trace twice and reject the result if the two graphs differ.
    Strict,
    #[default]
    NonStrict,
}

/// A recorded forward pass plus the metadata shipped alongside it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TracedModule {
    pub graph: ModelIR,
    pub signature: Option<OutputSignature>,
    pub names: Vec<String>,
    pub stride: Vec<f32>,
}

impl TracedModule {
    pub fn trace(model: &DetectionModel, sample: &ArrayD<f32>, mode: TraceMode) -> Result<Self, ExporterError> {
        let (graph, signature) = model.trace(sample)?;
        if mode == TraceMode::Strict {
            let (again, _) = model.trace(sample)?;
            compare_graphs(&graph, &again)?;
        }
        Ok(Self {
            graph,
            signature: Some(signature),
            names: model.names().to_vec(),
            stride: model.stride().to_vec(),
        })
    }

    /// Input shape of the traced sample.
    pub fn input_shape(&self) -> Option<&[usize]> {
        self.graph.inputs.first().map(|t| t.shape.as_slice())
    }

    pub fn save(&self, path: &Path) -> Result<(), ExporterError> {
        let root = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "archive".to_string());
        let mut writer = ArchiveWriter::create(path, &root)?;

        let mut constants = BTreeMap::new();
        let mut names: Vec<&String> = self.graph.weights.keys().collect();
        names.sort();
        for (key, name) in names.into_iter().enumerate() {
            let tensor = &self.graph.weights[name];
            let key = key.to_string();
            writer.write_storage(&key, tensor.data.as_deref().unwrap_or_default())?;
            constants.insert(
                name.clone(),
                ConstantEntry {
                    dtype: tensor.data_type,
                    shape: tensor.shape.clone(),
                    key,
                },
            );
        }

        let index = GraphIndex {
            producer: format!("torchexport {}", env!("CARGO_PKG_VERSION")),
            inputs: self.graph.inputs.iter().map(ValueEntry::from).collect(),
            outputs: self.graph.outputs.iter().map(ValueEntry::from).collect(),
            nodes: self.graph.nodes.clone(),
            constants,
        };
        writer.write_index(&index)?;
        writer.write_entry("version", format!("{ARCHIVE_VERSION}\n").as_bytes())?;

        let extra = serde_json::json!({
            "shape": self.input_shape(),
            "stride": self.stride,
            "names": self.names,
        });
        writer.write_entry("extra/config.txt", extra.to_string().as_bytes())?;
        writer.finish()?;
        Ok(())
    }

    /// Reads an archive written by [`TracedModule::save`], checking every
    /// storage against its declared size.
    pub fn load(path: &Path) -> Result<Self, ExporterError> {
        let mut archive = PickleArchive::open(path)?;
        if !archive.has_entry("version") {
            return Err(LoaderError::InvalidFormat("archive has no version entry".to_string()).into());
        }
        let index: GraphIndex = archive.index()?;

        let mut graph = ModelIR::new();
        for (name, entry) in index.constants {
            let data = archive.storage(&entry.key)?;
            let expected = entry.shape.iter().product::<usize>() * entry.dtype.size_in_bytes();
            if data.len() != expected {
                return Err(LoaderError::InvalidFormat(format!(
                    "constant {name}: storage holds {} bytes, expected {expected}",
                    data.len()
                ))
                .into());
            }
            graph.weights.insert(
                name.clone(),
                Tensor {
                    name,
                    shape: entry.shape,
                    data_type: entry.dtype,
                    data: Some(data),
                },
            );
        }
        graph.inputs = index.inputs.into_iter().map(Tensor::from).collect();
        graph.outputs = index.outputs.into_iter().map(Tensor::from).collect();
        graph.nodes = index.nodes;

        let extra: ExtraConfig = match archive.read_entry("extra/config.txt") {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| ExporterError::SerializationError(e.to_string()))?,
            Err(_) => ExtraConfig::default(),
        };
        let signature = match graph.outputs.len() {
            1 => Some(OutputSignature::Single),
            2 => Some(OutputSignature::Pair),
            _ => None,
        };
        Ok(Self {
            graph,
            signature,
            names: extra.names,
            stride: extra.stride,
        })
    }
}

fn compare_graphs(a: &ModelIR, b: &ModelIR) -> Result<(), ExporterError> {
    if a.nodes.len() != b.nodes.len() {
        return Err(ExporterError::TraceMismatch(format!(
            "{} nodes vs {} nodes",
            a.nodes.len(),
            b.nodes.len()
        )));
    }
    for (x, y) in a.nodes.iter().zip(&b.nodes) {
        if x != y {
            return Err(ExporterError::TraceMismatch(format!("node {} differs from {}", x.name, y.name)));
        }
    }
    for (name, t) in &a.weights {
        if b.weights.get(name) != Some(t) {
            return Err(ExporterError::TraceMismatch(format!("constant {name} differs")));
        }
    }
    Ok(())
}

#[derive(Debug, Serialize, Deserialize)]
struct ValueEntry {
    name: String,
    shape: Vec<usize>,
    dtype: DataType,
}

impl From<&Tensor> for ValueEntry {
    fn from(t: &Tensor) -> Self {
        Self {
            name: t.name.clone(),
            shape: t.shape.clone(),
            dtype: t.data_type,
        }
    }
}

impl From<ValueEntry> for Tensor {
    fn from(v: ValueEntry) -> Self {
        Tensor {
            name: v.name,
            shape: v.shape,
            data_type: v.dtype,
            data: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ConstantEntry {
    dtype: DataType,
    shape: Vec<usize>,
    key: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct GraphIndex {
    producer: String,
    inputs: Vec<ValueEntry>,
    outputs: Vec<ValueEntry>,
    nodes: Vec<Node>,
    constants: BTreeMap<String, ConstantEntry>,
}

#[derive(Debug, Default, Deserialize)]
struct ExtraConfig {
    #[serde(default)]
    stride: Vec<f32>,
    #[serde(default)]
    names: Vec<String>,
}

/// Traced-graph archive. The trace is kept for backends that convert from it.
#[derive(Debug, Default)]
pub struct TorchScriptBackend {
    pub mode: TraceMode,
}

impl Backend for TorchScriptBackend {
    type Artifact = TracedModule;

    fn name(&self) -> &'static str {
        "TorchScript"
    }

    fn suffix(&self) -> &'static str {
        ".torchscript.pt"
    }

    fn build(&self, ctx: &ExportContext<'_>) -> Result<TracedModule, ExporterError> {
        let traced = TracedModule::trace(ctx.model, ctx.sample, self.mode)?;
        debug!(nodes = traced.graph.nodes.len(), "traced model");
        Ok(traced)
    }

    fn serialize(&self, artifact: &TracedModule, path: &Path) -> Result<(), ExporterError> {
        artifact.save(path)
    }

    fn verify(&self, path: &Path, _ctx: &ExportContext<'_>) -> Result<(), ExporterError> {
        check_archive(path)?;
        Ok(())
    }

    fn share(&self, artifact: TracedModule) -> Option<SharedArtifact> {
        Some(SharedArtifact::Traced(artifact))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::tests::{seeded_state, tiny_model};
    use ndarray::IxDyn;
    use tempfile::tempdir;

    fn traced() -> TracedModule {
        let mut model = tiny_model();
        model.load_state_dict(&seeded_state(&model)).unwrap();
        TracedModule::trace(&model, &ArrayD::zeros(IxDyn(&[1, 3, 64, 64])), TraceMode::Strict).unwrap()
    }

    #[test]
    fn test_archive_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("yolo.torchscript.pt");
        let module = traced();
        module.save(&path).unwrap();

        let loaded = TracedModule::load(&path).unwrap();
        assert_eq!(loaded, module);
        assert_eq!(loaded.input_shape(), Some(&[1, 3, 64, 64][..]));
    }

    #[test]
    fn test_archive_layout() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("yolo.torchscript.pt");
        traced().save(&path).unwrap();

        let mut archive = PickleArchive::open(&path).unwrap();
        assert!(archive.has_entry("version"));
        assert!(archive.has_entry("data/0"));
        let extra: serde_json::Value =
            serde_json::from_slice(&archive.read_entry("extra/config.txt").unwrap()).unwrap();
        assert_eq!(extra["stride"], serde_json::json!([16.0, 32.0]));
    }

    #[test]
    fn test_truncated_storage_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.torchscript.pt");
        let mut module = traced();
        let tensor = module.graph.weights.get_mut("model.0.conv.weight").unwrap();
        tensor.shape[0] += 1;
        module.save(&path).unwrap();

        assert!(matches!(TracedModule::load(&path), Err(ExporterError::Archive(_))));
    }

    #[test]
    fn test_compare_detects_divergence() {
        let a = traced();
        let mut b = a.clone();
        b.graph.nodes[0].op_type = "Relu".to_string();
        assert!(matches!(compare_graphs(&a.graph, &b.graph), Err(ExporterError::TraceMismatch(_))));
    }
}
