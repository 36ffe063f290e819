use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::path::Path;

use prost::Message;
use tracing::debug;

use crate::exporter::onnx::tensor_shape_proto::{dimension, Dimension};
use crate::exporter::{onnx, Backend, ExportContext, ExporterError};
use crate::ir::{Attribute, DataType, ModelIR, Tensor};
use crate::optimizer::{ConstantFolding, ConvBatchNormFusion, DeadCodeElimination, OptimizationPass, Optimizer, SkipInputQuantize};
use crate::verifier::onnx::{check_file, is_supported, OPSET_VERSION};

/// Graph-interchange export at a fixed opset.
pub struct OnnxBackend {
    pub opset: i64,
}

impl Default for OnnxBackend {
    fn default() -> Self {
        Self { opset: OPSET_VERSION }
    }
}

fn elem_type(data_type: DataType) -> i32 {
    let t = match data_type {
        DataType::F32 => onnx::tensor_proto::DataType::Float,
        DataType::F16 => onnx::tensor_proto::DataType::Float16,
        DataType::I64 => onnx::tensor_proto::DataType::Int64,
        DataType::I8 => onnx::tensor_proto::DataType::Int8,
        DataType::U8 => onnx::tensor_proto::DataType::Uint8,
    };
    t as i32
}

fn value_info(tensor: &Tensor, symbols: &[Option<&str>]) -> onnx::ValueInfoProto {
    let dim = tensor
        .shape
        .iter()
        .enumerate()
        .map(|(i, d)| Dimension {
            denotation: None,
            value: Some(match symbols.get(i).copied().flatten() {
                Some(param) => dimension::Value::DimParam(param.to_string()),
                None => dimension::Value::DimValue(*d as i64),
            }),
        })
        .collect();
    onnx::ValueInfoProto {
        name: Some(tensor.name.clone()),
        r#type: Some(onnx::TypeProto {
            value: Some(onnx::type_proto::Value::TensorType(onnx::type_proto::Tensor {
                elem_type: Some(elem_type(tensor.data_type)),
                shape: Some(onnx::TensorShapeProto { dim }),
            })),
        }),
        doc_string: None,
    }
}

fn attribute(name: &str, value: &Attribute) -> onnx::AttributeProto {
    let mut a = onnx::AttributeProto {
        name: Some(name.to_string()),
        ..Default::default()
    };
    match value {
        Attribute::Float(f) => {
            a.f = Some(*f);
            a.r#type = Some(onnx::attribute_proto::AttributeType::Float as i32);
        }
        Attribute::Int(i) => {
            a.i = Some(*i);
            a.r#type = Some(onnx::attribute_proto::AttributeType::Int as i32);
        }
        Attribute::String(s) => {
            a.s = Some(s.as_bytes().to_vec());
            a.r#type = Some(onnx::attribute_proto::AttributeType::String as i32);
        }
        Attribute::Floats(fs) => {
            a.floats = fs.clone();
            a.r#type = Some(onnx::attribute_proto::AttributeType::Floats as i32);
        }
        Attribute::Ints(is) => {
            a.ints = is.clone();
            a.r#type = Some(onnx::attribute_proto::AttributeType::Ints as i32);
        }
    }
    a
}

/// Renames a produced value everywhere it appears.
fn rename_value(ir: &mut ModelIR, from: &str, to: &str) {
    for node in &mut ir.nodes {
        for output in &mut node.outputs {
            if output == from {
                *output = to.to_string();
            }
        }
    }
    ir.replace_uses(from, to);
}

impl OnnxBackend {
    /// Traces the model and rewrites the graph for the requested export path.
    pub fn prepare(&self, ctx: &ExportContext<'_>) -> Result<ModelIR, ExporterError> {
        let (mut ir, signature) = ctx.model.trace(ctx.sample)?;
        if signature != ctx.signature {
            return Err(ExporterError::TraceMismatch(format!(
                "dry run produced {:?} outputs, trace produced {:?}",
                ctx.signature, signature
            )));
        }
        let produced: Vec<String> = ir.outputs.iter().map(|t| t.name.clone()).collect();
        for (from, to) in produced.iter().zip(signature.names()) {
            rename_value(&mut ir, from, to);
        }

        if ctx.quantized() {
            Optimizer::new()
                .with_pass(ConstantFolding)
                .with_pass(DeadCodeElimination)
                .optimize(&mut ir)?;
            if let Err(e) = SkipInputQuantize.apply(&mut ir) {
                debug!("{} not applied: {e}", SkipInputQuantize.name());
            }
        } else {
            Optimizer::new()
                .with_pass(DeadCodeElimination)
                .with_pass(ConvBatchNormFusion)
                .with_pass(DeadCodeElimination)
                .optimize(&mut ir)?;
        }

        if let Some(node) = ir.nodes.iter().find(|n| !is_supported(&n.op_type)) {
            return Err(ExporterError::UnsupportedOperator(format!(
                "{} (node {}) is not in opset {}",
                node.op_type, node.name, self.opset
            )));
        }
        Ok(ir)
    }

    pub fn to_model_proto(&self, ir: &ModelIR, ctx: &ExportContext<'_>) -> onnx::ModelProto {
        let mut graph = onnx::GraphProto {
            name: Some("main_graph".to_string()),
            ..Default::default()
        };

        let mut names: Vec<&String> = ir.weights.keys().collect();
        names.sort();
        for name in names {
            let tensor = &ir.weights[name];
            graph.initializer.push(onnx::TensorProto {
                name: Some(name.clone()),
                dims: tensor.shape.iter().map(|&d| d as i64).collect(),
                data_type: Some(elem_type(tensor.data_type)),
                raw_data: Some(tensor.data.clone().unwrap_or_default()),
                ..Default::default()
            });
        }

        for node in &ir.nodes {
            let mut keys: Vec<&String> = node.attributes.keys().collect();
            keys.sort();
            graph.node.push(onnx::NodeProto {
                name: Some(node.name.clone()),
                op_type: Some(node.op_type.clone()),
                input: node.inputs.clone(),
                output: node.outputs.clone(),
                attribute: keys.into_iter().map(|k| attribute(k, &node.attributes[k])).collect(),
                ..Default::default()
            });
        }

        let dynamic = ctx.config.dynamic();
        let input_symbols: &[Option<&str>] = if dynamic {
            &[Some("batch"), None, Some("height"), Some("width")]
        } else {
            &[]
        };
        let output_symbols: &[Option<&str>] = if dynamic { &[Some("batch"), Some("anchors")] } else { &[] };
        graph.input = ir.inputs.iter().map(|t| value_info(t, input_symbols)).collect();
        graph.output = ir.outputs.iter().map(|t| value_info(t, output_symbols)).collect();

        let metadata = [
            ("stride", serde_json::json!(ctx.model.stride()).to_string()),
            ("names", serde_json::json!(ctx.model.names()).to_string()),
        ];
        onnx::ModelProto {
            ir_version: Some(onnx::Version::IrVersion202058 as i64),
            opset_import: vec![onnx::OperatorSetIdProto {
                domain: Some(String::new()),
                version: Some(self.opset),
            }],
            producer_name: Some("torchexport".to_string()),
            producer_version: Some(env!("CARGO_PKG_VERSION").to_string()),
            graph: Some(graph),
            metadata_props: metadata
                .into_iter()
                .map(|(k, v)| onnx::StringStringEntryProto {
                    key: Some(k.to_string()),
                    value: Some(v),
                })
                .collect(),
            ..Default::default()
        }
    }
}

impl Backend for OnnxBackend {
    type Artifact = onnx::ModelProto;

    fn name(&self) -> &'static str {
        "ONNX"
    }

    fn suffix(&self) -> &'static str {
        ".onnx"
    }

    fn build(&self, ctx: &ExportContext<'_>) -> Result<onnx::ModelProto, ExporterError> {
        let ir = self.prepare(ctx)?;
        debug!(nodes = ir.nodes.len(), initializers = ir.weights.len(), "onnx graph ready");
        Ok(self.to_model_proto(&ir, ctx))
    }

    fn serialize(&self, artifact: &onnx::ModelProto, path: &Path) -> Result<(), ExporterError> {
        let mut buf = Vec::new();
        artifact
            .encode(&mut buf)
            .map_err(|e| ExporterError::SerializationError(e.to_string()))?;
        let mut file = File::create(path)?;
        file.write_all(&buf)?;
        Ok(())
    }

    fn verify(&self, path: &Path, _ctx: &ExportContext<'_>) -> Result<(), ExporterError> {
        check_file(path)?;
        Ok(())
    }
}

/// Element type and declared dims of each graph input and output.
pub fn signature_of(model: &onnx::ModelProto) -> HashMap<String, (i32, Vec<String>)> {
    let mut out = HashMap::new();
    let Some(graph) = &model.graph else {
        return out;
    };
    for info in graph.input.iter().chain(&graph.output) {
        if let Some(onnx::TypeProto {
            value: Some(onnx::type_proto::Value::TensorType(t)),
        }) = &info.r#type
        {
            let dims = t
                .shape
                .iter()
                .flat_map(|s| &s.dim)
                .map(|d| match &d.value {
                    Some(dimension::Value::DimValue(v)) => v.to_string(),
                    Some(dimension::Value::DimParam(p)) => p.clone(),
                    None => "?".to_string(),
                })
                .collect();
            out.insert(info.name.clone().unwrap_or_default(), (t.elem_type.unwrap_or(0), dims));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExportConfig;
    use crate::exporter::ArtifactStore;
    use crate::model::tests::{seeded_state, tiny_model};
    use crate::model::{DetectionModel, OutputSignature};
    use crate::sparsify::tests::quantized_model;
    use crate::transform::{zero_sample, ExportModeTransformer};
    use ndarray::ArrayD;
    use tempfile::tempdir;

    fn export(model: &DetectionModel, config: &ExportConfig) -> Result<onnx::ModelProto, ExporterError> {
        let sample: ArrayD<f32> = zero_sample(config.sample_shape());
        let store = ArtifactStore::default();
        let ctx = ExportContext {
            model,
            config,
            sample: &sample,
            signature: OutputSignature::Single,
            artifacts: &store,
        };
        let backend = OnnxBackend::default();
        let proto = backend.build(&ctx)?;
        let path = config.output_path(".onnx");
        backend.serialize(&proto, &path)?;
        backend.verify(&path, &ctx)?;
        Ok(proto)
    }

    fn export_ready_model() -> DetectionModel {
        let mut model = tiny_model();
        model.load_state_dict(&seeded_state(&model)).unwrap();
        ExportModeTransformer::new(false)
            .apply(&mut model, &zero_sample([1, 3, 64, 64]))
            .unwrap();
        model
    }

    #[test]
    fn test_static_export() {
        let dir = tempdir().unwrap();
        let config = ExportConfig::builder(dir.path().join("w.pt"))
            .image_size(vec![64])
            .build()
            .unwrap();
        let proto = export(&export_ready_model(), &config).unwrap();

        assert_eq!(proto.ir_version, Some(7));
        assert_eq!(proto.opset_import[0].version, Some(12));
        let graph = proto.graph.as_ref().unwrap();
        assert!(!graph.node.iter().any(|n| n.op_type.as_deref() == Some("BatchNormalization")));

        let sig = signature_of(&proto);
        let float = onnx::tensor_proto::DataType::Float as i32;
        assert_eq!(sig["images"], (float, vec!["1".into(), "3".into(), "64".into(), "64".into()]));
        assert_eq!(sig["output"], (float, vec!["1".into(), "60".into(), "8".into()]));
        assert!(config.output_path(".onnx").exists());
    }

    #[test]
    fn test_dynamic_axes_are_symbolic() {
        let dir = tempdir().unwrap();
        let config = ExportConfig::builder(dir.path().join("w.pt"))
            .image_size(vec![64])
            .dynamic(true)
            .build()
            .unwrap();
        let proto = export(&export_ready_model(), &config).unwrap();
        let sig = signature_of(&proto);
        assert_eq!(sig["images"].1, vec!["batch", "3", "height", "width"]);
        assert_eq!(sig["output"].1, vec!["batch", "anchors", "8"]);
    }

    #[test]
    fn test_reference_activations_are_unsupported() {
        let dir = tempdir().unwrap();
        let config = ExportConfig::builder(dir.path().join("w.pt"))
            .image_size(vec![64])
            .build()
            .unwrap();
        let err = export(&tiny_model(), &config).unwrap_err();
        assert!(matches!(&err, ExporterError::UnsupportedOperator(m) if m.starts_with("SiLU")), "{err}");
    }

    #[test]
    fn test_quantized_export_has_int8_weights_and_uint8_images() {
        let dir = tempdir().unwrap();
        let config = ExportConfig::builder(dir.path().join("w.pt"))
            .image_size(vec![64])
            .recipe(Some(dir.path().join("recipe.yaml")))
            .build()
            .unwrap();
        let mut model = quantized_model();
        ExportModeTransformer::new(false)
            .apply(&mut model, &zero_sample([1, 3, 64, 64]))
            .unwrap();
        let proto = export(&model, &config).unwrap();

        let graph = proto.graph.as_ref().unwrap();
        let int8 = onnx::tensor_proto::DataType::Int8 as i32;
        assert!(graph.initializer.iter().any(|t| t.data_type == Some(int8)));
        assert!(!graph
            .initializer
            .iter()
            .any(|t| t.name.as_deref() == Some("model.0.conv.weight")));
        assert_eq!(signature_of(&proto)["images"].0, onnx::tensor_proto::DataType::Uint8 as i32);
    }

    #[test]
    fn test_metadata_carries_stride_and_names() {
        let dir = tempdir().unwrap();
        let config = ExportConfig::builder(dir.path().join("w.pt"))
            .image_size(vec![64])
            .build()
            .unwrap();
        let proto = export(&export_ready_model(), &config).unwrap();
        let stride = proto
            .metadata_props
            .iter()
            .find(|p| p.key.as_deref() == Some("stride"))
            .and_then(|p| p.value.clone());
        assert_eq!(stride.as_deref(), Some("[16.0,32.0]"));
    }
}
