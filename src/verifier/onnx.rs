use std::collections::HashMap;
use std::path::Path;

use prost::Message;

use crate::exporter::onnx::tensor_shape_proto::dimension::Value as DimValue;
use crate::exporter::onnx::{self, tensor_proto, ModelProto, TensorProto, ValueInfoProto};
use crate::ir::shape_inference::ShapeInference;
use crate::ir::{Attribute, DataType, ModelIR, Node, Tensor};
use crate::verifier::{check_references, VerifierError};

/// Operator set exported graphs are checked against.
pub const OPSET_VERSION: i64 = 12;

/// Default-domain operators available at opset 12 that the exporter can emit
/// or that common detection graphs contain.
pub const OPSET12_OPS: &[&str] = &[
    "Add", "AveragePool", "BatchNormalization", "Cast", "Clip", "Concat", "Constant", "Conv",
    "DequantizeLinear", "Div", "Exp", "Expand", "Flatten", "Gather", "Gemm", "GlobalAveragePool",
    "HardSigmoid", "Identity", "LeakyRelu", "MatMul", "MaxPool", "Mul", "Neg", "Pow",
    "QuantizeLinear", "Relu", "Reshape", "Resize", "Shape", "Sigmoid", "Slice", "Softmax",
    "Split", "Sqrt", "Squeeze", "Sub", "Tanh", "Transpose", "Unsqueeze",
];

pub fn is_supported(op_type: &str) -> bool {
    OPSET12_OPS.contains(&op_type)
}

pub fn data_type_from_proto(elem_type: i32) -> Option<DataType> {
    match tensor_proto::DataType::try_from(elem_type).ok()? {
        tensor_proto::DataType::Float => Some(DataType::F32),
        tensor_proto::DataType::Float16 => Some(DataType::F16),
        tensor_proto::DataType::Int64 => Some(DataType::I64),
        tensor_proto::DataType::Int8 => Some(DataType::I8),
        tensor_proto::DataType::Uint8 => Some(DataType::U8),
        _ => None,
    }
}

/// Decodes and checks an ONNX file.
pub fn check_file(path: &Path) -> Result<ModelProto, VerifierError> {
    let bytes = std::fs::read(path)?;
    if bytes.is_empty() {
        return Err(VerifierError::EmptyArtifact(path.to_path_buf()));
    }
    let model = ModelProto::decode(bytes.as_slice()).map_err(|e| VerifierError::Decode(e.to_string()))?;
    check_model(&model)?;
    Ok(model)
}

pub fn check_model(model: &ModelProto) -> Result<(), VerifierError> {
    if model.ir_version.unwrap_or(0) <= 0 {
        return Err(VerifierError::Structure("model has no IR version".to_string()));
    }
    let opset = model
        .opset_import
        .iter()
        .find(|o| o.domain.as_deref().unwrap_or("").is_empty())
        .and_then(|o| o.version)
        .ok_or_else(|| VerifierError::Structure("model imports no default-domain opset".to_string()))?;
    let graph = model
        .graph
        .as_ref()
        .ok_or_else(|| VerifierError::Structure("model has no graph".to_string()))?;

    for node in &graph.node {
        let op = node.op_type.as_deref().unwrap_or("");
        let default_domain = node.domain.as_deref().unwrap_or("").is_empty();
        if !default_domain || opset > OPSET_VERSION || !is_supported(op) {
            return Err(VerifierError::Structure(format!(
                "operator {op} is not in opset {opset}"
            )));
        }
    }
    for init in &graph.initializer {
        check_initializer(init)?;
    }
    for info in graph.input.iter().chain(&graph.output) {
        value_shape(info)?;
    }

    let ir = to_ir(model)?;
    check_references(&ir)?;

    let concrete = graph
        .input
        .iter()
        .map(value_shape)
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .all(|dims| dims.iter().all(Option::is_some));
    if concrete {
        let shapes = ShapeInference::infer(&ir).map_err(|e| VerifierError::Shape(e.to_string()))?;
        for info in &graph.output {
            let name = info.name.clone().unwrap_or_default();
            let inferred = shapes
                .get(&name)
                .ok_or_else(|| VerifierError::Shape(format!("no shape inferred for output {name}")))?;
            let declared = value_shape(info)?;
            let matches = declared.len() == inferred.len()
                && declared.iter().zip(inferred).all(|(d, i)| d.map_or(true, |d| d == *i));
            if !matches {
                return Err(VerifierError::Shape(format!(
                    "output {name} declared as {declared:?}, inferred {inferred:?}"
                )));
            }
        }
    }
    Ok(())
}

fn check_initializer(init: &TensorProto) -> Result<(), VerifierError> {
    let name = init.name.as_deref().unwrap_or("");
    let dtype = init
        .data_type
        .and_then(data_type_from_proto)
        .ok_or_else(|| VerifierError::Structure(format!("initializer {name} has no supported element type")))?;
    if init.dims.iter().any(|d| *d < 0) {
        return Err(VerifierError::Structure(format!("initializer {name} has a negative dimension")));
    }
    let elements: usize = init.dims.iter().map(|d| *d as usize).product();
    let found = match &init.raw_data {
        Some(raw) => raw.len(),
        None => {
            (init.float_data.len() + init.int32_data.len() + init.int64_data.len()) * dtype.size_in_bytes()
        }
    };
    let expected = elements * dtype.size_in_bytes();
    if found != expected {
        return Err(VerifierError::Structure(format!(
            "initializer {name} holds {found} bytes, dims {:?} need {expected}",
            init.dims
        )));
    }
    Ok(())
}

/// Declared dims of a value; `None` marks a symbolic dimension.
fn value_shape(info: &ValueInfoProto) -> Result<Vec<Option<usize>>, VerifierError> {
    let name = info.name.as_deref().unwrap_or("");
    let tensor = match info.r#type.as_ref().and_then(|t| t.value.as_ref()) {
        Some(onnx::type_proto::Value::TensorType(t)) => t,
        None => return Err(VerifierError::Structure(format!("value {name} has no type"))),
    };
    if tensor.elem_type.and_then(data_type_from_proto).is_none() {
        return Err(VerifierError::Structure(format!("value {name} has no element type")));
    }
    let shape = tensor
        .shape
        .as_ref()
        .ok_or_else(|| VerifierError::Structure(format!("value {name} has no shape")))?;
    shape
        .dim
        .iter()
        .map(|d| match &d.value {
            Some(DimValue::DimValue(v)) if *v >= 0 => Ok(Some(*v as usize)),
            Some(DimValue::DimParam(p)) if !p.is_empty() => Ok(None),
            _ => Err(VerifierError::Structure(format!("value {name} has an unset dimension"))),
        })
        .collect()
}

fn to_ir(model: &ModelProto) -> Result<ModelIR, VerifierError> {
    let graph = model
        .graph
        .as_ref()
        .ok_or_else(|| VerifierError::Structure("model has no graph".to_string()))?;

    let mut ir = ModelIR::new();
    for init in &graph.initializer {
        let name = init.name.clone().unwrap_or_default();
        let data_type = init.data_type.and_then(data_type_from_proto).unwrap_or(DataType::F32);
        let data = match &init.raw_data {
            Some(raw) => raw.clone(),
            None if !init.float_data.is_empty() => init.float_data.iter().flat_map(|v| v.to_le_bytes()).collect(),
            None => init.int64_data.iter().flat_map(|v| v.to_le_bytes()).collect(),
        };
        ir.weights.insert(
            name.clone(),
            Tensor {
                name,
                shape: init.dims.iter().map(|d| *d as usize).collect(),
                data_type,
                data: Some(data),
            },
        );
    }
    let value = |info: &ValueInfoProto| -> Result<Tensor, VerifierError> {
        let shape = value_shape(info)?.into_iter().map(|d| d.unwrap_or(1)).collect();
        Ok(Tensor::value(info.name.clone().unwrap_or_default(), shape))
    };
    ir.inputs = graph.input.iter().map(value).collect::<Result<_, _>>()?;
    ir.outputs = graph.output.iter().map(value).collect::<Result<_, _>>()?;

    for node in &graph.node {
        let mut attributes = HashMap::new();
        for attr in &node.attribute {
            let name = attr.name.clone().unwrap_or_default();
            let value = match onnx::attribute_proto::AttributeType::try_from(attr.r#type.unwrap_or(0)) {
                Ok(onnx::attribute_proto::AttributeType::Float) => Attribute::Float(attr.f.unwrap_or_default()),
                Ok(onnx::attribute_proto::AttributeType::Int) => Attribute::Int(attr.i.unwrap_or_default()),
                Ok(onnx::attribute_proto::AttributeType::String) => Attribute::String(
                    String::from_utf8_lossy(attr.s.as_deref().unwrap_or_default()).into_owned(),
                ),
                Ok(onnx::attribute_proto::AttributeType::Floats) => Attribute::Floats(attr.floats.clone()),
                Ok(onnx::attribute_proto::AttributeType::Ints) => Attribute::Ints(attr.ints.clone()),
                _ => {
                    return Err(VerifierError::Structure(format!(
                        "attribute {name} of {} has an unsupported type",
                        node.name.as_deref().unwrap_or("")
                    )))
                }
            };
            attributes.insert(name, value);
        }
        ir.nodes.push(Node {
            name: node.name.clone().unwrap_or_default(),
            op_type: node.op_type.clone().unwrap_or_default(),
            inputs: node.input.clone(),
            outputs: node.output.clone(),
            attributes,
        });
    }
    Ok(ir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exporter::onnx::{
        type_proto, GraphProto, NodeProto, OperatorSetIdProto, TensorShapeProto, TypeProto,
    };
    use crate::exporter::onnx::tensor_shape_proto::Dimension;

    fn value_info(name: &str, dims: &[i64]) -> ValueInfoProto {
        ValueInfoProto {
            name: Some(name.to_string()),
            r#type: Some(TypeProto {
                value: Some(type_proto::Value::TensorType(type_proto::Tensor {
                    elem_type: Some(tensor_proto::DataType::Float as i32),
                    shape: Some(TensorShapeProto {
                        dim: dims
                            .iter()
                            .map(|d| Dimension {
                                denotation: None,
                                value: Some(DimValue::DimValue(*d)),
                            })
                            .collect(),
                    }),
                })),
            }),
            doc_string: None,
        }
    }

    fn relu_model() -> ModelProto {
        ModelProto {
            ir_version: Some(onnx::Version::IrVersion202058 as i64),
            opset_import: vec![OperatorSetIdProto {
                domain: Some(String::new()),
                version: Some(12),
            }],
            graph: Some(GraphProto {
                name: Some("g".to_string()),
                node: vec![NodeProto {
                    name: Some("relu".to_string()),
                    op_type: Some("Relu".to_string()),
                    input: vec!["x".to_string()],
                    output: vec!["y".to_string()],
                    ..Default::default()
                }],
                input: vec![value_info("x", &[1, 4])],
                output: vec![value_info("y", &[1, 4])],
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_minimal_model_passes() {
        check_model(&relu_model()).unwrap();
    }

    #[test]
    fn test_operator_outside_opset_is_rejected() {
        let mut model = relu_model();
        model.graph.as_mut().unwrap().node[0].op_type = Some("HardSwish".to_string());
        let err = check_model(&model).unwrap_err();
        assert_eq!(err.to_string(), "Malformed graph: operator HardSwish is not in opset 12");
    }

    #[test]
    fn test_missing_opset_is_rejected() {
        let mut model = relu_model();
        model.opset_import.clear();
        assert!(matches!(check_model(&model), Err(VerifierError::Structure(_))));
    }

    #[test]
    fn test_initializer_size_must_match_dims() {
        let mut model = relu_model();
        model.graph.as_mut().unwrap().initializer.push(TensorProto {
            name: Some("w".to_string()),
            dims: vec![2, 2],
            data_type: Some(tensor_proto::DataType::Float as i32),
            raw_data: Some(vec![0; 12]),
            ..Default::default()
        });
        let err = check_model(&model).unwrap_err();
        assert!(err.to_string().contains("holds 12 bytes"), "{err}");
    }

    #[test]
    fn test_declared_output_shape_is_checked() {
        let mut model = relu_model();
        model.graph.as_mut().unwrap().output[0] = value_info("y", &[1, 5]);
        assert!(matches!(check_model(&model), Err(VerifierError::Shape(_))));
    }

    #[test]
    fn test_symbolic_dims_skip_inference() {
        let mut model = relu_model();
        let graph = model.graph.as_mut().unwrap();
        graph.output[0] = value_info("y", &[1, 5]);
        if let Some(type_proto::Value::TensorType(t)) =
            graph.input[0].r#type.as_mut().and_then(|t| t.value.as_mut())
        {
            t.shape.as_mut().unwrap().dim[0].value = Some(DimValue::DimParam("batch".to_string()));
        }
        check_model(&model).unwrap();
    }

    #[test]
    fn test_unset_dimension_is_rejected() {
        let mut model = relu_model();
        if let Some(type_proto::Value::TensorType(t)) =
            model.graph.as_mut().unwrap().input[0].r#type.as_mut().and_then(|t| t.value.as_mut())
        {
            t.shape.as_mut().unwrap().dim[1].value = None;
        }
        let err = check_model(&model).unwrap_err();
        assert!(err.to_string().contains("unset dimension"), "{err}");
    }
}
