use std::collections::HashMap;

use ndarray::{ArrayD, IxDyn};
use serde::{Deserialize, Serialize};

pub mod shape_inference;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    F32,
    F16,
    I64,
    I8,
    U8,
}

impl DataType {
    pub fn size_in_bytes(self) -> usize {
        match self {
            DataType::F32 => 4,
            DataType::F16 => 2,
            DataType::I64 => 8,
            DataType::I8 | DataType::U8 => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    pub name: String,
    pub shape: Vec<usize>,
    pub data_type: DataType,
    pub data: Option<Vec<u8>>,
}

impl Tensor {
    /// A value placeholder carrying only a name and shape.
    pub fn value(name: impl Into<String>, shape: Vec<usize>) -> Self {
        Self {
            name: name.into(),
            shape,
            data_type: DataType::F32,
            data: None,
        }
    }

    pub fn from_array(name: impl Into<String>, array: &ArrayD<f32>) -> Self {
        let mut data = Vec::with_capacity(array.len() * 4);
        for v in array.iter() {
            data.extend_from_slice(&v.to_le_bytes());
        }
        Self {
            name: name.into(),
            shape: array.shape().to_vec(),
            data_type: DataType::F32,
            data: Some(data),
        }
    }

    pub fn from_i64(name: impl Into<String>, values: &[i64]) -> Self {
        let mut data = Vec::with_capacity(values.len() * 8);
        for v in values {
            data.extend_from_slice(&v.to_le_bytes());
        }
        Self {
            name: name.into(),
            shape: vec![values.len()],
            data_type: DataType::I64,
            data: Some(data),
        }
    }

    pub fn from_i8(name: impl Into<String>, shape: Vec<usize>, values: &[i8]) -> Self {
        Self {
            name: name.into(),
            shape,
            data_type: DataType::I8,
            data: Some(values.iter().map(|v| *v as u8).collect()),
        }
    }

    pub fn from_u8(name: impl Into<String>, shape: Vec<usize>, values: &[u8]) -> Self {
        Self {
            name: name.into(),
            shape,
            data_type: DataType::U8,
            data: Some(values.to_vec()),
        }
    }

    /// Decodes the payload as f32 values; `None` for other element types or
    /// a missing payload.
    pub fn to_f32_vec(&self) -> Option<Vec<f32>> {
        let data = self.data.as_ref()?;
        match self.data_type {
            DataType::F32 => Some(
                data.chunks_exact(4)
                    .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect(),
            ),
            DataType::F16 => Some(
                data.chunks_exact(2)
                    .map(|c| half::f16::from_le_bytes([c[0], c[1]]).to_f32())
                    .collect(),
            ),
            _ => None,
        }
    }

    pub fn to_i64_vec(&self) -> Option<Vec<i64>> {
        if self.data_type != DataType::I64 {
            return None;
        }
        let data = self.data.as_ref()?;
        Some(
            data.chunks_exact(8)
                .map(|c| i64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
                .collect(),
        )
    }

    pub fn to_array(&self) -> Option<ArrayD<f32>> {
        let values = self.to_f32_vec()?;
        ArrayD::from_shape_vec(IxDyn(&self.shape), values).ok()
    }

    /// Scalar read used for quantization parameters, regardless of element type.
    pub fn scalar(&self) -> Option<f32> {
        let data = self.data.as_ref()?;
        match self.data_type {
            DataType::I8 => data.first().map(|b| *b as i8 as f32),
            DataType::U8 => data.first().map(|b| *b as f32),
            DataType::I64 => self.to_i64_vec()?.first().map(|v| *v as f32),
            _ => self.to_f32_vec()?.first().copied(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    pub op_type: String,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub attributes: HashMap<String, Attribute>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Attribute {
    Float(f32),
    Int(i64),
    String(String),
    Floats(Vec<f32>),
    Ints(Vec<i64>),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelIR {
    pub nodes: Vec<Node>,
    pub weights: HashMap<String, Tensor>,
    pub inputs: Vec<Tensor>,
    pub outputs: Vec<Tensor>,
}

impl ModelIR {
    pub fn new() -> Self {
        Self::default()
    }

    /// Names of nodes that consume `value`.
    pub fn consumers(&self, value: &str) -> Vec<usize> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.inputs.iter().any(|i| i == value))
            .map(|(i, _)| i)
            .collect()
    }

    pub fn producer(&self, value: &str) -> Option<usize> {
        self.nodes
            .iter()
            .position(|n| n.outputs.iter().any(|o| o == value))
    }

    /// Renames every use of `from` (node inputs and graph outputs) to `to`.
    pub fn replace_uses(&mut self, from: &str, to: &str) {
        for node in &mut self.nodes {
            for input in &mut node.inputs {
                if input == from {
                    *input = to.to_string();
                }
            }
        }
        for output in &mut self.outputs {
            if output.name == from {
                output.name = to.to_string();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;

    #[test]
    fn test_tensor_array_roundtrip_preserves_bytes() {
        let a = arr2(&[[1.0f32, -2.5], [3.25, 0.0]]).into_dyn();
        let t = Tensor::from_array("w", &a);
        assert_eq!(t.shape, vec![2, 2]);
        assert_eq!(t.data.as_ref().unwrap().len(), 16);
        assert_eq!(t.to_array().unwrap(), a);
    }

    #[test]
    fn test_scalar_reads_signed_zero_point() {
        let t = Tensor::from_i8("zp", vec![], &[-3]);
        assert_eq!(t.scalar(), Some(-3.0));
    }

    #[test]
    fn test_replace_uses_updates_graph_outputs() {
        let mut ir = ModelIR::new();
        ir.nodes.push(Node {
            name: "relu".to_string(),
            op_type: "Relu".to_string(),
            inputs: vec!["X".to_string()],
            outputs: vec!["Y".to_string()],
            attributes: HashMap::new(),
        });
        ir.outputs.push(Tensor::value("X", vec![1]));
        ir.replace_uses("X", "Z");
        assert_eq!(ir.nodes[0].inputs[0], "Z");
        assert_eq!(ir.outputs[0].name, "Z");
    }
}
