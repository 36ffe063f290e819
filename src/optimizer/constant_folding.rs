use crate::ir::{DataType, ModelIR, Node, Tensor};
use crate::optimizer::{OptimizationPass, OptimizerError};

/// Evaluates nodes whose inputs are all initializers and replaces them with
/// the resulting initializer. `QuantizeLinear` folds into an int8/uint8
/// tensor typed after its zero point; `DequantizeLinear` is kept so the
/// graph stays quantized.
pub struct ConstantFolding;

impl ConstantFolding {
    fn fold(node: &Node, ir: &ModelIR) -> Result<Option<Tensor>, OptimizerError> {
        let inputs: Option<Vec<&Tensor>> = node.inputs.iter().map(|n| ir.weights.get(n)).collect();
        let Some(inputs) = inputs else {
            return Ok(None);
        };
        let output = node.outputs[0].clone();
        match node.op_type.as_str() {
            "QuantizeLinear" => quantize(&output, &inputs).map(Some),
            "Add" | "Sub" | "Mul" | "Div" => Ok(binary(&node.op_type, &output, &inputs)),
            _ => Ok(None),
        }
    }
}

fn quantize(output: &str, inputs: &[&Tensor]) -> Result<Tensor, OptimizerError> {
    let [x, scale, zero_point] = inputs else {
        return Err(OptimizerError::Error(format!("{output}: QuantizeLinear takes three inputs")));
    };
    let values = x
        .to_f32_vec()
        .ok_or_else(|| OptimizerError::Error(format!("{output}: cannot quantize {:?}", x.data_type)))?;
    let scale = scale
        .scalar()
        .filter(|s| *s > 0.0)
        .ok_or_else(|| OptimizerError::Error(format!("{output}: scale must be a positive scalar")))?;
    let zp = zero_point
        .scalar()
        .ok_or_else(|| OptimizerError::Error(format!("{output}: missing zero point")))?;

    let q = |v: &f32, lo: f32, hi: f32| ((v / scale).round_ties_even() + zp).clamp(lo, hi);
    Ok(match zero_point.data_type {
        DataType::I8 => {
            let data: Vec<i8> = values.iter().map(|v| q(v, -128.0, 127.0) as i8).collect();
            Tensor::from_i8(output, x.shape.clone(), &data)
        }
        DataType::U8 => {
            let data: Vec<u8> = values.iter().map(|v| q(v, 0.0, 255.0) as u8).collect();
            Tensor::from_u8(output, x.shape.clone(), &data)
        }
        other => {
            return Err(OptimizerError::Error(format!("{output}: zero point must be int8 or uint8, got {other:?}")));
        }
    })
}

/// Same-shape or scalar-broadcast float arithmetic.
fn binary(op: &str, output: &str, inputs: &[&Tensor]) -> Option<Tensor> {
    let [a, b] = inputs else {
        return None;
    };
    let (av, bv) = (a.to_f32_vec()?, b.to_f32_vec()?);
    let f = |x: f32, y: f32| match op {
        "Add" => x + y,
        "Sub" => x - y,
        "Mul" => x * y,
        _ => x / y,
    };
    let (shape, data): (Vec<usize>, Vec<f32>) = if a.shape == b.shape {
        (a.shape.clone(), av.iter().zip(&bv).map(|(x, y)| f(*x, *y)).collect())
    } else if bv.len() == 1 {
        (a.shape.clone(), av.iter().map(|x| f(*x, bv[0])).collect())
    } else if av.len() == 1 {
        (b.shape.clone(), bv.iter().map(|y| f(av[0], *y)).collect())
    } else {
        return None;
    };
    let array = ndarray::ArrayD::from_shape_vec(ndarray::IxDyn(&shape), data).ok()?;
    Some(Tensor::from_array(output, &array))
}

impl OptimizationPass for ConstantFolding {
    fn name(&self) -> &'static str {
        "constant-folding"
    }

    fn apply(&self, ir: &mut ModelIR) -> Result<(), OptimizerError> {
        let mut i = 0;
        while i < ir.nodes.len() {
            match Self::fold(&ir.nodes[i], ir)? {
                Some(tensor) => {
                    ir.weights.insert(tensor.name.clone(), tensor);
                    ir.nodes.remove(i);
                }
                None => i += 1,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Graph;
    use ndarray::{arr1, ArrayD, IxDyn};
    use std::collections::HashMap;

    #[test]
    fn test_weight_quantize_folds_to_int8() {
        let mut g = Graph::tracing();
        let w = g.param("w", &arr1(&[0.26f32, -1.0, 100.0]).into_dyn());
        let scale = g.param("w.scale", &ArrayD::from_elem(IxDyn(&[1]), 0.5));
        let y = g.fake_quantize(&w, &scale, ("w.zp", 0.0), true);
        let mut ir = g.finish(&[&y]).unwrap();

        ConstantFolding.apply(&mut ir).unwrap();
        let ops: Vec<_> = ir.nodes.iter().map(|n| n.op_type.as_str()).collect();
        assert_eq!(ops, vec!["DequantizeLinear"]);
        let folded = &ir.weights[&ir.nodes[0].inputs[0]];
        assert_eq!(folded.data_type, DataType::I8);
        assert_eq!(folded.data.as_deref(), Some(&[1u8, (-2i8) as u8, 127][..]));
    }

    #[test]
    fn test_activation_quantize_is_left_alone() {
        let mut g = Graph::tracing();
        let x = g.input("images", ArrayD::zeros(IxDyn(&[1, 3])));
        let scale = g.param("s", &ArrayD::from_elem(IxDyn(&[1]), 0.1));
        let y = g.fake_quantize(&x, &scale, ("zp", 128.0), false);
        let mut ir = g.finish(&[&y]).unwrap();

        ConstantFolding.apply(&mut ir).unwrap();
        assert_eq!(ir.nodes.len(), 2);
    }

    #[test]
    fn test_scalar_broadcast_arithmetic() {
        let mut ir = ModelIR::new();
        ir.weights.insert("a".to_string(), Tensor::from_array("a", &arr1(&[1.0f32, 2.0]).into_dyn()));
        ir.weights.insert("b".to_string(), Tensor::from_array("b", &ArrayD::from_elem(IxDyn(&[]), 3.0)));
        ir.nodes.push(Node {
            name: "mul".to_string(),
            op_type: "Mul".to_string(),
            inputs: vec!["a".to_string(), "b".to_string()],
            outputs: vec!["c".to_string()],
            attributes: HashMap::new(),
        });

        ConstantFolding.apply(&mut ir).unwrap();
        assert!(ir.nodes.is_empty());
        assert_eq!(ir.weights["c"].to_f32_vec().unwrap(), vec![3.0, 6.0]);
    }
}
