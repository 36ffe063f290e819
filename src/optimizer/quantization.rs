use crate::ir::{DataType, ModelIR};
use crate::optimizer::{OptimizationPass, OptimizerError};

/// Lets a quantized graph take already-quantized `uint8` images: drops the
/// `QuantizeLinear` applied to the graph input and feeds the input straight
/// to its dequantize readers.
pub struct SkipInputQuantize;

impl OptimizationPass for SkipInputQuantize {
    fn name(&self) -> &'static str {
        "skip-input-quantize"
    }

    fn apply(&self, ir: &mut ModelIR) -> Result<(), OptimizerError> {
        let [input] = ir.inputs.as_slice() else {
            return Err(OptimizerError::PatternNotFound(format!(
                "expected a single graph input, found {}",
                ir.inputs.len()
            )));
        };
        let input_name = input.name.clone();

        let readers = ir.consumers(&input_name);
        let [quantize_idx] = readers.as_slice() else {
            return Err(OptimizerError::PatternNotFound(format!(
                "input {input_name} has {} readers, expected one QuantizeLinear",
                readers.len()
            )));
        };
        let quantize = &ir.nodes[*quantize_idx];
        if quantize.op_type != "QuantizeLinear" {
            return Err(OptimizerError::PatternNotFound(format!(
                "input {input_name} feeds {} instead of QuantizeLinear",
                quantize.op_type
            )));
        }
        let zero_point_type = quantize
            .inputs
            .get(2)
            .and_then(|zp| ir.weights.get(zp))
            .map(|zp| zp.data_type);
        if zero_point_type != Some(DataType::U8) {
            return Err(OptimizerError::PatternNotFound(format!(
                "input quantization of {input_name} is not uint8"
            )));
        }
        let quantized = quantize.outputs[0].clone();
        if ir.consumers(&quantized).iter().any(|&j| ir.nodes[j].op_type != "DequantizeLinear") {
            return Err(OptimizerError::PatternNotFound(format!(
                "quantized input {quantized} is read by a non-dequantize node"
            )));
        }

        ir.nodes.remove(*quantize_idx);
        ir.replace_uses(&quantized, &input_name);
        ir.inputs[0].data_type = DataType::U8;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Graph;
    use ndarray::{ArrayD, IxDyn};

    #[test]
    fn test_input_quantize_removed_and_input_retyped() {
        let mut g = Graph::tracing();
        let x = g.input("images", ArrayD::zeros(IxDyn(&[1, 3, 2, 2])));
        let scale = g.param("s", &ArrayD::from_elem(IxDyn(&[1]), 1.0 / 255.0));
        let y = g.fake_quantize(&x, &scale, ("zp", 0.0), false);
        let y = g.relu(&y);
        let mut ir = g.finish(&[&y]).unwrap();

        SkipInputQuantize.apply(&mut ir).unwrap();
        assert_eq!(ir.inputs[0].data_type, DataType::U8);
        assert_eq!(ir.nodes[0].op_type, "DequantizeLinear");
        assert_eq!(ir.nodes[0].inputs[0], "images");
    }

    #[test]
    fn test_float_input_graph_is_not_a_match() {
        let mut g = Graph::tracing();
        let x = g.input("images", ArrayD::zeros(IxDyn(&[1, 3, 2, 2])));
        let y = g.relu(&x);
        let mut ir = g.finish(&[&y]).unwrap();

        let err = SkipInputQuantize.apply(&mut ir).unwrap_err();
        assert!(matches!(err, OptimizerError::PatternNotFound(_)));
        assert_eq!(ir.inputs[0].data_type, DataType::F32);
    }
}
