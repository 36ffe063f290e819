use crate::ir::{Attribute, ModelIR, Tensor};
use crate::optimizer::{OptimizationPass, OptimizerError};
use ndarray::{ArrayD, Axis, IxDyn};

/// Folds an inference-mode `BatchNormalization` into the `Conv` feeding it:
/// `w' = w * s`, `b' = (b - mean) * s + beta` with `s = gamma / sqrt(var + eps)`.
/// Only applies when the conv output has no other reader and every
/// parameter is an initializer.
pub struct ConvBatchNormFusion;

fn initializer(ir: &ModelIR, name: &str) -> Option<ArrayD<f32>> {
    ir.weights.get(name)?.to_array()
}

impl OptimizationPass for ConvBatchNormFusion {
    fn name(&self) -> &'static str {
        "conv-batchnorm-fusion"
    }

    fn apply(&self, ir: &mut ModelIR) -> Result<(), OptimizerError> {
        let mut i = 0;
        while i < ir.nodes.len() {
            if ir.nodes[i].op_type != "Conv" {
                i += 1;
                continue;
            }
            let conv_output = ir.nodes[i].outputs[0].clone();
            let consumers = ir.consumers(&conv_output);
            let is_graph_output = ir.outputs.iter().any(|o| o.name == conv_output);
            let bn_idx = match consumers.as_slice() {
                [j] if !is_graph_output && ir.nodes[*j].op_type == "BatchNormalization" => *j,
                _ => {
                    i += 1;
                    continue;
                }
            };

            let conv = &ir.nodes[i];
            let bn = &ir.nodes[bn_idx];
            let params = (
                initializer(ir, &conv.inputs[1]),
                bn.inputs[1..].iter().map(|n| initializer(ir, n)).collect::<Option<Vec<_>>>(),
            );
            let (Some(weight), Some(bn_params)) = params else {
                i += 1;
                continue;
            };
            if bn_params.len() != 4 {
                return Err(OptimizerError::Error(format!("{}: expected 4 batch norm parameters", bn.name)));
            }
            let eps = match bn.attributes.get("epsilon") {
                Some(Attribute::Float(e)) => *e,
                _ => 1e-5,
            };
            let out_channels = weight.shape()[0];
            let bias = match conv.inputs.get(2) {
                Some(name) => initializer(ir, name)
                    .ok_or_else(|| OptimizerError::Error(format!("{}: conv bias is not constant", conv.name)))?,
                None => ArrayD::zeros(IxDyn(&[out_channels])),
            };

            let (gamma, beta, mean, var) = (&bn_params[0], &bn_params[1], &bn_params[2], &bn_params[3]);
            let scale = gamma / &var.mapv(|v| (v + eps).sqrt());
            let mut fused_weight = weight.clone();
            for (o, mut filter) in fused_weight.axis_iter_mut(Axis(0)).enumerate() {
                filter *= scale[[o]];
            }
            let fused_bias = (&bias - mean) * &scale + beta;

            let weight_name = format!("{}.fused_weight", conv.name);
            let bias_name = format!("{}.fused_bias", conv.name);
            let bn_output = bn.outputs[0].clone();
            ir.weights.insert(weight_name.clone(), Tensor::from_array(weight_name.clone(), &fused_weight));
            ir.weights.insert(bias_name.clone(), Tensor::from_array(bias_name.clone(), &fused_bias));

            let conv = &mut ir.nodes[i];
            conv.inputs.truncate(1);
            conv.inputs.push(weight_name);
            conv.inputs.push(bias_name);
            conv.outputs[0] = bn_output;
            ir.nodes.remove(bn_idx);
            if bn_idx < i {
                i -= 1;
            }
            i += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Graph;
    use approx::assert_abs_diff_eq;
    use ndarray::arr1;

    #[test]
    fn test_fused_conv_matches_conv_then_batch_norm() {
        let x = ArrayD::from_shape_fn(IxDyn(&[1, 2, 3, 3]), |i| (i[1] * 9 + i[2] * 3 + i[3]) as f32 * 0.1);
        let w = ArrayD::from_shape_fn(IxDyn(&[2, 2, 1, 1]), |i| (i[0] + 2 * i[1]) as f32 - 1.0);

        let mut g = Graph::tracing();
        let input = g.input("X", x.clone());
        let weight = g.param("w", &w);
        let y = g.conv2d(&input, &weight, None, 1, 0).unwrap();
        let gamma = g.param("gamma", &arr1(&[1.5f32, 0.5]).into_dyn());
        let beta = g.param("beta", &arr1(&[0.1f32, -0.2]).into_dyn());
        let mean = g.param("mean", &arr1(&[0.3f32, 0.0]).into_dyn());
        let var = g.param("var", &arr1(&[2.0f32, 0.25]).into_dyn());
        let expected = g.batch_norm(&y, &gamma, &beta, &mean, &var, 1e-3).unwrap();
        let mut ir = g.finish(&[&expected]).unwrap();

        ConvBatchNormFusion.apply(&mut ir).unwrap();
        assert_eq!(ir.nodes.len(), 1);
        assert_eq!(ir.nodes[0].outputs[0], expected.name);

        // replay the fused conv eagerly
        let fused_w = ir.weights[&ir.nodes[0].inputs[1]].to_array().unwrap();
        let fused_b = ir.weights[&ir.nodes[0].inputs[2]].to_array().unwrap();
        let mut g = Graph::eager();
        let input = g.input("X", x);
        let weight = g.param("w", &fused_w);
        let bias = g.param("b", &fused_b);
        let actual = g.conv2d(&input, &weight, Some(&bias), 1, 0).unwrap();
        for (a, e) in actual.data.iter().zip(expected.data.iter()) {
            assert_abs_diff_eq!(a, e, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_shared_conv_output_is_not_fused() {
        let mut g = Graph::tracing();
        let input = g.input("X", ArrayD::zeros(IxDyn(&[1, 1, 2, 2])));
        let weight = g.param("w", &ArrayD::from_elem(IxDyn(&[1, 1, 1, 1]), 1.0));
        let y = g.conv2d(&input, &weight, None, 1, 0).unwrap();
        let p = g.param("p", &arr1(&[1.0f32]).into_dyn());
        let bn = g.batch_norm(&y, &p, &p, &p, &p, 1e-3).unwrap();
        let side = g.relu(&y);
        let mut ir = g.finish(&[&bn, &side]).unwrap();

        ConvBatchNormFusion.apply(&mut ir).unwrap();
        assert_eq!(ir.nodes.len(), 3);
    }
}
