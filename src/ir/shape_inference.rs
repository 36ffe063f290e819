use crate::ir::{Attribute, ModelIR, Node};
use crate::optimizer::OptimizerError;
use std::collections::HashMap;

/// Static shape propagation over a graph whose input dims are all known.
pub struct ShapeInference;

fn ints(node: &Node, name: &str) -> Option<Vec<i64>> {
    match node.attributes.get(name) {
        Some(Attribute::Ints(v)) => Some(v.clone()),
        _ => None,
    }
}

fn int(node: &Node, name: &str, default: i64) -> i64 {
    match node.attributes.get(name) {
        Some(Attribute::Int(v)) => *v,
        _ => default,
    }
}

fn err(node: &Node, msg: impl std::fmt::Display) -> OptimizerError {
    OptimizerError::Error(format!("{} ({}): {msg}", node.name, node.op_type))
}

fn broadcast(node: &Node, a: &[usize], b: &[usize]) -> Result<Vec<usize>, OptimizerError> {
    let rank = a.len().max(b.len());
    let pad = |s: &[usize]| {
        let mut v = vec![1; rank - s.len()];
        v.extend_from_slice(s);
        v
    };
    let (a, b) = (pad(a), pad(b));
    a.iter()
        .zip(&b)
        .map(|(x, y)| match (x, y) {
            (x, y) if x == y => Ok(*x),
            (1, y) => Ok(*y),
            (x, 1) => Ok(*x),
            _ => Err(err(node, format!("cannot broadcast {a:?} with {b:?}"))),
        })
        .collect()
}

fn normalize_axis(node: &Node, axis: i64, rank: usize) -> Result<usize, OptimizerError> {
    let resolved = if axis < 0 { axis + rank as i64 } else { axis };
    if resolved < 0 || resolved >= rank as i64 {
        return Err(err(node, format!("axis {axis} out of range for rank {rank}")));
    }
    Ok(resolved as usize)
}

/// Output extent of a strided window over `size` with total padding `pad`.
fn window(node: &Node, size: usize, kernel: usize, stride: usize, pad: usize) -> Result<usize, OptimizerError> {
    if size + pad < kernel || stride == 0 {
        return Err(err(node, format!("window {kernel}/{stride} does not fit extent {size}")));
    }
    Ok((size + pad - kernel) / stride + 1)
}

impl ShapeInference {
    /// Shapes of every value: inputs, initializers and node outputs.
    pub fn infer(ir: &ModelIR) -> Result<HashMap<String, Vec<usize>>, OptimizerError> {
        let mut shapes: HashMap<String, Vec<usize>> = HashMap::new();
        for input in &ir.inputs {
            shapes.insert(input.name.clone(), input.shape.clone());
        }
        for (name, weight) in &ir.weights {
            shapes.insert(name.clone(), weight.shape.clone());
        }

        for node in &ir.nodes {
            let input = |i: usize| -> Result<&Vec<usize>, OptimizerError> {
                let name = node.inputs.get(i).ok_or_else(|| err(node, format!("missing input {i}")))?;
                shapes.get(name).ok_or_else(|| err(node, format!("shape of {name} unknown")))
            };
            let constant = |i: usize| -> Result<Vec<i64>, OptimizerError> {
                node.inputs
                    .get(i)
                    .and_then(|n| ir.weights.get(n))
                    .and_then(|t| t.to_i64_vec())
                    .ok_or_else(|| err(node, format!("input {i} must be an int64 initializer")))
            };

            let shape = match node.op_type.as_str() {
                "Relu" | "LeakyRelu" | "Sigmoid" | "HardSwish" | "SiLU" | "Clip" | "BatchNormalization"
                | "QuantizeLinear" | "DequantizeLinear" => input(0)?.clone(),
                "Add" | "Sub" | "Mul" | "Div" | "Pow" => broadcast(node, input(0)?, input(1)?)?,
                "Conv" => {
                    let (x, w) = (input(0)?, input(1)?);
                    if x.len() != 4 || w.len() != 4 {
                        return Err(err(node, "only 2-d convolution is supported"));
                    }
                    let group = int(node, "group", 1) as usize;
                    if w[1] * group != x[1] {
                        return Err(err(node, format!("weight {w:?} does not match input {x:?}")));
                    }
                    let strides = ints(node, "strides").unwrap_or_else(|| vec![1, 1]);
                    let pads = ints(node, "pads").unwrap_or_else(|| vec![0; 4]);
                    let dilations = ints(node, "dilations").unwrap_or_else(|| vec![1, 1]);
                    let mut out = vec![x[0], w[0]];
                    for d in 0..2 {
                        let kernel = (w[2 + d] - 1) * dilations[d] as usize + 1;
                        let pad = (pads[d] + pads[d + 2]) as usize;
                        out.push(window(node, x[2 + d], kernel, strides[d] as usize, pad)?);
                    }
                    out
                }
                "MaxPool" => {
                    let x = input(0)?;
                    let kernel = ints(node, "kernel_shape").ok_or_else(|| err(node, "missing kernel_shape"))?;
                    let strides = ints(node, "strides").unwrap_or_else(|| vec![1, 1]);
                    let pads = ints(node, "pads").unwrap_or_else(|| vec![0; 4]);
                    let mut out = x[..2].to_vec();
                    for d in 0..2 {
                        let pad = (pads[d] + pads[d + 2]) as usize;
                        out.push(window(node, x[2 + d], kernel[d] as usize, strides[d] as usize, pad)?);
                    }
                    out
                }
                "Concat" => {
                    let first = input(0)?.clone();
                    let axis = normalize_axis(node, int(node, "axis", 0), first.len())?;
                    let mut out = first;
                    for i in 1..node.inputs.len() {
                        let s = input(i)?;
                        let compatible = s.len() == out.len()
                            && s.iter().zip(&out).enumerate().all(|(d, (a, b))| d == axis || a == b);
                        if !compatible {
                            return Err(err(node, format!("cannot concatenate {s:?} onto {out:?}")));
                        }
                        out[axis] += s[axis];
                    }
                    out
                }
                "Resize" => {
                    let x = input(0)?;
                    let scales = node
                        .inputs
                        .get(2)
                        .and_then(|n| ir.weights.get(n))
                        .and_then(|t| t.to_f32_vec())
                        .ok_or_else(|| err(node, "scales must be a float initializer"))?;
                    if scales.len() != x.len() {
                        return Err(err(node, "one scale per dimension expected"));
                    }
                    x.iter().zip(&scales).map(|(d, s)| (*d as f32 * s).floor() as usize).collect()
                }
                "Reshape" => {
                    let x = input(0)?;
                    let target = constant(1)?;
                    let total: usize = x.iter().product();
                    let mut out: Vec<usize> = Vec::with_capacity(target.len());
                    let mut inferred = None;
                    for (i, d) in target.iter().enumerate() {
                        match *d {
                            -1 if inferred.is_none() => {
                                inferred = Some(i);
                                out.push(1);
                            }
                            0 => out.push(*x.get(i).ok_or_else(|| err(node, "0 dimension past input rank"))?),
                            d if d > 0 => out.push(d as usize),
                            d => return Err(err(node, format!("invalid target dimension {d}"))),
                        }
                    }
                    let known: usize = out.iter().product();
                    if let Some(i) = inferred {
                        if known == 0 || total % known != 0 {
                            return Err(err(node, format!("cannot reshape {x:?} into {target:?}")));
                        }
                        out[i] = total / known;
                    } else if known != total {
                        return Err(err(node, format!("cannot reshape {x:?} into {target:?}")));
                    }
                    out
                }
                "Transpose" => {
                    let x = input(0)?;
                    let perm = ints(node, "perm").unwrap_or_else(|| (0..x.len() as i64).rev().collect());
                    perm.iter()
                        .map(|p| x.get(*p as usize).copied().ok_or_else(|| err(node, "perm out of range")))
                        .collect::<Result<_, _>>()?
                }
                "Slice" => {
                    let mut out = input(0)?.clone();
                    let starts = constant(1)?;
                    let ends = constant(2)?;
                    let axes = if node.inputs.len() > 3 {
                        constant(3)?
                    } else {
                        (0..starts.len() as i64).collect()
                    };
                    let steps = if node.inputs.len() > 4 { constant(4)? } else { vec![1; starts.len()] };
                    for (k, axis) in axes.iter().enumerate() {
                        let axis = normalize_axis(node, *axis, out.len())?;
                        let dim = out[axis] as i64;
                        let clamp = |v: i64| if v < 0 { (v + dim).max(0) } else { v.min(dim) };
                        let (start, end) = (clamp(starts[k]), clamp(ends[k]));
                        if steps[k] != 1 {
                            return Err(err(node, "only unit slice steps are supported"));
                        }
                        out[axis] = (end - start).max(0) as usize;
                    }
                    out
                }
                other => return Err(err(node, format!("no shape rule for {other}"))),
            };

            for output in &node.outputs {
                shapes.insert(output.clone(), shape.clone());
            }
        }
        Ok(shapes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::tests::tiny_model;
    use crate::model::Graph;
    use ndarray::{ArrayD, IxDyn};

    #[test]
    fn test_inferred_shapes_match_eager_execution() {
        let mut g = Graph::tracing();
        let x = g.input("images", ArrayD::zeros(IxDyn(&[1, 2, 8, 8])));
        let w = g.param("w", &ArrayD::zeros(IxDyn(&[4, 2, 3, 3])));
        let c = g.conv2d(&x, &w, None, 2, 1).unwrap();
        let p = g.max_pool(&c, 2, 2, 0).unwrap();
        let u = g.resize_nearest(&p, 2).unwrap();
        let cat = g.concat(&[&u, &c], 1).unwrap();
        let r = g.reshape(&cat, &[-1, 2, 4, 4, 4]).unwrap();
        let t = g.transpose(&r, &[0, 1, 3, 4, 2]);
        let s = g.slice(&t, 4, 1, 100);
        let ir = g.finish(&[&s]).unwrap();

        let shapes = ShapeInference::infer(&ir).unwrap();
        for v in [&c, &p, &u, &cat, &r, &t, &s] {
            assert_eq!(shapes[&v.name], v.shape().to_vec(), "value {}", v.name);
        }
    }

    #[test]
    fn test_full_model_output_shape() {
        let model = tiny_model();
        let (ir, _) = model.trace(&ArrayD::zeros(IxDyn(&[2, 3, 64, 64]))).unwrap();
        let shapes = ShapeInference::infer(&ir).unwrap();
        assert_eq!(shapes[&ir.outputs[0].name], vec![2, 60, 8]);
    }

    #[test]
    fn test_incompatible_broadcast_is_an_error() {
        let mut g = Graph::tracing();
        let a = g.input("a", ArrayD::zeros(IxDyn(&[2, 3])));
        let b = g.param("b", &ArrayD::zeros(IxDyn(&[3])));
        let y = g.add(&a, &b);
        let mut ir = g.finish(&[&y]).unwrap();
        assert!(ShapeInference::infer(&ir).is_ok());

        ir.weights.get_mut("b").unwrap().shape = vec![4];
        assert!(ShapeInference::infer(&ir).is_err());
    }
}
