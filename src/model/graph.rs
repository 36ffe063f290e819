use std::collections::HashMap;

use ndarray::{concatenate, Array2, ArrayD, ArrayView4, Axis, Ix4, IxDyn, Slice};

use super::ModelError;
use crate::ir::{Attribute, ModelIR, Node, Tensor};

/// A value flowing through the network: its graph name and its eager data.
#[derive(Debug, Clone)]
pub struct Var {
    pub name: String,
    pub data: ArrayD<f32>,
}

impl Var {
    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }
}

/// Executes network ops eagerly and, when tracing, records each op into a
/// `ModelIR` so the run can be replayed by a serializer.
#[derive(Debug, Default)]
pub struct Graph {
    recording: Option<ModelIR>,
    next_id: usize,
}

impl Graph {
    pub fn eager() -> Self {
        Self::default()
    }

    pub fn tracing() -> Self {
        Self {
            recording: Some(ModelIR::new()),
            next_id: 0,
        }
    }

    /// Closes the recording, declaring `outputs` as graph outputs. Returns
    /// `None` for an eager graph.
    pub fn finish(self, outputs: &[&Var]) -> Option<ModelIR> {
        let mut ir = self.recording?;
        ir.outputs = outputs
            .iter()
            .map(|v| Tensor::value(v.name.clone(), v.shape().to_vec()))
            .collect();
        Some(ir)
    }

    fn next(&mut self) -> usize {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn input(&mut self, name: &str, data: ArrayD<f32>) -> Var {
        if let Some(ir) = self.recording.as_mut() {
            ir.inputs.push(Tensor::value(name, data.shape().to_vec()));
        }
        Var {
            name: name.to_string(),
            data,
        }
    }

    pub fn param(&mut self, name: &str, data: &ArrayD<f32>) -> Var {
        if let Some(ir) = self.recording.as_mut() {
            ir.weights
                .entry(name.to_string())
                .or_insert_with(|| Tensor::from_array(name, data));
        }
        Var {
            name: name.to_string(),
            data: data.clone(),
        }
    }

    pub fn constant(&mut self, data: ArrayD<f32>) -> Var {
        let name = format!("const_{}", self.next());
        if let Some(ir) = self.recording.as_mut() {
            ir.weights
                .insert(name.clone(), Tensor::from_array(name.clone(), &data));
        }
        Var { name, data }
    }

    pub fn scalar(&mut self, value: f32) -> Var {
        self.constant(ArrayD::from_elem(IxDyn(&[]), value))
    }

    fn record_tensor(&mut self, tensor: Tensor) -> String {
        let name = tensor.name.clone();
        if let Some(ir) = self.recording.as_mut() {
            ir.weights.entry(name.clone()).or_insert(tensor);
        }
        name
    }

    fn i64_constant(&mut self, values: &[i64]) -> String {
        let name = format!("const_{}", self.next());
        self.record_tensor(Tensor::from_i64(name, values))
    }

    fn emit(
        &mut self,
        op: &str,
        inputs: Vec<String>,
        attributes: HashMap<String, Attribute>,
        data: ArrayD<f32>,
    ) -> Var {
        let id = self.next();
        let output = id.to_string();
        if let Some(ir) = self.recording.as_mut() {
            ir.nodes.push(Node {
                name: format!("{op}_{id}"),
                op_type: op.to_string(),
                inputs,
                outputs: vec![output.clone()],
                attributes,
            });
        }
        Var { name: output, data }
    }

    pub fn conv2d(
        &mut self,
        x: &Var,
        weight: &Var,
        bias: Option<&Var>,
        stride: usize,
        pad: usize,
    ) -> Result<Var, ModelError> {
        let k = weight.shape()[2];
        let mut data = conv2d_eager(&x.data, &weight.data, stride, pad)?;
        if let Some(b) = bias {
            let out_c = b.data.len();
            let b4 = b
                .data
                .to_shape(IxDyn(&[1, out_c, 1, 1]))
                .map_err(|e| ModelError::Shape(e.to_string()))?;
            data = &data + &b4;
        }
        let mut inputs = vec![x.name.clone(), weight.name.clone()];
        if let Some(b) = bias {
            inputs.push(b.name.clone());
        }
        let attrs = HashMap::from([
            ("kernel_shape".to_string(), Attribute::Ints(vec![k as i64, k as i64])),
            ("strides".to_string(), Attribute::Ints(vec![stride as i64; 2])),
            ("pads".to_string(), Attribute::Ints(vec![pad as i64; 4])),
            ("dilations".to_string(), Attribute::Ints(vec![1, 1])),
            ("group".to_string(), Attribute::Int(1)),
        ]);
        Ok(self.emit("Conv", inputs, attrs, data))
    }

    pub fn batch_norm(
        &mut self,
        x: &Var,
        gamma: &Var,
        beta: &Var,
        mean: &Var,
        var: &Var,
        eps: f32,
    ) -> Result<Var, ModelError> {
        let c = gamma.data.len();
        let per_channel = |a: &ArrayD<f32>| {
            a.to_shape(IxDyn(&[1, c, 1, 1]))
                .map(|v| v.to_owned())
                .map_err(|e| ModelError::Shape(e.to_string()))
        };
        let scale = per_channel(&(&gamma.data / &var.data.mapv(|v| (v + eps).sqrt())))?;
        let shift = per_channel(&beta.data)? - &(per_channel(&mean.data)? * &scale);
        let data = &x.data * &scale + &shift;
        let inputs = vec![
            x.name.clone(),
            gamma.name.clone(),
            beta.name.clone(),
            mean.name.clone(),
            var.name.clone(),
        ];
        let attrs = HashMap::from([("epsilon".to_string(), Attribute::Float(eps))]);
        Ok(self.emit("BatchNormalization", inputs, attrs, data))
    }

    fn unary(&mut self, op: &str, x: &Var, attrs: HashMap<String, Attribute>, f: impl Fn(f32) -> f32) -> Var {
        let data = x.data.mapv(f);
        self.emit(op, vec![x.name.clone()], attrs, data)
    }

    pub fn relu(&mut self, x: &Var) -> Var {
        self.unary("Relu", x, HashMap::new(), |v| v.max(0.0))
    }

    pub fn leaky_relu(&mut self, x: &Var, alpha: f32) -> Var {
        let attrs = HashMap::from([("alpha".to_string(), Attribute::Float(alpha))]);
        self.unary("LeakyRelu", x, attrs, move |v| if v >= 0.0 { v } else { v * alpha })
    }

    pub fn sigmoid(&mut self, x: &Var) -> Var {
        self.unary("Sigmoid", x, HashMap::new(), sigmoid)
    }

    /// Fused reference kernel; records a single `HardSwish` op.
    pub fn hard_swish(&mut self, x: &Var) -> Var {
        self.unary("HardSwish", x, HashMap::new(), |v| v * (v + 3.0).clamp(0.0, 6.0) / 6.0)
    }

    /// Fused reference kernel; records a single `SiLU` op.
    pub fn silu(&mut self, x: &Var) -> Var {
        self.unary("SiLU", x, HashMap::new(), |v| v * sigmoid(v))
    }

    fn binary(&mut self, op: &str, a: &Var, b: &Var, data: ArrayD<f32>) -> Var {
        self.emit(op, vec![a.name.clone(), b.name.clone()], HashMap::new(), data)
    }

    pub fn add(&mut self, a: &Var, b: &Var) -> Var {
        let data = &a.data + &b.data;
        self.binary("Add", a, b, data)
    }

    pub fn sub(&mut self, a: &Var, b: &Var) -> Var {
        let data = &a.data - &b.data;
        self.binary("Sub", a, b, data)
    }

    pub fn mul(&mut self, a: &Var, b: &Var) -> Var {
        let data = &a.data * &b.data;
        self.binary("Mul", a, b, data)
    }

    pub fn div(&mut self, a: &Var, b: &Var) -> Var {
        let data = &a.data / &b.data;
        self.binary("Div", a, b, data)
    }

    pub fn pow(&mut self, a: &Var, b: &Var) -> Var {
        let exponent = b.data.first().copied().unwrap_or(1.0);
        let data = a.data.mapv(|v| v.powf(exponent));
        self.binary("Pow", a, b, data)
    }

    pub fn clip(&mut self, x: &Var, min: f32, max: f32) -> Var {
        let lo = self.scalar(min);
        let hi = self.scalar(max);
        let data = x.data.mapv(|v| v.clamp(min, max));
        self.emit(
            "Clip",
            vec![x.name.clone(), lo.name, hi.name],
            HashMap::new(),
            data,
        )
    }

    pub fn concat(&mut self, xs: &[&Var], axis: usize) -> Result<Var, ModelError> {
        let views: Vec<_> = xs.iter().map(|v| v.data.view()).collect();
        let data = concatenate(Axis(axis), &views).map_err(|e| ModelError::Shape(e.to_string()))?;
        let attrs = HashMap::from([("axis".to_string(), Attribute::Int(axis as i64))]);
        let inputs = xs.iter().map(|v| v.name.clone()).collect();
        Ok(self.emit("Concat", inputs, attrs, data))
    }

    pub fn max_pool(&mut self, x: &Var, kernel: usize, stride: usize, pad: usize) -> Result<Var, ModelError> {
        let data = max_pool_eager(&x.data, kernel, stride, pad)?;
        let attrs = HashMap::from([
            ("kernel_shape".to_string(), Attribute::Ints(vec![kernel as i64; 2])),
            ("strides".to_string(), Attribute::Ints(vec![stride as i64; 2])),
            ("pads".to_string(), Attribute::Ints(vec![pad as i64; 4])),
        ]);
        Ok(self.emit("MaxPool", vec![x.name.clone()], attrs, data))
    }

    pub fn resize_nearest(&mut self, x: &Var, scale: usize) -> Result<Var, ModelError> {
        let input = as_4d(&x.data)?;
        let (n, c, h, w) = input.dim();
        let data = ArrayD::from_shape_fn(IxDyn(&[n, c, h * scale, w * scale]), |idx| {
            input[[idx[0], idx[1], idx[2] / scale, idx[3] / scale]]
        });
        let roi = self.constant(ArrayD::zeros(IxDyn(&[0])));
        let scales = self.constant(
            ArrayD::from_shape_vec(IxDyn(&[4]), vec![1.0, 1.0, scale as f32, scale as f32])
                .map_err(|e| ModelError::Shape(e.to_string()))?,
        );
        let attrs = HashMap::from([
            ("mode".to_string(), Attribute::String("nearest".to_string())),
            (
                "coordinate_transformation_mode".to_string(),
                Attribute::String("asymmetric".to_string()),
            ),
            ("nearest_mode".to_string(), Attribute::String("floor".to_string())),
        ]);
        Ok(self.emit(
            "Resize",
            vec![x.name.clone(), roi.name, scales.name],
            attrs,
            data,
        ))
    }

    /// Reshape with ONNX semantics for a single `-1` dimension.
    pub fn reshape(&mut self, x: &Var, shape: &[i64]) -> Result<Var, ModelError> {
        let resolved = resolve_shape(x.data.len(), shape)?;
        let data = ArrayD::from_shape_vec(IxDyn(&resolved), x.data.iter().copied().collect())
            .map_err(|e| ModelError::Shape(e.to_string()))?;
        let target = self.i64_constant(shape);
        Ok(self.emit("Reshape", vec![x.name.clone(), target], HashMap::new(), data))
    }

    pub fn transpose(&mut self, x: &Var, perm: &[usize]) -> Var {
        let data = x
            .data
            .view()
            .permuted_axes(IxDyn(perm))
            .as_standard_layout()
            .into_owned();
        let attrs = HashMap::from([(
            "perm".to_string(),
            Attribute::Ints(perm.iter().map(|p| *p as i64).collect()),
        )]);
        self.emit("Transpose", vec![x.name.clone()], attrs, data)
    }

    /// Slices `[start, end)` along `axis`; `end` past the dimension clamps.
    pub fn slice(&mut self, x: &Var, axis: usize, start: usize, end: usize) -> Var {
        let dim = x.shape()[axis];
        let data = x
            .data
            .slice_axis(Axis(axis), Slice::from(start.min(dim)..end.min(dim)))
            .to_owned();
        let starts = self.i64_constant(&[start as i64]);
        let ends = self.i64_constant(&[end.min(i64::MAX as usize) as i64]);
        let axes = self.i64_constant(&[axis as i64]);
        self.emit(
            "Slice",
            vec![x.name.clone(), starts, ends, axes],
            HashMap::new(),
            data,
        )
    }

    /// Quantize-dequantize with a per-tensor scale and zero point. Signed
    /// quantization targets int8, unsigned targets uint8.
    pub fn fake_quantize(
        &mut self,
        x: &Var,
        scale: &Var,
        zero_point: (&str, f32),
        signed: bool,
    ) -> Var {
        let s = scale.data.first().copied().unwrap_or(1.0);
        let (zp_name, zp) = zero_point;
        let (lo, hi) = if signed { (-128.0, 127.0) } else { (0.0, 255.0) };
        let zp_tensor = if signed {
            Tensor::from_i8(zp_name, vec![], &[zp as i8])
        } else {
            Tensor::from_u8(zp_name, vec![], &[zp as u8])
        };
        let zp_name = self.record_tensor(zp_tensor);

        let q = x
            .data
            .mapv(|v| ((v / s).round_ties_even() + zp).clamp(lo, hi));
        let q = self.emit(
            "QuantizeLinear",
            vec![x.name.clone(), scale.name.clone(), zp_name.clone()],
            HashMap::new(),
            q,
        );
        let data = q.data.mapv(|v| (v - zp) * s);
        self.emit(
            "DequantizeLinear",
            vec![q.name.clone(), scale.name.clone(), zp_name],
            HashMap::new(),
            data,
        )
    }
}

pub fn sigmoid(v: f32) -> f32 {
    1.0 / (1.0 + (-v).exp())
}

fn as_4d(x: &ArrayD<f32>) -> Result<ArrayView4<'_, f32>, ModelError> {
    x.view()
        .into_dimensionality::<Ix4>()
        .map_err(|_| ModelError::Shape(format!("expected a 4-d tensor, got {:?}", x.shape())))
}

fn resolve_shape(len: usize, shape: &[i64]) -> Result<Vec<usize>, ModelError> {
    let known: i64 = shape.iter().filter(|d| **d != -1).product();
    let mut resolved = Vec::with_capacity(shape.len());
    for &d in shape {
        if d == -1 {
            if known == 0 || len as i64 % known != 0 {
                return Err(ModelError::Shape(format!("cannot reshape {len} elements into {shape:?}")));
            }
            resolved.push((len as i64 / known) as usize);
        } else if d < 0 {
            return Err(ModelError::Shape(format!("invalid dimension {d} in {shape:?}")));
        } else {
            resolved.push(d as usize);
        }
    }
    if resolved.iter().product::<usize>() != len {
        return Err(ModelError::Shape(format!("cannot reshape {len} elements into {shape:?}")));
    }
    Ok(resolved)
}

fn conv2d_eager(x: &ArrayD<f32>, w: &ArrayD<f32>, stride: usize, pad: usize) -> Result<ArrayD<f32>, ModelError> {
    let input = as_4d(x)?;
    let weight = as_4d(w)?;
    let (n, c, h, width) = input.dim();
    let (o, wc, k, k2) = weight.dim();
    if wc != c || k != k2 {
        return Err(ModelError::Shape(format!(
            "conv weight {:?} does not match input {:?}",
            w.shape(),
            x.shape()
        )));
    }
    if h + 2 * pad < k || width + 2 * pad < k || stride == 0 {
        return Err(ModelError::Shape(format!("input {:?} smaller than kernel {k}", x.shape())));
    }
    let oh = (h + 2 * pad - k) / stride + 1;
    let ow = (width + 2 * pad - k) / stride + 1;

    let wmat = Array2::from_shape_vec((o, c * k * k), weight.iter().copied().collect())
        .map_err(|e| ModelError::Shape(e.to_string()))?;
    let mut out = Vec::with_capacity(n * o * oh * ow);
    for b in 0..n {
        let mut cols = Array2::<f32>::zeros((c * k * k, oh * ow));
        for ci in 0..c {
            for ki in 0..k {
                for kj in 0..k {
                    let row = (ci * k + ki) * k + kj;
                    for oy in 0..oh {
                        let iy = (oy * stride + ki) as isize - pad as isize;
                        if iy < 0 || iy >= h as isize {
                            continue;
                        }
                        for ox in 0..ow {
                            let ix = (ox * stride + kj) as isize - pad as isize;
                            if ix < 0 || ix >= width as isize {
                                continue;
                            }
                            cols[[row, oy * ow + ox]] = input[[b, ci, iy as usize, ix as usize]];
                        }
                    }
                }
            }
        }
        out.extend(wmat.dot(&cols).iter().copied());
    }
    ArrayD::from_shape_vec(IxDyn(&[n, o, oh, ow]), out).map_err(|e| ModelError::Shape(e.to_string()))
}

fn max_pool_eager(x: &ArrayD<f32>, kernel: usize, stride: usize, pad: usize) -> Result<ArrayD<f32>, ModelError> {
    let input = as_4d(x)?;
    let (n, c, h, w) = input.dim();
    if h + 2 * pad < kernel || w + 2 * pad < kernel || stride == 0 {
        return Err(ModelError::Shape(format!("input {:?} smaller than pool {kernel}", x.shape())));
    }
    let oh = (h + 2 * pad - kernel) / stride + 1;
    let ow = (w + 2 * pad - kernel) / stride + 1;
    Ok(ArrayD::from_shape_fn(IxDyn(&[n, c, oh, ow]), |idx| {
        let mut best = f32::NEG_INFINITY;
        for ki in 0..kernel {
            let iy = (idx[2] * stride + ki) as isize - pad as isize;
            if iy < 0 || iy >= h as isize {
                continue;
            }
            for kj in 0..kernel {
                let ix = (idx[3] * stride + kj) as isize - pad as isize;
                if ix < 0 || ix >= w as isize {
                    continue;
                }
                best = best.max(input[[idx[0], idx[1], iy as usize, ix as usize]]);
            }
        }
        best
    }))
}
