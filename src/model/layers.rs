use std::collections::BTreeSet;

use ndarray::{ArrayD, IxDyn};

use super::graph::{Graph, Var};
use super::ModelError;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Activation {
    Identity,
    ReLU,
    LeakyReLU(f32),
    /// Reference hard-swish kernel, serialized as a single fused op.
    Hardswish,
    /// Reference sigmoid-linear-unit kernel, serialized as a single fused op.
    SiLU,
    /// `x * clip(x + 3, 0, 6) / 6` built from elementary ops.
    ExportHardswish,
    /// `x * sigmoid(x)` built from elementary ops.
    ExportSiLU,
}

impl Activation {
    pub fn forward(&self, g: &mut Graph, x: &Var) -> Var {
        match self {
            Activation::Identity => x.clone(),
            Activation::ReLU => g.relu(x),
            Activation::LeakyReLU(alpha) => g.leaky_relu(x, *alpha),
            Activation::Hardswish => g.hard_swish(x),
            Activation::SiLU => g.silu(x),
            Activation::ExportHardswish => {
                let three = g.scalar(3.0);
                let six = g.scalar(6.0);
                let shifted = g.add(x, &three);
                let gate = g.clip(&shifted, 0.0, 6.0);
                let y = g.mul(x, &gate);
                g.div(&y, &six)
            }
            Activation::ExportSiLU => {
                let gate = g.sigmoid(x);
                g.mul(x, &gate)
            }
        }
    }

    /// The closed-form export equivalent, if this is a reference kernel.
    pub fn export_equivalent(&self) -> Option<Activation> {
        match self {
            Activation::Hardswish => Some(Activation::ExportHardswish),
            Activation::SiLU => Some(Activation::ExportSiLU),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BatchNorm {
    pub weight: ArrayD<f32>,
    pub bias: ArrayD<f32>,
    pub running_mean: ArrayD<f32>,
    pub running_var: ArrayD<f32>,
    pub eps: f32,
}

impl BatchNorm {
    pub fn new(channels: usize) -> Self {
        Self {
            weight: ArrayD::ones(IxDyn(&[channels])),
            bias: ArrayD::zeros(IxDyn(&[channels])),
            running_mean: ArrayD::zeros(IxDyn(&[channels])),
            running_var: ArrayD::ones(IxDyn(&[channels])),
            eps: 1e-3,
        }
    }
}

/// Per-tensor fake-quantization observers attached by a quantization recipe.
#[derive(Debug, Clone)]
pub struct FakeQuant {
    pub weight_scale: ArrayD<f32>,
    pub weight_zero_point: ArrayD<f32>,
    pub act_scale: ArrayD<f32>,
    pub act_zero_point: ArrayD<f32>,
}

impl Default for FakeQuant {
    fn default() -> Self {
        Self {
            weight_scale: ArrayD::ones(IxDyn(&[1])),
            weight_zero_point: ArrayD::zeros(IxDyn(&[1])),
            act_scale: ArrayD::ones(IxDyn(&[1])),
            act_zero_point: ArrayD::zeros(IxDyn(&[1])),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Conv {
    pub c1: usize,
    pub c2: usize,
    pub kernel: usize,
    pub stride: usize,
    pub pad: usize,
    pub weight: ArrayD<f32>,
    pub bn: BatchNorm,
    pub act: Box<Module>,
    pub quant: Option<FakeQuant>,
}

impl Conv {
    pub fn new(c1: usize, c2: usize, kernel: usize, stride: usize, act: Activation) -> Self {
        Self {
            c1,
            c2,
            kernel,
            stride,
            pad: kernel / 2,
            weight: ArrayD::zeros(IxDyn(&[c2, c1, kernel, kernel])),
            bn: BatchNorm::new(c2),
            act: Box::new(Module::new(ModuleKind::Act(act))),
            quant: None,
        }
    }

    fn forward(&self, g: &mut Graph, prefix: &str, x: &Var) -> Result<Var, ModelError> {
        let mut input = x.clone();
        let mut weight = g.param(&format!("{prefix}.conv.weight"), &self.weight);
        if let Some(q) = &self.quant {
            let act_scale = g.param(&format!("{prefix}.conv.activation_post_process.scale"), &q.act_scale);
            let act_zp = format!("{prefix}.conv.activation_post_process.zero_point");
            input = g.fake_quantize(&input, &act_scale, (&act_zp, first(&q.act_zero_point)), false);
            let w_scale = g.param(&format!("{prefix}.conv.weight_fake_quant.scale"), &q.weight_scale);
            let w_zp = format!("{prefix}.conv.weight_fake_quant.zero_point");
            weight = g.fake_quantize(&weight, &w_scale, (&w_zp, first(&q.weight_zero_point)), true);
        }
        let y = g.conv2d(&input, &weight, None, self.stride, self.pad)?;
        let gamma = g.param(&format!("{prefix}.bn.weight"), &self.bn.weight);
        let beta = g.param(&format!("{prefix}.bn.bias"), &self.bn.bias);
        let mean = g.param(&format!("{prefix}.bn.running_mean"), &self.bn.running_mean);
        let var = g.param(&format!("{prefix}.bn.running_var"), &self.bn.running_var);
        let y = g.batch_norm(&y, &gamma, &beta, &mean, &var, self.bn.eps)?;
        self.act.forward(g, &format!("{prefix}.act"), &[y])
    }
}

fn first(a: &ArrayD<f32>) -> f32 {
    a.first().copied().unwrap_or(0.0)
}

#[derive(Debug, Clone)]
pub struct Bottleneck {
    pub cv1: Box<Module>,
    pub cv2: Box<Module>,
    pub shortcut: bool,
}

/// 1x1 prediction convolution of a detection level.
#[derive(Debug, Clone)]
pub struct HeadConv {
    pub weight: ArrayD<f32>,
    pub bias: ArrayD<f32>,
}

#[derive(Debug, Clone)]
pub struct Detect {
    pub nc: usize,
    pub na: usize,
    pub stride: Vec<f32>,
    /// Anchors in grid units, `[nl, na, 2]`.
    pub anchors: ArrayD<f32>,
    /// Anchors in pixels, `[nl, 1, na, 1, 1, 2]`.
    pub anchor_grid: ArrayD<f32>,
    pub m: Vec<HeadConv>,
    /// Emit raw per-anchor tensors instead of decoded boxes.
    pub emit_grid: bool,
    pub split_outputs: bool,
}

impl Detect {
    pub fn new(nc: usize, anchors: &[Vec<f32>], channels: &[usize], stride: &[f32]) -> Result<Self, ModelError> {
        let nl = anchors.len();
        if nl == 0 || nl != channels.len() || nl != stride.len() {
            return Err(ModelError::Config(format!(
                "Detect needs one anchor set per input, got {nl} anchor sets for {} inputs",
                channels.len()
            )));
        }
        let na = anchors[0].len() / 2;
        if na == 0 || anchors.iter().any(|a| a.len() != na * 2) {
            return Err(ModelError::Config("anchor sets must hold the same number of pairs".to_string()));
        }
        let no = nc + 5;
        let pixels: Vec<f32> = anchors.iter().flatten().copied().collect();
        let anchor_grid = ArrayD::from_shape_vec(IxDyn(&[nl, 1, na, 1, 1, 2]), pixels.clone())
            .map_err(|e| ModelError::Shape(e.to_string()))?;
        let anchors = ArrayD::from_shape_fn(IxDyn(&[nl, na, 2]), |i| {
            pixels[(i[0] * na + i[1]) * 2 + i[2]] / stride[i[0]]
        });
        let m = channels
            .iter()
            .map(|&c| HeadConv {
                weight: ArrayD::zeros(IxDyn(&[na * no, c, 1, 1])),
                bias: ArrayD::zeros(IxDyn(&[na * no])),
            })
            .collect();
        Ok(Self {
            nc,
            na,
            stride: stride.to_vec(),
            anchors,
            anchor_grid,
            m,
            emit_grid: false,
            split_outputs: false,
        })
    }

    pub fn no(&self) -> usize {
        self.nc + 5
    }

    pub fn forward(&self, g: &mut Graph, prefix: &str, xs: &[Var]) -> Result<DetectOutput, ModelError> {
        let (na, no) = (self.na as i64, self.no() as i64);
        let mut levels = Vec::with_capacity(xs.len());
        for (i, x) in xs.iter().enumerate() {
            let head = &self.m[i];
            let w = g.param(&format!("{prefix}.m.{i}.weight"), &head.weight);
            let b = g.param(&format!("{prefix}.m.{i}.bias"), &head.bias);
            let y = g.conv2d(x, &w, Some(&b), 1, 0)?;
            let (ny, nx) = (y.shape()[2] as i64, y.shape()[3] as i64);
            let y = g.reshape(&y, &[-1, na, no, ny, nx])?;
            let y = g.transpose(&y, &[0, 1, 3, 4, 2]);
            let y = if self.emit_grid { y } else { self.decode(g, i, &y)? };
            levels.push(g.reshape(&y, &[-1, na * ny * nx, no])?);
        }
        let refs: Vec<&Var> = levels.iter().collect();
        let out = g.concat(&refs, 1)?;
        if self.split_outputs && !self.emit_grid {
            let no = self.no();
            let boxes = g.slice(&out, 2, 0, 4);
            let obj = g.slice(&out, 2, 4, 5);
            let cls = g.slice(&out, 2, 5, no);
            let classes = g.mul(&cls, &obj);
            return Ok(DetectOutput::Pair { classes, boxes });
        }
        Ok(DetectOutput::Single(out))
    }

    fn decode(&self, g: &mut Graph, level: usize, y: &Var) -> Result<Var, ModelError> {
        let (ny, nx) = (y.shape()[2], y.shape()[3]);
        let no = self.no();
        let grid = ArrayD::from_shape_fn(IxDyn(&[1, 1, ny, nx, 2]), |i| {
            if i[4] == 0 { i[3] as f32 } else { i[2] as f32 }
        });
        let anchor_grid = self
            .anchor_grid
            .index_axis(ndarray::Axis(0), level)
            .to_owned();

        let y = g.sigmoid(y);
        let two = g.scalar(2.0);
        let half = g.scalar(0.5);
        let grid = g.constant(grid);
        let stride = g.scalar(self.stride[level]);
        let anchor_grid = g.constant(anchor_grid);

        let xy = g.slice(&y, 4, 0, 2);
        let xy = g.mul(&xy, &two);
        let xy = g.sub(&xy, &half);
        let xy = g.add(&xy, &grid);
        let xy = g.mul(&xy, &stride);

        let wh = g.slice(&y, 4, 2, 4);
        let wh = g.mul(&wh, &two);
        let wh = g.pow(&wh, &two);
        let wh = g.mul(&wh, &anchor_grid);

        let rest = g.slice(&y, 4, 4, no);
        g.concat(&[&xy, &wh, &rest], 4)
    }
}

pub enum DetectOutput {
    Single(Var),
    Pair { classes: Var, boxes: Var },
}

#[derive(Debug, Clone)]
pub enum ModuleKind {
    Identity,
    Act(Activation),
    Conv(Conv),
    Bottleneck(Bottleneck),
    Sequential(Vec<Module>),
    MaxPool { kernel: usize, stride: usize, pad: usize },
    Upsample { scale: usize },
    Concat { axis: usize },
    Detect(Detect),
}

/// A node of the module tree. `non_persistent_buffers` names buffers that
/// older checkpoints excluded from the weight mapping.
#[derive(Debug, Clone)]
pub struct Module {
    pub kind: ModuleKind,
    pub non_persistent_buffers: BTreeSet<String>,
}

impl Default for Module {
    fn default() -> Self {
        Module::new(ModuleKind::Identity)
    }
}

impl Module {
    pub fn new(kind: ModuleKind) -> Self {
        Self {
            kind,
            non_persistent_buffers: BTreeSet::new(),
        }
    }

    pub fn children_mut(&mut self) -> Vec<&mut Module> {
        match &mut self.kind {
            ModuleKind::Conv(c) => vec![c.act.as_mut()],
            ModuleKind::Bottleneck(b) => vec![b.cv1.as_mut(), b.cv2.as_mut()],
            ModuleKind::Sequential(ms) => ms.iter_mut().collect(),
            _ => Vec::new(),
        }
    }

    pub fn children(&self) -> Vec<&Module> {
        match &self.kind {
            ModuleKind::Conv(c) => vec![c.act.as_ref()],
            ModuleKind::Bottleneck(b) => vec![b.cv1.as_ref(), b.cv2.as_ref()],
            ModuleKind::Sequential(ms) => ms.iter().collect(),
            _ => Vec::new(),
        }
    }

    pub fn forward(&self, g: &mut Graph, prefix: &str, xs: &[Var]) -> Result<Var, ModelError> {
        let x = xs
            .first()
            .ok_or_else(|| ModelError::Shape(format!("{prefix}: no input")))?;
        match &self.kind {
            ModuleKind::Identity => Ok(x.clone()),
            ModuleKind::Act(act) => Ok(act.forward(g, x)),
            ModuleKind::Conv(c) => c.forward(g, prefix, x),
            ModuleKind::Bottleneck(b) => {
                let y = b.cv1.forward(g, &format!("{prefix}.cv1"), &[x.clone()])?;
                let y = b.cv2.forward(g, &format!("{prefix}.cv2"), &[y])?;
                if b.shortcut && y.shape() == x.shape() {
                    Ok(g.add(x, &y))
                } else {
                    Ok(y)
                }
            }
            ModuleKind::Sequential(ms) => {
                let mut y = x.clone();
                for (i, m) in ms.iter().enumerate() {
                    y = m.forward(g, &format!("{prefix}.{i}"), &[y])?;
                }
                Ok(y)
            }
            ModuleKind::MaxPool { kernel, stride, pad } => g.max_pool(x, *kernel, *stride, *pad),
            ModuleKind::Upsample { scale } => g.resize_nearest(x, *scale),
            ModuleKind::Concat { axis } => {
                let refs: Vec<&Var> = xs.iter().collect();
                g.concat(&refs, *axis)
            }
            ModuleKind::Detect(_) => Err(ModelError::Config(format!(
                "{prefix}: Detect must be the terminal layer"
            ))),
        }
    }

    /// Collects `(name, tensor)` for every persistent parameter and buffer.
    pub fn params<'a>(&'a self, prefix: &str, out: &mut Vec<(String, &'a ArrayD<f32>)>) {
        let persistent = |name: &str| !self.non_persistent_buffers.contains(name);
        match &self.kind {
            ModuleKind::Conv(c) => {
                out.push((format!("{prefix}.conv.weight"), &c.weight));
                if let Some(q) = &c.quant {
                    out.push((format!("{prefix}.conv.weight_fake_quant.scale"), &q.weight_scale));
                    out.push((format!("{prefix}.conv.weight_fake_quant.zero_point"), &q.weight_zero_point));
                    out.push((format!("{prefix}.conv.activation_post_process.scale"), &q.act_scale));
                    out.push((format!("{prefix}.conv.activation_post_process.zero_point"), &q.act_zero_point));
                }
                out.push((format!("{prefix}.bn.weight"), &c.bn.weight));
                out.push((format!("{prefix}.bn.bias"), &c.bn.bias));
                out.push((format!("{prefix}.bn.running_mean"), &c.bn.running_mean));
                out.push((format!("{prefix}.bn.running_var"), &c.bn.running_var));
            }
            ModuleKind::Bottleneck(b) => {
                b.cv1.params(&format!("{prefix}.cv1"), out);
                b.cv2.params(&format!("{prefix}.cv2"), out);
            }
            ModuleKind::Sequential(ms) => {
                for (i, m) in ms.iter().enumerate() {
                    m.params(&format!("{prefix}.{i}"), out);
                }
            }
            ModuleKind::Detect(d) => {
                if persistent("anchors") {
                    out.push((format!("{prefix}.anchors"), &d.anchors));
                }
                if persistent("anchor_grid") {
                    out.push((format!("{prefix}.anchor_grid"), &d.anchor_grid));
                }
                for (i, m) in d.m.iter().enumerate() {
                    out.push((format!("{prefix}.m.{i}.weight"), &m.weight));
                    out.push((format!("{prefix}.m.{i}.bias"), &m.bias));
                }
            }
            _ => {}
        }
    }

    pub fn params_mut<'a>(&'a mut self, prefix: &str, out: &mut Vec<(String, &'a mut ArrayD<f32>)>) {
        let Module {
            kind,
            non_persistent_buffers,
        } = self;
        match kind {
            ModuleKind::Conv(c) => {
                out.push((format!("{prefix}.conv.weight"), &mut c.weight));
                if let Some(q) = &mut c.quant {
                    out.push((format!("{prefix}.conv.weight_fake_quant.scale"), &mut q.weight_scale));
                    out.push((format!("{prefix}.conv.weight_fake_quant.zero_point"), &mut q.weight_zero_point));
                    out.push((format!("{prefix}.conv.activation_post_process.scale"), &mut q.act_scale));
                    out.push((format!("{prefix}.conv.activation_post_process.zero_point"), &mut q.act_zero_point));
                }
                out.push((format!("{prefix}.bn.weight"), &mut c.bn.weight));
                out.push((format!("{prefix}.bn.bias"), &mut c.bn.bias));
                out.push((format!("{prefix}.bn.running_mean"), &mut c.bn.running_mean));
                out.push((format!("{prefix}.bn.running_var"), &mut c.bn.running_var));
            }
            ModuleKind::Bottleneck(b) => {
                b.cv1.params_mut(&format!("{prefix}.cv1"), out);
                b.cv2.params_mut(&format!("{prefix}.cv2"), out);
            }
            ModuleKind::Sequential(ms) => {
                for (i, m) in ms.iter_mut().enumerate() {
                    m.params_mut(&format!("{prefix}.{i}"), out);
                }
            }
            ModuleKind::Detect(d) => {
                if !non_persistent_buffers.contains("anchors") {
                    out.push((format!("{prefix}.anchors"), &mut d.anchors));
                }
                if !non_persistent_buffers.contains("anchor_grid") {
                    out.push((format!("{prefix}.anchor_grid"), &mut d.anchor_grid));
                }
                for (i, m) in d.m.iter_mut().enumerate() {
                    out.push((format!("{prefix}.m.{i}.weight"), &mut m.weight));
                    out.push((format!("{prefix}.m.{i}.bias"), &mut m.bias));
                }
            }
            _ => {}
        }
    }
}
