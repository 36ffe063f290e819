//! Detection network: architecture parsing, module tree, weight mapping and
//! forward computation.
//!
//! The forward pass runs through a [`Graph`], which computes eagerly and can
//! additionally record every op into a [`ModelIR`] for serialization.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use ndarray::ArrayD;
use thiserror::Error;

use crate::ir::ModelIR;

pub mod config;
pub mod graph;
pub mod layers;

pub use config::{ActivationKind, ArchitectureConfig, LayerSpec};
pub use graph::{Graph, Var};
pub use layers::{Activation, Bottleneck, Conv, Detect, DetectOutput, FakeQuant, Module, ModuleKind};

/// Ordered weight mapping, name → tensor.
pub type StateDict = BTreeMap<String, ArrayD<f32>>;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Invalid architecture: {0}")]
    Config(String),
    #[error("Shape error: {0}")]
    Shape(String),
}

/// Strict-load failure: every name the model expects must be present with
/// the same shape and nothing else may be supplied.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct WeightMismatch {
    pub missing: Vec<String>,
    pub unexpected: Vec<String>,
    pub mismatched: Vec<(String, Vec<usize>, Vec<usize>)>,
}

impl WeightMismatch {
    pub fn is_empty(&self) -> bool {
        self.missing.is_empty() && self.unexpected.is_empty() && self.mismatched.is_empty()
    }
}

impl fmt::Display for WeightMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "weight mapping does not match model parameters")?;
        if !self.missing.is_empty() {
            write!(f, "; missing: {}", self.missing.join(", "))?;
        }
        if !self.unexpected.is_empty() {
            write!(f, "; unexpected: {}", self.unexpected.join(", "))?;
        }
        for (name, expected, found) in &self.mismatched {
            write!(f, "; {name}: expected {expected:?}, found {found:?}")?;
        }
        Ok(())
    }
}

impl std::error::Error for WeightMismatch {}

/// Output arity captured by a forward pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputSignature {
    Single,
    Pair,
}

impl OutputSignature {
    pub fn names(self) -> &'static [&'static str] {
        match self {
            OutputSignature::Single => &["output"],
            OutputSignature::Pair => &["classes", "boxes"],
        }
    }
}

#[derive(Debug, Clone)]
pub enum ModelOutput<T> {
    Single(T),
    Pair { classes: T, boxes: T },
}

impl<T> ModelOutput<T> {
    pub fn signature(&self) -> OutputSignature {
        match self {
            ModelOutput::Single(_) => OutputSignature::Single,
            ModelOutput::Pair { .. } => OutputSignature::Pair,
        }
    }

    /// Values in output-name order.
    pub fn values(&self) -> Vec<&T> {
        match self {
            ModelOutput::Single(v) => vec![v],
            ModelOutput::Pair { classes, boxes } => vec![classes, boxes],
        }
    }
}

/// Where a layer reads its input from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerInput {
    Previous,
    Layer(usize),
}

#[derive(Debug, Clone)]
pub struct Layer {
    pub index: usize,
    pub inputs: Vec<LayerInput>,
    pub module: Module,
}

impl Layer {
    pub fn prefix(&self) -> String {
        format!("model.{}", self.index)
    }
}

/// Rewrites the module tree. Called post-order with the index path of each
/// node; the returned module takes the visited node's place.
pub trait ModuleVisitor {
    fn visit(&mut self, path: &[usize], module: Module) -> Module;
}

fn rewrite_module(module: &mut Module, path: &mut Vec<usize>, visitor: &mut dyn ModuleVisitor) {
    for (i, child) in module.children_mut().into_iter().enumerate() {
        path.push(i);
        rewrite_module(child, path, visitor);
        path.pop();
    }
    let node = std::mem::take(module);
    *module = visitor.visit(path, node);
}

#[derive(Debug, Clone)]
pub struct DetectionModel {
    config: ArchitectureConfig,
    layers: Vec<Layer>,
    names: Vec<String>,
    stride: Vec<f32>,
}

fn make_divisible(x: f32, divisor: usize) -> usize {
    ((x / divisor as f32).ceil() as usize) * divisor
}

fn arg_usize(args: &[serde_yaml::Value], i: usize, default: usize) -> usize {
    args.get(i)
        .and_then(|v| v.as_u64())
        .map(|v| v as usize)
        .unwrap_or(default)
}

impl DetectionModel {
    pub fn from_config(config: &ArchitectureConfig) -> Result<Self, ModelError> {
        let act = match config.activation {
            ActivationKind::ReLU => Activation::ReLU,
            ActivationKind::LeakyReLU => Activation::LeakyReLU(0.1),
            ActivationKind::Hardswish => Activation::Hardswish,
            ActivationKind::SiLU => Activation::SiLU,
        };
        let width = |c: usize| {
            if (config.width_multiple - 1.0).abs() < f32::EPSILON {
                c
            } else {
                make_divisible(c as f32 * config.width_multiple, 8)
            }
        };

        let mut layers = Vec::new();
        let mut channels: Vec<usize> = Vec::new();
        let mut strides: Vec<f32> = Vec::new();
        let mut detect_stride = Vec::new();

        for (i, LayerSpec(from, number, module, args)) in config.layers().enumerate() {
            let inputs = from
                .indices()
                .into_iter()
                .map(|f| match f {
                    -1 => Ok(LayerInput::Previous),
                    f if f < -1 && (i as i64 + f) >= 0 => Ok(LayerInput::Layer((i as i64 + f) as usize)),
                    f if f >= 0 && (f as usize) < i => Ok(LayerInput::Layer(f as usize)),
                    f => Err(ModelError::Config(format!("layer {i}: invalid input index {f}"))),
                })
                .collect::<Result<Vec<_>, _>>()?;
            if inputs.is_empty() {
                return Err(ModelError::Config(format!("layer {i}: empty input list")));
            }
            let source = |input: &LayerInput| match input {
                LayerInput::Previous => (
                    channels.last().copied().unwrap_or(3),
                    strides.last().copied().unwrap_or(1.0),
                ),
                LayerInput::Layer(j) => (channels[*j], strides[*j]),
            };
            let (c1, s1) = source(&inputs[0]);
            let repeats = if *number > 1 {
                ((*number as f32 * config.depth_multiple).round() as usize).max(1)
            } else {
                *number
            };

            let (kind, c2, s2) = match module.as_str() {
                "Conv" => {
                    let c2 = width(arg_usize(args, 0, c1));
                    let k = arg_usize(args, 1, 1);
                    let s = arg_usize(args, 2, 1);
                    (ModuleKind::Conv(Conv::new(c1, c2, k, s, act)), c2, s1 * s as f32)
                }
                "Bottleneck" => {
                    let c2 = width(arg_usize(args, 0, c1));
                    let shortcut = args.get(1).and_then(|v| v.as_bool()).unwrap_or(true);
                    let block = |cin: usize| {
                        Module::new(ModuleKind::Bottleneck(Bottleneck {
                            cv1: Box::new(Module::new(ModuleKind::Conv(Conv::new(cin, c2, 1, 1, act)))),
                            cv2: Box::new(Module::new(ModuleKind::Conv(Conv::new(c2, c2, 3, 1, act)))),
                            shortcut,
                        }))
                    };
                    let kind = if repeats > 1 {
                        let blocks = (0..repeats).map(|r| block(if r == 0 { c1 } else { c2 })).collect();
                        ModuleKind::Sequential(blocks)
                    } else {
                        block(c1).kind
                    };
                    (kind, c2, s1)
                }
                "nn.MaxPool2d" | "MaxPool" => {
                    let kernel = arg_usize(args, 0, 2);
                    let stride = arg_usize(args, 1, kernel);
                    let pad = arg_usize(args, 2, 0);
                    (ModuleKind::MaxPool { kernel, stride, pad }, c1, s1 * stride as f32)
                }
                "nn.Upsample" | "Upsample" => {
                    let scale = arg_usize(args, 1, 2);
                    (ModuleKind::Upsample { scale }, c1, s1 / scale as f32)
                }
                "Concat" => {
                    let axis = arg_usize(args, 0, 1);
                    let c2 = inputs.iter().map(|x| source(x).0).sum();
                    (ModuleKind::Concat { axis }, c2, s1)
                }
                "nn.Identity" | "Identity" => (ModuleKind::Identity, c1, s1),
                "Detect" => {
                    let ch: Vec<usize> = inputs.iter().map(|x| source(x).0).collect();
                    let st: Vec<f32> = inputs.iter().map(|x| source(x).1).collect();
                    let nc = arg_usize(args, 0, config.nc);
                    let mut detect = Detect::new(nc, &config.anchors, &ch, &st)?;
                    detect.split_outputs = config.split_outputs;
                    detect_stride = st;
                    (ModuleKind::Detect(detect), 0, s1)
                }
                other => return Err(ModelError::Config(format!("layer {i}: unknown module {other}"))),
            };

            channels.push(c2);
            strides.push(s2);
            layers.push(Layer {
                index: i,
                inputs,
                module: Module::new(kind),
            });
        }

        match layers.last().map(|l| &l.module.kind) {
            Some(ModuleKind::Detect(_)) => {}
            _ => return Err(ModelError::Config("last layer must be Detect".to_string())),
        }
        if layers[..layers.len() - 1]
            .iter()
            .any(|l| matches!(l.module.kind, ModuleKind::Detect(_)))
        {
            return Err(ModelError::Config("Detect may only appear as the last layer".to_string()));
        }

        Ok(Self {
            names: config.class_names(),
            config: config.clone(),
            layers,
            stride: detect_stride,
        })
    }

    pub fn config(&self) -> &ArchitectureConfig {
        &self.config
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    /// Per-level strides of the detection head.
    pub fn stride(&self) -> &[f32] {
        &self.stride
    }

    /// Largest head stride; image sizes must be multiples of it.
    pub fn grid_stride(&self) -> u32 {
        self.stride.iter().fold(0.0f32, |a, b| a.max(*b)) as u32
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn set_names(&mut self, names: Vec<String>) {
        self.names = names;
    }

    pub fn detect(&self) -> Option<&Detect> {
        match &self.layers.last()?.module.kind {
            ModuleKind::Detect(d) => Some(d),
            _ => None,
        }
    }

    pub fn detect_mut(&mut self) -> Option<&mut Detect> {
        match &mut self.layers.last_mut()?.module.kind {
            ModuleKind::Detect(d) => Some(d),
            _ => None,
        }
    }

    /// Marks buffers of top-level layers as non-persistent, keyed by layer
    /// prefix (`model.{i}`).
    pub fn set_non_persistent_buffers(&mut self, buffers: &BTreeMap<String, Vec<String>>) {
        for layer in &mut self.layers {
            if let Some(names) = buffers.get(&layer.prefix()) {
                layer.module.non_persistent_buffers = names.iter().cloned().collect::<BTreeSet<_>>();
            }
        }
    }

    pub fn rewrite(&mut self, visitor: &mut dyn ModuleVisitor) {
        let mut path = Vec::new();
        for (i, layer) in self.layers.iter_mut().enumerate() {
            path.push(i);
            rewrite_module(&mut layer.module, &mut path, visitor);
            path.pop();
        }
    }

    /// Visits every module read-only, pre-order.
    pub fn for_each_module(&self, mut f: impl FnMut(&[usize], &Module)) {
        fn walk(m: &Module, path: &mut Vec<usize>, f: &mut dyn FnMut(&[usize], &Module)) {
            f(path, m);
            for (i, child) in m.children().into_iter().enumerate() {
                path.push(i);
                walk(child, path, f);
                path.pop();
            }
        }
        let mut path = Vec::new();
        for (i, layer) in self.layers.iter().enumerate() {
            path.push(i);
            walk(&layer.module, &mut path, &mut f);
            path.pop();
        }
    }

    pub fn state_dict(&self) -> StateDict {
        let mut params = Vec::new();
        for layer in &self.layers {
            layer.module.params(&layer.prefix(), &mut params);
        }
        params.into_iter().map(|(n, t)| (n, t.clone())).collect()
    }

    pub fn parameter_shapes(&self) -> BTreeMap<String, Vec<usize>> {
        let mut params = Vec::new();
        for layer in &self.layers {
            layer.module.params(&layer.prefix(), &mut params);
        }
        params.into_iter().map(|(n, t)| (n, t.shape().to_vec())).collect()
    }

    /// Strict load: fails without touching any parameter unless the mapping
    /// matches the model exactly.
    pub fn load_state_dict(&mut self, state: &StateDict) -> Result<(), WeightMismatch> {
        let mut params = Vec::new();
        for layer in &mut self.layers {
            let prefix = layer.prefix();
            layer.module.params_mut(&prefix, &mut params);
        }

        let mut mismatch = WeightMismatch::default();
        let expected: BTreeSet<&str> = params.iter().map(|(n, _)| n.as_str()).collect();
        for (name, param) in &params {
            match state.get(name) {
                None => mismatch.missing.push(name.clone()),
                Some(t) if t.shape() != param.shape() => {
                    mismatch
                        .mismatched
                        .push((name.clone(), param.shape().to_vec(), t.shape().to_vec()))
                }
                Some(_) => {}
            }
        }
        mismatch.unexpected = state
            .keys()
            .filter(|k| !expected.contains(k.as_str()))
            .cloned()
            .collect();
        if !mismatch.is_empty() {
            return Err(mismatch);
        }

        for (name, param) in params {
            if let Some(t) = state.get(&name) {
                param.assign(t);
            }
        }
        Ok(())
    }

    pub fn forward(&self, g: &mut Graph, input: Var) -> Result<ModelOutput<Var>, ModelError> {
        let mut outputs: Vec<Option<Var>> = vec![None; self.layers.len()];
        let mut x = input;
        let last = self.layers.len() - 1;
        for (i, layer) in self.layers.iter().enumerate() {
            let xs = layer
                .inputs
                .iter()
                .map(|input| match input {
                    LayerInput::Previous => Ok(x.clone()),
                    LayerInput::Layer(j) => outputs[*j]
                        .clone()
                        .ok_or_else(|| ModelError::Config(format!("layer {i}: input {j} not computed"))),
                })
                .collect::<Result<Vec<_>, _>>()?;
            if i == last {
                if let ModuleKind::Detect(d) = &layer.module.kind {
                    return Ok(match d.forward(g, &layer.prefix(), &xs)? {
                        DetectOutput::Single(v) => ModelOutput::Single(v),
                        DetectOutput::Pair { classes, boxes } => ModelOutput::Pair { classes, boxes },
                    });
                }
            }
            x = layer.module.forward(g, &layer.prefix(), &xs)?;
            outputs[i] = Some(x.clone());
        }
        Err(ModelError::Config("last layer must be Detect".to_string()))
    }

    /// Eager forward pass.
    pub fn run(&self, input: &ArrayD<f32>) -> Result<ModelOutput<ArrayD<f32>>, ModelError> {
        let mut g = Graph::eager();
        let x = g.input("images", input.clone());
        Ok(match self.forward(&mut g, x)? {
            ModelOutput::Single(v) => ModelOutput::Single(v.data),
            ModelOutput::Pair { classes, boxes } => ModelOutput::Pair {
                classes: classes.data,
                boxes: boxes.data,
            },
        })
    }

    /// Records the forward pass on `input` into a graph.
    pub fn trace(&self, input: &ArrayD<f32>) -> Result<(ModelIR, OutputSignature), ModelError> {
        let mut g = Graph::tracing();
        let x = g.input("images", input.clone());
        let out = self.forward(&mut g, x)?;
        let signature = out.signature();
        let ir = g.finish(&out.values()).unwrap_or_default();
        Ok((ir, signature))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::config::TINY_YAML;
    use super::*;
    use ndarray::{Dimension, IxDyn};

    pub(crate) fn tiny_model() -> DetectionModel {
        DetectionModel::from_config(&ArchitectureConfig::from_yaml(TINY_YAML).unwrap()).unwrap()
    }

    /// Deterministic, non-trivial weights for every parameter.
    pub(crate) fn seeded_state(model: &DetectionModel) -> StateDict {
        model
            .parameter_shapes()
            .into_iter()
            .enumerate()
            .map(|(k, (name, shape))| {
                let t = if name.ends_with("running_var") {
                    ArrayD::from_elem(IxDyn(&shape), 1.0)
                } else if name.ends_with("anchors") || name.ends_with("anchor_grid") {
                    model.state_dict()[&name].clone()
                } else {
                    ArrayD::from_shape_fn(IxDyn(&shape), |i| {
                        let s: usize = i.slice().iter().sum();
                        (((s + k) % 7) as f32 - 3.0) * 0.05
                    })
                };
                (name, t)
            })
            .collect()
    }

    #[test]
    fn test_strides_and_grid_stride() {
        let model = tiny_model();
        assert_eq!(model.stride(), &[16.0, 32.0]);
        assert_eq!(model.grid_stride(), 32);
        assert_eq!(model.names().len(), 3);
    }

    #[test]
    fn test_state_dict_roundtrip_is_exact() {
        let mut model = tiny_model();
        let state = seeded_state(&model);
        model.load_state_dict(&state).unwrap();
        assert_eq!(model.state_dict(), state);
    }

    #[test]
    fn test_strict_load_reports_every_discrepancy() {
        let mut model = tiny_model();
        let mut state = seeded_state(&model);
        state.remove("model.0.conv.weight");
        state.insert("model.0.extra".to_string(), ArrayD::zeros(IxDyn(&[1])));
        state.insert("model.1.bn.bias".to_string(), ArrayD::zeros(IxDyn(&[3])));
        let err = model.load_state_dict(&state).unwrap_err();
        assert_eq!(err.missing, vec!["model.0.conv.weight"]);
        assert_eq!(err.unexpected, vec!["model.0.extra"]);
        assert_eq!(err.mismatched.len(), 1);
        assert_eq!(err.mismatched[0].0, "model.1.bn.bias");
    }

    #[test]
    fn test_failed_load_leaves_parameters_untouched() {
        let mut model = tiny_model();
        let before = model.state_dict();
        let mut state = seeded_state(&model);
        state.remove("model.10.m.0.bias");
        assert!(model.load_state_dict(&state).is_err());
        assert_eq!(model.state_dict(), before);
    }

    #[test]
    fn test_forward_decoded_output_shape() {
        let mut model = tiny_model();
        model.load_state_dict(&seeded_state(&model)).unwrap();
        let out = model.run(&ArrayD::zeros(IxDyn(&[1, 3, 64, 64]))).unwrap();
        match out {
            // 3 anchors * (4*4 + 2*2) cells, 3 classes + 5
            ModelOutput::Single(y) => assert_eq!(y.shape(), &[1, 60, 8]),
            ModelOutput::Pair { .. } => panic!("expected a single output"),
        }
    }

    #[test]
    fn test_split_outputs_produce_pair() {
        let mut cfg = ArchitectureConfig::from_yaml(TINY_YAML).unwrap();
        cfg.split_outputs = true;
        let model = DetectionModel::from_config(&cfg).unwrap();
        let out = model.run(&ArrayD::zeros(IxDyn(&[2, 3, 64, 64]))).unwrap();
        match out {
            ModelOutput::Pair { classes, boxes } => {
                assert_eq!(classes.shape(), &[2, 60, 3]);
                assert_eq!(boxes.shape(), &[2, 60, 4]);
            }
            ModelOutput::Single(_) => panic!("expected a pair"),
        }
    }

    #[test]
    fn test_trace_records_named_input() {
        let model = tiny_model();
        let (ir, signature) = model.trace(&ArrayD::zeros(IxDyn(&[1, 3, 32, 32]))).unwrap();
        assert_eq!(signature, OutputSignature::Single);
        assert_eq!(ir.inputs[0].name, "images");
        assert_eq!(ir.outputs.len(), 1);
        assert!(ir.weights.contains_key("model.0.conv.weight"));
        assert!(ir.nodes.iter().any(|n| n.op_type == "SiLU"));
    }

    #[test]
    fn test_unknown_module_is_rejected() {
        let yaml = TINY_YAML.replace("Bottleneck", "C3");
        let cfg = ArchitectureConfig::from_yaml(&yaml).unwrap();
        assert!(matches!(DetectionModel::from_config(&cfg), Err(ModelError::Config(_))));
    }

    #[test]
    fn test_empty_input_list_is_rejected() {
        let yaml = TINY_YAML.replace("[[-1, 4], 1, Concat, [1]]", "[[], 1, Concat, [1]]");
        assert_ne!(yaml, TINY_YAML);
        let cfg = ArchitectureConfig::from_yaml(&yaml).unwrap();
        let err = DetectionModel::from_config(&cfg).unwrap_err();
        assert!(err.to_string().contains("empty input list"), "{err}");
    }

    struct CountConvs(usize);

    impl ModuleVisitor for CountConvs {
        fn visit(&mut self, _path: &[usize], module: Module) -> Module {
            if matches!(module.kind, ModuleKind::Conv(_)) {
                self.0 += 1;
            }
            module
        }
    }

    #[test]
    fn test_rewrite_visits_nested_modules() {
        let mut model = tiny_model();
        let mut counter = CountConvs(0);
        model.rewrite(&mut counter);
        // five top-level convs plus two inside the bottleneck
        assert_eq!(counter.0, 7);
    }
}
