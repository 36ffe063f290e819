//! In-place rewrites that make a resolved model safe to serialize.

use ndarray::{ArrayD, IxDyn};
use thiserror::Error;
use tracing::{debug, info};

use crate::model::{DetectionModel, Module, ModelError, ModuleKind, ModuleVisitor, OutputSignature};

#[derive(Error, Debug)]
pub enum TransformError {
    #[error("dry run failed: {0}")]
    DryRun(#[from] ModelError),
    #[error("model has no Detect head")]
    MissingHead,
}

pub trait TransformPass {
    fn name(&self) -> &'static str;
    fn apply(&self, model: &mut DetectionModel) -> Result<(), TransformError>;
}

/// Adapts a closure to [`ModuleVisitor`].
struct Visit<F>(F);

impl<F: FnMut(&[usize], Module) -> Module> ModuleVisitor for Visit<F> {
    fn visit(&mut self, path: &[usize], module: Module) -> Module {
        (self.0)(path, module)
    }
}

/// Forgets the legacy non-persistent buffer sets so every buffer is
/// serialized with the graph.
pub struct ClearBufferTracking;

impl TransformPass for ClearBufferTracking {
    fn name(&self) -> &'static str {
        "clear-buffer-tracking"
    }

    fn apply(&self, model: &mut DetectionModel) -> Result<(), TransformError> {
        model.rewrite(&mut Visit(|_: &[usize], mut m: Module| {
            m.non_persistent_buffers.clear();
            m
        }));
        Ok(())
    }
}

/// Replaces fused activation kernels with compositions of elementary ops.
pub struct SubstituteActivations;

impl TransformPass for SubstituteActivations {
    fn name(&self) -> &'static str {
        "substitute-activations"
    }

    fn apply(&self, model: &mut DetectionModel) -> Result<(), TransformError> {
        let mut replaced = 0;
        model.rewrite(&mut Visit(|_: &[usize], mut m: Module| {
            if let ModuleKind::Act(act) = &mut m.kind {
                if let Some(export) = act.export_equivalent() {
                    *act = export;
                    replaced += 1;
                }
            }
            m
        }));
        debug!(replaced, "substituted activations");
        Ok(())
    }
}

/// Sets whether the detection head emits raw grid tensors.
pub struct SetOutputMode {
    pub grid: bool,
}

impl TransformPass for SetOutputMode {
    fn name(&self) -> &'static str {
        "set-output-mode"
    }

    fn apply(&self, model: &mut DetectionModel) -> Result<(), TransformError> {
        let detect = model.detect_mut().ok_or(TransformError::MissingHead)?;
        detect.emit_grid = self.grid;
        Ok(())
    }
}

pub struct ExportModeTransformer {
    passes: Vec<Box<dyn TransformPass>>,
}

impl ExportModeTransformer {
    pub fn new(grid: bool) -> Self {
        Self {
            passes: vec![
                Box::new(ClearBufferTracking),
                Box::new(SubstituteActivations),
                Box::new(SetOutputMode { grid }),
            ],
        }
    }

    pub fn with_pass(mut self, pass: impl TransformPass + 'static) -> Self {
        self.passes.push(Box::new(pass));
        self
    }

    /// Runs every pass, then one forward pass on `sample` to capture the
    /// output arity.
    pub fn apply(&self, model: &mut DetectionModel, sample: &ArrayD<f32>) -> Result<OutputSignature, TransformError> {
        for pass in &self.passes {
            pass.apply(model)?;
            debug!(pass = pass.name(), "applied export transform");
        }
        let output = model.run(sample)?;
        let signature = output.signature();
        let shapes: Vec<Vec<usize>> = output.values().iter().map(|v| v.shape().to_vec()).collect();
        info!(?signature, ?shapes, "dry run complete");
        Ok(signature)
    }
}

/// Zero-valued input of the given `[batch, channels, height, width]` shape.
pub fn zero_sample(shape: [usize; 4]) -> ArrayD<f32> {
    ArrayD::zeros(IxDyn(&shape))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::config::TINY_YAML;
    use crate::model::tests::{seeded_state, tiny_model};
    use crate::model::{Activation, ArchitectureConfig, Graph, ModelOutput};
    use approx::assert_abs_diff_eq;
    use proptest::prelude::*;
    use std::collections::BTreeMap;

    fn activations(model: &DetectionModel) -> Vec<Activation> {
        let mut acts = Vec::new();
        model.for_each_module(|_, m| {
            if let ModuleKind::Act(a) = &m.kind {
                acts.push(*a);
            }
        });
        acts
    }

    #[test]
    fn test_substitution_leaves_no_reference_kernels() {
        let mut model = tiny_model();
        assert!(activations(&model).contains(&Activation::SiLU));
        SubstituteActivations.apply(&mut model).unwrap();
        let acts = activations(&model);
        assert!(!acts.iter().any(|a| matches!(a, Activation::SiLU | Activation::Hardswish)));
        assert!(acts.contains(&Activation::ExportSiLU));
    }

    #[test]
    fn test_substituted_model_matches_reference_output() {
        let mut model = tiny_model();
        model.load_state_dict(&seeded_state(&model)).unwrap();
        let sample = ArrayD::from_shape_fn(IxDyn(&[1, 3, 64, 64]), |i| {
            ((i[1] * 31 + i[2] * 7 + i[3] * 3) % 17) as f32 / 17.0
        });
        let before = model.run(&sample).unwrap();
        SubstituteActivations.apply(&mut model).unwrap();
        let after = model.run(&sample).unwrap();
        match (before, after) {
            (ModelOutput::Single(a), ModelOutput::Single(b)) => {
                for (x, y) in a.iter().zip(b.iter()) {
                    assert_abs_diff_eq!(x, y, epsilon = 1e-4 * x.abs().max(1.0));
                }
            }
            _ => panic!("expected single outputs"),
        }
    }

    #[test]
    fn test_clear_buffer_tracking() {
        let mut model = tiny_model();
        let buffers = BTreeMap::from([("model.10".to_string(), vec!["anchor_grid".to_string()])]);
        model.set_non_persistent_buffers(&buffers);
        assert!(!model.parameter_shapes().contains_key("model.10.anchor_grid"));

        ClearBufferTracking.apply(&mut model).unwrap();
        assert!(model.parameter_shapes().contains_key("model.10.anchor_grid"));
    }

    #[test]
    fn test_grid_mode_and_signature() {
        let mut model = tiny_model();
        let signature = ExportModeTransformer::new(true)
            .apply(&mut model, &zero_sample([1, 3, 64, 64]))
            .unwrap();
        assert_eq!(signature, OutputSignature::Single);
        assert!(model.detect().unwrap().emit_grid);
    }

    #[test]
    fn test_split_head_yields_pair_signature() {
        let mut cfg = ArchitectureConfig::from_yaml(TINY_YAML).unwrap();
        cfg.split_outputs = true;
        let mut model = DetectionModel::from_config(&cfg).unwrap();
        let signature = ExportModeTransformer::new(false)
            .apply(&mut model, &zero_sample([2, 3, 64, 64]))
            .unwrap();
        assert_eq!(signature, OutputSignature::Pair);
    }

    #[test]
    fn test_dry_run_failure_is_fatal() {
        let mut model = tiny_model();
        let err = ExportModeTransformer::new(false)
            .apply(&mut model, &zero_sample([1, 4, 64, 64]))
            .unwrap_err();
        assert!(matches!(err, TransformError::DryRun(_)));
    }

    proptest! {
        #[test]
        fn test_export_activations_match_reference(values in proptest::collection::vec(-8.0f32..8.0, 1..64)) {
            let x = ArrayD::from_shape_vec(IxDyn(&[values.len()]), values).unwrap();
            for reference in [Activation::SiLU, Activation::Hardswish] {
                let mut g = Graph::eager();
                let input = g.input("x", x.clone());
                let expected = reference.forward(&mut g, &input);
                let export = reference.export_equivalent().unwrap();
                let actual = export.forward(&mut g, &input);
                for (a, b) in expected.data.iter().zip(actual.data.iter()) {
                    prop_assert!((a - b).abs() <= 1e-5, "{reference:?}: {a} vs {b}");
                }
            }
        }
    }
}
