//! Sparsification recipes: rewrites a freshly built model so that weights
//! trained under the recipe load into it.

use serde::Serialize;
use thiserror::Error;
use tracing::info;

use crate::model::{DetectionModel, FakeQuant, Module, ModuleKind, ModuleVisitor};

pub mod recipe;

pub use recipe::{EpochRangeModifier, Modifier, PruningModifier, QuantizationModifier, Recipe};

/// Parameter selector covering every prunable weight.
const ALL_PARAMS: &str = "__ALL__";

#[derive(Error, Debug)]
pub enum RecipeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid recipe: {0}")]
    Parse(String),
    #[error("Recipe references unknown parameter or module: {0}")]
    UnknownParameter(String),
    #[error("Invalid modifier: {0}")]
    Invalid(String),
}

/// What initialization did to the model.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SparsificationSummary {
    pub quantized_convs: usize,
    /// Target sparsity per pruned parameter.
    pub pruning_targets: Vec<(String, f64)>,
    pub epoch_range: Option<(f64, f64)>,
}

impl SparsificationSummary {
    pub fn is_quantized(&self) -> bool {
        self.quantized_convs > 0
    }
}

struct QuantizeConvs<'a> {
    submodules: Option<&'a [String]>,
    count: usize,
}

impl ModuleVisitor for QuantizeConvs<'_> {
    fn visit(&mut self, path: &[usize], mut module: Module) -> Module {
        let selected = match (self.submodules, path.first()) {
            (None, _) => true,
            (Some(subs), Some(layer)) => {
                let prefix = format!("model.{layer}");
                subs.iter().any(|s| *s == prefix)
            }
            (Some(_), None) => false,
        };
        if let ModuleKind::Conv(conv) = &mut module.kind {
            if selected && conv.quant.is_none() {
                conv.quant = Some(FakeQuant::default());
                self.count += 1;
            }
        }
        module
    }
}

/// Applies recipe modifiers at initialization time.
pub struct ScheduledModifierManager {
    modifiers: Vec<Modifier>,
}

impl ScheduledModifierManager {
    /// Quantization modifiers are switched to apply on initialization so the
    /// model gains its observers before any weights are loaded.
    pub fn from_recipe(recipe: Recipe) -> Self {
        let modifiers = recipe
            .into_modifiers()
            .into_iter()
            .map(|m| match m {
                Modifier::Quantization(mut q) => {
                    q.enable_on_initialize = true;
                    Modifier::Quantization(q)
                }
                other => other,
            })
            .collect();
        Self { modifiers }
    }

    pub fn modifiers(&self) -> &[Modifier] {
        &self.modifiers
    }

    pub fn initialize(&self, model: &mut DetectionModel) -> Result<SparsificationSummary, RecipeError> {
        let mut summary = SparsificationSummary::default();
        let params = model.parameter_shapes();

        for modifier in &self.modifiers {
            match modifier {
                Modifier::Quantization(q) => {
                    if let Some(subs) = &q.submodules {
                        for s in subs {
                            let known = (0..model.layers().len()).any(|i| *s == format!("model.{i}"));
                            if !known {
                                return Err(RecipeError::UnknownParameter(s.clone()));
                            }
                        }
                    }
                    let mut visitor = QuantizeConvs {
                        submodules: q.submodules.as_deref(),
                        count: 0,
                    };
                    model.rewrite(&mut visitor);
                    summary.quantized_convs += visitor.count;
                }
                Modifier::Pruning(p) => {
                    if !(0.0..1.0).contains(&p.final_sparsity) || p.init_sparsity > p.final_sparsity {
                        return Err(RecipeError::Invalid(format!(
                            "sparsity must rise within [0, 1), got {} -> {}",
                            p.init_sparsity, p.final_sparsity
                        )));
                    }
                    for name in &p.params {
                        if name == ALL_PARAMS {
                            summary.pruning_targets.extend(
                                params
                                    .iter()
                                    .filter(|(n, shape)| n.ends_with(".weight") && shape.len() == 4)
                                    .map(|(n, _)| (n.clone(), p.final_sparsity)),
                            );
                        } else if params.contains_key(name) {
                            summary.pruning_targets.push((name.clone(), p.final_sparsity));
                        } else {
                            return Err(RecipeError::UnknownParameter(name.clone()));
                        }
                    }
                }
                Modifier::EpochRange(r) => {
                    if r.end_epoch < r.start_epoch {
                        return Err(RecipeError::Invalid(format!(
                            "epoch range ends before it starts: {} -> {}",
                            r.start_epoch, r.end_epoch
                        )));
                    }
                    summary.epoch_range = Some((r.start_epoch, r.end_epoch));
                }
            }
        }

        info!(
            quantized_convs = summary.quantized_convs,
            pruned_params = summary.pruning_targets.len(),
            "sparsification recipe applied"
        );
        Ok(summary)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::model::tests::{seeded_state, tiny_model};

    fn manager(yaml: &str) -> ScheduledModifierManager {
        ScheduledModifierManager::from_recipe(Recipe::from_yaml(yaml).unwrap())
    }

    /// Tiny model with every conv quantized and observers set to values a
    /// recipe-trained checkpoint would carry.
    pub(crate) fn quantized_model() -> DetectionModel {
        let mut model = tiny_model();
        manager("modifiers:\n  - !QuantizationModifier\n    start_epoch: 0.0\n")
            .initialize(&mut model)
            .unwrap();
        let mut state = seeded_state(&model);
        for (name, tensor) in state.iter_mut() {
            if name.ends_with("fake_quant.scale") || name.ends_with("post_process.scale") {
                tensor.fill(0.02);
            } else if name.ends_with("weight_fake_quant.zero_point") {
                tensor.fill(0.0);
            } else if name.ends_with("activation_post_process.zero_point") {
                tensor.fill(128.0);
            }
        }
        model.load_state_dict(&state).unwrap();
        model
    }

    #[test]
    fn test_quantization_forced_on_initialize() {
        let m = manager("modifiers:\n  - !QuantizationModifier\n    start_epoch: 30.0\n");
        match &m.modifiers()[0] {
            Modifier::Quantization(q) => assert!(q.enable_on_initialize),
            other => panic!("unexpected modifier {other:?}"),
        }

        let mut model = tiny_model();
        let summary = m.initialize(&mut model).unwrap();
        assert!(summary.is_quantized());
        // every conv, including the bottleneck's inner pair
        assert_eq!(summary.quantized_convs, 7);
        assert!(model
            .parameter_shapes()
            .contains_key("model.2.cv1.conv.weight_fake_quant.scale"));
    }

    #[test]
    fn test_quantization_limited_to_submodules() {
        let m = manager("modifiers:\n  - !QuantizationModifier\n    submodules: ['model.0', 'model.2']\n");
        let mut model = tiny_model();
        let summary = m.initialize(&mut model).unwrap();
        assert_eq!(summary.quantized_convs, 3);
        let shapes = model.parameter_shapes();
        assert!(shapes.contains_key("model.0.conv.activation_post_process.zero_point"));
        assert!(!shapes.contains_key("model.1.conv.activation_post_process.zero_point"));
    }

    #[test]
    fn test_unknown_submodule_is_rejected() {
        let m = manager("modifiers:\n  - !QuantizationModifier\n    submodules: ['model.99']\n");
        let mut model = tiny_model();
        assert!(matches!(m.initialize(&mut model), Err(RecipeError::UnknownParameter(_))));
    }

    #[test]
    fn test_pruning_records_targets_without_changing_structure() {
        let m = manager(
            "modifiers:\n  - !GMPruningModifier\n    params: ['model.0.conv.weight']\n    final_sparsity: 0.7\n",
        );
        let mut model = tiny_model();
        let before = model.parameter_shapes();
        let summary = m.initialize(&mut model).unwrap();
        assert_eq!(summary.pruning_targets, vec![("model.0.conv.weight".to_string(), 0.7)]);
        assert!(!summary.is_quantized());
        assert_eq!(model.parameter_shapes(), before);
    }

    #[test]
    fn test_pruning_all_selects_conv_weights() {
        let m = manager("modifiers:\n  - !GMPruningModifier\n    params: ['__ALL__']\n    final_sparsity: 0.5\n");
        let mut model = tiny_model();
        let summary = m.initialize(&mut model).unwrap();
        // seven backbone/head convs plus two detection convs
        assert_eq!(summary.pruning_targets.len(), 9);
    }

    #[test]
    fn test_pruning_rejects_unknown_parameter_and_bad_sparsity() {
        let mut model = tiny_model();
        let m = manager("modifiers:\n  - !GMPruningModifier\n    params: ['nope']\n    final_sparsity: 0.5\n");
        assert!(matches!(m.initialize(&mut model), Err(RecipeError::UnknownParameter(_))));

        let m = manager(
            "modifiers:\n  - !GMPruningModifier\n    params: ['model.0.conv.weight']\n    final_sparsity: 1.5\n",
        );
        assert!(matches!(m.initialize(&mut model), Err(RecipeError::Invalid(_))));
    }
}
