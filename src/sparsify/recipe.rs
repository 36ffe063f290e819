use std::path::Path;

use serde::{Deserialize, Serialize};

use super::RecipeError;

fn unscheduled() -> f64 {
    -1.0
}

fn unit_frequency() -> f64 {
    1.0
}

/// Quantization-aware training: fake-quantize convolution weights and inputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantizationModifier {
    #[serde(default = "unscheduled")]
    pub start_epoch: f64,
    /// Top-level layers to quantize (`model.{i}`); all when absent.
    #[serde(default)]
    pub submodules: Option<Vec<String>>,
    #[serde(default)]
    pub enable_on_initialize: bool,
    #[serde(default)]
    pub freeze_bn_stats_epoch: Option<f64>,
    #[serde(default)]
    pub disable_quantization_observer_epoch: Option<f64>,
}

/// Gradual magnitude pruning of the listed parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PruningModifier {
    pub params: Vec<String>,
    #[serde(default)]
    pub init_sparsity: f64,
    pub final_sparsity: f64,
    #[serde(default = "unscheduled")]
    pub start_epoch: f64,
    #[serde(default = "unscheduled")]
    pub end_epoch: f64,
    #[serde(default = "unit_frequency")]
    pub update_frequency: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochRangeModifier {
    pub start_epoch: f64,
    pub end_epoch: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Modifier {
    #[serde(rename = "QuantizationModifier")]
    Quantization(QuantizationModifier),
    #[serde(rename = "GMPruningModifier")]
    Pruning(PruningModifier),
    #[serde(rename = "EpochRangeModifier")]
    EpochRange(EpochRangeModifier),
}

/// A sparsification recipe. Modifiers may be listed under `modifiers` or
/// grouped under the conventional `*_modifiers` keys.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Recipe {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub modifiers: Vec<Modifier>,
    #[serde(default)]
    pub training_modifiers: Vec<Modifier>,
    #[serde(default)]
    pub pruning_modifiers: Vec<Modifier>,
    #[serde(default)]
    pub quantization_modifiers: Vec<Modifier>,
}

impl Recipe {
    pub fn from_yaml(yaml: &str) -> Result<Self, RecipeError> {
        serde_yaml::from_str(yaml).map_err(|e| RecipeError::Parse(e.to_string()))
    }

    pub fn from_file(path: &Path) -> Result<Self, RecipeError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml(&text)
    }

    /// All modifiers in declaration order, groups flattened.
    pub fn into_modifiers(self) -> Vec<Modifier> {
        let mut all = self.modifiers;
        all.extend(self.training_modifiers);
        all.extend(self.pruning_modifiers);
        all.extend(self.quantization_modifiers);
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RECIPE: &str = r#"
version: 1.1.0
modifiers:
  - !EpochRangeModifier
    start_epoch: 0.0
    end_epoch: 10.0
  - !GMPruningModifier
    params: ["model.0.conv.weight"]
    final_sparsity: 0.5
    start_epoch: 0.0
    end_epoch: 5.0
quantization_modifiers:
  - !QuantizationModifier
    start_epoch: 8.0
    submodules: ["model.0"]
"#;

    #[test]
    fn test_parse_tagged_modifiers() {
        let recipe = Recipe::from_yaml(RECIPE).unwrap();
        assert_eq!(recipe.version.as_deref(), Some("1.1.0"));
        let modifiers = recipe.into_modifiers();
        assert_eq!(modifiers.len(), 3);
        match &modifiers[2] {
            Modifier::Quantization(q) => {
                assert_eq!(q.start_epoch, 8.0);
                assert!(!q.enable_on_initialize);
                assert_eq!(q.submodules.as_deref(), Some(&["model.0".to_string()][..]));
            }
            other => panic!("unexpected modifier {other:?}"),
        }
        match &modifiers[1] {
            Modifier::Pruning(p) => {
                assert_eq!(p.init_sparsity, 0.0);
                assert_eq!(p.update_frequency, 1.0);
            }
            other => panic!("unexpected modifier {other:?}"),
        }
    }

    #[test]
    fn test_unknown_modifier_tag_is_a_parse_error() {
        let yaml = "modifiers:\n  - !LearningRateModifier\n    init_lr: 0.1\n";
        assert!(matches!(Recipe::from_yaml(yaml), Err(RecipeError::Parse(_))));
    }
}
