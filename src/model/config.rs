use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_yaml::Value;

use super::ModelError;

/// Architecture description in the YOLO `model.yaml` layout: each layer is
/// `[from, number, module, args]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchitectureConfig {
    pub nc: usize,
    #[serde(default = "unit_multiple")]
    pub depth_multiple: f32,
    #[serde(default = "unit_multiple")]
    pub width_multiple: f32,
    pub anchors: Vec<Vec<f32>>,
    #[serde(default)]
    pub activation: ActivationKind,
    /// Emit separate `classes` and `boxes` outputs from the decoded head.
    #[serde(default)]
    pub split_outputs: bool,
    #[serde(default)]
    pub names: Vec<String>,
    pub backbone: Vec<LayerSpec>,
    pub head: Vec<LayerSpec>,
}

fn unit_multiple() -> f32 {
    1.0
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActivationKind {
    ReLU,
    LeakyReLU,
    Hardswish,
    #[default]
    SiLU,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerSpec(pub LayerFrom, pub usize, pub String, pub Vec<Value>);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LayerFrom {
    One(i64),
    Many(Vec<i64>),
}

impl LayerFrom {
    pub fn indices(&self) -> Vec<i64> {
        match self {
            LayerFrom::One(i) => vec![*i],
            LayerFrom::Many(v) => v.clone(),
        }
    }
}

impl ArchitectureConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self, ModelError> {
        serde_yaml::from_str(yaml).map_err(|e| ModelError::Config(e.to_string()))
    }

    pub fn from_file(path: &Path) -> Result<Self, ModelError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ModelError::Config(format!("{}: {e}", path.display())))?;
        Self::from_yaml(&text)
    }

    pub fn to_yaml(&self) -> Result<String, ModelError> {
        serde_yaml::to_string(self).map_err(|e| ModelError::Config(e.to_string()))
    }

    pub fn layers(&self) -> impl Iterator<Item = &LayerSpec> {
        self.backbone.iter().chain(self.head.iter())
    }

    /// Labels from the config, or `class{i}` placeholders.
    pub fn class_names(&self) -> Vec<String> {
        if self.names.len() == self.nc {
            self.names.clone()
        } else {
            (0..self.nc).map(|i| format!("class{i}")).collect()
        }
    }
}

#[cfg(test)]
pub(crate) const TINY_YAML: &str = r#"
nc: 3
anchors:
  - [10,14, 23,27, 37,58]
  - [81,82, 135,169, 344,319]
backbone:
  - [-1, 1, Conv, [8, 3, 2]]
  - [-1, 1, Conv, [16, 3, 2]]
  - [-1, 1, Bottleneck, [16]]
  - [-1, 1, nn.MaxPool2d, [2, 2, 0]]
  - [-1, 1, Conv, [16, 3, 2]]
  - [-1, 1, nn.MaxPool2d, [2, 2, 0]]
head:
  - [-1, 1, Conv, [16, 1, 1]]
  - [-1, 1, nn.Upsample, [None, 2, 'nearest']]
  - [[-1, 4], 1, Concat, [1]]
  - [-1, 1, Conv, [16, 3, 1]]
  - [[9, 6], 1, Detect, [nc, anchors]]
"#;
