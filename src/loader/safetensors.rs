use std::collections::HashMap;
use std::path::Path;

use ndarray::{ArrayD, IxDyn};
use safetensors::tensor::{Dtype, SafeTensors, TensorView};

use crate::loader::{CheckpointDescriptor, CheckpointPayload, LoaderError, ModelLoader};
use crate::model::{ArchitectureConfig, StateDict};

/// Metadata key holding the architecture description.
const CONFIG_KEY: &str = "yaml";

/// Bare weight files. They never carry a packaged model, only an optional
/// architecture description in the header metadata.
pub struct SafetensorsLoader;

impl ModelLoader for SafetensorsLoader {
    fn load<P: AsRef<Path>>(path: P) -> Result<CheckpointDescriptor, LoaderError> {
        let buffer = std::fs::read(path.as_ref())?;
        let (_, metadata) = SafeTensors::read_metadata(&buffer)
            .map_err(|e| LoaderError::InvalidFormat(e.to_string()))?;
        let tensors = SafeTensors::deserialize(&buffer)
            .map_err(|e| LoaderError::InvalidFormat(e.to_string()))?;

        let mut state = StateDict::new();
        for (name, view) in tensors.tensors() {
            let values: Vec<f32> = match view.dtype() {
                Dtype::F32 => view
                    .data()
                    .chunks_exact(4)
                    .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect(),
                Dtype::F16 => view
                    .data()
                    .chunks_exact(2)
                    .map(|c| half::f16::from_le_bytes([c[0], c[1]]).to_f32())
                    .collect(),
                Dtype::BF16 => view
                    .data()
                    .chunks_exact(2)
                    .map(|c| half::bf16::from_le_bytes([c[0], c[1]]).to_f32())
                    .collect(),
                other => {
                    return Err(LoaderError::UnsupportedVersion(format!(
                        "tensor {name} has dtype {other:?}"
                    )));
                }
            };
            let array = ArrayD::from_shape_vec(IxDyn(view.shape()), values)
                .map_err(|e| LoaderError::InvalidFormat(format!("{name}: {e}")))?;
            state.insert(name, array);
        }

        let architecture_config = metadata
            .metadata()
            .as_ref()
            .and_then(|m| m.get(CONFIG_KEY))
            .map(|yaml| ArchitectureConfig::from_yaml(yaml))
            .transpose()?;

        Ok(CheckpointDescriptor {
            payload: CheckpointPayload::RawWeights(state),
            architecture_config,
        })
    }
}

impl SafetensorsLoader {
    pub fn save<P: AsRef<Path>>(
        path: P,
        state: &StateDict,
        config: Option<&ArchitectureConfig>,
    ) -> Result<(), LoaderError> {
        let buffers: Vec<(String, Vec<usize>, Vec<u8>)> = state
            .iter()
            .map(|(name, t)| {
                let bytes = t.iter().flat_map(|v| v.to_le_bytes()).collect();
                (name.clone(), t.shape().to_vec(), bytes)
            })
            .collect();
        let views = buffers
            .iter()
            .map(|(name, shape, bytes)| {
                TensorView::new(Dtype::F32, shape.clone(), bytes)
                    .map(|view| (name.clone(), view))
                    .map_err(|e| LoaderError::InvalidFormat(e.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut metadata = HashMap::from([("format".to_string(), "pt".to_string())]);
        if let Some(cfg) = config {
            metadata.insert(CONFIG_KEY.to_string(), cfg.to_yaml()?);
        }
        let bytes = safetensors::serialize(views, &Some(metadata))
            .map_err(|e| LoaderError::InvalidFormat(e.to_string()))?;
        std::fs::write(path.as_ref(), bytes)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::config::TINY_YAML;
    use ndarray::arr1;
    use std::fs::File;
    use tempfile::tempdir;

    #[test]
    fn test_load_raw_weights_with_metadata_config() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("model.safetensors");
        let state = StateDict::from([
            ("model.0.conv.weight".to_string(), ArrayD::from_elem(IxDyn(&[2, 3, 1, 1]), 0.25)),
            ("model.0.bn.bias".to_string(), arr1(&[1.0f32, -1.0]).into_dyn()),
        ]);
        let cfg = ArchitectureConfig::from_yaml(TINY_YAML).unwrap();
        SafetensorsLoader::save(&path, &state, Some(&cfg)).unwrap();

        let loaded = SafetensorsLoader::load(&path).unwrap();
        assert_eq!(loaded.raw_weights(), Some(&state));
        assert_eq!(loaded.architecture_config, Some(cfg));
        assert!(loaded.packaged().is_none());
    }

    #[test]
    fn test_load_without_config() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bare.safetensors");
        let state = StateDict::from([("w".to_string(), arr1(&[3.0f32]).into_dyn())]);
        SafetensorsLoader::save(&path, &state, None).unwrap();

        let loaded = SafetensorsLoader::load(&path).unwrap();
        assert!(loaded.architecture_config.is_none());
    }

    #[test]
    fn test_empty_file_is_invalid() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("model.safetensors");
        File::create(&path).unwrap();

        let result = SafetensorsLoader::load(&path);
        assert!(matches!(result, Err(LoaderError::InvalidFormat(_))));
    }
}
