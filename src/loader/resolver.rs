use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::config::ExportConfig;
use crate::loader::{read_checkpoint, LoaderError};
use crate::model::{ArchitectureConfig, DetectionModel};
use crate::sparsify::{Recipe, ScheduledModifierManager, SparsificationSummary};

/// Makes a weights file available locally, e.g. by downloading it.
pub trait WeightSource {
    fn ensure_local(&self, path: &Path) -> Result<PathBuf, LoaderError>;
}

/// Weights that must already be on disk.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalWeights;

impl WeightSource for LocalWeights {
    fn ensure_local(&self, path: &Path) -> Result<PathBuf, LoaderError> {
        if path.is_file() {
            Ok(path.to_path_buf())
        } else {
            Err(LoaderError::NotFound(path.to_path_buf()))
        }
    }
}

/// A model with weights loaded, plus what the recipe did to it, if any.
#[derive(Debug)]
pub struct ResolvedModel {
    pub model: DetectionModel,
    pub sparsification: Option<SparsificationSummary>,
}

pub struct CheckpointResolver<W: WeightSource = LocalWeights> {
    source: W,
}

impl Default for CheckpointResolver<LocalWeights> {
    fn default() -> Self {
        Self::new(LocalWeights)
    }
}

impl<W: WeightSource> CheckpointResolver<W> {
    pub fn new(source: W) -> Self {
        Self { source }
    }

    pub fn resolve(&self, config: &ExportConfig) -> Result<ResolvedModel, LoaderError> {
        let path = self.source.ensure_local(config.weights())?;
        let descriptor = read_checkpoint(&path)?;
        let override_config = config.cfg().map(ArchitectureConfig::from_file).transpose()?;
        let packaged = descriptor.packaged();

        let (architecture, state) = match (packaged, override_config) {
            (Some(p), None) => {
                debug!("instantiating packaged model");
                (p.config.clone(), &p.state)
            }
            (packaged, override_config) => {
                let architecture = override_config
                    .or_else(|| packaged.map(|p| p.config.clone()))
                    .or_else(|| descriptor.architecture_config.clone())
                    .ok_or_else(|| LoaderError::MissingArchitecture(path.clone()))?;
                let state = match packaged {
                    Some(p) => &p.state,
                    None => descriptor
                        .raw_weights()
                        .ok_or_else(|| LoaderError::MissingArchitecture(path.clone()))?,
                };
                (architecture, state)
            }
        };

        let mut model = DetectionModel::from_config(&architecture)?;
        if let Some(p) = packaged {
            model.set_non_persistent_buffers(&p.non_persistent_buffers);
            if !p.names.is_empty() {
                model.set_names(p.names.clone());
            }
        }

        // Recipe-trained weights carry observer parameters, so the rewrite
        // has to happen before the strict load.
        let sparsification = match config.recipe() {
            Some(recipe_path) => {
                let recipe = Recipe::from_file(recipe_path)?;
                let summary = ScheduledModifierManager::from_recipe(recipe).initialize(&mut model)?;
                Some(summary)
            }
            None => None,
        };

        model.load_state_dict(state)?;
        debug!("parameters are f32, precision cast is a no-op");
        info!(
            "loaded {} ({} parameters, {} classes)",
            path.display(),
            model.parameter_shapes().len(),
            model.names().len()
        );

        Ok(ResolvedModel {
            model,
            sparsification,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::pytorch::{PytorchLoader, StorageType};
    use crate::loader::safetensors::SafetensorsLoader;
    use crate::loader::{CheckpointDescriptor, CheckpointPayload, PackagedModel};
    use crate::model::config::TINY_YAML;
    use crate::model::tests::{seeded_state, tiny_model};
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn packaged_descriptor(names: Vec<String>) -> CheckpointDescriptor {
        let model = tiny_model();
        CheckpointDescriptor {
            payload: CheckpointPayload::PackagedModel(PackagedModel {
                config: model.config().clone(),
                state: seeded_state(&model),
                names,
                non_persistent_buffers: BTreeMap::new(),
            }),
            architecture_config: None,
        }
    }

    #[test]
    fn test_packaged_checkpoint_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("model.pt");
        let descriptor = packaged_descriptor(vec!["a".into(), "b".into(), "c".into()]);
        PytorchLoader::save(&path, &descriptor, StorageType::Float32).unwrap();

        let config = ExportConfig::builder(&path).build().unwrap();
        let resolved = CheckpointResolver::default().resolve(&config).unwrap();
        assert_eq!(resolved.model.state_dict(), descriptor.packaged().unwrap().state);
        assert_eq!(resolved.model.names(), &["a", "b", "c"]);
        assert!(resolved.sparsification.is_none());
    }

    #[test]
    fn test_raw_weights_without_config_fail() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("raw.safetensors");
        SafetensorsLoader::save(&path, &seeded_state(&tiny_model()), None).unwrap();

        let config = ExportConfig::builder(&path).build().unwrap();
        let err = CheckpointResolver::default().resolve(&config).unwrap_err();
        assert!(matches!(err, LoaderError::MissingArchitecture(_)));
        assert!(err.to_string().contains("no embedded module"));
    }

    #[test]
    fn test_raw_weights_with_override_config() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("raw.safetensors");
        let cfg_path = dir.path().join("model.yaml");
        std::fs::write(&cfg_path, TINY_YAML).unwrap();
        let state = seeded_state(&tiny_model());
        SafetensorsLoader::save(&path, &state, None).unwrap();

        let config = ExportConfig::builder(&path).cfg(Some(cfg_path)).build().unwrap();
        let resolved = CheckpointResolver::default().resolve(&config).unwrap();
        assert_eq!(resolved.model.state_dict(), state);
        assert_eq!(resolved.model.names(), &["class0", "class1", "class2"]);
    }

    #[test]
    fn test_embedded_config_used_for_raw_weights() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("raw.safetensors");
        let model = tiny_model();
        SafetensorsLoader::save(&path, &seeded_state(&model), Some(model.config())).unwrap();

        let config = ExportConfig::builder(&path).build().unwrap();
        assert!(CheckpointResolver::default().resolve(&config).is_ok());
    }

    #[test]
    fn test_strict_load_rejects_extra_tensor() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("raw.safetensors");
        let model = tiny_model();
        let mut state = seeded_state(&model);
        state.insert("model.0.extra".to_string(), ndarray::ArrayD::zeros(ndarray::IxDyn(&[1])));
        SafetensorsLoader::save(&path, &state, Some(model.config())).unwrap();

        let config = ExportConfig::builder(&path).build().unwrap();
        let err = CheckpointResolver::default().resolve(&config).unwrap_err();
        match err {
            LoaderError::WeightMismatch(m) => assert_eq!(m.unexpected, vec!["model.0.extra"]),
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn test_missing_weights_file() {
        let config = ExportConfig::builder("/nonexistent/w.pt").build().unwrap();
        let err = CheckpointResolver::default().resolve(&config).unwrap_err();
        assert!(matches!(err, LoaderError::NotFound(_)));
    }

    #[test]
    fn test_recipe_applied_before_strict_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("qat.safetensors");
        let recipe_path = dir.path().join("recipe.yaml");
        std::fs::write(&recipe_path, "modifiers:\n  - !QuantizationModifier\n    start_epoch: 5.0\n").unwrap();

        let mut quantized = tiny_model();
        ScheduledModifierManager::from_recipe(Recipe::from_file(&recipe_path).unwrap())
            .initialize(&mut quantized)
            .unwrap();
        let state = seeded_state(&quantized);
        SafetensorsLoader::save(&path, &state, Some(quantized.config())).unwrap();

        let config = ExportConfig::builder(&path).recipe(Some(recipe_path)).build().unwrap();
        let resolved = CheckpointResolver::default().resolve(&config).unwrap();
        assert!(resolved.sparsification.unwrap().is_quantized());
        assert_eq!(resolved.model.state_dict(), state);

        // the same weights do not fit an unquantized model
        let plain = ExportConfig::builder(&path).build().unwrap();
        assert!(matches!(
            CheckpointResolver::default().resolve(&plain),
            Err(LoaderError::WeightMismatch(_))
        ));
    }
}
