use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use ndarray::{ArrayD, IxDyn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::warn;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::loader::{
    CheckpointDescriptor, CheckpointPayload, LoaderError, ModelLoader, PackagedModel,
};
use crate::model::{ArchitectureConfig, StateDict};

/// Zip layout shared by checkpoints and traced modules: `<root>/data.pkl`
/// holds a pickled index and `<root>/data/<key>` holds raw storages.
pub struct PickleArchive {
    archive: ZipArchive<File>,
    root: String,
}

impl PickleArchive {
    pub fn open(path: &Path) -> Result<Self, LoaderError> {
        let file = File::open(path)?;
        let mut archive = ZipArchive::new(file)
            .map_err(|e| LoaderError::InvalidFormat(e.to_string()))?;

        let mut root = None;
        for i in 0..archive.len() {
            let file = archive.by_index(i)
                .map_err(|e| LoaderError::InvalidFormat(e.to_string()))?;
            if let Some(prefix) = file.name().strip_suffix("data.pkl") {
                root = Some(prefix.to_string());
                break;
            }
        }

        let root = root.ok_or_else(|| {
            LoaderError::InvalidFormat("data.pkl not found in archive".to_string())
        })?;
        Ok(Self { archive, root })
    }

    pub fn has_entry(&mut self, name: &str) -> bool {
        let full = format!("{}{}", self.root, name);
        self.archive.by_name(&full).is_ok()
    }

    pub fn read_entry(&mut self, name: &str) -> Result<Vec<u8>, LoaderError> {
        let full = format!("{}{}", self.root, name);
        let mut file = self.archive.by_name(&full)
            .map_err(|e| LoaderError::InvalidFormat(format!("{full}: {e}")))?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;
        Ok(buf)
    }

    pub fn index<T: DeserializeOwned>(&mut self) -> Result<T, LoaderError> {
        let data = self.read_entry("data.pkl")?;
        serde_pickle::from_slice(&data, serde_pickle::DeOptions::default())
            .map_err(|e| LoaderError::InvalidFormat(e.to_string()))
    }

    pub fn storage(&mut self, key: &str) -> Result<Vec<u8>, LoaderError> {
        self.read_entry(&format!("data/{key}"))
    }
}

pub struct ArchiveWriter {
    zip: ZipWriter<File>,
    root: String,
    options: SimpleFileOptions,
}

impl ArchiveWriter {
    pub fn create(path: &Path, root: &str) -> Result<Self, LoaderError> {
        let file = File::create(path)?;
        Ok(Self {
            zip: ZipWriter::new(file),
            root: root.to_string(),
            options: SimpleFileOptions::default().compression_method(CompressionMethod::Stored),
        })
    }

    pub fn write_entry(&mut self, name: &str, bytes: &[u8]) -> Result<(), LoaderError> {
        self.zip
            .start_file(format!("{}/{}", self.root, name), self.options)
            .map_err(|e| LoaderError::InvalidFormat(e.to_string()))?;
        self.zip.write_all(bytes)?;
        Ok(())
    }

    pub fn write_index<T: Serialize>(&mut self, index: &T) -> Result<(), LoaderError> {
        let bytes = serde_pickle::to_vec(index, serde_pickle::SerOptions::new())
            .map_err(|e| LoaderError::InvalidFormat(e.to_string()))?;
        self.write_entry("data.pkl", &bytes)
    }

    pub fn write_storage(&mut self, key: &str, bytes: &[u8]) -> Result<(), LoaderError> {
        self.write_entry(&format!("data/{key}"), bytes)
    }

    pub fn finish(mut self) -> Result<(), LoaderError> {
        self.zip
            .finish()
            .map_err(|e| LoaderError::InvalidFormat(e.to_string()))?;
        Ok(())
    }
}

/// On-disk element type of checkpoint storages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageType {
    Float32,
    Float16,
}

impl StorageType {
    fn tag(self) -> &'static str {
        match self {
            StorageType::Float32 => "float32",
            StorageType::Float16 => "float16",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StorageRef {
    dtype: String,
    shape: Vec<usize>,
    key: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CheckpointIndex {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    model: Option<ModelEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    state_dict: Option<BTreeMap<String, StorageRef>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    yaml: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    epoch: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum ModelEntry {
    Module {
        yaml: String,
        #[serde(default)]
        names: Vec<String>,
        state: BTreeMap<String, StorageRef>,
        #[serde(default)]
        non_persistent_buffers: BTreeMap<String, Vec<String>>,
    },
    StateDict {
        state: BTreeMap<String, StorageRef>,
    },
}

fn decode_storage(bytes: &[u8], storage: &StorageRef) -> Result<ArrayD<f32>, LoaderError> {
    let values: Vec<f32> = match storage.dtype.as_str() {
        "float32" => bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
        "float16" => bytes
            .chunks_exact(2)
            .map(|c| half::f16::from_le_bytes([c[0], c[1]]).to_f32())
            .collect(),
        other => {
            return Err(LoaderError::UnsupportedVersion(format!("storage dtype {other}")));
        }
    };
    ArrayD::from_shape_vec(IxDyn(&storage.shape), values).map_err(|e| {
        LoaderError::InvalidFormat(format!("storage {}: {e}", storage.key))
    })
}

fn encode_storage(tensor: &ArrayD<f32>, storage: StorageType) -> Vec<u8> {
    match storage {
        StorageType::Float32 => tensor.iter().flat_map(|v| v.to_le_bytes()).collect(),
        StorageType::Float16 => tensor
            .iter()
            .flat_map(|v| half::f16::from_f32(*v).to_le_bytes())
            .collect(),
    }
}

fn read_state(
    archive: &mut PickleArchive,
    refs: &BTreeMap<String, StorageRef>,
) -> Result<StateDict, LoaderError> {
    let mut state = StateDict::new();
    for (name, storage) in refs {
        let bytes = archive.storage(&storage.key)?;
        state.insert(name.clone(), decode_storage(&bytes, storage)?);
    }
    Ok(state)
}

fn write_state(
    writer: &mut ArchiveWriter,
    state: &StateDict,
    storage: StorageType,
    next_key: &mut usize,
) -> Result<BTreeMap<String, StorageRef>, LoaderError> {
    let mut refs = BTreeMap::new();
    for (name, tensor) in state {
        let key = next_key.to_string();
        *next_key += 1;
        writer.write_storage(&key, &encode_storage(tensor, storage))?;
        refs.insert(
            name.clone(),
            StorageRef {
                dtype: storage.tag().to_string(),
                shape: tensor.shape().to_vec(),
                key,
            },
        );
    }
    Ok(refs)
}

pub struct PytorchLoader;

impl ModelLoader for PytorchLoader {
    fn load<P: AsRef<Path>>(path: P) -> Result<CheckpointDescriptor, LoaderError> {
        let mut archive = PickleArchive::open(path.as_ref())?;
        let index: CheckpointIndex = archive.index()?;

        let payload = match index.model {
            Some(ModelEntry::Module { yaml, names, state, non_persistent_buffers }) => {
                let packaged = PackagedModel {
                    config: ArchitectureConfig::from_yaml(&yaml)?,
                    state: read_state(&mut archive, &state)?,
                    names,
                    non_persistent_buffers,
                };
                match &index.state_dict {
                    Some(refs) => CheckpointPayload::Both(packaged, read_state(&mut archive, refs)?),
                    None => CheckpointPayload::PackagedModel(packaged),
                }
            }
            Some(ModelEntry::StateDict { state }) => {
                if index.state_dict.is_some() {
                    warn!("checkpoint holds a bare model state dict; ignoring its top-level state_dict");
                }
                CheckpointPayload::RawWeights(read_state(&mut archive, &state)?)
            }
            None => match &index.state_dict {
                Some(refs) => CheckpointPayload::RawWeights(read_state(&mut archive, refs)?),
                None => {
                    return Err(LoaderError::InvalidFormat(
                        "checkpoint holds neither a model nor a state dict".to_string(),
                    ));
                }
            },
        };

        let architecture_config = index
            .yaml
            .as_deref()
            .map(ArchitectureConfig::from_yaml)
            .transpose()?;
        if let Some(epoch) = index.epoch {
            tracing::debug!(epoch, "checkpoint epoch");
        }

        Ok(CheckpointDescriptor {
            payload,
            architecture_config,
        })
    }
}

impl PytorchLoader {
    /// Writes `descriptor` in the layout `load` reads.
    pub fn save<P: AsRef<Path>>(
        path: P,
        descriptor: &CheckpointDescriptor,
        storage: StorageType,
    ) -> Result<(), LoaderError> {
        let mut writer = ArchiveWriter::create(path.as_ref(), "archive")?;
        let mut next_key = 0;
        let mut index = CheckpointIndex {
            epoch: Some(-1),
            ..Default::default()
        };

        let packaged = descriptor.packaged();
        if let Some(p) = packaged {
            index.model = Some(ModelEntry::Module {
                yaml: p.config.to_yaml()?,
                names: p.names.clone(),
                state: write_state(&mut writer, &p.state, storage, &mut next_key)?,
                non_persistent_buffers: p.non_persistent_buffers.clone(),
            });
        }
        if let Some(raw) = descriptor.raw_weights() {
            let refs = write_state(&mut writer, raw, storage, &mut next_key)?;
            if packaged.is_some() {
                index.state_dict = Some(refs);
            } else {
                index.model = Some(ModelEntry::StateDict { state: refs });
            }
        }
        if let Some(cfg) = &descriptor.architecture_config {
            index.yaml = Some(cfg.to_yaml()?);
        }

        writer.write_index(&index)?;
        writer.write_entry("version", b"3\n")?;
        writer.finish()
    }
}
