use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use thiserror::Error;
use tracing::warn;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("image size takes one or two positive integers, got {0:?}")]
    ImageSize(Vec<u32>),
    #[error("image size {0} cannot be rounded up to a multiple of stride {1}")]
    ImageSizeOverflow(u32, u32),
    #[error("batch size must be at least 1")]
    BatchSize,
    #[error("a sparsification recipe cannot be combined with {0}")]
    RecipeConflict(&'static str),
    #[error("invalid device {0:?}")]
    InvalidDevice(String),
    #[error("device {0} requested but only the CPU is available")]
    DeviceUnavailable(Device),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Device {
    Cpu,
    Cuda(Vec<usize>),
}

impl FromStr for Device {
    type Err = ConfigError;

    /// Accepts `cpu`, an empty string, or CUDA ordinals such as `0` or `0,1`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        let ordinals = s.strip_prefix("cuda:").unwrap_or(&s);
        if s.is_empty() || s == "cpu" {
            return Ok(Device::Cpu);
        }
        ordinals
            .split(',')
            .map(|d| d.trim().parse::<usize>())
            .collect::<Result<Vec<_>, _>>()
            .map(Device::Cuda)
            .map_err(|_| ConfigError::InvalidDevice(s.clone()))
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Cuda(ids) => {
                let ids: Vec<String> = ids.iter().map(|i| i.to_string()).collect();
                write!(f, "cuda:{}", ids.join(","))
            }
        }
    }
}

/// Options of one export run. Built once through [`ExportConfigBuilder`]
/// and read-only afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportConfig {
    weights: PathBuf,
    image_size: (u32, u32),
    batch_size: usize,
    dynamic: bool,
    grid: bool,
    device: Device,
    cfg: Option<PathBuf>,
    recipe: Option<PathBuf>,
}

impl ExportConfig {
    pub fn builder(weights: impl Into<PathBuf>) -> ExportConfigBuilder {
        ExportConfigBuilder {
            weights: weights.into(),
            image_size: vec![640, 640],
            batch_size: 1,
            dynamic: false,
            grid: false,
            device: String::from("cpu"),
            cfg: None,
            recipe: None,
        }
    }

    pub fn weights(&self) -> &Path {
        &self.weights
    }

    /// `(height, width)`.
    pub fn image_size(&self) -> (u32, u32) {
        self.image_size
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn dynamic(&self) -> bool {
        self.dynamic
    }

    pub fn grid(&self) -> bool {
        self.grid
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn cfg(&self) -> Option<&Path> {
        self.cfg.as_deref()
    }

    pub fn recipe(&self) -> Option<&Path> {
        self.recipe.as_deref()
    }

    /// Zero sample input shape, `(batch, 3, height, width)`.
    pub fn sample_shape(&self) -> [usize; 4] {
        let (h, w) = self.image_size;
        [self.batch_size, 3, h as usize, w as usize]
    }

    /// Output path next to the weights: `dir/yolov5s.pt` with suffix
    /// `.onnx` becomes `dir/yolov5s.onnx`.
    pub fn output_path(&self, suffix: &str) -> PathBuf {
        let stem = self
            .weights
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.weights.with_file_name(format!("{stem}{suffix}"))
    }

    /// Copy with both image dimensions rounded up to a multiple of `stride`.
    pub fn with_checked_image_size(&self, stride: u32) -> Result<ExportConfig, ConfigError> {
        let stride = stride.max(1);
        let round = |x: u32| {
            x.div_ceil(stride)
                .checked_mul(stride)
                .ok_or(ConfigError::ImageSizeOverflow(x, stride))
        };
        let (h, w) = self.image_size;
        let checked = (round(h)?, round(w)?);
        if checked != self.image_size {
            warn!(
                "image size {:?} must be a multiple of max stride {stride}, updating to {:?}",
                self.image_size, checked
            );
        }
        Ok(ExportConfig {
            image_size: checked,
            ..self.clone()
        })
    }
}

#[derive(Debug, Clone)]
pub struct ExportConfigBuilder {
    weights: PathBuf,
    image_size: Vec<u32>,
    batch_size: usize,
    dynamic: bool,
    grid: bool,
    device: String,
    cfg: Option<PathBuf>,
    recipe: Option<PathBuf>,
}

impl ExportConfigBuilder {
    /// One value for a square image, two for `(height, width)`.
    pub fn image_size(mut self, size: Vec<u32>) -> Self {
        self.image_size = size;
        self
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn dynamic(mut self, dynamic: bool) -> Self {
        self.dynamic = dynamic;
        self
    }

    pub fn grid(mut self, grid: bool) -> Self {
        self.grid = grid;
        self
    }

    pub fn device(mut self, device: impl Into<String>) -> Self {
        self.device = device.into();
        self
    }

    pub fn cfg(mut self, cfg: Option<PathBuf>) -> Self {
        self.cfg = cfg;
        self
    }

    pub fn recipe(mut self, recipe: Option<PathBuf>) -> Self {
        self.recipe = recipe;
        self
    }

    /// Validates option combinations. Touches no files.
    pub fn build(self) -> Result<ExportConfig, ConfigError> {
        let image_size = match self.image_size.as_slice() {
            [s] if *s > 0 => (*s, *s),
            [h, w] if *h > 0 && *w > 0 => (*h, *w),
            _ => return Err(ConfigError::ImageSize(self.image_size)),
        };
        if self.batch_size == 0 {
            return Err(ConfigError::BatchSize);
        }
        if self.recipe.is_some() {
            if self.dynamic {
                return Err(ConfigError::RecipeConflict("dynamic axes"));
            }
            if self.grid {
                return Err(ConfigError::RecipeConflict("grid export"));
            }
        }
        let device: Device = self.device.parse()?;
        if device != Device::Cpu {
            return Err(ConfigError::DeviceUnavailable(device));
        }

        Ok(ExportConfig {
            weights: self.weights,
            image_size,
            batch_size: self.batch_size,
            dynamic: self.dynamic,
            grid: self.grid,
            device,
            cfg: self.cfg,
            recipe: self.recipe,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_image_size_expands_to_square() {
        let cfg = ExportConfig::builder("yolov5s.pt")
            .image_size(vec![416])
            .build()
            .unwrap();
        assert_eq!(cfg.image_size(), (416, 416));
        assert_eq!(cfg.sample_shape(), [1, 3, 416, 416]);
    }

    #[test]
    fn test_defaults() {
        let cfg = ExportConfig::builder("yolov5s.pt").build().unwrap();
        assert_eq!(cfg.image_size(), (640, 640));
        assert_eq!(cfg.batch_size(), 1);
        assert_eq!(cfg.device(), &Device::Cpu);
        assert!(!cfg.dynamic() && !cfg.grid());
    }

    #[test]
    fn test_invalid_sizes_rejected() {
        for size in [vec![], vec![1, 2, 3], vec![0]] {
            let err = ExportConfig::builder("w.pt").image_size(size).build().unwrap_err();
            assert!(matches!(err, ConfigError::ImageSize(_)));
        }
        let err = ExportConfig::builder("w.pt").batch_size(0).build().unwrap_err();
        assert_eq!(err, ConfigError::BatchSize);
    }

    #[test]
    fn test_recipe_conflicts_fail_before_io() {
        let recipe = Some(PathBuf::from("/nonexistent/recipe.yaml"));
        let err = ExportConfig::builder("/nonexistent/w.pt")
            .recipe(recipe.clone())
            .dynamic(true)
            .build()
            .unwrap_err();
        assert_eq!(err, ConfigError::RecipeConflict("dynamic axes"));

        let err = ExportConfig::builder("/nonexistent/w.pt")
            .recipe(recipe)
            .grid(true)
            .build()
            .unwrap_err();
        assert_eq!(err, ConfigError::RecipeConflict("grid export"));
    }

    #[test]
    fn test_device_parsing() {
        assert_eq!("".parse::<Device>().unwrap(), Device::Cpu);
        assert_eq!("CPU".parse::<Device>().unwrap(), Device::Cpu);
        assert_eq!("0,1".parse::<Device>().unwrap(), Device::Cuda(vec![0, 1]));
        assert_eq!("cuda:2".parse::<Device>().unwrap(), Device::Cuda(vec![2]));
        assert!("gpu".parse::<Device>().is_err());

        let err = ExportConfig::builder("w.pt").device("0").build().unwrap_err();
        assert_eq!(err, ConfigError::DeviceUnavailable(Device::Cuda(vec![0])));
    }

    #[test]
    fn test_checked_image_size_rounds_up() {
        let cfg = ExportConfig::builder("w.pt").image_size(vec![400, 640]).build().unwrap();
        let checked = cfg.with_checked_image_size(32).unwrap();
        assert_eq!(checked.image_size(), (416, 640));
        assert_eq!(cfg.image_size(), (400, 640));
        assert_eq!(checked.with_checked_image_size(32).unwrap(), checked);
    }

    #[test]
    fn test_checked_image_size_overflow_is_an_error() {
        let cfg = ExportConfig::builder("w.pt").image_size(vec![u32::MAX, 640]).build().unwrap();
        assert_eq!(
            cfg.with_checked_image_size(32).unwrap_err(),
            ConfigError::ImageSizeOverflow(u32::MAX, 32)
        );
        let exact = ExportConfig::builder("w.pt").image_size(vec![u32::MAX]).build().unwrap();
        assert!(exact.with_checked_image_size(1).is_ok());
    }

    #[test]
    fn test_output_path_substitutes_extension() {
        let cfg = ExportConfig::builder("runs/yolov5s.pt").build().unwrap();
        assert_eq!(cfg.output_path(".torchscript.pt"), PathBuf::from("runs/yolov5s.torchscript.pt"));
        assert_eq!(cfg.output_path(".onnx"), PathBuf::from("runs/yolov5s.onnx"));
    }
}
