use std::path::PathBuf;

use clap::Parser;

use crate::config::{ConfigError, ExportConfig};

#[derive(Parser, Debug)]
#[command(name = "torchexport")]
#[command(about = "Export a detection checkpoint to TorchScript, ONNX and CoreML")]
pub struct Args {
    /// Weights path
    #[arg(long, default_value = "./yolov3.pt")]
    pub weights: PathBuf,

    /// Image size: one value for a square, or height and width
    #[arg(long = "img-size", num_args = 1..=2, default_values_t = [640, 640])]
    pub img_size: Vec<u32>,

    #[arg(long, default_value_t = 1)]
    pub batch_size: usize,

    /// Dynamic ONNX axes
    #[arg(long)]
    pub dynamic: bool,

    /// Export the Detect layer grid
    #[arg(long)]
    pub grid: bool,

    /// Device, i.e. 0 or 0,1,2,3 or cpu
    #[arg(long, default_value = "cpu")]
    pub device: String,

    /// Optional model.yaml path
    #[arg(long)]
    pub cfg: Option<PathBuf>,

    /// Sparsification recipe the model was trained with
    #[arg(long = "sparseml-recipe")]
    pub sparseml_recipe: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Print the report as JSON
    #[arg(long)]
    pub json: bool,
}

impl Args {
    pub fn to_config(&self) -> Result<ExportConfig, ConfigError> {
        ExportConfig::builder(self.weights.clone())
            .image_size(self.img_size.clone())
            .batch_size(self.batch_size)
            .dynamic(self.dynamic)
            .grid(self.grid)
            .device(self.device.as_str())
            .cfg(self.cfg.clone())
            .recipe(self.sparseml_recipe.clone())
            .build()
    }
}
