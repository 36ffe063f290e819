//! One export run: resolve, transform, then hand the model to the backends.

use std::fmt;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::info;

use crate::config::ExportConfig;
use crate::error::ExportError;
use crate::exporter::{CoremlConverter, ExportResult, Sequencer, UnavailableConverter};
use crate::loader::{CheckpointResolver, LocalWeights, WeightSource};
use crate::sparsify::SparsificationSummary;
use crate::transform::{zero_sample, ExportModeTransformer};

#[derive(Debug, Clone, Serialize)]
pub struct ExportReport {
    pub results: Vec<ExportResult>,
    pub labels: Vec<String>,
    pub image_size: (u32, u32),
    #[serde(serialize_with = "as_secs")]
    pub elapsed: Duration,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sparsification: Option<SparsificationSummary>,
}

fn as_secs<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64())
}

impl ExportReport {
    pub fn result(&self, backend: &str) -> Option<&ExportResult> {
        self.results.iter().find(|r| r.backend == backend)
    }
}

impl fmt::Display for ExportReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for r in &self.results {
            match (r.output_path(), r.error_detail()) {
                (Some(path), _) => writeln!(f, "{} export success, saved as {}", r.backend, path.display())?,
                (None, Some(error)) => writeln!(f, "{} export failure: {error}", r.backend)?,
                (None, None) => {}
            }
        }
        write!(
            f,
            "\nExport complete ({:.2}s). Visualize with https://github.com/lutzroeder/netron.",
            self.elapsed.as_secs_f64()
        )
    }
}

pub struct ExportPipeline<W: WeightSource = LocalWeights> {
    resolver: CheckpointResolver<W>,
    converter: Box<dyn CoremlConverter>,
}

impl Default for ExportPipeline {
    fn default() -> Self {
        Self::new(CheckpointResolver::default())
    }
}

impl<W: WeightSource> ExportPipeline<W> {
    pub fn new(resolver: CheckpointResolver<W>) -> Self {
        Self {
            resolver,
            converter: Box::new(UnavailableConverter),
        }
    }

    pub fn with_converter(mut self, converter: Box<dyn CoremlConverter>) -> Self {
        self.converter = converter;
        self
    }

    /// Fails only if the model cannot be loaded or transformed; backend
    /// failures are recorded in the report.
    pub fn run(self, config: &ExportConfig) -> Result<ExportReport, ExportError> {
        let start = Instant::now();
        let resolved = self.resolver.resolve(config)?;
        let mut model = resolved.model;
        if let Some(summary) = &resolved.sparsification {
            info!(
                quantized_convs = summary.quantized_convs,
                pruning_targets = summary.pruning_targets.len(),
                "applied sparsification recipe"
            );
        }

        let config = config.with_checked_image_size(model.grid_stride())?;
        let sample = zero_sample(config.sample_shape());
        let signature = ExportModeTransformer::new(config.grid()).apply(&mut model, &sample)?;

        let results = Sequencer::standard(self.converter).run(&model, &config, &sample, signature);
        Ok(ExportReport {
            results,
            labels: model.names().to_vec(),
            image_size: config.image_size(),
            elapsed: start.elapsed(),
            sparsification: resolved.sparsification,
        })
    }
}
