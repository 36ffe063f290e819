//! Export pipeline for detection-model checkpoints.
//!
//! A checkpoint is resolved into a [`model::DetectionModel`], optionally
//! rewritten by a sparsification recipe, transformed for export and then
//! handed to each format backend in turn. A failing backend is recorded in
//! the [`pipeline::ExportReport`] and never stops the others.

pub mod cli;
pub mod config;
pub mod error;
pub mod exporter;
pub mod ir;
pub mod loader;
pub mod model;
pub mod optimizer;
pub mod pipeline;
pub mod sparsify;
pub mod transform;
pub mod verifier;

pub use config::{Device, ExportConfig};
pub use error::ExportError;
pub use pipeline::{ExportPipeline, ExportReport};
