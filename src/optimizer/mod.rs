use crate::ir::ModelIR;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum OptimizerError {
    #[error("Optimization error: {0}")]
    Error(String),
    #[error("Pattern not found: {0}")]
    PatternNotFound(String),
}

pub trait OptimizationPass {
    fn name(&self) -> &'static str;
    fn apply(&self, ir: &mut ModelIR) -> Result<(), OptimizerError>;
}

pub mod constant_folding;
pub mod dce;
pub mod fusion;
pub mod quantization;

pub use constant_folding::ConstantFolding;
pub use dce::DeadCodeElimination;
pub use fusion::ConvBatchNormFusion;
pub use quantization::SkipInputQuantize;

#[derive(Default)]
pub struct Optimizer {
    passes: Vec<Box<dyn OptimizationPass>>,
}

impl Optimizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pass(mut self, pass: impl OptimizationPass + 'static) -> Self {
        self.passes.push(Box::new(pass));
        self
    }

    pub fn optimize(&self, ir: &mut ModelIR) -> Result<(), OptimizerError> {
        for pass in &self.passes {
            let before = ir.nodes.len();
            pass.apply(ir)?;
            tracing::debug!(pass = pass.name(), nodes_before = before, nodes_after = ir.nodes.len(), "optimization pass");
        }
        Ok(())
    }
}
