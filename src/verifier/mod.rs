//! Structural checks run on every artifact after it is written.

pub mod archive;
pub mod onnx;

use std::collections::HashSet;
use std::path::PathBuf;

use thiserror::Error;

use crate::ir::ModelIR;

#[derive(Error, Debug)]
pub enum VerifierError {
    #[error("Malformed graph: {0}")]
    Structure(String),
    #[error("Shape error: {0}")]
    Shape(String),
    #[error("Could not decode artifact: {0}")]
    Decode(String),
    #[error("artifact {} is empty", .0.display())]
    EmptyArtifact(PathBuf),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Checks that node names are unique, every node input is defined before use
/// and every graph output is produced. Empty input names mark omitted
/// optional inputs.
pub fn check_references(ir: &ModelIR) -> Result<(), VerifierError> {
    if ir.inputs.is_empty() {
        return Err(VerifierError::Structure("graph has no inputs".to_string()));
    }
    if ir.outputs.is_empty() {
        return Err(VerifierError::Structure("graph has no outputs".to_string()));
    }

    let mut defined: HashSet<&str> = ir.inputs.iter().map(|t| t.name.as_str()).collect();
    defined.extend(ir.weights.keys().map(String::as_str));
    let mut names = HashSet::new();

    for node in &ir.nodes {
        if !names.insert(node.name.as_str()) {
            return Err(VerifierError::Structure(format!("duplicate node name {}", node.name)));
        }
        for input in &node.inputs {
            if !input.is_empty() && !defined.contains(input.as_str()) {
                return Err(VerifierError::Structure(format!(
                    "node {} reads {input} before it is defined",
                    node.name
                )));
            }
        }
        for output in &node.outputs {
            if !defined.insert(output.as_str()) {
                return Err(VerifierError::Structure(format!(
                    "value {output} of node {} is defined twice",
                    node.name
                )));
            }
        }
    }

    for output in &ir.outputs {
        if !defined.contains(output.name.as_str()) {
            return Err(VerifierError::Structure(format!("graph output {} is never produced", output.name)));
        }
    }
    Ok(())
}
