use std::path::Path;

use crate::exporter::TracedModule;
use crate::verifier::{check_references, VerifierError};

/// Reloads a traced-graph archive and checks its graph. Storage sizes are
/// validated while loading.
pub fn check_archive(path: &Path) -> Result<TracedModule, VerifierError> {
    let module = TracedModule::load(path).map_err(|e| VerifierError::Decode(e.to_string()))?;
    for (name, tensor) in &module.graph.weights {
        if tensor.data.is_none() {
            return Err(VerifierError::Structure(format!("constant {name} has no storage")));
        }
    }
    check_references(&module.graph)?;
    Ok(module)
}
