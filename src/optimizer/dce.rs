use crate::ir::ModelIR;
use crate::optimizer::{OptimizationPass, OptimizerError};
use std::collections::HashSet;

/// Removes nodes whose outputs are never read, then initializers nothing
/// references.
pub struct DeadCodeElimination;

impl OptimizationPass for DeadCodeElimination {
    fn name(&self) -> &'static str {
        "dead-code-elimination"
    }

    fn apply(&self, ir: &mut ModelIR) -> Result<(), OptimizerError> {
        let mut changed = true;
        while changed {
            let mut used_values: HashSet<&str> = ir.outputs.iter().map(|o| o.name.as_str()).collect();
            for node in &ir.nodes {
                used_values.extend(node.inputs.iter().map(String::as_str));
            }
            let live: Vec<bool> = ir
                .nodes
                .iter()
                .map(|node| node.outputs.iter().any(|o| used_values.contains(o.as_str())))
                .collect();

            changed = live.iter().any(|l| !l);
            let mut keep = live.into_iter();
            ir.nodes.retain(|_| keep.next().unwrap_or(true));
        }

        let referenced: HashSet<String> = ir
            .nodes
            .iter()
            .flat_map(|n| n.inputs.iter().cloned())
            .chain(ir.outputs.iter().map(|o| o.name.clone()))
            .collect();
        ir.weights.retain(|name, _| referenced.contains(name));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Node, Tensor};
    use ndarray::arr1;
    use std::collections::HashMap;

    fn node(name: &str, op: &str, inputs: &[&str], output: &str) -> Node {
        Node {
            name: name.to_string(),
            op_type: op.to_string(),
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
            outputs: vec![output.to_string()],
            attributes: HashMap::new(),
        }
    }

    #[test]
    fn test_dce_removes_unused_chain_and_initializers() {
        let mut ir = ModelIR::new();
        ir.inputs.push(Tensor::value("A", vec![1]));
        ir.weights.insert("w".to_string(), Tensor::from_array("w", &arr1(&[1.0f32]).into_dyn()));
        ir.weights.insert("k".to_string(), Tensor::from_array("k", &arr1(&[2.0f32]).into_dyn()));
        ir.nodes.push(node("dead1", "Add", &["A", "w"], "C"));
        ir.nodes.push(node("dead2", "Relu", &["C"], "D"));
        ir.nodes.push(node("live", "Mul", &["A", "k"], "Y"));
        ir.outputs.push(Tensor::value("Y", vec![1]));

        DeadCodeElimination.apply(&mut ir).unwrap();

        assert_eq!(ir.nodes.len(), 1);
        assert_eq!(ir.nodes[0].name, "live");
        assert!(ir.weights.contains_key("k"));
        assert!(!ir.weights.contains_key("w"));
    }
}
