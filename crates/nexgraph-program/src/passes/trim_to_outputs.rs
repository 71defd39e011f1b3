//! Removes every node no output depends on.

use nexgraph_core::Result;

use crate::program::Program;

pub(crate) fn run(program: &mut Program) -> Result<bool> {
    let mut needed = vec![false; program.nodes.len()];
    let mut stack = program.outputs.clone();
    while let Some(id) = stack.pop() {
        if std::mem::replace(&mut needed[id], true) {
            continue;
        }
        stack.extend(program.nodes[id].dependencies.iter().copied());
    }

    let unneeded: Vec<_> = program
        .processing_order
        .iter()
        .copied()
        .filter(|&id| !needed[id])
        .collect();
    for &id in &unneeded {
        tracing::debug!(id = %program.nodes[id].primitive.id, "trimmed");
        program.remove_node(id);
    }
    Ok(!unneeded.is_empty())
}
