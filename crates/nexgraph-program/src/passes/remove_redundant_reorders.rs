//! Drops plain reorders whose output layout equals their input layout.

use nexgraph_core::{PrimitiveDesc, Result};

use crate::program::Program;

pub(crate) fn run(program: &mut Program) -> Result<bool> {
    let mut changed = false;
    let order = program.processing_order.clone();
    for id in order {
        let node = &program.nodes[id];
        if node.removed || node.output {
            continue;
        }
        let PrimitiveDesc::Reorder(desc) = &node.primitive.desc else {
            continue;
        };
        if !desc.is_plain() {
            continue;
        }
        let input = node.dependencies[0];
        if program.output_layout(id)? != program.output_layout(input)? {
            continue;
        }

        tracing::debug!(id = %program.nodes[id].primitive.id, "removing redundant reorder");
        let users = program.nodes[id].users.clone();
        for user in users {
            let slots: Vec<usize> = program.nodes[user]
                .dependencies
                .iter()
                .enumerate()
                .filter(|&(_, &dep)| dep == id)
                .map(|(slot, _)| slot)
                .collect();
            for slot in slots {
                program.replace_dependency(user, slot, input, false);
            }
        }
        program.remove_if_dangling(id, true);
        changed = true;
    }
    Ok(changed)
}
