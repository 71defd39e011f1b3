//! Flattens bias buffers to `bfyx {1, 1, 1, count}` in the user's data type.

use std::ops::Range;
use std::sync::Arc;

use nexgraph_core::{PrimitiveDesc, Result};

use crate::layout_optimizer::{DataRole, LayoutOptimizer};
use crate::program::Program;

/// Dependency slots holding bias ids.
fn bias_slots(desc: &PrimitiveDesc, inputs: usize) -> Range<usize> {
    match desc {
        PrimitiveDesc::Convolution(conv) | PrimitiveDesc::Deconvolution(conv) => {
            let start = inputs + conv.weights.len();
            start..start + conv.bias.len()
        }
        PrimitiveDesc::FullyConnected(fc) if fc.bias.is_some() => inputs + 1..inputs + 2,
        _ => 0..0,
    }
}

pub(crate) fn run(program: &mut Program, optimizer: &mut LayoutOptimizer) -> Result<bool> {
    let mut changed = false;
    let order = program.processing_order.clone();
    for id in order {
        if program.nodes[id].removed {
            continue;
        }
        let slots = {
            let primitive = &program.nodes[id].primitive;
            bias_slots(&primitive.desc, primitive.inputs.len())
        };
        if slots.is_empty() {
            continue;
        }
        let reference = program.output_layout(id)?;
        for slot in slots {
            let dep = program.nodes[id].dependencies[slot];
            let current = program.output_layout(dep)?;
            let primitive = Arc::clone(&program.nodes[id].primitive);
            let source = program.nodes[dep].primitive.id.clone();
            if let Some(reorder) = optimizer.get_reorder(&current, &source, DataRole::Bias, &primitive, &reference)? {
                program.insert_reorder(&reorder, id, slot)?;
                changed = true;
            }
        }
    }
    Ok(changed)
}
