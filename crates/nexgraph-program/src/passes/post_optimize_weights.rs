//! Converts weights to the layouts their users need.
//!
//! With `optimize_data` the layout policy picks the weights format first.
//! The selected implementation's own requirement is applied afterwards in
//! every build.

use std::ops::Range;
use std::sync::Arc;

use nexgraph_core::{PrimitiveDesc, Result};

use crate::layout_optimizer::{DataRole, LayoutOptimizer};
use crate::node::NodeId;
use crate::program::Program;

/// Dependency slots holding weights ids.
fn weights_slots(desc: &PrimitiveDesc, inputs: usize) -> Range<usize> {
    match desc {
        PrimitiveDesc::Convolution(conv) | PrimitiveDesc::Deconvolution(conv) => inputs..inputs + conv.weights.len(),
        PrimitiveDesc::FullyConnected(_) => inputs..inputs + 1,
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
            weights_slots(&primitive.desc, primitive.inputs.len())
        };
        if slots.is_empty() {
            continue;
        }
        if program.options.optimize_data {
            changed |= apply_layout_policy(program, optimizer, id, slots.clone())?;
        }
        changed |= apply_backend_requirements(program, optimizer, id, slots)?;
    }
    Ok(changed)
}

fn apply_layout_policy(
    program: &mut Program,
    optimizer: &mut LayoutOptimizer,
    id: NodeId,
    slots: Range<usize>,
) -> Result<bool> {
    let mut changed = false;
    let reference = program.output_layout(id)?;
    for slot in slots {
        let dep = program.nodes[id].dependencies[slot];
        let current = program.output_layout(dep)?;
        let primitive = Arc::clone(&program.nodes[id].primitive);
        let source = program.nodes[dep].primitive.id.clone();
        if let Some(reorder) = optimizer.get_reorder(&current, &source, DataRole::Weights, &primitive, &reference)? {
            program.insert_reorder(&reorder, id, slot)?;
            changed = true;
        }
    }
    Ok(changed)
}

fn apply_backend_requirements(
    program: &mut Program,
    optimizer: &mut LayoutOptimizer,
    id: NodeId,
    slots: Range<usize>,
) -> Result<bool> {
    let implementation = program.select_implementation(id)?;
    let Some(spec) = implementation.weights_reorder_requirements() else {
        return Ok(false);
    };

    let mut changed = false;
    for slot in slots {
        let dep = program.nodes[id].dependencies[slot];
        let current = program.output_layout(dep)?;
        if current == spec.target {
            continue;
        }
        let source = program.nodes[dep].primitive.id.clone();
        for reorder in optimizer.get_generic_layer(&spec, &source, &current) {
            program.insert_reorder(&reorder, id, slot)?;
            changed = true;
        }
    }
    Ok(changed)
}
