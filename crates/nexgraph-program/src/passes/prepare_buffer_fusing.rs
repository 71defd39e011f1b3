//! Lets the inputs of a feature concatenation write straight into slices of
//! the concatenated buffer.
//!
//! Every input gets a feature padding that places its planes at the right
//! offset of the concatenation's buffer; the concatenation itself is marked
//! `can_be_optimized` and runs no kernel. Only `bfyx` concatenations of
//! unpadded pooling and convolution outputs with no other users are fused.

use nexgraph_core::{Format, Padding, PrimitiveType, Result, Tensor};

use crate::node::NodeId;
use crate::program::Program;

pub(crate) fn run(program: &mut Program) -> Result<bool> {
    let mut changed = false;
    let order = program.processing_order.clone();
    for id in order {
        if program.nodes[id].removed || program.nodes[id].kind() != PrimitiveType::DepthConcatenate {
            continue;
        }
        if !can_fuse(program, id)? {
            continue;
        }
        fuse(program, id)?;
        changed = true;
    }
    Ok(changed)
}

fn can_fuse(program: &mut Program, id: NodeId) -> Result<bool> {
    let layout = program.output_layout(id)?;
    if layout.format() != Format::Bfyx {
        return Ok(false);
    }
    let deps = program.nodes[id].dependencies.clone();
    for (index, &dep) in deps.iter().enumerate() {
        if deps[..index].contains(&dep) {
            return Ok(false);
        }
        let node = &program.nodes[dep];
        if node.users.len() != 1 || !matches!(node.kind(), PrimitiveType::Pooling | PrimitiveType::Convolution) {
            return Ok(false);
        }
        if node.output && !program.options.debug {
            return Ok(false);
        }
        let input = program.output_layout(dep)?;
        if input.padding.is_padded() || input.format() != layout.format() || input.data_type != layout.data_type {
            return Ok(false);
        }
    }
    Ok(true)
}

fn fuse(program: &mut Program, id: NodeId) -> Result<()> {
    let layout = program.output_layout(id)?;
    let (lower, upper) = (layout.padding.lower_size(), layout.padding.upper_size());
    let buffer_features = layout.size.feature() + lower.feature() + upper.feature();

    let mut lower_features = lower.feature();
    let mut upper_features = buffer_features - lower_features;
    for dep in program.nodes[id].dependencies.clone() {
        let features = program.output_layout(dep)?.size.feature();
        upper_features -= features;
        let padding = Padding::new(
            with_feature(lower, lower_features),
            with_feature(upper, upper_features),
            layout.padding.filling_value(),
        );
        program.nodes[dep].set_output_padding(padding);
        program.invalidate_users(dep);
        tracing::trace!(
            input = %program.nodes[dep].primitive.id,
            lower = lower_features,
            upper = upper_features,
            "input placed in concatenated buffer"
        );
        lower_features += features;
    }

    program.nodes[id].can_be_optimized = true;
    tracing::debug!(id = %program.nodes[id].primitive.id, "concatenation fused into its inputs");
    Ok(())
}

fn with_feature(tensor: Tensor, feature: i32) -> Tensor {
    Tensor::bfyx(tensor.batch(), feature, tensor.spatial(1), tensor.spatial(0))
}
