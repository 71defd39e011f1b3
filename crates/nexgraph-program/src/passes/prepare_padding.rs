//! Grows the output padding of layer inputs so windows never read outside
//! the buffer.
//!
//! Three sources of padding are merged per layer:
//! - the padding a primitive requests around its first input,
//! - the sliding window of `bfyx` convolutions (only with `optimize_data`),
//! - a requested output size on (de)convolutions, once the program found a
//!   layer whose requested size differs from its window arithmetic.
//!
//! Input placeholders get a padded reorder in front of them since their memory
//! comes from the caller.

use std::sync::Arc;

use nexgraph_core::{
    ConvolutionDesc, Error, Format, Layout, Padding, Primitive, PrimitiveDesc, PrimitiveType, ReorderDesc, Result,
    Tensor,
};

use crate::layout_optimizer::CachedReorder;
use crate::node::NodeId;
use crate::program::Program;

pub(crate) fn run(program: &mut Program) -> Result<bool> {
    let mut changed = false;
    let order = program.processing_order.clone();
    for id in order {
        if program.nodes[id].removed || program.nodes[id].dependencies.is_empty() {
            continue;
        }
        let Some(needed) = required_padding(program, id)? else {
            continue;
        };
        let input = program.nodes[id].dependencies[0];
        ensure_paddable(program, id, input)?;

        let input_layout = program.output_layout(input)?;
        let needed = Padding::max(&input_layout.padding, &needed);
        if input_layout.padding == needed {
            continue;
        }
        apply_needed_padding(program, id, input, needed)?;
        changed = true;
    }
    Ok(changed)
}

/// Padding `id` needs around its first input, `None` if the layer is not padded.
fn required_padding(program: &mut Program, id: NodeId) -> Result<Option<Padding>> {
    let primitive = Arc::clone(&program.nodes[id].primitive);
    let requested = primitive.input_padding;
    let window = match &primitive.desc {
        PrimitiveDesc::Convolution(desc) => convolution_padding(program, id, desc)?,
        PrimitiveDesc::Deconvolution(desc) if program.output_size_handling && desc.output_size.is_some() => {
            Some(deconvolution_padding(program, id, desc)?)
        }
        _ => None,
    };
    Ok(match window {
        Some(window) => Some(Padding::max(&window, &requested)),
        None if requested.is_padded() => Some(requested),
        None => None,
    })
}

fn convolution_padding(program: &mut Program, id: NodeId, desc: &ConvolutionDesc) -> Result<Option<Padding>> {
    let output = program.output_layout(id)?;
    let sized = program.output_size_handling && desc.output_size.is_some();
    if !sized && !(program.options.optimize_data && output.format() == Format::Bfyx) {
        return Ok(None);
    }
    let input = program.output_layout(program.nodes[id].dependencies[0])?;
    let filter = program.output_layout(program.nodes[id].dependencies[1])?;
    Ok(Some(needed_padding(
        &input,
        &output,
        &filter,
        desc.stride,
        desc.input_offset,
        desc.dilation,
    )))
}

/// Margins the window of a convolution reads beyond its input.
fn needed_padding(
    input: &Layout,
    output: &Layout,
    filter: &Layout,
    stride: Tensor,
    offset: Tensor,
    dilation: Tensor,
) -> Padding {
    let margins = |axis: usize| {
        let limit = offset.spatial(axis)
            + (output.size.spatial(axis) - 1) * stride.spatial(axis)
            + (filter.size.spatial(axis) - 1) * dilation.spatial(axis)
            + 1;
        let lower = (-offset.spatial(axis)).max(0);
        let upper = (limit - input.size.spatial(axis)).max(0);
        (lower, upper)
    };
    let (left, right) = margins(0);
    let (top, bottom) = margins(1);
    Padding::new(Tensor::bfyx(0, 0, top, left), Tensor::bfyx(0, 0, bottom, right), 0.0)
}

/// Trailing rows and columns a transposed window reaches past its input.
fn deconvolution_padding(program: &mut Program, id: NodeId, desc: &ConvolutionDesc) -> Result<Padding> {
    let output = program.output_layout(id)?;
    let input = program.output_layout(program.nodes[id].dependencies[0])?;
    let upper = |axis: usize| {
        let reach = (output.size.spatial(axis) - 1 - desc.input_offset.spatial(axis)) / desc.stride.spatial(axis).max(1) + 1;
        (reach - input.size.spatial(axis)).max(0)
    };
    Ok(Padding::new(
        Tensor::bfyx(0, 0, 0, 0),
        Tensor::bfyx(0, 0, upper(1), upper(0)),
        0.0,
    ))
}

fn ensure_paddable(program: &Program, user: NodeId, input: NodeId) -> Result<()> {
    match program.nodes[input].kind() {
        PrimitiveType::InputLayout
        | PrimitiveType::Pooling
        | PrimitiveType::Normalization
        | PrimitiveType::Convolution
        | PrimitiveType::DepthConcatenate
        | PrimitiveType::Reorder => Ok(()),
        other => Err(Error::not_implemented(format!(
            "padding of {other} '{}' for '{}'",
            program.nodes[input].primitive.id, program.nodes[user].primitive.id
        ))),
    }
}

fn apply_needed_padding(program: &mut Program, user: NodeId, input: NodeId, needed: Padding) -> Result<()> {
    if program.nodes[input].kind() != PrimitiveType::InputLayout {
        tracing::debug!(id = %program.nodes[input].primitive.id, "growing output padding");
        if program.nodes[input].merge_output_padding(&needed) {
            program.invalidate_users(input);
        }
        return Ok(());
    }

    let layout = program.output_layout(input)?;
    let source = program.nodes[input].primitive.id.clone();
    let primitive = Primitive::reorder(
        format!("reorder_{source}"),
        source,
        ReorderDesc::new(layout.format(), layout.data_type),
    )
    .with_output_padding(needed);
    let reorder = CachedReorder {
        primitive: Arc::new(primitive),
        cached: true,
    };
    let node = program.insert_reorder(&reorder, user, 0)?;
    if program.nodes[node].merge_output_padding(&needed) {
        program.invalidate_users(node);
    }
    Ok(())
}
