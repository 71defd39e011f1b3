//! Depthwise-separable merge.
//!
//! A convolution with one split per input feature and at least
//! `MIN_DEPTHWISE_SPLIT` splits is rewritten as a single grouped convolution:
//! the per-split weights and biases are concatenated into one buffer each.

use std::sync::Arc;

use nexgraph_core::{Layout, Memory, Primitive, PrimitiveDesc, Result, Tensor};

use crate::node::NodeId;
use crate::program::Program;

/// Smallest split count worth merging.
const MIN_DEPTHWISE_SPLIT: usize = 16;

pub(crate) fn run(program: &mut Program) -> Result<bool> {
    let mut changed = false;
    let order = program.processing_order.clone();
    for id in order {
        if program.nodes[id].removed {
            continue;
        }
        let PrimitiveDesc::Convolution(desc) = &program.nodes[id].primitive.desc else {
            continue;
        };
        let split = desc.split();
        if split < MIN_DEPTHWISE_SPLIT {
            continue;
        }
        let input = program.nodes[id].dependencies[0];
        let input_features = program.output_layout(input)?.size.feature();
        if usize::try_from(input_features).ok() != Some(split) {
            continue;
        }
        let Some(buffers) = constant_buffers(program, id) else {
            continue;
        };
        merge(program, id, split, &buffers)?;
        changed = true;
    }
    Ok(changed)
}

/// Memories of every weights and bias dependency, if all are single-user data.
fn constant_buffers(program: &Program, id: NodeId) -> Option<Vec<Memory>> {
    program.nodes[id].dependencies[1..]
        .iter()
        .map(|&dep| {
            let node = &program.nodes[dep];
            match &node.primitive.desc {
                PrimitiveDesc::Data { memory } if node.users.len() == 1 => Some(memory.clone()),
                _ => None,
            }
        })
        .collect()
}

fn merge(program: &mut Program, id: NodeId, split: usize, buffers: &[Memory]) -> Result<()> {
    let (weights, biases) = buffers.split_at(split);
    let conv_id = program.nodes[id].primitive.id.clone();
    let weights_id = format!("{conv_id}_depthwise_weights");
    let bias_id = format!("{conv_id}_depthwise_bias");

    let mut primitive = program.nodes[id].primitive.as_ref().clone();
    if let PrimitiveDesc::Convolution(desc) = &mut primitive.desc {
        desc.weights = vec![weights_id.clone()];
        desc.bias = if biases.is_empty() { Vec::new() } else { vec![bias_id.clone()] };
        desc.groups *= split as u32;
    }

    add_data(program, id, Primitive::data(weights_id, concat_weights(weights)?))?;
    if !biases.is_empty() {
        add_data(program, id, Primitive::data(bias_id, concat_bias(biases)?))?;
    }
    program.reset_dependencies(id, primitive)?;
    program.nodes[id].depthwise_sep_opt = true;
    tracing::debug!(id = %conv_id, split, "merged depthwise-separable convolution");
    Ok(())
}

fn add_data(program: &mut Program, before: NodeId, primitive: Primitive) -> Result<NodeId> {
    let node = program.add_node(Arc::new(primitive))?;
    program.nodes[node].constant = true;
    let position = program
        .processing_order
        .iter()
        .position(|&n| n == before)
        .unwrap_or(program.processing_order.len());
    program.processing_order.insert(position, node);
    Ok(node)
}

/// Stacks per-split weights along the output-feature axis into one `bfyx` buffer.
fn concat_weights(weights: &[Memory]) -> Result<Memory> {
    let first = *weights[0].layout();
    let (ofm, ifm) = (first.size.batch(), first.size.feature());
    let (ky, kx) = (first.size.spatial(1), first.size.spatial(0));
    let layout = Layout::new(
        first.data_type,
        Tensor::bfyx(weights.len() as i32 * ofm, ifm, ky, kx),
    );
    let merged = Memory::try_zeros(layout)?;
    for (slice, memory) in weights.iter().enumerate() {
        let source = memory.layout();
        let base = slice as i32 * ofm;
        for o in 0..ofm {
            for i in 0..ifm {
                for y in 0..ky {
                    for x in 0..kx {
                        let value = memory.read_f32(source.offset_of(o, i, y, x)?);
                        merged.write_f32(layout.offset_of(base + o, i, y, x)?, value);
                    }
                }
            }
        }
    }
    Ok(merged)
}

/// Concatenates per-split biases into one `bfyx {1, 1, 1, total}` buffer.
fn concat_bias(biases: &[Memory]) -> Result<Memory> {
    let mut values = Vec::new();
    for memory in biases {
        values.extend(memory.to_f32_vec()?);
    }
    let data_type = biases[0].layout().data_type;
    let layout = Layout::new(data_type, Tensor::bfyx(1, 1, 1, values.len() as i32));
    let merged = Memory::try_zeros(layout)?;
    for (x, &value) in values.iter().enumerate() {
        merged.write_f32(layout.offset_of(0, 0, 0, x as i32)?, value);
    }
    Ok(merged)
}
