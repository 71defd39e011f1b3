//! Converts convolution inputs to the format the layout policy prefers.
//!
//! An existing single-user reorder in front of a convolution is retargeted or
//! bypassed instead of stacking a second conversion behind it.

use std::sync::Arc;

use nexgraph_core::{PrimitiveDesc, PrimitiveType, Result};

use crate::layout_optimizer::{DataRole, LayoutOptimizer, OptimizationAttributes};
use crate::program::Program;

pub(crate) fn run(program: &mut Program, optimizer: &mut LayoutOptimizer) -> Result<bool> {
    let order = program.processing_order.clone();
    let mut attributes = OptimizationAttributes::default();
    for &id in &order {
        match program.nodes[id].kind() {
            PrimitiveType::Convolution => attributes.splitted_convolution |= program.nodes[id].split() > 1,
            PrimitiveType::Deconvolution => attributes.bfyx_only_layer = true,
            _ => {}
        }
    }
    optimizer.set_attributes(attributes);

    let mut changed = false;
    for id in order {
        if program.nodes[id].removed || program.nodes[id].kind() != PrimitiveType::Convolution {
            continue;
        }
        let input = program.nodes[id].dependencies[0];
        let weights = program.nodes[id].dependencies[1];
        let current = program.output_layout(input)?;
        let weights_layout = program.output_layout(weights)?;
        let primitive = Arc::clone(&program.nodes[id].primitive);

        let input_node = &program.nodes[input];
        let bypassable = match &input_node.primitive.desc {
            PrimitiveDesc::Reorder(desc) => desc.is_plain() && input_node.users.len() == 1 && !input_node.output,
            _ => false,
        };
        if bypassable {
            let source = input_node.dependencies[0];
            let source_layout = program.output_layout(source)?;
            if source_layout.data_type == current.data_type {
                let expected = optimizer.expected_layout(&source_layout, DataRole::Input, &primitive, &weights_layout)?;
                if source_layout == expected {
                    tracing::debug!(reorder = %program.nodes[input].primitive.id, "bypassing reorder");
                    program.replace_dependency(id, 0, source, true);
                    changed = true;
                } else if current != expected {
                    let mut retargeted = program.nodes[input].primitive.as_ref().clone();
                    if let PrimitiveDesc::Reorder(desc) = &mut retargeted.desc {
                        desc.output_format = expected.format();
                        desc.output_data_type = expected.data_type;
                    }
                    tracing::debug!(reorder = %retargeted.id, format = %expected.format(), "retargeting reorder");
                    program.replace_primitive(input, retargeted);
                    changed = true;
                }
                continue;
            }
        }

        let source_id = program.nodes[input].primitive.id.clone();
        if let Some(reorder) = optimizer.get_reorder(&current, &source_id, DataRole::Input, &primitive, &weights_layout)? {
            program.insert_reorder(&reorder, id, 0)?;
            changed = true;
        }
    }
    Ok(changed)
}
