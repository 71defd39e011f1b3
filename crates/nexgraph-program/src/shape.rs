//! Shape Inference - Output Layouts per Primitive Kind
//!
//! `calc_output_layout` is a pure function from a primitive and the layouts of
//! its dependencies (in `Primitive::dependencies` order) to the primitive's
//! output layout. Padding is not part of the result except for
//! `input_layout`/`data`, whose layouts are declared by the user; the program
//! adds the node's merged output padding on top.
//!
//! # Window arithmetic
//! - convolution: `floor((in - 2*offset - ((k - 1)*dilation + 1)) / stride) + 1`
//! - deconvolution: `stride*(in - 1) + k + 2*offset`
//! - pooling: `ceil((in - 2*offset - window) / stride) + 1`
//!
//! A primitive carrying an explicit `output_size` takes its spatial extent from
//! there instead; `prepare_padding` then pads the input so the windows fit.
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use nexgraph_core::{
    ConvolutionDesc, Error, Format, Layout, PoolingDesc, Primitive, PrimitiveDesc, Result, Tensor,
};

// =============================================================================
// Entry Point
// =============================================================================

/// Computes the output layout of `primitive` from its dependency layouts.
pub fn calc_output_layout(primitive: &Primitive, inputs: &[Layout]) -> Result<Layout> {
    let expected = primitive.dependencies().len();
    if inputs.len() != expected {
        return Err(Error::shape_mismatch(format!(
            "'{}' has {expected} dependencies but {} layouts were supplied",
            primitive.id,
            inputs.len()
        )));
    }

    match &primitive.desc {
        PrimitiveDesc::InputLayout { layout } => Ok(*layout),
        PrimitiveDesc::Data { memory } => Ok(*memory.layout()),
        PrimitiveDesc::Convolution(desc) => convolution(primitive, desc, inputs, false),
        PrimitiveDesc::Deconvolution(desc) => convolution(primitive, desc, inputs, true),
        PrimitiveDesc::FullyConnected(desc) => fully_connected(primitive, inputs, desc.bias.is_some()),
        PrimitiveDesc::Pooling(desc) => pooling(primitive, desc, &inputs[0]),
        PrimitiveDesc::Normalization(_) => Ok(Layout::new(inputs[0].data_type, inputs[0].size)),
        PrimitiveDesc::DepthConcatenate => depth_concatenate(primitive, &inputs[..primitive.inputs.len()]),
        PrimitiveDesc::Reorder(desc) => {
            let size = inputs[0].size.fold_into(desc.output_format)?;
            Ok(Layout::new(desc.output_data_type, size))
        }
    }
}

// =============================================================================
// Kind-Specific Rules
// =============================================================================

fn spatial_dims(layout: &Layout, id: &str, role: &str) -> Result<(i32, i32)> {
    match (layout.size.axis('x'), layout.size.axis('y')) {
        (Some(x), Some(y)) => Ok((x, y)),
        _ => Err(Error::shape_mismatch(format!(
            "{role} of '{id}' must have two spatial axes, got {}",
            layout.format()
        ))),
    }
}

fn convolution(primitive: &Primitive, desc: &ConvolutionDesc, inputs: &[Layout], transposed: bool) -> Result<Layout> {
    let id = primitive.id.as_str();
    let split = desc.split();
    if split == 0 {
        return Err(Error::shape_mismatch(format!("'{id}' has no weights")));
    }
    if !desc.bias.is_empty() && desc.bias.len() != split {
        return Err(Error::shape_mismatch(format!(
            "'{id}' has {split} weights but {} biases",
            desc.bias.len()
        )));
    }

    let input = &inputs[0];
    let weights = &inputs[1];
    if !input.format().is_4d() {
        return Err(Error::shape_mismatch(format!(
            "input of '{id}' must be 4-dimensional, got {}",
            input.format()
        )));
    }
    let (in_x, in_y) = spatial_dims(input, id, "input")?;
    let (k_x, k_y) = spatial_dims(weights, id, "weights")?;
    let ofm = weights.size.batch();
    let ifm = weights.size.feature();

    for (index, w) in inputs[1..=split].iter().enumerate() {
        if w.size != weights.size {
            return Err(Error::shape_mismatch(format!(
                "weights {index} of '{id}' is {} but weights 0 is {}",
                w.size, weights.size
            )));
        }
    }
    for (index, bias) in inputs[1 + split..].iter().enumerate() {
        if bias.count() != ofm as usize {
            return Err(Error::shape_mismatch(format!(
                "bias {index} of '{id}' holds {} values for {ofm} output features",
                bias.count()
            )));
        }
    }

    let groups = desc.groups.max(1) as i32;
    let expected_ifm = ifm * split as i32 * groups;
    if input.size.feature() != expected_ifm {
        return Err(Error::shape_mismatch(format!(
            "'{id}' expects {expected_ifm} input features, input has {}",
            input.size.feature()
        )));
    }

    let (out_x, out_y) = if let Some(requested) = desc.output_size {
        requested_extent(id, requested)?
    } else if transposed {
        (
            deconvolution_extent(in_x, k_x, desc.input_offset.spatial(0), desc.stride.spatial(0)),
            deconvolution_extent(in_y, k_y, desc.input_offset.spatial(1), desc.stride.spatial(1)),
        )
    } else {
        (
            convolution_extent(in_x, k_x, desc.input_offset.spatial(0), desc.stride.spatial(0), desc.dilation.spatial(0)),
            convolution_extent(in_y, k_y, desc.input_offset.spatial(1), desc.stride.spatial(1), desc.dilation.spatial(1)),
        )
    };
    if out_x <= 0 || out_y <= 0 {
        return Err(Error::shape_mismatch(format!(
            "window of '{id}' does not fit into its {in_x}x{in_y} input"
        )));
    }

    let size = input
        .size
        .with_feature(ofm * split as i32)
        .with_spatial(0, out_x)
        .with_spatial(1, out_y);
    Ok(Layout::new(input.data_type, size))
}

fn requested_extent(id: &str, requested: Tensor) -> Result<(i32, i32)> {
    let (x, y) = (requested.spatial(0), requested.spatial(1));
    if x <= 0 || y <= 0 {
        return Err(Error::shape_mismatch(format!(
            "requested output size {x}x{y} of '{id}' is not positive"
        )));
    }
    Ok((x, y))
}

/// True when `primitive` requests an output size the window arithmetic would not produce.
pub(crate) fn needs_output_size_handling(primitive: &Primitive, inputs: &[Layout]) -> bool {
    let mut natural = primitive.clone();
    let requested = match &mut natural.desc {
        PrimitiveDesc::Convolution(desc) | PrimitiveDesc::Deconvolution(desc) => desc.output_size.take(),
        PrimitiveDesc::Pooling(desc) => desc.output_size.take(),
        _ => None,
    };
    let Some(requested) = requested else {
        return false;
    };
    match calc_output_layout(&natural, inputs) {
        Ok(layout) => {
            layout.size.spatial(0) != requested.spatial(0) || layout.size.spatial(1) != requested.spatial(1)
        }
        Err(_) => true,
    }
}

fn convolution_extent(input: i32, kernel: i32, offset: i32, stride: i32, dilation: i32) -> i32 {
    let window = (kernel - 1) * dilation.max(1) + 1;
    let span = input - 2 * offset - window;
    if span < 0 {
        return 0;
    }
    span / stride.max(1) + 1
}

fn deconvolution_extent(input: i32, kernel: i32, offset: i32, stride: i32) -> i32 {
    stride.max(1) * (input - 1) + kernel + 2 * offset
}

fn fully_connected(primitive: &Primitive, inputs: &[Layout], has_bias: bool) -> Result<Layout> {
    let id = primitive.id.as_str();
    let input = &inputs[0];
    let weights = &inputs[1];
    let batch = input.size.axis('b').unwrap_or(1);
    let ofm = weights.size.axis('b').unwrap_or(1);

    let per_batch = input.count() / batch.max(1) as usize;
    let weights_per_output = weights.count() / ofm.max(1) as usize;
    if per_batch != weights_per_output {
        return Err(Error::shape_mismatch(format!(
            "'{id}' input carries {per_batch} values per batch, weights expect {weights_per_output}"
        )));
    }
    if has_bias && inputs[2].count() != ofm as usize {
        return Err(Error::shape_mismatch(format!(
            "bias of '{id}' holds {} values for {ofm} outputs",
            inputs[2].count()
        )));
    }

    let format = input.format();
    let size = if format.is_batch_after_spatial() || (format == Format::Bfyx && batch > 1) {
        Tensor::new(Format::Xb, &[ofm, batch])?
    } else {
        Tensor::new(Format::Bx, &[batch, ofm])?
    };
    Ok(Layout::new(input.data_type, size))
}

fn pooling(primitive: &Primitive, desc: &PoolingDesc, input: &Layout) -> Result<Layout> {
    let id = primitive.id.as_str();
    let (in_x, in_y) = spatial_dims(input, id, "input")?;
    if let Some(requested) = desc.output_size {
        let (out_x, out_y) = requested_extent(id, requested)?;
        let size = input.size.with_spatial(0, out_x).with_spatial(1, out_y);
        return Ok(Layout::new(input.data_type, size));
    }
    let extent = |input: i32, index: usize| -> Result<i32> {
        let window = desc.size.spatial(index);
        let stride = desc.stride.spatial(index).max(1);
        let span = input - 2 * desc.input_offset.spatial(index) - window;
        if span < 0 {
            return Err(Error::shape_mismatch(format!(
                "pooling window {window} of '{id}' does not fit into input extent {input}"
            )));
        }
        Ok((span + stride - 1) / stride + 1)
    };
    let size = input
        .size
        .with_spatial(0, extent(in_x, 0)?)
        .with_spatial(1, extent(in_y, 1)?);
    Ok(Layout::new(input.data_type, size))
}

fn depth_concatenate(primitive: &Primitive, inputs: &[Layout]) -> Result<Layout> {
    let id = primitive.id.as_str();
    let Some(first) = inputs.first() else {
        return Err(Error::shape_mismatch(format!("'{id}' has no inputs")));
    };
    let mut features = 0;
    for (index, layout) in inputs.iter().enumerate() {
        let same_axes = ['b', 'y', 'x']
            .iter()
            .all(|&axis| layout.size.axis(axis) == first.size.axis(axis));
        if !same_axes || layout.data_type != first.data_type {
            return Err(Error::shape_mismatch(format!(
                "input {index} of '{id}' is {layout}, incompatible with {first}"
            )));
        }
        features += layout.size.axis('f').unwrap_or(1);
    }
    Ok(Layout::new(first.data_type, first.size.with_feature(features)))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use nexgraph_core::{
        DataType, FullyConnectedDesc, Memory, Padding, PoolingMode, ReorderDesc,
    };

    fn f32_bfyx(b: i32, f: i32, y: i32, x: i32) -> Layout {
        Layout::new(DataType::F32, Tensor::bfyx(b, f, y, x))
    }

    fn bias(count: i32) -> Layout {
        Layout::new(DataType::F32, Tensor::new(Format::X, &[count]).unwrap())
    }

    #[test]
    fn test_convolution_output() {
        let conv = Primitive::convolution("conv", "in", ConvolutionDesc::new(["w"], ["b"]));
        let inputs = [f32_bfyx(1, 3, 8, 8), f32_bfyx(8, 3, 3, 3), bias(8)];
        let out = calc_output_layout(&conv, &inputs).unwrap();
        assert_eq!(out, f32_bfyx(1, 8, 6, 6));
        assert_eq!(calc_output_layout(&conv, &inputs).unwrap(), out);
    }

    #[test]
    fn test_convolution_stride_offset_and_split() {
        let desc = ConvolutionDesc::new(["w0", "w1"], ["b0", "b1"])
            .with_stride(Tensor::spatial_xy(2, 2))
            .with_input_offset(Tensor::bfyx(0, 0, -1, -1));
        let conv = Primitive::convolution("conv", "in", desc);
        let w = f32_bfyx(4, 2, 3, 3);
        let inputs = [f32_bfyx(2, 4, 7, 7), w, w, bias(4), bias(4)];
        // (7 + 2 - 3) / 2 + 1 = 4
        assert_eq!(calc_output_layout(&conv, &inputs).unwrap(), f32_bfyx(2, 8, 4, 4));
    }

    #[test]
    fn test_convolution_rejects_bias_count() {
        let conv = Primitive::convolution("conv", "in", ConvolutionDesc::new(["w0", "w1"], ["b0"]));
        let w = f32_bfyx(1, 1, 1, 1);
        let err = calc_output_layout(&conv, &[f32_bfyx(1, 2, 2, 2), w, w, bias(1)]).unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { .. }));
    }

    #[test]
    fn test_convolution_rejects_feature_mismatch() {
        let conv = Primitive::convolution("conv", "in", ConvolutionDesc::new(["w"], Vec::<String>::new()));
        let err = calc_output_layout(&conv, &[f32_bfyx(1, 4, 4, 4), f32_bfyx(2, 3, 1, 1)]).unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { .. }));
    }

    #[test]
    fn test_requested_output_size_overrides_window() {
        let desc = ConvolutionDesc::new(["w"], Vec::<String>::new()).with_output_size(Tensor::spatial_xy(8, 8));
        let conv = Primitive::convolution("conv", "in", desc);
        let inputs = [f32_bfyx(1, 1, 8, 8), f32_bfyx(2, 1, 3, 3)];
        assert_eq!(calc_output_layout(&conv, &inputs).unwrap(), f32_bfyx(1, 2, 8, 8));
        assert!(needs_output_size_handling(&conv, &inputs));

        let matching = ConvolutionDesc::new(["w"], Vec::<String>::new()).with_output_size(Tensor::spatial_xy(6, 6));
        let conv = Primitive::convolution("conv", "in", matching);
        assert!(!needs_output_size_handling(&conv, &inputs));

        let window = Tensor::spatial_xy(3, 3);
        let pool = Primitive::pooling(
            "p",
            "in",
            PoolingDesc::new(PoolingMode::Max, window, window).with_output_size(Tensor::spatial_xy(1, 1)),
        );
        assert_eq!(calc_output_layout(&pool, &[f32_bfyx(1, 1, 2, 2)]).unwrap(), f32_bfyx(1, 1, 1, 1));
        assert!(needs_output_size_handling(&pool, &[f32_bfyx(1, 1, 2, 2)]));

        let empty = ConvolutionDesc::new(["w"], Vec::<String>::new()).with_output_size(Tensor::spatial_xy(0, 4));
        let conv = Primitive::convolution("conv", "in", empty);
        assert!(matches!(calc_output_layout(&conv, &inputs), Err(Error::ShapeMismatch { .. })));
    }

    #[test]
    fn test_deconvolution_output() {
        let desc = ConvolutionDesc::new(["w"], Vec::<String>::new()).with_stride(Tensor::spatial_xy(2, 2));
        let deconv = Primitive::deconvolution("d", "in", desc);
        let out = calc_output_layout(&deconv, &[f32_bfyx(1, 2, 3, 3), f32_bfyx(5, 2, 2, 2)]).unwrap();
        assert_eq!(out, f32_bfyx(1, 5, 6, 6));
    }

    #[test]
    fn test_fully_connected_format_heuristic() {
        let fc = Primitive::fully_connected("fc", "in", FullyConnectedDesc::new("w", Some("b")));
        let weights = f32_bfyx(10, 2, 2, 2);

        let single = calc_output_layout(&fc, &[f32_bfyx(1, 2, 2, 2), weights, bias(10)]).unwrap();
        assert_eq!(single.size, Tensor::new(Format::Bx, &[1, 10]).unwrap());

        let batched = calc_output_layout(&fc, &[f32_bfyx(4, 2, 2, 2), weights, bias(10)]).unwrap();
        assert_eq!(batched.size, Tensor::new(Format::Xb, &[10, 4]).unwrap());

        let yxfb = Layout::new(DataType::F32, Tensor::bfyx(1, 2, 2, 2).transform(Format::Yxfb, 1).unwrap());
        let after_spatial = calc_output_layout(&fc, &[yxfb, weights, bias(10)]).unwrap();
        assert_eq!(after_spatial.format(), Format::Xb);

        let err = calc_output_layout(&fc, &[f32_bfyx(1, 3, 2, 2), weights, bias(10)]).unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { .. }));
    }

    #[test]
    fn test_pooling_rounds_up() {
        let window = Tensor::spatial_xy(3, 3);
        let pool = Primitive::pooling(
            "p",
            "in",
            PoolingDesc::new(PoolingMode::Max, window, Tensor::spatial_xy(2, 2)),
        );
        // ceil((6 - 3) / 2) + 1 = 3
        assert_eq!(calc_output_layout(&pool, &[f32_bfyx(1, 4, 6, 6)]).unwrap(), f32_bfyx(1, 4, 3, 3));
        assert!(calc_output_layout(&pool, &[f32_bfyx(1, 4, 2, 2)]).is_err());
    }

    #[test]
    fn test_depth_concatenate() {
        let cat = Primitive::depth_concatenate("cat", ["a", "b"]);
        let out = calc_output_layout(&cat, &[f32_bfyx(1, 2, 4, 4), f32_bfyx(1, 3, 4, 4)]).unwrap();
        assert_eq!(out, f32_bfyx(1, 5, 4, 4));

        let err = calc_output_layout(&cat, &[f32_bfyx(1, 2, 4, 4), f32_bfyx(1, 3, 4, 5)]).unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { .. }));
    }

    #[test]
    fn test_reorder_and_passthrough() {
        let reorder = Primitive::reorder("r", "in", ReorderDesc::new(Format::Yxfb, DataType::F16));
        let out = calc_output_layout(&reorder, &[f32_bfyx(2, 3, 4, 5)]).unwrap();
        assert_eq!(out.format(), Format::Yxfb);
        assert_eq!(out.data_type, DataType::F16);
        assert_eq!(out.count(), 120);

        let padded = f32_bfyx(1, 1, 2, 2).with_padding(Padding::symmetric(Tensor::bfyx(0, 0, 1, 1), 0.0));
        let input = Primitive::input_layout("in", padded);
        assert_eq!(calc_output_layout(&input, &[]).unwrap(), padded);

        let data = Primitive::data("d", Memory::zeros(f32_bfyx(1, 1, 1, 3)));
        assert_eq!(calc_output_layout(&data, &[]).unwrap(), f32_bfyx(1, 1, 1, 3));
    }
}
