//! CPU Backend - Reference Host Kernels
//!
//! Provides the host implementation of every primitive kind. Kernels compute in
//! `f32`, address buffers through layout pitches (so any format and padding is
//! accepted) and run synchronously, returning an already-set event.
//!
//! # Key Features
//! - Multi-threaded output evaluation via rayon
//! - Reads inside declared padding come from the buffer, reads beyond it are zero
//! - Weights reorder requests when weights and input precision differ
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use std::sync::Arc;

use rayon::prelude::*;

use super::{
    ComputeBackend, EngineKind, Event, Implementation, ImplementationRegistry, ImplementationRequest, ReorderSpec,
};
use crate::device::DeviceProfile;
use crate::dtype::{read_as_f32, write_from_f32};
use crate::error::{Error, Result};
use crate::layout::Layout;
use crate::memory::Memory;
use crate::primitive::{
    ConvolutionDesc, FullyConnectedDesc, NormRegion, NormalizationDesc, PoolingDesc, PoolingMode, PrimitiveDesc,
    PrimitiveType, ReorderDesc,
};
use crate::tensor::{Format, Tensor};

/// Threshold for using parallel processing (in output elements)
const PARALLEL_THRESHOLD: usize = 4096;

/// Activation formats the spatial kernels are registered for.
const ACTIVATION_FORMATS: [Format; 6] = [
    Format::Bfyx,
    Format::Yxfb,
    Format::Byxf,
    Format::Fyxb,
    Format::Bf8Xy16,
    Format::ByxfAf32,
];

// =============================================================================
// CPU Backend Struct
// =============================================================================

/// Reference backend executing on the host.
#[derive(Debug)]
pub struct CpuBackend {
    profile: DeviceProfile,
    registry: ImplementationRegistry,
}

impl CpuBackend {
    /// Creates a backend with the host's memory limits.
    #[must_use]
    pub fn new() -> Self {
        Self::with_profile(DeviceProfile::host())
    }

    /// Creates a backend reporting the given profile.
    #[must_use]
    pub fn with_profile(profile: DeviceProfile) -> Self {
        let mut registry = ImplementationRegistry::new();
        register_reference_implementations(&mut registry);
        Self { profile, registry }
    }

    /// Creates a backend with explicit allocation limits.
    #[must_use]
    pub fn with_limits(max_alloc_mem_size: usize, max_global_mem_size: usize) -> Self {
        Self::with_profile(DeviceProfile::host().with_limits(max_alloc_mem_size, max_global_mem_size))
    }
}

impl Default for CpuBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ComputeBackend for CpuBackend {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn profile(&self) -> DeviceProfile {
        self.profile.clone()
    }

    fn allocate(&self, layout: &Layout) -> Result<Memory> {
        Memory::try_zeros(*layout)
    }

    fn select_implementation(&self, request: &ImplementationRequest<'_>) -> Result<Arc<dyn Implementation>> {
        self.registry.create(request)
    }
}

/// Registers the reference kernels of every primitive kind.
pub fn register_reference_implementations(registry: &mut ImplementationRegistry) {
    registry.register(PrimitiveType::InputLayout, None, create_passthrough);
    registry.register(PrimitiveType::Data, None, create_passthrough);
    registry.register(PrimitiveType::Reorder, None, create_reorder);
    for format in ACTIVATION_FORMATS {
        registry.register(PrimitiveType::Convolution, Some(format), create_convolution);
        registry.register(PrimitiveType::Deconvolution, Some(format), create_convolution);
        registry.register(PrimitiveType::Pooling, Some(format), create_pooling);
        registry.register(PrimitiveType::Normalization, Some(format), create_normalization);
        registry.register(PrimitiveType::DepthConcatenate, Some(format), create_concatenation);
    }
    for format in [Format::Bx, Format::Xb] {
        registry.register(PrimitiveType::FullyConnected, Some(format), create_fully_connected);
    }
}

// =============================================================================
// Helper Types
// =============================================================================

/// Logical extents of a layout as (batch, feature, y, x), absent axes count as 1.
#[derive(Debug, Clone, Copy)]
struct Dims {
    b: i32,
    f: i32,
    y: i32,
    x: i32,
}

impl Dims {
    fn of(layout: &Layout) -> Self {
        let size = layout.size;
        Self {
            b: size.axis('b').unwrap_or(1),
            f: size.axis('f').unwrap_or(1),
            y: size.axis('y').unwrap_or(1),
            x: size.axis('x').unwrap_or(1),
        }
    }

    fn count(&self) -> usize {
        [self.b, self.f, self.y, self.x]
            .iter()
            .map(|&v| usize::try_from(v).unwrap_or(0))
            .product()
    }

    /// Every coordinate in canonical (b, f, y, x) order.
    fn coords(&self) -> Vec<[i32; 4]> {
        let mut coords = Vec::with_capacity(self.count());
        for b in 0..self.b {
            for f in 0..self.f {
                for y in 0..self.y {
                    for x in 0..self.x {
                        coords.push([b, f, y, x]);
                    }
                }
            }
        }
        coords
    }

    fn contains(&self, y: i32, x: i32) -> bool {
        y >= 0 && y < self.y && x >= 0 && x < self.x
    }
}

/// Snapshot of an input buffer converted to `f32`.
struct InputView {
    layout: Layout,
    dims: Dims,
    data: Vec<f32>,
}

impl InputView {
    fn new(memory: &Memory) -> Self {
        let layout = *memory.layout();
        let data_type = layout.data_type;
        let bytes = memory.bytes();
        let available = bytes.len() / data_type.size_of();
        let data = (0..layout.get_linear_size().min(available))
            .map(|i| read_as_f32(&bytes, data_type, i))
            .collect();
        Self {
            layout,
            dims: Dims::of(&layout),
            data,
        }
    }

    /// Value at a logical coordinate; positions beyond the padded buffer read as zero.
    fn at(&self, b: i32, f: i32, y: i32, x: i32) -> f32 {
        self.layout
            .offset_of(b, f, y, x)
            .ok()
            .and_then(|offset| self.data.get(offset).copied())
            .unwrap_or(0.0)
    }
}

/// Evaluates `compute` for every output coordinate and stores the results.
///
/// The closure receives the coordinate's index in canonical order and the coordinate.
fn store<F>(output: &Memory, compute: F) -> Result<()>
where
    F: Fn(usize, [i32; 4]) -> f32 + Sync,
{
    let layout = *output.layout();
    let coords = Dims::of(&layout).coords();
    let offsets = coords
        .iter()
        .map(|c| layout.offset_of(c[0], c[1], c[2], c[3]))
        .collect::<Result<Vec<_>>>()?;

    let values: Vec<f32> = if coords.len() >= PARALLEL_THRESHOLD {
        coords.par_iter().enumerate().map(|(i, &c)| compute(i, c)).collect()
    } else {
        coords.iter().enumerate().map(|(i, &c)| compute(i, c)).collect()
    };

    let margins = spatial_margin_offsets(&layout)?;
    let data_type = layout.data_type;
    let mut bytes = output.bytes_mut();
    let fill = layout.padding.filling_value();
    for offset in margins {
        write_from_f32(&mut bytes, data_type, offset, fill);
    }
    for (&offset, value) in offsets.iter().zip(values) {
        write_from_f32(&mut bytes, data_type, offset, value);
    }
    Ok(())
}

/// Offsets of the spatial padding around every (b, f) plane of the view.
///
/// Batch and feature margins are left alone: in a fused buffer they hold the
/// data of neighbouring views.
fn spatial_margin_offsets(layout: &Layout) -> Result<Vec<usize>> {
    let dims = Dims::of(layout);
    let lower = layout.padding.lower_size();
    let upper = layout.padding.upper_size();
    let margin = |padding: Tensor, axis: char| {
        if layout.format().has_axis(axis) {
            padding.axis(axis).unwrap_or(0)
        } else {
            0
        }
    };
    let (top, left) = (margin(lower, 'y'), margin(lower, 'x'));
    let (bottom, right) = (margin(upper, 'y'), margin(upper, 'x'));
    if top + left + bottom + right == 0 {
        return Ok(Vec::new());
    }

    let mut offsets = Vec::new();
    for b in 0..dims.b {
        for f in 0..dims.f {
            for y in -top..dims.y + bottom {
                for x in -left..dims.x + right {
                    if !dims.contains(y, x) {
                        offsets.push(layout.offset_of(b, f, y, x)?);
                    }
                }
            }
        }
    }
    Ok(offsets)
}

fn activate(value: f32, enabled: bool, slope: f32) -> f32 {
    if enabled && value < 0.0 {
        value * slope
    } else {
        value
    }
}

fn missing_input(kernel: &str, expected: usize, actual: usize) -> Error {
    Error::backend(format!("{kernel} expects {expected} inputs, got {actual}"))
}

/// Requests weights in the input's precision when they differ.
fn precision_requirement(request: &ImplementationRequest<'_>, weights_index: usize, format: Option<Format>) -> Result<Option<ReorderSpec>> {
    let (Some(input), Some(weights)) = (request.input_layouts.first(), request.input_layouts.get(weights_index)) else {
        return Ok(None);
    };
    if input.data_type == weights.data_type {
        return Ok(None);
    }
    let size = match format {
        Some(format) => weights.size.transform(format, 1)?,
        None => weights.size,
    };
    Ok(Some(ReorderSpec {
        target: Layout::new(input.data_type, size),
        engine: EngineKind::Device,
        intermediate: None,
    }))
}

// =============================================================================
// Passthrough (input_layout, data)
// =============================================================================

#[derive(Debug)]
struct PassthroughImpl;

impl Implementation for PassthroughImpl {
    fn name(&self) -> &'static str {
        "passthrough"
    }

    fn execute(&self, _inputs: &[Memory], _output: &Memory, wait_events: &[Event]) -> Result<Event> {
        Event::wait_all(wait_events);
        Ok(Event::completed())
    }
}

fn create_passthrough(_request: &ImplementationRequest<'_>) -> Result<Arc<dyn Implementation>> {
    Ok(Arc::new(PassthroughImpl))
}

// =============================================================================
// Reorder
// =============================================================================

#[derive(Debug)]
struct ReorderImpl {
    desc: ReorderDesc,
}

impl Implementation for ReorderImpl {
    fn name(&self) -> &'static str {
        "reorder_ref"
    }

    fn execute(&self, inputs: &[Memory], output: &Memory, wait_events: &[Event]) -> Result<Event> {
        Event::wait_all(wait_events);
        let expected = 1 + usize::from(self.desc.mean.is_some());
        if inputs.len() < expected {
            return Err(missing_input("reorder", expected, inputs.len()));
        }
        let input = InputView::new(&inputs[0]);
        let mean = self.desc.mean.as_ref().map(|_| InputView::new(&inputs[1]));
        let source = input.dims.coords();
        let out_count = Dims::of(output.layout()).count();
        if source.len() != out_count {
            return Err(Error::shape_mismatch(format!(
                "reorder from {} to {} changes the element count",
                input.layout,
                output.layout()
            )));
        }

        store(output, |i, _| {
            let [b, f, y, x] = source[i];
            let mut value = input.at(b, f, y, x);
            if let Some(mean) = &mean {
                let mb = if mean.dims.b > 1 { b } else { 0 };
                value -= mean.at(mb, f, y, x);
            } else if let Some(sub) = usize::try_from(f).ok().and_then(|f| self.desc.subtract_per_feature.get(f)) {
                value -= sub;
            }
            value
        })?;
        Ok(Event::completed())
    }
}

fn create_reorder(request: &ImplementationRequest<'_>) -> Result<Arc<dyn Implementation>> {
    match &request.primitive.desc {
        PrimitiveDesc::Reorder(desc) => Ok(Arc::new(ReorderImpl { desc: desc.clone() })),
        _ => Err(Error::invalid_argument(format!("{} is not a reorder", request.primitive.id))),
    }
}

// =============================================================================
// Convolution / Deconvolution
// =============================================================================

#[derive(Debug)]
struct ConvolutionImpl {
    desc: ConvolutionDesc,
    transposed: bool,
    weights_spec: Option<ReorderSpec>,
}

impl ConvolutionImpl {
    #[allow(clippy::too_many_arguments)]
    fn accumulate(&self, input: &InputView, weights: &InputView, b: i32, in_base: i32, o: i32, y: i32, x: i32) -> f32 {
        let wd = weights.dims;
        let (sx, sy) = (self.desc.stride.spatial(0), self.desc.stride.spatial(1));
        let (ox, oy) = (self.desc.input_offset.spatial(0), self.desc.input_offset.spatial(1));
        let (dx, dy) = (self.desc.dilation.spatial(0), self.desc.dilation.spatial(1));
        let mut acc = 0.0;
        for i in 0..wd.f {
            for ky in 0..wd.y {
                for kx in 0..wd.x {
                    let value = if self.transposed {
                        let ny = y - oy - ky;
                        let nx = x - ox - kx;
                        if ny < 0 || nx < 0 || ny % sy != 0 || nx % sx != 0 {
                            continue;
                        }
                        let (iy, ix) = (ny / sy, nx / sx);
                        if !input.dims.contains(iy, ix) {
                            continue;
                        }
                        input.at(b, in_base + i, iy, ix)
                    } else {
                        input.at(b, in_base + i, y * sy + oy + ky * dy, x * sx + ox + kx * dx)
                    };
                    acc += value * weights.at(o, i, ky, kx);
                }
            }
        }
        acc
    }
}

impl Implementation for ConvolutionImpl {
    fn name(&self) -> &'static str {
        if self.transposed {
            "deconvolution_ref"
        } else {
            "convolution_ref"
        }
    }

    fn execute(&self, inputs: &[Memory], output: &Memory, wait_events: &[Event]) -> Result<Event> {
        Event::wait_all(wait_events);
        let split = self.desc.split();
        let expected = 1 + split + self.desc.bias.len();
        if split == 0 || inputs.len() < expected {
            return Err(missing_input(self.name(), expected, inputs.len()));
        }
        let input = InputView::new(&inputs[0]);
        let weights: Vec<InputView> = inputs[1..=split].iter().map(InputView::new).collect();
        let bias: Vec<InputView> = inputs[1 + split..expected].iter().map(InputView::new).collect();

        let w_ofm = weights[0].dims.b.max(1);
        let ifm = weights[0].dims.f;
        let groups = i32::try_from(self.desc.groups.max(1)).unwrap_or(1);
        let ofm_per_group = (w_ofm / groups).max(1);

        store(output, |_, [b, of, y, x]| {
            let s = of / w_ofm;
            let o = of % w_ofm;
            let Some(w) = usize::try_from(s).ok().and_then(|s| weights.get(s)) else {
                return 0.0;
            };
            let group = s * groups + o / ofm_per_group;
            let mut acc = self.accumulate(&input, w, b, group * ifm, o, y, x);
            if let Some(bias) = usize::try_from(s).ok().and_then(|s| bias.get(s)) {
                acc += bias.at(0, 0, 0, o);
            }
            activate(acc, self.desc.with_activation, self.desc.activation_slope)
        })?;
        Ok(Event::completed())
    }

    fn weights_reorder_requirements(&self) -> Option<ReorderSpec> {
        self.weights_spec.clone()
    }
}

fn create_convolution(request: &ImplementationRequest<'_>) -> Result<Arc<dyn Implementation>> {
    let (desc, transposed) = match &request.primitive.desc {
        PrimitiveDesc::Convolution(desc) => (desc, false),
        PrimitiveDesc::Deconvolution(desc) => (desc, true),
        _ => {
            return Err(Error::invalid_argument(format!(
                "{} is not a convolution",
                request.primitive.id
            )))
        }
    };
    Ok(Arc::new(ConvolutionImpl {
        desc: desc.clone(),
        transposed,
        weights_spec: precision_requirement(request, 1, Some(Format::Bfyx))?,
    }))
}

// =============================================================================
// Fully Connected
// =============================================================================

#[derive(Debug)]
struct FullyConnectedImpl {
    desc: FullyConnectedDesc,
    weights_spec: Option<ReorderSpec>,
}

impl Implementation for FullyConnectedImpl {
    fn name(&self) -> &'static str {
        "fully_connected_ref"
    }

    fn execute(&self, inputs: &[Memory], output: &Memory, wait_events: &[Event]) -> Result<Event> {
        Event::wait_all(wait_events);
        let expected = 2 + usize::from(self.desc.bias.is_some());
        if inputs.len() < expected {
            return Err(missing_input(self.name(), expected, inputs.len()));
        }
        let input = InputView::new(&inputs[0]);
        let weights = InputView::new(&inputs[1]);
        let bias = self.desc.bias.as_ref().map(|_| InputView::new(&inputs[2]));
        let weights_4d = weights.layout.format().is_4d();
        let d = input.dims;
        let plane = d.y * d.x;

        store(output, |_, [b, _, _, o]| {
            let mut acc = bias.as_ref().map_or(0.0, |bias| bias.at(0, 0, 0, o));
            for i in 0..d.f * plane {
                let (fi, yi, xi) = (i / plane, (i / d.x) % d.y, i % d.x);
                let w = if weights_4d {
                    weights.at(o, fi, yi, xi)
                } else {
                    weights.at(o, 0, 0, i)
                };
                acc += input.at(b, fi, yi, xi) * w;
            }
            activate(acc, self.desc.with_activation, self.desc.activation_slope)
        })?;
        Ok(Event::completed())
    }

    fn weights_reorder_requirements(&self) -> Option<ReorderSpec> {
        self.weights_spec.clone()
    }
}

fn create_fully_connected(request: &ImplementationRequest<'_>) -> Result<Arc<dyn Implementation>> {
    match &request.primitive.desc {
        PrimitiveDesc::FullyConnected(desc) => Ok(Arc::new(FullyConnectedImpl {
            desc: desc.clone(),
            weights_spec: precision_requirement(request, 1, None)?,
        })),
        _ => Err(Error::invalid_argument(format!(
            "{} is not a fully-connected layer",
            request.primitive.id
        ))),
    }
}

// =============================================================================
// Pooling
// =============================================================================

#[derive(Debug)]
struct PoolingImpl {
    desc: PoolingDesc,
}

impl Implementation for PoolingImpl {
    fn name(&self) -> &'static str {
        "pooling_ref"
    }

    fn execute(&self, inputs: &[Memory], output: &Memory, wait_events: &[Event]) -> Result<Event> {
        Event::wait_all(wait_events);
        let Some(first) = inputs.first() else {
            return Err(missing_input(self.name(), 1, 0));
        };
        let input = InputView::new(first);
        let (wx, wy) = (self.desc.size.spatial(0), self.desc.size.spatial(1));
        let (sx, sy) = (self.desc.stride.spatial(0), self.desc.stride.spatial(1));
        let (ox, oy) = (self.desc.input_offset.spatial(0), self.desc.input_offset.spatial(1));
        let window = (wx * wy).max(1) as f32;

        store(output, |_, [b, f, y, x]| {
            let mut max = f32::NEG_INFINITY;
            let mut sum = 0.0;
            for ky in 0..wy {
                for kx in 0..wx {
                    let (iy, ix) = (y * sy + oy + ky, x * sx + ox + kx);
                    if !input.dims.contains(iy, ix) {
                        continue;
                    }
                    let value = input.at(b, f, iy, ix);
                    max = max.max(value);
                    sum += value;
                }
            }
            match self.desc.mode {
                PoolingMode::Max if max.is_finite() => max,
                PoolingMode::Max => 0.0,
                PoolingMode::Average => sum / window,
            }
        })?;
        Ok(Event::completed())
    }
}

fn create_pooling(request: &ImplementationRequest<'_>) -> Result<Arc<dyn Implementation>> {
    match &request.primitive.desc {
        PrimitiveDesc::Pooling(desc) => Ok(Arc::new(PoolingImpl { desc: desc.clone() })),
        _ => Err(Error::invalid_argument(format!("{} is not a pooling layer", request.primitive.id))),
    }
}

// =============================================================================
// Local Response Normalization
// =============================================================================

#[derive(Debug)]
struct NormalizationImpl {
    desc: NormalizationDesc,
}

impl Implementation for NormalizationImpl {
    fn name(&self) -> &'static str {
        "lrn_ref"
    }

    fn execute(&self, inputs: &[Memory], output: &Memory, wait_events: &[Event]) -> Result<Event> {
        Event::wait_all(wait_events);
        let Some(first) = inputs.first() else {
            return Err(missing_input(self.name(), 1, 0));
        };
        let input = InputView::new(first);
        let d = input.dims;
        let size = i32::try_from(self.desc.size.max(1)).unwrap_or(1);
        let half = size / 2;
        let NormalizationDesc { k, alpha, beta, region, .. } = self.desc;

        store(output, |_, [b, f, y, x]| {
            let value = input.at(b, f, y, x);
            let (sum, taps) = match region {
                NormRegion::AcrossChannel => {
                    let sum: f32 = (f - half..=f + half)
                        .filter(|&c| c >= 0 && c < d.f)
                        .map(|c| input.at(b, c, y, x).powi(2))
                        .sum();
                    (sum, size)
                }
                NormRegion::WithinChannel => {
                    let mut sum = 0.0;
                    for iy in y - half..=y + half {
                        for ix in x - half..=x + half {
                            if d.contains(iy, ix) {
                                sum += input.at(b, f, iy, ix).powi(2);
                            }
                        }
                    }
                    (sum, size * size)
                }
            };
            value / (k + alpha * sum / taps as f32).powf(beta)
        })?;
        Ok(Event::completed())
    }
}

fn create_normalization(request: &ImplementationRequest<'_>) -> Result<Arc<dyn Implementation>> {
    match &request.primitive.desc {
        PrimitiveDesc::Normalization(desc) => Ok(Arc::new(NormalizationImpl { desc: desc.clone() })),
        _ => Err(Error::invalid_argument(format!("{} is not a normalization", request.primitive.id))),
    }
}

// =============================================================================
// Depth Concatenation
// =============================================================================

#[derive(Debug)]
struct ConcatenationImpl;

impl Implementation for ConcatenationImpl {
    fn name(&self) -> &'static str {
        "depth_concatenate_ref"
    }

    fn execute(&self, inputs: &[Memory], output: &Memory, wait_events: &[Event]) -> Result<Event> {
        Event::wait_all(wait_events);
        if inputs.is_empty() {
            return Err(missing_input(self.name(), 1, 0));
        }
        let views: Vec<InputView> = inputs.iter().map(InputView::new).collect();
        let mut starts = Vec::with_capacity(views.len());
        let mut start = 0;
        for view in &views {
            starts.push(start);
            start += view.dims.f;
        }

        store(output, |_, [b, f, y, x]| {
            let index = starts.partition_point(|&s| s <= f).saturating_sub(1);
            views[index].at(b, f - starts[index], y, x)
        })?;
        Ok(Event::completed())
    }
}

fn create_concatenation(_request: &ImplementationRequest<'_>) -> Result<Arc<dyn Implementation>> {
    Ok(Arc::new(ConcatenationImpl))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::DataType;
    use crate::layout::Padding;
    use crate::primitive::Primitive;
    use crate::tensor::Tensor;
    use half::f16;

    fn bfyx(sizes: [i32; 4]) -> Layout {
        Layout::new(DataType::F32, Tensor::bfyx(sizes[0], sizes[1], sizes[2], sizes[3]))
    }

    fn mem(layout: Layout, values: &[f32]) -> Memory {
        Memory::from_data(layout, values).unwrap()
    }

    fn run(primitive: &Primitive, inputs: &[Memory], output_layout: Layout) -> Vec<f32> {
        let backend = CpuBackend::new();
        let layouts: Vec<Layout> = inputs.iter().map(|m| *m.layout()).collect();
        let profile = backend.profile();
        let request = ImplementationRequest {
            primitive,
            output_layout: &output_layout,
            input_layouts: &layouts,
            profile: &profile,
            tuning: false,
        };
        let kernel = backend.select_implementation(&request).unwrap();
        let output = backend.allocate(&output_layout).unwrap();
        let event = kernel.execute(inputs, &output, &[Event::completed()]).unwrap();
        assert!(event.is_set());
        output.to_f32_vec().unwrap()
    }

    #[test]
    fn test_convolution_with_bias() {
        let conv = Primitive::convolution("conv", "in", ConvolutionDesc::new(["w"], ["b"]));
        let input = mem(bfyx([1, 1, 3, 3]), &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0]);
        let weights = mem(bfyx([1, 1, 2, 2]), &[1.0; 4]);
        let bias = mem(Layout::new(DataType::F32, Tensor::new(Format::X, &[1]).unwrap()), &[0.5]);
        let out = run(&conv, &[input, weights, bias], bfyx([1, 1, 2, 2]));
        assert_eq!(out, vec![12.5, 16.5, 24.5, 28.5]);
    }

    #[test]
    fn test_convolution_reads_implicit_padding_as_zero() {
        let conv = Primitive::convolution(
            "conv",
            "in",
            ConvolutionDesc::new(["w"], Vec::<String>::new()).with_input_offset(Tensor::bfyx(0, 0, -1, -1)),
        );
        let input = mem(bfyx([1, 1, 2, 2]), &[1.0, 2.0, 3.0, 4.0]);
        let weights = mem(bfyx([1, 1, 3, 3]), &[1.0; 9]);
        let out = run(&conv, &[input, weights], bfyx([1, 1, 2, 2]));
        assert_eq!(out, vec![10.0; 4]);
    }

    #[test]
    fn test_split_convolution() {
        let conv = Primitive::convolution("conv", "in", ConvolutionDesc::new(["w0", "w1"], ["b0", "b1"]));
        let input = mem(bfyx([1, 2, 1, 1]), &[2.0, 3.0]);
        let w0 = mem(bfyx([1, 1, 1, 1]), &[10.0]);
        let w1 = mem(bfyx([1, 1, 1, 1]), &[100.0]);
        let b = Layout::new(DataType::F32, Tensor::new(Format::X, &[1]).unwrap());
        let out = run(&conv, &[input, w0, w1, mem(b, &[1.0]), mem(b, &[-1.0])], bfyx([1, 2, 1, 1]));
        assert_eq!(out, vec![21.0, 299.0]);
    }

    #[test]
    fn test_deconvolution() {
        let deconv = Primitive::deconvolution("d", "in", ConvolutionDesc::new(["w"], Vec::<String>::new()));
        let input = mem(bfyx([1, 1, 1, 2]), &[1.0, 2.0]);
        let weights = mem(bfyx([1, 1, 1, 2]), &[1.0, 1.0]);
        let out = run(&deconv, &[input, weights], bfyx([1, 1, 1, 3]));
        assert_eq!(out, vec![1.0, 3.0, 2.0]);
    }

    #[test]
    fn test_pooling_modes() {
        let input = mem(bfyx([1, 1, 2, 4]), &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0]);
        let window = Tensor::spatial_xy(2, 2);
        let max = Primitive::pooling("p", "in", PoolingDesc::new(PoolingMode::Max, window, window));
        assert_eq!(run(&max, &[input.clone()], bfyx([1, 1, 1, 2])), vec![6.0, 8.0]);

        let avg = Primitive::pooling("p", "in", PoolingDesc::new(PoolingMode::Average, window, window));
        assert_eq!(run(&avg, &[input], bfyx([1, 1, 1, 2])), vec![3.5, 5.5]);
    }

    #[test]
    fn test_reorder_changes_format_and_subtracts() {
        let input = mem(bfyx([2, 2, 1, 1]), &[1.0, 2.0, 3.0, 4.0]);
        let target = Layout::new(DataType::F32, Tensor::bfyx(2, 2, 1, 1).transform(Format::Yxfb, 1).unwrap());

        let plain = Primitive::reorder("r", "in", ReorderDesc::new(Format::Yxfb, DataType::F32));
        assert_eq!(run(&plain, &[input.clone()], target), vec![1.0, 3.0, 2.0, 4.0]);

        let sub = Primitive::reorder(
            "r",
            "in",
            ReorderDesc::new(Format::Yxfb, DataType::F32).with_subtract_per_feature(vec![1.0, 0.0]),
        );
        assert_eq!(run(&sub, &[input], target), vec![0.0, 2.0, 2.0, 4.0]);
    }

    #[test]
    fn test_reorder_writes_output_padding() {
        let input = mem(bfyx([1, 1, 1, 1]), &[3.0]);
        let padded = bfyx([1, 1, 1, 1]).with_padding(Padding::symmetric(Tensor::bfyx(0, 0, 0, 1), 0.0));
        let reorder = Primitive::reorder("r", "in", ReorderDesc::new(Format::Bfyx, DataType::F32));
        assert_eq!(run(&reorder, &[input], padded), vec![3.0]);
    }

    #[test]
    fn test_store_keeps_neighbouring_feature_slices() {
        let shared = Memory::zeros(bfyx([1, 3, 1, 2]));
        shared.write_logical(&[9.0f32, 9.0, 9.0, 9.0, 9.0, 9.0]).unwrap();
        let middle = bfyx([1, 1, 1, 2]).with_padding(Padding::new(
            Tensor::bfyx(0, 1, 0, 0),
            Tensor::bfyx(0, 1, 0, 0),
            0.0,
        ));
        let view = shared.reinterpret(middle).unwrap();

        store(&view, |_, [_, _, _, x]| x as f32 + 1.0).unwrap();
        assert_eq!(view.to_f32_vec().unwrap(), vec![1.0, 2.0]);
        assert_eq!(shared.to_f32_vec().unwrap(), vec![9.0, 9.0, 1.0, 2.0, 9.0, 9.0]);
    }

    #[test]
    fn test_store_fills_spatial_margins() {
        let padded = bfyx([1, 1, 1, 1]).with_padding(Padding::symmetric(Tensor::bfyx(0, 0, 1, 1), -1.0));
        let output = Memory::zeros(padded);
        store(&output, |_, _| 5.0).unwrap();
        let raw: Vec<f32> = (0..9).map(|i| output.read_f32(i)).collect();
        assert_eq!(raw, vec![-1.0, -1.0, -1.0, -1.0, 5.0, -1.0, -1.0, -1.0, -1.0]);
    }

    #[test]
    fn test_fully_connected_with_activation() {
        let fc = Primitive::fully_connected("fc", "in", FullyConnectedDesc::new("w", Some("b")).with_activation(0.1));
        let bx = |b: i32, x: i32| Layout::new(DataType::F32, Tensor::new(Format::Bx, &[b, x]).unwrap());
        let input = mem(bx(1, 3), &[1.0, 2.0, 3.0]);
        let weights = mem(bx(2, 3), &[1.0, 0.0, 1.0, 0.0, 1.0, 0.0]);
        let bias = mem(Layout::new(DataType::F32, Tensor::new(Format::X, &[2]).unwrap()), &[0.5, -10.0]);
        let out = run(&fc, &[input, weights, bias], bx(1, 2));
        assert_eq!(out[0], 4.5);
        assert!((out[1] + 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_depth_concatenate() {
        let cat = Primitive::depth_concatenate("cat", ["a", "b"]);
        let a = mem(bfyx([1, 1, 1, 2]), &[1.0, 2.0]);
        let b = mem(bfyx([1, 1, 1, 2]), &[3.0, 4.0]);
        assert_eq!(run(&cat, &[a, b], bfyx([1, 2, 1, 2])), vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_lrn_across_channel() {
        let lrn = Primitive::normalization(
            "lrn",
            "in",
            NormalizationDesc {
                size: 1,
                k: 1.0,
                alpha: 1.0,
                beta: 1.0,
                region: NormRegion::AcrossChannel,
            },
        );
        let input = mem(bfyx([1, 2, 1, 1]), &[1.0, 2.0]);
        assert_eq!(run(&lrn, &[input], bfyx([1, 2, 1, 1])), vec![0.5, 0.4]);
    }

    #[test]
    fn test_weights_precision_requirement() {
        let backend = CpuBackend::new();
        let conv = Primitive::convolution("conv", "in", ConvolutionDesc::new(["w"], ["b"]));
        let input = bfyx([1, 3, 8, 8]);
        let weights = Layout::new(DataType::F16, Tensor::bfyx(8, 3, 3, 3));
        let bias = Layout::new(DataType::F32, Tensor::new(Format::X, &[8]).unwrap());
        let output = bfyx([1, 8, 6, 6]);
        let profile = backend.profile();
        let layouts = [input, weights, bias];
        let request = ImplementationRequest {
            primitive: &conv,
            output_layout: &output,
            input_layouts: &layouts,
            profile: &profile,
            tuning: false,
        };
        let kernel = backend.select_implementation(&request).unwrap();
        let spec = kernel.weights_reorder_requirements().unwrap();
        assert_eq!(spec.target, Layout::new(DataType::F32, Tensor::bfyx(8, 3, 3, 3)));
        assert_eq!(spec.engine, EngineKind::Device);

        let layouts = [input, Layout::new(DataType::F32, Tensor::bfyx(8, 3, 3, 3)), bias];
        let request = ImplementationRequest {
            input_layouts: &layouts,
            ..request
        };
        assert!(backend
            .select_implementation(&request)
            .unwrap()
            .weights_reorder_requirements()
            .is_none());
    }

    #[test]
    fn test_half_precision_kernel_output() {
        let reorder = Primitive::reorder("r", "in", ReorderDesc::new(Format::Bfyx, DataType::F16));
        let input = mem(bfyx([1, 1, 1, 2]), &[1.5, -2.0]);
        let out_layout = Layout::new(DataType::F16, Tensor::bfyx(1, 1, 1, 2));
        let backend = CpuBackend::new();
        let profile = backend.profile();
        let layouts = [*input.layout()];
        let request = ImplementationRequest {
            primitive: &reorder,
            output_layout: &out_layout,
            input_layouts: &layouts,
            profile: &profile,
            tuning: false,
        };
        let output = backend.allocate(&out_layout).unwrap();
        backend
            .select_implementation(&request)
            .unwrap()
            .execute(&[input], &output, &[])
            .unwrap();
        assert_eq!(
            output.to_vec::<f16>().unwrap(),
            vec![f16::from_f32(1.5), f16::from_f32(-2.0)]
        );
    }
}
