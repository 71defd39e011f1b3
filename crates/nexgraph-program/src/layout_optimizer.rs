//! Layout Optimizer - Preferred Formats and Reorder Caching
//!
//! Decides which layout a convolution, deconvolution or fully-connected layer
//! wants for its input, weights and bias, and hands out `reorder` primitives
//! converting data into that layout. Reorders are cached by
//! `(source id, expected layout)` for the whole build, so every consumer that
//! needs the same conversion of the same source shares one reorder.
//!
//! Two caches are kept: reorders requested by the layout rules
//! (`reorder_{n}_{source}`) and weight reorders requested by backend
//! implementations (`generic_layer_{n}_{source}`).
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use std::sync::Arc;

use nexgraph_core::{
    DataType, EngineKind, Error, Format, Layout, Primitive, PrimitiveDesc, PrimitiveId, ReorderDesc, ReorderSpec,
    Result, Tensor,
};
use rustc_hash::FxHashMap;

// =============================================================================
// Types
// =============================================================================

/// How a consumer uses the data being laid out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataRole {
    /// Filter or fully-connected weights.
    Weights,
    /// Bias values.
    Bias,
    /// Primary activation input.
    Input,
}

/// Whole-program facts that steer the convolution input rule.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OptimizationAttributes {
    /// Some convolution uses more than one split.
    pub splitted_convolution: bool,
    /// Some layer only supports `bfyx`.
    pub bfyx_only_layer: bool,
}

/// A reorder handed out by the optimizer.
#[derive(Debug, Clone)]
pub struct CachedReorder {
    /// The reorder primitive.
    pub primitive: Arc<Primitive>,
    /// True if an earlier request already created this reorder.
    pub cached: bool,
}

type CacheKey = (PrimitiveId, Layout);

// =============================================================================
// Layout Optimizer
// =============================================================================

/// Format policy plus the build-wide reorder caches.
#[derive(Debug, Default)]
pub struct LayoutOptimizer {
    attributes: OptimizationAttributes,
    output_size_handling: bool,
    reorders: FxHashMap<CacheKey, Arc<Primitive>>,
    generic_layers: FxHashMap<CacheKey, Arc<Primitive>>,
}

impl LayoutOptimizer {
    /// Creates an optimizer with empty caches.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Keeps convolutions with a requested output size on `bfyx` input.
    #[must_use]
    pub fn with_output_size_handling(mut self, enabled: bool) -> Self {
        self.output_size_handling = enabled;
        self
    }

    /// Returns the current optimization attributes.
    #[must_use]
    pub const fn attributes(&self) -> OptimizationAttributes {
        self.attributes
    }

    /// Replaces the optimization attributes.
    pub fn set_attributes(&mut self, attributes: OptimizationAttributes) {
        self.attributes = attributes;
    }

    /// Number of distinct layout reorders created so far.
    #[must_use]
    pub fn reorder_count(&self) -> usize {
        self.reorders.len()
    }

    /// Number of distinct backend weight reorders created so far.
    #[must_use]
    pub fn generic_layer_count(&self) -> usize {
        self.generic_layers.len()
    }

    /// Layout `user` wants for data currently in `current`, used in `role`.
    ///
    /// `reference` is the user's output layout for weights and bias, and the
    /// weights layout for a convolution input.
    pub fn expected_layout(&self, current: &Layout, role: DataRole, user: &Primitive, reference: &Layout) -> Result<Layout> {
        match (&user.desc, role) {
            (_, DataRole::Bias) => {
                let count = i32::try_from(current.count())
                    .map_err(|_| Error::invalid_argument(format!("bias of '{}' is too large", user.id)))?;
                Ok(Layout::new(reference.data_type, Tensor::bfyx(1, 1, 1, count)))
            }
            (PrimitiveDesc::Convolution(desc), DataRole::Input) => {
                if !current.format().is_4d() {
                    return Err(Error::shape_mismatch(format!(
                        "convolution input of '{}' must be 4-dimensional, got {}",
                        user.id,
                        current.format()
                    )));
                }
                let format = if self.output_size_handling && desc.output_size.is_some() {
                    Format::Bfyx
                } else {
                    self.convolution_input_format(current, reference, desc.stride, desc.input_offset)
                };
                Ok(Layout::new(current.data_type, current.size.transform(format, 1)?))
            }
            (PrimitiveDesc::Convolution(_), DataRole::Weights) => convolution_weights_layout(current, reference),
            (PrimitiveDesc::FullyConnected(_), DataRole::Weights) => fully_connected_weights_layout(current, reference),
            (PrimitiveDesc::Deconvolution(_), DataRole::Weights) => {
                Ok(Layout::new(reference.data_type, current.size))
            }
            (PrimitiveDesc::Deconvolution(_) | PrimitiveDesc::FullyConnected(_), DataRole::Input) => {
                Ok(Layout::new(current.data_type, current.size))
            }
            _ => Err(Error::not_implemented(format!(
                "layout optimization of {role:?} for {} '{}'",
                user.kind(),
                user.id
            ))),
        }
    }

    /// Input format rule for convolutions.
    fn convolution_input_format(&self, input: &Layout, weights: &Layout, stride: Tensor, offset: Tensor) -> Format {
        let pointwise = weights.size.spatial(0) == 1
            && weights.size.spatial(1) == 1
            && stride.spatial(0) == 1
            && stride.spatial(1) == 1
            && offset.spatial(0) == 0
            && offset.spatial(1) == 0;
        if pointwise {
            let aligned_bfyx = input.size.feature() % 8 == 0
                && (input.size.spatial(0) * input.size.spatial(1)) % 16 == 0
                && !input.is_padded()
                && input.format() == Format::Bfyx;
            return if aligned_bfyx { input.format() } else { Format::Bf8Xy16 };
        }
        if self.prefers_bfyx(input, weights, stride) {
            Format::Bfyx
        } else {
            Format::Yxfb
        }
    }

    /// Cases where `bfyx` beats `yxfb` for a convolution input.
    fn prefers_bfyx(&self, input: &Layout, weights: &Layout, stride: Tensor) -> bool {
        let batch = input.size.batch();
        let (out_x, out_y) = (input.size.spatial(0), input.size.spatial(1));
        let (k_x, k_y) = (weights.size.spatial(0), weights.size.spatial(1));
        let ifm = weights.size.feature();

        let table = (k_x == 1 && k_y == 1)
            || (k_x >= 5 && k_y >= 5)
            || (stride.spatial(0) > 1 && stride.spatial(1) > 1)
            || (ifm <= 32 && out_x < 224 && out_y < 224)
            || (ifm <= 64 && out_x < 112 && out_y < 112)
            || (ifm <= 128 && out_x < 56 && out_y < 56)
            || (ifm <= 256 && out_x < 28 && out_y < 28)
            || (ifm <= 512 && out_x < 14 && out_y < 14)
            || (ifm <= 1024 && out_x <= 7 && out_y <= 7);
        let gated = batch % 16 != 0 || input.data_type != DataType::F16 || weights.size.batch() % 16 != 0;

        gated
            || !table
            || (out_x == 82 && out_y == 82)
            || (self.attributes.splitted_convolution && batch == 16)
            || (!self.attributes.splitted_convolution && batch >= 128)
            || self.attributes.bfyx_only_layer
    }

    /// Returns a reorder converting `source` from `current` into the layout
    /// `user` expects, or `None` if `current` already matches.
    pub fn get_reorder(
        &mut self,
        current: &Layout,
        source: &str,
        role: DataRole,
        user: &Primitive,
        reference: &Layout,
    ) -> Result<Option<CachedReorder>> {
        let expected = self.expected_layout(current, role, user, reference)?;
        Ok(self.create_reorder_if_needed(current, source, expected))
    }

    /// Returns the cached or a new reorder of `source` into `expected`, unless
    /// `current` already equals `expected`.
    pub fn create_reorder_if_needed(&mut self, current: &Layout, source: &str, expected: Layout) -> Option<CachedReorder> {
        if *current == expected {
            return None;
        }
        Some(Self::cached(&mut self.reorders, "reorder", source, expected))
    }

    /// Reorders implementing a backend's weights requirement, in insertion order.
    ///
    /// A host conversion with an intermediate layout first gets a plain
    /// reorder into that layout.
    pub fn get_generic_layer(&mut self, spec: &ReorderSpec, source: &str, current: &Layout) -> Vec<CachedReorder> {
        let mut chain = Vec::with_capacity(2);
        let mut source = source.to_string();
        if spec.engine == EngineKind::Host {
            if let Some(intermediate) = spec.intermediate {
                if let Some(reorder) = self.create_reorder_if_needed(current, &source, intermediate) {
                    source.clone_from(&reorder.primitive.id);
                    chain.push(reorder);
                }
            }
        }
        chain.push(Self::cached(&mut self.generic_layers, "generic_layer", &source, spec.target));
        chain
    }

    fn cached(
        cache: &mut FxHashMap<CacheKey, Arc<Primitive>>,
        prefix: &str,
        source: &str,
        expected: Layout,
    ) -> CachedReorder {
        let key = (source.to_string(), expected);
        if let Some(primitive) = cache.get(&key) {
            return CachedReorder {
                primitive: Arc::clone(primitive),
                cached: true,
            };
        }
        let id = format!("{prefix}_{}_{source}", cache.len());
        let primitive = Arc::new(
            Primitive::reorder(id, source, ReorderDesc::new(expected.format(), expected.data_type))
                .with_output_padding(expected.padding),
        );
        cache.insert(key, Arc::clone(&primitive));
        CachedReorder {
            primitive,
            cached: false,
        }
    }
}

// =============================================================================
// Weights Policies
// =============================================================================

/// Convolution weights: sliced output features unless a large half-precision
/// batch favours the batch-interleaved layout.
fn convolution_weights_layout(current: &Layout, output: &Layout) -> Result<Layout> {
    let batch = output.size.batch();
    let format = if batch == 1 || output.data_type != DataType::F16 {
        Format::OsIyxOsv16
    } else {
        Format::Yxfb
    };
    Ok(Layout::new(output.data_type, current.size.transform(format, 1)?))
}

/// Fully-connected weights: flattened to (outputs, inputs) in a blocked
/// format chosen by batch size and precision.
fn fully_connected_weights_layout(current: &Layout, output: &Layout) -> Result<Layout> {
    let batch = output.size.axis('b').unwrap_or(1);
    let half = output.data_type == DataType::F16;
    let size = current.size;
    let tensor = if size.format().is_4d() {
        let flat = [size.batch(), size.feature() * size.spatial(0) * size.spatial(1)];
        if batch > 1 && !half {
            Tensor::new(Format::BsXsXsv8Bsv8, &flat)?
        } else if batch == 1 {
            Tensor::new(Format::BsXBsv16, &flat)?
        } else {
            size.transform(Format::Yxfb, 1)?
        }
    } else if batch >= 8 && !half {
        size.fold_into(Format::BsXsXsv8Bsv8)?
    } else if batch == 1 {
        size.fold_into(Format::BsXBsv16)?
    } else {
        size.fold_into(Format::Xb)?
    };
    Ok(Layout::new(output.data_type, tensor))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use nexgraph_core::{ConvolutionDesc, FullyConnectedDesc};

    fn conv() -> Primitive {
        Primitive::convolution("conv", "in", ConvolutionDesc::new(["w"], ["b"]))
    }

    fn layout(dt: DataType, b: i32, f: i32, y: i32, x: i32) -> Layout {
        Layout::new(dt, Tensor::bfyx(b, f, y, x))
    }

    #[test]
    fn test_small_batch_convolution_keeps_bfyx() {
        let lo = LayoutOptimizer::new();
        let input = layout(DataType::F32, 1, 3, 8, 8);
        let weights = layout(DataType::F32, 8, 3, 3, 3);
        let expected = lo.expected_layout(&input, DataRole::Input, &conv(), &weights).unwrap();
        assert_eq!(expected, input);
    }

    #[test]
    fn test_pointwise_convolution_prefers_bf8_xy16() {
        let lo = LayoutOptimizer::new();
        let weights = layout(DataType::F32, 8, 3, 1, 1);
        let unaligned = layout(DataType::F32, 1, 3, 5, 5);
        let expected = lo.expected_layout(&unaligned, DataRole::Input, &conv(), &weights).unwrap();
        assert_eq!(expected.format(), Format::Bf8Xy16);

        let aligned = layout(DataType::F32, 1, 8, 4, 4);
        let expected = lo.expected_layout(&aligned, DataRole::Input, &conv(), &weights).unwrap();
        assert_eq!(expected, aligned);
    }

    #[test]
    fn test_requested_output_size_keeps_bfyx() {
        let weights = layout(DataType::F32, 8, 3, 1, 1);
        let input = layout(DataType::F32, 1, 3, 5, 5);
        let sized = Primitive::convolution(
            "conv",
            "in",
            ConvolutionDesc::new(["w"], ["b"]).with_output_size(Tensor::spatial_xy(7, 7)),
        );

        let lo = LayoutOptimizer::new();
        let expected = lo.expected_layout(&input, DataRole::Input, &sized, &weights).unwrap();
        assert_eq!(expected.format(), Format::Bf8Xy16);

        let lo = LayoutOptimizer::new().with_output_size_handling(true);
        let expected = lo.expected_layout(&input, DataRole::Input, &sized, &weights).unwrap();
        assert_eq!(expected, input);
        let expected = lo.expected_layout(&input, DataRole::Input, &conv(), &weights).unwrap();
        assert_eq!(expected.format(), Format::Bf8Xy16);
    }

    #[test]
    fn test_large_half_batch_prefers_yxfb() {
        let mut lo = LayoutOptimizer::new();
        let input = layout(DataType::F16, 32, 64, 100, 100);
        let weights = layout(DataType::F16, 64, 64, 3, 3);
        let expected = lo.expected_layout(&input, DataRole::Input, &conv(), &weights).unwrap();
        assert_eq!(expected.format(), Format::Yxfb);

        lo.set_attributes(OptimizationAttributes {
            splitted_convolution: false,
            bfyx_only_layer: true,
        });
        let expected = lo.expected_layout(&input, DataRole::Input, &conv(), &weights).unwrap();
        assert_eq!(expected.format(), Format::Bfyx);
    }

    #[test]
    fn test_bias_is_flattened() {
        let lo = LayoutOptimizer::new();
        let bias = Layout::new(DataType::F32, Tensor::new(Format::X, &[8]).unwrap());
        let output = layout(DataType::F16, 1, 8, 6, 6);
        let expected = lo.expected_layout(&bias, DataRole::Bias, &conv(), &output).unwrap();
        assert_eq!(expected, layout(DataType::F16, 1, 1, 1, 8));
    }

    #[test]
    fn test_fully_connected_weights_policy() {
        let lo = LayoutOptimizer::new();
        let fc = Primitive::fully_connected("fc", "in", FullyConnectedDesc::new("w", None));
        let weights = layout(DataType::F32, 10, 2, 2, 2);
        let single = Layout::new(DataType::F32, Tensor::new(Format::Bx, &[1, 10]).unwrap());
        let expected = lo.expected_layout(&weights, DataRole::Weights, &fc, &single).unwrap();
        assert_eq!(expected.size, Tensor::new(Format::BsXBsv16, &[10, 8]).unwrap());

        let batched = Layout::new(DataType::F32, Tensor::new(Format::Xb, &[10, 4]).unwrap());
        let expected = lo.expected_layout(&weights, DataRole::Weights, &fc, &batched).unwrap();
        assert_eq!(expected.format(), Format::BsXsXsv8Bsv8);
    }

    #[test]
    fn test_reorders_are_cached_per_source_and_layout() {
        let mut lo = LayoutOptimizer::new();
        let current = layout(DataType::F32, 1, 3, 5, 5);
        let target = current.with_padding(nexgraph_core::Padding::none());
        assert!(lo.create_reorder_if_needed(&current, "in", target).is_none());

        let yxfb = Layout::new(DataType::F32, current.size.transform(Format::Yxfb, 1).unwrap());
        let first = lo.create_reorder_if_needed(&current, "in", yxfb).unwrap();
        let second = lo.create_reorder_if_needed(&current, "in", yxfb).unwrap();
        let other = lo.create_reorder_if_needed(&current, "other", yxfb).unwrap();
        assert!(!first.cached);
        assert!(second.cached);
        assert!(Arc::ptr_eq(&first.primitive, &second.primitive));
        assert_eq!(first.primitive.id, "reorder_0_in");
        assert_eq!(other.primitive.id, "reorder_1_other");
        assert_eq!(lo.reorder_count(), 2);
    }

    #[test]
    fn test_generic_layer_with_host_intermediate() {
        let mut lo = LayoutOptimizer::new();
        let current = layout(DataType::F16, 8, 3, 3, 3);
        let intermediate = layout(DataType::F32, 8, 3, 3, 3);
        let target = Layout::new(DataType::F32, current.size.transform(Format::OsIyxOsv16, 1).unwrap());
        let spec = ReorderSpec {
            target,
            engine: EngineKind::Host,
            intermediate: Some(intermediate),
        };
        let chain = lo.get_generic_layer(&spec, "w", &current);
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[0].primitive.id, "reorder_0_w");
        assert_eq!(chain[1].primitive.id, "generic_layer_0_reorder_0_w");
        assert_eq!(chain[1].primitive.inputs, vec!["reorder_0_w".to_string()]);

        let again = lo.get_generic_layer(&spec, "w", &current);
        assert!(again.iter().all(|r| r.cached));
        assert_eq!(lo.generic_layer_count(), 1);
    }
}
