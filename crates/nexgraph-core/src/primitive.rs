//! Primitive - Immutable Operation Descriptions
//!
//! A `Primitive` describes one operation of a network: its id, the ids of its
//! inputs, padding requirements and the kind-specific parameters. Primitives
//! are never mutated after construction; graph passes build a new value and
//! swap it in.
//!
//! # Example
//! ```rust
//! use nexgraph_core::{ConvolutionDesc, Primitive, Tensor};
//!
//! let conv = Primitive::convolution(
//!     "conv",
//!     "input",
//!     ConvolutionDesc::new(["weights"], ["bias"]).with_stride(Tensor::spatial_xy(2, 2)),
//! );
//! assert_eq!(conv.dependencies(), vec!["input", "weights", "bias"]);
//! ```
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use core::fmt;

use crate::dtype::DataType;
use crate::layout::{Layout, Padding};
use crate::memory::Memory;
use crate::tensor::{Format, Tensor};

/// Identifier of a primitive inside a topology.
pub type PrimitiveId = String;

// =============================================================================
// Primitive Type Tags
// =============================================================================

/// Discriminant of `PrimitiveDesc`, used for dispatch tables and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PrimitiveType {
    /// Network input placeholder.
    InputLayout,
    /// Constant buffer.
    Data,
    /// 2D convolution.
    Convolution,
    /// 2D transposed convolution.
    Deconvolution,
    /// Fully-connected (inner product).
    FullyConnected,
    /// Spatial pooling.
    Pooling,
    /// Local response normalization.
    Normalization,
    /// Concatenation along the feature axis.
    DepthConcatenate,
    /// Format and data type conversion.
    Reorder,
}

impl PrimitiveType {
    /// Returns the short name of this primitive type.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::InputLayout => "input_layout",
            Self::Data => "data",
            Self::Convolution => "convolution",
            Self::Deconvolution => "deconvolution",
            Self::FullyConnected => "fully_connected",
            Self::Pooling => "pooling",
            Self::Normalization => "normalization",
            Self::DepthConcatenate => "depth_concatenate",
            Self::Reorder => "reorder",
        }
    }
}

impl fmt::Display for PrimitiveType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// =============================================================================
// Kind-Specific Descriptions
// =============================================================================

/// Parameters shared by convolution and deconvolution.
///
/// One weights/bias id per split. Offsets are non-positive when the window
/// reads into implicit zero padding.
#[derive(Debug, Clone, PartialEq)]
pub struct ConvolutionDesc {
    /// Weights ids, one per split.
    pub weights: Vec<PrimitiveId>,
    /// Bias ids, one per split.
    pub bias: Vec<PrimitiveId>,
    /// Window step along x/y.
    pub stride: Tensor,
    /// Position of the first window relative to the input origin.
    pub input_offset: Tensor,
    /// Spacing between filter taps (convolution only).
    pub dilation: Tensor,
    /// Apply a (leaky) ReLU to the result.
    pub with_activation: bool,
    /// Slope for negative values when the activation is enabled.
    pub activation_slope: f32,
    /// Number of groups packed into a single weights buffer.
    pub groups: u32,
    /// Spatial output extent requested by the user, overriding the window arithmetic.
    pub output_size: Option<Tensor>,
}

impl ConvolutionDesc {
    /// Creates a description with unit stride and dilation and no offset.
    pub fn new<W, B>(weights: W, bias: B) -> Self
    where
        W: IntoIterator,
        W::Item: Into<PrimitiveId>,
        B: IntoIterator,
        B::Item: Into<PrimitiveId>,
    {
        Self {
            weights: weights.into_iter().map(Into::into).collect(),
            bias: bias.into_iter().map(Into::into).collect(),
            stride: Tensor::spatial_xy(1, 1),
            input_offset: Tensor::bfyx(0, 0, 0, 0),
            dilation: Tensor::spatial_xy(1, 1),
            with_activation: false,
            activation_slope: 0.0,
            groups: 1,
            output_size: None,
        }
    }

    /// Sets the stride.
    #[must_use]
    pub fn with_stride(mut self, stride: Tensor) -> Self {
        self.stride = stride;
        self
    }

    /// Sets the input offset.
    #[must_use]
    pub fn with_input_offset(mut self, input_offset: Tensor) -> Self {
        self.input_offset = input_offset;
        self
    }

    /// Sets the dilation.
    #[must_use]
    pub fn with_dilation(mut self, dilation: Tensor) -> Self {
        self.dilation = dilation;
        self
    }

    /// Enables the activation with the given negative slope.
    #[must_use]
    pub fn with_activation(mut self, slope: f32) -> Self {
        self.with_activation = true;
        self.activation_slope = slope;
        self
    }

    /// Sets the packed group count.
    #[must_use]
    pub fn with_groups(mut self, groups: u32) -> Self {
        self.groups = groups;
        self
    }

    /// Requests a spatial output extent; the input is padded to cover it.
    #[must_use]
    pub fn with_output_size(mut self, output_size: Tensor) -> Self {
        self.output_size = Some(output_size);
        self
    }

    /// Number of splits (weights buffers).
    #[must_use]
    pub fn split(&self) -> usize {
        self.weights.len()
    }
}

/// Fully-connected parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct FullyConnectedDesc {
    /// Weights id.
    pub weights: PrimitiveId,
    /// Optional bias id.
    pub bias: Option<PrimitiveId>,
    /// Apply a (leaky) ReLU to the result.
    pub with_activation: bool,
    /// Slope for negative values when the activation is enabled.
    pub activation_slope: f32,
}

impl FullyConnectedDesc {
    /// Creates a description without activation.
    pub fn new(weights: impl Into<PrimitiveId>, bias: Option<&str>) -> Self {
        Self {
            weights: weights.into(),
            bias: bias.map(str::to_string),
            with_activation: false,
            activation_slope: 0.0,
        }
    }

    /// Enables the activation with the given negative slope.
    #[must_use]
    pub fn with_activation(mut self, slope: f32) -> Self {
        self.with_activation = true;
        self.activation_slope = slope;
        self
    }
}

/// Pooling reduction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolingMode {
    /// Maximum over the window.
    Max,
    /// Mean over the window.
    Average,
}

/// Pooling parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolingDesc {
    /// Reduction mode.
    pub mode: PoolingMode,
    /// Window size along x/y.
    pub size: Tensor,
    /// Window step along x/y.
    pub stride: Tensor,
    /// Position of the first window relative to the input origin.
    pub input_offset: Tensor,
    /// Spatial output extent requested by the user, overriding the window arithmetic.
    pub output_size: Option<Tensor>,
}

impl PoolingDesc {
    /// Creates a pooling description with no offset.
    #[must_use]
    pub fn new(mode: PoolingMode, size: Tensor, stride: Tensor) -> Self {
        Self {
            mode,
            size,
            stride,
            input_offset: Tensor::bfyx(0, 0, 0, 0),
            output_size: None,
        }
    }

    /// Sets the input offset.
    #[must_use]
    pub fn with_input_offset(mut self, input_offset: Tensor) -> Self {
        self.input_offset = input_offset;
        self
    }

    /// Requests a spatial output extent. Windows past the input are clipped.
    #[must_use]
    pub fn with_output_size(mut self, output_size: Tensor) -> Self {
        self.output_size = Some(output_size);
        self
    }
}

/// Normalization region of LRN.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NormRegion {
    /// Sum over neighbouring features.
    AcrossChannel,
    /// Sum over a spatial neighbourhood within one feature.
    WithinChannel,
}

/// Local response normalization parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizationDesc {
    /// Neighbourhood size.
    pub size: u32,
    /// Additive constant.
    pub k: f32,
    /// Scale.
    pub alpha: f32,
    /// Exponent.
    pub beta: f32,
    /// Region to normalize over.
    pub region: NormRegion,
}

/// Reorder parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct ReorderDesc {
    /// Target format.
    pub output_format: Format,
    /// Target data type.
    pub output_data_type: DataType,
    /// Optional mean buffer subtracted element-wise.
    pub mean: Option<PrimitiveId>,
    /// Values subtracted per feature when no mean buffer is given.
    pub subtract_per_feature: Vec<f32>,
}

impl ReorderDesc {
    /// Creates a plain conversion to `format`/`data_type`.
    #[must_use]
    pub fn new(output_format: Format, output_data_type: DataType) -> Self {
        Self {
            output_format,
            output_data_type,
            mean: None,
            subtract_per_feature: Vec::new(),
        }
    }

    /// Subtracts a mean buffer.
    #[must_use]
    pub fn with_mean(mut self, mean: impl Into<PrimitiveId>) -> Self {
        self.mean = Some(mean.into());
        self
    }

    /// Subtracts one value per feature.
    #[must_use]
    pub fn with_subtract_per_feature(mut self, values: Vec<f32>) -> Self {
        self.subtract_per_feature = values;
        self
    }

    /// Returns true if the reorder only converts format and data type.
    #[must_use]
    pub fn is_plain(&self) -> bool {
        self.mean.is_none() && self.subtract_per_feature.is_empty()
    }
}

/// Kind-specific part of a primitive.
#[derive(Debug, Clone, PartialEq)]
pub enum PrimitiveDesc {
    /// Placeholder bound to user data at execution time.
    InputLayout {
        /// Declared layout of the data.
        layout: Layout,
    },
    /// Constant buffer owned by the topology.
    Data {
        /// The constant contents.
        memory: Memory,
    },
    /// 2D convolution.
    Convolution(ConvolutionDesc),
    /// 2D transposed convolution.
    Deconvolution(ConvolutionDesc),
    /// Fully-connected layer.
    FullyConnected(FullyConnectedDesc),
    /// Spatial pooling.
    Pooling(PoolingDesc),
    /// Local response normalization.
    Normalization(NormalizationDesc),
    /// Concatenation of the inputs along features.
    DepthConcatenate,
    /// Format and data type conversion.
    Reorder(ReorderDesc),
}

// =============================================================================
// Primitive
// =============================================================================

/// An immutable operation description.
#[derive(Debug, Clone, PartialEq)]
pub struct Primitive {
    /// Unique id.
    pub id: PrimitiveId,
    /// Data inputs, in order.
    pub inputs: Vec<PrimitiveId>,
    /// Padding the primitive expects around its first input. The build grows
    /// the producer's output padding to cover it.
    pub input_padding: Padding,
    /// Padding requested around the output.
    pub output_padding: Padding,
    /// Kind-specific parameters.
    pub desc: PrimitiveDesc,
}

impl Primitive {
    fn with_desc(id: impl Into<PrimitiveId>, inputs: Vec<PrimitiveId>, desc: PrimitiveDesc) -> Self {
        Self {
            id: id.into(),
            inputs,
            input_padding: Padding::none(),
            output_padding: Padding::none(),
            desc,
        }
    }

    /// Creates an input placeholder.
    pub fn input_layout(id: impl Into<PrimitiveId>, layout: Layout) -> Self {
        Self::with_desc(id, Vec::new(), PrimitiveDesc::InputLayout { layout })
    }

    /// Creates a constant buffer.
    pub fn data(id: impl Into<PrimitiveId>, memory: Memory) -> Self {
        Self::with_desc(id, Vec::new(), PrimitiveDesc::Data { memory })
    }

    /// Creates a convolution.
    pub fn convolution(id: impl Into<PrimitiveId>, input: impl Into<PrimitiveId>, desc: ConvolutionDesc) -> Self {
        Self::with_desc(id, vec![input.into()], PrimitiveDesc::Convolution(desc))
    }

    /// Creates a deconvolution.
    pub fn deconvolution(id: impl Into<PrimitiveId>, input: impl Into<PrimitiveId>, desc: ConvolutionDesc) -> Self {
        Self::with_desc(id, vec![input.into()], PrimitiveDesc::Deconvolution(desc))
    }

    /// Creates a fully-connected layer.
    pub fn fully_connected(
        id: impl Into<PrimitiveId>,
        input: impl Into<PrimitiveId>,
        desc: FullyConnectedDesc,
    ) -> Self {
        Self::with_desc(id, vec![input.into()], PrimitiveDesc::FullyConnected(desc))
    }

    /// Creates a pooling layer.
    pub fn pooling(id: impl Into<PrimitiveId>, input: impl Into<PrimitiveId>, desc: PoolingDesc) -> Self {
        Self::with_desc(id, vec![input.into()], PrimitiveDesc::Pooling(desc))
    }

    /// Creates a local response normalization.
    pub fn normalization(
        id: impl Into<PrimitiveId>,
        input: impl Into<PrimitiveId>,
        desc: NormalizationDesc,
    ) -> Self {
        Self::with_desc(id, vec![input.into()], PrimitiveDesc::Normalization(desc))
    }

    /// Creates a concatenation along features.
    pub fn depth_concatenate<I>(id: impl Into<PrimitiveId>, inputs: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<PrimitiveId>,
    {
        Self::with_desc(
            id,
            inputs.into_iter().map(Into::into).collect(),
            PrimitiveDesc::DepthConcatenate,
        )
    }

    /// Creates a reorder.
    pub fn reorder(id: impl Into<PrimitiveId>, input: impl Into<PrimitiveId>, desc: ReorderDesc) -> Self {
        Self::with_desc(id, vec![input.into()], PrimitiveDesc::Reorder(desc))
    }

    /// Returns a copy with the output padding replaced.
    #[must_use]
    pub fn with_output_padding(mut self, padding: Padding) -> Self {
        self.output_padding = padding;
        self
    }

    /// Returns a copy with the requested input padding replaced.
    #[must_use]
    pub fn with_input_padding(mut self, padding: Padding) -> Self {
        self.input_padding = padding;
        self
    }

    /// Returns the type tag.
    #[must_use]
    pub const fn kind(&self) -> PrimitiveType {
        match &self.desc {
            PrimitiveDesc::InputLayout { .. } => PrimitiveType::InputLayout,
            PrimitiveDesc::Data { .. } => PrimitiveType::Data,
            PrimitiveDesc::Convolution(_) => PrimitiveType::Convolution,
            PrimitiveDesc::Deconvolution(_) => PrimitiveType::Deconvolution,
            PrimitiveDesc::FullyConnected(_) => PrimitiveType::FullyConnected,
            PrimitiveDesc::Pooling(_) => PrimitiveType::Pooling,
            PrimitiveDesc::Normalization(_) => PrimitiveType::Normalization,
            PrimitiveDesc::DepthConcatenate => PrimitiveType::DepthConcatenate,
            PrimitiveDesc::Reorder(_) => PrimitiveType::Reorder,
        }
    }

    /// All referenced ids: inputs first, then weights, bias and mean.
    #[must_use]
    pub fn dependencies(&self) -> Vec<&str> {
        let mut deps: Vec<&str> = self.inputs.iter().map(String::as_str).collect();
        match &self.desc {
            PrimitiveDesc::Convolution(conv) | PrimitiveDesc::Deconvolution(conv) => {
                deps.extend(conv.weights.iter().map(String::as_str));
                deps.extend(conv.bias.iter().map(String::as_str));
            }
            PrimitiveDesc::FullyConnected(fc) => {
                deps.push(&fc.weights);
                deps.extend(fc.bias.as_deref());
            }
            PrimitiveDesc::Reorder(reorder) => deps.extend(reorder.mean.as_deref()),
            _ => {}
        }
        deps
    }

    /// Returns a copy whose dependency at position `index` (as listed by
    /// `dependencies`) refers to `new_id`.
    #[must_use]
    pub fn with_dependency(&self, index: usize, new_id: &str) -> Self {
        let mut result = self.clone();
        let new_id = new_id.to_string();
        if index < result.inputs.len() {
            result.inputs[index] = new_id;
            return result;
        }
        let mut index = index - result.inputs.len();
        match &mut result.desc {
            PrimitiveDesc::Convolution(conv) | PrimitiveDesc::Deconvolution(conv) => {
                if index < conv.weights.len() {
                    conv.weights[index] = new_id;
                } else {
                    index -= conv.weights.len();
                    if let Some(slot) = conv.bias.get_mut(index) {
                        *slot = new_id;
                    }
                }
            }
            PrimitiveDesc::FullyConnected(fc) => {
                if index == 0 {
                    fc.weights = new_id;
                } else if let Some(bias) = fc.bias.as_mut() {
                    *bias = new_id;
                }
            }
            PrimitiveDesc::Reorder(reorder) => {
                if let Some(mean) = reorder.mean.as_mut() {
                    *mean = new_id;
                }
            }
            _ => {}
        }
        result
    }

    /// Number of splits for (de)convolution, 1 otherwise.
    #[must_use]
    pub fn split(&self) -> usize {
        match &self.desc {
            PrimitiveDesc::Convolution(conv) | PrimitiveDesc::Deconvolution(conv) => conv.split().max(1),
            _ => 1,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dependencies_order() {
        let conv = Primitive::convolution("c", "in", ConvolutionDesc::new(["w0", "w1"], ["b0", "b1"]));
        assert_eq!(conv.dependencies(), vec!["in", "w0", "w1", "b0", "b1"]);
        assert_eq!(conv.split(), 2);
        assert_eq!(conv.kind(), PrimitiveType::Convolution);

        let fc = Primitive::fully_connected("fc", "in", FullyConnectedDesc::new("w", None));
        assert_eq!(fc.dependencies(), vec!["in", "w"]);

        let r = Primitive::reorder(
            "r",
            "in",
            ReorderDesc::new(Format::Yxfb, DataType::F16).with_mean("m"),
        );
        assert_eq!(r.dependencies(), vec!["in", "m"]);
    }

    #[test]
    fn test_with_dependency_replaces_slot() {
        let conv = Primitive::convolution("c", "in", ConvolutionDesc::new(["w0", "w1"], ["b0", "b1"]));
        let replaced = conv.with_dependency(2, "w1_reordered").with_dependency(3, "b0_r");
        assert_eq!(replaced.dependencies(), vec!["in", "w0", "w1_reordered", "b0_r", "b1"]);
        assert_ne!(replaced, conv);

        let fc = Primitive::fully_connected("fc", "in", FullyConnectedDesc::new("w", Some("b")));
        assert_eq!(fc.with_dependency(2, "b2").dependencies(), vec!["in", "w", "b2"]);
    }

    #[test]
    fn test_primitive_equality() {
        let a = Primitive::depth_concatenate("cat", ["a", "b"]);
        let b = Primitive::depth_concatenate("cat", ["a", "b"]);
        assert_eq!(a, b);
        assert_ne!(a, Primitive::depth_concatenate("cat", ["b", "a"]));
        assert!(ReorderDesc::new(Format::Bfyx, DataType::F32).is_plain());
    }
}
