//! Tensor - Shapes and Formats
//!
//! A `Tensor` is a small value type describing per-axis extents of a block of
//! data: one batch axis, one feature axis and up to two spatial axes. Every
//! tensor carries a `Format` that names which of those axes exist and in which
//! order they are listed (from the slowest changing to the fastest).
//!
//! Extents are kept in canonical `b, f, x, y` slots internally, so reordering
//! between formats that share axes is lossless.
//!
//! # Example
//! ```rust
//! use nexgraph_core::{Format, Tensor};
//!
//! let t = Tensor::new(Format::Yx, &[2, 3]).unwrap();
//! assert_eq!(t.sizes(), vec![2, 3]);
//!
//! let wide = t.transform(Format::Fyxb, 10).unwrap();
//! assert_eq!(wide.sizes(), vec![10, 2, 3, 10]);
//! ```
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use core::cmp::Ordering;
use core::fmt;
use core::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Number of canonical axis slots stored by every tensor.
pub const TENSOR_DIM_MAX: usize = 4;

/// Canonical slot order used for internal storage.
const CANONICAL_ORDER: &str = "bfxy";

// =============================================================================
// Format
// =============================================================================

/// Static description of a format's axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatTraits {
    /// Number of batch axes.
    pub batch_num: usize,
    /// Number of feature axes.
    pub feature_num: usize,
    /// Number of spatial axes.
    pub spatial_num: usize,
    /// Axis order from the slowest changing to the fastest.
    pub order: &'static str,
    /// Internal storage order, `?` marks a slot the format does not use.
    pub internal_order: &'static str,
}

/// Memory formats (axis orders) understood by the layout model.
///
/// Weights use the activation axis names: the batch axis holds output
/// features and the feature axis holds input features.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Format {
    /// 1D.
    X,
    /// 2D, x changes fastest.
    Yx,
    /// 2D, y changes fastest.
    Xy,
    /// 1D plus batch, batch changes fastest.
    Xb,
    /// 1D plus batch, x changes fastest.
    Bx,
    /// Batch changes fastest, then feature, then spatials.
    Yxfb,
    /// Bitmap style: feature changes fastest.
    Byxf,
    /// The common activation format.
    Bfyx,
    /// Feature slowest, batch fastest.
    Fyxb,
    /// Convolution weights in slices of 16 output features.
    OsIyxOsv16,
    /// Fully-connected weights in 8x8 batch/x blocks.
    BsXsXsv8Bsv8,
    /// Fully-connected weights in slices of 16 batches.
    BsXBsv16,
    /// Features in blocks of 8, spatial plane padded to 16.
    Bf8Xy16,
    /// Feature axis aligned to 32.
    ByxfAf32,
}

impl Format {
    /// All formats, in declaration order.
    pub const ALL: [Self; 14] = [
        Self::X,
        Self::Yx,
        Self::Xy,
        Self::Xb,
        Self::Bx,
        Self::Yxfb,
        Self::Byxf,
        Self::Bfyx,
        Self::Fyxb,
        Self::OsIyxOsv16,
        Self::BsXsXsv8Bsv8,
        Self::BsXBsv16,
        Self::Bf8Xy16,
        Self::ByxfAf32,
    ];

    /// Returns the traits of this format.
    #[must_use]
    pub const fn traits(self) -> FormatTraits {
        const fn t(b: usize, f: usize, s: usize, order: &'static str, internal: &'static str) -> FormatTraits {
            FormatTraits {
                batch_num: b,
                feature_num: f,
                spatial_num: s,
                order,
                internal_order: internal,
            }
        }

        match self {
            Self::X => t(0, 0, 1, "x", "??x?"),
            Self::Yx => t(0, 0, 2, "yx", "??xy"),
            Self::Xy => t(0, 0, 2, "xy", "??xy"),
            Self::Xb => t(1, 0, 1, "xb", "b?x?"),
            Self::Bx => t(1, 0, 1, "bx", "b?x?"),
            Self::Yxfb => t(1, 1, 2, "yxfb", "bfxy"),
            Self::Byxf => t(1, 1, 2, "byxf", "bfxy"),
            Self::Bfyx => t(1, 1, 2, "bfyx", "bfxy"),
            Self::Fyxb => t(1, 1, 2, "fyxb", "bfxy"),
            Self::OsIyxOsv16 => t(1, 1, 2, "bfyx", "bfxy"),
            Self::BsXsXsv8Bsv8 => t(1, 0, 1, "bx", "b?x?"),
            Self::BsXBsv16 => t(1, 0, 1, "bx", "b?x?"),
            Self::Bf8Xy16 => t(1, 1, 2, "bfyx", "bfxy"),
            Self::ByxfAf32 => t(1, 1, 2, "byxf", "bfxy"),
        }
    }

    /// Returns the axis order string.
    #[must_use]
    pub const fn order(self) -> &'static str {
        self.traits().order
    }

    /// Returns the number of axes the format declares.
    #[must_use]
    pub const fn dimension(self) -> usize {
        self.traits().order.len()
    }

    /// Returns the lowercase name of the format.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::X => "x",
            Self::Yx => "yx",
            Self::Xy => "xy",
            Self::Xb => "xb",
            Self::Bx => "bx",
            Self::Yxfb => "yxfb",
            Self::Byxf => "byxf",
            Self::Bfyx => "bfyx",
            Self::Fyxb => "fyxb",
            Self::OsIyxOsv16 => "os_iyx_osv16",
            Self::BsXsXsv8Bsv8 => "bs_xs_xsv8_bsv8",
            Self::BsXBsv16 => "bs_x_bsv16",
            Self::Bf8Xy16 => "bf8_xy16",
            Self::ByxfAf32 => "byxf_af32",
        }
    }

    /// Returns true if the format lists the given axis character.
    #[must_use]
    pub fn has_axis(self, axis: char) -> bool {
        self.order().contains(axis)
    }

    /// Returns true if the format describes a full 4D activation (b, f, y, x).
    #[must_use]
    pub const fn is_4d(self) -> bool {
        self.dimension() == 4
    }

    /// Returns true if the batch axis is listed after a spatial axis,
    /// i.e. batch changes faster than at least one spatial axis.
    #[must_use]
    pub fn is_batch_after_spatial(self) -> bool {
        let mut spatial_found = false;
        for c in self.order().chars() {
            match c {
                'b' => return spatial_found,
                'x' | 'y' => spatial_found = true,
                _ => {}
            }
        }
        false
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Maps an axis character onto its canonical storage slot.
pub(crate) fn slot_of(axis: char) -> Option<usize> {
    CANONICAL_ORDER.find(axis)
}

// =============================================================================
// Tensor
// =============================================================================

/// Per-axis extents tagged with a format.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Tensor {
    format: Format,
    raw: [i32; TENSOR_DIM_MAX],
}

impl Tensor {
    /// Creates a tensor from sizes listed in `format` order, unmapped axes default to 1.
    pub fn new(format: Format, sizes: &[i32]) -> Result<Self> {
        Self::with_default(format, 1, sizes)
    }

    /// Creates a tensor from sizes listed in `format` order, unmapped axes get `default_size`.
    pub fn with_default(format: Format, default_size: i32, sizes: &[i32]) -> Result<Self> {
        if sizes.len() != format.dimension() {
            return Err(Error::shape_mismatch(format!(
                "number of sizes ({}) does not match format {} ({} axes)",
                sizes.len(),
                format,
                format.dimension()
            )));
        }
        Ok(Self::from_ordered(format, default_size, sizes))
    }

    /// Builds a tensor whose sizes are known to match the format.
    fn from_ordered(format: Format, default_size: i32, sizes: &[i32]) -> Self {
        let mut raw = [default_size; TENSOR_DIM_MAX];
        for (axis, &value) in format.order().chars().zip(sizes) {
            if let Some(slot) = slot_of(axis) {
                raw[slot] = value;
            }
        }
        Self { format, raw }
    }

    /// Creates a `bfyx` tensor.
    #[must_use]
    pub fn bfyx(batch: i32, feature: i32, y: i32, x: i32) -> Self {
        Self::from_ordered(Format::Bfyx, 1, &[batch, feature, y, x])
    }

    /// Creates a `bfyx` tensor whose batch and feature are 1, used for strides and dilations.
    #[must_use]
    pub fn spatial_xy(x: i32, y: i32) -> Self {
        Self::bfyx(1, 1, y, x)
    }

    /// Creates a tensor whose declared axes all hold `value`.
    #[must_use]
    pub fn splat(format: Format, value: i32) -> Self {
        Self {
            format,
            raw: [value; TENSOR_DIM_MAX],
        }
    }

    /// Returns the format of this tensor.
    #[must_use]
    pub const fn format(&self) -> Format {
        self.format
    }

    /// Returns the batch extent.
    #[must_use]
    pub const fn batch(&self) -> i32 {
        self.raw[0]
    }

    /// Returns the feature extent.
    #[must_use]
    pub const fn feature(&self) -> i32 {
        self.raw[1]
    }

    /// Returns spatial extent `index` (0 = x, 1 = y).
    #[must_use]
    pub const fn spatial(&self, index: usize) -> i32 {
        self.raw[2 + index]
    }

    /// Returns the extent of an axis character, or `None` if the format lacks it.
    #[must_use]
    pub fn axis(&self, axis: char) -> Option<i32> {
        if self.format.has_axis(axis) {
            slot_of(axis).map(|slot| self.raw[slot])
        } else {
            None
        }
    }

    /// Returns a copy with the batch extent replaced.
    #[must_use]
    pub fn with_batch(mut self, value: i32) -> Self {
        self.raw[0] = value;
        self
    }

    /// Returns a copy with the feature extent replaced.
    #[must_use]
    pub fn with_feature(mut self, value: i32) -> Self {
        self.raw[1] = value;
        self
    }

    /// Returns a copy with spatial extent `index` replaced.
    #[must_use]
    pub fn with_spatial(mut self, index: usize, value: i32) -> Self {
        self.raw[2 + index] = value;
        self
    }

    /// Returns the extents in the tensor's declared axis order.
    #[must_use]
    pub fn sizes(&self) -> Vec<i32> {
        self.format
            .order()
            .chars()
            .filter_map(slot_of)
            .map(|slot| self.raw[slot])
            .collect()
    }

    /// Returns the number of elements described by the declared axes.
    #[must_use]
    pub fn count(&self) -> usize {
        self.sizes()
            .iter()
            .map(|&v| usize::try_from(v).unwrap_or(0))
            .product()
    }

    /// Reprojects the extents onto `new_format`.
    ///
    /// Axes the new format adds are filled with `default_size`. An axis the new
    /// format lacks can only be dropped while it holds `default_size`.
    pub fn transform(&self, new_format: Format, default_size: i32) -> Result<Self> {
        if new_format == self.format {
            return Ok(*self);
        }
        let mut raw = [default_size; TENSOR_DIM_MAX];
        for axis in self.format.order().chars() {
            let Some(slot) = slot_of(axis) else { continue };
            if new_format.has_axis(axis) {
                raw[slot] = self.raw[slot];
            } else if self.raw[slot] != default_size {
                return Err(Error::invalid_argument(format!(
                    "cannot convert {self} to format {new_format}: axis '{axis}' has no counterpart"
                )));
            }
        }
        Ok(Self {
            format: new_format,
            raw,
        })
    }

    /// Reprojects onto `new_format`, folding axes it lacks into its `x` axis.
    ///
    /// Used for flattening activations into 2D weight or fully-connected formats.
    pub fn fold_into(&self, new_format: Format) -> Result<Self> {
        if new_format == self.format {
            return Ok(*self);
        }
        let mut raw = [1; TENSOR_DIM_MAX];
        let mut folded = 1;
        for axis in self.format.order().chars() {
            let Some(slot) = slot_of(axis) else { continue };
            if new_format.has_axis(axis) {
                raw[slot] = self.raw[slot];
            } else if axis == 'b' {
                return Err(Error::invalid_argument(format!(
                    "cannot fold batch axis of {self} into format {new_format}"
                )));
            } else {
                folded *= self.raw[slot];
            }
        }
        if folded != 1 {
            let Some(x) = slot_of('x').filter(|_| new_format.has_axis('x')) else {
                return Err(Error::invalid_argument(format!(
                    "cannot fold {self} into format {new_format} without an x axis"
                )));
            };
            raw[x] *= folded;
        }
        Ok(Self {
            format: new_format,
            raw,
        })
    }

    /// Component-wise addition, keeping this tensor's format.
    #[must_use]
    pub fn add(&self, rhs: &Self) -> Self {
        let mut result = *self;
        for (slot, value) in result.raw.iter_mut().enumerate() {
            if rhs.has_slot(slot) {
                *value += rhs.raw[slot];
            }
        }
        result
    }

    /// Component-wise subtraction, keeping this tensor's format.
    #[must_use]
    pub fn sub(&self, rhs: &Self) -> Self {
        self.add(&rhs.negate())
    }

    /// Negates every extent.
    #[must_use]
    pub fn negate(&self) -> Self {
        let mut result = *self;
        for value in &mut result.raw {
            *value = -*value;
        }
        result
    }

    /// Replaces every extent by its absolute value.
    #[must_use]
    pub fn abs(&self) -> Self {
        let mut result = *self;
        for value in &mut result.raw {
            *value = value.abs();
        }
        result
    }

    /// Component-wise maximum in the narrowest format covering both operands.
    #[must_use]
    pub fn max(lhs: &Self, rhs: &Self) -> Self {
        let format = common_format(lhs.format, rhs.format);
        let mut raw = [i32::MIN; TENSOR_DIM_MAX];
        for (slot, value) in raw.iter_mut().enumerate() {
            if lhs.has_slot(slot) {
                *value = (*value).max(lhs.raw[slot]);
            }
            if rhs.has_slot(slot) {
                *value = (*value).max(rhs.raw[slot]);
            }
            if *value == i32::MIN {
                *value = 0;
            }
        }
        Self { format, raw }
    }

    /// Returns true if every declared extent is zero.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.sizes().iter().all(|&v| v == 0)
    }

    /// Computes the flat index of `coord` inside this tensor, row-major in format order.
    pub fn get_linear_offset(&self, coord: &Self) -> Result<usize> {
        let sizes = self.sizes();
        let mut offset = 0usize;
        for (axis, &size) in self.format.order().chars().zip(&sizes) {
            let c = coord.axis(axis).unwrap_or(0);
            if c < 0 || c >= size {
                return Err(Error::OutOfRange {
                    axis,
                    coordinate: c,
                    lower: 0,
                    upper: size,
                });
            }
            offset = offset * size as usize + c as usize;
        }
        Ok(offset)
    }

    fn has_slot(&self, slot: usize) -> bool {
        self.format.traits().internal_order.as_bytes()[slot] != b'?'
    }

    fn declared(&self) -> impl Iterator<Item = i32> + '_ {
        (0..TENSOR_DIM_MAX)
            .filter(|&slot| self.has_slot(slot))
            .map(|slot| self.raw[slot])
    }
}

/// Picks the first format (declaration order) declaring every axis of both inputs.
fn common_format(a: Format, b: Format) -> Format {
    if a == b {
        return a;
    }
    let needed: Vec<char> = a.order().chars().chain(b.order().chars()).collect();
    let covers = |f: Format| needed.iter().all(|&c| f.has_axis(c));
    if covers(a) {
        a
    } else if covers(b) {
        b
    } else {
        Format::ALL
            .into_iter()
            .find(|&f| covers(f))
            .unwrap_or(Format::Bfyx)
    }
}

impl Default for Tensor {
    fn default() -> Self {
        Self::splat(Format::X, 0)
    }
}

impl PartialEq for Tensor {
    fn eq(&self, other: &Self) -> bool {
        self.format == other.format && self.declared().eq(other.declared())
    }
}

impl Eq for Tensor {}

impl Hash for Tensor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.format.hash(state);
        for value in self.declared() {
            value.hash(state);
        }
    }
}

impl PartialOrd for Tensor {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Tensor {
    fn cmp(&self, other: &Self) -> Ordering {
        self.format
            .cmp(&other.format)
            .then_with(|| self.declared().cmp(other.declared()))
    }
}

impl fmt::Display for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{:?}", self.format, self.sizes())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sizes_follow_format_order() {
        let t = Tensor::new(Format::Bfyx, &[1, 3, 8, 6]).unwrap();
        assert_eq!(t.batch(), 1);
        assert_eq!(t.feature(), 3);
        assert_eq!(t.spatial(0), 6);
        assert_eq!(t.spatial(1), 8);

        let y = t.transform(Format::Yxfb, 1).unwrap();
        assert_eq!(y.sizes(), vec![8, 6, 3, 1]);
        assert_eq!(y.count(), 144);
    }

    #[test]
    fn test_size_count_mismatch() {
        let err = Tensor::new(Format::Bfyx, &[1, 2, 3]).unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { .. }));
    }

    #[test]
    fn test_transform_fills_default() {
        let t = Tensor::new(Format::Yx, &[2, 3]).unwrap();
        let wide = t.transform(Format::Fyxb, 10).unwrap();
        assert_eq!(wide.sizes(), vec![10, 2, 3, 10]);
    }

    #[test]
    fn test_transform_rejects_lost_axis() {
        let t = Tensor::bfyx(2, 3, 4, 5);
        assert!(t.transform(Format::Yx, 1).is_err());
        let flat = Tensor::bfyx(1, 1, 4, 5);
        assert_eq!(flat.transform(Format::Yx, 1).unwrap().sizes(), vec![4, 5]);
    }

    #[test]
    fn test_round_trip_through_superset() {
        for &format in &[Format::Bfyx, Format::Yxfb, Format::Byxf, Format::Fyxb] {
            let t = Tensor::new(format, &[2, 3, 4, 5]).unwrap();
            for &other in &[Format::Bfyx, Format::Yxfb, Format::Byxf, Format::Fyxb, Format::Bf8Xy16] {
                let there = t.transform(other, 1).unwrap();
                assert_eq!(there.transform(format, 1).unwrap(), t);
            }
        }
        let t = Tensor::new(Format::Yx, &[7, 9]).unwrap();
        let back = t.transform(Format::Bfyx, 1).unwrap().transform(Format::Yx, 1).unwrap();
        assert_eq!(back, t);
    }

    #[test]
    fn test_fold_into_flattens_non_batch_axes() {
        let t = Tensor::bfyx(4, 3, 2, 2);
        let flat = t.fold_into(Format::Bx).unwrap();
        assert_eq!(flat.sizes(), vec![4, 12]);
        assert_eq!(flat.count(), t.count());
        assert!(Tensor::bfyx(2, 1, 1, 1).fold_into(Format::Yx).is_err());
    }

    #[test]
    fn test_max_uses_common_format() {
        let a = Tensor::new(Format::Yx, &[1, 5]).unwrap();
        let b = Tensor::bfyx(0, 2, 3, 0);
        let m = Tensor::max(&a, &b);
        assert_eq!(m.format(), Format::Bfyx);
        assert_eq!(m.sizes(), vec![0, 2, 3, 5]);
    }

    #[test]
    fn test_batch_after_spatial() {
        assert!(Format::Yxfb.is_batch_after_spatial());
        assert!(Format::Xb.is_batch_after_spatial());
        assert!(!Format::Bfyx.is_batch_after_spatial());
        assert!(!Format::Bx.is_batch_after_spatial());
    }

    #[test]
    fn test_tensor_linear_offset() {
        let t = Tensor::new(Format::Yx, &[2, 3]).unwrap();
        let coord = Tensor::new(Format::Yx, &[1, 2]).unwrap();
        assert_eq!(t.get_linear_offset(&coord).unwrap(), 5);
        let outside = Tensor::new(Format::Yx, &[2, 0]).unwrap();
        assert!(matches!(
            t.get_linear_offset(&outside),
            Err(Error::OutOfRange { axis: 'y', .. })
        ));
    }

    #[test]
    fn test_equality_ignores_unused_slots() {
        let a = Tensor::with_default(Format::X, 10, &[5]).unwrap();
        let b = Tensor::new(Format::X, &[5]).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, Tensor::new(Format::Yx, &[1, 5]).unwrap());
    }
}
