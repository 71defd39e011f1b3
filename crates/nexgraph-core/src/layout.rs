//! Layout - Padding and Memory Layout Descriptions
//!
//! A `Layout` ties a data type and a size tensor to a padding description and
//! derives everything needed to address memory: padded buffer size, per-axis
//! pitches, linear offsets and the aligned byte count.
//!
//! # Key Features
//! - Non-negative padding margins with component-wise `max`
//! - Format-specific alignment of the linear buffer size
//! - Orderable and hashable so layouts can key caches
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use core::cmp::Ordering;
use core::fmt;
use core::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::dtype::DataType;
use crate::error::{Error, Result};
use crate::tensor::{Format, Tensor};

/// Rounds `value` up to a multiple of `alignment`.
#[must_use]
pub const fn align_to(value: i32, alignment: i32) -> i32 {
    ((value + alignment - 1) / alignment) * alignment
}

// =============================================================================
// Padding
// =============================================================================

/// Lower and upper margins around a tensor plus the value stored in them.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Padding {
    lower: Tensor,
    upper: Tensor,
    filling_value: f32,
}

impl Padding {
    /// Creates padding from lower/upper margins. Negative margins are stored as absolute values.
    #[must_use]
    pub fn new(lower: Tensor, upper: Tensor, filling_value: f32) -> Self {
        Self {
            lower: lower.abs(),
            upper: upper.abs(),
            filling_value,
        }
    }

    /// Creates padding with identical lower and upper margins.
    #[must_use]
    pub fn symmetric(sizes: Tensor, filling_value: f32) -> Self {
        Self::new(sizes, sizes, filling_value)
    }

    /// Creates zero-sized padding.
    #[must_use]
    pub fn none() -> Self {
        let zero = Tensor::bfyx(0, 0, 0, 0);
        Self {
            lower: zero,
            upper: zero,
            filling_value: 0.0,
        }
    }

    /// Returns the lower (top/left) margins.
    #[must_use]
    pub const fn lower_size(&self) -> Tensor {
        self.lower
    }

    /// Returns the upper (bottom/right) margins.
    #[must_use]
    pub const fn upper_size(&self) -> Tensor {
        self.upper
    }

    /// Returns the value stored in the padding area.
    #[must_use]
    pub const fn filling_value(&self) -> f32 {
        self.filling_value
    }

    /// Returns true if any margin is non-zero.
    #[must_use]
    pub fn is_padded(&self) -> bool {
        !(self.lower.is_zero() && self.upper.is_zero())
    }

    /// Component-wise maximum of two paddings.
    #[must_use]
    pub fn max(lhs: &Self, rhs: &Self) -> Self {
        Self {
            lower: Tensor::max(&lhs.lower, &rhs.lower),
            upper: Tensor::max(&lhs.upper, &rhs.upper),
            filling_value: lhs.filling_value.max(rhs.filling_value),
        }
    }

    /// Returns true if every margin of `self` is at least the matching margin of `other`.
    #[must_use]
    pub fn covers(&self, other: &Self) -> bool {
        Self::max(self, other) == *self
    }

    /// Margin of an axis character, zero when the padding does not declare it.
    fn lower_of(&self, axis: char) -> i32 {
        self.lower.axis(axis).unwrap_or(0)
    }

    fn upper_of(&self, axis: char) -> i32 {
        self.upper.axis(axis).unwrap_or(0)
    }
}

impl Default for Padding {
    fn default() -> Self {
        Self::none()
    }
}

impl PartialEq for Padding {
    fn eq(&self, other: &Self) -> bool {
        self.same_margins(other)
            && self.filling_value.to_bits() == other.filling_value.to_bits()
    }
}

impl Padding {
    /// Compares margins axis by axis, independent of the margin tensors' formats.
    fn same_margins(&self, other: &Self) -> bool {
        "bfxy".chars().all(|axis| {
            self.lower_of(axis) == other.lower_of(axis) && self.upper_of(axis) == other.upper_of(axis)
        })
    }
}

impl Eq for Padding {}

impl Hash for Padding {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for axis in "bfxy".chars() {
            self.lower_of(axis).hash(state);
            self.upper_of(axis).hash(state);
        }
        self.filling_value.to_bits().hash(state);
    }
}

impl PartialOrd for Padding {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Padding {
    fn cmp(&self, other: &Self) -> Ordering {
        self.filling_value
            .total_cmp(&other.filling_value)
            .then_with(|| {
                let lower = |p: &Self| "bfxy".chars().map(|a| p.lower_of(a)).collect::<Vec<_>>();
                lower(self).cmp(&lower(other))
            })
            .then_with(|| {
                let upper = |p: &Self| "bfxy".chars().map(|a| p.upper_of(a)).collect::<Vec<_>>();
                upper(self).cmp(&upper(other))
            })
    }
}

// =============================================================================
// Layout
// =============================================================================

/// Data type, format, size and padding of a memory buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Layout {
    /// Element data type.
    pub data_type: DataType,
    /// Logical size (excluding padding); its format is the layout's format.
    pub size: Tensor,
    /// Explicit padding around the data.
    pub padding: Padding,
}

impl Layout {
    /// Creates an unpadded layout.
    #[must_use]
    pub fn new(data_type: DataType, size: Tensor) -> Self {
        Self {
            data_type,
            size,
            padding: Padding::none(),
        }
    }

    /// Creates an unpadded layout from sizes listed in `format` order.
    pub fn from_sizes(data_type: DataType, format: Format, sizes: &[i32]) -> Result<Self> {
        Ok(Self::new(data_type, Tensor::new(format, sizes)?))
    }

    /// Returns a copy with the padding replaced.
    #[must_use]
    pub fn with_padding(mut self, padding: Padding) -> Self {
        self.padding = padding;
        self
    }

    /// Returns the memory format.
    #[must_use]
    pub const fn format(&self) -> Format {
        self.size.format()
    }

    /// Number of logical elements.
    #[must_use]
    pub fn count(&self) -> usize {
        self.size.count()
    }

    /// Returns true if the layout carries non-zero padding.
    #[must_use]
    pub fn is_padded(&self) -> bool {
        self.padding.is_padded()
    }

    /// Size including padding margins.
    #[must_use]
    pub fn get_buffer_size(&self) -> Tensor {
        let grow = |axis: char| {
            if self.format().has_axis(axis) {
                self.padding.lower_of(axis) + self.padding.upper_of(axis)
            } else {
                0
            }
        };
        self.size
            .with_batch(self.size.batch() + grow('b'))
            .with_feature(self.size.feature() + grow('f'))
            .with_spatial(0, self.size.spatial(0) + grow('x'))
            .with_spatial(1, self.size.spatial(1) + grow('y'))
    }

    /// Stride of every axis, listed in format order.
    ///
    /// Blocked formats (`bf8_xy16`, `os_iyx_osv16`, `bs_xs_xsv8_bsv8`,
    /// `bs_x_bsv16`) are addressed in their logical axis order, so their pitches
    /// are plain row-major strides over the padded size. The block only shows up
    /// as extra slack at the end of the buffer (`get_linear_size`). `byxf_af32`
    /// is the exception: its feature axis is aligned to 32 inside every row.
    #[must_use]
    pub fn get_pitches(&self) -> Tensor {
        let format = self.format();
        let mut sizes = self.get_buffer_size().sizes();
        if format == Format::ByxfAf32 {
            sizes[3] = align_to(sizes[3], 32);
        }

        let mut pitches = vec![1i32; sizes.len()];
        for i in (0..sizes.len().saturating_sub(1)).rev() {
            pitches[i] = pitches[i + 1] * sizes[i + 1];
        }
        Tensor::with_default(format, 1, &pitches).unwrap_or(self.size)
    }

    /// Linear element index of `coord`, where the origin is the first non-padding element.
    ///
    /// Each coordinate must lie in `[-lower_padding, size + upper_padding)`.
    pub fn get_linear_offset(&self, coord: &Tensor) -> Result<usize> {
        let format = self.format();
        let pitches = self.get_pitches();
        let mut offset = 0usize;
        for axis in format.order().chars() {
            let c = coord.axis(axis).unwrap_or(0);
            let lower = self.padding.lower_of(axis);
            let upper = self.padding.upper_of(axis);
            let size = self.size.axis(axis).unwrap_or(1);
            if c < -lower || c >= size + upper {
                return Err(Error::OutOfRange {
                    axis,
                    coordinate: c,
                    lower: -lower,
                    upper: size + upper,
                });
            }
            let pitch = pitches.axis(axis).unwrap_or(1);
            offset += (c + lower) as usize * pitch as usize;
        }
        Ok(offset)
    }

    /// Linear offset of the element at logical `(b, f, y, x)`, ignoring axes the format lacks.
    pub fn offset_of(&self, b: i32, f: i32, y: i32, x: i32) -> Result<usize> {
        self.get_linear_offset(&Tensor::bfyx(b, f, y, x))
    }

    /// Buffer offsets of every logical element, visited in format order.
    pub fn logical_offsets(&self) -> Result<Vec<usize>> {
        let format = self.format();
        let sizes = self.size.sizes();
        let mut offsets = Vec::with_capacity(self.count());
        if sizes.iter().any(|&s| s <= 0) {
            return Ok(offsets);
        }
        let mut index = vec![0i32; sizes.len()];
        loop {
            let coord = Tensor::with_default(format, 0, &index)?;
            offsets.push(self.get_linear_offset(&coord)?);

            let mut axis = sizes.len();
            loop {
                if axis == 0 {
                    return Ok(offsets);
                }
                axis -= 1;
                index[axis] += 1;
                if index[axis] < sizes[axis] {
                    break;
                }
                index[axis] = 0;
            }
        }
    }

    /// Number of elements in the buffer, including padding and format alignment.
    #[must_use]
    pub fn get_linear_size(&self) -> usize {
        let mut sizes = self.get_buffer_size().sizes();
        match self.format() {
            Format::OsIyxOsv16 => sizes[0] = align_to(sizes[0], 16),
            Format::BsXsXsv8Bsv8 => {
                sizes[0] = align_to(sizes[0], 8);
                sizes[1] = align_to(sizes[1], 8);
            }
            Format::BsXBsv16 => sizes[0] = align_to(sizes[0], 16),
            Format::Bf8Xy16 => {
                sizes[1] = align_to(sizes[1], 8);
                sizes[3] = align_to(sizes[2] * sizes[3], 16);
                sizes[2] = 1;
            }
            Format::ByxfAf32 => sizes[3] = align_to(sizes[3], 32),
            _ => {}
        }
        sizes
            .iter()
            .map(|&v| usize::try_from(v).unwrap_or(0))
            .product()
    }

    /// Number of bytes needed to store this layout.
    #[must_use]
    pub fn bytes_count(&self) -> usize {
        self.data_type.size_of() * self.get_linear_size()
    }
}

impl fmt::Display for Layout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.data_type, self.size)?;
        if self.is_padded() {
            write!(
                f,
                " pad(lower={:?}, upper={:?})",
                self.padding.lower.sizes(),
                self.padding.upper.sizes()
            )?;
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
