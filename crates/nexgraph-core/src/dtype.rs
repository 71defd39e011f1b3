//! Data Types - NexGraph Element Types
//!
//! Defines the element types a layout can describe and the `Element` trait
//! that maps Rust scalar types onto them. Kernels compute in `f32`, so every
//! element type converts to and from `f32`.
//!
//! # Key Features
//! - Runtime type information via `DataType`
//! - Half-precision (f16) support through the `half` crate
//! - Unaligned byte-level access through `bytemuck`
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use bytemuck::Pod;
use half::f16;
use serde::{Deserialize, Serialize};

use core::fmt;

// =============================================================================
// DataType Enum
// =============================================================================

/// Runtime representation of element data types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DataType {
    /// 8-bit signed integer.
    I8,
    /// 8-bit unsigned integer.
    U8,
    /// 32-bit signed integer.
    I32,
    /// 64-bit signed integer.
    I64,
    /// 16-bit floating point (half precision).
    F16,
    /// 32-bit floating point (single precision).
    F32,
}

impl DataType {
    /// Returns the size in bytes of one element.
    #[must_use]
    pub const fn size_of(self) -> usize {
        match self {
            Self::I8 | Self::U8 => 1,
            Self::F16 => 2,
            Self::I32 | Self::F32 => 4,
            Self::I64 => 8,
        }
    }

    /// Returns true if this is a floating point type.
    #[must_use]
    pub const fn is_floating_point(self) -> bool {
        matches!(self, Self::F16 | Self::F32)
    }

    /// Returns the short name of this data type.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::I8 => "i8",
            Self::U8 => "u8",
            Self::I32 => "i32",
            Self::I64 => "i64",
            Self::F16 => "f16",
            Self::F32 => "f32",
        }
    }
}

impl Default for DataType {
    fn default() -> Self {
        Self::F32
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

// =============================================================================
// Element Trait
// =============================================================================

/// Rust scalar types that can be stored in a `Memory` buffer.
pub trait Element: Pod + Copy + Send + Sync + 'static {
    /// The runtime data type of this element.
    const DATA_TYPE: DataType;

    /// Converts to `f32` for computation.
    fn to_f32(self) -> f32;

    /// Converts from `f32` after computation.
    fn from_f32(value: f32) -> Self;
}

impl Element for f32 {
    const DATA_TYPE: DataType = DataType::F32;

    fn to_f32(self) -> f32 {
        self
    }

    fn from_f32(value: f32) -> Self {
        value
    }
}

impl Element for f16 {
    const DATA_TYPE: DataType = DataType::F16;

    fn to_f32(self) -> f32 {
        f16::to_f32(self)
    }

    fn from_f32(value: f32) -> Self {
        f16::from_f32(value)
    }
}

impl Element for i8 {
    const DATA_TYPE: DataType = DataType::I8;

    fn to_f32(self) -> f32 {
        f32::from(self)
    }

    fn from_f32(value: f32) -> Self {
        value as i8
    }
}

impl Element for u8 {
    const DATA_TYPE: DataType = DataType::U8;

    fn to_f32(self) -> f32 {
        f32::from(self)
    }

    fn from_f32(value: f32) -> Self {
        value as u8
    }
}

impl Element for i32 {
    const DATA_TYPE: DataType = DataType::I32;

    fn to_f32(self) -> f32 {
        self as f32
    }

    fn from_f32(value: f32) -> Self {
        value as i32
    }
}

impl Element for i64 {
    const DATA_TYPE: DataType = DataType::I64;

    fn to_f32(self) -> f32 {
        self as f32
    }

    fn from_f32(value: f32) -> Self {
        value as i64
    }
}

/// Reads element `index` of a raw buffer as `f32`, whatever its data type.
pub(crate) fn read_as_f32(bytes: &[u8], data_type: DataType, index: usize) -> f32 {
    let size = data_type.size_of();
    let chunk = &bytes[index * size..(index + 1) * size];
    match data_type {
        DataType::I8 => bytemuck::pod_read_unaligned::<i8>(chunk).to_f32(),
        DataType::U8 => bytemuck::pod_read_unaligned::<u8>(chunk).to_f32(),
        DataType::I32 => bytemuck::pod_read_unaligned::<i32>(chunk).to_f32(),
        DataType::I64 => bytemuck::pod_read_unaligned::<i64>(chunk).to_f32(),
        DataType::F16 => bytemuck::pod_read_unaligned::<f16>(chunk).to_f32(),
        DataType::F32 => bytemuck::pod_read_unaligned::<f32>(chunk),
    }
}

/// Writes `value` into element `index` of a raw buffer, converting to its data type.
pub(crate) fn write_from_f32(bytes: &mut [u8], data_type: DataType, index: usize, value: f32) {
    let size = data_type.size_of();
    let chunk = &mut bytes[index * size..(index + 1) * size];
    match data_type {
        DataType::I8 => chunk.copy_from_slice(bytemuck::bytes_of(&i8::from_f32(value))),
        DataType::U8 => chunk.copy_from_slice(bytemuck::bytes_of(&u8::from_f32(value))),
        DataType::I32 => chunk.copy_from_slice(bytemuck::bytes_of(&i32::from_f32(value))),
        DataType::I64 => chunk.copy_from_slice(bytemuck::bytes_of(&i64::from_f32(value))),
        DataType::F16 => chunk.copy_from_slice(bytemuck::bytes_of(&f16::from_f32(value))),
        DataType::F32 => chunk.copy_from_slice(bytemuck::bytes_of(&value)),
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dtype_size() {
        assert_eq!(DataType::I8.size_of(), 1);
        assert_eq!(DataType::F16.size_of(), 2);
        assert_eq!(DataType::F32.size_of(), 4);
        assert_eq!(DataType::I64.size_of(), 8);
    }

    #[test]
    fn test_dtype_properties() {
        assert!(DataType::F16.is_floating_point());
        assert!(!DataType::U8.is_floating_point());
        assert_eq!(DataType::F32.to_string(), "f32");
    }

    #[test]
    fn test_byte_access_conversions() {
        let mut bytes = vec![0u8; 8];
        write_from_f32(&mut bytes, DataType::F16, 1, 1.5);
        assert_eq!(read_as_f32(&bytes, DataType::F16, 1), 1.5);
        assert_eq!(read_as_f32(&bytes, DataType::F16, 0), 0.0);

        write_from_f32(&mut bytes, DataType::I32, 1, -7.0);
        assert_eq!(read_as_f32(&bytes, DataType::I32, 1), -7.0);
    }
}
