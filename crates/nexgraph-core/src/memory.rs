//! Memory - Layout-Tagged Buffers
//!
//! A `Memory` is a reference-counted byte buffer paired with the layout that
//! describes it. Clones and reinterpreted views share the same buffer, which
//! lets the memory pool hand one allocation to several primitives whose
//! lifetimes never overlap.
//!
//! # Key Features
//! - Reference-counted byte storage behind a `parking_lot` lock
//! - Typed logical access that skips padding and format alignment
//! - Zero-copy reinterpretation under a different layout
//!
//! # Example
//! ```rust
//! use nexgraph_core::{DataType, Format, Layout, Memory};
//!
//! let layout = Layout::from_sizes(DataType::F32, Format::Bfyx, &[1, 1, 2, 2]).unwrap();
//! let mem = Memory::from_data(layout, &[1.0_f32, 2.0, 3.0, 4.0]).unwrap();
//! assert_eq!(mem.to_vec::<f32>().unwrap(), vec![1.0, 2.0, 3.0, 4.0]);
//! ```
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use core::ops::Deref;
use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::dtype::{read_as_f32, write_from_f32, Element};
use crate::error::{Error, Result};
use crate::layout::Layout;

// =============================================================================
// Memory
// =============================================================================

/// A byte buffer described by a layout.
#[derive(Debug, Clone)]
pub struct Memory {
    layout: Layout,
    buffer: Arc<RwLock<Vec<u8>>>,
}

impl Memory {
    /// Allocates a zero-filled host buffer large enough for `layout`.
    #[must_use]
    pub fn zeros(layout: Layout) -> Self {
        Self {
            layout,
            buffer: Arc::new(RwLock::new(vec![0u8; layout.bytes_count()])),
        }
    }

    /// Allocates a zero-filled host buffer, reporting allocator failure instead of aborting.
    pub fn try_zeros(layout: Layout) -> Result<Self> {
        let bytes = layout.bytes_count();
        let mut data = Vec::new();
        data.try_reserve_exact(bytes)
            .map_err(|e| Error::out_of_resources(format!("host allocation of {bytes} bytes failed: {e}")))?;
        data.resize(bytes, 0u8);
        Ok(Self {
            layout,
            buffer: Arc::new(RwLock::new(data)),
        })
    }

    /// Allocates a buffer for `layout` and fills it with logical values given in format order.
    ///
    /// The padding area receives the layout's filling value.
    pub fn from_data<T: Element>(layout: Layout, data: &[T]) -> Result<Self> {
        let memory = Self::zeros(layout);
        memory.write_logical(data)?;
        Ok(memory)
    }

    /// Returns the layout of this memory.
    #[must_use]
    pub const fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Returns the size of the underlying buffer in bytes.
    #[must_use]
    pub fn size_bytes(&self) -> usize {
        self.buffer.read().len()
    }

    /// Returns a view of the same buffer described by another layout.
    pub fn reinterpret(&self, layout: Layout) -> Result<Self> {
        let available = self.size_bytes();
        if layout.bytes_count() > available {
            return Err(Error::invalid_argument(format!(
                "cannot view a {available} byte buffer as {layout} ({} bytes)",
                layout.bytes_count()
            )));
        }
        Ok(Self {
            layout,
            buffer: Arc::clone(&self.buffer),
        })
    }

    /// Returns true if both memories share one buffer.
    #[must_use]
    pub fn is_same_buffer(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.buffer, &other.buffer)
    }

    /// Returns a read guard over the raw bytes.
    #[must_use]
    pub fn bytes(&self) -> MemoryReadGuard<'_> {
        MemoryReadGuard {
            guard: self.buffer.read(),
        }
    }

    /// Returns a write guard over the raw bytes.
    #[must_use]
    pub fn bytes_mut(&self) -> RwLockWriteGuard<'_, Vec<u8>> {
        self.buffer.write()
    }

    /// Reads the element at buffer index `index` as `f32`.
    #[must_use]
    pub fn read_f32(&self, index: usize) -> f32 {
        read_as_f32(&self.buffer.read(), self.layout.data_type, index)
    }

    /// Writes `value` to buffer index `index`, converting to the layout's data type.
    pub fn write_f32(&self, index: usize, value: f32) {
        write_from_f32(&mut self.buffer.write(), self.layout.data_type, index, value);
    }

    /// Writes logical values (format order, padding excluded) into the buffer.
    pub fn write_logical<T: Element>(&self, data: &[T]) -> Result<()> {
        self.check_type::<T>()?;
        let offsets = self.layout.logical_offsets()?;
        if offsets.len() != data.len() {
            return Err(Error::shape_mismatch(format!(
                "{} values supplied for layout {} ({} elements)",
                data.len(),
                self.layout,
                offsets.len()
            )));
        }

        let data_type = self.layout.data_type;
        let mut bytes = self.buffer.write();
        if self.layout.is_padded() {
            let fill = self.layout.padding.filling_value();
            for index in 0..self.layout.get_linear_size() {
                write_from_f32(&mut bytes, data_type, index, fill);
            }
        }
        let size = data_type.size_of();
        for (&offset, value) in offsets.iter().zip(data) {
            bytes[offset * size..(offset + 1) * size].copy_from_slice(bytemuck::bytes_of(value));
        }
        Ok(())
    }

    /// Reads logical values (format order, padding excluded).
    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>> {
        self.check_type::<T>()?;
        let offsets = self.layout.logical_offsets()?;
        let size = self.layout.data_type.size_of();
        let bytes = self.buffer.read();
        Ok(offsets
            .iter()
            .map(|&offset| bytemuck::pod_read_unaligned(&bytes[offset * size..(offset + 1) * size]))
            .collect())
    }

    /// Reads logical values converted to `f32`, whatever the data type.
    pub fn to_f32_vec(&self) -> Result<Vec<f32>> {
        let offsets = self.layout.logical_offsets()?;
        let bytes = self.buffer.read();
        Ok(offsets
            .iter()
            .map(|&offset| read_as_f32(&bytes, self.layout.data_type, offset))
            .collect())
    }

    /// Copies the contents into a fresh buffer.
    #[must_use]
    pub fn deep_copy(&self) -> Self {
        Self {
            layout: self.layout,
            buffer: Arc::new(RwLock::new(self.buffer.read().clone())),
        }
    }

    fn check_type<T: Element>(&self) -> Result<()> {
        if T::DATA_TYPE != self.layout.data_type {
            return Err(Error::invalid_argument(format!(
                "element type {} does not match layout data type {}",
                T::DATA_TYPE,
                self.layout.data_type
            )));
        }
        Ok(())
    }
}

impl PartialEq for Memory {
    fn eq(&self, other: &Self) -> bool {
        self.is_same_buffer(other) && self.layout == other.layout
    }
}

// =============================================================================
// Guard Types
// =============================================================================

/// Read guard over a memory's bytes.
pub struct MemoryReadGuard<'a> {
    guard: RwLockReadGuard<'a, Vec<u8>>,
}

impl Deref for MemoryReadGuard<'_> {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::Padding;
    use crate::tensor::{Format, Tensor};
    use half::f16;

    fn layout(dt: DataType, format: Format, sizes: &[i32]) -> Layout {
        Layout::from_sizes(dt, format, sizes).unwrap()
    }

    use crate::dtype::DataType;

    #[test]
    fn test_zeros_size() {
        let mem = Memory::zeros(layout(DataType::F16, Format::Bfyx, &[1, 2, 3, 3]));
        assert_eq!(mem.size_bytes(), 36);
        assert!(mem.to_vec::<f16>().unwrap().iter().all(|v| v.to_f32() == 0.0));
    }

    #[test]
    fn test_from_data_checks_type_and_count() {
        let l = layout(DataType::F32, Format::Bfyx, &[1, 1, 2, 2]);
        assert!(matches!(
            Memory::from_data(l, &[1i32, 2, 3, 4]),
            Err(Error::InvalidArgument { .. })
        ));
        assert!(matches!(
            Memory::from_data(l, &[1.0f32, 2.0]),
            Err(Error::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_padded_write_fills_margins() {
        let l = layout(DataType::F32, Format::Bfyx, &[1, 1, 1, 2])
            .with_padding(Padding::symmetric(Tensor::bfyx(0, 0, 0, 1), -1.0));
        let mem = Memory::from_data(l, &[5.0f32, 6.0]).unwrap();
        let raw: Vec<f32> = (0..4).map(|i| mem.read_f32(i)).collect();
        assert_eq!(raw, vec![-1.0, 5.0, 6.0, -1.0]);
        assert_eq!(mem.to_vec::<f32>().unwrap(), vec![5.0, 6.0]);
    }

    #[test]
    fn test_reinterpret_shares_buffer() {
        let a = Memory::zeros(layout(DataType::F32, Format::Bfyx, &[1, 1, 4, 4]));
        let b = a.reinterpret(layout(DataType::F32, Format::Bx, &[2, 4])).unwrap();
        assert!(a.is_same_buffer(&b));
        assert_ne!(a, b);

        b.write_f32(3, 9.0);
        assert_eq!(a.read_f32(3), 9.0);

        assert!(a
            .reinterpret(layout(DataType::F32, Format::Bx, &[4, 8]))
            .is_err());
    }

    #[test]
    fn test_deep_copy_detaches() {
        let a = Memory::from_data(layout(DataType::F32, Format::X, &[2]), &[1.0f32, 2.0]).unwrap();
        let b = a.deep_copy();
        b.write_f32(0, 7.0);
        assert_eq!(a.to_f32_vec().unwrap(), vec![1.0, 2.0]);
        assert_eq!(b.to_f32_vec().unwrap(), vec![7.0, 2.0]);
    }
}
