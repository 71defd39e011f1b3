//! Memory Pool - Buffer Reuse Across Primitive Outputs
//!
//! The pool hands out output buffers for a network. Unpadded, reusable requests
//! are served from existing allocations whose current holders do not conflict
//! with the requester; everything else gets a fresh allocation. Allocation
//! limits come from the backend's `DeviceProfile`.
//!
//! # Key Features
//! - Size-ordered records searched from the exact byte count upward
//! - Per-record user sets to keep overlapping lifetimes apart
//! - Typed failures for single-allocation and global budget overruns
//! - Usage accounting for pooled and standalone allocations alike
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashSet;

use crate::backends::ComputeBackend;
use crate::device::DeviceProfile;
use crate::error::{Error, Result};
use crate::layout::Layout;
use crate::memory::Memory;
use crate::primitive::PrimitiveId;

// =============================================================================
// Memory Record
// =============================================================================

/// One pooled allocation and the primitives currently holding it.
#[derive(Debug, Clone)]
pub struct MemoryRecord {
    /// Ids of the primitives writing to this buffer.
    pub users: FxHashSet<PrimitiveId>,
    /// The allocation.
    pub memory: Memory,
}

#[derive(Debug, Default)]
struct PoolState {
    records: BTreeMap<usize, Vec<MemoryRecord>>,
    standalone: Vec<(usize, Memory)>,
    used: usize,
    max_used: usize,
}

// =============================================================================
// Memory Pool
// =============================================================================

/// Allocates and reuses device buffers.
pub struct MemoryPool {
    backend: Arc<dyn ComputeBackend>,
    profile: DeviceProfile,
    state: Mutex<PoolState>,
}

impl MemoryPool {
    /// Creates an empty pool allocating through `backend`.
    pub fn new(backend: Arc<dyn ComputeBackend>) -> Self {
        let profile = backend.profile();
        Self {
            backend,
            profile,
            state: Mutex::new(PoolState::default()),
        }
    }

    /// Returns a buffer for `layout` owned by `id`.
    ///
    /// Reusable unpadded requests share a record with earlier users unless one
    /// of them is in `conflicts`.
    pub fn get_memory(
        &self,
        layout: &Layout,
        id: &str,
        conflicts: &FxHashSet<PrimitiveId>,
        reusable: bool,
    ) -> Result<Memory> {
        if !reusable || layout.is_padded() {
            tracing::trace!(id, bytes = layout.bytes_count(), "fresh allocation");
            return self.allocate(layout);
        }

        let bytes = layout.bytes_count();
        let mut state = self.state.lock();
        for (&size, records) in state.records.range_mut(bytes..) {
            if let Some(record) = records.iter_mut().find(|r| r.users.is_disjoint(conflicts)) {
                record.users.insert(id.to_string());
                tracing::trace!(id, bytes, record_bytes = size, "reusing pooled buffer");
                return record.memory.reinterpret(*layout);
            }
        }

        let memory = Self::allocate_locked(&*self.backend, &self.profile, &mut state, layout)?;
        let mut users = FxHashSet::default();
        users.insert(id.to_string());
        state.records.entry(bytes).or_default().push(MemoryRecord {
            users,
            memory: memory.clone(),
        });
        tracing::trace!(id, bytes, "pooled new buffer");
        Ok(memory)
    }

    /// Allocates a buffer outside the pool, still accounted against the budget.
    ///
    /// The bytes stay counted until the buffer is handed back with `release`
    /// or the pool is cleared.
    pub fn allocate(&self, layout: &Layout) -> Result<Memory> {
        let mut state = self.state.lock();
        let memory = Self::allocate_locked(&*self.backend, &self.profile, &mut state, layout)?;
        state.standalone.push((layout.bytes_count(), memory.clone()));
        Ok(memory)
    }

    /// Returns a standalone allocation to the budget; false if `memory` is not one.
    pub fn release(&self, memory: &Memory) -> bool {
        let mut state = self.state.lock();
        let Some(index) = state.standalone.iter().position(|(_, m)| m.is_same_buffer(memory)) else {
            return false;
        };
        let (bytes, _) = state.standalone.swap_remove(index);
        state.used = state.used.saturating_sub(bytes);
        tracing::trace!(bytes, "standalone buffer released");
        true
    }

    fn allocate_locked(
        backend: &dyn ComputeBackend,
        profile: &DeviceProfile,
        state: &mut PoolState,
        layout: &Layout,
    ) -> Result<Memory> {
        let requested = layout.bytes_count();
        if requested > profile.max_alloc_mem_size {
            return Err(Error::AllocationSizeExceeded {
                requested,
                max: profile.max_alloc_mem_size,
            });
        }
        if state.used + requested > profile.max_global_mem_size {
            return Err(Error::GlobalMemoryExceeded {
                requested,
                used: state.used,
                budget: profile.max_global_mem_size,
            });
        }
        let memory = backend.allocate(layout).map_err(|e| match e {
            e if e.is_allocation_failure() => e,
            other => Error::out_of_resources(other.to_string()),
        })?;
        state.used += requested;
        state.max_used = state.max_used.max(state.used);
        Ok(memory)
    }

    /// Drops every pooled record and standalone allocation, releasing their bytes.
    pub fn clear_pool(&self) {
        let mut state = self.state.lock();
        let pooled: usize = state
            .records
            .iter()
            .map(|(&size, records)| size * records.len())
            .sum();
        let standalone: usize = state.standalone.iter().map(|(bytes, _)| bytes).sum();
        let released = pooled + standalone;
        state.records.clear();
        state.standalone.clear();
        state.used = state.used.saturating_sub(released);
        tracing::debug!(released, "memory pool cleared");
    }

    /// Bytes currently allocated through this pool.
    #[must_use]
    pub fn total_device_memory_used(&self) -> usize {
        self.state.lock().used
    }

    /// Peak of `total_device_memory_used`.
    #[must_use]
    pub fn max_device_memory_used(&self) -> usize {
        self.state.lock().max_used
    }

    /// Number of pooled records.
    #[must_use]
    pub fn record_count(&self) -> usize {
        self.state.lock().records.values().map(Vec::len).sum()
    }

    /// Returns the users of the record backing `memory`, if it is pooled.
    #[must_use]
    pub fn users_of(&self, memory: &Memory) -> Option<FxHashSet<PrimitiveId>> {
        self.state
            .lock()
            .records
            .values()
            .flatten()
            .find(|r| r.memory.is_same_buffer(memory))
            .map(|r| r.users.clone())
    }

    /// Returns the profile the limits are taken from.
    #[must_use]
    pub const fn profile(&self) -> &DeviceProfile {
        &self.profile
    }
}

impl std::fmt::Debug for MemoryPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MemoryPool")
            .field("backend", &self.backend.name())
            .field("records", &state.records.values().map(Vec::len).sum::<usize>())
            .field("used", &state.used)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
