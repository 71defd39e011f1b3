//! Device - Backend Capability Reports
//!
//! A `DeviceProfile` tells the program builder and the memory pool what the
//! compute backend can hold and which precisions it handles well.
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use sysinfo::System;

// =============================================================================
// Device Profile
// =============================================================================

/// Capabilities and limits of a compute device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceProfile {
    /// Name of the device.
    pub name: String,
    /// Largest single allocation in bytes.
    pub max_alloc_mem_size: usize,
    /// Total bytes that may be allocated at once.
    pub max_global_mem_size: usize,
    /// Whether half precision kernels are available.
    pub supports_fp16: bool,
}

impl DeviceProfile {
    /// Profile of the host, with the global budget taken from system memory.
    #[must_use]
    pub fn host() -> Self {
        let total = get_system_memory();
        Self {
            name: "CPU".to_string(),
            max_alloc_mem_size: total / 2,
            max_global_mem_size: total,
            supports_fp16: true,
        }
    }

    /// Returns a copy with explicit memory limits.
    #[must_use]
    pub fn with_limits(mut self, max_alloc_mem_size: usize, max_global_mem_size: usize) -> Self {
        self.max_alloc_mem_size = max_alloc_mem_size;
        self.max_global_mem_size = max_global_mem_size;
        self
    }
}

impl Default for DeviceProfile {
    fn default() -> Self {
        Self::host()
    }
}

/// Returns the total system memory in bytes.
fn get_system_memory() -> usize {
    let mut sys = System::new();
    sys.refresh_memory();
    usize::try_from(sys.total_memory()).unwrap_or(usize::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_profile() {
        let profile = DeviceProfile::host();
        assert!(profile.max_global_mem_size >= profile.max_alloc_mem_size);
        assert!(profile.supports_fp16);
    }

    #[test]
    fn test_with_limits() {
        let profile = DeviceProfile::host().with_limits(16, 64);
        assert_eq!(profile.max_alloc_mem_size, 16);
        assert_eq!(profile.max_global_mem_size, 64);
    }
}
