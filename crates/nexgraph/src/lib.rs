//! NexGraph - Compute-Graph Compiler and Executor for Neural-Network Inference
//!
//! NexGraph compiles a declarative topology of primitives (inputs, constant
//! data, convolutions, pooling, normalization, concatenation, reorders) into an
//! optimized program and runs it with pooled memory and event-ordered
//! execution.
//!
//! # Crates
//!
//! - `nexgraph-core` - tensors, formats, layouts, memory, primitives, backends
//! - `nexgraph-program` - topology, shape inference, optimization passes, network
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use nexgraph::prelude::*;
//!
//! let input = Layout::new(DataType::F32, Tensor::bfyx(1, 1, 2, 2));
//! let topology = Topology::new()
//!     .with(Primitive::input_layout("in", input))?
//!     .with(Primitive::pooling(
//!         "pool",
//!         "in",
//!         PoolingDesc::new(PoolingMode::Max, Tensor::spatial_xy(2, 2), Tensor::spatial_xy(2, 2)),
//!     ))?;
//!
//! let program = Arc::new(Program::build(&topology, Arc::new(CpuBackend::new()), BuildOptions::new())?);
//! let mut network = Network::new(program)?;
//! network.set_input_data("in", Memory::from_data(input, &[1.0f32, 3.0, 2.0, 0.5])?)?;
//! network.execute()?;
//!
//! let output = network.get_output("pool")?;
//! output.event.wait();
//! assert_eq!(output.memory.to_f32_vec()?, vec![3.0]);
//! # Ok::<(), nexgraph::Error>(())
//! ```
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// =============================================================================
// Re-exports
// =============================================================================

pub use nexgraph_core as core;
pub use nexgraph_program as program;

pub use nexgraph_core::{
    ComputeBackend, CpuBackend, DataType, DeviceProfile, Error, Event, Format, Layout, Memory, MemoryPool, Padding,
    Primitive, PrimitiveId, Result, Tensor,
};
pub use nexgraph_program::{BuildOptions, BuildStats, Network, NetworkOutput, OptimizationPass, Program, Topology};

// =============================================================================
// Prelude
// =============================================================================

/// Common imports for building and running networks.
///
/// ```rust
/// use nexgraph::prelude::*;
/// ```
pub mod prelude {
    pub use nexgraph_core::prelude::*;
    pub use nexgraph_program::prelude::*;
}

// =============================================================================
// Version Information
// =============================================================================

/// Returns the version of the NexGraph library.
#[must_use]
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!version().is_empty());
        assert!(version().starts_with("0."));
    }

    #[test]
    fn test_prelude_builds_program() {
        use std::sync::Arc;

        use crate::prelude::*;

        let topology = Topology::new()
            .with(Primitive::input_layout("in", Layout::new(DataType::F32, Tensor::bfyx(1, 2, 4, 4))))
            .unwrap();
        let program = Program::build(&topology, Arc::new(CpuBackend::new()), BuildOptions::new()).unwrap();
        assert_eq!(program.processing_order_ids(), vec!["in"]);
    }
}
