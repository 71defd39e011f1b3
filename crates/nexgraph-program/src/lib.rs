//! NexGraph Program - Graph Builder, Optimizer and Executor
//!
//! This crate turns a declarative topology of primitives into an executable
//! network:
//!
//! - Topology construction with idempotent redefinition
//! - Shape inference for every primitive kind
//! - Analysis (processing order, constants, data flow, dominators)
//! - Optimization passes (constant propagation, layout reorders, weights and
//!   bias conversion, padding preparation, depthwise merge, trimming)
//! - Network instantiation with pooled memory and event-ordered execution
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use nexgraph_core::prelude::*;
//! use nexgraph_program::{BuildOptions, Program, Topology};
//!
//! let weights = Memory::zeros(Layout::new(DataType::F32, Tensor::bfyx(8, 3, 3, 3)));
//! let bias = Memory::zeros(Layout::new(DataType::F32, Tensor::bfyx(1, 1, 1, 8)));
//! let topology = Topology::new()
//!     .with(Primitive::input_layout("in", Layout::new(DataType::F32, Tensor::bfyx(1, 3, 8, 8))))?
//!     .with(Primitive::data("w", weights))?
//!     .with(Primitive::data("b", bias))?
//!     .with(Primitive::convolution("conv", "in", ConvolutionDesc::new(["w"], ["b"])))?;
//!
//! let program = Program::build(&topology, Arc::new(CpuBackend::new()), BuildOptions::new())?;
//! let layout = program.output_layout_of("conv").unwrap();
//! assert_eq!(layout.size, Tensor::bfyx(1, 8, 6, 6));
//! # Ok::<(), nexgraph_core::Error>(())
//! ```
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::similar_names)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::manual_let_else)]

// =============================================================================
// Modules
// =============================================================================

pub mod layout_optimizer;
pub mod network;
pub mod node;
pub mod options;
pub mod passes;
pub mod program;
pub mod shape;
pub mod topology;

// =============================================================================
// Re-exports
// =============================================================================

pub use layout_optimizer::{CachedReorder, DataRole, LayoutOptimizer, OptimizationAttributes};
pub use network::{ExecutionState, Network, NetworkOutput, PrimitiveInstance};
pub use node::{NodeId, ProgramNode};
pub use options::BuildOptions;
pub use passes::{BuildStats, OptimizationPass};
pub use program::Program;
pub use shape::calc_output_layout;
pub use topology::Topology;

pub use nexgraph_core::{Error, Result};

// =============================================================================
// Prelude
// =============================================================================

/// Convenient imports for common usage.
pub mod prelude {
    pub use crate::network::{Network, NetworkOutput};
    pub use crate::options::BuildOptions;
    pub use crate::program::Program;
    pub use crate::topology::Topology;
}
