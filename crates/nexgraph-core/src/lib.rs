//! NexGraph Core - Foundation Layer for the NexGraph Graph Compiler
//!
//! This crate provides the value types and runtime plumbing every other NexGraph
//! crate builds on: element types, tensors and formats, layouts with padding,
//! layout-tagged memory, primitive descriptions, compute backends and the
//! memory pool.
//!
//! # Key Features
//! - Format-tagged tensors with lossless reprojection between formats
//! - Layouts with padding, pitches and format-specific alignment
//! - Reference-counted memory with zero-copy reinterpretation
//! - Pluggable compute backends with an implementation registry
//! - Size-keyed memory pool with conflict-aware reuse
//!
//! # Example
//! ```rust
//! use nexgraph_core::{DataType, Format, Layout};
//!
//! let layout = Layout::from_sizes(DataType::F16, Format::Bfyx, &[1, 3, 224, 224]).unwrap();
//! assert_eq!(layout.bytes_count(), 3 * 224 * 224 * 2);
//! ```
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
// Tensor-index allowances
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::similar_names)]
#![allow(clippy::many_single_char_names)]
#![allow(clippy::too_many_arguments)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::manual_let_else)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::trivially_copy_pass_by_ref)]

// =============================================================================
// Modules
// =============================================================================

pub mod backends;
pub mod device;
pub mod dtype;
pub mod error;
pub mod layout;
pub mod memory;
pub mod memory_pool;
pub mod primitive;
pub mod tensor;

// =============================================================================
// Re-exports
// =============================================================================

pub use backends::{
    register_reference_implementations, ComputeBackend, CpuBackend, EngineKind, Event, Implementation,
    ImplementationFactory, ImplementationRegistry, ImplementationRequest, ReorderSpec,
};
pub use device::DeviceProfile;
pub use dtype::{DataType, Element};
pub use error::{Error, Result};
pub use layout::{align_to, Layout, Padding};
pub use memory::Memory;
pub use memory_pool::{MemoryPool, MemoryRecord};
pub use primitive::{
    ConvolutionDesc, FullyConnectedDesc, NormRegion, NormalizationDesc, PoolingDesc, PoolingMode, Primitive,
    PrimitiveDesc, PrimitiveId, PrimitiveType, ReorderDesc,
};
pub use tensor::{Format, FormatTraits, Tensor, TENSOR_DIM_MAX};

// =============================================================================
// Prelude
// =============================================================================

/// Convenient imports for common usage.
pub mod prelude {
    pub use crate::backends::{ComputeBackend, CpuBackend, Event};
    pub use crate::dtype::{DataType, Element};
    pub use crate::error::{Error, Result};
    pub use crate::layout::{Layout, Padding};
    pub use crate::memory::Memory;
    pub use crate::primitive::{
        ConvolutionDesc, FullyConnectedDesc, NormRegion, NormalizationDesc, PoolingDesc, PoolingMode, Primitive,
        ReorderDesc,
    };
    pub use crate::tensor::{Format, Tensor};
}
