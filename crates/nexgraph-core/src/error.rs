//! Error Types - NexGraph Error Handling
//!
//! Provides the error taxonomy shared by every stage of the pipeline: tensor
//! construction, shape inference, program building, memory pooling and
//! network execution all report failures through the same `Error` enum.
//!
//! # Key Features
//! - One typed failure per taxonomy entry (shape, reference, allocation, ...)
//! - Structured context fields for debugging
//! - Integration with `std::error::Error` via `thiserror`
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use thiserror::Error;

// =============================================================================
// Error Types
// =============================================================================

/// The main error type for NexGraph operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// Inconsistent shapes detected while constructing tensors or inferring layouts.
    #[error("Shape mismatch: {message}")]
    ShapeMismatch {
        /// Description of the violated shape constraint.
        message: String,
    },

    /// Coordinate outside of the addressable buffer range.
    #[error("Out of range: coordinate {coordinate} on axis '{axis}' outside [{lower}, {upper})")]
    OutOfRange {
        /// The axis character (as named by the format).
        axis: char,
        /// The requested coordinate.
        coordinate: i32,
        /// Inclusive lower bound.
        lower: i32,
        /// Exclusive upper bound.
        upper: i32,
    },

    /// A primitive references an id that is not part of the topology.
    #[error("Unresolved reference: primitive '{referenced_by}' depends on unknown primitive '{id}'")]
    UnresolvedReference {
        /// The missing primitive id.
        id: String,
        /// The primitive holding the dangling reference.
        referenced_by: String,
    },

    /// A different description was registered under an existing id.
    #[error("Duplicate definition: primitive '{id}' already exists with a different description")]
    DuplicateDefinition {
        /// The conflicting id.
        id: String,
    },

    /// A single allocation exceeds the backend's maximum allocation size.
    #[error("Allocation size exceeded: requested {requested} bytes, maximum is {max} bytes")]
    AllocationSizeExceeded {
        /// Requested bytes.
        requested: usize,
        /// Maximum bytes for one allocation.
        max: usize,
    },

    /// Cumulative allocations exceed the backend's global memory budget.
    #[error("Global memory exceeded: {used} bytes in use, requested {requested} more, budget is {budget} bytes")]
    GlobalMemoryExceeded {
        /// Requested bytes.
        requested: usize,
        /// Bytes already in use.
        used: usize,
        /// Total budget.
        budget: usize,
    },

    /// The backend could not satisfy an allocation.
    #[error("Out of resources: {message}")]
    OutOfResources {
        /// Backend-provided detail.
        message: String,
    },

    /// Runtime data does not match the declared layout of an input.
    #[error("Layout mismatch for '{id}': expected {expected}, got {actual}")]
    LayoutMismatch {
        /// The input primitive id.
        id: String,
        /// The declared layout, formatted.
        expected: String,
        /// The supplied layout, formatted.
        actual: String,
    },

    /// API misuse.
    #[error("Invalid argument: {message}")]
    InvalidArgument {
        /// What was wrong.
        message: String,
    },

    /// A structurally valid but unhandled combination.
    #[error("Not implemented: {message}")]
    NotImplemented {
        /// The unhandled combination.
        message: String,
    },

    /// A backend implementation failed while executing.
    #[error("Backend error: {message}")]
    Backend {
        /// Backend-provided detail.
        message: String,
    },
}

// =============================================================================
// Helper Constructors
// =============================================================================

impl Error {
    /// Creates a shape mismatch error.
    pub fn shape_mismatch(message: impl Into<String>) -> Self {
        Self::ShapeMismatch {
            message: message.into(),
        }
    }

    /// Creates an unresolved reference error.
    pub fn unresolved_reference(id: impl Into<String>, referenced_by: impl Into<String>) -> Self {
        Self::UnresolvedReference {
            id: id.into(),
            referenced_by: referenced_by.into(),
        }
    }

    /// Creates a duplicate definition error.
    pub fn duplicate_definition(id: impl Into<String>) -> Self {
        Self::DuplicateDefinition { id: id.into() }
    }

    /// Creates an out of resources error.
    pub fn out_of_resources(message: impl Into<String>) -> Self {
        Self::OutOfResources {
            message: message.into(),
        }
    }

    /// Creates an invalid argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Creates a not implemented error.
    pub fn not_implemented(message: impl Into<String>) -> Self {
        Self::NotImplemented {
            message: message.into(),
        }
    }

    /// Creates a backend error.
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }

    /// Returns true for the capacity failures raised by allocation paths.
    #[must_use]
    pub const fn is_allocation_failure(&self) -> bool {
        matches!(
            self,
            Self::AllocationSizeExceeded { .. }
                | Self::GlobalMemoryExceeded { .. }
                | Self::OutOfResources { .. }
        )
    }
}

/// Result type alias for NexGraph operations.
pub type Result<T> = core::result::Result<T, Error>;

// =============================================================================
// Tests
// =============================================================================
