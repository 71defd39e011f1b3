//! Build Options - Program Builder Configuration
//!
//! # Example
//! ```rust
//! use nexgraph_program::BuildOptions;
//!
//! let options = BuildOptions::new().optimize_data(true).outputs(["fc"]);
//! assert!(options.optimize_data);
//! assert_eq!(options.outputs, vec!["fc".to_string()]);
//! ```
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use nexgraph_core::PrimitiveId;

// =============================================================================
// Build Options
// =============================================================================

/// Options controlling how a topology is compiled.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildOptions {
    /// Run the layout optimizer, constant propagation and padding preparation.
    pub optimize_data: bool,
    /// Keep every non-data primitive as an output.
    pub debug: bool,
    /// Record per-primitive execution times.
    pub profiling: bool,
    /// Ask the backend for tuned implementations.
    pub tuning: bool,
    /// Explicit output ids; empty means "every sink".
    pub outputs: Vec<PrimitiveId>,
}

impl BuildOptions {
    /// Creates options with everything disabled.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enables or disables data optimizations.
    #[must_use]
    pub fn optimize_data(mut self, enabled: bool) -> Self {
        self.optimize_data = enabled;
        self
    }

    /// Enables or disables debug mode.
    #[must_use]
    pub fn debug(mut self, enabled: bool) -> Self {
        self.debug = enabled;
        self
    }

    /// Enables or disables profiling.
    #[must_use]
    pub fn profiling(mut self, enabled: bool) -> Self {
        self.profiling = enabled;
        self
    }

    /// Enables or disables tuning.
    #[must_use]
    pub fn tuning(mut self, enabled: bool) -> Self {
        self.tuning = enabled;
        self
    }

    /// Sets the explicit output ids.
    #[must_use]
    pub fn outputs<I>(mut self, outputs: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<PrimitiveId>,
    {
        self.outputs = outputs.into_iter().map(Into::into).collect();
        self
    }

    /// Returns true if explicit outputs were requested.
    #[must_use]
    pub fn has_explicit_outputs(&self) -> bool {
        !self.outputs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_chain() {
        let options = BuildOptions::new().debug(true).profiling(true).tuning(true);
        assert!(options.debug && options.profiling && options.tuning);
        assert!(!options.optimize_data);
        assert!(!options.has_explicit_outputs());
    }
}
