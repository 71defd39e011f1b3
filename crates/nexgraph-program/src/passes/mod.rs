//! Optimization Passes - Graph Rewrites Applied During a Build
//!
//! Every pass takes the program being built plus the build-wide layout
//! optimizer and reports whether it changed the graph. The program runs the
//! `PRE_OPTIMIZE` list before and the `POST_OPTIMIZE` list after layout
//! selection; passes that rewrite data are skipped unless `optimize_data` is set.
//! `prepare_padding` always runs since requested input paddings and output
//! sizes must hold in every build; its window part is gated internally.
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use nexgraph_core::Result;

use crate::layout_optimizer::LayoutOptimizer;
use crate::program::Program;

mod post_optimize_weights;
mod pre_optimize_bias;
mod prepare_buffer_fusing;
mod prepare_depthwise_sep;
mod prepare_padding;
mod propagate_constants;
mod remove_redundant_reorders;
mod reorder_inputs;
mod trim_to_outputs;

// =============================================================================
// Optimization Pass
// =============================================================================

/// Optimization passes available.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OptimizationPass {
    /// Evaluate constant sub-graphs and replace them by data.
    PropagateConstants,
    /// Drop reorders that do not change the layout.
    RemoveRedundantReorders,
    /// Convert convolution inputs to their preferred format.
    ReorderInputs,
    /// Flatten bias buffers.
    PreOptimizeBias,
    /// Convert weights to the layouts the layout policy and the kernels need.
    PostOptimizeWeights,
    /// Grow producer paddings to cover the windows of their consumers.
    PreparePadding,
    /// Merge many-split convolutions into one grouped convolution.
    PrepareDepthwiseSep,
    /// Let concatenation inputs write straight into the concatenated buffer.
    PrepareBufferFusing,
    /// Remove nodes that no output depends on.
    TrimToOutputs,
}

impl OptimizationPass {
    /// Passes run before layout selection, in order.
    pub const PRE_OPTIMIZE: [Self; 4] = [
        Self::PropagateConstants,
        Self::RemoveRedundantReorders,
        Self::ReorderInputs,
        Self::PreOptimizeBias,
    ];

    /// Passes run after layout selection, in order.
    pub const POST_OPTIMIZE: [Self; 5] = [
        Self::PostOptimizeWeights,
        Self::PreparePadding,
        Self::PrepareDepthwiseSep,
        Self::PrepareBufferFusing,
        Self::TrimToOutputs,
    ];

    /// Returns the pass name used in logs.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::PropagateConstants => "propagate_constants",
            Self::RemoveRedundantReorders => "remove_redundant_reorders",
            Self::ReorderInputs => "reorder_inputs",
            Self::PreOptimizeBias => "pre_optimize_bias",
            Self::PostOptimizeWeights => "post_optimize_weights",
            Self::PreparePadding => "prepare_padding",
            Self::PrepareDepthwiseSep => "prepare_depthwise_sep",
            Self::PrepareBufferFusing => "prepare_buffer_fusing",
            Self::TrimToOutputs => "trim_to_outputs",
        }
    }

    /// Returns true for passes that only run with `optimize_data`.
    #[must_use]
    pub const fn requires_optimize_data(self) -> bool {
        matches!(
            self,
            Self::PropagateConstants
                | Self::RemoveRedundantReorders
                | Self::ReorderInputs
                | Self::PreOptimizeBias
                | Self::PrepareBufferFusing
        )
    }
}

pub(crate) fn run_pass(program: &mut Program, optimizer: &mut LayoutOptimizer, pass: OptimizationPass) -> Result<bool> {
    match pass {
        OptimizationPass::PropagateConstants => propagate_constants::run(program),
        OptimizationPass::RemoveRedundantReorders => remove_redundant_reorders::run(program),
        OptimizationPass::ReorderInputs => reorder_inputs::run(program, optimizer),
        OptimizationPass::PreOptimizeBias => pre_optimize_bias::run(program, optimizer),
        OptimizationPass::PostOptimizeWeights => post_optimize_weights::run(program, optimizer),
        OptimizationPass::PreparePadding => prepare_padding::run(program),
        OptimizationPass::PrepareDepthwiseSep => prepare_depthwise_sep::run(program),
        OptimizationPass::PrepareBufferFusing => prepare_buffer_fusing::run(program),
        OptimizationPass::TrimToOutputs => trim_to_outputs::run(program),
    }
}

// =============================================================================
// Build Statistics
// =============================================================================

/// Statistics about a build.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BuildStats {
    /// Nodes replaced by evaluated data.
    pub constants_folded: usize,
    /// Reorder nodes added to the graph.
    pub reorders_inserted: usize,
    /// Nodes removed from the graph.
    pub nodes_removed: usize,
    /// Passes that ran, with whether they changed the graph.
    pub passes: Vec<(OptimizationPass, bool)>,
}

impl BuildStats {
    /// Records one pass run.
    pub fn record(&mut self, pass: OptimizationPass, changed: bool) {
        self.passes.push((pass, changed));
    }

    /// Returns true if `pass` ran.
    #[must_use]
    pub fn ran(&self, pass: OptimizationPass) -> bool {
        self.passes.iter().any(|(p, _)| *p == pass)
    }

    /// Returns true if `pass` ran and changed the graph.
    #[must_use]
    pub fn changed(&self, pass: OptimizationPass) -> bool {
        self.passes.iter().any(|&(p, changed)| p == pass && changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gating_and_order() {
        assert!(OptimizationPass::PRE_OPTIMIZE.iter().all(|p| p.requires_optimize_data()));
        assert!(!OptimizationPass::PostOptimizeWeights.requires_optimize_data());
        assert!(!OptimizationPass::TrimToOutputs.requires_optimize_data());
        assert!(!OptimizationPass::PreparePadding.requires_optimize_data());
        assert!(OptimizationPass::PrepareBufferFusing.requires_optimize_data());
        assert_eq!(OptimizationPass::POST_OPTIMIZE[3], OptimizationPass::PrepareBufferFusing);
        assert_eq!(OptimizationPass::POST_OPTIMIZE[4], OptimizationPass::TrimToOutputs);
    }

    #[test]
    fn test_stats_record() {
        let mut stats = BuildStats::default();
        stats.record(OptimizationPass::TrimToOutputs, false);
        stats.record(OptimizationPass::PreparePadding, true);
        assert!(stats.ran(OptimizationPass::TrimToOutputs));
        assert!(!stats.changed(OptimizationPass::TrimToOutputs));
        assert!(stats.changed(OptimizationPass::PreparePadding));
        assert!(!stats.ran(OptimizationPass::ReorderInputs));
    }
}
