//! Program Node - Mutable Graph Wrapper Around a Primitive
//!
//! Every primitive of a topology becomes one `ProgramNode` inside the
//! program's arena. Nodes are addressed by `NodeId`, a stable arena index, and
//! all graph relations (dependencies, users, dominator, joint point) are
//! stored as ids.
//!
//! The output layout is computed lazily by the program and cached on the node;
//! any change to a dependency clears the cache of every transitive user.
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use std::fmt;
use std::sync::Arc;

use nexgraph_core::{Implementation, Layout, Padding, Primitive, PrimitiveType};

/// Stable index of a node inside a program's arena.
pub type NodeId = usize;

// =============================================================================
// Program Node
// =============================================================================

/// One node of the program graph.
#[derive(Clone)]
pub struct ProgramNode {
    pub(crate) id: NodeId,
    pub(crate) primitive: Arc<Primitive>,
    pub(crate) output_layout: Option<Layout>,
    pub(crate) output_padding: Padding,
    pub(crate) dependencies: Vec<NodeId>,
    pub(crate) users: Vec<NodeId>,
    pub(crate) dominator: Option<NodeId>,
    pub(crate) joint: Option<NodeId>,
    pub(crate) main_branch: bool,
    pub(crate) constant: bool,
    pub(crate) data_flow: bool,
    pub(crate) output: bool,
    pub(crate) processing_num: usize,
    pub(crate) depthwise_sep_opt: bool,
    pub(crate) can_be_optimized: bool,
    pub(crate) selected_impl: Option<Arc<dyn Implementation>>,
    pub(crate) removed: bool,
}

impl ProgramNode {
    pub(crate) fn new(id: NodeId, primitive: Arc<Primitive>) -> Self {
        let output_padding = primitive.output_padding;
        Self {
            id,
            primitive,
            output_layout: None,
            output_padding,
            dependencies: Vec::new(),
            users: Vec::new(),
            dominator: None,
            joint: None,
            main_branch: true,
            constant: false,
            data_flow: false,
            output: false,
            processing_num: 0,
            depthwise_sep_opt: false,
            can_be_optimized: false,
            selected_impl: None,
            removed: false,
        }
    }

    /// Arena index of this node.
    #[must_use]
    pub const fn id(&self) -> NodeId {
        self.id
    }

    /// The wrapped primitive.
    #[must_use]
    pub fn primitive(&self) -> &Arc<Primitive> {
        &self.primitive
    }

    /// Id of the wrapped primitive.
    #[must_use]
    pub fn primitive_id(&self) -> &str {
        &self.primitive.id
    }

    /// Kind of the wrapped primitive.
    #[must_use]
    pub fn kind(&self) -> PrimitiveType {
        self.primitive.kind()
    }

    /// Dependency nodes, in the primitive's dependency order.
    #[must_use]
    pub fn dependencies(&self) -> &[NodeId] {
        &self.dependencies
    }

    /// Nodes consuming this node's output.
    #[must_use]
    pub fn users(&self) -> &[NodeId] {
        &self.users
    }

    /// Cached output layout, `None` while invalid.
    #[must_use]
    pub const fn cached_output_layout(&self) -> Option<&Layout> {
        self.output_layout.as_ref()
    }

    /// Padding merged onto this node's output by the padding passes.
    #[must_use]
    pub const fn output_padding(&self) -> &Padding {
        &self.output_padding
    }

    /// True for nodes without dependencies.
    #[must_use]
    pub fn is_input(&self) -> bool {
        self.dependencies.is_empty()
    }

    /// True for sinks with no users.
    #[must_use]
    pub fn is_endpoint(&self) -> bool {
        self.users.is_empty()
    }

    /// True if the node is a network output.
    #[must_use]
    pub const fn is_output(&self) -> bool {
        self.output
    }

    /// True if the node only depends on constant data.
    #[must_use]
    pub const fn is_constant(&self) -> bool {
        self.constant
    }

    /// True if the node is reachable from a runtime input.
    #[must_use]
    pub const fn is_in_data_flow(&self) -> bool {
        self.data_flow
    }

    /// False for nodes on a branch that diverges from the main path.
    #[must_use]
    pub const fn is_in_main_branch(&self) -> bool {
        self.main_branch
    }

    /// Immediate dominator, if non-trivial.
    #[must_use]
    pub const fn dominator(&self) -> Option<NodeId> {
        self.dominator
    }

    /// Node where the branches dominated by this node join again.
    #[must_use]
    pub const fn joint(&self) -> Option<NodeId> {
        self.joint
    }

    /// Position in the processing order, starting at 1.
    #[must_use]
    pub const fn processing_num(&self) -> usize {
        self.processing_num
    }

    /// Split count of (de)convolutions, 1 for other kinds.
    #[must_use]
    pub fn split(&self) -> usize {
        self.primitive.split()
    }

    /// True once the depthwise-separable merge was scheduled for this node.
    #[must_use]
    pub const fn depthwise_sep_opt(&self) -> bool {
        self.depthwise_sep_opt
    }

    /// True if the node's output is assembled in place by its dependencies,
    /// so it runs no kernel.
    #[must_use]
    pub const fn can_be_optimized(&self) -> bool {
        self.can_be_optimized
    }

    /// Implementation bound during compilation.
    #[must_use]
    pub fn selected_impl(&self) -> Option<&Arc<dyn Implementation>> {
        self.selected_impl.as_ref()
    }

    /// Grows the output padding to cover `padding`; returns true if it changed.
    pub(crate) fn merge_output_padding(&mut self, padding: &Padding) -> bool {
        let merged = Padding::max(&self.output_padding, padding);
        if merged == self.output_padding {
            return false;
        }
        self.output_padding = merged;
        if let Some(layout) = self.output_layout.as_mut() {
            layout.padding = merged;
        }
        true
    }

    /// Replaces the output padding, shrinking it if needed.
    pub(crate) fn set_output_padding(&mut self, padding: Padding) {
        self.output_padding = padding;
        if let Some(layout) = self.output_layout.as_mut() {
            layout.padding = padding;
        }
    }

    /// Stores `layout` as the output layout, keeping the node's padding.
    pub(crate) fn set_output_layout(&mut self, layout: Layout) -> Layout {
        let layout = layout.with_padding(Padding::max(&layout.padding, &self.output_padding));
        self.output_layout = Some(layout);
        layout
    }
}

impl fmt::Debug for ProgramNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgramNode")
            .field("id", &self.id)
            .field("primitive", &self.primitive.id)
            .field("kind", &self.kind())
            .field("dependencies", &self.dependencies)
            .field("users", &self.users)
            .field("constant", &self.constant)
            .field("data_flow", &self.data_flow)
            .field("output", &self.output)
            .field("processing_num", &self.processing_num)
            .field("can_be_optimized", &self.can_be_optimized)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nexgraph_core::{DataType, Tensor};

    fn node() -> ProgramNode {
        let layout = Layout::new(DataType::F32, Tensor::bfyx(1, 1, 4, 4));
        ProgramNode::new(0, Arc::new(Primitive::input_layout("in", layout)))
    }

    #[test]
    fn test_new_node_flags() {
        let node = node();
        assert!(node.is_input());
        assert!(node.is_endpoint());
        assert!(node.is_in_main_branch());
        assert!(!node.is_output());
        assert_eq!(node.kind(), PrimitiveType::InputLayout);
        assert!(node.cached_output_layout().is_none());
    }

    #[test]
    fn test_merge_output_padding_only_grows() {
        let mut node = node();
        node.set_output_layout(Layout::new(DataType::F32, Tensor::bfyx(1, 1, 4, 4)));
        let one = Padding::symmetric(Tensor::bfyx(0, 0, 1, 1), 0.0);
        assert!(node.merge_output_padding(&one));
        assert!(!node.merge_output_padding(&Padding::none()));
        assert_eq!(node.cached_output_layout().unwrap().padding, one);
    }

    #[test]
    fn test_set_output_padding_replaces() {
        let mut node = node();
        node.set_output_layout(Layout::new(DataType::F32, Tensor::bfyx(1, 1, 4, 4)));
        node.merge_output_padding(&Padding::symmetric(Tensor::bfyx(0, 0, 2, 2), 0.0));
        let feature = Padding::new(Tensor::bfyx(0, 1, 0, 0), Tensor::bfyx(0, 3, 0, 0), 0.0);
        node.set_output_padding(feature);
        assert_eq!(node.output_padding(), &feature);
        assert_eq!(node.cached_output_layout().unwrap().padding, feature);
    }
}
