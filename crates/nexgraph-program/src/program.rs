//! Program - Compiled Graph Built From a Topology
//!
//! `Program::build` turns a declarative `Topology` into an arena of
//! `ProgramNode`s, analyses it, runs the optimization passes and binds one
//! backend implementation to every surviving node.
//!
//! # Build Pipeline
//! 1. Graph initialization: nodes are created and dependency ids resolved.
//! 2. Analysis: processing order, constant marking, data flow, dominators.
//! 3. Output selection.
//! 4. Pre-optimization passes (constant propagation, layout reorders, bias).
//! 5. Post-optimization passes (weights, padding, depthwise merge, trimming).
//! 6. Compilation: layouts are inferred and implementations selected.
//!
//! The graph-maintenance primitives used by the passes (`replace_dependency`,
//! `add_intermediate`, `remove_if_dangling`, ...) keep the dependency and user
//! lists, the primitive descriptions and the processing order consistent.
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use nexgraph_core::{
    ComputeBackend, Error, Implementation, ImplementationRequest, Layout, Memory, Padding, Primitive,
    PrimitiveDesc, PrimitiveId, PrimitiveType, Result,
};
use rustc_hash::FxHashMap;

use crate::layout_optimizer::{CachedReorder, LayoutOptimizer};
use crate::node::{NodeId, ProgramNode};
use crate::options::BuildOptions;
use crate::passes::{self, BuildStats, OptimizationPass};
use crate::shape;
use crate::topology::Topology;

// =============================================================================
// Program
// =============================================================================

/// A topology compiled for one backend.
pub struct Program {
    pub(crate) backend: Arc<dyn ComputeBackend>,
    pub(crate) options: BuildOptions,
    pub(crate) nodes: Vec<ProgramNode>,
    pub(crate) ids: FxHashMap<PrimitiveId, NodeId>,
    pub(crate) processing_order: Vec<NodeId>,
    pub(crate) inputs: Vec<NodeId>,
    pub(crate) outputs: Vec<NodeId>,
    pub(crate) optimized_out: Vec<PrimitiveId>,
    pub(crate) stats: BuildStats,
    pub(crate) output_size_handling: bool,
}

impl Program {
    /// Builds and compiles `topology` for `backend`.
    pub fn build(topology: &Topology, backend: Arc<dyn ComputeBackend>, options: BuildOptions) -> Result<Self> {
        tracing::info!(
            primitives = topology.len(),
            backend = backend.name(),
            optimize_data = options.optimize_data,
            "building program"
        );

        let mut program = Self {
            backend,
            options,
            nodes: Vec::with_capacity(topology.len()),
            ids: FxHashMap::default(),
            processing_order: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            optimized_out: Vec::new(),
            stats: BuildStats::default(),
            output_size_handling: false,
        };

        program.init_graph(topology)?;
        program.analyze()?;
        program.set_outputs()?;
        program.analyze_output_size_handling()?;

        let mut optimizer = LayoutOptimizer::new().with_output_size_handling(program.output_size_handling);
        program.run_passes(&mut optimizer, &OptimizationPass::PRE_OPTIMIZE)?;
        program.run_passes(&mut optimizer, &OptimizationPass::POST_OPTIMIZE)?;
        program.compile_graph()?;

        tracing::info!(
            nodes = program.processing_order.len(),
            outputs = program.outputs.len(),
            reorders = program.stats.reorders_inserted,
            constants_folded = program.stats.constants_folded,
            "program built"
        );
        Ok(program)
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    /// Returns the node at arena index `id`.
    #[must_use]
    pub fn node(&self, id: NodeId) -> &ProgramNode {
        &self.nodes[id]
    }

    /// Looks up a live node by primitive id.
    #[must_use]
    pub fn get_node(&self, primitive_id: &str) -> Option<&ProgramNode> {
        self.find(primitive_id).map(|id| &self.nodes[id])
    }

    /// Live nodes in execution order.
    #[must_use]
    pub fn processing_order(&self) -> &[NodeId] {
        &self.processing_order
    }

    /// Primitive ids in execution order.
    #[must_use]
    pub fn processing_order_ids(&self) -> Vec<&str> {
        self.processing_order
            .iter()
            .map(|&id| self.nodes[id].primitive_id())
            .collect()
    }

    /// Nodes without dependencies.
    #[must_use]
    pub fn inputs(&self) -> &[NodeId] {
        &self.inputs
    }

    /// Output nodes.
    #[must_use]
    pub fn outputs(&self) -> &[NodeId] {
        &self.outputs
    }

    /// Ids of primitives removed during the build.
    #[must_use]
    pub fn optimized_out(&self) -> &[PrimitiveId] {
        &self.optimized_out
    }

    /// Build statistics.
    #[must_use]
    pub const fn stats(&self) -> &BuildStats {
        &self.stats
    }

    /// Options the program was built with.
    #[must_use]
    pub const fn options(&self) -> &BuildOptions {
        &self.options
    }

    /// True if some layer asks for an output size its window arithmetic does not give.
    #[must_use]
    pub const fn output_size_handling_enabled(&self) -> bool {
        self.output_size_handling
    }

    /// The backend the program was compiled for.
    #[must_use]
    pub fn backend(&self) -> &Arc<dyn ComputeBackend> {
        &self.backend
    }

    /// Number of live nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.processing_order.len()
    }

    /// Returns true if every node was optimized away.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.processing_order.is_empty()
    }

    /// Compiled output layout of a live primitive.
    #[must_use]
    pub fn output_layout_of(&self, primitive_id: &str) -> Option<Layout> {
        self.get_node(primitive_id)
            .and_then(|node| node.cached_output_layout().copied())
    }

    pub(crate) fn find(&self, primitive_id: &str) -> Option<NodeId> {
        self.ids
            .get(primitive_id)
            .copied()
            .filter(|&id| !self.nodes[id].removed)
    }

    // -------------------------------------------------------------------------
    // Graph Initialization
    // -------------------------------------------------------------------------

    fn init_graph(&mut self, topology: &Topology) -> Result<()> {
        for primitive in topology.iter() {
            self.add_node(Arc::clone(primitive))?;
        }
        for id in 0..self.nodes.len() {
            let primitive = Arc::clone(&self.nodes[id].primitive);
            for dep in primitive.dependencies() {
                let Some(&dep_id) = self.ids.get(dep) else {
                    return Err(Error::unresolved_reference(dep, primitive.id.clone()));
                };
                self.link(dep_id, id);
            }
        }
        tracing::debug!(nodes = self.nodes.len(), "graph initialized");
        Ok(())
    }

    fn analyze(&mut self) -> Result<()> {
        self.calc_processing_order()?;
        self.mark_constants();
        self.mark_data_flow();
        self.calc_dominators();
        Ok(())
    }

    fn analyze_output_size_handling(&mut self) -> Result<()> {
        let order = self.processing_order.clone();
        for id in order {
            let deps = self.nodes[id].dependencies.clone();
            let mut inputs = Vec::with_capacity(deps.len());
            for dep in deps {
                inputs.push(self.output_layout(dep)?);
            }
            if shape::needs_output_size_handling(&self.nodes[id].primitive, &inputs) {
                tracing::debug!(id = %self.nodes[id].primitive.id, "requested output size differs from window");
                self.output_size_handling = true;
                return Ok(());
            }
        }
        Ok(())
    }

    fn run_passes(&mut self, optimizer: &mut LayoutOptimizer, list: &[OptimizationPass]) -> Result<()> {
        for &pass in list {
            if pass.requires_optimize_data() && !self.options.optimize_data {
                continue;
            }
            let changed = passes::run_pass(self, optimizer, pass)?;
            tracing::debug!(pass = pass.name(), changed, nodes = self.processing_order.len(), "pass finished");
            self.stats.record(pass, changed);
        }
        Ok(())
    }

    /// Infers every layout and binds one implementation per node.
    fn compile_graph(&mut self) -> Result<()> {
        self.calc_processing_order()?;
        self.inputs = self
            .processing_order
            .iter()
            .copied()
            .filter(|&id| self.nodes[id].dependencies.is_empty())
            .collect();
        let order = self.processing_order.clone();
        for id in order {
            let implementation = self.select_implementation(id)?;
            tracing::trace!(
                id = %self.nodes[id].primitive.id,
                implementation = implementation.name(),
                "implementation selected"
            );
        }
        Ok(())
    }

    /// Selects (and caches) the implementation of `id` for its current layouts.
    pub(crate) fn select_implementation(&mut self, id: NodeId) -> Result<Arc<dyn Implementation>> {
        let output_layout = self.output_layout(id)?;
        let deps = self.nodes[id].dependencies.clone();
        let input_layouts = deps
            .into_iter()
            .map(|dep| self.output_layout(dep))
            .collect::<Result<Vec<_>>>()?;
        let primitive = Arc::clone(&self.nodes[id].primitive);
        let profile = self.backend.profile();
        let implementation = self.backend.select_implementation(&ImplementationRequest {
            primitive: &primitive,
            output_layout: &output_layout,
            input_layouts: &input_layouts,
            profile: &profile,
            tuning: self.options.tuning,
        })?;
        self.nodes[id].selected_impl = Some(Arc::clone(&implementation));
        Ok(implementation)
    }

    // -------------------------------------------------------------------------
    // Analysis
    // -------------------------------------------------------------------------

    /// Orders live nodes so that every node follows its dependencies.
    ///
    /// Depth-first over users from every input, in arena order; the order is
    /// the reverse postorder. Nodes not reachable from an input sit on a cycle.
    pub(crate) fn calc_processing_order(&mut self) -> Result<()> {
        let mut visited = vec![false; self.nodes.len()];
        let mut postorder = Vec::with_capacity(self.nodes.len());
        let roots: Vec<NodeId> = self
            .nodes
            .iter()
            .filter(|n| !n.removed && n.dependencies.is_empty())
            .map(|n| n.id)
            .collect();

        for root in roots {
            visited[root] = true;
            let mut stack = vec![(root, 0usize)];
            while let Some(top) = stack.last_mut() {
                let (node, cursor) = *top;
                if let Some(&user) = self.nodes[node].users.get(cursor) {
                    top.1 += 1;
                    if !visited[user] {
                        visited[user] = true;
                        stack.push((user, 0));
                    }
                } else {
                    postorder.push(node);
                    stack.pop();
                }
            }
        }

        let live = self.nodes.iter().filter(|n| !n.removed).count();
        if postorder.len() != live {
            let stuck: Vec<&str> = self
                .nodes
                .iter()
                .filter(|n| !n.removed && !visited[n.id])
                .map(ProgramNode::primitive_id)
                .collect();
            return Err(Error::invalid_argument(format!(
                "topology contains a cycle through {}",
                stuck.join(", ")
            )));
        }

        postorder.reverse();
        for (position, &id) in postorder.iter().enumerate() {
            self.nodes[id].processing_num = position + 1;
        }
        for &id in &postorder {
            let node = &self.nodes[id];
            if let Some(&dep) = node
                .dependencies
                .iter()
                .find(|&&dep| self.nodes[dep].processing_num >= node.processing_num)
            {
                return Err(Error::invalid_argument(format!(
                    "topology contains a cycle through {} and {}",
                    self.nodes[dep].primitive_id(),
                    node.primitive_id()
                )));
            }
        }
        self.processing_order = postorder;
        Ok(())
    }

    fn mark_constants(&mut self) {
        for index in 0..self.processing_order.len() {
            let id = self.processing_order[index];
            let constant = match self.nodes[id].kind() {
                PrimitiveType::Data => true,
                _ if self.nodes[id].dependencies.is_empty() => false,
                _ => self.nodes[id]
                    .dependencies
                    .iter()
                    .all(|&dep| self.nodes[dep].constant),
            };
            self.nodes[id].constant = constant;
        }
    }

    /// Marks nodes whose result reaches a non-constant sink through primary inputs.
    fn mark_data_flow(&mut self) {
        let mut queue = VecDeque::new();
        for &id in &self.processing_order {
            let node = &mut self.nodes[id];
            node.data_flow = node.users.is_empty() && !node.constant;
            if node.data_flow {
                queue.push_back(id);
            }
        }

        while let Some(id) = queue.pop_front() {
            let primary = self.nodes[id].primitive.inputs.len();
            let deps: Vec<NodeId> = self.nodes[id].dependencies.iter().take(primary).copied().collect();
            for dep in deps {
                let dep_node = &mut self.nodes[dep];
                if !dep_node.constant && !dep_node.data_flow {
                    dep_node.data_flow = true;
                    queue.push_back(dep);
                }
            }
        }

        for &id in &self.processing_order {
            let node = &mut self.nodes[id];
            node.main_branch = node.data_flow;
        }
    }

    /// Computes immediate dominators, joint points and main-branch flags.
    ///
    /// The analysis starts at the first data-flow node with several users.
    /// Several sinks are joined through a virtual node placed after the last
    /// node of the processing order.
    fn calc_dominators(&mut self) {
        let graph = BranchGraph::new(&self.nodes, &self.processing_order);
        let Some(root_pos) = self
            .processing_order
            .iter()
            .position(|&id| self.nodes[id].data_flow && self.nodes[id].users.len() > 1)
        else {
            return;
        };
        let order = &graph.order;
        let root = order[root_pos];

        let mut idom: Vec<Option<NodeId>> = vec![None; graph.len()];
        idom[root] = Some(root);
        let mut changed = true;
        while changed {
            changed = false;
            for &n in &order[root_pos + 1..] {
                if !graph.data_flow[n] {
                    continue;
                }
                let mut candidate: Option<NodeId> = None;
                for &pred in &graph.preds[n] {
                    if idom[pred].is_none() {
                        continue;
                    }
                    candidate = Some(match candidate {
                        None => pred,
                        Some(current) => graph.intersect(current, pred, &idom),
                    });
                }
                if candidate.is_some() && idom[n] != candidate {
                    idom[n] = candidate;
                    changed = true;
                }
            }
        }

        let mut joint: Vec<Option<NodeId>> = vec![None; graph.len()];
        let mut main_branch = graph.data_flow.clone();
        for &n in order[root_pos..].iter().rev() {
            if !graph.data_flow[n] {
                continue;
            }
            let Some(dominator) = idom[n] else {
                continue;
            };
            let preds = &graph.preds[n];
            if dominator == n || preds.len() == 1 || preds.contains(&dominator) {
                idom[n] = None;
                continue;
            }
            if joint[dominator].is_none() {
                joint[dominator] = Some(n);
            }
            for &pred in preds {
                let mut current = pred;
                while current != dominator && graph.data_flow[current] {
                    main_branch[current] = false;
                    match idom[current] {
                        Some(next) if next != current => current = next,
                        _ => break,
                    }
                }
            }
        }

        for &id in &self.processing_order {
            let node = &mut self.nodes[id];
            node.dominator = idom[id];
            node.joint = joint[id].filter(|&j| j < graph.sink);
            node.main_branch = main_branch[id];
        }
    }

    fn set_outputs(&mut self) -> Result<()> {
        for node in &mut self.nodes {
            node.output = false;
        }
        let selected: Vec<NodeId> = if self.options.debug {
            self.processing_order
                .iter()
                .copied()
                .filter(|&id| self.nodes[id].kind() != PrimitiveType::Data)
                .collect()
        } else if self.options.has_explicit_outputs() {
            self.options
                .outputs
                .iter()
                .map(|name| {
                    self.find(name).ok_or_else(|| {
                        Error::invalid_argument(format!("requested output '{name}' is not part of the topology"))
                    })
                })
                .collect::<Result<_>>()?
        } else {
            self.processing_order
                .iter()
                .copied()
                .filter(|&id| self.nodes[id].users.is_empty() && self.nodes[id].data_flow)
                .collect()
        };

        self.outputs.clear();
        for id in selected {
            if !self.nodes[id].output {
                self.nodes[id].output = true;
                self.outputs.push(id);
            }
        }
        if self.outputs.is_empty() {
            tracing::warn!("program has no outputs");
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Layouts
    // -------------------------------------------------------------------------

    /// Returns the output layout of `id`, inferring it (and its dependencies') on demand.
    pub(crate) fn output_layout(&mut self, id: NodeId) -> Result<Layout> {
        if let Some(layout) = self.nodes[id].output_layout {
            return Ok(layout);
        }
        let deps = self.nodes[id].dependencies.clone();
        let mut inputs = Vec::with_capacity(deps.len());
        for dep in deps {
            inputs.push(self.output_layout(dep)?);
        }
        let layout = shape::calc_output_layout(&self.nodes[id].primitive, &inputs)?;
        Ok(self.nodes[id].set_output_layout(layout))
    }

    /// Drops the cached layout of `id` and of every transitive user.
    pub(crate) fn invalidate(&mut self, id: NodeId) {
        let mut visited = vec![false; self.nodes.len()];
        let mut worklist = vec![id];
        while let Some(current) = worklist.pop() {
            if std::mem::replace(&mut visited[current], true) {
                continue;
            }
            self.nodes[current].output_layout = None;
            self.nodes[current].selected_impl = None;
            worklist.extend(self.nodes[current].users.iter().copied());
        }
    }

    /// Drops the cached layouts downstream of `id`, keeping its own.
    pub(crate) fn invalidate_users(&mut self, id: NodeId) {
        let users = self.nodes[id].users.clone();
        for user in users {
            self.invalidate(user);
        }
    }

    // -------------------------------------------------------------------------
    // Graph Maintenance
    // -------------------------------------------------------------------------

    /// Adds an unlinked node for `primitive`.
    pub(crate) fn add_node(&mut self, primitive: Arc<Primitive>) -> Result<NodeId> {
        if self.find(&primitive.id).is_some() {
            return Err(Error::duplicate_definition(primitive.id.clone()));
        }
        let id = self.nodes.len();
        self.ids.insert(primitive.id.clone(), id);
        self.nodes.push(ProgramNode::new(id, primitive));
        Ok(id)
    }

    fn link(&mut self, dep: NodeId, user: NodeId) {
        self.nodes[user].dependencies.push(dep);
        self.nodes[dep].users.push(user);
    }

    fn unlink_user(&mut self, dep: NodeId, user: NodeId) {
        let users = &mut self.nodes[dep].users;
        if let Some(position) = users.iter().position(|&u| u == user) {
            users.remove(position);
        }
    }

    fn set_dependency_slot(&mut self, node: NodeId, index: usize, new: NodeId) {
        self.nodes[node].dependencies[index] = new;
        self.nodes[new].users.push(node);
        let new_id = self.nodes[new].primitive.id.clone();
        let updated = self.nodes[node].primitive.with_dependency(index, &new_id);
        self.nodes[node].primitive = Arc::new(updated);
        self.invalidate(node);
    }

    /// Points dependency `index` of `node` at `new`, then drops the old
    /// dependency if nothing uses it any more.
    pub(crate) fn replace_dependency(&mut self, node: NodeId, index: usize, new: NodeId, detach: bool) {
        let old = self.nodes[node].dependencies[index];
        if old == new {
            return;
        }
        self.unlink_user(old, node);
        self.set_dependency_slot(node, index, new);
        self.remove_if_dangling(old, detach);
    }

    /// Splices the unlinked node `new` between `next` and its dependency `index`.
    ///
    /// `new`'s primitive must already read from that dependency.
    pub(crate) fn add_intermediate(&mut self, new: NodeId, next: NodeId, index: usize) {
        let prev = self.nodes[next].dependencies[index];
        self.link(prev, new);
        self.nodes[new].constant = self.nodes[prev].constant;
        self.nodes[new].data_flow = self.nodes[prev].data_flow;
        self.nodes[new].main_branch = self.nodes[prev].main_branch;

        self.unlink_user(prev, next);
        self.set_dependency_slot(next, index, new);

        match self.processing_order.iter().position(|&id| id == next) {
            Some(position) => self.processing_order.insert(position, new),
            None => self.processing_order.push(new),
        }
    }

    /// Replaces the primitive of `id` by one with the same dependencies.
    pub(crate) fn replace_primitive(&mut self, id: NodeId, primitive: Primitive) {
        self.nodes[id].output_padding = Padding::max(&self.nodes[id].output_padding, &primitive.output_padding);
        self.nodes[id].primitive = Arc::new(primitive);
        self.invalidate(id);
    }

    /// Removes `id` if it has no users and is not an output.
    ///
    /// Nodes with dependencies are only removed with `detach`, which unlinks
    /// them and recursively removes dependencies left dangling.
    pub(crate) fn remove_if_dangling(&mut self, id: NodeId, detach: bool) -> bool {
        let node = &self.nodes[id];
        if node.removed || !node.users.is_empty() || node.output {
            return false;
        }
        if !detach && !node.dependencies.is_empty() {
            return false;
        }
        let deps = std::mem::take(&mut self.nodes[id].dependencies);
        for &dep in &deps {
            self.unlink_user(dep, id);
        }
        self.remove_node(id);
        for dep in deps {
            if self.nodes[dep].kind() != PrimitiveType::InputLayout {
                self.remove_if_dangling(dep, true);
            }
        }
        true
    }

    /// Unlinks `id` from the graph entirely and forgets it.
    pub(crate) fn remove_node(&mut self, id: NodeId) {
        let deps = std::mem::take(&mut self.nodes[id].dependencies);
        for dep in deps {
            self.unlink_user(dep, id);
        }
        let users = std::mem::take(&mut self.nodes[id].users);
        for user in users {
            self.nodes[user].dependencies.retain(|&d| d != id);
        }

        let node = &mut self.nodes[id];
        node.removed = true;
        node.output = false;
        node.selected_impl = None;
        let primitive_id = node.primitive.id.clone();

        self.processing_order.retain(|&n| n != id);
        self.inputs.retain(|&n| n != id);
        self.outputs.retain(|&n| n != id);
        if self.ids.get(&primitive_id) == Some(&id) {
            self.ids.remove(&primitive_id);
        }
        tracing::trace!(id = %primitive_id, "node removed");
        self.optimized_out.push(primitive_id);
        self.stats.nodes_removed += 1;
    }

    /// Places a reorder handed out by the layout optimizer in front of
    /// dependency `index` of `user`, reusing an existing node for cached ones.
    pub(crate) fn insert_reorder(&mut self, reorder: &CachedReorder, user: NodeId, index: usize) -> Result<NodeId> {
        if reorder.cached {
            if let Some(existing) = self.find(&reorder.primitive.id) {
                self.replace_dependency(user, index, existing, false);
                return Ok(existing);
            }
        }
        let node = self.add_node(Arc::clone(&reorder.primitive))?;
        self.add_intermediate(node, user, index);
        self.stats.reorders_inserted += 1;
        tracing::debug!(
            reorder = %reorder.primitive.id,
            user = %self.nodes[user].primitive.id,
            "reorder inserted"
        );
        if self.depends_only_on_data(node) {
            self.fold_to_data(node)?;
        }
        Ok(node)
    }

    /// Replaces the primitive of `id` by one with different dependencies,
    /// relinking the graph and dropping dependencies left dangling.
    pub(crate) fn reset_dependencies(&mut self, id: NodeId, primitive: Primitive) -> Result<()> {
        let mut resolved = Vec::new();
        for dep in primitive.dependencies() {
            let dep_id = self
                .find(dep)
                .ok_or_else(|| Error::unresolved_reference(dep, primitive.id.clone()))?;
            resolved.push(dep_id);
        }

        let old = std::mem::take(&mut self.nodes[id].dependencies);
        for &dep in &old {
            self.unlink_user(dep, id);
        }
        for dep in resolved {
            self.link(dep, id);
        }
        self.nodes[id].primitive = Arc::new(primitive);
        self.invalidate(id);

        for dep in old {
            if self.nodes[dep].kind() != PrimitiveType::InputLayout {
                self.remove_if_dangling(dep, true);
            }
        }
        Ok(())
    }

    fn depends_only_on_data(&self, id: NodeId) -> bool {
        let deps = &self.nodes[id].dependencies;
        !deps.is_empty()
            && deps
                .iter()
                .all(|&dep| self.nodes[dep].kind() == PrimitiveType::Data)
    }

    // -------------------------------------------------------------------------
    // Constant Folding Helpers
    // -------------------------------------------------------------------------

    /// Turns `id` into a `Data` node holding `memory`, keeping its primitive id.
    pub(crate) fn replace_with_data(&mut self, id: NodeId, memory: Memory) {
        let primitive_id = self.nodes[id].primitive.id.clone();
        let deps = std::mem::take(&mut self.nodes[id].dependencies);
        for &dep in &deps {
            self.unlink_user(dep, id);
        }

        let node = &mut self.nodes[id];
        node.primitive = Arc::new(Primitive::data(primitive_id, memory));
        node.constant = true;
        node.data_flow = false;
        node.dominator = None;
        node.joint = None;
        self.invalidate(id);

        for dep in deps {
            if self.nodes[dep].kind() != PrimitiveType::InputLayout {
                self.remove_if_dangling(dep, true);
            }
        }
    }

    /// Evaluates `id`, whose dependencies must all be `Data`, on the backend and
    /// replaces it by the result.
    pub(crate) fn fold_to_data(&mut self, id: NodeId) -> Result<()> {
        let layout = self.output_layout(id)?;
        let mut inputs = Vec::with_capacity(self.nodes[id].dependencies.len());
        for &dep in &self.nodes[id].dependencies {
            match &self.nodes[dep].primitive.desc {
                PrimitiveDesc::Data { memory } => inputs.push(memory.clone()),
                _ => {
                    return Err(Error::invalid_argument(format!(
                        "cannot fold '{}': dependency '{}' is not constant data",
                        self.nodes[id].primitive.id, self.nodes[dep].primitive.id
                    )))
                }
            }
        }
        let implementation = self.select_implementation(id)?;
        let output = self.backend.allocate(&layout)?;
        implementation.execute(&inputs, &output, &[])?.wait();
        tracing::trace!(id = %self.nodes[id].primitive.id, "folded into data");
        self.replace_with_data(id, output);
        Ok(())
    }
}

impl fmt::Debug for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Program")
            .field("backend", &self.backend.name())
            .field("options", &self.options)
            .field("processing_order", &self.processing_order_ids())
            .field("outputs", &self.outputs)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Dominator Analysis Graph
// =============================================================================

/// Snapshot of the predecessor relation, with an optional virtual sink.
struct BranchGraph {
    preds: Vec<Vec<NodeId>>,
    num: Vec<usize>,
    data_flow: Vec<bool>,
    order: Vec<NodeId>,
    sink: NodeId,
}

impl BranchGraph {
    fn new(nodes: &[ProgramNode], processing_order: &[NodeId]) -> Self {
        let sink = nodes.len();
        let mut preds: Vec<Vec<NodeId>> = nodes.iter().map(|n| n.dependencies.clone()).collect();
        let mut num: Vec<usize> = nodes.iter().map(|n| n.processing_num).collect();
        let mut data_flow: Vec<bool> = nodes.iter().map(|n| n.data_flow && !n.removed).collect();
        let mut order = processing_order.to_vec();

        let endpoints: Vec<NodeId> = processing_order
            .iter()
            .copied()
            .filter(|&id| nodes[id].users.is_empty())
            .collect();
        if endpoints.len() > 1 {
            preds.push(endpoints);
            num.push(processing_order.len() + 1);
            data_flow.push(true);
            order.push(sink);
        } else {
            preds.push(Vec::new());
            num.push(usize::MAX);
            data_flow.push(false);
        }

        Self {
            preds,
            num,
            data_flow,
            order,
            sink,
        }
    }

    fn len(&self) -> usize {
        self.preds.len()
    }

    /// Closest common dominator of `a` and `b`.
    fn intersect(&self, mut a: NodeId, mut b: NodeId, idom: &[Option<NodeId>]) -> NodeId {
        while a != b {
            while self.num[a] > self.num[b] {
                match idom[a] {
                    Some(next) if next != a => a = next,
                    _ => return b,
                }
            }
            while self.num[b] > self.num[a] {
                match idom[b] {
                    Some(next) if next != b => b = next,
                    _ => return a,
                }
            }
        }
        a
    }
}

// =============================================================================
// Tests
// =============================================================================
