//! Network - Executable Instance of a Compiled Program
//!
//! A `Network` binds one `PrimitiveInstance` (output memory plus selected
//! implementation) to every node of a program, in processing order. Buffers of
//! intermediate results come from a `MemoryPool`; two nodes whose lifetimes
//! overlap never share a buffer. A concatenation fused by the build owns one
//! buffer, and its inputs write into views of it.
//!
//! # Execution
//! Every round dispatches each instance once, in processing order, handing it
//! the completion events of its dependencies as a wait list. Events are
//! memoized per round, so asking for a node twice returns the same event.
//!
//! # Example
//! ```rust
//! use std::sync::Arc;
//! use nexgraph_core::prelude::*;
//! use nexgraph_program::{BuildOptions, Network, Program, Topology};
//!
//! let layout = Layout::new(DataType::F32, Tensor::bfyx(1, 1, 2, 2));
//! let window = Tensor::spatial_xy(2, 2);
//! let topology = Topology::new()
//!     .with(Primitive::input_layout("in", layout))?
//!     .with(Primitive::pooling("pool", "in", PoolingDesc::new(PoolingMode::Max, window, window)))?;
//! let program = Program::build(&topology, Arc::new(CpuBackend::new()), BuildOptions::new())?;
//!
//! let mut network = Network::new(Arc::new(program))?;
//! network.set_input_data("in", Memory::from_data(layout, &[1.0f32, 4.0, 3.0, 2.0])?)?;
//! network.execute()?;
//! let output = network.get_output("pool")?;
//! output.event.wait();
//! assert_eq!(output.memory.to_vec::<f32>()?, vec![4.0]);
//! # Ok::<(), nexgraph_core::Error>(())
//! ```
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use nexgraph_core::{
    Error, Event, Implementation, Memory, MemoryPool, PrimitiveDesc, PrimitiveId, PrimitiveType, Result,
};
use rustc_hash::{FxHashMap, FxHashSet};

use crate::node::NodeId;
use crate::program::Program;

// =============================================================================
// Types
// =============================================================================

/// Lifecycle of a network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutionState {
    /// Instances created, nothing executed.
    Built,
    /// Inputs are being bound or a round is running.
    Executing,
    /// The last round dispatched every instance.
    Completed,
}

/// One output of a network.
#[derive(Debug, Clone)]
pub struct NetworkOutput {
    /// Set once the output memory holds the result.
    pub event: Event,
    /// The output buffer.
    pub memory: Memory,
}

/// Runtime counterpart of a program node.
#[derive(Debug)]
pub struct PrimitiveInstance {
    id: PrimitiveId,
    node: NodeId,
    output: Memory,
    implementation: Arc<dyn Implementation>,
    deps: Vec<usize>,
    fused: bool,
}

impl PrimitiveInstance {
    /// Primitive id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Node of the program this instance executes.
    #[must_use]
    pub const fn node(&self) -> NodeId {
        self.node
    }

    /// Buffer the instance writes.
    #[must_use]
    pub const fn output_memory(&self) -> &Memory {
        &self.output
    }

    /// True if the inputs assemble the output in place and no kernel runs.
    #[must_use]
    pub const fn is_fused(&self) -> bool {
        self.fused
    }

    /// Name of the bound implementation.
    #[must_use]
    pub fn implementation_name(&self) -> &'static str {
        self.implementation.name()
    }
}

// =============================================================================
// Network
// =============================================================================

/// A program bound to memory, ready to execute.
pub struct Network {
    program: Arc<Program>,
    pool: MemoryPool,
    instances: Vec<PrimitiveInstance>,
    index: FxHashMap<PrimitiveId, usize>,
    state: ExecutionState,
    events: Vec<Option<Event>>,
    executed: Vec<PrimitiveId>,
    profiling: Vec<(PrimitiveId, Duration)>,
}

impl Network {
    /// Instantiates every node of `program`.
    pub fn new(program: Arc<Program>) -> Result<Self> {
        let pool = MemoryPool::new(Arc::clone(program.backend()));
        let order = program.processing_order();
        let position: FxHashMap<NodeId, usize> = order.iter().enumerate().map(|(pos, &id)| (id, pos)).collect();

        // Last position at which each result is read; outputs live until the end.
        let last_use: Vec<usize> = order
            .iter()
            .enumerate()
            .map(|(pos, &id)| {
                let node = program.node(id);
                if node.is_output() {
                    return order.len();
                }
                node.users()
                    .iter()
                    .filter_map(|user| position.get(user).copied())
                    .max()
                    .unwrap_or(pos)
            })
            .collect();

        // Fused concatenations get their own buffer; their inputs view slices of it.
        let mut fused: FxHashMap<NodeId, Memory> = FxHashMap::default();
        for &id in order {
            let node = program.node(id);
            if node.can_be_optimized() {
                let layout = node
                    .cached_output_layout()
                    .copied()
                    .ok_or_else(|| Error::invalid_argument(format!("'{}' has no compiled layout", node.primitive_id())))?;
                fused.insert(id, pool.allocate(&layout)?);
            }
        }

        let mut instances: Vec<PrimitiveInstance> = Vec::with_capacity(order.len());
        for (pos, &id) in order.iter().enumerate() {
            let node = program.node(id);
            let name = node.primitive_id().to_string();
            let layout = node
                .cached_output_layout()
                .copied()
                .ok_or_else(|| Error::invalid_argument(format!("'{name}' has no compiled layout")))?;
            let implementation = node
                .selected_impl()
                .cloned()
                .ok_or_else(|| Error::invalid_argument(format!("'{name}' has no selected implementation")))?;

            let fused_user = match node.users() {
                [user] => fused.get(user),
                _ => None,
            };
            let output = match (&node.primitive().desc, fused_user) {
                (PrimitiveDesc::Data { memory }, _) => memory.clone(),
                (PrimitiveDesc::InputLayout { .. }, _) => pool.allocate(&layout)?,
                _ if node.can_be_optimized() => fused
                    .get(&id)
                    .cloned()
                    .ok_or_else(|| Error::invalid_argument(format!("'{name}' has no fused buffer")))?,
                (_, Some(buffer)) => buffer.reinterpret(layout)?,
                _ => {
                    let conflicts: FxHashSet<PrimitiveId> = instances
                        .iter()
                        .enumerate()
                        .filter(|&(earlier, _)| last_use[earlier] >= pos)
                        .map(|(_, instance)| instance.id.clone())
                        .collect();
                    pool.get_memory(&layout, &name, &conflicts, !node.is_output())?
                }
            };

            let deps = node
                .dependencies()
                .iter()
                .map(|dep| {
                    position
                        .get(dep)
                        .copied()
                        .ok_or_else(|| Error::invalid_argument(format!("dependency of '{name}' is not scheduled")))
                })
                .collect::<Result<Vec<_>>>()?;

            instances.push(PrimitiveInstance {
                id: name,
                node: id,
                output,
                implementation,
                deps,
                fused: node.can_be_optimized(),
            });
        }

        let index = instances
            .iter()
            .enumerate()
            .map(|(slot, instance)| (instance.id.clone(), slot))
            .collect();
        tracing::debug!(
            instances = instances.len(),
            pooled_records = pool.record_count(),
            bytes = pool.total_device_memory_used(),
            "network instantiated"
        );

        Ok(Self {
            events: vec![None; instances.len()],
            program,
            pool,
            instances,
            index,
            state: ExecutionState::Built,
            executed: Vec::new(),
            profiling: Vec::new(),
        })
    }

    /// Binds caller data to an input placeholder.
    ///
    /// The memory's layout must equal the declared layout exactly. Binding
    /// resets the round, so outputs of the previous round are no longer served.
    pub fn set_input_data(&mut self, id: &str, memory: Memory) -> Result<()> {
        let slot = self.slot(id)?;
        let node = self.program.node(self.instances[slot].node);
        let PrimitiveDesc::InputLayout { layout } = &node.primitive().desc else {
            return Err(Error::invalid_argument(format!("'{id}' is a {}, not an input_layout", node.kind())));
        };
        if memory.layout() != layout {
            return Err(Error::LayoutMismatch {
                id: id.to_string(),
                expected: layout.to_string(),
                actual: memory.layout().to_string(),
            });
        }
        self.reset_execution(true);
        let previous = std::mem::replace(&mut self.instances[slot].output, memory);
        self.pool.release(&previous);
        self.state = ExecutionState::Executing;
        Ok(())
    }

    /// Runs one round over every instance.
    ///
    /// The previous round is reset (waiting for its events) before the next starts.
    pub fn execute(&mut self) -> Result<()> {
        self.reset_execution(true);
        self.state = ExecutionState::Executing;
        self.profiling.clear();
        for slot in 0..self.instances.len() {
            self.execute_primitive(slot)?;
        }
        self.state = ExecutionState::Completed;
        tracing::debug!(executed = self.executed.len(), "network executed");
        Ok(())
    }

    fn execute_primitive(&mut self, slot: usize) -> Result<Event> {
        if let Some(event) = &self.events[slot] {
            return Ok(event.clone());
        }
        let deps = self.instances[slot].deps.clone();
        let mut wait_events = Vec::with_capacity(deps.len());
        let mut inputs = Vec::with_capacity(deps.len());
        for dep in deps {
            wait_events.push(self.execute_primitive(dep)?);
            inputs.push(self.instances[dep].output.clone());
        }

        let instance = &self.instances[slot];
        let started = self.program.options().profiling.then(Instant::now);
        let event = if instance.fused {
            Event::wait_all(&wait_events);
            Event::completed()
        } else {
            instance
                .implementation
                .execute(&inputs, &instance.output, &wait_events)?
        };
        if let Some(started) = started {
            event.wait();
            self.profiling.push((instance.id.clone(), started.elapsed()));
        }
        tracing::trace!(id = %instance.id, implementation = instance.implementation.name(), "dispatched");

        self.executed.push(instance.id.clone());
        self.events[slot] = Some(event.clone());
        Ok(event)
    }

    /// Clears the round state; with `wait`, blocks until every dispatched event is set.
    pub fn reset_execution(&mut self, wait: bool) {
        if wait {
            for event in self.events.iter().flatten() {
                event.wait();
            }
        }
        self.events.iter_mut().for_each(|event| *event = None);
        self.executed.clear();
    }

    // -------------------------------------------------------------------------
    // Outputs and Introspection
    // -------------------------------------------------------------------------

    /// Returns an output of the last round.
    pub fn get_output(&self, id: &str) -> Result<NetworkOutput> {
        let slot = self.slot(id)?;
        if !self.program.node(self.instances[slot].node).is_output() {
            return Err(Error::invalid_argument(format!("'{id}' is not an output of the network")));
        }
        let event = self.events[slot]
            .clone()
            .ok_or_else(|| Error::invalid_argument(format!("output '{id}' has not been computed yet")))?;
        Ok(NetworkOutput {
            event,
            memory: self.instances[slot].output.clone(),
        })
    }

    /// Every output of the last round, keyed by id.
    pub fn get_outputs(&self) -> Result<FxHashMap<PrimitiveId, NetworkOutput>> {
        self.output_ids()
            .into_iter()
            .map(|id| Ok((id.to_string(), self.get_output(id)?)))
            .collect()
    }

    /// Ids of the output primitives.
    #[must_use]
    pub fn output_ids(&self) -> Vec<&str> {
        self.program
            .outputs()
            .iter()
            .map(|&id| self.program.node(id).primitive_id())
            .collect()
    }

    /// Ids of the input placeholders.
    #[must_use]
    pub fn input_ids(&self) -> Vec<&str> {
        self.instances
            .iter()
            .filter(|instance| self.program.node(instance.node).kind() == PrimitiveType::InputLayout)
            .map(|instance| instance.id.as_str())
            .collect()
    }

    /// Ids dispatched in the current round, in dispatch order.
    #[must_use]
    pub fn executed_primitives(&self) -> &[PrimitiveId] {
        &self.executed
    }

    /// Execution time per primitive for the last round, when profiling is enabled.
    #[must_use]
    pub fn profiling(&self) -> &[(PrimitiveId, Duration)] {
        &self.profiling
    }

    /// Output buffer of any instance.
    #[must_use]
    pub fn primitive_memory(&self, id: &str) -> Option<&Memory> {
        self.index.get(id).map(|&slot| &self.instances[slot].output)
    }

    /// Instances in execution order.
    #[must_use]
    pub fn instances(&self) -> &[PrimitiveInstance] {
        &self.instances
    }

    /// The pool the intermediate buffers came from.
    #[must_use]
    pub const fn memory_pool(&self) -> &MemoryPool {
        &self.pool
    }

    /// The compiled program.
    #[must_use]
    pub const fn program(&self) -> &Arc<Program> {
        &self.program
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> ExecutionState {
        self.state
    }

    fn slot(&self, id: &str) -> Result<usize> {
        self.index
            .get(id)
            .copied()
            .ok_or_else(|| Error::invalid_argument(format!("'{id}' is not part of the network")))
    }
}

impl fmt::Debug for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Network")
            .field("instances", &self.instances.len())
            .field("state", &self.state)
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BuildOptions, Topology};
    use nexgraph_core::{
        CpuBackend, DataType, Format, Layout, PoolingDesc, PoolingMode, Primitive, Tensor,
    };

    fn f32_bfyx(b: i32, f: i32, y: i32, x: i32) -> Layout {
        Layout::new(DataType::F32, Tensor::bfyx(b, f, y, x))
    }

    fn halving_pool(id: &str, source: &str) -> Primitive {
        let window = Tensor::spatial_xy(2, 2);
        Primitive::pooling(id, source, PoolingDesc::new(PoolingMode::Max, window, window))
    }

    fn network(topology: &Topology, options: BuildOptions) -> Network {
        let program = Program::build(topology, Arc::new(CpuBackend::new()), options).unwrap();
        Network::new(Arc::new(program)).unwrap()
    }

    fn pool_chain() -> Topology {
        Topology::new()
            .with(Primitive::input_layout("in", f32_bfyx(1, 1, 16, 16)))
            .unwrap()
            .with(halving_pool("p1", "in"))
            .unwrap()
            .with(halving_pool("p2", "p1"))
            .unwrap()
            .with(halving_pool("p3", "p2"))
            .unwrap()
            .with(halving_pool("p4", "p3"))
            .unwrap()
    }

    #[test]
    fn test_execute_max_pool() {
        let layout = f32_bfyx(1, 1, 2, 2);
        let topology = Topology::new()
            .with(Primitive::input_layout("in", layout))
            .unwrap()
            .with(halving_pool("pool", "in"))
            .unwrap();
        let mut network = network(&topology, BuildOptions::new());
        assert_eq!(network.state(), ExecutionState::Built);
        assert_eq!(network.input_ids(), vec!["in"]);
        assert_eq!(network.output_ids(), vec!["pool"]);

        network
            .set_input_data("in", Memory::from_data(layout, &[1.0f32, 7.0, 3.0, 2.0]).unwrap())
            .unwrap();
        network.execute().unwrap();
        assert_eq!(network.state(), ExecutionState::Completed);
        assert_eq!(network.executed_primitives().len(), 2);

        let output = network.get_output("pool").unwrap();
        output.event.wait();
        assert_eq!(output.memory.to_vec::<f32>().unwrap(), vec![7.0]);
        assert_eq!(network.get_outputs().unwrap().len(), 1);
    }

    #[test]
    fn test_layout_mismatch_leaves_state_untouched() {
        let mut network = network(&pool_chain(), BuildOptions::new());
        let before = network.primitive_memory("in").unwrap().clone();
        let wrong = Memory::zeros(Layout::new(DataType::F32, Tensor::bfyx(1, 1, 16, 16).transform(Format::Yxfb, 1).unwrap()));

        let err = network.set_input_data("in", wrong).unwrap_err();
        assert!(matches!(err, Error::LayoutMismatch { ref id, .. } if id == "in"));
        assert_eq!(network.state(), ExecutionState::Built);
        assert!(network.primitive_memory("in").unwrap().is_same_buffer(&before));
    }

    #[test]
    fn test_set_input_data_on_non_input() {
        let mut network = network(&pool_chain(), BuildOptions::new());
        let err = network.set_input_data("p1", Memory::zeros(f32_bfyx(1, 1, 8, 8))).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { .. }));
        let err = network.set_input_data("nope", Memory::zeros(f32_bfyx(1, 1, 8, 8))).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { .. }));
    }

    #[test]
    fn test_live_buffers_never_alias() {
        let network = network(&pool_chain(), BuildOptions::new());
        let memory = |id: &str| network.primitive_memory(id).unwrap().clone();
        assert!(!memory("p1").is_same_buffer(&memory("p2")));
        assert!(!memory("p2").is_same_buffer(&memory("p3")));
        assert!(memory("p1").is_same_buffer(&memory("p3")));
        assert!(!memory("p4").is_same_buffer(&memory("p1")));
        assert!(!memory("p4").is_same_buffer(&memory("p2")));
    }

    #[test]
    fn test_rounds_and_profiling() {
        let mut network = network(&pool_chain(), BuildOptions::new().profiling(true));
        network.execute().unwrap();
        assert_eq!(network.profiling().len(), 5);
        network.execute().unwrap();
        assert_eq!(network.executed_primitives().len(), 5);

        network.reset_execution(true);
        assert!(network.executed_primitives().is_empty());
        assert!(network.get_output("p4").is_err());
    }

    #[test]
    fn test_new_input_runs_a_fresh_round() {
        let layout = f32_bfyx(1, 1, 2, 2);
        let topology = Topology::new()
            .with(Primitive::input_layout("in", layout))
            .unwrap()
            .with(halving_pool("pool", "in"))
            .unwrap();
        let mut network = network(&topology, BuildOptions::new());

        network
            .set_input_data("in", Memory::from_data(layout, &[1.0f32, 7.0, 3.0, 2.0]).unwrap())
            .unwrap();
        network.execute().unwrap();
        assert_eq!(network.get_output("pool").unwrap().memory.to_vec::<f32>().unwrap(), vec![7.0]);

        network
            .set_input_data("in", Memory::from_data(layout, &[9.0f32, 1.0, 1.0, 1.0]).unwrap())
            .unwrap();
        assert_eq!(network.state(), ExecutionState::Executing);
        assert!(network.executed_primitives().is_empty());
        assert!(network.get_output("pool").is_err());

        network.execute().unwrap();
        assert_eq!(network.executed_primitives(), ["in".to_string(), "pool".to_string()]);
        let output = network.get_output("pool").unwrap();
        output.event.wait();
        assert_eq!(output.memory.to_vec::<f32>().unwrap(), vec![9.0]);
    }

    #[test]
    fn test_bound_input_releases_placeholder() {
        let layout = f32_bfyx(1, 1, 2, 2);
        let topology = Topology::new()
            .with(Primitive::input_layout("in", layout))
            .unwrap()
            .with(halving_pool("pool", "in"))
            .unwrap();
        let mut network = network(&topology, BuildOptions::new());
        let before = network.memory_pool().total_device_memory_used();

        network.set_input_data("in", Memory::zeros(layout)).unwrap();
        assert_eq!(network.memory_pool().total_device_memory_used(), before - layout.bytes_count());
        network.set_input_data("in", Memory::zeros(layout)).unwrap();
        assert_eq!(network.memory_pool().total_device_memory_used(), before - layout.bytes_count());
    }

    #[test]
    fn test_get_output_rejects_intermediate() {
        let mut network = network(&pool_chain(), BuildOptions::new());
        network.execute().unwrap();
        assert!(matches!(network.get_output("p2"), Err(Error::InvalidArgument { .. })));
    }
}
