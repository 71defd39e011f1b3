//! Constant propagation.
//!
//! Every constant node feeding a non-constant user is evaluated by building
//! and running a sub-network over the constant part of the graph; the node is
//! then replaced by a `Data` node holding the result. Constant sinks are left
//! alone since nothing downstream benefits from folding them.

use std::sync::Arc;

use nexgraph_core::{Memory, PrimitiveType, Result};
use rustc_hash::FxHashSet;

use crate::network::Network;
use crate::node::NodeId;
use crate::options::BuildOptions;
use crate::program::Program;
use crate::topology::Topology;

pub(crate) fn run(program: &mut Program) -> Result<bool> {
    let order = program.processing_order.clone();
    let is_folding_candidate = |id: NodeId| {
        let node = &program.nodes[id];
        node.constant && node.kind() != PrimitiveType::Data
    };

    let targets: Vec<NodeId> = order
        .iter()
        .copied()
        .filter(|&id| is_folding_candidate(id))
        .filter(|&id| program.nodes[id].users.iter().any(|&u| !program.nodes[u].constant))
        .collect();
    if targets.is_empty() {
        return Ok(false);
    }

    // Constant operations plus the data they read, in processing order.
    let mut included: FxHashSet<NodeId> = FxHashSet::default();
    for &id in order.iter().filter(|&&id| is_folding_candidate(id)) {
        included.insert(id);
        included.extend(program.nodes[id].dependencies.iter().copied());
    }
    let mut topology = Topology::new();
    for &id in order.iter().filter(|id| included.contains(id)) {
        topology.add(program.nodes[id].primitive.as_ref().clone())?;
    }

    let names: Vec<String> = targets
        .iter()
        .map(|&id| program.nodes[id].primitive.id.clone())
        .collect();
    tracing::debug!(targets = ?names, primitives = topology.len(), "evaluating constant sub-network");

    let options = BuildOptions::new().tuning(program.options.tuning).outputs(names.iter().cloned());
    let sub_program = Program::build(&topology, Arc::clone(&program.backend), options)?;
    let mut network = Network::new(Arc::new(sub_program))?;
    network.execute()?;

    let mut results: Vec<(NodeId, Memory)> = Vec::with_capacity(targets.len());
    for (&id, name) in targets.iter().zip(&names) {
        let output = network.get_output(name)?;
        output.event.wait();
        results.push((id, output.memory));
    }
    network.reset_execution(true);

    for (id, memory) in results {
        program.replace_with_data(id, memory);
    }
    program.stats.constants_folded += targets.len();
    Ok(true)
}
