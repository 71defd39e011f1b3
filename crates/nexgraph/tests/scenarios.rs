//! End-to-end build and execution scenarios.
//!
//! Each test builds a topology on the CPU backend, checks the compiled
//! program and, where it makes sense, runs it and checks the numbers.
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use std::sync::Arc;

use nexgraph::core::PrimitiveType;
use nexgraph::prelude::*;
use nexgraph::program::ExecutionState;

// =============================================================================
// Test Helpers
// =============================================================================

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn f32_layout(b: i32, f: i32, y: i32, x: i32) -> Layout {
    Layout::new(DataType::F32, Tensor::bfyx(b, f, y, x))
}

fn filled(layout: Layout, value: f32) -> Memory {
    Memory::from_data(layout, &vec![value; layout.count()]).unwrap()
}

fn backend() -> Arc<CpuBackend> {
    Arc::new(CpuBackend::new())
}

fn run(program: Program, inputs: &[(&str, Memory)], output: &str) -> Vec<f32> {
    let mut network = Network::new(Arc::new(program)).unwrap();
    for (id, memory) in inputs {
        network.set_input_data(id, memory.clone()).unwrap();
    }
    network.execute().unwrap();
    let result = network.get_output(output).unwrap();
    result.event.wait();
    result.memory.to_f32_vec().unwrap()
}

/// `in [1,3,8,8]` convolved by `w [8,3,3,3]` plus bias `b [8]`.
fn conv_topology() -> Topology {
    Topology::new()
        .with(Primitive::input_layout("in", f32_layout(1, 3, 8, 8)))
        .unwrap()
        .with(Primitive::data("w", filled(f32_layout(8, 3, 3, 3), 1.0)))
        .unwrap()
        .with(Primitive::data("b", filled(f32_layout(1, 1, 1, 8), 0.5)))
        .unwrap()
        .with(Primitive::convolution(
            "conv",
            "in",
            ConvolutionDesc::new(["w"], ["b"]).with_stride(Tensor::spatial_xy(1, 1)),
        ))
        .unwrap()
}

// =============================================================================
// Scenario 1: Convolution Shape
// =============================================================================

#[test]
fn test_convolution_output_shape() {
    init_tracing();
    let program = Program::build(&conv_topology(), backend(), BuildOptions::new()).unwrap();

    let layout = program.output_layout_of("conv").unwrap();
    assert_eq!(layout.size, Tensor::bfyx(1, 8, 6, 6));
    assert_eq!(layout.format(), Format::Bfyx);
    assert_eq!(layout.data_type, DataType::F32);
}

#[test]
fn test_convolution_executes() {
    init_tracing();
    for optimize in [false, true] {
        let options = BuildOptions::new().optimize_data(optimize);
        let program = Program::build(&conv_topology(), backend(), options).unwrap();
        let values = run(program, &[("in", filled(f32_layout(1, 3, 8, 8), 1.0))], "conv");

        assert_eq!(values.len(), 8 * 6 * 6);
        assert!(values.iter().all(|&v| (v - 27.5).abs() < 1e-5));
    }
}

// =============================================================================
// Scenario 2: Data-Only Branch
// =============================================================================

#[test]
fn test_constant_branch_without_runtime_user_is_not_folded() {
    init_tracing();
    let topology = Topology::new()
        .with(Primitive::input_layout("in", f32_layout(1, 2, 4, 4)))
        .unwrap()
        .with(Primitive::pooling(
            "pool",
            "in",
            PoolingDesc::new(PoolingMode::Max, Tensor::spatial_xy(2, 2), Tensor::spatial_xy(2, 2)),
        ))
        .unwrap()
        .with(Primitive::data("d", filled(f32_layout(1, 2, 2, 2), 1.0)))
        .unwrap()
        .with(Primitive::reorder("r", "d", ReorderDesc::new(Format::Yxfb, DataType::F32)))
        .unwrap();

    let options = BuildOptions::new().optimize_data(true);
    let program = Program::build(&topology, backend(), options).unwrap();

    assert_eq!(program.stats().constants_folded, 0);
    assert!(program.get_node("r").is_none());
    assert!(program.optimized_out().iter().any(|id| id == "r"));
    assert_eq!(program.processing_order_ids(), vec!["in", "pool"]);
}

#[test]
fn test_constant_branch_with_runtime_user_is_folded() {
    init_tracing();
    let window = || PoolingDesc::new(PoolingMode::Max, Tensor::spatial_xy(2, 2), Tensor::spatial_xy(2, 2));
    let d_layout = f32_layout(1, 2, 2, 2);
    let topology = Topology::new()
        .with(Primitive::input_layout("in", f32_layout(1, 1, 2, 2)))
        .unwrap()
        .with(Primitive::pooling("ip", "in", window()))
        .unwrap()
        .with(Primitive::data(
            "d",
            Memory::from_data(d_layout, &[1.0f32, 5.0, 2.0, 3.0, 4.0, 0.0, 8.0, 6.0]).unwrap(),
        ))
        .unwrap()
        .with(Primitive::pooling("dp", "d", window()))
        .unwrap()
        .with(Primitive::depth_concatenate("cat", ["ip", "dp"]))
        .unwrap();

    let options = BuildOptions::new().optimize_data(true);
    let program = Program::build(&topology, backend(), options).unwrap();

    assert_eq!(program.stats().constants_folded, 1);
    assert_eq!(program.get_node("dp").unwrap().kind(), PrimitiveType::Data);
    assert!(program.get_node("d").is_none());

    let input = Memory::from_data(f32_layout(1, 1, 2, 2), &[0.5f32, 9.0, 1.0, 2.0]).unwrap();
    assert_eq!(run(program, &[("in", input)], "cat"), vec![9.0, 5.0, 8.0]);
}

// =============================================================================
// Scenario 3: Shared Weights Reorder
// =============================================================================

#[test]
fn test_shared_weights_share_one_reorder() {
    init_tracing();
    let topology = conv_topology()
        .with(Primitive::convolution("conv2", "in", ConvolutionDesc::new(["w"], ["b"])))
        .unwrap();

    let options = BuildOptions::new().optimize_data(true);
    let program = Program::build(&topology, backend(), options).unwrap();

    let conv = program.get_node("conv").unwrap();
    let conv2 = program.get_node("conv2").unwrap();
    assert_eq!(conv.dependencies()[1], conv2.dependencies()[1]);

    let weights = program.node(conv.dependencies()[1]);
    assert_eq!(weights.primitive_id(), "reorder_0_w");
    assert_eq!(weights.users().len(), 2);
    assert_eq!(program.output_layout_of("reorder_0_w").unwrap().format(), Format::OsIyxOsv16);
    assert!(program.get_node("w").is_none());
    assert_eq!(program.stats().reorders_inserted, 1);

    let mut network = Network::new(Arc::new(program)).unwrap();
    network.set_input_data("in", filled(f32_layout(1, 3, 8, 8), 1.0)).unwrap();
    network.execute().unwrap();
    let first = network.get_output("conv").unwrap().memory.to_f32_vec().unwrap();
    let second = network.get_output("conv2").unwrap().memory.to_f32_vec().unwrap();
    assert_eq!(first, second);
}

// =============================================================================
// Scenario 4: Input Layout Mismatch
// =============================================================================

#[test]
fn test_set_input_data_rejects_other_layout() {
    init_tracing();
    let program = Program::build(&conv_topology(), backend(), BuildOptions::new()).unwrap();
    let mut network = Network::new(Arc::new(program)).unwrap();
    let before = network.primitive_memory("in").unwrap().clone();

    let result = network.set_input_data("in", filled(f32_layout(1, 3, 4, 4), 1.0));

    assert!(matches!(result, Err(Error::LayoutMismatch { .. })));
    assert_eq!(network.state(), ExecutionState::Built);
    assert!(network.primitive_memory("in").unwrap().is_same_buffer(&before));
}

// =============================================================================
// Scenario 5: Unresolved Reference
// =============================================================================

#[test]
fn test_missing_dependency_fails_build() {
    init_tracing();
    let topology = Topology::new()
        .with(Primitive::input_layout("in", f32_layout(1, 3, 8, 8)))
        .unwrap()
        .with(Primitive::convolution("conv", "in", ConvolutionDesc::new(["missing"], Vec::<&str>::new())))
        .unwrap();

    let error = Program::build(&topology, backend(), BuildOptions::new()).unwrap_err();
    assert_eq!(error, Error::unresolved_reference("missing", "conv"));
}

// =============================================================================
// Padding Preparation
// =============================================================================

#[test]
fn test_same_convolution_pads_input_through_reorder() {
    init_tracing();
    let topology = Topology::new()
        .with(Primitive::input_layout("in", f32_layout(1, 1, 3, 3)))
        .unwrap()
        .with(Primitive::data("w", filled(f32_layout(1, 1, 3, 3), 1.0)))
        .unwrap()
        .with(Primitive::convolution(
            "conv",
            "in",
            ConvolutionDesc::new(["w"], Vec::<&str>::new()).with_input_offset(Tensor::spatial_xy(-1, -1)),
        ))
        .unwrap();
    let input = Memory::from_data(f32_layout(1, 1, 3, 3), &[1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0]).unwrap();
    let expected = vec![12.0, 21.0, 16.0, 27.0, 45.0, 33.0, 24.0, 39.0, 28.0];

    let plain = Program::build(&topology, backend(), BuildOptions::new()).unwrap();
    assert!(plain.get_node("reorder_in").is_none());
    assert_eq!(run(plain, &[("in", input.clone())], "conv"), expected);

    let optimized = Program::build(&topology, backend(), BuildOptions::new().optimize_data(true)).unwrap();
    let reorder = optimized.get_node("reorder_in").unwrap();
    assert_eq!(optimized.get_node("conv").unwrap().dependencies()[0], reorder.id());
    let padding = optimized.output_layout_of("reorder_in").unwrap().padding;
    assert_eq!(padding.lower_size(), Tensor::bfyx(0, 0, 1, 1));
    assert_eq!(padding.upper_size(), Tensor::bfyx(0, 0, 1, 1));
    assert_eq!(run(optimized, &[("in", input)], "conv"), expected);
}
