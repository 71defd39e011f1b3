//! Properties every build and every layout computation must hold.
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use std::sync::Arc;

use nexgraph::core::MemoryPool;
use nexgraph::prelude::*;
use nexgraph::program::{calc_output_layout, DataRole, LayoutOptimizer};
use nexgraph::PrimitiveId;
use rustc_hash::FxHashSet;

// =============================================================================
// Test Helpers
// =============================================================================

fn f32_layout(b: i32, f: i32, y: i32, x: i32) -> Layout {
    Layout::new(DataType::F32, Tensor::bfyx(b, f, y, x))
}

fn pooling(stride: i32) -> Primitive {
    Primitive::pooling(
        "pool",
        "in",
        PoolingDesc::new(PoolingMode::Average, Tensor::spatial_xy(3, 3), Tensor::spatial_xy(stride, stride)),
    )
}

fn conflicts(ids: &[&str]) -> FxHashSet<PrimitiveId> {
    ids.iter().map(|id| (*id).to_string()).collect()
}

// =============================================================================
// Shape Inference
// =============================================================================

#[test]
fn test_shape_inference_is_deterministic() {
    let inputs = [f32_layout(2, 4, 17, 13)];
    let first = calc_output_layout(&pooling(2), &inputs).unwrap();
    let second = calc_output_layout(&pooling(2), &inputs).unwrap();
    assert_eq!(first, second);

    let topology = Topology::new()
        .with(Primitive::input_layout("in", inputs[0]))
        .unwrap()
        .with(pooling(2))
        .unwrap();
    let backend: Arc<dyn ComputeBackend> = Arc::new(CpuBackend::new());
    let a = Program::build(&topology, Arc::clone(&backend), BuildOptions::new()).unwrap();
    let b = Program::build(&topology, backend, BuildOptions::new()).unwrap();
    assert_eq!(a.output_layout_of("pool"), b.output_layout_of("pool"));
    assert_eq!(a.output_layout_of("pool"), Some(first));
}

#[test]
fn test_transform_round_trip() {
    let tensor = Tensor::bfyx(2, 3, 4, 5);
    for format in [Format::Yxfb, Format::Byxf, Format::Fyxb, Format::OsIyxOsv16] {
        let there = tensor.transform(format, 1).unwrap();
        assert_eq!(there.transform(Format::Bfyx, 1).unwrap(), tensor);
        assert_eq!(there.count(), tensor.count());
    }
}

// =============================================================================
// Padding
// =============================================================================

#[test]
fn test_padding_max_is_an_upper_bound() {
    let a = Padding::new(Tensor::bfyx(0, 0, 1, 2), Tensor::bfyx(0, 0, 3, 0), 0.0);
    let b = Padding::new(Tensor::bfyx(0, 0, 2, 1), Tensor::bfyx(0, 0, 1, 1), 0.0);

    let merged = Padding::max(&a, &b);
    assert_eq!(merged, Padding::max(&b, &a));
    assert_eq!(Padding::max(&merged, &merged), merged);
    assert!(merged.covers(&a));
    assert!(merged.covers(&b));
    assert_eq!(merged.lower_size(), Tensor::bfyx(0, 0, 2, 2));
    assert_eq!(merged.upper_size(), Tensor::bfyx(0, 0, 3, 1));
}

// =============================================================================
// Reorder Deduplication
// =============================================================================

#[test]
fn test_reorder_requests_are_deduplicated() {
    let mut optimizer = LayoutOptimizer::new();
    let weights = f32_layout(8, 3, 3, 3);
    let output = f32_layout(1, 8, 6, 6);
    let first_user = Primitive::convolution("c1", "in", ConvolutionDesc::new(["w"], Vec::<&str>::new()));
    let second_user = Primitive::convolution("c2", "in", ConvolutionDesc::new(["w"], Vec::<&str>::new()));

    let first = optimizer
        .get_reorder(&weights, "w", DataRole::Weights, &first_user, &output)
        .unwrap()
        .unwrap();
    let second = optimizer
        .get_reorder(&weights, "w", DataRole::Weights, &second_user, &output)
        .unwrap()
        .unwrap();

    assert!(!first.cached);
    assert!(second.cached);
    assert!(Arc::ptr_eq(&first.primitive, &second.primitive));
    assert_eq!(optimizer.reorder_count(), 1);
}

// =============================================================================
// Memory Pool
// =============================================================================

#[test]
fn test_pool_never_aliases_conflicting_ids() {
    let pool = MemoryPool::new(Arc::new(CpuBackend::new()));
    let layout = f32_layout(1, 4, 8, 8);

    let a = pool.get_memory(&layout, "a", &conflicts(&[]), true).unwrap();
    let b = pool.get_memory(&layout, "b", &conflicts(&["a"]), true).unwrap();
    let c = pool.get_memory(&layout, "c", &conflicts(&["b"]), true).unwrap();
    let d = pool.get_memory(&layout, "d", &conflicts(&["a", "b", "c"]), true).unwrap();

    assert!(!a.is_same_buffer(&b));
    assert!(c.is_same_buffer(&a));
    assert!(!d.is_same_buffer(&a));
    assert!(!d.is_same_buffer(&b));
}

// =============================================================================
// Topology
// =============================================================================

#[test]
fn test_topology_redefinition() {
    let mut topology = Topology::new();
    topology.add(Primitive::input_layout("in", f32_layout(1, 1, 8, 8))).unwrap();
    topology.add(pooling(1)).unwrap();
    topology.add(pooling(1)).unwrap();
    assert_eq!(topology.len(), 2);

    let error = topology.add(pooling(2)).unwrap_err();
    assert_eq!(error, Error::duplicate_definition("pool"));
    assert_eq!(topology.get("pool").map(|p| p.as_ref().clone()), Some(pooling(1)));
}
