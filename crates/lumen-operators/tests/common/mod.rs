//! Common test utilities for operator tests.
//!
//! Graph builders, kernel resolution through the core registry and host
//! emulations of the reference kernels for the recording device.

#![allow(dead_code)]

use lumen_core::{
    DataType, Graph, Kernel, KernelCtx, Node, TensorDesc, TensorShape, ValueInfo, ValueKind,
};
use lumen_operators::core_operator_registry;
use lumen_runtime::{ProgramManager, RecordingDevice};
use std::sync::Arc;

/// Create a graph applying `op_type` to inputs `a` (and `b` if `b_shape` is
/// given), producing output `c`.
pub fn make_elementwise_graph(
    op_type: &str,
    dtype: DataType,
    a_shape: &[usize],
    b_shape: Option<&[usize]>,
    out_shape: &[usize],
) -> Graph {
    let mut graph = Graph::new();
    graph.name = format!("{op_type}_test");

    let mut inputs = vec![graph.add_value(ValueInfo::new(
        "a",
        dtype,
        TensorShape::Static(a_shape.to_vec()),
        ValueKind::Input,
    ))];
    if let Some(b_shape) = b_shape {
        inputs.push(graph.add_value(ValueInfo::new(
            "b",
            dtype,
            TensorShape::Static(b_shape.to_vec()),
            ValueKind::Input,
        )));
    }
    let c = graph.add_value(ValueInfo::new(
        "c",
        dtype,
        TensorShape::Static(out_shape.to_vec()),
        ValueKind::Output,
    ));

    let mut node = Node::new(op_type);
    node.name = format!("{}_0", op_type.to_lowercase());
    node.inputs = inputs;
    node.outputs = vec![c];
    graph.add_node(node);
    graph
}

/// Resolve the kernel for a single `op_type` node with `inputs` inputs.
pub fn kernel_for(op_type: &str, inputs: usize) -> Box<dyn Kernel> {
    let shape = [1];
    let b_shape: Option<&[usize]> = (inputs == 2).then_some(&shape);
    let graph = make_elementwise_graph(op_type, DataType::F32, &shape, b_shape, &shape);
    let registry = core_operator_registry();
    let node = &graph.nodes[0];
    registry
        .resolve(node)
        .unwrap()
        .create_kernel(&KernelCtx::new(0, node, &graph))
        .unwrap()
}

pub fn program_manager() -> (Arc<RecordingDevice>, ProgramManager<RecordingDevice>) {
    let device = Arc::new(RecordingDevice::new());
    let programs = ProgramManager::new(Arc::clone(&device), 64, 65_535).unwrap();
    (device, programs)
}

pub fn f32_desc(shape: &[usize]) -> TensorDesc {
    TensorDesc::new(DataType::F32, shape)
}

fn read_u32(bytes: &[u8], index: usize) -> usize {
    bytemuck::pod_read_unaligned::<u32>(&bytes[index * 4..index * 4 + 4]) as usize
}

/// Host emulation of a binary kernel on the contiguous (modulo) path.
///
/// Uniform block: `output_size`, `a_size`, `b_size`.
pub fn host_binary(f: fn(f32, f32) -> f32) -> impl Fn(&[&[u8]], &mut [Vec<u8>], &[u8]) + Send + Sync {
    move |inputs, outputs, uniforms| {
        let (n, a_size, b_size) = (
            read_u32(uniforms, 0),
            read_u32(uniforms, 1),
            read_u32(uniforms, 2),
        );
        let a: Vec<f32> = bytemuck::pod_collect_to_vec(inputs[0]);
        let b: Vec<f32> = bytemuck::pod_collect_to_vec(inputs[1]);
        let y: Vec<f32> = (0..n).map(|i| f(a[i % a_size], b[i % b_size])).collect();
        outputs[0][..n * 4].copy_from_slice(bytemuck::cast_slice(&y));
    }
}

/// Host emulation of a unary kernel. Uniform block: `output_size`.
pub fn host_unary(f: fn(f32) -> f32) -> impl Fn(&[&[u8]], &mut [Vec<u8>], &[u8]) + Send + Sync {
    move |inputs, outputs, uniforms| {
        let n = read_u32(uniforms, 0);
        let x: Vec<f32> = bytemuck::pod_collect_to_vec(inputs[0]);
        let y: Vec<f32> = x[..n].iter().map(|&v| f(v)).collect();
        outputs[0][..n * 4].copy_from_slice(bytemuck::cast_slice(&y));
    }
}

/// Recording device emulating every f32 reference kernel.
pub fn host_device() -> RecordingDevice {
    RecordingDevice::new()
        .with_host_kernel("Add", host_binary(|a, b| a + b))
        .with_host_kernel("Sub", host_binary(|a, b| a - b))
        .with_host_kernel("Mul", host_binary(|a, b| a * b))
        .with_host_kernel("Div", host_binary(|a, b| a / b))
        .with_host_kernel("Neg", host_unary(|x| -x))
        .with_host_kernel("Abs", host_unary(f32::abs))
        .with_host_kernel("Relu", host_unary(|x| x.max(0.0)))
        .with_host_kernel("Sqrt", host_unary(f32::sqrt))
        .with_host_kernel("Exp", host_unary(f32::exp))
        .with_host_kernel("Sigmoid", host_unary(|x| 1.0 / (1.0 + (-x).exp())))
}
