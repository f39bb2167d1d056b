//! Shared graph builders and host kernels for backend tests.

#![allow(dead_code)]

use lumen_core::{DataType, Graph, Node, NodeId, SlotId, TensorShape, ValueInfo, ValueKind};
use lumen_operators::core_operator_registry;
use lumen_runtime::{Backend, BackendConfig, RecordingDevice, SessionId, Tensor};
use std::sync::Arc;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_target(false)
        .with_test_writer()
        .try_init();
}

fn read_u32(bytes: &[u8], index: usize) -> usize {
    bytemuck::pod_read_unaligned::<u32>(&bytes[index * 4..index * 4 + 4]) as usize
}

/// Host emulation of a binary kernel on the contiguous (modulo) path.
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

/// Host emulation of a unary kernel.
pub fn host_unary(f: fn(f32) -> f32) -> impl Fn(&[&[u8]], &mut [Vec<u8>], &[u8]) + Send + Sync {
    move |inputs, outputs, uniforms| {
        let n = read_u32(uniforms, 0);
        let x: Vec<f32> = bytemuck::pod_collect_to_vec(inputs[0]);
        let y: Vec<f32> = x[..n].iter().map(|&v| f(v)).collect();
        outputs[0][..n * 4].copy_from_slice(bytemuck::cast_slice(&y));
    }
}

pub fn host_device() -> RecordingDevice {
    RecordingDevice::new()
        .with_host_kernel("Add", host_binary(|a, b| a + b))
        .with_host_kernel("Mul", host_binary(|a, b| a * b))
        .with_host_kernel("Neg", host_unary(|x| -x))
        .with_host_kernel("Relu", host_unary(|x| x.max(0.0)))
}

/// Backend on a host-emulating recording device, keeping a handle to the device.
pub fn recording_backend(config: BackendConfig) -> (Arc<RecordingDevice>, Backend<RecordingDevice>) {
    init_tracing();
    let device = Arc::new(host_device());
    let backend = Backend::new(Arc::clone(&device), config).unwrap();
    (device, backend)
}

pub fn load(backend: &mut Backend<RecordingDevice>, graph: Graph) -> SessionId {
    backend.load_session(graph, &core_operator_registry()).unwrap()
}

pub fn f32s(values: &[f32], shape: &[usize]) -> Tensor {
    Tensor::from_vec(values.to_vec(), shape).unwrap()
}

pub fn value(graph: &mut Graph, name: &str, shape: &[usize], kind: ValueKind) -> SlotId {
    graph.add_value(ValueInfo::new(
        name,
        DataType::F32,
        TensorShape::Static(shape.to_vec()),
        kind,
    ))
}

pub fn constant(graph: &mut Graph, name: &str, shape: &[usize], values: &[f32]) -> SlotId {
    graph.add_value(ValueInfo::constant(
        name,
        DataType::F32,
        shape,
        bytemuck::cast_slice(values).to_vec(),
    ))
}

pub fn op(graph: &mut Graph, op_type: &str, name: &str, inputs: &[SlotId], outputs: &[SlotId]) -> NodeId {
    let mut node = Node::new(op_type);
    node.name = name.to_string();
    node.inputs = inputs.to_vec();
    node.outputs = outputs.to_vec();
    graph.add_node(node)
}

/// `y = x * 2 + 1` over `x: f32[3]`, with both scalars as constants.
pub fn chain_graph() -> Graph {
    let mut graph = Graph::new();
    graph.name = "chain".to_string();
    let x = value(&mut graph, "x", &[3], ValueKind::Input);
    let two = constant(&mut graph, "two", &[1], &[2.0]);
    let one = constant(&mut graph, "one", &[1], &[1.0]);
    let doubled = value(&mut graph, "doubled", &[3], ValueKind::Intermediate);
    let y = value(&mut graph, "y", &[3], ValueKind::Output);
    op(&mut graph, "Mul", "double", &[x, two], &[doubled]);
    op(&mut graph, "Add", "increment", &[doubled, one], &[y]);
    graph
}

/// `y = neg(x) + relu(x)` over `x: f32[4]`.
pub fn diamond_graph() -> Graph {
    let mut graph = Graph::new();
    graph.name = "diamond".to_string();
    let x = value(&mut graph, "x", &[4], ValueKind::Input);
    let left = value(&mut graph, "left", &[4], ValueKind::Intermediate);
    let right = value(&mut graph, "right", &[4], ValueKind::Intermediate);
    let y = value(&mut graph, "y", &[4], ValueKind::Output);
    // Declared join-first to make sure order comes from the data flow
    op(&mut graph, "Add", "join", &[left, right], &[y]);
    op(&mut graph, "Neg", "left", &[x], &[left]);
    op(&mut graph, "Relu", "right", &[x], &[right]);
    graph
}
