//! The demo graph used by `lumen bench`.
//!
//! `y = sigmoid(relu(x * scale + bias))` over `x: f32[rows, cols]`, with
//! `scale` and `bias` as random per-column constants.

use lumen_core::{DataType, Graph, Node, SlotId, TensorShape, ValueInfo, ValueKind};
use rand::rngs::StdRng;
use rand::Rng;

/// Shape of the demo input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DemoShape {
    pub rows: usize,
    pub cols: usize,
}

impl DemoShape {
    pub fn dims(&self) -> [usize; 2] {
        [self.rows, self.cols]
    }

    pub fn len(&self) -> usize {
        self.rows * self.cols
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Build the demo graph with constants drawn from `rng`.
pub fn demo_graph(shape: DemoShape, rng: &mut StdRng) -> Graph {
    let mut graph = Graph::new();
    graph.name = format!("demo_{}x{}", shape.rows, shape.cols);

    let x = graph.add_value(ValueInfo::new(
        "x",
        DataType::F32,
        TensorShape::Static(shape.dims().to_vec()),
        ValueKind::Input,
    ));
    let scale: Vec<f32> = (0..shape.cols).map(|_| rng.gen_range(0.5..2.0)).collect();
    let bias: Vec<f32> = (0..shape.cols).map(|_| rng.gen_range(-1.0..1.0)).collect();
    let scale = graph.add_value(ValueInfo::constant(
        "scale",
        DataType::F32,
        &[shape.cols],
        bytemuck::cast_slice(&scale).to_vec(),
    ));
    let bias = graph.add_value(ValueInfo::constant(
        "bias",
        DataType::F32,
        &[shape.cols],
        bytemuck::cast_slice(&bias).to_vec(),
    ));

    let mut intermediate = |name: &str| {
        graph.add_value(ValueInfo::new(
            name,
            DataType::F32,
            TensorShape::Static(shape.dims().to_vec()),
            ValueKind::Intermediate,
        ))
    };
    let scaled = intermediate("scaled");
    let shifted = intermediate("shifted");
    let activated = intermediate("activated");
    let y = graph.add_value(ValueInfo::new(
        "y",
        DataType::F32,
        TensorShape::Static(shape.dims().to_vec()),
        ValueKind::Output,
    ));

    add_node(&mut graph, "Mul", "scale", &[x, scale], scaled);
    add_node(&mut graph, "Add", "shift", &[scaled, bias], shifted);
    add_node(&mut graph, "Relu", "relu", &[shifted], activated);
    add_node(&mut graph, "Sigmoid", "sigmoid", &[activated], y);
    graph
}

fn add_node(graph: &mut Graph, op_type: &str, name: &str, inputs: &[SlotId], output: SlotId) {
    let mut node = Node::new(op_type);
    node.name = name.to_string();
    node.inputs = inputs.to_vec();
    node.outputs = vec![output];
    graph.add_node(node);
}

/// Random input data for the demo graph.
pub fn demo_input(shape: DemoShape, rng: &mut StdRng) -> Vec<f32> {
    (0..shape.len()).map(|_| rng.gen_range(-4.0..4.0)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_demo_graph_is_valid() {
        let mut rng = StdRng::seed_from_u64(7);
        let graph = demo_graph(DemoShape { rows: 4, cols: 8 }, &mut rng);

        assert!(graph.validate().is_ok());
        assert_eq!(graph.nodes.len(), 4);
        assert_eq!(graph.inputs.len(), 1);
        assert_eq!(graph.outputs.len(), 1);
        let scale = graph.value(graph.value_id("scale").unwrap()).unwrap();
        assert_eq!(scale.initializer.as_ref().map(Vec::len), Some(32));
    }

    #[test]
    fn test_same_seed_same_constants() {
        let shape = DemoShape { rows: 2, cols: 3 };
        let a = demo_graph(shape, &mut StdRng::seed_from_u64(1));
        let b = demo_graph(shape, &mut StdRng::seed_from_u64(1));
        let bias = |g: &Graph| g.values[g.value_id("bias").unwrap()].initializer.clone();
        assert_eq!(bias(&a), bias(&b));
    }
}
