//! In-memory computation graph consumed by the engine.
//!
//! The graph arrives already deserialized: nodes carry resolved attributes
//! and reference value slots by index. Nothing here knows about the GPU.

use crate::types::{DataType, TensorDesc, TensorShape};
use crate::{Error, Result};
use std::collections::HashMap;

/// Index of a node in [`Graph::nodes`].
pub type NodeId = usize;

/// Index of a value slot in [`Graph::values`].
pub type SlotId = usize;

/// Default operator domain.
pub const DEFAULT_DOMAIN: &str = "";

/// Role of a value slot in the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    /// Supplied by the caller on every run.
    Input,

    /// Materialized host data, uploaded once per session.
    Constant,

    /// Produced and consumed inside the graph.
    Intermediate,

    /// Produced inside the graph and returned to the caller.
    Output,
}

/// Metadata for a value slot (a graph edge).
#[derive(Debug, Clone)]
pub struct ValueInfo {
    /// Slot name (graph inputs and outputs are addressed by name).
    pub name: String,

    /// Declared element type.
    pub dtype: DataType,

    /// Declared shape.
    pub shape: TensorShape,

    /// Role of the slot.
    pub kind: ValueKind,

    /// Host data for constants.
    pub initializer: Option<Vec<u8>>,
}

impl ValueInfo {
    /// Create a non-constant value slot.
    pub fn new(name: &str, dtype: DataType, shape: TensorShape, kind: ValueKind) -> Self {
        Self {
            name: name.to_string(),
            dtype,
            shape,
            kind,
            initializer: None,
        }
    }

    /// Create a constant slot with static shape and host data.
    pub fn constant(name: &str, dtype: DataType, shape: &[usize], data: Vec<u8>) -> Self {
        Self {
            name: name.to_string(),
            dtype,
            shape: TensorShape::Static(shape.to_vec()),
            kind: ValueKind::Constant,
            initializer: Some(data),
        }
    }

    /// Check that a concrete tensor matches this slot's declaration.
    pub fn check(&self, desc: &TensorDesc) -> Result<()> {
        if desc.dtype != self.dtype || !self.shape.accepts(&desc.shape) {
            return Err(Error::Shape(format!(
                "value '{}' declared as {} {:?}, got {}",
                self.name, self.dtype, self.shape, desc
            )));
        }
        Ok(())
    }
}

/// Resolved attribute value.
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeValue {
    Int(i64),
    Float(f32),
    String(String),
    Ints(Vec<i64>),
    Floats(Vec<f32>),
}

/// A single operator invocation in the graph.
#[derive(Debug, Clone)]
pub struct Node {
    /// Node name (unique within the graph, used in diagnostics).
    pub name: String,

    /// Operator type (e.g., "Add", "MatMul").
    pub op_type: String,

    /// Operator domain ("" for the default domain).
    pub domain: String,

    /// Operator set version the node was exported with.
    pub since_version: u32,

    /// Resolved attributes.
    pub attributes: HashMap<String, AttributeValue>,

    /// Ordered input slots.
    pub inputs: Vec<SlotId>,

    /// Ordered output slots.
    pub outputs: Vec<SlotId>,

    /// Folded-away no-op: output 0 aliases input 0 under its declared shape.
    pub noop: bool,
}

impl Node {
    /// Create a node in the default domain at opset 13.
    pub fn new(op_type: &str) -> Self {
        Self {
            name: String::new(),
            op_type: op_type.to_string(),
            domain: DEFAULT_DOMAIN.to_string(),
            since_version: 13,
            attributes: HashMap::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            noop: false,
        }
    }

    /// Get a node attribute by name.
    pub fn attr(&self, name: &str) -> Option<&AttributeValue> {
        self.attributes.get(name)
    }
}

/// Computation graph: nodes, value slots, and the graph's inputs and outputs.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    /// Graph name.
    pub name: String,

    /// All nodes, in arbitrary order.
    pub nodes: Vec<Node>,

    /// All value slots.
    pub values: Vec<ValueInfo>,

    /// Slot lookup by name.
    pub value_ids: HashMap<String, SlotId>,

    /// Ordered graph input slots.
    pub inputs: Vec<SlotId>,

    /// Ordered graph output slots.
    pub outputs: Vec<SlotId>,
}

impl Graph {
    /// Create a new empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a value slot, returning its id.
    ///
    /// Input and output slots are appended to the graph's input/output lists.
    pub fn add_value(&mut self, info: ValueInfo) -> SlotId {
        let id = self.values.len();
        match info.kind {
            ValueKind::Input => self.inputs.push(id),
            ValueKind::Output => self.outputs.push(id),
            ValueKind::Constant | ValueKind::Intermediate => {}
        }
        self.value_ids.insert(info.name.clone(), id);
        self.values.push(info);
        id
    }

    /// Add a node, returning its id.
    pub fn add_node(&mut self, node: Node) -> NodeId {
        let id = self.nodes.len();
        self.nodes.push(node);
        id
    }

    /// Get value metadata by id.
    pub fn value(&self, id: SlotId) -> Result<&ValueInfo> {
        self.values
            .get(id)
            .ok_or_else(|| Error::InvalidGraph(format!("Invalid value slot ID: {id}")))
    }

    /// Get a value slot id by name.
    pub fn value_id(&self, name: &str) -> Result<SlotId> {
        self.value_ids
            .get(name)
            .copied()
            .ok_or_else(|| Error::InvalidGraph(format!("Value '{name}' not found")))
    }

    /// Get a node by id.
    pub fn node(&self, id: NodeId) -> Result<&Node> {
        self.nodes
            .get(id)
            .ok_or_else(|| Error::InvalidGraph(format!("Invalid node ID: {id}")))
    }

    /// Validate slot references and single-producer structure.
    ///
    /// Returns the producing node of every slot (`None` for graph inputs and
    /// constants). Cycles are detected later by the planner's sort.
    pub fn validate(&self) -> Result<Vec<Option<NodeId>>> {
        let mut producers: Vec<Option<NodeId>> = vec![None; self.values.len()];

        for &id in self.inputs.iter().chain(&self.outputs) {
            self.value(id)?;
        }

        for (node_id, node) in self.nodes.iter().enumerate() {
            for &input in &node.inputs {
                self.value(input).map_err(|_| {
                    Error::InvalidGraph(format!(
                        "Node '{}' reads dangling value slot {input}",
                        node.name
                    ))
                })?;
            }
            if node.noop && (node.inputs.is_empty() || node.outputs.len() != 1) {
                return Err(Error::InvalidGraph(format!(
                    "No-op node '{}' must have at least one input and exactly one output",
                    node.name
                )));
            }
            for &output in &node.outputs {
                let info = self.value(output).map_err(|_| {
                    Error::InvalidGraph(format!(
                        "Node '{}' writes dangling value slot {output}",
                        node.name
                    ))
                })?;
                if matches!(info.kind, ValueKind::Input | ValueKind::Constant) {
                    return Err(Error::InvalidGraph(format!(
                        "Node '{}' writes to {:?} value '{}'",
                        node.name, info.kind, info.name
                    )));
                }
                if let Some(previous) = producers[output] {
                    return Err(Error::InvalidGraph(format!(
                        "Value '{}' is produced by both '{}' and '{}'",
                        info.name, self.nodes[previous].name, node.name
                    )));
                }
                producers[output] = Some(node_id);
            }
        }

        // Every non-input, non-constant slot that is read must have a producer
        for node in &self.nodes {
            for &input in &node.inputs {
                let info = &self.values[input];
                let sourced = matches!(info.kind, ValueKind::Input | ValueKind::Constant);
                if !sourced && producers[input].is_none() {
                    return Err(Error::InvalidGraph(format!(
                        "Value '{}' read by '{}' has no producer",
                        info.name, node.name
                    )));
                }
                if info.kind == ValueKind::Constant && info.initializer.is_none() {
                    return Err(Error::InvalidGraph(format!(
                        "Constant '{}' has no initializer data",
                        info.name
                    )));
                }
            }
        }

        Ok(producers)
    }
}
