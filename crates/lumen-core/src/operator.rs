//! Operator trait: resolves a graph node to its kernel once at load time.

use crate::graph::{AttributeValue, Graph, Node, NodeId};
use crate::kernel::Kernel;
use crate::types::TensorDesc;
use crate::{Error, Result};

/// Load-time context passed to [`Operator::create_kernel`].
///
/// Provides access to node attributes and constant inputs. Runtime shapes
/// are not known here; kernels see them through [`Kernel::run_data`].
pub struct KernelCtx<'a> {
    /// The node being resolved.
    pub node: &'a Node,

    /// The node ID in the graph.
    pub node_id: NodeId,

    /// The full graph (for constant inputs).
    pub graph: &'a Graph,
}

impl<'a> KernelCtx<'a> {
    pub fn new(node_id: NodeId, node: &'a Node, graph: &'a Graph) -> Self {
        Self {
            node,
            node_id,
            graph,
        }
    }

    pub fn input_count(&self) -> usize {
        self.node.inputs.len()
    }

    pub fn output_count(&self) -> usize {
        self.node.outputs.len()
    }

    /// Host data and descriptor of a constant input, if the input is constant.
    pub fn constant_input(&self, index: usize) -> Result<Option<(TensorDesc, &[u8])>> {
        let slot = self.node.inputs.get(index).ok_or_else(|| {
            Error::InvalidGraph(format!(
                "Input index {index} out of range (node '{}' has {} inputs)",
                self.node.name,
                self.node.inputs.len()
            ))
        })?;
        let info = self.graph.value(*slot)?;
        match (&info.initializer, info.shape.as_static()) {
            (Some(data), Some(dims)) => Ok(Some((TensorDesc::new(info.dtype, dims), data))),
            _ => Ok(None),
        }
    }

    pub fn attr(&self, name: &str) -> Option<&AttributeValue> {
        self.node.attr(name)
    }

    /// Get a required i64 attribute.
    pub fn attr_i64(&self, name: &str) -> Result<i64> {
        match self.attr(name) {
            Some(AttributeValue::Int(v)) => Ok(*v),
            _ => Err(Error::Attribute(format!(
                "Missing required i64 attribute '{name}' on '{}'",
                self.node.name
            ))),
        }
    }

    /// Get an optional i64 attribute with a default value.
    pub fn attr_i64_or(&self, name: &str, default: i64) -> i64 {
        self.attr_i64(name).unwrap_or(default)
    }

    /// Get a required f32 attribute.
    pub fn attr_f32(&self, name: &str) -> Result<f32> {
        match self.attr(name) {
            Some(AttributeValue::Float(v)) => Ok(*v),
            _ => Err(Error::Attribute(format!(
                "Missing required f32 attribute '{name}' on '{}'",
                self.node.name
            ))),
        }
    }

    /// Get an optional f32 attribute with a default value.
    pub fn attr_f32_or(&self, name: &str, default: f32) -> f32 {
        self.attr_f32(name).unwrap_or(default)
    }

    /// Get a required string attribute.
    pub fn attr_string(&self, name: &str) -> Result<&str> {
        match self.attr(name) {
            Some(AttributeValue::String(v)) => Ok(v.as_str()),
            _ => Err(Error::Attribute(format!(
                "Missing required string attribute '{name}' on '{}'",
                self.node.name
            ))),
        }
    }
}

/// Load-time kernel factory for one operator type.
///
/// # Example
///
/// ```ignore
/// struct NegOperator;
///
/// impl Operator for NegOperator {
///     fn name(&self) -> &str {
///         "Neg"
///     }
///
///     fn create_kernel(&self, ctx: &KernelCtx) -> Result<Box<dyn Kernel>> {
///         Ok(Box::new(NegKernel))
///     }
/// }
/// ```
pub trait Operator: Send + Sync {
    /// Operator type name (e.g., "Add").
    fn name(&self) -> &str;

    /// Build the kernel for one node, reading its attributes.
    fn create_kernel(&self, ctx: &KernelCtx) -> Result<Box<dyn Kernel>>;
}
