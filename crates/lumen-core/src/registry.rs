//! Operator registry for load-time kernel resolution.

use crate::graph::{Node, DEFAULT_DOMAIN};
use crate::operator::Operator;
use crate::{Error, Result};
use std::collections::HashMap;
use std::ops::RangeInclusive;

struct Registration {
    versions: RangeInclusive<u32>,
    operator: Box<dyn Operator>,
}

/// Registry for operator implementations.
///
/// Maps (domain, operator type, opset version range) to an [`Operator`].
/// Each graph node is resolved once when a session is loaded.
///
/// # Example
///
/// ```ignore
/// let mut registry = OperatorRegistry::new();
/// registry.register("Add", AddOperator);
/// registry.register_versioned("com.example", "Gelu", 1..=1, GeluOperator);
///
/// let op = registry.resolve(&node)?;
/// ```
pub struct OperatorRegistry {
    operators: HashMap<(String, String), Vec<Registration>>,
}

impl OperatorRegistry {
    pub fn new() -> Self {
        Self {
            operators: HashMap::new(),
        }
    }

    /// Register an operator in the default domain for every opset version.
    ///
    /// Returns `self` for method chaining.
    pub fn register<O>(&mut self, name: &str, operator: O) -> &mut Self
    where
        O: Operator + 'static,
    {
        self.register_versioned(DEFAULT_DOMAIN, name, 1..=u32::MAX, operator)
    }

    /// Register an operator for a domain and an inclusive opset range.
    pub fn register_versioned<O>(
        &mut self,
        domain: &str,
        name: &str,
        versions: RangeInclusive<u32>,
        operator: O,
    ) -> &mut Self
    where
        O: Operator + 'static,
    {
        self.operators
            .entry((domain.to_string(), name.to_string()))
            .or_default()
            .push(Registration {
                versions,
                operator: Box::new(operator),
            });
        self
    }

    /// Look up an operator by domain, name and version.
    ///
    /// When ranges overlap the most recent registration wins.
    pub fn get(&self, domain: &str, name: &str, version: u32) -> Option<&dyn Operator> {
        self.operators
            .get(&(domain.to_string(), name.to_string()))?
            .iter()
            .rev()
            .find(|r| r.versions.contains(&version))
            .map(|r| r.operator.as_ref())
    }

    /// Resolve the operator for a graph node.
    pub fn resolve(&self, node: &Node) -> Result<&dyn Operator> {
        self.get(&node.domain, &node.op_type, node.since_version)
            .ok_or_else(|| {
                let domain = if node.domain.is_empty() {
                    "ai.onnx"
                } else {
                    node.domain.as_str()
                };
                Error::Unsupported(format!(
                    "No kernel for {domain}::{} (opset {}) used by node '{}'",
                    node.op_type, node.since_version, node.name
                ))
            })
    }

    /// Check if an operator is registered in the default domain.
    pub fn contains(&self, name: &str) -> bool {
        self.operators
            .contains_key(&(DEFAULT_DOMAIN.to_string(), name.to_string()))
    }

    /// Number of registered (domain, name) pairs.
    pub fn len(&self) -> usize {
        self.operators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operators.is_empty()
    }

    /// Iterate over all registered operator names.
    pub fn operator_names(&self) -> impl Iterator<Item = &str> {
        self.operators.keys().map(|(_, name)| name.as_str())
    }
}

impl Default for OperatorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Kernel, KernelCtx};

    struct MockOp(&'static str);
    impl Operator for MockOp {
        fn name(&self) -> &str {
            self.0
        }
        fn create_kernel(&self, _ctx: &KernelCtx) -> Result<Box<dyn Kernel>> {
            Err(Error::Unsupported("mock operator for testing".to_string()))
        }
    }

    #[test]
    fn test_register_and_get() {
        let mut registry = OperatorRegistry::new();
        registry.register("Add", MockOp("Add")).register("Mul", MockOp("Mul"));

        assert_eq!(registry.len(), 2);
        assert!(registry.contains("Add"));
        assert!(!registry.contains("Sub"));
        assert_eq!(registry.get("", "Add", 13).unwrap().name(), "Add");
        assert!(registry.get("", "Sub", 13).is_none());
    }

    #[test]
    fn test_version_ranges() {
        let mut registry = OperatorRegistry::new();
        registry.register_versioned("", "Clip", 1..=10, MockOp("Clip-1"));
        registry.register_versioned("", "Clip", 11..=u32::MAX, MockOp("Clip-11"));

        assert_eq!(registry.get("", "Clip", 6).unwrap().name(), "Clip-1");
        assert_eq!(registry.get("", "Clip", 13).unwrap().name(), "Clip-11");
        assert!(registry.get("", "Clip", 0).is_none());
    }

    #[test]
    fn test_domains_are_separate() {
        let mut registry = OperatorRegistry::new();
        registry.register_versioned("com.example", "Gelu", 1..=1, MockOp("Gelu"));

        assert!(registry.get("com.example", "Gelu", 1).is_some());
        assert!(registry.get("", "Gelu", 1).is_none());
    }

    #[test]
    fn test_resolve_reports_node() {
        let registry = OperatorRegistry::new();
        let mut node = Node::new("Softmax");
        node.name = "softmax_0".to_string();

        let err = registry.resolve(&node).err().unwrap();
        assert!(err.to_string().contains("ai.onnx::Softmax"));
        assert!(err.to_string().contains("softmax_0"));
    }
}
