//! Core operator registry.

use lumen_core::OperatorRegistry;

use crate::families::{BinaryElementwiseOp, UnaryElementwiseOp};

/// Returns an operator registry pre-populated with the reference operators.
///
/// The registry includes:
/// - 4 binary elementwise operators (Add, Sub, Mul, Div)
/// - 6 unary elementwise operators (Neg, Abs, Relu, Sqrt, Exp, Sigmoid)
///
/// Custom operators can be added to the returned registry via
/// `registry.register(name, operator)`.
pub fn core_operator_registry() -> OperatorRegistry {
    let mut registry = OperatorRegistry::new();

    // Binary elementwise operators
    registry
        .register("Add", BinaryElementwiseOp::add())
        .register("Sub", BinaryElementwiseOp::sub())
        .register("Mul", BinaryElementwiseOp::mul())
        .register("Div", BinaryElementwiseOp::div());

    // Unary elementwise operators
    registry
        .register("Neg", UnaryElementwiseOp::neg())
        .register("Abs", UnaryElementwiseOp::abs())
        .register("Relu", UnaryElementwiseOp::relu())
        .register("Sqrt", UnaryElementwiseOp::sqrt())
        .register("Exp", UnaryElementwiseOp::exp())
        .register("Sigmoid", UnaryElementwiseOp::sigmoid());

    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_contents() {
        let registry = core_operator_registry();
        assert_eq!(registry.len(), 10);
        for name in ["Add", "Sub", "Mul", "Div", "Relu", "Sigmoid"] {
            assert!(registry.contains(name), "missing {name}");
        }
        assert!(!registry.contains("MatMul"));
    }
}
