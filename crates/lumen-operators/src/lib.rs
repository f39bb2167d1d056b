//! Reference operator implementations for Lumen.
//!
//! A deliberately small operator set implementing the kernel contract of
//! `lumen-core`, grouped into families that share one kernel shape.
//!
//! # Operator Families
//!
//! - **Binary elementwise**: Add, Sub, Mul, Div (NumPy-style broadcasting)
//! - **Unary elementwise**: Neg, Abs, Relu, Sqrt, Exp, Sigmoid

pub mod broadcast;
pub mod families;

mod registry;

// Re-export operator types
pub use families::{BinaryElementwiseOp, BinaryOp, UnaryElementwiseOp, UnaryOp};
pub use registry::core_operator_registry;
