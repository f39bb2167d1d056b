//! Operator families: operators sharing one kernel shape, parameterized
//! only by the expression they compute.

pub mod binary_elementwise;
pub mod unary_elementwise;

pub use binary_elementwise::{BinaryElementwiseOp, BinaryKernel, BinaryOp};
pub use unary_elementwise::{UnaryElementwiseOp, UnaryKernel, UnaryOp};
