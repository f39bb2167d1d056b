//! Graph model, kernel contract and shader helpers for Lumen.
//!
//! This crate provides the foundations the GPU backend builds on:
//! - In-memory graph (`Graph`, `Node`, `ValueInfo`)
//! - Kernel contract (`Kernel`, `RunData`, `InputDependency`)
//! - Operator registry resolved once per node at load time
//! - WGSL generation helpers and uniform block layout

pub mod graph;
pub mod kernel;
pub mod operator;
pub mod registry;
pub mod shader;
pub mod types;
pub mod uniform;

// Re-export commonly used types
pub use graph::{AttributeValue, Graph, Node, NodeId, SlotId, ValueInfo, ValueKind};
pub use kernel::{DispatchSize, InputDependency, Kernel, RunData};
pub use operator::{KernelCtx, Operator};
pub use registry::OperatorRegistry;
pub use shader::{BindingKind, HelperModule, ProgramLayout, ShaderHelper};
pub use types::{DataType, TensorDesc, TensorShape};
pub use uniform::{UniformDecl, UniformLayout, UniformType, UniformValue};

/// Result type using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for lumen-core operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid graph structure: {0}")]
    InvalidGraph(String),

    #[error("Attribute error: {0}")]
    Attribute(String),

    #[error("Shape error: {0}")]
    Shape(String),

    /// A kernel rejected its inputs.
    #[error("Precondition failed: {0}")]
    Precondition(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Uniform error: {0}")]
    Uniform(String),

    #[error("Shader generation error: {0}")]
    Shader(String),
}
