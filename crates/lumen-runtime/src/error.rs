//! Error types for the runtime crate.

use thiserror::Error;

/// Runtime execution errors.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// GPU initialization failed.
    #[error("GPU initialization failed: {0}")]
    InitError(String),

    /// The graph cannot be turned into an execution plan, or the plan is
    /// internally inconsistent at run time.
    #[error("Planning failed: {0}")]
    Planning(String),

    /// Device buffer creation failed.
    #[error("Buffer allocation failed: {0}")]
    Allocation(String),

    /// Shader generation, composition, validation or pipeline creation failed.
    #[error("Failed to build program for {operator} (key {key}): {reason}")]
    KernelBuild {
        operator: String,
        key: String,
        reason: String,
    },

    /// A kernel rejected its concrete inputs.
    #[error("Kernel precondition failed in node '{node}': {reason}")]
    KernelPrecondition { node: String, reason: String },

    /// Uniform values do not match the program's declared uniform block.
    #[error("Uniform mismatch for {operator}: {reason}")]
    UniformMismatch { operator: String, reason: String },

    /// Requested workgroup grid cannot be expressed within device limits.
    #[error("Dispatch of {requested:?} workgroups exceeds device limit {limit} per dimension")]
    DispatchLimit { requested: [u32; 3], limit: u32 },

    /// A buffer referenced by a frozen capture is no longer owned by it.
    #[error("Capture can no longer be replayed: {0}")]
    ReplayInvalidation(String),

    /// Capture lifecycle misuse (wrong state for the requested transition).
    #[error("Capture error: {0}")]
    Capture(String),

    /// The device was lost; the backend is unusable from now on.
    #[error("GPU device lost: {0}")]
    DeviceLost(String),

    /// Execution failed.
    #[error("Execution failed: {0}")]
    ExecutionError(String),

    /// Invalid tensor.
    #[error("Invalid tensor: {0}")]
    TensorError(String),

    /// Invalid input/output.
    #[error("Invalid input or output: {0}")]
    InvalidInputOutput(String),

    /// Buffer async error.
    #[error("Buffer async error: {0}")]
    BufferAsyncError(#[from] wgpu::BufferAsyncError),

    #[error(transparent)]
    Core(#[from] lumen_core::Error),
}

/// Specialized Result type for runtime operations.
pub type Result<T> = std::result::Result<T, RuntimeError>;
