//! GPU compute backend for Lumen graphs.
//!
//! The backend executes a [`lumen_core::Graph`] on a GPU through `wgpu`.
//!
//! # Architecture
//!
//! - **Memory manager** hands out device buffers from bucketed pools and
//!   recycles them once the work reading them has been flushed.
//! - **Program manager** generates, validates and caches one compute pipeline
//!   per kernel specialization, packs uniforms and sizes dispatch grids.
//! - **Execution plan** orders the graph once per session and releases every
//!   intermediate as soon as its last consumer ran.
//! - **Capture** records one run of a session and replays its dispatches with
//!   new input data, skipping planning and allocation entirely.
//!
//! # Example
//!
//! ```no_run
//! use lumen_core::{DataType, Graph, Node, TensorShape, ValueInfo, ValueKind};
//! use lumen_operators::core_operator_registry;
//! use lumen_runtime::{Backend, BackendConfig, DeviceOptions, Tensor};
//!
//! #[pollster::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut graph = Graph::new();
//!     let shape = TensorShape::Static(vec![3]);
//!     let x = graph.add_value(ValueInfo::new("x", DataType::F32, shape.clone(), ValueKind::Input));
//!     let y = graph.add_value(ValueInfo::new("y", DataType::F32, shape, ValueKind::Output));
//!     let mut relu = Node::new("Relu");
//!     relu.inputs = vec![x];
//!     relu.outputs = vec![y];
//!     graph.add_node(relu);
//!
//!     let mut backend =
//!         Backend::with_wgpu(&DeviceOptions::default(), BackendConfig::default()).await?;
//!     let session = backend.load_session(graph, &core_operator_registry())?;
//!
//!     let input = Tensor::from_vec(vec![-1.0f32, 0.5, 2.0], &[3])?;
//!     let outputs = backend.run(session, &[("x", input)], &["y"]).await?;
//!     println!("{:?}", outputs["y"].to_vec::<f32>()?);
//!     Ok(())
//! }
//! ```

mod backend;
mod capture;
mod config;
pub mod device;
mod error;
mod invoke;
mod memory;
mod plan;
mod program;
mod tensor;

// Public exports
pub use backend::Backend;
pub use capture::{CaptureStatus, CapturedTensor};
pub use config::{BackendConfig, BucketSpec, DeviceOptions, DEFAULT_BUCKETS};
pub use device::{BufferUsage, DeviceLimits, GpuDevice, RecordingDevice, WgpuDevice};
pub use error::{Result, RuntimeError};
pub use invoke::TensorStorage;
pub use memory::{
    BufferId, BufferOwner, MemoryManager, MemoryStats, SessionId, BUFFER_ALIGNMENT, PLACEHOLDER_SIZE,
};
pub use plan::{ExecutionPlan, InputSource, PlanState};
pub use program::{normalize_dispatch, DispatchRecord, InputKey, Program, ProgramKey, ProgramManager};
pub use tensor::{Element, Tensor, TensorData};
