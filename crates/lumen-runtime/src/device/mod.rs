//! Device abstraction used by the backend.
//!
//! Everything the engine asks of the GPU goes through [`GpuDevice`]. Work is
//! recorded into a pending command stream and only becomes visible after
//! [`GpuDevice::flush`]; [`GpuDevice::read_buffer`] is the single await point.
//!
//! - [`WgpuDevice`] drives a real adapter through `wgpu`.
//! - [`RecordingDevice`] records every call and emulates kernels with host
//!   closures, which is what the test suites run on.

mod gpu;
pub mod recording;

pub use gpu::{WgpuDevice, WgpuPipeline};
pub use recording::{DeviceCounters, DeviceEvent, HostKernel, RecordingDevice};

use crate::error::Result;
use lumen_core::BindingKind;
use std::future::Future;

/// Usage class of a device buffer. Classes are pooled separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BufferUsage {
    /// Kernel inputs and outputs.
    Storage,
    /// Packed uniform blocks.
    Uniform,
}

/// Device limits relevant to dispatch and allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceLimits {
    pub max_workgroups_per_dimension: u32,
    pub max_buffer_size: u64,
    pub max_storage_buffer_binding_size: u64,
}

impl Default for DeviceLimits {
    fn default() -> Self {
        Self {
            max_workgroups_per_dimension: 65535,
            max_buffer_size: 256 * 1024 * 1024,
            max_storage_buffer_binding_size: 128 * 1024 * 1024,
        }
    }
}

/// Everything needed to create a compute pipeline.
#[derive(Debug, Clone, Copy)]
pub struct PipelineDesc<'a> {
    /// Debug label (program key).
    pub label: &'a str,

    /// Operator the program implements.
    pub operator: &'a str,

    /// Validated WGSL source.
    pub wgsl: &'a str,

    pub entry_point: &'a str,

    /// Bind group entries in binding order.
    pub bindings: &'a [BindingKind],
}

/// GPU operations required by the engine.
pub trait GpuDevice {
    /// Device buffer handle.
    type Buffer;

    /// Compiled compute pipeline with its bind group layout.
    type Pipeline;

    fn limits(&self) -> DeviceLimits;

    /// Create a buffer of exactly `size` bytes.
    fn create_buffer(&self, label: &str, size: u64, usage: BufferUsage) -> Result<Self::Buffer>;

    /// Destroy a buffer. Work already recorded against it still completes.
    fn destroy_buffer(&self, buffer: Self::Buffer);

    /// Record a host-to-device copy into the pending command stream.
    fn write_buffer(&self, buffer: &Self::Buffer, offset: u64, data: &[u8]) -> Result<()>;

    /// Record a device-to-device copy of the first `size` bytes.
    fn copy_buffer(&self, source: &Self::Buffer, target: &Self::Buffer, size: u64) -> Result<()>;

    /// Flush pending work and read back the first `len` bytes of `buffer`.
    fn read_buffer<'a>(
        &'a self,
        buffer: &'a Self::Buffer,
        len: u64,
    ) -> impl Future<Output = Result<Vec<u8>>> + 'a;

    fn create_pipeline(&self, desc: &PipelineDesc<'_>) -> Result<Self::Pipeline>;

    /// Record one dispatch with buffers bound in binding order.
    fn dispatch(
        &self,
        pipeline: &Self::Pipeline,
        bindings: &[&Self::Buffer],
        workgroups: [u32; 3],
    ) -> Result<()>;

    /// Submit everything recorded so far.
    fn flush(&self) -> Result<()>;

    /// Return [`crate::RuntimeError::DeviceLost`] if the device was lost.
    fn check_lost(&self) -> Result<()>;
}
