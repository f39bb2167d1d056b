//! Host-side device that records every call.
//!
//! Buffers are plain byte vectors. Dispatches are queued like commands on a
//! real device and executed on [`GpuDevice::flush`] by a host closure
//! registered for the program's operator, so complete graphs can run (and
//! be checked for values) without a GPU.

use super::{BufferUsage, DeviceLimits, GpuDevice, PipelineDesc};
use crate::error::{Result, RuntimeError};
use lumen_core::BindingKind;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Host emulation of one operator's program.
///
/// Called with the contents of the bound input buffers, the bound output
/// buffers (full allocation size, writable) and the packed uniform block
/// (empty if the program has none).
pub type HostKernel = Arc<dyn Fn(&[&[u8]], &mut [Vec<u8>], &[u8]) + Send + Sync>;

/// Handle to a recorded buffer.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct RecordedBuffer {
    id: u64,
    size: u64,
    usage: BufferUsage,
}

impl RecordedBuffer {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn usage(&self) -> BufferUsage {
        self.usage
    }
}

/// A pipeline created on the recording device.
#[derive(Debug, Clone)]
pub struct RecordedPipeline {
    pub label: String,
    pub operator: String,
    pub wgsl: String,
    pub bindings: Vec<BindingKind>,
}

/// One call made against the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    CreateBuffer { id: u64, size: u64, usage: BufferUsage },
    DestroyBuffer { id: u64 },
    Write { id: u64, offset: u64, len: usize },
    Copy { source: u64, target: u64, size: u64 },
    Read { id: u64, len: u64 },
    CreatePipeline { label: String },
    Dispatch { operator: String, buffers: Vec<u64>, workgroups: [u32; 3] },
    Flush,
}

/// Running totals of device calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceCounters {
    pub buffers_created: usize,
    pub buffers_destroyed: usize,
    pub pipelines_created: usize,
    pub dispatches: usize,
    pub writes: usize,
    pub copies: usize,
    pub reads: usize,
    pub flushes: usize,
}

impl DeviceCounters {
    pub fn live_buffers(&self) -> usize {
        self.buffers_created - self.buffers_destroyed
    }
}

enum Command {
    Write {
        id: u64,
        offset: u64,
        data: Vec<u8>,
    },
    Copy {
        source: u64,
        target: u64,
        size: usize,
    },
    Dispatch {
        operator: String,
        bindings: Vec<(u64, BindingKind)>,
    },
}

#[derive(Default)]
struct State {
    next_id: u64,
    memory: HashMap<u64, Vec<u8>>,
    queue: Vec<Command>,
    events: Vec<DeviceEvent>,
    counters: DeviceCounters,
    fail_allocations: bool,
    lost: Option<String>,
}

/// Device that records calls and emulates kernels on the host.
pub struct RecordingDevice {
    limits: DeviceLimits,
    kernels: HashMap<String, HostKernel>,
    state: Mutex<State>,
}

impl Default for RecordingDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingDevice {
    pub fn new() -> Self {
        Self::with_limits(DeviceLimits::default())
    }

    pub fn with_limits(limits: DeviceLimits) -> Self {
        Self {
            limits,
            kernels: HashMap::new(),
            state: Mutex::new(State::default()),
        }
    }

    /// Register the host emulation for programs of `operator`.
    pub fn with_host_kernel<F>(mut self, operator: &str, kernel: F) -> Self
    where
        F: Fn(&[&[u8]], &mut [Vec<u8>], &[u8]) + Send + Sync + 'static,
    {
        self.kernels.insert(operator.to_string(), Arc::new(kernel));
        self
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn counters(&self) -> DeviceCounters {
        self.state().counters
    }

    pub fn events(&self) -> Vec<DeviceEvent> {
        self.state().events.clone()
    }

    pub fn clear_events(&self) {
        self.state().events.clear();
    }

    /// Dispatch events recorded so far, in order.
    pub fn dispatches(&self) -> Vec<DeviceEvent> {
        self.state()
            .events
            .iter()
            .filter(|e| matches!(e, DeviceEvent::Dispatch { .. }))
            .cloned()
            .collect()
    }

    /// Make every following buffer creation fail.
    pub fn fail_allocations(&self, fail: bool) {
        self.state().fail_allocations = fail;
    }

    /// Simulate losing the device.
    pub fn lose(&self, reason: &str) {
        self.state().lost = Some(reason.to_string());
    }

    fn execute(&self, state: &mut State) -> Result<()> {
        for command in std::mem::take(&mut state.queue) {
            match command {
                Command::Write { id, offset, data } => {
                    let memory = state.memory.get_mut(&id).ok_or_else(|| {
                        RuntimeError::ExecutionError(format!(
                            "Write to buffer {id} destroyed before flush"
                        ))
                    })?;
                    let start = offset as usize;
                    memory[start..start + data.len()].copy_from_slice(&data);
                }
                Command::Copy {
                    source,
                    target,
                    size,
                } => {
                    let data = state
                        .memory
                        .get(&source)
                        .map(|memory| memory[..size].to_vec())
                        .ok_or_else(|| {
                            RuntimeError::ExecutionError(format!(
                                "Copy from buffer {source} destroyed before flush"
                            ))
                        })?;
                    let memory = state.memory.get_mut(&target).ok_or_else(|| {
                        RuntimeError::ExecutionError(format!(
                            "Copy into buffer {target} destroyed before flush"
                        ))
                    })?;
                    memory[..size].copy_from_slice(&data);
                }
                Command::Dispatch { operator, bindings } => {
                    let kernel = self.kernels.get(&operator).ok_or_else(|| {
                        RuntimeError::ExecutionError(format!(
                            "No host kernel registered for '{operator}'"
                        ))
                    })?;
                    let fetch = |id: &u64| {
                        state.memory.get(id).cloned().ok_or_else(|| {
                            RuntimeError::ExecutionError(format!(
                                "Dispatch of '{operator}' binds buffer {id} destroyed before flush"
                            ))
                        })
                    };

                    let mut inputs = Vec::new();
                    let mut outputs = Vec::new();
                    let mut output_ids = Vec::new();
                    let mut uniforms = Vec::new();
                    for (id, kind) in &bindings {
                        match kind {
                            BindingKind::ReadOnlyStorage => inputs.push(fetch(id)?),
                            BindingKind::Storage => {
                                outputs.push(fetch(id)?);
                                output_ids.push(*id);
                            }
                            BindingKind::Uniform => uniforms = fetch(id)?,
                        }
                    }

                    let input_refs: Vec<&[u8]> = inputs.iter().map(Vec::as_slice).collect();
                    kernel(&input_refs, &mut outputs, &uniforms);

                    for (id, data) in output_ids.into_iter().zip(outputs) {
                        state.memory.insert(id, data);
                    }
                }
            }
        }
        Ok(())
    }
}

impl GpuDevice for RecordingDevice {
    type Buffer = RecordedBuffer;
    type Pipeline = RecordedPipeline;

    fn limits(&self) -> DeviceLimits {
        self.limits
    }

    fn create_buffer(&self, label: &str, size: u64, usage: BufferUsage) -> Result<RecordedBuffer> {
        let mut state = self.state();
        if state.fail_allocations {
            return Err(RuntimeError::Allocation(format!(
                "{label}: device refused {size} bytes"
            )));
        }
        if size > self.limits.max_buffer_size {
            return Err(RuntimeError::Allocation(format!(
                "{label}: {size} bytes exceeds device maximum of {} bytes",
                self.limits.max_buffer_size
            )));
        }

        let id = state.next_id;
        state.next_id += 1;
        state.memory.insert(id, vec![0; size as usize]);
        state.counters.buffers_created += 1;
        state.events.push(DeviceEvent::CreateBuffer { id, size, usage });
        Ok(RecordedBuffer { id, size, usage })
    }

    fn destroy_buffer(&self, buffer: RecordedBuffer) {
        let mut state = self.state();
        state.memory.remove(&buffer.id);
        state.counters.buffers_destroyed += 1;
        state.events.push(DeviceEvent::DestroyBuffer { id: buffer.id });
    }

    fn write_buffer(&self, buffer: &RecordedBuffer, offset: u64, data: &[u8]) -> Result<()> {
        if offset + data.len() as u64 > buffer.size {
            return Err(RuntimeError::ExecutionError(format!(
                "Upload of {} bytes at offset {offset} overflows buffer of {} bytes",
                data.len(),
                buffer.size
            )));
        }
        let mut state = self.state();
        state.counters.writes += 1;
        state.events.push(DeviceEvent::Write {
            id: buffer.id,
            offset,
            len: data.len(),
        });
        state.queue.push(Command::Write {
            id: buffer.id,
            offset,
            data: data.to_vec(),
        });
        Ok(())
    }

    fn copy_buffer(&self, source: &RecordedBuffer, target: &RecordedBuffer, size: u64) -> Result<()> {
        if size > source.size || size > target.size {
            return Err(RuntimeError::ExecutionError(format!(
                "Copy of {size} bytes from buffer {} ({} bytes) into buffer {} ({} bytes)",
                source.id, source.size, target.id, target.size
            )));
        }
        let mut state = self.state();
        state.counters.copies += 1;
        state.events.push(DeviceEvent::Copy {
            source: source.id,
            target: target.id,
            size,
        });
        state.queue.push(Command::Copy {
            source: source.id,
            target: target.id,
            size: size as usize,
        });
        Ok(())
    }

    fn read_buffer<'a>(
        &'a self,
        buffer: &'a RecordedBuffer,
        len: u64,
    ) -> impl Future<Output = Result<Vec<u8>>> + 'a {
        async move {
            self.flush()?;
            let mut state = self.state();
            state.counters.reads += 1;
            state.events.push(DeviceEvent::Read { id: buffer.id, len });
            let memory = state.memory.get(&buffer.id).ok_or_else(|| {
                RuntimeError::ExecutionError(format!("Read of destroyed buffer {}", buffer.id))
            })?;
            let end = (len as usize).min(memory.len());
            Ok(memory[..end].to_vec())
        }
    }

    fn create_pipeline(&self, desc: &PipelineDesc<'_>) -> Result<RecordedPipeline> {
        let mut state = self.state();
        state.counters.pipelines_created += 1;
        state.events.push(DeviceEvent::CreatePipeline {
            label: desc.label.to_string(),
        });
        Ok(RecordedPipeline {
            label: desc.label.to_string(),
            operator: desc.operator.to_string(),
            wgsl: desc.wgsl.to_string(),
            bindings: desc.bindings.to_vec(),
        })
    }

    fn dispatch(
        &self,
        pipeline: &RecordedPipeline,
        bindings: &[&RecordedBuffer],
        workgroups: [u32; 3],
    ) -> Result<()> {
        if bindings.len() != pipeline.bindings.len() {
            return Err(RuntimeError::ExecutionError(format!(
                "Pipeline '{}' expects {} bindings, got {}",
                pipeline.label,
                pipeline.bindings.len(),
                bindings.len()
            )));
        }
        let limit = self.limits.max_workgroups_per_dimension;
        if workgroups.iter().any(|&w| w > limit) {
            return Err(RuntimeError::DispatchLimit {
                requested: workgroups,
                limit,
            });
        }

        let mut state = self.state();
        state.counters.dispatches += 1;
        state.events.push(DeviceEvent::Dispatch {
            operator: pipeline.operator.clone(),
            buffers: bindings.iter().map(|b| b.id).collect(),
            workgroups,
        });
        state.queue.push(Command::Dispatch {
            operator: pipeline.operator.clone(),
            bindings: bindings
                .iter()
                .zip(&pipeline.bindings)
                .map(|(b, kind)| (b.id, *kind))
                .collect(),
        });
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.check_lost()?;
        let mut state = self.state();
        state.counters.flushes += 1;
        state.events.push(DeviceEvent::Flush);
        self.execute(&mut state)
    }

    fn check_lost(&self) -> Result<()> {
        match &self.state().lost {
            Some(reason) => Err(RuntimeError::DeviceLost(reason.clone())),
            None => Ok(()),
        }
    }
}
