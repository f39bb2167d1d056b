//! Capture and replay of a session's dispatch sequence.
//!
//! While a session records, one run proceeds normally but every dispatch and
//! device copy is appended to a list, and every buffer the run releases is
//! retained by the capture instead of returning to the pool. Once frozen, a
//! replay uploads new input data into the captured input buffers and re-issues
//! the recorded commands verbatim: no planning, no program lookups, no
//! allocation.

use crate::device::GpuDevice;
use crate::error::{Result, RuntimeError};
use crate::memory::{BufferId, BufferOwner, MemoryManager, SessionId};
use crate::program::{issue, DispatchRecord};
use crate::tensor::{Tensor, TensorData};
use lumen_core::{TensorDesc, ValueInfo};
use std::collections::HashSet;
use tracing::debug;

/// Externally visible capture state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureStatus {
    Idle,
    Recording,
    Frozen,
}

/// A bound graph input or requested output of the captured run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedTensor {
    pub name: String,
    pub desc: TensorDesc,
    pub buffer: Option<BufferId>,
    /// Supplied by the caller as a registered external buffer.
    pub external: bool,
}

/// A device command issued by a recorded run.
pub(crate) enum RecordedCommand<P> {
    Dispatch(DispatchRecord<P>),
    /// Copy of an aliased value into a pinned output buffer.
    Copy {
        source: BufferId,
        target: BufferId,
        size: u64,
    },
}

impl<P> RecordedCommand<P> {
    fn buffers(&self) -> Vec<BufferId> {
        match self {
            RecordedCommand::Dispatch(record) => record.bindings.clone(),
            RecordedCommand::Copy { source, target, .. } => vec![*source, *target],
        }
    }
}

/// A frozen run.
pub(crate) struct CapturedRun<P> {
    pub commands: Vec<RecordedCommand<P>>,
    pub inputs: Vec<CapturedTensor>,
    /// Graph inputs no planned node reads; accepted and ignored like a run does.
    pub unused_inputs: Vec<ValueInfo>,
    pub outputs: Vec<CapturedTensor>,
}

pub(crate) enum CaptureState<P> {
    Idle,
    /// Waiting for (or holding) the single recorded run.
    Recording(Option<CapturedRun<P>>),
    Frozen(CapturedRun<P>),
}

impl<P> CaptureState<P> {
    pub fn status(&self) -> CaptureStatus {
        match self {
            CaptureState::Idle => CaptureStatus::Idle,
            CaptureState::Recording(_) => CaptureStatus::Recording,
            CaptureState::Frozen(_) => CaptureStatus::Frozen,
        }
    }
}

impl<P> CapturedRun<P> {
    /// Every buffer the replay touches.
    pub fn buffers(&self) -> HashSet<BufferId> {
        self.commands
            .iter()
            .flat_map(RecordedCommand::buffers)
            .chain(self.inputs.iter().filter_map(|t| t.buffer))
            .chain(self.outputs.iter().filter_map(|t| t.buffer))
            .collect()
    }

    /// Check that every referenced buffer is still owned by this capture,
    /// its session, or the external registry.
    pub fn validate<D: GpuDevice<Pipeline = P>>(
        &self,
        memory: &MemoryManager<D>,
        session: SessionId,
    ) -> Result<()> {
        for id in self.buffers() {
            let valid = match memory.owner(id) {
                Some(BufferOwner::Capture) | Some(BufferOwner::External) => true,
                Some(BufferOwner::Tensor) => {
                    memory.session_of(id).map_or(true, |owner| owner == session)
                }
                _ => false,
            };
            if !valid {
                return Err(RuntimeError::ReplayInvalidation(format!(
                    "buffer {id} is no longer owned by the capture (owner {:?})",
                    memory.owner(id)
                )));
            }
        }
        Ok(())
    }

    /// Upload replay inputs into the captured input buffers.
    pub fn bind_inputs<D: GpuDevice<Pipeline = P>>(
        &self,
        memory: &MemoryManager<D>,
        inputs: &[(&str, Tensor)],
    ) -> Result<()> {
        for (name, tensor) in inputs {
            if self.inputs.iter().any(|c| c.name == *name) {
                continue;
            }
            match self.unused_inputs.iter().find(|info| info.name == *name) {
                Some(info) => {
                    info.check(&tensor.desc())
                        .map_err(|e| RuntimeError::InvalidInputOutput(e.to_string()))?;
                    tensor.check_host_len(name)?;
                }
                None => {
                    return Err(RuntimeError::InvalidInputOutput(format!(
                        "'{name}' was not an input of the captured run"
                    )))
                }
            }
        }

        // Check every input before the first upload
        let mut uploads = Vec::with_capacity(self.inputs.len());
        for captured in &self.inputs {
            let tensor = inputs
                .iter()
                .find(|(name, _)| *name == captured.name)
                .map(|(_, t)| t)
                .ok_or_else(|| {
                    RuntimeError::InvalidInputOutput(format!(
                        "Missing input '{}' for replay",
                        captured.name
                    ))
                })?;
            if tensor.desc() != captured.desc {
                return Err(RuntimeError::InvalidInputOutput(format!(
                    "Input '{}' was captured as {}, replay supplied {}",
                    captured.name,
                    captured.desc,
                    tensor.desc()
                )));
            }
            match (tensor.data(), captured.buffer) {
                (TensorData::Device(id), Some(buffer)) if captured.external => {
                    if *id != buffer {
                        return Err(RuntimeError::InvalidInputOutput(format!(
                            "Input '{}' was captured from buffer {buffer}, replay supplied {id}",
                            captured.name
                        )));
                    }
                }
                (TensorData::Host(bytes), Some(buffer)) if !captured.external => {
                    tensor.check_host_len(&captured.name)?;
                    uploads.push((buffer, bytes));
                }
                (TensorData::Host(_), None) => tensor.check_host_len(&captured.name)?,
                _ => {
                    return Err(RuntimeError::InvalidInputOutput(format!(
                        "Input '{}' must be supplied the same way it was captured",
                        captured.name
                    )));
                }
            }
        }

        for (buffer, bytes) in uploads {
            memory.upload(buffer, bytes)?;
        }
        Ok(())
    }

    /// Re-issue every captured command.
    pub fn issue_all<D: GpuDevice<Pipeline = P>>(
        &self,
        memory: &MemoryManager<D>,
        device: &D,
    ) -> Result<()> {
        for command in &self.commands {
            match command {
                RecordedCommand::Dispatch(record) => issue(memory, device, record)?,
                RecordedCommand::Copy {
                    source,
                    target,
                    size,
                } => memory.copy(*source, *target, *size)?,
            }
        }
        debug!(commands = self.commands.len(), "Replayed capture");
        Ok(())
    }
}
