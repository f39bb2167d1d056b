//! Kernel invocation: one node, one dispatch.

use crate::capture::RecordedCommand;
use crate::device::{BufferUsage, GpuDevice};
use crate::error::{Result, RuntimeError};
use crate::memory::{BufferId, MemoryManager};
use crate::program::{DispatchRecord, Program, ProgramManager};
use lumen_core::{Kernel, Node, RunData, TensorDesc};
use std::sync::Arc;
use tracing::trace;

/// Runtime storage of one value slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorStorage {
    pub desc: TensorDesc,
    /// Backing buffer; `None` for zero-element tensors.
    pub buffer: Option<BufferId>,
}

impl TensorStorage {
    pub fn new(desc: TensorDesc, buffer: Option<BufferId>) -> Self {
        Self { desc, buffer }
    }
}

/// Mutable engine state threaded through a run.
pub(crate) struct ExecCtx<'a, D: GpuDevice> {
    pub memory: &'a mut MemoryManager<D>,
    pub programs: &'a mut ProgramManager<D>,
    /// Receives every issued command while a capture records.
    pub recorder: Option<&'a mut Vec<RecordedCommand<D::Pipeline>>>,
}

/// Run `kernel` for `node` on resolved inputs.
///
/// `targets` optionally pins outputs to existing buffers (external output
/// targets); every other non-empty output gets a fresh allocation.
pub(crate) fn invoke_kernel<D: GpuDevice>(
    ctx: &mut ExecCtx<'_, D>,
    node: &Node,
    kernel: &dyn Kernel,
    inputs: &[TensorStorage],
    targets: &[Option<BufferId>],
) -> Result<Vec<TensorStorage>> {
    let descs: Vec<TensorDesc> = inputs.iter().map(|s| s.desc.clone()).collect();

    let run = kernel
        .run_data(&descs)
        .map_err(|e| RuntimeError::KernelPrecondition {
            node: node.name.clone(),
            reason: match e {
                lumen_core::Error::Precondition(reason) => reason,
                other => other.to_string(),
            },
        })?;

    if run.outputs.len() != node.outputs.len() {
        return Err(RuntimeError::ExecutionError(format!(
            "Kernel {} produced {} outputs for node '{}' with {} outputs",
            kernel.name(),
            run.outputs.len(),
            node.name,
            node.outputs.len()
        )));
    }

    // Nothing to compute: no program, no allocation, no dispatch
    if run.outputs.iter().all(TensorDesc::is_empty) {
        trace!(node = %node.name, "Skipping dispatch, all outputs are empty");
        return Ok(run
            .outputs
            .into_iter()
            .map(|desc| TensorStorage::new(desc, None))
            .collect());
    }

    let program = ctx.programs.get_or_build(kernel, &descs)?;

    let mut input_buffers = Vec::with_capacity(inputs.len());
    for storage in inputs {
        input_buffers.push(match storage.buffer {
            Some(id) => id,
            None => ctx.memory.placeholder()?,
        });
    }

    let mut allocated = Vec::new();
    let issued = allocate_and_dispatch(
        ctx,
        &program,
        &input_buffers,
        &run,
        targets,
        &mut allocated,
    );
    let (outputs, record) = match issued {
        Ok(issued) => issued,
        Err(e) => {
            for id in allocated {
                ctx.memory.release(id)?;
            }
            return Err(e);
        }
    };

    trace!(
        node = %node.name,
        key = %record.program.key,
        workgroups = ?record.workgroups,
        "Dispatched"
    );

    if let Some(uniform) = record.uniform_buffer() {
        ctx.memory.release(uniform)?;
    }
    if let Some(recorder) = ctx.recorder.as_deref_mut() {
        recorder.push(RecordedCommand::Dispatch(record));
    }

    Ok(run
        .outputs
        .into_iter()
        .zip(outputs)
        .map(|(desc, buffer)| TensorStorage::new(desc, buffer))
        .collect())
}

/// Materialize an aliased value in a pinned output buffer.
///
/// No-op nodes share their input's buffer; when their output is pinned to an
/// external target the data is copied there instead.
pub(crate) fn copy_to_target<D: GpuDevice>(
    ctx: &mut ExecCtx<'_, D>,
    node: &Node,
    source: &TensorStorage,
    desc: TensorDesc,
    target: BufferId,
) -> Result<TensorStorage> {
    if desc.is_empty() {
        return Ok(TensorStorage::new(desc, None));
    }
    let size = desc.byte_len() as u64;
    let capacity = ctx.memory.size_of(target).unwrap_or(0);
    if capacity < size {
        return Err(RuntimeError::InvalidInputOutput(format!(
            "Output target {target} holds {capacity} bytes, {desc} needs {size}"
        )));
    }
    let source = source.buffer.ok_or_else(|| {
        RuntimeError::Planning(format!(
            "Input of no-op node '{}' has no buffer but {desc} is not empty",
            node.name
        ))
    })?;

    ctx.memory.copy(source, target, size)?;
    trace!(node = %node.name, %source, %target, size, "Copied aliased value into target");
    if let Some(recorder) = ctx.recorder.as_deref_mut() {
        recorder.push(RecordedCommand::Copy {
            source,
            target,
            size,
        });
    }
    Ok(TensorStorage::new(desc, Some(target)))
}

/// Allocate outputs, bind placeholders and issue the dispatch.
///
/// Fresh allocations are pushed to `allocated` so the caller can release
/// them if anything fails.
fn allocate_and_dispatch<D: GpuDevice>(
    ctx: &mut ExecCtx<'_, D>,
    program: &Arc<Program<D::Pipeline>>,
    inputs: &[BufferId],
    run: &RunData,
    targets: &[Option<BufferId>],
    allocated: &mut Vec<BufferId>,
) -> Result<(Vec<Option<BufferId>>, DispatchRecord<D::Pipeline>)> {
    let memory = &mut *ctx.memory;
    let mut buffers = Vec::with_capacity(run.outputs.len());
    for (i, desc) in run.outputs.iter().enumerate() {
        if desc.is_empty() {
            buffers.push(None);
            continue;
        }
        let size = desc.byte_len() as u64;
        match targets.get(i).copied().flatten() {
            Some(target) => {
                let capacity = memory.size_of(target).unwrap_or(0);
                if capacity < size {
                    return Err(RuntimeError::InvalidInputOutput(format!(
                        "Output target {target} holds {capacity} bytes, {desc} needs {size}"
                    )));
                }
                buffers.push(Some(target));
            }
            None => {
                let id = memory.allocate(size, BufferUsage::Storage)?;
                allocated.push(id);
                buffers.push(Some(id));
            }
        }
    }

    let mut bound = Vec::with_capacity(buffers.len());
    for buffer in &buffers {
        bound.push(match buffer {
            Some(id) => *id,
            None => memory.placeholder()?,
        });
    }
    let record = ctx
        .programs
        .run(memory, program, inputs, &bound, run.dispatch, &run.uniforms)?;
    Ok((buffers, record))
}
