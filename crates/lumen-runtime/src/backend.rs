//! Session-level API of the compute backend.

use crate::capture::{CaptureState, CaptureStatus, CapturedRun, CapturedTensor, RecordedCommand};
use crate::config::{BackendConfig, DeviceOptions};
use crate::device::{BufferUsage, GpuDevice, WgpuDevice};
use crate::error::{Result, RuntimeError};
use crate::invoke::{ExecCtx, TensorStorage};
use crate::memory::{BufferId, BufferOwner, MemoryManager, MemoryStats, SessionId};
use crate::plan::{ExecutionPlan, PlanState};
use crate::program::ProgramManager;
use crate::tensor::{Tensor, TensorData};
use lumen_core::{Graph, OperatorRegistry, SlotId, ValueKind};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

struct Session<P> {
    plan: ExecutionPlan,
    capture: CaptureState<P>,
}

/// Everything a successful plan execution leaves behind.
struct Executed<P> {
    outputs: Vec<(SlotId, TensorStorage)>,
    inputs: Vec<CapturedTensor>,
    commands: Vec<RecordedCommand<P>>,
}

/// GPU compute backend: owns the device, the buffer pool, the program cache
/// and every loaded session.
///
/// # Example
/// ```no_run
/// # use lumen_runtime::{Backend, BackendConfig, DeviceOptions, Tensor};
/// # use lumen_core::{Graph, OperatorRegistry};
/// # async fn demo(graph: Graph, registry: OperatorRegistry) -> lumen_runtime::Result<()> {
/// let mut backend = Backend::with_wgpu(&DeviceOptions::default(), BackendConfig::default()).await?;
/// let session = backend.load_session(graph, &registry)?;
/// let x = Tensor::from_vec(vec![1.0f32, 2.0, 3.0], &[3])?;
/// let outputs = backend.run(session, &[("x", x)], &["y"]).await?;
/// println!("{:?}", outputs["y"].to_vec::<f32>()?);
/// # Ok(())
/// # }
/// ```
pub struct Backend<D: GpuDevice> {
    device: Arc<D>,
    config: BackendConfig,
    memory: MemoryManager<D>,
    programs: ProgramManager<D>,
    sessions: HashMap<SessionId, Session<D::Pipeline>>,
    next_session: u32,
    lost: Option<String>,
}

impl Backend<WgpuDevice> {
    /// Initialize a backend on the best adapter matching `options`.
    pub async fn with_wgpu(options: &DeviceOptions, config: BackendConfig) -> Result<Self> {
        let device = WgpuDevice::new(options).await?;
        Self::new(Arc::new(device), config)
    }
}

impl<D: GpuDevice> Backend<D> {
    pub fn new(device: Arc<D>, config: BackendConfig) -> Result<Self> {
        let device_limit = device.limits().max_workgroups_per_dimension;
        let limit = config
            .max_workgroups_per_dimension
            .map_or(device_limit, |l| l.min(device_limit));
        let memory = MemoryManager::new(Arc::clone(&device), &config);
        let programs = ProgramManager::new(Arc::clone(&device), config.workgroup_size, limit)?;

        Ok(Self {
            device,
            config,
            memory,
            programs,
            sessions: HashMap::new(),
            next_session: 0,
            lost: None,
        })
    }

    pub fn device(&self) -> &Arc<D> {
        &self.device
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    pub fn memory(&self) -> &MemoryManager<D> {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut MemoryManager<D> {
        &mut self.memory
    }

    pub fn memory_stats(&self) -> MemoryStats {
        self.memory.stats()
    }

    /// Number of cached programs.
    pub fn program_count(&self) -> usize {
        self.programs.len()
    }

    /// Number of programs built so far (cache misses).
    pub fn program_builds(&self) -> usize {
        self.programs.builds()
    }

    fn ensure_alive(&mut self) -> Result<()> {
        if let Some(reason) = &self.lost {
            return Err(RuntimeError::DeviceLost(reason.clone()));
        }
        let status = self.device.check_lost();
        self.observe(status)
    }

    /// Poison the backend on device loss.
    fn observe<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(RuntimeError::DeviceLost(reason)) = &result {
            if self.lost.is_none() {
                warn!(%reason, "Device lost; backend is no longer usable");
                self.lost = Some(reason.clone());
            }
        }
        result
    }

    fn session(&self, session: SessionId) -> Result<&Session<D::Pipeline>> {
        self.sessions
            .get(&session)
            .ok_or_else(|| RuntimeError::InvalidInputOutput(format!("Unknown {session}")))
    }

    /// Plan a graph and register it as a new session.
    #[tracing::instrument(skip_all, fields(graph = %graph.name))]
    pub fn load_session(&mut self, graph: Graph, registry: &OperatorRegistry) -> Result<SessionId> {
        self.ensure_alive()?;
        let plan = ExecutionPlan::new(graph, registry)?;
        let id = SessionId(self.next_session);
        self.next_session += 1;
        self.sessions.insert(
            id,
            Session {
                plan,
                capture: CaptureState::Idle,
            },
        );
        info!(session = %id, "Loaded session");
        Ok(id)
    }

    /// State of the session's last run.
    pub fn plan_state(&self, session: SessionId) -> Result<PlanState> {
        Ok(self.session(session)?.plan.state())
    }

    pub fn capture_status(&self, session: SessionId) -> Result<CaptureStatus> {
        Ok(self.session(session)?.capture.status())
    }

    /// Buffers referenced by the session's frozen capture, in id order.
    pub fn captured_buffers(&self, session: SessionId) -> Result<Vec<BufferId>> {
        match &self.session(session)?.capture {
            CaptureState::Frozen(run) => {
                let mut ids: Vec<BufferId> = run.buffers().into_iter().collect();
                ids.sort();
                Ok(ids)
            }
            _ => Err(RuntimeError::Capture(format!("{session} has no frozen capture"))),
        }
    }

    /// Run the session's graph and download the requested outputs.
    ///
    /// An empty `requested` list returns every graph output.
    #[tracing::instrument(skip_all, fields(session = %session))]
    pub async fn run(
        &mut self,
        session: SessionId,
        inputs: &[(&str, Tensor)],
        requested: &[&str],
    ) -> Result<HashMap<String, Tensor>> {
        let result = self.run_inner(session, inputs, requested).await;
        self.observe(result)
    }

    async fn run_inner(
        &mut self,
        session: SessionId,
        inputs: &[(&str, Tensor)],
        requested: &[&str],
    ) -> Result<HashMap<String, Tensor>> {
        self.ensure_alive()?;
        let requested = self.resolve_outputs(session, requested)?;
        let executed = self.execute(session, inputs, &requested, &HashMap::new())?;

        let mut results = HashMap::with_capacity(executed.outputs.len());
        let mut failure = None;
        for (slot, storage) in &executed.outputs {
            let name = self.session(session)?.plan.graph().values[*slot].name.clone();
            match download(&self.memory, storage).await {
                Ok(tensor) => {
                    results.insert(name, tensor);
                }
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        self.complete(session, executed)?;
        match failure {
            Some(e) => Err(e),
            None => Ok(results),
        }
    }

    /// Run the session's graph writing outputs into registered external
    /// buffers instead of downloading them.
    #[tracing::instrument(skip_all, fields(session = %session))]
    pub fn run_into(
        &mut self,
        session: SessionId,
        inputs: &[(&str, Tensor)],
        outputs: &[(&str, BufferId)],
    ) -> Result<()> {
        let result = self.run_into_inner(session, inputs, outputs);
        self.observe(result)
    }

    fn run_into_inner(
        &mut self,
        session: SessionId,
        inputs: &[(&str, Tensor)],
        outputs: &[(&str, BufferId)],
    ) -> Result<()> {
        self.ensure_alive()?;
        let names: Vec<&str> = outputs.iter().map(|(name, _)| *name).collect();
        let requested = self.resolve_outputs(session, &names)?;
        let mut targets = HashMap::new();
        for (&slot, (name, id)) in requested.iter().zip(outputs) {
            if self.memory.owner(*id) != Some(BufferOwner::External) {
                return Err(RuntimeError::InvalidInputOutput(format!(
                    "Output target for '{name}' is not a registered external buffer"
                )));
            }
            targets.insert(slot, *id);
        }

        let executed = self.execute(session, inputs, &requested, &targets)?;
        self.complete(session, executed)
    }

    fn resolve_outputs(&self, session: SessionId, requested: &[&str]) -> Result<Vec<SlotId>> {
        let graph = self.session(session)?.plan.graph();
        if requested.is_empty() {
            return Ok(graph.outputs.clone());
        }
        requested
            .iter()
            .map(|name| {
                graph
                    .value_id(name)
                    .ok()
                    .filter(|&slot| graph.values[slot].kind == ValueKind::Output)
                    .ok_or_else(|| {
                        RuntimeError::InvalidInputOutput(format!("'{name}' is not a graph output"))
                    })
            })
            .collect()
    }

    /// Bind inputs, execute the plan and flush.
    fn execute(
        &mut self,
        session: SessionId,
        inputs: &[(&str, Tensor)],
        requested: &[SlotId],
        targets: &HashMap<SlotId, BufferId>,
    ) -> Result<Executed<D::Pipeline>> {
        let Self {
            device,
            memory,
            programs,
            sessions,
            ..
        } = self;
        let state = sessions
            .get_mut(&session)
            .ok_or_else(|| RuntimeError::InvalidInputOutput(format!("Unknown {session}")))?;

        let recording = match &state.capture {
            CaptureState::Recording(None) => true,
            CaptureState::Recording(Some(_)) => {
                return Err(RuntimeError::Capture(format!(
                    "{session} already recorded a run; end the capture first"
                )))
            }
            CaptureState::Idle | CaptureState::Frozen(_) => false,
        };

        memory.set_session(Some(session));
        let result = bind_inputs(memory, &state.plan, inputs).and_then(|(bound, captured)| {
            let mut commands = Vec::new();
            let mut ctx = ExecCtx {
                memory: &mut *memory,
                programs: &mut *programs,
                recorder: recording.then_some(&mut commands),
            };
            let outputs = state.plan.execute(&mut ctx, bound, requested, targets)?;
            if let Err(e) = device.flush() {
                state.plan.finish(memory)?;
                return Err(e);
            }
            Ok(Executed {
                outputs,
                inputs: captured,
                commands,
            })
        });
        memory.set_session(None);

        if let Err(e) = &result {
            debug!(%session, error = %e, "Run failed");
            if recording {
                memory.release_captured(session);
            }
            if device.flush().is_ok() {
                memory.flush_pending();
            }
        }
        result
    }

    /// Release the run's outputs and keep the recorded run if capturing.
    fn complete(&mut self, session: SessionId, executed: Executed<D::Pipeline>) -> Result<()> {
        let Self {
            memory, sessions, ..
        } = self;
        let state = sessions
            .get_mut(&session)
            .ok_or_else(|| RuntimeError::InvalidInputOutput(format!("Unknown {session}")))?;

        memory.set_session(Some(session));
        let finished = state.plan.finish(memory);
        memory.set_session(None);
        finished?;

        if let CaptureState::Recording(recorded @ None) = &mut state.capture {
            let graph = state.plan.graph();
            let outputs = executed
                .outputs
                .into_iter()
                .map(|(slot, storage)| CapturedTensor {
                    name: graph.values[slot].name.clone(),
                    external: storage
                        .buffer
                        .is_some_and(|id| memory.owner(id) == Some(BufferOwner::External)),
                    desc: storage.desc,
                    buffer: storage.buffer,
                })
                .collect();
            debug!(
                %session,
                commands = executed.commands.len(),
                "Recorded run for capture"
            );
            let unused_inputs = graph
                .inputs
                .iter()
                .filter(|&&slot| !state.plan.is_used(slot))
                .map(|&slot| graph.values[slot].clone())
                .collect();
            *recorded = Some(CapturedRun {
                commands: executed.commands,
                inputs: executed.inputs,
                unused_inputs,
                outputs,
            });
        }

        memory.flush_pending();
        Ok(())
    }

    /// Drop a session and destroy every buffer it owns.
    pub fn dispose(&mut self, session: SessionId) -> Result<()> {
        if self.sessions.remove(&session).is_none() {
            return Err(RuntimeError::InvalidInputOutput(format!("Unknown {session}")));
        }
        if let Err(e) = self.device.flush() {
            warn!(%session, error = %e, "Flush before dispose failed");
        }
        self.memory.dispose_session(session);
        info!(%session, "Disposed session");
        Ok(())
    }

    /// Record the session's next run for replay.
    pub fn begin_capture(&mut self, session: SessionId) -> Result<()> {
        self.ensure_alive()?;
        let state = self
            .sessions
            .get_mut(&session)
            .ok_or_else(|| RuntimeError::InvalidInputOutput(format!("Unknown {session}")))?;
        if matches!(state.capture, CaptureState::Recording(_)) {
            return Err(RuntimeError::Capture(format!("{session} is already recording")));
        }
        self.memory.begin_capture(session)?;
        if matches!(state.capture, CaptureState::Frozen(_)) {
            self.memory.release_captured(session);
            self.memory.flush_pending();
        }
        state.capture = CaptureState::Recording(None);
        debug!(%session, "Capture started");
        Ok(())
    }

    /// Freeze the recorded run.
    pub fn end_capture(&mut self, session: SessionId) -> Result<()> {
        let result = self.end_capture_inner(session);
        self.observe(result)
    }

    fn end_capture_inner(&mut self, session: SessionId) -> Result<()> {
        self.ensure_alive()?;
        let state = self
            .sessions
            .get_mut(&session)
            .ok_or_else(|| RuntimeError::InvalidInputOutput(format!("Unknown {session}")))?;
        match &state.capture {
            CaptureState::Recording(Some(_)) => {}
            CaptureState::Recording(None) => {
                self.memory.end_capture();
                state.capture = CaptureState::Idle;
                return Err(RuntimeError::Capture(format!(
                    "{session} ended its capture without recording a run"
                )));
            }
            CaptureState::Idle | CaptureState::Frozen(_) => {
                return Err(RuntimeError::Capture(format!("{session} is not recording")))
            }
        }

        self.device.flush()?;
        self.memory.end_capture();
        if let CaptureState::Recording(Some(run)) =
            std::mem::replace(&mut state.capture, CaptureState::Idle)
        {
            debug!(%session, commands = run.commands.len(), "Capture frozen");
            state.capture = CaptureState::Frozen(run);
        }
        Ok(())
    }

    /// Discard the session's capture and return its buffers to the pool.
    pub fn clear_capture(&mut self, session: SessionId) -> Result<()> {
        let state = self
            .sessions
            .get_mut(&session)
            .ok_or_else(|| RuntimeError::InvalidInputOutput(format!("Unknown {session}")))?;
        if matches!(state.capture, CaptureState::Recording(_)) {
            self.memory.end_capture();
        }
        state.capture = CaptureState::Idle;
        self.memory.release_captured(session);
        if self.device.flush().is_ok() {
            self.memory.flush_pending();
        }
        Ok(())
    }

    /// Re-issue the frozen capture with new input data.
    #[tracing::instrument(skip_all, fields(session = %session))]
    pub async fn replay(
        &mut self,
        session: SessionId,
        inputs: &[(&str, Tensor)],
    ) -> Result<HashMap<String, Tensor>> {
        let result = self.replay_inner(session, inputs).await;
        self.observe(result)
    }

    async fn replay_inner(
        &mut self,
        session: SessionId,
        inputs: &[(&str, Tensor)],
    ) -> Result<HashMap<String, Tensor>> {
        self.ensure_alive()?;
        let CaptureState::Frozen(run) = &self.session(session)?.capture else {
            return Err(RuntimeError::Capture(format!("{session} has no frozen capture")));
        };

        run.validate(&self.memory, session)?;
        run.bind_inputs(&self.memory, inputs)?;
        run.issue_all(&self.memory, self.device.as_ref())?;
        self.device.flush()?;

        let mut results = HashMap::with_capacity(run.outputs.len());
        for output in &run.outputs {
            let storage = TensorStorage::new(output.desc.clone(), output.buffer);
            results.insert(output.name.clone(), download(&self.memory, &storage).await?);
        }
        Ok(results)
    }

    /// Track a caller-owned buffer so it can be bound as an input or output.
    pub fn register_external_buffer(&mut self, buffer: D::Buffer, size: u64) -> BufferId {
        self.memory.register_external(buffer, size)
    }

    /// Stop tracking an external buffer and hand it back.
    pub fn unregister_external_buffer(&mut self, id: BufferId) -> Option<D::Buffer> {
        self.memory.unregister_external(id)
    }
}

/// Validate caller inputs against the graph and upload host data.
fn bind_inputs<D: GpuDevice>(
    memory: &mut MemoryManager<D>,
    plan: &ExecutionPlan,
    inputs: &[(&str, Tensor)],
) -> Result<(Vec<(SlotId, TensorStorage)>, Vec<CapturedTensor>)> {
    let graph = plan.graph();
    let mut checked = Vec::with_capacity(inputs.len());
    for (i, (name, tensor)) in inputs.iter().enumerate() {
        if inputs[..i].iter().any(|(other, _)| other == name) {
            return Err(RuntimeError::InvalidInputOutput(format!(
                "Input '{name}' is bound twice"
            )));
        }
        let slot = graph
            .value_id(name)
            .ok()
            .filter(|&slot| graph.values[slot].kind == ValueKind::Input)
            .ok_or_else(|| {
                RuntimeError::InvalidInputOutput(format!("'{name}' is not a graph input"))
            })?;
        let desc = tensor.desc();
        graph.values[slot]
            .check(&desc)
            .map_err(|e| RuntimeError::InvalidInputOutput(e.to_string()))?;
        tensor.check_host_len(name)?;
        if let TensorData::Device(id) = tensor.data() {
            if memory.owner(*id) != Some(BufferOwner::External) {
                return Err(RuntimeError::InvalidInputOutput(format!(
                    "Input '{name}' refers to {id}, which is not a registered external buffer"
                )));
            }
            if memory.size_of(*id).unwrap_or(0) < desc.byte_len() as u64 {
                return Err(RuntimeError::InvalidInputOutput(format!(
                    "External buffer {id} is too small for input '{name}' ({desc})"
                )));
            }
        }
        if plan.is_used(slot) {
            checked.push((slot, *name, tensor, desc));
        }
    }

    let mut bound: Vec<(SlotId, TensorStorage)> = Vec::with_capacity(checked.len());
    let mut captured = Vec::with_capacity(checked.len());
    for (slot, name, tensor, desc) in checked {
        let (buffer, external) = match tensor.data() {
            TensorData::Device(id) => (Some(*id), true),
            TensorData::Host(_) if desc.is_empty() => (None, false),
            TensorData::Host(bytes) => {
                let uploaded = memory
                    .allocate(bytes.len() as u64, BufferUsage::Storage)
                    .and_then(|id| match memory.upload(id, bytes) {
                        Ok(()) => Ok(id),
                        Err(e) => memory.release(id).and(Err(e)),
                    });
                match uploaded {
                    Ok(id) => (Some(id), false),
                    Err(e) => {
                        for (_, storage) in &bound {
                            if let Some(id) = storage.buffer {
                                memory.release(id)?;
                            }
                        }
                        return Err(e);
                    }
                }
            }
        };
        captured.push(CapturedTensor {
            name: name.to_string(),
            desc: desc.clone(),
            buffer,
            external,
        });
        bound.push((slot, TensorStorage::new(desc, buffer)));
    }
    Ok((bound, captured))
}

async fn download<D: GpuDevice>(memory: &MemoryManager<D>, storage: &TensorStorage) -> Result<Tensor> {
    let data = match storage.buffer {
        Some(id) => memory.download(id, storage.desc.byte_len() as u64).await?,
        None => Vec::new(),
    };
    Ok(Tensor::from_raw(data, &storage.desc.shape, storage.desc.dtype))
}
