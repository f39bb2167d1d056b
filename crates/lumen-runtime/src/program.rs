//! Program manager: builds, caches and dispatches compute programs.
//!
//! A program is keyed structurally by operator name, the kernel's cache hint
//! and a per-input projection of the input descriptors chosen by the kernel
//! ([`InputDependency`]). On a miss the kernel's WGSL is composed with the
//! shared helper modules through `naga_oil`, validated with `naga`, written
//! back out as WGSL and handed to the device.

use crate::device::{BufferUsage, GpuDevice, PipelineDesc};
use crate::error::{Result, RuntimeError};
use crate::memory::{BufferId, MemoryManager};
use lumen_core::shader::{ENTRY_POINT, HELPER_MODULES};
use lumen_core::{
    DataType, DispatchSize, InputDependency, Kernel, ProgramLayout, ShaderHelper, TensorDesc,
    UniformValue,
};
use naga_oil::compose::{ComposableModuleDescriptor, Composer, NagaModuleDescriptor};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace};

/// Projection of one input descriptor into a program key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum InputKey {
    None,
    Type(DataType),
    Rank(DataType, usize),
    Shape(DataType, Vec<usize>),
}

impl InputKey {
    fn project(dependency: InputDependency, desc: &TensorDesc) -> Self {
        match dependency {
            InputDependency::None => InputKey::None,
            InputDependency::Type => InputKey::Type(desc.dtype),
            InputDependency::Rank => InputKey::Rank(desc.dtype, desc.rank()),
            InputDependency::Shape => InputKey::Shape(desc.dtype, desc.shape.clone()),
        }
    }
}

impl fmt::Display for InputKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InputKey::None => write!(f, "_"),
            InputKey::Type(dtype) => write!(f, "{dtype}"),
            InputKey::Rank(dtype, rank) => write!(f, "{dtype}r{rank}"),
            InputKey::Shape(dtype, shape) => write!(f, "{dtype}{shape:?}"),
        }
    }
}

/// Structural cache key of a compiled program.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProgramKey {
    pub operator: String,
    pub hint: String,
    pub inputs: Vec<InputKey>,
}

impl ProgramKey {
    pub fn new(kernel: &dyn Kernel, inputs: &[TensorDesc]) -> Self {
        Self {
            operator: kernel.name().to_string(),
            hint: kernel.cache_hint(),
            inputs: inputs
                .iter()
                .enumerate()
                .map(|(i, desc)| InputKey::project(kernel.input_dependency(i), desc))
                .collect(),
        }
    }
}

impl fmt::Display for ProgramKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.operator)?;
        if !self.hint.is_empty() {
            write!(f, "[{}]", self.hint)?;
        }
        write!(f, "(")?;
        for (i, input) in self.inputs.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{input}")?;
        }
        write!(f, ")")
    }
}

/// A compiled program: device pipeline plus binding and uniform layout.
pub struct Program<P> {
    pub key: ProgramKey,
    pub pipeline: P,
    pub layout: ProgramLayout,
    /// Validated WGSL the pipeline was created from.
    pub wgsl: String,
}

/// One dispatch as issued, with every buffer it bound.
pub struct DispatchRecord<P> {
    pub program: Arc<Program<P>>,
    /// Bound buffers in binding order, the uniform block last if present.
    pub bindings: Vec<BufferId>,
    /// Normalized workgroup counts.
    pub workgroups: [u32; 3],
}

impl<P> DispatchRecord<P> {
    /// Uniform buffer bound by this dispatch, if any.
    pub fn uniform_buffer(&self) -> Option<BufferId> {
        if self.program.layout.uniforms.is_empty() {
            None
        } else {
            self.bindings.last().copied()
        }
    }
}

/// Reshape a workgroup grid to fit the per-dimension limit.
///
/// Grids already within the limit are returned unchanged. Otherwise the total
/// is spread over a square `[s, s, 1]` or a cube `[c, c, c]`; shaders flatten
/// the workgroup id and guard the surplus.
pub fn normalize_dispatch(requested: [u32; 3], limit: u32) -> Result<[u32; 3]> {
    if requested.iter().all(|&d| d <= limit) {
        return Ok(requested);
    }
    let total: u64 = requested.iter().map(|&d| d as u64).product();
    let limit64 = limit as u64;

    let side = ceil_root(total, 2);
    if side <= limit64 {
        return Ok([side as u32, side as u32, 1]);
    }
    let side = ceil_root(total, 3);
    if side <= limit64 {
        return Ok([side as u32, side as u32, side as u32]);
    }
    Err(RuntimeError::DispatchLimit { requested, limit })
}

/// Smallest `s` with `s^n >= total`.
fn ceil_root(total: u64, n: u32) -> u64 {
    let mut s = (total as f64).powf(1.0 / n as f64).ceil() as u64;
    while s > 0 && (s - 1).checked_pow(n).is_some_and(|p| p >= total) {
        s -= 1;
    }
    while s.checked_pow(n).is_some_and(|p| p < total) {
        s += 1;
    }
    s
}

/// Caches programs by key and issues their dispatches.
pub struct ProgramManager<D: GpuDevice> {
    device: Arc<D>,
    composer: Composer,
    cache: HashMap<ProgramKey, Arc<Program<D::Pipeline>>>,
    workgroup_size: u32,
    max_workgroups: u32,
    builds: usize,
    hits: usize,
}

impl<D: GpuDevice> ProgramManager<D> {
    pub fn new(device: Arc<D>, workgroup_size: u32, max_workgroups: u32) -> Result<Self> {
        let mut composer = Composer::default();
        for module in HELPER_MODULES {
            composer
                .add_composable_module(ComposableModuleDescriptor {
                    source: module.source,
                    file_path: module.import_path,
                    ..Default::default()
                })
                .map_err(|e| {
                    RuntimeError::InitError(format!(
                        "Failed to register shader module '{}': {e}",
                        module.import_path
                    ))
                })?;
        }

        Ok(Self {
            device,
            composer,
            cache: HashMap::new(),
            workgroup_size,
            max_workgroups,
            builds: 0,
            hits: 0,
        })
    }

    /// Number of cached programs.
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// Number of programs built (cache misses).
    pub fn builds(&self) -> usize {
        self.builds
    }

    pub fn hits(&self) -> usize {
        self.hits
    }

    pub fn max_workgroups(&self) -> u32 {
        self.max_workgroups
    }

    /// Fetch the program for `kernel` specialized to `inputs`, building it on a miss.
    pub fn get_or_build(
        &mut self,
        kernel: &dyn Kernel,
        inputs: &[TensorDesc],
    ) -> Result<Arc<Program<D::Pipeline>>> {
        let key = ProgramKey::new(kernel, inputs);
        if let Some(program) = self.cache.get(&key) {
            self.hits += 1;
            trace!(%key, "Program cache hit");
            return Ok(Arc::clone(program));
        }

        let build_error = |reason: String| {
            tracing::error!(operator = kernel.name(), %key, %reason, "Program build failed");
            RuntimeError::KernelBuild {
                operator: kernel.name().to_string(),
                key: key.to_string(),
                reason,
            }
        };

        let mut helper = ShaderHelper::new(self.workgroup_size);
        let source = kernel
            .shader_source(&mut helper, inputs)
            .map_err(|e| build_error(e.to_string()))?;
        let layout = helper.layout();
        let label = key.to_string();
        let wgsl = self.compose(&label, &source).map_err(build_error)?;

        let bindings = layout.bindings();
        let pipeline = self
            .device
            .create_pipeline(&PipelineDesc {
                label: &label,
                operator: kernel.name(),
                wgsl: &wgsl,
                entry_point: ENTRY_POINT,
                bindings: &bindings,
            })
            .map_err(|e| build_error(e.to_string()))?;

        debug!(%key, bindings = bindings.len(), uniform_bytes = layout.uniforms.size(), "Built program");
        self.builds += 1;

        let program = Arc::new(Program {
            key: key.clone(),
            pipeline,
            layout,
            wgsl,
        });
        self.cache.insert(key, Arc::clone(&program));
        Ok(program)
    }

    /// Compose with helper modules, validate, and re-emit WGSL.
    fn compose(&mut self, label: &str, source: &str) -> std::result::Result<String, String> {
        let module = self
            .composer
            .make_naga_module(NagaModuleDescriptor {
                source,
                file_path: label,
                ..Default::default()
            })
            .map_err(|e| format!("Shader composition failed: {}", e.emit_to_string(&self.composer)))?;

        let info = naga::valid::Validator::new(
            naga::valid::ValidationFlags::all(),
            naga::valid::Capabilities::all(),
        )
        .validate(&module)
        .map_err(|e| format!("Shader validation failed: {e}"))?;

        naga::back::wgsl::write_string(&module, &info, naga::back::wgsl::WriterFlags::empty())
            .map_err(|e| format!("WGSL generation failed: {e}"))
    }

    /// Pack uniforms, normalize the grid and issue one dispatch.
    ///
    /// A uniform buffer is allocated from the pool for programs that declare
    /// uniforms; it is the last entry of the returned record's bindings and the
    /// caller releases it once the dispatch is recorded.
    pub fn run(
        &self,
        memory: &mut MemoryManager<D>,
        program: &Arc<Program<D::Pipeline>>,
        inputs: &[BufferId],
        outputs: &[BufferId],
        dispatch: impl Into<DispatchSize>,
        uniforms: &[UniformValue],
    ) -> Result<DispatchRecord<D::Pipeline>> {
        let layout = &program.layout;
        if inputs.len() != layout.inputs || outputs.len() != layout.outputs {
            return Err(RuntimeError::ExecutionError(format!(
                "Program {} binds {} inputs and {} outputs, got {} and {}",
                program.key,
                layout.inputs,
                layout.outputs,
                inputs.len(),
                outputs.len()
            )));
        }

        let packed = if layout.uniforms.is_empty() {
            if !uniforms.is_empty() {
                return Err(RuntimeError::UniformMismatch {
                    operator: program.key.operator.clone(),
                    reason: format!(
                        "program declares no uniforms but {} values were supplied",
                        uniforms.len()
                    ),
                });
            }
            None
        } else {
            Some(layout.uniforms.pack(uniforms).map_err(|e| {
                RuntimeError::UniformMismatch {
                    operator: program.key.operator.clone(),
                    reason: e.to_string(),
                }
            })?)
        };

        let dispatch = dispatch.into();
        let requested = dispatch
            .workgroups(self.workgroup_size)
            .ok_or(RuntimeError::DispatchLimit {
                requested: [u32::MAX, 1, 1],
                limit: self.max_workgroups,
            })?;
        let workgroups = normalize_dispatch(requested, self.max_workgroups)?;
        if workgroups != requested {
            trace!(key = %program.key, ?requested, ?workgroups, "Normalized dispatch");
        }

        let mut bindings: Vec<BufferId> = inputs.iter().chain(outputs).copied().collect();
        let mut uniform = None;
        if let Some(bytes) = packed {
            let id = memory.allocate(bytes.len() as u64, BufferUsage::Uniform)?;
            if let Err(e) = memory.upload(id, &bytes) {
                memory.release(id)?;
                return Err(e);
            }
            uniform = Some(id);
            bindings.push(id);
        }

        let record = DispatchRecord {
            program: Arc::clone(program),
            bindings,
            workgroups,
        };
        if let Err(e) = issue(memory, self.device.as_ref(), &record) {
            if let Some(id) = uniform {
                memory.release(id)?;
            }
            return Err(e);
        }
        Ok(record)
    }
}

/// Issue a recorded dispatch against the device.
pub(crate) fn issue<D: GpuDevice>(
    memory: &MemoryManager<D>,
    device: &D,
    record: &DispatchRecord<D::Pipeline>,
) -> Result<()> {
    let buffers = record
        .bindings
        .iter()
        .map(|&id| memory.buffer(id))
        .collect::<Result<Vec<_>>>()?;
    device.dispatch(&record.program.pipeline, &buffers, record.workgroups)
}
