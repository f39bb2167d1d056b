//! Execution plan: the ordered node sequence of a loaded graph.
//!
//! Planning happens once per session: the graph is validated, sorted
//! topologically, pruned to the nodes some graph output depends on, and every
//! node's kernel is resolved through the operator registry. A run then walks
//! the fixed order, feeding each node the storage of its inputs and releasing
//! a value's buffer as soon as its last consumer has run.
//!
//! Buffers are reference counted per run because no-op nodes alias their
//! input's buffer under a new shape; a buffer is released when the last slot
//! referring to it is cleared. Constant buffers are uploaded on first use and
//! pinned for the lifetime of the session.

use crate::device::{BufferUsage, GpuDevice};
use crate::error::{Result, RuntimeError};
use crate::invoke::{copy_to_target, invoke_kernel, ExecCtx, TensorStorage};
use crate::memory::{BufferId, MemoryManager};
use lumen_core::{
    Graph, Kernel, KernelCtx, NodeId, OperatorRegistry, SlotId, TensorShape, ValueKind,
};
use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use std::collections::{HashMap, HashSet};
use tracing::{debug, trace, warn};

/// Progress of the current (or last) run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanState {
    NotStarted,
    /// Executing the given node.
    Running(NodeId),
    Completed,
    Failed,
}

/// Where a node input comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputSource {
    GraphInput,
    Constant,
    Produced(NodeId),
}

struct PlannedNode {
    node_id: NodeId,
    /// `None` for no-op nodes.
    kernel: Option<Box<dyn Kernel>>,
    sources: Vec<InputSource>,
}

/// Ordered, pruned node sequence plus per-run slot state.
pub struct ExecutionPlan {
    graph: Graph,
    steps: Vec<PlannedNode>,
    /// Reads of each slot by planned nodes.
    uses: Vec<usize>,
    state: PlanState,
    slots: Vec<Option<TensorStorage>>,
    remaining: Vec<usize>,
    refs: HashMap<BufferId, usize>,
    constants: HashMap<SlotId, TensorStorage>,
    pinned: HashSet<BufferId>,
}

impl ExecutionPlan {
    /// Validate, sort and prune `graph`, resolving each node's kernel.
    pub fn new(graph: Graph, registry: &OperatorRegistry) -> Result<Self> {
        let producers = graph
            .validate()
            .map_err(|e| RuntimeError::Planning(e.to_string()))?;

        for &output in &graph.outputs {
            if producers[output].is_none() {
                return Err(RuntimeError::Planning(format!(
                    "Graph output '{}' is never produced",
                    graph.values[output].name
                )));
            }
        }

        // Nodes some graph output depends on
        let mut needed = vec![false; graph.nodes.len()];
        let mut stack: Vec<NodeId> = graph.outputs.iter().filter_map(|&s| producers[s]).collect();
        while let Some(node_id) = stack.pop() {
            if std::mem::replace(&mut needed[node_id], true) {
                continue;
            }
            for &input in &graph.nodes[node_id].inputs {
                if let Some(producer) = producers[input] {
                    if !needed[producer] {
                        stack.push(producer);
                    }
                }
            }
        }
        for (node_id, node) in graph.nodes.iter().enumerate() {
            if !needed[node_id] {
                debug!(node = %node.name, "Pruning node with no path to a graph output");
            }
        }

        let mut dag = DiGraph::<NodeId, ()>::new();
        let mut index = HashMap::new();
        for node_id in (0..graph.nodes.len()).filter(|&n| needed[n]) {
            index.insert(node_id, dag.add_node(node_id));
        }
        for node_id in (0..graph.nodes.len()).filter(|&n| needed[n]) {
            let consumer = index[&node_id];
            for &input in &graph.nodes[node_id].inputs {
                if let Some(producer) = producers[input] {
                    dag.add_edge(index[&producer], consumer, ());
                }
            }
        }
        let order = toposort(&dag, None).map_err(|cycle| {
            RuntimeError::Planning(format!(
                "Graph contains a cycle through node '{}'",
                graph.nodes[dag[cycle.node_id()]].name
            ))
        })?;

        let mut steps = Vec::with_capacity(order.len());
        let mut uses = vec![0; graph.values.len()];
        for ix in order {
            let node_id = dag[ix];
            let node = &graph.nodes[node_id];
            let sources = node
                .inputs
                .iter()
                .map(|&slot| match (graph.values[slot].kind, producers[slot]) {
                    (_, Some(producer)) => InputSource::Produced(producer),
                    (ValueKind::Constant, None) => InputSource::Constant,
                    _ => InputSource::GraphInput,
                })
                .collect();
            for &slot in &node.inputs {
                uses[slot] += 1;
            }

            let kernel = if node.noop {
                None
            } else {
                let operator = registry.resolve(node)?;
                Some(operator.create_kernel(&KernelCtx::new(node_id, node, &graph))?)
            };
            steps.push(PlannedNode {
                node_id,
                kernel,
                sources,
            });
        }

        debug!(
            graph = %graph.name,
            nodes = steps.len(),
            pruned = graph.nodes.len() - steps.len(),
            "Planned graph"
        );

        let slot_count = graph.values.len();
        Ok(Self {
            graph,
            steps,
            uses,
            state: PlanState::NotStarted,
            slots: vec![None; slot_count],
            remaining: vec![0; slot_count],
            refs: HashMap::new(),
            constants: HashMap::new(),
            pinned: HashSet::new(),
        })
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn state(&self) -> PlanState {
        self.state
    }

    /// Planned node ids in execution order.
    pub fn order(&self) -> Vec<NodeId> {
        self.steps.iter().map(|s| s.node_id).collect()
    }

    /// Input sources of a planned node.
    pub fn sources(&self, node_id: NodeId) -> Option<&[InputSource]> {
        self.steps
            .iter()
            .find(|s| s.node_id == node_id)
            .map(|s| s.sources.as_slice())
    }

    /// Whether a graph input is read by any planned node.
    pub fn is_used(&self, slot: SlotId) -> bool {
        self.uses.get(slot).is_some_and(|&n| n > 0)
    }

    /// Run every planned node.
    ///
    /// `inputs` binds graph input slots, `requested` names the output slots
    /// to return and `targets` pins output slots to existing buffers. The
    /// returned storage stays alive until [`ExecutionPlan::finish`].
    pub(crate) fn execute<D: GpuDevice>(
        &mut self,
        ctx: &mut ExecCtx<'_, D>,
        inputs: Vec<(SlotId, TensorStorage)>,
        requested: &[SlotId],
        targets: &HashMap<SlotId, BufferId>,
    ) -> Result<Vec<(SlotId, TensorStorage)>> {
        let result = self.execute_inner(ctx, inputs, requested, targets);
        match result {
            Ok(outputs) => {
                self.state = PlanState::Completed;
                Ok(outputs)
            }
            Err(e) => {
                self.state = PlanState::Failed;
                if let Err(release) = self.release_all(ctx.memory) {
                    warn!(error = %release, "Failed to release buffers of a failed run");
                }
                Err(e)
            }
        }
    }

    fn execute_inner<D: GpuDevice>(
        &mut self,
        ctx: &mut ExecCtx<'_, D>,
        inputs: Vec<(SlotId, TensorStorage)>,
        requested: &[SlotId],
        targets: &HashMap<SlotId, BufferId>,
    ) -> Result<Vec<(SlotId, TensorStorage)>> {
        self.reset(ctx.memory, requested)?;

        // Track every input buffer before anything can fail, so a failed run
        // releases them through release_all()
        let mut rejected = Vec::new();
        let mut bound = Vec::with_capacity(inputs.len());
        for (slot, storage) in inputs {
            if self.slots.get(slot).is_some_and(Option::is_none) {
                self.store(slot, storage)?;
                bound.push(slot);
            } else {
                rejected.push((slot, storage));
            }
        }
        if let Some((slot, _)) = rejected.first() {
            let slot = *slot;
            for (_, storage) in rejected {
                if let Some(id) = storage.buffer {
                    ctx.memory.release(id)?;
                }
            }
            return Err(RuntimeError::InvalidInputOutput(format!(
                "Input slot {slot} is unknown or bound twice"
            )));
        }

        for &slot in &bound {
            let info = &self.graph.values[slot];
            if info.kind != ValueKind::Input {
                return Err(RuntimeError::InvalidInputOutput(format!(
                    "'{}' is not a graph input",
                    info.name
                )));
            }
            if let Some(storage) = &self.slots[slot] {
                info.check(&storage.desc)
                    .map_err(|e| RuntimeError::InvalidInputOutput(e.to_string()))?;
            }
        }
        for &slot in &self.graph.inputs {
            if self.uses[slot] > 0 && self.slots[slot].is_none() {
                return Err(RuntimeError::InvalidInputOutput(format!(
                    "Missing input '{}'",
                    self.graph.values[slot].name
                )));
            }
        }
        for slot in bound {
            self.drop_if_dead(slot, ctx.memory)?;
        }
        self.bind_constants(ctx.memory)?;

        for step in 0..self.steps.len() {
            let node_id = self.steps[step].node_id;
            self.state = PlanState::Running(node_id);
            let node = &self.graph.nodes[node_id];

            let mut resolved = Vec::with_capacity(node.inputs.len());
            for &slot in &node.inputs {
                let storage = self.slots[slot].clone().ok_or_else(|| {
                    RuntimeError::Planning(format!(
                        "Value '{}' has no storage when node '{}' runs",
                        self.graph.values[slot].name, node.name
                    ))
                })?;
                resolved.push(storage);
            }

            let outputs = match &self.steps[step].kernel {
                None => {
                    let source = &resolved[0];
                    let desc = match &self.graph.values[node.outputs[0]].shape {
                        TensorShape::Static(dims) => source.desc.reshape(dims).map_err(|e| {
                            RuntimeError::KernelPrecondition {
                                node: node.name.clone(),
                                reason: e.to_string(),
                            }
                        })?,
                        _ => source.desc.clone(),
                    };
                    match targets.get(&node.outputs[0]) {
                        Some(&target) => vec![copy_to_target(ctx, node, source, desc, target)?],
                        None => {
                            trace!(node = %node.name, "No-op aliases its input");
                            vec![TensorStorage::new(desc, source.buffer)]
                        }
                    }
                }
                Some(kernel) => {
                    let pinned: Vec<Option<BufferId>> = node
                        .outputs
                        .iter()
                        .map(|slot| targets.get(slot).copied())
                        .collect();
                    invoke_kernel(ctx, node, kernel.as_ref(), &resolved, &pinned)?
                }
            };

            let input_slots = node.inputs.clone();
            let output_slots = node.outputs.clone();
            for (slot, storage) in output_slots.into_iter().zip(outputs) {
                let info = &self.graph.values[slot];
                if let Err(e) = info.check(&storage.desc) {
                    // Still track it so the failed run releases the buffer
                    self.store(slot, storage)?;
                    return Err(RuntimeError::ExecutionError(e.to_string()));
                }
                self.store(slot, storage)?;
                self.drop_if_dead(slot, ctx.memory)?;
            }
            for slot in input_slots {
                self.remaining[slot] = self.remaining[slot].saturating_sub(1);
                self.drop_if_dead(slot, ctx.memory)?;
            }
        }

        requested
            .iter()
            .map(|&slot| {
                self.slots[slot]
                    .clone()
                    .map(|storage| (slot, storage))
                    .ok_or_else(|| {
                        RuntimeError::Planning(format!(
                            "Requested output '{}' was not produced",
                            self.graph.values[slot].name
                        ))
                    })
            })
            .collect()
    }

    /// Clear per-run state.
    fn reset<D: GpuDevice>(&mut self, memory: &mut MemoryManager<D>, requested: &[SlotId]) -> Result<()> {
        self.release_all(memory)?;
        self.remaining.clone_from(&self.uses);
        for &slot in requested {
            // Held until finish()
            self.remaining[slot] += 1;
        }
        Ok(())
    }

    /// Bind every live constant, uploading it on first use.
    fn bind_constants<D: GpuDevice>(&mut self, memory: &mut MemoryManager<D>) -> Result<()> {
        for slot in 0..self.graph.values.len() {
            if self.graph.values[slot].kind != ValueKind::Constant || self.remaining[slot] == 0 {
                continue;
            }
            let storage = match self.constants.get(&slot) {
                Some(storage) => storage.clone(),
                None => {
                    let storage = self.upload_constant(slot, memory)?;
                    self.constants.insert(slot, storage.clone());
                    storage
                }
            };
            self.store(slot, storage)?;
        }
        Ok(())
    }

    fn upload_constant<D: GpuDevice>(
        &mut self,
        slot: SlotId,
        memory: &mut MemoryManager<D>,
    ) -> Result<TensorStorage> {
        let info = &self.graph.values[slot];
        let (Some(data), Some(dims)) = (&info.initializer, info.shape.as_static()) else {
            return Err(RuntimeError::Planning(format!(
                "Constant '{}' needs a static shape and initializer data",
                info.name
            )));
        };
        let desc = lumen_core::TensorDesc::new(info.dtype, dims);
        if data.len() != desc.byte_len() {
            return Err(RuntimeError::TensorError(format!(
                "Constant '{}' has {} bytes, {desc} needs {}",
                info.name,
                data.len(),
                desc.byte_len()
            )));
        }
        if desc.is_empty() {
            return Ok(TensorStorage::new(desc, None));
        }

        let id = memory.allocate(data.len() as u64, BufferUsage::Storage)?;
        if let Err(e) = memory.upload(id, data) {
            memory.release(id)?;
            return Err(e);
        }
        self.pinned.insert(id);
        trace!(constant = %info.name, %id, bytes = data.len(), "Uploaded constant");
        Ok(TensorStorage::new(desc, Some(id)))
    }

    fn store(&mut self, slot: SlotId, storage: TensorStorage) -> Result<()> {
        if self.slots[slot].is_some() {
            return Err(RuntimeError::Planning(format!(
                "Value '{}' was set twice in one run",
                self.graph.values[slot].name
            )));
        }
        if let Some(id) = storage.buffer {
            *self.refs.entry(id).or_insert(0) += 1;
        }
        self.slots[slot] = Some(storage);
        Ok(())
    }

    fn drop_if_dead<D: GpuDevice>(&mut self, slot: SlotId, memory: &mut MemoryManager<D>) -> Result<()> {
        if self.remaining[slot] == 0 {
            self.clear(slot, memory)?;
        }
        Ok(())
    }

    fn clear<D: GpuDevice>(&mut self, slot: SlotId, memory: &mut MemoryManager<D>) -> Result<()> {
        let Some(storage) = self.slots[slot].take() else {
            return Ok(());
        };
        let Some(id) = storage.buffer else {
            return Ok(());
        };
        let count = self.refs.get_mut(&id).ok_or_else(|| {
            RuntimeError::Planning(format!("Buffer {id} is not reference counted"))
        })?;
        *count -= 1;
        if *count == 0 {
            self.refs.remove(&id);
            if !self.pinned.contains(&id) {
                memory.release(id)?;
            }
        }
        Ok(())
    }

    fn release_all<D: GpuDevice>(&mut self, memory: &mut MemoryManager<D>) -> Result<()> {
        for slot in 0..self.slots.len() {
            self.clear(slot, memory)?;
        }
        Ok(())
    }

    /// Release everything still held by the last run (requested outputs).
    pub(crate) fn finish<D: GpuDevice>(&mut self, memory: &mut MemoryManager<D>) -> Result<()> {
        self.release_all(memory)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendConfig;
    use crate::device::RecordingDevice;
    use crate::program::ProgramManager;
    use lumen_core::{
        DataType, DispatchSize, Node, Operator, RunData, ShaderHelper, TensorDesc, ValueInfo,
    };
    use std::sync::Arc;

    struct Identity;

    impl Kernel for Identity {
        fn name(&self) -> &str {
            "Identity"
        }

        fn run_data(&self, inputs: &[TensorDesc]) -> lumen_core::Result<RunData> {
            Ok(RunData {
                outputs: vec![inputs[0].clone()],
                dispatch: DispatchSize::Workgroups([1, 1, 1]),
                uniforms: vec![],
            })
        }

        fn shader_source(&self, _: &mut ShaderHelper, _: &[TensorDesc]) -> lumen_core::Result<String> {
            Ok(String::new())
        }
    }

    struct IdentityOp;

    impl Operator for IdentityOp {
        fn name(&self) -> &str {
            "Identity"
        }

        fn create_kernel(&self, _ctx: &KernelCtx) -> lumen_core::Result<Box<dyn Kernel>> {
            Ok(Box::new(Identity))
        }
    }

    fn registry() -> OperatorRegistry {
        let mut registry = OperatorRegistry::new();
        registry.register("Identity", IdentityOp);
        registry
    }

    fn slot(graph: &mut Graph, name: &str, kind: ValueKind) -> SlotId {
        graph.add_value(ValueInfo::new(
            name,
            DataType::F32,
            TensorShape::Static(vec![4]),
            kind,
        ))
    }

    fn node(graph: &mut Graph, name: &str, inputs: Vec<SlotId>, outputs: Vec<SlotId>) -> NodeId {
        let mut node = Node::new("Identity");
        node.name = name.to_string();
        node.inputs = inputs;
        node.outputs = outputs;
        graph.add_node(node)
    }

    #[test]
    fn test_topological_order_ignores_declaration_order() {
        let mut graph = Graph::new();
        let x = slot(&mut graph, "x", ValueKind::Input);
        let a = slot(&mut graph, "a", ValueKind::Intermediate);
        let y = slot(&mut graph, "y", ValueKind::Output);
        let second = node(&mut graph, "second", vec![a], vec![y]);
        let first = node(&mut graph, "first", vec![x], vec![a]);

        let plan = ExecutionPlan::new(graph, &registry()).unwrap();
        assert_eq!(plan.order(), vec![first, second]);
        assert_eq!(plan.sources(first).unwrap(), &[InputSource::GraphInput]);
        assert_eq!(plan.sources(second).unwrap(), &[InputSource::Produced(first)]);
        assert_eq!(plan.state(), PlanState::NotStarted);
    }

    #[test]
    fn test_cycle_is_planning_error() {
        let mut graph = Graph::new();
        let a = slot(&mut graph, "a", ValueKind::Intermediate);
        let b = slot(&mut graph, "b", ValueKind::Intermediate);
        let y = slot(&mut graph, "y", ValueKind::Output);
        node(&mut graph, "n1", vec![b], vec![a]);
        node(&mut graph, "n2", vec![a], vec![b]);
        node(&mut graph, "n3", vec![b], vec![y]);

        match ExecutionPlan::new(graph, &registry()) {
            Err(RuntimeError::Planning(msg)) => assert!(msg.contains("cycle"), "{msg}"),
            other => panic!("expected planning error, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_dead_nodes_are_pruned() {
        let mut graph = Graph::new();
        let x = slot(&mut graph, "x", ValueKind::Input);
        let dead = slot(&mut graph, "dead", ValueKind::Intermediate);
        let y = slot(&mut graph, "y", ValueKind::Output);
        node(&mut graph, "unused", vec![x], vec![dead]);
        let live = node(&mut graph, "live", vec![x], vec![y]);

        let plan = ExecutionPlan::new(graph, &registry()).unwrap();
        assert_eq!(plan.order(), vec![live]);
        assert!(plan.is_used(x));
        assert!(!plan.is_used(dead));
    }

    #[test]
    fn test_unproduced_output_is_planning_error() {
        let mut graph = Graph::new();
        let x = slot(&mut graph, "x", ValueKind::Input);
        slot(&mut graph, "y", ValueKind::Output);
        let t = slot(&mut graph, "t", ValueKind::Intermediate);
        node(&mut graph, "n", vec![x], vec![t]);

        assert!(matches!(
            ExecutionPlan::new(graph, &registry()),
            Err(RuntimeError::Planning(_))
        ));
    }

    #[test]
    fn test_unknown_operator_fails_at_load() {
        let mut graph = Graph::new();
        let x = slot(&mut graph, "x", ValueKind::Input);
        let y = slot(&mut graph, "y", ValueKind::Output);
        let id = node(&mut graph, "n", vec![x], vec![y]);
        graph.nodes[id].op_type = "Mystery".to_string();

        assert!(matches!(
            ExecutionPlan::new(graph, &registry()),
            Err(RuntimeError::Core(lumen_core::Error::Unsupported(_)))
        ));
    }

    #[test]
    fn test_dangling_slot_is_planning_error() {
        let mut graph = Graph::new();
        let x = slot(&mut graph, "x", ValueKind::Input);
        let y = slot(&mut graph, "y", ValueKind::Output);
        node(&mut graph, "n", vec![x, 42], vec![y]);

        assert!(matches!(
            ExecutionPlan::new(graph, &registry()),
            Err(RuntimeError::Planning(_))
        ));
    }

    #[test]
    fn test_failed_cleanup_keeps_the_original_error() {
        let mut graph = Graph::new();
        let x = slot(&mut graph, "x", ValueKind::Input);
        let z = slot(&mut graph, "z", ValueKind::Input);
        let y = slot(&mut graph, "y", ValueKind::Output);
        node(&mut graph, "n", vec![x, z], vec![y]);
        let mut plan = ExecutionPlan::new(graph, &registry()).unwrap();

        let device = Arc::new(RecordingDevice::new());
        let mut memory = MemoryManager::new(Arc::clone(&device), &BackendConfig::default());
        let mut programs = ProgramManager::new(Arc::clone(&device), 64, 65535).unwrap();
        let stale = memory.allocate(16, BufferUsage::Storage).unwrap();
        memory.release(stale).unwrap();

        let mut ctx = ExecCtx {
            memory: &mut memory,
            programs: &mut programs,
            recorder: None,
        };
        let desc = TensorDesc::new(DataType::F32, &[4]);
        let inputs = vec![(x, TensorStorage::new(desc, Some(stale)))];
        let err = plan.execute(&mut ctx, inputs, &[y], &HashMap::new()).unwrap_err();

        match err {
            RuntimeError::InvalidInputOutput(msg) => assert!(msg.contains("Missing input 'z'"), "{msg}"),
            other => panic!("expected missing input, got {other}"),
        }
        assert_eq!(plan.state(), PlanState::Failed);
    }
}
