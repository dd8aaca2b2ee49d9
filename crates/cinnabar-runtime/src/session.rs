//! Session load and the run loop.
//!
//! A session takes a precompiled graph, resolves one kernel per node through
//! the execution-provider dispatch, and executes nodes in dependency order.
//! Kernel resolution and construction happen once at load; runs reuse the
//! constructed kernels, which are immutable, so independent runs over the
//! same session may execute concurrently.

use crate::env::Env;
use crate::options::{RunOptions, SessionOptions};
use cinnabar_core::{
    BackendKind, BackendResources, CpuAllocator, DataType, Error, Graph, Kernel, KernelContext,
    KernelRegistry, Result, Tensor, TensorId, TensorShape,
};
use cinnabar_wgpu::GpuContext;
use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// One node's resolved execution state.
struct NodePlan {
    node_index: usize,
    backend: BackendKind,
    kernel: Box<dyn Kernel>,
    requested: Vec<bool>,
}

/// One profiling record captured during a run.
#[derive(Debug, Clone, Serialize)]
pub struct ProfileEvent {
    pub name: String,
    pub op_type: String,
    pub ts_us: u128,
    pub dur_us: u128,
}

/// A loaded graph ready for repeated execution.
pub struct Session {
    env: Arc<Env>,
    graph: Graph,
    plan: Vec<NodePlan>,
    initial_values: HashMap<TensorId, Arc<Tensor>>,
    input_shapes: HashMap<TensorId, Vec<usize>>,
    gpu: Option<Arc<GpuContext>>,
    allocator: CpuAllocator,
    profiler: Option<Mutex<Vec<ProfileEvent>>>,
    started: Instant,
    options: SessionOptions,
}

impl Session {
    /// Load a session from an already-structured graph.
    pub fn from_graph(env: Arc<Env>, graph: Graph, options: SessionOptions) -> Result<Self> {
        graph.validate()?;

        let (backends, gpu) = resolve_backends(&options)?;

        let mut registry = KernelRegistry::new();
        cinnabar_cpu::register_kernels(&mut registry)?;
        cinnabar_wgpu::register_kernels(&mut registry)?;

        // Initializers become the run loop's starting value set.
        let mut initial_values = HashMap::new();
        let mut input_shapes = HashMap::new();
        for (id, info) in graph.tensor_info.iter().enumerate() {
            if let Some(bytes) = &info.initializer {
                let shape = info.shape.resolve(&options.free_dimension_overrides)?;
                initial_values.insert(
                    id,
                    Arc::new(Tensor::from_raw(bytes.clone(), &shape, info.dtype)),
                );
            } else if graph.inputs.contains(&info.name) {
                // Every dimension must be concrete at execution time;
                // symbolic input dims resolve through the overrides.
                if let Ok(shape) = info.shape.resolve(&options.free_dimension_overrides) {
                    input_shapes.insert(id, shape);
                } else if matches!(info.shape, TensorShape::Unknown) {
                    return Err(Error::InvalidArgument(format!(
                        "graph input '{}' has no shape",
                        info.name
                    )));
                }
                // Named dims without overrides are checked against the fed
                // tensor at run time instead.
            }
        }

        // Kernel resolution, once per node, reused across runs.
        let order = schedule(&graph)?;
        let mut plan = Vec::with_capacity(order.len());
        for node_index in order {
            let node = &graph.nodes[node_index];
            let opset = graph.opset_for(&node.domain);
            let input_types: Vec<Option<DataType>> = node
                .inputs
                .iter()
                .map(|name| {
                    if name.is_empty() {
                        None
                    } else {
                        graph.tensor_by_name(name).ok().map(|info| info.dtype)
                    }
                })
                .collect();

            let def = registry.resolve(&node.op_type, &node.domain, opset, &input_types, &backends)?;
            let kernel = def.create(node)?;
            tracing::debug!(
                op = %node.op_type,
                node = %node.name,
                backend = ?def.backend(),
                opset,
                "kernel constructed"
            );
            plan.push(NodePlan {
                node_index,
                backend: def.backend(),
                kernel,
                requested: node.outputs.iter().map(|name| !name.is_empty()).collect(),
            });
        }

        let profiler = options.enable_profiling.then(|| Mutex::new(Vec::new()));

        Ok(Self {
            env,
            graph,
            plan,
            initial_values,
            input_shapes,
            gpu,
            allocator: CpuAllocator::new(),
            profiler,
            started: Instant::now(),
            options,
        })
    }

    /// Load a session from serialized graph bytes.
    ///
    /// The graph loader proper is an external collaborator; this decodes its
    /// already-structured JSON interchange form.
    pub fn from_bytes(env: Arc<Env>, bytes: &[u8], options: SessionOptions) -> Result<Self> {
        let graph: Graph = serde_json::from_slice(bytes)
            .map_err(|e| Error::InvalidArgument(format!("malformed model bytes: {}", e)))?;
        Self::from_graph(env, graph, options)
    }

    /// The loaded graph.
    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// The GPU context, when the GPU provider is active.
    pub fn gpu(&self) -> Option<&Arc<GpuContext>> {
        self.gpu.as_ref()
    }

    /// Number of graph inputs.
    pub fn input_count(&self) -> usize {
        self.graph.inputs.len()
    }

    /// Number of graph outputs.
    pub fn output_count(&self) -> usize {
        self.graph.outputs.len()
    }

    /// Name, element type, and (possibly symbolic) shape for input `index`,
    /// or for output `index - input_count()` past the inputs.
    pub fn io_metadata(&self, index: usize) -> Result<(String, DataType, TensorShape)> {
        let input_count = self.input_count();
        let name = if index < input_count {
            &self.graph.inputs[index]
        } else if index < input_count + self.output_count() {
            &self.graph.outputs[index - input_count]
        } else {
            return Err(Error::InvalidArgument(format!(
                "invalid index: {}, input count: {}, output count: {}",
                index,
                input_count,
                self.output_count()
            )));
        };
        let info = self.graph.tensor_by_name(name)?;
        Ok((info.name.clone(), info.dtype, info.shape.clone()))
    }

    /// Execute the graph synchronously.
    ///
    /// Inputs are bound by name; requested outputs are returned in the order
    /// of `output_names`. Nothing is copied beyond what kernels themselves
    /// allocate.
    pub fn run(
        &self,
        inputs: &[(&str, Arc<Tensor>)],
        output_names: &[&str],
        run_options: Option<&RunOptions>,
    ) -> Result<Vec<Arc<Tensor>>> {
        let mut values = self.initial_values.clone();

        for (name, tensor) in inputs {
            let id = self.graph.tensor_id(name)?;
            let info = self.graph.tensor(id)?;
            if info.dtype != tensor.dtype() {
                return Err(Error::InvalidArgument(format!(
                    "input '{}' expects {:?}, got {:?}",
                    name,
                    info.dtype,
                    tensor.dtype()
                )));
            }
            if let Some(expected) = self.input_shapes.get(&id) {
                if expected != tensor.shape() {
                    return Err(Error::InvalidArgument(format!(
                        "input '{}' expects shape {:?}, got {:?}",
                        name,
                        expected,
                        tensor.shape()
                    )));
                }
            }
            values.insert(id, Arc::clone(tensor));
        }

        for name in &self.graph.inputs {
            let id = self.graph.tensor_id(name)?;
            if !values.contains_key(&id) {
                return Err(Error::InvalidArgument(format!(
                    "missing feed for input '{}'",
                    name
                )));
            }
        }

        if let Some(options) = run_options {
            if !options.tag.is_empty() {
                tracing::debug!(tag = %options.tag, "run started");
            }
        }

        for plan in &self.plan {
            // Coarse-grained cooperative cancellation between node
            // invocations; truncated results are discarded, not returned.
            if run_options.is_some_and(|o| o.is_terminated()) {
                return Err(Error::RuntimeFault("run terminated".to_string()));
            }

            let node = &self.graph.nodes[plan.node_index];
            let node_started = Instant::now();

            let gathered: Vec<Option<Arc<Tensor>>> = node
                .inputs
                .iter()
                .map(|name| {
                    if name.is_empty() {
                        Ok(None)
                    } else {
                        let id = self.graph.tensor_id(name)?;
                        values.get(&id).cloned().map(Some).ok_or_else(|| {
                            Error::InvalidArgument(format!(
                                "node '{}' input '{}' was never produced",
                                node.op_type, name
                            ))
                        })
                    }
                })
                .collect::<Result<_>>()?;
            let input_refs: Vec<Option<&Tensor>> =
                gathered.iter().map(|t| t.as_deref()).collect();

            let resources: Option<&dyn BackendResources> = match plan.backend {
                BackendKind::Wgpu => self.gpu.as_deref().map(|g| g as &dyn BackendResources),
                BackendKind::Cpu => None,
            };

            let mut ctx = KernelContext::new(
                node,
                input_refs,
                plan.requested.clone(),
                self.env.task_pool(),
                &self.allocator,
                resources,
            );
            plan.kernel.compute(&mut ctx)?;

            for (slot, output) in ctx.into_outputs().into_iter().enumerate() {
                let Some(output) = output else { continue };
                let name = &node.outputs[slot];
                if !name.is_empty() {
                    values.insert(self.graph.tensor_id(name)?, Arc::new(output));
                }
            }

            if let Some(profiler) = &self.profiler {
                profiler.lock().unwrap().push(ProfileEvent {
                    name: node.name.clone(),
                    op_type: node.op_type.clone(),
                    ts_us: node_started.duration_since(self.started).as_micros(),
                    dur_us: node_started.elapsed().as_micros(),
                });
            }
        }

        output_names
            .iter()
            .map(|name| {
                let id = self.graph.tensor_id(name)?;
                values.get(&id).cloned().ok_or_else(|| {
                    Error::InvalidArgument(format!("output '{}' was not produced", name))
                })
            })
            .collect()
    }

    /// Finish profiling and write captured events to a JSON file, returning
    /// its path.
    pub fn end_profiling(&self) -> Result<String> {
        let profiler = self.profiler.as_ref().ok_or_else(|| {
            Error::InvalidArgument("profiling was not enabled for this session".to_string())
        })?;
        let events = profiler.lock().unwrap().clone();

        let prefix = if self.options.log_id.is_empty() {
            "cinnabar"
        } else {
            &self.options.log_id
        };
        let path = std::env::temp_dir().join(format!(
            "{}_{}_profile.json",
            prefix,
            std::process::id()
        ));
        let json = serde_json::to_string_pretty(&events)
            .map_err(|e| Error::RuntimeFault(format!("failed to serialize profile: {}", e)))?;
        std::fs::write(&path, json)
            .map_err(|e| Error::RuntimeFault(format!("failed to write profile: {}", e)))?;
        Ok(path.to_string_lossy().into_owned())
    }

}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("nodes", &self.plan.len())
            .field("inputs", &self.graph.inputs)
            .field("outputs", &self.graph.outputs)
            .finish()
    }
}

/// Map requested providers to backends in preference order, initializing
/// device contexts as needed. The CPU provider is always the final fallback.
fn resolve_backends(
    options: &SessionOptions,
) -> Result<(Vec<BackendKind>, Option<Arc<GpuContext>>)> {
    let mut backends = Vec::new();
    let mut gpu = None;

    for provider in &options.providers {
        let kind = BackendKind::from_provider_name(&provider.name).ok_or_else(|| {
            Error::InvalidArgument(format!("unknown execution provider '{}'", provider.name))
        })?;
        if backends.contains(&kind) {
            continue;
        }
        match kind {
            BackendKind::Cpu => backends.push(kind),
            BackendKind::Wgpu => match GpuContext::new_blocking() {
                Ok(context) => {
                    gpu = Some(Arc::new(context));
                    backends.push(kind);
                }
                // No adapter on this machine: fall back to the remaining
                // providers rather than failing the whole session.
                Err(e) => {
                    tracing::warn!(error = %e, "GPU provider unavailable, falling back");
                }
            },
        }
    }

    if !backends.contains(&BackendKind::Cpu) {
        backends.push(BackendKind::Cpu);
    }
    Ok((backends, gpu))
}

/// Topologically order the nodes by tensor dependencies.
fn schedule(graph: &Graph) -> Result<Vec<usize>> {
    let mut dag = DiGraph::<usize, ()>::new();
    let indices: Vec<_> = (0..graph.nodes.len()).map(|i| dag.add_node(i)).collect();

    let mut producer: HashMap<&str, usize> = HashMap::new();
    for (i, node) in graph.nodes.iter().enumerate() {
        for output in &node.outputs {
            if !output.is_empty() {
                producer.insert(output.as_str(), i);
            }
        }
    }
    for (i, node) in graph.nodes.iter().enumerate() {
        for input in &node.inputs {
            if let Some(&p) = producer.get(input.as_str()) {
                dag.add_edge(indices[p], indices[i], ());
            }
        }
    }

    let order = toposort(&dag, None).map_err(|_| {
        // The external loader guarantees acyclicity; a cycle here means the
        // graph bytes were corrupt.
        Error::InvalidArgument("graph contains a cycle".to_string())
    })?;
    Ok(order.into_iter().map(|ix| dag[ix]).collect())
}
