//! Kernel trait and per-invocation execution context.

use crate::allocator::DeviceAllocator;
use crate::graph::Node;
use crate::tensor::Tensor;
use crate::threadpool::TaskPool;
use crate::types::DataType;
use crate::{Error, Result};
use std::any::Any;

/// Backend-specific session resources handed to kernels through the
/// execution context (e.g., a GPU device with its shader-program cache).
///
/// Kernels that need their backend's resources downcast through `as_any`.
pub trait BackendResources: Send + Sync {
    fn as_any(&self) -> &dyn Any;
}

/// A compute kernel: the concrete implementation of one operator for one
/// backend and opset range.
///
/// Kernels are constructed once per node for the lifetime of a loaded graph
/// and reused across runs. Construction does attribute parsing and
/// precomputation; after construction a kernel is immutable, which makes
/// concurrent runs over the same loaded graph safe without per-kernel
/// locking.
pub trait Kernel: Send + Sync {
    /// Execute the operator for one node invocation.
    ///
    /// The kernel validates input shapes, derives output shapes, requests
    /// output buffers from the context, and runs the backend compute,
    /// optionally via the context's task pool. Validation failures abort the
    /// node (and the run) with a typed error; they are never retried.
    fn compute(&self, ctx: &mut KernelContext<'_>) -> Result<()>;
}

/// Per-invocation execution state.
///
/// Created by the session for each node invocation and destroyed immediately
/// after: resolved input tensors, output request slots, a handle to the task
/// pool, and a handle to backend-specific session resources.
pub struct KernelContext<'a> {
    node: &'a Node,
    inputs: Vec<Option<&'a Tensor>>,
    outputs: Vec<Option<Tensor>>,
    requested: Vec<bool>,
    pool: &'a TaskPool,
    allocator: &'a dyn DeviceAllocator,
    resources: Option<&'a dyn BackendResources>,
}

impl<'a> KernelContext<'a> {
    /// Build a context for one node invocation.
    ///
    /// `inputs[i]` is `None` when the node's optional input slot `i` is
    /// absent. `requested[i]` is false when no consumer (graph output or
    /// downstream node) needs output slot `i`; kernels must not compute
    /// unrequested secondary outputs.
    pub fn new(
        node: &'a Node,
        inputs: Vec<Option<&'a Tensor>>,
        requested: Vec<bool>,
        pool: &'a TaskPool,
        allocator: &'a dyn DeviceAllocator,
        resources: Option<&'a dyn BackendResources>,
    ) -> Self {
        let outputs = (0..requested.len()).map(|_| None).collect();
        Self {
            node,
            inputs,
            outputs,
            requested,
            pool,
            allocator,
            resources,
        }
    }

    /// The node being executed.
    pub fn node(&self) -> &Node {
        self.node
    }

    /// Number of input slots (present or absent).
    pub fn input_count(&self) -> usize {
        self.inputs.len()
    }

    /// Get a required input tensor.
    pub fn input(&self, i: usize) -> Result<&'a Tensor> {
        self.inputs.get(i).copied().flatten().ok_or_else(|| {
            Error::InvalidArgument(format!(
                "node '{}' is missing required input {}",
                self.node.op_type, i
            ))
        })
    }

    /// Get an optional input tensor.
    pub fn input_opt(&self, i: usize) -> Option<&'a Tensor> {
        self.inputs.get(i).copied().flatten()
    }

    /// Whether output slot `i` was requested by the caller.
    ///
    /// Absence of a slot must not force computing its value.
    pub fn output_requested(&self, i: usize) -> bool {
        self.requested.get(i).copied().unwrap_or(false)
    }

    /// Number of output slots.
    pub fn output_count(&self) -> usize {
        self.requested.len()
    }

    /// Allocate output slot `i` with the shape derived by the kernel.
    ///
    /// The buffer comes from the context's allocator; the returned reference
    /// is valid until the context is consumed.
    pub fn allocate_output(
        &mut self,
        i: usize,
        dtype: DataType,
        shape: &[usize],
    ) -> Result<&mut Tensor> {
        if i >= self.outputs.len() {
            return Err(Error::InvalidArgument(format!(
                "node '{}' has no output slot {}",
                self.node.op_type, i
            )));
        }
        let tensor = self.allocator.alloc_tensor(dtype, shape)?;
        self.outputs[i] = Some(tensor);
        Ok(self.outputs[i].as_mut().unwrap())
    }

    /// Place an already-built tensor into output slot `i`.
    pub fn set_output(&mut self, i: usize, tensor: Tensor) -> Result<()> {
        if i >= self.outputs.len() {
            return Err(Error::InvalidArgument(format!(
                "node '{}' has no output slot {}",
                self.node.op_type, i
            )));
        }
        self.outputs[i] = Some(tensor);
        Ok(())
    }

    /// The task pool for parallel loop decomposition.
    pub fn thread_pool(&self) -> &'a TaskPool {
        self.pool
    }

    /// The allocator serving this invocation's output buffers.
    pub fn allocator(&self) -> &'a dyn DeviceAllocator {
        self.allocator
    }

    /// Downcast the backend resources to a concrete type.
    ///
    /// # Errors
    /// `RuntimeFault` when the session has no resources of that type, which
    /// means a kernel was dispatched to a backend whose context was never
    /// initialized.
    pub fn resources<T: BackendResources + 'static>(&self) -> Result<&'a T> {
        self.resources
            .and_then(|r| r.as_any().downcast_ref::<T>())
            .ok_or_else(|| {
                Error::RuntimeFault(format!(
                    "backend resources unavailable for node '{}'",
                    self.node.op_type
                ))
            })
    }

    /// Consume the context, yielding the produced outputs per slot.
    pub fn into_outputs(self) -> Vec<Option<Tensor>> {
        self.outputs
    }
}
