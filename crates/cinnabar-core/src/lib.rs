//! Core tensor, kernel, and dispatch abstractions for the Cinnabar inference engine.
//!
//! This crate provides the foundational types that all other Cinnabar crates
//! depend on:
//! - Tensor descriptors and tensor storage (`DataType`, `TensorShape`, `Tensor`)
//! - Graph and attribute types produced by the external graph loader
//! - The `Kernel` trait and per-invocation `KernelContext`
//! - The opset-versioned kernel registry used for execution-provider dispatch
//! - The device allocator seam and the fork-join `TaskPool`

pub mod allocator;
pub mod graph;
pub mod kernel;
pub mod registry;
pub mod tensor;
pub mod threadpool;
pub mod types;

// Re-export commonly used types
pub use allocator::{CpuAllocator, DeviceAllocator};
pub use graph::{AttributeValue, Graph, Node, NodeId, TensorId, TensorInfo, TensorKind};
pub use kernel::{BackendResources, Kernel, KernelContext};
pub use registry::{BackendKind, KernelDef, KernelDefBuilder, KernelRegistry, OpsetRange};
pub use tensor::{DeviceBuffer, Element, Tensor};
pub use threadpool::TaskPool;
pub use types::{DataType, MemoryLocation, SymbolicDim, TensorShape};

/// Result type using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Engine error type.
///
/// Every variant maps to exactly one [`ErrorCode`], which is what crosses
/// the C boundary. Kernel-level failures are deterministic for a given input
/// and are never retried; they abort the run that produced them.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Bad shape, bad enum value, bad rank, count mismatch.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// No registered kernel matches (operator, domain, opset, backend, types).
    #[error("Kernel not found: {0}")]
    KernelNotFound(String),

    /// The operation is unsupported for this value's runtime type.
    #[error("Not implemented: {0}")]
    NotImplemented(String),

    /// Backend execution failure (device error, allocation failure).
    #[error("Runtime fault: {0}")]
    RuntimeFault(String),
}

impl Error {
    /// The flat status code reported across the C boundary.
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::InvalidArgument(_) => ErrorCode::InvalidArgument,
            Error::KernelNotFound(_) => ErrorCode::KernelNotFound,
            Error::NotImplemented(_) => ErrorCode::NotImplemented,
            Error::RuntimeFault(_) => ErrorCode::RuntimeFault,
        }
    }
}

/// Integer status codes returned by every boundary operation.
///
/// `Ok` is zero; any nonzero value identifies the error kind. The
/// human-readable message for the most recent nonzero status is retrievable
/// through the boundary's last-error query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ErrorCode {
    Ok = 0,
    InvalidArgument = 1,
    KernelNotFound = 2,
    NotImplemented = 3,
    RuntimeFault = 4,
}
