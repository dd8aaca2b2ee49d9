//! Core types for tensor element types, shapes, and memory locations.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Tensor element type.
///
/// The numeric tags follow the wire convention used across the C boundary,
/// so `tag()`/`from_tag()` round-trip through host code without a mapping
/// table on the other side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    F32,
    U8,
    I8,
    I32,
    I64,
    Str,
    Bool,
    F16,
    F64,
    U32,
    U64,
}

impl DataType {
    /// Size of one element in bytes, or `None` for string tensors, whose
    /// elements are independently-owned buffers rather than fixed-width
    /// values.
    pub fn fixed_size(&self) -> Option<usize> {
        match self {
            DataType::F32 | DataType::I32 | DataType::U32 => Some(4),
            DataType::F64 | DataType::I64 | DataType::U64 => Some(8),
            DataType::F16 => Some(2),
            DataType::U8 | DataType::I8 | DataType::Bool => Some(1),
            DataType::Str => None,
        }
    }

    /// Whether this is a floating-point type.
    pub fn is_float(&self) -> bool {
        matches!(self, DataType::F32 | DataType::F16 | DataType::F64)
    }

    /// The integer tag used across the C boundary.
    pub fn tag(&self) -> i32 {
        match self {
            DataType::F32 => 1,
            DataType::U8 => 2,
            DataType::I8 => 3,
            DataType::I32 => 6,
            DataType::I64 => 7,
            DataType::Str => 8,
            DataType::Bool => 9,
            DataType::F16 => 10,
            DataType::F64 => 11,
            DataType::U32 => 12,
            DataType::U64 => 13,
        }
    }

    /// Parse a boundary tag. Returns `None` for unknown tags.
    pub fn from_tag(tag: i32) -> Option<Self> {
        match tag {
            1 => Some(DataType::F32),
            2 => Some(DataType::U8),
            3 => Some(DataType::I8),
            6 => Some(DataType::I32),
            7 => Some(DataType::I64),
            8 => Some(DataType::Str),
            9 => Some(DataType::Bool),
            10 => Some(DataType::F16),
            11 => Some(DataType::F64),
            12 => Some(DataType::U32),
            13 => Some(DataType::U64),
            _ => None,
        }
    }
}

/// Where a tensor's raw data lives.
///
/// Values outside this set are rejected at the boundary before reaching any
/// kernel. The numeric tags match the host-side convention; note that tag 3
/// is intentionally absent (a legacy texture location this engine does not
/// accept).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemoryLocation {
    /// No location (only meaningful for output bindings that let the engine
    /// pick the device).
    None,
    /// Host memory.
    Cpu,
    /// Page-locked host memory.
    CpuPinned,
    /// GPU storage buffer.
    GpuBuffer,
    /// Accelerator-managed tensor memory.
    AcceleratorTensor,
}

impl MemoryLocation {
    /// The integer tag used across the C boundary.
    pub fn tag(&self) -> i32 {
        match self {
            MemoryLocation::None => 0,
            MemoryLocation::Cpu => 1,
            MemoryLocation::CpuPinned => 2,
            MemoryLocation::GpuBuffer => 4,
            MemoryLocation::AcceleratorTensor => 5,
        }
    }

    /// Parse a boundary tag. Returns `None` for values outside the valid set.
    pub fn from_tag(tag: i32) -> Option<Self> {
        match tag {
            0 => Some(MemoryLocation::None),
            1 => Some(MemoryLocation::Cpu),
            2 => Some(MemoryLocation::CpuPinned),
            4 => Some(MemoryLocation::GpuBuffer),
            5 => Some(MemoryLocation::AcceleratorTensor),
            _ => None,
        }
    }

    /// Whether data at this location is directly addressable host memory.
    pub fn is_host(&self) -> bool {
        matches!(self, MemoryLocation::Cpu | MemoryLocation::CpuPinned)
    }
}

/// Tensor shape with support for static and symbolic dimensions.
///
/// Symbolic dimensions may exist in a loaded graph, but every shape must be
/// concrete by execution time; the session resolves named dimensions from
/// the free-dimension overrides before any kernel runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TensorShape {
    /// All dimensions are known.
    Static(Vec<usize>),

    /// Mix of fixed and named dimensions (e.g., `[batch, 128, 64]`).
    Symbolic(Vec<SymbolicDim>),

    /// Shape is not known at all (must be resolved before execution).
    Unknown,
}

/// A single dimension in a symbolic tensor shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SymbolicDim {
    /// Fixed dimension size.
    Fixed(usize),

    /// Named dimension resolved from overrides at load time.
    Named(String),
}

impl TensorShape {
    /// Check if the shape is fully static.
    pub fn is_static(&self) -> bool {
        matches!(self, TensorShape::Static(_))
    }

    /// Get static dimensions if available.
    pub fn as_static(&self) -> Option<&[usize]> {
        match self {
            TensorShape::Static(dims) => Some(dims),
            _ => None,
        }
    }

    /// Number of dimensions, if known.
    pub fn ndim(&self) -> Option<usize> {
        match self {
            TensorShape::Static(dims) => Some(dims.len()),
            TensorShape::Symbolic(dims) => Some(dims.len()),
            TensorShape::Unknown => None,
        }
    }

    /// Resolve to concrete dimensions.
    ///
    /// Named dimensions are looked up in `overrides`; a name without an
    /// override is an `InvalidArgument` error, as is an `Unknown` shape.
    pub fn resolve(&self, overrides: &HashMap<String, usize>) -> Result<Vec<usize>> {
        match self {
            TensorShape::Static(dims) => Ok(dims.clone()),
            TensorShape::Symbolic(dims) => {
                let mut resolved = Vec::with_capacity(dims.len());
                for dim in dims {
                    match dim {
                        SymbolicDim::Fixed(n) => resolved.push(*n),
                        SymbolicDim::Named(name) => {
                            let n = overrides.get(name).ok_or_else(|| {
                                Error::InvalidArgument(format!(
                                    "symbolic dimension '{}' has no override",
                                    name
                                ))
                            })?;
                            resolved.push(*n);
                        }
                    }
                }
                Ok(resolved)
            }
            TensorShape::Unknown => Err(Error::InvalidArgument(
                "cannot resolve unknown shape".to_string(),
            )),
        }
    }
}
