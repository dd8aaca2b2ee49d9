//! Typed allocation on named devices.
//!
//! Allocators are shared process-wide and must be thread-safe for concurrent
//! allocation from independent runs. A buffer allocated here is owned by the
//! tensor that wraps it and freed when that tensor is released.

use crate::tensor::Tensor;
use crate::types::{DataType, MemoryLocation};
use crate::{Error, Result};

/// Allocation seam for one device family.
///
/// CPU allocation is implemented here; device backends provide their own
/// implementations that produce device-resident tensors.
pub trait DeviceAllocator: Send + Sync {
    /// The memory location this allocator serves.
    fn location(&self) -> MemoryLocation;

    /// Allocate a zero-initialized tensor of the given type and shape.
    fn alloc_tensor(&self, dtype: DataType, shape: &[usize]) -> Result<Tensor>;
}

/// Host-memory allocator, also used for the pinned location.
///
/// Pinned allocations only differ from plain host allocations when a device
/// runtime is wired to page-lock them; here both are plain host memory
/// carrying their location tag.
#[derive(Debug, Clone, Copy)]
pub struct CpuAllocator {
    location: MemoryLocation,
}

impl CpuAllocator {
    /// Allocator for plain host memory.
    pub fn new() -> Self {
        Self {
            location: MemoryLocation::Cpu,
        }
    }

    /// Allocator tagged as pinned host memory.
    pub fn pinned() -> Self {
        Self {
            location: MemoryLocation::CpuPinned,
        }
    }
}

impl Default for CpuAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceAllocator for CpuAllocator {
    fn location(&self) -> MemoryLocation {
        self.location
    }

    fn alloc_tensor(&self, dtype: DataType, shape: &[usize]) -> Result<Tensor> {
        if dtype == DataType::Str {
            let count: usize = shape.iter().product();
            return Ok(Tensor::from_strings(vec![String::new(); count], shape));
        }
        let element_size = dtype.fixed_size().ok_or_else(|| {
            Error::InvalidArgument(format!("cannot allocate {:?} elements", dtype))
        })?;
        let count: usize = shape.iter().product();
        let bytes = count.checked_mul(element_size).ok_or_else(|| {
            Error::InvalidArgument(format!("tensor byte size overflow for shape {:?}", shape))
        })?;
        Ok(Tensor::from_raw(vec![0u8; bytes], shape, dtype))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_alloc_zeroed() {
        let allocator = CpuAllocator::new();
        let tensor = allocator.alloc_tensor(DataType::F32, &[2, 3]).unwrap();
        assert_eq!(tensor.shape(), &[2, 3]);
        assert_eq!(tensor.dtype(), DataType::F32);
        assert_eq!(tensor.to_vec::<f32>().unwrap(), vec![0.0; 6]);
    }

    #[test]
    fn test_pinned_location_tag() {
        let allocator = CpuAllocator::pinned();
        assert_eq!(allocator.location(), MemoryLocation::CpuPinned);
    }

    #[test]
    fn test_string_alloc() {
        let allocator = CpuAllocator::new();
        let tensor = allocator.alloc_tensor(DataType::Str, &[3]).unwrap();
        assert_eq!(tensor.strings().unwrap().len(), 3);
    }
}
