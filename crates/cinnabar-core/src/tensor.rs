//! Tensor storage with owned, borrowed, string, and device-resident data.

use crate::types::{DataType, MemoryLocation};
use crate::{Error, Result};
use bytemuck::Pod;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Maps a Rust element type to its [`DataType`] tag.
///
/// Implemented for the closed set of fixed-width element types the engine
/// supports. The tag is resolved once at tensor construction, never
/// per-element.
pub trait Element: Pod {
    const DATA_TYPE: DataType;
}

impl Element for f32 {
    const DATA_TYPE: DataType = DataType::F32;
}
impl Element for f64 {
    const DATA_TYPE: DataType = DataType::F64;
}
impl Element for half::f16 {
    const DATA_TYPE: DataType = DataType::F16;
}
impl Element for i8 {
    const DATA_TYPE: DataType = DataType::I8;
}
impl Element for u8 {
    const DATA_TYPE: DataType = DataType::U8;
}
impl Element for i32 {
    const DATA_TYPE: DataType = DataType::I32;
}
impl Element for u32 {
    const DATA_TYPE: DataType = DataType::U32;
}
impl Element for i64 {
    const DATA_TYPE: DataType = DataType::I64;
}
impl Element for u64 {
    const DATA_TYPE: DataType = DataType::U64;
}

/// A buffer resident on a compute device rather than in host memory.
///
/// Implemented by each device backend. Reading the contents back is always
/// an explicit, synchronous copy.
pub trait DeviceBuffer: Send + Sync + fmt::Debug {
    /// Which device family owns the buffer.
    fn location(&self) -> MemoryLocation;

    /// Total size in bytes.
    fn byte_len(&self) -> usize;

    /// Copy the buffer contents back to host memory.
    fn read_to_vec(&self) -> Result<Vec<u8>>;

    /// Downcasting support for backend kernels.
    fn as_any(&self) -> &dyn Any;
}

/// Internal tensor data representation.
#[derive(Debug, Clone)]
enum TensorData {
    /// Data owned by the engine (freed when the tensor is released).
    Owned(Vec<u8>),

    /// Caller-owned data the engine must never free.
    ///
    /// The pointer is only dereferenced while the creating caller guarantees
    /// the allocation outlives the tensor; see [`Tensor::from_external`].
    External { ptr: *mut u8, len: usize },

    /// String tensors are a sequence of independently-owned string buffers,
    /// never fixed-width bytes.
    Strings(Vec<String>),

    /// Data resident on a compute device.
    Device(Arc<dyn DeviceBuffer>),
}

// External data is only touched under the boundary contract: the caller owns
// the allocation and keeps it alive and unaliased for the duration of every
// run the tensor participates in.
unsafe impl Send for TensorData {}
unsafe impl Sync for TensorData {}

/// Tensor: immutable shape, element type tag, memory location tag, and a raw
/// data handle whose ownership is either engine-owned or borrowed.
#[derive(Debug, Clone)]
pub struct Tensor {
    data: TensorData,
    shape: Vec<usize>,
    dtype: DataType,
    location: MemoryLocation,
}

impl Tensor {
    /// Create a host tensor from a typed vector.
    ///
    /// # Example
    /// ```
    /// # use cinnabar_core::Tensor;
    /// let t = Tensor::from_vec(vec![1.0f32, 2.0, 3.0, 4.0], &[2, 2]);
    /// assert_eq!(t.shape(), &[2, 2]);
    /// ```
    pub fn from_vec<T: Element>(data: Vec<T>, shape: &[usize]) -> Self {
        let expected_len: usize = shape.iter().product();
        assert_eq!(
            data.len(),
            expected_len,
            "Data length {} doesn't match shape {:?} (expected {})",
            data.len(),
            shape,
            expected_len
        );
        let bytes = bytemuck::cast_slice(&data).to_vec();
        Self {
            data: TensorData::Owned(bytes),
            shape: shape.to_vec(),
            dtype: T::DATA_TYPE,
            location: MemoryLocation::Cpu,
        }
    }

    /// Create a host tensor from raw bytes.
    pub fn from_raw(data: Vec<u8>, shape: &[usize], dtype: DataType) -> Self {
        Self {
            data: TensorData::Owned(data),
            shape: shape.to_vec(),
            dtype,
            location: MemoryLocation::Cpu,
        }
    }

    /// Create a string tensor. String tensors always reside in host memory.
    pub fn from_strings(strings: Vec<String>, shape: &[usize]) -> Self {
        let expected_len: usize = shape.iter().product();
        assert_eq!(
            strings.len(),
            expected_len,
            "String count {} doesn't match shape {:?}",
            strings.len(),
            shape
        );
        Self {
            data: TensorData::Strings(strings),
            shape: shape.to_vec(),
            dtype: DataType::Str,
            location: MemoryLocation::Cpu,
        }
    }

    /// Create a tensor over a device-resident buffer.
    pub fn from_device(
        buffer: Arc<dyn DeviceBuffer>,
        shape: &[usize],
        dtype: DataType,
    ) -> Self {
        let location = buffer.location();
        Self {
            data: TensorData::Device(buffer),
            shape: shape.to_vec(),
            dtype,
            location,
        }
    }

    /// Create a tensor borrowing caller-owned memory. The engine never frees
    /// the allocation.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for reads of `len` bytes for the entire lifetime
    /// of the tensor, and must not be mutated by the caller while a run that
    /// uses the tensor is in flight.
    pub unsafe fn from_external(
        ptr: *mut u8,
        len: usize,
        shape: &[usize],
        dtype: DataType,
        location: MemoryLocation,
    ) -> Self {
        Self {
            data: TensorData::External { ptr, len },
            shape: shape.to_vec(),
            dtype,
            location,
        }
    }

    /// Get the shape of the tensor.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Get the element type of the tensor.
    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    /// Get the memory location of the tensor's data.
    pub fn location(&self) -> MemoryLocation {
        self.location
    }

    /// Total element count = product of dimensions.
    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    /// Check if the tensor has zero volume.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the engine owns the underlying allocation.
    pub fn is_owned(&self) -> bool {
        !matches!(self.data, TensorData::External { .. })
    }

    /// Raw bytes of a host tensor.
    ///
    /// # Errors
    /// `NotImplemented` for string and device tensors, which have no flat
    /// byte representation in host memory.
    pub fn as_bytes(&self) -> Result<&[u8]> {
        match &self.data {
            TensorData::Owned(bytes) => Ok(bytes),
            TensorData::External { ptr, len } => {
                Ok(unsafe { std::slice::from_raw_parts(*ptr, *len) })
            }
            TensorData::Strings(_) => Err(Error::NotImplemented(
                "string tensors have no raw byte representation".to_string(),
            )),
            TensorData::Device(_) => Err(Error::NotImplemented(
                "reading raw data from a device tensor is not supported".to_string(),
            )),
        }
    }

    /// Mutable raw bytes of an engine-owned host tensor.
    pub fn as_bytes_mut(&mut self) -> Result<&mut [u8]> {
        match &mut self.data {
            TensorData::Owned(bytes) => Ok(bytes),
            TensorData::External { ptr, len } => {
                Ok(unsafe { std::slice::from_raw_parts_mut(*ptr, *len) })
            }
            TensorData::Strings(_) | TensorData::Device(_) => Err(Error::NotImplemented(
                "tensor has no mutable raw byte representation".to_string(),
            )),
        }
    }

    /// Get a typed view of the tensor data.
    ///
    /// # Errors
    /// `InvalidArgument` if `T` does not match the tensor's element type.
    pub fn as_slice<T: Element>(&self) -> Result<&[T]> {
        if T::DATA_TYPE != self.dtype {
            return Err(Error::InvalidArgument(format!(
                "requested {:?} view of {:?} tensor",
                T::DATA_TYPE,
                self.dtype
            )));
        }
        Ok(bytemuck::cast_slice(self.as_bytes()?))
    }

    /// Get a mutable typed view of the tensor data.
    pub fn as_slice_mut<T: Element>(&mut self) -> Result<&mut [T]> {
        if T::DATA_TYPE != self.dtype {
            return Err(Error::InvalidArgument(format!(
                "requested {:?} view of {:?} tensor",
                T::DATA_TYPE,
                self.dtype
            )));
        }
        Ok(bytemuck::cast_slice_mut(self.as_bytes_mut()?))
    }

    /// Copy the tensor data into a typed vector.
    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>> {
        Ok(self.as_slice::<T>()?.to_vec())
    }

    /// The string contents of a string tensor.
    pub fn strings(&self) -> Result<&[String]> {
        match &self.data {
            TensorData::Strings(strings) => Ok(strings),
            _ => Err(Error::InvalidArgument(format!(
                "requested string view of {:?} tensor",
                self.dtype
            ))),
        }
    }

    /// The device buffer backing a device tensor, if any.
    pub fn device_buffer(&self) -> Option<&Arc<dyn DeviceBuffer>> {
        match &self.data {
            TensorData::Device(buffer) => Some(buffer),
            _ => None,
        }
    }

    /// Write into a borrowed (caller-owned) tensor's memory.
    ///
    /// Bound output tensors cross the boundary as borrowed buffers the
    /// caller declared writable; this is the engine's only write path into
    /// them. Fails for any other storage kind, and when the byte count does
    /// not match the allocation.
    pub fn write_external(&self, bytes: &[u8]) -> Result<()> {
        match &self.data {
            TensorData::External { ptr, len } => {
                if bytes.len() != *len {
                    return Err(Error::InvalidArgument(format!(
                        "bound output expects {} bytes, got {}",
                        len,
                        bytes.len()
                    )));
                }
                unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), *ptr, bytes.len()) };
                Ok(())
            }
            _ => Err(Error::InvalidArgument(
                "tensor is not a caller-owned buffer".to_string(),
            )),
        }
    }

    /// Size of the tensor data in bytes.
    pub fn byte_len(&self) -> Result<usize> {
        match &self.data {
            TensorData::Owned(bytes) => Ok(bytes.len()),
            TensorData::External { len, .. } => Ok(*len),
            TensorData::Device(buffer) => Ok(buffer.byte_len()),
            TensorData::Strings(_) => Err(Error::NotImplemented(
                "string tensors have no fixed byte length".to_string(),
            )),
        }
    }
}
