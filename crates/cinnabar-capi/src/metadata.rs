//! The flat type/shape metadata buffer.
//!
//! Layout (pointer size P = `size_of::<usize>()`):
//! - byte [0, 4):  i32 element-type tag
//! - byte [4, 8):  u32 dimension count
//! - byte [8, 8 + dimCount·P): per-dimension symbolic-name pointers
//!   (null for concrete dimensions), pointing into the trailing region
//! - byte [8 + dimCount·P, 8 + dimCount·2P): per-dimension values
//!   (0 for named dimensions)
//! - trailing region: nul-terminated copies of the symbolic names referenced
//!   by the pointer slots
//!
//! The whole buffer is one host allocation; the host reads offsets and
//! sizes, never the engine's native struct layout.

use crate::host_buffer;
use cinnabar_core::{DataType, SymbolicDim, TensorShape};

const PTR: usize = std::mem::size_of::<usize>();

/// One dimension as serialized: either a concrete value or a symbolic name.
enum DimEntry {
    Value(usize),
    Named(String),
}

fn dim_entries(shape: &TensorShape) -> Vec<DimEntry> {
    match shape {
        TensorShape::Static(dims) => dims.iter().map(|&d| DimEntry::Value(d)).collect(),
        TensorShape::Symbolic(dims) => dims
            .iter()
            .map(|dim| match dim {
                SymbolicDim::Fixed(d) => DimEntry::Value(*d),
                SymbolicDim::Named(name) => DimEntry::Named(name.clone()),
            })
            .collect(),
        TensorShape::Unknown => Vec::new(),
    }
}

/// Serialize element type and shape into a freshly allocated host buffer.
pub fn write_type_shape_buffer(dtype: DataType, shape: &TensorShape) -> *mut u8 {
    let entries = dim_entries(shape);
    let dim_count = entries.len();

    let names_len: usize = entries
        .iter()
        .map(|e| match e {
            DimEntry::Named(name) => name.len() + 1,
            DimEntry::Value(_) => 0,
        })
        .sum();
    let total = 8 + dim_count * PTR * 2 + names_len;

    let buffer = host_buffer::alloc_bytes(total);
    if buffer.is_null() {
        return buffer;
    }

    unsafe {
        (buffer as *mut i32).write_unaligned(dtype.tag());
        (buffer.add(4) as *mut u32).write_unaligned(dim_count as u32);

        let name_slots = buffer.add(8) as *mut usize;
        let value_slots = buffer.add(8 + dim_count * PTR) as *mut usize;
        let mut name_dest = buffer.add(8 + dim_count * PTR * 2);

        for (i, entry) in entries.iter().enumerate() {
            match entry {
                DimEntry::Value(value) => {
                    name_slots.add(i).write_unaligned(0);
                    value_slots.add(i).write_unaligned(*value);
                }
                DimEntry::Named(name) => {
                    name_slots.add(i).write_unaligned(name_dest as usize);
                    value_slots.add(i).write_unaligned(0);
                    std::ptr::copy_nonoverlapping(name.as_ptr(), name_dest, name.len());
                    name_dest.add(name.len()).write(0);
                    name_dest = name_dest.add(name.len() + 1);
                }
            }
        }
    }
    buffer
}

/// Host-side view of a serialized buffer, used by tests to verify the wire
/// contract the way an embedder would read it.
#[cfg(test)]
pub struct ParsedTypeShape {
    pub dtype_tag: i32,
    pub dims: Vec<(Option<String>, usize)>,
}

#[cfg(test)]
pub fn parse_type_shape_buffer(buffer: *const u8) -> ParsedTypeShape {
    unsafe {
        let dtype_tag = (buffer as *const i32).read_unaligned();
        let dim_count = (buffer.add(4) as *const u32).read_unaligned() as usize;
        let name_slots = buffer.add(8) as *const usize;
        let value_slots = buffer.add(8 + dim_count * PTR) as *const usize;

        let dims = (0..dim_count)
            .map(|i| {
                let name_ptr = name_slots.add(i).read_unaligned();
                let name = (name_ptr != 0).then(|| {
                    std::ffi::CStr::from_ptr(name_ptr as *const std::os::raw::c_char)
                        .to_string_lossy()
                        .into_owned()
                });
                (name, value_slots.add(i).read_unaligned())
            })
            .collect();
        ParsedTypeShape { dtype_tag, dims }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_shape_round_trip() {
        let buffer =
            write_type_shape_buffer(DataType::F32, &TensorShape::Static(vec![2, 3, 4]));
        let parsed = parse_type_shape_buffer(buffer);
        assert_eq!(parsed.dtype_tag, DataType::F32.tag());
        assert_eq!(
            parsed.dims,
            vec![(None, 2), (None, 3), (None, 4)]
        );
        unsafe { host_buffer::free(buffer) };
    }

    #[test]
    fn test_symbolic_names_copied_into_tail() {
        let shape = TensorShape::Symbolic(vec![
            SymbolicDim::Named("batch".to_string()),
            SymbolicDim::Fixed(128),
            SymbolicDim::Named("seq".to_string()),
        ]);
        let buffer = write_type_shape_buffer(DataType::F16, &shape);
        let parsed = parse_type_shape_buffer(buffer);
        assert_eq!(parsed.dtype_tag, DataType::F16.tag());
        assert_eq!(
            parsed.dims,
            vec![
                (Some("batch".to_string()), 0),
                (None, 128),
                (Some("seq".to_string()), 0),
            ]
        );
        unsafe { host_buffer::free(buffer) };
    }

    #[test]
    fn test_unknown_shape_has_no_dims() {
        let buffer = write_type_shape_buffer(DataType::I64, &TensorShape::Unknown);
        let parsed = parse_type_shape_buffer(buffer);
        assert_eq!(parsed.dtype_tag, DataType::I64.tag());
        assert!(parsed.dims.is_empty());
        unsafe { host_buffer::free(buffer) };
    }
}
