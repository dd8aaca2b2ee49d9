//! Boundary tests driving the extern "C" surface the way a host would.

use cinnabar_capi::*;
use cinnabar_core::{
    AttributeValue, DataType, Graph, Node, TensorInfo, TensorKind, TensorShape,
};
use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_void};
use std::ptr;
use std::sync::{Mutex, MutexGuard};

// The last-error slot is process-wide and last-write-wins, so the boundary
// tests serialize on one lock instead of racing each other's status.
static SERIAL: Mutex<()> = Mutex::new(());

fn init() -> MutexGuard<'static, ()> {
    let guard = SERIAL.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    assert_eq!(cinnabar_init(1, 2), 0);
    guard
}

/// Single-node MaxPool graph serialized the way the external loader hands
/// models to the boundary.
fn pool_model_bytes() -> Vec<u8> {
    let mut graph = Graph::new();
    graph.opset_imports.insert(String::new(), 12);
    graph.add_tensor(TensorInfo {
        name: "x".to_string(),
        dtype: DataType::F32,
        shape: TensorShape::Static(vec![1, 1, 4, 4]),
        kind: TensorKind::Input,
        initializer: None,
    });
    graph.add_tensor(TensorInfo {
        name: "y".to_string(),
        dtype: DataType::F32,
        shape: TensorShape::Static(vec![1, 1, 2, 2]),
        kind: TensorKind::Output,
        initializer: None,
    });
    let mut node = Node::new("MaxPool")
        .with_attr("kernel_shape", AttributeValue::Ints(vec![2, 2]))
        .with_attr("strides", AttributeValue::Ints(vec![2, 2]));
    node.inputs = vec!["x".to_string()];
    node.outputs = vec!["y".to_string()];
    graph.add_node(node);
    graph.inputs = vec!["x".to_string()];
    graph.outputs = vec!["y".to_string()];
    serde_json::to_vec(&graph).unwrap()
}

fn last_error() -> (i32, String) {
    let mut code = -1;
    let mut message: *const c_char = ptr::null();
    unsafe {
        assert_eq!(cinnabar_get_last_error(&mut code, &mut message), 0);
        let text = if message.is_null() {
            String::new()
        } else {
            CStr::from_ptr(message).to_string_lossy().into_owned()
        };
        (code, text)
    }
}

#[test]
fn test_session_lifecycle_through_the_boundary() {
    let _serial = init();
    let bytes = pool_model_bytes();

    unsafe {
        let options = cinnabar_create_session_options(
            99,
            true,
            true,
            0,
            false,
            ptr::null(),
            2,
            0,
            ptr::null(),
        );
        assert!(!options.is_null());

        let session = cinnabar_create_session(bytes.as_ptr(), bytes.len(), options);
        assert!(!session.is_null());
        assert_eq!(cinnabar_release_session_options(options), 0);

        let (mut inputs, mut outputs) = (0usize, 0usize);
        assert_eq!(
            cinnabar_get_input_output_count(session, &mut inputs, &mut outputs),
            0
        );
        assert_eq!((inputs, outputs), (1, 1));

        let name = cinnabar_get_input_name(session, 0);
        assert_eq!(CStr::from_ptr(name).to_str().unwrap(), "x");
        assert_eq!(cinnabar_free(name.cast()), 0);

        // Metadata flat buffer: type tag, dim count, dim values.
        let mut meta_name: *mut c_char = ptr::null_mut();
        let mut type_shape: *mut u8 = ptr::null_mut();
        assert_eq!(
            cinnabar_get_input_output_metadata(session, 0, &mut meta_name, &mut type_shape),
            0
        );
        assert_eq!(CStr::from_ptr(meta_name).to_str().unwrap(), "x");
        let tag = (type_shape as *const i32).read_unaligned();
        assert_eq!(tag, DataType::F32.tag());
        let dim_count = (type_shape.add(4) as *const u32).read_unaligned();
        assert_eq!(dim_count, 4);
        let values = type_shape.add(8 + 4 * std::mem::size_of::<usize>()) as *const usize;
        let dims: Vec<usize> = (0..4).map(|i| values.add(i).read_unaligned()).collect();
        assert_eq!(dims, vec![1, 1, 4, 4]);
        assert_eq!(cinnabar_free(meta_name.cast()), 0);
        assert_eq!(cinnabar_free(type_shape.cast()), 0);

        // Run.
        let mut x_data: Vec<f32> = (1..=16).map(|i| i as f32).collect();
        let dims = [1usize, 1, 4, 4];
        let x = cinnabar_create_tensor(
            DataType::F32.tag(),
            x_data.as_mut_ptr().cast(),
            x_data.len() * 4,
            dims.as_ptr(),
            dims.len(),
            1,
        );
        assert!(!x.is_null());

        let input_name = CString::new("x").unwrap();
        let output_name = CString::new("y").unwrap();
        let input_names = [input_name.as_ptr()];
        let output_names = [output_name.as_ptr()];
        let inputs_arr = [x as *const CTensor];
        let mut out_handle: *mut CTensor = ptr::null_mut();

        assert_eq!(
            cinnabar_run(
                session,
                input_names.as_ptr(),
                inputs_arr.as_ptr(),
                1,
                output_names.as_ptr(),
                1,
                &mut out_handle,
                ptr::null(),
            ),
            0
        );
        assert!(!out_handle.is_null());

        let mut dtype = 0usize;
        let mut data: *mut c_void = ptr::null_mut();
        let mut out_dims: *mut usize = ptr::null_mut();
        let mut out_rank = 0usize;
        assert_eq!(
            cinnabar_get_tensor_data(out_handle, &mut dtype, &mut data, &mut out_dims, &mut out_rank),
            0
        );
        assert_eq!(dtype, DataType::F32.tag() as usize);
        assert_eq!(out_rank, 4);
        let shape: Vec<usize> = (0..out_rank).map(|i| *out_dims.add(i)).collect();
        assert_eq!(shape, vec![1, 1, 2, 2]);
        let result = std::slice::from_raw_parts(data as *const f32, 4);
        assert_eq!(result, &[6.0, 8.0, 14.0, 16.0]);
        assert_eq!(cinnabar_free(out_dims.cast()), 0);

        assert_eq!(cinnabar_release_tensor(out_handle), 0);
        assert_eq!(cinnabar_release_tensor(x), 0);
        assert_eq!(cinnabar_release_session(session), 0);
    }
}

#[test]
fn test_numeric_tensor_round_trip() {
    let _serial = init();
    let mut data: Vec<i64> = vec![-3, 0, 7, 42, -9, 11];
    let dims = [2usize, 3];
    unsafe {
        let tensor = cinnabar_create_tensor(
            DataType::I64.tag(),
            data.as_mut_ptr().cast(),
            data.len() * 8,
            dims.as_ptr(),
            dims.len(),
            1,
        );
        assert!(!tensor.is_null());

        let mut dtype = 0usize;
        let mut out: *mut c_void = ptr::null_mut();
        let mut out_dims: *mut usize = ptr::null_mut();
        let mut rank = 0usize;
        assert_eq!(
            cinnabar_get_tensor_data(tensor, &mut dtype, &mut out, &mut out_dims, &mut rank),
            0
        );
        assert_eq!(dtype, DataType::I64.tag() as usize);
        assert_eq!(rank, 2);
        assert_eq!((*out_dims, *out_dims.add(1)), (2, 3));
        // Byte-identical contents, no copy: the pointer is the caller's own
        // buffer.
        assert_eq!(out as *const i64, data.as_ptr());
        let round = std::slice::from_raw_parts(out as *const i64, 6);
        assert_eq!(round, data.as_slice());

        assert_eq!(cinnabar_free(out_dims.cast()), 0);
        assert_eq!(cinnabar_release_tensor(tensor), 0);
    }
}

#[test]
fn test_string_tensor_round_trip() {
    let _serial = init();
    let a = CString::new("alpha").unwrap();
    let b = CString::new("").unwrap();
    let c = CString::new("gamma").unwrap();
    let ptrs = [a.as_ptr(), b.as_ptr(), c.as_ptr()];
    let dims = [3usize];
    unsafe {
        // data_location is ignored for string tensors.
        let tensor = cinnabar_create_tensor(
            DataType::Str.tag(),
            ptrs.as_ptr() as *mut c_void,
            ptrs.len() * std::mem::size_of::<*const c_char>(),
            dims.as_ptr(),
            dims.len(),
            4,
        );
        assert!(!tensor.is_null());

        let mut dtype = 0usize;
        let mut out: *mut c_void = ptr::null_mut();
        let mut out_dims: *mut usize = ptr::null_mut();
        let mut rank = 0usize;
        assert_eq!(
            cinnabar_get_tensor_data(tensor, &mut dtype, &mut out, &mut out_dims, &mut rank),
            0
        );
        assert_eq!(dtype, DataType::Str.tag() as usize);
        assert_eq!(rank, 1);
        assert_eq!(*out_dims, 3);

        // Pointer table into the trailing packed region.
        let table = out as *const usize;
        let strings: Vec<String> = (0..3)
            .map(|i| {
                CStr::from_ptr(table.add(i).read_unaligned() as *const c_char)
                    .to_string_lossy()
                    .into_owned()
            })
            .collect();
        assert_eq!(strings, vec!["alpha", "", "gamma"]);

        assert_eq!(cinnabar_free(out.cast()), 0);
        assert_eq!(cinnabar_free(out_dims.cast()), 0);
        assert_eq!(cinnabar_release_tensor(tensor), 0);
    }
}

#[test]
fn test_invalid_memory_location_sets_last_error() {
    let _serial = init();
    let mut data = [1.0f32];
    let dims = [1usize];
    unsafe {
        let tensor = cinnabar_create_tensor(
            DataType::F32.tag(),
            data.as_mut_ptr().cast(),
            4,
            dims.as_ptr(),
            1,
            99,
        );
        assert!(tensor.is_null());
        let (code, message) = last_error();
        assert_eq!(code, cinnabar_core::ErrorCode::InvalidArgument as i32);
        assert!(message.contains("Invalid data location: 99"), "{}", message);

        // The legacy texture tag (3) and the bare "none" tag (0) are also
        // rejected for tensor creation.
        for tag in [0, 3] {
            let tensor = cinnabar_create_tensor(
                DataType::F32.tag(),
                data.as_mut_ptr().cast(),
                4,
                dims.as_ptr(),
                1,
                tag,
            );
            assert!(tensor.is_null());
            let (code, _) = last_error();
            assert_eq!(code, cinnabar_core::ErrorCode::InvalidArgument as i32);
        }
    }
}

#[test]
fn test_terminated_run_reports_runtime_fault() {
    let _serial = init();
    let bytes = pool_model_bytes();
    unsafe {
        let session = cinnabar_create_session(bytes.as_ptr(), bytes.len(), ptr::null());
        assert!(!session.is_null());

        let run_options = cinnabar_create_run_options(2, 0, true, ptr::null());
        assert!(!run_options.is_null());

        let mut x_data = vec![0.0f32; 16];
        let dims = [1usize, 1, 4, 4];
        let x = cinnabar_create_tensor(
            DataType::F32.tag(),
            x_data.as_mut_ptr().cast(),
            64,
            dims.as_ptr(),
            4,
            1,
        );

        let input_name = CString::new("x").unwrap();
        let output_name = CString::new("y").unwrap();
        let mut out_handle: *mut CTensor = ptr::null_mut();
        let status = cinnabar_run(
            session,
            [input_name.as_ptr()].as_ptr(),
            [x as *const CTensor].as_ptr(),
            1,
            [output_name.as_ptr()].as_ptr(),
            1,
            &mut out_handle,
            run_options,
        );
        assert_eq!(status, cinnabar_core::ErrorCode::RuntimeFault as i32);

        assert_eq!(cinnabar_release_run_options(run_options), 0);
        assert_eq!(cinnabar_release_tensor(x), 0);
        assert_eq!(cinnabar_release_session(session), 0);
    }
}

#[test]
fn test_binding_through_the_boundary() {
    let _serial = init();
    let bytes = pool_model_bytes();
    unsafe {
        let session = cinnabar_create_session(bytes.as_ptr(), bytes.len(), ptr::null());
        assert!(!session.is_null());

        let binding = cinnabar_create_binding(session);
        assert!(!binding.is_null());

        let mut x_data: Vec<f32> = (1..=16).map(|i| i as f32).collect();
        let dims = [1usize, 1, 4, 4];
        let x = cinnabar_create_tensor(
            DataType::F32.tag(),
            x_data.as_mut_ptr().cast(),
            64,
            dims.as_ptr(),
            4,
            1,
        );
        let x_name = CString::new("x").unwrap();
        let y_name = CString::new("y").unwrap();
        assert_eq!(cinnabar_bind_input(binding, x_name.as_ptr(), x), 0);
        // Bind the output to the CPU location: the engine allocates.
        assert_eq!(cinnabar_bind_output(binding, y_name.as_ptr(), ptr::null(), 1), 0);

        let mut out_handle: *mut CTensor = ptr::null_mut();
        assert_eq!(
            cinnabar_run_with_binding(session, binding, 1, &mut out_handle, ptr::null()),
            0
        );
        assert!(!out_handle.is_null());

        let mut dtype = 0usize;
        let mut data: *mut c_void = ptr::null_mut();
        let mut out_dims: *mut usize = ptr::null_mut();
        let mut rank = 0usize;
        assert_eq!(
            cinnabar_get_tensor_data(out_handle, &mut dtype, &mut data, &mut out_dims, &mut rank),
            0
        );
        let result = std::slice::from_raw_parts(data as *const f32, 4);
        assert_eq!(result, &[6.0, 8.0, 14.0, 16.0]);

        assert_eq!(cinnabar_free(out_dims.cast()), 0);
        assert_eq!(cinnabar_release_tensor(out_handle), 0);
        assert_eq!(cinnabar_release_tensor(x), 0);
        assert_eq!(cinnabar_release_binding(binding), 0);
        assert_eq!(cinnabar_release_session(session), 0);
    }
}

#[test]
fn test_unknown_provider_is_rejected() {
    let _serial = init();
    let bytes = pool_model_bytes();
    unsafe {
        let options = cinnabar_create_session_options(
            99,
            true,
            true,
            0,
            false,
            ptr::null(),
            2,
            0,
            ptr::null(),
        );
        let name = CString::new("tpu").unwrap();
        assert_eq!(
            cinnabar_append_execution_provider(options, name.as_ptr(), ptr::null(), ptr::null(), 0),
            0
        );
        let session = cinnabar_create_session(bytes.as_ptr(), bytes.len(), options);
        assert!(session.is_null());
        let (code, _) = last_error();
        assert_eq!(code, cinnabar_core::ErrorCode::InvalidArgument as i32);
        assert_eq!(cinnabar_release_session_options(options), 0);
    }
}
