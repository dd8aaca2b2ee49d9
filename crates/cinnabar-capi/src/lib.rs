//! C boundary adapter for the Cinnabar inference engine.
//!
//! Every operation returns a small integer status code (0 = success); the
//! most recent failure's human-readable message is retrievable through
//! [`cinnabar_get_last_error`] until the next failing call overwrites it.
//! Handle-returning operations signal failure with a null handle. Nothing
//! ever unwinds across this boundary, and every buffer allocated for the
//! host is released only through [`cinnabar_free`]. This layer marshals and
//! releases resources; it holds no engine logic.

mod host_buffer;
mod metadata;

use cinnabar_core::{DataType, Error, ErrorCode, MemoryLocation, Tensor};
use cinnabar_runtime::{Env, IoBinding, RunOptions, Session, SessionOptions};
use std::ffi::CStr;
use std::os::raw::{c_char, c_void};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, OnceLock};

type Result<T> = std::result::Result<T, Error>;

/// Opaque tensor handle. Reference-counted so bound outputs can be
/// retrieved without copying.
pub struct CTensor(Arc<Tensor>);

static ENV: OnceLock<Arc<Env>> = OnceLock::new();

struct LastError {
    code: i32,
    message: std::ffi::CString,
}

static LAST_ERROR: Mutex<Option<LastError>> = Mutex::new(None);

fn clear_last_error() {
    *LAST_ERROR.lock().unwrap() = None;
}

fn set_last_error(error: &Error) -> i32 {
    let code = error.code() as i32;
    let message = std::ffi::CString::new(error.to_string())
        .unwrap_or_else(|_| std::ffi::CString::new("invalid error message").unwrap());
    tracing::debug!(code, message = %message.to_string_lossy(), "boundary error");
    *LAST_ERROR.lock().unwrap() = Some(LastError { code, message });
    code
}

/// Run a fallible status-returning operation without unwinding across the
/// boundary.
fn status_call(f: impl FnOnce() -> Result<()>) -> i32 {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => {
            clear_last_error();
            ErrorCode::Ok as i32
        }
        Ok(Err(error)) => set_last_error(&error),
        Err(_) => set_last_error(&Error::RuntimeFault(
            "panic reached the boundary".to_string(),
        )),
    }
}

/// Run a fallible handle-returning operation; failures yield null.
fn handle_call<T>(f: impl FnOnce() -> Result<*mut T>) -> *mut T {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(handle)) => {
            clear_last_error();
            handle
        }
        Ok(Err(error)) => {
            set_last_error(&error);
            std::ptr::null_mut()
        }
        Err(_) => {
            set_last_error(&Error::RuntimeFault(
                "panic reached the boundary".to_string(),
            ));
            std::ptr::null_mut()
        }
    }
}

unsafe fn cstr_arg(ptr: *const c_char, what: &str) -> Result<String> {
    if ptr.is_null() {
        return Err(Error::InvalidArgument(format!("{} is null", what)));
    }
    CStr::from_ptr(ptr)
        .to_str()
        .map(str::to_owned)
        .map_err(|_| Error::InvalidArgument(format!("{} is not valid UTF-8", what)))
}

unsafe fn deref<'a, T>(ptr: *const T, what: &str) -> Result<&'a T> {
    ptr.as_ref()
        .ok_or_else(|| Error::InvalidArgument(format!("{} handle is null", what)))
}

unsafe fn deref_mut<'a, T>(ptr: *mut T, what: &str) -> Result<&'a mut T> {
    ptr.as_mut()
        .ok_or_else(|| Error::InvalidArgument(format!("{} handle is null", what)))
}

fn env() -> Result<Arc<Env>> {
    ENV.get().cloned().ok_or_else(|| {
        Error::RuntimeFault("environment is not initialized; call cinnabar_init first".to_string())
    })
}

/// Initialize the engine environment: worker thread count and log level.
/// Idempotent; repeated calls keep the first environment.
#[no_mangle]
pub extern "C" fn cinnabar_init(num_threads: i32, logging_level: i32) -> i32 {
    status_call(|| {
        if ENV.get().is_some() {
            return Ok(());
        }
        let threads = num_threads.max(0) as usize;
        let env = Env::new(threads, logging_level)?;
        let _ = ENV.set(env);
        Ok(())
    })
}

/// Retrieve the status code and message of the most recent failing call.
/// The message pointer is valid until the next boundary call and must not
/// be freed.
///
/// # Safety
/// `error_code` and `error_message` must be valid for writes.
#[no_mangle]
pub unsafe extern "C" fn cinnabar_get_last_error(
    error_code: *mut i32,
    error_message: *mut *const c_char,
) -> i32 {
    if error_code.is_null() || error_message.is_null() {
        return ErrorCode::InvalidArgument as i32;
    }
    let guard = LAST_ERROR.lock().unwrap();
    match guard.as_ref() {
        Some(last) => {
            *error_code = last.code;
            *error_message = last.message.as_ptr();
        }
        None => {
            *error_code = ErrorCode::Ok as i32;
            *error_message = std::ptr::null();
        }
    }
    ErrorCode::Ok as i32
}

/// Create session options.
///
/// # Safety
/// `log_id` and `optimized_model_path` may be null; when non-null they must
/// be nul-terminated strings.
#[no_mangle]
pub unsafe extern "C" fn cinnabar_create_session_options(
    graph_optimization_level: usize,
    enable_cpu_mem_arena: bool,
    enable_mem_pattern: bool,
    execution_mode: usize,
    enable_profiling: bool,
    log_id: *const c_char,
    log_severity_level: usize,
    log_verbosity_level: usize,
    optimized_model_path: *const c_char,
) -> *mut SessionOptions {
    handle_call(|| {
        let mut options = SessionOptions {
            graph_optimization_level: graph_optimization_level as u32,
            enable_cpu_mem_arena,
            enable_mem_pattern,
            execution_mode: execution_mode as u32,
            enable_profiling,
            log_severity_level: log_severity_level as u32,
            log_verbosity_level: log_verbosity_level as u32,
            ..Default::default()
        };
        if !log_id.is_null() {
            options.log_id = cstr_arg(log_id, "log_id")?;
        }
        if !optimized_model_path.is_null() {
            options.optimized_model_path =
                Some(cstr_arg(optimized_model_path, "optimized_model_path")?);
        }
        Ok(Box::into_raw(Box::new(options)))
    })
}

/// Append an execution provider (by name, with key/value options) to the
/// session's preference list.
///
/// # Safety
/// `keys` and `values` must point to `num_keys` nul-terminated strings each.
#[no_mangle]
pub unsafe extern "C" fn cinnabar_append_execution_provider(
    session_options: *mut SessionOptions,
    name: *const c_char,
    keys: *const *const c_char,
    values: *const *const c_char,
    num_keys: usize,
) -> i32 {
    status_call(|| {
        let options = deref_mut(session_options, "session options")?;
        let name = cstr_arg(name, "provider name")?;
        let mut provider_options = Vec::with_capacity(num_keys);
        for i in 0..num_keys {
            let key = cstr_arg(*keys.add(i), "provider option key")?;
            let value = cstr_arg(*values.add(i), "provider option value")?;
            provider_options.push((key, value));
        }
        options.append_provider(name, provider_options);
        Ok(())
    })
}

/// Pin a named symbolic dimension to a concrete value.
///
/// # Safety
/// `name` must be a nul-terminated string.
#[no_mangle]
pub unsafe extern "C" fn cinnabar_add_free_dimension_override(
    session_options: *mut SessionOptions,
    name: *const c_char,
    value: i32,
) -> i32 {
    status_call(|| {
        let options = deref_mut(session_options, "session options")?;
        if value < 0 {
            return Err(Error::InvalidArgument(format!(
                "dimension override must be non-negative, got {}",
                value
            )));
        }
        options.add_free_dimension_override(cstr_arg(name, "dimension name")?, value as usize);
        Ok(())
    })
}

/// Add a free-form session configuration entry.
///
/// # Safety
/// `key` and `value` must be nul-terminated strings.
#[no_mangle]
pub unsafe extern "C" fn cinnabar_add_session_config_entry(
    session_options: *mut SessionOptions,
    key: *const c_char,
    value: *const c_char,
) -> i32 {
    status_call(|| {
        let options = deref_mut(session_options, "session options")?;
        options.add_config_entry(cstr_arg(key, "config key")?, cstr_arg(value, "config value")?);
        Ok(())
    })
}

/// Release session options.
///
/// # Safety
/// `session_options` must be a live handle from
/// [`cinnabar_create_session_options`]; it is invalid afterwards.
#[no_mangle]
pub unsafe extern "C" fn cinnabar_release_session_options(
    session_options: *mut SessionOptions,
) -> i32 {
    status_call(|| {
        if !session_options.is_null() {
            drop(Box::from_raw(session_options));
        }
        Ok(())
    })
}

/// Create a session from serialized graph bytes. The options handle remains
/// owned by the caller.
///
/// # Safety
/// `data` must be valid for reads of `data_length` bytes.
#[no_mangle]
pub unsafe extern "C" fn cinnabar_create_session(
    data: *const u8,
    data_length: usize,
    session_options: *const SessionOptions,
) -> *mut Session {
    handle_call(|| {
        if data.is_null() {
            return Err(Error::InvalidArgument("model data is null".to_string()));
        }
        let bytes = std::slice::from_raw_parts(data, data_length);
        let options = if session_options.is_null() {
            SessionOptions::default()
        } else {
            (*session_options).clone()
        };
        let session = Session::from_bytes(env()?, bytes, options)?;
        Ok(Box::into_raw(Box::new(session)))
    })
}

/// Release a session.
///
/// # Safety
/// `session` must be a live handle; it is invalid afterwards.
#[no_mangle]
pub unsafe extern "C" fn cinnabar_release_session(session: *mut Session) -> i32 {
    status_call(|| {
        if !session.is_null() {
            drop(Box::from_raw(session));
        }
        Ok(())
    })
}

/// Input and output counts of a session.
///
/// # Safety
/// All pointers must be valid; counts are valid for writes.
#[no_mangle]
pub unsafe extern "C" fn cinnabar_get_input_output_count(
    session: *const Session,
    input_count: *mut usize,
    output_count: *mut usize,
) -> i32 {
    status_call(|| {
        let session = deref(session, "session")?;
        if input_count.is_null() || output_count.is_null() {
            return Err(Error::InvalidArgument("count pointer is null".to_string()));
        }
        *input_count = session.input_count();
        *output_count = session.output_count();
        Ok(())
    })
}

/// Name of input `index`, as a host-owned string released with
/// [`cinnabar_free`].
///
/// # Safety
/// `session` must be a live handle.
#[no_mangle]
pub unsafe extern "C" fn cinnabar_get_input_name(
    session: *const Session,
    index: usize,
) -> *mut c_char {
    handle_call(|| {
        let session = deref(session, "session")?;
        if index >= session.input_count() {
            return Err(Error::InvalidArgument(format!(
                "invalid input index {}",
                index
            )));
        }
        let (name, _, _) = session.io_metadata(index)?;
        Ok(host_buffer::from_str(&name))
    })
}

/// Name of output `index`, as a host-owned string released with
/// [`cinnabar_free`].
///
/// # Safety
/// `session` must be a live handle.
#[no_mangle]
pub unsafe extern "C" fn cinnabar_get_output_name(
    session: *const Session,
    index: usize,
) -> *mut c_char {
    handle_call(|| {
        let session = deref(session, "session")?;
        if index >= session.output_count() {
            return Err(Error::InvalidArgument(format!(
                "invalid output index {}",
                index
            )));
        }
        let (name, _, _) = session.io_metadata(session.input_count() + index)?;
        Ok(host_buffer::from_str(&name))
    })
}

/// Name and flat type/shape buffer for input-or-output `index` (inputs
/// first, then outputs). Both allocations are released with
/// [`cinnabar_free`]. See `metadata` for the buffer layout.
///
/// # Safety
/// `name_out` and `type_shape_out` must be valid for writes.
#[no_mangle]
pub unsafe extern "C" fn cinnabar_get_input_output_metadata(
    session: *const Session,
    index: usize,
    name_out: *mut *mut c_char,
    type_shape_out: *mut *mut u8,
) -> i32 {
    status_call(|| {
        let session = deref(session, "session")?;
        if name_out.is_null() || type_shape_out.is_null() {
            return Err(Error::InvalidArgument("output pointer is null".to_string()));
        }
        let (name, dtype, shape) = session.io_metadata(index)?;
        *name_out = host_buffer::from_str(&name);
        *type_shape_out = metadata::write_type_shape_buffer(dtype, &shape);
        Ok(())
    })
}

/// Create a tensor over caller-provided data.
///
/// Numeric tensors borrow the caller's buffer (the engine never frees it);
/// string tensors copy. String tensors ignore `data_location` and always
/// reside in host memory. A location outside the valid set yields a null
/// handle with an `InvalidArgument` last error.
///
/// # Safety
/// `data` must be valid for `data_length` bytes (for string tensors, an
/// array of nul-terminated string pointers) for the tensor's lifetime, and
/// `dims` for `dims_length` entries.
#[no_mangle]
pub unsafe extern "C" fn cinnabar_create_tensor(
    data_type: i32,
    data: *mut c_void,
    data_length: usize,
    dims: *const usize,
    dims_length: usize,
    data_location: i32,
) -> *mut CTensor {
    handle_call(|| {
        let location = MemoryLocation::from_tag(data_location)
            .filter(|l| *l != MemoryLocation::None)
            .ok_or_else(|| {
                Error::InvalidArgument(format!("Invalid data location: {}", data_location))
            })?;
        let dtype = DataType::from_tag(data_type).ok_or_else(|| {
            Error::InvalidArgument(format!("Invalid element type: {}", data_type))
        })?;

        let shape = if dims_length == 0 {
            Vec::new()
        } else {
            if dims.is_null() {
                return Err(Error::InvalidArgument("dims is null".to_string()));
            }
            std::slice::from_raw_parts(dims, dims_length).to_vec()
        };
        let count: usize = shape.iter().product();

        let tensor = if dtype == DataType::Str {
            // data_location is ignored for string tensors; always host.
            let ptrs = std::slice::from_raw_parts(
                data as *const *const c_char,
                data_length / std::mem::size_of::<*const c_char>(),
            );
            if ptrs.len() != count {
                return Err(Error::InvalidArgument(format!(
                    "string tensor has {} elements, shape needs {}",
                    ptrs.len(),
                    count
                )));
            }
            let strings = ptrs
                .iter()
                .enumerate()
                .map(|(i, &p)| cstr_arg(p, &format!("string element {}", i)))
                .collect::<Result<Vec<_>>>()?;
            Tensor::from_strings(strings, &shape)
        } else {
            if !location.is_host() {
                return Err(Error::NotImplemented(format!(
                    "importing external {:?} buffers is not supported in this build",
                    location
                )));
            }
            let element_size = dtype.fixed_size().ok_or_else(|| {
                Error::InvalidArgument(format!("{:?} has no fixed element width", dtype))
            })?;
            if count * element_size != data_length {
                return Err(Error::InvalidArgument(format!(
                    "shape {:?} needs {} bytes, got {}",
                    shape,
                    count * element_size,
                    data_length
                )));
            }
            if data.is_null() && data_length > 0 {
                return Err(Error::InvalidArgument("tensor data is null".to_string()));
            }
            Tensor::from_external(data as *mut u8, data_length, &shape, dtype, location)
        };

        Ok(Box::into_raw(Box::new(CTensor(Arc::new(tensor)))))
    })
}

/// Read a tensor's element type, shape, and data.
///
/// For numeric host tensors `data` points at the tensor's own storage (no
/// copy), valid until the tensor is released. For string tensors `data` is
/// a host-owned buffer holding a pointer table followed by packed
/// nul-terminated string bytes; release it with [`cinnabar_free`]. The
/// `dims` array is always host-owned and freed with [`cinnabar_free`].
///
/// # Safety
/// All output pointers must be valid for writes.
#[no_mangle]
pub unsafe extern "C" fn cinnabar_get_tensor_data(
    tensor: *const CTensor,
    data_type: *mut usize,
    data: *mut *mut c_void,
    dims: *mut *mut usize,
    dims_length: *mut usize,
) -> i32 {
    status_call(|| {
        let tensor = &deref(tensor, "tensor")?.0;
        if data_type.is_null() || data.is_null() || dims.is_null() || dims_length.is_null() {
            return Err(Error::InvalidArgument("output pointer is null".to_string()));
        }

        let payload: *mut c_void = if tensor.dtype() == DataType::Str {
            let strings = tensor.strings()?;
            // Pointer table followed by packed nul-terminated contents.
            let table_len = strings.len() * std::mem::size_of::<*const c_char>();
            let content_len: usize = strings.iter().map(|s| s.len() + 1).sum();
            let buffer = host_buffer::alloc_bytes(table_len + content_len);
            if buffer.is_null() {
                return Err(Error::RuntimeFault("host allocation failed".to_string()));
            }
            let table = buffer as *mut usize;
            let mut dest = buffer.add(table_len);
            for (i, s) in strings.iter().enumerate() {
                table.add(i).write_unaligned(dest as usize);
                std::ptr::copy_nonoverlapping(s.as_ptr(), dest, s.len());
                dest.add(s.len()).write(0);
                dest = dest.add(s.len() + 1);
            }
            buffer.cast()
        } else {
            tensor.as_bytes()?.as_ptr() as *mut c_void
        };

        let shape = tensor.shape();
        let dims_buffer =
            host_buffer::alloc_bytes(shape.len() * std::mem::size_of::<usize>()) as *mut usize;
        for (i, &d) in shape.iter().enumerate() {
            dims_buffer.add(i).write_unaligned(d);
        }

        *data_type = tensor.dtype().tag() as usize;
        *data = payload;
        *dims = dims_buffer;
        *dims_length = shape.len();
        Ok(())
    })
}

/// Release a tensor handle.
///
/// # Safety
/// `tensor` must be a live handle; it is invalid afterwards.
#[no_mangle]
pub unsafe extern "C" fn cinnabar_release_tensor(tensor: *mut CTensor) -> i32 {
    status_call(|| {
        if !tensor.is_null() {
            drop(Box::from_raw(tensor));
        }
        Ok(())
    })
}

/// Create run options.
///
/// # Safety
/// `tag` may be null; when non-null it must be nul-terminated.
#[no_mangle]
pub unsafe extern "C" fn cinnabar_create_run_options(
    log_severity_level: usize,
    log_verbosity_level: usize,
    terminate: bool,
    tag: *const c_char,
) -> *mut RunOptions {
    handle_call(|| {
        let tag = if tag.is_null() {
            String::new()
        } else {
            cstr_arg(tag, "tag")?
        };
        Ok(Box::into_raw(Box::new(RunOptions::new(
            log_severity_level as u32,
            log_verbosity_level as u32,
            terminate,
            tag,
        ))))
    })
}

/// Request (or withdraw) cooperative termination of runs using these
/// options. Safe to call while a run is in flight.
///
/// # Safety
/// `run_options` must be a live handle.
#[no_mangle]
pub unsafe extern "C" fn cinnabar_run_options_set_terminate(
    run_options: *const RunOptions,
    terminate: bool,
) -> i32 {
    status_call(|| {
        deref(run_options, "run options")?.set_terminate(terminate);
        Ok(())
    })
}

/// Add a free-form per-run configuration entry.
///
/// # Safety
/// `key` and `value` must be nul-terminated strings.
#[no_mangle]
pub unsafe extern "C" fn cinnabar_add_run_config_entry(
    run_options: *mut RunOptions,
    key: *const c_char,
    value: *const c_char,
) -> i32 {
    status_call(|| {
        let options = deref_mut(run_options, "run options")?;
        options.add_config_entry(cstr_arg(key, "config key")?, cstr_arg(value, "config value")?);
        Ok(())
    })
}

/// Release run options.
///
/// # Safety
/// `run_options` must be a live handle; it is invalid afterwards.
#[no_mangle]
pub unsafe extern "C" fn cinnabar_release_run_options(run_options: *mut RunOptions) -> i32 {
    status_call(|| {
        if !run_options.is_null() {
            drop(Box::from_raw(run_options));
        }
        Ok(())
    })
}

/// Execute a session synchronously, by name.
///
/// On success, `outputs[i]` receives a fresh tensor handle for
/// `output_names[i]`; release each with [`cinnabar_release_tensor`].
///
/// # Safety
/// The name and tensor arrays must hold the declared counts; `outputs` must
/// be valid for `output_count` writes.
#[no_mangle]
pub unsafe extern "C" fn cinnabar_run(
    session: *const Session,
    input_names: *const *const c_char,
    inputs: *const *const CTensor,
    input_count: usize,
    output_names: *const *const c_char,
    output_count: usize,
    outputs: *mut *mut CTensor,
    run_options: *const RunOptions,
) -> i32 {
    status_call(|| {
        let session = deref(session, "session")?;
        if (input_names.is_null() || inputs.is_null()) && input_count > 0 {
            return Err(Error::InvalidArgument("input arrays are null".to_string()));
        }
        if (output_names.is_null() || outputs.is_null()) && output_count > 0 {
            return Err(Error::InvalidArgument("output arrays are null".to_string()));
        }

        let mut feed_names = Vec::with_capacity(input_count);
        let mut feeds = Vec::with_capacity(input_count);
        for i in 0..input_count {
            feed_names.push(cstr_arg(*input_names.add(i), "input name")?);
            let tensor = deref(*inputs.add(i), "input tensor")?;
            feeds.push(Arc::clone(&tensor.0));
        }
        let mut fetch_names = Vec::with_capacity(output_count);
        for i in 0..output_count {
            fetch_names.push(cstr_arg(*output_names.add(i), "output name")?);
        }

        let feed_refs: Vec<(&str, Arc<Tensor>)> = feed_names
            .iter()
            .map(String::as_str)
            .zip(feeds)
            .collect();
        let fetch_refs: Vec<&str> = fetch_names.iter().map(String::as_str).collect();
        let options = run_options.as_ref();

        let results = session.run(&feed_refs, &fetch_refs, options)?;
        for (i, result) in results.into_iter().enumerate() {
            *outputs.add(i) = Box::into_raw(Box::new(CTensor(result)));
        }
        Ok(())
    })
}

/// Create an I/O binding for a session.
///
/// # Safety
/// `session` must be a live handle.
#[no_mangle]
pub unsafe extern "C" fn cinnabar_create_binding(session: *const Session) -> *mut IoBinding {
    handle_call(|| {
        deref(session, "session")?;
        Ok(Box::into_raw(Box::new(IoBinding::new())))
    })
}

/// Bind an input tensor to a named slot.
///
/// # Safety
/// `binding` and `tensor` must be live handles; `name` nul-terminated.
#[no_mangle]
pub unsafe extern "C" fn cinnabar_bind_input(
    binding: *mut IoBinding,
    name: *const c_char,
    tensor: *const CTensor,
) -> i32 {
    status_call(|| {
        let binding = deref_mut(binding, "binding")?;
        let name = cstr_arg(name, "input name")?;
        let tensor = deref(tensor, "tensor")?;
        binding.bind_input(name, Arc::clone(&tensor.0));
        Ok(())
    })
}

/// Bind an output slot to a provided tensor, or (when `tensor` is null) to
/// a device location, meaning the engine allocates there.
///
/// # Safety
/// `binding` must be a live handle; `name` nul-terminated; `tensor` may be
/// null.
#[no_mangle]
pub unsafe extern "C" fn cinnabar_bind_output(
    binding: *mut IoBinding,
    name: *const c_char,
    tensor: *const CTensor,
    output_location: i32,
) -> i32 {
    status_call(|| {
        let binding = deref_mut(binding, "binding")?;
        let name = cstr_arg(name, "output name")?;
        if let Some(tensor) = tensor.as_ref() {
            binding.bind_output(name, Arc::clone(&tensor.0));
        } else {
            let location = MemoryLocation::from_tag(output_location).ok_or_else(|| {
                Error::InvalidArgument(format!(
                    "Invalid data location ({}) for output: \"{}\"",
                    output_location, name
                ))
            })?;
            binding.bind_output_to_device(name, location)?;
        }
        Ok(())
    })
}

/// Drop all bound outputs and previously retrieved values.
///
/// # Safety
/// `binding` must be a live handle.
#[no_mangle]
pub unsafe extern "C" fn cinnabar_clear_bound_outputs(binding: *mut IoBinding) -> i32 {
    status_call(|| {
        deref_mut(binding, "binding")?.clear_bound_outputs();
        Ok(())
    })
}

/// Release an I/O binding.
///
/// # Safety
/// `binding` must be a live handle; it is invalid afterwards.
#[no_mangle]
pub unsafe extern "C" fn cinnabar_release_binding(binding: *mut IoBinding) -> i32 {
    status_call(|| {
        if !binding.is_null() {
            drop(Box::from_raw(binding));
        }
        Ok(())
    })
}

/// Execute with pre-bound I/O. Bound outputs are retrieved into `outputs`
/// in binding order; `output_count` must match the bound output count.
///
/// # Safety
/// `outputs` must be valid for `output_count` writes.
#[no_mangle]
pub unsafe extern "C" fn cinnabar_run_with_binding(
    session: *const Session,
    binding: *mut IoBinding,
    output_count: usize,
    outputs: *mut *mut CTensor,
    run_options: *const RunOptions,
) -> i32 {
    status_call(|| {
        let session = deref(session, "session")?;
        let binding = deref_mut(binding, "binding")?;
        session.run_with_binding(binding, run_options.as_ref())?;

        let values = binding.bound_values();
        if values.len() != output_count {
            return Err(Error::InvalidArgument(
                "Output count is inconsistent with IO Binding output data.".to_string(),
            ));
        }
        if output_count > 0 && outputs.is_null() {
            return Err(Error::InvalidArgument("outputs is null".to_string()));
        }
        for (i, value) in values.iter().enumerate() {
            *outputs.add(i) = Box::into_raw(Box::new(CTensor(Arc::clone(value))));
        }
        Ok(())
    })
}

/// Finish profiling and return the events-file path as a host-owned string
/// released with [`cinnabar_free`].
///
/// # Safety
/// `session` must be a live handle.
#[no_mangle]
pub unsafe extern "C" fn cinnabar_end_profiling(session: *const Session) -> *mut c_char {
    handle_call(|| {
        let session = deref(session, "session")?;
        Ok(host_buffer::from_str(&session.end_profiling()?))
    })
}

/// Free a buffer previously returned to the host (names, metadata buffers,
/// dims arrays, string-tensor payloads, profiling paths).
///
/// # Safety
/// `ptr` must come from this library and not have been freed already.
#[no_mangle]
pub unsafe extern "C" fn cinnabar_free(ptr: *mut c_void) -> i32 {
    status_call(|| {
        host_buffer::free(ptr.cast());
        Ok(())
    })
}
