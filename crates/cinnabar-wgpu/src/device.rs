//! GPU device context, pipeline cache, and buffer transfer.

use cinnabar_core::{
    BackendResources, DataType, DeviceAllocator, DeviceBuffer, Error, MemoryLocation, Result,
    Tensor,
};
use naga_oil::compose::{Composer, NagaModuleDescriptor};
use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Shared GPU session resources: device, queue, and the shader-program
/// cache.
///
/// One context is shared by every kernel of a loaded session. The pipeline
/// cache is behind a lock, so concurrent runs racing on first use of a
/// program resolve through the lock rather than per-kernel init guards;
/// cached programs are read concurrently after that. Queue submissions
/// serialize on the wgpu queue itself.
pub struct GpuContext {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    adapter_info: wgpu::AdapterInfo,
    pipelines: Mutex<HashMap<String, Arc<CachedPipeline>>>,
}

/// A cached compute pipeline and its bind group layout.
pub struct CachedPipeline {
    pub pipeline: wgpu::ComputePipeline,
    pub bind_group_layout: wgpu::BindGroupLayout,
}

impl GpuContext {
    /// Initialize the context with the default high-performance adapter.
    ///
    /// # Errors
    /// Returns `RuntimeFault` if no suitable GPU is found or device
    /// initialization fails.
    pub async fn new() -> Result<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .map_err(|e| {
                Error::RuntimeFault(format!("failed to find suitable GPU adapter: {}", e))
            })?;

        let adapter_info = adapter.get_info();

        // Half-precision shaders need the feature; request it only when the
        // adapter has it so f32 models still run everywhere.
        let mut required_features = wgpu::Features::empty();
        if adapter.features().contains(wgpu::Features::SHADER_F16) {
            required_features |= wgpu::Features::SHADER_F16;
        }

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                required_features,
                ..Default::default()
            })
            .await
            .map_err(|e| Error::RuntimeFault(format!("failed to create device: {}", e)))?;

        tracing::debug!(adapter = %adapter_info.name, backend = ?adapter_info.backend, "GPU context ready");

        Ok(Self {
            device: Arc::new(device),
            queue: Arc::new(queue),
            adapter_info,
            pipelines: Mutex::new(HashMap::new()),
        })
    }

    /// Blocking initialization for synchronous callers.
    pub fn new_blocking() -> Result<Self> {
        pollster::block_on(Self::new())
    }

    /// Information about the GPU adapter.
    pub fn adapter_info(&self) -> &wgpu::AdapterInfo {
        &self.adapter_info
    }

    /// Whether the device can run half-precision shaders.
    pub fn supports_f16(&self) -> bool {
        self.device.features().contains(wgpu::Features::SHADER_F16)
    }

    /// Create a storage buffer of at least `size` bytes (wgpu requires a
    /// 4-byte minimum).
    pub fn create_storage_buffer(&self, size: usize, label: &str) -> wgpu::Buffer {
        self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size: (size.max(4) as u64 + 3) & !3,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_SRC
                | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        })
    }

    /// Upload host bytes into a new storage buffer.
    pub fn upload(&self, data: &[u8], label: &str) -> wgpu::Buffer {
        let buffer = self.create_storage_buffer(data.len(), label);
        self.queue.write_buffer(&buffer, 0, data);
        buffer
    }

    /// Upload a uniform parameter block.
    pub fn upload_uniforms(&self, data: &[u8], label: &str) -> wgpu::Buffer {
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size: (data.len().max(4) as u64 + 3) & !3,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        self.queue.write_buffer(&buffer, 0, data);
        buffer
    }

    /// Read `size` bytes back from a storage buffer into host memory.
    ///
    /// Synchronous: copies through a staging buffer and blocks until the
    /// device finishes.
    pub fn readback(&self, buffer: &wgpu::Buffer, size: usize) -> Result<Vec<u8>> {
        let aligned = (size.max(4) as u64 + 3) & !3;
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("cinnabar_readback"),
            size: aligned,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("cinnabar_readback"),
            });
        encoder.copy_buffer_to_buffer(buffer, 0, &staging, 0, aligned);
        self.queue.submit(Some(encoder.finish()));

        let slice = staging.slice(..);
        let (sender, receiver) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            sender.send(result).ok();
        });
        self.device
            .poll(wgpu::PollType::wait_indefinitely())
            .map_err(|e| Error::RuntimeFault(format!("device poll failed: {:?}", e)))?;
        receiver
            .recv()
            .map_err(|_| Error::RuntimeFault("buffer map result never arrived".to_string()))?
            .map_err(|e| Error::RuntimeFault(format!("buffer map failed: {}", e)))?;

        let data = slice.get_mapped_range()[..size].to_vec();
        staging.unmap();
        Ok(data)
    }

    /// Get or compile the compute pipeline for a generated shader.
    ///
    /// The program cache is keyed by `label`, which must encode every
    /// parameter the generated source depends on. Compilation goes through
    /// naga_oil composition and naga validation before reaching the device,
    /// so malformed generated source fails here rather than asynchronously.
    pub fn get_or_create_pipeline(
        &self,
        label: &str,
        wgsl: &str,
        entry_point: &str,
        layout_entries: &[wgpu::BindGroupLayoutEntry],
    ) -> Result<Arc<CachedPipeline>> {
        {
            let pipelines = self.pipelines.lock().unwrap();
            if let Some(cached) = pipelines.get(label) {
                return Ok(Arc::clone(cached));
            }
        }

        let module = compile_wgsl(label, wgsl)?;
        let shader_module = self
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(label),
                source: wgpu::ShaderSource::Wgsl(module.into()),
            });

        let bind_group_layout =
            self.device
                .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                    label: Some(&format!("{label}_layout")),
                    entries: layout_entries,
                });

        let pipeline_layout =
            self.device
                .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                    label: Some(&format!("{label}_pipeline_layout")),
                    bind_group_layouts: &[&bind_group_layout],
                    immediate_size: 0,
                });

        let pipeline = self
            .device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(label),
                layout: Some(&pipeline_layout),
                module: &shader_module,
                entry_point: Some(entry_point),
                compilation_options: Default::default(),
                cache: None,
            });

        let cached = Arc::new(CachedPipeline {
            pipeline,
            bind_group_layout,
        });
        let mut pipelines = self.pipelines.lock().unwrap();
        // A concurrent first use may have raced us here; last insert wins
        // and both pipelines are equivalent.
        pipelines.insert(label.to_string(), Arc::clone(&cached));
        Ok(cached)
    }

    /// Number of cached shader programs.
    pub fn cached_pipeline_count(&self) -> usize {
        self.pipelines.lock().unwrap().len()
    }

    /// Dispatch a compute pass and submit it.
    pub fn dispatch(
        &self,
        cached: &CachedPipeline,
        entries: &[wgpu::BindGroupEntry],
        workgroups: [u32; 3],
        label: &str,
    ) {
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(label),
            layout: &cached.bind_group_layout,
            entries,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some(label) });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(label),
                timestamp_writes: None,
            });
            pass.set_pipeline(&cached.pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            let [x, y, z] = workgroups;
            pass.dispatch_workgroups(x, y, z);
        }
        self.queue.submit(Some(encoder.finish()));
    }

    /// A read-only storage binding layout entry.
    pub fn read_only_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
        wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Storage { read_only: true },
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        }
    }

    /// A read-write storage binding layout entry.
    pub fn read_write_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
        wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Storage { read_only: false },
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        }
    }

    /// A uniform binding layout entry.
    pub fn uniform_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
        wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Uniform,
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        }
    }
}

impl BackendResources for GpuContext {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl std::fmt::Debug for GpuContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuContext")
            .field("adapter", &self.adapter_info.name)
            .finish()
    }
}

/// Compose and validate generated WGSL, then write it back out as WGSL for
/// the device. Validation failures surface as `RuntimeFault` with the naga
/// diagnostic.
pub(crate) fn compile_wgsl(label: &str, wgsl: &str) -> Result<String> {
    let mut composer = Composer::default().with_capabilities(naga::valid::Capabilities::all());
    let module = composer
        .make_naga_module(NagaModuleDescriptor {
            source: wgsl,
            file_path: label,
            ..Default::default()
        })
        .map_err(|e| Error::RuntimeFault(format!("shader composition failed: {}", e)))?;

    let info = naga::valid::Validator::new(
        naga::valid::ValidationFlags::all(),
        naga::valid::Capabilities::all(),
    )
    .validate(&module)
    .map_err(|e| Error::RuntimeFault(format!("shader validation failed: {}", e)))?;

    naga::back::wgsl::write_string(&module, &info, naga::back::wgsl::WriterFlags::empty())
        .map_err(|e| Error::RuntimeFault(format!("WGSL generation failed: {}", e)))
}

/// A storage buffer wrapped as engine tensor data.
#[derive(Debug)]
pub struct GpuTensorBuffer {
    context: Arc<GpuContext>,
    buffer: Arc<wgpu::Buffer>,
    size: usize,
}

impl GpuTensorBuffer {
    pub fn new(context: Arc<GpuContext>, buffer: wgpu::Buffer, size: usize) -> Self {
        Self {
            context,
            buffer: Arc::new(buffer),
            size,
        }
    }

    pub fn buffer(&self) -> &wgpu::Buffer {
        &self.buffer
    }
}

impl DeviceBuffer for GpuTensorBuffer {
    fn location(&self) -> MemoryLocation {
        MemoryLocation::GpuBuffer
    }

    fn byte_len(&self) -> usize {
        self.size
    }

    fn read_to_vec(&self) -> Result<Vec<u8>> {
        self.context.readback(&self.buffer, self.size)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Allocator producing GPU-buffer tensors, used when outputs are bound to
/// the GPU device location.
pub struct GpuAllocator {
    context: Arc<GpuContext>,
}

impl GpuAllocator {
    pub fn new(context: Arc<GpuContext>) -> Self {
        Self { context }
    }
}

impl DeviceAllocator for GpuAllocator {
    fn location(&self) -> MemoryLocation {
        MemoryLocation::GpuBuffer
    }

    fn alloc_tensor(&self, dtype: DataType, shape: &[usize]) -> Result<Tensor> {
        let element_size = dtype.fixed_size().ok_or_else(|| {
            Error::InvalidArgument(format!("cannot allocate {:?} on the GPU", dtype))
        })?;
        let count: usize = shape.iter().product();
        let size = count * element_size;
        let buffer = self.context.create_storage_buffer(size, "cinnabar_tensor");
        Ok(Tensor::from_device(
            Arc::new(GpuTensorBuffer::new(Arc::clone(&self.context), buffer, size)),
            shape,
            dtype,
        ))
    }
}
