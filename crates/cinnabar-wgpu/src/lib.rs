//! GPU execution provider for the Cinnabar inference engine.
//!
//! Normalization runs as a generated WGSL compute program per parameter
//! combination; compiled programs are cached in the shared [`GpuContext`]
//! and reused across dispatches and runs.

pub mod device;
pub mod layer_norm;

pub use device::{GpuAllocator, GpuContext, GpuTensorBuffer};
pub use layer_norm::{max_components, GpuLayerNormKernel, LayerNormProgram, WORKGROUP_SIZE};

use cinnabar_core::{BackendKind, DataType, Kernel, KernelDef, KernelRegistry, Result};

const GPU_FLOAT_TYPES: &[DataType] = &[DataType::F32, DataType::F16];

/// Register every GPU kernel.
pub fn register_kernels(registry: &mut KernelRegistry) -> Result<()> {
    registry.register(
        KernelDef::builder("LayerNormalization")
            .backend(BackendKind::Wgpu)
            .since(17)
            .type_constraint(0, GPU_FLOAT_TYPES)
            .build(|node| Ok(Box::new(GpuLayerNormKernel::new(node, false)?) as Box<dyn Kernel>)),
    )?;
    registry.register(
        KernelDef::builder("SimplifiedLayerNormalization")
            .backend(BackendKind::Wgpu)
            .since(1)
            .type_constraint(0, GPU_FLOAT_TYPES)
            .build(|node| Ok(Box::new(GpuLayerNormKernel::new(node, true)?) as Box<dyn Kernel>)),
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_kernels() {
        let mut registry = KernelRegistry::new();
        register_kernels(&mut registry).unwrap();
        assert!(registry
            .resolve(
                "LayerNormalization",
                "",
                17,
                &[Some(DataType::F32)],
                &[BackendKind::Wgpu]
            )
            .is_ok());
        // Pooling has no GPU kernel; dispatch must fall through to the CPU
        // backend when it is in the preference list.
        assert!(registry
            .resolve("MaxPool", "", 12, &[Some(DataType::F32)], &[BackendKind::Wgpu])
            .is_err());
    }
}
