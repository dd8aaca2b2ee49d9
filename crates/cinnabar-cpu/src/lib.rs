//! CPU execution provider for the Cinnabar inference engine.
//!
//! Provides pooling and layer-normalization kernels over a generic
//! sliding-window loop, a specialized f32 fast path, and task-pool parallel
//! decomposition of the batch×channel extent.

mod fastpath;
mod parallel;
mod pool_attrs;
mod pool_loop;
mod pooling;

pub mod layer_norm;

pub use layer_norm::LayerNormKernel;
pub use pool_attrs::{AutoPad, PoolAttrs};
pub use pooling::{AveragePoolKernel, LpPoolKernel, MaxPoolKernel};

use cinnabar_core::{BackendKind, DataType, Kernel, KernelDef, KernelRegistry, Result};

const FLOAT: &[DataType] = &[DataType::F32];
const MAX_POOL_V8_TYPES: &[DataType] = &[DataType::F32, DataType::F64];
const MAX_POOL_V12_TYPES: &[DataType] = &[
    DataType::F32,
    DataType::F64,
    DataType::I8,
    DataType::U8,
];
const NORM_TYPES: &[DataType] = &[DataType::F32, DataType::F16];

/// Register every CPU kernel with its opset version ranges.
///
/// The version table mirrors the operator specification's revisions: the
/// index output and integer types arrive in MaxPool 8/12, dilation support
/// in AveragePool 19 and LpPool 18.
pub fn register_kernels(registry: &mut KernelRegistry) -> Result<()> {
    // MaxPool: v1-7 has no index output; v8 adds it (f32/f64); v12 widens
    // the element types.
    registry.register(
        KernelDef::builder("MaxPool")
            .backend(BackendKind::Cpu)
            .versioned(1, 7)
            .type_constraint(0, FLOAT)
            .build(|node| Ok(Box::new(MaxPoolKernel::new(node, false, false)?) as Box<dyn Kernel>)),
    )?;
    registry.register(
        KernelDef::builder("MaxPool")
            .backend(BackendKind::Cpu)
            .versioned(8, 11)
            .type_constraint(0, MAX_POOL_V8_TYPES)
            .build(|node| Ok(Box::new(MaxPoolKernel::new(node, true, false)?) as Box<dyn Kernel>)),
    )?;
    registry.register(
        KernelDef::builder("MaxPool")
            .backend(BackendKind::Cpu)
            .since(12)
            .type_constraint(0, MAX_POOL_V12_TYPES)
            .build(|node| Ok(Box::new(MaxPoolKernel::new(node, true, false)?) as Box<dyn Kernel>)),
    )?;
    registry.register(
        KernelDef::builder("GlobalMaxPool")
            .backend(BackendKind::Cpu)
            .since(1)
            .type_constraint(0, FLOAT)
            .build(|node| Ok(Box::new(MaxPoolKernel::new(node, false, true)?) as Box<dyn Kernel>)),
    )?;

    // AveragePool: the v19 revision adds dilations and runs the generic
    // loop; earlier revisions use the specialized path.
    for (since, until) in [(7, 9), (10, 10), (11, 18)] {
        registry.register(
            KernelDef::builder("AveragePool")
                .backend(BackendKind::Cpu)
                .versioned(since, until)
                .type_constraint(0, FLOAT)
                .build(|node| Ok(Box::new(AveragePoolKernel::new(node, true, false)?) as Box<dyn Kernel>)),
        )?;
    }
    registry.register(
        KernelDef::builder("AveragePool")
            .backend(BackendKind::Cpu)
            .since(19)
            .type_constraint(0, FLOAT)
            .build(|node| Ok(Box::new(AveragePoolKernel::new(node, false, false)?) as Box<dyn Kernel>)),
    )?;
    registry.register(
        KernelDef::builder("GlobalAveragePool")
            .backend(BackendKind::Cpu)
            .since(1)
            .type_constraint(0, FLOAT)
            .build(|node| Ok(Box::new(AveragePoolKernel::new(node, true, true)?) as Box<dyn Kernel>)),
    )?;

    // LpPool: v18 adds dilations; both revisions share the generic loop.
    registry.register(
        KernelDef::builder("LpPool")
            .backend(BackendKind::Cpu)
            .versioned(2, 17)
            .type_constraint(0, FLOAT)
            .build(|node| Ok(Box::new(LpPoolKernel::new(node, false)?) as Box<dyn Kernel>)),
    )?;
    registry.register(
        KernelDef::builder("LpPool")
            .backend(BackendKind::Cpu)
            .since(18)
            .type_constraint(0, FLOAT)
            .build(|node| Ok(Box::new(LpPoolKernel::new(node, false)?) as Box<dyn Kernel>)),
    )?;
    registry.register(
        KernelDef::builder("GlobalLpPool")
            .backend(BackendKind::Cpu)
            .since(2)
            .type_constraint(0, FLOAT)
            .build(|node| Ok(Box::new(LpPoolKernel::new(node, true)?) as Box<dyn Kernel>)),
    )?;

    // Normalization.
    registry.register(
        KernelDef::builder("LayerNormalization")
            .backend(BackendKind::Cpu)
            .since(17)
            .type_constraint(0, NORM_TYPES)
            .build(|node| Ok(Box::new(LayerNormKernel::new(node, false)?) as Box<dyn Kernel>)),
    )?;
    registry.register(
        KernelDef::builder("SimplifiedLayerNormalization")
            .backend(BackendKind::Cpu)
            .since(1)
            .type_constraint(0, NORM_TYPES)
            .build(|node| Ok(Box::new(LayerNormKernel::new(node, true)?) as Box<dyn Kernel>)),
    )?;

    Ok(())
}
