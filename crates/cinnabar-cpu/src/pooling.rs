//! CPU pooling kernels: Max, Average, and Lp pooling, explicit and global.

use crate::fastpath::{self, FastPoolKind};
use crate::parallel::SharedSlice;
use crate::pool_attrs::PoolAttrs;
use crate::pool_loop::{
    average_pool_range, lp_pool_range, max_pool_range, PoolElement, PoolGeometry,
};
use cinnabar_core::{DataType, Error, Kernel, KernelContext, Node, Result, Tensor};

/// Max pooling.
///
/// Versions 8 and later add the optional index output ("which element won"),
/// dilation, and integer element types; version 1-7 registrations construct
/// the kernel without index support and always take the fast path for f32.
pub struct MaxPoolKernel {
    attrs: PoolAttrs,
    supports_index: bool,
}

impl MaxPoolKernel {
    pub fn new(node: &Node, supports_index: bool, global: bool) -> Result<Self> {
        Ok(Self {
            attrs: PoolAttrs::from_node(node, global)?,
            supports_index,
        })
    }

    fn compute_typed<T: PoolElement + Send + Sync>(
        &self,
        ctx: &KernelContext<'_>,
        x: &Tensor,
        y: &mut Tensor,
        indices: Option<&mut Tensor>,
        geom: &PoolGeometry,
    ) -> Result<()> {
        let x_data = x.as_slice::<T>()?;
        let pool = ctx.thread_pool();
        let storage_order = self.attrs.storage_order;

        // The fast specialized path cannot produce the index output and does
        // not understand dilated windows.
        let use_fastpath = T::DATA_TYPE == DataType::F32
            && indices.is_none()
            && storage_order == 0
            && !self.attrs.needs_dilation();

        if use_fastpath {
            let y_data = y.as_slice_mut::<f32>()?;
            // T is f32 here; go through the raw byte view to avoid a
            // second typed copy.
            let x_f32: &[f32] = bytemuck::cast_slice(x.as_bytes()?);
            fastpath::pool_f32(FastPoolKind::Maximum, geom, x_f32, y_data, pool);
            return Ok(());
        }

        let y_shared = SharedSlice::new(y.as_slice_mut::<T>()?);
        match indices {
            Some(ind) => {
                let i_shared = SharedSlice::new(ind.as_slice_mut::<i64>()?);
                pool.parallel_for(
                    geom.total_channels,
                    geom.cost_per_channel(),
                    |channels| {
                        max_pool_range::<T>(
                            x_data,
                            &y_shared,
                            Some(&i_shared),
                            geom,
                            storage_order,
                            channels,
                        )
                    },
                );
            }
            None => {
                pool.parallel_for(
                    geom.total_channels,
                    geom.cost_per_channel(),
                    |channels| {
                        max_pool_range::<T>(x_data, &y_shared, None, geom, storage_order, channels)
                    },
                );
            }
        }
        Ok(())
    }
}

impl Kernel for MaxPoolKernel {
    fn compute(&self, ctx: &mut KernelContext<'_>) -> Result<()> {
        let x = ctx.input(0)?;
        let resolved = self.attrs.resolve(x.shape())?;
        let out_shape = resolved.output_shape.clone();

        let want_index = self.supports_index && ctx.output_requested(1);

        let allocator = ctx.allocator();
        let mut y = allocator.alloc_tensor(x.dtype(), &out_shape)?;
        let mut indices = if want_index {
            Some(allocator.alloc_tensor(DataType::I64, &out_shape)?)
        } else {
            None
        };

        // Zero-volume output: succeed without touching backend compute.
        if !y.is_empty() {
            let geom = PoolGeometry::new(x.shape(), &resolved);
            match x.dtype() {
                DataType::F32 => {
                    self.compute_typed::<f32>(ctx, x, &mut y, indices.as_mut(), &geom)?
                }
                DataType::F64 => {
                    self.compute_typed::<f64>(ctx, x, &mut y, indices.as_mut(), &geom)?
                }
                DataType::I8 => {
                    self.compute_typed::<i8>(ctx, x, &mut y, indices.as_mut(), &geom)?
                }
                DataType::U8 => {
                    self.compute_typed::<u8>(ctx, x, &mut y, indices.as_mut(), &geom)?
                }
                other => {
                    return Err(Error::InvalidArgument(format!(
                        "MaxPool does not support {:?} input",
                        other
                    )))
                }
            }
        }

        ctx.set_output(0, y)?;
        if let Some(ind) = indices {
            ctx.set_output(1, ind)?;
        }
        Ok(())
    }
}

/// Average pooling.
///
/// `count_include_pad` selects whether zero-padding contributes to the
/// divisor at border windows. The version-19 revision adds dilation support
/// and runs the generic loop; earlier versions use the specialized path.
pub struct AveragePoolKernel {
    attrs: PoolAttrs,
    use_fastpath: bool,
}

impl AveragePoolKernel {
    pub fn new(node: &Node, use_fastpath: bool, global: bool) -> Result<Self> {
        Ok(Self {
            attrs: PoolAttrs::from_node(node, global)?,
            use_fastpath,
        })
    }
}

impl Kernel for AveragePoolKernel {
    fn compute(&self, ctx: &mut KernelContext<'_>) -> Result<()> {
        let x = ctx.input(0)?;
        let resolved = self.attrs.resolve(x.shape())?;
        let out_shape = resolved.output_shape.clone();

        let allocator = ctx.allocator();
        let mut y = allocator.alloc_tensor(x.dtype(), &out_shape)?;

        if !y.is_empty() {
            let geom = PoolGeometry::new(x.shape(), &resolved);
            let x_data = x.as_slice::<f32>()?;
            let pool = ctx.thread_pool();
            let include_pad = self.attrs.count_include_pad;

            if self.use_fastpath && !self.attrs.needs_dilation() {
                let kind = if include_pad {
                    FastPoolKind::AverageIncludePad
                } else {
                    FastPoolKind::AverageExcludePad
                };
                fastpath::pool_f32(kind, &geom, x_data, y.as_slice_mut::<f32>()?, pool);
            } else {
                let y_shared = SharedSlice::new(y.as_slice_mut::<f32>()?);
                pool.parallel_for(
                    geom.total_channels,
                    geom.cost_per_channel(),
                    |channels| {
                        average_pool_range(x_data, &y_shared, &geom, include_pad, channels)
                    },
                );
            }
        }

        ctx.set_output(0, y)?;
        Ok(())
    }
}

/// Lp pooling: `(sum |x|^p)^(1/p)` over each window.
pub struct LpPoolKernel {
    attrs: PoolAttrs,
}

impl LpPoolKernel {
    pub fn new(node: &Node, global: bool) -> Result<Self> {
        Ok(Self {
            attrs: PoolAttrs::from_node(node, global)?,
        })
    }
}

impl Kernel for LpPoolKernel {
    fn compute(&self, ctx: &mut KernelContext<'_>) -> Result<()> {
        let x = ctx.input(0)?;
        let resolved = self.attrs.resolve(x.shape())?;
        let out_shape = resolved.output_shape.clone();

        let allocator = ctx.allocator();
        let mut y = allocator.alloc_tensor(x.dtype(), &out_shape)?;

        if !y.is_empty() {
            let geom = PoolGeometry::new(x.shape(), &resolved);
            let x_data = x.as_slice::<f32>()?;
            let p = self.attrs.p;
            let y_shared = SharedSlice::new(y.as_slice_mut::<f32>()?);
            ctx.thread_pool().parallel_for(
                geom.total_channels,
                geom.cost_per_channel(),
                |channels| lp_pool_range(x_data, &y_shared, &geom, p, channels),
            );
        }

        ctx.set_output(0, y)?;
        Ok(())
    }
}
