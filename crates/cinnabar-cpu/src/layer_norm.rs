//! CPU layer normalization kernels.
//!
//! Standard layer normalization subtracts the per-row mean before scaling by
//! the inverse standard deviation; the simplified (RMS) variant skips mean
//! centering. Half-precision inputs accumulate internally in f32 to avoid
//! precision loss, then cast back to the storage type on write.

use crate::parallel::SharedSlice;
use cinnabar_core::{DataType, Element, Error, Kernel, KernelContext, Node, Result, Tensor};
use half::f16;

/// Element types the normalization loop reduces over.
pub(crate) trait NormElement: Element + Copy {
    fn to_f32(self) -> f32;
    fn from_f32(v: f32) -> Self;
}

impl NormElement for f32 {
    fn to_f32(self) -> f32 {
        self
    }
    fn from_f32(v: f32) -> Self {
        v
    }
}

impl NormElement for f16 {
    fn to_f32(self) -> f32 {
        self.to_f32()
    }
    fn from_f32(v: f32) -> Self {
        f16::from_f32(v)
    }
}

/// LayerNormalization / SimplifiedLayerNormalization on the CPU backend.
pub struct LayerNormKernel {
    axis: i64,
    epsilon: f32,
    simplified: bool,
}

impl LayerNormKernel {
    pub fn new(node: &Node, simplified: bool) -> Result<Self> {
        let epsilon: f32 = node.attr_or("epsilon", 1e-5)?;
        if epsilon <= 0.0 {
            return Err(Error::InvalidArgument(format!(
                "epsilon must be positive, got {}",
                epsilon
            )));
        }
        Ok(Self {
            axis: node.attr_or("axis", -1)?,
            epsilon,
            simplified,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn compute_typed<T: NormElement + Send + Sync>(
        &self,
        ctx: &KernelContext<'_>,
        x: &Tensor,
        scale: &Tensor,
        bias: Option<&Tensor>,
        y: &mut Tensor,
        mut mean_out: Option<&mut Tensor>,
        mut inv_out: Option<&mut Tensor>,
        norm_count: usize,
        norm_size: usize,
    ) -> Result<()> {
        let x_data = x.as_slice::<T>()?;
        let scale_data = scale.as_slice::<T>()?;
        let bias_data = bias.map(|b| b.as_slice::<T>()).transpose()?;

        let y_shared = SharedSlice::new(y.as_slice_mut::<T>()?);
        let mean_shared = mean_out
            .as_mut()
            .map(|t| t.as_slice_mut::<f32>().map(SharedSlice::new))
            .transpose()?;
        let inv_shared = inv_out
            .as_mut()
            .map(|t| t.as_slice_mut::<f32>().map(SharedSlice::new))
            .transpose()?;

        let epsilon = self.epsilon;
        let simplified = self.simplified;

        ctx.thread_pool().parallel_for(
            norm_count,
            norm_size as f64 * 6.0,
            |rows| {
                for r in rows {
                    let row = &x_data[r * norm_size..(r + 1) * norm_size];

                    // Single-precision accumulation regardless of the
                    // storage width.
                    let mut sum = 0.0f32;
                    let mut sum_sq = 0.0f32;
                    for &v in row {
                        let v = v.to_f32();
                        sum += v;
                        sum_sq += v * v;
                    }
                    let mean = sum / norm_size as f32;
                    let mean_sq = sum_sq / norm_size as f32;
                    let variance = if simplified {
                        mean_sq
                    } else {
                        mean_sq - mean * mean
                    };
                    let inv_std_dev = 1.0 / (variance + epsilon).sqrt();

                    let y_row = unsafe {
                        y_shared.slice_mut(r * norm_size..(r + 1) * norm_size)
                    };
                    for j in 0..norm_size {
                        let centered = if simplified {
                            row[j].to_f32()
                        } else {
                            row[j].to_f32() - mean
                        };
                        let mut v = centered * inv_std_dev * scale_data[j].to_f32();
                        if let Some(bias) = bias_data {
                            v += bias[j].to_f32();
                        }
                        y_row[j] = T::from_f32(v);
                    }

                    if let Some(mean_shared) = &mean_shared {
                        (unsafe { mean_shared.slice_mut(r..r + 1) })[0] = mean;
                    }
                    if let Some(inv_shared) = &inv_shared {
                        (unsafe { inv_shared.slice_mut(r..r + 1) })[0] = inv_std_dev;
                    }
                }
            },
        );
        Ok(())
    }
}

impl Kernel for LayerNormKernel {
    fn compute(&self, ctx: &mut KernelContext<'_>) -> Result<()> {
        let x = ctx.input(0)?;
        let scale = ctx.input(1)?;
        let bias = ctx.input_opt(2);

        let rank = x.shape().len() as i64;
        if self.axis < -rank || self.axis >= rank {
            return Err(Error::InvalidArgument(format!(
                "invalid axis {} for rank {}",
                self.axis, rank
            )));
        }
        let axis = if self.axis < 0 {
            (rank + self.axis) as usize
        } else {
            self.axis as usize
        };

        let norm_count: usize = x.shape()[..axis].iter().product();
        let norm_size: usize = x.shape()[axis..].iter().product();

        let scale_size = scale.len();
        let bias_size = bias.map(Tensor::len).unwrap_or(0);
        if scale_size != norm_size || (bias.is_some() && bias_size != norm_size) {
            return Err(Error::InvalidArgument(format!(
                "size of the normalized extent is {}; scale size {} and bias size {} must match",
                norm_size, scale_size, bias_size
            )));
        }

        // Secondary output shape: leading dims kept, normalized dims
        // collapsed to 1. Stored as f32 regardless of the input precision.
        let mut stat_shape: Vec<usize> = x.shape()[..axis].to_vec();
        stat_shape.extend(std::iter::repeat(1).take(x.shape().len() - axis));

        let allocator = ctx.allocator();
        let mut y = allocator.alloc_tensor(x.dtype(), x.shape())?;
        let mut mean_out = if ctx.output_requested(1) {
            Some(allocator.alloc_tensor(DataType::F32, &stat_shape)?)
        } else {
            None
        };
        let mut inv_out = if ctx.output_requested(2) {
            Some(allocator.alloc_tensor(DataType::F32, &stat_shape)?)
        } else {
            None
        };

        if !x.is_empty() {
            match x.dtype() {
                DataType::F32 => self.compute_typed::<f32>(
                    ctx,
                    x,
                    scale,
                    bias,
                    &mut y,
                    mean_out.as_mut(),
                    inv_out.as_mut(),
                    norm_count,
                    norm_size,
                )?,
                DataType::F16 => self.compute_typed::<f16>(
                    ctx,
                    x,
                    scale,
                    bias,
                    &mut y,
                    mean_out.as_mut(),
                    inv_out.as_mut(),
                    norm_count,
                    norm_size,
                )?,
                other => {
                    return Err(Error::InvalidArgument(format!(
                        "layer normalization does not support {:?} input",
                        other
                    )))
                }
            }
        }

        ctx.set_output(0, y)?;
        if let Some(mean) = mean_out {
            ctx.set_output(1, mean)?;
        }
        if let Some(inv) = inv_out {
            ctx.set_output(2, inv)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cinnabar_core::{AttributeValue, CpuAllocator, TaskPool};

    fn run_norm(
        kernel: &LayerNormKernel,
        inputs: Vec<&Tensor>,
        requested: Vec<bool>,
    ) -> Result<Vec<Option<Tensor>>> {
        let node = Node::new("LayerNormalization");
        let pool = TaskPool::inline();
        let allocator = CpuAllocator::new();
        let mut ctx = KernelContext::new(
            &node,
            inputs.into_iter().map(Some).collect(),
            requested,
            &pool,
            &allocator,
            None,
        );
        kernel.compute(&mut ctx)?;
        Ok(ctx.into_outputs())
    }

    fn norm_kernel(axis: i64, epsilon: f32, simplified: bool) -> LayerNormKernel {
        let node = Node::new("LayerNormalization")
            .with_attr("axis", AttributeValue::Int(axis))
            .with_attr("epsilon", AttributeValue::Float(epsilon));
        LayerNormKernel::new(&node, simplified).unwrap()
    }

    #[test]
    fn test_layer_norm_basic() {
        let kernel = norm_kernel(-1, 1e-5, false);
        let x = Tensor::from_vec(vec![1.0f32, 2.0, 3.0, 4.0], &[1, 4]);
        let scale = Tensor::from_vec(vec![1.0f32; 4], &[4]);
        let outputs = run_norm(&kernel, vec![&x, &scale], vec![true]).unwrap();
        let y = outputs[0].as_ref().unwrap().to_vec::<f32>().unwrap();

        // mean = 2.5, var = 1.25
        let inv = 1.0 / (1.25f32 + 1e-5).sqrt();
        for (i, &v) in [1.0f32, 2.0, 3.0, 4.0].iter().enumerate() {
            assert!((y[i] - (v - 2.5) * inv).abs() < 1e-5);
        }
    }

    #[test]
    fn test_all_equal_input_mean_and_bounded_inv_std() {
        let epsilon = 1e-5;
        let kernel = norm_kernel(-1, epsilon, false);
        let x = Tensor::from_vec(vec![3.0f32; 8], &[2, 4]);
        let scale = Tensor::from_vec(vec![1.0f32; 4], &[4]);
        let outputs = run_norm(&kernel, vec![&x, &scale], vec![true, true, true]).unwrap();

        let mean = outputs[1].as_ref().unwrap().to_vec::<f32>().unwrap();
        let inv = outputs[2].as_ref().unwrap().to_vec::<f32>().unwrap();
        assert_eq!(outputs[1].as_ref().unwrap().shape(), &[2, 1]);

        for r in 0..2 {
            // Mean is the element value itself.
            assert!((mean[r] - 3.0).abs() < 1e-5);
            // Variance is zero; epsilon strictly prevents division by zero.
            assert!(inv[r].is_finite());
            assert!((inv[r] - 1.0 / epsilon.sqrt()).abs() / inv[r] < 1e-3);
        }
    }

    #[test]
    fn test_simplified_agrees_with_standard_for_zero_mean_input() {
        let x = Tensor::from_vec(vec![-2.0f32, -1.0, 1.0, 2.0], &[1, 4]);
        let scale = Tensor::from_vec(vec![0.5f32, 1.0, 1.5, 2.0], &[4]);

        let standard = norm_kernel(-1, 1e-5, false);
        let simplified = norm_kernel(-1, 1e-5, true);

        let y_std = run_norm(&standard, vec![&x, &scale], vec![true]).unwrap()[0]
            .as_ref()
            .unwrap()
            .to_vec::<f32>()
            .unwrap();
        let y_rms = run_norm(&simplified, vec![&x, &scale], vec![true]).unwrap()[0]
            .as_ref()
            .unwrap()
            .to_vec::<f32>()
            .unwrap();

        for (a, b) in y_std.iter().zip(&y_rms) {
            assert!((a - b).abs() < 1e-5, "{} vs {}", a, b);
        }
    }

    #[test]
    fn test_f16_accumulates_in_f32() {
        let kernel = norm_kernel(-1, 1e-5, false);
        let values: Vec<f32> = (0..64).map(|i| (i as f32) * 0.125 - 4.0).collect();
        let x16 = Tensor::from_vec(
            values.iter().map(|&v| f16::from_f32(v)).collect::<Vec<_>>(),
            &[1, 64],
        );
        let scale16 = Tensor::from_vec(vec![f16::from_f32(1.0); 64], &[64]);
        let y16 = run_norm(&kernel, vec![&x16, &scale16], vec![true]).unwrap()[0]
            .as_ref()
            .unwrap()
            .to_vec::<f16>()
            .unwrap();

        let x32 = Tensor::from_vec(values.clone(), &[1, 64]);
        let scale32 = Tensor::from_vec(vec![1.0f32; 64], &[64]);
        let y32 = run_norm(&kernel, vec![&x32, &scale32], vec![true]).unwrap()[0]
            .as_ref()
            .unwrap()
            .to_vec::<f32>()
            .unwrap();

        // The f16 result equals the f32 result up to storage rounding.
        for (a, b) in y16.iter().zip(&y32) {
            assert!((a.to_f32() - b).abs() < 5e-3, "{} vs {}", a, b);
        }
    }

    #[test]
    fn test_scale_size_mismatch_is_fatal() {
        let kernel = norm_kernel(-1, 1e-5, false);
        let x = Tensor::from_vec(vec![1.0f32; 8], &[2, 4]);
        let scale = Tensor::from_vec(vec![1.0f32; 3], &[3]);
        let err = run_norm(&kernel, vec![&x, &scale], vec![true]).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_invalid_axis() {
        let kernel = norm_kernel(5, 1e-5, false);
        let x = Tensor::from_vec(vec![1.0f32; 4], &[2, 2]);
        let scale = Tensor::from_vec(vec![1.0f32; 2], &[2]);
        assert!(run_norm(&kernel, vec![&x, &scale], vec![true]).is_err());
    }

    #[test]
    fn test_zero_volume_input() {
        let kernel = norm_kernel(-1, 1e-5, false);
        let x = Tensor::from_vec(Vec::<f32>::new(), &[0, 4]);
        let scale = Tensor::from_vec(vec![1.0f32; 4], &[4]);
        let outputs = run_norm(&kernel, vec![&x, &scale], vec![true]).unwrap();
        assert!(outputs[0].as_ref().unwrap().is_empty());
    }
}
