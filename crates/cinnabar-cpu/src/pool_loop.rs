//! Generic sliding-window pooling loops.
//!
//! These loops handle every pooling configuration, including dilation and
//! the index secondary output; the specialized fast path in `fastpath`
//! covers the common float cases. Shapes are normalized to three spatial
//! dimensions, with absent trailing dimensions held at 1.

use crate::parallel::SharedSlice;
use crate::pool_attrs::ResolvedPool;
use cinnabar_core::Element;
use std::ops::Range;

/// Pooling geometry normalized to three spatial dimensions.
#[derive(Debug, Clone)]
pub(crate) struct PoolGeometry {
    /// batch * channels: the outer extent partitioned across workers.
    pub total_channels: usize,
    pub input: [usize; 3],
    pub output: [usize; 3],
    pub kernel: [usize; 3],
    pub stride: [usize; 3],
    pub dilation: [usize; 3],
    pub pad_head: [usize; 3],
}

impl PoolGeometry {
    pub fn new(input_shape: &[usize], resolved: &ResolvedPool) -> Self {
        let rank = resolved.kernel.len();
        let pick = |v: &[usize], i: usize, default: usize| {
            if i < rank {
                v[i]
            } else {
                default
            }
        };
        let spatial = &input_shape[2..];
        let out_spatial = &resolved.output_shape[2..];
        Self {
            total_channels: input_shape[0] * input_shape[1],
            input: [
                spatial[0],
                pick(spatial, 1, 1),
                pick(spatial, 2, 1),
            ],
            output: [
                out_spatial[0],
                pick(out_spatial, 1, 1),
                pick(out_spatial, 2, 1),
            ],
            kernel: [
                resolved.kernel[0],
                pick(&resolved.kernel, 1, 1),
                pick(&resolved.kernel, 2, 1),
            ],
            stride: [
                resolved.strides[0],
                pick(&resolved.strides, 1, 1),
                pick(&resolved.strides, 2, 1),
            ],
            dilation: [
                resolved.dilations[0],
                pick(&resolved.dilations, 1, 1),
                pick(&resolved.dilations, 2, 1),
            ],
            pad_head: [
                resolved.pads[0],
                pick(&resolved.pads, 1, 0),
                pick(&resolved.pads, 2, 0),
            ],
        }
    }

    /// Elements per input channel.
    pub fn x_step(&self) -> usize {
        self.input.iter().product()
    }

    /// Elements per output channel.
    pub fn y_step(&self) -> usize {
        self.output.iter().product()
    }

    /// Window positions per output element.
    pub fn kernel_volume(&self) -> usize {
        self.kernel.iter().product()
    }

    /// Estimated compute cost per channel unit, handed to the task pool.
    pub fn cost_per_channel(&self) -> f64 {
        self.y_step() as f64 * self.kernel_volume() as f64
    }

    /// In-bounds window coordinates along one dimension for output index
    /// `out`: the valid kernel tap positions after padding and dilation.
    fn taps(&self, dim: usize, out: usize) -> impl Iterator<Item = usize> + '_ {
        let start = out as isize * self.stride[dim] as isize - self.pad_head[dim] as isize;
        let dilation = self.dilation[dim] as isize;
        let extent = self.input[dim] as isize;
        (0..self.kernel[dim] as isize).filter_map(move |k| {
            let pos = start + k * dilation;
            (pos >= 0 && pos < extent).then_some(pos as usize)
        })
    }
}

/// Element types max pooling reduces over.
pub(crate) trait PoolElement: Element + Copy + PartialOrd {
    /// The identity of the max reduction (the type's lowest finite value).
    const LOWEST: Self;
}

impl PoolElement for f32 {
    const LOWEST: Self = f32::MIN;
}
impl PoolElement for f64 {
    const LOWEST: Self = f64::MIN;
}
impl PoolElement for i8 {
    const LOWEST: Self = i8::MIN;
}
impl PoolElement for u8 {
    const LOWEST: Self = u8::MIN;
}

/// Max pooling over a range of channel units, optionally recording the flat
/// input index of each winning element.
///
/// `storage_order` selects the index layout within a channel: 0 is
/// row-major, 1 is column-major over the spatial dims. The recorded index is
/// global (it includes the channel base offset).
pub(crate) fn max_pool_range<T: PoolElement>(
    x: &[T],
    y: &SharedSlice<'_, T>,
    indices: Option<&SharedSlice<'_, i64>>,
    geom: &PoolGeometry,
    storage_order: i64,
    channels: Range<usize>,
) {
    let x_step = geom.x_step();
    let y_step = geom.y_step();
    let [height, width, depth] = geom.input;

    for c in channels {
        let x_chan = &x[c * x_step..(c + 1) * x_step];
        // Channels are disjoint per worker range, so these views never alias.
        let y_chan = unsafe { y.slice_mut(c * y_step..(c + 1) * y_step) };
        let mut i_chan =
            indices.map(|ind| unsafe { ind.slice_mut(c * y_step..(c + 1) * y_step) });

        let mut out = 0;
        for ph in 0..geom.output[0] {
            for pw in 0..geom.output[1] {
                for pd in 0..geom.output[2] {
                    let mut max = T::LOWEST;
                    let mut max_pos = [0usize; 3];
                    let mut seen = false;
                    for h in geom.taps(0, ph) {
                        for w in geom.taps(1, pw) {
                            for d in geom.taps(2, pd) {
                                let v = x_chan[(h * width + w) * depth + d];
                                if !seen || v > max {
                                    max = v;
                                    max_pos = [h, w, d];
                                    seen = true;
                                }
                            }
                        }
                    }
                    y_chan[out] = max;
                    if let Some(i_chan) = i_chan.as_mut() {
                        let [h, w, d] = max_pos;
                        let local = if storage_order == 0 {
                            (h * width + w) * depth + d
                        } else {
                            // Column-major over the spatial dims.
                            h + w * height + d * height * width
                        };
                        i_chan[out] = (c * x_step + local) as i64;
                    }
                    out += 1;
                }
            }
        }
    }
}

/// Average pooling (f32) over a range of channel units.
///
/// With `count_include_pad` the divisor is the full kernel volume; without
/// it, only in-bounds elements count. The two differ only at border windows
/// that overlap padding.
pub(crate) fn average_pool_range(
    x: &[f32],
    y: &SharedSlice<'_, f32>,
    geom: &PoolGeometry,
    count_include_pad: bool,
    channels: Range<usize>,
) {
    let x_step = geom.x_step();
    let y_step = geom.y_step();
    let [_, width, depth] = geom.input;
    let kernel_volume = geom.kernel_volume();

    for c in channels {
        let x_chan = &x[c * x_step..(c + 1) * x_step];
        let y_chan = unsafe { y.slice_mut(c * y_step..(c + 1) * y_step) };

        let mut out = 0;
        for ph in 0..geom.output[0] {
            for pw in 0..geom.output[1] {
                for pd in 0..geom.output[2] {
                    let mut sum = 0.0f32;
                    let mut count = 0usize;
                    for h in geom.taps(0, ph) {
                        for w in geom.taps(1, pw) {
                            for d in geom.taps(2, pd) {
                                sum += x_chan[(h * width + w) * depth + d];
                                count += 1;
                            }
                        }
                    }
                    let divisor = if count_include_pad {
                        kernel_volume
                    } else {
                        count
                    };
                    y_chan[out] = if divisor == 0 { 0.0 } else { sum / divisor as f32 };
                    out += 1;
                }
            }
        }
    }
}

/// Lp pooling (f32) over a range of channel units: raise each element to
/// power `p`, sum over the window, take the p-th root.
pub(crate) fn lp_pool_range(
    x: &[f32],
    y: &SharedSlice<'_, f32>,
    geom: &PoolGeometry,
    p: i64,
    channels: Range<usize>,
) {
    let x_step = geom.x_step();
    let y_step = geom.y_step();
    let [_, width, depth] = geom.input;
    let p = p as f32;

    for c in channels {
        let x_chan = &x[c * x_step..(c + 1) * x_step];
        let y_chan = unsafe { y.slice_mut(c * y_step..(c + 1) * y_step) };

        let mut out = 0;
        for ph in 0..geom.output[0] {
            for pw in 0..geom.output[1] {
                for pd in 0..geom.output[2] {
                    let mut sum = 0.0f32;
                    for h in geom.taps(0, ph) {
                        for w in geom.taps(1, pw) {
                            for d in geom.taps(2, pd) {
                                sum += x_chan[(h * width + w) * depth + d].abs().powf(p);
                            }
                        }
                    }
                    y_chan[out] = sum.powf(1.0 / p);
                    out += 1;
                }
            }
        }
    }
}
