//! Specialized f32 pooling path.
//!
//! The original engine hands eligible pooling off to an external vectorized
//! math library; this module keeps that calling contract (pool kind, spatial
//! geometry, flat input/output, thread pool) around a portable
//! contiguous-row reduction. Eligibility is the same as the original's:
//! f32 data, no dilation above 1, and no index output requested — anything
//! else takes the generic loop.

use crate::parallel::SharedSlice;
use crate::pool_loop::PoolGeometry;
use cinnabar_core::TaskPool;

/// Reduction kind for the specialized path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FastPoolKind {
    Maximum,
    AverageExcludePad,
    AverageIncludePad,
}

/// Run f32 pooling over the whole tensor, partitioning the batch×channel
/// extent across the task pool.
///
/// Requires `geom.dilation == [1, 1, 1]`; the generic loop handles dilated
/// windows.
pub(crate) fn pool_f32(
    kind: FastPoolKind,
    geom: &PoolGeometry,
    x: &[f32],
    y: &mut [f32],
    pool: &TaskPool,
) {
    debug_assert_eq!(geom.dilation, [1, 1, 1]);
    let shared = SharedSlice::new(y);
    pool.parallel_for(
        geom.total_channels,
        geom.cost_per_channel(),
        |channels| {
            let x_step = geom.x_step();
            let y_step = geom.y_step();
            let [height, width, depth] = geom.input;
            let kernel_volume = geom.kernel_volume();

            for c in channels {
                let x_chan = &x[c * x_step..(c + 1) * x_step];
                let y_chan = unsafe { shared.slice_mut(c * y_step..(c + 1) * y_step) };

                let mut out = 0;
                for ph in 0..geom.output[0] {
                    let (h0, h1) = tap_bounds(ph, geom.stride[0], geom.pad_head[0], geom.kernel[0], height);
                    for pw in 0..geom.output[1] {
                        let (w0, w1) = tap_bounds(pw, geom.stride[1], geom.pad_head[1], geom.kernel[1], width);
                        for pd in 0..geom.output[2] {
                            let (d0, d1) =
                                tap_bounds(pd, geom.stride[2], geom.pad_head[2], geom.kernel[2], depth);
                            // The innermost dimension is contiguous; reduce
                            // whole rows at a time.
                            let mut acc = match kind {
                                FastPoolKind::Maximum => f32::MIN,
                                _ => 0.0,
                            };
                            let mut count = 0usize;
                            for h in h0..h1 {
                                for w in w0..w1 {
                                    let row = &x_chan[(h * width + w) * depth + d0
                                        ..(h * width + w) * depth + d1];
                                    match kind {
                                        FastPoolKind::Maximum => {
                                            acc = row.iter().fold(acc, |m, &v| if v > m { v } else { m });
                                        }
                                        _ => {
                                            acc += row.iter().sum::<f32>();
                                        }
                                    }
                                    count += row.len();
                                }
                            }
                            y_chan[out] = match kind {
                                FastPoolKind::Maximum => acc,
                                FastPoolKind::AverageIncludePad => acc / kernel_volume as f32,
                                FastPoolKind::AverageExcludePad => {
                                    if count == 0 {
                                        0.0
                                    } else {
                                        acc / count as f32
                                    }
                                }
                            };
                            out += 1;
                        }
                    }
                }
            }
        },
    );
}

/// Clamped window bounds along one dimension for an undilated kernel.
fn tap_bounds(out: usize, stride: usize, pad_head: usize, kernel: usize, extent: usize) -> (usize, usize) {
    let start = out as isize * stride as isize - pad_head as isize;
    let end = start + kernel as isize;
    (start.max(0) as usize, (end.max(0) as usize).min(extent))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool_attrs::{PoolAttrs, ResolvedPool};
    use crate::pool_loop::{average_pool_range, max_pool_range};
    use cinnabar_core::{AttributeValue, Node, TaskPool};

    fn geometry(input: &[usize], kernel: &[i64], strides: &[i64], pads: &[i64]) -> (PoolGeometry, ResolvedPool) {
        let node = Node::new("MaxPool")
            .with_attr("kernel_shape", AttributeValue::Ints(kernel.to_vec()))
            .with_attr("strides", AttributeValue::Ints(strides.to_vec()))
            .with_attr("pads", AttributeValue::Ints(pads.to_vec()));
        let attrs = PoolAttrs::from_node(&node, false).unwrap();
        let resolved = attrs.resolve(input).unwrap();
        (PoolGeometry::new(input, &resolved), resolved)
    }

    /// The fast path and the generic loop must agree wherever both apply.
    #[test]
    fn test_fastpath_matches_generic_max() {
        let input = [2, 3, 5, 6];
        let (geom, _) = geometry(&input, &[3, 2], &[2, 1], &[1, 0, 1, 0]);
        let x: Vec<f32> = (0..input.iter().product::<usize>())
            .map(|i| ((i * 31 % 97) as f32) - 48.0)
            .collect();
        let total = geom.total_channels * geom.y_step();

        let mut fast = vec![0.0f32; total];
        pool_f32(FastPoolKind::Maximum, &geom, &x, &mut fast, &TaskPool::inline());

        let mut generic = vec![0.0f32; total];
        let shared = SharedSlice::new(&mut generic);
        max_pool_range::<f32>(&x, &shared, None, &geom, 0, 0..geom.total_channels);

        assert_eq!(fast, generic);
    }

    #[test]
    fn test_fastpath_matches_generic_average() {
        let input = [1, 2, 7];
        let (geom, _) = geometry(&input, &[3], &[2], &[1, 1]);
        let x: Vec<f32> = (0..input.iter().product::<usize>())
            .map(|i| i as f32 * 0.25)
            .collect();
        let total = geom.total_channels * geom.y_step();

        for (kind, include_pad) in [
            (FastPoolKind::AverageExcludePad, false),
            (FastPoolKind::AverageIncludePad, true),
        ] {
            let mut fast = vec![0.0f32; total];
            pool_f32(kind, &geom, &x, &mut fast, &TaskPool::inline());

            let mut generic = vec![0.0f32; total];
            let shared = SharedSlice::new(&mut generic);
            average_pool_range(&x, &shared, &geom, include_pad, 0..geom.total_channels);

            for (a, b) in fast.iter().zip(&generic) {
                assert!((a - b).abs() < 1e-5, "{} vs {}", a, b);
            }
        }
    }
}
