//! Generated WGSL layer-normalization program.
//!
//! The GPU variant emits a small compute program per parameter combination:
//! vectorization width (1, 2, or 4 elements per lane, chosen from the
//! normalization extent's divisibility), element precision (f16/f32),
//! simplified flag, bias presence, and the optional mean / inverse-std-dev
//! side outputs. One workgroup lane reduces one normalization row with a
//! two-pass streaming mean and mean-of-squares, so the full window is never
//! materialized in registers. Numeric semantics match the CPU path up to
//! floating-point reduction order.

use crate::device::GpuContext;
use cinnabar_core::{DataType, Error, Kernel, KernelContext, Node, Result, Tensor};
use std::fmt::Write;

/// Lanes per workgroup; the dispatch grid is ceil(norm_count / this).
pub const WORKGROUP_SIZE: u32 = 64;

/// Widest vector load that divides the normalization extent.
pub fn max_components(norm_size: usize) -> u32 {
    if norm_size % 4 == 0 {
        4
    } else if norm_size % 2 == 0 {
        2
    } else {
        1
    }
}

/// Parameters a generated normalization shader is specialized on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerNormProgram {
    pub components: u32,
    pub is_fp16: bool,
    pub simplified: bool,
    pub has_bias: bool,
    pub has_mean_output: bool,
    pub has_inv_std_dev_output: bool,
}

impl LayerNormProgram {
    /// Cache label encoding every specialization parameter.
    pub fn label(&self) -> String {
        format!(
            "layer_norm_c{}_{}{}{}{}{}",
            self.components,
            if self.is_fp16 { "f16" } else { "f32" },
            if self.simplified { "_simpl" } else { "" },
            if self.has_bias { "_bias" } else { "" },
            if self.has_mean_output { "_mean" } else { "" },
            if self.has_inv_std_dev_output { "_isd" } else { "" },
        )
    }

    fn value_type(&self, scalar: &str) -> String {
        match self.components {
            1 => scalar.to_string(),
            n => format!("vec{}<{}>", n, scalar),
        }
    }

    fn sum_vector(&self, name: &str) -> String {
        match self.components {
            1 => name.to_string(),
            2 => format!("({name}.x + {name}.y)"),
            _ => format!("({name}.x + {name}.y + {name}.z + {name}.w)"),
        }
    }

    /// Binding index of each buffer in declaration order:
    /// params, x, scale, [bias], y, [mean], [inv_std_dev].
    pub fn bindings(&self) -> LayerNormBindings {
        let mut next = 3u32;
        let bias = self.has_bias.then(|| post_inc(&mut next));
        let y = post_inc(&mut next);
        let mean = self.has_mean_output.then(|| post_inc(&mut next));
        let inv = self.has_inv_std_dev_output.then(|| post_inc(&mut next));
        LayerNormBindings {
            params: 0,
            x: 1,
            scale: 2,
            bias,
            y,
            mean,
            inv_std_dev: inv,
        }
    }

    /// Emit the WGSL source for this specialization.
    pub fn generate_wgsl(&self) -> String {
        let element_t = if self.is_fp16 { "f16" } else { "f32" };
        let x_value_t = self.value_type(element_t);
        let f32_val_t = self.value_type("f32");
        let b = self.bindings();

        let mut s = String::new();
        if self.is_fp16 {
            s.push_str("enable f16;\n\n");
        }
        let _ = writeln!(
            s,
            "struct NormParams {{\n    norm_count: u32,\n    norm_size: u32,\n    norm_size_vectorized: u32,\n    epsilon: f32,\n}}\n"
        );
        let _ = writeln!(s, "@group(0) @binding({}) var<uniform> params: NormParams;", b.params);
        let _ = writeln!(
            s,
            "@group(0) @binding({}) var<storage, read> x: array<{x_value_t}>;",
            b.x
        );
        let _ = writeln!(
            s,
            "@group(0) @binding({}) var<storage, read> scale: array<{x_value_t}>;",
            b.scale
        );
        if let Some(bias) = b.bias {
            let _ = writeln!(
                s,
                "@group(0) @binding({bias}) var<storage, read> bias: array<{x_value_t}>;"
            );
        }
        let _ = writeln!(
            s,
            "@group(0) @binding({}) var<storage, read_write> y: array<{x_value_t}>;",
            b.y
        );
        if let Some(mean) = b.mean {
            let _ = writeln!(
                s,
                "@group(0) @binding({mean}) var<storage, read_write> mean_output: array<f32>;"
            );
        }
        if let Some(inv) = b.inv_std_dev {
            let _ = writeln!(
                s,
                "@group(0) @binding({inv}) var<storage, read_write> inv_std_dev_output: array<f32>;"
            );
        }

        // Reduction body. The simplified variant drops mean centering from
        // both the variance and the normalization.
        let simpl1 = if self.simplified { "" } else { " - mean * mean" };
        let simpl2 = if self.simplified { "" } else { " - mean" };
        let bias_term = if self.has_bias { " + bias[j]" } else { "" };
        let sum_mean = self.sum_vector("mean_vector");
        let sum_sq = self.sum_vector("mean_square_vector");

        let _ = writeln!(
            s,
            r#"
@compute @workgroup_size({WORKGROUP_SIZE})
fn main(@builtin(global_invocation_id) gid: vec3<u32>) {{
    let global_idx = gid.x;
    if (global_idx >= params.norm_count) {{
        return;
    }}
    let offset = global_idx * params.norm_size_vectorized;
    var mean_vector = {f32_val_t}(0.0);
    var mean_square_vector = {f32_val_t}(0.0);
    for (var h: u32 = 0u; h < params.norm_size_vectorized; h++) {{
        let value = {f32_val_t}(x[h + offset]);
        mean_vector += value;
        mean_square_vector += value * value;
    }}
    let mean = {sum_mean} / f32(params.norm_size);
    let inv_std_dev = inverseSqrt({sum_sq} / f32(params.norm_size){simpl1} + params.epsilon);
    for (var j: u32 = 0u; j < params.norm_size_vectorized; j++) {{
        let f32input = {f32_val_t}(x[j + offset]);
        let f32scale = {f32_val_t}(scale[j]);
        y[j + offset] = {x_value_t}((f32input{simpl2}) * inv_std_dev * f32scale){bias_term};
    }}"#
        );
        if b.mean.is_some() {
            let _ = writeln!(s, "    mean_output[global_idx] = mean;");
        }
        if b.inv_std_dev.is_some() {
            let _ = writeln!(s, "    inv_std_dev_output[global_idx] = inv_std_dev;");
        }
        s.push_str("}\n");
        s
    }
}

/// Binding indices for one specialization.
pub struct LayerNormBindings {
    pub params: u32,
    pub x: u32,
    pub scale: u32,
    pub bias: Option<u32>,
    pub y: u32,
    pub mean: Option<u32>,
    pub inv_std_dev: Option<u32>,
}

fn post_inc(n: &mut u32) -> u32 {
    let v = *n;
    *n += 1;
    v
}

/// LayerNormalization / SimplifiedLayerNormalization on the GPU backend.
pub struct GpuLayerNormKernel {
    axis: i64,
    epsilon: f32,
    simplified: bool,
}

impl GpuLayerNormKernel {
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
}

impl Kernel for GpuLayerNormKernel {
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

        if scale.len() != norm_size || bias.is_some_and(|b| b.len() != norm_size) {
            return Err(Error::InvalidArgument(format!(
                "size of the normalized extent is {}; scale size {} and bias size {} must match",
                norm_size,
                scale.len(),
                bias.map(Tensor::len).unwrap_or(0)
            )));
        }

        let is_fp16 = match x.dtype() {
            DataType::F32 => false,
            DataType::F16 => true,
            other => {
                return Err(Error::InvalidArgument(format!(
                    "layer normalization does not support {:?} input",
                    other
                )))
            }
        };

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
            let gpu = ctx.resources::<GpuContext>()?;
            if is_fp16 && !gpu.supports_f16() {
                return Err(Error::RuntimeFault(
                    "device does not support half-precision shaders".to_string(),
                ));
            }

            let program = LayerNormProgram {
                components: max_components(norm_size),
                is_fp16,
                simplified: self.simplified,
                has_bias: bias.is_some(),
                has_mean_output: mean_out.is_some(),
                has_inv_std_dev_output: inv_out.is_some(),
            };
            let bindings = program.bindings();
            let label = program.label();

            let mut layout = vec![
                GpuContext::uniform_entry(bindings.params),
                GpuContext::read_only_entry(bindings.x),
                GpuContext::read_only_entry(bindings.scale),
            ];
            if let Some(b) = bindings.bias {
                layout.push(GpuContext::read_only_entry(b));
            }
            layout.push(GpuContext::read_write_entry(bindings.y));
            if let Some(b) = bindings.mean {
                layout.push(GpuContext::read_write_entry(b));
            }
            if let Some(b) = bindings.inv_std_dev {
                layout.push(GpuContext::read_write_entry(b));
            }

            let cached =
                gpu.get_or_create_pipeline(&label, &program.generate_wgsl(), "main", &layout)?;

            let norm_size_vectorized = norm_size as u32 / program.components;
            let mut params = Vec::with_capacity(16);
            params.extend_from_slice(&(norm_count as u32).to_le_bytes());
            params.extend_from_slice(&(norm_size as u32).to_le_bytes());
            params.extend_from_slice(&norm_size_vectorized.to_le_bytes());
            params.extend_from_slice(&self.epsilon.to_le_bytes());

            let params_buf = gpu.upload_uniforms(&params, &format!("{label}_params"));
            let x_buf = gpu.upload(x.as_bytes()?, &format!("{label}_x"));
            let scale_buf = gpu.upload(scale.as_bytes()?, &format!("{label}_scale"));
            let bias_buf = bias
                .map(|b| Ok::<_, Error>(gpu.upload(b.as_bytes()?, &format!("{label}_bias"))))
                .transpose()?;
            let y_buf = gpu.create_storage_buffer(y.byte_len()?, &format!("{label}_y"));
            let stat_bytes = norm_count * 4;
            let mean_buf = mean_out
                .as_ref()
                .map(|_| gpu.create_storage_buffer(stat_bytes, &format!("{label}_mean")));
            let inv_buf = inv_out
                .as_ref()
                .map(|_| gpu.create_storage_buffer(stat_bytes, &format!("{label}_isd")));

            let mut entries = vec![
                wgpu::BindGroupEntry {
                    binding: bindings.params,
                    resource: params_buf.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: bindings.x,
                    resource: x_buf.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: bindings.scale,
                    resource: scale_buf.as_entire_binding(),
                },
            ];
            if let (Some(binding), Some(buf)) = (bindings.bias, bias_buf.as_ref()) {
                entries.push(wgpu::BindGroupEntry {
                    binding,
                    resource: buf.as_entire_binding(),
                });
            }
            entries.push(wgpu::BindGroupEntry {
                binding: bindings.y,
                resource: y_buf.as_entire_binding(),
            });
            if let (Some(binding), Some(buf)) = (bindings.mean, mean_buf.as_ref()) {
                entries.push(wgpu::BindGroupEntry {
                    binding,
                    resource: buf.as_entire_binding(),
                });
            }
            if let (Some(binding), Some(buf)) = (bindings.inv_std_dev, inv_buf.as_ref()) {
                entries.push(wgpu::BindGroupEntry {
                    binding,
                    resource: buf.as_entire_binding(),
                });
            }

            let groups = (norm_count as u32).div_ceil(WORKGROUP_SIZE);
            gpu.dispatch(&cached, &entries, [groups, 1, 1], &label);

            let y_bytes = gpu.readback(&y_buf, y.byte_len()?)?;
            y.as_bytes_mut()?.copy_from_slice(&y_bytes);
            if let (Some(mean), Some(buf)) = (mean_out.as_mut(), mean_buf.as_ref()) {
                let bytes = gpu.readback(buf, stat_bytes)?;
                mean.as_bytes_mut()?.copy_from_slice(&bytes);
            }
            if let (Some(inv), Some(buf)) = (inv_out.as_mut(), inv_buf.as_ref()) {
                let bytes = gpu.readback(buf, stat_bytes)?;
                inv.as_bytes_mut()?.copy_from_slice(&bytes);
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
    use crate::device::compile_wgsl;

    fn all_flag_combos() -> Vec<LayerNormProgram> {
        let mut combos = Vec::new();
        for components in [1u32, 2, 4] {
            for simplified in [false, true] {
                for has_bias in [false, true] {
                    for has_mean in [false, true] {
                        for has_inv in [false, true] {
                            combos.push(LayerNormProgram {
                                components,
                                is_fp16: false,
                                simplified,
                                has_bias,
                                has_mean_output: has_mean,
                                has_inv_std_dev_output: has_inv,
                            });
                        }
                    }
                }
            }
        }
        combos
    }

    #[test]
    fn test_generated_wgsl_validates_for_all_f32_combos() {
        for program in all_flag_combos() {
            let wgsl = program.generate_wgsl();
            let compiled = compile_wgsl(&program.label(), &wgsl);
            assert!(
                compiled.is_ok(),
                "shader {} failed to validate: {:?}\n{}",
                program.label(),
                compiled.err(),
                wgsl
            );
        }
    }

    #[test]
    fn test_vectorization_width_selection() {
        assert_eq!(max_components(64), 4);
        assert_eq!(max_components(6), 2);
        assert_eq!(max_components(7), 1);
        assert_eq!(max_components(2), 2);
    }

    #[test]
    fn test_generated_source_structure() {
        let program = LayerNormProgram {
            components: 4,
            is_fp16: false,
            simplified: false,
            has_bias: true,
            has_mean_output: true,
            has_inv_std_dev_output: true,
        };
        let wgsl = program.generate_wgsl();
        assert!(wgsl.contains("vec4<f32>"));
        assert!(wgsl.contains("inverseSqrt"));
        assert!(wgsl.contains("- mean * mean"));
        assert!(wgsl.contains("+ bias[j]"));
        assert!(wgsl.contains("mean_output[global_idx] = mean;"));
        assert!(wgsl.contains("inv_std_dev_output[global_idx] = inv_std_dev;"));
        // Guard against the last partial workgroup.
        assert!(wgsl.contains("if (global_idx >= params.norm_count)"));
    }

    #[test]
    fn test_simplified_drops_mean_centering() {
        let program = LayerNormProgram {
            components: 1,
            is_fp16: false,
            simplified: true,
            has_bias: false,
            has_mean_output: false,
            has_inv_std_dev_output: false,
        };
        let wgsl = program.generate_wgsl();
        assert!(!wgsl.contains("- mean * mean"));
        assert!(!wgsl.contains("(f32input - mean)"));
    }

    #[test]
    fn test_fp16_source_uses_half_types() {
        let program = LayerNormProgram {
            components: 2,
            is_fp16: true,
            simplified: false,
            has_bias: false,
            has_mean_output: false,
            has_inv_std_dev_output: false,
        };
        let wgsl = program.generate_wgsl();
        assert!(wgsl.starts_with("enable f16;"));
        assert!(wgsl.contains("array<vec2<f16>>"));
        // Accumulation stays in f32 regardless of storage precision.
        assert!(wgsl.contains("vec2<f32>(x[h + offset])"));
    }

    #[test]
    fn test_labels_are_unique_per_specialization() {
        let combos = all_flag_combos();
        let mut labels: Vec<String> = combos.iter().map(|p| p.label()).collect();
        labels.sort();
        labels.dedup();
        assert_eq!(labels.len(), combos.len());
    }
}
