//! Pooling attributes and output-shape derivation.

use cinnabar_core::{Error, Node, Result};

/// Automatic padding mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoPad {
    NotSet,
    SameUpper,
    SameLower,
    Valid,
}

impl AutoPad {
    fn parse(value: &str) -> Result<Self> {
        match value {
            "" | "NOTSET" => Ok(AutoPad::NotSet),
            "SAME_UPPER" => Ok(AutoPad::SameUpper),
            "SAME_LOWER" => Ok(AutoPad::SameLower),
            "VALID" => Ok(AutoPad::Valid),
            other => Err(Error::InvalidArgument(format!(
                "unknown auto_pad value '{}'",
                other
            ))),
        }
    }
}

/// Configuration of a pooling operator, fixed at kernel-construction time.
///
/// Pooling requires rank >= 3 inputs (batch, channel, >= 1 spatial dim) and
/// supports at most 3 spatial dimensions. In global mode the window is the
/// entire spatial extent and padding is zero.
#[derive(Debug, Clone)]
pub struct PoolAttrs {
    pub global: bool,
    pub kernel_shape: Vec<usize>,
    pub auto_pad: AutoPad,
    /// Pads as [head_0, .., head_k, tail_0, .., tail_k].
    pub pads: Vec<usize>,
    pub strides: Vec<usize>,
    pub dilations: Vec<usize>,
    pub ceil_mode: bool,
    pub count_include_pad: bool,
    /// Index-output layout for max pooling: 0 = row-major, 1 = column-major.
    pub storage_order: i64,
    /// Exponent for Lp pooling.
    pub p: i64,
}

impl PoolAttrs {
    /// Parse pooling attributes from a node.
    ///
    /// Malformed attribute combinations are fatal for the node: a
    /// `kernel_shape` missing outside global mode, negative entries, or a
    /// pads list that is not twice the kernel rank all fail here, before any
    /// buffer is touched.
    pub fn from_node(node: &Node, global: bool) -> Result<Self> {
        let kernel_shape = if global {
            Vec::new()
        } else {
            let raw: Vec<i64> = node.attr("kernel_shape")?;
            to_positive_dims(&raw, "kernel_shape")?
        };
        let rank = kernel_shape.len();

        let auto_pad = AutoPad::parse(&node.attr_or::<String>("auto_pad", String::new())?)?;

        let pads_raw: Vec<i64> = node.attr_or("pads", vec![0; rank * 2])?;
        let pads = to_non_negative_dims(&pads_raw, "pads")?;
        if !global && pads.len() != rank * 2 {
            return Err(Error::InvalidArgument(format!(
                "pads has {} entries, expected {} for kernel rank {}",
                pads.len(),
                rank * 2,
                rank
            )));
        }

        let strides_raw: Vec<i64> = node.attr_or("strides", vec![1; rank])?;
        let strides = to_positive_dims(&strides_raw, "strides")?;
        if !global && strides.len() != rank {
            return Err(Error::InvalidArgument(format!(
                "strides has {} entries, expected {}",
                strides.len(),
                rank
            )));
        }

        let dilations_raw: Vec<i64> = node.attr_or("dilations", vec![1; rank])?;
        let dilations = to_positive_dims(&dilations_raw, "dilations")?;
        if !global && dilations.len() != rank {
            return Err(Error::InvalidArgument(format!(
                "dilations has {} entries, expected {}",
                dilations.len(),
                rank
            )));
        }

        let p = node.attr_or("p", 2)?;
        if p < 1 {
            return Err(Error::InvalidArgument(format!(
                "Lp pooling exponent must be >= 1, got {}",
                p
            )));
        }

        Ok(Self {
            global,
            kernel_shape,
            auto_pad,
            pads,
            strides,
            dilations,
            ceil_mode: node.attr_or("ceil_mode", 0)? != 0,
            count_include_pad: node.attr_or("count_include_pad", 0)? != 0,
            storage_order: node.attr_or("storage_order", 0)?,
            p,
        })
    }

    /// Whether any dilation exceeds 1. Dilated windows are incompatible with
    /// the specialized fast path.
    pub fn needs_dilation(&self) -> bool {
        self.dilations.iter().any(|&d| d > 1)
    }

    /// Bind the attributes to a concrete input shape, producing the
    /// effective per-spatial-dimension geometry and the full output shape.
    ///
    /// This is a pure function of the input shape and the attributes. Global
    /// mode substitutes window = full spatial extent, zero pads, unit
    /// strides and dilations.
    pub fn resolve(&self, input_shape: &[usize]) -> Result<ResolvedPool> {
        if input_shape.len() < 3 {
            return Err(Error::InvalidArgument(format!(
                "pooling input must have rank >= 3, got {:?}",
                input_shape
            )));
        }
        let spatial = &input_shape[2..];
        if spatial.len() > 3 {
            return Err(Error::InvalidArgument(format!(
                "pooling supports at most 3 spatial dims, got {}",
                spatial.len()
            )));
        }

        let (kernel, pads, strides, dilations) = if self.global {
            (
                spatial.to_vec(),
                vec![0; spatial.len() * 2],
                vec![1; spatial.len()],
                vec![1; spatial.len()],
            )
        } else {
            if self.kernel_shape.len() != spatial.len() {
                return Err(Error::InvalidArgument(format!(
                    "kernel_shape rank {} is not compatible with input spatial rank {}",
                    self.kernel_shape.len(),
                    spatial.len()
                )));
            }
            (
                self.kernel_shape.clone(),
                self.pads.clone(),
                self.strides.clone(),
                self.dilations.clone(),
            )
        };

        let rank = kernel.len();
        let mut out_spatial = Vec::with_capacity(rank);
        let mut resolved_pads = pads;
        for i in 0..rank {
            let dkernel = dilations[i] * (kernel[i] - 1) + 1;
            match self.auto_pad {
                AutoPad::NotSet => {}
                AutoPad::Valid => {
                    resolved_pads[i] = 0;
                    resolved_pads[i + rank] = 0;
                }
                AutoPad::SameUpper | AutoPad::SameLower => {
                    let out = spatial[i].div_ceil(strides[i]);
                    let needed = ((out - 1) * strides[i] + dkernel).saturating_sub(spatial[i]);
                    let head = if self.auto_pad == AutoPad::SameLower {
                        needed.div_ceil(2)
                    } else {
                        needed / 2
                    };
                    resolved_pads[i] = head;
                    resolved_pads[i + rank] = needed - head;
                }
            }
            out_spatial.push(pooled_dim(
                spatial[i],
                dkernel,
                strides[i],
                resolved_pads[i],
                resolved_pads[i + rank],
                self.ceil_mode,
            ));
        }

        let mut output_shape = Vec::with_capacity(input_shape.len());
        output_shape.push(input_shape[0]);
        output_shape.push(input_shape[1]);
        output_shape.extend_from_slice(&out_spatial);

        Ok(ResolvedPool {
            kernel,
            pads: resolved_pads,
            strides,
            dilations,
            output_shape,
        })
    }
}

/// Pooling geometry bound to one concrete input shape.
#[derive(Debug, Clone)]
pub struct ResolvedPool {
    pub kernel: Vec<usize>,
    pub pads: Vec<usize>,
    pub strides: Vec<usize>,
    pub dilations: Vec<usize>,
    pub output_shape: Vec<usize>,
}

/// Output extent of one spatial dimension:
/// `(input + pad_head + pad_tail - dilated_kernel) / stride + 1`, floored or
/// ceiled, clamped at zero so degenerate configurations produce a
/// zero-volume output rather than an underflow.
fn pooled_dim(
    input: usize,
    dilated_kernel: usize,
    stride: usize,
    pad_head: usize,
    pad_tail: usize,
    ceil_mode: bool,
) -> usize {
    let padded = input + pad_head + pad_tail;
    if padded < dilated_kernel {
        return 0;
    }
    let span = padded - dilated_kernel;
    let out = if ceil_mode {
        span.div_ceil(stride) + 1
    } else {
        span / stride + 1
    };
    if ceil_mode {
        // The last window must start inside the input or its head padding;
        // windows starting entirely in tail padding are dropped.
        if (out - 1) * stride >= input + pad_head {
            return out - 1;
        }
    }
    out
}

fn to_positive_dims(raw: &[i64], name: &str) -> Result<Vec<usize>> {
    raw.iter()
        .map(|&v| {
            if v < 1 {
                Err(Error::InvalidArgument(format!(
                    "{} entries must be positive, got {}",
                    name, v
                )))
            } else {
                Ok(v as usize)
            }
        })
        .collect()
}

fn to_non_negative_dims(raw: &[i64], name: &str) -> Result<Vec<usize>> {
    raw.iter()
        .map(|&v| {
            if v < 0 {
                Err(Error::InvalidArgument(format!(
                    "{} entries must be non-negative, got {}",
                    name, v
                )))
            } else {
                Ok(v as usize)
            }
        })
        .collect()
}
