//! Depthwise fast paths: 3×3 spatial and 3×3×3 volumetric kernels where
//! each output channel reads exactly one input channel.
//!
//! Requantization is fused into the window traversal so the generic
//! int32 accumulator buffer is never materialized.

use crate::kernels::epilogue::requantize_u8;

/// Depthwise filter laid out `[channel][kernel_total]` with per-channel
/// weight sums precomputed for the interior zero-point correction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackedDepthwise {
    data: Vec<i8>,
    sums: Vec<i32>,
    pub channels: usize,
    pub kernel_total: usize,
}

impl PackedDepthwise {
    /// `wq` is the quantized filter `[C, k...]` row-major with one input
    /// channel per group, i.e. already channel-major.
    pub fn pack(wq: &[i8], channels: usize, kernel_total: usize) -> Self {
        assert_eq!(wq.len(), channels * kernel_total);
        let sums = wq
            .chunks_exact(kernel_total)
            .map(|ch| ch.iter().map(|&w| w as i32).sum())
            .collect();
        Self {
            data: wq.to_vec(),
            sums,
            channels,
            kernel_total,
        }
    }

    #[inline]
    fn channel(&self, c: usize) -> &[i8] {
        &self.data[c * self.kernel_total..(c + 1) * self.kernel_total]
    }
}

#[inline]
fn unit(params: &[i32], c: usize) -> i32 {
    if params.len() == 1 {
        params[0]
    } else {
        params[c]
    }
}

#[inline]
fn unit_f32(params: &[f32], c: usize) -> f32 {
    if params.len() == 1 {
        params[0]
    } else {
        params[c]
    }
}

/// 3×3 depthwise convolution over one NHWC batch, u8 output.
#[allow(clippy::too_many_arguments)]
pub fn depthwise_3x3_nhwc(
    input: &[u8],
    batch: usize,
    in_h: usize,
    in_w: usize,
    channels: usize,
    stride: usize,
    pad: usize,
    out_h: usize,
    out_w: usize,
    packed: &PackedDepthwise,
    in_zero_point: i32,
    filter_zero_points: &[i32],
    bias: Option<&[i32]>,
    multipliers: &[f32],
    out_zero_point: i32,
    qmin: i32,
    qmax: i32,
    relu: bool,
    out: &mut [u8],
) {
    debug_assert_eq!(packed.kernel_total, 9);
    for n in 0..batch {
        let in_base = n * in_h * in_w * channels;
        let out_base = n * out_h * out_w * channels;
        for oh in 0..out_h {
            let ih0 = (oh * stride) as isize - pad as isize;
            for ow in 0..out_w {
                let iw0 = (ow * stride) as isize - pad as isize;
                let interior = ih0 >= 0
                    && iw0 >= 0
                    && ih0 + 3 <= in_h as isize
                    && iw0 + 3 <= in_w as isize;
                let o_pos = out_base + (oh * out_w + ow) * channels;
                for c in 0..channels {
                    let w = packed.channel(c);
                    let w_zp = unit(filter_zero_points, c);
                    let mut acc;
                    if interior {
                        let mut s_aw = 0i32;
                        let mut s_a = 0i32;
                        for kh in 0..3usize {
                            let row = in_base
                                + ((ih0 as usize + kh) * in_w + iw0 as usize) * channels
                                + c;
                            for kw in 0..3usize {
                                let a = input[row + kw * channels] as i32;
                                s_aw += a * w[kh * 3 + kw] as i32;
                                s_a += a;
                            }
                        }
                        acc = s_aw - in_zero_point * packed.sums[c];
                        if w_zp != 0 {
                            acc -= w_zp * (s_a - in_zero_point * 9);
                        }
                    } else {
                        acc = 0;
                        for kh in 0..3usize {
                            let ih = ih0 + kh as isize;
                            if ih < 0 || ih >= in_h as isize {
                                continue;
                            }
                            for kw in 0..3usize {
                                let iw = iw0 + kw as isize;
                                if iw < 0 || iw >= in_w as isize {
                                    continue;
                                }
                                let a = input[in_base
                                    + (ih as usize * in_w + iw as usize) * channels
                                    + c] as i32;
                                acc += (a - in_zero_point) * (w[kh * 3 + kw] as i32 - w_zp);
                            }
                        }
                    }
                    let acc = acc + bias.map_or(0, |b| b[c]);
                    let mut q = requantize_u8(
                        acc,
                        unit_f32(multipliers, c),
                        out_zero_point,
                        qmin,
                        qmax,
                    ) as i32;
                    if relu && q < out_zero_point {
                        q = out_zero_point;
                    }
                    out[o_pos + c] = q as u8;
                }
            }
        }
    }
}

/// 3×3×3 depthwise convolution over one NDHWC batch, u8 output. The
/// stride and padding apply uniformly to all three spatial dimensions.
#[allow(clippy::too_many_arguments)]
pub fn depthwise_3x3x3_ndhwc(
    input: &[u8],
    batch: usize,
    in_t: usize,
    in_h: usize,
    in_w: usize,
    channels: usize,
    stride: usize,
    pad: usize,
    out_t: usize,
    out_h: usize,
    out_w: usize,
    packed: &PackedDepthwise,
    in_zero_point: i32,
    filter_zero_points: &[i32],
    bias: Option<&[i32]>,
    multipliers: &[f32],
    out_zero_point: i32,
    qmin: i32,
    qmax: i32,
    relu: bool,
    out: &mut [u8],
) {
    debug_assert_eq!(packed.kernel_total, 27);
    for n in 0..batch {
        let in_base = n * in_t * in_h * in_w * channels;
        let out_base = n * out_t * out_h * out_w * channels;
        for ot in 0..out_t {
            let it0 = (ot * stride) as isize - pad as isize;
            for oh in 0..out_h {
                let ih0 = (oh * stride) as isize - pad as isize;
                for ow in 0..out_w {
                    let iw0 = (ow * stride) as isize - pad as isize;
                    let o_pos =
                        out_base + ((ot * out_h + oh) * out_w + ow) * channels;
                    for c in 0..channels {
                        let w = packed.channel(c);
                        let w_zp = unit(filter_zero_points, c);
                        let mut acc = 0i32;
                        for kt in 0..3usize {
                            let it = it0 + kt as isize;
                            if it < 0 || it >= in_t as isize {
                                continue;
                            }
                            for kh in 0..3usize {
                                let ih = ih0 + kh as isize;
                                if ih < 0 || ih >= in_h as isize {
                                    continue;
                                }
                                for kw in 0..3usize {
                                    let iw = iw0 + kw as isize;
                                    if iw < 0 || iw >= in_w as isize {
                                        continue;
                                    }
                                    let a = input[in_base
                                        + (((it as usize * in_h) + ih as usize) * in_w
                                            + iw as usize)
                                            * channels
                                        + c]
                                        as i32;
                                    acc += (a - in_zero_point)
                                        * (w[(kt * 3 + kh) * 3 + kw] as i32 - w_zp);
                                }
                            }
                        }
                        let acc = acc + bias.map_or(0, |b| b[c]);
                        let mut q = requantize_u8(
                            acc,
                            unit_f32(multipliers, c),
                            out_zero_point,
                            qmin,
                            qmax,
                        ) as i32;
                        if relu && q < out_zero_point {
                            q = out_zero_point;
                        }
                        out[o_pos + c] = q as u8;
                    }
                }
            }
        }
    }
}
