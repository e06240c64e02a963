//! Requantization epilogue: maps int32 accumulators into the output
//! representation, with bias and the optional rectification fused into
//! the same traversal.
//!
//! Two physical variants exist per output type, one iterating
//! channel-within-position (NHWC) and one position-within-channel
//! (NCHW). They must produce identical values for the same logical
//! element; only the iteration order differs.

/// Round-to-nearest (ties away from zero), then saturate.
#[inline]
pub fn requantize_u8(acc: i32, multiplier: f32, out_zero_point: i32, qmin: i32, qmax: i32) -> u8 {
    let v = (acc as f32 * multiplier).round() as i64 + out_zero_point as i64;
    v.clamp(qmin as i64, qmax as i64) as u8
}

/// NHWC inner step: one output position, one group's span of channels.
#[allow(clippy::too_many_arguments)]
#[inline]
pub fn requantize_position_u8(
    acc: &[i32],
    bias: Option<&[i32]>,
    multiplier: f32,
    out_zero_point: i32,
    qmin: i32,
    qmax: i32,
    relu: bool,
    out: &mut [u8],
) {
    debug_assert_eq!(acc.len(), out.len());
    for (m, (&a, o)) in acc.iter().zip(out.iter_mut()).enumerate() {
        let a = a + bias.map_or(0, |b| b[m]);
        let mut q = requantize_u8(a, multiplier, out_zero_point, qmin, qmax) as i32;
        if relu && q < out_zero_point {
            q = out_zero_point;
        }
        *o = q as u8;
    }
}

/// NCHW inner step: one output channel, a span of spatial positions.
#[allow(clippy::too_many_arguments)]
#[inline]
pub fn requantize_channel_u8(
    acc: &[i32],
    bias: i32,
    multiplier: f32,
    out_zero_point: i32,
    qmin: i32,
    qmax: i32,
    relu: bool,
    out: &mut [u8],
) {
    debug_assert_eq!(acc.len(), out.len());
    for (&a, o) in acc.iter().zip(out.iter_mut()) {
        let mut q = requantize_u8(a + bias, multiplier, out_zero_point, qmin, qmax) as i32;
        if relu && q < out_zero_point {
            q = out_zero_point;
        }
        *o = q as u8;
    }
}

/// NHWC inner step, dequantized float output. `scale` is
/// `in_scale * filter_scale` for the group; the float bias mirror is
/// added after scaling so the bias is never requantized.
#[inline]
pub fn dequantize_position_f32(
    acc: &[i32],
    bias: Option<&[f32]>,
    scale: f32,
    relu: bool,
    out: &mut [f32],
) {
    debug_assert_eq!(acc.len(), out.len());
    for (m, (&a, o)) in acc.iter().zip(out.iter_mut()).enumerate() {
        let mut v = a as f32 * scale + bias.map_or(0.0, |b| b[m]);
        if relu && v < 0.0 {
            v = 0.0;
        }
        *o = v;
    }
}

/// NCHW inner step, dequantized float output.
#[inline]
pub fn dequantize_channel_f32(acc: &[i32], bias: f32, scale: f32, relu: bool, out: &mut [f32]) {
    debug_assert_eq!(acc.len(), out.len());
    for (&a, o) in acc.iter().zip(out.iter_mut()) {
        let mut v = a as f32 * scale + bias;
        if relu && v < 0.0 {
            v = 0.0;
        }
        *o = v;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounds_to_nearest() {
        // 8 * 0.125 = 1.0 exactly.
        assert_eq!(requantize_u8(8, 0.125, 0, 0, 255), 1);
        // 3 * 0.5 = 1.5 rounds away from zero.
        assert_eq!(requantize_u8(3, 0.5, 0, 0, 255), 2);
    }

    #[test]
    fn saturates_to_range() {
        assert_eq!(requantize_u8(100_000, 1.0, 0, 0, 255), 255);
        assert_eq!(requantize_u8(-100_000, 1.0, 10, 0, 255), 0);
    }

    #[test]
    fn relu_clamps_to_zero_point() {
        let acc = [-50, 50];
        let mut out = [0u8; 2];
        requantize_position_u8(&acc, None, 1.0, 10, 0, 255, true, &mut out);
        assert_eq!(out, [10, 60]);
    }

    #[test]
    fn layout_variants_agree() {
        let acc = [-7, 0, 13, 200];
        let bias = [3, -3, 0, 5];
        let mut nhwc = [0u8; 4];
        requantize_position_u8(&acc, Some(&bias), 0.3, 4, 0, 255, false, &mut nhwc);
        let mut nchw = [0u8; 4];
        for m in 0..4 {
            requantize_channel_u8(
                &acc[m..m + 1],
                bias[m],
                0.3,
                4,
                0,
                255,
                false,
                &mut nchw[m..m + 1],
            );
        }
        assert_eq!(nhwc, nchw);
    }

    #[test]
    fn float_epilogue_adds_bias_after_scaling() {
        let acc = [4];
        let bias = [0.25f32];
        let mut out = [0f32; 1];
        dequantize_position_f32(&acc, Some(&bias), 0.5, false, &mut out);
        assert_eq!(out[0], 2.25);
    }
}
