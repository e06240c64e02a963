//! Column transforms turning a spatial input into a matrix so the
//! convolution reduces to a matrix multiply.
//!
//! The pad value is the input zero point, not 0: a padded position must
//! contribute `q - zero_point == 0` once the affine correction runs.

/// NCHW im2col for one (batch, group) pair.
///
/// Input is `[N, C, H, W]`; the column matrix is
/// `[channels * kernel_h * kernel_w, out_h * out_w]` row-major.
#[allow(clippy::too_many_arguments)]
pub fn im2col_nchw<T: Copy>(
    input: &[T],
    batch_idx: usize,
    ch_start: usize,
    channels: usize,
    in_h: usize,
    in_w: usize,
    total_channels: usize,
    kernel_h: usize,
    kernel_w: usize,
    stride_h: usize,
    stride_w: usize,
    pad_top: usize,
    pad_left: usize,
    dilation_h: usize,
    dilation_w: usize,
    out_h: usize,
    out_w: usize,
    pad_value: T,
    col: &mut [T],
) {
    let spatial_cols = out_h * out_w;
    let batch_offset = batch_idx * total_channels * in_h * in_w;

    for c in 0..channels {
        let ch_offset = batch_offset + (ch_start + c) * in_h * in_w;
        for kh in 0..kernel_h {
            for kw in 0..kernel_w {
                let col_row = (c * kernel_h + kh) * kernel_w + kw;
                let col_row_offset = col_row * spatial_cols;
                for oh in 0..out_h {
                    let ih = (oh * stride_h + kh * dilation_h) as isize - pad_top as isize;
                    let col_oh_offset = col_row_offset + oh * out_w;
                    if ih < 0 || ih >= in_h as isize {
                        for ow in 0..out_w {
                            col[col_oh_offset + ow] = pad_value;
                        }
                    } else {
                        let row_offset = ch_offset + ih as usize * in_w;
                        for ow in 0..out_w {
                            let iw = (ow * stride_w + kw * dilation_w) as isize
                                - pad_left as isize;
                            col[col_oh_offset + ow] = if iw >= 0 && iw < in_w as isize {
                                input[row_offset + iw as usize]
                            } else {
                                pad_value
                            };
                        }
                    }
                }
            }
        }
    }
}

/// NHWC im2col for one batch image, all groups at once.
///
/// Input is `[N, H, W, C]`; the column matrix is
/// `[out_h * out_w, kernel_h * kernel_w * C]` row-major, so the channels
/// of group `g` sit at offset `g * (C / groups)` inside every kernel
/// position block.
#[allow(clippy::too_many_arguments)]
pub fn im2col_nhwc<T: Copy>(
    input: &[T],
    batch_idx: usize,
    in_h: usize,
    in_w: usize,
    channels: usize,
    kernel_h: usize,
    kernel_w: usize,
    stride_h: usize,
    stride_w: usize,
    pad_top: usize,
    pad_left: usize,
    dilation_h: usize,
    dilation_w: usize,
    out_h: usize,
    out_w: usize,
    pad_value: T,
    col: &mut [T],
) {
    let batch_offset = batch_idx * in_h * in_w * channels;
    let row_len = kernel_h * kernel_w * channels;

    for oh in 0..out_h {
        for ow in 0..out_w {
            let col_base = (oh * out_w + ow) * row_len;
            for kh in 0..kernel_h {
                let ih = (oh * stride_h + kh * dilation_h) as isize - pad_top as isize;
                for kw in 0..kernel_w {
                    let iw =
                        (ow * stride_w + kw * dilation_w) as isize - pad_left as isize;
                    let dst = col_base + (kh * kernel_w + kw) * channels;
                    if ih >= 0 && ih < in_h as isize && iw >= 0 && iw < in_w as isize {
                        let src =
                            batch_offset + (ih as usize * in_w + iw as usize) * channels;
                        col[dst..dst + channels]
                            .copy_from_slice(&input[src..src + channels]);
                    } else {
                        for c in 0..channels {
                            col[dst + c] = pad_value;
                        }
                    }
                }
            }
        }
    }
}
