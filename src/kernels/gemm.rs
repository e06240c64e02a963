//! Integer matrix multiply with 32-bit signed accumulation.
//!
//! The packed layout reorders the quantized filter from
//! `[M, kernel * C/G]` row-major into per-group K-major blocks so the
//! inner loop over output channels reads contiguous memory.

/// Quantized filter reorganized as `[group][k][m_in_group]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackedGemmWeights {
    data: Vec<i8>,
    pub groups: usize,
    pub m_per_group: usize,
    pub k: usize,
}

impl PackedGemmWeights {
    /// `wq` is `[M, K]` row-major with the output channels of group `g`
    /// occupying rows `g * M/G .. (g + 1) * M/G`.
    pub fn pack(wq: &[i8], groups: usize, m_per_group: usize, k: usize) -> Self {
        assert_eq!(wq.len(), groups * m_per_group * k);
        let mut data = vec![0i8; wq.len()];
        for g in 0..groups {
            for m in 0..m_per_group {
                let src = (g * m_per_group + m) * k;
                for kk in 0..k {
                    data[(g * k + kk) * m_per_group + m] = wq[src + kk];
                }
            }
        }
        Self {
            data,
            groups,
            m_per_group,
            k,
        }
    }

    #[inline]
    fn block(&self, group: usize, kk: usize) -> &[i8] {
        let base = (group * self.k + kk) * self.m_per_group;
        &self.data[base..base + self.m_per_group]
    }
}

/// One output position, one group: `acc[m] = Σ_k a[k] * w[m, k]`.
///
/// `col_row` is one NHWC im2col row (`kernel_size * channels` wide, all
/// groups interleaved per kernel position); the group's K elements are
/// gathered from it.
#[inline]
pub fn dot_group_acc32(
    col_row: &[u8],
    group: usize,
    channels_per_group: usize,
    channels: usize,
    kernel_size: usize,
    packed: &PackedGemmWeights,
    acc: &mut [i32],
) {
    debug_assert_eq!(acc.len(), packed.m_per_group);
    debug_assert_eq!(packed.k, kernel_size * channels_per_group);
    acc.fill(0);
    for kp in 0..kernel_size {
        let a_base = kp * channels + group * channels_per_group;
        for c in 0..channels_per_group {
            let a = col_row[a_base + c] as i32;
            if a == 0 {
                continue;
            }
            let w = packed.block(group, kp * channels_per_group + c);
            for (m, &wv) in w.iter().enumerate() {
                acc[m] += a * wv as i32;
            }
        }
    }
}

/// Sum of the group's activation window, the per-position row offset of
/// the affine correction.
#[inline]
pub fn row_sum_group(
    col_row: &[u8],
    group: usize,
    channels_per_group: usize,
    channels: usize,
    kernel_size: usize,
) -> i32 {
    let mut sum = 0i32;
    for kp in 0..kernel_size {
        let a_base = kp * channels + group * channels_per_group;
        for c in 0..channels_per_group {
            sum += col_row[a_base + c] as i32;
        }
    }
    sum
}

/// NCHW-layout GEMM for one (batch, group) pair:
/// `acc[m, s] = Σ_k w[m, k] * col[k, s]`, i32 accumulation throughout.
pub fn gemm_nchw_acc32(
    wq_group: &[i8],
    col: &[u8],
    m_per_group: usize,
    k: usize,
    spatial: usize,
    acc: &mut [i32],
) {
    debug_assert_eq!(wq_group.len(), m_per_group * k);
    debug_assert_eq!(col.len(), k * spatial);
    debug_assert_eq!(acc.len(), m_per_group * spatial);
    acc.fill(0);
    for m in 0..m_per_group {
        let w_row = &wq_group[m * k..(m + 1) * k];
        let o_row = &mut acc[m * spatial..(m + 1) * spatial];
        for (kk, &wv) in w_row.iter().enumerate() {
            let w = wv as i32;
            if w == 0 {
                continue;
            }
            let col_row = &col[kk * spatial..(kk + 1) * spatial];
            for (o, &a) in o_row.iter_mut().zip(col_row.iter()) {
                *o += w * a as i32;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_roundtrip_layout() {
        // 2 groups, 2 channels each, K = 3.
        let wq: Vec<i8> = (0..12).map(|v| v as i8).collect();
        let p = PackedGemmWeights::pack(&wq, 2, 2, 3);
        // Group 0, k = 1 holds w[m=0,k=1] and w[m=1,k=1].
        assert_eq!(p.block(0, 1), &[1, 4]);
        // Group 1, k = 0 holds rows 2 and 3 at k = 0.
        assert_eq!(p.block(1, 0), &[6, 9]);
    }

    #[test]
    fn dot_matches_naive() {
        let channels = 4;
        let cpg = 2;
        let kernel = 3;
        let wq: Vec<i8> = (0..2 * 2 * (kernel * cpg)).map(|v| (v as i8) - 5).collect();
        let packed = PackedGemmWeights::pack(&wq, 2, 2, kernel * cpg);
        let col_row: Vec<u8> = (0..(kernel * channels) as u8).collect();

        for g in 0..2 {
            let mut acc = vec![0i32; 2];
            dot_group_acc32(&col_row, g, cpg, channels, kernel, &packed, &mut acc);
            for m in 0..2 {
                let mut want = 0i32;
                for kp in 0..kernel {
                    for c in 0..cpg {
                        let a = col_row[kp * channels + g * cpg + c] as i32;
                        let w = wq[(g * 2 + m) * (kernel * cpg) + kp * cpg + c] as i32;
                        want += a * w;
                    }
                }
                assert_eq!(acc[m], want, "group {g} channel {m}");
            }
        }
    }

    #[test]
    fn row_sum_selects_group_channels() {
        // channels = 4, 2 groups, kernel_size = 2.
        let col_row: Vec<u8> = vec![1, 2, 10, 20, 3, 4, 30, 40];
        assert_eq!(row_sum_group(&col_row, 0, 2, 4, 2), 1 + 2 + 3 + 4);
        assert_eq!(row_sum_group(&col_row, 1, 2, 4, 2), 10 + 20 + 30 + 40);
    }

    #[test]
    fn nchw_gemm_small() {
        // 2x3 weight times 3x2 columns.
        let wq: Vec<i8> = vec![1, 2, 3, -1, 0, 1];
        let col: Vec<u8> = vec![1, 2, 3, 4, 5, 6];
        let mut acc = vec![0i32; 4];
        gemm_nchw_acc32(&wq, &col, 2, 3, 2, &mut acc);
        assert_eq!(acc, vec![1 + 6 + 15, 2 + 8 + 18, -1 + 5, -2 + 6]);
    }
}
