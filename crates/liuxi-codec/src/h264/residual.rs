//! CABAC 残差块解码.
//!
//! 一个残差块按 coded_block_flag → 显著性图 (significant /
//! last_significant) → 系数幅值 (截断一元前缀 + EG0 旁路后缀) →
//! 旁路符号位的顺序解码. 上下文基址由块类别 (ctxBlockCat) 与
//! 当前宏块的帧/场属性共同决定.

use super::cabac::{CabacCtx, CabacDecoder};

/// 残差块类别的上下文偏移描述
///
/// `sig_offset`/`last_offset` 按 [帧, 场] 各一个基址.
#[derive(Debug, Clone, Copy)]
pub struct BlockCat {
    /// coded_block_flag 基址 (含 Table 9-40 的类别偏移)
    pub cbf_offset: usize,
    pub sig_offset: [usize; 2],
    pub last_offset: [usize; 2],
    pub abs_offset: usize,
    /// 扫描位置数
    pub max_coeff: usize,
    /// 8x8 块使用位置→上下文映射表
    pub is_8x8: bool,
}

/// Luma DC (I_16x16), 块类别 0
pub const CAT_LUMA_DC: BlockCat = BlockCat {
    cbf_offset: 85,
    sig_offset: [105, 277],
    last_offset: [166, 338],
    abs_offset: 227,
    max_coeff: 16,
    is_8x8: false,
};

/// Luma AC (I_16x16), 块类别 1
pub const CAT_LUMA_AC: BlockCat = BlockCat {
    cbf_offset: 89,
    sig_offset: [105 + 15, 277 + 15],
    last_offset: [166 + 15, 338 + 15],
    abs_offset: 227 + 10,
    max_coeff: 15,
    is_8x8: false,
};

/// Luma 4x4 (I_4x4), 块类别 2
pub const CAT_LUMA_4X4: BlockCat = BlockCat {
    cbf_offset: 93,
    sig_offset: [105 + 29, 277 + 29],
    last_offset: [166 + 29, 338 + 29],
    abs_offset: 227 + 20,
    max_coeff: 16,
    is_8x8: false,
};

/// Chroma DC (4:2:0), 块类别 3
pub const CAT_CHROMA_DC: BlockCat = BlockCat {
    cbf_offset: 97,
    sig_offset: [105 + 44, 277 + 44],
    last_offset: [166 + 44, 338 + 44],
    abs_offset: 227 + 30,
    max_coeff: 4,
    is_8x8: false,
};

/// Chroma AC, 块类别 4
pub const CAT_CHROMA_AC: BlockCat = BlockCat {
    cbf_offset: 101,
    sig_offset: [105 + 47, 277 + 47],
    last_offset: [166 + 47, 338 + 47],
    abs_offset: 227 + 39,
    max_coeff: 15,
    is_8x8: false,
};

/// Luma 8x8, 块类别 5
///
/// 4:2:0 下 8x8 块没有独立的 coded_block_flag (由 cbp 决定),
/// cbf 基址仅在 4:4:4 时使用.
pub const CAT_LUMA_8X8: BlockCat = BlockCat {
    cbf_offset: 1012,
    sig_offset: [402, 436],
    last_offset: [417, 451],
    abs_offset: 426,
    max_coeff: 64,
    is_8x8: true,
};

/// coded_block_flag 的 ctxBlockCat → 基址表 (标准 Table 9-40)
///
/// 类别 6..=13 对应 4:4:4 的 Cb/Cr 独立残差.
pub const CBF_BASE_CTX: [usize; 14] = [
    85,
    85 + 4,
    85 + 8,
    85 + 12,
    85 + 16,
    1012,
    460,
    460 + 4,
    460 + 8,
    1012 + 4,
    472,
    472 + 4,
    472 + 8,
    1012 + 8,
];

/// 8x8 块显著性图的位置→ctxIdxInc 映射 (帧扫描, 标准 Table 9-43)
#[rustfmt::skip]
const SIG_8X8_CTX_FRAME: [u8; 63] = [
    0, 1, 2, 3, 4, 5, 5, 4, 4, 3, 3, 4, 4, 4, 5, 5,
    4, 4, 4, 4, 3, 3, 6, 7, 7, 7, 8, 9, 10, 9, 8, 7,
    7, 6, 11, 12, 13, 11, 6, 7, 8, 9, 14, 10, 9, 8, 6, 11,
    12, 13, 11, 6, 9, 14, 10, 9, 11, 12, 13, 11, 14, 10, 12,
];

/// 8x8 块显著性图的位置→ctxIdxInc 映射 (场扫描, 标准 Table 9-43)
#[rustfmt::skip]
const SIG_8X8_CTX_FIELD: [u8; 63] = [
    0, 1, 2, 3, 4, 5, 6, 3, 4, 5, 6, 3, 4, 5, 6, 3,
    4, 5, 6, 3, 4, 5, 6, 7, 7, 7, 8, 8, 8, 9, 10, 10,
    9, 11, 12, 11, 9, 9, 10, 10, 8, 11, 12, 11, 9, 9, 10, 10,
    8, 13, 13, 9, 9, 10, 10, 8, 13, 13, 9, 9, 10, 10, 14,
];

/// 8x8 块 last_significant 的位置→ctxIdxInc 映射 (标准 Table 9-43)
#[rustfmt::skip]
const LAST_8X8_CTX: [u8; 63] = [
    0, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1,
    1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1,
    2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2,
    3, 3, 3, 3, 3, 3, 3, 3, 4, 4, 4, 4, 5, 5, 5,
];

fn sig_ctx_inc(cat: &BlockCat, i: usize, field: bool) -> usize {
    if cat.is_8x8 {
        let map = if field {
            &SIG_8X8_CTX_FIELD
        } else {
            &SIG_8X8_CTX_FRAME
        };
        map[i] as usize
    } else {
        i
    }
}

fn last_ctx_inc(cat: &BlockCat, i: usize) -> usize {
    if cat.is_8x8 { LAST_8X8_CTX[i] as usize } else { i }
}

/// 解码一个残差块, 返回扫描顺序的系数数组 (长度 max_coeff)
///
/// `cbf_ctx_inc` 为 coded_block_flag 的邻居增量 (nza/nzb);
/// `decode_cbf` 为 false 时跳过 coded_block_flag (8x8 亮度在
/// 非 4:4:4 下由 cbp 决定, 块必定有数据);
/// `field_coded` 选择帧/场上下文基址.
pub fn decode_residual_block(
    cabac: &mut CabacDecoder<'_>,
    ctxs: &mut [CabacCtx],
    cat: &BlockCat,
    cbf_ctx_inc: usize,
    decode_cbf: bool,
    field_coded: bool,
) -> Vec<i32> {
    let mut coeffs = vec![0i32; cat.max_coeff];

    if decode_cbf {
        let cbf_idx = cat.cbf_offset + cbf_ctx_inc.min(3);
        if cabac.decode_decision(&mut ctxs[cbf_idx]) == 0 {
            return coeffs;
        }
    }

    let positions = decode_significance_map(cabac, ctxs, cat, field_coded);
    decode_coeff_values(cabac, ctxs, cat, &positions, &mut coeffs);

    coeffs
}

/// 解码显著性图: 返回非零系数的扫描位置, 自末位向前排列
fn decode_significance_map(
    cabac: &mut CabacDecoder<'_>,
    ctxs: &mut [CabacCtx],
    cat: &BlockCat,
    field_coded: bool,
) -> Vec<usize> {
    let parity = usize::from(field_coded);
    let sig_base = cat.sig_offset[parity];
    let last_base = cat.last_offset[parity];
    let last_pos = cat.max_coeff - 1;
    let mut positions = Vec::new();

    for i in 0..last_pos {
        let sig_idx = sig_base + sig_ctx_inc(cat, i, field_coded);
        if cabac.decode_decision(&mut ctxs[sig_idx]) == 1 {
            positions.push(i);
            let last_idx = last_base + last_ctx_inc(cat, i);
            if cabac.decode_decision(&mut ctxs[last_idx]) == 1 {
                positions.reverse();
                return positions;
            }
        }
    }

    // 扫描到最后一个位置时它隐含显著
    positions.push(last_pos);
    positions.reverse();
    positions
}

/// 自最后一个显著位置反向解码系数幅值与符号
fn decode_coeff_values(
    cabac: &mut CabacDecoder<'_>,
    ctxs: &mut [CabacCtx],
    cat: &BlockCat,
    positions: &[usize],
    coeffs: &mut [i32],
) {
    let mut num_eq1 = 0u32;
    let mut num_gt1 = 0u32;

    for &pos in positions {
        let level = decode_abs_level(cabac, ctxs, cat, num_eq1, num_gt1);
        let sign = cabac.decode_bypass();
        coeffs[pos] = if sign == 1 {
            -(level as i32)
        } else {
            level as i32
        };

        if level == 1 {
            num_eq1 += 1;
        } else {
            num_gt1 += 1;
        }
    }
}

/// 解码 coeff_abs_level_minus1 + 1
fn decode_abs_level(
    cabac: &mut CabacDecoder<'_>,
    ctxs: &mut [CabacCtx],
    cat: &BlockCat,
    num_eq1: u32,
    num_gt1: u32,
) -> u32 {
    // binIdx 0
    let ctx_inc_0 = if num_gt1 > 0 {
        0
    } else {
        (1 + num_eq1).min(4) as usize
    };
    let bin0 = cabac.decode_decision(&mut ctxs[cat.abs_offset + ctx_inc_0]);
    if bin0 == 0 {
        return 1;
    }

    // binIdx >= 1: 截断一元, 上限 14
    let ctx_inc_n = 5 + num_gt1.min(4) as usize;
    let idx_n = cat.abs_offset + ctx_inc_n;
    let mut prefix = 1u32;
    while prefix < 14 {
        if cabac.decode_decision(&mut ctxs[idx_n]) == 0 {
            return prefix + 1;
        }
        prefix += 1;
    }

    // 前缀封顶: EG0 旁路后缀
    15 + decode_eg0_bypass(cabac)
}

/// Exp-Golomb k=0 旁路解码
fn decode_eg0_bypass(cabac: &mut CabacDecoder<'_>) -> u32 {
    let mut k = 0u32;
    while cabac.decode_bypass() == 1 {
        k += 1;
        if k >= 16 {
            break;
        }
    }
    let mut val = 0u32;
    for _ in 0..k {
        val = (val << 1) | cabac.decode_bypass();
    }
    (1 << k) - 1 + val
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::h264::cabac::init_contexts_i_slice;

    #[test]
    fn test_block_cat_offsets() {
        assert_eq!(CAT_LUMA_DC.cbf_offset, CBF_BASE_CTX[0]);
        assert_eq!(CAT_LUMA_AC.cbf_offset, CBF_BASE_CTX[1]);
        assert_eq!(CAT_LUMA_4X4.cbf_offset, CBF_BASE_CTX[2]);
        assert_eq!(CAT_CHROMA_DC.cbf_offset, CBF_BASE_CTX[3]);
        assert_eq!(CAT_CHROMA_AC.cbf_offset, CBF_BASE_CTX[4]);
        assert_eq!(CAT_LUMA_8X8.cbf_offset, CBF_BASE_CTX[5]);
    }

    #[test]
    fn test_ctx_maps_cover_range() {
        for &v in &SIG_8X8_CTX_FRAME {
            assert!(v <= 14);
        }
        for &v in &SIG_8X8_CTX_FIELD {
            assert!(v <= 14);
        }
        for &v in &LAST_8X8_CTX {
            assert!(v <= 8);
        }
    }

    #[test]
    fn test_zero_cbf_yields_empty_block() {
        // 全 1 数据下 coded_block_flag 的首个判定结果是确定的;
        // 这里用一个 MPS=0 且高概率态的上下文布局验证零块路径.
        let data = [0x00u8; 8];
        let mut cabac = CabacDecoder::new(&data);
        let mut ctxs = init_contexts_i_slice(26);
        // 强制 cbf 上下文为高概率 MPS=0
        ctxs[CAT_LUMA_4X4.cbf_offset] = crate::h264::cabac::CabacCtx {
            p_state_idx: 62,
            val_mps: 0,
        };
        let coeffs = decode_residual_block(&mut cabac, &mut ctxs, &CAT_LUMA_4X4, 0, true, false);
        assert_eq!(coeffs.len(), 16);
        assert!(coeffs.iter().all(|&c| c == 0), "cbf=0 必须给出全零块");
    }

    #[test]
    fn test_residual_block_len_matches_cat() {
        let data: Vec<u8> = (0..64u32).map(|i| (i * 191 + 7) as u8).collect();
        for cat in [
            &CAT_LUMA_DC,
            &CAT_LUMA_AC,
            &CAT_LUMA_4X4,
            &CAT_CHROMA_DC,
            &CAT_CHROMA_AC,
        ] {
            let mut cabac = CabacDecoder::new(&data);
            let mut ctxs = init_contexts_i_slice(30);
            let coeffs = decode_residual_block(&mut cabac, &mut ctxs, cat, 1, true, false);
            assert_eq!(coeffs.len(), cat.max_coeff);
        }
    }

    #[test]
    fn test_8x8_block_without_cbf() {
        let data: Vec<u8> = (0..64u32).map(|i| (i * 73 + 29) as u8).collect();
        let mut cabac = CabacDecoder::new(&data);
        let mut ctxs = init_contexts_i_slice(30);
        let coeffs = decode_residual_block(&mut cabac, &mut ctxs, &CAT_LUMA_8X8, 0, false, false);
        assert_eq!(coeffs.len(), 64);
        // 不解码 cbf 时块必定进入显著性图, 至少一个非零系数
        assert!(coeffs.iter().any(|&c| c != 0));
    }
}
