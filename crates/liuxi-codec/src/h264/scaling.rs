//! 量化缩放矩阵 (scaling matrices).
//!
//! SPS/PPS 可各自携带 6 组 4x4 与 6 组 8x8 缩放列表. 码流中未传输的
//! 列表按标准 Table 7-2 的回退规则补齐: 默认表 → 自身序列内的前驱
//! (Y → Cb → Cr, intra 与 inter 各一条链).

use liuxi_core::{BitReader, LiuxiResult};

pub const SL_4X4_INTRA_Y: usize = 0;
pub const SL_4X4_INTRA_CB: usize = 1;
pub const SL_4X4_INTRA_CR: usize = 2;
pub const SL_4X4_INTER_Y: usize = 3;
pub const SL_4X4_INTER_CB: usize = 4;
pub const SL_4X4_INTER_CR: usize = 5;
pub const SL_4X4_NUM: usize = 6;

pub const SL_8X8_INTRA_Y: usize = 0;
pub const SL_8X8_INTER_Y: usize = 1;
pub const SL_8X8_INTRA_CB: usize = 2;
pub const SL_8X8_INTER_CB: usize = 3;
pub const SL_8X8_INTRA_CR: usize = 4;
pub const SL_8X8_INTER_CR: usize = 5;
pub const SL_8X8_NUM: usize = 6;

/// 标准 Table 7-3 默认 4x4 列表 [intra, inter]
pub const SCALING_DEFAULT_4X4: [[u8; 16]; 2] = [
    [
        6, 13, 20, 28, 13, 20, 28, 32, 20, 28, 32, 37, 28, 32, 37, 42,
    ],
    [
        10, 14, 20, 24, 14, 20, 24, 27, 20, 24, 27, 30, 24, 27, 30, 34,
    ],
];

/// 标准 Table 7-4 默认 8x8 列表 [intra, inter]
pub const SCALING_DEFAULT_8X8: [[u8; 64]; 2] = [
    [
        6, 10, 13, 16, 18, 23, 25, 27, 10, 11, 16, 18, 23, 25, 27, 29, 13, 16, 18, 23, 25, 27, 29,
        31, 16, 18, 23, 25, 27, 29, 31, 33, 18, 23, 25, 27, 29, 31, 33, 36, 23, 25, 27, 29, 31, 33,
        36, 38, 25, 27, 29, 31, 33, 36, 38, 40, 27, 29, 31, 33, 36, 38, 40, 42,
    ],
    [
        9, 13, 15, 17, 19, 21, 22, 24, 13, 13, 17, 19, 21, 22, 24, 25, 15, 17, 19, 21, 22, 24, 25,
        27, 17, 19, 21, 22, 24, 25, 27, 28, 19, 21, 22, 24, 25, 27, 28, 30, 21, 22, 24, 25, 27, 28,
        30, 32, 22, 24, 25, 27, 28, 30, 32, 33, 24, 25, 27, 28, 30, 32, 33, 35,
    ],
];

/// 4x4 zig-zag 帧扫描 (标准 Table 8-13)
pub const FRAME_SCAN_4X4: [u8; 16] = [0, 1, 4, 8, 5, 2, 3, 6, 9, 12, 13, 10, 7, 11, 14, 15];

/// 4x4 场扫描 (标准 Table 8-13)
pub const FIELD_SCAN_4X4: [u8; 16] = [0, 4, 1, 8, 12, 5, 9, 13, 2, 6, 10, 14, 3, 7, 11, 15];

/// 8x8 zig-zag 帧扫描 (标准 Table 8-14)
pub const FRAME_SCAN_8X8: [u8; 64] = [
    0, 1, 8, 16, 9, 2, 3, 10, 17, 24, 32, 25, 18, 11, 4, 5, 12, 19, 26, 33, 40, 48, 41, 34, 27,
    20, 13, 6, 7, 14, 21, 28, 35, 42, 49, 56, 57, 50, 43, 36, 29, 22, 15, 23, 30, 37, 44, 51, 58,
    59, 52, 45, 38, 31, 39, 46, 53, 60, 61, 54, 47, 55, 62, 63,
];

/// 8x8 场扫描 (标准 Table 8-14)
pub const FIELD_SCAN_8X8: [u8; 64] = [
    0, 8, 16, 1, 9, 24, 32, 17, 2, 25, 40, 48, 56, 33, 10, 3, 18, 41, 49, 57, 26, 11, 4, 19, 34,
    42, 50, 58, 27, 12, 5, 20, 35, 43, 51, 59, 28, 13, 6, 21, 36, 44, 52, 60, 29, 14, 22, 37, 45,
    53, 61, 30, 7, 15, 38, 46, 54, 62, 31, 23, 39, 47, 55, 63,
];

/// 一组 4x4 缩放列表
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScalingList4x4 {
    pub present: bool,
    pub list: [u8; 16],
}

impl Default for ScalingList4x4 {
    fn default() -> Self {
        Self {
            present: false,
            list: [16u8; 16],
        }
    }
}

/// 一组 8x8 缩放列表
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScalingList8x8 {
    pub present: bool,
    pub list: [u8; 64],
}

impl Default for ScalingList8x8 {
    fn default() -> Self {
        Self {
            present: false,
            list: [16u8; 64],
        }
    }
}

/// SPS/PPS 携带的完整缩放矩阵集合
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScalingMatrices {
    pub m4x4: [ScalingList4x4; SL_4X4_NUM],
    pub m8x8: [ScalingList8x8; SL_8X8_NUM],
}

impl ScalingMatrices {
    /// 重置为平坦矩阵 (全 16), 未携带缩放矩阵的参数集使用
    pub fn set_flat(&mut self) {
        *self = Self::default();
    }
}

/// 读取一条缩放列表的 delta 链
///
/// 第一个 delta 使 next 归零表示 "使用默认列表".
fn parse_scaling_list<const N: usize>(
    br: &mut BitReader<'_>,
    coeffs: &mut [u8; N],
    fallback: &[u8; N],
) -> LiuxiResult<()> {
    let scan: &[u8] = if N == 16 {
        &FRAME_SCAN_4X4
    } else {
        &FRAME_SCAN_8X8
    };

    let mut last = 8u8;
    let mut next = 8u8;
    for i in 0..N {
        if next != 0 {
            let delta = br.read_exp_golomb_s()?;
            next = (i32::from(last) + delta) as u8;
        }
        if i == 0 && next == 0 {
            // 列表未传输, 使用默认缩放列表
            coeffs.copy_from_slice(fallback);
            return Ok(());
        }
        last = if next != 0 { next } else { last };
        coeffs[scan[i] as usize] = last;
    }
    Ok(())
}

/// 读取 4x4 缩放列表序列 (6 组)
fn parse_matrices_4x4(br: &mut BitReader<'_>, sm: &mut ScalingMatrices) -> LiuxiResult<()> {
    for idx in 0..SL_4X4_NUM {
        let sl = &mut sm.m4x4[idx];
        sl.present = br.read_bit()? == 1;
        if sl.present {
            parse_scaling_list(br, &mut sl.list, &SCALING_DEFAULT_4X4[idx / 3])?;
        }
    }
    Ok(())
}

/// 读取 8x8 缩放列表序列 (4:4:4 时包括 Cb/Cr)
fn parse_matrices_8x8(
    br: &mut BitReader<'_>,
    sm: &mut ScalingMatrices,
    chroma_format_idc: u32,
) -> LiuxiResult<()> {
    let indices: &[usize] = if chroma_format_idc == 3 {
        &[
            SL_8X8_INTRA_Y,
            SL_8X8_INTER_Y,
            SL_8X8_INTRA_CB,
            SL_8X8_INTER_CB,
            SL_8X8_INTRA_CR,
            SL_8X8_INTER_CR,
        ]
    } else {
        &[SL_8X8_INTRA_Y, SL_8X8_INTER_Y]
    };
    for &idx in indices {
        let sl = &mut sm.m8x8[idx];
        sl.present = br.read_bit()? == 1;
        if sl.present {
            parse_scaling_list(br, &mut sl.list, &SCALING_DEFAULT_8X8[idx % 2])?;
        }
    }
    Ok(())
}

/// 读取完整缩放矩阵集合
pub fn parse_scaling_matrices(
    br: &mut BitReader<'_>,
    sm: &mut ScalingMatrices,
    parse_8x8: bool,
    chroma_format_idc: u32,
) -> LiuxiResult<()> {
    parse_matrices_4x4(br, sm)?;
    if parse_8x8 {
        parse_matrices_8x8(br, sm, chroma_format_idc)?;
    }
    Ok(())
}

/// 对未传输的列表应用 Table 7-2 回退规则
///
/// `fallback_*` 为链条起点: SPS 用标准默认表, PPS 在对应 SPS 也携带
/// 矩阵时用 SPS 的 Y 列表.
pub fn apply_fallback_rules(
    sm: &mut ScalingMatrices,
    fallback_4x4_intra: &[u8; 16],
    fallback_4x4_inter: &[u8; 16],
    fallback_8x8_intra: &[u8; 64],
    fallback_8x8_inter: &[u8; 64],
    parse_8x8: bool,
    chroma_format_idc: u32,
) {
    if !sm.m4x4[SL_4X4_INTRA_Y].present {
        sm.m4x4[SL_4X4_INTRA_Y].list = *fallback_4x4_intra;
    }
    if !sm.m4x4[SL_4X4_INTRA_CB].present {
        sm.m4x4[SL_4X4_INTRA_CB].list = sm.m4x4[SL_4X4_INTRA_Y].list;
    }
    if !sm.m4x4[SL_4X4_INTRA_CR].present {
        sm.m4x4[SL_4X4_INTRA_CR].list = sm.m4x4[SL_4X4_INTRA_CB].list;
    }
    if !sm.m4x4[SL_4X4_INTER_Y].present {
        sm.m4x4[SL_4X4_INTER_Y].list = *fallback_4x4_inter;
    }
    if !sm.m4x4[SL_4X4_INTER_CB].present {
        sm.m4x4[SL_4X4_INTER_CB].list = sm.m4x4[SL_4X4_INTER_Y].list;
    }
    if !sm.m4x4[SL_4X4_INTER_CR].present {
        sm.m4x4[SL_4X4_INTER_CR].list = sm.m4x4[SL_4X4_INTER_CB].list;
    }

    if !parse_8x8 {
        return;
    }

    if !sm.m8x8[SL_8X8_INTRA_Y].present {
        sm.m8x8[SL_8X8_INTRA_Y].list = *fallback_8x8_intra;
    }
    if !sm.m8x8[SL_8X8_INTER_Y].present {
        sm.m8x8[SL_8X8_INTER_Y].list = *fallback_8x8_inter;
    }
    if chroma_format_idc == 3 {
        if !sm.m8x8[SL_8X8_INTRA_CB].present {
            sm.m8x8[SL_8X8_INTRA_CB].list = sm.m8x8[SL_8X8_INTRA_Y].list;
        }
        if !sm.m8x8[SL_8X8_INTER_CB].present {
            sm.m8x8[SL_8X8_INTER_CB].list = sm.m8x8[SL_8X8_INTER_Y].list;
        }
        if !sm.m8x8[SL_8X8_INTRA_CR].present {
            sm.m8x8[SL_8X8_INTRA_CR].list = sm.m8x8[SL_8X8_INTRA_CB].list;
        }
        if !sm.m8x8[SL_8X8_INTER_CR].present {
            sm.m8x8[SL_8X8_INTER_CR].list = sm.m8x8[SL_8X8_INTER_CB].list;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 把比特串 (字符形式) 打包为字节
    fn pack_bits(bits: &str) -> Vec<u8> {
        let mut out = Vec::new();
        let mut acc = 0u8;
        let mut n = 0;
        for c in bits.chars().filter(|c| *c == '0' || *c == '1') {
            acc = (acc << 1) | u8::from(c == '1');
            n += 1;
            if n == 8 {
                out.push(acc);
                acc = 0;
                n = 0;
            }
        }
        if n > 0 {
            out.push(acc << (8 - n));
        }
        out
    }

    #[test]
    fn test_absent_lists_fall_back_to_defaults() {
        // 12 个 present_flag 全 0
        let data = pack_bits("000000 000000");
        let mut br = BitReader::new(&data);
        let mut sm = ScalingMatrices::default();
        parse_scaling_matrices(&mut br, &mut sm, true, 1).unwrap();
        apply_fallback_rules(
            &mut sm,
            &SCALING_DEFAULT_4X4[0],
            &SCALING_DEFAULT_4X4[1],
            &SCALING_DEFAULT_8X8[0],
            &SCALING_DEFAULT_8X8[1],
            true,
            1,
        );

        assert_eq!(sm.m4x4[SL_4X4_INTRA_Y].list, SCALING_DEFAULT_4X4[0]);
        assert_eq!(sm.m4x4[SL_4X4_INTRA_CB].list, SCALING_DEFAULT_4X4[0]);
        assert_eq!(sm.m4x4[SL_4X4_INTER_CR].list, SCALING_DEFAULT_4X4[1]);
        assert_eq!(sm.m8x8[SL_8X8_INTRA_Y].list, SCALING_DEFAULT_8X8[0]);
        assert_eq!(sm.m8x8[SL_8X8_INTER_Y].list, SCALING_DEFAULT_8X8[1]);
    }

    #[test]
    fn test_use_default_signal() {
        // 第一组 present=1 且 delta_scale=-8 (next=0) → 使用默认表,
        // 其余 present=0
        let data = pack_bits("1 000010001 00000 000000");
        let mut br = BitReader::new(&data);
        let mut sm = ScalingMatrices::default();
        parse_scaling_matrices(&mut br, &mut sm, true, 1).unwrap();
        assert!(sm.m4x4[SL_4X4_INTRA_Y].present);
        assert_eq!(sm.m4x4[SL_4X4_INTRA_Y].list, SCALING_DEFAULT_4X4[0]);
    }

    #[test]
    fn test_explicit_flat_list() {
        // present=1, delta_scale=+8 (next=16), 之后全部 delta=0
        let mut bits = String::from("1 000010000");
        for _ in 0..15 {
            bits.push('1'); // se(v)=0
        }
        bits.push_str("00000 000000");
        let data = pack_bits(&bits);
        let mut br = BitReader::new(&data);
        let mut sm = ScalingMatrices::default();
        parse_scaling_matrices(&mut br, &mut sm, true, 1).unwrap();
        assert_eq!(sm.m4x4[SL_4X4_INTRA_Y].list, [16u8; 16]);
    }

    #[test]
    fn test_scan_tables_are_permutations() {
        for scan in [&FRAME_SCAN_4X4[..], &FIELD_SCAN_4X4[..]] {
            let mut seen = [false; 16];
            for &v in scan {
                seen[v as usize] = true;
            }
            assert!(seen.iter().all(|&s| s));
        }
        for scan in [&FRAME_SCAN_8X8[..], &FIELD_SCAN_8X8[..]] {
            let mut seen = [false; 64];
            for &v in scan {
                seen[v as usize] = true;
            }
            assert!(seen.iter().all(|&s| s));
        }
    }
}
