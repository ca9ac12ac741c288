//! H.264 PPS (Picture Parameter Set) 解析器.
//!
//! PPS 引用一个 SPS, 并携带熵编码模式、slice group 映射、默认参考
//! 索引数、QP 初值与色度 QP 偏移, 以及可选的图像级缩放矩阵.
//! 可选尾部 (transform_8x8_mode 起) 由 `more_rbsp_data` 判定.

use liuxi_core::{BitReader, LiuxiError, LiuxiResult};

use super::scaling::{
    SCALING_DEFAULT_4X4, SCALING_DEFAULT_8X8, SL_4X4_INTER_Y, SL_4X4_INTRA_Y, SL_8X8_INTER_Y,
    SL_8X8_INTRA_Y, ScalingMatrices, apply_fallback_rules, parse_scaling_matrices,
};
use super::sps::{MAX_SPS_COUNT, Sps};

/// PPS 表容量 (pic_parameter_set_id ∈ 0..=255)
pub const MAX_PPS_COUNT: u32 = 256;

/// slice group 映射 (slice_group_map_type 0/2/3..5/6)
#[derive(Debug, Clone)]
pub enum SliceGroupMap {
    /// 只有一个 slice group, 无映射语法
    Single,
    /// type 0: 交错
    Interleaved { run_length_minus1: Vec<u32> },
    /// type 2: 前景矩形 + 剩余
    ForegroundRects {
        top_left: Vec<u32>,
        bottom_right: Vec<u32>,
    },
    /// type 3..5: 可变尺寸
    Changing {
        map_type: u32,
        slice_group_change_direction_flag: bool,
        slice_group_change_rate_minus1: u32,
    },
    /// type 6: 显式逐单元
    Explicit { slice_group_id: Vec<u32> },
}

/// PPS 解析结果
#[derive(Debug, Clone)]
pub struct Pps {
    pub pic_parameter_set_id: u32,
    pub seq_parameter_set_id: u32,
    pub entropy_coding_mode_flag: bool,
    pub bottom_field_pic_order_in_frame_present_flag: bool,
    pub num_slice_groups_minus1: u32,
    pub slice_group_map: SliceGroupMap,
    pub num_ref_idx_l0_default_active_minus1: u32,
    pub num_ref_idx_l1_default_active_minus1: u32,
    pub weighted_pred_flag: bool,
    pub weighted_bipred_idc: u32,
    pub pic_init_qp_minus26: i32,
    pub pic_init_qs_minus26: i32,
    pub chroma_qp_index_offset: i32,
    pub deblocking_filter_control_present_flag: bool,
    pub constrained_intra_pred_flag: bool,
    pub redundant_pic_cnt_present_flag: bool,
    pub transform_8x8_mode_flag: bool,
    pub pic_scaling_matrix_present_flag: bool,
    pub sm: ScalingMatrices,
    pub second_chroma_qp_index_offset: i32,
}

/// ceil(log2(v)), v >= 1
fn ilog2_ceil(v: u32) -> u32 {
    debug_assert!(v >= 1);
    32 - (v - 1).leading_zeros()
}

/// 从 RBSP 解析 PPS. 需要已解析的 SPS 表提供引用目标.
pub fn parse_pps<'s>(
    br: &mut BitReader<'_>,
    lookup_sps: impl Fn(u32) -> Option<&'s Sps>,
) -> LiuxiResult<Pps> {
    let pic_parameter_set_id = br.read_exp_golomb_u()?;
    if pic_parameter_set_id >= MAX_PPS_COUNT {
        return Err(LiuxiError::InvalidData(format!(
            "H264: pic_parameter_set_id 超出范围, value={}",
            pic_parameter_set_id
        )));
    }

    let seq_parameter_set_id = br.read_exp_golomb_u()?;
    if seq_parameter_set_id >= MAX_SPS_COUNT {
        return Err(LiuxiError::InvalidData(format!(
            "H264: seq_parameter_set_id 超出范围, value={}",
            seq_parameter_set_id
        )));
    }
    let sps = lookup_sps(seq_parameter_set_id).ok_or_else(|| {
        LiuxiError::InvalidData(format!(
            "H264: pps #{} 引用的 sps #{} 无效",
            pic_parameter_set_id, seq_parameter_set_id
        ))
    })?;

    let entropy_coding_mode_flag = br.read_bit()? == 1;
    let bottom_field_pic_order_in_frame_present_flag = br.read_bit()? == 1;

    let num_slice_groups_minus1 = br.read_exp_golomb_u()?;
    if num_slice_groups_minus1 > 7 {
        return Err(LiuxiError::InvalidData(format!(
            "H264: num_slice_groups_minus1 超出范围, value={}",
            num_slice_groups_minus1
        )));
    }

    let slice_group_map = if num_slice_groups_minus1 == 0 {
        SliceGroupMap::Single
    } else {
        let map_type = br.read_exp_golomb_u()?;
        match map_type {
            0 => {
                let mut run_length_minus1 = Vec::new();
                for _ in 0..=num_slice_groups_minus1 {
                    run_length_minus1.push(br.read_exp_golomb_u()?);
                }
                SliceGroupMap::Interleaved { run_length_minus1 }
            }
            1 => SliceGroupMap::Changing {
                map_type,
                slice_group_change_direction_flag: false,
                slice_group_change_rate_minus1: 0,
            },
            2 => {
                let mut top_left = Vec::new();
                let mut bottom_right = Vec::new();
                for _ in 0..num_slice_groups_minus1 {
                    top_left.push(br.read_exp_golomb_u()?);
                    bottom_right.push(br.read_exp_golomb_u()?);
                }
                SliceGroupMap::ForegroundRects {
                    top_left,
                    bottom_right,
                }
            }
            3..=5 => SliceGroupMap::Changing {
                map_type,
                slice_group_change_direction_flag: br.read_bit()? == 1,
                slice_group_change_rate_minus1: br.read_exp_golomb_u()?,
            },
            6 => {
                let pic_size_in_map_units_minus1 = br.read_exp_golomb_u()?;
                let id_bits = ilog2_ceil(num_slice_groups_minus1 + 1);
                let mut slice_group_id = Vec::new();
                for _ in 0..=pic_size_in_map_units_minus1 {
                    slice_group_id.push(br.read_bits(id_bits)?);
                }
                SliceGroupMap::Explicit { slice_group_id }
            }
            _ => {
                return Err(LiuxiError::InvalidData(format!(
                    "H264: slice_group_map_type 非法, value={}",
                    map_type
                )));
            }
        }
    };

    let num_ref_idx_l0_default_active_minus1 = br.read_exp_golomb_u()?;
    if num_ref_idx_l0_default_active_minus1 > 31 {
        return Err(LiuxiError::InvalidData(format!(
            "H264: num_ref_idx_l0_default_active_minus1 超出范围, value={}",
            num_ref_idx_l0_default_active_minus1
        )));
    }
    let num_ref_idx_l1_default_active_minus1 = br.read_exp_golomb_u()?;
    if num_ref_idx_l1_default_active_minus1 > 31 {
        return Err(LiuxiError::InvalidData(format!(
            "H264: num_ref_idx_l1_default_active_minus1 超出范围, value={}",
            num_ref_idx_l1_default_active_minus1
        )));
    }

    let weighted_pred_flag = br.read_bit()? == 1;
    let weighted_bipred_idc = br.read_bits(2)?;

    let pic_init_qp_minus26 = br.read_exp_golomb_s()?;
    let qp_low = -26 - 6 * sps.bit_depth_luma_minus8 as i32;
    if !(qp_low..=25).contains(&pic_init_qp_minus26) {
        return Err(LiuxiError::InvalidData(format!(
            "H264: pic_init_qp_minus26 超出范围, value={}",
            pic_init_qp_minus26
        )));
    }

    let pic_init_qs_minus26 = br.read_exp_golomb_s()?;
    if !(-26..=25).contains(&pic_init_qs_minus26) {
        return Err(LiuxiError::InvalidData(format!(
            "H264: pic_init_qs_minus26 超出范围, value={}",
            pic_init_qs_minus26
        )));
    }

    let chroma_qp_index_offset = br.read_exp_golomb_s()?;
    if !(-12..=12).contains(&chroma_qp_index_offset) {
        return Err(LiuxiError::InvalidData(format!(
            "H264: chroma_qp_index_offset 超出范围, value={}",
            chroma_qp_index_offset
        )));
    }

    let deblocking_filter_control_present_flag = br.read_bit()? == 1;
    let constrained_intra_pred_flag = br.read_bit()? == 1;
    let redundant_pic_cnt_present_flag = br.read_bit()? == 1;

    let mut transform_8x8_mode_flag = false;
    let mut pic_scaling_matrix_present_flag = false;
    let mut sm = sps.sm.clone();
    let mut second_chroma_qp_index_offset = chroma_qp_index_offset;

    if br.more_rbsp_data() {
        transform_8x8_mode_flag = br.read_bit()? == 1;

        pic_scaling_matrix_present_flag = br.read_bit()? == 1;
        if pic_scaling_matrix_present_flag {
            sm = ScalingMatrices::default();
            parse_scaling_matrices(br, &mut sm, transform_8x8_mode_flag, sps.chroma_format_idc)?;
            // 回退链起点: SPS 携带矩阵时用 SPS 的 Y 列表, 否则用标准默认表
            let fb_4x4_intra = if sps.seq_scaling_matrix_present_flag {
                sps.sm.m4x4[SL_4X4_INTRA_Y].list
            } else {
                SCALING_DEFAULT_4X4[0]
            };
            let fb_4x4_inter = if sps.seq_scaling_matrix_present_flag {
                sps.sm.m4x4[SL_4X4_INTER_Y].list
            } else {
                SCALING_DEFAULT_4X4[1]
            };
            let fb_8x8_intra = if sps.seq_scaling_matrix_present_flag {
                sps.sm.m8x8[SL_8X8_INTRA_Y].list
            } else {
                SCALING_DEFAULT_8X8[0]
            };
            let fb_8x8_inter = if sps.seq_scaling_matrix_present_flag {
                sps.sm.m8x8[SL_8X8_INTER_Y].list
            } else {
                SCALING_DEFAULT_8X8[1]
            };
            apply_fallback_rules(
                &mut sm,
                &fb_4x4_intra,
                &fb_4x4_inter,
                &fb_8x8_intra,
                &fb_8x8_inter,
                transform_8x8_mode_flag,
                sps.chroma_format_idc,
            );
        }

        second_chroma_qp_index_offset = br.read_exp_golomb_s()?;
        if !(-12..=12).contains(&second_chroma_qp_index_offset) {
            return Err(LiuxiError::InvalidData(format!(
                "H264: second_chroma_qp_index_offset 超出范围, value={}",
                second_chroma_qp_index_offset
            )));
        }
    }

    Ok(Pps {
        pic_parameter_set_id,
        seq_parameter_set_id,
        entropy_coding_mode_flag,
        bottom_field_pic_order_in_frame_present_flag,
        num_slice_groups_minus1,
        slice_group_map,
        num_ref_idx_l0_default_active_minus1,
        num_ref_idx_l1_default_active_minus1,
        weighted_pred_flag,
        weighted_bipred_idc,
        pic_init_qp_minus26,
        pic_init_qs_minus26,
        chroma_qp_index_offset,
        deblocking_filter_control_present_flag,
        constrained_intra_pred_flag,
        redundant_pic_cnt_present_flag,
        transform_8x8_mode_flag,
        pic_scaling_matrix_present_flag,
        sm,
        second_chroma_qp_index_offset,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::h264::sps::parse_sps;

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
            out.push((acc << (8 - n)) | (1 << (7 - n)));
        }
        out
    }

    fn qcif_sps() -> Sps {
        let data = [0x42, 0xC0, 0x0D, 0xF4, 0x16, 0x27, 0x20];
        let mut br = BitReader::new(&data);
        parse_sps(&mut br).unwrap()
    }

    /// CABAC, 单 slice group, qp 初值 26, 无可选尾部
    fn build_minimal_pps_bits() -> String {
        // ue(0) pps_id, ue(0) sps_id, 1 cabac, 0 bottom_field,
        // ue(0) slice_groups, ue(0) l0, ue(0) l1, 0 weighted, 00 bipred,
        // se(0) qp, se(0) qs, se(0) chroma_offset, 0 deblock, 0 constrained, 0 redundant
        String::from("1 1 1 0 1 1 1 0 00 1 1 1 0 0 0")
    }

    #[test]
    fn test_parse_minimal_pps() {
        let sps = qcif_sps();
        let data = pack_bits(&build_minimal_pps_bits());
        let mut br = BitReader::new(&data);
        let pps = parse_pps(&mut br, |id| if id == 0 { Some(&sps) } else { None }).unwrap();

        assert_eq!(pps.pic_parameter_set_id, 0);
        assert_eq!(pps.seq_parameter_set_id, 0);
        assert!(pps.entropy_coding_mode_flag);
        assert_eq!(pps.pic_init_qp_minus26, 0);
        assert!(!pps.transform_8x8_mode_flag);
        assert_eq!(
            pps.second_chroma_qp_index_offset, pps.chroma_qp_index_offset,
            "缺省时 second 偏移等于第一偏移"
        );
    }

    #[test]
    fn test_pps_refers_to_missing_sps() {
        let data = pack_bits(&build_minimal_pps_bits());
        let mut br = BitReader::new(&data);
        assert!(parse_pps(&mut br, |_| None).is_err());
    }

    #[test]
    fn test_pps_chroma_offset_range_check() {
        let sps = qcif_sps();
        // chroma_qp_index_offset = +13 → 非法
        // se(13) → code 25 → ue(25): 26=11010, k=4 → "0000 1 1010"
        let bits = "1 1 1 0 1 1 1 0 00 1 1 000011010 0 0 0";
        let data = pack_bits(bits);
        let mut br = BitReader::new(&data);
        assert!(parse_pps(&mut br, |_| Some(&sps)).is_err());
    }

    #[test]
    fn test_pps_inherits_sps_scaling_matrices() {
        let sps = qcif_sps();
        let data = pack_bits(&build_minimal_pps_bits());
        let mut br = BitReader::new(&data);
        let pps = parse_pps(&mut br, |_| Some(&sps)).unwrap();
        assert_eq!(pps.sm, sps.sm);
    }
}
