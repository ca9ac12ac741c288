//! H.264 slice header 解析器.
//!
//! slice header 解析需要已激活的 PPS→SPS 链: frame_num 位宽、POC 字段
//! 是否存在、QP 范围等都由参数集决定. 解析成功后把剩余 RBSP 的
//! (字节, 位) 偏移记录为 slice 数据句柄, 交给熵解码器.

use liuxi_core::{BitReader, LiuxiError, LiuxiResult};

use super::nal::NalUnitType;
use super::pps::{MAX_PPS_COUNT, Pps, SliceGroupMap};
use super::sps::{PocType, Sps};

/// slice 类型 (slice_type % 5)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceType {
    P,
    B,
    I,
    Sp,
    Si,
}

impl SliceType {
    /// 从码流原始值 (0..=9) 还原, 对 5 取模
    pub fn from_raw(v: u32) -> Self {
        match v % 5 {
            0 => Self::P,
            1 => Self::B,
            2 => Self::I,
            3 => Self::Sp,
            _ => Self::Si,
        }
    }

    /// 是否为 I 或 SI
    pub fn is_intra(&self) -> bool {
        matches!(self, Self::I | Self::Si)
    }
}

impl std::fmt::Display for SliceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::P => "P",
            Self::B => "B",
            Self::I => "I",
            Self::Sp => "SP",
            Self::Si => "SI",
        };
        write!(f, "{s}")
    }
}

/// 参考图像列表修改项
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefPicListMod {
    ShortTermSub { abs_diff_pic_num_minus1: u32 },
    ShortTermAdd { abs_diff_pic_num_minus1: u32 },
    LongTerm { long_term_pic_num: u32 },
}

/// 单参考列表的加权预测参数
#[derive(Debug, Clone, Copy)]
pub struct PredWeight {
    pub luma_weight: i32,
    pub luma_offset: i32,
    pub chroma_weight: [i32; 2],
    pub chroma_offset: [i32; 2],
}

/// 加权预测表
#[derive(Debug, Clone, Default)]
pub struct PredWeightTable {
    pub luma_log2_weight_denom: u32,
    pub chroma_log2_weight_denom: u32,
    pub l0: Vec<PredWeight>,
    pub l1: Vec<PredWeight>,
}

/// 存储管理控制操作 (MMCO)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmcoOp {
    ForgetShort {
        difference_of_pic_nums_minus1: u32,
    },
    ForgetLong {
        long_term_pic_num: u32,
    },
    ConvertShortToLong {
        difference_of_pic_nums_minus1: u32,
        long_term_frame_idx: u32,
    },
    TrimLong {
        max_long_term_frame_idx_plus1: u32,
    },
    ClearAll,
    MarkCurrentLong {
        long_term_frame_idx: u32,
    },
}

/// 解码参考图像标记
#[derive(Debug, Clone, Default)]
pub enum DecRefPicMarking {
    /// 非参考 slice, 无标记语法
    #[default]
    None,
    /// IDR slice 的两个标志
    Idr {
        no_output_of_prior_pics_flag: bool,
        long_term_reference_flag: bool,
    },
    /// 非 IDR 的滑动窗口模式
    SlidingWindow,
    /// 非 IDR 的自适应模式
    Adaptive { ops: Vec<MmcoOp> },
}

/// colour_plane_id 不存在时的占位值
pub const COLOUR_PLANE_ID_INVALID: u32 = 3;

/// slice header 解析结果
#[derive(Debug, Clone)]
pub struct SliceHeader {
    pub nal_ref_idc: u8,
    pub nal_unit_type: NalUnitType,
    pub first_mb_in_slice: u32,
    /// 码流原始 slice_type (0..=9)
    pub slice_type_raw: u32,
    pub slice_type: SliceType,
    pub pic_parameter_set_id: u32,
    pub colour_plane_id: u32,
    pub frame_num: u32,
    pub field_pic_flag: bool,
    pub bottom_field_flag: bool,
    pub idr_pic_id: u32,
    pub pic_order_cnt_lsb: u32,
    pub delta_pic_order_cnt_bottom: i32,
    pub delta_pic_order_cnt: [i32; 2],
    pub redundant_pic_cnt: u32,
    pub direct_spatial_mv_pred_flag: bool,
    pub num_ref_idx_l0_active_minus1: u32,
    pub num_ref_idx_l1_active_minus1: u32,
    pub rplm_l0: Vec<RefPicListMod>,
    pub rplm_l1: Vec<RefPicListMod>,
    pub pwt: Option<PredWeightTable>,
    pub dec_ref_pic_marking: DecRefPicMarking,
    pub cabac_init_idc: u32,
    pub slice_qp_delta: i32,
    pub sp_for_switch_flag: bool,
    pub slice_qs_delta: i32,
    pub disable_deblocking_filter_idc: u32,
    pub slice_alpha_c0_offset_div2: i32,
    pub slice_beta_offset_div2: i32,
    pub slice_group_change_cycle: u32,
}

/// slice header 之后的熵编码数据句柄
///
/// 持有整个 slice RBSP 以及 slice 数据的起始偏移.
/// CABAC 模式下起始位置已对齐到字节边界 (cabac_alignment_one_bit
/// 在 header 解析时消费).
#[derive(Debug, Clone, Default)]
pub struct SliceData {
    pub rbsp: Vec<u8>,
    pub byte_offset: usize,
    pub bit_offset: u8,
}

impl SliceData {
    /// slice 数据字节窗口
    pub fn bytes(&self) -> &[u8] {
        &self.rbsp[self.byte_offset.min(self.rbsp.len())..]
    }
}

/// 解析参考图像列表修改语法 (单列表)
fn parse_ref_pic_list_modification(br: &mut BitReader<'_>) -> LiuxiResult<Vec<RefPicListMod>> {
    let mut mods = Vec::new();
    if br.read_bit()? != 1 {
        return Ok(mods);
    }

    loop {
        let idc = br.read_exp_golomb_u()?;
        match idc {
            0 => mods.push(RefPicListMod::ShortTermSub {
                abs_diff_pic_num_minus1: br.read_exp_golomb_u()?,
            }),
            1 => mods.push(RefPicListMod::ShortTermAdd {
                abs_diff_pic_num_minus1: br.read_exp_golomb_u()?,
            }),
            2 => mods.push(RefPicListMod::LongTerm {
                long_term_pic_num: br.read_exp_golomb_u()?,
            }),
            3 => break,
            _ => {
                return Err(LiuxiError::InvalidData(format!(
                    "H264: modification_of_pic_nums_idc 非法, value={}",
                    idc
                )));
            }
        }
        if mods.len() > 64 {
            return Err(LiuxiError::InvalidData(
                "H264: ref_pic_list_modification 项数过多".into(),
            ));
        }
    }
    Ok(mods)
}

/// 解析单列表的加权预测参数
fn parse_pred_weight_lx(
    br: &mut BitReader<'_>,
    count: u32,
    luma_log2_weight_denom: u32,
    chroma_log2_weight_denom: u32,
    chroma_present: bool,
) -> LiuxiResult<Vec<PredWeight>> {
    let mut weights = Vec::new();
    for _ in 0..count {
        let mut w = PredWeight {
            luma_weight: 1 << luma_log2_weight_denom,
            luma_offset: 0,
            chroma_weight: [1 << chroma_log2_weight_denom; 2],
            chroma_offset: [0, 0],
        };
        if br.read_bit()? == 1 {
            w.luma_weight = br.read_exp_golomb_s()?;
            w.luma_offset = br.read_exp_golomb_s()?;
        }
        if chroma_present && br.read_bit()? == 1 {
            for c in 0..2 {
                w.chroma_weight[c] = br.read_exp_golomb_s()?;
                w.chroma_offset[c] = br.read_exp_golomb_s()?;
            }
        }
        weights.push(w);
    }
    Ok(weights)
}

/// 解析加权预测表
fn parse_pred_weight_table(
    br: &mut BitReader<'_>,
    sps: &Sps,
    slice_type: SliceType,
    num_ref_idx_l0: u32,
    num_ref_idx_l1: u32,
) -> LiuxiResult<PredWeightTable> {
    let chroma_present = sps.chroma_format_idc != 0 && !sps.separate_colour_plane_flag;

    let luma_log2_weight_denom = br.read_exp_golomb_u()?;
    if luma_log2_weight_denom > 7 {
        return Err(LiuxiError::InvalidData(format!(
            "H264: luma_log2_weight_denom 超出范围, value={}",
            luma_log2_weight_denom
        )));
    }
    let mut chroma_log2_weight_denom = 0;
    if chroma_present {
        chroma_log2_weight_denom = br.read_exp_golomb_u()?;
        if chroma_log2_weight_denom > 7 {
            return Err(LiuxiError::InvalidData(format!(
                "H264: chroma_log2_weight_denom 超出范围, value={}",
                chroma_log2_weight_denom
            )));
        }
    }

    let l0 = parse_pred_weight_lx(
        br,
        num_ref_idx_l0,
        luma_log2_weight_denom,
        chroma_log2_weight_denom,
        chroma_present,
    )?;
    let l1 = if slice_type == SliceType::B {
        parse_pred_weight_lx(
            br,
            num_ref_idx_l1,
            luma_log2_weight_denom,
            chroma_log2_weight_denom,
            chroma_present,
        )?
    } else {
        Vec::new()
    };

    Ok(PredWeightTable {
        luma_log2_weight_denom,
        chroma_log2_weight_denom,
        l0,
        l1,
    })
}

/// 解析 dec_ref_pic_marking
fn parse_dec_ref_pic_marking(
    br: &mut BitReader<'_>,
    nal_ref_idc: u8,
    is_idr: bool,
) -> LiuxiResult<DecRefPicMarking> {
    if nal_ref_idc == 0 {
        return Ok(DecRefPicMarking::None);
    }

    if is_idr {
        return Ok(DecRefPicMarking::Idr {
            no_output_of_prior_pics_flag: br.read_bit()? == 1,
            long_term_reference_flag: br.read_bit()? == 1,
        });
    }

    if br.read_bit()? != 1 {
        return Ok(DecRefPicMarking::SlidingWindow);
    }

    let mut ops = Vec::new();
    loop {
        let op = br.read_exp_golomb_u()?;
        match op {
            0 => break,
            1 => ops.push(MmcoOp::ForgetShort {
                difference_of_pic_nums_minus1: br.read_exp_golomb_u()?,
            }),
            2 => ops.push(MmcoOp::ForgetLong {
                long_term_pic_num: br.read_exp_golomb_u()?,
            }),
            3 => ops.push(MmcoOp::ConvertShortToLong {
                difference_of_pic_nums_minus1: br.read_exp_golomb_u()?,
                long_term_frame_idx: br.read_exp_golomb_u()?,
            }),
            4 => ops.push(MmcoOp::TrimLong {
                max_long_term_frame_idx_plus1: br.read_exp_golomb_u()?,
            }),
            5 => ops.push(MmcoOp::ClearAll),
            6 => ops.push(MmcoOp::MarkCurrentLong {
                long_term_frame_idx: br.read_exp_golomb_u()?,
            }),
            _ => {
                return Err(LiuxiError::InvalidData(format!(
                    "H264: memory_management_control_operation 非法, value={}",
                    op
                )));
            }
        }
        if ops.len() > 64 {
            return Err(LiuxiError::InvalidData("H264: MMCO 操作数量过多".into()));
        }
    }
    Ok(DecRefPicMarking::Adaptive { ops })
}

/// 解析 slice header (标准 7.3.3)
///
/// `lookup_pps`/`lookup_sps` 提供有效参数集; 引用链断裂即报错.
pub fn parse_slice_header<'t>(
    br: &mut BitReader<'_>,
    nal_ref_idc: u8,
    nal_unit_type: NalUnitType,
    lookup_pps: impl Fn(u32) -> Option<&'t Pps>,
    lookup_sps: impl Fn(u32) -> Option<&'t Sps>,
) -> LiuxiResult<SliceHeader> {
    let is_idr = nal_unit_type == NalUnitType::SliceIdr;

    let first_mb_in_slice = br.read_exp_golomb_u()?;

    let slice_type_raw = br.read_exp_golomb_u()?;
    if slice_type_raw > 9 {
        return Err(LiuxiError::InvalidData(format!(
            "H264: slice_type 非法, value={}",
            slice_type_raw
        )));
    }
    let slice_type = SliceType::from_raw(slice_type_raw);

    let pic_parameter_set_id = br.read_exp_golomb_u()?;
    if pic_parameter_set_id >= MAX_PPS_COUNT {
        return Err(LiuxiError::InvalidData(format!(
            "H264: pic_parameter_set_id 超出范围, value={}",
            pic_parameter_set_id
        )));
    }
    let pps = lookup_pps(pic_parameter_set_id).ok_or_else(|| {
        LiuxiError::InvalidData(format!(
            "H264: slice header 引用的 pps #{} 无效",
            pic_parameter_set_id
        ))
    })?;
    let sps = lookup_sps(pps.seq_parameter_set_id).ok_or_else(|| {
        LiuxiError::InvalidData(format!(
            "H264: pps #{} 引用的 sps #{} 无效",
            pic_parameter_set_id, pps.seq_parameter_set_id
        ))
    })?;

    let colour_plane_id = if sps.separate_colour_plane_flag {
        br.read_bits(2)?
    } else {
        COLOUR_PLANE_ID_INVALID
    };

    let frame_num = br.read_bits(sps.frame_num_bits())?;

    let mut field_pic_flag = false;
    let mut bottom_field_flag = false;
    if !sps.frame_mbs_only_flag {
        field_pic_flag = br.read_bit()? == 1;
        if field_pic_flag {
            bottom_field_flag = br.read_bit()? == 1;
        }
    }

    let idr_pic_id = if is_idr { br.read_exp_golomb_u()? } else { 0 };

    let mut pic_order_cnt_lsb = 0;
    let mut delta_pic_order_cnt_bottom = 0;
    let mut delta_pic_order_cnt = [0i32; 2];
    match &sps.poc {
        PocType::Type0 {
            log2_max_pic_order_cnt_lsb_minus4,
        } => {
            pic_order_cnt_lsb = br.read_bits(log2_max_pic_order_cnt_lsb_minus4 + 4)?;
            if pps.bottom_field_pic_order_in_frame_present_flag && !field_pic_flag {
                delta_pic_order_cnt_bottom = br.read_exp_golomb_s()?;
            }
        }
        PocType::Type1 {
            delta_pic_order_always_zero_flag,
            ..
        } => {
            if !delta_pic_order_always_zero_flag {
                delta_pic_order_cnt[0] = br.read_exp_golomb_s()?;
                if pps.bottom_field_pic_order_in_frame_present_flag && !field_pic_flag {
                    delta_pic_order_cnt[1] = br.read_exp_golomb_s()?;
                }
            }
        }
        PocType::Type2 => {}
    }

    let redundant_pic_cnt = if pps.redundant_pic_cnt_present_flag {
        br.read_exp_golomb_u()?
    } else {
        0
    };

    let mut direct_spatial_mv_pred_flag = false;
    if slice_type == SliceType::B {
        direct_spatial_mv_pred_flag = br.read_bit()? == 1;
    }

    let mut num_ref_idx_l0_active_minus1 = pps.num_ref_idx_l0_default_active_minus1;
    let mut num_ref_idx_l1_active_minus1 = pps.num_ref_idx_l1_default_active_minus1;
    if matches!(slice_type, SliceType::P | SliceType::Sp | SliceType::B) {
        if br.read_bit()? == 1 {
            num_ref_idx_l0_active_minus1 = br.read_exp_golomb_u()?;
            if num_ref_idx_l0_active_minus1 > 31 {
                return Err(LiuxiError::InvalidData(format!(
                    "H264: num_ref_idx_l0_active_minus1 超出范围, value={}",
                    num_ref_idx_l0_active_minus1
                )));
            }
            if slice_type == SliceType::B {
                num_ref_idx_l1_active_minus1 = br.read_exp_golomb_u()?;
                if num_ref_idx_l1_active_minus1 > 31 {
                    return Err(LiuxiError::InvalidData(format!(
                        "H264: num_ref_idx_l1_active_minus1 超出范围, value={}",
                        num_ref_idx_l1_active_minus1
                    )));
                }
            }
        }
    }

    let mut rplm_l0 = Vec::new();
    let mut rplm_l1 = Vec::new();
    if !slice_type.is_intra() {
        rplm_l0 = parse_ref_pic_list_modification(br)?;
    }
    if slice_type == SliceType::B {
        rplm_l1 = parse_ref_pic_list_modification(br)?;
    }

    let want_pwt = (pps.weighted_pred_flag
        && matches!(slice_type, SliceType::P | SliceType::Sp))
        || (pps.weighted_bipred_idc == 1 && slice_type == SliceType::B);
    let pwt = if want_pwt {
        Some(parse_pred_weight_table(
            br,
            sps,
            slice_type,
            num_ref_idx_l0_active_minus1 + 1,
            num_ref_idx_l1_active_minus1 + 1,
        )?)
    } else {
        None
    };

    let dec_ref_pic_marking = parse_dec_ref_pic_marking(br, nal_ref_idc, is_idr)?;

    let mut cabac_init_idc = 0;
    if pps.entropy_coding_mode_flag && !slice_type.is_intra() {
        cabac_init_idc = br.read_exp_golomb_u()?;
        if cabac_init_idc > 2 {
            return Err(LiuxiError::InvalidData(format!(
                "H264: cabac_init_idc 非法, value={}",
                cabac_init_idc
            )));
        }
    }

    let slice_qp_delta = br.read_exp_golomb_s()?;
    let qp_low = -26 - 6 * sps.bit_depth_luma_minus8 as i32 - pps.pic_init_qp_minus26;
    let qp_high = 25 - pps.pic_init_qp_minus26;
    if !(qp_low..=qp_high).contains(&slice_qp_delta) {
        return Err(LiuxiError::InvalidData(format!(
            "H264: slice_qp_delta 超出范围, value={}",
            slice_qp_delta
        )));
    }

    let mut sp_for_switch_flag = false;
    let mut slice_qs_delta = 0;
    if matches!(slice_type, SliceType::Sp | SliceType::Si) {
        if slice_type == SliceType::Sp {
            sp_for_switch_flag = br.read_bit()? == 1;
        }
        slice_qs_delta = br.read_exp_golomb_s()?;
    }

    let mut disable_deblocking_filter_idc = 0;
    let mut slice_alpha_c0_offset_div2 = 0;
    let mut slice_beta_offset_div2 = 0;
    if pps.deblocking_filter_control_present_flag {
        disable_deblocking_filter_idc = br.read_exp_golomb_u()?;
        if disable_deblocking_filter_idc != 1 {
            slice_alpha_c0_offset_div2 = br.read_exp_golomb_s()?;
            slice_beta_offset_div2 = br.read_exp_golomb_s()?;
        }
    }

    let mut slice_group_change_cycle = 0;
    if pps.num_slice_groups_minus1 > 0
        && let SliceGroupMap::Changing {
            map_type,
            slice_group_change_rate_minus1,
            ..
        } = &pps.slice_group_map
        && (3..=5).contains(map_type)
    {
        let bits = 31 - (slice_group_change_rate_minus1 + 1).leading_zeros();
        slice_group_change_cycle = br.read_bits(bits)?;
    }

    Ok(SliceHeader {
        nal_ref_idc,
        nal_unit_type,
        first_mb_in_slice,
        slice_type_raw,
        slice_type,
        pic_parameter_set_id,
        colour_plane_id,
        frame_num,
        field_pic_flag,
        bottom_field_flag,
        idr_pic_id,
        pic_order_cnt_lsb,
        delta_pic_order_cnt_bottom,
        delta_pic_order_cnt,
        redundant_pic_cnt,
        direct_spatial_mv_pred_flag,
        num_ref_idx_l0_active_minus1,
        num_ref_idx_l1_active_minus1,
        rplm_l0,
        rplm_l1,
        pwt,
        dec_ref_pic_marking,
        cabac_init_idc,
        slice_qp_delta,
        sp_for_switch_flag,
        slice_qs_delta,
        disable_deblocking_filter_idc,
        slice_alpha_c0_offset_div2,
        slice_beta_offset_div2,
        slice_group_change_cycle,
    })
}
