//! H.264 SPS (Sequence Parameter Set) 解析器.
//!
//! SPS 携带编码视频序列的全局参数: Profile/Level, 色度格式与位深,
//! 宏块尺寸, POC 机制, 帧/场布局, cropping 与可选的 VUI.
//! 字段按标准 7.3.2.1 的语法顺序读取, 所有标准限定范围的字段都做
//! 范围校验, 越界即返回错误, 不产生半成品结构.

use liuxi_core::{BitReader, LiuxiError, LiuxiResult};

use super::scaling::{
    SCALING_DEFAULT_4X4, SCALING_DEFAULT_8X8, ScalingMatrices, apply_fallback_rules,
    parse_scaling_matrices,
};

/// SPS 表容量 (seq_parameter_set_id ∈ 0..=31)
pub const MAX_SPS_COUNT: u32 = 32;

/// HRD (Hypothetical Reference Decoder) 参数
#[derive(Debug, Clone, Default)]
pub struct HrdParameters {
    pub cpb_cnt_minus1: u32,
    pub bit_rate_scale: u32,
    pub cpb_size_scale: u32,
    pub bit_rate_value_minus1: Vec<u32>,
    pub cpb_size_value_minus1: Vec<u32>,
    pub cbr_flag: Vec<bool>,
    pub initial_cpb_removal_delay_length_minus1: u32,
    pub cpb_removal_delay_length_minus1: u32,
    pub dpb_output_delay_length_minus1: u32,
    pub time_offset_length: u32,
}

/// VUI (Video Usability Information) 参数
#[derive(Debug, Clone, Default)]
pub struct VuiParameters {
    pub aspect_ratio_idc: u32,
    pub sar_width: u32,
    pub sar_height: u32,
    pub overscan_appropriate_flag: Option<bool>,
    pub video_format: u32,
    pub video_full_range_flag: bool,
    pub colour_primaries: u32,
    pub transfer_characteristics: u32,
    pub matrix_coefficients: u32,
    pub chroma_sample_loc_type_top_field: u32,
    pub chroma_sample_loc_type_bottom_field: u32,
    pub timing_info: Option<TimingInfo>,
    pub nal_hrd: Option<HrdParameters>,
    pub vcl_hrd: Option<HrdParameters>,
    pub low_delay_hrd_flag: bool,
    pub pic_struct_present_flag: bool,
    pub bitstream_restriction: Option<BitstreamRestriction>,
}

/// VUI 中的 timing_info
#[derive(Debug, Clone, Copy, Default)]
pub struct TimingInfo {
    pub num_units_in_tick: u32,
    pub time_scale: u32,
    pub fixed_frame_rate_flag: bool,
}

/// VUI 中的 bitstream_restriction
#[derive(Debug, Clone, Copy, Default)]
pub struct BitstreamRestriction {
    pub motion_vectors_over_pic_boundaries_flag: bool,
    pub max_bytes_per_pic_denom: u32,
    pub max_bits_per_mb_denom: u32,
    pub log2_max_mv_length_horizontal: u32,
    pub log2_max_mv_length_vertical: u32,
    pub max_num_reorder_frames: u32,
    pub max_dec_frame_buffering: u32,
}

/// aspect_ratio_idc = 255 表示显式 SAR
const SAR_EXTENDED: u32 = 255;

/// POC 机制 (pic_order_cnt_type 0/1/2)
#[derive(Debug, Clone)]
pub enum PocType {
    /// type 0: lsb 计数
    Type0 { log2_max_pic_order_cnt_lsb_minus4: u32 },
    /// type 1: 期望偏移
    Type1 {
        delta_pic_order_always_zero_flag: bool,
        offset_for_non_ref_pic: i32,
        offset_for_top_to_bottom_field: i32,
        offset_for_ref_frame: Vec<i32>,
    },
    /// type 2: 按解码顺序
    Type2,
}

/// SPS 解析结果
#[derive(Debug, Clone)]
pub struct Sps {
    pub profile_idc: u8,
    pub constraint_flags: u8,
    pub level_idc: u8,
    pub seq_parameter_set_id: u32,
    /// 色度格式 (0=单色, 1=4:2:0, 2=4:2:2, 3=4:4:4)
    pub chroma_format_idc: u32,
    pub separate_colour_plane_flag: bool,
    pub bit_depth_luma_minus8: u32,
    pub bit_depth_chroma_minus8: u32,
    pub qpprime_y_zero_transform_bypass_flag: bool,
    pub seq_scaling_matrix_present_flag: bool,
    pub sm: ScalingMatrices,
    pub log2_max_frame_num_minus4: u32,
    pub poc: PocType,
    pub max_num_ref_frames: u32,
    pub gaps_in_frame_num_value_allowed_flag: bool,
    pub pic_width_in_mbs_minus1: u32,
    pub pic_height_in_map_units_minus1: u32,
    pub frame_mbs_only_flag: bool,
    pub mb_adaptive_frame_field_flag: bool,
    pub direct_8x8_inference_flag: bool,
    pub frame_crop_left_offset: u32,
    pub frame_crop_right_offset: u32,
    pub frame_crop_top_offset: u32,
    pub frame_crop_bottom_offset: u32,
    pub vui: Option<VuiParameters>,
}

impl Sps {
    /// pic_order_cnt_type 编号
    pub fn pic_order_cnt_type(&self) -> u32 {
        match self.poc {
            PocType::Type0 { .. } => 0,
            PocType::Type1 { .. } => 1,
            PocType::Type2 => 2,
        }
    }

    /// ChromaArrayType (标准 7.4.2.1.1)
    pub fn chroma_array_type(&self) -> u32 {
        if self.chroma_format_idc == 3 && self.separate_colour_plane_flag {
            0
        } else {
            self.chroma_format_idc
        }
    }

    /// frame_num 的位宽
    pub fn frame_num_bits(&self) -> u32 {
        self.log2_max_frame_num_minus4 + 4
    }
}

/// High profile 家族携带色度/位深/缩放矩阵字段
fn is_high_profile(profile_idc: u8) -> bool {
    matches!(
        profile_idc,
        100 | 110 | 122 | 244 | 44 | 83 | 86 | 118 | 128 | 144
    )
}

/// 从 RBSP (不含 NAL 头字节) 解析 SPS
pub fn parse_sps(br: &mut BitReader<'_>) -> LiuxiResult<Sps> {
    let profile_idc = br.read_u8()?;
    let constraint_flags = br.read_u8()?;
    let level_idc = br.read_u8()?;

    let seq_parameter_set_id = br.read_exp_golomb_u()?;
    if seq_parameter_set_id >= MAX_SPS_COUNT {
        return Err(LiuxiError::InvalidData(format!(
            "H264: seq_parameter_set_id 超出范围, value={}",
            seq_parameter_set_id
        )));
    }

    let mut chroma_format_idc = 1u32;
    let mut separate_colour_plane_flag = false;
    let mut bit_depth_luma_minus8 = 0u32;
    let mut bit_depth_chroma_minus8 = 0u32;
    let mut qpprime_y_zero_transform_bypass_flag = false;
    let mut seq_scaling_matrix_present_flag = false;
    let mut sm = ScalingMatrices::default();

    if is_high_profile(profile_idc) {
        chroma_format_idc = br.read_exp_golomb_u()?;
        if chroma_format_idc > 3 {
            return Err(LiuxiError::InvalidData(format!(
                "H264: chroma_format_idc 非法, value={}",
                chroma_format_idc
            )));
        }
        if chroma_format_idc == 3 {
            separate_colour_plane_flag = br.read_bit()? == 1;
        }

        bit_depth_luma_minus8 = br.read_exp_golomb_u()?;
        if bit_depth_luma_minus8 > 6 {
            return Err(LiuxiError::InvalidData(format!(
                "H264: bit_depth_luma_minus8 超出范围, value={}",
                bit_depth_luma_minus8
            )));
        }
        bit_depth_chroma_minus8 = br.read_exp_golomb_u()?;
        if bit_depth_chroma_minus8 > 6 {
            return Err(LiuxiError::InvalidData(format!(
                "H264: bit_depth_chroma_minus8 超出范围, value={}",
                bit_depth_chroma_minus8
            )));
        }

        qpprime_y_zero_transform_bypass_flag = br.read_bit()? == 1;

        seq_scaling_matrix_present_flag = br.read_bit()? == 1;
        if seq_scaling_matrix_present_flag {
            parse_scaling_matrices(br, &mut sm, true, chroma_format_idc)?;
            apply_fallback_rules(
                &mut sm,
                &SCALING_DEFAULT_4X4[0],
                &SCALING_DEFAULT_4X4[1],
                &SCALING_DEFAULT_8X8[0],
                &SCALING_DEFAULT_8X8[1],
                true,
                chroma_format_idc,
            );
        }
    }

    let log2_max_frame_num_minus4 = br.read_exp_golomb_u()?;
    if log2_max_frame_num_minus4 > 12 {
        return Err(LiuxiError::InvalidData(format!(
            "H264: log2_max_frame_num_minus4 超出范围, value={}",
            log2_max_frame_num_minus4
        )));
    }

    let pic_order_cnt_type = br.read_exp_golomb_u()?;
    let poc = match pic_order_cnt_type {
        0 => {
            let log2_max_pic_order_cnt_lsb_minus4 = br.read_exp_golomb_u()?;
            if log2_max_pic_order_cnt_lsb_minus4 > 12 {
                return Err(LiuxiError::InvalidData(format!(
                    "H264: log2_max_pic_order_cnt_lsb_minus4 超出范围, value={}",
                    log2_max_pic_order_cnt_lsb_minus4
                )));
            }
            PocType::Type0 {
                log2_max_pic_order_cnt_lsb_minus4,
            }
        }
        1 => {
            let delta_pic_order_always_zero_flag = br.read_bit()? == 1;
            let offset_for_non_ref_pic = br.read_exp_golomb_s()?;
            let offset_for_top_to_bottom_field = br.read_exp_golomb_s()?;
            let num_ref_frames_in_pic_order_cnt_cycle = br.read_exp_golomb_u()?;
            if num_ref_frames_in_pic_order_cnt_cycle > 255 {
                return Err(LiuxiError::InvalidData(format!(
                    "H264: num_ref_frames_in_pic_order_cnt_cycle 超出范围, value={}",
                    num_ref_frames_in_pic_order_cnt_cycle
                )));
            }
            let mut offset_for_ref_frame = Vec::new();
            for _ in 0..num_ref_frames_in_pic_order_cnt_cycle {
                offset_for_ref_frame.push(br.read_exp_golomb_s()?);
            }
            PocType::Type1 {
                delta_pic_order_always_zero_flag,
                offset_for_non_ref_pic,
                offset_for_top_to_bottom_field,
                offset_for_ref_frame,
            }
        }
        2 => PocType::Type2,
        _ => {
            return Err(LiuxiError::InvalidData(format!(
                "H264: pic_order_cnt_type 非法, value={}",
                pic_order_cnt_type
            )));
        }
    };

    let max_num_ref_frames = br.read_exp_golomb_u()?;
    let gaps_in_frame_num_value_allowed_flag = br.read_bit()? == 1;
    let pic_width_in_mbs_minus1 = br.read_exp_golomb_u()?;
    let pic_height_in_map_units_minus1 = br.read_exp_golomb_u()?;

    let frame_mbs_only_flag = br.read_bit()? == 1;
    let mb_adaptive_frame_field_flag = if frame_mbs_only_flag {
        false
    } else {
        br.read_bit()? == 1
    };

    let direct_8x8_inference_flag = br.read_bit()? == 1;

    let mut frame_crop_left_offset = 0;
    let mut frame_crop_right_offset = 0;
    let mut frame_crop_top_offset = 0;
    let mut frame_crop_bottom_offset = 0;
    if br.read_bit()? == 1 {
        frame_crop_left_offset = br.read_exp_golomb_u()?;
        frame_crop_right_offset = br.read_exp_golomb_u()?;
        frame_crop_top_offset = br.read_exp_golomb_u()?;
        frame_crop_bottom_offset = br.read_exp_golomb_u()?;
    }

    let vui = if br.read_bit()? == 1 {
        Some(parse_vui_parameters(br)?)
    } else {
        None
    };

    Ok(Sps {
        profile_idc,
        constraint_flags,
        level_idc,
        seq_parameter_set_id,
        chroma_format_idc,
        separate_colour_plane_flag,
        bit_depth_luma_minus8,
        bit_depth_chroma_minus8,
        qpprime_y_zero_transform_bypass_flag,
        seq_scaling_matrix_present_flag,
        sm,
        log2_max_frame_num_minus4,
        poc,
        max_num_ref_frames,
        gaps_in_frame_num_value_allowed_flag,
        pic_width_in_mbs_minus1,
        pic_height_in_map_units_minus1,
        frame_mbs_only_flag,
        mb_adaptive_frame_field_flag,
        direct_8x8_inference_flag,
        frame_crop_left_offset,
        frame_crop_right_offset,
        frame_crop_top_offset,
        frame_crop_bottom_offset,
        vui,
    })
}

/// 解析 HRD 参数 (标准 Annex E.1.2)
fn parse_hrd_parameters(br: &mut BitReader<'_>) -> LiuxiResult<HrdParameters> {
    let cpb_cnt_minus1 = br.read_exp_golomb_u()?;
    if cpb_cnt_minus1 > 31 {
        return Err(LiuxiError::InvalidData(format!(
            "H264: cpb_cnt_minus1 超出范围, value={}",
            cpb_cnt_minus1
        )));
    }

    let bit_rate_scale = br.read_bits(4)?;
    let cpb_size_scale = br.read_bits(4)?;

    let mut hrd = HrdParameters {
        cpb_cnt_minus1,
        bit_rate_scale,
        cpb_size_scale,
        ..Default::default()
    };

    for _ in 0..=cpb_cnt_minus1 {
        hrd.bit_rate_value_minus1.push(br.read_exp_golomb_u()?);
        hrd.cpb_size_value_minus1.push(br.read_exp_golomb_u()?);
        hrd.cbr_flag.push(br.read_bit()? == 1);
    }

    hrd.initial_cpb_removal_delay_length_minus1 = br.read_bits(5)?;
    hrd.cpb_removal_delay_length_minus1 = br.read_bits(5)?;
    hrd.dpb_output_delay_length_minus1 = br.read_bits(5)?;
    hrd.time_offset_length = br.read_bits(5)?;

    Ok(hrd)
}

/// 解析 VUI 参数 (标准 Annex E.1.1)
fn parse_vui_parameters(br: &mut BitReader<'_>) -> LiuxiResult<VuiParameters> {
    let mut vui = VuiParameters::default();

    if br.read_bit()? == 1 {
        vui.aspect_ratio_idc = br.read_bits(8)?;
        if vui.aspect_ratio_idc == SAR_EXTENDED {
            vui.sar_width = br.read_bits(16)?;
            vui.sar_height = br.read_bits(16)?;
        }
    }

    if br.read_bit()? == 1 {
        vui.overscan_appropriate_flag = Some(br.read_bit()? == 1);
    }

    if br.read_bit()? == 1 {
        vui.video_format = br.read_bits(3)?;
        vui.video_full_range_flag = br.read_bit()? == 1;
        if br.read_bit()? == 1 {
            vui.colour_primaries = br.read_bits(8)?;
            vui.transfer_characteristics = br.read_bits(8)?;
            vui.matrix_coefficients = br.read_bits(8)?;
        }
    }

    if br.read_bit()? == 1 {
        vui.chroma_sample_loc_type_top_field = br.read_exp_golomb_u()?;
        vui.chroma_sample_loc_type_bottom_field = br.read_exp_golomb_u()?;
    }

    if br.read_bit()? == 1 {
        vui.timing_info = Some(TimingInfo {
            num_units_in_tick: br.read_bits(32)?,
            time_scale: br.read_bits(32)?,
            fixed_frame_rate_flag: br.read_bit()? == 1,
        });
    }

    let nal_hrd_present = br.read_bit()? == 1;
    if nal_hrd_present {
        vui.nal_hrd = Some(parse_hrd_parameters(br)?);
    }
    let vcl_hrd_present = br.read_bit()? == 1;
    if vcl_hrd_present {
        vui.vcl_hrd = Some(parse_hrd_parameters(br)?);
    }
    if nal_hrd_present || vcl_hrd_present {
        vui.low_delay_hrd_flag = br.read_bit()? == 1;
    }

    vui.pic_struct_present_flag = br.read_bit()? == 1;

    if br.read_bit()? == 1 {
        vui.bitstream_restriction = Some(BitstreamRestriction {
            motion_vectors_over_pic_boundaries_flag: br.read_bit()? == 1,
            max_bytes_per_pic_denom: br.read_exp_golomb_u()?,
            max_bits_per_mb_denom: br.read_exp_golomb_u()?,
            log2_max_mv_length_horizontal: br.read_exp_golomb_u()?,
            log2_max_mv_length_vertical: br.read_exp_golomb_u()?,
            max_num_reorder_frames: br.read_exp_golomb_u()?,
            max_dec_frame_buffering: br.read_exp_golomb_u()?,
        });
    }

    Ok(vui)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Baseline profile 176x144 的最小 SPS RBSP (不含 NAL 头)
    // profile=66, constraint=0xC0, level=13, sps_id=0, log2_max_frame_num_minus4=0,
    // poc_type=0/lsb_minus4=0, ref_frames=1, 宽 11 宏块, 高 9 宏块,
    // frame_mbs_only=1, direct_8x8=1, 无 cropping, 无 VUI
    const SPS_QCIF: &[u8] = &[0x42, 0xC0, 0x0D, 0xF4, 0x16, 0x27, 0x20];

    fn build_qcif_sps() -> Vec<u8> {
        // 手工编码:
        //   ue(0) sps_id        = 1
        //   ue(0) log2_mfn      = 1
        //   ue(0) poc_type      = 1
        //   ue(0) log2_poc_lsb  = 1
        //   ue(1) ref_frames    = 010
        //   0     gaps          = 0
        //   ue(10) width_mbs-1  = 0001011
        //   ue(8) height_mu-1   = 0001001
        //   1     frame_mbs_only
        //   1     direct_8x8
        //   0     cropping
        //   0     vui
        let mut bits = String::new();
        bits.push_str("1 1 1 1 010 0 0001011 0001001 1 1 0 0");
        let mut data = vec![66u8, 0xC0, 13];
        data.extend(pack_bits(&bits));
        data
    }

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
            // 尾部补 rbsp 停止位形态
            out.push((acc << (8 - n)) | (1 << (7 - n)));
        }
        out
    }

    #[test]
    fn test_parse_minimal_sps() {
        let data = build_qcif_sps();
        let mut br = BitReader::new(&data);
        let sps = parse_sps(&mut br).unwrap();
        assert_eq!(sps.profile_idc, 66);
        assert_eq!(sps.level_idc, 13);
        assert_eq!(sps.seq_parameter_set_id, 0);
        assert_eq!(sps.chroma_format_idc, 1, "Baseline 隐含 4:2:0");
        assert_eq!(sps.pic_width_in_mbs_minus1, 10);
        assert_eq!(sps.pic_height_in_map_units_minus1, 8);
        assert!(sps.frame_mbs_only_flag);
        assert_eq!(sps.pic_order_cnt_type(), 0);
        assert!(sps.vui.is_none());
    }

    #[test]
    fn test_sps_id_out_of_range() {
        // sps_id = 32: ue = 000001 00001
        let mut data = vec![66u8, 0xC0, 13];
        data.extend(pack_bits("00000100001"));
        let mut br = BitReader::new(&data);
        assert!(parse_sps(&mut br).is_err());
    }

    #[test]
    fn test_sps_truncated_is_error() {
        let data = build_qcif_sps();
        let mut br = BitReader::new(&data[..4]);
        assert!(parse_sps(&mut br).is_err());
    }

    #[test]
    fn test_fixed_qcif_bytes() {
        // 预先打包好的等价字节串
        let mut br = BitReader::new(SPS_QCIF);
        let sps = parse_sps(&mut br).unwrap();
        assert_eq!(sps.pic_width_in_mbs_minus1, 10);
        assert_eq!(sps.pic_height_in_map_units_minus1, 8);
    }

    #[test]
    fn test_chroma_array_type() {
        let data = build_qcif_sps();
        let mut br = BitReader::new(&data);
        let mut sps = parse_sps(&mut br).unwrap();
        assert_eq!(sps.chroma_array_type(), 1);
        sps.chroma_format_idc = 3;
        sps.separate_colour_plane_flag = true;
        assert_eq!(sps.chroma_array_type(), 0);
    }
}
