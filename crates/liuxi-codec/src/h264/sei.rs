//! H.264 SEI (Supplemental Enhancement Information) 解析器.
//!
//! SEI 消息的 payload type 与 size 都以 0xFF 累加链编码.
//! 本解析器只截取载荷前缀用于诊断, 不解释各消息体.

use liuxi_core::{BitReader, LiuxiResult};

/// 诊断用载荷截取容量
pub const SEI_PAYLOAD_CAPTURE: usize = 16;

/// SEI 消息
#[derive(Debug, Clone, Default)]
pub struct Sei {
    pub payload_type: u32,
    pub payload_size: u32,
    /// 载荷前缀 (至多 [`SEI_PAYLOAD_CAPTURE`] 字节)
    pub payload_data: Vec<u8>,
}

impl Sei {
    /// payload type 的标准名称
    pub fn payload_type_name(&self) -> &'static str {
        sei_payload_type_name(self.payload_type)
    }
}

/// SEI payload type 名称 (标准 Annex D)
pub fn sei_payload_type_name(payload_type: u32) -> &'static str {
    match payload_type {
        0 => "buffering_period",
        1 => "pic_timing",
        2 => "pan_scan_rect",
        3 => "filler_payload",
        4 => "user_data_registered_itu_t_t35",
        5 => "user_data_unregistered",
        6 => "recovery_point",
        7 => "dec_ref_pic_marking_repetition",
        8 => "spare_pic",
        9 => "scene_info",
        10 => "sub_seq_info",
        11 => "sub_seq_layer_characteristics",
        12 => "sub_seq_characteristics",
        13 => "full_frame_freeze",
        14 => "full_frame_freeze_release",
        15 => "full_frame_snapshot",
        16 => "progressive_refinement_segment_start",
        17 => "progressive_refinement_segment_end",
        18 => "motion_constrained_slice_group_set",
        19 => "film_grain_characteristics",
        20 => "deblocking_filter_display_preference",
        21 => "stereo_video_info",
        22 => "post_filter_hint",
        23 => "tone_mapping_info",
        24 => "scalability_info",
        25 => "sub_pic_scalable_layer",
        26 => "non_required_layer_rep",
        27 => "priority_layer_info",
        28 => "layers_not_present",
        29 => "layer_dependency_change",
        30 => "scalable_nesting",
        31 => "base_layer_temporal_hrd",
        32 => "quality_layer_integrity_check",
        33 => "redundant_pic_property",
        34 => "tl0_dep_rep_index",
        35 => "tl_switching_point",
        36 => "parallel_decoding_info",
        37 => "mvc_scalable_nesting",
        38 => "view_scalability_info",
        39 => "multiview_scene_info",
        40 => "multiview_acquisition_info",
        41 => "non_required_view_component",
        42 => "view_dependency_change",
        43 => "operation_points_not_present",
        44 => "base_view_temporal_hrd",
        45 => "frame_packing_arrangement",
        _ => "reserved_sei_message",
    }
}

/// 从 RBSP 解析第一条 SEI 消息
pub fn parse_sei(br: &mut BitReader<'_>) -> LiuxiResult<Sei> {
    let mut payload_type = 0u32;
    loop {
        let b = br.read_u8()?;
        if b != 0xFF {
            payload_type += u32::from(b);
            break;
        }
        payload_type += 255;
    }

    let mut payload_size = 0u32;
    loop {
        let b = br.read_u8()?;
        if b != 0xFF {
            payload_size += u32::from(b);
            break;
        }
        payload_size += 255;
    }

    let capture = (payload_size as usize).min(SEI_PAYLOAD_CAPTURE);
    let mut payload_data = Vec::with_capacity(capture);
    for _ in 0..capture {
        payload_data.push(br.read_u8()?);
    }

    Ok(Sei {
        payload_type,
        payload_size,
        payload_data,
    })
}
